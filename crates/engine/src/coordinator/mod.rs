//! Backend for an external transaction coordinator
//!
//! A [`TransactionCoordinator`] owns the actual transactions (typically a
//! distributed one) and associates them with the calling thread itself.
//! [`CoordinatorTransactionBackend`] only translates the manager's
//! primitives into coordinator calls and coordinator failures into
//! [`TransactionError`]s.

mod adapter;

pub use adapter::{UserTransaction, UserTransactionAdapter};

use crate::backend::{TransactionBackend, TransactionObject};
use demarc_core::{TransactionDefinition, TransactionError, TxResult};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Status of the coordinator transaction associated with the calling thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoordinatorStatus {
    /// Active and not doomed
    Active,
    /// Active but doomed to roll back
    MarkedRollback,
    /// Prepare phase finished
    Prepared,
    /// Committed
    Committed,
    /// Rolled back
    RolledBack,
    /// Status cannot be determined
    Unknown,
    /// No transaction associated with the thread
    NoTransaction,
    /// Prepare phase in progress
    Preparing,
    /// Commit in progress
    Committing,
    /// Rollback in progress
    RollingBack,
}

/// Failures reported by a coordinator
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoordinatorError {
    /// Commit was answered with a rollback
    #[error("transaction was rolled back instead of committed")]
    RolledBack,
    /// Participants reached inconsistent outcomes
    #[error("heuristic outcome: {0}")]
    Heuristic(String),
    /// No transaction is associated with the calling thread
    #[error("no transaction associated with the current thread")]
    NoTransaction,
    /// A transaction is already associated with the calling thread
    #[error("a transaction is already associated with the current thread")]
    AlreadyActive,
    /// Any other coordinator failure
    #[error("coordinator failure: {0}")]
    System(String),
}

/// Result type for coordinator calls
pub type CoordinatorResult<T> = std::result::Result<T, CoordinatorError>;

/// External coordinator that owns thread-associated transactions
pub trait TransactionCoordinator: Send + Sync {
    /// Token for a transaction detached from its thread
    type Handle;

    /// Begin a transaction and associate it with the calling thread
    fn begin(&self) -> CoordinatorResult<()>;

    /// Commit the calling thread's transaction
    fn commit(&self) -> CoordinatorResult<()>;

    /// Roll back the calling thread's transaction
    fn rollback(&self) -> CoordinatorResult<()>;

    /// Status of the calling thread's transaction
    fn status(&self) -> CoordinatorResult<CoordinatorStatus>;

    /// Doom the calling thread's transaction
    fn set_rollback_only(&self) -> CoordinatorResult<()>;

    /// Deadline for transactions begun afterwards on this thread
    fn set_transaction_timeout(&self, secs: u32) -> CoordinatorResult<()>;

    /// Detach the calling thread's transaction
    fn suspend(&self) -> CoordinatorResult<Self::Handle>;

    /// Re-attach a detached transaction to the calling thread
    fn resume(&self, handle: Self::Handle) -> CoordinatorResult<()>;
}

/// Transaction object for the coordinator backend
pub struct CoordinatorTransactionObject<C: TransactionCoordinator> {
    coordinator: Arc<C>,
}

impl<C: TransactionCoordinator> CoordinatorTransactionObject<C> {
    /// Current coordinator status
    pub fn status(&self) -> TxResult<CoordinatorStatus> {
        self.coordinator
            .status()
            .map_err(|e| TransactionError::system("Coordinator failure on status", e))
    }
}

impl<C: TransactionCoordinator> TransactionObject for CoordinatorTransactionObject<C> {
    fn is_rollback_only(&self) -> TxResult<bool> {
        Ok(self.status()? == CoordinatorStatus::MarkedRollback)
    }
}

impl<C: TransactionCoordinator> fmt::Debug for CoordinatorTransactionObject<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinatorTransactionObject").finish_non_exhaustive()
    }
}

/// Backend delegating to a [`TransactionCoordinator`]
pub struct CoordinatorTransactionBackend<C: TransactionCoordinator> {
    coordinator: Arc<C>,
}

impl<C: TransactionCoordinator> CoordinatorTransactionBackend<C> {
    /// Create a backend for a coordinator
    pub fn new(coordinator: Arc<C>) -> Self {
        Self { coordinator }
    }

    /// The coordinator
    pub fn coordinator(&self) -> &Arc<C> {
        &self.coordinator
    }

    /// Demarcation-only view for application code
    pub fn user_transaction(&self) -> UserTransactionAdapter<C> {
        UserTransactionAdapter::new(self.coordinator.clone())
    }
}

impl<C: TransactionCoordinator> TransactionBackend for CoordinatorTransactionBackend<C> {
    type Transaction = CoordinatorTransactionObject<C>;
    type Suspended = C::Handle;

    fn name(&self) -> &str {
        "coordinator"
    }

    fn do_get_transaction(&self) -> TxResult<Self::Transaction> {
        Ok(CoordinatorTransactionObject {
            coordinator: self.coordinator.clone(),
        })
    }

    fn is_existing_transaction(&self, transaction: &Self::Transaction) -> TxResult<bool> {
        Ok(transaction.status()? != CoordinatorStatus::NoTransaction)
    }

    fn do_begin(
        &self,
        _transaction: &mut Self::Transaction,
        definition: &TransactionDefinition,
        timeout_secs: Option<u32>,
    ) -> TxResult<()> {
        if definition.isolation().is_specific() {
            return Err(TransactionError::InvalidIsolationLevel(format!(
                "Coordinator backend does not support custom isolation levels: {}",
                definition.isolation()
            )));
        }
        if let Some(secs) = timeout_secs {
            self.coordinator
                .set_transaction_timeout(secs)
                .map_err(|e| TransactionError::cannot_create("Could not set coordinator timeout", e))?;
        }
        self.coordinator.begin().map_err(|e| match e {
            CoordinatorError::AlreadyActive => TransactionError::NestedTransactionNotSupported(
                "Coordinator does not support nested transactions".to_string(),
            ),
            other => TransactionError::cannot_create("Coordinator failure on begin", other),
        })?;
        debug!(target: "demarc::txn", "Began coordinator transaction");
        Ok(())
    }

    fn do_commit(&self, _transaction: &mut Self::Transaction) -> TxResult<()> {
        self.coordinator.commit().map_err(|e| match e {
            CoordinatorError::RolledBack => TransactionError::unexpected_rollback(
                "Coordinator transaction unexpectedly rolled back (maybe due to a timeout)",
            ),
            CoordinatorError::NoTransaction => TransactionError::illegal_transaction_state(
                "No coordinator transaction to commit",
            ),
            other => TransactionError::system("Coordinator failure on commit", other),
        })
    }

    fn do_rollback(&self, transaction: &mut Self::Transaction) -> TxResult<()> {
        if transaction.status()? == CoordinatorStatus::NoTransaction {
            return Err(TransactionError::illegal_transaction_state(
                "No coordinator transaction to roll back",
            ));
        }
        self.coordinator
            .rollback()
            .map_err(|e| TransactionError::system("Coordinator failure on rollback", e))
    }

    fn do_set_rollback_only(&self, transaction: &mut Self::Transaction) -> TxResult<()> {
        debug!(target: "demarc::txn", "Setting coordinator transaction rollback-only");
        if transaction.status()? == CoordinatorStatus::NoTransaction {
            return Ok(());
        }
        self.coordinator
            .set_rollback_only()
            .map_err(|e| TransactionError::system("Coordinator failure on set_rollback_only", e))
    }

    fn do_suspend(&self, _transaction: &mut Self::Transaction) -> TxResult<Self::Suspended> {
        self.coordinator
            .suspend()
            .map_err(|e| TransactionError::system("Coordinator failure on suspend", e))
    }

    fn do_resume(&self, suspended: Self::Suspended) -> TxResult<()> {
        self.coordinator
            .resume(suspended)
            .map_err(|e| TransactionError::system("Coordinator failure on resume", e))
    }

    fn use_savepoint_for_nested(&self) -> bool {
        false
    }
}

impl<C: TransactionCoordinator> fmt::Debug for CoordinatorTransactionBackend<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinatorTransactionBackend").finish_non_exhaustive()
    }
}
