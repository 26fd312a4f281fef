//! Demarcation-only view of a coordinator for application code

use super::{CoordinatorResult, CoordinatorStatus, TransactionCoordinator};
use std::fmt;
use std::sync::Arc;

/// Programmatic begin/commit/rollback without suspend or resume
pub trait UserTransaction {
    /// Begin a transaction on the calling thread
    fn begin(&self) -> CoordinatorResult<()>;

    /// Commit the calling thread's transaction
    fn commit(&self) -> CoordinatorResult<()>;

    /// Roll back the calling thread's transaction
    fn rollback(&self) -> CoordinatorResult<()>;

    /// Doom the calling thread's transaction
    fn set_rollback_only(&self) -> CoordinatorResult<()>;

    /// Status of the calling thread's transaction
    fn status(&self) -> CoordinatorResult<CoordinatorStatus>;

    /// Deadline for transactions begun afterwards
    fn set_transaction_timeout(&self, secs: u32) -> CoordinatorResult<()>;
}

/// [`UserTransaction`] that delegates to a [`TransactionCoordinator`]
pub struct UserTransactionAdapter<C: TransactionCoordinator> {
    coordinator: Arc<C>,
}

impl<C: TransactionCoordinator> UserTransactionAdapter<C> {
    /// Wrap a coordinator
    pub fn new(coordinator: Arc<C>) -> Self {
        Self { coordinator }
    }

    /// The wrapped coordinator
    pub fn coordinator(&self) -> &Arc<C> {
        &self.coordinator
    }
}

impl<C: TransactionCoordinator> UserTransaction for UserTransactionAdapter<C> {
    fn begin(&self) -> CoordinatorResult<()> {
        self.coordinator.begin()
    }

    fn commit(&self) -> CoordinatorResult<()> {
        self.coordinator.commit()
    }

    fn rollback(&self) -> CoordinatorResult<()> {
        self.coordinator.rollback()
    }

    fn set_rollback_only(&self) -> CoordinatorResult<()> {
        self.coordinator.set_rollback_only()
    }

    fn status(&self) -> CoordinatorResult<CoordinatorStatus> {
        self.coordinator.status()
    }

    fn set_transaction_timeout(&self, secs: u32) -> CoordinatorResult<()> {
        self.coordinator.set_transaction_timeout(secs)
    }
}

impl<C: TransactionCoordinator> Clone for UserTransactionAdapter<C> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
        }
    }
}

impl<C: TransactionCoordinator> fmt::Debug for UserTransactionAdapter<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserTransactionAdapter").finish_non_exhaustive()
    }
}
