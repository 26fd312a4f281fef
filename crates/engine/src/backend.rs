//! Resource-specific transaction primitives
//!
//! [`TransactionBackend`] is the seam between the generic propagation logic
//! in [`TransactionManager`](crate::TransactionManager) and one concrete
//! kind of transactional resource. The manager decides *whether* to begin,
//! join, suspend or complete; the backend knows *how*.
//!
//! # Lifecycle
//!
//! ```text
//! do_get_transaction ──> is_existing_transaction?
//!      │ no                          │ yes
//!      ▼                             ▼
//!   do_begin               join / do_suspend + do_begin / create_savepoint
//!      │                             │
//!      ▼                             ▼
//!   do_commit | do_rollback | do_set_rollback_only | rollback_to_savepoint
//!      │
//!      ▼
//!   do_cleanup_after_completion ──> do_resume (if something was suspended)
//! ```

use demarc_core::{Savepoint, TransactionDefinition, TransactionError, TxResult};
use std::fmt;

/// Transaction object that can report a doom set from outside the status
pub trait TransactionObject: fmt::Debug {
    /// Whether the underlying transaction has been marked rollback-only
    fn is_rollback_only(&self) -> TxResult<bool>;
}

/// Begin/commit/rollback/suspend/resume against one resource kind
pub trait TransactionBackend {
    /// Per-scope transaction object
    type Transaction: TransactionObject;

    /// Whatever `do_suspend` takes off the thread
    type Suspended;

    /// Short name for logs
    fn name(&self) -> &str;

    /// Transaction object reflecting the thread's current state
    fn do_get_transaction(&self) -> TxResult<Self::Transaction>;

    /// Whether the object represents a transaction that is already active
    fn is_existing_transaction(&self, transaction: &Self::Transaction) -> TxResult<bool>;

    /// Begin a new transaction
    ///
    /// `timeout_secs` is the effective deadline, already defaulted by the
    /// manager's configuration.
    fn do_begin(
        &self,
        transaction: &mut Self::Transaction,
        definition: &TransactionDefinition,
        timeout_secs: Option<u32>,
    ) -> TxResult<()>;

    /// Commit a transaction begun by `do_begin`
    fn do_commit(&self, transaction: &mut Self::Transaction) -> TxResult<()>;

    /// Roll back a transaction begun by `do_begin`
    fn do_rollback(&self, transaction: &mut Self::Transaction) -> TxResult<()>;

    /// Mark an existing transaction rollback-only on behalf of a participant
    fn do_set_rollback_only(&self, _transaction: &mut Self::Transaction) -> TxResult<()> {
        Err(TransactionError::illegal_transaction_state(format!(
            "Participating in existing transactions is not supported by {} - \
             rollback-only marking is unavailable",
            self.name()
        )))
    }

    /// Take the transaction's thread-bound state off the thread
    fn do_suspend(&self, _transaction: &mut Self::Transaction) -> TxResult<Self::Suspended> {
        Err(TransactionError::illegal_transaction_state(format!(
            "Transaction suspension is not supported by {}",
            self.name()
        )))
    }

    /// Put state captured by `do_suspend` back on the thread
    fn do_resume(&self, _suspended: Self::Suspended) -> TxResult<()> {
        Err(TransactionError::illegal_transaction_state(format!(
            "Transaction resumption is not supported by {}",
            self.name()
        )))
    }

    /// Whether NESTED should be realised with savepoints on the existing transaction
    fn use_savepoint_for_nested(&self) -> bool {
        true
    }

    /// Whether the transaction's resource can create savepoints
    fn supports_savepoints(&self, _transaction: &Self::Transaction) -> bool {
        false
    }

    /// Create a savepoint in the existing transaction
    fn create_savepoint(&self, _transaction: &mut Self::Transaction) -> TxResult<Savepoint> {
        Err(TransactionError::NestedTransactionNotSupported(format!(
            "{} does not support savepoints",
            self.name()
        )))
    }

    /// Roll back to a savepoint, keeping the transaction open
    fn rollback_to_savepoint(&self, _transaction: &mut Self::Transaction, _savepoint: &Savepoint) -> TxResult<()> {
        Err(TransactionError::NestedTransactionNotSupported(format!(
            "{} does not support savepoints",
            self.name()
        )))
    }

    /// Release a savepoint that is no longer needed
    fn release_savepoint(&self, _transaction: &mut Self::Transaction, _savepoint: &Savepoint) -> TxResult<()> {
        Err(TransactionError::NestedTransactionNotSupported(format!(
            "{} does not support savepoints",
            self.name()
        )))
    }

    /// Release resources held by a completed new transaction
    fn do_cleanup_after_completion(&self, _transaction: &mut Self::Transaction) -> TxResult<()> {
        Ok(())
    }
}
