//! Live state of one in-flight unit of work
//!
//! A [`TransactionStatus`] is returned by `get_transaction` and consumed by
//! exactly one of `commit` or `rollback`. Because completion takes the
//! status by value, a unit of work cannot be completed twice.

use crate::backend::{TransactionBackend, TransactionObject};
use demarc_concurrency::SuspendedContext;
use demarc_core::{Savepoint, TxResult};
use std::fmt;

/// Read/write view of a status used by callers that do not know the backend
pub trait TransactionExecution {
    /// Whether an actual transaction backs this scope (new or joined)
    fn has_transaction(&self) -> bool;

    /// Whether this scope began the transaction it runs in
    fn is_new_transaction(&self) -> bool;

    /// Whether this scope activated completion callbacks
    fn is_new_synchronization(&self) -> bool;

    /// Whether this scope runs inside a savepoint of an outer transaction
    fn has_savepoint(&self) -> bool;

    /// Whether this scope suspended an outer scope it must resume
    fn has_suspended_resources(&self) -> bool;

    /// Whether the scope was declared read-only
    fn is_read_only(&self) -> bool;

    /// Name of the scope
    fn name(&self) -> Option<&str>;

    /// Doom the scope; sticky until completion
    fn set_rollback_only(&mut self);

    /// Whether `set_rollback_only` was called on this status
    fn is_local_rollback_only(&self) -> bool;

    /// Whether completing this status does more than drop it
    fn has_completion_duties(&self) -> bool {
        self.is_new_transaction()
            || self.is_new_synchronization()
            || self.has_savepoint()
            || self.has_suspended_resources()
    }
}

/// Outer scope captured while a nested scope runs
pub struct SuspendedResources<S> {
    pub(crate) suspended: Option<S>,
    pub(crate) context: SuspendedContext,
}

impl<S> SuspendedResources<S> {
    /// Whether the backend captured a transaction of its own
    pub fn has_suspended_transaction(&self) -> bool {
        self.suspended.is_some()
    }

    /// The captured thread state
    pub fn context(&self) -> &SuspendedContext {
        &self.context
    }
}

impl<S> fmt::Debug for SuspendedResources<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuspendedResources")
            .field("suspended_transaction", &self.suspended.is_some())
            .field("context", &self.context)
            .finish()
    }
}

/// Status of one unit of work driven by a [`TransactionManager`](crate::TransactionManager)
#[must_use = "a transaction status must be committed or rolled back"]
pub struct TransactionStatus<B: TransactionBackend> {
    pub(crate) transaction: Option<B::Transaction>,
    pub(crate) new_transaction: bool,
    pub(crate) new_synchronization: bool,
    pub(crate) read_only: bool,
    pub(crate) local_rollback_only: bool,
    pub(crate) savepoint: Option<Savepoint>,
    pub(crate) suspended: Option<SuspendedResources<B::Suspended>>,
    pub(crate) name: Option<String>,
}

impl<B: TransactionBackend> TransactionStatus<B> {
    pub(crate) fn new(
        transaction: Option<B::Transaction>,
        new_transaction: bool,
        new_synchronization: bool,
        read_only: bool,
        name: Option<String>,
        suspended: Option<SuspendedResources<B::Suspended>>,
    ) -> Self {
        Self {
            transaction,
            new_transaction,
            new_synchronization,
            read_only,
            local_rollback_only: false,
            savepoint: None,
            suspended,
            name,
        }
    }

    /// The backend's transaction object, if any
    pub fn transaction(&self) -> Option<&B::Transaction> {
        self.transaction.as_ref()
    }

    /// The savepoint this scope runs in, if any
    pub fn savepoint(&self) -> Option<&Savepoint> {
        self.savepoint.as_ref()
    }

    /// The outer scope this status will resume, if any
    pub fn suspended_resources(&self) -> Option<&SuspendedResources<B::Suspended>> {
        self.suspended.as_ref()
    }

    /// Whether the backing transaction was doomed by any participant
    pub fn is_global_rollback_only(&self) -> TxResult<bool> {
        match &self.transaction {
            Some(transaction) => transaction.is_rollback_only(),
            None => Ok(false),
        }
    }

    /// Local or global rollback-only
    pub fn is_rollback_only(&self) -> TxResult<bool> {
        if self.local_rollback_only {
            return Ok(true);
        }
        self.is_global_rollback_only()
    }
}

impl<B: TransactionBackend> TransactionExecution for TransactionStatus<B> {
    fn has_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    fn is_new_transaction(&self) -> bool {
        self.transaction.is_some() && self.new_transaction
    }

    fn is_new_synchronization(&self) -> bool {
        self.new_synchronization
    }

    fn has_savepoint(&self) -> bool {
        self.savepoint.is_some()
    }

    fn has_suspended_resources(&self) -> bool {
        self.suspended.is_some()
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn set_rollback_only(&mut self) {
        self.local_rollback_only = true;
    }

    fn is_local_rollback_only(&self) -> bool {
        self.local_rollback_only
    }
}

impl<B: TransactionBackend> fmt::Debug for TransactionStatus<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionStatus")
            .field("name", &self.name)
            .field("transaction", &self.transaction)
            .field("new_transaction", &self.new_transaction)
            .field("new_synchronization", &self.new_synchronization)
            .field("read_only", &self.read_only)
            .field("local_rollback_only", &self.local_rollback_only)
            .field("savepoint", &self.savepoint)
            .field("suspended", &self.suspended)
            .finish()
    }
}
