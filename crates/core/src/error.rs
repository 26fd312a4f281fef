//! Error types for transaction demarcation
//!
//! `TransactionError` covers everything the registry, the synchronization
//! manager, the transaction manager and the interceptor can report.
//! `ResourceError` is what external resources and their factories report;
//! it converts into `TransactionError::Resource`.

use std::error::Error as StdError;
use thiserror::Error;

/// Result type alias for transaction operations
pub type TxResult<T> = std::result::Result<T, TransactionError>;

/// Result type alias for resource-level operations
pub type ResourceResult<T> = std::result::Result<T, ResourceError>;

/// Boxed underlying cause carried by system-level errors
pub type BoxedCause = Box<dyn StdError + Send + Sync + 'static>;

/// Error types for transaction management
#[derive(Debug, Error)]
pub enum TransactionError {
    /// Propagation or isolation conflict with the transaction state of the
    /// current thread (MANDATORY without a transaction, NEVER with one, ...)
    #[error("Illegal transaction state: {0}")]
    IllegalTransactionState(String),

    /// Misuse of thread-bound state: binding a key twice, unbinding a key
    /// that is not bound, registering a callback while inactive
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Commit was requested but the transaction had been marked rollback-only,
    /// so a rollback was performed instead
    #[error("Unexpected rollback: {0}")]
    UnexpectedRollback(String),

    /// Resource-level commit, rollback or status call failed
    #[error("Transaction system error: {message}")]
    TransactionSystem {
        /// What the manager was doing
        message: String,
        /// Underlying failure
        #[source]
        source: Option<BoxedCause>,
    },

    /// The deadline attached to the transaction has passed
    #[error("Transaction timed out: deadline reached {overdue_ms} ms ago")]
    TransactionTimedOut {
        /// How far past the deadline the check happened
        overdue_ms: u64,
    },

    /// NESTED propagation requested but not permitted by the manager
    #[error("Nested transaction not supported: {0}")]
    NestedTransactionNotSupported(String),

    /// The backend cannot honour the requested isolation level
    #[error("Invalid isolation level: {0}")]
    InvalidIsolationLevel(String),

    /// Beginning a new transaction failed
    #[error("Could not create transaction: {message}")]
    CannotCreateTransaction {
        /// What the manager was doing
        message: String,
        /// Underlying failure
        #[source]
        source: Option<BoxedCause>,
    },

    /// Error reported by an external resource outside of commit/rollback
    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    /// Invalid configuration or attribute string
    #[error("Configuration error: {0}")]
    Config(String),
}

impl TransactionError {
    /// Create an `IllegalTransactionState` error
    pub fn illegal_transaction_state(message: impl Into<String>) -> Self {
        TransactionError::IllegalTransactionState(message.into())
    }

    /// Create an `IllegalState` error
    pub fn illegal_state(message: impl Into<String>) -> Self {
        TransactionError::IllegalState(message.into())
    }

    /// Create an `UnexpectedRollback` error
    pub fn unexpected_rollback(message: impl Into<String>) -> Self {
        TransactionError::UnexpectedRollback(message.into())
    }

    /// Create a `TransactionSystem` error wrapping an underlying cause
    pub fn system(message: impl Into<String>, cause: impl Into<BoxedCause>) -> Self {
        TransactionError::TransactionSystem {
            message: message.into(),
            source: Some(cause.into()),
        }
    }

    /// Create a `TransactionSystem` error without a cause
    pub fn system_message(message: impl Into<String>) -> Self {
        TransactionError::TransactionSystem {
            message: message.into(),
            source: None,
        }
    }

    /// Create a `CannotCreateTransaction` error wrapping an underlying cause
    pub fn cannot_create(message: impl Into<String>, cause: impl Into<BoxedCause>) -> Self {
        TransactionError::CannotCreateTransaction {
            message: message.into(),
            source: Some(cause.into()),
        }
    }

    /// Create a `Config` error
    pub fn config(message: impl Into<String>) -> Self {
        TransactionError::Config(message.into())
    }

    /// Whether this is a classification/state error that is surfaced
    /// immediately and never retried
    pub fn is_state_error(&self) -> bool {
        matches!(
            self,
            TransactionError::IllegalTransactionState(_)
                | TransactionError::IllegalState(_)
                | TransactionError::NestedTransactionNotSupported(_)
                | TransactionError::InvalidIsolationLevel(_)
        )
    }

    /// Whether this error reports that work was rolled back instead of committed
    pub fn is_unexpected_rollback(&self) -> bool {
        matches!(self, TransactionError::UnexpectedRollback(_))
    }
}

/// Errors reported by external resources and resource factories
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResourceError {
    /// Operation on a resource that has already been closed
    #[error("Illegal operation: resource is closed")]
    Closed,

    /// The resource does not implement this operation
    #[error("Operation not supported by resource: {0}")]
    Unsupported(String),

    /// Any other resource-level failure
    #[error("{0}")]
    Failure(String),
}

impl ResourceError {
    /// Create a `Failure` error
    pub fn failure(message: impl Into<String>) -> Self {
        ResourceError::Failure(message.into())
    }

    /// Create an `Unsupported` error
    pub fn unsupported(operation: impl Into<String>) -> Self {
        ResourceError::Unsupported(operation.into())
    }
}
