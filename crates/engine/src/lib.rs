//! Transaction engine for demarc
//!
//! This crate turns thread-bound state into declarative transactions:
//! - TransactionManager: propagation table over a pluggable TransactionBackend
//! - TransactionStatus: live state of one unit of work, consumed on completion
//! - TransactionInterceptor: around-wrapper with rollback classification
//! - Attribute sources: which definition applies to which operation
//! - ManagerConfig: `demarc.toml` settings
//! - Coordinator backend: delegation to an external transaction coordinator
//!
//! The engine never touches a concrete resource; see `demarc-datasource`
//! for the resource-backed backend.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod attributes;
pub mod backend;
pub mod config;
pub mod coordinator;
pub mod interceptor;
pub mod manager;
pub mod metrics;
pub mod status;

pub use attributes::{operation_key, MapAttributeSource, TransactionAttributeSource};
pub use backend::{TransactionBackend, TransactionObject};
pub use config::{ManagerConfig, SynchronizationMode, CONFIG_FILE_NAME};
pub use coordinator::{
    CoordinatorError, CoordinatorResult, CoordinatorStatus, CoordinatorTransactionBackend,
    CoordinatorTransactionObject, TransactionCoordinator, UserTransaction, UserTransactionAdapter,
};
pub use interceptor::TransactionInterceptor;
pub use manager::{PlatformTransactionManager, TransactionManager};
pub use metrics::{TransactionCounters, TransactionMetrics};
pub use status::{SuspendedResources, TransactionExecution, TransactionStatus};
