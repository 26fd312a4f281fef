//! demarc - declarative transaction demarcation for Rust
//!
//! demarc wraps units of work with begin/commit/rollback semantics while the
//! work itself only ever asks for "the current resource". Resources and
//! completion callbacks are bound to the calling thread, transactions
//! propagate through nested calls according to each operation's
//! [`TransactionDefinition`], and resources can be acquired lazily.
//!
//! # Quick Start
//!
//! ```ignore
//! use demarc::{
//!     MapAttributeSource, Propagation, ResourceTransactionBackend, ResourceUtils,
//!     TransactionDefinition, TransactionInterceptor, TransactionManager,
//! };
//!
//! let manager = TransactionManager::new(ResourceTransactionBackend::new(factory.clone()));
//! let source = MapAttributeSource::new()
//!     .with("Orders::place", TransactionDefinition::with(Propagation::Required));
//! let interceptor = TransactionInterceptor::new(manager, source);
//!
//! interceptor.invoke("Orders", "place", |_status| {
//!     let resource = ResourceUtils::get_resource(factory.as_ref())?;
//!     resource.borrow_mut().execute("insert into orders ...")?;
//!     ResourceUtils::release_resource(Some(&resource), factory.as_ref());
//!     Ok::<_, AppError>(())
//! })?;
//! ```
//!
//! # Architecture
//!
//! - `demarc-core`: definitions, errors and the external resource traits
//! - `demarc-concurrency`: thread-bound registry and synchronization
//! - `demarc-engine`: propagation, completion, interception, configuration
//! - `demarc-datasource`: resource-backed transactions and lazy handles

pub use demarc_concurrency::{
    ResourceHolder, ResourceRegistry, SharedHolder, SharedResource, SuspendedContext,
    SynchronizationManager, TransactionSynchronization, LOWEST_PRECEDENCE,
};
pub use demarc_core::{
    CompletionStatus, IsolationLevel, Propagation, Resource, ResourceError, ResourceFactory,
    ResourceKey, ResourceResult, RollbackRule, Savepoint, TransactionDefinition, TransactionError,
    TxResult,
};
pub use demarc_datasource::{
    LazyResourceFactory, LazyResourceHandle, ResourceSynchronization, ResourceTransactionBackend,
    ResourceTransactionManager, ResourceUtils,
};
pub use demarc_engine::{
    CoordinatorError, CoordinatorStatus, CoordinatorTransactionBackend, ManagerConfig,
    MapAttributeSource, PlatformTransactionManager, SynchronizationMode, TransactionAttributeSource,
    TransactionBackend, TransactionCoordinator, TransactionExecution, TransactionInterceptor,
    TransactionManager, TransactionMetrics, TransactionStatus, UserTransaction,
    UserTransactionAdapter,
};
