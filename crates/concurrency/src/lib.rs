//! Thread-bound state for demarc
//!
//! This crate confines transactional state to the calling thread:
//! - ResourceHolder: a bound resource plus reference count and transaction flags
//! - ResourceRegistry: per-thread map from ResourceKey to holder
//! - SynchronizationManager: per-thread completion callbacks and current
//!   transaction attributes, with suspend/resume of the whole bundle
//!
//! Nothing in here is `Send`. Every operation acts on the calling thread's
//! state only, so no locks are taken.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod holder;
pub mod registry;
pub mod synchronization;

pub use holder::{share_resource, ResourceHolder, SharedHolder, SharedResource};
pub use registry::ResourceRegistry;
pub use synchronization::{
    invoke_after_completion, trigger_before_commit, trigger_before_completion,
    RegisteredSynchronization, SuspendedContext, SynchronizationManager, Synchronizations,
    TransactionSynchronization, LOWEST_PRECEDENCE,
};
