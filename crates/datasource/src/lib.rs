//! Resource-backed transactions for demarc
//!
//! This crate connects the transaction engine to external resources:
//! - ResourceUtils: thread-bound get/release of a factory's resource
//! - ResourceSynchronization: releases synchronized resources at completion
//! - ResourceTransactionBackend: begin/commit/rollback/savepoints on one factory
//! - LazyResourceFactory: handles that acquire their target on first real use
//!
//! With the `testing` feature, `testing::InMemoryResourceFactory` journals
//! every resource-level call.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod lazy;
pub mod utils;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use backend::{ResourceTransactionBackend, ResourceTransactionObject};
pub use lazy::{LazyResourceFactory, LazyResourceHandle, ResourceDefaults};
pub use utils::{ResourceSynchronization, ResourceUtils, RESOURCE_SYNCHRONIZATION_ORDER};

/// Transaction manager over a [`ResourceTransactionBackend`]
pub type ResourceTransactionManager = demarc_engine::TransactionManager<ResourceTransactionBackend>;
