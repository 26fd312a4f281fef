//! Core types and traits for demarc
//!
//! This crate defines the foundational types used throughout the system:
//! - TransactionDefinition: requested propagation, isolation, timeout, read-only, rollback rule
//! - Propagation / IsolationLevel: the policy enums, parseable from attribute strings
//! - ResourceKey: identity of a resource factory in the thread-bound registry
//! - CompletionStatus: outcome reported to completion callbacks
//! - Error: TransactionError / ResourceError hierarchy
//! - Traits: external Resource and ResourceFactory interfaces

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod definition;
pub mod error;
pub mod traits;
pub mod types;

pub use definition::{IsolationLevel, Propagation, RollbackRule, TransactionDefinition};
pub use error::{BoxedCause, ResourceError, ResourceResult, TransactionError, TxResult};
pub use traits::{Resource, ResourceFactory, Savepoint};
pub use types::{CompletionStatus, ResourceKey};
