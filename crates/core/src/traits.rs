//! External resource interfaces
//!
//! The transaction engine never talks to a concrete resource kind. It sees:
//! - [`ResourceFactory`]: a shared, thread-safe source of resources (a pool,
//!   a driver handle) identified by a [`ResourceKey`]
//! - [`Resource`]: one live resource (a connection) that participates in
//!   commit and rollback
//!
//! Factories must handle concurrent acquisition themselves; the engine only
//! confines the *binding* of resources to threads.

use crate::definition::IsolationLevel;
use crate::error::{ResourceError, ResourceResult};
use crate::types::ResourceKey;
use std::fmt;

/// Handle to a savepoint created on a resource
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Savepoint {
    id: u64,
    name: String,
}

impl Savepoint {
    /// Create a savepoint handle
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// Resource-assigned identifier
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Savepoint name
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A live resource participating in transactions
///
/// Getters take `&mut self` because some implementations (the lazy handle)
/// may have to acquire the real resource to answer them.
pub trait Resource: fmt::Debug + Send {
    /// Issue a unit of work against the resource, returning the affected count
    fn execute(&mut self, statement: &str) -> ResourceResult<u64>;

    /// Commit the work done since the last commit or rollback
    fn commit(&mut self) -> ResourceResult<()>;

    /// Discard the work done since the last commit or rollback
    fn rollback(&mut self) -> ResourceResult<()>;

    /// Close the resource, returning it to its factory
    fn close(&mut self) -> ResourceResult<()>;

    /// Whether `close` has been called
    fn is_closed(&self) -> bool;

    /// Set the read-only hint
    fn set_read_only(&mut self, read_only: bool) -> ResourceResult<()>;

    /// Read-only hint
    fn is_read_only(&mut self) -> ResourceResult<bool>;

    /// Change the isolation level
    fn set_isolation_level(&mut self, level: IsolationLevel) -> ResourceResult<()>;

    /// Current isolation level
    fn isolation_level(&mut self) -> ResourceResult<IsolationLevel>;

    /// Switch auto-commit mode
    fn set_auto_commit(&mut self, auto_commit: bool) -> ResourceResult<()>;

    /// Current auto-commit mode
    fn auto_commit(&mut self) -> ResourceResult<bool>;

    /// Whether savepoints are available
    fn supports_savepoints(&mut self) -> bool {
        false
    }

    /// Create a savepoint
    fn set_savepoint(&mut self, _name: &str) -> ResourceResult<Savepoint> {
        Err(ResourceError::unsupported("set_savepoint"))
    }

    /// Roll back to a savepoint, keeping the transaction open
    fn rollback_to_savepoint(&mut self, _savepoint: &Savepoint) -> ResourceResult<()> {
        Err(ResourceError::unsupported("rollback_to_savepoint"))
    }

    /// Release a savepoint
    fn release_savepoint(&mut self, _savepoint: &Savepoint) -> ResourceResult<()> {
        Err(ResourceError::unsupported("release_savepoint"))
    }
}

/// Shared source of resources
pub trait ResourceFactory: Send + Sync {
    /// Stable identity of this factory, used as the registry key
    fn resource_key(&self) -> ResourceKey;

    /// Acquire a fresh resource
    fn acquire(&self) -> ResourceResult<Box<dyn Resource>>;

    /// Human-readable description for logs
    fn description(&self) -> String {
        format!("resource factory {}", self.resource_key())
    }
}
