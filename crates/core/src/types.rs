//! Identity and outcome types
//!
//! - ResourceKey: identity of a resource factory in the thread-bound registry
//! - CompletionStatus: outcome passed to after-completion callbacks

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity of a resource factory
///
/// A ResourceKey is a wrapper around a UUID v4 allocated once per factory.
/// It is only ever used as a map key: two factories never share a key and a
/// factory keeps its key for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey(Uuid);

impl ResourceKey {
    /// Allocate a fresh key
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a key from raw bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get the raw bytes of this key
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for ResourceKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of a unit of work, reported to after-completion callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionStatus {
    /// The transaction committed
    Committed,
    /// The transaction rolled back
    RolledBack,
    /// The outcome is unknown (e.g. a heuristic or system failure mid-commit)
    Unknown,
}

impl fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionStatus::Committed => write!(f, "committed"),
            CompletionStatus::RolledBack => write!(f, "rolled back"),
            CompletionStatus::Unknown => write!(f, "unknown"),
        }
    }
}
