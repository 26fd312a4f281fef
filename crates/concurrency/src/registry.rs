//! Thread-local resource registry
//!
//! Maps [`ResourceKey`] to [`SharedHolder`] for the calling thread only.
//! Each thread lazily gets its own map on first access, so no locking is
//! involved; a holder bound on one thread is invisible to every other.
//!
//! Invariant: exactly one holder is bound per (thread, key) at any time.
//! Re-entrant acquisition bumps the holder's reference count instead of
//! binding a second holder.

use crate::holder::SharedHolder;
use demarc_core::{ResourceKey, TransactionError, TxResult};
use std::cell::RefCell;
use std::collections::HashMap;
use tracing::trace;

thread_local! {
    /// Resources bound to the current thread
    static RESOURCES: RefCell<HashMap<ResourceKey, SharedHolder>> = RefCell::new(HashMap::new());
}

/// Thread-bound resource registry operations
///
/// All operations act on the calling thread's map.
///
/// # Example
///
/// ```ignore
/// let holder = ResourceHolder::new(share_resource(resource)).into_shared();
/// ResourceRegistry::bind(factory.resource_key(), holder)?;
///
/// // ... deeper in the call stack, same thread ...
/// let holder = ResourceRegistry::get_resource(&factory.resource_key());
///
/// ResourceRegistry::unbind(&factory.resource_key())?;
/// ```
pub struct ResourceRegistry;

impl ResourceRegistry {
    /// Bind a holder for a key
    ///
    /// # Errors
    ///
    /// `IllegalState` if a holder is already bound for `key` on this thread.
    pub fn bind(key: ResourceKey, holder: SharedHolder) -> TxResult<()> {
        RESOURCES.with(|resources| {
            let mut resources = resources.borrow_mut();
            if resources.contains_key(&key) {
                return Err(TransactionError::illegal_state(format!(
                    "Already a holder for key [{}] bound to thread",
                    key
                )));
            }
            resources.insert(key, holder);
            trace!(target: "demarc::resource", key = %key, "Bound resource holder to thread");
            Ok(())
        })
    }

    /// Remove and return the holder bound for a key
    ///
    /// # Errors
    ///
    /// `IllegalState` if nothing is bound for `key` on this thread.
    pub fn unbind(key: &ResourceKey) -> TxResult<SharedHolder> {
        Self::unbind_if_possible(key).ok_or_else(|| {
            TransactionError::illegal_state(format!(
                "No holder for key [{}] bound to thread",
                key
            ))
        })
    }

    /// Remove and return the holder bound for a key, if any
    pub fn unbind_if_possible(key: &ResourceKey) -> Option<SharedHolder> {
        let removed = RESOURCES.with(|resources| resources.borrow_mut().remove(key));
        if removed.is_some() {
            trace!(target: "demarc::resource", key = %key, "Removed resource holder from thread");
        }
        removed
    }

    /// The holder bound for a key, if any
    pub fn get_resource(key: &ResourceKey) -> Option<SharedHolder> {
        RESOURCES.with(|resources| resources.borrow().get(key).cloned())
    }

    /// Whether a holder is bound for a key
    pub fn has_resource(key: &ResourceKey) -> bool {
        RESOURCES.with(|resources| resources.borrow().contains_key(key))
    }

    /// Number of holders bound to this thread
    pub fn bound_count() -> usize {
        RESOURCES.with(|resources| resources.borrow().len())
    }

    /// Keys bound to this thread
    pub fn bound_keys() -> Vec<ResourceKey> {
        RESOURCES.with(|resources| resources.borrow().keys().copied().collect())
    }

    /// Take the whole map, leaving this thread with none bound
    pub(crate) fn take_all() -> HashMap<ResourceKey, SharedHolder> {
        RESOURCES.with(|resources| std::mem::take(&mut *resources.borrow_mut()))
    }

    /// Re-bind a previously taken map
    ///
    /// Every entry is restored; the first conflicting key is reported after
    /// the rest have been bound.
    pub(crate) fn restore_all(map: HashMap<ResourceKey, SharedHolder>) -> TxResult<()> {
        let mut first_error = None;
        for (key, holder) in map {
            if let Err(e) = Self::bind(key, holder) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
