//! Transaction synchronization
//!
//! Completion callbacks registered for the unit of work active on the
//! current thread, plus the thread-bound attributes of that unit of work.
//!
//! # State machine (per thread)
//!
//! ```text
//! INACTIVE --init_synchronization()--> ACTIVE
//! ACTIVE --drain_synchronizations()--> INACTIVE   (callbacks handed to the caller)
//! ACTIVE --clear_synchronization()--> INACTIVE    (callbacks dropped)
//! ```
//!
//! Draining hands every registered callback to the caller exactly once,
//! sorted by [`TransactionSynchronization::order`] with ties in registration
//! order. `suspend()` captures the callbacks, the thread's resource map and
//! the transaction attributes into a [`SuspendedContext`]; `resume()` puts
//! them back. Suspend/resume pairs nest strictly LIFO per thread.

use crate::holder::SharedHolder;
use crate::registry::ResourceRegistry;
use demarc_core::{CompletionStatus, IsolationLevel, ResourceKey, TransactionError, TxResult};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, error};

/// Order value of callbacks that do not specify one
pub const LOWEST_PRECEDENCE: i32 = i32::MAX;

/// Completion callback for the active unit of work
///
/// Every hook has a no-op default. Implementations live on one thread and
/// may freely touch the thread-bound registry from their hooks.
pub trait TransactionSynchronization {
    /// Sort key; lower values run first
    fn order(&self) -> i32 {
        LOWEST_PRECEDENCE
    }

    /// The unit of work is being suspended; unbind thread-bound state
    fn suspend(&mut self) {}

    /// The unit of work is being resumed; rebind thread-bound state
    fn resume(&mut self) -> TxResult<()> {
        Ok(())
    }

    /// Called before a commit is attempted; an error dooms the transaction
    fn before_commit(&mut self, _read_only: bool) -> TxResult<()> {
        Ok(())
    }

    /// Called before commit or rollback
    fn before_completion(&mut self) -> TxResult<()> {
        Ok(())
    }

    /// Called once after commit or rollback
    fn after_completion(&mut self, _status: CompletionStatus) -> TxResult<()> {
        Ok(())
    }
}

/// A callback together with its sort keys
pub struct RegisteredSynchronization {
    order: i32,
    sequence: u64,
    callback: Box<dyn TransactionSynchronization>,
}

impl RegisteredSynchronization {
    /// Sort key
    pub fn order(&self) -> i32 {
        self.order
    }

    /// Registration sequence number
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// The callback
    pub fn callback_mut(&mut self) -> &mut dyn TransactionSynchronization {
        self.callback.as_mut()
    }
}

impl fmt::Debug for RegisteredSynchronization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredSynchronization")
            .field("order", &self.order)
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// Callbacks drained from a finished unit of work, in invocation order
pub type Synchronizations = Vec<RegisteredSynchronization>;

#[derive(Default)]
struct SyncState {
    /// `None` while inactive
    synchronizations: Option<Vec<RegisteredSynchronization>>,
    next_sequence: u64,
    current_name: Option<String>,
    current_read_only: bool,
    current_isolation: Option<IsolationLevel>,
    actual_transaction_active: bool,
}

thread_local! {
    static SYNC_STATE: RefCell<SyncState> = RefCell::new(SyncState::default());
}

/// Everything `SynchronizationManager::suspend` took off the thread
pub struct SuspendedContext {
    resources: HashMap<ResourceKey, SharedHolder>,
    synchronizations: Option<Vec<RegisteredSynchronization>>,
    name: Option<String>,
    read_only: bool,
    isolation: Option<IsolationLevel>,
    was_active: bool,
}

impl SuspendedContext {
    /// Number of resource holders captured
    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    /// Whether a captured holder exists for the key
    pub fn has_resource(&self, key: &ResourceKey) -> bool {
        self.resources.contains_key(key)
    }

    /// Whether synchronization was active when suspended
    pub fn had_synchronization(&self) -> bool {
        self.synchronizations.is_some()
    }

    /// Name of the suspended unit of work
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl fmt::Debug for SuspendedContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuspendedContext")
            .field("resources", &self.resources.len())
            .field(
                "synchronizations",
                &self.synchronizations.as_ref().map(Vec::len),
            )
            .field("name", &self.name)
            .field("read_only", &self.read_only)
            .field("isolation", &self.isolation)
            .field("was_active", &self.was_active)
            .finish()
    }
}

/// Thread-bound synchronization operations
pub struct SynchronizationManager;

impl SynchronizationManager {
    /// Activate synchronization for the current thread
    ///
    /// # Errors
    ///
    /// `IllegalState` if synchronization is already active.
    pub fn init_synchronization() -> TxResult<()> {
        SYNC_STATE.with(|state| {
            let mut state = state.borrow_mut();
            if state.synchronizations.is_some() {
                return Err(TransactionError::illegal_state(
                    "Cannot activate transaction synchronization - already active",
                ));
            }
            state.synchronizations = Some(Vec::new());
            debug!(target: "demarc::sync", "Initializing transaction synchronization");
            Ok(())
        })
    }

    /// Whether synchronization is active for the current thread
    pub fn is_synchronization_active() -> bool {
        SYNC_STATE.with(|state| state.borrow().synchronizations.is_some())
    }

    /// Register a callback for the active unit of work
    ///
    /// # Errors
    ///
    /// `IllegalState` if synchronization is not active.
    pub fn register_synchronization(callback: Box<dyn TransactionSynchronization>) -> TxResult<()> {
        SYNC_STATE.with(|state| {
            let mut state = state.borrow_mut();
            let sequence = state.next_sequence;
            let list = state.synchronizations.as_mut().ok_or_else(|| {
                TransactionError::illegal_state("Transaction synchronization is not active")
            })?;
            list.push(RegisteredSynchronization {
                order: callback.order(),
                sequence,
                callback,
            });
            state.next_sequence += 1;
            Ok(())
        })
    }

    /// Number of callbacks registered so far, 0 when inactive
    pub fn synchronization_count() -> usize {
        SYNC_STATE.with(|state| {
            state
                .borrow()
                .synchronizations
                .as_ref()
                .map(Vec::len)
                .unwrap_or(0)
        })
    }

    /// Hand all registered callbacks to the caller and deactivate
    ///
    /// The list is sorted by order value, ties in registration order. Each
    /// unit of work's list is consumed exactly once.
    ///
    /// # Errors
    ///
    /// `IllegalState` if synchronization is not active.
    pub fn drain_synchronizations() -> TxResult<Synchronizations> {
        let mut list = SYNC_STATE.with(|state| {
            state.borrow_mut().synchronizations.take().ok_or_else(|| {
                TransactionError::illegal_state("Transaction synchronization is not active")
            })
        })?;
        list.sort_by_key(|s| (s.order, s.sequence));
        debug!(target: "demarc::sync", count = list.len(), "Drained transaction synchronizations");
        Ok(list)
    }

    /// Force the inactive state, dropping any registered callbacks
    pub fn clear_synchronization() {
        SYNC_STATE.with(|state| {
            if state.borrow_mut().synchronizations.take().is_some() {
                debug!(target: "demarc::sync", "Clearing transaction synchronization");
            }
        });
    }

    /// Set the name of the current unit of work
    pub fn set_current_transaction_name(name: Option<String>) {
        SYNC_STATE.with(|state| state.borrow_mut().current_name = name);
    }

    /// Name of the current unit of work
    pub fn current_transaction_name() -> Option<String> {
        SYNC_STATE.with(|state| state.borrow().current_name.clone())
    }

    /// Set the read-only flag of the current unit of work
    pub fn set_current_transaction_read_only(read_only: bool) {
        SYNC_STATE.with(|state| state.borrow_mut().current_read_only = read_only);
    }

    /// Read-only flag of the current unit of work
    pub fn is_current_transaction_read_only() -> bool {
        SYNC_STATE.with(|state| state.borrow().current_read_only)
    }

    /// Set the isolation level of the current unit of work
    pub fn set_current_transaction_isolation_level(isolation: Option<IsolationLevel>) {
        SYNC_STATE.with(|state| state.borrow_mut().current_isolation = isolation);
    }

    /// Isolation level of the current unit of work
    pub fn current_transaction_isolation_level() -> Option<IsolationLevel> {
        SYNC_STATE.with(|state| state.borrow().current_isolation)
    }

    /// Mark whether an actual transaction (not just a synchronization scope) is active
    pub fn set_actual_transaction_active(active: bool) {
        SYNC_STATE.with(|state| state.borrow_mut().actual_transaction_active = active);
    }

    /// Whether an actual transaction is active
    pub fn is_actual_transaction_active() -> bool {
        SYNC_STATE.with(|state| state.borrow().actual_transaction_active)
    }

    /// Reset callbacks and attributes of the current thread
    pub fn clear() {
        Self::clear_synchronization();
        Self::set_current_transaction_name(None);
        Self::set_current_transaction_read_only(false);
        Self::set_current_transaction_isolation_level(None);
        Self::set_actual_transaction_active(false);
    }

    /// Take the current unit of work's thread-bound state off the thread
    ///
    /// Callbacks get `suspend()` first (so they can unbind what they own),
    /// then the callback list, the resource map and the attributes are
    /// captured and cleared.
    pub fn suspend() -> SuspendedContext {
        let mut synchronizations =
            SYNC_STATE.with(|state| state.borrow_mut().synchronizations.take());
        if let Some(list) = synchronizations.as_mut() {
            for registered in list.iter_mut() {
                registered.callback.suspend();
            }
        }
        let resources = ResourceRegistry::take_all();
        let (name, read_only, isolation, was_active) = SYNC_STATE.with(|state| {
            let mut state = state.borrow_mut();
            let captured = (
                state.current_name.take(),
                state.current_read_only,
                state.current_isolation.take(),
                state.actual_transaction_active,
            );
            state.current_read_only = false;
            state.actual_transaction_active = false;
            captured
        });
        debug!(
            target: "demarc::sync",
            resources = resources.len(),
            synchronizations = synchronizations.as_ref().map(Vec::len).unwrap_or(0),
            "Suspended thread-bound transaction state"
        );
        SuspendedContext {
            resources,
            synchronizations,
            name,
            read_only,
            isolation,
            was_active,
        }
    }

    /// Put a suspended unit of work's state back on the thread
    ///
    /// Resources are rebound, attributes restored, synchronization
    /// re-activated with the captured callbacks, and each callback gets
    /// `resume()`. Every part is restored even if one fails; the first
    /// failure is returned.
    pub fn resume(context: SuspendedContext) -> TxResult<()> {
        let SuspendedContext {
            resources,
            synchronizations,
            name,
            read_only,
            isolation,
            was_active,
        } = context;

        let mut first_error = ResourceRegistry::restore_all(resources).err();

        SYNC_STATE.with(|state| {
            let mut state = state.borrow_mut();
            state.current_name = name;
            state.current_read_only = read_only;
            state.current_isolation = isolation;
            state.actual_transaction_active = was_active;
        });

        if let Some(mut list) = synchronizations {
            for registered in list.iter_mut() {
                if let Err(e) = registered.callback.resume() {
                    error!(target: "demarc::sync", error = %e, "Synchronization resume failed");
                    first_error.get_or_insert(e);
                }
            }
            let replaced = SYNC_STATE.with(|state| state.borrow_mut().synchronizations.replace(list));
            if replaced.is_some() {
                first_error.get_or_insert(TransactionError::illegal_state(
                    "Synchronization was re-activated before resume",
                ));
            }
        }

        debug!(target: "demarc::sync", "Resumed thread-bound transaction state");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Run `before_commit` on each callback, stopping at the first failure
pub fn trigger_before_commit(synchronizations: &mut [RegisteredSynchronization], read_only: bool) -> TxResult<()> {
    for registered in synchronizations.iter_mut() {
        registered.callback.before_commit(read_only)?;
    }
    Ok(())
}

/// Run `before_completion` on every callback
///
/// All callbacks run; the first failure is returned afterwards.
pub fn trigger_before_completion(synchronizations: &mut [RegisteredSynchronization]) -> TxResult<()> {
    let mut first_error = None;
    for registered in synchronizations.iter_mut() {
        if let Err(e) = registered.callback.before_completion() {
            error!(target: "demarc::sync", error = %e, "before_completion callback failed");
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Run `after_completion` exactly once on every callback
///
/// Failures are logged and never propagated.
pub fn invoke_after_completion(synchronizations: &mut [RegisteredSynchronization], status: CompletionStatus) {
    for registered in synchronizations.iter_mut() {
        if let Err(e) = registered.callback.after_completion(status) {
            error!(
                target: "demarc::sync",
                error = %e,
                status = %status,
                "after_completion callback failed"
            );
        }
    }
}
