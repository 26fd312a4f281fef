//! Resource holders
//!
//! A [`ResourceHolder`] is the registry entry for one resource factory on one
//! thread. It wraps the live resource plus the bookkeeping the transaction
//! machinery needs:
//!
//! - reference count: how many callers currently hold the resource handle
//! - synchronized flag: whether the holder takes part in the active unit of
//!   work's completion callbacks
//! - rollback-only flag: set by participants that want the whole unit of
//!   work rolled back
//! - deadline: optional cooperative timeout
//!
//! Holders and resources are shared through `Rc<RefCell<..>>`: they live on
//! exactly one thread and are never handed to another.

use demarc_core::{Resource, TransactionError, TxResult};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Shared handle to a live resource
pub type SharedResource = Rc<RefCell<Box<dyn Resource>>>;

/// Shared handle to a holder, as stored in the registry
pub type SharedHolder = Rc<RefCell<ResourceHolder>>;

/// Wrap a freshly acquired resource into a shared handle
pub fn share_resource(resource: Box<dyn Resource>) -> SharedResource {
    Rc::new(RefCell::new(resource))
}

/// Registry entry wrapping a resource and its bookkeeping
#[derive(Debug, Default)]
pub struct ResourceHolder {
    resource: Option<SharedResource>,
    reference_count: u32,
    synchronized_with_transaction: bool,
    transaction_active: bool,
    rollback_only: bool,
    deadline: Option<Instant>,
    savepoint_counter: u64,
}

impl ResourceHolder {
    /// Create a holder for a resource
    pub fn new(resource: SharedResource) -> Self {
        Self {
            resource: Some(resource),
            ..Self::default()
        }
    }

    /// Create a holder without a resource (e.g. after suspension released it)
    pub fn empty() -> Self {
        Self::default()
    }

    /// Wrap this holder for registry storage
    pub fn into_shared(self) -> SharedHolder {
        Rc::new(RefCell::new(self))
    }

    /// Whether a resource is currently held
    pub fn has_resource(&self) -> bool {
        self.resource.is_some()
    }

    /// The held resource, if any
    pub fn resource(&self) -> Option<SharedResource> {
        self.resource.clone()
    }

    /// Replace the held resource
    pub fn set_resource(&mut self, resource: Option<SharedResource>) {
        self.resource = resource;
    }

    /// Remove and return the held resource
    pub fn take_resource(&mut self) -> Option<SharedResource> {
        self.resource.take()
    }

    /// Whether this holder holds exactly the given resource handle
    pub fn holds(&self, resource: &SharedResource) -> bool {
        self.resource
            .as_ref()
            .map(|held| Rc::ptr_eq(held, resource))
            .unwrap_or(false)
    }

    /// Record one more caller holding the resource
    pub fn requested(&mut self) {
        self.reference_count += 1;
    }

    /// Record one caller giving the resource back
    pub fn released(&mut self) {
        self.reference_count = self.reference_count.saturating_sub(1);
    }

    /// Whether any caller still holds the resource handle
    pub fn is_open(&self) -> bool {
        self.reference_count > 0
    }

    /// Current reference count
    pub fn reference_count(&self) -> u32 {
        self.reference_count
    }

    /// Mark whether the holder takes part in the active unit of work
    pub fn set_synchronized_with_transaction(&mut self, synchronized: bool) {
        self.synchronized_with_transaction = synchronized;
    }

    /// Whether the holder takes part in the active unit of work
    pub fn is_synchronized_with_transaction(&self) -> bool {
        self.synchronized_with_transaction
    }

    /// Mark whether a resource-level transaction is in progress
    pub fn set_transaction_active(&mut self, active: bool) {
        self.transaction_active = active;
    }

    /// Whether a resource-level transaction is in progress
    pub fn is_transaction_active(&self) -> bool {
        self.transaction_active
    }

    /// Doom the unit of work this holder belongs to
    pub fn set_rollback_only(&mut self) {
        self.rollback_only = true;
    }

    /// Undo a doom after rolling back to a savepoint
    pub fn reset_rollback_only(&mut self) {
        self.rollback_only = false;
    }

    /// Whether the unit of work has been doomed
    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    /// A holder nobody holds and no unit of work synchronizes with
    ///
    /// Such a holder must not stay in the registry.
    pub fn is_void(&self) -> bool {
        !self.is_open() && !self.synchronized_with_transaction
    }

    /// Set a deadline `secs` seconds from now
    pub fn set_timeout_in_seconds(&mut self, secs: u32) {
        self.set_timeout(Duration::from_secs(u64::from(secs)));
    }

    /// Set a deadline `timeout` from now
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.deadline = Some(Instant::now() + timeout);
    }

    /// Whether a deadline is set
    pub fn has_timeout(&self) -> bool {
        self.deadline.is_some()
    }

    /// The deadline, if set
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline
    ///
    /// Once the deadline has passed the holder is marked rollback-only and
    /// `TransactionTimedOut` is returned.
    ///
    /// # Errors
    ///
    /// `IllegalState` if no deadline is set, `TransactionTimedOut` if it has passed.
    pub fn time_to_live(&mut self) -> TxResult<Duration> {
        let deadline = self
            .deadline
            .ok_or_else(|| TransactionError::illegal_state("No timeout specified for this holder"))?;
        let now = Instant::now();
        if deadline <= now {
            self.rollback_only = true;
            return Err(TransactionError::TransactionTimedOut {
                overdue_ms: saturating_millis(now.duration_since(deadline)),
            });
        }
        Ok(deadline - now)
    }

    /// Time left before the deadline, rounded up to whole seconds
    pub fn time_to_live_in_seconds(&mut self) -> TxResult<u64> {
        let ttl = self.time_to_live()?;
        let secs = ttl.as_secs();
        Ok(if ttl.subsec_nanos() > 0 { secs + 1 } else { secs })
    }

    /// Next savepoint name for this holder, `SAVEPOINT_1`, `SAVEPOINT_2`, ...
    pub fn next_savepoint_name(&mut self) -> String {
        self.savepoint_counter += 1;
        format!("SAVEPOINT_{}", self.savepoint_counter)
    }

    /// Forget per-transaction state, keeping the reference count
    pub fn clear(&mut self) {
        self.synchronized_with_transaction = false;
        self.transaction_active = false;
        self.rollback_only = false;
        self.deadline = None;
    }

    /// Forget all state including the reference count
    pub fn reset(&mut self) {
        self.clear();
        self.reference_count = 0;
    }
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
