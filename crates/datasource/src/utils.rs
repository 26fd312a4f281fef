//! Thread-bound resource acquisition and release
//!
//! [`ResourceUtils::get_resource`] is how application code obtains a
//! resource that takes part in whatever unit of work is active on the
//! current thread. Inside a transaction started by
//! [`ResourceTransactionBackend`](crate::ResourceTransactionBackend) it hands
//! out the transaction's resource. Outside of one, with synchronization
//! active, it binds the freshly acquired resource for the rest of the unit of
//! work and registers a [`ResourceSynchronization`] that releases it at
//! completion.
//!
//! Every `get_resource` must be paired with a `release_resource`.

use demarc_concurrency::{
    share_resource, ResourceHolder, ResourceRegistry, SharedHolder, SharedResource,
    SynchronizationManager, TransactionSynchronization,
};
use demarc_core::{
    CompletionStatus, IsolationLevel, ResourceFactory, ResourceKey, TransactionDefinition, TxResult,
};
use std::time::Duration;
use tracing::{debug, error};

/// Order of [`ResourceSynchronization`]; runs before most application callbacks
/// registered with the default order
pub const RESOURCE_SYNCHRONIZATION_ORDER: i32 = 1000;

/// Helper operations over the thread-bound registry for one resource factory
pub struct ResourceUtils;

impl ResourceUtils {
    /// Resource for `factory`, bound to the current unit of work if there is one
    ///
    /// # Errors
    ///
    /// `Resource` if the factory fails to acquire, `IllegalState` if the
    /// synchronization bookkeeping is inconsistent.
    pub fn get_resource(factory: &dyn ResourceFactory) -> TxResult<SharedResource> {
        let key = factory.resource_key();
        let bound = ResourceRegistry::get_resource(&key);

        if let Some(holder) = &bound {
            let mut holder = holder.borrow_mut();
            if holder.has_resource() || holder.is_synchronized_with_transaction() {
                holder.requested();
                if let Some(resource) = holder.resource() {
                    return Ok(resource);
                }
                debug!(target: "demarc::resource", key = %key, "Fetching resumed resource from factory");
                let resource = share_resource(factory.acquire()?);
                holder.set_resource(Some(resource.clone()));
                return Ok(resource);
            }
        }

        debug!(target: "demarc::resource", factory = %factory.description(), "Fetching resource from factory");
        let resource = share_resource(factory.acquire()?);

        if SynchronizationManager::is_synchronization_active() {
            if let Err(e) = Self::bind_for_synchronization(key, bound, &resource) {
                Self::close_resource(&resource);
                return Err(e);
            }
        }
        Ok(resource)
    }

    fn bind_for_synchronization(
        key: ResourceKey,
        bound: Option<SharedHolder>,
        resource: &SharedResource,
    ) -> TxResult<()> {
        debug!(target: "demarc::resource", key = %key, "Registering transaction synchronization for resource");
        let (holder, is_new) = match bound {
            Some(holder) => {
                holder.borrow_mut().set_resource(Some(resource.clone()));
                (holder, false)
            }
            None => (ResourceHolder::new(resource.clone()).into_shared(), true),
        };
        SynchronizationManager::register_synchronization(Box::new(ResourceSynchronization::new(
            holder.clone(),
            key,
        )))?;
        {
            let mut holder = holder.borrow_mut();
            holder.requested();
            holder.set_synchronized_with_transaction(true);
        }
        if is_new {
            ResourceRegistry::bind(key, holder)?;
        }
        Ok(())
    }

    /// Give back a resource obtained from [`get_resource`](Self::get_resource)
    ///
    /// A resource bound to the current unit of work is only released from the
    /// holder's point of view; anything else is closed. Failures are logged.
    pub fn release_resource(resource: Option<&SharedResource>, factory: &dyn ResourceFactory) {
        let Some(resource) = resource else {
            return;
        };
        let key = factory.resource_key();
        if let Some(holder) = ResourceRegistry::get_resource(&key) {
            let void = {
                let mut holder = holder.borrow_mut();
                if !holder.holds(resource) {
                    drop(holder);
                    Self::close_resource(resource);
                    return;
                }
                holder.released();
                holder.is_void()
            };
            if void {
                ResourceRegistry::unbind_if_possible(&key);
                holder.borrow_mut().set_resource(None);
                Self::close_resource(resource);
            }
            return;
        }
        Self::close_resource(resource);
    }

    /// Close a resource, logging failures
    pub fn close_resource(resource: &SharedResource) {
        debug!(target: "demarc::resource", "Closing resource");
        if let Err(e) = resource.borrow_mut().close() {
            error!(target: "demarc::resource", error = %e, "Could not close resource");
        }
    }

    /// Whether `resource` is the one bound for `factory` on this thread
    pub fn is_resource_transactional(resource: &SharedResource, factory: &dyn ResourceFactory) -> bool {
        ResourceRegistry::get_resource(&factory.resource_key())
            .map(|holder| holder.borrow().holds(resource))
            .unwrap_or(false)
    }

    /// Apply a definition's read-only hint and isolation level to a resource
    ///
    /// The read-only hint is best effort. Returns the isolation level to
    /// restore afterwards, if it was changed.
    pub fn prepare_for_transaction(
        resource: &SharedResource,
        definition: &TransactionDefinition,
    ) -> TxResult<Option<IsolationLevel>> {
        let mut resource = resource.borrow_mut();

        if definition.is_read_only() {
            debug!(target: "demarc::resource", "Setting resource read-only");
            if let Err(e) = resource.set_read_only(true) {
                debug!(target: "demarc::resource", error = %e, "Could not set resource read-only");
            }
        }

        let requested = definition.isolation();
        if !requested.is_specific() {
            return Ok(None);
        }
        let current = resource.isolation_level()?;
        if current == requested {
            return Ok(None);
        }
        debug!(
            target: "demarc::resource",
            from = %current,
            to = %requested,
            "Changing isolation level of resource"
        );
        resource.set_isolation_level(requested)?;
        Ok(Some(current))
    }

    /// Undo [`prepare_for_transaction`](Self::prepare_for_transaction), logging failures
    pub fn reset_after_transaction(
        resource: &SharedResource,
        previous_isolation: Option<IsolationLevel>,
        reset_read_only: bool,
    ) {
        let mut resource = resource.borrow_mut();
        if let Some(level) = previous_isolation {
            debug!(target: "demarc::resource", to = %level, "Resetting isolation level of resource");
            if let Err(e) = resource.set_isolation_level(level) {
                debug!(target: "demarc::resource", error = %e, "Could not reset isolation level");
            }
        }
        if reset_read_only {
            if let Err(e) = resource.set_read_only(false) {
                debug!(target: "demarc::resource", error = %e, "Could not reset read-only flag");
            }
        }
    }

    /// Time left in the current transaction for `factory`'s resource
    ///
    /// `None` when nothing is bound or no deadline applies.
    ///
    /// # Errors
    ///
    /// `TransactionTimedOut` once the deadline has passed; the holder is
    /// marked rollback-only at that point.
    pub fn transaction_time_to_live(factory: &dyn ResourceFactory) -> TxResult<Option<Duration>> {
        match ResourceRegistry::get_resource(&factory.resource_key()) {
            Some(holder) if holder.borrow().has_timeout() => {
                holder.borrow_mut().time_to_live().map(Some)
            }
            _ => Ok(None),
        }
    }
}

/// Releases a resource bound by [`ResourceUtils::get_resource`] at the end of
/// the unit of work
pub struct ResourceSynchronization {
    holder: SharedHolder,
    key: ResourceKey,
    holder_active: bool,
}

impl ResourceSynchronization {
    /// Synchronization for a holder bound under `key`
    pub fn new(holder: SharedHolder, key: ResourceKey) -> Self {
        Self {
            holder,
            key,
            holder_active: true,
        }
    }

    fn release_held_resource(&self) {
        let resource = self.holder.borrow_mut().take_resource();
        if let Some(resource) = resource {
            ResourceUtils::close_resource(&resource);
        }
    }
}

impl TransactionSynchronization for ResourceSynchronization {
    fn order(&self) -> i32 {
        RESOURCE_SYNCHRONIZATION_ORDER
    }

    fn suspend(&mut self) {
        if !self.holder_active {
            return;
        }
        ResourceRegistry::unbind_if_possible(&self.key);
        let idle = {
            let holder = self.holder.borrow();
            holder.has_resource() && !holder.is_open()
        };
        if idle {
            // Fetched again on first use after resume
            self.release_held_resource();
        }
    }

    fn resume(&mut self) -> TxResult<()> {
        if self.holder_active {
            ResourceRegistry::bind(self.key, self.holder.clone())?;
        }
        Ok(())
    }

    fn before_completion(&mut self) -> TxResult<()> {
        if !self.holder.borrow().is_open() {
            ResourceRegistry::unbind_if_possible(&self.key);
            self.holder_active = false;
            self.release_held_resource();
        }
        Ok(())
    }

    fn after_completion(&mut self, _status: CompletionStatus) -> TxResult<()> {
        if self.holder_active {
            ResourceRegistry::unbind_if_possible(&self.key);
            self.holder_active = false;
            self.release_held_resource();
        }
        self.holder.borrow_mut().reset();
        Ok(())
    }
}
