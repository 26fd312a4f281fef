//! Lazily acquired resources
//!
//! [`LazyResourceFactory`] hands out [`LazyResourceHandle`]s without touching
//! the target factory. A handle buffers the read-only hint, the isolation
//! level and the auto-commit mode, answers identity and flag queries from that
//! buffer, and treats commit/rollback as no-ops while nothing was acquired.
//!
//! The first operation the buffer cannot answer acquires the target resource,
//! applies every buffered flag that differs from the target's defaults, and
//! from then on delegates everything. The transition is one-way.
//!
//! This makes a transaction that never issues a statement free: begin and
//! commit only ever touch the buffer.

use demarc_core::{
    IsolationLevel, Resource, ResourceError, ResourceFactory, ResourceKey, ResourceResult, Savepoint,
};
use parking_lot::Mutex;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Settings a freshly acquired target resource starts with
///
/// `None` means not determined yet.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResourceDefaults {
    /// Auto-commit mode of a fresh resource
    pub auto_commit: Option<bool>,
    /// Isolation level of a fresh resource
    pub isolation: Option<IsolationLevel>,
}

impl ResourceDefaults {
    fn is_complete(&self) -> bool {
        self.auto_commit.is_some() && self.isolation.is_some()
    }
}

type SharedDefaults = Arc<Mutex<ResourceDefaults>>;

/// Factory wrapper that defers acquisition until a handle is really used
pub struct LazyResourceFactory {
    target: Arc<dyn ResourceFactory>,
    key: ResourceKey,
    defaults: SharedDefaults,
}

impl LazyResourceFactory {
    /// Wrap `target`, probing its defaults once
    ///
    /// A failed probe is logged; the defaults are then determined from the
    /// first resource a handle acquires.
    pub fn new(target: Arc<dyn ResourceFactory>) -> Self {
        let defaults = probe_defaults(target.as_ref());
        Self::build(target, defaults)
    }

    /// Wrap `target` with known defaults, skipping the probe
    pub fn with_defaults(target: Arc<dyn ResourceFactory>, auto_commit: bool, isolation: IsolationLevel) -> Self {
        Self::build(
            target,
            ResourceDefaults {
                auto_commit: Some(auto_commit),
                isolation: Some(isolation),
            },
        )
    }

    fn build(target: Arc<dyn ResourceFactory>, defaults: ResourceDefaults) -> Self {
        Self {
            target,
            key: ResourceKey::new(),
            defaults: Arc::new(Mutex::new(defaults)),
        }
    }

    /// The wrapped factory
    pub fn target(&self) -> &Arc<dyn ResourceFactory> {
        &self.target
    }

    /// Defaults known so far
    pub fn defaults(&self) -> ResourceDefaults {
        *self.defaults.lock()
    }

    /// A new handle; never contacts the target factory
    pub fn handle(&self) -> LazyResourceHandle {
        LazyResourceHandle {
            id: Uuid::new_v4(),
            target: self.target.clone(),
            defaults: self.defaults.clone(),
            state: HandleState::Deferred(DeferredState::default()),
        }
    }
}

impl ResourceFactory for LazyResourceFactory {
    fn resource_key(&self) -> ResourceKey {
        self.key
    }

    fn acquire(&self) -> ResourceResult<Box<dyn Resource>> {
        Ok(Box::new(self.handle()))
    }

    fn description(&self) -> String {
        format!("lazy proxy for {}", self.target.description())
    }
}

impl fmt::Debug for LazyResourceFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyResourceFactory")
            .field("target", &self.target.description())
            .field("key", &self.key)
            .field("defaults", &*self.defaults.lock())
            .finish()
    }
}

fn probe_defaults(target: &dyn ResourceFactory) -> ResourceDefaults {
    let mut resource = match target.acquire() {
        Ok(resource) => resource,
        Err(e) => {
            warn!(
                target: "demarc::resource",
                factory = %target.description(),
                error = %e,
                "Could not probe default resource settings; determining them on first acquisition"
            );
            return ResourceDefaults::default();
        }
    };
    let defaults = ResourceDefaults {
        auto_commit: resource.auto_commit().ok(),
        isolation: resource.isolation_level().ok(),
    };
    if let Err(e) = resource.close() {
        debug!(target: "demarc::resource", error = %e, "Could not close probe resource");
    }
    defaults
}

#[derive(Debug, Default, Clone, Copy)]
struct DeferredState {
    read_only: bool,
    isolation: Option<IsolationLevel>,
    auto_commit: Option<bool>,
    closed: bool,
}

enum HandleState {
    Deferred(DeferredState),
    Acquired(Box<dyn Resource>),
}

/// Resource handle that acquires its target on first real use
///
/// Equality and hashing use the handle's own identity, so they never
/// acquire.
pub struct LazyResourceHandle {
    id: Uuid,
    target: Arc<dyn ResourceFactory>,
    defaults: SharedDefaults,
    state: HandleState,
}

impl LazyResourceHandle {
    /// Identity of this handle
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Whether the target resource has been acquired
    pub fn is_acquired(&self) -> bool {
        matches!(self.state, HandleState::Acquired(_))
    }

    /// The target resource, acquiring it if necessary
    ///
    /// # Errors
    ///
    /// `Closed` if the handle was closed before acquisition, or whatever the
    /// target factory reports.
    pub fn target_resource(&mut self) -> ResourceResult<&mut dyn Resource> {
        if let HandleState::Deferred(deferred) = self.state {
            if deferred.closed {
                return Err(ResourceError::Closed);
            }
            let resource = self.acquire_target(deferred)?;
            self.state = HandleState::Acquired(resource);
        }
        match &mut self.state {
            HandleState::Acquired(resource) => Ok(resource.as_mut()),
            HandleState::Deferred(_) => Err(ResourceError::failure("lazy handle has no target resource")),
        }
    }

    fn acquire_target(&self, deferred: DeferredState) -> ResourceResult<Box<dyn Resource>> {
        debug!(
            target: "demarc::resource",
            handle = %self.id,
            factory = %self.target.description(),
            "Acquiring target resource for lazy handle"
        );
        let mut resource = self.target.acquire()?;
        let defaults = self.learn_defaults(resource.as_mut());
        if let Err(e) = apply_deferred(resource.as_mut(), deferred, defaults) {
            if let Err(close) = resource.close() {
                debug!(target: "demarc::resource", error = %close, "Could not close target resource");
            }
            return Err(e);
        }
        Ok(resource)
    }

    fn learn_defaults(&self, resource: &mut dyn Resource) -> ResourceDefaults {
        let mut defaults = self.defaults.lock();
        if !defaults.is_complete() {
            if defaults.auto_commit.is_none() {
                defaults.auto_commit = resource.auto_commit().ok();
            }
            if defaults.isolation.is_none() {
                defaults.isolation = resource.isolation_level().ok();
            }
            debug!(target: "demarc::resource", defaults = ?*defaults, "Determined default resource settings");
        }
        *defaults
    }

    fn known_defaults(&self) -> ResourceDefaults {
        *self.defaults.lock()
    }
}

fn apply_deferred(
    resource: &mut dyn Resource,
    deferred: DeferredState,
    defaults: ResourceDefaults,
) -> ResourceResult<()> {
    if deferred.read_only {
        resource.set_read_only(true)?;
    }
    if let Some(level) = deferred.isolation {
        if Some(level) != defaults.isolation {
            resource.set_isolation_level(level)?;
        }
    }
    if let Some(auto_commit) = deferred.auto_commit {
        if Some(auto_commit) != defaults.auto_commit {
            resource.set_auto_commit(auto_commit)?;
        }
    }
    Ok(())
}

impl Resource for LazyResourceHandle {
    fn execute(&mut self, statement: &str) -> ResourceResult<u64> {
        self.target_resource()?.execute(statement)
    }

    fn commit(&mut self) -> ResourceResult<()> {
        match &mut self.state {
            HandleState::Deferred(_) => Ok(()),
            HandleState::Acquired(resource) => resource.commit(),
        }
    }

    fn rollback(&mut self) -> ResourceResult<()> {
        match &mut self.state {
            HandleState::Deferred(_) => Ok(()),
            HandleState::Acquired(resource) => resource.rollback(),
        }
    }

    fn close(&mut self) -> ResourceResult<()> {
        match &mut self.state {
            HandleState::Deferred(deferred) => {
                deferred.closed = true;
                Ok(())
            }
            HandleState::Acquired(resource) => resource.close(),
        }
    }

    fn is_closed(&self) -> bool {
        match &self.state {
            HandleState::Deferred(deferred) => deferred.closed,
            HandleState::Acquired(resource) => resource.is_closed(),
        }
    }

    fn set_read_only(&mut self, read_only: bool) -> ResourceResult<()> {
        match &mut self.state {
            HandleState::Deferred(deferred) => {
                deferred.read_only = read_only;
                Ok(())
            }
            HandleState::Acquired(resource) => resource.set_read_only(read_only),
        }
    }

    fn is_read_only(&mut self) -> ResourceResult<bool> {
        match &mut self.state {
            HandleState::Deferred(deferred) => Ok(deferred.read_only),
            HandleState::Acquired(resource) => resource.is_read_only(),
        }
    }

    fn set_isolation_level(&mut self, level: IsolationLevel) -> ResourceResult<()> {
        match &mut self.state {
            HandleState::Deferred(deferred) => {
                deferred.isolation = level.is_specific().then_some(level);
                Ok(())
            }
            HandleState::Acquired(resource) => resource.set_isolation_level(level),
        }
    }

    fn isolation_level(&mut self) -> ResourceResult<IsolationLevel> {
        if let HandleState::Deferred(deferred) = self.state {
            if let Some(level) = deferred.isolation.or(self.known_defaults().isolation) {
                return Ok(level);
            }
        }
        self.target_resource()?.isolation_level()
    }

    fn set_auto_commit(&mut self, auto_commit: bool) -> ResourceResult<()> {
        match &mut self.state {
            HandleState::Deferred(deferred) => {
                deferred.auto_commit = Some(auto_commit);
                Ok(())
            }
            HandleState::Acquired(resource) => resource.set_auto_commit(auto_commit),
        }
    }

    fn auto_commit(&mut self) -> ResourceResult<bool> {
        if let HandleState::Deferred(deferred) = self.state {
            if let Some(auto_commit) = deferred.auto_commit.or(self.known_defaults().auto_commit) {
                return Ok(auto_commit);
            }
        }
        self.target_resource()?.auto_commit()
    }

    fn supports_savepoints(&mut self) -> bool {
        match self.target_resource() {
            Ok(resource) => resource.supports_savepoints(),
            Err(e) => {
                debug!(target: "demarc::resource", error = %e, "Could not determine savepoint support");
                false
            }
        }
    }

    fn set_savepoint(&mut self, name: &str) -> ResourceResult<Savepoint> {
        self.target_resource()?.set_savepoint(name)
    }

    fn rollback_to_savepoint(&mut self, savepoint: &Savepoint) -> ResourceResult<()> {
        self.target_resource()?.rollback_to_savepoint(savepoint)
    }

    fn release_savepoint(&mut self, savepoint: &Savepoint) -> ResourceResult<()> {
        self.target_resource()?.release_savepoint(savepoint)
    }
}

impl PartialEq for LazyResourceHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for LazyResourceHandle {}

impl Hash for LazyResourceHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for LazyResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            HandleState::Deferred(_) => write!(
                f,
                "Lazy resource handle {} for target {}",
                self.id,
                self.target.description()
            ),
            HandleState::Acquired(resource) => {
                write!(f, "Lazy resource handle {} for resource {:?}", self.id, resource)
            }
        }
    }
}

impl fmt::Debug for LazyResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyResourceHandle")
            .field("id", &self.id)
            .field("acquired", &self.is_acquired())
            .field("closed", &self.is_closed())
            .finish()
    }
}
