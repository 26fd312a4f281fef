//! In-memory resource factory for tests
//!
//! Every resource-level call is appended to a journal shared by the factory
//! and all resources it handed out, so a test can assert exactly what the
//! transaction machinery did to the resource. Statements executed with
//! auto-commit off stay pending until commit.

use demarc_core::{
    IsolationLevel, Resource, ResourceError, ResourceFactory, ResourceKey, ResourceResult, Savepoint,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// A resource-level call recorded by [`InMemoryResourceFactory`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceCall {
    /// Resource handed out by the factory
    Acquire,
    /// Statement executed
    Execute,
    /// Commit requested
    Commit,
    /// Rollback requested
    Rollback,
    /// Resource closed
    Close,
    /// Read-only hint changed
    SetReadOnly(bool),
    /// Isolation level changed
    SetIsolation(IsolationLevel),
    /// Auto-commit mode changed
    SetAutoCommit(bool),
    /// Savepoint created
    SetSavepoint,
    /// Rolled back to a savepoint
    RollbackToSavepoint,
    /// Savepoint released
    ReleaseSavepoint,
}

/// One journal line: which resource saw which call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalEntry {
    /// Id of the resource, starting at 1 in acquisition order
    pub resource_id: u64,
    /// The call
    pub call: ResourceCall,
}

#[derive(Debug, Default)]
struct Shared {
    journal: Mutex<Vec<JournalEntry>>,
    committed: Mutex<Vec<String>>,
    next_id: AtomicU64,
    open: AtomicU64,
    fail_commit: AtomicBool,
    fail_acquire: AtomicBool,
}

impl Shared {
    fn record(&self, resource_id: u64, call: ResourceCall) {
        self.journal.lock().push(JournalEntry { resource_id, call });
    }
}

/// Resource factory that keeps everything in memory
#[derive(Debug, Clone)]
pub struct InMemoryResourceFactory {
    key: ResourceKey,
    default_isolation: IsolationLevel,
    shared: Arc<Shared>,
}

impl Default for InMemoryResourceFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryResourceFactory {
    /// Factory whose resources start in auto-commit mode at READ_COMMITTED
    pub fn new() -> Self {
        Self {
            key: ResourceKey::new(),
            default_isolation: IsolationLevel::ReadCommitted,
            shared: Arc::new(Shared::default()),
        }
    }

    /// Use a different starting isolation level for new resources
    pub fn with_default_isolation(mut self, level: IsolationLevel) -> Self {
        self.default_isolation = level;
        self
    }

    /// Make every commit fail
    pub fn set_fail_commit(&self, fail: bool) {
        self.shared.fail_commit.store(fail, Ordering::Relaxed);
    }

    /// Make every acquisition fail
    pub fn set_fail_acquire(&self, fail: bool) {
        self.shared.fail_acquire.store(fail, Ordering::Relaxed);
    }

    /// All calls so far
    pub fn journal(&self) -> Vec<JournalEntry> {
        self.shared.journal.lock().clone()
    }

    /// Calls so far, without resource ids
    pub fn calls(&self) -> Vec<ResourceCall> {
        self.shared.journal.lock().iter().map(|entry| entry.call).collect()
    }

    /// Forget the journal
    pub fn clear_journal(&self) {
        self.shared.journal.lock().clear();
    }

    /// How many times `call` was recorded
    pub fn count(&self, call: ResourceCall) -> usize {
        self.shared
            .journal
            .lock()
            .iter()
            .filter(|entry| entry.call == call)
            .count()
    }

    /// Number of resources handed out
    pub fn acquire_count(&self) -> u64 {
        self.shared.next_id.load(Ordering::Relaxed)
    }

    /// Number of resources handed out and not yet closed
    pub fn open_count(&self) -> u64 {
        self.shared.open.load(Ordering::Relaxed)
    }

    /// Statements that were committed, in commit order
    pub fn committed(&self) -> Vec<String> {
        self.shared.committed.lock().clone()
    }
}

impl ResourceFactory for InMemoryResourceFactory {
    fn resource_key(&self) -> ResourceKey {
        self.key
    }

    fn acquire(&self) -> ResourceResult<Box<dyn Resource>> {
        if self.shared.fail_acquire.load(Ordering::Relaxed) {
            return Err(ResourceError::failure("acquisition refused"));
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.shared.open.fetch_add(1, Ordering::Relaxed);
        self.shared.record(id, ResourceCall::Acquire);
        Ok(Box::new(InMemoryResource {
            id,
            shared: self.shared.clone(),
            pending: Vec::new(),
            savepoints: Vec::new(),
            auto_commit: true,
            read_only: false,
            isolation: self.default_isolation,
            closed: false,
        }))
    }

    fn description(&self) -> String {
        format!("in-memory factory {}", self.key)
    }
}

/// Resource handed out by [`InMemoryResourceFactory`]
#[derive(Debug)]
pub struct InMemoryResource {
    id: u64,
    shared: Arc<Shared>,
    pending: Vec<String>,
    savepoints: Vec<(Savepoint, usize)>,
    auto_commit: bool,
    read_only: bool,
    isolation: IsolationLevel,
    closed: bool,
}

impl InMemoryResource {
    fn ensure_open(&self) -> ResourceResult<()> {
        if self.closed {
            return Err(ResourceError::Closed);
        }
        Ok(())
    }

    fn record(&self, call: ResourceCall) {
        self.shared.record(self.id, call);
    }

    fn savepoint_index(&self, savepoint: &Savepoint) -> ResourceResult<usize> {
        self.savepoints
            .iter()
            .position(|(held, _)| held.id() == savepoint.id())
            .ok_or_else(|| ResourceError::failure(format!("unknown savepoint {}", savepoint.name())))
    }
}

impl Resource for InMemoryResource {
    fn execute(&mut self, statement: &str) -> ResourceResult<u64> {
        self.ensure_open()?;
        self.record(ResourceCall::Execute);
        if self.auto_commit {
            self.shared.committed.lock().push(statement.to_string());
        } else {
            self.pending.push(statement.to_string());
        }
        Ok(1)
    }

    fn commit(&mut self) -> ResourceResult<()> {
        self.ensure_open()?;
        self.record(ResourceCall::Commit);
        if self.shared.fail_commit.load(Ordering::Relaxed) {
            return Err(ResourceError::failure("commit refused"));
        }
        self.shared.committed.lock().append(&mut self.pending);
        self.savepoints.clear();
        Ok(())
    }

    fn rollback(&mut self) -> ResourceResult<()> {
        self.ensure_open()?;
        self.record(ResourceCall::Rollback);
        self.pending.clear();
        self.savepoints.clear();
        Ok(())
    }

    fn close(&mut self) -> ResourceResult<()> {
        if self.closed {
            return Ok(());
        }
        self.record(ResourceCall::Close);
        self.closed = true;
        self.pending.clear();
        self.shared.open.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn set_read_only(&mut self, read_only: bool) -> ResourceResult<()> {
        self.ensure_open()?;
        self.record(ResourceCall::SetReadOnly(read_only));
        self.read_only = read_only;
        Ok(())
    }

    fn is_read_only(&mut self) -> ResourceResult<bool> {
        self.ensure_open()?;
        Ok(self.read_only)
    }

    fn set_isolation_level(&mut self, level: IsolationLevel) -> ResourceResult<()> {
        self.ensure_open()?;
        self.record(ResourceCall::SetIsolation(level));
        self.isolation = level;
        Ok(())
    }

    fn isolation_level(&mut self) -> ResourceResult<IsolationLevel> {
        self.ensure_open()?;
        Ok(self.isolation)
    }

    fn set_auto_commit(&mut self, auto_commit: bool) -> ResourceResult<()> {
        self.ensure_open()?;
        self.record(ResourceCall::SetAutoCommit(auto_commit));
        if auto_commit && !self.auto_commit {
            self.shared.committed.lock().append(&mut self.pending);
        }
        self.auto_commit = auto_commit;
        Ok(())
    }

    fn auto_commit(&mut self) -> ResourceResult<bool> {
        self.ensure_open()?;
        Ok(self.auto_commit)
    }

    fn supports_savepoints(&mut self) -> bool {
        !self.closed
    }

    fn set_savepoint(&mut self, name: &str) -> ResourceResult<Savepoint> {
        self.ensure_open()?;
        self.record(ResourceCall::SetSavepoint);
        let savepoint = Savepoint::new(self.savepoints.len() as u64 + 1, name);
        self.savepoints.push((savepoint.clone(), self.pending.len()));
        Ok(savepoint)
    }

    fn rollback_to_savepoint(&mut self, savepoint: &Savepoint) -> ResourceResult<()> {
        self.ensure_open()?;
        self.record(ResourceCall::RollbackToSavepoint);
        let index = self.savepoint_index(savepoint)?;
        let mark = self.savepoints[index].1;
        self.pending.truncate(mark);
        self.savepoints.truncate(index + 1);
        Ok(())
    }

    fn release_savepoint(&mut self, savepoint: &Savepoint) -> ResourceResult<()> {
        self.ensure_open()?;
        self.record(ResourceCall::ReleaseSavepoint);
        let index = self.savepoint_index(savepoint)?;
        self.savepoints.truncate(index);
        Ok(())
    }
}
