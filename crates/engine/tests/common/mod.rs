//! Shared test utilities for the engine integration suites.
//!
//! Import via `mod common;`.

#![allow(dead_code)]

use demarc_concurrency::TransactionSynchronization;
use demarc_core::{CompletionStatus, Savepoint, TransactionDefinition, TransactionError, TxResult};
use demarc_engine::{ManagerConfig, TransactionBackend, TransactionManager, TransactionObject};
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

// ============================================================================
// Scripted backend
// ============================================================================

/// State shared between a [`ScriptedBackend`] and its transaction objects
#[derive(Debug, Default)]
pub struct ScriptedState {
    pub active: Option<u32>,
    pub next_id: u32,
    pub next_savepoint: u64,
    pub doomed: HashSet<u32>,
    pub journal: Vec<String>,
    pub savepoints: bool,
    pub fail_commit: bool,
    pub fail_begin: bool,
    pub last_timeout: Option<u32>,
}

pub type SharedState = Rc<RefCell<ScriptedState>>;

/// Transaction object of the scripted backend
#[derive(Debug)]
pub struct ScriptedTransaction {
    state: SharedState,
    pub id: Option<u32>,
}

impl TransactionObject for ScriptedTransaction {
    fn is_rollback_only(&self) -> TxResult<bool> {
        Ok(self
            .id
            .map(|id| self.state.borrow().doomed.contains(&id))
            .unwrap_or(false))
    }
}

/// Backend that records every primitive in a journal
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    state: SharedState,
}

impl ScriptedBackend {
    pub fn new() -> (Self, SharedState) {
        let backend = Self::default();
        let state = backend.state.clone();
        (backend, state)
    }

    pub fn with_savepoints() -> (Self, SharedState) {
        let (backend, state) = Self::new();
        state.borrow_mut().savepoints = true;
        (backend, state)
    }

    fn log(&self, entry: String) {
        self.state.borrow_mut().journal.push(entry);
    }

    fn id_of(transaction: &ScriptedTransaction) -> TxResult<u32> {
        transaction
            .id
            .ok_or_else(|| TransactionError::illegal_state("no scripted transaction"))
    }
}

impl TransactionBackend for ScriptedBackend {
    type Transaction = ScriptedTransaction;
    type Suspended = u32;

    fn name(&self) -> &str {
        "scripted"
    }

    fn do_get_transaction(&self) -> TxResult<ScriptedTransaction> {
        Ok(ScriptedTransaction {
            state: self.state.clone(),
            id: self.state.borrow().active,
        })
    }

    fn is_existing_transaction(&self, transaction: &ScriptedTransaction) -> TxResult<bool> {
        Ok(transaction.id.is_some())
    }

    fn do_begin(
        &self,
        transaction: &mut ScriptedTransaction,
        _definition: &TransactionDefinition,
        timeout_secs: Option<u32>,
    ) -> TxResult<()> {
        let mut state = self.state.borrow_mut();
        if state.fail_begin {
            return Err(TransactionError::cannot_create(
                "scripted begin failure",
                TransactionError::illegal_state("refused"),
            ));
        }
        state.next_id += 1;
        let id = state.next_id;
        state.active = Some(id);
        state.last_timeout = timeout_secs;
        state.journal.push(format!("begin {}", id));
        transaction.id = Some(id);
        Ok(())
    }

    fn do_commit(&self, transaction: &mut ScriptedTransaction) -> TxResult<()> {
        let id = Self::id_of(transaction)?;
        let mut state = self.state.borrow_mut();
        if state.fail_commit {
            state.journal.push(format!("commit-failed {}", id));
            return Err(TransactionError::system_message("scripted commit failure"));
        }
        state.journal.push(format!("commit {}", id));
        state.active = None;
        Ok(())
    }

    fn do_rollback(&self, transaction: &mut ScriptedTransaction) -> TxResult<()> {
        let id = Self::id_of(transaction)?;
        let mut state = self.state.borrow_mut();
        state.journal.push(format!("rollback {}", id));
        state.active = None;
        Ok(())
    }

    fn do_set_rollback_only(&self, transaction: &mut ScriptedTransaction) -> TxResult<()> {
        let id = Self::id_of(transaction)?;
        let mut state = self.state.borrow_mut();
        state.doomed.insert(id);
        state.journal.push(format!("doom {}", id));
        Ok(())
    }

    fn do_suspend(&self, transaction: &mut ScriptedTransaction) -> TxResult<u32> {
        let id = Self::id_of(transaction)?;
        transaction.id = None;
        let mut state = self.state.borrow_mut();
        state.active = None;
        state.journal.push(format!("suspend {}", id));
        Ok(id)
    }

    fn do_resume(&self, suspended: u32) -> TxResult<()> {
        let mut state = self.state.borrow_mut();
        state.active = Some(suspended);
        state.journal.push(format!("resume {}", suspended));
        Ok(())
    }

    fn supports_savepoints(&self, _transaction: &ScriptedTransaction) -> bool {
        self.state.borrow().savepoints
    }

    fn create_savepoint(&self, _transaction: &mut ScriptedTransaction) -> TxResult<Savepoint> {
        let mut state = self.state.borrow_mut();
        state.next_savepoint += 1;
        let savepoint = Savepoint::new(state.next_savepoint, format!("SP{}", state.next_savepoint));
        state.journal.push(format!("savepoint {}", savepoint.name()));
        Ok(savepoint)
    }

    fn rollback_to_savepoint(&self, _transaction: &mut ScriptedTransaction, savepoint: &Savepoint) -> TxResult<()> {
        self.log(format!("rollback to {}", savepoint.name()));
        Ok(())
    }

    fn release_savepoint(&self, _transaction: &mut ScriptedTransaction, savepoint: &Savepoint) -> TxResult<()> {
        self.log(format!("release {}", savepoint.name()));
        Ok(())
    }

    fn do_cleanup_after_completion(&self, transaction: &mut ScriptedTransaction) -> TxResult<()> {
        let id = Self::id_of(transaction)?;
        self.log(format!("cleanup {}", id));
        Ok(())
    }
}

pub type ScriptedManager = TransactionManager<ScriptedBackend>;

pub fn scripted_manager() -> (ScriptedManager, SharedState) {
    scripted_manager_with(ManagerConfig::default())
}

pub fn scripted_manager_with(config: ManagerConfig) -> (ScriptedManager, SharedState) {
    let (backend, state) = ScriptedBackend::new();
    (TransactionManager::with_config(backend, config), state)
}

pub fn journal(state: &SharedState) -> Vec<String> {
    state.borrow().journal.clone()
}

// ============================================================================
// Recording synchronization
// ============================================================================

pub type Events = Rc<RefCell<Vec<String>>>;

/// Callback that appends each hook invocation to a shared event list
pub struct RecordingSync {
    pub label: &'static str,
    pub order: i32,
    pub events: Events,
    pub fail_before_commit: bool,
    pub fail_before_completion: bool,
}

impl RecordingSync {
    pub fn new(label: &'static str, order: i32, events: &Events) -> Self {
        Self {
            label,
            order,
            events: events.clone(),
            fail_before_commit: false,
            fail_before_completion: false,
        }
    }

    pub fn failing_before_commit(mut self) -> Self {
        self.fail_before_commit = true;
        self
    }

    pub fn failing_before_completion(mut self) -> Self {
        self.fail_before_completion = true;
        self
    }

    fn push(&self, event: String) {
        self.events.borrow_mut().push(event);
    }
}

impl TransactionSynchronization for RecordingSync {
    fn order(&self) -> i32 {
        self.order
    }

    fn before_commit(&mut self, read_only: bool) -> TxResult<()> {
        self.push(format!("{}:before_commit:{}", self.label, read_only));
        if self.fail_before_commit {
            return Err(TransactionError::illegal_state("before_commit refused"));
        }
        Ok(())
    }

    fn before_completion(&mut self) -> TxResult<()> {
        self.push(format!("{}:before_completion", self.label));
        if self.fail_before_completion {
            return Err(TransactionError::illegal_state("before_completion refused"));
        }
        Ok(())
    }

    fn after_completion(&mut self, status: CompletionStatus) -> TxResult<()> {
        self.push(format!("{}:after_completion:{}", self.label, status));
        Ok(())
    }
}
