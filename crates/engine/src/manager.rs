//! Propagation-aware transaction manager
//!
//! [`TransactionManager`] implements the propagation table once, on top of
//! any [`TransactionBackend`]:
//!
//! | Propagation   | No existing transaction | Existing transaction          |
//! |---------------|-------------------------|-------------------------------|
//! | REQUIRED      | begin                   | join                          |
//! | SUPPORTS      | run without             | join                          |
//! | MANDATORY     | IllegalTransactionState | join                          |
//! | REQUIRES_NEW  | begin                   | suspend, begin                |
//! | NOT_SUPPORTED | run without             | suspend, run without          |
//! | NEVER         | run without             | IllegalTransactionState       |
//! | NESTED        | begin                   | savepoint, else join          |
//!
//! Completion drives the synchronization callbacks of scopes that activated
//! them, performs the backend commit or rollback for scopes that began a
//! transaction, and finally resumes whatever the scope suspended. Cleanup
//! failures are logged and never replace the primary outcome.

use crate::backend::TransactionBackend;
use crate::config::{ManagerConfig, SynchronizationMode};
use crate::metrics::{TransactionCounters, TransactionMetrics};
use crate::status::{SuspendedResources, TransactionExecution, TransactionStatus};
use demarc_concurrency::{
    invoke_after_completion, trigger_before_commit, trigger_before_completion,
    SynchronizationManager, Synchronizations,
};
use demarc_core::{
    CompletionStatus, Propagation, TransactionDefinition, TransactionError, TxResult,
};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Strategy that demarcates transactions
///
/// `commit` and `rollback` consume the status, so each unit of work is
/// completed exactly once.
pub trait PlatformTransactionManager {
    /// Status type handed out by `get_transaction`
    type Status: TransactionExecution;

    /// Return a status for the requested definition, beginning, joining or
    /// suspending according to its propagation
    fn get_transaction(&self, definition: &TransactionDefinition) -> TxResult<Self::Status>;

    /// Commit the unit of work, or roll it back if it was marked rollback-only
    fn commit(&self, status: Self::Status) -> TxResult<()>;

    /// Roll back the unit of work
    fn rollback(&self, status: Self::Status) -> TxResult<()>;
}

impl<M: PlatformTransactionManager + ?Sized> PlatformTransactionManager for Arc<M> {
    type Status = M::Status;

    fn get_transaction(&self, definition: &TransactionDefinition) -> TxResult<Self::Status> {
        (**self).get_transaction(definition)
    }

    fn commit(&self, status: Self::Status) -> TxResult<()> {
        (**self).commit(status)
    }

    fn rollback(&self, status: Self::Status) -> TxResult<()> {
        (**self).rollback(status)
    }
}

/// Generic transaction manager over a backend
pub struct TransactionManager<B: TransactionBackend> {
    backend: B,
    config: ManagerConfig,
    counters: TransactionCounters,
}

impl<B: TransactionBackend> TransactionManager<B> {
    /// Create a manager with the default configuration
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, ManagerConfig::default())
    }

    /// Create a manager with an explicit configuration
    pub fn with_config(backend: B, config: ManagerConfig) -> Self {
        Self {
            backend,
            config,
            counters: TransactionCounters::new(),
        }
    }

    /// The backend
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The configuration
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Snapshot of the lifecycle counters
    pub fn metrics(&self) -> TransactionMetrics {
        self.counters.snapshot()
    }

    // ========================================================================
    // Starting
    // ========================================================================

    fn begin_or_join(&self, definition: &TransactionDefinition) -> TxResult<TransactionStatus<B>> {
        let transaction = self.backend.do_get_transaction()?;
        if self.backend.is_existing_transaction(&transaction)? {
            return self.handle_existing_transaction(definition, transaction);
        }

        match definition.propagation() {
            Propagation::Mandatory => Err(TransactionError::illegal_transaction_state(
                "No existing transaction found for transaction marked with propagation 'mandatory'",
            )),
            Propagation::Required | Propagation::RequiresNew | Propagation::Nested => {
                let suspended = self.suspend(None)?;
                debug!(
                    target: "demarc::txn",
                    name = ?definition.name(),
                    definition = %definition,
                    "Creating new transaction"
                );
                self.start_transaction(definition, transaction, suspended)
            }
            Propagation::Supports | Propagation::NotSupported | Propagation::Never => {
                if definition.isolation().is_specific() {
                    warn!(
                        target: "demarc::txn",
                        definition = %definition,
                        "Custom isolation level specified but no actual transaction initiated; \
                         isolation level will effectively be ignored"
                    );
                }
                let synchronize = self.config.synchronization == SynchronizationMode::Always;
                self.prepare_status(definition, None, true, synchronize, None)
            }
        }
    }

    fn handle_existing_transaction(
        &self,
        definition: &TransactionDefinition,
        mut transaction: B::Transaction,
    ) -> TxResult<TransactionStatus<B>> {
        match definition.propagation() {
            Propagation::Never => {
                return Err(TransactionError::illegal_transaction_state(
                    "Existing transaction found for transaction marked with propagation 'never'",
                ));
            }
            Propagation::NotSupported => {
                debug!(target: "demarc::txn", name = ?definition.name(), "Suspending current transaction");
                let suspended = self.suspend(Some(&mut transaction))?;
                let synchronize = self.config.synchronization == SynchronizationMode::Always;
                return self.prepare_status(definition, None, false, synchronize, suspended);
            }
            Propagation::RequiresNew => {
                debug!(
                    target: "demarc::txn",
                    name = ?definition.name(),
                    "Suspending current transaction, creating new transaction"
                );
                let suspended = self.suspend(Some(&mut transaction))?;
                return self.start_transaction(definition, transaction, suspended);
            }
            Propagation::Nested => {
                if !self.config.nested_transaction_allowed {
                    return Err(TransactionError::NestedTransactionNotSupported(
                        "Transaction manager does not allow nested transactions - \
                         set 'nested_transaction_allowed' to true"
                            .to_string(),
                    ));
                }
                if self.backend.use_savepoint_for_nested() && self.backend.supports_savepoints(&transaction) {
                    debug!(target: "demarc::txn", name = ?definition.name(), "Creating nested transaction");
                    let savepoint = self.backend.create_savepoint(&mut transaction)?;
                    let mut status = self.prepare_status(definition, Some(transaction), false, false, None)?;
                    status.savepoint = Some(savepoint);
                    return Ok(status);
                }
                debug!(
                    target: "demarc::txn",
                    name = ?definition.name(),
                    "Savepoints unavailable, nested scope participates in existing transaction"
                );
            }
            Propagation::Required | Propagation::Supports | Propagation::Mandatory => {}
        }

        if self.config.validate_existing_transaction {
            validate_participation(definition)?;
        }
        debug!(target: "demarc::txn", name = ?definition.name(), "Participating in existing transaction");
        let synchronize = self.config.synchronization != SynchronizationMode::Never;
        self.prepare_status(definition, Some(transaction), false, synchronize, None)
    }

    fn start_transaction(
        &self,
        definition: &TransactionDefinition,
        mut transaction: B::Transaction,
        suspended: Option<SuspendedResources<B::Suspended>>,
    ) -> TxResult<TransactionStatus<B>> {
        let timeout = definition.timeout_secs().or(self.config.default_timeout_secs);
        if let Err(e) = self.backend.do_begin(&mut transaction, definition, timeout) {
            self.resume_after_begin_failure(suspended);
            return Err(e);
        }
        self.counters.record_start();
        let synchronize = self.config.synchronization != SynchronizationMode::Never;
        self.prepare_status(definition, Some(transaction), true, synchronize, suspended)
    }

    fn prepare_status(
        &self,
        definition: &TransactionDefinition,
        transaction: Option<B::Transaction>,
        new_transaction: bool,
        synchronize: bool,
        suspended: Option<SuspendedResources<B::Suspended>>,
    ) -> TxResult<TransactionStatus<B>> {
        let new_synchronization = synchronize && !SynchronizationManager::is_synchronization_active();
        let status = TransactionStatus::new(
            transaction,
            new_transaction,
            new_synchronization,
            definition.is_read_only(),
            definition.name().map(str::to_owned),
            suspended,
        );
        if new_synchronization {
            SynchronizationManager::set_actual_transaction_active(status.has_transaction());
            SynchronizationManager::set_current_transaction_isolation_level(
                definition
                    .isolation()
                    .is_specific()
                    .then_some(definition.isolation()),
            );
            SynchronizationManager::set_current_transaction_read_only(definition.is_read_only());
            SynchronizationManager::set_current_transaction_name(status.name.clone());
            SynchronizationManager::init_synchronization()?;
        }
        Ok(status)
    }

    // ========================================================================
    // Suspend / resume
    // ========================================================================

    fn suspend(
        &self,
        transaction: Option<&mut B::Transaction>,
    ) -> TxResult<Option<SuspendedResources<B::Suspended>>> {
        if transaction.is_none() && !SynchronizationManager::is_synchronization_active() {
            return Ok(None);
        }
        let suspended = match transaction {
            Some(transaction) => Some(self.backend.do_suspend(transaction)?),
            None => None,
        };
        let context = SynchronizationManager::suspend();
        Ok(Some(SuspendedResources { suspended, context }))
    }

    fn resume(&self, resources: SuspendedResources<B::Suspended>) -> TxResult<()> {
        let SuspendedResources { suspended, context } = resources;
        let mut first_error = SynchronizationManager::resume(context).err();
        if let Some(suspended) = suspended {
            if let Err(e) = self.backend.do_resume(suspended) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn resume_after_begin_failure(&self, suspended: Option<SuspendedResources<B::Suspended>>) {
        if let Some(suspended) = suspended {
            if let Err(e) = self.resume(suspended) {
                error!(
                    target: "demarc::txn",
                    error = %e,
                    "Inner transaction begin failure overridden by outer transaction resume failure"
                );
            }
        }
    }

    // ========================================================================
    // Completion
    // ========================================================================

    fn process_commit(&self, mut status: TransactionStatus<B>) -> TxResult<()> {
        let mut synchronizations = take_synchronizations(&status);

        if let Err(e) = trigger_before_commit(&mut synchronizations, status.read_only) {
            warn!(target: "demarc::txn", name = ?status.name, error = %e, "before_commit callback failed; rolling back");
            if let Err(completion) = trigger_before_completion(&mut synchronizations) {
                debug!(target: "demarc::txn", error = %completion, "before_completion also failed");
            }
            self.rollback_after_commit_failure(&mut status, &mut synchronizations);
            self.cleanup_after_completion(status);
            return Err(e);
        }

        if let Err(e) = trigger_before_completion(&mut synchronizations) {
            warn!(target: "demarc::txn", name = ?status.name, error = %e, "before_completion callback failed; rolling back");
            self.rollback_after_commit_failure(&mut status, &mut synchronizations);
            self.cleanup_after_completion(status);
            return Err(e);
        }

        match self.commit_action(&mut status) {
            Ok(()) => {
                invoke_after_completion(&mut synchronizations, CompletionStatus::Committed);
                self.cleanup_after_completion(status);
                Ok(())
            }
            Err(e) => {
                if e.is_unexpected_rollback() {
                    self.counters.record_rollback();
                    self.counters.record_unexpected_rollback();
                    invoke_after_completion(&mut synchronizations, CompletionStatus::RolledBack);
                } else if self.config.rollback_on_commit_failure && status.is_new_transaction() {
                    self.rollback_after_commit_failure(&mut status, &mut synchronizations);
                } else {
                    if status.is_new_transaction() {
                        self.counters.record_failure();
                    }
                    invoke_after_completion(&mut synchronizations, CompletionStatus::Unknown);
                }
                self.cleanup_after_completion(status);
                Err(e)
            }
        }
    }

    fn commit_action(&self, status: &mut TransactionStatus<B>) -> TxResult<()> {
        if let Some(savepoint) = status.savepoint.take() {
            debug!(target: "demarc::txn", name = ?status.name, savepoint = savepoint.name(), "Releasing transaction savepoint");
            if let Some(transaction) = status.transaction.as_mut() {
                self.backend.release_savepoint(transaction, &savepoint)?;
            }
        } else if status.is_new_transaction() {
            debug!(target: "demarc::txn", name = ?status.name, "Initiating transaction commit");
            if let Some(transaction) = status.transaction.as_mut() {
                self.backend.do_commit(transaction)?;
            }
            self.counters.record_commit();
        }
        Ok(())
    }

    fn process_rollback(&self, mut status: TransactionStatus<B>, unexpected: bool) -> TxResult<()> {
        let mut synchronizations = take_synchronizations(&status);
        if let Err(e) = trigger_before_completion(&mut synchronizations) {
            debug!(target: "demarc::txn", error = %e, "before_completion failed during rollback");
        }

        if let Err(e) = self.rollback_action(&mut status) {
            invoke_after_completion(&mut synchronizations, CompletionStatus::Unknown);
            self.cleanup_after_completion(status);
            return Err(e);
        }
        invoke_after_completion(&mut synchronizations, CompletionStatus::RolledBack);
        self.cleanup_after_completion(status);

        if unexpected {
            self.counters.record_unexpected_rollback();
            return Err(TransactionError::unexpected_rollback(
                "Transaction rolled back because it has been marked as rollback-only",
            ));
        }
        Ok(())
    }

    fn rollback_action(&self, status: &mut TransactionStatus<B>) -> TxResult<()> {
        if let Some(savepoint) = status.savepoint.take() {
            debug!(target: "demarc::txn", name = ?status.name, savepoint = savepoint.name(), "Rolling back transaction to savepoint");
            if let Some(transaction) = status.transaction.as_mut() {
                self.backend.rollback_to_savepoint(transaction, &savepoint)?;
                self.backend.release_savepoint(transaction, &savepoint)?;
            }
            return Ok(());
        }

        if status.is_new_transaction() {
            debug!(target: "demarc::txn", name = ?status.name, "Initiating transaction rollback");
            if let Some(transaction) = status.transaction.as_mut() {
                if let Err(e) = self.backend.do_rollback(transaction) {
                    self.counters.record_failure();
                    return Err(e);
                }
            }
            self.counters.record_rollback();
            return Ok(());
        }

        let local_rollback_only = status.local_rollback_only;
        match status.transaction.as_mut() {
            Some(transaction) => {
                if local_rollback_only || self.config.global_rollback_on_participation_failure {
                    debug!(
                        target: "demarc::txn",
                        name = ?status.name,
                        "Participating transaction failed - marking existing transaction as rollback-only"
                    );
                    self.backend.do_set_rollback_only(transaction)?;
                } else {
                    debug!(
                        target: "demarc::txn",
                        name = ?status.name,
                        "Participating transaction failed - letting transaction originator decide on rollback"
                    );
                }
            }
            None => {
                debug!(target: "demarc::txn", name = ?status.name, "Should roll back transaction but cannot - no transaction available");
            }
        }
        Ok(())
    }

    fn rollback_after_commit_failure(
        &self,
        status: &mut TransactionStatus<B>,
        synchronizations: &mut Synchronizations,
    ) {
        match self.rollback_action(status) {
            Ok(()) => invoke_after_completion(synchronizations, CompletionStatus::RolledBack),
            Err(e) => {
                error!(
                    target: "demarc::txn",
                    name = ?status.name,
                    error = %e,
                    "Commit failure overridden by rollback failure"
                );
                invoke_after_completion(synchronizations, CompletionStatus::Unknown);
            }
        }
    }

    fn cleanup_after_completion(&self, mut status: TransactionStatus<B>) {
        if status.new_synchronization {
            SynchronizationManager::clear();
        }
        if status.is_new_transaction() {
            if let Some(transaction) = status.transaction.as_mut() {
                if let Err(e) = self.backend.do_cleanup_after_completion(transaction) {
                    error!(target: "demarc::txn", name = ?status.name, error = %e, "Cleanup after transaction failed");
                }
            }
        }
        if let Some(suspended) = status.suspended.take() {
            debug!(target: "demarc::txn", name = ?status.name, "Resuming suspended transaction after completion of inner transaction");
            if let Err(e) = self.resume(suspended) {
                error!(target: "demarc::txn", name = ?status.name, error = %e, "Resuming suspended transaction failed");
            }
        }
    }
}

impl<B: TransactionBackend> PlatformTransactionManager for TransactionManager<B> {
    type Status = TransactionStatus<B>;

    fn get_transaction(&self, definition: &TransactionDefinition) -> TxResult<Self::Status> {
        self.begin_or_join(definition)
    }

    fn commit(&self, status: Self::Status) -> TxResult<()> {
        if status.is_local_rollback_only() {
            debug!(target: "demarc::txn", name = ?status.name, "Transactional code has requested rollback");
            return self.process_rollback(status, true);
        }
        match status.is_global_rollback_only() {
            Ok(false) => self.process_commit(status),
            Ok(true) => {
                debug!(
                    target: "demarc::txn",
                    name = ?status.name,
                    "Global transaction is marked as rollback-only but transactional code requested commit"
                );
                self.process_rollback(status, true)
            }
            Err(e) => {
                error!(target: "demarc::txn", name = ?status.name, error = %e, "Could not determine rollback-only state; rolling back");
                if let Err(rollback) = self.process_rollback(status, false) {
                    error!(target: "demarc::txn", error = %rollback, "Rollback after state check failure also failed");
                }
                Err(e)
            }
        }
    }

    fn rollback(&self, status: Self::Status) -> TxResult<()> {
        self.process_rollback(status, false)
    }
}

impl<B: TransactionBackend> fmt::Debug for TransactionManager<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("backend", &self.backend.name())
            .field("config", &self.config)
            .finish()
    }
}

fn take_synchronizations<B: TransactionBackend>(status: &TransactionStatus<B>) -> Synchronizations {
    if !status.new_synchronization {
        return Vec::new();
    }
    SynchronizationManager::drain_synchronizations().unwrap_or_else(|e| {
        debug!(target: "demarc::txn", error = %e, "No synchronizations to drain");
        Vec::new()
    })
}

fn validate_participation(definition: &TransactionDefinition) -> TxResult<()> {
    if definition.isolation().is_specific() {
        let current = SynchronizationManager::current_transaction_isolation_level();
        if current != Some(definition.isolation()) {
            let current = current
                .map(|level| level.to_string())
                .unwrap_or_else(|| "(unknown)".to_string());
            return Err(TransactionError::illegal_transaction_state(format!(
                "Participating transaction with definition [{}] specifies isolation level which is \
                 incompatible with existing transaction: {}",
                definition, current
            )));
        }
    }
    Ok(())
}
