//! Around-wrapper that runs a unit of work inside a transaction
//!
//! [`TransactionInterceptor::invoke`] resolves the definition for an
//! operation, obtains a status from the manager, runs the closure and then
//! completes the status:
//!
//! - `Ok` return: commit; a commit failure is the error the caller sees
//! - `Err` return: roll back if the definition's rollback rule matches,
//!   otherwise commit; the closure's own error is always returned unchanged
//! - panic: roll back, then continue unwinding
//!
//! Only the call that owns the transactional scope completes it on failure.
//! A call owns its scope when no outer wrapper is active on the thread, or
//! when its status carries completion duties of its own (a new transaction,
//! new synchronization, a savepoint, or a suspended outer scope). A nested
//! participant that fails leaves the decision to its owner.

use crate::attributes::{operation_key, TransactionAttributeSource};
use crate::manager::PlatformTransactionManager;
use crate::status::TransactionExecution;
use demarc_core::{TransactionDefinition, TransactionError};
use std::cell::{Cell, RefCell};
use std::error::Error as StdError;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, error, warn};

thread_local! {
    /// Set by the outermost wrapper on this thread
    static OUTER_WRAPPER_ACTIVE: Cell<bool> = Cell::new(false);

    /// Names of the wrapped calls in progress, innermost last
    static TRANSACTION_INFO: RefCell<Vec<Option<String>>> = RefCell::new(Vec::new());
}

/// Sets the outer-wrapper flag if nobody has, and clears it only if it did
struct OwnershipGuard {
    set_here: bool,
}

impl OwnershipGuard {
    fn acquire() -> Self {
        let already_set = OUTER_WRAPPER_ACTIVE.with(|flag| flag.replace(true));
        Self {
            set_here: !already_set,
        }
    }

    fn outer_present(&self) -> bool {
        !self.set_here
    }
}

impl Drop for OwnershipGuard {
    fn drop(&mut self) {
        if self.set_here {
            OUTER_WRAPPER_ACTIVE.with(|flag| flag.set(false));
        }
    }
}

/// Keeps the per-thread info stack in step with wrapped calls
struct TransactionInfoGuard;

impl TransactionInfoGuard {
    fn push(name: Option<String>) -> Self {
        TRANSACTION_INFO.with(|stack| stack.borrow_mut().push(name));
        TransactionInfoGuard
    }
}

impl Drop for TransactionInfoGuard {
    fn drop(&mut self) {
        do_finally();
    }
}

fn do_finally() {
    TRANSACTION_INFO.with(|stack| {
        stack.borrow_mut().pop();
    });
}

/// Wraps units of work with transaction demarcation
pub struct TransactionInterceptor<M: PlatformTransactionManager> {
    manager: M,
    attribute_source: Box<dyn TransactionAttributeSource + Send + Sync>,
}

impl<M: PlatformTransactionManager> TransactionInterceptor<M> {
    /// Create an interceptor
    pub fn new<S>(manager: M, attribute_source: S) -> Self
    where
        S: TransactionAttributeSource + Send + Sync + 'static,
    {
        Self {
            manager,
            attribute_source: Box::new(attribute_source),
        }
    }

    /// The transaction manager
    pub fn manager(&self) -> &M {
        &self.manager
    }

    /// Name of the innermost wrapped call running on this thread
    pub fn current_transaction_name() -> Option<String> {
        TRANSACTION_INFO.with(|stack| stack.borrow().last().cloned().flatten())
    }

    /// Depth of wrapped calls running on this thread
    pub fn invocation_depth() -> usize {
        TRANSACTION_INFO.with(|stack| stack.borrow().len())
    }

    /// Whether an outermost wrapper is active on this thread
    pub fn is_outer_wrapper_active() -> bool {
        OUTER_WRAPPER_ACTIVE.with(Cell::get)
    }

    /// Definition that applies to an operation
    ///
    /// Falls back to the no-transaction definition; an unnamed definition is
    /// named after the operation.
    pub fn resolve_definition(&self, type_name: &str, operation: &str) -> TransactionDefinition {
        match self.attribute_source.transaction_attribute(type_name, operation) {
            Some(definition) if definition.name().is_none() => {
                definition.with_name(operation_key(type_name, operation))
            }
            Some(definition) => definition,
            None => TransactionDefinition::no_transaction(),
        }
    }

    /// Run `work` as `operation` of `type_name` with the resolved definition
    pub fn invoke<R, E, F>(&self, type_name: &str, operation: &str, work: F) -> Result<R, E>
    where
        F: FnOnce(&mut M::Status) -> Result<R, E>,
        E: From<TransactionError> + StdError + 'static,
    {
        let definition = self.resolve_definition(type_name, operation);
        self.invoke_with(&definition, work)
    }

    /// Run `work` with an explicit definition
    pub fn invoke_with<R, E, F>(&self, definition: &TransactionDefinition, work: F) -> Result<R, E>
    where
        F: FnOnce(&mut M::Status) -> Result<R, E>,
        E: From<TransactionError> + StdError + 'static,
    {
        let mut status = self.manager.get_transaction(definition).map_err(E::from)?;

        // The guards stay alive through failure completion; a successful
        // call releases them before committing.
        let ownership = OwnershipGuard::acquire();
        let info = TransactionInfoGuard::push(definition.name().map(str::to_owned));
        let owner = !ownership.outer_present() || status.has_completion_duties();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(&mut status)));

        match outcome {
            Ok(Ok(value)) => {
                drop(info);
                drop(ownership);
                self.manager.commit(status).map_err(E::from)?;
                Ok(value)
            }
            Ok(Err(err)) => {
                self.complete_after_failure(status, definition, &err, owner);
                Err(err)
            }
            Err(payload) => {
                if owner {
                    warn!(target: "demarc::txn", name = ?definition.name(), "Rolling back transaction after panic");
                    if let Err(e) = self.manager.rollback(status) {
                        error!(target: "demarc::txn", error = %e, "Rollback after panic failed");
                    }
                }
                panic::resume_unwind(payload)
            }
        }
    }

    fn complete_after_failure<E>(
        &self,
        status: M::Status,
        definition: &TransactionDefinition,
        err: &E,
        owner: bool,
    ) where
        E: StdError + 'static,
    {
        if !owner {
            debug!(
                target: "demarc::txn",
                name = ?definition.name(),
                error = %err,
                "Participating call failed; completion left to the owning wrapper"
            );
            return;
        }

        if definition.rollback_on(err) {
            warn!(target: "demarc::txn", name = ?definition.name(), error = %err, "Rolling back transaction");
            if let Err(e) = self.manager.rollback(status) {
                error!(
                    target: "demarc::txn",
                    name = ?definition.name(),
                    error = %e,
                    "Application error overridden by rollback error"
                );
            }
        } else {
            debug!(
                target: "demarc::txn",
                name = ?definition.name(),
                error = %err,
                "Error does not match rollback rule; committing"
            );
            if let Err(e) = self.manager.commit(status) {
                error!(
                    target: "demarc::txn",
                    name = ?definition.name(),
                    error = %e,
                    "Application error overridden by commit error"
                );
            }
        }
    }
}

impl<M: PlatformTransactionManager + fmt::Debug> fmt::Debug for TransactionInterceptor<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionInterceptor")
            .field("manager", &self.manager)
            .finish()
    }
}
