//! Transaction backend for a single resource factory
//!
//! Begins a transaction by binding a holder for the factory's key to the
//! current thread and switching the resource's auto-commit off. Code running
//! inside the transaction reaches the same resource through
//! [`ResourceUtils::get_resource`]. NESTED scopes use resource savepoints.

use crate::utils::ResourceUtils;
use demarc_concurrency::{share_resource, ResourceHolder, ResourceRegistry, SharedHolder, SharedResource};
use demarc_core::{
    IsolationLevel, ResourceFactory, ResourceKey, Savepoint, TransactionDefinition, TransactionError,
    TxResult,
};
use demarc_engine::{TransactionBackend, TransactionObject};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error};

/// Transaction state for one [`ResourceTransactionBackend`] scope
#[derive(Debug, Default)]
pub struct ResourceTransactionObject {
    holder: Option<SharedHolder>,
    new_holder: bool,
    previous_isolation: Option<IsolationLevel>,
    must_restore_auto_commit: bool,
    read_only: bool,
}

impl ResourceTransactionObject {
    /// The bound holder, if any
    pub fn holder(&self) -> Option<&SharedHolder> {
        self.holder.as_ref()
    }

    /// Whether this scope created (and will release) the holder
    pub fn is_new_holder(&self) -> bool {
        self.new_holder
    }

    fn resource(&self) -> TxResult<SharedResource> {
        self.holder
            .as_ref()
            .and_then(|holder| holder.borrow().resource())
            .ok_or_else(|| TransactionError::illegal_state("No resource bound to transaction object"))
    }
}

impl TransactionObject for ResourceTransactionObject {
    fn is_rollback_only(&self) -> TxResult<bool> {
        Ok(self
            .holder
            .as_ref()
            .map(|holder| holder.borrow().is_rollback_only())
            .unwrap_or(false))
    }
}

/// [`TransactionBackend`] that runs transactions on resources of one factory
pub struct ResourceTransactionBackend {
    factory: Arc<dyn ResourceFactory>,
}

impl ResourceTransactionBackend {
    /// Backend for `factory`
    pub fn new(factory: Arc<dyn ResourceFactory>) -> Self {
        Self { factory }
    }

    /// The factory transactions run against
    pub fn factory(&self) -> &Arc<dyn ResourceFactory> {
        &self.factory
    }

    fn key(&self) -> ResourceKey {
        self.factory.resource_key()
    }

    fn begin_on_holder(
        &self,
        transaction: &mut ResourceTransactionObject,
        definition: &TransactionDefinition,
        timeout_secs: Option<u32>,
    ) -> TxResult<()> {
        let reusable = transaction
            .holder
            .as_ref()
            .map(|holder| !holder.borrow().is_synchronized_with_transaction())
            .unwrap_or(false);
        if !reusable {
            let resource = share_resource(self.factory.acquire()?);
            debug!(target: "demarc::txn", factory = %self.factory.description(), "Acquired resource for transaction");
            transaction.holder = Some(ResourceHolder::new(resource).into_shared());
            transaction.new_holder = true;
        }

        let holder = transaction
            .holder
            .clone()
            .ok_or_else(|| TransactionError::illegal_state("No holder after acquisition"))?;
        holder.borrow_mut().set_synchronized_with_transaction(true);
        let resource = transaction.resource()?;

        transaction.previous_isolation = ResourceUtils::prepare_for_transaction(&resource, definition)?;
        transaction.read_only = definition.is_read_only();

        {
            let mut resource = resource.borrow_mut();
            if resource.auto_commit()? {
                transaction.must_restore_auto_commit = true;
                debug!(target: "demarc::txn", "Switching resource to manual commit");
                resource.set_auto_commit(false)?;
            }
        }

        {
            let mut holder = holder.borrow_mut();
            holder.set_transaction_active(true);
            if let Some(secs) = timeout_secs {
                holder.set_timeout_in_seconds(secs);
            }
        }

        if transaction.new_holder {
            ResourceRegistry::bind(self.key(), holder)?;
        }
        Ok(())
    }
}

impl TransactionBackend for ResourceTransactionBackend {
    type Transaction = ResourceTransactionObject;
    type Suspended = SharedHolder;

    fn name(&self) -> &str {
        "resource"
    }

    fn do_get_transaction(&self) -> TxResult<ResourceTransactionObject> {
        Ok(ResourceTransactionObject {
            holder: ResourceRegistry::get_resource(&self.key()),
            ..ResourceTransactionObject::default()
        })
    }

    fn is_existing_transaction(&self, transaction: &ResourceTransactionObject) -> TxResult<bool> {
        Ok(transaction
            .holder
            .as_ref()
            .map(|holder| holder.borrow().is_transaction_active())
            .unwrap_or(false))
    }

    fn do_begin(
        &self,
        transaction: &mut ResourceTransactionObject,
        definition: &TransactionDefinition,
        timeout_secs: Option<u32>,
    ) -> TxResult<()> {
        if let Err(e) = self.begin_on_holder(transaction, definition, timeout_secs) {
            if transaction.new_holder {
                if let Some(holder) = transaction.holder.take() {
                    if let Some(resource) = holder.borrow_mut().take_resource() {
                        ResourceUtils::close_resource(&resource);
                    }
                }
                transaction.new_holder = false;
            }
            return Err(TransactionError::cannot_create(
                "Could not open resource for transaction",
                e,
            ));
        }
        Ok(())
    }

    fn do_commit(&self, transaction: &mut ResourceTransactionObject) -> TxResult<()> {
        let resource = transaction.resource()?;
        debug!(target: "demarc::txn", "Committing resource transaction");
        let result = resource.borrow_mut().commit();
        result.map_err(|e| TransactionError::system("Could not commit resource transaction", e))
    }

    fn do_rollback(&self, transaction: &mut ResourceTransactionObject) -> TxResult<()> {
        let resource = transaction.resource()?;
        debug!(target: "demarc::txn", "Rolling back resource transaction");
        let result = resource.borrow_mut().rollback();
        result.map_err(|e| TransactionError::system("Could not roll back resource transaction", e))
    }

    fn do_set_rollback_only(&self, transaction: &mut ResourceTransactionObject) -> TxResult<()> {
        let holder = transaction
            .holder
            .as_ref()
            .ok_or_else(|| TransactionError::illegal_state("No holder to mark rollback-only"))?;
        debug!(target: "demarc::txn", "Setting resource transaction rollback-only");
        holder.borrow_mut().set_rollback_only();
        Ok(())
    }

    fn do_suspend(&self, transaction: &mut ResourceTransactionObject) -> TxResult<SharedHolder> {
        transaction.holder = None;
        ResourceRegistry::unbind(&self.key())
    }

    fn do_resume(&self, suspended: SharedHolder) -> TxResult<()> {
        ResourceRegistry::bind(self.key(), suspended)
    }

    fn supports_savepoints(&self, transaction: &ResourceTransactionObject) -> bool {
        transaction
            .resource()
            .map(|resource| resource.borrow_mut().supports_savepoints())
            .unwrap_or(false)
    }

    fn create_savepoint(&self, transaction: &mut ResourceTransactionObject) -> TxResult<Savepoint> {
        let name = transaction
            .holder
            .as_ref()
            .map(|holder| holder.borrow_mut().next_savepoint_name())
            .ok_or_else(|| TransactionError::illegal_state("No holder to create a savepoint on"))?;
        let resource = transaction.resource()?;
        let result = resource.borrow_mut().set_savepoint(&name);
        result.map_err(|e| TransactionError::cannot_create("Could not create resource savepoint", e))
    }

    fn rollback_to_savepoint(
        &self,
        transaction: &mut ResourceTransactionObject,
        savepoint: &Savepoint,
    ) -> TxResult<()> {
        let resource = transaction.resource()?;
        let result = resource.borrow_mut().rollback_to_savepoint(savepoint);
        result.map_err(|e| TransactionError::system("Could not roll back to resource savepoint", e))?;
        if let Some(holder) = &transaction.holder {
            holder.borrow_mut().reset_rollback_only();
        }
        Ok(())
    }

    fn release_savepoint(&self, transaction: &mut ResourceTransactionObject, savepoint: &Savepoint) -> TxResult<()> {
        let resource = transaction.resource()?;
        let result = resource.borrow_mut().release_savepoint(savepoint);
        if let Err(e) = result {
            debug!(target: "demarc::txn", savepoint = savepoint.name(), error = %e, "Could not explicitly release resource savepoint");
        }
        Ok(())
    }

    fn do_cleanup_after_completion(&self, transaction: &mut ResourceTransactionObject) -> TxResult<()> {
        if transaction.new_holder {
            ResourceRegistry::unbind_if_possible(&self.key());
        }

        let Some(holder) = transaction.holder.clone() else {
            return Ok(());
        };
        let resource = holder.borrow().resource();
        if let Some(resource) = resource {
            if transaction.must_restore_auto_commit {
                let restored = resource.borrow_mut().set_auto_commit(true);
                if let Err(e) = restored {
                    error!(target: "demarc::txn", error = %e, "Could not restore auto-commit after transaction");
                }
            }
            ResourceUtils::reset_after_transaction(&resource, transaction.previous_isolation, transaction.read_only);
            if transaction.new_holder {
                debug!(target: "demarc::txn", "Releasing resource after transaction");
                holder.borrow_mut().set_resource(None);
                ResourceUtils::close_resource(&resource);
            }
        }
        holder.borrow_mut().clear();
        Ok(())
    }
}

impl fmt::Debug for ResourceTransactionBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceTransactionBackend")
            .field("factory", &self.factory.description())
            .finish()
    }
}
