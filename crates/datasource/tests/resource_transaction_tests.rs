//! Resource-backed transaction tests
//!
//! Runs the transaction manager over ResourceTransactionBackend and checks
//! what reaches the resource through the in-memory factory's journal.

mod common;

use common::*;
use demarc_concurrency::{ResourceRegistry, SynchronizationManager};
use demarc_core::{IsolationLevel, Propagation, ResourceFactory, TransactionDefinition, TransactionError};
use demarc_datasource::testing::{InMemoryResourceFactory, ResourceCall};
use demarc_datasource::ResourceUtils;
use demarc_engine::{ManagerConfig, PlatformTransactionManager, TransactionExecution};
use proptest::prelude::*;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

fn def(propagation: Propagation) -> TransactionDefinition {
    TransactionDefinition::with(propagation)
}

// ============================================================================
// Commit and rollback
// ============================================================================

#[test]
fn test_required_commit_reaches_resource() {
    let factory = InMemoryResourceFactory::new();
    let manager = manager_for(&factory);

    let status = manager.get_transaction(&def(Propagation::Required)).unwrap();
    run_statement(&factory, "insert 1").unwrap();
    run_statement(&factory, "insert 2").unwrap();
    assert!(factory.committed().is_empty());
    manager.commit(status).unwrap();

    assert_eq!(factory.committed(), vec!["insert 1", "insert 2"]);
    assert_eq!(
        factory.calls(),
        vec![
            ResourceCall::Acquire,
            ResourceCall::SetAutoCommit(false),
            ResourceCall::Execute,
            ResourceCall::Execute,
            ResourceCall::Commit,
            ResourceCall::SetAutoCommit(true),
            ResourceCall::Close,
        ]
    );
    assert_eq!(ResourceRegistry::bound_count(), 0);
    assert!(!SynchronizationManager::is_synchronization_active());
}

#[test]
fn test_rollback_discards_work() {
    let factory = InMemoryResourceFactory::new();
    let manager = manager_for(&factory);

    let status = manager.get_transaction(&def(Propagation::Required)).unwrap();
    run_statement(&factory, "insert 1").unwrap();
    manager.rollback(status).unwrap();

    assert!(factory.committed().is_empty());
    assert_eq!(factory.count(ResourceCall::Rollback), 1);
    assert_eq!(factory.count(ResourceCall::Commit), 0);
    assert_eq!(factory.open_count(), 0);
}

#[test]
fn test_rollback_only_commit_rolls_back() {
    let factory = InMemoryResourceFactory::new();
    let manager = manager_for(&factory);

    let outer = manager.get_transaction(&def(Propagation::Required)).unwrap();
    run_statement(&factory, "insert 1").unwrap();
    let inner = manager.get_transaction(&def(Propagation::Required)).unwrap();
    manager.rollback(inner).unwrap();

    let result = manager.commit(outer);
    assert!(matches!(result, Err(TransactionError::UnexpectedRollback(_))));
    assert_eq!(factory.count(ResourceCall::Commit), 0);
    assert_eq!(factory.count(ResourceCall::Rollback), 1);
    assert!(factory.committed().is_empty());
}

#[test]
fn test_commit_failure_is_system_error_and_releases() {
    let factory = InMemoryResourceFactory::new();
    let manager = manager_for(&factory);

    let status = manager.get_transaction(&def(Propagation::Required)).unwrap();
    run_statement(&factory, "insert 1").unwrap();
    factory.set_fail_commit(true);

    let result = manager.commit(status);
    match result {
        Err(TransactionError::TransactionSystem { source, .. }) => assert!(source.is_some()),
        other => panic!("expected system error, got {:?}", other),
    }
    assert_eq!(factory.open_count(), 0);
    assert_eq!(ResourceRegistry::bound_count(), 0);
    assert!(!SynchronizationManager::is_synchronization_active());
}

#[test]
fn test_acquire_failure_cannot_create() {
    let factory = InMemoryResourceFactory::new();
    let manager = manager_for(&factory);
    factory.set_fail_acquire(true);

    let result = manager.get_transaction(&def(Propagation::Required));
    assert!(matches!(result, Err(TransactionError::CannotCreateTransaction { .. })));
    assert_eq!(ResourceRegistry::bound_count(), 0);
    assert!(!SynchronizationManager::is_synchronization_active());
}

// ============================================================================
// Propagation over a real resource
// ============================================================================

#[test]
fn test_participants_share_the_transaction_resource() {
    let factory = InMemoryResourceFactory::new();
    let manager = manager_for(&factory);

    let outer = manager.get_transaction(&def(Propagation::Required)).unwrap();
    let outer_resource = ResourceUtils::get_resource(&factory).unwrap();
    assert!(ResourceUtils::is_resource_transactional(&outer_resource, &factory));

    let inner = manager.get_transaction(&def(Propagation::Mandatory)).unwrap();
    let inner_resource = ResourceUtils::get_resource(&factory).unwrap();
    assert!(Rc::ptr_eq(&outer_resource, &inner_resource));
    ResourceUtils::release_resource(Some(&inner_resource), &factory);
    manager.commit(inner).unwrap();

    ResourceUtils::release_resource(Some(&outer_resource), &factory);
    manager.commit(outer).unwrap();
    assert_eq!(factory.acquire_count(), 1);
}

#[test]
fn test_requires_new_hides_and_restores_outer_holder() {
    let factory = InMemoryResourceFactory::new();
    let manager = manager_for(&factory);
    let key = factory.resource_key();

    let outer = manager.get_transaction(&def(Propagation::Required)).unwrap();
    run_statement(&factory, "outer").unwrap();
    let outer_holder = ResourceRegistry::get_resource(&key).unwrap();

    let inner = manager.get_transaction(&def(Propagation::RequiresNew)).unwrap();
    let inner_holder = ResourceRegistry::get_resource(&key).unwrap();
    assert!(!Rc::ptr_eq(&outer_holder, &inner_holder));
    assert_eq!(ResourceRegistry::bound_count(), 1);
    run_statement(&factory, "inner").unwrap();
    manager.commit(inner).unwrap();

    let restored = ResourceRegistry::get_resource(&key).unwrap();
    assert!(Rc::ptr_eq(&outer_holder, &restored));
    assert!(restored.borrow().is_transaction_active());
    assert_eq!(factory.committed(), vec!["inner"]);

    manager.commit(outer).unwrap();
    assert_eq!(factory.committed(), vec!["inner", "outer"]);
    assert_eq!(factory.acquire_count(), 2);
    assert_eq!(factory.open_count(), 0);
}

#[test]
fn test_requires_new_rollback_leaves_outer_untouched() {
    let factory = InMemoryResourceFactory::new();
    let manager = manager_for(&factory);

    let outer = manager.get_transaction(&def(Propagation::Required)).unwrap();
    run_statement(&factory, "outer").unwrap();
    let inner = manager.get_transaction(&def(Propagation::RequiresNew)).unwrap();
    run_statement(&factory, "inner").unwrap();
    manager.rollback(inner).unwrap();
    assert!(!outer.is_global_rollback_only().unwrap());
    manager.commit(outer).unwrap();

    assert_eq!(factory.committed(), vec!["outer"]);
}

#[test]
fn test_not_supported_outer_with_required_inner() {
    let factory = InMemoryResourceFactory::new();
    let manager = manager_for(&factory);
    let key = factory.resource_key();

    let outer = manager.get_transaction(&def(Propagation::NotSupported)).unwrap();
    assert!(!outer.has_transaction());
    assert!(!ResourceRegistry::has_resource(&key));

    let inner = manager.get_transaction(&def(Propagation::Required)).unwrap();
    assert!(inner.is_new_transaction());
    assert!(ResourceRegistry::has_resource(&key));
    run_statement(&factory, "inner").unwrap();
    manager.commit(inner).unwrap();

    assert!(!ResourceRegistry::has_resource(&key));
    assert!(SynchronizationManager::is_synchronization_active());
    assert!(!SynchronizationManager::is_actual_transaction_active());
    manager.commit(outer).unwrap();
    assert_eq!(factory.committed(), vec!["inner"]);
}

#[test]
fn test_nested_savepoint_rolls_back_partial_work() {
    let factory = InMemoryResourceFactory::new();
    let manager = manager_for(&factory);

    let outer = manager.get_transaction(&def(Propagation::Required)).unwrap();
    run_statement(&factory, "a").unwrap();

    let nested = manager.get_transaction(&def(Propagation::Nested)).unwrap();
    assert!(nested.has_savepoint());
    run_statement(&factory, "b").unwrap();
    manager.rollback(nested).unwrap();

    run_statement(&factory, "c").unwrap();
    manager.commit(outer).unwrap();

    assert_eq!(factory.committed(), vec!["a", "c"]);
    assert_eq!(factory.count(ResourceCall::SetSavepoint), 1);
    assert_eq!(factory.count(ResourceCall::RollbackToSavepoint), 1);
    assert_eq!(factory.count(ResourceCall::ReleaseSavepoint), 1);
}

#[test]
fn test_supports_binds_resource_until_completion() {
    let factory = InMemoryResourceFactory::new();
    let manager = manager_for(&factory);
    let key = factory.resource_key();

    let status = manager.get_transaction(&def(Propagation::Supports)).unwrap();
    let resource = ResourceUtils::get_resource(&factory).unwrap();
    let again = ResourceUtils::get_resource(&factory).unwrap();
    assert!(Rc::ptr_eq(&resource, &again));
    assert!(ResourceRegistry::has_resource(&key));
    ResourceUtils::release_resource(Some(&again), &factory);
    ResourceUtils::release_resource(Some(&resource), &factory);

    manager.commit(status).unwrap();
    assert!(!ResourceRegistry::has_resource(&key));
    assert_eq!(factory.acquire_count(), 1);
    assert_eq!(factory.open_count(), 0);
    assert_eq!(factory.count(ResourceCall::Commit), 0);
}

// ============================================================================
// Definition properties
// ============================================================================

#[test]
fn test_isolation_and_read_only_applied_and_reset() {
    let factory = InMemoryResourceFactory::new();
    let manager = manager_for(&factory);
    let definition = def(Propagation::Required)
        .with_isolation(IsolationLevel::Serializable)
        .with_read_only(true);

    let status = manager.get_transaction(&definition).unwrap();
    manager.commit(status).unwrap();

    assert_eq!(
        factory.calls(),
        vec![
            ResourceCall::Acquire,
            ResourceCall::SetReadOnly(true),
            ResourceCall::SetIsolation(IsolationLevel::Serializable),
            ResourceCall::SetAutoCommit(false),
            ResourceCall::Commit,
            ResourceCall::SetAutoCommit(true),
            ResourceCall::SetIsolation(IsolationLevel::ReadCommitted),
            ResourceCall::SetReadOnly(false),
            ResourceCall::Close,
        ]
    );
}

#[test]
fn test_timeout_exposed_to_resource_users() {
    let factory = InMemoryResourceFactory::new();
    let manager = manager_for(&factory);

    let status = manager
        .get_transaction(&def(Propagation::Required).with_timeout_secs(30))
        .unwrap();
    let ttl = ResourceUtils::transaction_time_to_live(&factory).unwrap().unwrap();
    assert!(ttl <= Duration::from_secs(30));
    assert!(ttl > Duration::from_secs(25));
    manager.commit(status).unwrap();
    assert_eq!(ResourceUtils::transaction_time_to_live(&factory).unwrap(), None);
}

#[test]
fn test_default_timeout_from_config() {
    let factory = InMemoryResourceFactory::new();
    let manager = manager_with(
        Arc::new(factory.clone()),
        ManagerConfig::default().with_default_timeout_secs(5),
    );
    let status = manager.get_transaction(&def(Propagation::Required)).unwrap();
    let ttl = ResourceUtils::transaction_time_to_live(&factory).unwrap().unwrap();
    assert!(ttl <= Duration::from_secs(5));
    manager.commit(status).unwrap();
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #[test]
    fn nested_required_binds_one_holder(depth in 1usize..6) {
        let factory = InMemoryResourceFactory::new();
        let manager = manager_for(&factory);
        let mut statuses = Vec::new();
        for level in 0..depth {
            statuses.push(manager.get_transaction(&def(Propagation::Required)).unwrap());
            run_statement(&factory, &format!("level {}", level)).unwrap();
            prop_assert_eq!(ResourceRegistry::bound_count(), 1);
        }
        while let Some(status) = statuses.pop() {
            manager.commit(status).unwrap();
        }
        prop_assert_eq!(factory.acquire_count(), 1);
        prop_assert_eq!(factory.committed().len(), depth);
        prop_assert_eq!(ResourceRegistry::bound_count(), 0);
    }
}
