//! End-to-end scenarios through the public facade
//!
//! Each test wires an interceptor, a resource-backed manager and an
//! in-memory factory together and drives nested wrapped calls the way
//! application code would.

use demarc::{
    CompletionStatus, IsolationLevel, ManagerConfig, MapAttributeSource, Propagation, ResourceFactory,
    ResourceRegistry, ResourceTransactionBackend, ResourceUtils, SynchronizationManager,
    TransactionDefinition, TransactionError, TransactionExecution, TransactionInterceptor,
    TransactionManager, TransactionSynchronization, TxResult,
};
use demarc_datasource::testing::{InMemoryResourceFactory, ResourceCall};
use demarc_datasource::ResourceTransactionManager;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use thiserror::Error;

#[derive(Debug, Error)]
enum AppError {
    #[error("business rule violated: {0}")]
    Business(&'static str),
    #[error(transparent)]
    Tx(#[from] TransactionError),
}

type Interceptor = TransactionInterceptor<ResourceTransactionManager>;

fn statement(factory: &dyn ResourceFactory, text: &str) -> TxResult<()> {
    let resource = ResourceUtils::get_resource(factory)?;
    let result = resource.borrow_mut().execute(text);
    ResourceUtils::release_resource(Some(&resource), factory);
    result?;
    Ok(())
}

fn setup() -> (Interceptor, InMemoryResourceFactory) {
    let factory = InMemoryResourceFactory::new();
    let manager = TransactionManager::new(ResourceTransactionBackend::new(Arc::new(factory.clone())));
    let source = MapAttributeSource::new()
        .with("Orders::place", TransactionDefinition::with(Propagation::Required))
        .with("Orders::reserve", TransactionDefinition::with(Propagation::Required))
        .with("Orders::audit", TransactionDefinition::with(Propagation::Mandatory))
        .with("Orders::report", TransactionDefinition::with(Propagation::NotSupported))
        .with("Orders::archive", TransactionDefinition::with(Propagation::RequiresNew));
    (TransactionInterceptor::new(manager, source), factory)
}

// ============================================================================
// Nested wrapped calls
// ============================================================================

#[test]
fn test_inner_failure_rolls_back_outer_once() {
    let (interceptor, factory) = setup();

    let result: Result<(), AppError> = interceptor.invoke("Orders", "place", |_| {
        statement(&factory, "insert order")?;
        interceptor.invoke("Orders", "reserve", |status| {
            assert!(!status.is_new_transaction());
            statement(&factory, "update stock")?;
            Err(AppError::Business("out of stock"))
        })
    });

    assert!(matches!(result, Err(AppError::Business("out of stock"))));
    assert_eq!(factory.count(ResourceCall::Rollback), 1);
    assert_eq!(factory.count(ResourceCall::Commit), 0);
    assert_eq!(factory.count(ResourceCall::Close), 1);
    assert!(factory.committed().is_empty());
    assert_eq!(ResourceRegistry::bound_count(), 0);
    assert!(!SynchronizationManager::is_synchronization_active());
}

#[test]
fn test_not_supported_outer_with_required_inner() {
    let (interceptor, factory) = setup();
    let key = factory.resource_key();

    interceptor
        .invoke("Orders", "report", |status| {
            assert!(!status.has_transaction());
            assert!(!ResourceRegistry::has_resource(&key));

            interceptor.invoke("Orders", "place", |status| {
                assert!(status.is_new_transaction());
                statement(&factory, "insert order")?;
                Ok::<_, AppError>(())
            })?;

            assert!(!ResourceRegistry::has_resource(&key));
            assert!(!SynchronizationManager::is_actual_transaction_active());
            Ok::<_, AppError>(())
        })
        .unwrap();

    assert_eq!(factory.committed(), vec!["insert order"]);
    assert_eq!(factory.open_count(), 0);
}

#[test]
fn test_mandatory_without_transaction_never_runs_work() {
    let (interceptor, factory) = setup();
    let mut ran = false;
    let result = interceptor.invoke("Orders", "audit", |_| {
        ran = true;
        Ok::<_, AppError>(())
    });
    assert!(matches!(
        result,
        Err(AppError::Tx(TransactionError::IllegalTransactionState(_)))
    ));
    assert!(!ran);
    assert!(factory.journal().is_empty());
}

#[test]
fn test_requires_new_commits_independently() {
    let (interceptor, factory) = setup();
    let key = factory.resource_key();

    let result: Result<(), AppError> = interceptor.invoke("Orders", "place", |_| {
        statement(&factory, "insert order")?;
        let outer_holder = ResourceRegistry::get_resource(&key);

        interceptor.invoke("Orders", "archive", |_| {
            let inner_holder = ResourceRegistry::get_resource(&key);
            assert!(!matches!((&outer_holder, &inner_holder), (Some(a), Some(b)) if Rc::ptr_eq(a, b)));
            statement(&factory, "insert audit")?;
            Ok::<_, AppError>(())
        })?;

        let restored = ResourceRegistry::get_resource(&key);
        assert!(matches!((&outer_holder, &restored), (Some(a), Some(b)) if Rc::ptr_eq(a, b)));
        Err(AppError::Business("payment declined"))
    });

    assert!(result.is_err());
    assert_eq!(factory.committed(), vec!["insert audit"]);
    assert_eq!(factory.count(ResourceCall::Rollback), 1);
    assert_eq!(factory.open_count(), 0);
}

#[test]
fn test_rollback_only_status_surfaces_unexpected_rollback() {
    let (interceptor, factory) = setup();
    let result = interceptor.invoke("Orders", "place", |status| {
        statement(&factory, "insert order")?;
        status.set_rollback_only();
        Ok::<_, AppError>(())
    });
    assert!(matches!(
        result,
        Err(AppError::Tx(TransactionError::UnexpectedRollback(_)))
    ));
    assert_eq!(factory.count(ResourceCall::Commit), 0);
    assert!(factory.committed().is_empty());
}

// ============================================================================
// Completion callbacks
// ============================================================================

struct Recorder {
    label: &'static str,
    order: i32,
    events: Rc<RefCell<Vec<String>>>,
    refuse: bool,
}

impl TransactionSynchronization for Recorder {
    fn order(&self) -> i32 {
        self.order
    }

    fn before_completion(&mut self) -> TxResult<()> {
        self.events.borrow_mut().push(format!("{} before", self.label));
        if self.refuse {
            return Err(TransactionError::illegal_state("refused"));
        }
        Ok(())
    }

    fn after_completion(&mut self, status: CompletionStatus) -> TxResult<()> {
        self.events.borrow_mut().push(format!("{} after {}", self.label, status));
        Ok(())
    }
}

#[test]
fn test_after_completion_runs_once_in_order_despite_failure() {
    let (interceptor, factory) = setup();
    let events = Rc::new(RefCell::new(Vec::new()));

    let result = interceptor.invoke("Orders", "place", |_| {
        statement(&factory, "insert order")?;
        for (label, order, refuse) in [("late", 20, true), ("early", 10, false)] {
            SynchronizationManager::register_synchronization(Box::new(Recorder {
                label,
                order,
                events: events.clone(),
                refuse,
            }))?;
        }
        Ok::<_, AppError>(())
    });

    assert!(matches!(result, Err(AppError::Tx(TransactionError::IllegalState(_)))));
    assert_eq!(
        *events.borrow(),
        vec!["early before", "late before", "early after rolled back", "late after rolled back"]
    );
    assert_eq!(factory.count(ResourceCall::Rollback), 1);
    assert_eq!(factory.count(ResourceCall::Commit), 0);
}

// ============================================================================
// Configuration-driven attributes
// ============================================================================

#[test]
fn test_attributes_from_config() {
    let config = ManagerConfig::from_toml_str(
        r#"
        synchronization = "on_actual_transaction"

        [attributes]
        "Orders::place" = "PROPAGATION_REQUIRED,ISOLATION_SERIALIZABLE,timeout_30"
        "Orders::find*" = "PROPAGATION_SUPPORTS,readOnly"
        "#,
    )
    .unwrap();
    let source = config.attribute_source().unwrap();
    let factory = InMemoryResourceFactory::new();
    let manager = TransactionManager::with_config(
        ResourceTransactionBackend::new(Arc::new(factory.clone())),
        config,
    );
    let interceptor = TransactionInterceptor::new(manager, source);

    interceptor
        .invoke("Orders", "findById", |status| {
            assert!(!status.has_transaction());
            assert!(status.is_read_only());
            assert!(!SynchronizationManager::is_synchronization_active());
            Ok::<_, AppError>(())
        })
        .unwrap();

    interceptor
        .invoke("Orders", "place", |_| {
            let ttl = ResourceUtils::transaction_time_to_live(&factory)?;
            assert!(ttl.is_some());
            statement(&factory, "insert order")?;
            Ok::<_, AppError>(())
        })
        .unwrap();

    assert_eq!(
        factory.count(ResourceCall::SetIsolation(IsolationLevel::Serializable)),
        1
    );
    assert_eq!(factory.committed(), vec!["insert order"]);
}

// ============================================================================
// Thread confinement
// ============================================================================

#[test]
fn test_threads_run_independent_transactions() {
    let (interceptor, factory) = setup();
    let interceptor = &interceptor;

    thread::scope(|scope| {
        for worker in 0..4 {
            let factory = factory.clone();
            scope.spawn(move || {
                for i in 0..25 {
                    interceptor
                        .invoke("Orders", "place", |_| {
                            assert_eq!(ResourceRegistry::bound_count(), 1);
                            statement(&factory, &format!("worker {} order {}", worker, i))?;
                            Ok::<_, AppError>(())
                        })
                        .unwrap();
                }
            });
        }
    });

    assert_eq!(factory.committed().len(), 100);
    assert_eq!(factory.acquire_count(), 100);
    assert_eq!(factory.open_count(), 0);
    assert_eq!(interceptor.manager().metrics().total_committed, 100);
}
