//! Shared test utilities for the datasource integration suites.
//!
//! Import via `mod common;`.

#![allow(dead_code)]

use demarc_core::{ResourceFactory, TxResult};
use demarc_datasource::testing::InMemoryResourceFactory;
use demarc_datasource::{ResourceTransactionBackend, ResourceTransactionManager, ResourceUtils};
use demarc_engine::ManagerConfig;
use std::sync::Arc;

/// Manager running transactions on resources of `factory`
pub fn manager_for(factory: &InMemoryResourceFactory) -> ResourceTransactionManager {
    manager_with(Arc::new(factory.clone()), ManagerConfig::default())
}

/// Manager over an arbitrary factory with an explicit configuration
pub fn manager_with(factory: Arc<dyn ResourceFactory>, config: ManagerConfig) -> ResourceTransactionManager {
    ResourceTransactionManager::with_config(ResourceTransactionBackend::new(factory), config)
}

/// Execute one statement the way application code would: get, use, release
pub fn run_statement(factory: &dyn ResourceFactory, statement: &str) -> TxResult<()> {
    let resource = ResourceUtils::get_resource(factory)?;
    let result = resource.borrow_mut().execute(statement);
    ResourceUtils::release_resource(Some(&resource), factory);
    result?;
    Ok(())
}
