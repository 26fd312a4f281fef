//! Transaction manager configuration via `demarc.toml`
//!
//! All switches have defaults, so an empty file (or no file at all) gives a
//! working manager. Declarative attributes for the interceptor live in the
//! `[attributes]` table, keyed by `Type::operation`.

use crate::attributes::MapAttributeSource;
use demarc_core::{TransactionDefinition, TransactionError, TxResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Config file name used by convention
pub const CONFIG_FILE_NAME: &str = "demarc.toml";

/// When completion callbacks are activated for a unit of work
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynchronizationMode {
    /// For every scope, including ones that run without an actual transaction
    #[default]
    Always,
    /// Only for scopes backed by an actual transaction
    OnActualTransaction,
    /// Never
    Never,
}

/// Transaction manager configuration loaded from `demarc.toml`.
///
/// # Example
///
/// ```toml
/// synchronization = "always"
/// nested_transaction_allowed = true
///
/// [attributes]
/// "OrderService::place" = "PROPAGATION_REQUIRED,ISOLATION_SERIALIZABLE"
/// "OrderService::find*" = "PROPAGATION_SUPPORTS,readOnly"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// When synchronization is activated.
    #[serde(default)]
    pub synchronization: SynchronizationMode,
    /// Deadline applied to new transactions whose definition carries none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_timeout_secs: Option<u32>,
    /// Whether NESTED propagation is permitted.
    #[serde(default = "default_true")]
    pub nested_transaction_allowed: bool,
    /// Reject joining an existing transaction with an incompatible isolation level.
    #[serde(default = "default_true")]
    pub validate_existing_transaction: bool,
    /// Roll back when the resource-level commit itself fails.
    #[serde(default)]
    pub rollback_on_commit_failure: bool,
    /// A failing participant marks the whole transaction rollback-only.
    #[serde(default = "default_true")]
    pub global_rollback_on_participation_failure: bool,
    /// Declarative attributes, `"Type::operation" = "PROPAGATION_...,..."`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            synchronization: SynchronizationMode::default(),
            default_timeout_secs: None,
            nested_transaction_allowed: true,
            validate_existing_transaction: true,
            rollback_on_commit_failure: false,
            global_rollback_on_participation_failure: true,
            attributes: BTreeMap::new(),
        }
    }
}

impl ManagerConfig {
    /// Set the synchronization mode
    pub fn with_synchronization(mut self, mode: SynchronizationMode) -> Self {
        self.synchronization = mode;
        self
    }

    /// Set the default timeout for new transactions
    pub fn with_default_timeout_secs(mut self, secs: u32) -> Self {
        self.default_timeout_secs = Some(secs);
        self
    }

    /// Allow or forbid NESTED propagation
    pub fn with_nested_transaction_allowed(mut self, allowed: bool) -> Self {
        self.nested_transaction_allowed = allowed;
        self
    }

    /// Enable or disable validation when joining an existing transaction
    pub fn with_validate_existing_transaction(mut self, validate: bool) -> Self {
        self.validate_existing_transaction = validate;
        self
    }

    /// Roll back when the resource-level commit fails
    pub fn with_rollback_on_commit_failure(mut self, rollback: bool) -> Self {
        self.rollback_on_commit_failure = rollback;
        self
    }

    /// Whether a failing participant dooms the whole transaction
    pub fn with_global_rollback_on_participation_failure(mut self, global: bool) -> Self {
        self.global_rollback_on_participation_failure = global;
        self
    }

    /// Add a declarative attribute
    pub fn with_attribute(mut self, operation: impl Into<String>, attribute: impl Into<String>) -> Self {
        self.attributes.insert(operation.into(), attribute.into());
        self
    }

    /// Parse every entry of the `[attributes]` table into an attribute source.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error naming the first entry that does not parse.
    pub fn attribute_source(&self) -> TxResult<MapAttributeSource> {
        let mut source = MapAttributeSource::new();
        for (operation, attribute) in &self.attributes {
            let definition: TransactionDefinition = attribute.parse().map_err(|e| {
                TransactionError::config(format!(
                    "Invalid transaction attribute for '{}': {}",
                    operation, e
                ))
            })?;
            source.add(operation.clone(), definition);
        }
        Ok(source)
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Demarc transaction manager configuration
#
# When completion callbacks are activated (default: "always")
#   "always"                = also for scopes that run without a transaction
#   "on_actual_transaction" = only when an actual transaction was begun
#   "never"                 = never
synchronization = "always"

# Deadline in seconds for new transactions that do not specify one.
# default_timeout_secs = 30

# Permit NESTED propagation (savepoints where the resource supports them)
nested_transaction_allowed = true

# Reject joining a transaction with an incompatible isolation level
validate_existing_transaction = true

# Roll back when the resource-level commit call fails
rollback_on_commit_failure = false

# A participating scope that rolls back dooms the whole transaction
global_rollback_on_participation_failure = true

# Declarative attributes for the interceptor.
# Keys are "Type::operation"; a trailing or leading '*' matches by pattern.
# [attributes]
# "AccountService::transfer" = "PROPAGATION_REQUIRED,ISOLATION_SERIALIZABLE,timeout_30"
# "AccountService::find*"    = "PROPAGATION_SUPPORTS,readOnly"
"#
    }

    /// Parse config from TOML text.
    ///
    /// # Errors
    ///
    /// Returns a `Config` error if the text does not parse or an attribute is invalid.
    pub fn from_toml_str(content: &str) -> TxResult<Self> {
        let config: ManagerConfig = toml::from_str(content)
            .map_err(|e| TransactionError::config(format!("Failed to parse config: {}", e)))?;
        // Validate attribute strings eagerly
        config.attribute_source()?;
        Ok(config)
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> TxResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TransactionError::config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content).map_err(|e| {
            TransactionError::config(format!("In config file '{}': {}", path.display(), e))
        })
    }

    /// Write the default config file if it does not already exist.
    ///
    /// Returns `Ok(())` whether the file was created or already existed.
    pub fn write_default_if_missing(path: &Path) -> TxResult<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                TransactionError::config(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> TxResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| TransactionError::config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            TransactionError::config(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}
