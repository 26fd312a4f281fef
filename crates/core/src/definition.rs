//! Transaction definitions
//!
//! A [`TransactionDefinition`] describes the semantics a unit of work asks
//! for: propagation behavior, isolation level, timeout, read-only hint, a
//! name, and the rollback rule deciding which failures roll back.
//!
//! Definitions are built once and never mutated afterwards. They can also be
//! parsed from the comma-separated attribute form used in configuration:
//!
//! ```text
//! PROPAGATION_REQUIRES_NEW,ISOLATION_SERIALIZABLE,readOnly,timeout_30
//! ```

use crate::error::{TransactionError, TxResult};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Prefix of propagation tokens in attribute strings
pub const PROPAGATION_PREFIX: &str = "PROPAGATION_";
/// Prefix of isolation tokens in attribute strings
pub const ISOLATION_PREFIX: &str = "ISOLATION_";
/// Prefix of timeout tokens in attribute strings
pub const TIMEOUT_PREFIX: &str = "timeout_";
/// Timeout value meaning "no timeout"
pub const TIMEOUT_DEFAULT: i64 = -1;
/// Read-only marker token in attribute strings
pub const READ_ONLY_MARKER: &str = "readOnly";

/// How a requested transaction relates to one already active on the thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Propagation {
    /// Join the current transaction, start one if none exists
    #[default]
    Required,
    /// Join the current transaction, run without one if none exists
    Supports,
    /// Join the current transaction, fail if none exists
    Mandatory,
    /// Always start a new transaction, suspending the current one
    RequiresNew,
    /// Run without a transaction, suspending the current one
    NotSupported,
    /// Run without a transaction, fail if one exists
    Never,
    /// Savepoint inside the current transaction, new transaction otherwise
    Nested,
}

impl Propagation {
    /// All propagation behaviors
    pub const ALL: [Propagation; 7] = [
        Propagation::Required,
        Propagation::Supports,
        Propagation::Mandatory,
        Propagation::RequiresNew,
        Propagation::NotSupported,
        Propagation::Never,
        Propagation::Nested,
    ];

    /// Constant name without prefix, e.g. `REQUIRES_NEW`
    pub fn as_str(&self) -> &'static str {
        match self {
            Propagation::Required => "REQUIRED",
            Propagation::Supports => "SUPPORTS",
            Propagation::Mandatory => "MANDATORY",
            Propagation::RequiresNew => "REQUIRES_NEW",
            Propagation::NotSupported => "NOT_SUPPORTED",
            Propagation::Never => "NEVER",
            Propagation::Nested => "NESTED",
        }
    }

    /// Whether this behavior starts a transaction when none exists
    pub fn begins_when_absent(&self) -> bool {
        matches!(
            self,
            Propagation::Required | Propagation::RequiresNew | Propagation::Nested
        )
    }
}

impl fmt::Display for Propagation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", PROPAGATION_PREFIX, self.as_str())
    }
}

impl FromStr for Propagation {
    type Err = TransactionError;

    fn from_str(s: &str) -> TxResult<Self> {
        let name = s.trim();
        let name = name.strip_prefix(PROPAGATION_PREFIX).unwrap_or(name);
        Propagation::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == name)
            .ok_or_else(|| TransactionError::config(format!("Unknown propagation '{}'", s)))
    }
}

/// Isolation level requested for a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolationLevel {
    /// Use whatever the underlying resource defaults to
    #[default]
    Default,
    /// Dirty reads permitted
    ReadUncommitted,
    /// Only committed data is read
    ReadCommitted,
    /// Reads are repeatable within the transaction
    RepeatableRead,
    /// Full serializability
    Serializable,
}

impl IsolationLevel {
    /// All isolation levels
    pub const ALL: [IsolationLevel; 5] = [
        IsolationLevel::Default,
        IsolationLevel::ReadUncommitted,
        IsolationLevel::ReadCommitted,
        IsolationLevel::RepeatableRead,
        IsolationLevel::Serializable,
    ];

    /// Constant name without prefix, e.g. `READ_COMMITTED`
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationLevel::Default => "DEFAULT",
            IsolationLevel::ReadUncommitted => "READ_UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ_COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE_READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }

    /// Whether a concrete level (anything but `Default`) was requested
    pub fn is_specific(&self) -> bool {
        *self != IsolationLevel::Default
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", ISOLATION_PREFIX, self.as_str())
    }
}

impl FromStr for IsolationLevel {
    type Err = TransactionError;

    fn from_str(s: &str) -> TxResult<Self> {
        let name = s.trim();
        let name = name.strip_prefix(ISOLATION_PREFIX).unwrap_or(name);
        IsolationLevel::ALL
            .iter()
            .copied()
            .find(|l| l.as_str() == name)
            .ok_or_else(|| TransactionError::config(format!("Unknown isolation level '{}'", s)))
    }
}

/// Predicate deciding whether a failure of the unit of work rolls back
///
/// The error is passed as a trait object so rules can downcast to the
/// application's own error types.
pub type RollbackRule = Arc<dyn Fn(&(dyn StdError + 'static)) -> bool + Send + Sync>;

static NO_TRANSACTION: Lazy<TransactionDefinition> = Lazy::new(|| {
    TransactionDefinition::new()
        .with_propagation(Propagation::Supports)
        .with_name("non-transactional")
});

/// Immutable description of the transaction a unit of work requests
#[derive(Clone, Default)]
pub struct TransactionDefinition {
    propagation: Propagation,
    isolation: IsolationLevel,
    timeout_secs: Option<u32>,
    read_only: bool,
    name: Option<String>,
    rollback_rule: Option<RollbackRule>,
}

impl TransactionDefinition {
    /// REQUIRED, default isolation, no timeout, read-write, rollback on any error
    pub fn new() -> Self {
        Self::default()
    }

    /// Definition used when no attribute is resolved for a unit of work:
    /// SUPPORTS with no timeout, not read-only, default rollback rule
    pub fn no_transaction() -> Self {
        NO_TRANSACTION.clone()
    }

    /// Shorthand for a default definition with the given propagation
    pub fn with(propagation: Propagation) -> Self {
        Self::new().with_propagation(propagation)
    }

    /// Set the propagation behavior
    pub fn with_propagation(mut self, propagation: Propagation) -> Self {
        self.propagation = propagation;
        self
    }

    /// Set the isolation level
    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    /// Set the timeout in seconds
    pub fn with_timeout_secs(mut self, timeout_secs: u32) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }

    /// Set the read-only hint
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Set the name used for logging and thread-bound attributes
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Replace the default rollback rule
    pub fn with_rollback_rule<F>(mut self, rule: F) -> Self
    where
        F: Fn(&(dyn StdError + 'static)) -> bool + Send + Sync + 'static,
    {
        self.rollback_rule = Some(Arc::new(rule));
        self
    }

    /// Propagation behavior
    pub fn propagation(&self) -> Propagation {
        self.propagation
    }

    /// Isolation level
    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// Timeout in seconds, `None` when no timeout applies
    pub fn timeout_secs(&self) -> Option<u32> {
        self.timeout_secs
    }

    /// Read-only hint
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Name, if any
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Whether a custom rollback rule was supplied
    pub fn has_custom_rollback_rule(&self) -> bool {
        self.rollback_rule.is_some()
    }

    /// Whether the given failure of the unit of work should roll back
    ///
    /// Without a custom rule every failure rolls back.
    pub fn rollback_on(&self, error: &(dyn StdError + 'static)) -> bool {
        match &self.rollback_rule {
            Some(rule) => rule(error),
            None => true,
        }
    }
}

impl fmt::Debug for TransactionDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionDefinition")
            .field("propagation", &self.propagation)
            .field("isolation", &self.isolation)
            .field("timeout_secs", &self.timeout_secs)
            .field("read_only", &self.read_only)
            .field("name", &self.name)
            .field(
                "rollback_rule",
                &if self.rollback_rule.is_some() { "custom" } else { "default" },
            )
            .finish()
    }
}

impl fmt::Display for TransactionDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.propagation, self.isolation)?;
        if let Some(timeout) = self.timeout_secs {
            write!(f, ",{}{}", TIMEOUT_PREFIX, timeout)?;
        }
        if self.read_only {
            write!(f, ",{}", READ_ONLY_MARKER)?;
        }
        Ok(())
    }
}

impl FromStr for TransactionDefinition {
    type Err = TransactionError;

    fn from_str(s: &str) -> TxResult<Self> {
        let mut definition = TransactionDefinition::new();
        for token in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            if token.starts_with(PROPAGATION_PREFIX) {
                definition.propagation = token.parse()?;
            } else if token.starts_with(ISOLATION_PREFIX) {
                definition.isolation = token.parse()?;
            } else if let Some(secs) = token.strip_prefix(TIMEOUT_PREFIX) {
                let secs = secs.parse::<i64>().map_err(|e| {
                    TransactionError::config(format!("Invalid timeout '{}': {}", token, e))
                })?;
                definition.timeout_secs = match secs {
                    TIMEOUT_DEFAULT => None,
                    secs => Some(u32::try_from(secs).map_err(|_| {
                        TransactionError::config(format!(
                            "Invalid timeout '{}': expected {} or 0..={}",
                            token,
                            TIMEOUT_DEFAULT,
                            u32::MAX
                        ))
                    })?),
                };
            } else if token == READ_ONLY_MARKER {
                definition.read_only = true;
            } else {
                return Err(TransactionError::config(format!(
                    "Invalid transaction attribute token '{}'",
                    token
                )));
            }
        }
        Ok(definition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResourceError;

    #[test]
    fn test_default_definition() {
        let def = TransactionDefinition::new();
        assert_eq!(def.propagation(), Propagation::Required);
        assert_eq!(def.isolation(), IsolationLevel::Default);
        assert_eq!(def.timeout_secs(), None);
        assert!(!def.is_read_only());
        assert!(def.name().is_none());
        assert!(!def.has_custom_rollback_rule());
    }

    #[test]
    fn test_no_transaction_definition() {
        let def = TransactionDefinition::no_transaction();
        assert_eq!(def.propagation(), Propagation::Supports);
        assert_eq!(def.isolation(), IsolationLevel::Default);
        assert_eq!(def.timeout_secs(), None);
        assert!(!def.is_read_only());
    }

    #[test]
    fn test_default_rule_rolls_back_on_everything() {
        let def = TransactionDefinition::new();
        assert!(def.rollback_on(&ResourceError::Closed));
    }

    #[test]
    fn test_custom_rule_downcasts() {
        let def = TransactionDefinition::new().with_rollback_rule(|e| {
            !matches!(e.downcast_ref::<ResourceError>(), Some(ResourceError::Unsupported(_)))
        });
        assert!(def.has_custom_rollback_rule());
        assert!(def.rollback_on(&ResourceError::Closed));
        assert!(!def.rollback_on(&ResourceError::unsupported("savepoint")));
    }

    #[test]
    fn test_parse_attribute_string() {
        let def: TransactionDefinition =
            "PROPAGATION_REQUIRES_NEW, ISOLATION_SERIALIZABLE,readOnly,timeout_30"
                .parse()
                .unwrap();
        assert_eq!(def.propagation(), Propagation::RequiresNew);
        assert_eq!(def.isolation(), IsolationLevel::Serializable);
        assert!(def.is_read_only());
        assert_eq!(def.timeout_secs(), Some(30));
    }

    #[test]
    fn test_parse_default_timeout_means_none() {
        let def: TransactionDefinition = "PROPAGATION_REQUIRED,timeout_-1".parse().unwrap();
        assert_eq!(def.propagation(), Propagation::Required);
        assert_eq!(def.timeout_secs(), None);

        let def: TransactionDefinition = "timeout_30,timeout_-1".parse().unwrap();
        assert_eq!(def.timeout_secs(), None);

        let def: TransactionDefinition = "timeout_0".parse().unwrap();
        assert_eq!(def.timeout_secs(), Some(0));
    }

    #[test]
    fn test_parse_rejects_out_of_range_timeout() {
        let err = "timeout_-2".parse::<TransactionDefinition>();
        assert!(matches!(err, Err(TransactionError::Config(_))));

        let err = "timeout_4294967296".parse::<TransactionDefinition>();
        assert!(matches!(err, Err(TransactionError::Config(_))));
    }

    #[test]
    fn test_parse_rejects_unknown_token() {
        let err = "PROPAGATION_REQUIRED,sometimes".parse::<TransactionDefinition>();
        assert!(matches!(err, Err(TransactionError::Config(_))));

        let err = "PROPAGATION_SOMETIMES".parse::<TransactionDefinition>();
        assert!(matches!(err, Err(TransactionError::Config(_))));

        let err = "timeout_soon".parse::<TransactionDefinition>();
        assert!(matches!(err, Err(TransactionError::Config(_))));
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        let def = TransactionDefinition::with(Propagation::Nested)
            .with_isolation(IsolationLevel::ReadCommitted)
            .with_timeout_secs(5)
            .with_read_only(true);
        let text = def.to_string();
        assert_eq!(
            text,
            "PROPAGATION_NESTED,ISOLATION_READ_COMMITTED,timeout_5,readOnly"
        );
        let parsed: TransactionDefinition = text.parse().unwrap();
        assert_eq!(parsed.propagation(), def.propagation());
        assert_eq!(parsed.isolation(), def.isolation());
        assert_eq!(parsed.timeout_secs(), def.timeout_secs());
        assert_eq!(parsed.is_read_only(), def.is_read_only());
    }

    #[test]
    fn test_propagation_parse_without_prefix() {
        assert_eq!("NEVER".parse::<Propagation>().unwrap(), Propagation::Never);
        assert_eq!(
            "PROPAGATION_NOT_SUPPORTED".parse::<Propagation>().unwrap(),
            Propagation::NotSupported
        );
    }

    #[test]
    fn test_begins_when_absent() {
        let beginning: Vec<_> = Propagation::ALL
            .iter()
            .filter(|p| p.begins_when_absent())
            .collect();
        assert_eq!(
            beginning,
            vec![
                &Propagation::Required,
                &Propagation::RequiresNew,
                &Propagation::Nested
            ]
        );
    }

    #[test]
    fn test_isolation_is_specific() {
        assert!(!IsolationLevel::Default.is_specific());
        assert!(IsolationLevel::RepeatableRead.is_specific());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn attribute_tokens_parse_in_any_order(
                propagation in prop::sample::select(Propagation::ALL.to_vec()),
                isolation in prop::sample::select(IsolationLevel::ALL.to_vec()),
                timeout in prop::option::of(0u32..3600),
                read_only in any::<bool>(),
                rotate in 0usize..4,
            ) {
                let mut tokens = vec![propagation.to_string(), isolation.to_string()];
                if let Some(secs) = timeout {
                    tokens.push(format!("timeout_{}", secs));
                }
                if read_only {
                    tokens.push("readOnly".to_string());
                }
                let len = tokens.len();
                tokens.rotate_left(rotate % len);

                let parsed: TransactionDefinition = tokens.join(", ").parse().unwrap();
                prop_assert_eq!(parsed.propagation(), propagation);
                prop_assert_eq!(parsed.isolation(), isolation);
                prop_assert_eq!(parsed.timeout_secs(), timeout);
                prop_assert_eq!(parsed.is_read_only(), read_only);
            }
        }
    }
}
