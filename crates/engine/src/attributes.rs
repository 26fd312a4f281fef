//! Transaction attribute sources
//!
//! The interceptor asks an attribute source which [`TransactionDefinition`]
//! applies to an operation of a type. How the source decides is up to it;
//! [`MapAttributeSource`] matches `Type::operation` names.

use demarc_core::TransactionDefinition;
use std::collections::HashMap;

/// Resolves the definition that applies to an operation
pub trait TransactionAttributeSource {
    /// Definition for `operation` declared on `type_name`, if the operation is transactional
    fn transaction_attribute(&self, type_name: &str, operation: &str) -> Option<TransactionDefinition>;
}

/// Build the lookup key for an operation
pub fn operation_key(type_name: &str, operation: &str) -> String {
    format!("{}::{}", type_name, operation)
}

/// Attribute source backed by a map of `Type::operation` names
///
/// Keys may use `*` at the start, the end, or both to match by pattern.
/// An exact key always wins; among patterns the longest one wins.
#[derive(Debug, Clone, Default)]
pub struct MapAttributeSource {
    attributes: HashMap<String, TransactionDefinition>,
}

impl MapAttributeSource {
    /// Create an empty source
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition for a key or pattern
    pub fn add(&mut self, key: impl Into<String>, definition: TransactionDefinition) {
        self.attributes.insert(key.into(), definition);
    }

    /// Builder form of [`add`](Self::add)
    pub fn with(mut self, key: impl Into<String>, definition: TransactionDefinition) -> Self {
        self.add(key, definition);
        self
    }

    /// Number of registered keys
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    /// Whether no keys are registered
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Resolve a full `Type::operation` name
    pub fn lookup(&self, name: &str) -> Option<TransactionDefinition> {
        if let Some(definition) = self.attributes.get(name) {
            return Some(definition.clone());
        }
        self.attributes
            .iter()
            .filter(|(pattern, _)| is_match(name, pattern))
            .max_by_key(|(pattern, _)| pattern.len())
            .map(|(_, definition)| definition.clone())
    }
}

impl TransactionAttributeSource for MapAttributeSource {
    fn transaction_attribute(&self, type_name: &str, operation: &str) -> Option<TransactionDefinition> {
        self.lookup(&operation_key(type_name, operation))
    }
}

fn is_match(name: &str, pattern: &str) -> bool {
    let leading = pattern.starts_with('*');
    let trailing = pattern.len() > 1 && pattern.ends_with('*');
    let core = pattern.trim_start_matches('*').trim_end_matches('*');
    match (leading, trailing) {
        (true, true) => name.contains(core),
        (true, false) => name.ends_with(core),
        (false, true) => name.starts_with(core),
        (false, false) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use demarc_core::Propagation;

    fn source() -> MapAttributeSource {
        MapAttributeSource::new()
            .with("Orders::place", TransactionDefinition::with(Propagation::RequiresNew))
            .with("Orders::find*", TransactionDefinition::with(Propagation::Supports))
            .with("Orders::findArchived*", TransactionDefinition::with(Propagation::NotSupported))
            .with("*::audit", TransactionDefinition::with(Propagation::Mandatory))
    }

    #[test]
    fn test_exact_match() {
        let definition = source().transaction_attribute("Orders", "place").unwrap();
        assert_eq!(definition.propagation(), Propagation::RequiresNew);
    }

    #[test]
    fn test_longest_pattern_wins() {
        let source = source();
        let find = source.transaction_attribute("Orders", "findById").unwrap();
        assert_eq!(find.propagation(), Propagation::Supports);
        let archived = source.transaction_attribute("Orders", "findArchivedById").unwrap();
        assert_eq!(archived.propagation(), Propagation::NotSupported);
    }

    #[test]
    fn test_leading_wildcard() {
        let definition = source().transaction_attribute("Ledger", "audit").unwrap();
        assert_eq!(definition.propagation(), Propagation::Mandatory);
    }

    #[test]
    fn test_unmatched_operation() {
        assert!(source().transaction_attribute("Orders", "cancel").is_none());
        assert!(source().transaction_attribute("Billing", "place").is_none());
    }

    #[test]
    fn test_is_match_forms() {
        assert!(is_match("a::bcd", "a::b*"));
        assert!(is_match("a::bcd", "*cd"));
        assert!(is_match("a::bcd", "*::b*"));
        assert!(!is_match("a::bcd", "a::bcd"));
        assert!(is_match("anything", "*"));
    }
}
