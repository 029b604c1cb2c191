//! Equality filters.
//!
//! A filter is a conjunction of field-value equalities compared with strict
//! structural equality: no coercion, null distinct from absent. There are
//! no range, regex, or disjunction operators.

use std::collections::BTreeMap;

use crate::record::Record;
use crate::value::Value;

/// A conjunction of field-value equalities. The empty filter matches all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    predicates: BTreeMap<String, Value>,
}

impl Filter {
    /// The empty filter; matches every record.
    pub fn all() -> Self {
        Self::default()
    }

    /// Add an equality predicate.
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.predicates.insert(field.into(), value.into());
        self
    }

    /// Whether the filter has no predicates.
    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Iterate `(field, value)` predicates.
    pub fn predicates(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.predicates.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Evaluate against a record. A missing field never matches; an
    /// explicit null only matches a predicate on null.
    pub fn matches(&self, record: &Record) -> bool {
        self.predicates
            .iter()
            .all(|(field, expected)| record.get(field) == Some(expected))
    }
}

impl<K: Into<String>, const N: usize> From<[(K, Value); N]> for Filter {
    fn from(pairs: [(K, Value); N]) -> Self {
        Self {
            predicates: pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}
