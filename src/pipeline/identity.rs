use std::collections::HashMap;

use crate::record::TagValue;

/// The (name, attribute set) pair that distinguishes one aggregated metric
/// stream from another within a destination.
///
/// Immutable once created; samples only ever match an existing identity or
/// create a new one.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricIdentity {
    name: String,
    attributes: HashMap<String, TagValue>,
}

impl MetricIdentity {
    /// Creates an identity from a metric name and an already-whitelisted
    /// attribute set.
    pub fn new(name: impl Into<String>, attributes: HashMap<String, TagValue>) -> Self {
        Self {
            name: name.into(),
            attributes,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attributes(&self) -> &HashMap<String, TagValue> {
        &self.attributes
    }

    /// True iff `name` matches and the attribute sets are equal: same
    /// cardinality, every key present on both sides with an equal value.
    /// Subset or superset attribute sets never match.
    pub fn recognizes(&self, name: &str, attributes: &HashMap<String, TagValue>) -> bool {
        if self.name != name || self.attributes.len() != attributes.len() {
            return false;
        }
        self.attributes
            .iter()
            .all(|(key, value)| attributes.get(key) == Some(value))
    }
}
