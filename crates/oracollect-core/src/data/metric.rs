//! Metric points handed to the output buffer.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::value::FieldValue;

/// Tag set of a metric point. Ordered so that encoding is deterministic.
pub type Tags = BTreeMap<String, String>;

/// Field set of a metric point.
pub type Fields = BTreeMap<String, FieldValue>;

/// A (measurement, tags, fields, timestamp) tuple. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    name: String,
    tags: Tags,
    fields: Fields,
    timestamp: DateTime<Utc>,
}

impl MetricPoint {
    pub fn new(
        name: impl Into<String>,
        tags: Tags,
        fields: Fields,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            tags,
            fields,
            timestamp,
        }
    }

    /// Measurement name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }
}
