use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while decoding or validating an ingest record.
#[derive(Debug, Error)]
pub enum RecordError {
    /// The payload was not valid JSON for a span message.
    #[error("malformed record: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Scalar value attached to a span tag.
///
/// Only JSON scalars are valid tag values; a record carrying an object or
/// array tag fails to decode as a whole.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl TagValue {
    fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }
}

/// Integer and float numerics compare cross-type, so `10` and `10.0` are one
/// attribute value rather than two distinct identities.
impl PartialEq for TagValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Text(a), Self::Text(b)) => a == b,
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

/// One span as submitted upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub trace_id: String,
    pub span_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub name: String,
    /// Epoch milliseconds.
    pub start_time: f64,
    /// Epoch milliseconds.
    pub finish_time: f64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, TagValue>,
}

impl Span {
    /// Duration of the span in milliseconds.
    pub fn duration_ms(&self) -> f64 {
        self.finish_time - self.start_time
    }

    /// Checks the fields every span must carry, returning the name of the
    /// first missing one.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.span_id.is_empty() {
            return Err("span_id");
        }
        if self.trace_id.is_empty() {
            return Err("trace_id");
        }
        if self.name.is_empty() {
            return Err("name");
        }
        Ok(())
    }
}

/// One record from the ingest feed: a group of spans plus the destination
/// credentials and entity metadata they were submitted under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insights_key: Option<String>,
    pub entity_name: String,
    #[serde(default)]
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    pub spans: Vec<Span>,
}

/// Decodes one raw feed payload into a span message.
pub fn decode(payload: &[u8]) -> Result<SpanMessage, RecordError> {
    Ok(serde_json::from_slice(payload)?)
}

/// A span flattened into the delivery shape for pass-through destinations.
#[derive(Debug, Clone, Serialize)]
pub struct SpanEvent {
    #[serde(rename = "traceId")]
    pub trace_id: String,
    #[serde(rename = "guid")]
    pub span_id: String,
    #[serde(rename = "parentId", skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub name: String,
    /// Span start, truncated to whole epoch milliseconds.
    pub timestamp: u64,
    #[serde(rename = "durationMs")]
    pub duration_ms: f64,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, TagValue>,
    #[serde(rename = "entityName")]
    pub entity_name: String,
    #[serde(rename = "entityId", skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
}

impl SpanEvent {
    /// Builds the delivery event for one span under the given entity.
    pub fn from_span(span: Span, entity_name: &str, entity_id: Option<&str>) -> Self {
        Self {
            trace_id: span.trace_id,
            span_id: span.span_id,
            parent_id: span.parent_id,
            name: span.name,
            timestamp: span.start_time as u64,
            duration_ms: span.finish_time - span.start_time,
            tags: span.tags,
            entity_name: entity_name.to_owned(),
            entity_id: entity_id.map(str::to_owned),
        }
    }
}
