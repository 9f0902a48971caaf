//! The memory data model: the persisted record, the caller-facing input
//! shape, metadata values, and the bounds enforced on every write.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MemoryError, Result};

/// Byte ceiling for `user_id` and `session_id`.
pub const MAX_PRINCIPAL_BYTES: usize = 255;
/// Byte ceiling for `content`.
pub const MAX_CONTENT_BYTES: usize = 100 * 1024;
/// Ceiling on the encoded size of the metadata map.
pub const MAX_METADATA_BYTES: usize = 16 * 1024;
/// Salience assigned when the caller does not provide one.
pub const DEFAULT_IMPORTANCE: f32 = 0.5;

/// Free-form metadata value.  Kept as an explicitly tagged enum rather than
/// `serde_json::Value` so record bodies encode under a non-self-describing
/// binary format; the JSON boundary converts at the edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetadataValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<MetadataValue>),
    Map(BTreeMap<String, MetadataValue>),
}

pub type Metadata = BTreeMap<String, MetadataValue>;

impl MetadataValue {
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => Self::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => Self::Text(s.clone()),
            serde_json::Value::Array(items) => {
                Self::List(items.iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(map) => Self::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::Text(s) => serde_json::Value::String(s.clone()),
            Self::List(items) => {
                serde_json::Value::Array(items.iter().map(Self::to_json).collect())
            }
            Self::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

/// Convert a JSON object into a metadata map.  Non-object values are
/// rejected; metadata is always a string-keyed map at the top level.
pub fn metadata_from_json(value: &serde_json::Value) -> Result<Metadata> {
    match value {
        serde_json::Value::Object(map) => Ok(map
            .iter()
            .map(|(k, v)| (k.clone(), MetadataValue::from_json(v)))
            .collect()),
        other => Err(MemoryError::InvalidArgument(format!(
            "metadata must be a JSON object, got {other}"
        ))),
    }
}

pub fn metadata_to_json(metadata: &Metadata) -> serde_json::Value {
    serde_json::Value::Object(
        metadata
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect(),
    )
}

/// Encoded size of the metadata map, measured against its canonical JSON
/// form (the shape it crosses the API boundary in).
pub fn encoded_metadata_len(metadata: &Metadata) -> usize {
    serde_json::to_vec(&metadata_to_json(metadata))
        .map(|bytes| bytes.len())
        .unwrap_or(usize::MAX)
}

/// A single persisted memory.  Immutable after save except for the advisory
/// access fields and decay-applied importance rewrites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    pub id: Uuid,
    pub user_id: String,
    pub session_id: String,
    pub content: String,
    pub metadata: Metadata,
    /// Current salience in [0.0, 1.0]; attenuated by decay sweeps.
    pub importance: f32,
    /// Salience at save time.  Attenuation is always derived from this base
    /// so repeated sweeps at the same instant converge instead of compounding.
    pub initial_importance: f32,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
}

impl Memory {
    pub fn created_ms(&self) -> i64 {
        self.created_at.timestamp_millis()
    }
}

/// Caller-supplied fields for `save`.  Everything else is stamped by the
/// store.
#[derive(Debug, Clone, Default)]
pub struct MemoryInput {
    pub user_id: String,
    pub session_id: String,
    pub content: String,
    pub metadata: Metadata,
    pub importance: Option<f32>,
    pub ttl_hours: Option<u64>,
}

impl MemoryInput {
    pub fn validate(&self) -> Result<()> {
        validate_principal("user_id", &self.user_id)?;
        validate_principal("session_id", &self.session_id)?;
        if self.content.is_empty() {
            return Err(MemoryError::InvalidArgument(
                "content must not be empty".into(),
            ));
        }
        if self.content.len() > MAX_CONTENT_BYTES {
            return Err(MemoryError::TooLarge(format!(
                "content is {} bytes, limit is {MAX_CONTENT_BYTES}",
                self.content.len()
            )));
        }
        let metadata_len = encoded_metadata_len(&self.metadata);
        if metadata_len > MAX_METADATA_BYTES {
            return Err(MemoryError::TooLarge(format!(
                "metadata encodes to {metadata_len} bytes, limit is {MAX_METADATA_BYTES}"
            )));
        }
        if let Some(importance) = self.importance {
            if !(0.0..=1.0).contains(&importance) {
                return Err(MemoryError::InvalidArgument(format!(
                    "importance must be within [0.0, 1.0], got {importance}"
                )));
            }
        }
        if self.ttl_hours == Some(0) {
            return Err(MemoryError::InvalidArgument(
                "ttl_hours must be positive when set".into(),
            ));
        }
        Ok(())
    }
}

pub(crate) fn validate_principal(label: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(MemoryError::InvalidArgument(format!(
            "{label} must not be empty"
        )));
    }
    if value.len() > MAX_PRINCIPAL_BYTES {
        return Err(MemoryError::InvalidArgument(format!(
            "{label} is {} bytes, limit is {MAX_PRINCIPAL_BYTES}",
            value.len()
        )));
    }
    Ok(())
}

/// Sidecar record for a session's optional name and metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub session_id: String,
    pub user_id: String,
    pub name: Option<String>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

/// One row of `list_sessions` output: sidecar fields merged with values
/// derived from the session's member memories.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub user_id: String,
    pub name: Option<String>,
    pub memory_count: usize,
    pub created_at: Option<DateTime<Utc>>,
    pub last_active_at: Option<DateTime<Utc>>,
}

/// Truncate to at most `max_chars` characters, respecting char boundaries.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}
