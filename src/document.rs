//! Replicated data shapes: documents, checkpoints and push change rows.
//!
//! Remote records arrive as loose JSON objects. [`Document::from_remote`]
//! normalizes them into the local shape, pulling the primary id, the
//! last-modified marker and the remote deletion flag out of the field map.
//!
//! # Marker Ordering
//!
//! Markers are opaque strings, but Kinto hands out millisecond timestamps.
//! [`compare_markers`] orders numeric markers numerically and falls back to
//! byte order otherwise, so the order is total for any input.
//!
//! ```text
//! "9" < "10" < "100" < "abc" < "abd"
//! ```

use crate::error::{ReplicationError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Field names that carry replication metadata on the wire.
pub const ID_FIELD: &str = "id";
pub const LAST_MODIFIED_FIELD: &str = "last_modified";
pub const DELETED_FIELD: &str = "deleted";

/// The unit of replication.
///
/// Serializes flat: `{ "id": .., "last_modified": .., "deleted": .., ...fields }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<u64>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub deleted: bool,

    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Document {
    /// Create a live document with no marker.
    pub fn new(id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            last_modified: None,
            deleted: false,
            fields,
        }
    }

    /// Create a deletion marker for `id`.
    pub fn tombstone(id: impl Into<String>, last_modified: Option<u64>) -> Self {
        Self {
            id: id.into(),
            last_modified,
            deleted: true,
            fields: Map::new(),
        }
    }

    /// Builder-style marker assignment.
    pub fn with_last_modified(mut self, last_modified: u64) -> Self {
        self.last_modified = Some(last_modified);
        self
    }

    /// Normalize a raw remote record.
    ///
    /// The record must be an object with a string `id`. `last_modified` may be
    /// a number or a numeric string; it doubles as the `If-Match` revision, so
    /// any other marker is rejected as a protocol error. A truthy `deleted`
    /// becomes the local deletion flag and tombstones drop any remaining
    /// payload.
    pub fn from_remote(record: Value) -> Result<Self> {
        let Value::Object(mut map) = record else {
            return Err(ReplicationError::Protocol(format!(
                "record is not an object: {}",
                record
            )));
        };

        let id = match map.remove(ID_FIELD) {
            Some(Value::String(id)) if !id.is_empty() => id,
            Some(other) => {
                return Err(ReplicationError::Protocol(format!(
                    "record id is not a non-empty string: {}",
                    other
                )))
            }
            None => {
                return Err(ReplicationError::Protocol(
                    "record without id".to_string(),
                ))
            }
        };

        let last_modified = match map.remove(LAST_MODIFIED_FIELD) {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) if n.is_u64() => n.as_u64(),
            Some(Value::String(s)) => match s.trim_matches('"').parse::<u64>() {
                Ok(marker) => Some(marker),
                Err(_) => {
                    return Err(ReplicationError::Protocol(format!(
                        "record {} has non-numeric last_modified {:?}",
                        id, s
                    )))
                }
            },
            Some(other) => {
                return Err(ReplicationError::Protocol(format!(
                    "record {} has invalid last_modified: {}",
                    id, other
                )))
            }
        };

        let deleted = matches!(map.remove(DELETED_FIELD), Some(Value::Bool(true)));
        if deleted {
            map.clear();
        }

        Ok(Self {
            id,
            last_modified,
            deleted,
            fields: map,
        })
    }

    /// Record body sent to the remote: payload fields plus the id.
    ///
    /// The marker travels as a request header, never in the body.
    pub fn to_remote_data(&self) -> Value {
        let mut data = self.fields.clone();
        data.insert(ID_FIELD.to_string(), Value::String(self.id.clone()));
        Value::Object(data)
    }

    /// Marker rendered as a checkpoint string.
    pub fn marker(&self) -> Option<String> {
        self.last_modified.map(|m| m.to_string())
    }

    /// Structural equality ignoring the replication marker.
    pub fn content_eq(&self, other: &Document) -> bool {
        self.id == other.id && self.deleted == other.deleted && self.fields == other.fields
    }
}

/// Stamp a marker onto `doc`, keeping an existing one unless `force`.
pub fn assign_last_modified(mut doc: Document, last_modified: u64, force: bool) -> Document {
    if doc.last_modified.is_none() || force {
        doc.last_modified = Some(last_modified);
    }
    doc
}

/// Compare two markers. See module docs for the ordering.
pub fn compare_markers(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// Replication progress marker.
///
/// "Everything at or before `last_modified` has been pulled." `None` means
/// nothing has been pulled yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub last_modified: Option<String>,
}

impl Checkpoint {
    /// The position before the first pull.
    pub fn start() -> Self {
        Self::default()
    }

    pub fn at(marker: impl Into<String>) -> Self {
        Self {
            last_modified: Some(marker.into()),
        }
    }

    pub fn marker(&self) -> Option<&str> {
        self.last_modified.as_deref()
    }

    pub fn is_start(&self) -> bool {
        self.last_modified.is_none()
    }

    /// True if `self` is strictly ahead of `other`.
    pub fn is_after(&self, other: &Checkpoint) -> bool {
        match (self.marker(), other.marker()) {
            (Some(a), Some(b)) => compare_markers(a, b) == Ordering::Greater,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// The later of `self` and `candidate`. Checkpoints never move backwards.
    pub fn advance(&self, candidate: &Checkpoint) -> Checkpoint {
        if candidate.is_after(self) {
            candidate.clone()
        } else {
            self.clone()
        }
    }
}

/// A local write waiting to be pushed.
///
/// `assumed_master_state` is what the client believes the remote holds;
/// `None` means the client believes the record does not exist remotely.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRow {
    pub assumed_master_state: Option<Document>,
    pub new_document_state: Document,
}

impl ChangeRow {
    pub fn create(doc: Document) -> Self {
        Self {
            assumed_master_state: None,
            new_document_state: doc,
        }
    }

    pub fn update(assumed: Document, doc: Document) -> Self {
        Self {
            assumed_master_state: Some(assumed),
            new_document_state: doc,
        }
    }

    pub fn id(&self) -> &str {
        &self.new_document_state.id
    }

    /// Revision used as the optimistic concurrency guard.
    pub fn revision(&self) -> Option<u64> {
        self.assumed_master_state
            .as_ref()
            .and_then(|d| d.last_modified)
            .or(self.new_document_state.last_modified)
    }

    /// Same row with the revision guard removed, so it is sent as a create.
    pub fn as_create(&self) -> Self {
        let mut doc = self.new_document_state.clone();
        doc.last_modified = None;
        Self {
            assumed_master_state: None,
            new_document_state: doc,
        }
    }
}
