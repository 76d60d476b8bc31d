//! Batch write requests and response aggregation.
//!
//! A push sends every pending row as one sub-request of a single batch call.
//! The remote answers with one sub-response per sub-request, in order, each
//! with its own HTTP-like status. [`aggregate`] partitions those answers:
//!
//! ```text
//! requests[i] ──▶ responses[i].status ──┬── 2xx ──────▶ published
//!                                       ├── 404 ──────▶ skipped
//!                                       ├── 409/412 ──▶ conflicts
//!                                       └── other ────▶ errors
//! ```
//!
//! Every entry keeps the index of the request it answers, so results can be
//! re-associated with the source rows after partitioning.

use crate::config::RemoteConfig;
use crate::document::{compare_markers, ChangeRow, Document};
use crate::error::{ReplicationError, Result};
use crate::remote::parse_etag;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Path segments that may precede an object id.
const ID_PARENTS: [&str; 4] = ["buckets", "groups", "collections", "records"];

/// HTTP method of a batch sub-request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BatchMethod {
    Put,
    Patch,
    Delete,
}

impl fmt::Display for BatchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchMethod::Put => "PUT",
            BatchMethod::Patch => "PATCH",
            BatchMethod::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

/// One sub-request of a batch write.
///
/// Serializes to the wire shape `{ method, path, headers, body }`. The source
/// row rides along for aggregation and is never sent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchRequest {
    pub method: BatchMethod,
    pub path: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(skip)]
    pub row: ChangeRow,
}

impl BatchRequest {
    /// Build the sub-request for a pending row.
    ///
    /// - deletion: `DELETE`, guarded by `If-Match` when a revision is known
    /// - known revision: `PATCH` with `If-Match: "<revision>"`
    /// - no revision: `PUT` with `If-None-Match: *`
    pub fn from_row(row: &ChangeRow, remote: &RemoteConfig) -> Self {
        let doc = &row.new_document_state;
        let path = remote.record_path(&doc.id);
        let mut headers = BTreeMap::new();

        let (method, body) = if doc.deleted {
            if let Some(revision) = row.revision() {
                headers.insert("If-Match".to_string(), format!("\"{}\"", revision));
            }
            (BatchMethod::Delete, None)
        } else if let Some(revision) = row.revision() {
            headers.insert("If-Match".to_string(), format!("\"{}\"", revision));
            (BatchMethod::Patch, Some(json!({ "data": doc.to_remote_data() })))
        } else {
            headers.insert("If-None-Match".to_string(), "*".to_string());
            (BatchMethod::Put, Some(json!({ "data": doc.to_remote_data() })))
        };

        Self {
            method,
            path,
            headers,
            body,
            row: row.clone(),
        }
    }

    pub fn id(&self) -> &str {
        self.row.id()
    }

    pub fn is_delete(&self) -> bool {
        self.method == BatchMethod::Delete
    }
}

/// One sub-response of a batch write.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BatchResponse {
    pub status: u16,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub body: Value,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl BatchResponse {
    pub fn new(status: u16, path: impl Into<String>, body: Value) -> Self {
        Self {
            status,
            path: path.into(),
            body,
            headers: BTreeMap::new(),
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Direction of a conflict. Only outgoing writes conflict here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictType {
    Outgoing,
}

/// Accepted write.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedEntry {
    pub index: usize,
    pub document: Document,
}

/// Write rejected because the remote moved.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictEntry {
    pub index: usize,
    pub kind: ConflictType,
    pub status: u16,
    pub local: Document,
    /// `None` when the remote reported no existing record (deletion race).
    pub remote: Option<Document>,
}

/// Write whose target does not exist remotely.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedEntry {
    pub index: usize,
    pub id: String,
    pub path: String,
    pub error: Value,
}

/// Any other failure.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorEntry {
    pub index: usize,
    pub path: String,
    pub status: u16,
    pub sent: BatchRequest,
    pub error: Value,
}

/// Four-way partition of a batch write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregatedResult {
    pub published: Vec<PublishedEntry>,
    pub conflicts: Vec<ConflictEntry>,
    pub skipped: Vec<SkippedEntry>,
    pub errors: Vec<ErrorEntry>,
    /// Highest collection marker reported by the sub-responses.
    pub last_modified: Option<String>,
}

impl AggregatedResult {
    /// Number of entries across all four buckets.
    pub fn total(&self) -> usize {
        self.published.len() + self.conflicts.len() + self.skipped.len() + self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// True when everything was published.
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty() && self.skipped.is_empty() && self.errors.is_empty()
    }

    /// All request indices, sorted. Each index appears exactly once.
    pub fn indices(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = self
            .published
            .iter()
            .map(|e| e.index)
            .chain(self.conflicts.iter().map(|e| e.index))
            .chain(self.skipped.iter().map(|e| e.index))
            .chain(self.errors.iter().map(|e| e.index))
            .collect();
        indices.sort_unstable();
        indices
    }

    /// Fold the outcome of a resubmission pass back into this result.
    ///
    /// `original[i]` is the index, in this result, of `requests[i]`, the
    /// `i`-th resubmitted request. Resubmitted rows leave `skipped` and
    /// `conflicts`; a success becomes `published`, anything else an `errors`
    /// entry.
    pub fn absorb_resubmission(
        &mut self,
        original: &[usize],
        requests: &[BatchRequest],
        retried: AggregatedResult,
    ) {
        let moved: HashSet<usize> = original.iter().copied().collect();
        self.skipped.retain(|e| !moved.contains(&e.index));
        self.conflicts.retain(|e| !moved.contains(&e.index));

        let remap = |i: usize| original.get(i).copied().unwrap_or(i);

        for mut entry in retried.published {
            entry.index = remap(entry.index);
            self.published.push(entry);
        }
        for mut entry in retried.errors {
            entry.index = remap(entry.index);
            self.errors.push(entry);
        }

        let failed = retried
            .conflicts
            .into_iter()
            .map(|e| (e.index, e.status, json!({ "message": "conflict on resubmitted create" })))
            .chain(retried.skipped.into_iter().map(|e| (e.index, 404, e.error)));

        for (index, status, error) in failed {
            let Some(sent) = requests.get(index).cloned() else {
                continue;
            };
            self.errors.push(ErrorEntry {
                index: remap(index),
                path: sent.path.clone(),
                status,
                sent,
                error,
            });
        }

        self.last_modified = max_marker(self.last_modified.take(), retried.last_modified);
    }
}

/// Partition `responses` against the `requests` that produced them.
///
/// Fails with a protocol error when the counts differ, since index
/// correspondence is lost.
pub fn aggregate(requests: &[BatchRequest], responses: Vec<BatchResponse>) -> Result<AggregatedResult> {
    if requests.len() != responses.len() {
        return Err(ReplicationError::Protocol(format!(
            "batch returned {} responses for {} requests",
            responses.len(),
            requests.len()
        )));
    }

    let mut result = AggregatedResult::default();

    for (index, (request, response)) in requests.iter().zip(responses).enumerate() {
        if let Some(marker) = response.header("ETag").and_then(parse_etag) {
            result.last_modified = max_marker(result.last_modified.take(), Some(marker));
        }

        match response.status {
            200..=299 => {
                let document = published_document(request, &response);
                result.published.push(PublishedEntry { index, document });
            }
            404 => {
                let path = if response.path.is_empty() {
                    request.path.clone()
                } else {
                    response.path
                };
                let id = extract_id(&path)
                    .map(str::to_string)
                    .unwrap_or_else(|| request.id().to_string());
                result.skipped.push(SkippedEntry {
                    index,
                    id,
                    path,
                    error: response.body,
                });
            }
            409 | 412 => {
                let remote = existing_record(&response.body)?;
                result.conflicts.push(ConflictEntry {
                    index,
                    kind: ConflictType::Outgoing,
                    status: response.status,
                    local: request.row.new_document_state.clone(),
                    remote,
                });
            }
            status => {
                let path = if response.path.is_empty() {
                    request.path.clone()
                } else {
                    response.path
                };
                result.errors.push(ErrorEntry {
                    index,
                    path,
                    status,
                    sent: request.clone(),
                    error: response.body,
                });
            }
        }
    }

    Ok(result)
}

/// Id at the end of an object path such as `/buckets/b/collections/c/records/<id>`.
pub fn extract_id(path: &str) -> Option<&str> {
    let mut segments = path.rsplit('/');
    let id = segments.next().filter(|s| !s.is_empty())?;
    let parent = segments.next()?;
    ID_PARENTS.contains(&parent).then_some(id)
}

fn published_document(request: &BatchRequest, response: &BatchResponse) -> Document {
    match response.body.get("data") {
        Some(data) => match Document::from_remote(data.clone()) {
            Ok(mut doc) => {
                if request.is_delete() {
                    doc.deleted = true;
                    doc.fields.clear();
                }
                doc
            }
            Err(_) => request.row.new_document_state.clone(),
        },
        None => request.row.new_document_state.clone(),
    }
}

/// The remote record from a conflict body (`details.existing`).
fn existing_record(body: &Value) -> Result<Option<Document>> {
    match body.pointer("/details/existing") {
        None | Some(Value::Null) => Ok(None),
        Some(existing @ Value::Object(_)) => Document::from_remote(existing.clone()).map(Some),
        Some(other) => Err(ReplicationError::Protocol(format!(
            "conflict carries invalid existing record: {}",
            other
        ))),
    }
}

fn max_marker(a: Option<String>, b: Option<String>) -> Option<String> {
    match (a, b) {
        (Some(a), Some(b)) => {
            if compare_markers(&b, &a).is_gt() {
                Some(b)
            } else {
                Some(a)
            }
        }
        (a, b) => a.or(b),
    }
}
