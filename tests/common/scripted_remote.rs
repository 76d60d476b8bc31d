//! In-memory Kinto collection for replication tests.
//!
//! Emulates the parts of the Kinto record API the engine relies on:
//! - `_since` listing sorted by `last_modified`, with `has_more` paging
//! - tombstones for deleted records
//! - `If-None-Match: *` and `If-Match: "<lm>"` preconditions (412 with
//!   `details.existing`), 404 on PATCH/DELETE of a missing record
//!
//! Failures can be scripted per operation and every call is recorded.
//!
//! # Example
//! ```rust,ignore
//! let remote = ScriptedRemote::new();
//! remote.insert_at("a", "first", 100).await;
//! remote.fail_next_poll(ReplicationError::timeout("poll_changes")).await;
//!
//! // ... replicate ...
//!
//! assert_eq!(remote.list_calls().await[0], Checkpoint::start());
//! ```

use kinto_replication::batch::{extract_id, BatchMethod, BatchRequest, BatchResponse};
use kinto_replication::remote::{BoxFuture, ChangesPage, RemoteCollection, RemoteInfo};
use kinto_replication::{Checkpoint, Document, ReplicationError, Result};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Default)]
struct Records {
    /// Live records and tombstones, by id.
    by_id: BTreeMap<String, Document>,
    /// Collection timestamp. Every write moves it forward.
    clock: u64,
}

impl Records {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn live(&self, id: &str) -> Option<&Document> {
        self.by_id.get(id).filter(|d| !d.deleted)
    }
}

/// Stateful remote collection with scripted failures.
#[derive(Default)]
pub struct ScriptedRemote {
    records: RwLock<Records>,
    list_failures: RwLock<VecDeque<ReplicationError>>,
    poll_failures: RwLock<VecDeque<ReplicationError>>,
    batch_failures: RwLock<VecDeque<ReplicationError>>,
    list_calls: RwLock<Vec<Checkpoint>>,
    batch_calls: RwLock<Vec<Vec<BatchRequest>>>,
    poll_count: AtomicUsize,
}

impl ScriptedRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a record remotely with the next timestamp.
    pub async fn insert(&self, id: &str, title: &str) -> Document {
        let mut records = self.records.write().await;
        let marker = records.tick();
        let doc = titled(id, title).with_last_modified(marker);
        records.by_id.insert(id.to_string(), doc.clone());
        doc
    }

    /// Write a record remotely at an explicit timestamp.
    pub async fn insert_at(&self, id: &str, title: &str, marker: u64) -> Document {
        let mut records = self.records.write().await;
        records.clock = records.clock.max(marker);
        let doc = titled(id, title).with_last_modified(marker);
        records.by_id.insert(id.to_string(), doc.clone());
        doc
    }

    /// Delete a record remotely, leaving a tombstone.
    pub async fn delete(&self, id: &str) {
        let mut records = self.records.write().await;
        let marker = records.tick();
        records
            .by_id
            .insert(id.to_string(), Document::tombstone(id, Some(marker)));
    }

    pub async fn record(&self, id: &str) -> Option<Document> {
        self.records.read().await.live(id).cloned()
    }

    pub async fn live_records(&self) -> Vec<Document> {
        self.records
            .read()
            .await
            .by_id
            .values()
            .filter(|d| !d.deleted)
            .cloned()
            .collect()
    }

    pub async fn timestamp(&self) -> u64 {
        self.records.read().await.clock
    }

    pub async fn fail_next_list(&self, error: ReplicationError) {
        self.list_failures.write().await.push_back(error);
    }

    pub async fn fail_next_poll(&self, error: ReplicationError) {
        self.poll_failures.write().await.push_back(error);
    }

    pub async fn fail_next_batch(&self, error: ReplicationError) {
        self.batch_failures.write().await.push_back(error);
    }

    /// `since` of every list request, long-poll reads included.
    pub async fn list_calls(&self) -> Vec<Checkpoint> {
        self.list_calls.read().await.clone()
    }

    pub async fn batch_calls(&self) -> Vec<Vec<BatchRequest>> {
        self.batch_calls.read().await.clone()
    }

    pub fn poll_count(&self) -> usize {
        self.poll_count.load(Ordering::SeqCst)
    }

    async fn changes(&self, since: &Checkpoint, limit: usize) -> Result<ChangesPage> {
        self.list_calls.write().await.push(since.clone());
        if let Some(error) = self.list_failures.write().await.pop_front() {
            return Err(error);
        }

        let after = since
            .marker()
            .and_then(|m| m.parse::<u64>().ok())
            .unwrap_or(0);
        let records = self.records.read().await;
        let mut changed: Vec<Document> = records
            .by_id
            .values()
            .filter(|d| d.last_modified.unwrap_or(0) > after)
            .cloned()
            .collect();
        changed.sort_by_key(|d| d.last_modified);

        let has_more = changed.len() > limit;
        changed.truncate(limit);
        Ok(ChangesPage::new(
            changed,
            Some(records.clock.to_string()),
            has_more,
        ))
    }

    async fn write(&self, requests: &[BatchRequest]) -> Result<Vec<BatchResponse>> {
        self.batch_calls.write().await.push(requests.to_vec());
        if let Some(error) = self.batch_failures.write().await.pop_front() {
            return Err(error);
        }

        let mut records = self.records.write().await;
        Ok(requests.iter().map(|r| apply(&mut records, r)).collect())
    }
}

fn apply(records: &mut Records, request: &BatchRequest) -> BatchResponse {
    let id = extract_id(&request.path).unwrap_or(request.id()).to_string();
    let existing = records.live(&id).cloned();

    let expected = request
        .headers
        .get("If-Match")
        .and_then(|v| v.trim_matches('"').parse::<u64>().ok());
    let must_be_new = request.headers.get("If-None-Match").is_some_and(|v| v == "*");

    let precondition_failed = match (&existing, expected) {
        (Some(_), _) if must_be_new => true,
        (Some(current), Some(expected)) => current.last_modified != Some(expected),
        _ => false,
    };
    if precondition_failed {
        let existing = existing.map(|d| serde_json::to_value(d).unwrap_or(Value::Null));
        return BatchResponse::new(
            412,
            request.path.clone(),
            json!({ "code": 412, "details": { "existing": existing } }),
        );
    }

    let data = request
        .body
        .as_ref()
        .and_then(|b| b.get("data"))
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    match request.method {
        BatchMethod::Put => {
            let status = if existing.is_some() { 200 } else { 201 };
            let stored = store(records, &id, data);
            BatchResponse::new(status, request.path.clone(), json!({ "data": stored }))
        }
        BatchMethod::Patch => {
            let Some(mut current) = existing else {
                return not_found(request);
            };
            for (k, v) in data {
                if k != "id" {
                    current.fields.insert(k, v);
                }
            }
            let stored = store(records, &id, current.fields);
            BatchResponse::new(200, request.path.clone(), json!({ "data": stored }))
        }
        BatchMethod::Delete => {
            if existing.is_none() {
                return not_found(request);
            }
            let marker = records.tick();
            records
                .by_id
                .insert(id.clone(), Document::tombstone(id.clone(), Some(marker)));
            BatchResponse::new(
                200,
                request.path.clone(),
                json!({ "data": { "id": id, "deleted": true, "last_modified": marker } }),
            )
        }
    }
}

fn store(records: &mut Records, id: &str, mut fields: Map<String, Value>) -> Value {
    fields.remove("id");
    let marker = records.tick();
    let doc = Document::new(id, fields).with_last_modified(marker);
    records.by_id.insert(id.to_string(), doc.clone());
    serde_json::to_value(doc).unwrap_or(Value::Null)
}

fn not_found(request: &BatchRequest) -> BatchResponse {
    BatchResponse::new(
        404,
        request.path.clone(),
        json!({ "code": 404, "errno": 110, "error": "Not Found" }),
    )
}

impl RemoteCollection for ScriptedRemote {
    fn info(&self) -> BoxFuture<'_, Result<RemoteInfo>> {
        Box::pin(async move {
            Ok(RemoteInfo {
                last_modified: Some(self.timestamp().await.to_string()),
            })
        })
    }

    fn list_changes<'a>(
        &'a self,
        since: &'a Checkpoint,
        limit: usize,
    ) -> BoxFuture<'a, Result<ChangesPage>> {
        Box::pin(self.changes(since, limit))
    }

    fn get_record<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Document>>> {
        Box::pin(async move { Ok(self.record(id).await) })
    }

    fn batch_write<'a>(
        &'a self,
        requests: &'a [BatchRequest],
    ) -> BoxFuture<'a, Result<Vec<BatchResponse>>> {
        Box::pin(self.write(requests))
    }

    fn poll_changes<'a>(
        &'a self,
        since: &'a Checkpoint,
        limit: usize,
        heartbeat: Duration,
    ) -> BoxFuture<'a, Result<ChangesPage>> {
        Box::pin(async move {
            self.poll_count.fetch_add(1, Ordering::SeqCst);
            if let Some(error) = self.poll_failures.write().await.pop_front() {
                return Err(error);
            }
            tokio::time::sleep(heartbeat).await;
            self.changes(since, limit).await
        })
    }
}

/// Document with a single `title` field.
pub fn titled(id: &str, title: &str) -> Document {
    let mut fields = Map::new();
    fields.insert("title".to_string(), json!(title));
    Document::new(id, fields)
}
