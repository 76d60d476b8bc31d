// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local collection integration traits.
//!
//! The replication engine does not own the local store. It drives any
//! collection that implements [`ReplicationCapable`]:
//!
//! 1. Import pulled documents (`import_batch`)
//! 2. Hand out writes waiting to be pushed (`pending_local_writes`)
//! 3. Report its own change marker (`get_metadata`)
//! 4. Take back the remote's answer to a push (`acknowledge_writes`, `store_resolution`)
//!
//! A push is not atomic with local edits: the user may change a document
//! again while its previous state is on the wire. The answer to a push names
//! the state that was `pushed`, and a pending write is only settled while it
//! still holds that state. A newer edit stays pending, rebased onto the
//! remote's copy.
//!
//! [`MemoryCollection`] is a complete in-process implementation used by the
//! tests and handy for prototyping.
//!
//! # Example
//!
//! ```rust,no_run
//! use kinto_replication::collection::{
//!     Acknowledgement, BoxFuture, CollectionMetadata, ReplicationCapable, Resolution,
//! };
//! use kinto_replication::document::{ChangeRow, Document};
//!
//! struct MyStore { /* ... */ }
//!
//! impl ReplicationCapable for MyStore {
//!     fn import_batch(&self, _documents: Vec<Document>) -> BoxFuture<'_, ()> {
//!         Box::pin(async move { Ok(()) })
//!     }
//!
//!     fn pending_local_writes(&self, _limit: usize) -> BoxFuture<'_, Vec<ChangeRow>> {
//!         Box::pin(async move { Ok(vec![]) })
//!     }
//!
//!     fn get_metadata(&self) -> BoxFuture<'_, CollectionMetadata> {
//!         Box::pin(async move { Ok(CollectionMetadata::default()) })
//!     }
//!
//!     fn store_resolution(&self, _resolution: Resolution) -> BoxFuture<'_, ()> {
//!         Box::pin(async move { Ok(()) })
//!     }
//!
//!     fn acknowledge_writes(&self, _writes: Vec<Acknowledgement>) -> BoxFuture<'_, ()> {
//!         Box::pin(async move { Ok(()) })
//!     }
//! }
//! ```

use crate::document::{compare_markers, ChangeRow, Document};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

/// Result type for local collection operations.
pub type CollectionResult<T> = std::result::Result<T, CollectionError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = CollectionResult<T>> + Send + 'a>>;

/// Simplified error for local collection operations.
#[derive(Debug, Clone)]
pub struct CollectionError(pub String);

impl std::fmt::Display for CollectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for CollectionError {}

impl From<CollectionError> for crate::error::ReplicationError {
    fn from(err: CollectionError) -> Self {
        crate::error::ReplicationError::LocalStorage(err.0)
    }
}

/// The local collection's own change marker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionMetadata {
    pub last_modified: Option<String>,
}

/// A pushed write the remote accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct Acknowledgement {
    /// The pending state that was sent.
    pub pushed: Document,
    /// The remote's copy, the new master state. A tombstone if the record is
    /// gone remotely.
    pub remote: Document,
}

impl Acknowledgement {
    pub fn new(pushed: Document, remote: Document) -> Self {
        Self { pushed, remote }
    }
}

/// Outcome of a push conflict, handed back to the local collection.
///
/// `pushed` (`local` for [`Resolution::Unresolved`]) is the pending state the
/// conflict was raised for. If the pending write changed since, the newer
/// write wins over the resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Adopt the remote state and drop the pending local write.
    AcceptRemote { pushed: Document, remote: Document },
    /// Keep `document` as a pending write on top of the remote state.
    Rewrite {
        pushed: Document,
        remote: Option<Document>,
        document: Document,
    },
    /// Left to the application. Should not be offered for push again until
    /// the application resolves it.
    Unresolved {
        local: Document,
        remote: Option<Document>,
    },
}

impl Resolution {
    pub fn id(&self) -> &str {
        match self {
            Resolution::AcceptRemote { pushed, .. } => &pushed.id,
            Resolution::Rewrite { pushed, .. } => &pushed.id,
            Resolution::Unresolved { local, .. } => &local.id,
        }
    }
}

/// What the replication engine needs from a local collection.
///
/// Implementations must make `import_batch` an idempotent upsert by id, so a
/// redelivered page is harmless.
pub trait ReplicationCapable: Send + Sync + 'static {
    /// Upsert remote documents. Tombstones remove the document locally.
    fn import_batch(&self, documents: Vec<Document>) -> BoxFuture<'_, ()>;

    /// Local mutations not yet acknowledged by the remote, oldest first.
    fn pending_local_writes(&self, limit: usize) -> BoxFuture<'_, Vec<ChangeRow>>;

    /// The collection's own change marker.
    fn get_metadata(&self) -> BoxFuture<'_, CollectionMetadata>;

    /// Record a conflict outcome.
    fn store_resolution(&self, resolution: Resolution) -> BoxFuture<'_, ()>;

    /// Accept the remote's copy of successfully pushed documents as the new
    /// master state.
    ///
    /// A pending write is settled only while it still holds `pushed`. One
    /// edited again in the meantime must stay pending, with the remote copy
    /// as its assumed master state.
    fn acknowledge_writes(&self, writes: Vec<Acknowledgement>) -> BoxFuture<'_, ()>;
}

/// Remove the pending row for `pushed` if it still holds that state.
///
/// Returns the index of the row for the same id that was edited since.
fn take_pushed(pending: &mut Vec<ChangeRow>, pushed: &Document) -> Option<usize> {
    let index = pending.iter().position(|r| r.id() == pushed.id)?;
    if pending[index].new_document_state == *pushed {
        pending.remove(index);
        None
    } else {
        Some(index)
    }
}

/// The master state a remote copy stands for.
fn live(remote: &Document) -> Option<Document> {
    (!remote.deleted).then(|| remote.clone())
}

/// In-memory [`ReplicationCapable`] collection.
///
/// Keeps the last known remote state of each document (the master) apart from
/// local edits waiting to be pushed.
#[derive(Debug, Default)]
pub struct MemoryCollection {
    masters: RwLock<BTreeMap<String, Document>>,
    pending: RwLock<Vec<ChangeRow>>,
    conflicted: RwLock<Vec<Resolution>>,
    imports: RwLock<Vec<Vec<Document>>>,
    last_modified: RwLock<Option<String>>,
    fail_imports: AtomicUsize,
    fail_reads: AtomicUsize,
}

impl MemoryCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or update a document locally, queuing it for push.
    pub async fn put(&self, document: Document) {
        let assumed = self.masters.read().await.get(&document.id).cloned();
        self.queue(ChangeRow {
            assumed_master_state: assumed,
            new_document_state: document,
        })
        .await;
    }

    /// Delete a document locally, queuing the deletion for push.
    pub async fn remove(&self, id: &str) {
        let assumed = self.masters.read().await.get(id).cloned();
        let tombstone = Document::tombstone(id, assumed.as_ref().and_then(|d| d.last_modified));
        self.queue(ChangeRow {
            assumed_master_state: assumed,
            new_document_state: tombstone,
        })
        .await;
    }

    /// Queue a raw change row, replacing any pending row for the same id.
    pub async fn queue(&self, row: ChangeRow) {
        let mut pending = self.pending.write().await;
        match pending.iter_mut().find(|r| r.id() == row.id()) {
            Some(existing) => existing.new_document_state = row.new_document_state,
            None => pending.push(row),
        }
    }

    /// Visible state: the pending local write if any, else the master.
    pub async fn get(&self, id: &str) -> Option<Document> {
        if let Some(row) = self.pending.read().await.iter().find(|r| r.id() == id) {
            return (!row.new_document_state.deleted).then(|| row.new_document_state.clone());
        }
        self.masters.read().await.get(id).cloned()
    }

    /// Last known remote state of a document.
    pub async fn master(&self, id: &str) -> Option<Document> {
        self.masters.read().await.get(id).cloned()
    }

    /// All master documents, ordered by id.
    pub async fn documents(&self) -> Vec<Document> {
        self.masters.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.masters.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.masters.read().await.is_empty()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    /// Conflicts left for the application.
    pub async fn conflicted(&self) -> Vec<Resolution> {
        self.conflicted.read().await.clone()
    }

    /// Every imported batch, in import order.
    pub async fn import_log(&self) -> Vec<Vec<Document>> {
        self.imports.read().await.clone()
    }

    /// Make the next `n` imports fail.
    pub fn fail_next_imports(&self, n: usize) {
        self.fail_imports.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` reads of pending writes fail.
    pub fn fail_next_reads(&self, n: usize) {
        self.fail_reads.store(n, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn apply(&self, documents: &[Document]) {
        let mut masters = self.masters.write().await;
        let mut last_modified = self.last_modified.write().await;

        for doc in documents {
            let current = masters.get(&doc.id).and_then(|m| m.last_modified);
            if let (Some(current), Some(incoming)) = (current, doc.last_modified) {
                if incoming < current {
                    continue;
                }
            }
            if doc.deleted {
                masters.remove(&doc.id);
            } else {
                masters.insert(doc.id.clone(), doc.clone());
            }
            if let Some(marker) = doc.marker() {
                let newer = last_modified
                    .as_deref()
                    .map_or(true, |current| compare_markers(&marker, current).is_gt());
                if newer {
                    *last_modified = Some(marker);
                }
            }
        }
    }
}

impl ReplicationCapable for MemoryCollection {
    fn import_batch(&self, documents: Vec<Document>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if Self::take_failure(&self.fail_imports) {
                return Err(CollectionError("injected import failure".to_string()));
            }
            self.apply(&documents).await;
            self.imports.write().await.push(documents);
            Ok(())
        })
    }

    fn pending_local_writes(&self, limit: usize) -> BoxFuture<'_, Vec<ChangeRow>> {
        Box::pin(async move {
            if Self::take_failure(&self.fail_reads) {
                return Err(CollectionError("injected read failure".to_string()));
            }
            Ok(self.pending.read().await.iter().take(limit).cloned().collect())
        })
    }

    fn get_metadata(&self) -> BoxFuture<'_, CollectionMetadata> {
        Box::pin(async move {
            Ok(CollectionMetadata {
                last_modified: self.last_modified.read().await.clone(),
            })
        })
    }

    fn store_resolution(&self, resolution: Resolution) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            match resolution {
                Resolution::AcceptRemote { pushed, remote } => {
                    {
                        let mut pending = self.pending.write().await;
                        if let Some(newer) = take_pushed(&mut pending, &pushed) {
                            pending[newer].assumed_master_state = live(&remote);
                        }
                    }
                    self.apply(std::slice::from_ref(&remote)).await;
                }
                Resolution::Rewrite {
                    pushed,
                    remote,
                    document,
                } => {
                    if let Some(remote) = &remote {
                        self.apply(std::slice::from_ref(remote)).await;
                    }
                    let mut pending = self.pending.write().await;
                    match take_pushed(&mut pending, &pushed) {
                        Some(newer) => pending[newer].assumed_master_state = remote,
                        None => pending.push(ChangeRow {
                            assumed_master_state: remote,
                            new_document_state: document,
                        }),
                    }
                }
                Resolution::Unresolved { local, remote } => {
                    // A newer edit stays queued as is and meets the conflict again.
                    let mut pending = self.pending.write().await;
                    if take_pushed(&mut pending, &local).is_none() {
                        self.conflicted
                            .write()
                            .await
                            .push(Resolution::Unresolved { local, remote });
                    }
                }
            }
            Ok(())
        })
    }

    fn acknowledge_writes(&self, writes: Vec<Acknowledgement>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if Self::take_failure(&self.fail_imports) {
                return Err(CollectionError("injected import failure".to_string()));
            }
            {
                let mut pending = self.pending.write().await;
                for write in &writes {
                    if let Some(newer) = take_pushed(&mut pending, &write.pushed) {
                        pending[newer].assumed_master_state = live(&write.remote);
                    }
                }
            }
            let remotes: Vec<Document> = writes.into_iter().map(|w| w.remote).collect();
            self.apply(&remotes).await;
            Ok(())
        })
    }
}
