//! Pull pipeline: remote changes into the local collection.
//!
//! # Per-Page Flow
//!
//! ```text
//! load checkpoint ──▶ list_changes(since, limit) ──▶ normalize + modifier
//!        ▲                                                  │
//!        │                                                  ▼
//!   has_more? ◀── persist checkpoint ◀── import_batch (must succeed first)
//! ```
//!
//! The checkpoint is persisted only after the page it covers was imported.
//! A failed import leaves the checkpoint where it was, so the page is
//! redelivered on the next attempt (at-least-once). An empty page ends the
//! loop without touching the checkpoint.

use crate::checkpoint::{CheckpointStore, Stored};
use crate::circuit_breaker::{CircuitError, LocalStoreCircuit};
use crate::collection::ReplicationCapable;
use crate::document::{Checkpoint, Document};
use crate::error::{ReplicationError, Result};
use crate::remote::{ChangesPage, RemoteCollection};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Hook applied to each document: transform it, or drop it with `None`.
pub type DocumentModifier = Arc<dyn Fn(Document) -> Option<Document> + Send + Sync>;

/// Outcome of a catch-up pull.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PullReport {
    pub pages: usize,
    pub documents: usize,
    /// Position after the pull.
    pub checkpoint: Checkpoint,
}

pub struct PullPipeline {
    replication_id: String,
    remote: Arc<dyn RemoteCollection>,
    collection: Arc<dyn ReplicationCapable>,
    checkpoints: Arc<dyn CheckpointStore>,
    circuit: Arc<LocalStoreCircuit>,
    batch_size: usize,
    modifier: Option<DocumentModifier>,
}

impl PullPipeline {
    pub fn new(
        replication_id: impl Into<String>,
        remote: Arc<dyn RemoteCollection>,
        collection: Arc<dyn ReplicationCapable>,
        checkpoints: Arc<dyn CheckpointStore>,
        batch_size: usize,
    ) -> Self {
        Self {
            replication_id: replication_id.into(),
            remote,
            collection,
            checkpoints,
            circuit: Arc::new(LocalStoreCircuit::new()),
            batch_size: batch_size.max(1),
            modifier: None,
        }
    }

    pub fn with_circuit(mut self, circuit: Arc<LocalStoreCircuit>) -> Self {
        self.circuit = circuit;
        self
    }

    pub fn with_modifier(mut self, modifier: DocumentModifier) -> Self {
        self.modifier = Some(modifier);
        self
    }

    /// Stored checkpoint, or the start position if none or unreadable.
    pub async fn load_checkpoint(&self) -> Checkpoint {
        match self.checkpoints.get(&self.replication_id).await {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => Checkpoint::start(),
            Err(e) => {
                warn!(
                    replication_id = %self.replication_id,
                    error = %e,
                    "Checkpoint unavailable, pulling from the start"
                );
                Checkpoint::start()
            }
        }
    }

    /// Catch up from the stored checkpoint until the remote has no more pages.
    #[instrument(skip(self), fields(replication_id = %self.replication_id))]
    pub async fn run(&self) -> Result<PullReport> {
        let mut checkpoint = self.load_checkpoint().await;
        let mut report = PullReport {
            checkpoint: checkpoint.clone(),
            ..Default::default()
        };

        loop {
            let page = self.remote.list_changes(&checkpoint, self.batch_size).await?;
            if page.is_empty() {
                debug!(since = ?checkpoint.marker(), "No remote changes");
                break;
            }

            let has_more = page.has_more;
            let documents = page.documents.len();
            let next = self.apply_page(&checkpoint, page).await?;

            report.pages += 1;
            report.documents += documents;

            if has_more && !next.is_after(&checkpoint) {
                return Err(ReplicationError::Protocol(format!(
                    "pagination did not advance past {:?}",
                    checkpoint.marker()
                )));
            }
            checkpoint = next;

            if !has_more {
                break;
            }
        }

        report.checkpoint = checkpoint;
        if report.documents > 0 {
            info!(
                pages = report.pages,
                documents = report.documents,
                checkpoint = ?report.checkpoint.marker(),
                "Pull complete"
            );
        }
        Ok(report)
    }

    /// Import one page and advance the checkpoint past it.
    ///
    /// Returns the new position. If the store already holds a later
    /// checkpoint, that one wins and is returned. On import failure the
    /// stored checkpoint is untouched and the error is returned.
    pub async fn apply_page(&self, since: &Checkpoint, page: ChangesPage) -> Result<Checkpoint> {
        let candidate = page.checkpoint_candidate();
        let documents: Vec<Document> = match &self.modifier {
            Some(modifier) => page.documents.into_iter().filter_map(|d| modifier(d)).collect(),
            None => page.documents,
        };

        let count = documents.len();
        if count > 0 {
            let collection = Arc::clone(&self.collection);
            self.circuit
                .imports
                .call(|| collection.import_batch(documents))
                .await
                .map_err(|e| {
                    if self.circuit.degraded() {
                        warn!(
                            replication_id = %self.replication_id,
                            "Local collection keeps failing, pull is paused until it recovers"
                        );
                    }
                    local_error(e)
                })?;
            crate::metrics::record_pull_batch(&self.replication_id, count);
            debug!(documents = count, "Imported remote page");
        }

        let next = match candidate {
            Some(candidate) => since.advance(&candidate),
            None => since.clone(),
        };

        if next == *since {
            return Ok(next);
        }
        Ok(self.persist(next).await)
    }

    /// Forget the stored checkpoint so the next pull starts from scratch.
    pub async fn reset_checkpoint(&self) -> Result<()> {
        self.checkpoints.delete(&self.replication_id).await?;
        info!(replication_id = %self.replication_id, "Checkpoint reset");
        Ok(())
    }

    async fn persist(&self, checkpoint: Checkpoint) -> Checkpoint {
        match self.checkpoints.set(&self.replication_id, &checkpoint).await {
            Ok(Stored::Advanced) => {
                crate::metrics::record_checkpoint_persist(&self.replication_id, true);
                checkpoint
            }
            Ok(Stored::Kept(stored)) => {
                debug!(
                    stored = ?stored.marker(),
                    offered = ?checkpoint.marker(),
                    "Stored checkpoint is already further along"
                );
                checkpoint.advance(&stored)
            }
            Err(e) => {
                // The in-memory position still advances; a restart re-pulls.
                crate::metrics::record_checkpoint_persist(&self.replication_id, false);
                warn!(
                    replication_id = %self.replication_id,
                    error = %e,
                    "Failed to persist checkpoint"
                );
                checkpoint
            }
        }
    }
}

pub(crate) fn local_error(err: CircuitError<crate::collection::CollectionError>) -> ReplicationError {
    match err {
        CircuitError::Rejected => {
            ReplicationError::LocalStorage("local collection circuit open".to_string())
        }
        CircuitError::Inner(e) => e.into(),
    }
}
