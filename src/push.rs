//! Push pipeline: pending local writes to the remote.
//!
//! # Passes
//!
//! ```text
//! pending rows ──▶ batch_write ──▶ aggregate ──┬── published ──────────────▶ acknowledge
//!                                              ├── skipped (not delete) ──▶ resubmit as create
//!                                              ├── conflicts, no remote ──▶ resubmit as create
//!                                              ├── conflicts ─────────────▶ resolver
//!                                              └── errors ────────────────▶ error stream
//! ```
//!
//! Each row is resubmitted at most once per push. A resubmitted create that
//! fails again lands in `errors` instead of looping.

use crate::batch::{aggregate, AggregatedResult, BatchRequest, ConflictEntry, ErrorEntry};
use crate::circuit_breaker::LocalStoreCircuit;
use crate::collection::{Acknowledgement, ReplicationCapable, Resolution};
use crate::config::RemoteConfig;
use crate::conflict::{ConflictResolver, ConflictVerdict};
use crate::document::{ChangeRow, Document};
use crate::error::{ReplicationError, Result};
use crate::pull::{local_error, DocumentModifier};
use crate::remote::RemoteCollection;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Outcome of one push invocation.
#[derive(Debug, Clone, Default)]
pub struct PushReport {
    /// Final partition, indices relative to `rows`.
    pub result: AggregatedResult,
    /// Rows actually sent, after the push modifier.
    pub rows: Vec<ChangeRow>,
    /// Pending state behind each sent row, before the push modifier.
    pub pushed: Vec<Document>,
    /// Rows read from the local collection, including any the modifier dropped.
    pub fetched: usize,
    /// Rows sent a second time as creates.
    pub resubmitted: usize,
    /// Remote collection marker seen before the batch, if the info call worked.
    pub remote_last_modified: Option<String>,
}

impl PushReport {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The pending state behind sent row `index`.
    pub fn pushed(&self, index: usize) -> Option<&Document> {
        self.pushed.get(index)
    }
}

/// What settling a push did to the local collection.
#[derive(Debug, Default)]
pub struct Settlement {
    /// Documents whose remote copy became the new master state.
    pub acknowledged: usize,
    /// Conflicts the resolver decided.
    pub resolved: usize,
    /// Conflicts left for the application.
    pub unresolved: Vec<ConflictEntry>,
    /// One error per failed row. Reported, never escalated.
    pub item_errors: Vec<ReplicationError>,
}

pub struct PushPipeline {
    replication_id: String,
    remote: Arc<dyn RemoteCollection>,
    collection: Arc<dyn ReplicationCapable>,
    remote_config: RemoteConfig,
    circuit: Arc<LocalStoreCircuit>,
    batch_size: usize,
    modifier: Option<DocumentModifier>,
}

impl PushPipeline {
    pub fn new(
        replication_id: impl Into<String>,
        remote: Arc<dyn RemoteCollection>,
        collection: Arc<dyn ReplicationCapable>,
        remote_config: RemoteConfig,
        batch_size: usize,
    ) -> Self {
        Self {
            replication_id: replication_id.into(),
            remote,
            collection,
            remote_config,
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

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Push up to one batch of pending local writes.
    #[instrument(skip(self), fields(replication_id = %self.replication_id))]
    pub async fn run(&self) -> Result<PushReport> {
        let rows = self
            .collection
            .pending_local_writes(self.batch_size)
            .await?;
        self.push_rows(rows).await
    }

    /// Push the given rows: batch, aggregate, then at most one resubmission
    /// pass per row.
    pub async fn push_rows(&self, rows: Vec<ChangeRow>) -> Result<PushReport> {
        if rows.is_empty() {
            return Ok(PushReport::default());
        }
        let fetched = rows.len();
        let start = Instant::now();

        // Only an optimization hint; a failure here must not block the push.
        let remote_last_modified = match self.remote.info().await {
            Ok(info) => info.last_modified,
            Err(e) => {
                debug!(error = %e, "Remote info unavailable before push");
                None
            }
        };

        let (pushed, rows): (Vec<Document>, Vec<ChangeRow>) =
            self.apply_modifier(rows).into_iter().unzip();
        if rows.is_empty() {
            return Ok(PushReport {
                fetched,
                ..Default::default()
            });
        }

        let requests: Vec<BatchRequest> = rows
            .iter()
            .map(|row| BatchRequest::from_row(row, &self.remote_config))
            .collect();
        let responses = self.remote.batch_write(&requests).await?;
        let mut result = aggregate(&requests, responses)?;

        // Updates whose target vanished become creates.
        let missing: Vec<usize> = result
            .skipped
            .iter()
            .map(|e| e.index)
            .filter(|&i| !requests[i].is_delete())
            .collect();
        let mut resubmitted = self.resubmit(&mut result, &rows, missing).await?;

        // Conflicts against a concurrently deleted record become creates too.
        let raced: Vec<usize> = result
            .conflicts
            .iter()
            .filter(|e| e.remote.is_none() && !e.local.deleted)
            .map(|e| e.index)
            .collect();
        resubmitted += self.resubmit(&mut result, &rows, raced).await?;

        crate::metrics::record_push_result(
            &self.replication_id,
            result.published.len(),
            result.conflicts.len(),
            result.skipped.len(),
            result.errors.len(),
            start.elapsed(),
        );
        crate::metrics::record_resubmissions(&self.replication_id, resubmitted);

        info!(
            rows = rows.len(),
            published = result.published.len(),
            conflicts = result.conflicts.len(),
            skipped = result.skipped.len(),
            errors = result.errors.len(),
            resubmitted,
            "Push complete"
        );

        Ok(PushReport {
            result,
            rows,
            pushed,
            fetched,
            resubmitted,
            remote_last_modified,
        })
    }

    async fn resubmit(
        &self,
        result: &mut AggregatedResult,
        rows: &[ChangeRow],
        indices: Vec<usize>,
    ) -> Result<usize> {
        if indices.is_empty() {
            return Ok(0);
        }

        let requests: Vec<BatchRequest> = indices
            .iter()
            .map(|&i| BatchRequest::from_row(&rows[i].as_create(), &self.remote_config))
            .collect();
        debug!(count = requests.len(), "Resubmitting rows as creates");

        let responses = self.remote.batch_write(&requests).await?;
        let retried = aggregate(&requests, responses)?;
        result.absorb_resubmission(&indices, &requests, retried);
        Ok(indices.len())
    }

    /// Pair each row to send with the pending state it came from.
    fn apply_modifier(&self, rows: Vec<ChangeRow>) -> Vec<(Document, ChangeRow)> {
        rows.into_iter()
            .filter_map(|row| {
                let pushed = row.new_document_state.clone();
                let Some(modifier) = &self.modifier else {
                    return Some((pushed, row));
                };
                let ChangeRow {
                    assumed_master_state,
                    new_document_state,
                } = row;
                modifier(new_document_state).map(|doc| {
                    let row = ChangeRow {
                        assumed_master_state,
                        new_document_state: doc,
                    };
                    (pushed, row)
                })
            })
            .collect()
    }

    /// Hand the remote's answer back to the local collection.
    ///
    /// Published rows and deletes of already missing records are acknowledged.
    /// Each conflict goes through `resolver`; what it cannot decide is
    /// returned for the application. A local write failure aborts settling so
    /// the rows stay pending for the next cycle. Rows edited again since
    /// `report` was taken keep their newer state.
    pub async fn settle(
        &self,
        report: &PushReport,
        resolver: &dyn ConflictResolver,
    ) -> Result<Settlement> {
        let mut settlement = Settlement::default();
        let result = &report.result;

        let mut acknowledged: Vec<Acknowledgement> = result
            .published
            .iter()
            .filter_map(|e| {
                let pushed = report.pushed(e.index)?;
                Some(Acknowledgement::new(pushed.clone(), e.document.clone()))
            })
            .collect();
        acknowledged.extend(result.skipped.iter().filter_map(|e| {
            let pushed = report.pushed(e.index)?;
            pushed
                .deleted
                .then(|| Acknowledgement::new(pushed.clone(), Document::tombstone(e.id.clone(), None)))
        }));

        if !acknowledged.is_empty() {
            settlement.acknowledged = acknowledged.len();
            let collection = Arc::clone(&self.collection);
            self.circuit
                .writes
                .call(|| collection.acknowledge_writes(acknowledged))
                .await
                .map_err(local_error)?;
        }

        for conflict in &result.conflicts {
            let pushed = report
                .pushed(conflict.index)
                .cloned()
                .unwrap_or_else(|| conflict.local.clone());
            let resolution = self.resolve(conflict, pushed, resolver);
            if let Resolution::Unresolved { .. } = resolution {
                settlement.unresolved.push(conflict.clone());
            } else {
                settlement.resolved += 1;
            }

            let collection = Arc::clone(&self.collection);
            self.circuit
                .writes
                .call(|| collection.store_resolution(resolution))
                .await
                .map_err(local_error)?;
        }

        settlement.item_errors = result.errors.iter().map(item_error).collect();
        if !settlement.item_errors.is_empty() {
            warn!(
                replication_id = %self.replication_id,
                errors = settlement.item_errors.len(),
                "Rows rejected by the remote"
            );
        }

        Ok(settlement)
    }

    fn resolve(
        &self,
        conflict: &ConflictEntry,
        pushed: Document,
        resolver: &dyn ConflictResolver,
    ) -> Resolution {
        let local = &conflict.local;
        let Some(remote) = &conflict.remote else {
            if local.deleted {
                let remote = Document::tombstone(local.id.clone(), None);
                return Resolution::AcceptRemote { pushed, remote };
            }
            return Resolution::Unresolved {
                local: pushed,
                remote: None,
            };
        };

        let accept = |pushed: Document| Resolution::AcceptRemote {
            pushed,
            remote: remote.clone(),
        };
        let (resolution, outcome) = match resolver.resolve(local, remote) {
            Some(ConflictVerdict::Equal) => (accept(pushed), "equal"),
            Some(ConflictVerdict::Resolved { document }) if document.content_eq(remote) => {
                (accept(pushed), "remote")
            }
            Some(ConflictVerdict::Resolved { document }) => (
                Resolution::Rewrite {
                    pushed,
                    remote: Some(remote.clone()),
                    document,
                },
                "local",
            ),
            None => (
                Resolution::Unresolved {
                    local: pushed,
                    remote: Some(remote.clone()),
                },
                "unresolved",
            ),
        };

        crate::metrics::record_conflict_resolution(&self.replication_id, resolver.name(), outcome);
        debug!(id = %local.id, resolver = resolver.name(), outcome, "Conflict settled");
        resolution
    }
}

fn item_error(entry: &ErrorEntry) -> ReplicationError {
    let status = entry.status;
    if status >= 500 || status == 429 || status == 408 {
        ReplicationError::transport(
            "batch_write",
            format!("{} {} answered {}", entry.sent.method, entry.path, status),
        )
    } else {
        ReplicationError::Protocol(format!(
            "{} {} answered {}: {}",
            entry.sent.method, entry.path, status, entry.error
        ))
    }
}
