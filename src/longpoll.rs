//! Long-poll loop for live replication.
//!
//! # States
//!
//! ```text
//!            ┌──────────────────────────────────────────┐
//!            ▼                                          │
//! Idle ──▶ Connecting ──▶ Waiting ──┬── changes ──▶ Delivering
//!  │                                ├── empty ─────────────┤
//!  │                                └── error ──▶ Backoff ─┘
//!  └── shutdown ──▶ Stopped
//! ```
//!
//! Delivered pages go to the replication runner over an mpsc channel, which
//! applies them in order. The in-memory `since` marker moves forward after
//! each delivery; a page that reports more results is drained immediately
//! instead of waiting out another heartbeat.
//!
//! Transport errors are published on the error stream and followed by a
//! capped backoff that resets after any success. A fatal error is forwarded
//! to the runner and ends the loop.

use crate::document::Checkpoint;
use crate::error::{ErrorEvent, ErrorSource, ReplicationError};
use crate::remote::{ChangesPage, RemoteCollection};
use crate::resilience::{Backoff, RetryConfig};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

/// Long-poll loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Connecting,
    Waiting,
    Delivering,
    Backoff,
    Stopped,
}

impl fmt::Display for PollState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PollState::Idle => "idle",
            PollState::Connecting => "connecting",
            PollState::Waiting => "waiting",
            PollState::Delivering => "delivering",
            PollState::Backoff => "backoff",
            PollState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// A page of live changes and the position it was requested from.
#[derive(Debug, Clone)]
pub struct LiveBatch {
    pub since: Checkpoint,
    pub page: ChangesPage,
}

/// Message from the loop to the runner.
#[derive(Debug)]
pub enum LiveEvent {
    Batch(LiveBatch),
    /// Unrecoverable remote error. The loop has stopped.
    Fatal(ReplicationError),
}

pub struct LongPoll {
    replication_id: String,
    remote: Arc<dyn RemoteCollection>,
    since: Checkpoint,
    batch_size: usize,
    heartbeat: Duration,
    backoff: Backoff,
    batches: mpsc::Sender<LiveEvent>,
    errors: broadcast::Sender<ErrorEvent>,
    state_tx: watch::Sender<PollState>,
    state_rx: watch::Receiver<PollState>,
}

impl LongPoll {
    pub fn new(
        replication_id: impl Into<String>,
        remote: Arc<dyn RemoteCollection>,
        batches: mpsc::Sender<LiveEvent>,
        errors: broadcast::Sender<ErrorEvent>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(PollState::Idle);
        Self {
            replication_id: replication_id.into(),
            remote,
            since: Checkpoint::start(),
            batch_size: 100,
            heartbeat: Duration::from_secs(60),
            backoff: Backoff::new(RetryConfig::daemon()),
            batches,
            errors,
            state_tx,
            state_rx,
        }
    }

    pub fn with_since(mut self, since: Checkpoint) -> Self {
        self.since = since;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.backoff = Backoff::new(retry);
        self
    }

    /// Observe state transitions.
    pub fn state_receiver(&self) -> watch::Receiver<PollState> {
        self.state_rx.clone()
    }

    pub fn since(&self) -> &Checkpoint {
        &self.since
    }

    fn set_state(&self, state: PollState) {
        let _ = self.state_tx.send(state);
    }

    /// Run until `shutdown` flips to true, the runner goes away, or a fatal
    /// error occurs. Dropping the in-flight request aborts it.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            replication_id = %self.replication_id,
            since = ?self.since.marker(),
            heartbeat_ms = self.heartbeat.as_millis() as u64,
            "Long-poll loop started"
        );
        let mut drain = false;

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_state(PollState::Connecting);
            let remote = Arc::clone(&self.remote);
            let since = self.since.clone();
            let (limit, heartbeat) = (self.batch_size, self.heartbeat);
            let request = async {
                if drain {
                    remote.list_changes(&since, limit).await
                } else {
                    remote.poll_changes(&since, limit, heartbeat).await
                }
            };

            self.set_state(PollState::Waiting);
            let result = tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    debug!("Long-poll request cancelled");
                    break;
                }
                result = request => result,
            };

            match result {
                Ok(page) if page.is_empty() => {
                    crate::metrics::record_longpoll_request(&self.replication_id, "empty");
                    self.backoff.reset();
                    drain = false;
                }
                Ok(page) => {
                    crate::metrics::record_longpoll_request(&self.replication_id, "changes");
                    self.set_state(PollState::Delivering);
                    self.backoff.reset();
                    drain = page.has_more;

                    let next = page
                        .checkpoint_candidate()
                        .map(|c| self.since.advance(&c))
                        .unwrap_or_else(|| self.since.clone());
                    debug!(
                        documents = page.documents.len(),
                        has_more = page.has_more,
                        "Delivering live changes"
                    );

                    let batch = LiveEvent::Batch(LiveBatch {
                        since: self.since.clone(),
                        page,
                    });
                    let sent = tokio::select! {
                        biased;
                        _ = shutdown.changed() => break,
                        sent = self.batches.send(batch) => sent,
                    };
                    if sent.is_err() {
                        debug!("Live batch receiver dropped");
                        break;
                    }
                    self.since = next;
                }
                Err(e) => {
                    crate::metrics::record_longpoll_request(&self.replication_id, "error");
                    crate::metrics::record_error(
                        &self.replication_id,
                        &ErrorSource::LongPoll.to_string(),
                        &e.kind().to_string(),
                    );
                    let _ = self.errors.send(ErrorEvent::new(ErrorSource::LongPoll, &e));

                    if e.is_fatal() {
                        warn!(error = %e, "Long-poll stopped on fatal error");
                        let _ = self.batches.send(LiveEvent::Fatal(e)).await;
                        break;
                    }

                    self.set_state(PollState::Backoff);
                    let delay = self.backoff.next_delay();
                    crate::metrics::record_backoff(
                        &self.replication_id,
                        delay,
                        self.backoff.failures(),
                    );
                    warn!(
                        error = %e,
                        backoff_ms = delay.as_millis() as u64,
                        failures = self.backoff.failures(),
                        "Long-poll request failed, backing off"
                    );

                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }

            self.set_state(PollState::Idle);
        }

        self.set_state(PollState::Stopped);
        info!(replication_id = %self.replication_id, "Long-poll loop stopped");
    }
}
