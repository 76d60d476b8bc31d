// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication runner task.
//!
//! One runner per replication identifier. It owns the pipelines and drives
//! them from a single event loop:
//!
//! ```text
//! acquire lease ──▶ pull ──▶ push ──▶ initial replication done
//!                                          │
//!        ┌─────────────────────────────────┘
//!        ▼
//!   select! { shutdown | lease lost | live batch | command | retry tick }
//! ```
//!
//! Live batches arrive from the long-poll task in order and are applied one
//! at a time, so the local collection never sees a later page before an
//! earlier one. A page is only applied when it was listed from the runner's
//! current checkpoint; any other page is discarded and the long-poll task is
//! restarted from the checkpoint.

use super::types::{Command, ReplicationState};
use crate::batch::ConflictEntry;
use crate::config::ReplicationConfig;
use crate::conflict::ConflictResolver;
use crate::document::Checkpoint;
use crate::error::{ErrorEvent, ErrorSource, ReplicationError, Result};
use crate::leader::{LeaderElector, Lease};
use crate::longpoll::{LiveBatch, LiveEvent, LongPoll};
use crate::metrics;
use crate::pull::PullPipeline;
use crate::push::PushPipeline;
use crate::remote::RemoteCollection;
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Live pages buffered between the long-poll task and the runner.
const LIVE_CHANNEL_CAPACITY: usize = 16;

/// How long a stopping long-poll task gets before it is abandoned.
const LIVE_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// State shared between the runner and its handle.
pub(crate) struct Shared {
    pub id: String,
    pub state: watch::Sender<ReplicationState>,
    pub leader: watch::Sender<bool>,
    pub initial: watch::Sender<bool>,
    pub fatal: watch::Sender<Option<ErrorEvent>>,
    pub errors: broadcast::Sender<ErrorEvent>,
    pub conflicts: broadcast::Sender<ConflictEntry>,
}

impl Shared {
    pub fn new(id: String, event_capacity: usize) -> Self {
        let (state, _) = watch::channel(ReplicationState::Idle);
        let (leader, _) = watch::channel(false);
        let (initial, _) = watch::channel(false);
        let (fatal, _) = watch::channel(None);
        let (errors, _) = broadcast::channel(event_capacity);
        let (conflicts, _) = broadcast::channel(event_capacity);
        Self {
            id,
            state,
            leader,
            initial,
            fatal,
            errors,
            conflicts,
        }
    }

    pub fn set_state(&self, state: ReplicationState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(replication_id = %self.id, from = %previous, to = %state, "State change");
            metrics::set_replication_state(&self.id, state.as_str());
        }
    }

    pub fn set_leader(&self, is_leader: bool) {
        self.leader.send_replace(is_leader);
        metrics::set_leader(&self.id, is_leader);
    }
}

/// Outcome of work raced against shutdown and lease loss.
enum Guarded<T> {
    Done(T),
    LeaseLost,
    Shutdown,
}

async fn guarded<F: Future>(
    shutdown: &mut watch::Receiver<bool>,
    lease: &Lease,
    work: F,
) -> Guarded<F::Output> {
    tokio::select! {
        biased;
        _ = shutdown.changed() => Guarded::Shutdown,
        _ = lease.lost() => Guarded::LeaseLost,
        out = work => Guarded::Done(out),
    }
}

enum Step {
    Shutdown,
    LeaseLost,
    Live(Option<LiveEvent>),
    Command(Option<Command>),
    Tick,
}

/// A running long-poll task.
struct LiveLoop {
    events: mpsc::Receiver<LiveEvent>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl LiveLoop {
    async fn stop(&mut self) {
        self.stop.send_replace(true);
        if tokio::time::timeout(LIVE_STOP_TIMEOUT, &mut self.task).await.is_err() {
            warn!("Long-poll task did not stop in time, aborting");
            self.task.abort();
        }
    }
}

pub(crate) struct Runner {
    pub shared: Arc<Shared>,
    pub config: ReplicationConfig,
    pub remote: Arc<dyn RemoteCollection>,
    pub pull: PullPipeline,
    pub push: PushPipeline,
    pub resolver: Arc<dyn ConflictResolver>,
    pub elector: Arc<dyn LeaderElector>,
    pub commands: mpsc::Receiver<Command>,
    pub checkpoint: Checkpoint,
    pub needs_catch_up: bool,
}

impl Runner {
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        self.shared.set_state(ReplicationState::Starting);
        info!(
            live = self.config.live,
            strategy = %self.config.strategy,
            "Replication runner started"
        );

        let mut retry = tokio::time::interval(self.config.retry_time_duration());
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        'leadership: loop {
            if *shutdown.borrow() {
                break;
            }

            let lease = match self.acquire_lease(&mut shutdown).await {
                Some(Ok(lease)) => lease,
                Some(Err(e)) => {
                    let event = ErrorEvent::new(ErrorSource::Lifecycle, &e);
                    let _ = self.shared.errors.send(event.clone());
                    self.escalate(event);
                    return;
                }
                None => break,
            };
            self.shared.set_leader(true);
            self.checkpoint = self.checkpoint.advance(&self.pull.load_checkpoint().await);
            info!(checkpoint = ?self.checkpoint.marker(), "Leadership acquired, replicating");

            match guarded(&mut shutdown, &lease, self.cycle()).await {
                Guarded::Shutdown => break,
                Guarded::LeaseLost => {
                    self.lose_leadership();
                    continue 'leadership;
                }
                Guarded::Done(Err(fatal)) => {
                    self.escalate(fatal);
                    return;
                }
                Guarded::Done(Ok(())) => {}
            }
            self.shared.initial.send_replace(true);

            if !self.config.live {
                info!("One-shot replication complete");
                self.shared.set_leader(false);
                self.shared.set_state(ReplicationState::Stopped);
                return;
            }

            let mut live = self.spawn_long_poll();
            retry.reset();

            loop {
                self.shared.set_state(ReplicationState::Polling);

                let step = tokio::select! {
                    biased;
                    _ = shutdown.changed() => Step::Shutdown,
                    _ = lease.lost() => Step::LeaseLost,
                    event = next_live(&mut live) => Step::Live(event),
                    cmd = self.commands.recv() => Step::Command(cmd),
                    _ = retry.tick() => Step::Tick,
                };

                let outcome = match step {
                    Step::Shutdown | Step::Command(None) => {
                        stop_live(&mut live).await;
                        break 'leadership;
                    }
                    Step::LeaseLost => {
                        stop_live(&mut live).await;
                        self.lose_leadership();
                        continue 'leadership;
                    }
                    Step::Live(Some(LiveEvent::Batch(batch))) if batch.since != self.checkpoint => {
                        // Listed from another position: stale after a catch-up,
                        // or past a page that failed to import.
                        debug!(
                            since = ?batch.since.marker(),
                            checkpoint = ?self.checkpoint.marker(),
                            "Discarding live page, restarting long-poll from checkpoint"
                        );
                        stop_live(&mut live).await;
                        live = self.spawn_long_poll();
                        Guarded::Done(Ok(()))
                    }
                    Step::Live(Some(LiveEvent::Batch(batch))) => {
                        Guarded::Done(self.apply_live(batch).await)
                    }
                    Step::Live(Some(LiveEvent::Fatal(e))) => {
                        // Already on the error stream
                        Guarded::Done(Err(ErrorEvent::new(ErrorSource::LongPoll, &e)))
                    }
                    Step::Live(None) => {
                        debug!("Long-poll task ended, restarting it");
                        live = self.spawn_long_poll();
                        Guarded::Done(Ok(()))
                    }
                    Step::Command(Some(Command::ReSync)) => {
                        stop_live(&mut live).await;
                        let outcome = guarded(&mut shutdown, &lease, self.cycle()).await;
                        live = self.spawn_long_poll();
                        retry.reset();
                        outcome
                    }
                    Step::Command(Some(Command::FullResync)) => {
                        stop_live(&mut live).await;
                        let outcome = guarded(&mut shutdown, &lease, self.full_resync()).await;
                        live = self.spawn_long_poll();
                        retry.reset();
                        outcome
                    }
                    Step::Command(Some(Command::LocalChange)) => {
                        guarded(&mut shutdown, &lease, self.push_cycle()).await
                    }
                    Step::Tick => guarded(&mut shutdown, &lease, self.tick()).await,
                };

                match outcome {
                    Guarded::Done(Ok(())) => {}
                    Guarded::Done(Err(fatal)) => {
                        stop_live(&mut live).await;
                        self.escalate(fatal);
                        return;
                    }
                    Guarded::LeaseLost => {
                        stop_live(&mut live).await;
                        self.lose_leadership();
                        continue 'leadership;
                    }
                    Guarded::Shutdown => {
                        stop_live(&mut live).await;
                        break 'leadership;
                    }
                }
            }
        }

        self.shared.set_leader(false);
        info!("Replication runner stopped");
    }

    /// Wait for the lease. `None` on shutdown.
    async fn acquire_lease(&self, shutdown: &mut watch::Receiver<bool>) -> Option<Result<Lease>> {
        if !self.config.wait_for_leadership {
            return Some(Ok(Lease::permanent()));
        }

        let mut acquire = self.elector.acquire();
        if let Some(result) = acquire.as_mut().now_or_never() {
            return Some(result);
        }

        info!("Not the leader, paused");
        self.shared.set_state(ReplicationState::Paused);
        tokio::select! {
            biased;
            _ = shutdown.changed() => None,
            result = acquire => Some(result),
        }
    }

    fn lose_leadership(&self) {
        warn!("Leadership lost, pausing replication");
        self.shared.set_leader(false);
        self.shared.set_state(ReplicationState::Paused);
    }

    fn escalate(&self, event: ErrorEvent) {
        error!(
            source = %event.source,
            kind = %event.kind,
            error = %event.message,
            "Replication halted on unrecoverable error"
        );
        self.shared.fatal.send_replace(Some(event));
        self.shared.set_leader(false);
        self.shared.set_state(ReplicationState::Errored);
    }

    /// Publish an error. Fatal errors come back for escalation.
    fn report(&self, source: ErrorSource, error: &ReplicationError) -> std::result::Result<(), ErrorEvent> {
        let event = ErrorEvent::new(source, error);
        metrics::record_error(&self.shared.id, &source.to_string(), &event.kind.to_string());
        let _ = self.shared.errors.send(event.clone());

        if error.is_fatal() {
            Err(event)
        } else {
            warn!(source = %source, error = %error, "Replication error, will retry");
            Ok(())
        }
    }

    /// Catch-up pull followed by one push.
    async fn cycle(&mut self) -> std::result::Result<(), ErrorEvent> {
        self.pull_cycle().await?;
        self.push_cycle().await
    }

    async fn full_resync(&mut self) -> std::result::Result<(), ErrorEvent> {
        info!("Full resync: dropping checkpoint");
        if let Err(e) = self.pull.reset_checkpoint().await {
            self.report(ErrorSource::Checkpoint, &e)?;
        }
        self.checkpoint = Checkpoint::start();
        self.cycle().await
    }

    async fn tick(&mut self) -> std::result::Result<(), ErrorEvent> {
        if self.needs_catch_up {
            self.pull_cycle().await?;
        }
        self.push_cycle().await
    }

    async fn pull_cycle(&mut self) -> std::result::Result<(), ErrorEvent> {
        if !self.config.pull.enabled {
            return Ok(());
        }
        self.shared.set_state(ReplicationState::Pulling);

        match self.pull.run().await {
            Ok(report) => {
                self.checkpoint = report.checkpoint;
                self.needs_catch_up = false;
                Ok(())
            }
            Err(e) => {
                self.needs_catch_up = true;
                self.report(ErrorSource::Pull, &e)
            }
        }
    }

    /// Push batches until the queue is drained or a batch settles nothing.
    ///
    /// Rows the remote keeps rejecting stay at the head of the queue; a full
    /// batch of them ends the cycle instead of resending them in a loop.
    async fn push_cycle(&mut self) -> std::result::Result<(), ErrorEvent> {
        if !self.config.push_enabled() {
            return Ok(());
        }
        self.shared.set_state(ReplicationState::Pushing);

        loop {
            let report = match self.push.run().await {
                Ok(report) => report,
                Err(e) => return self.report(ErrorSource::Push, &e),
            };
            if report.is_empty() {
                return Ok(());
            }

            let settlement = match self.push.settle(&report, self.resolver.as_ref()).await {
                Ok(settlement) => settlement,
                Err(e) => return self.report(ErrorSource::Push, &e),
            };

            // Row-level rejections are reported but never halt replication.
            for item in &settlement.item_errors {
                let event = ErrorEvent::new(ErrorSource::Push, item);
                metrics::record_error(&self.shared.id, "push", &event.kind.to_string());
                let _ = self.shared.errors.send(event);
            }
            // Unresolved conflicts leave the queue too.
            let settled =
                settlement.acknowledged + settlement.resolved + settlement.unresolved.len();
            for conflict in settlement.unresolved {
                let _ = self.shared.conflicts.send(conflict);
            }

            if report.fetched < self.push.batch_size() {
                return Ok(());
            }
            if settled == 0 {
                debug!(rows = report.fetched, "Push batch made no progress, retrying next cycle");
                return Ok(());
            }
        }
    }

    /// Apply a live page listed from exactly the current checkpoint.
    async fn apply_live(&mut self, batch: LiveBatch) -> std::result::Result<(), ErrorEvent> {
        if !self.config.pull.enabled {
            return Ok(());
        }

        self.shared.set_state(ReplicationState::Pulling);
        match self.pull.apply_page(&self.checkpoint, batch.page).await {
            Ok(next) => {
                self.checkpoint = next;
                Ok(())
            }
            Err(e) => {
                self.needs_catch_up = true;
                self.report(ErrorSource::Pull, &e)
            }
        }
    }

    fn spawn_long_poll(&self) -> Option<LiveLoop> {
        if !self.config.pull.enabled {
            return None;
        }

        let (batches, events) = mpsc::channel(LIVE_CHANNEL_CAPACITY);
        let (stop, stop_rx) = watch::channel(false);
        let poll = LongPoll::new(
            self.shared.id.clone(),
            Arc::clone(&self.remote),
            batches,
            self.shared.errors.clone(),
        )
        .with_since(self.checkpoint.clone())
        .with_batch_size(self.config.pull.batch_size)
        .with_heartbeat(self.config.pull.heartbeat_duration())
        .with_retry(self.config.retry_config());

        let span = info_span!("long_poll", replication_id = %self.shared.id);
        let task = tokio::spawn(poll.run(stop_rx).instrument(span));
        Some(LiveLoop { events, stop, task })
    }
}

async fn next_live(live: &mut Option<LiveLoop>) -> Option<LiveEvent> {
    match live {
        Some(live) => live.events.recv().await,
        None => std::future::pending().await,
    }
}

async fn stop_live(live: &mut Option<LiveLoop>) {
    if let Some(mut live) = live.take() {
        live.stop().await;
    }
}
