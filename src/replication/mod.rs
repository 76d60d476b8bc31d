// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication lifecycle.
//!
//! Ties together:
//! - Checkpoints via [`crate::checkpoint::CheckpointStore`]
//! - Remote calls via [`crate::remote::RemoteCollection`]
//! - Catch-up pulls via [`crate::pull::PullPipeline`]
//! - Pushes and conflict settling via [`crate::push::PushPipeline`]
//! - Live changes via [`crate::longpoll::LongPoll`]
//! - Leadership via [`crate::leader::LeaderElector`]
//!
//! # Usage
//!
//! ```rust,no_run
//! # use kinto_replication::{Replication, ReplicationConfig, MemoryCollection};
//! # use std::sync::Arc;
//! # async fn example() -> kinto_replication::Result<()> {
//! let config = ReplicationConfig::default();
//! let collection = Arc::new(MemoryCollection::new());
//!
//! let handle = Replication::kinto(config, collection)?.start().await?;
//! handle.await_initial_replication().await?;
//!
//! let mut errors = handle.errors();
//! tokio::spawn(async move {
//!     while let Ok(event) = errors.recv().await {
//!         eprintln!("replication error: {}", event.message);
//!     }
//! });
//!
//! handle.stop().await;
//! # Ok(())
//! # }
//! ```

mod manager;
mod runner;
mod types;

pub use manager::ReplicationManager;
pub use types::ReplicationState;

use crate::batch::ConflictEntry;
use crate::checkpoint::{self, CheckpointStore};
use crate::circuit_breaker::LocalStoreCircuit;
use crate::collection::ReplicationCapable;
use crate::config::ReplicationConfig;
use crate::conflict::ConflictResolver;
use crate::document::Checkpoint;
use crate::error::{ErrorEvent, ReplicationError, Result};
use crate::leader::{LeaderElector, SingleInstance};
use crate::pull::{DocumentModifier, PullPipeline};
use crate::push::PushPipeline;
use crate::remote::{KintoClient, RemoteCollection};
use runner::{Runner, Shared};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use types::Command;

/// Capacity of the error and conflict streams.
const EVENT_CAPACITY: usize = 256;

/// Pending commands (re-sync, local change) per replication.
const COMMAND_CAPACITY: usize = 8;

/// Time given to the runner to finish on `stop()`.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Builder for one replication.
pub struct Replication {
    config: ReplicationConfig,
    collection: Arc<dyn ReplicationCapable>,
    remote: Arc<dyn RemoteCollection>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    elector: Arc<dyn LeaderElector>,
    resolver: Option<Arc<dyn ConflictResolver>>,
    pull_modifier: Option<DocumentModifier>,
    push_modifier: Option<DocumentModifier>,
    circuit: Arc<LocalStoreCircuit>,
}

impl Replication {
    pub fn new(
        config: ReplicationConfig,
        collection: Arc<dyn ReplicationCapable>,
        remote: Arc<dyn RemoteCollection>,
    ) -> Self {
        Self {
            config,
            collection,
            remote,
            checkpoints: None,
            elector: Arc::new(SingleInstance),
            resolver: None,
            pull_modifier: None,
            push_modifier: None,
            circuit: Arc::new(LocalStoreCircuit::new()),
        }
    }

    /// Replicate against the Kinto server described by `config.remote`.
    pub fn kinto(config: ReplicationConfig, collection: Arc<dyn ReplicationCapable>) -> Result<Self> {
        let client = KintoClient::new(config.remote.clone())?;
        Ok(Self::new(config, collection, Arc::new(client)))
    }

    /// Use this store instead of opening the one configured in `config.checkpoint`.
    pub fn with_checkpoints(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    pub fn with_leader_elector(mut self, elector: Arc<dyn LeaderElector>) -> Self {
        self.elector = elector;
        self
    }

    /// Override the resolver implied by `config.strategy`.
    pub fn with_conflict_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_pull_modifier(mut self, modifier: DocumentModifier) -> Self {
        self.pull_modifier = Some(modifier);
        self
    }

    pub fn with_push_modifier(mut self, modifier: DocumentModifier) -> Self {
        self.push_modifier = Some(modifier);
        self
    }

    pub fn with_circuit(mut self, circuit: Arc<LocalStoreCircuit>) -> Self {
        self.circuit = circuit;
        self
    }

    pub fn identifier(&self) -> &str {
        &self.config.replication_identifier
    }

    /// Build the handle and, with `auto_start`, start replicating.
    pub async fn start(self) -> Result<ReplicationHandle> {
        let auto_start = self.config.auto_start;
        let handle = self.build().await?;
        if auto_start {
            handle.start()?;
        }
        Ok(handle)
    }

    /// Build the handle without starting it.
    pub async fn build(self) -> Result<ReplicationHandle> {
        self.config.validate()?;
        let id = self.config.replication_identifier.clone();

        let checkpoints = match self.checkpoints {
            Some(checkpoints) => checkpoints,
            None => checkpoint::open(&self.config.checkpoint).await?,
        };
        let resolver = self
            .resolver
            .unwrap_or_else(|| self.config.strategy.resolver());

        let mut pull = PullPipeline::new(
            id.clone(),
            Arc::clone(&self.remote),
            Arc::clone(&self.collection),
            checkpoints,
            self.config.pull.batch_size,
        )
        .with_circuit(Arc::clone(&self.circuit));
        if let Some(modifier) = self.pull_modifier {
            pull = pull.with_modifier(modifier);
        }

        let mut push = PushPipeline::new(
            id.clone(),
            Arc::clone(&self.remote),
            Arc::clone(&self.collection),
            self.config.remote.clone(),
            self.config.push.batch_size,
        )
        .with_circuit(Arc::clone(&self.circuit));
        if let Some(modifier) = self.push_modifier {
            push = push.with_modifier(modifier);
        }

        let shared = Arc::new(Shared::new(id.clone(), EVENT_CAPACITY));
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);

        let runner = Runner {
            shared: Arc::clone(&shared),
            config: self.config.clone(),
            remote: self.remote,
            pull,
            push,
            resolver,
            elector: self.elector,
            commands: commands_rx,
            checkpoint: Checkpoint::start(),
            needs_catch_up: false,
        };

        debug!(replication_id = %id, "Replication built");
        Ok(ReplicationHandle {
            config: self.config,
            shared,
            shutdown_tx,
            commands: commands_tx,
            runner: Mutex::new(Some(runner)),
            task: Mutex::new(None),
        })
    }
}

/// Control surface of a running replication.
///
/// Dropping the handle shuts the replication down.
pub struct ReplicationHandle {
    config: ReplicationConfig,
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    commands: mpsc::Sender<Command>,
    runner: Mutex<Option<Runner>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicationHandle {
    pub fn replication_identifier(&self) -> &str {
        &self.config.replication_identifier
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Get current state.
    pub fn state(&self) -> ReplicationState {
        *self.shared.state.borrow()
    }

    /// Get a receiver for state changes.
    pub fn state_receiver(&self) -> watch::Receiver<ReplicationState> {
        self.shared.state.subscribe()
    }

    pub fn is_leader(&self) -> bool {
        *self.shared.leader.borrow()
    }

    /// Stopped, either on request or on an unrecoverable error.
    pub fn is_stopped(&self) -> bool {
        self.state().is_terminal()
    }

    /// The error that moved the replication to `Errored`, if any.
    pub fn fatal_error(&self) -> Option<ErrorEvent> {
        self.shared.fatal.borrow().clone()
    }

    /// Subscribe to the error stream.
    pub fn errors(&self) -> broadcast::Receiver<ErrorEvent> {
        self.shared.errors.subscribe()
    }

    /// Subscribe to conflicts the resolver left unresolved.
    pub fn conflicts(&self) -> broadcast::Receiver<ConflictEntry> {
        self.shared.conflicts.subscribe()
    }

    /// Spawn the runner.
    ///
    /// Fails unless the replication is `Idle`.
    pub fn start(&self) -> Result<()> {
        let state = self.state();
        if state != ReplicationState::Idle {
            return Err(ReplicationError::InvalidState {
                expected: ReplicationState::Idle.to_string(),
                actual: state.to_string(),
            });
        }
        let runner = lock(&self.runner)
            .take()
            .ok_or_else(|| ReplicationError::InvalidState {
                expected: ReplicationState::Idle.to_string(),
                actual: "started".to_string(),
            })?;

        info!(
            replication_id = %self.shared.id,
            url = %self.config.remote.url,
            bucket = %self.config.remote.bucket,
            collection = %self.config.remote.collection,
            "Starting replication"
        );

        let shutdown = self.shutdown_tx.subscribe();
        self.shared.set_state(ReplicationState::Starting);
        let span = info_span!("replication", replication_id = %self.shared.id);
        let task = tokio::spawn(runner.run(shutdown).instrument(span));
        *lock(&self.task) = Some(task);
        Ok(())
    }

    /// Stop replicating and wait for in-flight work to wind down.
    ///
    /// Cancels the long-poll request and any running pull or push. Idempotent.
    pub async fn stop(&self) {
        if self.state() == ReplicationState::Stopped {
            return;
        }
        info!(replication_id = %self.shared.id, "Stopping replication");
        if self.state() != ReplicationState::Errored {
            self.shared.set_state(ReplicationState::Stopping);
        }

        self.shutdown_tx.send_replace(true);
        lock(&self.runner).take();

        let task = lock(&self.task).take();
        if let Some(task) = task {
            match tokio::time::timeout(DRAIN_TIMEOUT, task).await {
                Ok(Ok(())) => debug!("Runner completed gracefully"),
                Ok(Err(e)) => warn!(error = %e, "Runner panicked during shutdown"),
                Err(_) => warn!("Runner timed out during shutdown"),
            }
        }

        self.shared.set_state(ReplicationState::Stopped);
        info!(replication_id = %self.shared.id, "Replication stopped");
    }

    /// Catch up now and restart the long-poll cycle.
    pub async fn re_sync(&self) -> Result<()> {
        self.send_command(Command::ReSync).await
    }

    /// Forget the checkpoint and pull everything again.
    pub async fn full_resync(&self) -> Result<()> {
        self.send_command(Command::FullResync).await
    }

    /// Tell the runner local writes are waiting.
    ///
    /// Coalesces: if a notification is already queued this is a no-op.
    pub fn notify_local_change(&self) {
        if self.state().is_terminal() {
            return;
        }
        if let Err(mpsc::error::TrySendError::Closed(_)) = self.commands.try_send(Command::LocalChange) {
            debug!("Local change notification after runner exit");
        }
    }

    /// Resolve once the first pull and push have completed.
    ///
    /// Fails if the replication stops or errors before that.
    pub async fn await_initial_replication(&self) -> Result<()> {
        let mut initial = self.shared.initial.subscribe();
        let mut state = self.shared.state.subscribe();

        loop {
            if *initial.borrow_and_update() {
                return Ok(());
            }
            match *state.borrow_and_update() {
                ReplicationState::Errored => {
                    let message = self
                        .fatal_error()
                        .map(|e| e.message)
                        .unwrap_or_else(|| "unknown error".to_string());
                    return Err(ReplicationError::Internal(format!(
                        "replication errored before initial sync: {}",
                        message
                    )));
                }
                ReplicationState::Stopped | ReplicationState::Stopping => {
                    return Err(ReplicationError::Shutdown);
                }
                _ => {}
            }

            tokio::select! {
                _ = initial.changed() => {}
                _ = state.changed() => {}
            }
        }
    }

    async fn send_command(&self, command: Command) -> Result<()> {
        let state = self.state();
        if state == ReplicationState::Idle || state.is_terminal() || state == ReplicationState::Stopping {
            return Err(ReplicationError::InvalidState {
                expected: "running".to_string(),
                actual: state.to_string(),
            });
        }
        self.commands
            .send(command)
            .await
            .map_err(|_| ReplicationError::Shutdown)
    }
}

impl Drop for ReplicationHandle {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

impl std::fmt::Debug for ReplicationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationHandle")
            .field("replication_identifier", &self.config.replication_identifier)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::collection::MemoryCollection;
    use crate::document::Document;
    use crate::remote::mock::MockRemote;
    use crate::remote::ChangesPage;
    use serde_json::Map;

    fn replication(config: ReplicationConfig, remote: Arc<MockRemote>) -> Replication {
        Replication::new(config, Arc::new(MemoryCollection::new()), remote)
            .with_checkpoints(Arc::new(MemoryCheckpointStore::new()))
    }

    #[tokio::test]
    async fn test_initial_state() {
        let mut config = ReplicationConfig::for_testing("todos");
        config.auto_start = false;

        let handle = replication(config, Arc::new(MockRemote::new()))
            .start()
            .await
            .unwrap();

        assert_eq!(handle.state(), ReplicationState::Idle);
        assert!(!handle.is_stopped());
        assert!(!handle.is_leader());
        assert_eq!(handle.replication_identifier(), "todos");
    }

    #[tokio::test]
    async fn test_start_twice_is_invalid() {
        let handle = replication(ReplicationConfig::for_testing("todos"), Arc::new(MockRemote::new()))
            .start()
            .await
            .unwrap();

        let result = handle.start();
        assert!(matches!(result, Err(ReplicationError::InvalidState { .. })));
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = ReplicationConfig::for_testing("todos");
        config.replication_identifier = "  ".to_string();

        let result = replication(config, Arc::new(MockRemote::new())).start().await;
        assert!(matches!(result, Err(ReplicationError::Config(_))));
    }

    #[tokio::test]
    async fn test_one_shot_replication_stops_after_initial_sync() {
        let remote = Arc::new(MockRemote::new());
        remote.push_page(Ok(ChangesPage::new(
            vec![Document::new("a", Map::new()).with_last_modified(3)],
            Some("3".into()),
            false,
        )));
        let mut config = ReplicationConfig::for_testing("todos");
        config.live = false;

        let handle = replication(config, remote).start().await.unwrap();
        handle.await_initial_replication().await.unwrap();

        let mut state = handle.state_receiver();
        tokio::time::timeout(
            Duration::from_secs(2),
            state.wait_for(|s| *s == ReplicationState::Stopped),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(handle.is_stopped());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let handle = replication(ReplicationConfig::for_testing("todos"), Arc::new(MockRemote::new()))
            .start()
            .await
            .unwrap();
        handle.await_initial_replication().await.unwrap();

        handle.stop().await;
        handle.stop().await;

        assert_eq!(handle.state(), ReplicationState::Stopped);
        assert!(matches!(handle.re_sync().await, Err(ReplicationError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn test_await_initial_fails_when_stopped_first() {
        let mut config = ReplicationConfig::for_testing("todos");
        config.auto_start = false;
        let handle = replication(config, Arc::new(MockRemote::new()))
            .start()
            .await
            .unwrap();

        handle.stop().await;
        assert!(matches!(
            handle.await_initial_replication().await,
            Err(ReplicationError::Shutdown)
        ));
    }
}
