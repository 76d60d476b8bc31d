//! Shared test utilities for replication tests.
//!
//! This module provides:
//! - `ScriptedRemote`: stateful in-memory Kinto collection with failure injection
//! - `FakeKinto`: axum server speaking the Kinto HTTP API
//! - Replication builders and wait helpers
#![allow(dead_code)]

pub mod fake_kinto;
pub mod scripted_remote;

pub use fake_kinto::*;
pub use scripted_remote::*;

use kinto_replication::{
    MemoryCheckpointStore, MemoryCollection, Replication, ReplicationConfig, ReplicationHandle,
    ReplicationState,
};
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

/// Poll `$cond` (which may `.await`) until it holds, panicking after [`WAIT`].
#[macro_export]
macro_rules! eventually {
    ($what:expr, $cond:expr) => {{
        let deadline = tokio::time::Instant::now() + $crate::common::WAIT;
        loop {
            if $cond {
                break;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {}", $what);
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }};
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A test replication wired to in-memory parts.
pub struct Harness {
    pub collection: Arc<MemoryCollection>,
    pub remote: Arc<ScriptedRemote>,
    pub checkpoints: Arc<MemoryCheckpointStore>,
}

impl Harness {
    pub fn new() -> Self {
        init_tracing();
        Self {
            collection: Arc::new(MemoryCollection::new()),
            remote: Arc::new(ScriptedRemote::new()),
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
        }
    }

    pub fn replication(&self, config: ReplicationConfig) -> Replication {
        Replication::new(config, self.collection.clone(), self.remote.clone())
            .with_checkpoints(self.checkpoints.clone())
    }

    /// Build and start with the fast test config.
    pub async fn start(&self, id: &str) -> ReplicationHandle {
        self.replication(ReplicationConfig::for_testing(id))
            .start()
            .await
            .unwrap()
    }
}

/// Wait until the replication reaches `state`.
pub async fn wait_for_state(handle: &ReplicationHandle, state: ReplicationState) {
    let mut rx = handle.state_receiver();
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}, at {}", state, handle.state()))
        .unwrap();
}
