//! # Kinto Replication
//!
//! Bidirectional replication between a local document collection and a
//! Kinto-style remote collection.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                           kinto-replication                               │
//! │                                                                           │
//! │  ┌─────────────┐   ┌──────────────┐   ┌───────────────────────────────┐   │
//! │  │  LongPoll   │──►│ PullPipeline │──►│ import_batch (local)          │   │
//! │  │ (heartbeat) │   │ (paginated)  │   │ then persist Checkpoint       │   │
//! │  └─────────────┘   └──────────────┘   └───────────────────────────────┘   │
//! │         │                                            │                    │
//! │         ▼                                            ▼                    │
//! │  ┌─────────────┐   ┌──────────────┐   ┌───────────────────────────────┐   │
//! │  │ KintoClient │◄──│ PushPipeline │◄──│ pending_local_writes (local)  │   │
//! │  │ (HTTP)      │   │ (batch+merge)│   │ conflicts → ConflictResolver  │   │
//! │  └─────────────┘   └──────────────┘   └───────────────────────────────┘   │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! 1. **At-least-once pull**: the checkpoint only moves after the page it
//!    covers was imported, so a failed import is redelivered.
//! 2. **Ordered pull**: pages are applied one at a time in checkpoint order.
//! 3. **Bounded push retries**: a row is resubmitted at most once per push.
//! 4. **Single writer**: only the leader replicates (see [`leader`]).
//!
//! ## Usage
//!
//! ```rust,no_run
//! use kinto_replication::{MemoryCollection, Replication, ReplicationConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> kinto_replication::Result<()> {
//!     let mut config = ReplicationConfig::default();
//!     config.replication_identifier = "todos".to_string();
//!
//!     let collection = Arc::new(MemoryCollection::new());
//!     let handle = Replication::kinto(config, collection)?.start().await?;
//!     handle.await_initial_replication().await?;
//!
//!     // Replicates live until stopped
//!     handle.stop().await;
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod checkpoint;
pub mod circuit_breaker;
pub mod collection;
pub mod config;
pub mod conflict;
pub mod document;
pub mod error;
pub mod leader;
pub mod longpoll;
pub mod metrics;
pub mod pull;
pub mod push;
pub mod remote;
pub mod replication;
pub mod resilience;

// Re-exports for convenience
pub use batch::{AggregatedResult, BatchRequest, BatchResponse, ConflictEntry};
pub use checkpoint::{CheckpointStore, MemoryCheckpointStore, SqliteCheckpointStore, Stored};
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, LocalStoreCircuit};
pub use collection::{
    Acknowledgement, CollectionMetadata, MemoryCollection, ReplicationCapable, Resolution,
};
pub use config::{
    AuthConfig, CheckpointConfig, PullConfig, PushConfig, RemoteConfig, ReplicationConfig,
};
pub use conflict::{ClientWins, ConflictResolver, ConflictStrategy, ConflictVerdict, RemoteWins};
pub use document::{ChangeRow, Checkpoint, Document};
pub use error::{ErrorEvent, ErrorKind, ErrorSource, ReplicationError, Result};
pub use leader::{LeaderElector, Lease, LocalElection, SingleInstance};
pub use longpoll::{LongPoll, PollState};
pub use pull::{DocumentModifier, PullPipeline};
pub use push::{PushPipeline, PushReport};
pub use remote::{ChangesPage, KintoClient, RemoteCollection, RemoteInfo};
pub use replication::{Replication, ReplicationHandle, ReplicationManager, ReplicationState};
