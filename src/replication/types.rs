//! Replication state types.
//!
//! Defines the state machine for one replication identifier.
//!
//! # State Transitions
//!
//! ```text
//!                 start()
//! Idle ───────────────────→ Starting ──(not leader)──→ Paused
//!  │                           │                        │  ↑
//!  │ stop()                    │ (lease acquired) ←─────┘  │ (lease lost)
//!  ↓                           ↓                           │
//! Stopped ←── Stopping ←── Running: Pulling ⇄ Pushing ⇄ Polling
//!                 ↑            │
//!              stop()          │ (unrecoverable error)
//!                              ↓
//!                           Errored
//! ```
//!
//! # State Descriptions
//!
//! - **Idle**: Handle created, nothing running. Call `start()`.
//! - **Starting**: Runner spawned, acquiring leadership.
//! - **Paused**: Waiting for the leader lease. No remote traffic.
//! - **Pulling** / **Pushing**: A catch-up cycle is in progress.
//! - **Polling**: Live mode, waiting on the long-poll loop.
//! - **Stopping**: `stop()` called, tasks are draining.
//! - **Stopped**: Done. Safe to drop.
//! - **Errored**: Unrecoverable error. Retries halted until the application
//!   starts a new replication (typically after a full resync).

/// State of one replication.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationState {
    /// Created but not started.
    Idle,

    /// Runner spawned, waiting for its first lease.
    Starting,

    /// Not the leader. Waiting for leadership.
    Paused,

    /// Pulling remote changes into the local collection.
    Pulling,

    /// Pushing local writes to the remote.
    Pushing,

    /// Live: long-poll loop running, periodic push active.
    Polling,

    /// Shutting down. Long-poll and in-flight calls are being cancelled.
    Stopping,

    /// Stopped cleanly.
    Stopped,

    /// Stopped on an unrecoverable error.
    Errored,
}

impl ReplicationState {
    /// One of the running sub-states.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            ReplicationState::Pulling | ReplicationState::Pushing | ReplicationState::Polling
        )
    }

    /// No further transitions happen on their own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReplicationState::Stopped | ReplicationState::Errored)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicationState::Idle => "idle",
            ReplicationState::Starting => "starting",
            ReplicationState::Paused => "paused",
            ReplicationState::Pulling => "pulling",
            ReplicationState::Pushing => "pushing",
            ReplicationState::Polling => "polling",
            ReplicationState::Stopping => "stopping",
            ReplicationState::Stopped => "stopped",
            ReplicationState::Errored => "errored",
        }
    }
}

impl std::fmt::Display for ReplicationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Control messages from the handle to the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    /// Catch up now and restart the long-poll cycle.
    ReSync,
    /// Drop the checkpoint, then re-sync.
    FullResync,
    /// Local writes are waiting; push without waiting for the interval.
    LocalChange,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(ReplicationState::Idle.to_string(), "idle");
        assert_eq!(ReplicationState::Polling.to_string(), "polling");
        assert_eq!(ReplicationState::Errored.to_string(), "errored");
    }

    #[test]
    fn test_running_substates() {
        assert!(ReplicationState::Pulling.is_running());
        assert!(ReplicationState::Pushing.is_running());
        assert!(ReplicationState::Polling.is_running());
        assert!(!ReplicationState::Paused.is_running());
        assert!(!ReplicationState::Starting.is_running());
    }

    #[test]
    fn test_terminal_states() {
        assert!(ReplicationState::Stopped.is_terminal());
        assert!(ReplicationState::Errored.is_terminal());
        assert!(!ReplicationState::Stopping.is_terminal());
        assert!(!ReplicationState::Idle.is_terminal());
    }
}
