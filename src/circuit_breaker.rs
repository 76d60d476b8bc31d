//! Circuit breaker for local collection writes.
//!
//! Pulled batches and push acknowledgements are written into the local
//! collection. When that collection keeps failing (disk full, locked store),
//! hammering it every retry tick only burns CPU; the breaker fails fast
//! instead and the checkpoint simply does not advance.
//!
//! # States
//!
//! - **Closed**: Normal operation, writes pass through
//! - **Open**: Collection unhealthy, writes are rejected without being attempted
//! - **HalfOpen**: Probing whether the collection recovered
//!
//! # Usage
//!
//! ```rust,no_run
//! # use kinto_replication::circuit_breaker::{LocalStoreCircuit, CircuitError};
//! # async fn example() -> Result<(), CircuitError<String>> {
//! let circuit = LocalStoreCircuit::new();
//!
//! match circuit.imports.call(|| async { Ok::<(), String>(()) }).await {
//!     Ok(()) => { /* batch imported */ }
//!     Err(CircuitError::Rejected) => { /* circuit open, retry next cycle */ }
//!     Err(CircuitError::Inner(e)) => { /* collection error */ }
//! }
//! # Ok(())
//! # }
//! ```

use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of a call made through a [`CircuitBreaker`].
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit is open; the local collection was not touched.
    #[error("local collection circuit open, write skipped")]
    Rejected,

    /// The local collection was called and failed.
    #[error("local collection write failed: {0}")]
    Inner(#[source] E),
}

/// Tripping and recovery settings.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Failure ratio (0.0 - 1.0) over the window that trips the circuit.
    pub failure_rate: f32,
    /// Number of recent calls the failure ratio is computed over.
    pub window: usize,
    /// Calls allowed through while half-open.
    pub half_open_probes: usize,
    /// How long the circuit stays open before probing.
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_rate: 0.5,
            window: 10,
            half_open_probes: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Trips after two calls and reopens after 50ms.
    pub fn testing() -> Self {
        Self {
            failure_rate: 0.5,
            window: 2,
            half_open_probes: 1,
            recovery_timeout: Duration::from_millis(50),
        }
    }
}

/// Snapshot of a breaker's call outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CircuitStats {
    pub passed: u64,
    pub failed: u64,
    pub rejected: u64,
}

impl CircuitStats {
    pub fn calls(&self) -> u64 {
        self.passed + self.failed + self.rejected
    }

    /// Recent calls are mostly being turned away.
    pub fn looks_open(&self) -> bool {
        self.rejected > 0 && self.rejected > self.passed
    }
}

#[derive(Debug, Default)]
struct Counters {
    passed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

/// A named breaker around one kind of local write.
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,
    counters: Counters,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(config.failure_rate.clamp(0.0, 1.0))
            .closed_len(config.window.max(1))
            .half_open_len(config.half_open_probes.max(1))
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            counters: Counters::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `f` unless the circuit is open.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.inner.call(f()).await {
            Ok(value) => {
                self.counters.passed.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_circuit_call(&self.name, "success");
                Ok(value)
            }
            Err(RecloserError::Rejected) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_circuit_call(&self.name, "rejected");
                crate::metrics::set_circuit_state(&self.name, "open");
                warn!(circuit = %self.name, "Local collection circuit open, skipping write");
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_circuit_call(&self.name, "failure");
                debug!(circuit = %self.name, "Local collection write failed");
                Err(CircuitError::Inner(e))
            }
        }
    }

    pub fn stats(&self) -> CircuitStats {
        CircuitStats {
            passed: self.counters.passed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Circuits guarding the local collection.
pub struct LocalStoreCircuit {
    /// Pulled batches (`import_batch`).
    pub imports: CircuitBreaker,
    /// Push acknowledgements and conflict resolutions.
    pub writes: CircuitBreaker,
}

impl Default for LocalStoreCircuit {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStoreCircuit {
    pub fn new() -> Self {
        Self::with_config(CircuitConfig::default())
    }

    pub fn with_config(config: CircuitConfig) -> Self {
        Self {
            imports: CircuitBreaker::new("local_imports", config.clone()),
            writes: CircuitBreaker::new("local_writes", config),
        }
    }

    /// Either circuit is turning writes away.
    pub fn degraded(&self) -> bool {
        self.imports.stats().looks_open() || self.writes.stats().looks_open()
    }
}
