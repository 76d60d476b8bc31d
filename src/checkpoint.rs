// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Checkpoint persistence for pull progress.
//!
//! Stores the last pulled marker for each replication identifier so a
//! restarted replication resumes where it left off.
//!
//! # Write-Through
//!
//! A checkpoint is only written after the batch it covers has been imported
//! into the local collection. `set()` persists to disk before returning, so a
//! successful `set()` is durable:
//!
//! ```text
//! list_changes → import_batch → set(checkpoint)
//!                             (crash here = re-pull the page, import is idempotent)
//! ```
//!
//! # Forward Only
//!
//! Stores never move a checkpoint backwards. `set()` with a checkpoint that
//! is not strictly after the stored one leaves the stored value in place and
//! reports [`Stored::Kept`]. The only way back is `delete()`, used by a full
//! resync.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. Writes are retried with exponential backoff (5 attempts).
//! The cache is only updated once the disk write succeeds.
//!
//! # Backends
//!
//! | Backend | Use |
//! |---------|-----|
//! | [`SqliteCheckpointStore`] | Durable, WAL mode |
//! | [`MemoryCheckpointStore`] | Tests, or `sqlite_path = ":memory:"` |

use crate::config::CheckpointConfig;
use crate::document::Checkpoint;
use crate::error::{ReplicationError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Boxed future type for trait object compatibility.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Outcome of [`CheckpointStore::set`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stored {
    /// The new checkpoint was written.
    Advanced,
    /// The stored checkpoint is at or after the offered one and was kept.
    Kept(Checkpoint),
}

/// Whether `offered` may replace `stored`.
fn advances(stored: Option<&Checkpoint>, offered: &Checkpoint) -> bool {
    stored.map_or(true, |stored| offered.is_after(stored))
}

/// Durable key-value store from replication identifier to [`Checkpoint`].
///
/// `get` returns `None` for an identifier that was never written (or was
/// deleted); callers treat that as "start from the beginning".
pub trait CheckpointStore: Send + Sync + 'static {
    fn get<'a>(&'a self, replication_id: &'a str) -> BoxFuture<'a, Result<Option<Checkpoint>>>;

    /// Write `checkpoint` unless the stored one is at or after it.
    fn set<'a>(
        &'a self,
        replication_id: &'a str,
        checkpoint: &'a Checkpoint,
    ) -> BoxFuture<'a, Result<Stored>>;

    fn delete<'a>(&'a self, replication_id: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// Open the store described by `config`.
pub async fn open(config: &CheckpointConfig) -> Result<Arc<dyn CheckpointStore>> {
    if config.is_in_memory() {
        debug!("Using in-memory checkpoint store");
        return Ok(Arc::new(MemoryCheckpointStore::new()));
    }
    let store = SqliteCheckpointStore::with_options(&config.sqlite_path, config.wal_mode).await?;
    Ok(Arc::new(store))
}

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts, "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::checkpoint_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts, "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Checkpoint storage backed by SQLite.
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
    /// Read cache, only updated after a successful disk write.
    cache: Arc<RwLock<HashMap<String, Checkpoint>>>,
    path: String,
}

impl SqliteCheckpointStore {
    /// Open (or create) a WAL-mode checkpoint database at `path`.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        Self::with_options(&path_str, true).await
    }

    async fn with_options(path: &str, wal_mode: bool) -> Result<Self> {
        info!(path = %path, "Initializing checkpoint store");

        let journal_mode = if wal_mode {
            sqlx::sqlite::SqliteJournalMode::Wal
        } else {
            sqlx::sqlite::SqliteJournalMode::Delete
        };

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path))
            .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(journal_mode)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                replication_id TEXT PRIMARY KEY,
                last_modified TEXT,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, Option<String>)> =
            sqlx::query_as("SELECT replication_id, last_modified FROM checkpoints")
                .fetch_all(&pool)
                .await?;

        let mut cache = HashMap::new();
        for (replication_id, last_modified) in rows {
            debug!(replication_id = %replication_id, ?last_modified, "Loaded checkpoint from disk");
            cache.insert(replication_id, Checkpoint { last_modified });
        }

        if !cache.is_empty() {
            info!(count = cache.len(), "Restored checkpoints from previous run");
        }

        Ok(Self {
            pool,
            cache: Arc::new(RwLock::new(cache)),
            path: path.to_string(),
        })
    }

    /// All cached checkpoints (for diagnostics).
    pub async fn get_all(&self) -> HashMap<String, Checkpoint> {
        self.cache.read().await.clone()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint_wal(&self) -> Result<()> {
        let pool = &self.pool;

        execute_with_retry("checkpoint_wal", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;

        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint the WAL and close the pool.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint_wal().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Checkpoint store closed");
    }

    async fn write(&self, replication_id: &str, checkpoint: &Checkpoint) -> Result<Stored> {
        // Held across the disk write so concurrent writers cannot interleave.
        let mut cache = self.cache.write().await;
        if let Some(stored) = cache.get(replication_id) {
            if !advances(Some(stored), checkpoint) {
                debug!(
                    replication_id = %replication_id,
                    stored = ?stored.last_modified,
                    offered = ?checkpoint.last_modified,
                    "Keeping stored checkpoint"
                );
                return Ok(Stored::Kept(stored.clone()));
            }
        }

        let now = chrono::Utc::now().timestamp_millis();
        let pool = &self.pool;

        execute_with_retry("checkpoint_set", || async {
            sqlx::query(
                r#"
                INSERT INTO checkpoints (replication_id, last_modified, updated_at)
                VALUES (?, ?, ?)
                ON CONFLICT(replication_id) DO UPDATE SET
                    last_modified = excluded.last_modified,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(replication_id)
            .bind(checkpoint.last_modified.as_deref())
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;

        cache.insert(replication_id.to_string(), checkpoint.clone());

        debug!(
            replication_id = %replication_id,
            last_modified = ?checkpoint.last_modified,
            "Checkpoint persisted"
        );
        Ok(Stored::Advanced)
    }

    async fn remove(&self, replication_id: &str) -> Result<()> {
        self.cache.write().await.remove(replication_id);

        let pool = &self.pool;
        execute_with_retry("checkpoint_delete", || async {
            sqlx::query("DELETE FROM checkpoints WHERE replication_id = ?")
                .bind(replication_id)
                .execute(pool)
                .await
        })
        .await?;

        info!(replication_id = %replication_id, "Deleted checkpoint");
        Ok(())
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn get<'a>(&'a self, replication_id: &'a str) -> BoxFuture<'a, Result<Option<Checkpoint>>> {
        Box::pin(async move { Ok(self.cache.read().await.get(replication_id).cloned()) })
    }

    fn set<'a>(
        &'a self,
        replication_id: &'a str,
        checkpoint: &'a Checkpoint,
    ) -> BoxFuture<'a, Result<Stored>> {
        Box::pin(self.write(replication_id, checkpoint))
    }

    fn delete<'a>(&'a self, replication_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.remove(replication_id))
    }
}

/// Process-local checkpoint store.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: DashMap<String, Checkpoint>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn get<'a>(&'a self, replication_id: &'a str) -> BoxFuture<'a, Result<Option<Checkpoint>>> {
        let value = self.entries.get(replication_id).map(|c| c.value().clone());
        Box::pin(async move { Ok(value) })
    }

    fn set<'a>(
        &'a self,
        replication_id: &'a str,
        checkpoint: &'a Checkpoint,
    ) -> BoxFuture<'a, Result<Stored>> {
        let outcome = match self.entries.entry(replication_id.to_string()) {
            Entry::Occupied(stored) if !advances(Some(stored.get()), checkpoint) => {
                Stored::Kept(stored.get().clone())
            }
            Entry::Occupied(mut stored) => {
                stored.insert(checkpoint.clone());
                Stored::Advanced
            }
            Entry::Vacant(slot) => {
                slot.insert(checkpoint.clone());
                Stored::Advanced
            }
        };
        Box::pin(async move { Ok(outcome) })
    }

    fn delete<'a>(&'a self, replication_id: &'a str) -> BoxFuture<'a, Result<()>> {
        self.entries.remove(replication_id);
        Box::pin(async { Ok(()) })
    }
}
