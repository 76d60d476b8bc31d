//! Leader election.
//!
//! When several instances of the same client share one local collection and
//! one checkpoint store, only one of them may replicate at a time. The engine
//! depends on the [`LeaderElector`] capability only:
//!
//! ```text
//! acquire() ──▶ Lease ──(lost)──▶ replication pauses, acquire() again
//! ```
//!
//! - [`SingleInstance`]: always leader, the lease is never lost
//! - [`LocalElection`]: candidates in one process share a lock; the holder can
//!   be revoked

use crate::error::Result;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::debug;

/// Boxed future type for trait object compatibility.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Leadership capability.
pub trait LeaderElector: Send + Sync + 'static {
    /// Wait until this instance is leader.
    fn acquire(&self) -> BoxFuture<'_, Result<Lease>>;
}

/// Keeps the underlying leadership alive for as long as the lease lives.
enum Hold {
    Forever(watch::Sender<bool>),
    Lock(OwnedMutexGuard<()>),
}

/// Proof of leadership. Dropping it releases leadership.
pub struct Lease {
    held: watch::Receiver<bool>,
    _hold: Hold,
}

impl Lease {
    /// A lease that is never lost.
    pub fn permanent() -> Self {
        let (tx, rx) = watch::channel(true);
        Self {
            held: rx,
            _hold: Hold::Forever(tx),
        }
    }

    pub fn is_lost(&self) -> bool {
        !*self.held.borrow()
    }

    /// Resolves once leadership is lost. Cancel-safe.
    pub async fn lost(&self) {
        wait_lost(self.held.clone()).await;
    }

    /// Run `callback` when leadership is lost.
    pub fn on_lost<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let held = self.held.clone();
        tokio::spawn(async move {
            wait_lost(held).await;
            callback();
        })
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").field("lost", &self.is_lost()).finish()
    }
}

async fn wait_lost(mut held: watch::Receiver<bool>) {
    loop {
        if !*held.borrow_and_update() {
            return;
        }
        // A dropped sender means the election is gone
        if held.changed().await.is_err() {
            return;
        }
    }
}

/// Always leader.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleInstance;

impl LeaderElector for SingleInstance {
    fn acquire(&self) -> BoxFuture<'_, Result<Lease>> {
        Box::pin(async { Ok(Lease::permanent()) })
    }
}

/// In-process election between candidates sharing one lock.
///
/// Clone it to create another candidate.
#[derive(Clone, Default)]
pub struct LocalElection {
    lock: Arc<AsyncMutex<()>>,
    current: Arc<Mutex<Option<watch::Sender<bool>>>>,
}

impl LocalElection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take leadership away from the current holder.
    ///
    /// The holder sees its lease lost and must drop it; the lock passes to the
    /// next waiting candidate once it does.
    pub fn revoke(&self) {
        let sender = match self.current.lock() {
            Ok(mut current) => current.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(sender) = sender {
            debug!("Revoking leadership");
            let _ = sender.send(false);
        }
    }

    /// Whether some candidate currently holds the lock.
    pub fn is_held(&self) -> bool {
        self.lock.try_lock().is_err()
    }
}

impl LeaderElector for LocalElection {
    fn acquire(&self) -> BoxFuture<'_, Result<Lease>> {
        Box::pin(async move {
            let guard = Arc::clone(&self.lock).lock_owned().await;
            let (tx, rx) = watch::channel(true);
            match self.current.lock() {
                Ok(mut current) => *current = Some(tx),
                Err(poisoned) => *poisoned.into_inner() = Some(tx),
            }
            debug!("Leadership acquired");
            Ok(Lease {
                held: rx,
                _hold: Hold::Lock(guard),
            })
        })
    }
}

impl std::fmt::Debug for LocalElection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalElection").field("held", &self.is_held()).finish()
    }
}
