//! Conflict resolution for outgoing writes.
//!
//! A conflict is a push row whose assumed remote state no longer matches what
//! the remote actually holds. The resolver gets both sides and either reports
//! them equal or hands back the document that should win.
//!
//! Resolvers must be pure: the same `(local, remote)` pair always produces
//! the same verdict. Structural equality short-circuits every strategy.
//!
//! # Strategies
//!
//! | Strategy | Verdict on difference | Push enabled |
//! |----------|-----------------------|--------------|
//! | `ClientWins` | local document | yes |
//! | `ServerWins` | remote document | yes |
//! | `PullOnly` | remote document | no |
//! | `Manual` | none (surfaced only) | yes |

use crate::document::Document;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Result of resolving one conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictVerdict {
    /// Both sides carry the same content. Nothing to reconcile.
    Equal,
    /// The sides differ; `document` is the state that should win.
    Resolved { document: Document },
}

impl ConflictVerdict {
    pub fn is_equal(&self) -> bool {
        matches!(self, ConflictVerdict::Equal)
    }

    pub fn document(&self) -> Option<&Document> {
        match self {
            ConflictVerdict::Equal => None,
            ConflictVerdict::Resolved { document } => Some(document),
        }
    }
}

/// Pluggable conflict strategy.
pub trait ConflictResolver: Send + Sync + 'static {
    /// Decide between the local write and the remote master state.
    ///
    /// Returning `None` leaves the conflict unresolved for the application.
    fn resolve(&self, local: &Document, remote: &Document) -> Option<ConflictVerdict>;

    /// Name used in logs and metrics.
    fn name(&self) -> &'static str;
}

/// Always keep the remote state.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteWins;

impl ConflictResolver for RemoteWins {
    fn resolve(&self, local: &Document, remote: &Document) -> Option<ConflictVerdict> {
        Some(equal_or(local, remote, remote))
    }

    fn name(&self) -> &'static str {
        "remote_wins"
    }
}

/// Always keep the local state.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientWins;

impl ConflictResolver for ClientWins {
    fn resolve(&self, local: &Document, remote: &Document) -> Option<ConflictVerdict> {
        Some(equal_or(local, remote, local))
    }

    fn name(&self) -> &'static str {
        "client_wins"
    }
}

/// Only detect equality; differing conflicts stay with the application.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualResolution;

impl ConflictResolver for ManualResolution {
    fn resolve(&self, local: &Document, remote: &Document) -> Option<ConflictVerdict> {
        local.content_eq(remote).then_some(ConflictVerdict::Equal)
    }

    fn name(&self) -> &'static str {
        "manual"
    }
}

/// Wrap a plain function as a resolver. Equality is still checked first.
pub struct FnResolver<F> {
    name: &'static str,
    f: F,
}

impl<F> FnResolver<F>
where
    F: Fn(&Document, &Document) -> Document + Send + Sync + 'static,
{
    pub fn new(name: &'static str, f: F) -> Self {
        Self { name, f }
    }
}

impl<F> ConflictResolver for FnResolver<F>
where
    F: Fn(&Document, &Document) -> Document + Send + Sync + 'static,
{
    fn resolve(&self, local: &Document, remote: &Document) -> Option<ConflictVerdict> {
        if local.content_eq(remote) {
            return Some(ConflictVerdict::Equal);
        }
        Some(ConflictVerdict::Resolved {
            document: (self.f)(local, remote),
        })
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

fn equal_or(local: &Document, remote: &Document, winner: &Document) -> ConflictVerdict {
    if local.content_eq(remote) {
        ConflictVerdict::Equal
    } else {
        ConflictVerdict::Resolved {
            document: winner.clone(),
        }
    }
}

/// Configured sync strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictStrategy {
    #[default]
    ClientWins,
    ServerWins,
    PullOnly,
    Manual,
}

impl ConflictStrategy {
    /// Built-in resolver for this strategy.
    pub fn resolver(&self) -> Arc<dyn ConflictResolver> {
        match self {
            ConflictStrategy::ClientWins => Arc::new(ClientWins),
            ConflictStrategy::ServerWins | ConflictStrategy::PullOnly => Arc::new(RemoteWins),
            ConflictStrategy::Manual => Arc::new(ManualResolution),
        }
    }

    /// Whether local writes are pushed at all.
    pub fn pushes(&self) -> bool {
        !matches!(self, ConflictStrategy::PullOnly)
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConflictStrategy::ClientWins => "CLIENT_WINS",
            ConflictStrategy::ServerWins => "SERVER_WINS",
            ConflictStrategy::PullOnly => "PULL_ONLY",
            ConflictStrategy::Manual => "MANUAL",
        };
        f.write_str(s)
    }
}
