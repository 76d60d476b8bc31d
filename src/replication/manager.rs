//! Registry of independent replications.
//!
//! Each replication identifier gets its own runner task, so a slow remote or
//! a long heartbeat on one never blocks another.

use super::{Replication, ReplicationHandle};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

#[derive(Default)]
pub struct ReplicationManager {
    replications: DashMap<String, Arc<ReplicationHandle>>,
}

impl ReplicationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build, register and (with `auto_start`) start a replication.
    ///
    /// Identifiers are unique: registering one twice is a config error.
    pub async fn start(&self, replication: Replication) -> Result<Arc<ReplicationHandle>> {
        let id = replication.identifier().to_string();
        if self.replications.contains_key(&id) {
            return Err(duplicate(&id));
        }

        let handle = Arc::new(replication.start().await?);

        // Another caller may have registered the same id meanwhile.
        let inserted = match self.replications.entry(id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&handle));
                true
            }
        };
        if !inserted {
            handle.stop().await;
            return Err(duplicate(&id));
        }

        metrics::set_active_replications(self.replications.len());
        info!(replication_id = %id, "Replication registered");
        Ok(handle)
    }

    pub fn get(&self, id: &str) -> Option<Arc<ReplicationHandle>> {
        self.replications.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.replications.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.replications.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replications.is_empty()
    }

    /// Stop and unregister one replication. False if unknown.
    pub async fn stop(&self, id: &str) -> bool {
        let Some((_, handle)) = self.replications.remove(id) else {
            return false;
        };
        metrics::set_active_replications(self.replications.len());
        handle.stop().await;
        true
    }

    /// Stop every replication.
    pub async fn stop_all(&self) {
        for id in self.ids() {
            self.stop(&id).await;
        }
    }
}

fn duplicate(id: &str) -> ReplicationError {
    ReplicationError::Config(format!("replication {} already registered", id))
}
