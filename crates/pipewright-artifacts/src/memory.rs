//! In-memory artifact store.

use crate::keys::checksum;
use crate::retention::RetentionPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use pipewright_core::artifact::{Artifact, ArtifactMeta};
use pipewright_core::ports::ArtifactStore;
use pipewright_core::{ArtifactId, Error, InstanceKey, Result, RunId};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Artifact store held in process memory. Claims are atomic per
/// `(run, name)` entry.
#[derive(Default)]
pub struct MemoryArtifactStore {
    entries: DashMap<(RunId, String), Arc<Artifact>>,
    retention: RetentionPolicy,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: RetentionPolicy) -> Self {
        Self {
            entries: DashMap::new(),
            retention,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every run whose newest artifact is past retention. Returns the
    /// number of artifacts removed.
    pub fn collect_garbage(&self, now: DateTime<Utc>) -> usize {
        let mut newest: HashMap<RunId, DateTime<Utc>> = HashMap::new();
        for entry in self.entries.iter() {
            let sealed = entry.value().meta.sealed_at;
            newest
                .entry(entry.key().0)
                .and_modify(|t| *t = (*t).max(sealed))
                .or_insert(sealed);
        }

        let expired: Vec<RunId> = newest
            .into_iter()
            .filter(|(_, sealed)| self.retention.is_expired(*sealed, now))
            .map(|(run_id, _)| run_id)
            .collect();

        let before = self.entries.len();
        self.entries.retain(|(run_id, _), _| !expired.contains(run_id));
        let removed = before - self.entries.len();
        if removed > 0 {
            info!(runs = expired.len(), artifacts = removed, "Collected expired artifacts");
        }
        removed
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(
        &self,
        run_id: RunId,
        name: &str,
        payload: Vec<u8>,
        producer: &InstanceKey,
    ) -> Result<ArtifactMeta> {
        match self.entries.entry((run_id, name.to_string())) {
            Entry::Occupied(existing) => {
                debug!(
                    run_id = %run_id,
                    name = %name,
                    owner = %existing.get().meta.producer,
                    "Artifact name already claimed"
                );
                Err(Error::ArtifactConflict {
                    run_id: run_id.to_string(),
                    name: name.to_string(),
                })
            }
            Entry::Vacant(slot) => {
                let meta = ArtifactMeta {
                    id: ArtifactId::new(),
                    run_id,
                    name: name.to_string(),
                    producer: producer.clone(),
                    size_bytes: payload.len() as u64,
                    checksum: checksum(&payload),
                    sealed_at: Utc::now(),
                };
                slot.insert(Arc::new(Artifact {
                    meta: meta.clone(),
                    payload,
                }));
                debug!(run_id = %run_id, name = %name, size = meta.size_bytes, "Artifact sealed");
                Ok(meta)
            }
        }
    }

    async fn get(&self, run_id: RunId, name: &str) -> Result<Artifact> {
        self.entries
            .get(&(run_id, name.to_string()))
            .map(|entry| entry.value().as_ref().clone())
            .ok_or_else(|| Error::ArtifactNotFound {
                run_id: run_id.to_string(),
                name: name.to_string(),
            })
    }

    async fn list(&self, run_id: RunId) -> Result<Vec<ArtifactMeta>> {
        let mut metas: Vec<ArtifactMeta> = self
            .entries
            .iter()
            .filter(|entry| entry.key().0 == run_id)
            .map(|entry| entry.value().meta.clone())
            .collect();
        metas.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(metas)
    }

    async fn purge_run(&self, run_id: RunId) -> Result<usize> {
        let before = self.entries.len();
        self.entries.retain(|(id, _), _| *id != run_id);
        Ok(before - self.entries.len())
    }
}
