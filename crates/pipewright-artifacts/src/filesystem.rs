//! Filesystem-backed artifact store.
//!
//! Layout: `<root>/<run id>/<storage name>/{data, meta.json}`. A put is staged
//! in a temporary directory under `<root>/.staging` and renamed into place;
//! the rename is both the claim and the seal. An interrupted put leaves only
//! its staging directory, which is removed on drop.

use crate::keys::{checksum, storage_name};
use crate::retention::RetentionPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pipewright_core::artifact::{Artifact, ArtifactMeta};
use pipewright_core::ports::ArtifactStore;
use pipewright_core::{ArtifactId, Error, InstanceKey, Result, RunId};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const DATA_FILE: &str = "data";
const META_FILE: &str = "meta.json";
const STAGING_DIR: &str = ".staging";

pub struct FilesystemArtifactStore {
    root: PathBuf,
    retention: RetentionPolicy,
}

impl FilesystemArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            retention: RetentionPolicy::default(),
        }
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, run_id: RunId) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    fn artifact_dir(&self, run_id: RunId, name: &str) -> PathBuf {
        self.run_dir(run_id).join(storage_name(name))
    }

    async fn read_meta(dir: &Path) -> Result<Option<ArtifactMeta>> {
        match tokio::fs::read(dir.join(META_FILE)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_dir(run_dir: &Path) -> Result<Vec<ArtifactMeta>> {
        let mut read_dir = match tokio::fs::read_dir(run_dir).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };

        let mut metas = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(meta) = Self::read_meta(&entry.path()).await? {
                metas.push(meta);
            }
        }
        metas.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(metas)
    }

    /// Remove every run whose newest artifact is past retention. Returns the
    /// number of artifacts removed.
    pub async fn collect_garbage(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut read_dir = match tokio::fs::read_dir(&self.root).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = read_dir.next_entry().await? {
            if !entry.file_type().await?.is_dir() || entry.file_name() == STAGING_DIR {
                continue;
            }
            let metas = Self::list_dir(&entry.path()).await?;
            let Some(newest) = metas.iter().map(|m| m.sealed_at).max() else {
                continue;
            };
            if self.retention.is_expired(newest, now) {
                tokio::fs::remove_dir_all(entry.path()).await?;
                info!(run = %entry.file_name().to_string_lossy(), artifacts = metas.len(), "Collected expired run artifacts");
                removed += metas.len();
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl ArtifactStore for FilesystemArtifactStore {
    async fn put(
        &self,
        run_id: RunId,
        name: &str,
        payload: Vec<u8>,
        producer: &InstanceKey,
    ) -> Result<ArtifactMeta> {
        let dir = self.artifact_dir(run_id, name);
        let conflict = || Error::ArtifactConflict {
            run_id: run_id.to_string(),
            name: name.to_string(),
        };
        if tokio::fs::try_exists(&dir).await? {
            return Err(conflict());
        }

        let staging_root = self.root.join(STAGING_DIR);
        tokio::fs::create_dir_all(&staging_root).await?;
        tokio::fs::create_dir_all(self.run_dir(run_id)).await?;
        let staging = tempfile::Builder::new().prefix("put-").tempdir_in(&staging_root)?;

        let meta = ArtifactMeta {
            id: ArtifactId::new(),
            run_id,
            name: name.to_string(),
            producer: producer.clone(),
            size_bytes: payload.len() as u64,
            checksum: checksum(&payload),
            sealed_at: Utc::now(),
        };

        tokio::fs::write(staging.path().join(DATA_FILE), &payload).await?;
        tokio::fs::write(staging.path().join(META_FILE), serde_json::to_vec_pretty(&meta)?).await?;

        // A sealed directory is never empty, so the rename cannot replace one.
        match tokio::fs::rename(staging.path(), &dir).await {
            Ok(()) => {}
            Err(e) if matches!(e.kind(), ErrorKind::AlreadyExists | ErrorKind::DirectoryNotEmpty) => {
                return Err(conflict());
            }
            Err(e) => return Err(e.into()),
        }

        debug!(run_id = %run_id, name = %name, path = %dir.display(), "Artifact sealed");
        Ok(meta)
    }

    async fn get(&self, run_id: RunId, name: &str) -> Result<Artifact> {
        let dir = self.artifact_dir(run_id, name);
        let not_found = || Error::ArtifactNotFound {
            run_id: run_id.to_string(),
            name: name.to_string(),
        };

        let meta = Self::read_meta(&dir).await?.ok_or_else(not_found)?;
        let payload = tokio::fs::read(dir.join(DATA_FILE)).await?;
        if checksum(&payload) != meta.checksum {
            warn!(run_id = %run_id, name = %name, "Artifact payload does not match its checksum");
            return Err(Error::Internal(format!(
                "artifact {name} in run {run_id} is corrupted"
            )));
        }
        Ok(Artifact { meta, payload })
    }

    async fn list(&self, run_id: RunId) -> Result<Vec<ArtifactMeta>> {
        Self::list_dir(&self.run_dir(run_id)).await
    }

    async fn purge_run(&self, run_id: RunId) -> Result<usize> {
        let run_dir = self.run_dir(run_id);
        let count = Self::list_dir(&run_dir).await?.len();
        match tokio::fs::remove_dir_all(&run_dir).await {
            Ok(()) => Ok(count),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn producer() -> InstanceKey {
        InstanceKey::new("build")
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = FilesystemArtifactStore::new(tmp.path());
        let run = RunId::new();

        store
            .put(run, "dist/app", b"binary".to_vec(), &producer())
            .await
            .unwrap();
        let artifact = store.get(run, "dist/app").await.unwrap();
        assert_eq!(artifact.payload, b"binary");
        assert_eq!(artifact.meta.name, "dist/app");
    }

    #[tokio::test]
    async fn test_conflict_keeps_first_payload() {
        let tmp = TempDir::new().unwrap();
        let store = FilesystemArtifactStore::new(tmp.path());
        let run = RunId::new();

        store.put(run, "out", b"A".to_vec(), &producer()).await.unwrap();
        let err = store
            .put(run, "out", b"B".to_vec(), &producer())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ArtifactConflict { .. }));
        assert_eq!(store.get(run, "out").await.unwrap().payload, b"A");
    }

    #[tokio::test]
    async fn test_leftover_staging_does_not_claim_name() {
        let tmp = TempDir::new().unwrap();
        let store = FilesystemArtifactStore::new(tmp.path());
        let run = RunId::new();

        let leftover = tmp.path().join(STAGING_DIR).join("put-interrupted");
        std::fs::create_dir_all(&leftover).unwrap();
        std::fs::write(leftover.join(DATA_FILE), b"partial").unwrap();

        assert!(matches!(
            store.get(run, "out").await,
            Err(Error::ArtifactNotFound { .. })
        ));
        store.put(run, "out", b"A".to_vec(), &producer()).await.unwrap();
        assert_eq!(store.get(run, "out").await.unwrap().payload, b"A");
        assert_eq!(store.list(run).await.unwrap().len(), 1);
        assert_eq!(store.collect_garbage(Utc::now() + Duration::days(365)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_aborted_put_never_leaves_name_half_claimed() {
        let tmp = TempDir::new().unwrap();
        let store = std::sync::Arc::new(FilesystemArtifactStore::new(tmp.path()));
        let run = RunId::new();

        let task = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .put(run, "out", vec![7u8; 64 * 1024 * 1024], &producer())
                    .await
            })
        };
        let staging = tmp.path().join(STAGING_DIR);
        for _ in 0..200 {
            if std::fs::read_dir(&staging).map(|d| d.count() > 0).unwrap_or(false) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        task.abort();
        let _ = task.await;

        match store.get(run, "out").await {
            Ok(artifact) => assert_eq!(artifact.payload.len(), 64 * 1024 * 1024),
            Err(e) => {
                assert!(matches!(e, Error::ArtifactNotFound { .. }));
                store.put(run, "out", b"retry".to_vec(), &producer()).await.unwrap();
                assert_eq!(store.get(run, "out").await.unwrap().payload, b"retry");
            }
        }
    }

    #[tokio::test]
    async fn test_missing_artifact() {
        let tmp = TempDir::new().unwrap();
        let store = FilesystemArtifactStore::new(tmp.path());
        assert!(matches!(
            store.get(RunId::new(), "nope").await,
            Err(Error::ArtifactNotFound { .. })
        ));
        assert!(store.list(RunId::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupted_payload_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = FilesystemArtifactStore::new(tmp.path());
        let run = RunId::new();
        store.put(run, "out", b"A".to_vec(), &producer()).await.unwrap();

        let data = store.artifact_dir(run, "out").join(DATA_FILE);
        tokio::fs::write(data, b"tampered").await.unwrap();
        assert!(matches!(store.get(run, "out").await, Err(Error::Internal(_))));
    }

    #[tokio::test]
    async fn test_list_purge_and_gc() {
        let tmp = TempDir::new().unwrap();
        let store = FilesystemArtifactStore::new(tmp.path()).with_retention(RetentionPolicy::days(3));
        let run = RunId::new();
        store.put(run, "b", vec![1], &producer()).await.unwrap();
        store.put(run, "a", vec![2], &producer()).await.unwrap();

        let names: Vec<String> = store.list(run).await.unwrap().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["a", "b"]);

        assert_eq!(store.collect_garbage(Utc::now()).await.unwrap(), 0);
        assert_eq!(
            store.collect_garbage(Utc::now() + Duration::days(4)).await.unwrap(),
            2
        );
        assert!(store.list(run).await.unwrap().is_empty());

        store.put(run, "c", vec![], &producer()).await.unwrap();
        assert_eq!(store.purge_run(run).await.unwrap(), 1);
        assert_eq!(store.purge_run(run).await.unwrap(), 0);
    }
}
