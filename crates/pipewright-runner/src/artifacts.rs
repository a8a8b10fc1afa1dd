//! Built-in artifact actions.

use crate::actions::Action;
use async_trait::async_trait;
use pipewright_core::events::{ArtifactSealedPayload, Event};
use pipewright_core::ports::{ActionOutcome, ActionRequest, ArtifactStore, EventBus};
use pipewright_core::{Error, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

fn required<'a>(request: &'a ActionRequest, name: &str) -> Result<&'a str> {
    request
        .input(name)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::ActionFailed(format!("{}: missing '{}' input", request.action_id, name)))
}

fn resolve(request: &ActionRequest, path: &str) -> PathBuf {
    request.workdir.join(path)
}

/// `artifact/upload`: seal the file at `path` under `name`.
pub struct UploadArtifact {
    store: Arc<dyn ArtifactStore>,
    event_bus: Arc<dyn EventBus>,
}

impl UploadArtifact {
    pub fn new(store: Arc<dyn ArtifactStore>, event_bus: Arc<dyn EventBus>) -> Self {
        Self { store, event_bus }
    }
}

#[async_trait]
impl Action for UploadArtifact {
    fn name(&self) -> &str {
        "artifact/upload"
    }

    async fn run(&self, request: &ActionRequest) -> Result<ActionOutcome> {
        let name = required(request, "name")?;
        let path = resolve(request, required(request, "path")?);

        let payload = tokio::fs::read(&path).await.map_err(|e| {
            Error::ActionFailed(format!("failed to read {}: {}", path.display(), e))
        })?;

        let meta = self
            .store
            .put(request.run_id, name, payload, &request.instance)
            .await?;
        info!(name = %name, size = meta.size_bytes, producer = %meta.producer, "Uploaded artifact");

        let event = Event::ArtifactSealed(ArtifactSealedPayload {
            run_id: meta.run_id,
            name: meta.name.clone(),
            producer: meta.producer.clone(),
            size_bytes: meta.size_bytes,
            checksum: meta.checksum.clone(),
        });
        if let Err(e) = self.event_bus.publish(event).await {
            warn!(error = %e, "Failed to publish artifact event");
        }

        let mut outcome = ActionOutcome::success()
            .with_output("checksum", meta.checksum)
            .with_output("size", meta.size_bytes.to_string());
        outcome.artifacts.push(meta.name);
        Ok(outcome)
    }
}

/// `artifact/download`: write artifact `name` to `path`.
pub struct DownloadArtifact {
    store: Arc<dyn ArtifactStore>,
}

impl DownloadArtifact {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Action for DownloadArtifact {
    fn name(&self) -> &str {
        "artifact/download"
    }

    async fn run(&self, request: &ActionRequest) -> Result<ActionOutcome> {
        let name = required(request, "name")?;
        let path = resolve(request, request.input("path").unwrap_or(name));

        let artifact = self.store.get(request.run_id, name).await?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &artifact.payload).await?;
        info!(name = %name, path = %path.display(), "Downloaded artifact");

        Ok(ActionOutcome::success()
            .with_output("path", path.display().to_string())
            .with_output("checksum", artifact.meta.checksum))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionRegistry;
    use pipewright_artifacts::MemoryArtifactStore;
    use pipewright_core::bus::BroadcastEventBus;
    use pipewright_core::ports::ActionInvoker;
    use pipewright_core::{InstanceKey, RunId};
    use std::collections::BTreeMap;
    use tokio::sync::broadcast;

    fn collect_sealed(rx: &mut broadcast::Receiver<Event>) -> Vec<String> {
        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let Event::ArtifactSealed(p) = event {
                names.push(p.name);
            }
        }
        names
    }

    fn request(
        action: &str,
        run_id: RunId,
        instance: &str,
        workdir: &std::path::Path,
        inputs: &[(&str, &str)],
    ) -> ActionRequest {
        ActionRequest {
            action_id: action.to_string(),
            inputs: inputs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            env: BTreeMap::new(),
            workdir: workdir.to_path_buf(),
            run_id,
            instance: InstanceKey::new(instance),
        }
    }

    #[tokio::test]
    async fn test_upload_then_download() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("app.bin"), b"payload").unwrap();

        let store = Arc::new(MemoryArtifactStore::new());
        let bus = Arc::new(BroadcastEventBus::new());
        let mut events = bus.receiver();
        let registry = ActionRegistry::with_builtins(store.clone(), bus.clone());
        let run = RunId::new();

        let uploaded = registry
            .invoke(request(
                "artifact/upload@v1",
                run,
                "build",
                tmp.path(),
                &[("name", "app"), ("path", "app.bin")],
            ))
            .await
            .unwrap();
        assert_eq!(uploaded.artifacts, vec!["app".to_string()]);
        assert_eq!(collect_sealed(&mut events), vec!["app".to_string()]);

        let downloaded = registry
            .invoke(request(
                "artifact/download",
                run,
                "deploy",
                tmp.path(),
                &[("name", "app"), ("path", "out/app.bin")],
            ))
            .await
            .unwrap();
        assert!(downloaded.is_success());
        assert_eq!(std::fs::read(tmp.path().join("out/app.bin")).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_second_upload_conflicts() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a"), b"A").unwrap();
        std::fs::write(tmp.path().join("b"), b"B").unwrap();

        let store = Arc::new(MemoryArtifactStore::new());
        let registry = ActionRegistry::with_builtins(store.clone(), Arc::new(BroadcastEventBus::new()));
        let run = RunId::new();

        registry
            .invoke(request("artifact/upload", run, "x", tmp.path(), &[("name", "out"), ("path", "a")]))
            .await
            .unwrap();
        let err = registry
            .invoke(request("artifact/upload", run, "y", tmp.path(), &[("name", "out"), ("path", "b")]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ArtifactConflict { ref name, .. } if name == "out"));

        let kept = store.get(run, "out").await.unwrap();
        assert_eq!(kept.payload, b"A");
        assert_eq!(kept.meta.producer, InstanceKey::new("x"));
    }

    #[tokio::test]
    async fn test_missing_inputs_fail_the_action() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = ActionRegistry::with_builtins(
            Arc::new(MemoryArtifactStore::new()),
            Arc::new(BroadcastEventBus::new()),
        );
        let err = registry
            .invoke(request("artifact/upload", RunId::new(), "x", tmp.path(), &[("name", "out")]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ActionFailed(_)));

        let err = registry
            .invoke(request("artifact/download", RunId::new(), "x", tmp.path(), &[("name", "nope")]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ArtifactNotFound { .. }));
    }
}
