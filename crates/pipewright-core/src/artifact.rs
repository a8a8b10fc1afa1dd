//! Artifact types.

use crate::ids::{ArtifactId, InstanceKey, RunId};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Metadata recorded when an artifact is sealed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactMeta {
    pub id: ArtifactId,
    pub run_id: RunId,
    pub name: String,
    pub producer: InstanceKey,
    pub size_bytes: u64,
    /// Hex-encoded SHA-256 of the payload.
    pub checksum: String,
    pub sealed_at: DateTime<Utc>,
}

/// A sealed artifact and its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub meta: ArtifactMeta,
    pub payload: Vec<u8>,
}
