//! Artifact broker for Pipewright.
//!
//! Artifacts are named byte payloads scoped to one run. A name can be claimed
//! exactly once per run; the second writer gets `ArtifactConflict` and the
//! first payload stays readable.

pub mod filesystem;
pub mod keys;
pub mod memory;
pub mod retention;

pub use filesystem::FilesystemArtifactStore;
pub use memory::MemoryArtifactStore;
pub use retention::RetentionPolicy;
