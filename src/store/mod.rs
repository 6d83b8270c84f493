//! Persistence for a queue's full state.
//!
//! A queue is one logical document holding the main job set, the dead-letter
//! queue and the configuration. Backends only need to load and save that
//! document whole; the queue layer wraps every load-modify-save cycle in
//! [`SnapshotStore::exclusive`] so concurrent writers never interleave.
//!
//! - [`JsonFileStore`]: pretty-printed JSON file, atomic replace on save,
//!   marker-file exclusion shared between processes
//! - [`MemoryStore`]: in-process document, for tests and embedding

pub mod file;
pub mod memory;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::QueueConfig;
use crate::error::Result;
use crate::queue::Job;

pub use file::JsonFileStore;
pub use memory::MemoryStore;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub jobs: Vec<Job>,
    #[serde(default)]
    pub dlq: Vec<Job>,
    #[serde(default)]
    pub config: QueueConfig,
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load(&self) -> Result<Snapshot>;

    async fn save(&self, snapshot: &Snapshot) -> Result<()>;

    /// Enter a section that excludes every other handle on the same backing
    /// data until the returned guard is dropped.
    async fn exclusive(&self) -> Result<SectionGuard> {
        Ok(SectionGuard::unlocked())
    }
}

/// Held for the duration of one load-modify-save cycle.
#[must_use]
#[derive(Debug)]
pub struct SectionGuard {
    marker: Option<PathBuf>,
}

impl SectionGuard {
    /// Guard for backends whose exclusion is entirely in-process.
    pub fn unlocked() -> Self {
        Self { marker: None }
    }

    pub(crate) fn with_marker(path: PathBuf) -> Self {
        Self { marker: Some(path) }
    }
}

impl Drop for SectionGuard {
    fn drop(&mut self) {
        if let Some(path) = self.marker.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove store section marker");
                }
            }
        }
    }
}
