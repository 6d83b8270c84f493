use std::sync::Mutex;

use async_trait::async_trait;

use super::{Snapshot, SnapshotStore};
use crate::error::Result;

/// Keeps the snapshot in process memory. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshot: Mutex<Snapshot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            snapshot: Mutex::new(snapshot),
        }
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn load(&self) -> Result<Snapshot> {
        let snapshot = self.snapshot.lock().unwrap_or_else(|e| e.into_inner());
        Ok(snapshot.clone())
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let mut current = self.snapshot.lock().unwrap_or_else(|e| e.into_inner());
        *current = snapshot.clone();
        Ok(())
    }
}
