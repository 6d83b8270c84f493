use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Mutex;

use super::LockCoordinator;
use crate::error::Result;

/// Locks kept in a map. Only excludes workers sharing this instance.
#[derive(Debug, Default)]
pub struct MemoryLockCoordinator {
    held: Mutex<HashMap<String, String>>,
}

impl MemoryLockCoordinator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockCoordinator for MemoryLockCoordinator {
    fn try_acquire(&self, job_id: &str, holder: &str) -> Result<bool> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        match held.entry(job_id.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(holder.to_string());
                Ok(true)
            }
        }
    }

    fn release(&self, job_id: &str) -> Result<()> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.remove(job_id);
        Ok(())
    }

    fn holder(&self, job_id: &str) -> Result<Option<String>> {
        let held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        Ok(held.get(job_id).cloned())
    }
}
