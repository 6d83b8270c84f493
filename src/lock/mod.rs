//! Per-job mutual exclusion between workers.
//!
//! A worker must hold a job's lock before moving it out of `pending`. The
//! contract is create-if-absent: [`LockCoordinator::try_acquire`] succeeds for
//! exactly one caller until the lock is released. Locks never expire; a
//! worker process killed without running its cleanup leaves the job locked
//! until the marker is removed by hand.
//!
//! [`ClaimGuard`] ties a held lock to a scope so it is released on every exit
//! path, including early returns and panics.

pub mod file;
pub mod memory;

use std::sync::Arc;

use crate::error::Result;

pub use file::FileLockCoordinator;
pub use memory::MemoryLockCoordinator;

pub trait LockCoordinator: Send + Sync {
    /// Record a lock for `job_id` held by `holder`. Returns `false`, without
    /// error, when somebody already holds it.
    fn try_acquire(&self, job_id: &str, holder: &str) -> Result<bool>;

    /// Drop the lock for `job_id`. Releasing a lock that does not exist is
    /// not an error.
    fn release(&self, job_id: &str) -> Result<()>;

    /// Current holder token, if the job is locked.
    fn holder(&self, job_id: &str) -> Result<Option<String>>;
}

/// A held job lock, released when dropped.
#[must_use]
pub struct ClaimGuard {
    locks: Arc<dyn LockCoordinator>,
    job_id: String,
}

impl ClaimGuard {
    /// Try to lock `job_id`; `None` means another holder got there first.
    pub fn try_claim(
        locks: &Arc<dyn LockCoordinator>,
        job_id: &str,
        holder: &str,
    ) -> Result<Option<Self>> {
        if !locks.try_acquire(job_id, holder)? {
            return Ok(None);
        }
        Ok(Some(Self {
            locks: Arc::clone(locks),
            job_id: job_id.to_string(),
        }))
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if let Err(e) = self.locks.release(&self.job_id) {
            tracing::error!(job_id = %self.job_id, error = %e, "Failed to release job lock");
        }
    }
}
