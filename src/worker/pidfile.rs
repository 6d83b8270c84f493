use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{QueueError, Result};

/// Bound on evict-and-retry rounds when racing other claimants.
const CLAIM_ATTEMPTS: usize = 8;

/// What a running `worker start` process records about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRecord {
    pub pid: u32,
    pub workers: usize,
    pub started_at: DateTime<Utc>,
}

/// Marker file letting other CLI invocations find the running pool.
#[derive(Debug, Clone)]
pub struct WorkerPidFile {
    path: PathBuf,
}

impl WorkerPidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> Result<Option<PoolRecord>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Ignoring unreadable pid file");
                Ok(None)
            }
        }
    }

    /// The recorded pool, if its process is still alive. A record left by a
    /// dead process is removed.
    pub fn live_record(&self) -> Result<Option<PoolRecord>> {
        let Some(record) = self.read()? else {
            return Ok(None);
        };
        if process_alive(record.pid) {
            return Ok(Some(record));
        }
        tracing::debug!(pid = record.pid, "Removing pid file of exited worker pool");
        self.evict_stale()?;
        Ok(None)
    }

    /// Record this process as the running pool, refusing if another live
    /// pool is already recorded.
    ///
    /// The record is written to a private temp file and hard-linked into
    /// place, so the pid file appears complete or not at all and only one
    /// claimant can create it.
    pub fn claim(&self, workers: usize) -> Result<PoolRecord> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let record = PoolRecord {
            pid: std::process::id(),
            workers,
            started_at: Utc::now(),
        };

        let staged = self.sibling(&format!(".new-{}", Uuid::new_v4().simple()));
        std::fs::write(&staged, serde_json::to_vec(&record)?)?;
        let claimed = self.link_staged(&staged, &record);
        if let Err(e) = std::fs::remove_file(&staged) {
            tracing::warn!(path = %staged.display(), error = %e, "Failed to remove staged pid file");
        }
        claimed.map(|()| record)
    }

    fn link_staged(&self, staged: &Path, record: &PoolRecord) -> Result<()> {
        for _ in 0..CLAIM_ATTEMPTS {
            match std::fs::hard_link(staged, &self.path) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }

            match self.read()? {
                Some(existing) if existing.pid == record.pid => {
                    std::fs::write(&self.path, serde_json::to_vec(record)?)?;
                    return Ok(());
                }
                Some(existing) if process_alive(existing.pid) => {
                    return Err(QueueError::AlreadyRunning);
                }
                _ => self.evict_stale()?,
            }
        }
        Err(QueueError::AlreadyRunning)
    }

    /// Move a dead or unreadable record aside and delete it. Renaming first
    /// means a record written by a live claimant in the meantime is put back
    /// instead of deleted.
    fn evict_stale(&self) -> Result<()> {
        let aside = self.sibling(&format!(".stale-{}", Uuid::new_v4().simple()));
        match std::fs::rename(&self.path, &aside) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let moved = std::fs::read(&aside)
            .ok()
            .and_then(|raw| serde_json::from_slice::<PoolRecord>(&raw).ok());
        if let Some(record) = moved.filter(|r| process_alive(r.pid)) {
            tracing::debug!(pid = record.pid, "Restoring pid file of live worker pool");
            match std::fs::hard_link(&aside, &self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }
        } else {
            tracing::debug!(path = %self.path.display(), "Removed stale worker pool record");
        }
        std::fs::remove_file(&aside)?;
        Ok(())
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name: OsString = self.path.clone().into_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }

    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Ask the recorded pool to shut down via SIGTERM. Returns the pid that
    /// was signalled, or `None` when no live pool is recorded.
    pub fn signal_stop(&self) -> Result<Option<u32>> {
        let Some(record) = self.live_record()? else {
            return Ok(None);
        };
        let status = Command::new("kill")
            .arg("-TERM")
            .arg(record.pid.to_string())
            .stderr(Stdio::null())
            .status()?;
        if !status.success() {
            return Err(QueueError::Io(std::io::Error::other(format!(
                "failed to signal worker pool process {}",
                record.pid
            ))));
        }
        Ok(Some(record.pid))
    }
}

fn process_alive(pid: u32) -> bool {
    Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn read_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let pid_file = WorkerPidFile::new(dir.path().join("worker.pid"));
        assert!(pid_file.read().unwrap().is_none());
        assert!(pid_file.live_record().unwrap().is_none());
    }

    #[test]
    fn claim_records_current_process() {
        let dir = TempDir::new().unwrap();
        let pid_file = WorkerPidFile::new(dir.path().join("worker.pid"));

        let record = pid_file.claim(4).unwrap();
        assert_eq!(record.pid, std::process::id());
        assert_eq!(record.workers, 4);

        let live = pid_file.live_record().unwrap().unwrap();
        assert_eq!(live, record);

        pid_file.remove().unwrap();
        assert!(pid_file.read().unwrap().is_none());
    }

    #[test]
    fn dead_process_record_is_cleared() {
        let dir = TempDir::new().unwrap();
        let pid_file = WorkerPidFile::new(dir.path().join("worker.pid"));

        let mut child = Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();

        let record = PoolRecord {
            pid: dead_pid,
            workers: 1,
            started_at: Utc::now(),
        };
        std::fs::write(pid_file.path(), serde_json::to_vec(&record).unwrap()).unwrap();

        assert!(pid_file.live_record().unwrap().is_none());
        assert!(!pid_file.path().exists());
    }

    #[test]
    fn garbage_pid_file_is_ignored() {
        let dir = TempDir::new().unwrap();
        let pid_file = WorkerPidFile::new(dir.path().join("worker.pid"));
        std::fs::write(pid_file.path(), "not json").unwrap();
        assert!(pid_file.read().unwrap().is_none());
    }

    fn write_record(pid_file: &WorkerPidFile, pid: u32) {
        let record = PoolRecord {
            pid,
            workers: 2,
            started_at: Utc::now(),
        };
        std::fs::write(pid_file.path(), serde_json::to_vec(&record).unwrap()).unwrap();
    }

    fn leftover_files(dir: &TempDir) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn claim_refuses_live_foreign_pool() {
        let dir = TempDir::new().unwrap();
        let pid_file = WorkerPidFile::new(dir.path().join("worker.pid"));

        let mut other = Command::new("sleep").arg("5").spawn().unwrap();
        write_record(&pid_file, other.id());

        let result = pid_file.claim(1);
        other.kill().unwrap();
        other.wait().unwrap();

        assert!(matches!(result, Err(QueueError::AlreadyRunning)));
        assert_eq!(pid_file.read().unwrap().unwrap().pid, other.id());
        assert_eq!(leftover_files(&dir), vec!["worker.pid".to_string()]);
    }

    #[test]
    fn claim_replaces_dead_pool_record() {
        let dir = TempDir::new().unwrap();
        let pid_file = WorkerPidFile::new(dir.path().join("worker.pid"));

        let mut child = Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();
        write_record(&pid_file, dead_pid);

        let record = pid_file.claim(3).unwrap();

        assert_eq!(record.pid, std::process::id());
        assert_eq!(pid_file.read().unwrap().unwrap(), record);
        assert_eq!(leftover_files(&dir), vec!["worker.pid".to_string()]);
    }

    #[test]
    fn claim_replaces_garbage_record() {
        let dir = TempDir::new().unwrap();
        let pid_file = WorkerPidFile::new(dir.path().join("worker.pid"));
        std::fs::write(pid_file.path(), "").unwrap();

        let record = pid_file.claim(1).unwrap();

        assert_eq!(pid_file.read().unwrap().unwrap(), record);
    }

    #[test]
    fn claim_again_from_same_process_updates_record() {
        let dir = TempDir::new().unwrap();
        let pid_file = WorkerPidFile::new(dir.path().join("worker.pid"));

        pid_file.claim(1).unwrap();
        let second = pid_file.claim(5).unwrap();

        assert_eq!(pid_file.read().unwrap().unwrap().workers, 5);
        assert_eq!(pid_file.read().unwrap().unwrap(), second);
    }
}

