use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use super::LockCoordinator;
use crate::error::Result;
use crate::queue::job::validate_job_id;

/// One `<job id>.lock` file per held lock, created with `O_EXCL` semantics so
/// that concurrent workers, in this process or others, cannot both succeed.
/// The file holds the holder token.
#[derive(Debug, Clone)]
pub struct FileLockCoordinator {
    dir: PathBuf,
}

impl FileLockCoordinator {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock_path(&self, job_id: &str) -> Result<PathBuf> {
        validate_job_id(job_id)?;
        Ok(self.dir.join(format!("{job_id}.lock")))
    }
}

impl LockCoordinator for FileLockCoordinator {
    fn try_acquire(&self, job_id: &str, holder: &str) -> Result<bool> {
        let path = self.lock_path(job_id)?;
        fs::create_dir_all(&self.dir)?;

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = file.write_all(holder.as_bytes()) {
            let _ = fs::remove_file(&path);
            return Err(e.into());
        }
        Ok(true)
    }

    fn release(&self, job_id: &str) -> Result<()> {
        match fs::remove_file(self.lock_path(job_id)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn holder(&self, job_id: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.lock_path(job_id)?) {
            Ok(holder) => Ok(Some(holder)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
