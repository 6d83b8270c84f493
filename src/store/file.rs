use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use super::{SectionGuard, Snapshot, SnapshotStore};
use crate::error::{QueueError, Result};

const SECTION_POLL: Duration = Duration::from_millis(10);
const SECTION_TIMEOUT: Duration = Duration::from_secs(10);
/// A section marker older than this belongs to a process that died mid-write.
const SECTION_STALE_AFTER: Duration = Duration::from_secs(30);

/// Stores the snapshot as a single JSON document on disk.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
    section_timeout: Duration,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            section_timeout: SECTION_TIMEOUT,
        }
    }

    pub fn with_section_timeout(mut self, timeout: Duration) -> Self {
        self.section_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name: OsString = self.path.clone().into_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }

    fn marker_path(&self) -> PathBuf {
        self.sibling(".lock")
    }

    async fn ensure_parent(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    async fn is_stale(marker: &Path) -> bool {
        tokio::fs::metadata(marker)
            .await
            .ok()
            .and_then(|meta| meta.modified().ok())
            .and_then(|modified| modified.elapsed().ok())
            .is_some_and(|age| age > SECTION_STALE_AFTER)
    }
}

#[async_trait]
impl SnapshotStore for JsonFileStore {
    async fn load(&self) -> Result<Snapshot> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Snapshot::default()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Snapshot::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        self.ensure_parent().await?;
        let json = serde_json::to_vec_pretty(snapshot)?;

        // Write a sibling then rename over the target so readers never see a
        // half-written document.
        let tmp = self.sibling(&format!(".tmp-{}", uuid::Uuid::new_v4().simple()));
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn exclusive(&self) -> Result<SectionGuard> {
        self.ensure_parent().await?;
        let marker = self.marker_path();
        let deadline = Instant::now() + self.section_timeout;

        loop {
            let created = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&marker)
                .await;

            match created {
                Ok(mut file) => {
                    let guard = SectionGuard::with_marker(marker.clone());
                    file.write_all(std::process::id().to_string().as_bytes())
                        .await?;
                    return Ok(guard);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if Self::is_stale(&marker).await {
                        // Not atomic with the staleness check: two processes
                        // breaking the same marker can race, and the slower
                        // one may delete the marker the faster one just
                        // created. Markers only go stale after a crash.
                        tracing::warn!(path = %marker.display(), "Breaking stale store section marker");
                        match tokio::fs::remove_file(&marker).await {
                            Ok(()) => {}
                            Err(e) if e.kind() == ErrorKind::NotFound => {}
                            Err(e) => return Err(e.into()),
                        }
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(QueueError::StoreBusy);
                    }
                    tokio::time::sleep(SECTION_POLL).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
