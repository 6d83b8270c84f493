use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::{QueueConfig, BACKOFF_BASE_KEY, MAX_RETRIES_KEY};
use crate::error::{QueueError, Result};
use crate::queue::job::{Job, JobSpec, JobState, StateFilter};
use crate::store::{MemoryStore, Snapshot, SnapshotStore};

/// Aggregate view of a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead: usize,
    pub max_retries: String,
    pub backoff_base: String,
    pub active_workers: usize,
}

/// Owns the job set, the dead-letter queue and the queue configuration.
///
/// Every mutation is a full load-modify-save cycle on the backing store, run
/// under an in-process mutex and the store's own exclusive section. Two
/// writers, whether tasks in this process or other processes on the same
/// data, therefore never interleave their cycles.
pub struct JobQueue {
    store: Arc<dyn SnapshotStore>,
    section: Mutex<()>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            store,
            section: Mutex::new(()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    async fn mutate<T>(&self, apply: impl FnOnce(&mut Snapshot) -> Result<T>) -> Result<T> {
        let _local = self.section.lock().await;
        let _shared = self.store.exclusive().await?;

        let mut snapshot = self.store.load().await?;
        let out = apply(&mut snapshot)?;
        self.store.save(&snapshot).await?;
        Ok(out)
    }

    /// Stores replace the document as a whole, so a bare load is already a
    /// consistent snapshot.
    async fn snapshot(&self) -> Result<Snapshot> {
        self.store.load().await
    }

    /// Add a new pending job.
    pub async fn enqueue(&self, spec: JobSpec) -> Result<Job> {
        let job = Job::from_spec(spec)?;

        let job = self
            .mutate(move |snap| {
                let taken = snap.jobs.iter().chain(snap.dlq.iter()).any(|j| j.id == job.id);
                if taken {
                    return Err(QueueError::DuplicateJob(job.id));
                }
                snap.jobs.push(job.clone());
                Ok(job)
            })
            .await?;

        tracing::info!(job_id = %job.id, command = %job.command, "Job enqueued");
        Ok(job)
    }

    /// First pending job in insertion order, if any. Does not claim it.
    pub async fn next_pending(&self) -> Result<Option<Job>> {
        let snapshot = self.snapshot().await?;
        Ok(snapshot
            .jobs
            .into_iter()
            .find(|j| j.state == JobState::Pending))
    }

    /// Set a main-set job's state. `error_message` is only written when given.
    ///
    /// Moving a job into `dead` goes through [`JobQueue::move_to_dlq`]; asking
    /// for it here is rejected.
    pub async fn transition_state(
        &self,
        id: &str,
        state: JobState,
        error_message: Option<String>,
    ) -> Result<Job> {
        if state == JobState::Dead {
            return Err(QueueError::InvalidSpec(
                "jobs enter the dead state only through the dead-letter queue".to_string(),
            ));
        }

        let job = self
            .mutate(|snap| {
                let job = find_mut(&mut snap.jobs, id)?;
                if job.state == JobState::Dead {
                    return Ok(job.clone());
                }
                job.state = state;
                if error_message.is_some() {
                    job.error_message = error_message;
                }
                job.touch();
                Ok(job.clone())
            })
            .await?;

        tracing::debug!(job_id = %id, state = %job.state, "Job state updated");
        Ok(job)
    }

    /// Count one more execution attempt. Returns the new total.
    pub async fn increment_attempts(&self, id: &str) -> Result<u32> {
        self.mutate(|snap| {
            let job = find_mut(&mut snap.jobs, id)?;
            job.attempts += 1;
            job.touch();
            Ok(job.attempts)
        })
        .await
    }

    /// Move a job from the main set into the dead-letter queue in one save.
    pub async fn move_to_dlq(&self, id: &str) -> Result<Job> {
        let job = self
            .mutate(|snap| {
                let idx = position(&snap.jobs, id)?;
                let mut job = snap.jobs.remove(idx);
                job.state = JobState::Dead;
                job.touch();
                snap.dlq.push(job.clone());
                Ok(job)
            })
            .await?;

        tracing::warn!(job_id = %id, attempts = job.attempts, "Job moved to dead-letter queue");
        Ok(job)
    }

    /// Bring a dead job back as a fresh pending job with zero attempts.
    pub async fn retry_from_dlq(&self, id: &str) -> Result<Job> {
        let job = self
            .mutate(|snap| {
                let idx = snap
                    .dlq
                    .iter()
                    .position(|j| j.id == id)
                    .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
                let mut job = snap.dlq.remove(idx);
                job.state = JobState::Pending;
                job.attempts = 0;
                job.error_message = None;
                job.touch();
                snap.jobs.push(job.clone());
                Ok(job)
            })
            .await?;

        tracing::info!(job_id = %id, "Job requeued from dead-letter queue");
        Ok(job)
    }

    /// Main-set jobs matching `filter`, in insertion order.
    pub async fn list_jobs(&self, filter: StateFilter) -> Result<Vec<Job>> {
        let snapshot = self.snapshot().await?;
        Ok(snapshot
            .jobs
            .into_iter()
            .filter(|j| filter.matches(j.state))
            .collect())
    }

    pub async fn list_dlq(&self) -> Result<Vec<Job>> {
        Ok(self.snapshot().await?.dlq)
    }

    /// Look a job up in the main set, then the dead-letter queue.
    pub async fn get_job(&self, id: &str) -> Result<Job> {
        let snapshot = self.snapshot().await?;
        snapshot
            .jobs
            .into_iter()
            .chain(snapshot.dlq)
            .find(|j| j.id == id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))
    }

    /// Store a config value verbatim. Callers validate recognized keys.
    pub async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        self.mutate(|snap| {
            snap.config.set(key, value);
            Ok(())
        })
        .await?;

        tracing::info!(key, value, "Config updated");
        Ok(())
    }

    pub async fn get_config(&self) -> Result<QueueConfig> {
        Ok(self.snapshot().await?.config)
    }

    /// Per-state counts plus configuration. `active_workers` comes from the
    /// worker pool; the queue does not track workers.
    pub async fn status(&self, active_workers: usize) -> Result<QueueStatus> {
        let snapshot = self.snapshot().await?;

        let mut status = QueueStatus {
            dead: snapshot.dlq.len(),
            max_retries: snapshot.config.get(MAX_RETRIES_KEY).unwrap_or_default().to_string(),
            backoff_base: snapshot.config.get(BACKOFF_BASE_KEY).unwrap_or_default().to_string(),
            active_workers,
            ..Default::default()
        };
        for job in &snapshot.jobs {
            match job.state {
                JobState::Pending => status.pending += 1,
                JobState::Processing => status.processing += 1,
                JobState::Completed => status.completed += 1,
                JobState::Failed => status.failed += 1,
                JobState::Dead => status.dead += 1,
            }
        }
        Ok(status)
    }
}

fn position(jobs: &[Job], id: &str) -> Result<usize> {
    jobs.iter()
        .position(|j| j.id == id)
        .ok_or_else(|| QueueError::NotFound(id.to_string()))
}

fn find_mut<'a>(jobs: &'a mut [Job], id: &str) -> Result<&'a mut Job> {
    jobs.iter_mut()
        .find(|j| j.id == id)
        .ok_or_else(|| QueueError::NotFound(id.to_string()))
}
