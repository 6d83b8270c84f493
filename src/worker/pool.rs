use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::{QueueError, Result};
use crate::lock::{ClaimGuard, LockCoordinator};
use crate::queue::{Job, JobQueue, JobState, QueueStatus, StateFilter};
use crate::worker::executor::JobExecutor;

struct RunningWorkers {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Owns a set of worker loops pulling from one [`JobQueue`].
pub struct WorkerPool {
    queue: Arc<JobQueue>,
    locks: Arc<dyn LockCoordinator>,
    config: WorkerConfig,
    active: Arc<AtomicUsize>,
    running: Mutex<Option<RunningWorkers>>,
}

impl WorkerPool {
    pub fn new(queue: Arc<JobQueue>, locks: Arc<dyn LockCoordinator>, config: WorkerConfig) -> Self {
        Self {
            queue,
            locks,
            config,
            active: Arc::new(AtomicUsize::new(0)),
            running: Mutex::new(None),
        }
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Spawn `count` worker loops. Returns as soon as they are launched.
    pub fn start(&self, count: usize) -> Result<()> {
        if count == 0 {
            return Err(QueueError::InvalidConfig {
                key: "worker-count".to_string(),
                value: count.to_string(),
            });
        }

        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.is_some() || self.active_workers() > 0 {
            return Err(QueueError::AlreadyRunning);
        }

        let shutdown = CancellationToken::new();
        let handles = (0..count)
            .map(|id| {
                let worker = Worker {
                    id,
                    holder: format!("{}:{}", std::process::id(), id),
                    queue: Arc::clone(&self.queue),
                    locks: Arc::clone(&self.locks),
                    executor: JobExecutor::from_config(&self.config),
                    config: self.config.clone(),
                };
                let shutdown = shutdown.clone();
                let active = Arc::clone(&self.active);
                tokio::spawn(async move {
                    worker.run(shutdown, active).await;
                })
            })
            .collect();

        *running = Some(RunningWorkers { shutdown, handles });
        tracing::info!(count, "Worker pool started");
        Ok(())
    }

    /// Stop claiming new work and wait up to the grace period for in-flight
    /// jobs. Running commands are never killed here. Returns `true` when
    /// every worker finished inside the grace period.
    ///
    /// Workers still busy when the grace period ends stay registered, so the
    /// pool keeps reporting itself running and refuses `start` until a later
    /// `stop` sees them finish.
    pub async fn stop(&self) -> bool {
        let (shutdown, mut handles) = {
            let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
            let Some(workers) = running.as_mut() else {
                return true;
            };
            (workers.shutdown.clone(), std::mem::take(&mut workers.handles))
        };

        tracing::info!(workers = handles.len(), "Stopping worker pool");
        shutdown.cancel();

        // Finished handles are popped so only unfinished ones can be left over.
        let drain = async {
            while let Some(handle) = handles.last_mut() {
                if let Err(e) = handle.await {
                    tracing::error!(error = %e, "Worker task ended abnormally");
                }
                handles.pop();
            }
        };
        let timed_out = tokio::time::timeout(self.config.shutdown_grace, drain)
            .await
            .is_err();

        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if timed_out {
            tracing::warn!(
                still_active = self.active_workers(),
                grace = ?self.config.shutdown_grace,
                "Workers did not drain within the grace period"
            );
            if let Some(workers) = running.as_mut() {
                workers.handles.append(&mut handles);
            }
            return false;
        }

        // Another concurrent `stop` may still be waiting on its share.
        let idle = running.as_ref().map_or(true, |w| w.handles.is_empty())
            && self.active_workers() == 0;
        if !idle {
            return false;
        }
        *running = None;
        tracing::info!("All workers stopped");
        true
    }

    /// Wait for `shutdown` (normally from the signal handler), then stop.
    pub async fn run_until_shutdown(&self, shutdown: CancellationToken) -> bool {
        shutdown.cancelled().await;
        self.stop().await
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub async fn status(&self) -> Result<QueueStatus> {
        self.queue.status(self.active_workers()).await
    }
}

enum Tick {
    Idle,
    Contended,
    Processed,
}

struct Worker {
    id: usize,
    holder: String,
    queue: Arc<JobQueue>,
    locks: Arc<dyn LockCoordinator>,
    executor: JobExecutor,
    config: WorkerConfig,
}

impl Worker {
    async fn run(self, shutdown: CancellationToken, active: Arc<AtomicUsize>) {
        active.fetch_add(1, Ordering::SeqCst);
        tracing::info!(worker_id = self.id, "Worker started");

        while !shutdown.is_cancelled() {
            let pause = match self.tick(&shutdown).await {
                Ok(Tick::Processed) => None,
                Ok(Tick::Idle) => Some(self.config.idle_poll_interval),
                Ok(Tick::Contended) => Some(self.config.contention_poll_interval),
                Err(e) => {
                    tracing::error!(worker_id = self.id, error = %e, "Worker iteration failed");
                    Some(self.config.idle_poll_interval)
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }

        active.fetch_sub(1, Ordering::SeqCst);
        tracing::info!(worker_id = self.id, "Worker stopped");
    }

    /// Claim and run one pending job. Candidates are tried in queue order, so
    /// a job whose lock is held (by a busy worker or a stale lock file) does
    /// not hold up the jobs behind it.
    async fn tick(&self, shutdown: &CancellationToken) -> Result<Tick> {
        let candidates = self
            .queue
            .list_jobs(StateFilter::Only(JobState::Pending))
            .await?;
        if candidates.is_empty() {
            return Ok(Tick::Idle);
        }

        for candidate in candidates {
            if shutdown.is_cancelled() {
                break;
            }
            let Some(claim) = ClaimGuard::try_claim(&self.locks, &candidate.id, &self.holder)?
            else {
                tracing::debug!(worker_id = self.id, job_id = %candidate.id, "Job locked by another worker");
                continue;
            };

            // The pending read happened before the lock; another worker may
            // have finished the job and released it in between.
            let job = self.queue.get_job(claim.job_id()).await?;
            if job.state != JobState::Pending {
                continue;
            }

            self.process(&job, shutdown).await?;
            drop(claim);
            return Ok(Tick::Processed);
        }
        Ok(Tick::Contended)
    }

    async fn process(&self, job: &Job, shutdown: &CancellationToken) -> Result<()> {
        self.queue
            .transition_state(&job.id, JobState::Processing, None)
            .await?;
        tracing::info!(worker_id = self.id, job_id = %job.id, "Job claimed");

        let result = self.executor.execute(&job.id, &job.command).await;
        if result.is_success() {
            self.queue
                .transition_state(&job.id, JobState::Completed, None)
                .await?;
            tracing::info!(worker_id = self.id, job_id = %job.id, "Job completed");
            return Ok(());
        }

        let error = result
            .error
            .unwrap_or_else(|| format!("Command {}", result.status));
        self.handle_failure(job, error, shutdown).await
    }

    async fn handle_failure(
        &self,
        job: &Job,
        error: String,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let attempts = self.queue.increment_attempts(&job.id).await?;
        let config = self.queue.get_config().await?;
        let max_retries = job.effective_max_retries(&config);

        self.queue
            .transition_state(&job.id, JobState::Failed, Some(error.clone()))
            .await?;

        if attempts >= max_retries {
            self.queue.move_to_dlq(&job.id).await?;
            tracing::warn!(
                worker_id = self.id,
                job_id = %job.id,
                attempts,
                max_retries,
                error = %error,
                "Job exhausted its retries"
            );
            return Ok(());
        }

        let delay = config.backoff_delay(attempts, self.config.backoff_unit);
        tracing::warn!(
            worker_id = self.id,
            job_id = %job.id,
            attempts,
            max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Job failed, retrying after backoff"
        );

        self.backoff(delay, shutdown).await;
        self.queue
            .transition_state(&job.id, JobState::Pending, None)
            .await?;
        Ok(())
    }

    /// Shutdown cuts the wait short; the job still goes back to pending.
    async fn backoff(&self, delay: Duration, shutdown: &CancellationToken) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.cancelled() => {
                tracing::info!(worker_id = self.id, "Backoff interrupted by shutdown");
            }
        }
    }
}
