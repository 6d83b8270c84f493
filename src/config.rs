use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};

/// Config key holding the default retry ceiling.
pub const MAX_RETRIES_KEY: &str = "max-retries";
/// Config key holding the exponential backoff base.
pub const BACKOFF_BASE_KEY: &str = "backoff-base";

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BACKOFF_BASE: u32 = 2;

/// Queue-wide settings persisted alongside the job data.
///
/// Values are stored as strings, exactly as they were set. Unknown keys are
/// kept verbatim; the typed accessors only interpret the recognized ones and
/// fall back to the defaults when a stored value does not parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueConfig(BTreeMap<String, String>);

impl Default for QueueConfig {
    fn default() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(MAX_RETRIES_KEY.to_string(), DEFAULT_MAX_RETRIES.to_string());
        entries.insert(BACKOFF_BASE_KEY.to_string(), DEFAULT_BACKOFF_BASE.to_string());
        Self(entries)
    }
}

impl QueueConfig {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn entries(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    /// Default retry ceiling for jobs that were enqueued without their own.
    pub fn max_retries(&self) -> u32 {
        self.parsed(MAX_RETRIES_KEY).unwrap_or(DEFAULT_MAX_RETRIES)
    }

    pub fn backoff_base(&self) -> u32 {
        self.parsed(BACKOFF_BASE_KEY).unwrap_or(DEFAULT_BACKOFF_BASE)
    }

    /// Delay before a failed job becomes claimable again:
    /// `backoff-base ^ attempts` units.
    pub fn backoff_delay(&self, attempts: u32, unit: Duration) -> Duration {
        let factor = self.backoff_base().checked_pow(attempts).unwrap_or(u32::MAX);
        unit.saturating_mul(factor)
    }

    /// Check a value for one of the recognized keys before it is stored.
    /// Unrecognized keys are accepted as-is.
    pub fn validate_entry(key: &str, value: &str) -> Result<()> {
        match key {
            MAX_RETRIES_KEY | BACKOFF_BASE_KEY => value
                .trim()
                .parse::<u32>()
                .map(|_| ())
                .map_err(|_| QueueError::InvalidConfig {
                    key: key.to_string(),
                    value: value.to_string(),
                }),
            _ => Ok(()),
        }
    }

    fn parsed(&self, key: &str) -> Option<u32> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }
}

/// What happens to a child command's stdout/stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Child writes straight to the worker's own stdout/stderr.
    #[default]
    Inherit,
    /// Output is collected into the execution result.
    Capture,
}

/// Runtime tuning for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Wait between polls when no pending job exists
    pub idle_poll_interval: Duration,
    /// Wait before re-polling after losing a lock race
    pub contention_poll_interval: Duration,
    /// Hard limit on a single command's run time
    pub execution_timeout: Duration,
    /// How long `stop` waits for in-flight jobs to finish
    pub shutdown_grace: Duration,
    /// Length of one backoff step (`backoff-base ^ attempts` steps are slept)
    pub backoff_unit: Duration,
    pub output: OutputMode,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            idle_poll_interval: Duration::from_secs(1),
            contention_poll_interval: Duration::from_millis(100),
            execution_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(30),
            backoff_unit: Duration::from_secs(1),
            output: OutputMode::Inherit,
        }
    }
}

impl WorkerConfig {
    pub fn with_idle_poll_interval(mut self, interval: Duration) -> Self {
        self.idle_poll_interval = interval;
        self
    }

    pub fn with_contention_poll_interval(mut self, interval: Duration) -> Self {
        self.contention_poll_interval = interval;
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    pub fn with_output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }
}

/// On-disk layout of one queue.
#[derive(Debug, Clone)]
pub struct DataDir {
    pub root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.root.join("jobs.json")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.root.join("worker.pid")
    }
}

impl Default for DataDir {
    fn default() -> Self {
        Self::new("data")
    }
}
