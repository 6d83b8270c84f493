use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{QueueConfig, DEFAULT_MAX_RETRIES};
use crate::error::{QueueError, Result};

/// Longest accepted job id. Ids double as lock file names.
pub const MAX_JOB_ID_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
    /// Only ever seen on jobs held in the dead-letter queue.
    Dead,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead" => Ok(JobState::Dead),
            other => Err(QueueError::InvalidSpec(format!("unknown job state {other:?}"))),
        }
    }
}

/// Selects which main-set jobs `list_jobs` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StateFilter {
    #[default]
    All,
    Only(JobState),
}

impl StateFilter {
    pub fn matches(&self, state: JobState) -> bool {
        match self {
            StateFilter::All => true,
            StateFilter::Only(wanted) => *wanted == state,
        }
    }
}

impl FromStr for StateFilter {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        if s == "all" {
            Ok(StateFilter::All)
        } else {
            s.parse().map(StateFilter::Only)
        }
    }
}

impl From<JobState> for StateFilter {
    fn from(state: JobState) -> Self {
        StateFilter::Only(state)
    }
}

/// An enqueue request. Deserializable from the JSON the CLI accepts, e.g.
/// `{"id":"job1","command":"sleep 2","max_retries":5}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobSpec {
    pub id: Option<String>,
    pub command: Option<String>,
    pub max_retries: Option<u32>,
}

impl JobSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub command: String,
    pub state: JobState,
    pub attempts: u32,
    pub max_retries: u32,
    /// Set when `max_retries` came from the enqueue request. Otherwise the
    /// queue's `max-retries` setting applies at failure time.
    #[serde(default)]
    pub max_retries_pinned: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Job {
    /// Build a fresh pending job from an enqueue request.
    pub fn from_spec(spec: JobSpec) -> Result<Self> {
        let command = match spec.command {
            Some(command) if !command.trim().is_empty() => command,
            _ => return Err(QueueError::InvalidSpec("command is required".to_string())),
        };

        let id = match spec.id {
            Some(id) => {
                validate_job_id(&id)?;
                id
            }
            None => generate_job_id(),
        };

        let now = Utc::now();
        Ok(Self {
            id,
            command,
            state: JobState::Pending,
            attempts: 0,
            max_retries: spec.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            max_retries_pinned: spec.max_retries.is_some(),
            created_at: now,
            updated_at: now,
            error_message: None,
        })
    }

    /// Retry ceiling in force for this job given the current queue settings.
    pub fn effective_max_retries(&self, config: &QueueConfig) -> u32 {
        if self.max_retries_pinned {
            self.max_retries
        } else {
            config.max_retries()
        }
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// 128 random bits, hex encoded.
pub fn generate_job_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Ids name lock files, so only a filesystem-safe alphabet is accepted.
pub fn validate_job_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(QueueError::InvalidSpec("job id is empty".to_string()));
    }
    if id.len() > MAX_JOB_ID_LEN {
        return Err(QueueError::InvalidSpec(format!(
            "job id exceeds {MAX_JOB_ID_LEN} bytes"
        )));
    }
    if !id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err(QueueError::InvalidSpec(format!(
            "job id {id:?} may only contain letters, digits, '-' and '_'"
        )));
    }
    Ok(())
}
