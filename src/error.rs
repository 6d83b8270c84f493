use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Invalid job spec: {0}")]
    InvalidSpec(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job already exists: {0}")]
    DuplicateJob(String),

    #[error("Worker pool is already running")]
    AlreadyRunning,

    #[error("Invalid value {value:?} for config key {key:?}")]
    InvalidConfig { key: String, value: String },

    #[error("Timed out waiting for exclusive access to the job store")]
    StoreBusy,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, QueueError>;
