use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::config::{OutputMode, WorkerConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Succeeded,
    Failed,
    TimedOut,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Succeeded => write!(f, "succeeded"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Result of job execution
#[derive(Debug)]
pub struct ExecutionResult {
    pub job_id: String,
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    /// Captured stdout; always `None` when output is inherited
    pub output: Option<String>,
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Succeeded
    }

    fn failed(job_id: &str, error: String) -> Self {
        Self {
            job_id: job_id.to_string(),
            status: ExecutionStatus::Failed,
            exit_code: None,
            output: None,
            error: Some(error),
        }
    }
}

/// Runs job commands through `sh -c` with a hard time limit.
///
/// A command still running when the limit elapses is killed and reported as
/// [`ExecutionStatus::TimedOut`].
#[derive(Debug, Clone)]
pub struct JobExecutor {
    timeout: Duration,
    output: OutputMode,
}

impl JobExecutor {
    pub fn new(timeout: Duration, output: OutputMode) -> Self {
        Self { timeout, output }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(config.execution_timeout, config.output)
    }

    pub async fn execute(&self, job_id: &str, command: &str) -> ExecutionResult {
        tracing::info!(job_id, command, "Executing job");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        match self.output {
            OutputMode::Inherit => {
                cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            }
            OutputMode::Capture => {
                cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
            }
        }

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(job_id, error = %e, "Failed to spawn job command");
                return ExecutionResult::failed(job_id, e.to_string());
            }
        };

        // Dropping the child on timeout kills it.
        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => Self::process_output(job_id, result),
            Err(_) => {
                tracing::warn!(job_id, timeout = ?self.timeout, "Job timed out");
                ExecutionResult {
                    job_id: job_id.to_string(),
                    status: ExecutionStatus::TimedOut,
                    exit_code: None,
                    output: None,
                    error: Some(format!("Command timed out after {:?}", self.timeout)),
                }
            }
        }
    }

    fn process_output(
        job_id: &str,
        result: Result<std::process::Output, std::io::Error>,
    ) -> ExecutionResult {
        match result {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                let exit_code = output.status.code();

                let (status, error) = if output.status.success() {
                    (ExecutionStatus::Succeeded, None)
                } else {
                    let message = if !stderr.trim().is_empty() {
                        stderr.trim_end().to_string()
                    } else if let Some(code) = exit_code {
                        format!("Command exited with code {}", code)
                    } else {
                        "Command terminated by signal".to_string()
                    };
                    (ExecutionStatus::Failed, Some(message))
                };

                tracing::info!(
                    job_id,
                    status = %status,
                    exit_code = ?exit_code,
                    "Job command finished"
                );

                ExecutionResult {
                    job_id: job_id.to_string(),
                    status,
                    exit_code,
                    output: if stdout.is_empty() { None } else { Some(stdout) },
                    error,
                }
            }
            Err(e) => {
                tracing::error!(job_id, error = %e, "Job execution failed");
                ExecutionResult::failed(job_id, e.to_string())
            }
        }
    }
}
