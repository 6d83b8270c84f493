//! Worker pool that drains the queue.
//!
//! - [`JobExecutor`]: runs one job's command under `sh -c` with a timeout
//! - [`WorkerPool`]: starts and stops the worker loops, reports active count
//! - [`WorkerPidFile`]: lets other processes find and stop a running pool
//!
//! # Worker loop
//!
//! 1. Read the pending jobs; sleep the idle interval if there are none
//! 2. Try to lock each in turn; if every one is locked, sleep the short
//!    interval and go again
//! 3. Mark it `processing` and run the command
//! 4. Success: `completed`. Failure: count the attempt, then either move the
//!    job to the dead-letter queue or mark it `failed`, back off for
//!    `backoff-base ^ attempts` units and return it to `pending`
//! 5. Release the lock, whatever happened above
//!
//! Shutdown is cooperative. Loops stop claiming once the pool's token is
//! cancelled; a command already running is allowed to finish.

pub mod executor;
pub mod pidfile;
pub mod pool;

pub use executor::{ExecutionResult, ExecutionStatus, JobExecutor};
pub use pidfile::{PoolRecord, WorkerPidFile};
pub use pool::WorkerPool;
