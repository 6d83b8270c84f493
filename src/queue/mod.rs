pub mod job;
pub mod registry;

pub use job::{Job, JobSpec, JobState, StateFilter};
pub use registry::{JobQueue, QueueStatus};
