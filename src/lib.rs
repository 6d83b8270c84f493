pub mod config;
pub mod error;
pub mod lock;
pub mod queue;
pub mod shutdown;
pub mod store;
pub mod worker;

pub use error::{QueueError, Result};
