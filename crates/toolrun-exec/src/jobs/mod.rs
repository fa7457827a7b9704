//! Generalized async jobs with cooperative cancellation.
//!
//! Any long-running unit of work implements [`AsyncJob`] and goes through
//! the [`JobManager`]: a bounded gate admits it, an overall timeout and a
//! cancellation token race its execution, and its final [`JobResult`] lands
//! in a TTL-bounded [`JobStore`] keyed by the submission token.

mod job;
mod manager;
mod store;

pub use job::{AsyncJob, JobContext, JobError, JobProgress, JobResult, JobState};
pub use manager::{JobManager, JobStats, JobStatus, ResultError};
pub use store::{JobStore, StoreStats};
