//! toolrun Operation Lifecycle Core
//!
//! The concurrency-sensitive heart of a tool-execution backend:
//! - Per-tool concurrency admission with an optional bounded wait
//! - OS process launching with token-based tracking and output capture
//! - Generalized async jobs with cancellation, timeout, progress and a
//!   TTL-bounded result store
//!
//! Everything is single-process and in-memory; callers identify in-flight
//! work by opaque tokens and all failure reporting happens through
//! structured result values rather than panics.

pub mod jobs;
pub mod limiter;
pub mod tracker;

pub use jobs::{AsyncJob, JobContext, JobManager, JobResult, JobState};
pub use limiter::{Admission, ConcurrencyLimiter, OperationContext, StartOutcome};
pub use tracker::{ExecutionResult, ProcessStatus, ProcessTracker, TrackerError};
