//! Job trait and the value types flowing through the job subsystem.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Lifecycle state of a submitted job.
///
/// Transitions are monotonic: Queued→Running→{Completed|Failed|Cancelled},
/// with Cancelled reachable from both Queued and Running. Terminal states
/// never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Point-in-time progress snapshot reported by a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobProgress {
    pub current: u64,
    pub total: u64,
    pub message: String,
}

impl JobProgress {
    /// Completion percentage, clamped to 100; zero when total is unknown.
    #[must_use]
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let pct = (self.current as f64 / self.total as f64) * 100.0;
        pct.min(100.0)
    }
}

/// Final outcome of a job, immutable once stored.
#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl JobResult {
    #[must_use]
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            metadata: HashMap::new(),
        }
    }

    #[must_use]
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            metadata: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// Why a job's `execute` did not produce a successful result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("Job was cancelled")]
    Cancelled,
    #[error("Job timed out")]
    TimedOut,
    #[error("{kind}: {message}")]
    Failed { kind: String, message: String },
}

impl JobError {
    pub fn failed(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// A unit of async work executable by the [`JobManager`].
///
/// Implementations are shared (`Arc<dyn AsyncJob>`) between the manager and
/// the execution task, so any mutable progress state lives behind the
/// implementation's own synchronization.
///
/// [`JobManager`]: super::JobManager
#[async_trait]
pub trait AsyncJob: Send + Sync {
    /// Stable human-readable identifier, distinct from the submission token.
    fn id(&self) -> &str;

    /// Run the job to completion. Long-running implementations should poll
    /// `ctx` at natural checkpoints so cancellation takes effect promptly.
    async fn execute(&self, ctx: &JobContext) -> Result<JobResult, JobError>;

    /// Current progress, if the job tracks any.
    fn progress(&self) -> Option<JobProgress> {
        None
    }
}

/// Cooperative cancellation handle passed into [`AsyncJob::execute`].
#[derive(Debug, Clone)]
pub struct JobContext {
    cancel: CancellationToken,
}

impl JobContext {
    #[must_use]
    pub(crate) const fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Checkpoint: error out if cancellation has been requested.
    pub fn check_cancelled(&self) -> Result<(), JobError> {
        if self.cancel.is_cancelled() {
            Err(JobError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run `fut` racing cancellation and an optional timeout. The losing
    /// branch is dropped, so `fut` must be cancel-safe at its await points.
    pub async fn run_cancellable<F>(
        &self,
        fut: F,
        timeout: Option<Duration>,
    ) -> Result<F::Output, JobError>
    where
        F: Future + Send,
    {
        let deadline = async {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            out = fut => Ok(out),
            () = self.cancel.cancelled() => Err(JobError::Cancelled),
            () = deadline => Err(JobError::TimedOut),
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn progress_percentage_is_clamped() {
        let progress = JobProgress {
            current: 150,
            total: 100,
            message: "over".into(),
        };
        assert!((progress.percentage() - 100.0).abs() < f64::EPSILON);

        let unknown = JobProgress {
            current: 5,
            total: 0,
            message: "unknown".into(),
        };
        assert!((unknown.percentage() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn terminal_states_are_terminal() {
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
    }

    #[tokio::test]
    async fn check_cancelled_reflects_token_state() {
        let token = CancellationToken::new();
        let ctx = JobContext::new(token.clone());
        assert!(ctx.check_cancelled().is_ok());
        token.cancel();
        assert_eq!(ctx.check_cancelled(), Err(JobError::Cancelled));
    }

    #[tokio::test]
    async fn run_cancellable_returns_output_when_nothing_fires() {
        let ctx = JobContext::new(CancellationToken::new());
        let out = ctx.run_cancellable(async { 7 }, None).await;
        assert_eq!(out, Ok(7));
    }

    #[tokio::test]
    async fn run_cancellable_observes_cancellation() {
        let token = CancellationToken::new();
        let ctx = JobContext::new(token.clone());
        token.cancel();
        let out = ctx
            .run_cancellable(std::future::pending::<()>(), None)
            .await;
        assert_eq!(out, Err(JobError::Cancelled));
    }

    #[tokio::test]
    async fn run_cancellable_observes_timeout() {
        let ctx = JobContext::new(CancellationToken::new());
        let out = ctx
            .run_cancellable(
                std::future::pending::<()>(),
                Some(Duration::from_millis(20)),
            )
            .await;
        assert_eq!(out, Err(JobError::TimedOut));
    }
}
