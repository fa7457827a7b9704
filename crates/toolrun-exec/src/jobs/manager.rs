//! Job submission, lifecycle tracking and result retrieval.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::job::{AsyncJob, JobContext, JobError, JobProgress, JobResult, JobState};
use super::store::JobStore;
use toolrun_core::config::JobConfig;

/// Why a result could not be fetched for a token.
#[derive(Debug, thiserror::Error)]
pub enum ResultError {
    #[error("Job not found for token: {token}")]
    NotFound { token: String },
    #[error("Job is still running: {token}")]
    StillRunning { token: String },
    #[error("Job finished but its result is no longer retained: {token}")]
    Unavailable { token: String },
}

/// Status snapshot of one submitted job.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub token: String,
    pub job_id: String,
    pub state: JobState,
    pub progress: Option<JobProgress>,
    pub age_secs: f64,
}

/// Aggregate counters over all tracked jobs.
#[derive(Debug, Clone, Serialize)]
pub struct JobStats {
    pub total: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub available_slots: usize,
}

struct JobEntry {
    job: Arc<dyn AsyncJob>,
    state: JobState,
    cancel: CancellationToken,
    submitted: Instant,
    handle: Option<tokio::task::JoinHandle<()>>,
}

struct ManagerShared {
    jobs: RwLock<HashMap<String, JobEntry>>,
    store: Arc<JobStore>,
    semaphore: Arc<Semaphore>,
    job_timeout: Duration,
}

/// Runs submitted [`AsyncJob`]s behind a concurrency gate.
///
/// Lifecycle state is owned here, not by the job objects: each submission
/// gets a manager-side entry whose state only moves forward, plus a
/// cancellation token the execution task races against. Every execution
/// path, including cancellation while still queued, deposits a result into
/// the [`JobStore`] before the state turns terminal.
#[derive(Clone)]
pub struct JobManager {
    shared: Arc<ManagerShared>,
}

impl JobManager {
    #[must_use]
    pub fn new(config: &JobConfig) -> Self {
        info!(
            max_concurrent_jobs = config.max_concurrent_jobs,
            job_timeout_secs = config.job_timeout_secs,
            result_ttl_secs = config.result_ttl_secs,
            "Initialized job manager"
        );
        Self {
            shared: Arc::new(ManagerShared {
                jobs: RwLock::new(HashMap::new()),
                store: Arc::new(JobStore::new(
                    Duration::from_secs(config.result_ttl_secs),
                    Duration::from_secs(config.sweep_interval_secs.max(1)),
                )),
                semaphore: Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1))),
                job_timeout: Duration::from_secs(config.job_timeout_secs),
            }),
        }
    }

    /// The result store, for embedders that sweep or inspect it directly.
    #[must_use]
    pub fn store(&self) -> &Arc<JobStore> {
        &self.shared.store
    }

    /// Start background maintenance (result store sweep).
    pub fn start(&self) {
        self.shared.store.start_sweep();
    }

    /// Submit a job for execution and return its tracking token.
    pub async fn submit(&self, job: Arc<dyn AsyncJob>) -> String {
        let token = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();

        self.shared.jobs.write().await.insert(
            token.clone(),
            JobEntry {
                job: Arc::clone(&job),
                state: JobState::Queued,
                cancel: cancel.clone(),
                submitted: Instant::now(),
                handle: None,
            },
        );
        info!(token = %token, job_id = job.id(), "Submitted job");

        let shared = Arc::clone(&self.shared);
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            run_job(shared, task_token, job, cancel).await;
        });
        if let Some(entry) = self.shared.jobs.write().await.get_mut(&token) {
            entry.handle = Some(handle);
        }

        token
    }

    /// Current state and progress for a token, if known.
    pub async fn get_status(&self, token: &str) -> Option<JobStatus> {
        let jobs = self.shared.jobs.read().await;
        let entry = jobs.get(token)?;
        Some(JobStatus {
            token: token.to_string(),
            job_id: entry.job.id().to_string(),
            state: entry.state,
            progress: entry.job.progress(),
            age_secs: entry.submitted.elapsed().as_secs_f64(),
        })
    }

    /// Fetch a finished job's result.
    ///
    /// Distinguishes a job that has not finished yet (retry later) from one
    /// whose stored result has already been reclaimed (gone for good).
    pub async fn get_result(&self, token: &str) -> Result<JobResult, ResultError> {
        if let Some(result) = self.shared.store.retrieve(token) {
            return Ok(result);
        }
        let jobs = self.shared.jobs.read().await;
        match jobs.get(token) {
            Some(entry) if entry.state.is_terminal() => Err(ResultError::Unavailable {
                token: token.to_string(),
            }),
            Some(_) => Err(ResultError::StillRunning {
                token: token.to_string(),
            }),
            None => Err(ResultError::NotFound {
                token: token.to_string(),
            }),
        }
    }

    /// Request cancellation of a job. Advisory: the job observes it at its
    /// next checkpoint, and the manager's own races bound how long that
    /// takes. Returns `false` only for unknown tokens.
    pub async fn cancel_job(&self, token: &str) -> bool {
        let jobs = self.shared.jobs.read().await;
        match jobs.get(token) {
            Some(entry) => {
                if entry.state.is_terminal() {
                    debug!(token, state = ?entry.state, "Cancel requested for finished job");
                } else {
                    info!(token, "Requested job cancellation");
                    entry.cancel.cancel();
                }
                true
            }
            None => {
                warn!(token, "Cannot cancel: token not found");
                false
            }
        }
    }

    /// Drop a job's tracking entry and its stored result.
    ///
    /// Terminal jobs are simply forgotten; a still-live job is cancelled
    /// and its task aborted first. Without this, finished entries would
    /// accumulate for the life of the process even after the store's TTL
    /// reclaimed their results. Returns `false` for unknown tokens.
    pub async fn cleanup_job(&self, token: &str) -> bool {
        let entry = self.shared.jobs.write().await.remove(token);
        let had_result = self.shared.store.cleanup(token);
        let Some(entry) = entry else {
            return had_result;
        };
        if !entry.state.is_terminal() {
            warn!(token, state = ?entry.state, "Cleaning up a job that has not finished");
            entry.cancel.cancel();
        }
        if let Some(handle) = entry.handle {
            handle.abort();
        }
        info!(token, "Cleaned up job");
        true
    }

    /// Snapshot of every tracked job.
    pub async fn list_jobs(&self) -> Vec<JobStatus> {
        let jobs = self.shared.jobs.read().await;
        jobs.iter()
            .map(|(token, entry)| JobStatus {
                token: token.clone(),
                job_id: entry.job.id().to_string(),
                state: entry.state,
                progress: entry.job.progress(),
                age_secs: entry.submitted.elapsed().as_secs_f64(),
            })
            .collect()
    }

    /// Aggregate counters by state.
    pub async fn stats(&self) -> JobStats {
        let jobs = self.shared.jobs.read().await;
        let mut stats = JobStats {
            total: jobs.len(),
            queued: 0,
            running: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
            available_slots: self.shared.semaphore.available_permits(),
        };
        for entry in jobs.values() {
            match entry.state {
                JobState::Queued => stats.queued += 1,
                JobState::Running => stats.running += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.failed += 1,
                JobState::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Cancel all jobs, await their tasks and stop background maintenance.
    pub async fn shutdown(&self) {
        info!("Shutting down job manager");
        let handles: Vec<_> = {
            let mut jobs = self.shared.jobs.write().await;
            jobs.values_mut()
                .filter_map(|entry| {
                    entry.cancel.cancel();
                    entry.handle.take()
                })
                .collect()
        };
        for handle in handles {
            if let Err(e) = handle.await
                && !e.is_cancelled()
            {
                warn!(error = %e, "Job task ended abnormally during shutdown");
            }
        }
        self.shared.store.stop_sweep();
        info!("Job manager shut down");
    }
}

fn cancelled_result() -> JobResult {
    JobResult::failure("Job was cancelled")
        .with_metadata("exception_type", serde_json::json!("Cancelled"))
}

async fn set_state(shared: &ManagerShared, token: &str, next: JobState) {
    if let Some(entry) = shared.jobs.write().await.get_mut(token)
        && !entry.state.is_terminal()
    {
        entry.state = next;
    }
}

/// Deposit the result first, then flip the state, so a terminal state
/// always implies the result was stored.
async fn finalize(shared: &ManagerShared, token: &str, state: JobState, result: JobResult) {
    shared.store.store(token, result);
    set_state(shared, token, state).await;
}

async fn run_job(
    shared: Arc<ManagerShared>,
    token: String,
    job: Arc<dyn AsyncJob>,
    cancel: CancellationToken,
) {
    // Queued jobs race the admission gate against their cancellation token.
    let permit = tokio::select! {
        permit = Arc::clone(&shared.semaphore).acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => {
                finalize(
                    &shared,
                    &token,
                    JobState::Failed,
                    JobResult::failure("Job gate is closed")
                        .with_metadata("exception_type", serde_json::json!("GateClosed")),
                )
                .await;
                return;
            }
        },
        () = cancel.cancelled() => {
            info!(token = %token, job_id = job.id(), "Job cancelled while queued");
            finalize(&shared, &token, JobState::Cancelled, cancelled_result()).await;
            return;
        }
    };

    set_state(&shared, &token, JobState::Running).await;
    info!(token = %token, job_id = job.id(), "Job started");
    let started = Instant::now();
    let ctx = JobContext::new(cancel.clone());

    // Cancellation wins even against a job that ignores its context.
    let outcome = tokio::select! {
        out = tokio::time::timeout(shared.job_timeout, job.execute(&ctx)) => match out {
            Ok(res) => res,
            Err(_) => Err(JobError::TimedOut),
        },
        () = cancel.cancelled() => Err(JobError::Cancelled),
    };

    let (state, result) = match outcome {
        Ok(result) => (JobState::Completed, result),
        Err(JobError::Cancelled) => (JobState::Cancelled, cancelled_result()),
        Err(JobError::TimedOut) => (
            JobState::Failed,
            JobResult::failure(format!(
                "Job timed out after {} seconds",
                shared.job_timeout.as_secs_f64()
            ))
            .with_metadata("exception_type", serde_json::json!("TimedOut")),
        ),
        Err(JobError::Failed { kind, message }) => (
            JobState::Failed,
            JobResult::failure(message)
                .with_metadata("exception_type", serde_json::json!(kind)),
        ),
    };

    info!(
        token = %token,
        job_id = job.id(),
        state = ?state,
        success = result.success,
        duration_secs = started.elapsed().as_secs_f64(),
        "Job finished"
    );
    finalize(&shared, &token, state, result).await;
    drop(permit);
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct SleepJob {
        id: String,
        sleep: Duration,
        outcome: Result<JobResult, JobError>,
    }

    impl SleepJob {
        fn ok(id: &str, sleep: Duration) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                sleep,
                outcome: Ok(JobResult::ok(serde_json::json!({"job": id}))),
            })
        }

        fn failing(id: &str, kind: &str, message: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                sleep: Duration::ZERO,
                outcome: Err(JobError::failed(kind, message)),
            })
        }
    }

    #[async_trait]
    impl AsyncJob for SleepJob {
        fn id(&self) -> &str {
            &self.id
        }

        async fn execute(&self, ctx: &JobContext) -> Result<JobResult, JobError> {
            if !self.sleep.is_zero() {
                ctx.run_cancellable(tokio::time::sleep(self.sleep), None)
                    .await?;
            }
            self.outcome.clone()
        }
    }

    fn config() -> JobConfig {
        JobConfig {
            max_concurrent_jobs: 2,
            job_timeout_secs: 30,
            result_ttl_secs: 3600,
            sweep_interval_secs: 300,
        }
    }

    async fn wait_terminal(manager: &JobManager, token: &str) -> JobState {
        for _ in 0..400 {
            if let Some(status) = manager.get_status(token).await
                && status.state.is_terminal()
            {
                return status.state;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("job never reached a terminal state");
    }

    #[tokio::test]
    async fn successful_job_completes_and_stores_result() {
        let manager = JobManager::new(&config());
        let token = manager.submit(SleepJob::ok("quick", Duration::ZERO)).await;

        assert_eq!(wait_terminal(&manager, &token).await, JobState::Completed);
        let result = manager.get_result(&token).await.unwrap();
        assert!(result.success);
        assert_eq!(result.data, Some(serde_json::json!({"job": "quick"})));
    }

    #[tokio::test]
    async fn failing_job_records_error_and_exception_type() {
        let manager = JobManager::new(&config());
        let token = manager
            .submit(SleepJob::failing("bad", "ValueError", "bad input"))
            .await;

        assert_eq!(wait_terminal(&manager, &token).await, JobState::Failed);
        let result = manager.get_result(&token).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("bad input"));
        assert_eq!(
            result.metadata.get("exception_type"),
            Some(&serde_json::json!("ValueError"))
        );
    }

    #[tokio::test]
    async fn running_job_is_cancellable() {
        let manager = JobManager::new(&config());
        let token = manager
            .submit(SleepJob::ok("slow", Duration::from_secs(30)))
            .await;

        // Let it reach Running before cancelling.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(manager.cancel_job(&token).await);

        assert_eq!(wait_terminal(&manager, &token).await, JobState::Cancelled);
        let result = manager.get_result(&token).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Job was cancelled"));
    }

    #[tokio::test]
    async fn queued_job_cancels_without_running() {
        let manager = JobManager::new(&JobConfig {
            max_concurrent_jobs: 1,
            ..config()
        });
        let blocker = manager
            .submit(SleepJob::ok("blocker", Duration::from_secs(30)))
            .await;
        let queued = manager
            .submit(SleepJob::ok("queued", Duration::from_secs(30)))
            .await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(manager.cancel_job(&queued).await);
        assert_eq!(wait_terminal(&manager, &queued).await, JobState::Cancelled);

        // The blocker is untouched by the queued job's cancellation.
        let status = manager.get_status(&blocker).await.unwrap();
        assert_eq!(status.state, JobState::Running);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn overall_timeout_fails_the_job() {
        let manager = JobManager::new(&JobConfig {
            job_timeout_secs: 1,
            ..config()
        });
        let token = manager
            .submit(SleepJob::ok("sleepy", Duration::from_secs(30)))
            .await;

        assert_eq!(wait_terminal(&manager, &token).await, JobState::Failed);
        let result = manager.get_result(&token).await.unwrap();
        assert!(result.error.as_deref().is_some_and(|e| e.contains("timed out")));
        assert_eq!(
            result.metadata.get("exception_type"),
            Some(&serde_json::json!("TimedOut"))
        );
    }

    #[tokio::test]
    async fn get_result_distinguishes_running_unknown_and_reclaimed() {
        let manager = JobManager::new(&config());

        let err = manager.get_result("no-such-token").await.unwrap_err();
        assert!(matches!(err, ResultError::NotFound { .. }));

        let token = manager
            .submit(SleepJob::ok("busy", Duration::from_secs(30)))
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let err = manager.get_result(&token).await.unwrap_err();
        assert!(matches!(err, ResultError::StillRunning { .. }));

        assert!(manager.cancel_job(&token).await);
        wait_terminal(&manager, &token).await;
        assert!(manager.store().cleanup(&token));
        let err = manager.get_result(&token).await.unwrap_err();
        assert!(matches!(err, ResultError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn stats_and_listing_track_states() {
        let manager = JobManager::new(&config());
        let done = manager.submit(SleepJob::ok("done", Duration::ZERO)).await;
        let running = manager
            .submit(SleepJob::ok("running", Duration::from_secs(30)))
            .await;
        wait_terminal(&manager, &done).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stats = manager.stats().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.running, 1);

        let listed = manager.list_jobs().await;
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().any(|j| j.token == running));

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_cancels_everything_in_flight() {
        let manager = JobManager::new(&config());
        let token = manager
            .submit(SleepJob::ok("long", Duration::from_secs(30)))
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        manager.shutdown().await;

        let status = manager.get_status(&token).await.unwrap();
        assert_eq!(status.state, JobState::Cancelled);
        let result = manager.get_result(&token).await.unwrap();
        assert!(!result.success);
    }

    #[tokio::test]
    async fn cleanup_job_reclaims_entry_and_result() {
        let manager = JobManager::new(&config());
        let mut tokens = Vec::new();
        for i in 0..10 {
            let token = manager
                .submit(SleepJob::ok(&format!("batch-{i}"), Duration::ZERO))
                .await;
            tokens.push(token);
        }
        for token in &tokens {
            wait_terminal(&manager, token).await;
        }
        assert_eq!(manager.stats().await.total, 10);

        // Even after the store lets results go, the tracking entries stay
        // until cleaned up explicitly.
        for token in &tokens {
            assert!(manager.store().cleanup(token));
        }
        assert_eq!(manager.stats().await.total, 10);

        for token in &tokens {
            assert!(manager.cleanup_job(token).await);
        }
        assert_eq!(manager.stats().await.total, 0);
        assert!(manager.get_status(&tokens[0]).await.is_none());
        let err = manager.get_result(&tokens[0]).await.unwrap_err();
        assert!(matches!(err, ResultError::NotFound { .. }));

        // Second cleanup of the same token reports unknown.
        assert!(!manager.cleanup_job(&tokens[0]).await);
    }

    #[tokio::test]
    async fn cleanup_job_aborts_a_live_job() {
        let manager = JobManager::new(&config());
        let token = manager
            .submit(SleepJob::ok("live", Duration::from_secs(30)))
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(manager.cleanup_job(&token).await);
        assert!(manager.get_status(&token).await.is_none());
        assert_eq!(manager.stats().await.total, 0);
    }

    #[tokio::test]
    async fn cancel_after_completion_is_a_no_op() {
        let manager = JobManager::new(&config());
        let token = manager.submit(SleepJob::ok("done", Duration::ZERO)).await;
        assert_eq!(wait_terminal(&manager, &token).await, JobState::Completed);

        // Advisory cancel on a finished job succeeds without changing state.
        assert!(manager.cancel_job(&token).await);
        let status = manager.get_status(&token).await.unwrap();
        assert_eq!(status.state, JobState::Completed);
    }
}
