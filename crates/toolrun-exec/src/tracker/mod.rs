//! Token-tracked OS process execution.
//!
//! The [`ProcessTracker`] launches external commands, captures their output
//! into temp files, and exposes an opaque token for later polling, waiting
//! and termination. A process is in exactly one of two places: the running
//! registry (live, watched by a background task) or the completed cache
//! (terminal result, capped and TTL-swept). Once a result is cached,
//! queries never re-observe the underlying OS process.

mod capture;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex as AsyncMutex, Notify, RwLock, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use capture::CaptureFiles;
use toolrun_core::config::ExecutorConfig;

/// Errors from tracker operations.
///
/// The only hard failure mode: referencing a token that was never issued or
/// whose result has been reclaimed. Everything else is reported inside
/// structured results.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("Process not found for token: {token}")]
    TokenNotFound { token: String },
}

/// Terminal (or in-flight) status of a tracked process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Running,
    Completed,
    /// Launch failed or the exit status could not be collected.
    Failed,
    /// Force-killed after exceeding its execution timeout.
    TimedOut,
    /// Terminated on caller request.
    Terminated,
}

/// Final result of one process execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub status: ProcessStatus,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub output: String,
    pub error: String,
    pub pid: Option<u32>,
    pub duration_secs: f64,
}

impl ExecutionResult {
    fn launch_failure(error: String, started: Instant) -> Self {
        Self {
            status: ProcessStatus::Failed,
            success: false,
            exit_code: None,
            output: String::new(),
            error,
            pid: None,
            duration_secs: started.elapsed().as_secs_f64(),
        }
    }
}

/// Response from [`ProcessTracker::execute_async`].
#[derive(Debug, Clone, Serialize)]
pub struct AsyncLaunch {
    pub token: String,
    pub status: ProcessStatus,
    pub pid: Option<u32>,
}

/// Answer to a token query.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProcessReport {
    /// The process is still alive (possibly already signalled).
    Running {
        token: String,
        pid: Option<u32>,
        command: String,
        runtime_secs: f64,
        terminating: bool,
    },
    /// The caller asked to wait and the deadline passed first; the process
    /// keeps running and can be queried again.
    WaitTimedOut {
        token: String,
        pid: Option<u32>,
        waited_secs: f64,
    },
    /// Terminal result, served from the completed cache.
    Finished(ExecutionResult),
}

/// Snapshot entry from [`ProcessTracker::list_running`].
#[derive(Debug, Clone, Serialize)]
pub struct RunningProcess {
    pub token: String,
    pub pid: Option<u32>,
    pub command: String,
    pub runtime_secs: f64,
    pub terminating: bool,
}

/// Partial output read mid-execution.
#[derive(Debug, Clone, Serialize)]
pub struct PartialOutput {
    pub output: String,
    pub error: String,
}

/// Statistics from a manual completed-cache cleanup.
#[derive(Debug, Clone, Serialize)]
pub struct CompletedCleanup {
    pub initial_count: usize,
    pub cleaned_count: usize,
    pub remaining_count: usize,
    pub force_all: bool,
}

struct RunningEntry {
    pid: Option<u32>,
    command: String,
    started: Instant,
    capture: Arc<CaptureFiles>,
    /// Set when a caller has requested termination.
    terminating: bool,
    /// Pokes the watcher task into the shutdown path.
    term: Arc<Notify>,
    /// Flips to `true` after the result is cached.
    done_rx: watch::Receiver<bool>,
}

/// Completed results, capped and TTL-bounded. Access refreshes an entry's
/// timestamp so actively-polled results outlive the TTL.
struct CompletedCache {
    entries: HashMap<String, (ExecutionResult, Instant)>,
    max_entries: usize,
    ttl: Duration,
}

impl CompletedCache {
    fn get_refreshed(&mut self, token: &str) -> Option<ExecutionResult> {
        let (result, stamp) = self.entries.get_mut(token)?;
        *stamp = Instant::now();
        Some(result.clone())
    }

    fn insert(&mut self, token: String, result: ExecutionResult) {
        // Evict oldest entries first when at capacity.
        while self.entries.len() >= self.max_entries {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, (_, stamp))| *stamp)
                .map(|(token, _)| token.clone());
            match oldest {
                Some(token) => {
                    debug!(token = %short(&token), "Evicted oldest completed result");
                    self.entries.remove(&token);
                }
                None => break,
            }
        }
        self.entries.insert(token, (result, Instant::now()));
    }

    fn sweep_expired(&mut self) -> usize {
        if self.ttl.is_zero() {
            return 0;
        }
        let before = self.entries.len();
        self.entries.retain(|_, (_, stamp)| stamp.elapsed() <= self.ttl);
        before - self.entries.len()
    }
}

struct TrackerShared {
    running: RwLock<HashMap<String, RunningEntry>>,
    completed: Mutex<CompletedCache>,
    /// Serializes capture-file reads against their deletion; separate from
    /// the registry lock to keep lock ordering trivial for the watcher.
    cleanup_lock: AsyncMutex<()>,
    temp_dir: PathBuf,
    terminate_grace: Duration,
    cleanup_interval: Duration,
}

/// Tracks launched OS processes by opaque token.
#[derive(Clone)]
pub struct ProcessTracker {
    shared: Arc<TrackerShared>,
    sweeper: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl ProcessTracker {
    /// Create a tracker from executor configuration, ensuring the capture
    /// directory exists.
    pub fn new(config: &ExecutorConfig) -> toolrun_core::Result<Self> {
        let temp_dir = config
            .temp_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        std::fs::create_dir_all(&temp_dir)?;

        info!(
            temp_dir = %temp_dir.display(),
            max_completed = config.max_completed,
            completed_ttl_secs = config.completed_ttl_secs,
            "Initialized process tracker"
        );

        Ok(Self {
            shared: Arc::new(TrackerShared {
                running: RwLock::new(HashMap::new()),
                completed: Mutex::new(CompletedCache {
                    entries: HashMap::new(),
                    max_entries: config.max_completed.max(1),
                    ttl: Duration::from_secs(config.completed_ttl_secs),
                }),
                cleanup_lock: AsyncMutex::new(()),
                temp_dir,
                terminate_grace: Duration::from_secs(config.terminate_grace_secs),
                cleanup_interval: Duration::from_secs(config.cleanup_interval_secs.max(1)),
            }),
            sweeper: Arc::new(Mutex::new(None)),
        })
    }

    /// Start the periodic completed-cache sweep task.
    pub fn start_cleanup_task(&self) {
        let mut slot = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(shared.cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let swept = shared
                    .completed
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .sweep_expired();
                if swept > 0 {
                    info!(swept, "Swept expired completed results");
                }
            }
        }));
        debug!("Started completed-cache sweep task");
    }

    /// Stop the periodic sweep task.
    pub fn stop_cleanup_task(&self) {
        let mut slot = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = slot.take() {
            task.abort();
            debug!("Stopped completed-cache sweep task");
        }
    }

    /// Execute a command and wait for it inline.
    ///
    /// Blocks the caller until completion or `timeout`; on expiry the
    /// process is killed and a `TimedOut` result returned. Never errors:
    /// launch failures come back as structured failed results.
    pub async fn execute(&self, command: &str, timeout: Option<Duration>) -> ExecutionResult {
        let started = Instant::now();
        let (capture, stdout, stderr) = match CaptureFiles::create(&self.shared.temp_dir) {
            Ok(files) => files,
            Err(e) => {
                error!(command, error = %e, "Failed to create capture files");
                return ExecutionResult::launch_failure(
                    format!("Error executing command: {e}"),
                    started,
                );
            }
        };

        info!(command, timeout_secs = ?timeout.map(|t| t.as_secs_f64()), "Executing command");
        let mut child = match spawn_shell(command, stdout, stderr) {
            Ok(child) => child,
            Err(e) => {
                capture.remove();
                error!(command, error = %e, "Failed to spawn process");
                return ExecutionResult::launch_failure(
                    format!("Error executing command: {e}"),
                    started,
                );
            }
        };
        let pid = child.id();

        let (status, exit) = match wait_with_timeout(&mut child, timeout).await {
            WaitOutcome::Exited(exit) => (exit_status_of(exit.as_ref()), exit),
            WaitOutcome::TimedOut => {
                warn!(command, pid, "Command timed out, killing");
                let exit = shutdown_child(&mut child, self.shared.terminate_grace).await;
                (ProcessStatus::TimedOut, exit)
            }
        };

        let output = capture.read_stdout();
        let mut error = capture.read_stderr();
        capture.remove();

        if status == ProcessStatus::TimedOut {
            let limit = timeout.map_or(0.0, |t| t.as_secs_f64());
            error = format!("Command timed out after {limit} seconds\n{error}");
        }

        ExecutionResult {
            status,
            success: status == ProcessStatus::Completed
                && exit.as_ref().is_some_and(std::process::ExitStatus::success),
            exit_code: exit.and_then(|e| e.code()),
            output,
            error,
            pid,
            duration_secs: started.elapsed().as_secs_f64(),
        }
    }

    /// Launch a command in the background and return a token for polling.
    ///
    /// A watcher task collects the result when the process exits, or
    /// force-kills it once `timeout` elapses. Launch failures register an
    /// already-terminal failed result under the returned token.
    pub async fn execute_async(&self, command: &str, timeout: Option<Duration>) -> AsyncLaunch {
        let token = Uuid::new_v4().to_string();
        let started = Instant::now();

        let (capture, stdout, stderr) = match CaptureFiles::create(&self.shared.temp_dir) {
            Ok(files) => files,
            Err(e) => {
                error!(command, error = %e, "Failed to create capture files");
                return self.register_failed_launch(token, e.to_string(), started);
            }
        };

        let child = match spawn_shell(command, stdout, stderr) {
            Ok(child) => child,
            Err(e) => {
                capture.remove();
                error!(command, error = %e, "Failed to spawn process");
                return self.register_failed_launch(token, e.to_string(), started);
            }
        };
        let pid = child.id();

        let capture = Arc::new(capture);
        let term = Arc::new(Notify::new());
        let (done_tx, done_rx) = watch::channel(false);

        self.shared.running.write().await.insert(
            token.clone(),
            RunningEntry {
                pid,
                command: command.to_string(),
                started,
                capture: Arc::clone(&capture),
                terminating: false,
                term: Arc::clone(&term),
                done_rx,
            },
        );

        info!(command, token = %short(&token), pid, "Started async command");

        let shared = Arc::clone(&self.shared);
        let watch_token = token.clone();
        tokio::spawn(async move {
            watch_process(shared, watch_token, child, term, timeout, done_tx).await;
        });

        AsyncLaunch {
            token,
            status: ProcessStatus::Running,
            pid,
        }
    }

    fn register_failed_launch(
        &self,
        token: String,
        error: String,
        started: Instant,
    ) -> AsyncLaunch {
        let result = ExecutionResult::launch_failure(
            format!("Error starting command: {error}"),
            started,
        );
        self.shared
            .completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token.clone(), result);
        AsyncLaunch {
            token,
            status: ProcessStatus::Failed,
            pid: None,
        }
    }

    /// Query a process by token, optionally waiting for completion.
    ///
    /// With `wait = false` the current status is returned without blocking.
    /// With `wait = true` the call blocks until the watcher caches a result
    /// or `timeout` elapses, in which case a `WaitTimedOut` report is
    /// returned and the process keeps running.
    pub async fn query_process(
        &self,
        token: &str,
        wait: bool,
        timeout: Option<Duration>,
    ) -> Result<ProcessReport, TrackerError> {
        let wait_started = Instant::now();
        loop {
            if let Some(result) = self
                .shared
                .completed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get_refreshed(token)
            {
                return Ok(ProcessReport::Finished(result));
            }

            let (mut done_rx, pid) = {
                let running = self.shared.running.read().await;
                let Some(entry) = running.get(token) else {
                    return Err(TrackerError::TokenNotFound {
                        token: token.to_string(),
                    });
                };
                if !wait {
                    return Ok(ProcessReport::Running {
                        token: token.to_string(),
                        pid: entry.pid,
                        command: entry.command.clone(),
                        runtime_secs: entry.started.elapsed().as_secs_f64(),
                        terminating: entry.terminating,
                    });
                }
                (entry.done_rx.clone(), entry.pid)
            };

            let done = done_rx.wait_for(|done| *done);
            let finished = match timeout {
                Some(limit) => {
                    let remaining = limit.saturating_sub(wait_started.elapsed());
                    if remaining.is_zero() {
                        Some(false)
                    } else {
                        match tokio::time::timeout(remaining, done).await {
                            Ok(Ok(_)) => Some(true),
                            Ok(Err(_)) => None,
                            Err(_) => Some(false),
                        }
                    }
                }
                None => match done.await {
                    Ok(_) => Some(true),
                    Err(_) => None,
                },
            };

            match finished {
                // Loop back to serve the freshly cached result.
                Some(true) => {}
                Some(false) => {
                    return Ok(ProcessReport::WaitTimedOut {
                        token: token.to_string(),
                        pid,
                        waited_secs: wait_started.elapsed().as_secs_f64(),
                    });
                }
                // The watcher ended without depositing a result.
                None => {
                    warn!(token, "Process watcher ended without a result");
                    return Err(TrackerError::TokenNotFound {
                        token: token.to_string(),
                    });
                }
            }
        }
    }

    /// Read the output captured so far for a still-running process, or the
    /// final output of a completed one.
    pub async fn partial_output(&self, token: &str) -> Result<PartialOutput, TrackerError> {
        if let Some(result) = self
            .shared
            .completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_refreshed(token)
        {
            return Ok(PartialOutput {
                output: result.output,
                error: result.error,
            });
        }

        let capture = {
            let running = self.shared.running.read().await;
            let entry = running
                .get(token)
                .ok_or_else(|| TrackerError::TokenNotFound {
                    token: token.to_string(),
                })?;
            Arc::clone(&entry.capture)
        };

        // Hold the cleanup lock so the watcher cannot delete the files
        // between the existence check and the read.
        let _guard = self.shared.cleanup_lock.lock().await;
        Ok(PartialOutput {
            output: capture.read_stdout(),
            error: capture.read_stderr(),
        })
    }

    /// Request termination of a running process.
    ///
    /// The watcher escalates SIGTERM to a forced kill after the grace
    /// period and records a terminal `Terminated` result. Returns `true`
    /// for running or already-finished tokens, `false` for unknown ones.
    pub async fn terminate_by_token(&self, token: &str) -> bool {
        if self
            .shared
            .completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_refreshed(token)
            .is_some()
        {
            info!(token = %short(token), "Process already completed, no need to terminate");
            return true;
        }

        let mut running = self.shared.running.write().await;
        let Some(entry) = running.get_mut(token) else {
            warn!(token = %short(token), "Cannot terminate: token not found");
            return false;
        };
        entry.terminating = true;
        info!(token = %short(token), pid = entry.pid, "Requested process termination");
        entry.term.notify_one();
        true
    }

    /// Snapshot of all live processes.
    pub async fn list_running(&self) -> Vec<RunningProcess> {
        let running = self.shared.running.read().await;
        running
            .iter()
            .map(|(token, entry)| RunningProcess {
                token: short(token).to_string(),
                pid: entry.pid,
                command: entry.command.clone(),
                runtime_secs: entry.started.elapsed().as_secs_f64(),
                terminating: entry.terminating,
            })
            .collect()
    }

    /// Manually clean the completed cache.
    ///
    /// With `force_all` every cached result is dropped regardless of TTL.
    pub fn cleanup_completed(&self, force_all: bool) -> CompletedCleanup {
        let mut cache = self
            .shared
            .completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let initial_count = cache.entries.len();
        let cleaned_count = if force_all {
            cache.entries.clear();
            initial_count
        } else {
            cache.sweep_expired()
        };
        info!(initial_count, cleaned_count, force_all, "Cleaned completed cache");
        CompletedCleanup {
            initial_count,
            cleaned_count,
            remaining_count: cache.entries.len(),
            force_all,
        }
    }
}

enum WaitOutcome {
    Exited(Option<std::process::ExitStatus>),
    TimedOut,
}

async fn wait_with_timeout(child: &mut Child, timeout: Option<Duration>) -> WaitOutcome {
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => WaitOutcome::Exited(status.ok()),
            Err(_) => WaitOutcome::TimedOut,
        },
        None => WaitOutcome::Exited(child.wait().await.ok()),
    }
}

const fn exit_status_of(exit: Option<&std::process::ExitStatus>) -> ProcessStatus {
    match exit {
        Some(_) => ProcessStatus::Completed,
        None => ProcessStatus::Failed,
    }
}

fn spawn_shell(
    command: &str,
    stdout: std::fs::File,
    stderr: std::fs::File,
) -> std::io::Result<Child> {
    #[cfg(unix)]
    let mut cmd = {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    };
    #[cfg(windows)]
    let mut cmd = {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    };

    cmd.stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .kill_on_drop(true)
        .spawn()
}

/// Signal-based graceful shutdown: SIGTERM, wait out the grace period,
/// then force-kill. External processes cannot cooperate, so termination
/// is forceful by design.
async fn shutdown_child(child: &mut Child, grace: Duration) -> Option<std::process::ExitStatus> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: pid is a valid process ID obtained from our own Child
            // handle. kill(2) with SIGTERM is safe to call on any owned
            // subprocess.
            #[allow(unsafe_code)]
            #[allow(clippy::cast_possible_wrap)]
            let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if ret != 0 {
                let err = std::io::Error::last_os_error();
                warn!(pid, error = %err, "Failed to send SIGTERM");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status.ok(),
        Err(_) => {
            warn!(pid = child.id(), "Grace period expired, force-killing");
            child.kill().await.ok();
            child.wait().await.ok()
        }
    }
}

/// Background watcher for one async process: waits for exit, a termination
/// request, or the execution deadline, then finalizes the result.
async fn watch_process(
    shared: Arc<TrackerShared>,
    token: String,
    mut child: Child,
    term: Arc<Notify>,
    timeout: Option<Duration>,
    done_tx: watch::Sender<bool>,
) {
    enum ExitKind {
        Natural,
        Terminated,
        TimedOut,
    }

    let deadline = async {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };

    let mut exit = None;
    let kind = tokio::select! {
        status = child.wait() => {
            exit = status.ok();
            ExitKind::Natural
        }
        () = term.notified() => ExitKind::Terminated,
        () = deadline => {
            warn!(token = %short(&token), timeout_secs = ?timeout.map(|t| t.as_secs_f64()), "Process timed out");
            ExitKind::TimedOut
        }
    };

    if !matches!(kind, ExitKind::Natural) {
        exit = shutdown_child(&mut child, shared.terminate_grace).await;
    }

    // Snapshot the entry; it is removed only after the result is cached so
    // the token is always resolvable through one of the two maps.
    let Some((capture, command, started, pid, terminating)) = ({
        let running = shared.running.read().await;
        running.get(&token).map(|entry| {
            (
                Arc::clone(&entry.capture),
                entry.command.clone(),
                entry.started,
                entry.pid,
                entry.terminating,
            )
        })
    }) else {
        warn!(token = %short(&token), "Watcher found no registry entry");
        return;
    };

    let (output, mut error) = {
        let _guard = shared.cleanup_lock.lock().await;
        let output = capture.read_stdout();
        let error = capture.read_stderr();
        capture.remove();
        (output, error)
    };

    let status = match kind {
        ExitKind::TimedOut => {
            let limit = timeout.map_or(0.0, |t| t.as_secs_f64());
            error = format!("Command timed out after {limit} seconds\n{error}");
            ProcessStatus::TimedOut
        }
        _ if terminating || matches!(kind, ExitKind::Terminated) => ProcessStatus::Terminated,
        ExitKind::Natural | ExitKind::Terminated => exit_status_of(exit.as_ref()),
    };

    let result = ExecutionResult {
        status,
        success: status == ProcessStatus::Completed
            && exit.as_ref().is_some_and(std::process::ExitStatus::success),
        exit_code: exit.and_then(|e| e.code()),
        output,
        error,
        pid,
        duration_secs: started.elapsed().as_secs_f64(),
    };

    info!(
        token = %short(&token),
        command,
        pid,
        status = ?result.status,
        exit_code = ?result.exit_code,
        duration_secs = result.duration_secs,
        "Collected process result"
    );

    shared
        .completed
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(token.clone(), result);
    shared.running.write().await.remove(&token);
    let _ = done_tx.send(true);
}

/// First eight characters of a token, for log lines.
fn short(token: &str) -> &str {
    token.get(..8).unwrap_or(token)
}
