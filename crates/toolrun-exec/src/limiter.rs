//! Per-tool concurrency admission control.
//!
//! The [`ConcurrencyLimiter`] sits in front of tool invocations: callers ask
//! for admission before starting work and release their slot with an explicit
//! finish call on every exit path. Tools without a registered config are
//! never limited. Tools whose config carries a wait timeout hold the caller
//! on a condvar until a slot frees instead of rejecting immediately.
//!
//! This component is synchronous on purpose: it must be callable from plain
//! OS threads as well as async tasks, so all state lives behind one
//! `std::sync::Mutex` and waiters park on a `Condvar` that is notified
//! whenever an operation finishes.

use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use toolrun_core::config::ConcurrencyConfig;

/// Context describing one admitted (or candidate) operation.
///
/// Immutable after creation; the limiter holds it for the duration the
/// operation is active.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub operation_id: String,
    pub operation_type: String,
    start_time: Instant,
}

impl OperationContext {
    /// Create a context with a generated unique operation id.
    pub fn new(operation_type: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), operation_type)
    }

    /// Create a context with a caller-supplied operation id.
    pub fn with_id(operation_id: impl Into<String>, operation_type: impl Into<String>) -> Self {
        Self {
            operation_id: operation_id.into(),
            operation_type: operation_type.into(),
            start_time: Instant::now(),
        }
    }

    /// Time elapsed since the context was created.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// Structured payload returned when admission is denied.
#[derive(Debug, Clone, Serialize)]
pub struct Denial {
    /// Machine-readable error code, always `concurrency_limit_exceeded`.
    pub error: &'static str,
    pub message: String,
    pub retry_after: &'static str,
    pub current_operations: usize,
    pub max_allowed: u32,
    pub tool_name: String,
    /// Present only when the caller was held by the wait protocol.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waited_seconds: Option<f64>,
}

impl Denial {
    fn new(tool_name: &str, current: usize, max_allowed: u32) -> Self {
        Self {
            error: "concurrency_limit_exceeded",
            message: format!(
                "Operation rejected: maximum concurrent operations ({max_allowed}) already running for tool '{tool_name}'"
            ),
            retry_after: "Please wait for the current operation to complete before retrying",
            current_operations: current,
            max_allowed,
            tool_name: tool_name.to_string(),
            waited_seconds: None,
        }
    }

    fn after_waiting(mut self, waited: Duration) -> Self {
        self.message = format!(
            "Operation rejected: waited {:.2}s for a slot on tool '{}' without one freeing",
            waited.as_secs_f64(),
            self.tool_name
        );
        self.waited_seconds = Some(waited.as_secs_f64());
        self
    }
}

/// Result of a pure admission check.
#[derive(Debug, Clone)]
pub enum Admission {
    Allowed,
    Denied(Denial),
}

impl Admission {
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Result of a check-and-reserve start call.
#[derive(Debug, Clone)]
pub enum StartOutcome {
    Started,
    Rejected(Denial),
}

impl StartOutcome {
    pub const fn is_started(&self) -> bool {
        matches!(self, Self::Started)
    }

    /// Denial payload, if the start was rejected.
    pub const fn denial(&self) -> Option<&Denial> {
        match self {
            Self::Started => None,
            Self::Rejected(denial) => Some(denial),
        }
    }
}

/// Result of releasing an operation slot.
#[derive(Debug, Clone)]
pub enum FinishOutcome {
    /// The operation was tracked and has been released.
    Finished { duration: Duration },
    /// No operation with the given id is tracked; signals caller misuse.
    NotFound,
}

impl FinishOutcome {
    pub const fn is_finished(&self) -> bool {
        matches!(self, Self::Finished { .. })
    }

    /// Machine-readable error code for the not-found case.
    pub const fn error(&self) -> Option<&'static str> {
        match self {
            Self::Finished { .. } => None,
            Self::NotFound => Some("operation_not_found"),
        }
    }
}

/// Snapshot of one active operation.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveOperation {
    pub operation_id: String,
    pub operation_type: String,
    /// Seconds since the operation was admitted.
    pub duration: f64,
}

/// Snapshot of a tool's active operations.
#[derive(Debug, Clone, Serialize, Default)]
pub struct ToolActivity {
    pub count: usize,
    pub operations: Vec<ActiveOperation>,
}

/// Report from a stale-operation sweep.
#[derive(Debug, Clone, Serialize)]
pub struct StaleCleanup {
    pub cleaned_count: usize,
    pub max_age_seconds: f64,
    pub stale_operations: Vec<String>,
}

struct TrackedOperation {
    context: OperationContext,
    /// Tool whose active set holds this operation; `None` for unlimited tools.
    tool: Option<String>,
}

#[derive(Default)]
struct LimiterState {
    configs: HashMap<String, ConcurrencyConfig>,
    /// tool name -> ids of operations currently holding a slot. Empty sets
    /// are pruned immediately on finish.
    active: HashMap<String, HashSet<String>>,
    /// Global context index, keyed by operation id.
    operations: HashMap<String, TrackedOperation>,
}

impl LimiterState {
    fn check(&self, tool_name: &str) -> Admission {
        let Some(config) = self.configs.get(tool_name) else {
            return Admission::Allowed;
        };
        let current = self.active.get(tool_name).map_or(0, HashSet::len);
        if (current as u32) < config.max_concurrent {
            Admission::Allowed
        } else {
            Admission::Denied(Denial::new(tool_name, current, config.max_concurrent))
        }
    }

    fn record(&mut self, tool_name: &str, context: OperationContext) {
        let limited = self.configs.contains_key(tool_name);
        let operation_id = context.operation_id.clone();
        if limited {
            self.active
                .entry(tool_name.to_string())
                .or_default()
                .insert(operation_id.clone());
        }
        self.operations.insert(
            operation_id,
            TrackedOperation {
                context,
                tool: limited.then(|| tool_name.to_string()),
            },
        );
    }

    fn release(&mut self, operation_id: &str) -> Option<TrackedOperation> {
        let tracked = self.operations.remove(operation_id)?;
        if let Some(tool) = tracked.tool.as_deref()
            && let Some(operations) = self.active.get_mut(tool)
        {
            operations.remove(operation_id);
            if operations.is_empty() {
                self.active.remove(tool);
            }
        }
        Some(tracked)
    }

    fn activity_for(&self, tool_name: &str) -> ToolActivity {
        let Some(operations) = self.active.get(tool_name) else {
            return ToolActivity::default();
        };
        let snapshot: Vec<ActiveOperation> = operations
            .iter()
            .filter_map(|id| self.operations.get(id))
            .map(|tracked| ActiveOperation {
                operation_id: tracked.context.operation_id.clone(),
                operation_type: tracked.context.operation_type.clone(),
                duration: tracked.context.elapsed().as_secs_f64(),
            })
            .collect();
        ToolActivity {
            count: snapshot.len(),
            operations: snapshot,
        }
    }
}

/// Per-tool concurrency admission controller.
///
/// All maps are owned by the limiter instance; embedders construct one per
/// process and share it by reference.
#[derive(Default)]
pub struct ConcurrencyLimiter {
    state: Mutex<LimiterState>,
    /// Notified whenever a slot may have freed (finish or stale cleanup).
    slot_freed: Condvar,
}

impl ConcurrencyLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register (or replace) the concurrency config for a tool.
    ///
    /// Last write wins; replacement is not atomic with respect to in-flight
    /// admission decisions.
    pub fn register_config(&self, tool_name: &str, config: ConcurrencyConfig) {
        let mut state = self.lock();
        debug!(
            tool_name,
            max_concurrent = config.max_concurrent,
            wait_timeout_secs = ?config.wait_timeout_secs,
            "Registered concurrency config"
        );
        state.configs.insert(tool_name.to_string(), config);
        // A raised limit can unblock waiters.
        self.slot_freed.notify_all();
    }

    /// Pure admission check with no side effects.
    pub fn can_start_operation(&self, tool_name: &str, context: &OperationContext) -> Admission {
        let state = self.lock();
        let admission = state.check(tool_name);
        debug!(
            tool_name,
            operation_id = %context.operation_id,
            allowed = admission.is_allowed(),
            "Admission check"
        );
        admission
    }

    /// Atomically re-check admission and reserve a slot for `context`.
    ///
    /// When denied and the tool's config carries a non-zero wait timeout, the
    /// caller is held on the slot-freed condvar, re-checking the condition on
    /// every wakeup, until admitted or the timeout elapses. A `max_concurrent`
    /// of zero denies without waiting since no finish can ever free a slot.
    pub fn start_operation(&self, tool_name: &str, context: OperationContext) -> StartOutcome {
        let mut state = self.lock();
        let wait_started = Instant::now();
        let mut deadline: Option<Instant> = None;

        loop {
            match state.check(tool_name) {
                Admission::Allowed => {
                    info!(
                        tool_name,
                        operation_id = %context.operation_id,
                        operation_type = %context.operation_type,
                        "Started tracking operation"
                    );
                    state.record(tool_name, context);
                    return StartOutcome::Started;
                }
                Admission::Denied(denial) => {
                    let wait_timeout = state
                        .configs
                        .get(tool_name)
                        .filter(|config| config.max_concurrent > 0)
                        .and_then(|config| config.wait_timeout_secs)
                        .filter(|secs| *secs > 0)
                        .map(Duration::from_secs);

                    let Some(wait_timeout) = wait_timeout else {
                        return StartOutcome::Rejected(denial);
                    };

                    let deadline = *deadline.get_or_insert_with(|| wait_started + wait_timeout);
                    let now = Instant::now();
                    if now >= deadline {
                        let waited = wait_started.elapsed();
                        warn!(
                            tool_name,
                            operation_id = %context.operation_id,
                            waited_seconds = waited.as_secs_f64(),
                            "Gave up waiting for a concurrency slot"
                        );
                        return StartOutcome::Rejected(denial.after_waiting(waited));
                    }

                    let (guard, _timeout) = self
                        .slot_freed
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    state = guard;
                    // Loop re-checks the condition; a spurious or raced
                    // wakeup must not admit past the limit.
                }
            }
        }
    }

    /// Release the slot held by `operation_id`.
    ///
    /// Must be called exactly once per successfully-started operation,
    /// regardless of how the operation ended.
    pub fn finish_operation(&self, operation_id: &str) -> FinishOutcome {
        let mut state = self.lock();
        let Some(tracked) = state.release(operation_id) else {
            warn!(operation_id, "Attempted to finish unknown operation");
            return FinishOutcome::NotFound;
        };
        drop(state);
        self.slot_freed.notify_all();

        let duration = tracked.context.elapsed();
        info!(
            operation_id,
            duration_seconds = duration.as_secs_f64(),
            "Finished tracking operation"
        );
        FinishOutcome::Finished { duration }
    }

    /// Snapshot of active operations; a tool name restricts the view to that
    /// tool, otherwise the full per-tool map is returned.
    pub fn get_active_operations(&self, tool_name: Option<&str>) -> HashMap<String, ToolActivity> {
        let state = self.lock();
        match tool_name {
            Some(tool) => {
                let mut map = HashMap::with_capacity(1);
                map.insert(tool.to_string(), state.activity_for(tool));
                map
            }
            None => state
                .active
                .keys()
                .map(|tool| (tool.clone(), state.activity_for(tool)))
                .collect(),
        }
    }

    /// Force-remove operations older than `max_age` and wake any waiters.
    ///
    /// Safety valve for callers that crashed without finishing; a removed
    /// operation's later `finish_operation` reports not-found.
    pub fn cleanup_stale_operations(&self, max_age: Duration) -> StaleCleanup {
        let mut state = self.lock();
        let stale: Vec<String> = state
            .operations
            .iter()
            .filter(|(_, tracked)| tracked.context.elapsed() > max_age)
            .map(|(id, _)| id.clone())
            .collect();

        for operation_id in &stale {
            state.release(operation_id);
        }
        let cleaned = stale.len();
        drop(state);
        if cleaned > 0 {
            self.slot_freed.notify_all();
        }

        info!(cleaned_count = cleaned, "Cleaned up stale operations");
        StaleCleanup {
            cleaned_count: cleaned,
            max_age_seconds: max_age.as_secs_f64(),
            stale_operations: stale,
        }
    }
}
