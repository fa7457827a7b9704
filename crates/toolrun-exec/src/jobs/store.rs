//! TTL-bounded in-memory store for finished job results.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use super::job::JobResult;

/// Store occupancy snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub entry_count: usize,
    pub ttl_secs: u64,
}

/// Keeps each stored result retrievable until it goes unread for the TTL.
/// Every retrieval refreshes the entry's timestamp, so actively polled
/// results stay alive indefinitely.
pub struct JobStore {
    entries: Mutex<HashMap<String, (JobResult, Instant)>>,
    ttl: Duration,
    sweep_interval: Duration,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl JobStore {
    #[must_use]
    pub fn new(ttl: Duration, sweep_interval: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            sweep_interval: sweep_interval.max(Duration::from_millis(1)),
            sweeper: Mutex::new(None),
        }
    }

    pub fn store(&self, token: &str, result: JobResult) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(token.to_string(), (result, Instant::now()));
        debug!(token, "Stored job result");
    }

    /// Fetch a result, refreshing its last-access timestamp.
    pub fn retrieve(&self, token: &str) -> Option<JobResult> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let (result, stamp) = entries.get_mut(token)?;
        *stamp = Instant::now();
        Some(result.clone())
    }

    #[must_use]
    pub fn exists(&self, token: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(token)
    }

    /// Drop one result. Returns whether it was present.
    pub fn cleanup(&self, token: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token)
            .is_some()
    }

    /// Evict every entry unread for longer than the TTL.
    pub fn sweep_expired(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, (_, stamp)| stamp.elapsed() <= self.ttl);
        let swept = before - entries.len();
        if swept > 0 {
            info!(swept, "Swept expired job results");
        }
        swept
    }

    #[must_use]
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            entry_count: self
                .entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            ttl_secs: self.ttl.as_secs(),
        }
    }

    /// Start the periodic expiry sweep task.
    pub fn start_sweep(self: &Arc<Self>) {
        let mut slot = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let store = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(store.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                store.sweep_expired();
            }
        }));
        debug!("Started job result sweep task");
    }

    /// Stop the periodic sweep task.
    pub fn stop_sweep(&self) {
        let mut slot = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = slot.take() {
            task.abort();
            debug!("Stopped job result sweep task");
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn store_retrieve_cleanup_round_trip() {
        let store = JobStore::new(Duration::from_secs(60), Duration::from_secs(60));
        store.store("tok", JobResult::ok(serde_json::json!({"n": 1})));

        assert!(store.exists("tok"));
        let result = store.retrieve("tok").unwrap();
        assert!(result.success);
        assert_eq!(result.data, Some(serde_json::json!({"n": 1})));

        assert!(store.cleanup("tok"));
        assert!(!store.exists("tok"));
        assert!(!store.cleanup("tok"));
        assert!(store.retrieve("tok").is_none());
    }

    #[test]
    fn sweep_evicts_only_expired_entries() {
        let store = JobStore::new(Duration::from_millis(30), Duration::from_secs(60));
        store.store("old", JobResult::failure("boom"));
        std::thread::sleep(Duration::from_millis(50));
        store.store("fresh", JobResult::ok(serde_json::Value::Null));

        assert_eq!(store.sweep_expired(), 1);
        assert!(!store.exists("old"));
        assert!(store.exists("fresh"));
    }

    #[test]
    fn retrieval_refreshes_the_ttl() {
        let store = JobStore::new(Duration::from_millis(60), Duration::from_secs(60));
        store.store("tok", JobResult::ok(serde_json::Value::Null));

        // Keep touching the entry past its original expiry.
        for _ in 0..4 {
            std::thread::sleep(Duration::from_millis(30));
            assert!(store.retrieve("tok").is_some());
        }
        assert_eq!(store.sweep_expired(), 0);
        assert!(store.exists("tok"));
    }

    #[tokio::test]
    async fn background_sweep_expires_idle_results() {
        let store = Arc::new(JobStore::new(
            Duration::from_millis(20),
            Duration::from_millis(20),
        ));
        store.store("tok", JobResult::ok(serde_json::Value::Null));

        store.start_sweep();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!store.exists("tok"));
        store.stop_sweep();
    }

    #[test]
    fn stats_report_occupancy() {
        let store = JobStore::new(Duration::from_secs(90), Duration::from_secs(60));
        store.store("a", JobResult::ok(serde_json::Value::Null));
        store.store("b", JobResult::failure("x"));

        let stats = store.stats();
        assert_eq!(stats.entry_count, 2);
        assert_eq!(stats.ttl_secs, 90);
    }
}
