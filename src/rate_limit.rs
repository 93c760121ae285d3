//! Sliding-window request admission.
//!
//! Shared across all workers; the only lock-free-ish coordination point in
//! the pipeline (a short parking_lot critical section per check). Keys are
//! free-form strings — `marketplace:wb:{endpoint}`, `tenant:{id}`, `global` —
//! so one limiter instance serves every layer. The store is in-process and
//! advisory: callers must tolerate it being wiped (fail-open).

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::debug;

/// Idle keys older than this are dropped by `cleanup()`.
const CLEANUP_HORIZON: Duration = Duration::from_secs(300);

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy)]
pub struct Decision {
    pub allowed: bool,
    pub remaining: u32,
    /// When the oldest in-window request expires, i.e. the earliest instant
    /// a denied caller could be admitted.
    pub reset_at: Instant,
}

pub struct RateLimiter {
    state: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Record-and-admit: drops timestamps older than `now - window`, admits
    /// iff the remaining count is under `limit`, and records the request
    /// timestamp on admission.
    pub fn check(&self, key: &str, limit: u32, window: Duration) -> Decision {
        let now = Instant::now();
        let mut state = self.state.lock();
        let entries = state.entry(key.to_string()).or_default();

        while let Some(&front) = entries.front() {
            if now.duration_since(front) >= window {
                entries.pop_front();
            } else {
                break;
            }
        }

        let count = entries.len() as u32;
        let reset_at = entries
            .front()
            .map(|&front| front + window)
            .unwrap_or(now + window);

        if count < limit {
            entries.push_back(now);
            Decision {
                allowed: true,
                remaining: limit - count - 1,
                reset_at,
            }
        } else {
            Decision {
                allowed: false,
                remaining: 0,
                reset_at,
            }
        }
    }

    /// Sleep until admission. Used by in-job fetches, where waiting out the
    /// window beats surfacing a rejection.
    pub async fn wait_until_allowed(&self, key: &str, limit: u32, window: Duration) {
        loop {
            let decision = self.check(key, limit, window);
            if decision.allowed {
                return;
            }
            let now = Instant::now();
            let wait = decision
                .reset_at
                .saturating_duration_since(now)
                // Margin against waking a hair before the slot frees.
                + Duration::from_millis(10);
            debug!(key, wait_ms = wait.as_millis() as u64, "Rate limited, waiting");
            tokio::time::sleep(wait).await;
        }
    }

    /// Periodic cleanup of idle keys (call from a background task).
    pub fn cleanup(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.retain(|_, entries| {
            entries
                .back()
                .map(|&last| now.duration_since(last) < CLEANUP_HORIZON)
                .unwrap_or(false)
        });
    }

    /// Drop every key with the given prefix (tenant deletion).
    pub fn flush_prefix(&self, prefix: &str) {
        let mut state = self.state.lock();
        state.retain(|key, _| !key.starts_with(prefix));
    }

    #[cfg(test)]
    fn key_count(&self) -> usize {
        self.state.lock().len()
    }
}
