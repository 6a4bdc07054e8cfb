//! Sliding-window rate limiting keyed by subject and capability.
//!
//! Each `"{subject}:{capability}"` key holds two independent windows, one per
//! trailing minute and one per trailing hour; a request is admitted only when
//! both are under their limits, and only then is it recorded in both. The
//! counter store is injectable so a shared external store can replace the
//! in-memory map without touching the gateway.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::config::RateLimits;
use crate::error::AdmissionError;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// Storage backend for sliding-window counters.
///
/// `check_and_record` must be atomic per key: concurrent calls for the same
/// key may not lose updates or double-admit past a limit.
pub trait CounterStore: Send + Sync {
    /// Check both windows for `key` at `now`; on success record the
    /// admission in both and return `Ok`. On rejection nothing is recorded
    /// and the error carries the wait until the violated window frees a slot.
    fn check_and_record(
        &self,
        key: &str,
        limits: &RateLimits,
        now: Instant,
    ) -> Result<(), Duration>;
}

#[derive(Debug, Default)]
struct KeyWindows {
    minute: VecDeque<Instant>,
    hour: VecDeque<Instant>,
}

impl KeyWindows {
    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.minute.front() {
            if now.duration_since(*oldest) >= MINUTE {
                self.minute.pop_front();
            } else {
                break;
            }
        }
        while let Some(oldest) = self.hour.front() {
            if now.duration_since(*oldest) >= HOUR {
                self.hour.pop_front();
            } else {
                break;
            }
        }
    }
}

/// In-memory counter store over a concurrent map with per-key locking.
///
/// Window state is created lazily on first check and shrinks as entries age
/// out of the windows; idle keys hold no timestamps.
#[derive(Debug, Default)]
pub struct InMemoryCounters {
    windows: DashMap<String, Mutex<KeyWindows>>,
}

impl InMemoryCounters {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CounterStore for InMemoryCounters {
    fn check_and_record(
        &self,
        key: &str,
        limits: &RateLimits,
        now: Instant,
    ) -> Result<(), Duration> {
        let entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| Mutex::new(KeyWindows::default()));
        let mut windows = entry.lock();
        windows.prune(now);

        if windows.minute.len() >= limits.per_minute as usize {
            let oldest = windows.minute.front().copied().unwrap_or(now);
            return Err(MINUTE.saturating_sub(now.duration_since(oldest)));
        }
        if windows.hour.len() >= limits.per_hour as usize {
            let oldest = windows.hour.front().copied().unwrap_or(now);
            return Err(HOUR.saturating_sub(now.duration_since(oldest)));
        }

        windows.minute.push_back(now);
        windows.hour.push_back(now);
        Ok(())
    }
}

/// Sliding-window limiter for the admission gateway.
#[derive(Clone)]
pub struct RateLimiter {
    limits: RateLimits,
    store: Arc<dyn CounterStore>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Create a limiter backed by the in-memory counter store.
    pub fn new(limits: RateLimits) -> Self {
        Self::with_store(limits, Arc::new(InMemoryCounters::new()))
    }

    /// Create a limiter over a caller-supplied counter store.
    pub fn with_store(limits: RateLimits, store: Arc<dyn CounterStore>) -> Self {
        Self { limits, store }
    }

    /// Check and record an admission for a subject/capability pair.
    pub fn check(&self, subject: &str, capability: &str) -> Result<(), AdmissionError> {
        self.check_at(subject, capability, Instant::now())
    }

    /// Clock-injected variant of [`check`](Self::check).
    pub fn check_at(
        &self,
        subject: &str,
        capability: &str,
        now: Instant,
    ) -> Result<(), AdmissionError> {
        let key = format!("{}:{}", subject, capability);
        self.store
            .check_and_record(&key, &self.limits, now)
            .map_err(|retry_after| AdmissionError::RateLimited { retry_after })
    }
}
