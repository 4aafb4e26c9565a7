//! Shared counter store used by the rate limiter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::StoreError;

/// When a window's expiry is (re)armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPolicy {
    /// Expiry is pushed back on every admitted request. A key that keeps
    /// receiving traffic never sees its window reset.
    Refresh,
    /// Expiry is set once, when the window's first request is admitted.
    Fixed,
}

impl WindowPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "refresh" => Some(WindowPolicy::Refresh),
            "fixed" => Some(WindowPolicy::Fixed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WindowPolicy::Refresh => "refresh",
            WindowPolicy::Fixed => "fixed",
        }
    }
}

/// A store of expiring counters.
///
/// Implementations must be safe for concurrent access from many requests.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically check `key` against `limit` and, when below it, increment.
    ///
    /// Returns `true` if the increment happened. The counter expires `window`
    /// after it was armed, according to `policy`.
    async fn check_and_increment(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        policy: WindowPolicy,
    ) -> Result<bool, StoreError>;
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u64,
    expires_at: Instant,
}

/// Every this many calls, expired windows of all keys are dropped.
const SWEEP_EVERY: u64 = 256;

/// In-process [`CounterStore`]. A key's expired window is evicted when the
/// key is used again, and all expired windows are swept periodically.
///
/// Used when no Redis URL is configured; counters are then per process.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    windows: Mutex<HashMap<String, Window>>,
    calls: AtomicU64,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn check_and_increment(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        policy: WindowPolicy,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;

        if self.calls.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            windows.retain(|_, w| now < w.expires_at);
        }

        if windows.get(key).is_some_and(|w| now >= w.expires_at) {
            windows.remove(key);
        }

        let current = windows.get(key).map_or(0, |w| w.count);
        if current >= limit {
            return Ok(false);
        }

        let entry = windows.entry(key.to_string()).or_insert(Window {
            count: 0,
            expires_at: now + window,
        });
        entry.count += 1;
        if policy == WindowPolicy::Refresh {
            entry.expires_at = now + window;
        }

        Ok(true)
    }
}
