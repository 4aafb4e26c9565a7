//! Per-API-key request admission.
//!
//! Each key gets a counter named `ratelimit:<key id>` that expires one window
//! after it was armed. When the counter store cannot be reached the limiter
//! admits the request: availability wins over strict quota enforcement.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;
use uuid::Uuid;

pub use crate::store::WindowPolicy;
use crate::store::CounterStore;

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(3600);

/// Fixed-window rate limiter over a shared [`CounterStore`].
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    window: Duration,
    policy: WindowPolicy,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, window: Duration, policy: WindowPolicy) -> Self {
        Self {
            store,
            window,
            policy,
        }
    }

    /// Admit one request for `key_id` if fewer than `limit` were admitted in
    /// the current window. Never blocks waiting for quota.
    pub async fn allow(&self, key_id: Uuid, limit: u32) -> bool {
        let key = Self::counter_key(key_id);
        match self
            .store
            .check_and_increment(&key, u64::from(limit), self.window, self.policy)
            .await
        {
            Ok(admitted) => admitted,
            Err(e) => {
                warn!(error = %e, api_key_id = %key_id, "ratelimit_store_failed_open");
                true
            }
        }
    }

    pub fn counter_key(key_id: Uuid) -> String {
        format!("ratelimit:{}", key_id)
    }

    pub fn policy(&self) -> WindowPolicy {
        self.policy
    }
}
