//! Fixed-window rate limiter over the process-local store.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, trace};

use super::backend::RateLimiterBackend;
use super::clock::{Clock, SystemClock};
use super::local::LocalWindowStore;
use super::rules::RateLimitConfig;
use super::window::{
    ActiveEntry, Algorithm, RateLimitVerdict, SweepReport, UsageInfo, WindowRecord,
};
use crate::error::Result;

/// The core rate limiter for a single process.
///
/// Each key gets a fixed window that opens on its first request and closes
/// `window_ms` later; the window counter is checked and incremented inside the
/// store's per-key critical section. Near a window boundary this admits up to
/// twice `max_requests` within one `window_ms` span.
///
/// The limiter keeps no state of its own; everything lives in the shared
/// [`LocalWindowStore`], which is also what the janitor sweeps.
pub struct RateLimiter {
    store: Arc<LocalWindowStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a rate limiter with its own store and the system clock.
    pub fn new() -> Self {
        Self::with_store(Arc::new(LocalWindowStore::new()), Arc::new(SystemClock))
    }

    /// Create a rate limiter over an existing store.
    pub fn with_store(store: Arc<LocalWindowStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// The store backing this limiter.
    pub fn store(&self) -> &Arc<LocalWindowStore> {
        &self.store
    }

    /// Check the rate limit for `key` at an explicit time.
    pub fn check_at(&self, key: &str, config: &RateLimitConfig, now: u64) -> RateLimitVerdict {
        let limit = config.max_requests();

        let verdict = self.store.update(key, now, |current| {
            let record = current.unwrap_or_else(|| {
                trace!(key = %key, window_ms = config.window_ms(), "Opening new window");
                WindowRecord::open(now, config.window_ms())
            });

            if record.count < limit {
                let next = record.incremented();
                let usage = UsageInfo::new(limit, next.count, next.window_reset_at);
                (Some(next), RateLimitVerdict::new(true, usage))
            } else {
                let usage = UsageInfo::new(limit, record.count, record.window_reset_at);
                (None, RateLimitVerdict::new(false, usage))
            }
        });

        if verdict.allowed {
            trace!(key = %key, used = verdict.used, limit, "Request admitted");
        } else {
            debug!(key = %key, used = verdict.used, limit, reset_at = verdict.reset_at, "Rate limit exceeded");
        }

        verdict
    }

    /// Usage of `key` at an explicit time, without counting a request.
    pub fn usage_at(&self, key: &str, config: &RateLimitConfig, now: u64) -> UsageInfo {
        match self.store.get(key, now) {
            Some(record) => UsageInfo::new(config.max_requests(), record.count, record.window_reset_at),
            None => UsageInfo::untouched(config.max_requests(), now, config.window_ms()),
        }
    }

    /// Clear the accounting state of `key`.
    pub fn reset_key(&self, key: &str) {
        if self.store.delete(key) {
            debug!(key = %key, "Rate limit reset");
        }
    }

    /// Get the number of stored windows, expired ones included.
    pub fn counter_count(&self) -> usize {
        self.store.len()
    }

    /// Clear all counters.
    pub fn clear(&self) {
        self.store.clear();
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimiterBackend for RateLimiter {
    async fn check(&self, key: &str, config: &RateLimitConfig) -> RateLimitVerdict {
        self.check_at(key, config, self.clock.now_millis())
    }

    async fn usage(&self, key: &str, config: &RateLimitConfig) -> UsageInfo {
        self.usage_at(key, config, self.clock.now_millis())
    }

    async fn reset(&self, key: &str) -> Result<()> {
        self.reset_key(key);
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<ActiveEntry>> {
        Ok(self.store.list_active(self.clock.now_millis()))
    }

    async fn sweep(&self) -> Result<SweepReport> {
        let removed = self.store.sweep(self.clock.now_millis());
        Ok(SweepReport {
            removed,
            remaining: self.store.len(),
        })
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::FixedWindow
    }
}
