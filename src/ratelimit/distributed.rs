//! Distributed rate limiter over the shared window store.
//!
//! Several Turnstile processes pointing at the same Redis share their
//! accounting. When the store cannot answer, the limiter fails open: the
//! request is admitted and the failure is logged, so an outage of the counter
//! store degrades protection instead of availability.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use super::backend::RateLimiterBackend;
use super::clock::{Clock, SystemClock};
use super::rules::RateLimitConfig;
use super::shared::SharedWindowStore;
use super::window::{ActiveEntry, Algorithm, RateLimitVerdict, SweepReport, UsageInfo};
use crate::error::Result;

/// A sliding-log rate limiter backed by a [`SharedWindowStore`].
///
/// Each check is one atomic step in the backing store, so concurrent checks
/// from any process never admit more than `max_requests` within a trailing
/// `window_ms` span.
pub struct DistributedRateLimiter {
    store: SharedWindowStore,
    clock: Arc<dyn Clock>,
}

impl DistributedRateLimiter {
    /// Create a distributed rate limiter using the system clock.
    pub fn new(store: SharedWindowStore) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: SharedWindowStore, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// The shared store backing this limiter.
    pub fn store(&self) -> &SharedWindowStore {
        &self.store
    }
}

#[async_trait]
impl RateLimiterBackend for DistributedRateLimiter {
    async fn check(&self, key: &str, config: &RateLimitConfig) -> RateLimitVerdict {
        let now = self.clock.now_millis();

        match self.store.check(key, config, now).await {
            Ok((allowed, usage)) => {
                if !allowed {
                    debug!(
                        key = %key,
                        used = usage.used,
                        limit = usage.limit,
                        reset_at = usage.reset_at,
                        "Distributed rate limit exceeded"
                    );
                }
                RateLimitVerdict::new(allowed, usage)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Shared rate limit store unavailable, admitting request");
                RateLimitVerdict::new(
                    true,
                    UsageInfo::untouched(config.max_requests(), now, config.window_ms()),
                )
            }
        }
    }

    async fn usage(&self, key: &str, config: &RateLimitConfig) -> UsageInfo {
        let now = self.clock.now_millis();

        self.store.usage(key, config, now).await.unwrap_or_else(|e| {
            warn!(key = %key, error = %e, "Shared rate limit store unavailable, reporting empty usage");
            UsageInfo::untouched(config.max_requests(), now, config.window_ms())
        })
    }

    async fn reset(&self, key: &str) -> Result<()> {
        self.store.delete(key).await?;
        debug!(key = %key, "Distributed rate limit reset");
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<ActiveEntry>> {
        Ok(self.store.list_active(self.clock.now_millis()).await?)
    }

    /// Shared keys carry their own TTL; the sweep only reports what is live.
    async fn sweep(&self) -> Result<SweepReport> {
        let remaining = self.store.list_active(self.clock.now_millis()).await?.len();
        Ok(SweepReport {
            removed: 0,
            remaining,
        })
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::SlidingLog
    }
}
