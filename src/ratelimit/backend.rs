//! Rate limiter trait for abstracting local and distributed implementations.

use async_trait::async_trait;

use super::rules::RateLimitConfig;
use super::window::{ActiveEntry, Algorithm, RateLimitVerdict, SweepReport, UsageInfo};
use crate::error::Result;

/// Trait for rate limiter implementations.
///
/// This trait abstracts over both the local fixed-window [`RateLimiter`] and
/// the sliding-log [`DistributedRateLimiter`] so the admission guard and the
/// gRPC service work with either.
///
/// `check` and `usage` never fail: a limiter whose store is unreachable
/// admits the request instead. The operator-facing calls report store
/// failures as errors.
///
/// [`RateLimiter`]: super::RateLimiter
/// [`DistributedRateLimiter`]: super::DistributedRateLimiter
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Count one request against `key` and decide whether it is admitted.
    async fn check(&self, key: &str, config: &RateLimitConfig) -> RateLimitVerdict;

    /// Read the usage of `key` without counting a request.
    async fn usage(&self, key: &str, config: &RateLimitConfig) -> UsageInfo;

    /// Clear all accounting state for `key`.
    async fn reset(&self, key: &str) -> Result<()>;

    /// Keys that currently hold accounting state, ordered by key.
    async fn list_active(&self) -> Result<Vec<ActiveEntry>>;

    /// Evict expired accounting state.
    async fn sweep(&self) -> Result<SweepReport>;

    /// The admission curve this limiter implements.
    fn algorithm(&self) -> Algorithm;
}
