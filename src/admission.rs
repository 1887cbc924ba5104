//! Request admission on top of a rate limiter.
//!
//! The guard is the only component that knows about routes and response
//! metadata: it resolves the limit for a request, derives the accounting key,
//! asks the limiter for a verdict and turns that verdict into headers or a
//! terminal rejection.

use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

use crate::ratelimit::{
    Clock, KeyBuilder, RateLimiterBackend, RequestContext, RouteTable, SystemClock,
};

pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

/// Machine-readable reason carried by every rejection.
pub const REJECTION_REASON: &str = "too_many_requests";

/// Rate limit metadata attached to a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: u64,
    pub remaining: u64,
    /// Epoch milliseconds
    pub reset_at: u64,
    /// Only present on rejections
    pub retry_after_secs: Option<u64>,
}

impl RateLimitHeaders {
    /// Header name and value pairs, in emission order.
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            (HEADER_LIMIT, self.limit.to_string()),
            (HEADER_REMAINING, self.remaining.to_string()),
            (HEADER_RESET, format_reset(self.reset_at)),
        ];
        if let Some(retry_after) = self.retry_after_secs {
            pairs.push((HEADER_RETRY_AFTER, retry_after.to_string()));
        }
        pairs
    }
}

/// Render epoch milliseconds as an RFC 3339 UTC timestamp.
fn format_reset(reset_at: u64) -> String {
    i64::try_from(reset_at)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|at| at.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| reset_at.to_string())
}

/// A request that may proceed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admitted {
    /// `None` when the route is unlimited or the request was exempt.
    pub headers: Option<RateLimitHeaders>,
}

/// Terminal outcome for a request over its limit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TooManyRequests {
    pub reason: &'static str,
    pub message: String,
    pub retry_after_secs: u64,
    pub headers: RateLimitHeaders,
}

/// Whole seconds until `reset_at`, rounded up.
pub fn retry_after_secs(reset_at: u64, now: u64) -> u64 {
    reset_at.saturating_sub(now).div_ceil(1000)
}

/// Applies per-route limits to inbound requests.
pub struct AdmissionGuard<R: RateLimiterBackend> {
    limiter: Arc<R>,
    routes: Arc<RouteTable>,
    keys: KeyBuilder,
    clock: Arc<dyn Clock>,
}

impl<R: RateLimiterBackend> AdmissionGuard<R> {
    pub fn new(limiter: Arc<R>, routes: Arc<RouteTable>) -> Self {
        Self::with_clock(limiter, routes, Arc::new(SystemClock))
    }

    pub fn with_clock(limiter: Arc<R>, routes: Arc<RouteTable>, clock: Arc<dyn Clock>) -> Self {
        let keys = KeyBuilder::new(routes.key_prefix());
        Self {
            limiter,
            routes,
            keys,
            clock,
        }
    }

    pub fn limiter(&self) -> &Arc<R> {
        &self.limiter
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Decide whether `request` may proceed.
    pub async fn admit(&self, request: &RequestContext) -> Result<Admitted, TooManyRequests> {
        let Some(config) = self.routes.find(&request.method, request.route()) else {
            trace!(method = %request.method, route = %request.route(), "No rate limit for route");
            return Ok(Admitted { headers: None });
        };

        if config.should_skip(request) {
            trace!(method = %request.method, route = %request.route(), "Request exempt from rate limit");
            return Ok(Admitted { headers: None });
        }

        let key = self.keys.build(request, config);
        let verdict = self.limiter.check(&key, config).await;

        let mut headers = RateLimitHeaders {
            limit: verdict.limit,
            remaining: verdict.remaining,
            reset_at: verdict.reset_at,
            retry_after_secs: None,
        };

        if verdict.allowed {
            return Ok(Admitted {
                headers: Some(headers),
            });
        }

        let retry_after = retry_after_secs(verdict.reset_at, self.clock.now_millis());
        headers.retry_after_secs = Some(retry_after);

        debug!(
            key = %key,
            route = %request.route(),
            retry_after_secs = retry_after,
            "Request rejected"
        );

        Err(TooManyRequests {
            reason: REJECTION_REASON,
            message: config.rejection_message().to_string(),
            retry_after_secs: retry_after,
            headers,
        })
    }
}
