//! Admission service implementation.

use prost_types::Timestamp;
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, instrument, warn};

use super::proto::{
    admission_service_server::AdmissionService, admit_response::Code, ActiveEntry, AdmitRequest,
    AdmitResponse, Algorithm as ProtoAlgorithm, GetUsageRequest, HeaderValue, ListActiveRequest,
    ListActiveResponse, ResetRequest, ResetResponse, SweepRequest, SweepResponse, UsageResponse,
};

use crate::admission::{retry_after_secs, AdmissionGuard, RateLimitHeaders};
use crate::error::TurnstileError;
use crate::ratelimit::{
    Algorithm, RateLimitConfig, RateLimiterBackend, RequestContext, DEFAULT_MAX_REQUESTS,
    DEFAULT_WINDOW_MS,
};

/// Implementation of the `AdmissionService` gRPC interface.
pub struct AdmissionServiceImpl<R: RateLimiterBackend> {
    /// The admission guard, which owns the limiter and route table
    guard: Arc<AdmissionGuard<R>>,
}

impl<R: RateLimiterBackend> AdmissionServiceImpl<R> {
    /// Create a new AdmissionServiceImpl around the given guard.
    pub fn new(guard: Arc<AdmissionGuard<R>>) -> Self {
        Self { guard }
    }

    fn now_millis(&self) -> u64 {
        self.guard.clock().now_millis()
    }
}

/// Epoch milliseconds as a protobuf timestamp.
fn timestamp(millis: u64) -> Timestamp {
    Timestamp {
        seconds: (millis / 1000) as i64,
        nanos: ((millis % 1000) * 1_000_000) as i32,
    }
}

fn header_values(headers: &RateLimitHeaders) -> Vec<HeaderValue> {
    headers
        .to_pairs()
        .into_iter()
        .map(|(key, value)| HeaderValue {
            key: key.to_string(),
            value,
        })
        .collect()
}

fn algorithm(algorithm: Algorithm) -> ProtoAlgorithm {
    match algorithm {
        Algorithm::FixedWindow => ProtoAlgorithm::FixedWindow,
        Algorithm::SlidingLog => ProtoAlgorithm::SlidingLog,
    }
}

/// Map an operator-facing failure to a status without leaking its details.
fn operator_status(operation: &str, e: TurnstileError) -> Status {
    match e {
        TurnstileError::BackingStoreUnavailable(_) => {
            warn!(operation, error = %e, "Rate limit store unavailable");
            Status::unavailable("rate limit store unavailable")
        }
        other => {
            error!(operation, error = %other, "Rate limit operation failed");
            Status::internal("rate limit operation failed")
        }
    }
}

#[tonic::async_trait]
impl<R: RateLimiterBackend + 'static> AdmissionService for AdmissionServiceImpl<R> {
    /// Decide whether a request may proceed.
    #[instrument(
        skip(self, request),
        fields(
            method = %request.get_ref().method,
            path = %request.get_ref().path,
        )
    )]
    async fn admit(
        &self,
        request: Request<AdmitRequest>,
    ) -> Result<Response<AdmitResponse>, Status> {
        let req = request.into_inner();

        if req.method.is_empty() {
            warn!("Received admission request with empty method");
            return Err(Status::invalid_argument("method is required"));
        }

        if req.path.is_empty() {
            warn!("Received admission request with empty path");
            return Err(Status::invalid_argument("path is required"));
        }

        let context = RequestContext {
            identity: req.identity,
            origin: req.origin,
            method: req.method,
            route_template: req.route_template,
            path: req.path,
            attributes: req.attributes,
        };

        let response = match self.guard.admit(&context).await {
            Ok(admitted) => AdmitResponse {
                code: Code::Ok.into(),
                response_headers_to_add: admitted
                    .headers
                    .as_ref()
                    .map(header_values)
                    .unwrap_or_default(),
                reason: String::new(),
                message: String::new(),
                retry_after_seconds: 0,
            },
            Err(rejection) => AdmitResponse {
                code: Code::OverLimit.into(),
                response_headers_to_add: header_values(&rejection.headers),
                reason: rejection.reason.to_string(),
                message: rejection.message,
                retry_after_seconds: rejection.retry_after_secs,
            },
        };

        debug!(code = response.code, "Admission decision made");

        Ok(Response::new(response))
    }

    /// Usage of a key without counting a request.
    #[instrument(skip(self, request), fields(key = %request.get_ref().key))]
    async fn get_usage(
        &self,
        request: Request<GetUsageRequest>,
    ) -> Result<Response<UsageResponse>, Status> {
        let req = request.into_inner();

        if req.key.is_empty() {
            return Err(Status::invalid_argument("key is required"));
        }

        let window_ms = if req.window_ms == 0 { DEFAULT_WINDOW_MS } else { req.window_ms };
        let max_requests = if req.max_requests == 0 {
            DEFAULT_MAX_REQUESTS
        } else {
            req.max_requests
        };
        let config = RateLimitConfig::new(window_ms, max_requests)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        let usage = self.guard.limiter().usage(&req.key, &config).await;

        Ok(Response::new(UsageResponse {
            key: req.key,
            limit: usage.limit,
            used: usage.used,
            remaining: usage.remaining,
            reset_at: Some(timestamp(usage.reset_at)),
        }))
    }

    /// Clear the accounting state of a key.
    #[instrument(skip(self, request), fields(key = %request.get_ref().key))]
    async fn reset(
        &self,
        request: Request<ResetRequest>,
    ) -> Result<Response<ResetResponse>, Status> {
        let req = request.into_inner();

        if req.key.is_empty() {
            return Err(Status::invalid_argument("key is required"));
        }

        self.guard
            .limiter()
            .reset(&req.key)
            .await
            .map_err(|e| operator_status("reset", e))?;

        info!(key = %req.key, "Rate limit reset by operator");

        Ok(Response::new(ResetResponse {
            key: req.key,
            reset_at: Some(timestamp(self.now_millis())),
        }))
    }

    /// Keys that currently hold accounting state.
    #[instrument(skip(self, _request))]
    async fn list_active(
        &self,
        _request: Request<ListActiveRequest>,
    ) -> Result<Response<ListActiveResponse>, Status> {
        let limiter = self.guard.limiter();
        let active = limiter
            .list_active()
            .await
            .map_err(|e| operator_status("list_active", e))?;
        let now = self.now_millis();

        let entries: Vec<ActiveEntry> = active
            .into_iter()
            .map(|entry| ActiveEntry {
                seconds_until_reset: retry_after_secs(entry.reset_at, now),
                reset_at: Some(timestamp(entry.reset_at)),
                key: entry.key,
                count: entry.count,
            })
            .collect();

        Ok(Response::new(ListActiveResponse {
            total_keys: entries.len() as u64,
            entries,
            algorithm: algorithm(limiter.algorithm()).into(),
        }))
    }

    /// Evict expired accounting state.
    #[instrument(skip(self, _request))]
    async fn sweep(
        &self,
        _request: Request<SweepRequest>,
    ) -> Result<Response<SweepResponse>, Status> {
        let report = self
            .guard
            .limiter()
            .sweep()
            .await
            .map_err(|e| operator_status("sweep", e))?;

        info!(
            removed = report.removed,
            remaining = report.remaining,
            "Rate limit sweep requested by operator"
        );

        Ok(Response::new(SweepResponse {
            removed_entries: report.removed as u64,
            remaining_entries: report.remaining as u64,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{
        DistributedRateLimiter, LocalWindowStore, ManualClock, MemorySortedSet, RateLimiter,
        RouteTable, SharedWindowStore,
    };
    use std::collections::HashMap;

    fn local_service(routes: RouteTable) -> (AdmissionServiceImpl<RateLimiter>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = Arc::new(RateLimiter::with_store(
            Arc::new(LocalWindowStore::new()),
            clock.clone(),
        ));
        let guard = AdmissionGuard::with_clock(limiter, Arc::new(routes), clock.clone());
        (AdmissionServiceImpl::new(Arc::new(guard)), clock)
    }

    fn admit_request(method: &str, path: &str) -> AdmitRequest {
        AdmitRequest {
            identity: Some("user-1".to_string()),
            origin: Some("10.0.0.1".to_string()),
            method: method.to_string(),
            route_template: None,
            path: path.to_string(),
            attributes: HashMap::new(),
        }
    }

    fn limited_routes() -> RouteTable {
        RouteTable::new().with_route(None, "/api/urls", RateLimitConfig::new(60_000, 2).unwrap())
    }

    #[tokio::test]
    async fn test_empty_method_rejected() {
        let (service, _clock) = local_service(limited_routes());

        let result = service.admit(Request::new(admit_request("", "/api/urls"))).await;
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_empty_path_rejected() {
        let (service, _clock) = local_service(limited_routes());

        let result = service.admit(Request::new(admit_request("GET", ""))).await;
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_admit_then_over_limit() {
        let (service, _clock) = local_service(limited_routes());

        for remaining in ["1", "0"] {
            let response = service
                .admit(Request::new(admit_request("GET", "/api/urls")))
                .await
                .unwrap()
                .into_inner();
            assert_eq!(response.code, i32::from(Code::Ok));
            assert_eq!(response.response_headers_to_add.len(), 3);
            assert_eq!(response.response_headers_to_add[1].key, "X-RateLimit-Remaining");
            assert_eq!(response.response_headers_to_add[1].value, remaining);
        }

        let response = service
            .admit(Request::new(admit_request("GET", "/api/urls")))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.code, i32::from(Code::OverLimit));
        assert_eq!(response.reason, "too_many_requests");
        assert_eq!(response.message, "Too many requests, please try again later.");
        assert_eq!(response.retry_after_seconds, 60);
        assert_eq!(response.response_headers_to_add.len(), 4);
        assert_eq!(response.response_headers_to_add[3].key, "Retry-After");
    }

    #[tokio::test]
    async fn test_unlimited_route_has_no_headers() {
        let (service, _clock) = local_service(limited_routes());

        let response = service
            .admit(Request::new(admit_request("GET", "/health")))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.code, i32::from(Code::Ok));
        assert!(response.response_headers_to_add.is_empty());
    }

    #[tokio::test]
    async fn test_get_usage_defaults() {
        let (service, _clock) = local_service(RouteTable::new());

        let response = service
            .get_usage(Request::new(GetUsageRequest {
                key: "some-key".to_string(),
                window_ms: 0,
                max_requests: 0,
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.limit, 100);
        assert_eq!(response.used, 0);
        assert_eq!(response.remaining, 100);
        assert_eq!(response.reset_at, Some(Timestamp { seconds: 60, nanos: 0 }));
    }

    #[tokio::test]
    async fn test_list_active_reset_and_sweep() {
        let (service, clock) = local_service(limited_routes());
        service
            .admit(Request::new(admit_request("GET", "/api/urls")))
            .await
            .unwrap();

        clock.set(1_500);
        let listing = service
            .list_active(Request::new(ListActiveRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(listing.total_keys, 1);
        assert_eq!(listing.algorithm, i32::from(ProtoAlgorithm::FixedWindow));
        let entry = &listing.entries[0];
        assert_eq!(entry.count, 1);
        assert_eq!(entry.seconds_until_reset, 59);
        assert_eq!(entry.reset_at, Some(Timestamp { seconds: 60, nanos: 0 }));

        let reset = service
            .reset(Request::new(ResetRequest { key: entry.key.clone() }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(reset.key, entry.key);
        assert_eq!(reset.reset_at, Some(Timestamp { seconds: 1, nanos: 500_000_000 }));

        let sweep = service
            .sweep(Request::new(SweepRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(sweep.removed_entries, 0);
        assert_eq!(sweep.remaining_entries, 0);
    }

    #[tokio::test]
    async fn test_reset_requires_key() {
        let (service, _clock) = local_service(RouteTable::new());
        let result = service.reset(Request::new(ResetRequest { key: String::new() })).await;
        assert_eq!(result.unwrap_err().code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_list_active_reports_sliding_log() {
        let store = SharedWindowStore::new(Arc::new(MemorySortedSet::new()), "test");
        let limiter = Arc::new(DistributedRateLimiter::new(store));
        let guard = AdmissionGuard::new(limiter, Arc::new(RouteTable::new()));
        let service = AdmissionServiceImpl::new(Arc::new(guard));

        let listing = service
            .list_active(Request::new(ListActiveRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(listing.total_keys, 0);
        assert_eq!(listing.algorithm, i32::from(ProtoAlgorithm::SlidingLog));
    }
}
