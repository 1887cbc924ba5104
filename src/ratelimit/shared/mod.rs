//! Shared, multi-process window store.
//!
//! Keeps a per-key log of request timestamps in an external sorted set and
//! evaluates a sliding window over it. Unlike the local fixed window, the
//! sliding log never admits more than `max_requests` in any trailing
//! `window_ms` span.

mod memory;
mod redis_store;

pub use self::memory::MemorySortedSet;
pub use self::redis_store::RedisSortedSet;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::trace;

use super::rules::RateLimitConfig;
use super::window::{ActiveEntry, UsageInfo};

/// Namespace used for shared keys when none is configured.
pub const DEFAULT_NAMESPACE: &str = "turnstile";

/// Errors raised by a sorted-set backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unexpected reply: {0}")]
    Protocol(String),
}

/// Outcome of an atomic trim-count-record step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogOutcome {
    /// Whether a new entry was recorded
    pub admitted: bool,
    /// Entries in the window after the step
    pub count: u64,
    /// Score of the oldest entry still in the window
    pub oldest: Option<u64>,
}

/// Read-only view of a key's log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSnapshot {
    pub count: u64,
    pub oldest: Option<u64>,
}

/// A key found while enumerating the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSummary {
    /// Key with the namespace stripped
    pub key: String,
    pub count: u64,
    /// Remaining time to live of the whole key
    pub ttl_ms: u64,
}

/// The sorted-set primitive the shared store is built on.
///
/// `record` must run its whole sequence atomically with respect to every
/// other client of the backend: remove scores `<= now - window_ms`, count,
/// and only if the count is below `max_requests` add `member` at score `now`
/// and set the key to expire after `window_ms`.
///
/// `now - window_ms` may be negative; use [`window_start`] rather than
/// saturating arithmetic so an entry scored `0` is not trimmed early.
#[async_trait]
pub trait SortedSetBackend: Send + Sync {
    async fn record(
        &self,
        key: &str,
        now: u64,
        window_ms: u64,
        max_requests: u64,
        member: &str,
    ) -> Result<LogOutcome, BackendError>;

    /// Count and oldest score of entries newer than `now - window_ms`,
    /// without modifying the key.
    async fn inspect(&self, key: &str, now: u64, window_ms: u64)
        -> Result<LogSnapshot, BackendError>;

    /// Delete the key.
    async fn remove(&self, key: &str) -> Result<(), BackendError>;

    /// Every live key starting with `prefix`.
    async fn scan(&self, prefix: &str, now: u64) -> Result<Vec<LogSummary>, BackendError>;
}

/// Sliding-window-by-log accounting over a [`SortedSetBackend`].
///
/// Keys are namespaced as `namespace:key` in the backend.
pub struct SharedWindowStore {
    backend: Arc<dyn SortedSetBackend>,
    namespace: String,
}

impl SharedWindowStore {
    pub fn new(backend: Arc<dyn SortedSetBackend>, namespace: impl Into<String>) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    /// Run the atomic admission step for `key` at `now`.
    ///
    /// Returns whether the request was admitted and the resulting usage.
    pub async fn check(
        &self,
        key: &str,
        config: &RateLimitConfig,
        now: u64,
    ) -> Result<(bool, UsageInfo), BackendError> {
        let member = format!("{}-{}", now, uuid::Uuid::new_v4());
        let outcome = self
            .backend
            .record(
                &self.storage_key(key),
                now,
                config.window_ms(),
                config.max_requests(),
                &member,
            )
            .await?;

        trace!(key = %key, admitted = outcome.admitted, count = outcome.count, "Recorded shared window entry");

        let reset_at = reset_at(outcome.oldest, now, config.window_ms());
        Ok((
            outcome.admitted,
            UsageInfo::new(config.max_requests(), outcome.count, reset_at),
        ))
    }

    /// Usage of `key` at `now` without recording anything.
    pub async fn usage(
        &self,
        key: &str,
        config: &RateLimitConfig,
        now: u64,
    ) -> Result<UsageInfo, BackendError> {
        let snapshot = self
            .backend
            .inspect(&self.storage_key(key), now, config.window_ms())
            .await?;
        let reset_at = reset_at(snapshot.oldest, now, config.window_ms());
        Ok(UsageInfo::new(config.max_requests(), snapshot.count, reset_at))
    }

    /// Delete all entries for `key`.
    pub async fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.backend.remove(&self.storage_key(key)).await
    }

    /// Live keys, ordered by key. The reset time is derived from the key TTL.
    pub async fn list_active(&self, now: u64) -> Result<Vec<ActiveEntry>, BackendError> {
        let prefix = format!("{}:", self.namespace);
        let mut entries: Vec<ActiveEntry> = self
            .backend
            .scan(&prefix, now)
            .await?
            .into_iter()
            .filter(|summary| summary.ttl_ms > 0)
            .map(|summary| ActiveEntry {
                key: summary.key,
                count: summary.count,
                reset_at: now.saturating_add(summary.ttl_ms),
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }
}

/// Scores at or below this value have left the window.
pub fn window_start(now: u64, window_ms: u64) -> i64 {
    now as i64 - window_ms as i64
}

fn reset_at(oldest: Option<u64>, now: u64, window_ms: u64) -> u64 {
    oldest.unwrap_or(now).saturating_add(window_ms)
}
