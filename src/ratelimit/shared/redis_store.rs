//! Redis sorted-set backend.
//!
//! The admission step is one Lua script, so concurrent checks from any number
//! of processes are serialized by Redis and cannot both observe a count below
//! the limit for the last free slot.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{
    window_start, BackendError, LogOutcome, LogSnapshot, LogSummary, SortedSetBackend,
};

const RECORD_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window_start = tonumber(ARGV[2])
local window_ms = tonumber(ARGV[3])
local max_requests = tonumber(ARGV[4])
local member = ARGV[5]

redis.call('ZREMRANGEBYSCORE', key, '-inf', window_start)
local count = redis.call('ZCARD', key)
local admitted = 0
if count < max_requests then
    redis.call('ZADD', key, now, member)
    redis.call('PEXPIRE', key, window_ms)
    count = count + 1
    admitted = 1
end

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local oldest_score = -1
if oldest[2] then
    oldest_score = tonumber(oldest[2])
end
return {admitted, count, oldest_score}
"#;

const INSPECT_SCRIPT: &str = r#"
local key = KEYS[1]
local lower = '(' .. ARGV[1]
local count = redis.call('ZCOUNT', key, lower, '+inf')
local oldest = redis.call('ZRANGEBYSCORE', key, lower, '+inf', 'WITHSCORES', 'LIMIT', 0, 1)
local oldest_score = -1
if oldest[2] then
    oldest_score = tonumber(oldest[2])
end
return {count, oldest_score}
"#;

/// Keys fetched per SCAN round trip.
const SCAN_BATCH: usize = 100;

/// A [`SortedSetBackend`] on a Redis server.
///
/// Every call is bounded by `operation_timeout`; a connection that fails is
/// dropped and re-established on the next call.
pub struct RedisSortedSet {
    client: Client,
    connection: Mutex<Option<MultiplexedConnection>>,
    operation_timeout: Duration,
    record_script: Script,
    inspect_script: Script,
}

impl std::fmt::Debug for RedisSortedSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSortedSet")
            .field("operation_timeout", &self.operation_timeout)
            .finish()
    }
}

impl RedisSortedSet {
    /// Create a backend for `url`. No connection is made until first use, so
    /// an unreachable server does not prevent startup.
    pub fn open(url: &str, operation_timeout: Duration) -> Result<Self, BackendError> {
        let client = Client::open(url)?;
        info!(timeout = ?operation_timeout, "Redis sorted-set backend configured");
        Ok(Self {
            client,
            connection: Mutex::new(None),
            operation_timeout,
            record_script: Script::new(RECORD_SCRIPT),
            inspect_script: Script::new(INSPECT_SCRIPT),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, BackendError> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        debug!("Connected to Redis");
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn forget_connection(&self) {
        self.connection.lock().await.take();
    }

    /// Run `op` under the operation timeout, dropping the cached connection
    /// if it fails.
    async fn bounded<T, F, Fut>(&self, op: F) -> Result<T, BackendError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let attempt = async {
            let conn = self.connection().await?;
            op(conn).await
        };

        let result = match tokio::time::timeout(self.operation_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(self.operation_timeout)),
        };

        if result.is_err() {
            self.forget_connection().await;
        }
        result
    }
}

fn score(raw: i64) -> Option<u64> {
    u64::try_from(raw).ok()
}

#[async_trait]
impl SortedSetBackend for RedisSortedSet {
    async fn record(
        &self,
        key: &str,
        now: u64,
        window_ms: u64,
        max_requests: u64,
        member: &str,
    ) -> Result<LogOutcome, BackendError> {
        let mut invocation = self.record_script.key(key);
        invocation
            .arg(now)
            .arg(window_start(now, window_ms))
            .arg(window_ms)
            .arg(max_requests)
            .arg(member);

        let (admitted, count, oldest) = self
            .bounded(|mut conn| async move {
                let reply: (i64, i64, i64) = invocation.invoke_async(&mut conn).await?;
                Ok(reply)
            })
            .await?;

        Ok(LogOutcome {
            admitted: admitted == 1,
            count: u64::try_from(count)
                .map_err(|_| BackendError::Protocol(format!("negative count {}", count)))?,
            oldest: score(oldest),
        })
    }

    async fn inspect(
        &self,
        key: &str,
        now: u64,
        window_ms: u64,
    ) -> Result<LogSnapshot, BackendError> {
        let mut invocation = self.inspect_script.key(key);
        invocation.arg(window_start(now, window_ms));

        let (count, oldest) = self
            .bounded(|mut conn| async move {
                let reply: (i64, i64) = invocation.invoke_async(&mut conn).await?;
                Ok(reply)
            })
            .await?;

        Ok(LogSnapshot {
            count: u64::try_from(count)
                .map_err(|_| BackendError::Protocol(format!("negative count {}", count)))?,
            oldest: score(oldest),
        })
    }

    async fn remove(&self, key: &str) -> Result<(), BackendError> {
        self.bounded(|mut conn| async move {
            let _: () = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }

    /// Each SCAN page and each ZCARD/PTTL pipeline is its own bounded round
    /// trip, so listing many keys is not held to a single operation timeout.
    async fn scan(&self, prefix: &str, _now: u64) -> Result<Vec<LogSummary>, BackendError> {
        let pattern = format!("{}*", prefix);

        let mut keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let pattern = pattern.as_str();
            let (next, batch): (u64, Vec<String>) = self
                .bounded(|mut conn| async move {
                    let page: (u64, Vec<String>) = redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn)
                        .await?;
                    Ok(page)
                })
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();

        let mut summaries = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(SCAN_BATCH) {
            let replies: Vec<i64> = self
                .bounded(|mut conn| async move {
                    let mut pipe = redis::pipe();
                    for key in chunk {
                        pipe.cmd("ZCARD").arg(key).cmd("PTTL").arg(key);
                    }
                    let replies: Vec<i64> = pipe.query_async(&mut conn).await?;
                    Ok(replies)
                })
                .await?;
            summaries.extend(summarize(prefix, chunk, &replies)?);
        }
        Ok(summaries)
    }
}

/// Pair each key with its `ZCARD`, `PTTL` replies, skipping keys that
/// vanished (`-2`) or carry no expiry (`-1`).
fn summarize(
    prefix: &str,
    keys: &[String],
    replies: &[i64],
) -> Result<Vec<LogSummary>, BackendError> {
    if replies.len() != keys.len() * 2 {
        return Err(BackendError::Protocol(format!(
            "expected {} replies, got {}",
            keys.len() * 2,
            replies.len()
        )));
    }

    Ok(keys
        .iter()
        .zip(replies.chunks_exact(2))
        .filter_map(|(key, reply)| {
            let (count, ttl_ms) = (reply[0], reply[1]);
            if ttl_ms <= 0 || count < 0 {
                return None;
            }
            key.strip_prefix(prefix).map(|stripped| LogSummary {
                key: stripped.to_string(),
                count: count as u64,
                ttl_ms: ttl_ms as u64,
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_rejects_malformed_url() {
        assert!(RedisSortedSet::open("not a url", Duration::from_millis(50)).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_server_times_out_or_errors() {
        // Nothing listens on port 1; the call must come back promptly with an error.
        let backend = RedisSortedSet::open("redis://127.0.0.1:1/", Duration::from_millis(200)).unwrap();
        let result = backend.record("k", 0, 1_000, 1, "m").await;
        assert!(result.is_err());
    }

    #[test]
    fn test_summarize_pairs_replies_and_skips_unexpiring_keys() {
        let keys = vec![
            "ns:a".to_string(),
            "ns:gone".to_string(),
            "ns:forever".to_string(),
            "ns:b".to_string(),
        ];
        let replies = vec![3, 1_500, 0, -2, 4, -1, 1, 20];

        let summaries = summarize("ns:", &keys, &replies).unwrap();
        assert_eq!(
            summaries,
            vec![
                LogSummary { key: "a".to_string(), count: 3, ttl_ms: 1_500 },
                LogSummary { key: "b".to_string(), count: 1, ttl_ms: 20 },
            ]
        );
    }

    #[test]
    fn test_summarize_rejects_short_reply() {
        let keys = vec!["ns:a".to_string()];
        assert!(matches!(
            summarize("ns:", &keys, &[1]),
            Err(BackendError::Protocol(_))
        ));
    }

    #[tokio::test]
    #[ignore = "requires a running Redis at REDIS_URL"]
    async fn test_scan_many_keys_within_operation_timeout() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/".to_string());
        let backend = RedisSortedSet::open(&url, Duration::from_millis(250)).unwrap();
        let prefix = format!("turnstile-scan-{}:", uuid::Uuid::new_v4());

        for i in 0..2_000 {
            let key = format!("{}{}", prefix, i);
            backend.record(&key, 1_000, 60_000, 5, "m").await.unwrap();
        }

        let found = backend.scan(&prefix, 1_000).await.unwrap();
        assert_eq!(found.len(), 2_000);

        for summary in found {
            backend.remove(&format!("{}{}", prefix, summary.key)).await.unwrap();
        }
    }

    #[tokio::test]
    #[ignore = "requires a running Redis at REDIS_URL"]
    async fn test_record_against_redis() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/".to_string());
        let backend = RedisSortedSet::open(&url, Duration::from_secs(1)).unwrap();
        let key = format!("turnstile-test:{}", uuid::Uuid::new_v4());

        let first = backend.record(&key, 1_000, 60_000, 2, "a").await.unwrap();
        assert_eq!(first, LogOutcome { admitted: true, count: 1, oldest: Some(1_000) });

        backend.record(&key, 1_001, 60_000, 2, "b").await.unwrap();
        let denied = backend.record(&key, 1_002, 60_000, 2, "c").await.unwrap();
        assert_eq!(denied, LogOutcome { admitted: false, count: 2, oldest: Some(1_000) });

        let snapshot = backend.inspect(&key, 1_002, 60_000).await.unwrap();
        assert_eq!(snapshot, LogSnapshot { count: 2, oldest: Some(1_000) });

        let found = backend.scan("turnstile-test:", 1_002).await.unwrap();
        assert!(found.iter().any(|s| key.ends_with(&s.key) && s.count == 2));

        backend.remove(&key).await.unwrap();
        let snapshot = backend.inspect(&key, 1_002, 60_000).await.unwrap();
        assert_eq!(snapshot.count, 0);
    }
}
