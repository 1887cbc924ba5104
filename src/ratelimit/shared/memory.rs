//! In-process sorted-set backend.
//!
//! Mirrors the Redis semantics (score trimming, key expiry) behind a single
//! mutex. Useful for single-node deployments that want the sliding-log curve
//! and for exercising the shared store without a Redis server.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};

use super::{
    window_start, BackendError, LogOutcome, LogSnapshot, LogSummary, SortedSetBackend,
};

#[derive(Debug, Default)]
struct SortedSet {
    members: BTreeSet<(u64, String)>,
    expires_at: u64,
}

impl SortedSet {
    fn trim(&mut self, start: i64) {
        self.members.retain(|(score, _)| *score as i64 > start);
    }

    fn live_count(&self, start: i64) -> u64 {
        self.members
            .iter()
            .filter(|(score, _)| *score as i64 > start)
            .count() as u64
    }

    fn oldest_after(&self, start: i64) -> Option<u64> {
        self.members
            .iter()
            .map(|(score, _)| *score)
            .find(|score| *score as i64 > start)
    }
}

/// A [`SortedSetBackend`] held in process memory.
#[derive(Debug, Default)]
pub struct MemorySortedSet {
    sets: Mutex<HashMap<String, SortedSet>>,
}

impl MemorySortedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys held, expired ones included.
    pub fn len(&self) -> usize {
        self.sets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.lock().is_empty()
    }
}

#[async_trait]
impl SortedSetBackend for MemorySortedSet {
    async fn record(
        &self,
        key: &str,
        now: u64,
        window_ms: u64,
        max_requests: u64,
        member: &str,
    ) -> Result<LogOutcome, BackendError> {
        let mut sets = self.sets.lock();

        if sets.get(key).is_some_and(|set| set.expires_at <= now) {
            sets.remove(key);
        }

        let set = sets.entry(key.to_string()).or_default();
        set.trim(window_start(now, window_ms));

        let mut count = set.members.len() as u64;
        let admitted = count < max_requests;
        if admitted {
            set.members.insert((now, member.to_string()));
            set.expires_at = now.saturating_add(window_ms);
            count += 1;
        }

        let oldest = set.members.first().map(|(score, _)| *score);

        if set.members.is_empty() {
            sets.remove(key);
        }

        Ok(LogOutcome {
            admitted,
            count,
            oldest,
        })
    }

    async fn inspect(
        &self,
        key: &str,
        now: u64,
        window_ms: u64,
    ) -> Result<LogSnapshot, BackendError> {
        let sets = self.sets.lock();
        let start = window_start(now, window_ms);

        let snapshot = match sets.get(key).filter(|set| set.expires_at > now) {
            Some(set) => LogSnapshot {
                count: set.live_count(start),
                oldest: set.oldest_after(start),
            },
            None => LogSnapshot {
                count: 0,
                oldest: None,
            },
        };
        Ok(snapshot)
    }

    async fn remove(&self, key: &str) -> Result<(), BackendError> {
        self.sets.lock().remove(key);
        Ok(())
    }

    async fn scan(&self, prefix: &str, now: u64) -> Result<Vec<LogSummary>, BackendError> {
        let mut sets = self.sets.lock();
        sets.retain(|_, set| set.expires_at > now);

        Ok(sets
            .iter()
            .filter_map(|(key, set)| {
                key.strip_prefix(prefix).map(|stripped| LogSummary {
                    key: stripped.to_string(),
                    count: set.members.len() as u64,
                    ttl_ms: set.expires_at - now,
                })
            })
            .collect())
    }
}
