//! Process-local window store.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::trace;

use super::window::{ActiveEntry, WindowRecord};

/// Maps accounting keys to their fixed-window records.
///
/// The map is sharded; every operation locks at most one shard at a time, so
/// a read-modify-write through [`LocalWindowStore::update`] is atomic for its
/// key without serializing unrelated keys. Expiry is lazy on read and eager in
/// [`LocalWindowStore::sweep`].
#[derive(Debug, Default)]
pub struct LocalWindowStore {
    records: DashMap<String, WindowRecord>,
}

impl LocalWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current record for `key`, if any. Stale records read as absent and
    /// are left in place.
    pub fn get(&self, key: &str, now: u64) -> Option<WindowRecord> {
        self.records
            .get(key)
            .map(|record| *record)
            .filter(|record| record.is_current(now))
    }

    /// Unconditional upsert.
    pub fn put(&self, key: &str, record: WindowRecord) {
        self.records.insert(key.to_string(), record);
    }

    /// Remove `key`. Returns whether anything was removed.
    pub fn delete(&self, key: &str) -> bool {
        self.records.remove(key).is_some()
    }

    /// Atomically read and replace the record for `key`.
    ///
    /// `f` receives the current record (stale records are passed as `None`)
    /// and returns the record to store, or `None` to leave the entry as it is,
    /// together with a value handed back to the caller. The key's shard stays
    /// locked for the duration of `f`, so `f` must not touch the store.
    pub fn update<T, F>(&self, key: &str, now: u64, f: F) -> T
    where
        F: FnOnce(Option<WindowRecord>) -> (Option<WindowRecord>, T),
    {
        match self.records.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let current = Some(*entry.get()).filter(|record| record.is_current(now));
                let (next, out) = f(current);
                if let Some(record) = next {
                    entry.insert(record);
                }
                out
            }
            Entry::Vacant(entry) => {
                let (next, out) = f(None);
                if let Some(record) = next {
                    entry.insert(record);
                }
                out
            }
        }
    }

    /// Remove every record whose window has ended by `now`.
    ///
    /// Staleness is evaluated under the shard lock at the moment of removal,
    /// so a record refreshed concurrently with the sweep survives it.
    pub fn sweep(&self, now: u64) -> usize {
        let mut removed = 0;
        self.records.retain(|_, record| {
            let keep = record.is_current(now);
            if !keep {
                removed += 1;
            }
            keep
        });
        trace!(removed, remaining = self.records.len(), "Swept local window store");
        removed
    }

    /// Current records ordered by key. Expired records met during the listing
    /// are evicted.
    pub fn list_active(&self, now: u64) -> Vec<ActiveEntry> {
        let mut active = Vec::new();
        let mut expired = Vec::new();

        for entry in self.records.iter() {
            if entry.is_current(now) {
                active.push(ActiveEntry {
                    key: entry.key().clone(),
                    count: entry.count,
                    reset_at: entry.window_reset_at,
                });
            } else {
                expired.push(entry.key().clone());
            }
        }

        // Iteration holds shard read locks; evict only after it has finished.
        for key in expired {
            self.records
                .remove_if(&key, |_, record| !record.is_current(now));
        }

        active.sort_by(|a, b| a.key.cmp(&b.key));
        active
    }

    /// Number of stored records, stale ones included.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop every record.
    pub fn clear(&self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_get_hides_stale_record_without_removing_it() {
        let store = LocalWindowStore::new();
        store.put("k", WindowRecord::open(0, 100));

        assert!(store.get("k", 99).is_some());
        assert!(store.get("k", 100).is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let store = LocalWindowStore::new();
        store.put("k", WindowRecord::open(0, 100));

        assert!(store.delete("k"));
        assert!(!store.delete("k"));
        assert!(store.get("k", 0).is_none());
    }

    #[test]
    fn test_update_passes_stale_as_none() {
        let store = LocalWindowStore::new();
        store.put("k", WindowRecord { count: 7, window_reset_at: 50 });

        let seen = store.update("k", 50, |current| (None, current));
        assert_eq!(seen, None);

        let seen = store.update("k", 49, |current| (None, current));
        assert_eq!(seen.map(|r| r.count), Some(7));
    }

    #[test]
    fn test_update_none_leaves_entry_untouched() {
        let store = LocalWindowStore::new();
        store.update("k", 0, |_| (None, ()));
        assert!(store.is_empty());

        store.put("k", WindowRecord { count: 3, window_reset_at: 10 });
        store.update("k", 0, |_| (None, ()));
        assert_eq!(store.get("k", 0).map(|r| r.count), Some(3));
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let store = LocalWindowStore::new();
        store.put("old", WindowRecord::open(0, 100));
        store.put("edge", WindowRecord::open(0, 200));
        store.put("new", WindowRecord::open(0, 300));

        let removed = store.sweep(200);
        assert_eq!(removed, 2);
        assert_eq!(store.len(), 1);
        assert!(store.get("new", 200).is_some());
    }

    #[test]
    fn test_list_active_sorted_and_evicts_expired() {
        let store = LocalWindowStore::new();
        store.put("b", WindowRecord { count: 2, window_reset_at: 500 });
        store.put("a", WindowRecord { count: 1, window_reset_at: 500 });
        store.put("z", WindowRecord { count: 9, window_reset_at: 100 });

        let active = store.list_active(100);
        let keys: Vec<&str> = active.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert!(active.iter().all(|e| e.reset_at > 100));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_concurrent_updates_do_not_lose_increments() {
        let store = Arc::new(LocalWindowStore::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        store.update("shared", 0, |current| {
                            let next = current.unwrap_or(WindowRecord::open(0, 1_000)).incremented();
                            (Some(next), ())
                        });
                    }
                })
            })
            .collect();

        for handle in threads {
            handle.join().unwrap();
        }

        assert_eq!(store.get("shared", 0).map(|r| r.count), Some(8_000));
    }

    #[test]
    fn test_sweep_concurrent_with_refresh_keeps_fresh_records() {
        let store = Arc::new(LocalWindowStore::new());
        for i in 0..1_000 {
            store.put(&format!("k{i}"), WindowRecord::open(0, 10));
        }

        // Refresh every key into a window that is current at t=10 while sweeping.
        let refresher = {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..1_000 {
                    store.update(&format!("k{i}"), 10, |_| (Some(WindowRecord::open(10, 100)), ()));
                }
            })
        };
        store.sweep(10);
        refresher.join().unwrap();

        // Whatever the interleaving, every refreshed key must still be present.
        for i in 0..1_000 {
            let record = store.get(&format!("k{i}"), 10);
            assert_eq!(record.map(|r| r.window_reset_at), Some(110));
        }
        assert_eq!(store.len(), 1_000);
    }
}
