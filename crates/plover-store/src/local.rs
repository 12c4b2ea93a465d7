//! In-process TTL mirror: hash map for lookup, expiry heap for eviction.
use crate::Expiring;
use plover_common::expiry::ExpiryHeap;
use std::collections::HashMap;
use std::sync::Mutex;

struct Inner<T> {
    entries: HashMap<String, T>,
    deadlines: ExpiryHeap<String>,
}

/// Local half of the storage facade. Every facade operation touches this
/// first; the remote store behind it is best-effort.
pub struct LocalStore<T: Expiring> {
    inner: Mutex<Inner<T>>,
}

impl<T: Expiring> LocalStore<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                deadlines: ExpiryHeap::new(),
            }),
        }
    }

    pub fn set(&self, record: T) {
        let mut inner = self.inner.lock().expect("local store lock");
        inner.deadlines.push(record.expires_at(), record.key());
        inner.entries.insert(record.key(), record);
    }

    pub fn get(&self, key: &str, now: i64) -> Option<T> {
        let mut inner = self.inner.lock().expect("local store lock");
        match inner.entries.get(key) {
            Some(record) if record.expires_at() > now => Some(record.clone()),
            Some(_) => {
                // Lazy-expire on read; the sweeper will discard the stale root.
                inner.entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn exists(&self, key: &str, now: i64) -> bool {
        self.get(key, now).is_some()
    }

    pub fn remove(&self, key: &str) -> Option<T> {
        self.inner
            .lock()
            .expect("local store lock")
            .entries
            .remove(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("local store lock").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pop every due heap root and drop entries that really expired. Stale
    /// roots for rewritten or removed keys are discarded without effect.
    pub fn sweep(&self, now: i64) -> usize {
        let mut inner = self.inner.lock().expect("local store lock");
        let mut removed = 0;
        while let Some(key) = inner.deadlines.pop_due(now) {
            if let Some(record) = inner.entries.get(&key) {
                if record.expires_at() <= now {
                    inner.entries.remove(&key);
                    removed += 1;
                }
            }
        }
        removed
    }
}

impl<T: Expiring> Default for LocalStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Record {
        key: String,
        expires_at: i64,
    }

    impl Expiring for Record {
        fn key(&self) -> String {
            self.key.clone()
        }

        fn expires_at(&self) -> i64 {
            self.expires_at
        }
    }

    fn record(key: &str, expires_at: i64) -> Record {
        Record {
            key: key.to_string(),
            expires_at,
        }
    }

    #[test]
    fn set_get_remove_round_trip() {
        let store = LocalStore::new();
        store.set(record("a", 100));
        assert_eq!(store.get("a", 50), Some(record("a", 100)));
        assert!(store.exists("a", 50));
        assert_eq!(store.remove("a"), Some(record("a", 100)));
        assert!(!store.exists("a", 50));
    }

    #[test]
    fn expired_records_vanish_on_read() {
        let store = LocalStore::new();
        store.set(record("a", 100));
        assert_eq!(store.get("a", 100), None);
        assert!(store.is_empty());
    }

    #[test]
    fn sweep_drops_only_due_records() {
        let store = LocalStore::new();
        store.set(record("old", 10));
        store.set(record("new", 1000));
        assert_eq!(store.sweep(10), 1);
        assert_eq!(store.len(), 1);
        assert!(store.exists("new", 10));
    }

    #[test]
    fn rewrite_extends_lifetime_past_stale_heap_root() {
        let store = LocalStore::new();
        store.set(record("a", 10));
        store.set(record("a", 1000));
        // The first deadline is due but the rewritten record is not.
        assert_eq!(store.sweep(10), 0);
        assert!(store.exists("a", 10));
    }
}
