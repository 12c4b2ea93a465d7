//! Per-bridge token verification cache.
//!
//! # Purpose
//! Maps verified token strings to their claims so authenticated endpoints can
//! skip the verify path. A min-heap ordered by expiry pairs with the map; a
//! 1 Hz sweeper pops every due root and drops the matching entries. Entries
//! are immutable, so a duplicate `put` for the same token is harmless and a
//! stale heap root whose token was already removed is simply discarded.
use crate::Claims;
use plover_common::expiry::ExpiryHeap;
use plover_common::unix_now;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

struct Inner {
    entries: HashMap<String, Claims>,
    deadlines: ExpiryHeap<String>,
}

pub struct TokenCache {
    inner: Mutex<Inner>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                deadlines: ExpiryHeap::new(),
            }),
        }
    }

    pub fn put(&self, token: &str, claims: Claims) {
        let mut inner = self.inner.lock().expect("token cache lock");
        inner.deadlines.push(claims.expires_at(), token.to_string());
        inner.entries.insert(token.to_string(), claims);
    }

    /// Fetch cached claims, lazily dropping an entry that expired between
    /// sweeps.
    pub fn get(&self, token: &str) -> Option<Claims> {
        let mut inner = self.inner.lock().expect("token cache lock");
        match inner.entries.get(token) {
            Some(claims) if claims.expires_at() > unix_now() => Some(claims.clone()),
            Some(_) => {
                inner.entries.remove(token);
                None
            }
            None => None,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("token cache lock").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every entry whose expiry is at or before `now`. Returns how
    /// many entries were dropped.
    pub fn sweep(&self, now: i64) -> usize {
        let mut inner = self.inner.lock().expect("token cache lock");
        let mut removed = 0;
        while let Some(token) = inner.deadlines.pop_due(now) {
            // The heap may hold stale roots for tokens already replaced or
            // removed; only count entries that actually left the map.
            if let Some(claims) = inner.entries.get(&token) {
                if claims.expires_at() <= now {
                    inner.entries.remove(&token);
                    removed += 1;
                }
            }
        }
        removed
    }
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the 1 Hz sweeper for a shared cache. The task runs until aborted.
pub fn spawn_sweeper(cache: Arc<TokenCache>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            let removed = cache.sweep(unix_now());
            if removed > 0 {
                tracing::debug!(removed, "token cache sweep");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use plover_common::ChannelId;

    fn claims(user: &str, exp: i64) -> Claims {
        Claims {
            iss: "authority-1".to_string(),
            iat: exp - 600,
            exp: Some(exp),
            user_id: user.to_string(),
            channel_id: ChannelId(0),
        }
    }

    #[test]
    fn put_then_get_returns_same_claims() {
        let cache = TokenCache::new();
        let stored = claims("user-a", unix_now() + 600);
        cache.put("tok-a", stored.clone());
        assert_eq!(cache.get("tok-a"), Some(stored));
    }

    #[test]
    fn get_misses_unknown_token() {
        let cache = TokenCache::new();
        assert_eq!(cache.get("nope"), None);
    }

    #[test]
    fn sweep_drops_due_entries_only() {
        let now = unix_now();
        let cache = TokenCache::new();
        cache.put("old", claims("user-a", now - 1));
        cache.put("new", claims("user-b", now + 600));

        assert_eq!(cache.sweep(now), 1);
        assert_eq!(cache.get("old"), None);
        assert!(cache.get("new").is_some());
    }

    #[test]
    fn expired_entry_is_invisible_before_sweep() {
        let cache = TokenCache::new();
        cache.put("old", claims("user-a", unix_now() - 5));
        assert_eq!(cache.get("old"), None);
    }

    #[test]
    fn duplicate_put_is_harmless() {
        let now = unix_now();
        let cache = TokenCache::new();
        cache.put("tok", claims("user-a", now + 60));
        cache.put("tok", claims("user-a", now + 60));
        assert_eq!(cache.len(), 1);
        // Two heap roots, one map entry; the sweep only counts the real drop.
        assert_eq!(cache.sweep(now + 120), 1);
        assert!(cache.is_empty());
    }
}
