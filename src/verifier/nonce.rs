//! Replay-defense nonce cache with SETNX-with-TTL semantics.
//!
//! The only operation exposed to verification is the atomic first-wins
//! insert: the shard lock held by the `DashMap` entry API makes the
//! check-and-set a single critical section, so two concurrent verifications
//! of the same nonce cannot both win. A background reaper evicts expired
//! entries to bound memory.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use sha2::{Digest, Sha256};

/// Shared nonce cache.
#[derive(Debug, Default)]
pub struct NonceCache {
    entries: DashMap<String, Instant>,
}

impl NonceCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Atomically record `nonce` for `ttl`.
    ///
    /// Returns `true` when this call inserted the nonce (first use), `false`
    /// when a live entry already exists (replay). An expired entry is
    /// overwritten and counts as a fresh insert.
    pub fn try_insert(&self, nonce: &str, ttl: Duration) -> bool {
        let expires = Instant::now() + ttl;
        match self.entries.entry(nonce.to_string()) {
            Entry::Occupied(mut occupied) => {
                if *occupied.get() <= Instant::now() {
                    occupied.insert(expires);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(expires);
                true
            }
        }
    }

    /// Remove all entries. Admin purge.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Current entry count, expired entries included until the next sweep.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop expired entries; returns how many were evicted.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, expires| *expires > now);
        before - self.entries.len()
    }

    /// Spawn the periodic reaper; stops when `shutdown` fires.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = cache.evict_expired();
                        if evicted > 0 {
                            tracing::debug!(evicted, "Nonce cache sweep");
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        });
    }
}

/// Short digest of a nonce for logs. Raw nonces are never logged.
#[must_use]
pub fn hashed_nonce(nonce: &str) -> String {
    let digest = Sha256::digest(nonce.as_bytes());
    hex::encode(&digest[..6])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_insert_wins() {
        let cache = NonceCache::new();
        assert!(cache.try_insert("abc", Duration::from_secs(60)));
        assert!(!cache.try_insert("abc", Duration::from_secs(60)));
    }

    #[test]
    fn distinct_nonces_are_independent() {
        let cache = NonceCache::new();
        assert!(cache.try_insert("a", Duration::from_secs(60)));
        assert!(cache.try_insert("b", Duration::from_secs(60)));
    }

    #[test]
    fn expired_entry_can_be_reinserted() {
        let cache = NonceCache::new();
        assert!(cache.try_insert("abc", Duration::from_millis(1)));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.try_insert("abc", Duration::from_secs(60)));
    }

    #[test]
    fn concurrent_inserts_admit_exactly_one() {
        let cache = Arc::new(NonceCache::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(std::thread::spawn(move || {
                cache.try_insert("same-nonce", Duration::from_secs(60))
            }));
        }
        let wins = handles
            .into_iter()
            .map(|h| h.join().expect("thread panicked"))
            .filter(|won| *won)
            .count();

        assert_eq!(wins, 1);
    }

    #[test]
    fn evict_expired_removes_only_dead_entries() {
        let cache = NonceCache::new();
        cache.try_insert("short", Duration::from_millis(1));
        cache.try_insert("long", Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(cache.evict_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn clear_empties_the_cache() {
        let cache = NonceCache::new();
        cache.try_insert("a", Duration::from_secs(60));
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn hashed_nonce_is_short_and_not_the_raw_value() {
        let h = hashed_nonce("super-secret-nonce");
        assert_eq!(h.len(), 12);
        assert!(!h.contains("secret"));
    }
}
