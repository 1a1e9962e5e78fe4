//! Time-bounded read cache

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Entries expire `ttl` after insertion. A zero TTL disables caching.
pub struct TtlCache<K, V> {
    entries: DashMap<K, (Instant, V)>,
    ttl_ms: AtomicU64,
}

impl<K: Eq + Hash, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl_ms: AtomicU64::new(millis(ttl)),
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms.load(Ordering::Relaxed))
    }

    /// Change the TTL. Existing entries are judged against the new value;
    /// a zero TTL drops them all.
    pub fn set_ttl(&self, ttl: Duration) {
        let ms = millis(ttl);
        if self.ttl_ms.swap(ms, Ordering::Relaxed) != ms && ms == 0 {
            self.entries.clear();
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let ttl = self.ttl();
        if ttl.is_zero() {
            return None;
        }
        let fresh = {
            let entry = self.entries.get(key)?;
            let (at, value) = entry.value();
            (at.elapsed() < ttl).then(|| value.clone())
        };
        if fresh.is_none() {
            self.entries.remove(key);
        }
        fresh
    }

    pub fn insert(&self, key: K, value: V) {
        if self.ttl().is_zero() {
            return;
        }
        self.entries.insert(key, (Instant::now(), value));
    }

    pub fn invalidate(&self, key: &K) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
