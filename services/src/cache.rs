use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::debug;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
}

#[derive(Debug, Clone)]
pub struct CacheHit {
    pub value: Value,
    pub freshness: Freshness,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    fresh_until: Instant,
    stale_until: Instant,
    created_at: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheUtilization {
    pub entries: usize,
    pub capacity: usize,
}

/// Bounded TTL cache with fresh/stale bands. Stale values are only handed
/// out when the caller opts in (after an upstream failure); expired entries
/// are dropped lazily on access and by the periodic sweep.
#[derive(Debug)]
pub struct ResponseCache {
    capacity: usize,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ResponseCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str, accept_stale: bool) -> Option<CacheHit> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        let entry = entries.get(key)?;
        if now <= entry.fresh_until {
            return Some(CacheHit {
                value: entry.value.clone(),
                freshness: Freshness::Fresh,
            });
        }
        if now <= entry.stale_until {
            if accept_stale {
                return Some(CacheHit {
                    value: entry.value.clone(),
                    freshness: Freshness::Stale,
                });
            }
            return None;
        }
        entries.remove(key);
        None
    }

    pub fn set(&self, key: &str, value: Value, fresh_ttl: Duration, stale_ttl: Duration) {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        // FIFO eviction: drop oldest-by-creation until there is room.
        while !entries.contains_key(key) && entries.len() >= self.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.created_at)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    debug!("Cache at capacity, evicting oldest entry {}", k);
                    entries.remove(&k);
                }
                None => break,
            }
        }
        entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                fresh_until: now + fresh_ttl,
                stale_until: now + fresh_ttl + stale_ttl,
                created_at: now,
            },
        );
    }

    /// Drop every entry past its stale horizon.
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, e| now <= e.stale_until);
        before - entries.len()
    }

    pub fn utilization(&self) -> CacheUtilization {
        CacheUtilization {
            entries: self.entries.lock().len(),
            capacity: self.capacity,
        }
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fresh_then_stale_then_expired() {
        let cache = ResponseCache::new(10);
        cache.set(
            "k",
            json!([1, 2, 3]),
            Duration::from_millis(20),
            Duration::from_millis(20),
        );

        let hit = cache.get("k", false).unwrap();
        assert_eq!(hit.freshness, Freshness::Fresh);

        std::thread::sleep(Duration::from_millis(25));
        // Stale band: only served on request.
        assert!(cache.get("k", false).is_none());
        let hit = cache.get("k", true).unwrap();
        assert_eq!(hit.freshness, Freshness::Stale);

        std::thread::sleep(Duration::from_millis(25));
        assert!(cache.get("k", true).is_none());
        assert_eq!(cache.utilization().entries, 0);
    }

    #[test]
    fn test_fifo_eviction_at_capacity() {
        let cache = ResponseCache::new(3);
        for i in 0..3 {
            cache.set(
                &format!("k{}", i),
                json!(i),
                Duration::from_secs(60),
                Duration::from_secs(60),
            );
            // Distinct creation order on coarse clocks.
            std::thread::sleep(Duration::from_millis(2));
        }
        cache.set(
            "k3",
            json!(3),
            Duration::from_secs(60),
            Duration::from_secs(60),
        );

        assert!(cache.get("k0", false).is_none());
        assert!(cache.get("k1", false).is_some());
        assert!(cache.get("k3", false).is_some());
        assert_eq!(cache.utilization().entries, 3);
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let cache = ResponseCache::new(2);
        cache.set("a", json!(1), Duration::from_secs(60), Duration::from_secs(60));
        cache.set("b", json!(2), Duration::from_secs(60), Duration::from_secs(60));
        cache.set("a", json!(3), Duration::from_secs(60), Duration::from_secs(60));
        assert_eq!(cache.utilization().entries, 2);
        assert_eq!(cache.get("a", false).unwrap().value, json!(3));
        assert!(cache.get("b", false).is_some());
    }

    #[test]
    fn test_sweep_drops_expired_only() {
        let cache = ResponseCache::new(10);
        cache.set("gone", json!(1), Duration::from_millis(5), Duration::from_millis(5));
        cache.set("kept", json!(2), Duration::from_secs(60), Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.utilization().entries, 1);
        assert!(cache.get("kept", false).is_some());
    }
}
