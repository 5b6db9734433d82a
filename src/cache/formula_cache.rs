use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use lru::LruCache;
use parking_lot::RwLock;
use crate::cache::payload::{CacheKey, CachePayloadHeader};

/// Content-addressed memoization cache for computed formula artifacts.
///
/// Correctness of hit and miss is the only guarantee here: a hit means
/// the artifact was computed from a formula with the same structural hash
/// over producers at the same committed versions. No explicit
/// invalidation exists; a mutated producer changes the live dependency
/// hash, so lookups for fresh results simply stop matching stale entries.
/// Retention beyond the LRU capacity bound is the caller's policy.
pub struct FormulaCache {
    cache: RwLock<LruCache<CacheKey, CachePayloadHeader>>,
    capacity: usize,
    hit_count: AtomicUsize,
    miss_count: AtomicUsize,
}

impl FormulaCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        FormulaCache {
            cache: RwLock::new(LruCache::new(cap)),
            capacity: capacity.max(1),
            hit_count: AtomicUsize::new(0),
            miss_count: AtomicUsize::new(0),
        }
    }

    /// Definitive hit or miss. A miss is normal control flow and means
    /// the caller computes and then stores.
    pub fn lookup(&self, structural: u64, dependency: u64) -> Option<CachePayloadHeader> {
        let key = CacheKey {
            structural,
            dependency,
        };
        let mut cache = self.cache.write();
        if let Some(header) = cache.get(&key) {
            self.hit_count.fetch_add(1, Ordering::Relaxed);
            Some(header.clone())
        } else {
            self.miss_count.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    pub fn store(&self, header: CachePayloadHeader) {
        let key = header.key();
        self.cache.write().put(key, header);
    }

    /// Garbage-collection sweep: drop entries whose owning formulas (by
    /// structural hash) are no longer referenced anywhere. Returns the
    /// number of evicted entries.
    pub fn sweep(&self, live_structural_hashes: &HashSet<u64>) -> usize {
        let mut cache = self.cache.write();
        let stale: Vec<CacheKey> = cache
            .iter()
            .filter(|(key, _)| !live_structural_hashes.contains(&key.structural))
            .map(|(key, _)| *key)
            .collect();
        let evicted = stale.len();
        for key in stale {
            cache.pop(&key);
        }
        evicted
    }

    pub fn clear(&self) {
        self.cache.write().clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hit_count: self.hit_count.load(Ordering::Relaxed),
            miss_count: self.miss_count.load(Ordering::Relaxed),
            size: self.cache.read().len(),
            capacity: self.capacity,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheStats {
    pub hit_count: usize,
    pub miss_count: usize,
    pub size: usize,
    pub capacity: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hit_count + self.miss_count;
        if total == 0 {
            0.0
        } else {
            self.hit_count as f64 / total as f64
        }
    }
}
