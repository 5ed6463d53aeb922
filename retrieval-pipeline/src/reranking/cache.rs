use std::{
    collections::HashMap,
    fmt::Write as _,
    num::NonZeroUsize,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use lru::LruCache;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

/// Bounded LRU cache of rerank scores with per-entry TTL. Keyed on a
/// fingerprint of (query, sorted candidate ids) — sound because chunk content
/// is immutable per chunk id; re-ingestion overwrites with identical content.
pub struct RerankCache {
    inner: Mutex<LruCache<String, CacheEntry>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

struct CacheEntry {
    scores: HashMap<String, f32>,
    inserted_at: Instant,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct RerankCacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

impl RerankCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(max_entries.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Deterministic key over the query text and the candidate set, order of
    /// the ids irrelevant.
    pub fn fingerprint(query: &str, chunk_ids: &[String]) -> String {
        let mut sorted: Vec<&String> = chunk_ids.iter().collect();
        sorted.sort();

        let mut hasher = Sha256::new();
        hasher.update(query.as_bytes());
        hasher.update([0u8]);
        for id in sorted {
            hasher.update(id.as_bytes());
            hasher.update([0u8]);
        }

        let digest = hasher.finalize();
        let mut out = String::with_capacity(digest.len() * 2);
        for byte in digest {
            let _ = write!(out, "{byte:02x}");
        }
        out
    }

    /// Fetch cached scores, evicting the entry when its TTL has passed.
    pub async fn get(&self, fingerprint: &str) -> Option<HashMap<String, f32>> {
        let mut cache = self.inner.lock().await;
        if let Some(entry) = cache.get(fingerprint) {
            if entry.inserted_at.elapsed() <= self.ttl {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.scores.clone());
            }
            cache.pop(fingerprint);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert scores; the least-recently-used entry falls out at capacity.
    pub async fn insert(&self, fingerprint: String, scores: HashMap<String, f32>) {
        let mut cache = self.inner.lock().await;
        cache.put(
            fingerprint,
            CacheEntry {
                scores,
                inserted_at: Instant::now(),
            },
        );
    }

    pub async fn stats(&self) -> RerankCacheStats {
        let entries = self.inner.lock().await.len();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            hits as f64 / lookups as f64
        };

        RerankCacheStats {
            entries,
            hits,
            misses,
            hit_rate,
        }
    }
}
