//! Read-through query cache in front of the search index.
//!
//! [`QueryCache::get_or_compute`] returns the cached result for a query if
//! one is present and unexpired, and otherwise computes it, stores it with
//! the configured TTL, and returns it. Results are stored serialized, so a
//! hit is byte-identical to the response that populated it.
//!
//! Eviction is TTL expiry plus a byte-weighted capacity bound (moka's
//! TinyLFU admission). Entries can be stale for up to one TTL after the
//! index changes.

use moka::sync::Cache;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::CacheConfig;
use crate::error::PipelineResult;

/// Cache key: SHA-256 over the normalized query text and limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct QueryFingerprint([u8; 32]);

impl QueryFingerprint {
    /// Queries that differ only in case or whitespace share a fingerprint.
    pub fn new(query: &str, limit: usize) -> Self {
        let normalized = query
            .split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" ");
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        hasher.update([0u8]);
        hasher.update((limit as u64).to_be_bytes());
        Self(hasher.finalize().into())
    }
}

impl std::fmt::Display for QueryFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

pub struct QueryCache {
    inner: Cache<QueryFingerprint, Arc<Vec<u8>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl QueryCache {
    pub fn new(ttl: Duration, max_bytes: u64) -> Self {
        let inner = Cache::builder()
            .max_capacity(max_bytes)
            .weigher(|_key: &QueryFingerprint, value: &Arc<Vec<u8>>| {
                value.len().min(u32::MAX as usize) as u32
            })
            .time_to_live(ttl)
            .build();
        Self {
            inner,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(Duration::from_secs(config.ttl_secs), config.max_bytes)
    }

    /// Return the cached bytes for `key`, or run `compute` and cache its output.
    ///
    /// Errors from `compute` are returned as-is and nothing is cached.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: QueryFingerprint,
        compute: F,
    ) -> PipelineResult<Arc<Vec<u8>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PipelineResult<Vec<u8>>>,
    {
        if let Some(value) = self.inner.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(key = %key, "cache hit");
            return Ok(value);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(key = %key, "cache miss");
        let value = Arc::new(compute().await?);
        self.inner.insert(key, value.clone());
        Ok(value)
    }

    pub fn get(&self, key: &QueryFingerprint) -> Option<Arc<Vec<u8>>> {
        self.inner.get(key)
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn entry_count(&self) -> u64 {
        self.inner.run_pending_tasks();
        self.inner.entry_count()
    }

    /// Total bytes held, after pending evictions are applied.
    pub fn weighted_size(&self) -> u64 {
        self.inner.run_pending_tasks();
        self.inner.weighted_size()
    }
}
