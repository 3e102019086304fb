//! Multi-tier cache
//!
//! The stack composes, front to back:
//! - a process-local LRU ([`lru_cache::ThreadsafeLruCache`])
//! - an L2 tier (memcached or shared memory) wrapped in a
//!   [`fallback::FallbackCache`] that stores oversize values as a sentinel
//!   plus a body in the file tier
//! - the on-disk [`file::FileCache`]
//!
//! Every stored value is wrapped in a [`CacheEntry`] envelope carrying the
//! validity token used for flush-file invalidation.

pub mod compression;
pub mod fallback;
pub mod file;
pub mod lru_cache;
pub mod memcached;
pub mod shm;

use crate::invalidation::InvalidationClock;
use crate::stats::RewriteStats;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// A single cache tier
///
/// Failures are absorbed by the tier: a broken backend reports misses for
/// gets and drops puts.
#[async_trait]
pub trait CacheInterface: Send + Sync {
    /// Short tier name used in logs and statistics
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Option<Bytes>;

    async fn put(&self, key: &str, value: Bytes);

    async fn delete(&self, key: &str);

    fn is_healthy(&self) -> bool {
        true
    }

    /// The tier a put of `value_len` bytes also writes, if any
    fn spills_to(&self, _value_len: usize) -> Option<&Arc<dyn CacheInterface>> {
        None
    }
}

fn tier_addr(tier: &Arc<dyn CacheInterface>) -> usize {
    Arc::as_ptr(tier) as *const () as usize
}

/// Put `raw` into each of `tiers` once, skipping tiers already in `written`
/// and tiers whose spill target already holds the value
async fn write_tiers(tiers: &[Arc<dyn CacheInterface>], key: &str, raw: &Bytes, mut written: Vec<usize>) {
    for tier in tiers {
        let spill = tier.spills_to(raw.len()).map(tier_addr);
        if written.contains(&tier_addr(tier)) || spill.is_some_and(|addr| written.contains(&addr)) {
            continue;
        }
        tier.put(key, raw.clone()).await;
        written.extend(spill);
    }
}

/// Milliseconds since the Unix epoch
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Metadata stored alongside every value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMeta {
    pub created_ms: i64,
    pub cache_control: Option<String>,
    /// Invalidation timestamp in effect when the entry was written
    pub validity_token: i64,
}

/// Envelope written to every tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub meta: EntryMeta,
    pub payload: Vec<u8>,
}

impl CacheEntry {
    pub fn encode(&self) -> Option<Bytes> {
        match bincode::serialize(self) {
            Ok(bytes) => Some(Bytes::from(bytes)),
            Err(e) => {
                warn!("Failed to encode cache entry: {}", e);
                None
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        bincode::deserialize(bytes).ok()
    }

    /// Valid iff the token is not older than `threshold`
    pub fn is_valid(&self, threshold: i64) -> bool {
        self.meta.validity_token >= threshold
    }
}

/// Composition of tiers with write-through puts and back-filling gets
pub struct CacheStack {
    tiers: Vec<Arc<dyn CacheInterface>>,
    clock: Arc<InvalidationClock>,
    stats: Option<Arc<RewriteStats>>,
}

impl CacheStack {
    /// Build a stack from tiers ordered front to back
    pub fn new(tiers: Vec<Arc<dyn CacheInterface>>, clock: Arc<InvalidationClock>) -> Self {
        Self {
            tiers,
            clock,
            stats: None,
        }
    }

    pub fn with_stats(mut self, stats: Arc<RewriteStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn clock(&self) -> &Arc<InvalidationClock> {
        &self.clock
    }

    pub fn tiers(&self) -> &[Arc<dyn CacheInterface>] {
        &self.tiers
    }

    /// Look up `key`, treating entries older than `min_validity` (or the
    /// clock, whichever is newer) as misses
    pub async fn lookup(&self, key: &str, min_validity: i64) -> Option<CacheEntry> {
        let threshold = self.clock.current().max(min_validity);

        for (level, tier) in self.tiers.iter().enumerate() {
            let Some(raw) = tier.get(key).await else {
                continue;
            };
            let Some(entry) = CacheEntry::decode(&raw) else {
                warn!("Corrupt entry in {} for {}, ignoring", tier.name(), key);
                continue;
            };
            if !entry.is_valid(threshold) {
                debug!(
                    "Stale entry in {} for {} (token {} < {})",
                    tier.name(),
                    key,
                    entry.meta.validity_token,
                    threshold
                );
                if let Some(stats) = &self.stats {
                    stats.record_cache_stale(tier.name());
                }
                continue;
            }

            if let Some(stats) = &self.stats {
                stats.record_cache_hit(tier.name());
            }
            write_tiers(&self.tiers[..level], key, &raw, vec![tier_addr(tier)]).await;
            return Some(entry);
        }

        if let Some(stats) = &self.stats {
            stats.record_cache_miss();
        }
        None
    }

    /// Look up `key` against the current clock only
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        self.lookup(key, i64::MIN).await
    }

    /// Payload convenience for callers that do not need metadata
    pub async fn get_value(&self, key: &str) -> Option<Vec<u8>> {
        self.get(key).await.map(|entry| entry.payload)
    }

    /// Write `payload` through every tier, once per tier
    ///
    /// The validity token is the newer of the clock and `validity_token`.
    pub async fn put(
        &self,
        key: &str,
        payload: Vec<u8>,
        cache_control: Option<String>,
        validity_token: i64,
    ) {
        let entry = CacheEntry {
            meta: EntryMeta {
                created_ms: now_ms(),
                cache_control,
                validity_token: self.clock.current().max(validity_token),
            },
            payload,
        };
        let Some(raw) = entry.encode() else {
            return;
        };
        write_tiers(&self.tiers, key, &raw, Vec::new()).await;
        if let Some(stats) = &self.stats {
            stats.record_cache_insert();
        }
    }

    pub async fn put_value(&self, key: &str, payload: Vec<u8>) {
        self.put(key, payload, None, i64::MIN).await;
    }

    pub async fn delete(&self, key: &str) {
        for tier in &self.tiers {
            tier.delete(key).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::lru_cache::ThreadsafeLruCache;
    use super::*;

    fn stack_with(tiers: Vec<Arc<dyn CacheInterface>>) -> (CacheStack, Arc<InvalidationClock>) {
        let clock = Arc::new(InvalidationClock::new(0));
        (CacheStack::new(tiers, clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_read_your_writes() {
        let (stack, _) = stack_with(vec![Arc::new(ThreadsafeLruCache::new(1024 * 1024, 64 * 1024))]);
        stack.put_value("k", b"v".to_vec()).await;
        assert_eq!(stack.get_value("k").await, Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn test_hit_backfills_higher_tiers() {
        let front = Arc::new(ThreadsafeLruCache::new(1024 * 1024, 64 * 1024));
        let back = Arc::new(ThreadsafeLruCache::new(1024 * 1024, 64 * 1024));
        let (stack, _) = stack_with(vec![front.clone(), back.clone()]);

        let entry = CacheEntry {
            meta: EntryMeta {
                created_ms: 0,
                cache_control: None,
                validity_token: 0,
            },
            payload: b"deep".to_vec(),
        };
        back.put("k", entry.encode().unwrap()).await;
        assert!(front.get("k").await.is_none());

        assert_eq!(stack.get_value("k").await, Some(b"deep".to_vec()));
        assert!(front.get("k").await.is_some());
    }

    struct CountingTier {
        inner: ThreadsafeLruCache,
        puts: std::sync::atomic::AtomicUsize,
    }

    impl CountingTier {
        fn new() -> Self {
            Self {
                inner: ThreadsafeLruCache::new(1024 * 1024, 1024 * 1024),
                puts: Default::default(),
            }
        }

        fn puts(&self) -> usize {
            self.puts.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CacheInterface for CountingTier {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn get(&self, key: &str) -> Option<Bytes> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: Bytes) {
            self.puts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.inner.put(key, value).await;
        }

        async fn delete(&self, key: &str) {
            self.inner.delete(key).await;
        }
    }

    fn fallback_stack() -> (CacheStack, Arc<CountingTier>) {
        let file = Arc::new(CountingTier::new());
        let file_tier: Arc<dyn CacheInterface> = file.clone();
        let l2 = Arc::new(ThreadsafeLruCache::new(1024 * 1024, 1024 * 1024));
        let fallback = fallback::FallbackCache::new(l2, file_tier.clone(), 64, 1024 * 1024);
        let (stack, _) = stack_with(vec![
            Arc::new(ThreadsafeLruCache::new(1024 * 1024, 1024 * 1024)),
            Arc::new(fallback),
            file_tier,
        ]);
        (stack, file)
    }

    #[tokio::test]
    async fn test_oversize_value_written_to_file_tier_once() {
        let (stack, file) = fallback_stack();
        stack.put_value("big", vec![9u8; 1000]).await;
        assert_eq!(file.puts(), 1);
        assert_eq!(stack.get_value("big").await, Some(vec![9u8; 1000]));

        stack.put_value("small", b"x".to_vec()).await;
        assert_eq!(file.puts(), 2);
        assert_eq!(stack.get_value("small").await, Some(b"x".to_vec()));
    }

    #[tokio::test]
    async fn test_backfill_does_not_rewrite_source_tier() {
        let (stack, file) = fallback_stack();
        let entry = CacheEntry {
            meta: EntryMeta {
                created_ms: 0,
                cache_control: None,
                validity_token: 0,
            },
            payload: vec![3u8; 1000],
        };
        file.put("deep", entry.encode().unwrap()).await;
        assert_eq!(file.puts(), 1);

        assert_eq!(stack.get_value("deep").await, Some(vec![3u8; 1000]));
        assert_eq!(file.puts(), 1);
        assert!(stack.tiers()[0].get("deep").await.is_some());
    }

    #[tokio::test]
    async fn test_stale_token_is_miss() {
        let (stack, clock) = stack_with(vec![Arc::new(ThreadsafeLruCache::new(1024 * 1024, 64 * 1024))]);
        stack.put_value("k", b"v".to_vec()).await;
        assert!(clock.advance_to(10));
        assert_eq!(stack.get_value("k").await, None);

        stack.put_value("k", b"v2".to_vec()).await;
        assert_eq!(stack.get_value("k").await, Some(b"v2".to_vec()));
    }

    #[tokio::test]
    async fn test_lookup_with_caller_threshold() {
        let (stack, _) = stack_with(vec![Arc::new(ThreadsafeLruCache::new(1024 * 1024, 64 * 1024))]);
        stack.put("k", b"v".to_vec(), None, 5).await;
        assert!(stack.lookup("k", 5).await.is_some());
        assert!(stack.lookup("k", 6).await.is_none());
    }

    #[tokio::test]
    async fn test_delete_removes_from_all_tiers() {
        let front = Arc::new(ThreadsafeLruCache::new(1024 * 1024, 64 * 1024));
        let back = Arc::new(ThreadsafeLruCache::new(1024 * 1024, 64 * 1024));
        let (stack, _) = stack_with(vec![front.clone(), back.clone()]);
        stack.put_value("k", b"v".to_vec()).await;
        stack.delete("k").await;
        assert!(front.get("k").await.is_none());
        assert!(back.get("k").await.is_none());
        assert!(stack.get("k").await.is_none());
    }
}
