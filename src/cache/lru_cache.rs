//! Process-local LRU tier
//!
//! A byte-bounded LRU guarded by a single mutex. Entries larger than the
//! per-entry cap are not admitted.

use super::CacheInterface;
use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Snapshot of LRU occupancy and activity
#[derive(Debug, Clone, Default)]
pub struct LruCacheStats {
    pub entries: usize,
    pub bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub rejected: u64,
}

struct Inner {
    map: LruCache<String, Bytes>,
    current_bytes: usize,
}

/// Threadsafe byte-bounded LRU cache
pub struct ThreadsafeLruCache {
    inner: Mutex<Inner>,
    max_bytes: usize,
    max_entry_bytes: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    rejected: AtomicU64,
}

fn entry_size(key: &str, value: &Bytes) -> usize {
    key.len() + value.len()
}

impl ThreadsafeLruCache {
    /// Create a cache holding at most `max_bytes` of keys and values, and
    /// refusing entries whose value exceeds `max_entry_bytes`
    pub fn new(max_bytes: usize, max_entry_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: LruCache::unbounded(),
                current_bytes: 0,
            }),
            max_bytes,
            max_entry_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn get_stats(&self) -> LruCacheStats {
        let inner = self.inner.lock();
        LruCacheStats {
            entries: inner.map.len(),
            bytes: inner.current_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.current_bytes = 0;
    }

    fn get_sync(&self, key: &str) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        match inner.map.get(key) {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn put_sync(&self, key: &str, value: Bytes) {
        let size = entry_size(key, &value);
        let mut inner = self.inner.lock();

        if let Some(old) = inner.map.pop(key) {
            inner.current_bytes -= entry_size(key, &old);
        }
        if value.len() > self.max_entry_bytes || size > self.max_bytes {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            debug!("LRU rejected {} ({} bytes)", key, value.len());
            return;
        }

        while inner.current_bytes + size > self.max_bytes {
            match inner.map.pop_lru() {
                Some((evicted_key, evicted)) => {
                    inner.current_bytes -= entry_size(&evicted_key, &evicted);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }

        inner.map.put(key.to_string(), value);
        inner.current_bytes += size;
    }

    fn delete_sync(&self, key: &str) {
        let mut inner = self.inner.lock();
        if let Some(old) = inner.map.pop(key) {
            inner.current_bytes -= entry_size(key, &old);
        }
    }
}

#[async_trait]
impl CacheInterface for ThreadsafeLruCache {
    fn name(&self) -> &'static str {
        "lru"
    }

    async fn get(&self, key: &str) -> Option<Bytes> {
        self.get_sync(key)
    }

    async fn put(&self, key: &str, value: Bytes) {
        self.put_sync(key, value)
    }

    async fn delete(&self, key: &str) {
        self.delete_sync(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let cache = ThreadsafeLruCache::new(1024, 512);
        cache.put("a", Bytes::from_static(b"1")).await;
        assert_eq!(cache.get("a").await, Some(Bytes::from_static(b"1")));
        cache.delete("a").await;
        assert_eq!(cache.get("a").await, None);
        assert_eq!(cache.get_stats().bytes, 0);
    }

    #[tokio::test]
    async fn test_evicts_least_recently_used() {
        // Each entry is 1-byte key + 40-byte value
        let cache = ThreadsafeLruCache::new(100, 100);
        cache.put("a", Bytes::from(vec![0u8; 40])).await;
        cache.put("b", Bytes::from(vec![0u8; 40])).await;
        assert!(cache.get("a").await.is_some());
        cache.put("c", Bytes::from(vec![0u8; 40])).await;

        assert!(cache.get("a").await.is_some());
        assert!(cache.get("b").await.is_none());
        assert!(cache.get("c").await.is_some());
        let stats = cache.get_stats();
        assert_eq!(stats.evictions, 1);
        assert!(stats.bytes <= 100);
    }

    #[tokio::test]
    async fn test_rejects_oversize_entries() {
        let cache = ThreadsafeLruCache::new(1024, 8);
        cache.put("big", Bytes::from(vec![1u8; 9])).await;
        assert!(cache.get("big").await.is_none());
        assert_eq!(cache.get_stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_replacing_value_updates_size() {
        let cache = ThreadsafeLruCache::new(1024, 512);
        cache.put("k", Bytes::from(vec![0u8; 100])).await;
        cache.put("k", Bytes::from(vec![0u8; 10])).await;
        assert_eq!(cache.get_stats().bytes, 11);
        assert_eq!(cache.get_stats().entries, 1);
    }
}
