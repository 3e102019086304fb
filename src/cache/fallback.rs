//! Oversize fallback encoding for the L2 tier
//!
//! Values up to the L2 ceiling are stored inline in L2. Larger values (up to
//! an absolute ceiling) are written to the fallback tier and L2 receives a
//! fixed-size sentinel naming the value's fingerprint and length. Callers
//! never see a sentinel: a get either reconstructs the value from the
//! fallback tier or reports a miss.
//!
//! Deletes remove the L2 record only. An orphaned fallback body is aged out
//! by the file cache janitor.

use super::CacheInterface;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_128;

const INLINE_TAG: u8 = 0;
const SENTINEL_TAG: u8 = 1;
const SENTINEL_LEN: usize = 1 + 16 + 8;

/// Default L2 per-value ceiling: 1 MiB less headroom for memcached item overhead
pub const DEFAULT_L2_VALUE_CEILING: usize = 1024 * 1024 - 64 * 1024;

/// Default absolute ceiling for fallback-encoded values
pub const DEFAULT_FALLBACK_CEILING: usize = 64 * 1024 * 1024;

/// Largest raw record written to L2 for `l2_ceiling`: an inline value of
/// exactly the ceiling plus its tag byte, or a sentinel
pub fn l2_record_capacity(l2_ceiling: usize) -> usize {
    (l2_ceiling + 1).max(SENTINEL_LEN)
}

#[derive(Debug, PartialEq, Eq)]
enum L2Record<'a> {
    Inline(&'a [u8]),
    Sentinel { fingerprint: u128, len: u64 },
}

fn encode_inline(value: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + value.len());
    buf.put_u8(INLINE_TAG);
    buf.put_slice(value);
    buf.freeze()
}

fn encode_sentinel(value: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(SENTINEL_LEN);
    buf.put_u8(SENTINEL_TAG);
    buf.put_u128_le(xxh3_128(value));
    buf.put_u64_le(value.len() as u64);
    buf.freeze()
}

fn decode_record(raw: &[u8]) -> Option<L2Record<'_>> {
    let (&tag, rest) = raw.split_first()?;
    match tag {
        INLINE_TAG => Some(L2Record::Inline(rest)),
        SENTINEL_TAG if raw.len() == SENTINEL_LEN => {
            let fingerprint = u128::from_le_bytes(rest[0..16].try_into().ok()?);
            let len = u64::from_le_bytes(rest[16..24].try_into().ok()?);
            Some(L2Record::Sentinel { fingerprint, len })
        }
        _ => None,
    }
}

/// L2 wrapper implementing the sentinel scheme
pub struct FallbackCache {
    l2: Arc<dyn CacheInterface>,
    fallback: Arc<dyn CacheInterface>,
    l2_ceiling: usize,
    fallback_ceiling: usize,
}

impl FallbackCache {
    /// # Arguments
    /// * `l2` - the small-value tier (memcached or shared memory)
    /// * `fallback` - tier receiving oversize bodies, normally the file cache
    /// * `l2_ceiling` - largest value stored inline in `l2`
    /// * `fallback_ceiling` - larger values are dropped
    pub fn new(
        l2: Arc<dyn CacheInterface>,
        fallback: Arc<dyn CacheInterface>,
        l2_ceiling: usize,
        fallback_ceiling: usize,
    ) -> Self {
        Self {
            l2,
            fallback,
            l2_ceiling,
            fallback_ceiling,
        }
    }

    pub fn l2_ceiling(&self) -> usize {
        self.l2_ceiling
    }

    async fn get_fallback_body(&self, key: &str, fingerprint: u128, len: u64) -> Option<Bytes> {
        let body = self.fallback.get(key).await?;
        if body.len() as u64 != len || xxh3_128(&body) != fingerprint {
            debug!("Fallback body for {} does not match sentinel", key);
            return None;
        }
        Some(body)
    }
}

#[async_trait]
impl CacheInterface for FallbackCache {
    fn name(&self) -> &'static str {
        self.l2.name()
    }

    async fn get(&self, key: &str) -> Option<Bytes> {
        if !self.l2.is_healthy() {
            return self.fallback.get(key).await;
        }

        let raw = self.l2.get(key).await?;
        match decode_record(&raw) {
            Some(L2Record::Inline(value)) => Some(raw.slice_ref(value)),
            Some(L2Record::Sentinel { fingerprint, len }) => {
                self.get_fallback_body(key, fingerprint, len).await
            }
            None => {
                warn!("Unrecognized L2 record for {}", key);
                None
            }
        }
    }

    async fn put(&self, key: &str, value: Bytes) {
        if value.len() > self.fallback_ceiling {
            warn!(
                "Dropping cache write for {}: {} bytes exceeds {}",
                key,
                value.len(),
                self.fallback_ceiling
            );
            return;
        }
        if value.len() <= self.l2_ceiling {
            self.l2.put(key, encode_inline(&value)).await;
            return;
        }

        debug!(
            "Fallback-encoding {} ({} bytes > {})",
            key,
            value.len(),
            self.l2_ceiling
        );
        let sentinel = encode_sentinel(&value);
        self.fallback.put(key, value).await;
        self.l2.put(key, sentinel).await;
    }

    async fn delete(&self, key: &str) {
        self.l2.delete(key).await;
    }

    fn is_healthy(&self) -> bool {
        self.l2.is_healthy()
    }

    fn spills_to(&self, value_len: usize) -> Option<&Arc<dyn CacheInterface>> {
        (value_len > self.l2_ceiling && value_len <= self.fallback_ceiling).then_some(&self.fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::lru_cache::ThreadsafeLruCache;

    fn layers(ceiling: usize) -> (FallbackCache, Arc<ThreadsafeLruCache>, Arc<ThreadsafeLruCache>) {
        let l2 = Arc::new(ThreadsafeLruCache::new(1 << 20, 1 << 20));
        let file = Arc::new(ThreadsafeLruCache::new(1 << 20, 1 << 20));
        let cache = FallbackCache::new(l2.clone(), file.clone(), ceiling, 4096);
        (cache, l2, file)
    }

    #[tokio::test]
    async fn test_exactly_ceiling_is_inline() {
        let (cache, l2, file) = layers(100);
        cache.put("k", Bytes::from(vec![1u8; 100])).await;
        assert!(file.get("k").await.is_none());
        assert_eq!(l2.get("k").await.unwrap().len(), 101);
        assert_eq!(cache.get("k").await, Some(Bytes::from(vec![1u8; 100])));
    }

    #[tokio::test]
    async fn test_exactly_ceiling_fits_shm_l2() {
        use crate::cache::shm::{ShmCache, ShmCacheConfig};

        let ceiling = 1000;
        let shm = Arc::new(
            ShmCache::new(ShmCacheConfig {
                size_bytes: 64 * 1024,
                block_size: 256,
                max_value_bytes: l2_record_capacity(ceiling),
            })
            .unwrap(),
        );
        let file = Arc::new(ThreadsafeLruCache::new(1 << 20, 1 << 20));
        let cache = FallbackCache::new(shm.clone(), file.clone(), ceiling, 1 << 20);

        let value = Bytes::from(vec![5u8; ceiling]);
        cache.put("k", value.clone()).await;
        assert!(file.get("k").await.is_none());
        assert_eq!(shm.get("k").await.map(|raw| raw.len()), Some(ceiling + 1));
        assert_eq!(cache.get("k").await, Some(value));
        assert_eq!(shm.get_stats().rejected, 0);
    }

    #[test]
    fn test_record_capacity_covers_sentinel() {
        assert_eq!(l2_record_capacity(100), 101);
        assert_eq!(l2_record_capacity(0), SENTINEL_LEN);
    }

    #[tokio::test]
    async fn test_one_over_ceiling_uses_sentinel() {
        let (cache, l2, file) = layers(100);
        let value = Bytes::from(vec![2u8; 101]);
        cache.put("k", value.clone()).await;
        assert_eq!(l2.get("k").await.unwrap().len(), SENTINEL_LEN);
        assert_eq!(file.get("k").await, Some(value.clone()));
        assert_eq!(cache.get("k").await, Some(value));
    }

    #[tokio::test]
    async fn test_fingerprint_mismatch_is_miss() {
        let (cache, _l2, file) = layers(100);
        cache.put("k", Bytes::from(vec![3u8; 200])).await;
        file.put("k", Bytes::from(vec![4u8; 200])).await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn test_missing_body_is_miss() {
        let (cache, _l2, file) = layers(100);
        cache.put("k", Bytes::from(vec![3u8; 200])).await;
        file.delete("k").await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn test_above_absolute_ceiling_dropped() {
        let (cache, l2, file) = layers(100);
        cache.put("k", Bytes::from(vec![0u8; 5000])).await;
        assert!(l2.get("k").await.is_none());
        assert!(file.get("k").await.is_none());
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn test_delete_removes_sentinel_only() {
        let (cache, _l2, file) = layers(100);
        cache.put("k", Bytes::from(vec![5u8; 200])).await;
        cache.delete("k").await;
        assert!(cache.get("k").await.is_none());
        assert!(file.get("k").await.is_some());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(decode_record(&[]), None);
        assert_eq!(decode_record(&[9, 1, 2]), None);
        assert_eq!(decode_record(&[SENTINEL_TAG, 1, 2]), None);
    }
}
