//! Tier composition: oversize fallback, L2 outage and flush-file invalidation

use bytes::Bytes;
use pingora_pagespeed::cache::fallback::FallbackCache;
use pingora_pagespeed::cache::file::{FileCache, FileCacheConfig};
use pingora_pagespeed::cache::lru_cache::ThreadsafeLruCache;
use pingora_pagespeed::cache::memcached::{MemcachedCache, MemcachedConfig};
use pingora_pagespeed::{CacheInterface, CacheStack, FlushFilePoller, InvalidationClock};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

const T: usize = 1024;

fn file_tier(dir: &TempDir) -> Arc<FileCache> {
    Arc::new(FileCache::new(FileCacheConfig::new(dir.path())).unwrap())
}

fn unreachable_memcached() -> Arc<MemcachedCache> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut config = MemcachedConfig::new(addr.to_string());
    config.op_timeout = Duration::from_millis(100);
    config.initial_backoff = Duration::from_secs(60);
    Arc::new(MemcachedCache::new(config))
}

#[tokio::test]
async fn test_oversize_value_round_trips_through_file_tier() {
    let dir = TempDir::new().unwrap();
    let l2 = Arc::new(ThreadsafeLruCache::new(1 << 20, 1 << 20));
    let file = file_tier(&dir);
    let cache = FallbackCache::new(l2.clone(), file.clone(), T, 1 << 20);

    let value: Vec<u8> = (0..2 * T).map(|i| (i % 251) as u8).collect();
    cache.put("k", Bytes::from(value.clone())).await;

    // L2 only holds the small sentinel
    assert!(l2.get("k").await.unwrap().len() < 64);
    assert_eq!(cache.get("k").await, Some(Bytes::from(value)));

    cache.delete("k").await;
    assert_eq!(cache.get("k").await, None);
}

#[tokio::test]
async fn test_threshold_boundary() {
    let dir = TempDir::new().unwrap();
    let l2 = Arc::new(ThreadsafeLruCache::new(1 << 20, 1 << 20));
    let file = file_tier(&dir);
    let cache = FallbackCache::new(l2.clone(), file.clone(), T, 1 << 20);

    cache.put("at", Bytes::from(vec![7u8; T])).await;
    cache.put("over", Bytes::from(vec![8u8; T + 1])).await;

    assert!(file.get("at").await.is_none());
    assert_eq!(file.get("over").await.map(|b| b.len()), Some(T + 1));
    assert_eq!(cache.get("at").await.map(|b| b.len()), Some(T));
    assert_eq!(cache.get("over").await.map(|b| b.len()), Some(T + 1));
}

#[tokio::test]
async fn test_values_over_absolute_ceiling_are_dropped() {
    let dir = TempDir::new().unwrap();
    let l2 = Arc::new(ThreadsafeLruCache::new(1 << 20, 1 << 20));
    let cache = FallbackCache::new(l2, file_tier(&dir), T, 4 * T);

    cache.put("huge", Bytes::from(vec![0u8; 4 * T + 1])).await;
    assert!(cache.get("huge").await.is_none());
}

#[tokio::test]
async fn test_l2_outage_falls_back_to_file_tier() {
    let dir = TempDir::new().unwrap();
    let memcached = unreachable_memcached();
    let file = file_tier(&dir);
    let l2: Arc<dyn CacheInterface> = Arc::new(FallbackCache::new(
        memcached.clone(),
        file.clone(),
        T,
        1 << 20,
    ));
    let clock = Arc::new(InvalidationClock::new(0));
    let stack = CacheStack::new(vec![l2, file.clone()], clock);

    stack.put_value("small", b"css".to_vec()).await;
    stack.put_value("large", vec![9u8; 3 * T]).await;
    assert_eq!(file.get_stats().writes, 3);

    // Gets keep answering from the file tier while the client gives up on L2
    for _ in 0..4 {
        assert_eq!(stack.get_value("small").await, Some(b"css".to_vec()));
    }
    assert!(!memcached.is_healthy());

    assert_eq!(stack.get_value("small").await, Some(b"css".to_vec()));
    assert_eq!(stack.get_value("large").await, Some(vec![9u8; 3 * T]));

    stack.put_value("later", b"v".to_vec()).await;
    assert_eq!(stack.get_value("later").await, Some(b"v".to_vec()));
    assert!(memcached.get_stats().dropped_while_unhealthy > 0);
}

#[tokio::test]
async fn test_flush_file_invalidates_existing_entries() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(InvalidationClock::new(0));
    let lru: Arc<dyn CacheInterface> = Arc::new(ThreadsafeLruCache::new(1 << 20, 1 << 16));
    let stack = CacheStack::new(vec![lru, file_tier(&dir)], clock.clone());

    let flush_path = dir.path().join("cache.flush");
    let poller = FlushFilePoller::new(&flush_path, Duration::from_millis(20), clock.clone());
    assert!(!poller.check_now());

    stack.put_value("k", b"v".to_vec()).await;
    assert_eq!(stack.get_value("k").await, Some(b"v".to_vec()));

    let flush_file = std::fs::File::create(&flush_path).unwrap();
    flush_file
        .set_modified(SystemTime::now() + Duration::from_secs(1))
        .unwrap();
    drop(flush_file);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(poller.poll());
    assert!(clock.current() > 0);

    assert_eq!(stack.get_value("k").await, None);

    // New writes carry the new token
    stack.put_value("k", b"v2".to_vec()).await;
    assert_eq!(stack.get_value("k").await, Some(b"v2".to_vec()));

    // Unchanged mtime does not advance again
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!poller.poll());
}

#[tokio::test]
async fn test_poll_is_rate_limited() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(InvalidationClock::new(0));
    let flush_path = dir.path().join("cache.flush");
    let poller = FlushFilePoller::new(&flush_path, Duration::from_secs(3600), clock.clone());

    assert!(!poller.poll());
    std::fs::write(&flush_path, b"").unwrap();
    // Within the interval the file is not looked at
    assert!(!poller.poll());
    assert_eq!(clock.current(), 0);
    assert!(poller.check_now());
}
