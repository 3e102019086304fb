//! Shared-memory L2 tier
//!
//! Values live in an anonymous shared mapping carved into fixed-size
//! blocks. A bitmap tracks free blocks and an LRU directory maps key hashes
//! to their block runs; when a value does not fit, least recently used
//! entries are evicted until it does. Each stored record carries its key
//! and a CRC32 of the value, both verified on read.

use super::CacheInterface;
use crate::error::{PagespeedError, Result};
use async_trait::async_trait;
use bitvec::prelude::*;
use bytes::Bytes;
use lru::LruCache;
use memmap2::MmapMut;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_128;

const HEADER_LEN: usize = 12;

/// Shared-memory geometry
#[derive(Debug, Clone)]
pub struct ShmCacheConfig {
    pub size_bytes: usize,
    pub block_size: usize,
    /// Largest value the tier will store
    pub max_value_bytes: usize,
}

impl Default for ShmCacheConfig {
    fn default() -> Self {
        Self {
            size_bytes: 64 * 1024 * 1024,
            block_size: 4096,
            max_value_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Location {
    start_block: usize,
    blocks: usize,
}

/// Contiguous block allocator over a bitmap of free blocks
struct BlockAllocator {
    free_blocks: BitVec,
}

impl BlockAllocator {
    fn new(total_blocks: usize) -> Self {
        let mut free_blocks = BitVec::with_capacity(total_blocks);
        free_blocks.resize(total_blocks, true);
        Self { free_blocks }
    }

    fn allocate(&mut self, blocks_needed: usize) -> Option<usize> {
        let mut start = 0;
        let mut count = 0;
        let mut found = None;
        for (i, is_free) in self.free_blocks.iter().by_vals().enumerate() {
            if is_free {
                if count == 0 {
                    start = i;
                }
                count += 1;
                if count == blocks_needed {
                    found = Some(start);
                    break;
                }
            } else {
                count = 0;
            }
        }
        let start = found?;
        self.free_blocks[start..start + blocks_needed].fill(false);
        Some(start)
    }

    fn free(&mut self, location: Location) {
        let end = (location.start_block + location.blocks).min(self.free_blocks.len());
        self.free_blocks[location.start_block..end].fill(true);
    }

    fn used_blocks(&self) -> usize {
        self.free_blocks.count_zeros()
    }
}

struct Inner {
    region: MmapMut,
    allocator: BlockAllocator,
    directory: LruCache<u128, Location>,
}

/// Snapshot of shared-memory occupancy
#[derive(Debug, Clone, Default)]
pub struct ShmCacheStats {
    pub entries: usize,
    pub used_blocks: usize,
    pub total_blocks: usize,
    pub evictions: u64,
    pub checksum_failures: u64,
    pub rejected: u64,
}

/// Block-allocated cache in an anonymous shared mapping
///
/// The mapping is shared with child processes forked after creation.
pub struct ShmCache {
    inner: Mutex<Inner>,
    config: ShmCacheConfig,
    total_blocks: usize,
    evictions: AtomicU64,
    checksum_failures: AtomicU64,
    rejected: AtomicU64,
}

impl ShmCache {
    pub fn new(config: ShmCacheConfig) -> Result<Self> {
        if config.block_size == 0 || config.size_bytes < config.block_size {
            return Err(PagespeedError::ConfigError(format!(
                "Invalid shm geometry: {} bytes in blocks of {}",
                config.size_bytes, config.block_size
            )));
        }
        let total_blocks = config.size_bytes / config.block_size;
        let region = MmapMut::map_anon(total_blocks * config.block_size)?;
        info!(
            "Shared memory cache: {} blocks of {} bytes",
            total_blocks, config.block_size
        );
        Ok(Self {
            inner: Mutex::new(Inner {
                region,
                allocator: BlockAllocator::new(total_blocks),
                directory: LruCache::unbounded(),
            }),
            config,
            total_blocks,
            evictions: AtomicU64::new(0),
            checksum_failures: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        })
    }

    pub fn max_value_bytes(&self) -> usize {
        self.config.max_value_bytes
    }

    pub fn get_stats(&self) -> ShmCacheStats {
        let inner = self.inner.lock();
        ShmCacheStats {
            entries: inner.directory.len(),
            used_blocks: inner.allocator.used_blocks(),
            total_blocks: self.total_blocks,
            evictions: self.evictions.load(Ordering::Relaxed),
            checksum_failures: self.checksum_failures.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    fn get_sync(&self, key: &str) -> Option<Bytes> {
        let hash = xxh3_128(key.as_bytes());
        let mut inner = self.inner.lock();
        let location = *inner.directory.get(&hash)?;

        let offset = location.start_block * self.config.block_size;
        let span = location.blocks * self.config.block_size;
        let record = &inner.region[offset..offset + span];

        let key_len = u32::from_le_bytes([record[0], record[1], record[2], record[3]]) as usize;
        let value_len = u32::from_le_bytes([record[4], record[5], record[6], record[7]]) as usize;
        let checksum = u32::from_le_bytes([record[8], record[9], record[10], record[11]]);

        let body_start = HEADER_LEN + key_len;
        let valid = body_start + value_len <= span
            && &record[HEADER_LEN..body_start] == key.as_bytes()
            && crc32fast::hash(&record[body_start..body_start + value_len]) == checksum;
        if !valid {
            warn!("Shared memory record for {} failed verification", key);
            self.checksum_failures.fetch_add(1, Ordering::Relaxed);
            inner.directory.pop(&hash);
            inner.allocator.free(location);
            return None;
        }

        Some(Bytes::copy_from_slice(
            &record[body_start..body_start + value_len],
        ))
    }

    fn put_sync(&self, key: &str, value: &[u8]) {
        if value.len() > self.config.max_value_bytes {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            debug!("Shared memory refused {} ({} bytes)", key, value.len());
            return;
        }
        let record_len = HEADER_LEN + key.len() + value.len();
        let blocks = record_len.div_ceil(self.config.block_size);
        if blocks > self.total_blocks {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let hash = xxh3_128(key.as_bytes());
        let mut inner = self.inner.lock();
        if let Some(old) = inner.directory.pop(&hash) {
            inner.allocator.free(old);
        }

        let start_block = loop {
            if let Some(start) = inner.allocator.allocate(blocks) {
                break start;
            }
            match inner.directory.pop_lru() {
                Some((_, victim)) => {
                    inner.allocator.free(victim);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
        };

        let offset = start_block * self.config.block_size;
        let record = &mut inner.region[offset..offset + record_len];
        record[0..4].copy_from_slice(&(key.len() as u32).to_le_bytes());
        record[4..8].copy_from_slice(&(value.len() as u32).to_le_bytes());
        record[8..12].copy_from_slice(&crc32fast::hash(value).to_le_bytes());
        record[HEADER_LEN..HEADER_LEN + key.len()].copy_from_slice(key.as_bytes());
        record[HEADER_LEN + key.len()..].copy_from_slice(value);

        inner.directory.put(
            hash,
            Location {
                start_block,
                blocks,
            },
        );
    }

    fn delete_sync(&self, key: &str) {
        let hash = xxh3_128(key.as_bytes());
        let mut inner = self.inner.lock();
        if let Some(location) = inner.directory.pop(&hash) {
            inner.allocator.free(location);
        }
    }
}

#[async_trait]
impl CacheInterface for ShmCache {
    fn name(&self) -> &'static str {
        "shm"
    }

    async fn get(&self, key: &str) -> Option<Bytes> {
        self.get_sync(key)
    }

    async fn put(&self, key: &str, value: Bytes) {
        self.put_sync(key, &value)
    }

    async fn delete(&self, key: &str) {
        self.delete_sync(key)
    }
}
