//! On-disk file cache
//!
//! One file per entry at `<root>/<hh>/<hh>/<hex hash of key>`. Each file
//! holds `[u32 key length][key][codec-tagged value]`; the embedded key
//! guards against hash collisions. Writes go to a temp file that is renamed
//! into place while holding the key's named lock. A janitor task trims the
//! cache to its size and inode targets by deleting the least recently
//! modified files.

use super::compression::{CompressionConfig, Compressor};
use super::CacheInterface;
use crate::error::{PagespeedError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use nix::fcntl::{flock, FlockArg};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use xxhash_rust::xxh3::xxh3_128;

const LOCK_STRIPES: usize = 64;
const LOCK_DIR: &str = "!locks";
const TEMP_SUFFIX: &str = ".tmp";

/// File cache geometry and janitor targets
#[derive(Debug, Clone)]
pub struct FileCacheConfig {
    pub path: PathBuf,
    pub clean_interval: Duration,
    pub target_size_bytes: u64,
    pub target_inode_count: u64,
    pub compression: CompressionConfig,
    /// Upper bound on waiting for a key's lock before giving up the write
    pub lock_timeout: Duration,
}

impl FileCacheConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            clean_interval: Duration::from_secs(3600),
            target_size_bytes: 100 * 1024 * 1024,
            target_inode_count: 500_000,
            compression: CompressionConfig::default(),
            lock_timeout: Duration::from_secs(2),
        }
    }
}

/// Counters for file cache activity
#[derive(Debug, Default)]
struct FileCacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    errors: AtomicU64,
    cleanups: AtomicU64,
    evicted_files: AtomicU64,
}

/// Snapshot of file cache activity
#[derive(Debug, Clone, Default)]
pub struct FileCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub errors: u64,
    pub cleanups: u64,
    pub evicted_files: u64,
}

/// Result of one janitor pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanStats {
    pub files_before: u64,
    pub bytes_before: u64,
    pub files_deleted: u64,
    pub bytes_deleted: u64,
}

/// Per-key write serialization
///
/// Keys hash onto a fixed set of stripes; each stripe is an async mutex in
/// this process plus an `flock` on a stripe lock file for other processes
/// sharing the cache root.
pub struct NamedLockManager {
    dir: PathBuf,
    stripes: Vec<Arc<Mutex<()>>>,
}

/// Held lock; released on drop
pub struct NamedLock {
    _local: OwnedMutexGuard<()>,
    file: std::fs::File,
}

impl Drop for NamedLock {
    fn drop(&mut self) {
        let _ = flock(self.file.as_raw_fd(), FlockArg::Unlock);
    }
}

impl NamedLockManager {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            stripes: (0..LOCK_STRIPES).map(|_| Arc::new(Mutex::new(()))).collect(),
        })
    }

    fn stripe_of(name: &str) -> usize {
        (xxh3_128(name.as_bytes()) % LOCK_STRIPES as u128) as usize
    }

    /// Acquire the lock for `name`, giving up after `timeout`
    pub async fn lock(&self, name: &str, timeout: Duration) -> Option<NamedLock> {
        let stripe = Self::stripe_of(name);
        let local = tokio::time::timeout(timeout, self.stripes[stripe].clone().lock_owned())
            .await
            .ok()?;

        let path = self.dir.join(format!("{:02}.lock", stripe));
        let file = match std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) => {
                warn!("Failed to open lock file {}: {}", path.display(), e);
                return None;
            }
        };

        let deadline = tokio::time::Instant::now() + timeout;
        let mut backoff = Duration::from_millis(1);
        loop {
            match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
                Ok(()) => {
                    return Some(NamedLock {
                        _local: local,
                        file,
                    })
                }
                Err(nix::errno::Errno::EWOULDBLOCK) => {
                    if tokio::time::Instant::now() >= deadline {
                        debug!("Timed out waiting for lock {}", name);
                        return None;
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_millis(50));
                }
                Err(e) => {
                    warn!("flock failed on {}: {}", path.display(), e);
                    return None;
                }
            }
        }
    }
}

/// On-disk cache tier
pub struct FileCache {
    root: PathBuf,
    config: FileCacheConfig,
    compressor: Compressor,
    locks: NamedLockManager,
    counters: FileCacheCounters,
    temp_counter: AtomicU64,
}

impl FileCache {
    /// Open (creating if needed) a file cache at `config.path`
    ///
    /// An unusable root is a startup error.
    pub fn new(config: FileCacheConfig) -> Result<Self> {
        let root = config.path.clone();
        std::fs::create_dir_all(&root).map_err(|e| {
            PagespeedError::ConfigError(format!(
                "Cannot create file cache root {}: {}",
                root.display(),
                e
            ))
        })?;
        let locks = NamedLockManager::new(root.join(LOCK_DIR))?;
        info!(
            "File cache at {} (target {} bytes, {} inodes)",
            root.display(),
            config.target_size_bytes,
            config.target_inode_count
        );
        Ok(Self {
            root,
            compressor: Compressor::new(config.compression.clone()),
            config,
            locks,
            counters: FileCacheCounters::default(),
            temp_counter: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the file holding `key`
    pub fn path_for(&self, key: &str) -> PathBuf {
        let hash = hex::encode(xxh3_128(key.as_bytes()).to_be_bytes());
        self.root.join(&hash[0..2]).join(&hash[2..4]).join(hash)
    }

    pub fn get_stats(&self) -> FileCacheStats {
        FileCacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            cleanups: self.counters.cleanups.load(Ordering::Relaxed),
            evicted_files: self.counters.evicted_files.load(Ordering::Relaxed),
        }
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if data.len() < 4 {
            return Ok(None);
        }
        let key_len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + key_len || &data[4..4 + key_len] != key.as_bytes() {
            debug!("Key mismatch in {}, treating as miss", path.display());
            return Ok(None);
        }
        let value = self
            .compressor
            .decode(&data[4 + key_len..])
            .map_err(|e| PagespeedError::CacheError(format!("{}: {}", path.display(), e)))?;
        Ok(Some(value))
    }

    async fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let framed = self
            .compressor
            .encode(value)
            .map_err(|e| PagespeedError::CacheError(e.to_string()))?;
        let mut contents = Vec::with_capacity(4 + key.len() + framed.len());
        contents.extend_from_slice(&(key.len() as u32).to_le_bytes());
        contents.extend_from_slice(key.as_bytes());
        contents.extend_from_slice(&framed);

        let Some(_lock) = self.locks.lock(key, self.config.lock_timeout).await else {
            return Err(PagespeedError::CacheError(format!("lock timeout for {}", key)));
        };

        let temp = path.with_extension(format!(
            "{}{}",
            self.temp_counter.fetch_add(1, Ordering::Relaxed),
            TEMP_SUFFIX
        ));
        let mut file = fs::File::create(&temp).await?;
        file.write_all(&contents).await?;
        file.flush().await?;
        drop(file);
        if let Err(e) = fs::rename(&temp, &path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }
        debug!("Wrote file cache entry {} ({} bytes)", key, value.len());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        let Some(_lock) = self.locks.lock(key, self.config.lock_timeout).await else {
            return Err(PagespeedError::CacheError(format!("lock timeout for {}", key)));
        };
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Collect every entry file under the root (excluding the lock directory)
    async fn scan(&self) -> Result<Vec<(PathBuf, u64, SystemTime)>> {
        let mut files = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let metadata = match entry.metadata().await {
                    Ok(m) => m,
                    Err(_) => continue,
                };
                if metadata.is_dir() {
                    if entry.file_name() != LOCK_DIR {
                        pending.push(path);
                    }
                } else {
                    let mtime = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                    files.push((path, metadata.len(), mtime));
                }
            }
        }
        Ok(files)
    }

    /// One janitor pass
    ///
    /// When either target is exceeded, deletes least recently modified
    /// files until both are at or below 75% of their targets.
    pub async fn clean(&self) -> Result<CleanStats> {
        let mut files = self.scan().await?;
        let mut stats = CleanStats {
            files_before: files.len() as u64,
            bytes_before: files.iter().map(|(_, size, _)| size).sum(),
            ..Default::default()
        };
        self.counters.cleanups.fetch_add(1, Ordering::Relaxed);

        if stats.bytes_before <= self.config.target_size_bytes
            && stats.files_before <= self.config.target_inode_count
        {
            debug!(
                "File cache within targets ({} bytes, {} files)",
                stats.bytes_before, stats.files_before
            );
            return Ok(stats);
        }

        let size_goal = self.config.target_size_bytes * 3 / 4;
        let inode_goal = self.config.target_inode_count * 3 / 4;
        files.sort_by_key(|(_, _, mtime)| *mtime);

        let mut bytes = stats.bytes_before;
        let mut count = stats.files_before;
        for (path, size, _) in files {
            if bytes <= size_goal && count <= inode_goal {
                break;
            }
            match fs::remove_file(&path).await {
                Ok(()) => {
                    bytes -= size;
                    count -= 1;
                    stats.files_deleted += 1;
                    stats.bytes_deleted += size;
                }
                Err(e) => warn!("Janitor failed to delete {}: {}", path.display(), e),
            }
        }
        self.counters
            .evicted_files
            .fetch_add(stats.files_deleted, Ordering::Relaxed);
        info!(
            "File cache clean: deleted {} files ({} bytes) of {} files ({} bytes)",
            stats.files_deleted, stats.bytes_deleted, stats.files_before, stats.bytes_before
        );
        Ok(stats)
    }

    /// Spawn the janitor on the current runtime
    pub fn start_janitor(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let interval = cache.config.clean_interval;
        tokio::spawn(async move {
            info!("File cache janitor started (every {:?})", interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = cache.clean().await {
                            error!("File cache clean failed: {}", e);
                        }
                    }
                }
            }
            info!("File cache janitor stopped");
        })
    }
}

#[async_trait]
impl CacheInterface for FileCache {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn get(&self, key: &str) -> Option<Bytes> {
        match self.read(key).await {
            Ok(Some(value)) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(Bytes::from(value))
            }
            Ok(None) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                error!("File cache read failed for {}: {}", key, e);
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    async fn put(&self, key: &str, value: Bytes) {
        match self.write(key, &value).await {
            Ok(()) => {
                self.counters.writes.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                error!("File cache write failed for {}: {}", key, e);
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn delete(&self, key: &str) {
        if let Err(e) = self.remove(key).await {
            warn!("File cache delete failed for {}: {}", key, e);
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::compression::CompressionAlgorithm;
    use tempfile::TempDir;

    fn cache_in(dir: &TempDir) -> FileCache {
        FileCache::new(FileCacheConfig::new(dir.path())).unwrap()
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir);

        cache.put("http://a.com/x.js", Bytes::from_static(b"x=0")).await;
        assert_eq!(
            cache.get("http://a.com/x.js").await,
            Some(Bytes::from_static(b"x=0"))
        );

        cache.delete("http://a.com/x.js").await;
        assert_eq!(cache.get("http://a.com/x.js").await, None);
        assert_eq!(cache.get_stats().writes, 1);
    }

    #[tokio::test]
    async fn test_layout_uses_two_level_hash_dirs() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir);
        let path = cache.path_for("some/key");
        let relative = path.strip_prefix(dir.path()).unwrap();
        let parts: Vec<_> = relative.components().collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].as_os_str().len(), 2);
        assert_eq!(parts[2].as_os_str().len(), 32);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let cache = cache_in(&dir);
            cache.put("k", Bytes::from_static(b"persisted")).await;
        }
        let cache = cache_in(&dir);
        assert_eq!(cache.get("k").await, Some(Bytes::from_static(b"persisted")));
    }

    #[tokio::test]
    async fn test_compressed_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut config = FileCacheConfig::new(dir.path());
        config.compression = CompressionConfig {
            algorithm: CompressionAlgorithm::Zstd,
            level: 3,
            min_size: 16,
        };
        let cache = FileCache::new(config).unwrap();
        let body = Bytes::from(b".a { margin: 0 } ".repeat(500));
        cache.put("css", body.clone()).await;
        assert_eq!(cache.get("css").await, Some(body.clone()));
        let on_disk = std::fs::metadata(cache.path_for("css")).unwrap().len();
        assert!(on_disk < body.len() as u64);
    }

    #[tokio::test]
    async fn test_janitor_deletes_oldest_first() {
        let dir = TempDir::new().unwrap();
        let mut config = FileCacheConfig::new(dir.path());
        config.target_size_bytes = 4000;
        config.target_inode_count = 1000;
        let cache = FileCache::new(config).unwrap();

        for i in 0..10 {
            cache.put(&format!("key{}", i), Bytes::from(vec![b'x'; 1000])).await;
            // Distinct mtimes so ordering is deterministic
            let path = cache.path_for(&format!("key{}", i));
            let file = std::fs::File::options().write(true).open(&path).unwrap();
            file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(1_000 + i))
                .unwrap();
        }

        let stats = cache.clean().await.unwrap();
        assert_eq!(stats.files_before, 10);
        assert!(stats.files_deleted >= 7);
        assert!(cache.get("key0").await.is_none());
        assert!(cache.get("key9").await.is_some());
    }

    #[tokio::test]
    async fn test_janitor_noop_within_targets() {
        let dir = TempDir::new().unwrap();
        let cache = cache_in(&dir);
        cache.put("k", Bytes::from_static(b"v")).await;
        let stats = cache.clean().await.unwrap();
        assert_eq!(stats.files_deleted, 0);
        assert!(cache.get("k").await.is_some());
    }

    #[tokio::test]
    async fn test_named_lock_serializes_holders() {
        let dir = TempDir::new().unwrap();
        let locks = NamedLockManager::new(dir.path().join("locks")).unwrap();
        let held = locks.lock("k", Duration::from_secs(1)).await.unwrap();
        assert!(locks.lock("k", Duration::from_millis(20)).await.is_none());
        drop(held);
        assert!(locks.lock("k", Duration::from_millis(200)).await.is_some());
    }
}
