//! Memcached L2 tier
//!
//! Speaks the memcached text protocol over a single TCP connection. Keys
//! are hashed to fit memcached's key rules and the original key is stored
//! in front of the value so that a hash collision reads as a miss.
//!
//! The tier tracks its own health: after [`MemcachedConfig::error_threshold`]
//! failures inside [`MemcachedConfig::error_window`] it stops talking to the
//! server, answering gets with misses and dropping puts, and retries the
//! connection with exponential backoff.

use super::CacheInterface;
use crate::error::{PagespeedError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex as SyncMutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_128;

/// Memcached connection settings
#[derive(Debug, Clone)]
pub struct MemcachedConfig {
    /// `host:port` of the server
    pub server: String,
    pub op_timeout: Duration,
    /// Expiry passed to `set`, 0 for none
    pub expiry_secs: u32,
    pub error_threshold: usize,
    pub error_window: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl MemcachedConfig {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            op_timeout: Duration::from_millis(500),
            expiry_secs: 0,
            error_threshold: 4,
            error_window: Duration::from_secs(30),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

struct Health {
    recent_errors: VecDeque<Instant>,
    /// Set while the server is considered down
    retry_at: Option<Instant>,
    backoff: Duration,
}

/// Snapshot of memcached tier activity
#[derive(Debug, Clone, Default)]
pub struct MemcachedStats {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub dropped_while_unhealthy: u64,
    pub healthy: bool,
}

/// Memcached-backed cache tier
pub struct MemcachedCache {
    config: MemcachedConfig,
    conn: Mutex<Option<BufReader<TcpStream>>>,
    health: SyncMutex<Health>,
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    dropped: AtomicU64,
}

fn server_key(key: &str) -> String {
    format!("ps:{}", hex::encode(xxh3_128(key.as_bytes()).to_be_bytes()))
}

fn frame_value(key: &str, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + key.len() + value.len());
    out.extend_from_slice(&(key.len() as u16).to_le_bytes());
    out.extend_from_slice(key.as_bytes());
    out.extend_from_slice(value);
    out
}

fn unframe_value<'a>(key: &str, framed: &'a [u8]) -> Option<&'a [u8]> {
    if framed.len() < 2 {
        return None;
    }
    let key_len = u16::from_le_bytes([framed[0], framed[1]]) as usize;
    let stored_key = framed.get(2..2 + key_len)?;
    if stored_key != key.as_bytes() {
        return None;
    }
    Some(&framed[2 + key_len..])
}

impl MemcachedCache {
    /// Create the tier; the connection is established lazily
    pub fn new(config: MemcachedConfig) -> Self {
        info!("Memcached cache tier using {}", config.server);
        let backoff = config.initial_backoff;
        Self {
            config,
            conn: Mutex::new(None),
            health: SyncMutex::new(Health {
                recent_errors: VecDeque::new(),
                retry_at: None,
                backoff,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn get_stats(&self) -> MemcachedStats {
        MemcachedStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            dropped_while_unhealthy: self.dropped.load(Ordering::Relaxed),
            healthy: self.is_healthy(),
        }
    }

    /// Whether an operation should be attempted now
    fn may_attempt(&self) -> bool {
        let health = self.health.lock();
        match health.retry_at {
            None => true,
            Some(at) => Instant::now() >= at,
        }
    }

    fn record_error(&self, error: &PagespeedError) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut health = self.health.lock();

        if health.retry_at.is_some() {
            // Failed reconnect attempt while down
            health.backoff = (health.backoff * 2).min(self.config.max_backoff);
            health.retry_at = Some(now + health.backoff);
            debug!(
                "Memcached {} still down, next attempt in {:?}",
                self.config.server, health.backoff
            );
            return;
        }

        health.recent_errors.push_back(now);
        while let Some(&oldest) = health.recent_errors.front() {
            if now.duration_since(oldest) > self.config.error_window {
                health.recent_errors.pop_front();
            } else {
                break;
            }
        }
        if health.recent_errors.len() >= self.config.error_threshold {
            health.retry_at = Some(now + health.backoff);
            health.recent_errors.clear();
            warn!(
                "Memcached {} marked unhealthy after repeated errors (last: {})",
                self.config.server, error
            );
        }
    }

    fn record_success(&self) {
        let mut health = self.health.lock();
        if health.retry_at.take().is_some() {
            info!("Memcached {} healthy again", self.config.server);
        }
        health.backoff = self.config.initial_backoff;
    }

    async fn with_connection<T, F>(&self, op: F) -> Result<T>
    where
        F: for<'c> FnOnce(
            &'c mut BufReader<TcpStream>,
        ) -> futures::future::BoxFuture<'c, Result<T>>,
    {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            let stream = tokio::time::timeout(
                self.config.op_timeout,
                TcpStream::connect(&self.config.server),
            )
            .await
            .map_err(|_| PagespeedError::Timeout(format!("connect to {}", self.config.server)))??;
            stream.set_nodelay(true)?;
            *guard = Some(BufReader::new(stream));
        }
        let Some(conn) = guard.as_mut() else {
            return Err(PagespeedError::CacheUnavailable(self.config.server.clone()));
        };

        let result = match tokio::time::timeout(self.config.op_timeout, op(conn)).await {
            Ok(result) => result,
            Err(_) => Err(PagespeedError::Timeout(format!(
                "memcached {}",
                self.config.server
            ))),
        };
        if result.is_err() {
            // Protocol state is unknown after a failure
            *guard = None;
        }
        result
    }

    async fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let skey = server_key(key);
        self.with_connection(move |conn| {
            Box::pin(async move {
                conn.get_mut()
                    .write_all(format!("get {}\r\n", skey).as_bytes())
                    .await?;

                let mut line = String::new();
                conn.read_line(&mut line).await?;
                let header = line.trim_end();
                if header == "END" {
                    return Ok(None);
                }
                let fields: Vec<&str> = header.split(' ').collect();
                if fields.len() < 4 || fields[0] != "VALUE" {
                    return Err(PagespeedError::CacheError(format!(
                        "unexpected memcached reply: {}",
                        header
                    )));
                }
                let len: usize = fields[3].parse().map_err(|_| {
                    PagespeedError::CacheError(format!("bad length in reply: {}", header))
                })?;

                let mut data = vec![0u8; len + 2];
                conn.read_exact(&mut data).await?;
                data.truncate(len);

                line.clear();
                conn.read_line(&mut line).await?;
                if line.trim_end() != "END" {
                    return Err(PagespeedError::CacheError(format!(
                        "missing END after value: {}",
                        line.trim_end()
                    )));
                }
                Ok(Some(data))
            })
        })
        .await
    }

    async fn store(&self, key: &str, value: &[u8]) -> Result<()> {
        let skey = server_key(key);
        let framed = frame_value(key, value);
        let expiry = self.config.expiry_secs;
        self.with_connection(move |conn| {
            Box::pin(async move {
                let mut request =
                    format!("set {} 0 {} {}\r\n", skey, expiry, framed.len()).into_bytes();
                request.extend_from_slice(&framed);
                request.extend_from_slice(b"\r\n");
                conn.get_mut().write_all(&request).await?;

                let mut line = String::new();
                conn.read_line(&mut line).await?;
                match line.trim_end() {
                    "STORED" => Ok(()),
                    other => Err(PagespeedError::CacheError(format!(
                        "memcached set failed: {}",
                        other
                    ))),
                }
            })
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let skey = server_key(key);
        self.with_connection(move |conn| {
            Box::pin(async move {
                conn.get_mut()
                    .write_all(format!("delete {}\r\n", skey).as_bytes())
                    .await?;
                let mut line = String::new();
                conn.read_line(&mut line).await?;
                match line.trim_end() {
                    "DELETED" | "NOT_FOUND" => Ok(()),
                    other => Err(PagespeedError::CacheError(format!(
                        "memcached delete failed: {}",
                        other
                    ))),
                }
            })
        })
        .await
    }
}

#[async_trait]
impl CacheInterface for MemcachedCache {
    fn name(&self) -> &'static str {
        "memcached"
    }

    async fn get(&self, key: &str) -> Option<Bytes> {
        if !self.may_attempt() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        match self.fetch(key).await {
            Ok(found) => {
                self.record_success();
                match found.as_deref().and_then(|framed| unframe_value(key, framed)) {
                    Some(value) => {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        Some(Bytes::copy_from_slice(value))
                    }
                    None => {
                        self.misses.fetch_add(1, Ordering::Relaxed);
                        None
                    }
                }
            }
            Err(e) => {
                debug!("Memcached get failed for {}: {}", key, e);
                self.record_error(&e);
                None
            }
        }
    }

    async fn put(&self, key: &str, value: Bytes) {
        if !self.may_attempt() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        match self.store(key, &value).await {
            Ok(()) => self.record_success(),
            Err(e) => {
                debug!("Memcached put failed for {}: {}", key, e);
                self.record_error(&e);
            }
        }
    }

    async fn delete(&self, key: &str) {
        if !self.may_attempt() {
            return;
        }
        match self.remove(key).await {
            Ok(()) => self.record_success(),
            Err(e) => self.record_error(&e),
        }
    }

    fn is_healthy(&self) -> bool {
        self.health.lock().retry_at.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_key_is_protocol_safe() {
        let key = server_key("http://a.com/has spaces and\r\nnewlines");
        assert!(key.len() < 250);
        assert!(key.chars().all(|c| c.is_ascii_graphic()));
    }

    #[test]
    fn test_collision_reads_as_miss() {
        let framed = frame_value("real-key", b"payload");
        assert_eq!(unframe_value("real-key", &framed), Some(&b"payload"[..]));
        assert_eq!(unframe_value("other-key", &framed), None);
        assert_eq!(unframe_value("k", &[1]), None);
    }

    #[tokio::test]
    async fn test_unreachable_server_becomes_unhealthy() {
        // Bind then drop to get a port with nothing listening
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut config = MemcachedConfig::new(addr.to_string());
        config.op_timeout = Duration::from_millis(100);
        let cache = MemcachedCache::new(config);

        for _ in 0..4 {
            assert!(cache.get("k").await.is_none());
        }
        assert!(!cache.is_healthy());

        cache.put("k", Bytes::from_static(b"v")).await;
        assert_eq!(cache.get_stats().dropped_while_unhealthy, 1);
    }
}
