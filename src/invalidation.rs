//! Cache invalidation via a flush file
//!
//! Touching `<file cache path>/<flush file>` advances the server-wide
//! invalidation timestamp to the file's mtime. Cache entries whose validity
//! token predates the timestamp then read as misses; nothing is evicted.

use crate::stats::RewriteStats;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Server-wide cache invalidation timestamp in epoch milliseconds
///
/// Only ever moves forward.
#[derive(Debug)]
pub struct InvalidationClock {
    timestamp_ms: AtomicI64,
}

impl InvalidationClock {
    pub fn new(initial_ms: i64) -> Self {
        Self {
            timestamp_ms: AtomicI64::new(initial_ms),
        }
    }

    pub fn current(&self) -> i64 {
        self.timestamp_ms.load(Ordering::Acquire)
    }

    /// Advance to `timestamp_ms`; returns false if it is not newer
    pub fn advance_to(&self, timestamp_ms: i64) -> bool {
        self.timestamp_ms.fetch_max(timestamp_ms, Ordering::AcqRel) < timestamp_ms
    }
}

/// Rate-limited watcher of the flush file
pub struct FlushFilePoller {
    path: PathBuf,
    interval: Duration,
    clock: Arc<InvalidationClock>,
    last_check: Mutex<Option<Instant>>,
    stats: Option<Arc<RewriteStats>>,
}

impl FlushFilePoller {
    pub fn new(path: impl Into<PathBuf>, interval: Duration, clock: Arc<InvalidationClock>) -> Self {
        Self {
            path: path.into(),
            interval,
            clock,
            last_check: Mutex::new(None),
            stats: None,
        }
    }

    pub fn with_stats(mut self, stats: Arc<RewriteStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Check the flush file unless it was checked within the poll interval
    ///
    /// Returns true when the invalidation timestamp advanced.
    pub fn poll(&self) -> bool {
        {
            let mut last = self.last_check.lock();
            let now = Instant::now();
            if let Some(at) = *last {
                if now.duration_since(at) < self.interval {
                    return false;
                }
            }
            *last = Some(now);
        }
        self.check_now()
    }

    /// Check the flush file immediately
    pub fn check_now(&self) -> bool {
        let mtime_ms = match std::fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(mtime) => match mtime.duration_since(UNIX_EPOCH) {
                Ok(d) => d.as_millis() as i64,
                Err(_) => return false,
            },
            Err(_) => return false,
        };

        if self.clock.advance_to(mtime_ms) {
            info!(
                "Cache flush: {} advanced invalidation timestamp to {}",
                self.path.display(),
                mtime_ms
            );
            if let Some(stats) = &self.stats {
                stats.cache_flushes.inc();
            }
            true
        } else {
            debug!("Flush file {} unchanged", self.path.display());
            false
        }
    }

    /// Poll on the current runtime every interval until cancelled
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let poller = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(poller.interval) => {
                        poller.poll();
                    }
                }
            }
        })
    }
}
