//! Owned executor for rewrite work
//!
//! Drivers are synchronous and may block their calling thread while they
//! wait on rewrites, so contexts never run on the caller's runtime. The
//! [`Scheduler`] owns a multi-thread tokio runtime for inexpensive work and
//! bounds expensive optimizer work with a semaphore in front of the
//! blocking pool.

use crate::error::{PagespeedError, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::{Builder as TokioRuntimeBuilder, Handle, Runtime};
use tokio::sync::Semaphore;
use tracing::{debug, info};

/// Default worker count: the host's parallelism
pub fn default_thread_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Counts detached tasks so shutdown and tests can wait for quiescence
#[derive(Debug, Default)]
pub struct BackgroundTracker {
    outstanding: Mutex<usize>,
    idle: Condvar,
}

/// Held by a detached task for its lifetime
#[derive(Debug)]
pub struct BackgroundGuard {
    tracker: Arc<BackgroundTracker>,
}

impl BackgroundTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(self: &Arc<Self>) -> BackgroundGuard {
        *self.outstanding.lock() += 1;
        BackgroundGuard {
            tracker: Arc::clone(self),
        }
    }

    pub fn outstanding(&self) -> usize {
        *self.outstanding.lock()
    }

    /// Block until no task is outstanding or `timeout` elapses
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut outstanding = self.outstanding.lock();
        while *outstanding > 0 {
            if self.idle.wait_until(&mut outstanding, deadline).timed_out() {
                return *outstanding == 0;
            }
        }
        true
    }
}

impl Drop for BackgroundGuard {
    fn drop(&mut self) {
        let mut outstanding = self.tracker.outstanding.lock();
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.tracker.idle.notify_all();
        }
    }
}

pub struct Scheduler {
    runtime: Option<Runtime>,
    handle: Handle,
    expensive: Arc<Semaphore>,
    background: Arc<BackgroundTracker>,
}

impl Scheduler {
    /// # Arguments
    /// * `num_threads` - workers for fetches, cache lookups and coordination
    /// * `num_expensive` - concurrent expensive optimizations
    pub fn new(num_threads: usize, num_expensive: usize) -> Result<Self> {
        let runtime = TokioRuntimeBuilder::new_multi_thread()
            .worker_threads(num_threads.max(1))
            .max_blocking_threads(num_expensive.max(1) * 2)
            .thread_name("pagespeed-rewrite")
            .enable_all()
            .build()
            .map_err(|e| PagespeedError::ConfigError(format!("Failed to start rewrite runtime: {}", e)))?;
        info!(
            "Rewrite scheduler started: {} workers, {} expensive",
            num_threads, num_expensive
        );
        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
            expensive: Arc::new(Semaphore::new(num_expensive.max(1))),
            background: Arc::new(BackgroundTracker::new()),
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn expensive_permits(&self) -> &Arc<Semaphore> {
        &self.expensive
    }

    pub fn background(&self) -> &Arc<BackgroundTracker> {
        &self.background
    }

    /// Run `future` to completion from a thread outside the runtime
    pub fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }

    /// Stop the runtime without waiting for detached tasks
    pub fn shutdown(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            debug!(
                "Stopping rewrite scheduler with {} background tasks",
                self.background.outstanding()
            );
            self.expensive.close();
            runtime.shutdown_background();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_waits_for_guards() {
        let tracker = Arc::new(BackgroundTracker::new());
        let guard = tracker.enter();
        assert_eq!(tracker.outstanding(), 1);
        assert!(!tracker.wait_idle(Duration::from_millis(10)));

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            drop(guard);
        });
        assert!(tracker.wait_idle(Duration::from_secs(5)));
        handle.join().unwrap();
    }

    #[test]
    fn test_scheduler_runs_tasks() {
        let scheduler = Scheduler::new(2, 1).unwrap();
        let value = scheduler.block_on(async {
            tokio::task::spawn_blocking(|| 21 * 2).await.unwrap()
        });
        assert_eq!(value, 42);
    }
}
