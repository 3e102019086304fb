//! Driver pool
//!
//! Building a driver builds its filter chain, so cleared drivers are kept
//! on per-signature free lists. The pool is not threadsafe; the server
//! context guards it with a mutex.

use crate::driver::RewriteDriver;
use crate::options::{RewriteOptions, Signature};
use crate::server_context::RewriteEngine;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Default per-signature ceiling
pub const DEFAULT_POOL_CEILING: usize = 50;

/// Distinct signatures kept at once; drivers for further signatures are
/// destroyed on recycle
pub const DEFAULT_MAX_SIGNATURES: usize = 64;

pub struct DriverPool {
    engine: Arc<RewriteEngine>,
    ceiling: usize,
    max_signatures: usize,
    free: HashMap<Signature, Vec<RewriteDriver>>,
    // invalidation timestamp the free lists were last pruned against
    generation: i64,
}

impl DriverPool {
    pub fn new(engine: Arc<RewriteEngine>, ceiling: usize) -> Self {
        Self {
            engine,
            ceiling,
            max_signatures: DEFAULT_MAX_SIGNATURES,
            free: HashMap::new(),
            generation: i64::MIN,
        }
    }

    /// Signatures currently holding idle drivers
    pub fn signatures(&self) -> usize {
        self.free.len()
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Idle drivers held for `signature`
    pub fn idle(&self, signature: Signature) -> usize {
        self.free.get(&signature).map_or(0, Vec::len)
    }

    pub fn total_idle(&self) -> usize {
        self.free.values().map(Vec::len).sum()
    }

    /// An idle driver built for `options`' signature, or a new one
    pub fn acquire(&mut self, options: Arc<RewriteOptions>) -> RewriteDriver {
        let signature = options.signature();
        let pooled = self.free.get_mut(&signature).and_then(Vec::pop);
        if self.free.get(&signature).is_some_and(Vec::is_empty) {
            self.free.remove(&signature);
        }
        match pooled {
            Some(mut driver) => {
                driver.set_options(options);
                driver
            }
            None => {
                debug!("Constructing driver for signature {:?}", signature);
                RewriteDriver::new(self.engine.clone(), options)
            }
        }
    }

    /// Clear `driver` and keep it, unless it predates the last cache
    /// flush or the pool is full
    pub fn recycle(&mut self, mut driver: RewriteDriver) {
        driver.clear();
        let current = self.engine.cache().clock().current();
        self.prune(current);
        if driver.options().cache_invalidation_timestamp_ms() < current {
            debug!("Destroying driver signed before cache flush at {}", current);
            self.engine.stats().drivers_destroyed.inc();
            return;
        }
        let signature = driver.signature();
        if !self.free.contains_key(&signature) && self.free.len() >= self.max_signatures {
            debug!("Destroying driver, {} signatures already pooled", self.free.len());
            self.engine.stats().drivers_destroyed.inc();
            return;
        }
        let list = self.free.entry(signature).or_default();
        if list.len() >= self.ceiling {
            self.engine.stats().drivers_destroyed.inc();
            return;
        }
        self.engine.stats().drivers_recycled.inc();
        list.push(driver);
    }

    /// Drop free lists signed before `current`
    fn prune(&mut self, current: i64) {
        if current <= self.generation {
            return;
        }
        self.generation = current;
        let stats = self.engine.stats().clone();
        self.free.retain(|_, list| {
            let live = list
                .first()
                .is_some_and(|d| d.options().cache_invalidation_timestamp_ms() >= current);
            if !live {
                stats.drivers_destroyed.inc_by(list.len() as u64);
            }
            live
        });
    }
}
