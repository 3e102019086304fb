//! Prometheus statistics for the rewrite engine
//!
//! All counters are registered against a per-server [`Registry`] so that
//! several servers (or tests) can coexist in one process.

use crate::options::FilterId;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let counter = IntCounter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn counter_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<IntCounterVec, prometheus::Error> {
    let counter = IntCounterVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge, prometheus::Error> {
    let gauge = IntGauge::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

/// Engine-wide counters
pub struct RewriteStats {
    registry: Registry,

    pub cache_hits: IntCounterVec,
    pub cache_stale: IntCounterVec,
    pub cache_misses: IntCounter,
    pub cache_inserts: IntCounter,
    pub cache_flushes: IntCounter,

    pub rewrites_started: IntCounter,
    pub rewrites_fan_in: IntCounter,
    pub rewrites_cache_hits: IntCounter,
    pub rewrites_succeeded: IntCounter,
    pub rewrites_failed: IntCounter,
    pub rewrites_declined: IntCounter,
    pub slots_abandoned: IntCounter,
    pub slots_rendered: IntCounter,
    pub optimizer_invocations: IntCounterVec,
    pub rewrites_in_flight: IntGauge,

    pub fetches: IntCounter,
    pub fetch_failures: IntCounter,
    pub fetches_dropped: IntCounter,

    pub resources_served: IntCounter,
    pub resources_reconstructed: IntCounter,
    pub resources_not_found: IntCounter,

    pub ipro_recorder_resources: IntCounter,
    pub ipro_recorder_inserted_into_cache: IntCounter,
    pub ipro_recorder_not_cacheable: IntCounter,
    pub ipro_recorder_failed: IntCounter,
    pub ipro_recorder_dropped_due_to_load: IntCounter,
    pub ipro_recorder_dropped_due_to_size: IntCounter,
    pub ipro_served: IntCounter,

    pub drivers_constructed: IntCounter,
    pub drivers_recycled: IntCounter,
    pub drivers_destroyed: IntCounter,
    pub html_documents_rewritten: IntCounter,
}

/// Point-in-time copy of the headline counters
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub cache_misses: u64,
    pub cache_inserts: u64,
    pub cache_flushes: u64,
    pub rewrites_started: u64,
    pub rewrites_fan_in: u64,
    pub rewrites_cache_hits: u64,
    pub rewrites_succeeded: u64,
    pub rewrites_failed: u64,
    pub rewrites_declined: u64,
    pub slots_abandoned: u64,
    pub slots_rendered: u64,
    pub fetches: u64,
    pub fetch_failures: u64,
    pub fetches_dropped: u64,
    pub ipro_recorder_resources: u64,
    pub ipro_recorder_inserted_into_cache: u64,
    pub ipro_recorder_not_cacheable: u64,
    pub ipro_recorder_failed: u64,
    pub ipro_recorder_dropped_due_to_load: u64,
    pub ipro_recorder_dropped_due_to_size: u64,
    pub drivers_constructed: u64,
    pub drivers_recycled: u64,
    pub drivers_destroyed: u64,
}

impl RewriteStats {
    /// Create statistics on a fresh registry
    pub fn new() -> Result<Self, prometheus::Error> {
        Self::with_registry(Registry::new())
    }

    /// Create statistics registered against `registry`
    pub fn with_registry(registry: Registry) -> Result<Self, prometheus::Error> {
        let r = &registry;
        let stats = Self {
            cache_hits: counter_vec(
                r,
                "pagespeed_cache_hits_total",
                "Cache hits by tier",
                &["tier"],
            )?,
            cache_stale: counter_vec(
                r,
                "pagespeed_cache_stale_total",
                "Entries rejected by validity token, by tier",
                &["tier"],
            )?,
            cache_misses: counter(r, "pagespeed_cache_misses_total", "Cache misses on every tier")?,
            cache_inserts: counter(r, "pagespeed_cache_inserts_total", "Cache writes")?,
            cache_flushes: counter(
                r,
                "pagespeed_cache_flushes_total",
                "Invalidation timestamp advances from the flush file",
            )?,
            rewrites_started: counter(
                r,
                "pagespeed_rewrites_started_total",
                "Rewrite contexts that ran as primary",
            )?,
            rewrites_fan_in: counter(
                r,
                "pagespeed_rewrites_fan_in_total",
                "Rewrite contexts attached to an in-flight primary",
            )?,
            rewrites_cache_hits: counter(
                r,
                "pagespeed_rewrites_cache_hits_total",
                "Rewrite contexts satisfied from a cached record",
            )?,
            rewrites_succeeded: counter(
                r,
                "pagespeed_rewrites_succeeded_total",
                "Rewrites that produced an optimized artifact",
            )?,
            rewrites_failed: counter(
                r,
                "pagespeed_rewrites_failed_total",
                "Rewrites that failed to fetch or timed out",
            )?,
            rewrites_declined: counter(
                r,
                "pagespeed_rewrites_declined_total",
                "Rewrites the optimizer declined",
            )?,
            slots_abandoned: counter(
                r,
                "pagespeed_slots_abandoned_total",
                "HTML slots left unrendered at the rewrite deadline",
            )?,
            slots_rendered: counter(
                r,
                "pagespeed_slots_rendered_total",
                "HTML slots rewritten with an optimized URL",
            )?,
            optimizer_invocations: counter_vec(
                r,
                "pagespeed_optimizer_invocations_total",
                "Optimizer invocations by filter",
                &["filter"],
            )?,
            rewrites_in_flight: gauge(
                r,
                "pagespeed_rewrites_in_flight",
                "Rewrite contexts currently running",
            )?,
            fetches: counter(r, "pagespeed_fetches_total", "Origin fetches issued")?,
            fetch_failures: counter(r, "pagespeed_fetch_failures_total", "Origin fetches that failed")?,
            fetches_dropped: counter(
                r,
                "pagespeed_fetches_dropped_total",
                "Fetches refused by per-host rate control",
            )?,
            resources_served: counter(
                r,
                "pagespeed_resources_served_total",
                "Generated resources served from cache",
            )?,
            resources_reconstructed: counter(
                r,
                "pagespeed_resources_reconstructed_total",
                "Generated resources rebuilt on a cache miss",
            )?,
            resources_not_found: counter(
                r,
                "pagespeed_resources_not_found_total",
                "Generated resource requests that could not be served",
            )?,
            ipro_recorder_resources: counter(
                r,
                "ipro_recorder_resources",
                "Responses the in-place recorder started capturing",
            )?,
            ipro_recorder_inserted_into_cache: counter(
                r,
                "ipro_recorder_inserted_into_cache",
                "In-place captures written to cache",
            )?,
            ipro_recorder_not_cacheable: counter(
                r,
                "ipro_recorder_not_cacheable",
                "In-place captures rejected as uncacheable",
            )?,
            ipro_recorder_failed: counter(
                r,
                "ipro_recorder_failed",
                "In-place captures that failed",
            )?,
            ipro_recorder_dropped_due_to_load: counter(
                r,
                "ipro_recorder_dropped_due_to_load",
                "In-place captures refused for too many concurrent recordings",
            )?,
            ipro_recorder_dropped_due_to_size: counter(
                r,
                "ipro_recorder_dropped_due_to_size",
                "In-place captures abandoned for exceeding the size limit",
            )?,
            ipro_served: counter(
                r,
                "pagespeed_ipro_served_total",
                "Requests served an in-place optimized variant",
            )?,
            drivers_constructed: counter(
                r,
                "pagespeed_drivers_constructed_total",
                "Rewrite drivers constructed",
            )?,
            drivers_recycled: counter(
                r,
                "pagespeed_drivers_recycled_total",
                "Rewrite drivers returned to a pool",
            )?,
            drivers_destroyed: counter(
                r,
                "pagespeed_drivers_destroyed_total",
                "Rewrite drivers dropped instead of pooled",
            )?,
            html_documents_rewritten: counter(
                r,
                "pagespeed_html_documents_rewritten_total",
                "HTML documents that passed through a driver",
            )?,
            registry,
        };
        Ok(stats)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_cache_hit(&self, tier: &str) {
        self.cache_hits.with_label_values(&[tier]).inc();
    }

    pub fn record_cache_stale(&self, tier: &str) {
        self.cache_stale.with_label_values(&[tier]).inc();
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.inc();
    }

    pub fn record_cache_insert(&self) {
        self.cache_inserts.inc();
    }

    pub fn record_optimizer_invocation(&self, filter: FilterId) {
        self.optimizer_invocations
            .with_label_values(&[filter.code()])
            .inc();
    }

    pub fn optimizer_invocations(&self, filter: FilterId) -> u64 {
        self.optimizer_invocations
            .with_label_values(&[filter.code()])
            .get()
    }

    pub fn cache_hits(&self, tier: &str) -> u64 {
        self.cache_hits.with_label_values(&[tier]).get()
    }

    /// Render every metric in the Prometheus text exposition format
    pub fn encode_text(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cache_misses: self.cache_misses.get(),
            cache_inserts: self.cache_inserts.get(),
            cache_flushes: self.cache_flushes.get(),
            rewrites_started: self.rewrites_started.get(),
            rewrites_fan_in: self.rewrites_fan_in.get(),
            rewrites_cache_hits: self.rewrites_cache_hits.get(),
            rewrites_succeeded: self.rewrites_succeeded.get(),
            rewrites_failed: self.rewrites_failed.get(),
            rewrites_declined: self.rewrites_declined.get(),
            slots_abandoned: self.slots_abandoned.get(),
            slots_rendered: self.slots_rendered.get(),
            fetches: self.fetches.get(),
            fetch_failures: self.fetch_failures.get(),
            fetches_dropped: self.fetches_dropped.get(),
            ipro_recorder_resources: self.ipro_recorder_resources.get(),
            ipro_recorder_inserted_into_cache: self.ipro_recorder_inserted_into_cache.get(),
            ipro_recorder_not_cacheable: self.ipro_recorder_not_cacheable.get(),
            ipro_recorder_failed: self.ipro_recorder_failed.get(),
            ipro_recorder_dropped_due_to_load: self.ipro_recorder_dropped_due_to_load.get(),
            ipro_recorder_dropped_due_to_size: self.ipro_recorder_dropped_due_to_size.get(),
            drivers_constructed: self.drivers_constructed.get(),
            drivers_recycled: self.drivers_recycled.get(),
            drivers_destroyed: self.drivers_destroyed.get(),
        }
    }
}
