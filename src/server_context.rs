//! Process-scoped rewrite server
//!
//! [`ServerContext`] performs startup (runtime, cache tiers, janitor, flush
//! polling, statistics) and teardown, and is the library entry point:
//! synchronous HTML rewriting through pooled drivers, generated-resource
//! serving and in-place optimization. The shared machinery contexts and
//! optimizers reach through lives in [`RewriteEngine`].

use crate::cache::fallback::{self, FallbackCache};
use crate::cache::file::{FileCache, FileCacheConfig};
use crate::cache::lru_cache::ThreadsafeLruCache;
use crate::cache::memcached::{MemcachedCache, MemcachedConfig};
use crate::cache::shm::{ShmCache, ShmCacheConfig};
use crate::cache::{CacheInterface, CacheStack};
use crate::config::{RewriteConfig, ServerConfig};
use crate::context::{
    build_artifact, input_from_response, ResourceInput, RewriteContext, RewriteOutcome, SingleFlight,
};
use crate::driver::{RewriteDriver, SharedBuffer};
use crate::error::{PagespeedError, Result};
use crate::fetcher::{AsyncFetch, HttpFetcher, RateControllingFetcher, UrlAsyncFetcher};
use crate::filters::{default_optimizers, ImageCodec, NoopImageCodec};
use crate::http_cache::{CachedResponse, FailureKind, HttpCache, HttpLookup};
use crate::invalidation::{FlushFilePoller, InvalidationClock};
use crate::ipro::{in_place_filter, InPlaceRecorder, RecordingSlot};
use crate::optimizer::{InputResource, OptimizeEnv, Optimizer};
use crate::options::{FilterId, RewriteOptions};
use crate::pool::DriverPool;
use crate::resource_namer::{content_hash, decode, ResourceKind};
use crate::scheduler::{BackgroundTracker, Scheduler};
use crate::scoreboard::Scoreboard;
use crate::stats::RewriteStats;
use futures::future::join_all;
use http::HeaderMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Retries for origin fetches
const FETCH_RETRIES: usize = 2;

/// How long teardown waits for detached rewrites
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Served for a reconstructed artifact whose hash disagrees with its URL
const MISMATCH_CACHE_CONTROL: &str = "max-age=300,private";

/// Shared machinery for contexts, optimizers and in-place optimization
pub struct RewriteEngine {
    handle: Handle,
    expensive: Arc<Semaphore>,
    background: Arc<BackgroundTracker>,
    cache: Arc<CacheStack>,
    http_cache: HttpCache,
    ipro_cache: HttpCache,
    fetcher: Arc<dyn UrlAsyncFetcher>,
    stats: Arc<RewriteStats>,
    single_flight: SingleFlight,
    optimizers: HashMap<FilterId, Arc<dyn Optimizer>>,
    next_context_id: AtomicU64,
    ipro_max_response_bytes: usize,
    ipro_max_recordings: usize,
    ipro_recordings: Arc<AtomicUsize>,
}

impl RewriteEngine {
    pub fn stats(&self) -> &Arc<RewriteStats> {
        &self.stats
    }

    pub fn single_flight(&self) -> &SingleFlight {
        &self.single_flight
    }

    pub fn cache(&self) -> &Arc<CacheStack> {
        &self.cache
    }

    /// Fetched inputs and generated artifacts
    pub fn http_cache(&self) -> &HttpCache {
        &self.http_cache
    }

    /// In-place optimized variants keyed by original URL
    pub fn ipro_cache(&self) -> &HttpCache {
        &self.ipro_cache
    }

    pub fn optimizer(&self, filter: FilterId) -> Option<Arc<dyn Optimizer>> {
        self.optimizers.get(&filter).cloned()
    }

    pub fn expensive_permits(&self) -> &Semaphore {
        &self.expensive
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub(crate) fn next_context_id(&self) -> u64 {
        self.next_context_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Run `future` detached on the rewrite runtime, tracked for quiescence
    pub fn spawn_background<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.background.enter();
        self.handle.spawn(async move {
            let _guard = guard;
            future.await;
        });
    }

    /// Fetch `url` through the HTTP cache
    ///
    /// Failures are remembered so the origin is not asked again until the
    /// negative entry expires.
    pub async fn fetch_resource(
        &self,
        url: &Url,
        request_headers: &HeaderMap,
        options: &RewriteOptions,
    ) -> Result<CachedResponse> {
        match self.http_cache.find(url.as_str(), request_headers, options).await {
            HttpLookup::Found(response) => return Ok(response),
            HttpLookup::RecentFailure(kind) => {
                return Err(PagespeedError::FetchError {
                    url: url.to_string(),
                    message: format!("recently failed ({:?})", kind),
                })
            }
            HttpLookup::NotFound => {}
        }

        let origin = options.domain_lawyer().map_origin(url.as_str());
        let origin = Url::parse(&origin).map_err(|e| PagespeedError::FetchError {
            url: origin.clone(),
            message: e.to_string(),
        })?;
        self.stats.fetches.inc();
        let response = match self.fetcher.fetch(&origin, request_headers).await {
            Ok(response) => response.into_cached(),
            Err(e) => {
                debug!("Fetch of {} failed: {}", origin, e);
                self.stats.fetch_failures.inc();
                if !matches!(e, PagespeedError::FetchDropped(_)) {
                    self.http_cache
                        .remember_failure(url.as_str(), FailureKind::FetchFailed, options)
                        .await;
                }
                return Err(e);
            }
        };

        if response.status != 200 {
            self.stats.fetch_failures.inc();
            if let Some(kind) = FailureKind::from_status(response.status) {
                self.http_cache.remember_failure(url.as_str(), kind, options).await;
            }
            return Err(PagespeedError::from_http_status(response.status, url.as_str()));
        }

        self.http_cache
            .put(url.as_str(), request_headers, response, options)
            .await
            .ok_or_else(|| PagespeedError::FetchError {
                url: url.to_string(),
                message: "response is not cacheable".to_string(),
            })
    }

    /// Start a detached context whose outcome is posted to `scoreboard`
    ///
    /// The context is bounded by the fetch timeout and stops early when
    /// `cancel` fires; an abandoned context keeps running to warm the cache.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn start_rewrite(
        self: &Arc<Self>,
        id: u64,
        filter: FilterId,
        inputs: Vec<ResourceInput>,
        options: Arc<RewriteOptions>,
        request_headers: HeaderMap,
        scoreboard: Arc<Scoreboard>,
        cancel: CancellationToken,
    ) {
        let engine = Arc::clone(self);
        self.spawn_background(async move {
            engine.stats.rewrites_in_flight.inc();
            let timeout = Duration::from_millis(options.fetch_timeout_ms());
            let context = RewriteContext::new(&engine, filter, &inputs, &options, &request_headers, 0);
            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Context {} cancelled", id);
                    RewriteOutcome::Failed
                }
                result = tokio::time::timeout(timeout, context.run()) => match result {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        debug!("Context {} timed out after {:?}", id, timeout);
                        RewriteOutcome::Failed
                    }
                },
            };
            engine.stats.rewrites_in_flight.dec();
            scoreboard.post(id, outcome);
        });
    }

    /// Serve a generated resource URL, reconstructing it on a cache miss
    ///
    /// Returns `Ok(None)` when `url` is not a generated URL or its inputs
    /// cannot be rewritten.
    pub async fn serve_generated(
        &self,
        url: &Url,
        request_headers: &HeaderMap,
        options: &RewriteOptions,
    ) -> Result<Option<CachedResponse>> {
        let canonical = options.domain_lawyer().reverse_map_rewrite(url.as_str());
        let canonical = Url::parse(&canonical).map_err(|e| PagespeedError::ParseError(e.to_string()))?;
        let Some(name) = decode(&canonical) else {
            return Ok(None);
        };

        if let HttpLookup::Found(response) = self
            .http_cache
            .find(canonical.as_str(), &HeaderMap::new(), options)
            .await
        {
            self.stats.resources_served.inc();
            return Ok(Some(response));
        }

        debug!("Reconstructing {}", canonical);
        let inputs = join_all(
            name.inputs
                .iter()
                .map(|input| self.fetch_resource(input, request_headers, options)),
        )
        .await;
        let inputs: Vec<InputResource> = match inputs.into_iter().collect::<Result<Vec<_>>>() {
            Ok(responses) => responses
                .into_iter()
                .zip(name.inputs.iter())
                .map(|(response, url)| input_from_response(url.clone(), response))
                .collect(),
            Err(e) => {
                debug!("Cannot reconstruct {}: {}", canonical, e);
                self.stats.resources_not_found.inc();
                return Ok(None);
            }
        };

        let Some(optimizer) = self.optimizer(name.filter) else {
            self.stats.resources_not_found.inc();
            return Ok(None);
        };
        self.stats.record_optimizer_invocation(name.filter);
        let env = OptimizeEnv::new(self, options, request_headers, 0);
        let output = match optimizer.optimize(inputs, &env).await {
            Ok(output) => output,
            Err(e) => {
                debug!("Cannot reconstruct {}: {}", canonical, e);
                self.stats.resources_not_found.inc();
                return Ok(None);
            }
        };

        let Some((_, mut artifact)) = build_artifact(name.filter, &name.inputs, &output) else {
            self.stats.resources_not_found.inc();
            return Ok(None);
        };
        self.stats.resources_reconstructed.inc();
        if content_hash(&output.body) != name.hash {
            info!(
                "Reconstructed {} has hash {}, serving privately",
                canonical,
                content_hash(&output.body)
            );
            artifact.set_header("Cache-Control", MISMATCH_CACHE_CONTROL);
            return Ok(Some(artifact));
        }
        Ok(self
            .http_cache
            .put(canonical.as_str(), &HeaderMap::new(), artifact.clone(), options)
            .await
            .or(Some(artifact)))
    }

    /// The in-place optimized variant of `url`, if one is cached
    pub async fn serve_in_place(
        &self,
        url: &Url,
        request_headers: &HeaderMap,
        options: &RewriteOptions,
    ) -> Option<CachedResponse> {
        match self.ipro_cache.find(url.as_str(), request_headers, options).await {
            HttpLookup::Found(response) => {
                self.stats.ipro_served.inc();
                Some(response)
            }
            _ => None,
        }
    }

    /// Rewrite the cached original of `url` and store the result as its
    /// in-place variant, carrying the origin's caching headers
    pub async fn optimize_in_place(
        &self,
        url: &Url,
        request_headers: &HeaderMap,
        options: &RewriteOptions,
        filter: FilterId,
    ) -> Option<CachedResponse> {
        let inputs = [ResourceInput::Url(url.clone())];
        let outcome = RewriteContext::new(self, filter, &inputs, options, request_headers, 0)
            .run()
            .await;
        let RewriteOutcome::Optimized { url: Some(generated), .. } = outcome else {
            debug!("No in-place variant for {}: {:?}", url, outcome);
            return None;
        };

        let HttpLookup::Found(artifact) = self
            .http_cache
            .find(&generated, &HeaderMap::new(), options)
            .await
        else {
            return None;
        };
        let HttpLookup::Found(original) = self.http_cache.find(url.as_str(), request_headers, options).await else {
            return None;
        };

        let artifact_content_type = artifact.content_type().map(str::to_string);
        let mut variant = CachedResponse::new(200, original.headers, artifact.body);
        if let Some(content_type) = artifact_content_type {
            variant.set_header("Content-Type", content_type);
        }
        variant.remove_header("Content-Length");
        variant.remove_header("Etag");
        self.ipro_cache
            .put(url.as_str(), request_headers, variant, options)
            .await
    }

    /// Look up the in-place variant of `url`; on a miss, optionally fetch
    /// the original and start producing a variant in the background
    pub fn fetch_in_place(
        self: &Arc<Self>,
        url: Url,
        options: Arc<RewriteOptions>,
        request_headers: HeaderMap,
        perform_http_fetch: bool,
        fetch: Box<dyn AsyncFetch>,
    ) {
        let engine = Arc::clone(self);
        self.spawn_background(async move {
            if let Some(variant) = engine.serve_in_place(&url, &request_headers, &options).await {
                fetch.done(Ok(variant));
                return;
            }
            if !perform_http_fetch {
                fetch.done(Err(PagespeedError::FetchError {
                    url: url.to_string(),
                    message: "not in cache".to_string(),
                }));
                return;
            }
            let result = engine.fetch_resource(&url, &request_headers, &options).await;
            let filter = result
                .as_ref()
                .ok()
                .and_then(|r| in_place_filter(ResourceKind::from_content_type(r.content_type().unwrap_or("")), &options));
            fetch.done(result);
            if let Some(filter) = filter {
                engine
                    .optimize_in_place(&url, &request_headers, &options, filter)
                    .await;
            }
        });
    }

    /// A recorder for a pass-through response, unless in-place optimization
    /// is off or too many recordings are active
    pub fn new_in_place_recorder(
        self: &Arc<Self>,
        url: Url,
        options: Arc<RewriteOptions>,
        request_headers: HeaderMap,
    ) -> Option<InPlaceRecorder> {
        if !options.enabled() || !options.in_place_resource_optimization() {
            return None;
        }
        self.stats.ipro_recorder_resources.inc();
        let Some(slot) = RecordingSlot::try_acquire(&self.ipro_recordings, self.ipro_max_recordings) else {
            debug!("Not recording {}: too many recordings active", url);
            self.stats.ipro_recorder_dropped_due_to_load.inc();
            return None;
        };
        Some(InPlaceRecorder::new(
            Arc::clone(self),
            url,
            options,
            request_headers,
            self.ipro_max_response_bytes,
            slot,
        ))
    }
}

/// Completes an [`AsyncFetch`] into a std channel for blocking callers
struct BlockingFetch(std::sync::mpsc::SyncSender<Result<CachedResponse>>);

impl AsyncFetch for BlockingFetch {
    fn done(self: Box<Self>, result: Result<CachedResponse>) {
        let _ = self.0.send(result);
    }
}

/// Startup options beyond [`ServerConfig`]
pub struct ServerContextBuilder {
    config: ServerConfig,
    fetcher: Option<Arc<dyn UrlAsyncFetcher>>,
    image_codec: Arc<dyn ImageCodec>,
}

impl ServerContextBuilder {
    /// Fetcher for origin resources; defaults to an HTTP fetcher
    pub fn fetcher(mut self, fetcher: Arc<dyn UrlAsyncFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn image_codec(mut self, codec: Arc<dyn ImageCodec>) -> Self {
        self.image_codec = codec;
        self
    }

    /// Start the server
    ///
    /// Fails on inconsistent configuration or an unusable cache root.
    pub fn build(self) -> Result<ServerContext> {
        let config = self.config;
        config.validate()?;
        let base_options = config.rewrite.to_options()?;

        let stats = Arc::new(
            RewriteStats::new().map_err(|e| PagespeedError::InternalError(format!("statistics: {}", e)))?,
        );
        let scheduler = Scheduler::new(config.num_rewrite_threads, config.num_expensive_rewrite_threads)?;
        let clock = Arc::new(InvalidationClock::new(base_options.cache_invalidation_timestamp_ms()));

        let mut file_config = FileCacheConfig::new(&config.file_cache_path);
        file_config.clean_interval = Duration::from_millis(config.file_cache_clean_interval_ms);
        file_config.target_size_bytes = config.file_cache_clean_size_kb * 1024;
        file_config.target_inode_count = config.file_cache_clean_inode_limit;
        file_config.compression = config.file_cache_compression.clone();
        let file_cache = Arc::new(FileCache::new(file_config)?);

        let mut tiers: Vec<Arc<dyn CacheInterface>> = vec![Arc::new(ThreadsafeLruCache::new(
            config.lru_cache_kb * 1024,
            config.lru_cache_byte_limit,
        ))];
        let l2: Option<Arc<dyn CacheInterface>> = match (&config.memcached_server, config.shm_cache_size_kb) {
            (Some(server), _) => {
                let mut memcached = MemcachedConfig::new(server.as_str());
                memcached.op_timeout = Duration::from_millis(config.memcached_timeout_ms);
                info!("Using memcached L2 at {}", server);
                Some(Arc::new(MemcachedCache::new(memcached)) as Arc<dyn CacheInterface>)
            }
            (None, Some(kb)) => {
                let shm = ShmCache::new(ShmCacheConfig {
                    size_bytes: kb * 1024,
                    max_value_bytes: fallback::l2_record_capacity(config.l2_value_ceiling_bytes),
                    ..Default::default()
                })?;
                info!("Using {}KB shared-memory L2", kb);
                Some(Arc::new(shm) as Arc<dyn CacheInterface>)
            }
            (None, None) => None,
        };
        if let Some(l2) = l2 {
            tiers.push(Arc::new(FallbackCache::new(
                l2,
                file_cache.clone(),
                config.l2_value_ceiling_bytes,
                config.fallback_value_ceiling_bytes,
            )));
        }
        tiers.push(file_cache.clone());
        let cache = Arc::new(CacheStack::new(tiers, clock.clone()).with_stats(stats.clone()));

        let fetcher: Arc<dyn UrlAsyncFetcher> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpFetcher::new(
                Duration::from_millis(config.rewrite.fetch_timeout_ms),
                FETCH_RETRIES,
            )?),
        };
        let fetcher: Arc<dyn UrlAsyncFetcher> = Arc::new(
            RateControllingFetcher::new(
                fetcher,
                config.fetch_concurrency_per_host,
                config.fetch_queue_per_host,
            )
            .with_stats(stats.clone()),
        );

        let engine = Arc::new(RewriteEngine {
            handle: scheduler.handle().clone(),
            expensive: scheduler.expensive_permits().clone(),
            background: scheduler.background().clone(),
            http_cache: HttpCache::new(cache.clone(), "http/", config.max_cacheable_response_bytes),
            ipro_cache: HttpCache::new(cache.clone(), "ipro/", config.max_cacheable_response_bytes),
            cache,
            fetcher,
            stats: stats.clone(),
            single_flight: SingleFlight::new(),
            optimizers: default_optimizers(self.image_codec),
            next_context_id: AtomicU64::new(1),
            ipro_max_response_bytes: config.ipro_max_response_bytes,
            ipro_max_recordings: config.ipro_max_concurrent_recordings,
            ipro_recordings: Arc::new(AtomicUsize::new(0)),
        });

        let poller = Arc::new(
            FlushFilePoller::new(
                config.flush_file_path(),
                config.cache_flush_poll_interval(),
                clock.clone(),
            )
            .with_stats(stats),
        );
        poller.check_now();

        let cancel = CancellationToken::new();
        let tasks = {
            let _runtime = scheduler.handle().enter();
            vec![
                file_cache.start_janitor(cancel.child_token()),
                poller.start(cancel.child_token()),
            ]
        };

        info!(
            "Rewrite server started: cache at {}, filters {:?}",
            config.file_cache_path,
            base_options.enabled_filters().collect::<Vec<_>>()
        );
        Ok(ServerContext {
            pool: Mutex::new(DriverPool::new(engine.clone(), config.driver_pool_size)),
            engine,
            base_options: RwLock::new(Arc::new(base_options)),
            clock,
            poller,
            cancel,
            tasks: Mutex::new(tasks),
            scheduler: Mutex::new(scheduler),
            config,
        })
    }
}

pub struct ServerContext {
    config: ServerConfig,
    engine: Arc<RewriteEngine>,
    base_options: RwLock<Arc<RewriteOptions>>,
    pool: Mutex<DriverPool>,
    clock: Arc<InvalidationClock>,
    poller: Arc<FlushFilePoller>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    scheduler: Mutex<Scheduler>,
}

impl ServerContext {
    pub fn builder(config: ServerConfig) -> ServerContextBuilder {
        ServerContextBuilder {
            config,
            fetcher: None,
            image_codec: Arc::new(NoopImageCodec),
        }
    }

    pub fn new(config: ServerConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<RewriteEngine> {
        &self.engine
    }

    pub fn stats(&self) -> &Arc<RewriteStats> {
        self.engine.stats()
    }

    pub fn clock(&self) -> &Arc<InvalidationClock> {
        &self.clock
    }

    /// Re-sign `options` when a cache flush advanced the clock past them
    fn refresh(&self, options: Arc<RewriteOptions>) -> Arc<RewriteOptions> {
        self.poller.poll();
        let now = self.clock.current();
        if now > options.cache_invalidation_timestamp_ms() {
            Arc::new(options.with_invalidation_timestamp(now))
        } else {
            options
        }
    }

    /// Base options, current with respect to cache flushes
    pub fn options(&self) -> Arc<RewriteOptions> {
        let current = self.base_options.read().clone();
        let refreshed = self.refresh(current.clone());
        if !Arc::ptr_eq(&current, &refreshed) {
            *self.base_options.write() = refreshed.clone();
        }
        refreshed
    }

    /// Options for a request to `url`, honoring query-parameter overrides
    pub fn options_for(&self, url: &Url) -> Arc<RewriteOptions> {
        let options = self.options();
        match options.with_query_overrides(url) {
            Some(overridden) => Arc::new(overridden),
            None => options,
        }
    }

    /// Replace the base options after a configuration reload
    pub fn update_rewrite_config(&self, rewrite: &RewriteConfig) -> Result<()> {
        let options = rewrite
            .to_options()?
            .with_invalidation_timestamp(self.clock.current());
        info!("Rewrite options updated, signature {}", options.signature());
        *self.base_options.write() = Arc::new(options);
        Ok(())
    }

    pub fn acquire_driver(&self, options: Arc<RewriteOptions>) -> RewriteDriver {
        let options = self.refresh(options);
        self.pool.lock().acquire(options)
    }

    pub fn recycle_driver(&self, driver: RewriteDriver) {
        self.pool.lock().recycle(driver);
    }

    /// Idle pooled drivers across all signatures
    pub fn idle_drivers(&self) -> usize {
        self.pool.lock().total_idle()
    }

    /// Distinct option signatures holding idle drivers
    pub fn pooled_signatures(&self) -> usize {
        self.pool.lock().signatures()
    }

    /// Rewrite an HTML document delivered in `chunks`, flushing between
    /// chunks
    pub fn rewrite_html<'a>(
        &self,
        url: &Url,
        request_headers: &HeaderMap,
        chunks: impl IntoIterator<Item = &'a [u8]>,
    ) -> Result<Vec<u8>> {
        let mut driver = self.acquire_driver(self.options_for(url));
        let output = SharedBuffer::new();
        driver.set_writer(Box::new(output.clone()));

        let result = (|| {
            driver.start_parse(url.clone(), request_headers.clone())?;
            let mut chunks = chunks.into_iter().peekable();
            while let Some(chunk) = chunks.next() {
                driver.parse_text(chunk)?;
                if chunks.peek().is_some() {
                    driver.flush()?;
                }
            }
            driver.finish_parse()
        })();

        self.recycle_driver(driver);
        result.map(|_| output.take())
    }

    /// Run `future` on the rewrite runtime
    pub async fn run<F, T>(&self, future: F) -> Result<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.engine
            .handle()
            .spawn(future)
            .await
            .map_err(|e| PagespeedError::InternalError(format!("rewrite task failed: {}", e)))
    }

    /// Serve a generated resource URL; `Ok(None)` when `url` is not one or
    /// cannot be reconstructed
    pub async fn serve_resource(&self, url: &Url, request_headers: &HeaderMap) -> Result<Option<CachedResponse>> {
        let engine = self.engine.clone();
        let options = self.options_for(url);
        let url = url.clone();
        let headers = request_headers.clone();
        self.run(async move { engine.serve_generated(&url, &headers, &options).await })
            .await?
    }

    /// The in-place optimized variant of `url`, if one is cached
    pub async fn serve_in_place(&self, url: &Url, request_headers: &HeaderMap) -> Result<Option<CachedResponse>> {
        let engine = self.engine.clone();
        let options = self.options_for(url);
        let url = url.clone();
        let headers = request_headers.clone();
        self.run(async move { engine.serve_in_place(&url, &headers, &options).await })
            .await
    }

    /// Bounded synchronous wait for the in-place variant of `url`
    pub fn fetch_in_place_blocking(
        &self,
        url: &Url,
        request_headers: &HeaderMap,
        perform_http_fetch: bool,
        timeout: Duration,
    ) -> Result<CachedResponse> {
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        self.engine.fetch_in_place(
            url.clone(),
            self.options_for(url),
            request_headers.clone(),
            perform_http_fetch,
            Box::new(BlockingFetch(tx)),
        );
        rx.recv_timeout(timeout)
            .map_err(|_| PagespeedError::Timeout(format!("in-place lookup of {}", url)))?
    }

    pub fn new_in_place_recorder(&self, url: &Url, request_headers: &HeaderMap) -> Option<InPlaceRecorder> {
        self.engine
            .new_in_place_recorder(url.clone(), self.options_for(url), request_headers.clone())
    }

    /// Wait for detached rewrites to finish
    pub fn wait_for_background_rewrites(&self, timeout: Duration) -> bool {
        self.engine.background.wait_idle(timeout)
    }

    /// Name and health of each cache tier, front to back
    pub fn cache_tiers(&self) -> Vec<(&'static str, bool)> {
        self.engine
            .cache()
            .tiers()
            .iter()
            .map(|tier| (tier.name(), tier.is_healthy()))
            .collect()
    }

    /// Stop background tasks and release the runtime
    pub fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        info!("Rewrite server shutting down");
        self.cancel.cancel();
        if !self.wait_for_background_rewrites(SHUTDOWN_GRACE) {
            warn!(
                "{} background rewrites still running at shutdown",
                self.engine.background.outstanding()
            );
        }
        self.tasks.lock().clear();
        self.scheduler.lock().shutdown();
    }
}

impl Drop for ServerContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}
