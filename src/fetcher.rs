//! Resource fetchers
//!
//! [`UrlAsyncFetcher`] is the seam between the rewrite engine and origin
//! servers. [`HttpFetcher`] is the production implementation over reqwest,
//! [`RateControllingFetcher`] bounds outstanding fetches per host, and
//! [`StaticFetcher`] serves scripted responses for tests and tooling.

use crate::error::{PagespeedError, Result};
use crate::http_cache::CachedResponse;
use crate::stats::RewriteStats;
use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use parking_lot::Mutex;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Semaphore};
use tokio::time::sleep;
use tracing::{debug, warn};
use url::Url;

/// An origin response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl FetchResponse {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// 200 response with a content type and cache lifetime
    pub fn ok(content_type: &str, max_age_secs: u64, body: impl Into<Bytes>) -> Self {
        Self::new(
            200,
            vec![
                ("Content-Type".to_string(), content_type.to_string()),
                (
                    "Cache-Control".to_string(),
                    format!("max-age={}", max_age_secs),
                ),
            ],
            body,
        )
    }

    pub fn into_cached(self) -> CachedResponse {
        CachedResponse::new(self.status, self.headers, self.body.to_vec())
    }
}

/// Asynchronous fetch of a single URL
#[async_trait]
pub trait UrlAsyncFetcher: Send + Sync {
    /// Fetch `url`
    ///
    /// Any HTTP response, including 4xx and 5xx, is `Ok`; `Err` means no
    /// usable response was received.
    async fn fetch(&self, url: &Url, request_headers: &HeaderMap) -> Result<FetchResponse>;
}

/// Exactly-once completion of a fetch handed to the engine
pub trait AsyncFetch: Send {
    fn done(self: Box<Self>, result: Result<CachedResponse>);
}

impl AsyncFetch for oneshot::Sender<Result<CachedResponse>> {
    fn done(self: Box<Self>, result: Result<CachedResponse>) {
        // The receiver may have gone away; that is not an error for the engine
        let _ = (*self).send(result);
    }
}

/// Retry policy for failed fetches
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries
    pub max_retries: usize,
    /// Backoff durations in milliseconds for each retry attempt
    pub backoff_ms: Vec<u64>,
}

impl RetryPolicy {
    /// Create a new retry policy with exponential backoff
    pub fn new(max_retries: usize) -> Self {
        // 100ms, 200ms, 400ms, ...
        let backoff_ms = (0..max_retries)
            .map(|i| 100 * 2u64.pow(i as u32))
            .collect();

        RetryPolicy {
            max_retries,
            backoff_ms,
        }
    }

    /// Check if we should retry based on the attempt number and error
    pub fn should_retry(&self, attempt: usize, error: &PagespeedError) -> bool {
        attempt < self.max_retries && error.should_retry()
    }

    /// Get the backoff duration for a given attempt
    pub fn backoff_duration(&self, attempt: usize) -> Duration {
        let ms = self
            .backoff_ms
            .get(attempt)
            .copied()
            .unwrap_or_else(|| *self.backoff_ms.last().unwrap_or(&1000));
        Duration::from_millis(ms)
    }
}

/// reqwest-backed origin fetcher
pub struct HttpFetcher {
    client: Client,
    retry_policy: RetryPolicy,
}

/// Request headers forwarded to the origin
const FORWARDED_HEADERS: [&str; 4] = ["user-agent", "accept", "accept-language", "referer"];

impl HttpFetcher {
    /// # Arguments
    /// * `timeout` - Per-attempt request timeout
    /// * `max_retries` - Maximum number of retry attempts for 5xx and transport errors
    pub fn new(timeout: Duration, max_retries: usize) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| {
                PagespeedError::ConfigError(format!("Failed to create HTTP client: {}", e))
            })?;
        Ok(Self {
            client,
            retry_policy: RetryPolicy::new(max_retries),
        })
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Single attempt, no retry
    async fn try_fetch(&self, url: &Url, request_headers: &HeaderMap) -> Result<FetchResponse> {
        let mut request = self.client.get(url.clone());
        for name in FORWARDED_HEADERS {
            for value in request_headers.get_all(name) {
                request = request.header(name, value.clone());
            }
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await?;
        Ok(FetchResponse::new(status, headers, body))
    }
}

#[async_trait]
impl UrlAsyncFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url, request_headers: &HeaderMap) -> Result<FetchResponse> {
        let mut attempt = 0;
        loop {
            let error = match self.try_fetch(url, request_headers).await {
                Ok(response) if response.status < 500 => return Ok(response),
                Ok(response) => {
                    if attempt >= self.retry_policy.max_retries {
                        return Ok(response);
                    }
                    PagespeedError::from_http_status(response.status, url.as_str())
                }
                Err(e) => e,
            };

            if !self.retry_policy.should_retry(attempt, &error) {
                return Err(error);
            }
            let backoff = self.retry_policy.backoff_duration(attempt);
            debug!(
                "Fetch of {} failed (attempt {}): {}, retrying in {:?}",
                url,
                attempt + 1,
                error,
                backoff
            );
            sleep(backoff).await;
            attempt += 1;
        }
    }
}

struct HostQueue {
    permits: Semaphore,
    waiting: AtomicUsize,
}

/// Bounds concurrent fetches per origin host
///
/// Up to `max_per_host` fetches run at once for a host and up to
/// `max_queue` more may wait; further fetches fail immediately with
/// [`PagespeedError::FetchDropped`].
pub struct RateControllingFetcher {
    inner: Arc<dyn UrlAsyncFetcher>,
    hosts: Mutex<HashMap<String, Arc<HostQueue>>>,
    max_per_host: usize,
    max_queue: usize,
    stats: Option<Arc<RewriteStats>>,
}

impl RateControllingFetcher {
    pub fn new(inner: Arc<dyn UrlAsyncFetcher>, max_per_host: usize, max_queue: usize) -> Self {
        Self {
            inner,
            hosts: Mutex::new(HashMap::new()),
            max_per_host,
            max_queue,
            stats: None,
        }
    }

    pub fn with_stats(mut self, stats: Arc<RewriteStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    fn queue_for(&self, host: &str) -> Arc<HostQueue> {
        let mut hosts = self.hosts.lock();
        hosts
            .entry(host.to_string())
            .or_insert_with(|| {
                Arc::new(HostQueue {
                    permits: Semaphore::new(self.max_per_host),
                    waiting: AtomicUsize::new(0),
                })
            })
            .clone()
    }
}

#[async_trait]
impl UrlAsyncFetcher for RateControllingFetcher {
    async fn fetch(&self, url: &Url, request_headers: &HeaderMap) -> Result<FetchResponse> {
        let host = url.host_str().unwrap_or("").to_string();
        let queue = self.queue_for(&host);

        let permit = match queue.permits.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                if queue.waiting.fetch_add(1, Ordering::AcqRel) >= self.max_queue {
                    queue.waiting.fetch_sub(1, Ordering::AcqRel);
                    if let Some(stats) = &self.stats {
                        stats.fetches_dropped.inc();
                    }
                    warn!("Dropping fetch of {}: too many queued for {}", url, host);
                    return Err(PagespeedError::FetchDropped(url.to_string()));
                }
                let acquired = queue.permits.acquire().await;
                queue.waiting.fetch_sub(1, Ordering::AcqRel);
                acquired.map_err(|_| PagespeedError::FetchDropped(url.to_string()))?
            }
        };

        let result = self.inner.fetch(url, request_headers).await;
        drop(permit);
        result
    }
}

#[derive(Clone)]
struct Scripted {
    result: std::result::Result<FetchResponse, PagespeedError>,
    delay: Duration,
}

/// Fetcher answering from a scripted table
///
/// Unknown URLs answer 404.
#[derive(Default)]
pub struct StaticFetcher {
    responses: Mutex<HashMap<String, Scripted>>,
    counts: Mutex<HashMap<String, usize>>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_response(&self, url: &str, response: FetchResponse) {
        self.set_delayed_response(url, response, Duration::ZERO);
    }

    pub fn set_delayed_response(&self, url: &str, response: FetchResponse, delay: Duration) {
        self.responses.lock().insert(
            url.to_string(),
            Scripted {
                result: Ok(response),
                delay,
            },
        );
    }

    pub fn set_error(&self, url: &str, error: PagespeedError) {
        self.responses.lock().insert(
            url.to_string(),
            Scripted {
                result: Err(error),
                delay: Duration::ZERO,
            },
        );
    }

    /// Number of fetches issued for `url`
    pub fn fetch_count(&self, url: &str) -> usize {
        self.counts.lock().get(url).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        self.counts.lock().values().sum()
    }
}

#[async_trait]
impl UrlAsyncFetcher for StaticFetcher {
    async fn fetch(&self, url: &Url, _request_headers: &HeaderMap) -> Result<FetchResponse> {
        *self.counts.lock().entry(url.to_string()).or_insert(0) += 1;
        let scripted = self.responses.lock().get(url.as_str()).cloned();
        match scripted {
            Some(scripted) => {
                if !scripted.delay.is_zero() {
                    sleep(scripted.delay).await;
                }
                scripted.result
            }
            None => Ok(FetchResponse::new(404, Vec::new(), Bytes::new())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_backoff() {
        let policy = RetryPolicy::new(3);
        assert_eq!(policy.backoff_duration(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_duration(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_duration(2), Duration::from_millis(400));
        assert_eq!(policy.backoff_duration(7), Duration::from_millis(400));
    }

    #[test]
    fn test_retry_policy_classification() {
        let policy = RetryPolicy::new(2);
        let server = PagespeedError::from_http_status(503, "busy");
        let client = PagespeedError::from_http_status(404, "gone");
        assert!(policy.should_retry(0, &server));
        assert!(!policy.should_retry(2, &server));
        assert!(!policy.should_retry(0, &client));
    }

    #[tokio::test]
    async fn test_static_fetcher_counts() {
        let fetcher = StaticFetcher::new();
        fetcher.set_response("http://a.com/x.js", FetchResponse::ok("application/javascript", 100, "x=0"));
        let url = Url::parse("http://a.com/x.js").unwrap();
        let response = fetcher.fetch(&url, &HeaderMap::new()).await.unwrap();
        assert_eq!(response.body, Bytes::from_static(b"x=0"));
        let missing = fetcher
            .fetch(&Url::parse("http://a.com/none").unwrap(), &HeaderMap::new())
            .await
            .unwrap();
        assert_eq!(missing.status, 404);
        assert_eq!(fetcher.fetch_count("http://a.com/x.js"), 1);
        assert_eq!(fetcher.total_fetches(), 2);
    }

    #[tokio::test]
    async fn test_rate_control_drops_when_queue_full() {
        let inner = Arc::new(StaticFetcher::new());
        inner.set_delayed_response(
            "http://a.com/slow",
            FetchResponse::ok("text/css", 100, "a{}"),
            Duration::from_millis(200),
        );
        let fetcher = Arc::new(RateControllingFetcher::new(inner.clone(), 1, 0));
        let url = Url::parse("http://a.com/slow").unwrap();

        let first = {
            let fetcher = fetcher.clone();
            let url = url.clone();
            tokio::spawn(async move { fetcher.fetch(&url, &HeaderMap::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = fetcher.fetch(&url, &HeaderMap::new()).await;
        assert!(matches!(second, Err(PagespeedError::FetchDropped(_))));
        assert!(first.await.unwrap().is_ok());
        assert_eq!(inner.fetch_count("http://a.com/slow"), 1);
    }

    #[tokio::test]
    async fn test_oneshot_async_fetch() {
        let (tx, rx) = oneshot::channel();
        let fetch: Box<dyn AsyncFetch> = Box::new(tx);
        fetch.done(Ok(CachedResponse::new(200, Vec::new(), b"ok".to_vec())));
        assert_eq!(rx.await.unwrap().unwrap().body, b"ok");
    }
}
