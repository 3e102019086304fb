//! HTTP response cache over the cache stack
//!
//! Stores whole responses (status, headers, body) keyed by URL within a
//! namespace (`http/` for fetched inputs and generated artifacts, `ipro/`
//! for in-place variants). Also remembers recent fetch failures so the
//! origin is not asked again until the failure record expires.

use crate::cache::{now_ms, CacheStack};
use crate::options::RewriteOptions;
use crate::resource_namer::content_hash;
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

/// Response headers never stored in the cache
const HOP_BY_HOP_HEADERS: [&str; 5] = [
    "set-cookie",
    "set-cookie2",
    "connection",
    "transfer-encoding",
    "keep-alive",
];

/// Case-insensitive lookup in a header list
pub fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// A response as stored in (and served from) the cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Absolute expiry in epoch milliseconds
    pub expires_ms: i64,
}

impl CachedResponse {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
            expires_ms: 0,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// Replace every value of `name` with `value`
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.remove_header(name);
        self.headers.push((name.to_string(), value.into()));
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_ms <= now_ms
    }

    /// Remaining freshness in milliseconds
    pub fn ttl_ms(&self, now_ms: i64) -> i64 {
        (self.expires_ms - now_ms).max(0)
    }
}

/// Result of Cache-Control analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub cacheable: bool,
    pub ttl_ms: i64,
}

impl CachePolicy {
    /// Analyze a response's caching headers
    ///
    /// Only 200 responses are cacheable. `no-store`, `no-cache`, `private`,
    /// `max-age=0` and `Vary: *` make a response uncacheable. Without an
    /// explicit max-age the implicit TTL applies.
    pub fn analyze(status: u16, headers: &[(String, String)], implicit_ttl_ms: u64) -> Self {
        let uncacheable = Self {
            cacheable: false,
            ttl_ms: 0,
        };
        if status != 200 {
            return uncacheable;
        }
        if find_header(headers, "vary").is_some_and(|v| v.split(',').any(|h| h.trim() == "*")) {
            return uncacheable;
        }

        let mut ttl_ms = implicit_ttl_ms as i64;
        let mut shared_max_age = None;
        for (name, value) in headers {
            if !name.eq_ignore_ascii_case("cache-control") {
                continue;
            }
            for directive in value.split(',') {
                let directive = directive.trim().to_ascii_lowercase();
                match directive.as_str() {
                    "no-store" | "no-cache" | "private" => return uncacheable,
                    d if d.starts_with("max-age=") => {
                        if let Ok(secs) = d["max-age=".len()..].trim_matches('"').parse::<i64>() {
                            ttl_ms = secs.saturating_mul(1000);
                        }
                    }
                    d if d.starts_with("s-maxage=") => {
                        shared_max_age = d["s-maxage=".len()..]
                            .trim_matches('"')
                            .parse::<i64>()
                            .ok();
                    }
                    _ => {}
                }
            }
        }
        if let Some(secs) = shared_max_age {
            ttl_ms = secs.saturating_mul(1000);
        }
        if ttl_ms <= 0 {
            return uncacheable;
        }
        Self {
            cacheable: true,
            ttl_ms,
        }
    }
}

/// Kinds of remembered fetch failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// Origin answered 4xx
    ClientError,
    /// Origin answered 5xx
    ServerError,
    /// 200 response that may not be cached
    NotCacheable,
    /// Transport error or timeout
    FetchFailed,
    /// Body exceeded the cacheable size
    TooLarge,
}

impl FailureKind {
    /// How long the failure is remembered before the origin is retried
    pub fn ttl_ms(&self) -> u64 {
        match self {
            FailureKind::ClientError => 5 * 60 * 1000,
            FailureKind::ServerError => 10 * 1000,
            FailureKind::NotCacheable => 5 * 60 * 1000,
            FailureKind::FetchFailed => 30 * 1000,
            FailureKind::TooLarge => 5 * 60 * 1000,
        }
    }

    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            400..=499 => Some(FailureKind::ClientError),
            500..=599 => Some(FailureKind::ServerError),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum HttpRecord {
    Response(CachedResponse),
    Failure { kind: FailureKind, expires_ms: i64 },
    /// Points at per-variant records keyed by these request headers
    Vary { headers: Vec<String>, expires_ms: i64 },
}

/// Outcome of an HTTP cache lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpLookup {
    Found(CachedResponse),
    RecentFailure(FailureKind),
    NotFound,
}

/// URL-keyed response cache
pub struct HttpCache {
    stack: Arc<CacheStack>,
    namespace: &'static str,
    max_cacheable_bytes: usize,
}

impl HttpCache {
    pub fn new(stack: Arc<CacheStack>, namespace: &'static str, max_cacheable_bytes: usize) -> Self {
        Self {
            stack,
            namespace,
            max_cacheable_bytes,
        }
    }

    pub fn stack(&self) -> &Arc<CacheStack> {
        &self.stack
    }

    pub fn key(&self, url: &str) -> String {
        format!("{}{}", self.namespace, url)
    }

    fn variant_key(base: &str, varied: &[String], request_headers: &HeaderMap) -> String {
        let mut material = String::new();
        for name in varied {
            material.push_str(name);
            material.push(':');
            for value in request_headers.get_all(name.as_str()) {
                material.push_str(value.to_str().unwrap_or(""));
                material.push(',');
            }
            material.push('\n');
        }
        format!("{}#vary:{:016x}", base, xxh3_64(material.as_bytes()))
    }

    async fn read(&self, key: &str, options: &RewriteOptions) -> Option<HttpRecord> {
        let entry = self
            .stack
            .lookup(key, options.cache_invalidation_timestamp_ms())
            .await?;
        match bincode::deserialize(&entry.payload) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Corrupt HTTP cache record for {}: {}", key, e);
                None
            }
        }
    }

    async fn write(&self, key: &str, record: &HttpRecord, cache_control: Option<String>, options: &RewriteOptions) {
        match bincode::serialize(record) {
            Ok(payload) => {
                self.stack
                    .put(
                        key,
                        payload,
                        cache_control,
                        options.cache_invalidation_timestamp_ms(),
                    )
                    .await
            }
            Err(e) => warn!("Failed to encode HTTP cache record for {}: {}", key, e),
        }
    }

    /// Look up `url` as requested with `request_headers`
    pub async fn find(
        &self,
        url: &str,
        request_headers: &HeaderMap,
        options: &RewriteOptions,
    ) -> HttpLookup {
        let now = now_ms();
        let base = self.key(url);
        let mut record = self.read(&base, options).await;

        if let Some(HttpRecord::Vary { headers, expires_ms }) = &record {
            if *expires_ms <= now || !options.respect_vary() {
                return HttpLookup::NotFound;
            }
            let key = Self::variant_key(&base, headers, request_headers);
            record = self.read(&key, options).await;
        }

        match record {
            Some(HttpRecord::Response(response)) if !response.is_expired(now) => {
                HttpLookup::Found(response)
            }
            Some(HttpRecord::Failure { kind, expires_ms }) if expires_ms > now => {
                HttpLookup::RecentFailure(kind)
            }
            _ => HttpLookup::NotFound,
        }
    }

    /// Store a response if it is cacheable
    ///
    /// Returns the stored (sanitized) response, or `None` when the response
    /// was not cacheable; in that case a `NotCacheable`/`TooLarge` failure is
    /// remembered instead.
    pub async fn put(
        &self,
        url: &str,
        request_headers: &HeaderMap,
        mut response: CachedResponse,
        options: &RewriteOptions,
    ) -> Option<CachedResponse> {
        let policy = CachePolicy::analyze(
            response.status,
            &response.headers,
            options.implicit_cache_ttl_ms(),
        );
        if !policy.cacheable {
            debug!("Not caching {} (status {})", url, response.status);
            let kind = FailureKind::from_status(response.status).unwrap_or(FailureKind::NotCacheable);
            self.remember_failure(url, kind, options).await;
            return None;
        }
        if response.body.len() > self.max_cacheable_bytes {
            debug!(
                "Not caching {}: {} bytes exceeds {}",
                url,
                response.body.len(),
                self.max_cacheable_bytes
            );
            self.remember_failure(url, FailureKind::TooLarge, options).await;
            return None;
        }

        response
            .headers
            .retain(|(name, _)| !HOP_BY_HOP_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h)));
        if response.header("etag").is_none() {
            let etag = format!("W/\"PSA-{}\"", content_hash(&response.body));
            response.headers.push(("Etag".to_string(), etag));
        }
        response.expires_ms = now_ms() + policy.ttl_ms;
        let cache_control = response.header("cache-control").map(str::to_string);

        let base = self.key(url);
        let varied: Vec<String> = if options.respect_vary() {
            response
                .header("vary")
                .map(|v| {
                    v.split(',')
                        .map(|h| h.trim().to_ascii_lowercase())
                        .filter(|h| !h.is_empty())
                        .collect()
                })
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        let record = HttpRecord::Response(response.clone());
        if varied.is_empty() {
            self.write(&base, &record, cache_control, options).await;
        } else {
            let key = Self::variant_key(&base, &varied, request_headers);
            self.write(&key, &record, cache_control, options).await;
            let marker = HttpRecord::Vary {
                headers: varied,
                expires_ms: response.expires_ms,
            };
            self.write(&base, &marker, None, options).await;
        }
        Some(response)
    }

    /// Remember that fetching `url` failed
    pub async fn remember_failure(&self, url: &str, kind: FailureKind, options: &RewriteOptions) {
        let ttl = kind.ttl_ms().min(options.max_negative_ttl_ms());
        let record = HttpRecord::Failure {
            kind,
            expires_ms: now_ms() + ttl as i64,
        };
        self.write(&self.key(url), &record, None, options).await;
    }

    pub async fn delete(&self, url: &str) {
        self.stack.delete(&self.key(url)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::lru_cache::ThreadsafeLruCache;
    use crate::invalidation::InvalidationClock;
    use crate::options::RewriteOptionsBuilder;

    fn http_cache() -> HttpCache {
        let stack = CacheStack::new(
            vec![Arc::new(ThreadsafeLruCache::new(1 << 20, 1 << 20))],
            Arc::new(InvalidationClock::new(0)),
        );
        HttpCache::new(Arc::new(stack), "http/", 1024)
    }

    fn ok(headers: &[(&str, &str)], body: &[u8]) -> CachedResponse {
        CachedResponse::new(
            200,
            headers
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
            body.to_vec(),
        )
    }

    #[test]
    fn test_cache_control_analysis() {
        let h = |v: &str| vec![("Cache-Control".to_string(), v.to_string())];
        assert_eq!(CachePolicy::analyze(200, &h("max-age=100"), 300_000).ttl_ms, 100_000);
        assert!(!CachePolicy::analyze(200, &h("private, max-age=100"), 300_000).cacheable);
        assert!(!CachePolicy::analyze(200, &h("max-age=0"), 300_000).cacheable);
        assert!(!CachePolicy::analyze(404, &[], 300_000).cacheable);
        assert_eq!(CachePolicy::analyze(200, &[], 300_000).ttl_ms, 300_000);
        assert_eq!(
            CachePolicy::analyze(200, &h("max-age=10, s-maxage=20"), 0).ttl_ms,
            20_000
        );
        let vary_star = vec![("Vary".to_string(), "*".to_string())];
        assert!(!CachePolicy::analyze(200, &vary_star, 300_000).cacheable);
    }

    #[tokio::test]
    async fn test_put_strips_headers_and_adds_etag() {
        let cache = http_cache();
        let options = RewriteOptions::default();
        let response = ok(
            &[("Cache-Control", "max-age=100"), ("Set-Cookie", "a=b"), ("Connection", "close")],
            b"x=0",
        );
        let stored = cache.put("http://a.com/x.js", &HeaderMap::new(), response, &options).await.unwrap();
        assert!(stored.header("set-cookie").is_none());
        assert!(stored.header("connection").is_none());
        assert!(stored.header("etag").unwrap().starts_with("W/\"PSA-"));

        match cache.find("http://a.com/x.js", &HeaderMap::new(), &options).await {
            HttpLookup::Found(found) => assert_eq!(found.body, b"x=0"),
            other => panic!("unexpected lookup result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_uncacheable_is_remembered() {
        let cache = http_cache();
        let options = RewriteOptions::default();
        let stored = cache
            .put("http://a.com/p.js", &HeaderMap::new(), ok(&[("Cache-Control", "no-store")], b"p"), &options)
            .await;
        assert!(stored.is_none());
        assert_eq!(
            cache.find("http://a.com/p.js", &HeaderMap::new(), &options).await,
            HttpLookup::RecentFailure(FailureKind::NotCacheable)
        );
    }

    #[tokio::test]
    async fn test_too_large_not_stored() {
        let cache = http_cache();
        let options = RewriteOptions::default();
        let stored = cache
            .put("http://a.com/big.js", &HeaderMap::new(), ok(&[], &[0u8; 2048]), &options)
            .await;
        assert!(stored.is_none());
        assert_eq!(
            cache.find("http://a.com/big.js", &HeaderMap::new(), &options).await,
            HttpLookup::RecentFailure(FailureKind::TooLarge)
        );
    }

    #[tokio::test]
    async fn test_failure_ttl_bounded_by_options() {
        let cache = http_cache();
        let mut builder = RewriteOptionsBuilder::new();
        builder.max_negative_ttl_ms = 0;
        let options = builder.freeze();
        cache.remember_failure("http://a.com/e", FailureKind::ClientError, &options).await;
        assert_eq!(
            cache.find("http://a.com/e", &HeaderMap::new(), &options).await,
            HttpLookup::NotFound
        );
    }

    #[tokio::test]
    async fn test_respect_vary_keys_on_listed_headers() {
        let cache = http_cache();
        let mut builder = RewriteOptionsBuilder::new();
        builder.respect_vary = true;
        let options = builder.freeze();

        let mut fr = HeaderMap::new();
        fr.insert("accept-language", "fr".parse().unwrap());
        let mut en = HeaderMap::new();
        en.insert("accept-language", "en".parse().unwrap());

        cache
            .put("http://a.com/v.css", &fr, ok(&[("Vary", "Accept-Language")], b"fr"), &options)
            .await
            .unwrap();
        assert!(matches!(
            cache.find("http://a.com/v.css", &fr, &options).await,
            HttpLookup::Found(r) if r.body == b"fr"
        ));
        assert_eq!(cache.find("http://a.com/v.css", &en, &options).await, HttpLookup::NotFound);
    }

    #[tokio::test]
    async fn test_vary_ignored_without_respect_vary() {
        let cache = http_cache();
        let options = RewriteOptions::default();
        cache
            .put("http://a.com/v.css", &HeaderMap::new(), ok(&[("Vary", "Accept-Language")], b"v"), &options)
            .await
            .unwrap();
        let mut en = HeaderMap::new();
        en.insert("accept-language", "en".parse().unwrap());
        assert!(matches!(cache.find("http://a.com/v.css", &en, &options).await, HttpLookup::Found(_)));
    }
}
