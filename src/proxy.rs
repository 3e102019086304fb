//! Pingora proxy adapter
//!
//! [`PagespeedProxy`] puts the rewrite server in front of an origin:
//!
//! - generated resource URLs and cached in-place variants are answered
//!   locally in `request_filter`
//! - HTML responses are streamed through a pooled [`RewriteDriver`], one
//!   flush per upstream body chunk
//! - other rewritable resources are observed by an [`InPlaceRecorder`] on
//!   their way to the client
//!
//! Only GET exchanges are rewritten or recorded. Everything else is proxied
//! untouched.

use crate::driver::{RewriteDriver, SharedBuffer};
use crate::http_cache::CachedResponse;
use crate::ipro::InPlaceRecorder;
use crate::resource_namer::{is_generated, ResourceKind};
use crate::server_context::ServerContext;
use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use parking_lot::Mutex;
use pingora::http::ResponseHeader;
use pingora::prelude::*;
use pingora_proxy::{ProxyHttp, Session};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;

/// Cache-Control sent with rewritten HTML when caching headers are managed
const HTML_CACHE_CONTROL: &str = "max-age=0, no-cache";

/// HTML being rewritten for one response
struct HtmlRewrite {
    driver: Mutex<RewriteDriver>,
    output: SharedBuffer,
}

/// What the proxy does with an upstream response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseHandling {
    /// Forward unchanged
    PassThrough,
    /// Forward unchanged, remembering the failure for in-place lookups
    RememberFailure,
    /// Stream through a rewrite driver
    RewriteHtml,
    /// Forward while recording the body for in-place optimization
    Record,
}

/// Decide how a response to `method` is handled
pub fn response_handling(method: &http::Method, status: u16, encoded: bool, kind: ResourceKind) -> ResponseHandling {
    if *method != http::Method::GET {
        return ResponseHandling::PassThrough;
    }
    if status != 200 {
        return ResponseHandling::RememberFailure;
    }
    if encoded {
        return ResponseHandling::PassThrough;
    }
    match kind {
        ResourceKind::Html => ResponseHandling::RewriteHtml,
        kind if kind.is_in_place_eligible() => ResponseHandling::Record,
        _ => ResponseHandling::PassThrough,
    }
}

/// Run blocking driver work, handing this worker's other tasks to another
/// thread while it waits
///
/// Outside a multi-threaded runtime `f` simply runs in place.
pub fn run_blocking<T>(f: impl FnOnce() -> T) -> T {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

/// Per-request state
#[derive(Default)]
pub struct PagespeedCtx {
    url: Option<Url>,
    method: Option<http::Method>,
    request_headers: HeaderMap,
    html: Option<HtmlRewrite>,
    recorder: Option<InPlaceRecorder>,
    status: u16,
    response_headers: Vec<(String, String)>,
    bytes_received: u64,
    served_locally: bool,
}

impl PagespeedCtx {
    pub fn url(&self) -> &str {
        self.url.as_ref().map_or("-", Url::as_str)
    }

    /// Whether the request may have its response rewritten or recorded
    pub fn is_get(&self) -> bool {
        self.method.as_ref() == Some(&http::Method::GET)
    }

    pub fn is_rewriting_html(&self) -> bool {
        self.html.is_some()
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_some()
    }

    pub fn served_locally(&self) -> bool {
        self.served_locally
    }
}

pub struct PagespeedProxy {
    server: Arc<ServerContext>,
    upstream: (String, u16),
}

impl PagespeedProxy {
    pub fn new(server: Arc<ServerContext>) -> Self {
        let upstream = parse_upstream(&server.config().upstream_address);
        Self { server, upstream }
    }

    pub fn server(&self) -> &Arc<ServerContext> {
        &self.server
    }

    /// Hand a finished driver back to the pool
    fn finish_html(&self, html: HtmlRewrite) {
        self.server.recycle_driver(html.driver.into_inner());
    }
}

/// Split "host:port", defaulting to port 80
pub fn parse_upstream(address: &str) -> (String, u16) {
    match address.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (address.to_string(), 80),
        },
        None => (address.to_string(), 80),
    }
}

/// Absolute URL of a proxied request
pub fn request_url(uri: &http::Uri, headers: &HeaderMap) -> Option<Url> {
    if uri.scheme().is_some() {
        return Url::parse(&uri.to_string()).ok();
    }
    let host = uri
        .authority()
        .map(|a| a.as_str().to_string())
        .or_else(|| headers.get(http::header::HOST)?.to_str().ok().map(str::to_string))?;
    let path = uri.path_and_query().map_or("/", |p| p.as_str());
    Url::parse(&format!("http://{}{}", host, path)).ok()
}

/// Response headers as ordered name/value pairs
pub fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn content_type(headers: &HeaderMap) -> &str {
    headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

fn internal(context: &str, e: impl std::fmt::Display) -> Box<Error> {
    warn!("{}: {}", context, e);
    Error::new(ErrorType::InternalError)
}

async fn write_cached(session: &mut Session, response: CachedResponse) -> Result<()> {
    let mut header = ResponseHeader::build(response.status, Some(response.headers.len() + 1))?;
    for (name, value) in &response.headers {
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("transfer-encoding") {
            continue;
        }
        header.append_header(name.clone(), value.as_str())?;
    }
    header.insert_header("Content-Length", response.body.len().to_string())?;
    session.write_response_header(Box::new(header), false).await?;
    session
        .write_response_body(Some(Bytes::from(response.body)), true)
        .await?;
    Ok(())
}

#[async_trait]
impl ProxyHttp for PagespeedProxy {
    type CTX = PagespeedCtx;

    fn new_ctx(&self) -> Self::CTX {
        PagespeedCtx::default()
    }

    /// Answer generated resources and in-place variants without the origin
    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool> {
        let req = session.req_header();
        ctx.url = request_url(&req.uri, &req.headers);
        ctx.request_headers = req.headers.clone();
        ctx.method = Some(req.method.clone());
        let Some(url) = ctx.url.clone() else {
            debug!("Request without a usable URL: {}", req.uri);
            return Ok(false);
        };
        if !ctx.is_get() {
            debug!("Proxying {} {} untouched", req.method, url);
            return Ok(false);
        }

        if is_generated(url.as_str()) {
            match self.server.serve_resource(&url, &ctx.request_headers).await {
                Ok(Some(response)) => {
                    info!("Serving generated resource {}", url);
                    ctx.served_locally = true;
                    write_cached(session, response).await?;
                    return Ok(true);
                }
                Ok(None) => debug!("{} not reconstructible, passing to origin", url),
                Err(e) => warn!("Serving {} failed: {}", url, e),
            }
            return Ok(false);
        }

        match self.server.serve_in_place(&url, &ctx.request_headers).await {
            Ok(Some(response)) => {
                debug!("Serving in-place variant of {}", url);
                ctx.served_locally = true;
                write_cached(session, response).await?;
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e) => {
                warn!("In-place lookup of {} failed: {}", url, e);
                Ok(false)
            }
        }
    }

    async fn upstream_peer(&self, _session: &mut Session, _ctx: &mut Self::CTX) -> Result<Box<HttpPeer>> {
        let (host, port) = &self.upstream;
        debug!("Upstream peer: {}:{}", host, port);
        Ok(Box::new(HttpPeer::new((host.as_str(), *port), false, host.clone())))
    }

    /// Ask the origin for identity-encoded bodies so they can be parsed
    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        if ctx.url.is_some() && ctx.is_get() && self.server.options().enabled() {
            upstream_request.remove_header("Accept-Encoding");
        }
        upstream_request.insert_header("Host", self.upstream.0.as_str())?;
        Ok(())
    }

    fn upstream_response_filter(
        &self,
        _session: &mut Session,
        upstream_response: &mut ResponseHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        ctx.status = upstream_response.status.as_u16();
        let (Some(url), Some(method)) = (ctx.url.clone(), ctx.method.as_ref()) else {
            return Ok(());
        };
        let encoded = upstream_response.headers.contains_key(http::header::CONTENT_ENCODING);
        let kind = ResourceKind::from_content_type(content_type(&upstream_response.headers));
        let handling = response_handling(method, ctx.status, encoded, kind);
        if handling == ResponseHandling::PassThrough {
            return Ok(());
        }
        ctx.response_headers = header_pairs(&upstream_response.headers);

        if handling == ResponseHandling::RememberFailure {
            ctx.recorder = self.server.new_in_place_recorder(&url, &ctx.request_headers);
        } else if handling == ResponseHandling::RewriteHtml {
            let options = self.server.options_for(&url);
            if !options.enabled() {
                return Ok(());
            }
            let modify_caching_headers = options.modify_caching_headers();
            let mut driver = self.server.acquire_driver(options);
            let output = SharedBuffer::new();
            driver.set_writer(Box::new(output.clone()));
            if let Err(e) = driver.start_parse(url.clone(), ctx.request_headers.clone()) {
                warn!("Cannot rewrite {}: {}", url, e);
                self.server.recycle_driver(driver);
                return Ok(());
            }
            upstream_response.remove_header("Content-Length");
            if modify_caching_headers {
                upstream_response.remove_header("Etag");
                upstream_response.remove_header("Last-Modified");
                upstream_response
                    .insert_header("Cache-Control", HTML_CACHE_CONTROL)
                    .map_err(|e| internal("Failed to set Cache-Control", e))?;
            }
            ctx.html = Some(HtmlRewrite {
                driver: Mutex::new(driver),
                output,
            });
        } else {
            ctx.recorder = self.server.new_in_place_recorder(&url, &ctx.request_headers);
            if let Some(recorder) = ctx.recorder.as_mut() {
                recorder.consider_response_headers(ctx.status, &ctx.response_headers);
            }
        }
        Ok(())
    }

    fn response_body_filter(
        &self,
        _session: &mut Session,
        body: &mut Option<Bytes>,
        end_of_stream: bool,
        ctx: &mut Self::CTX,
    ) -> Result<Option<Duration>> {
        if let Some(data) = body.as_ref() {
            ctx.bytes_received += data.len() as u64;
            if let Some(recorder) = ctx.recorder.as_mut() {
                recorder.write(data);
            }
        }

        if let Some(html) = ctx.html.as_mut() {
            let driver = html.driver.get_mut();
            let chunk = body.take().unwrap_or_default();
            let result = run_blocking(|| {
                driver.parse_text(&chunk)?;
                if end_of_stream {
                    driver.finish_parse()
                } else {
                    driver.flush()
                }
            });
            let output = html.output.take();
            if let Err(e) = result {
                error!("Rewriting {} failed: {}", ctx.url(), e);
                if let Some(html) = ctx.html.take() {
                    self.finish_html(html);
                }
                return Err(internal("HTML rewrite aborted", e));
            }
            *body = (!output.is_empty()).then(|| Bytes::from(output));
            if end_of_stream {
                if let Some(html) = ctx.html.take() {
                    self.finish_html(html);
                }
            }
        }

        if end_of_stream {
            if let Some(recorder) = ctx.recorder.take() {
                recorder.done(ctx.status, std::mem::take(&mut ctx.response_headers), true);
            }
        }
        Ok(None)
    }

    fn fail_to_connect(
        &self,
        _session: &mut Session,
        _peer: &HttpPeer,
        ctx: &mut Self::CTX,
        e: Box<Error>,
    ) -> Box<Error> {
        error!("Failed to connect to origin for {}: {}", ctx.url(), e);
        e
    }

    fn error_while_proxy(
        &self,
        _peer: &HttpPeer,
        _session: &mut Session,
        e: Box<Error>,
        ctx: &mut Self::CTX,
        _client_reused: bool,
    ) -> Box<Error> {
        error!("Error while proxying {}: {:?}", ctx.url(), e.etype());
        if let Some(recorder) = ctx.recorder.take() {
            recorder.done(ctx.status, std::mem::take(&mut ctx.response_headers), false);
        }
        if let Some(html) = ctx.html.take() {
            html.driver.lock().abort();
            self.finish_html(html);
        }
        e
    }

    async fn logging(&self, _session: &mut Session, e: Option<&Error>, ctx: &mut Self::CTX)
    where
        Self::CTX: Send + Sync,
    {
        if let Some(recorder) = ctx.recorder.take() {
            recorder.done(ctx.status, std::mem::take(&mut ctx.response_headers), false);
        }
        if let Some(html) = ctx.html.take() {
            html.driver.lock().abort();
            self.finish_html(html);
        }
        match e {
            Some(error) => error!("Request for {} completed with error: {}", ctx.url(), error),
            None => debug!(
                "Request for {} completed: status {}, {} bytes from origin{}",
                ctx.url(),
                ctx.status,
                ctx.bytes_received,
                if ctx.served_locally { ", served locally" } else { "" }
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_upstream() {
        assert_eq!(parse_upstream("origin.local:8081"), ("origin.local".to_string(), 8081));
        assert_eq!(parse_upstream("origin.local"), ("origin.local".to_string(), 80));
        assert_eq!(parse_upstream("origin.local:x"), ("origin.local:x".to_string(), 80));
    }

    #[test]
    fn test_request_url_from_host_header() {
        let uri: http::Uri = "/styles/a.css?v=1".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(http::header::HOST, "example.com".parse().unwrap());
        let url = request_url(&uri, &headers).unwrap();
        assert_eq!(url.as_str(), "http://example.com/styles/a.css?v=1");
        assert!(request_url(&uri, &HeaderMap::new()).is_none());
    }

    #[test]
    fn test_request_url_absolute_form() {
        let uri: http::Uri = "http://example.com/index.html".parse().unwrap();
        let url = request_url(&uri, &HeaderMap::new()).unwrap();
        assert_eq!(url.as_str(), "http://example.com/index.html");
    }

    #[test]
    fn test_only_get_responses_are_handled() {
        use http::Method;

        for method in [Method::POST, Method::PUT, Method::HEAD, Method::DELETE, Method::OPTIONS] {
            assert_eq!(
                response_handling(&method, 200, false, ResourceKind::Html),
                ResponseHandling::PassThrough
            );
            assert_eq!(
                response_handling(&method, 200, false, ResourceKind::Css),
                ResponseHandling::PassThrough
            );
            assert_eq!(
                response_handling(&method, 404, false, ResourceKind::Image),
                ResponseHandling::PassThrough
            );
        }
    }

    #[test]
    fn test_get_response_handling() {
        use http::Method;

        let get = Method::GET;
        assert_eq!(response_handling(&get, 200, false, ResourceKind::Html), ResponseHandling::RewriteHtml);
        assert_eq!(response_handling(&get, 200, false, ResourceKind::Css), ResponseHandling::Record);
        assert_eq!(response_handling(&get, 200, true, ResourceKind::Html), ResponseHandling::PassThrough);
        assert_eq!(response_handling(&get, 500, false, ResourceKind::Css), ResponseHandling::RememberFailure);
        assert_eq!(
            response_handling(&get, 200, false, ResourceKind::Other),
            ResponseHandling::PassThrough
        );
    }

    #[test]
    fn test_fresh_ctx_is_not_get() {
        let ctx = PagespeedCtx::default();
        assert!(!ctx.is_get());
        assert!(!ctx.is_rewriting_html());
        assert!(!ctx.is_recording());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_blocking_rewrite_leaves_worker_tasks_running() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker = {
            let ticks = ticks.clone();
            tokio::spawn(async move {
                loop {
                    ticks.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let blocked = {
            let ticks = ticks.clone();
            tokio::spawn(async move {
                let before = ticks.load(Ordering::SeqCst);
                run_blocking(|| std::thread::sleep(Duration::from_millis(200)));
                ticks.load(Ordering::SeqCst) - before
            })
        };
        let progressed = blocked.await.unwrap();
        ticker.abort();
        assert!(progressed >= 5, "only {} ticks while blocked", progressed);
    }

    #[tokio::test]
    async fn test_run_blocking_on_current_thread_runtime() {
        assert_eq!(run_blocking(|| 7), 7);
    }

    #[test]
    fn test_run_blocking_without_runtime() {
        assert_eq!(run_blocking(|| "done"), "done");
    }

    #[test]
    fn test_header_pairs_keep_order() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONTENT_TYPE, "text/css".parse().unwrap());
        headers.insert(http::header::CACHE_CONTROL, "max-age=60".parse().unwrap());
        let pairs = header_pairs(&headers);
        assert_eq!(pairs.len(), 2);
        assert!(pairs.contains(&("content-type".to_string(), "text/css".to_string())));
    }
}
