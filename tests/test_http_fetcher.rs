//! Origin fetching over HTTP against a mock origin

use http::{HeaderMap, HeaderValue};
use pingora_pagespeed::{HttpFetcher, PagespeedError, ServerConfig, ServerContext, UrlAsyncFetcher};
use std::time::Duration;
use tempfile::TempDir;
use url::Url;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fetcher() -> HttpFetcher {
    HttpFetcher::new(Duration::from_secs(5), 2).unwrap()
}

#[tokio::test]
async fn test_fetch_returns_origin_response() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/x.js"))
        .and(header("user-agent", "pagespeed-test"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "application/javascript")
                .insert_header("Cache-Control", "max-age=100")
                .set_body_string("x=0"),
        )
        .expect(1)
        .mount(&origin)
        .await;

    let mut headers = HeaderMap::new();
    headers.insert("user-agent", HeaderValue::from_static("pagespeed-test"));

    let url = Url::parse(&format!("{}/x.js", origin.uri())).unwrap();
    let response = fetcher().fetch(&url, &headers).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(&response.body[..], b"x=0");
    assert!(response
        .headers
        .iter()
        .any(|(n, v)| n == "cache-control" && v == "max-age=100"));
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing.css"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&origin)
        .await;

    let url = Url::parse(&format!("{}/missing.css", origin.uri())).unwrap();
    let response = fetcher().fetch(&url, &HeaderMap::new()).await.unwrap();
    assert_eq!(response.status, 404);
}

#[tokio::test]
async fn test_server_error_is_retried() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky.css"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&origin)
        .await;

    let url = Url::parse(&format!("{}/flaky.css", origin.uri())).unwrap();
    let response = fetcher().fetch(&url, &HeaderMap::new()).await.unwrap();
    assert_eq!(response.status, 503);
}

#[tokio::test]
async fn test_unreachable_origin_is_an_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let fetcher = HttpFetcher::new(Duration::from_millis(500), 0).unwrap();
    let url = Url::parse(&format!("http://{}/x.js", addr)).unwrap();
    let result = fetcher.fetch(&url, &HeaderMap::new()).await;
    assert!(matches!(
        result,
        Err(PagespeedError::FetchError { .. }) | Err(PagespeedError::Timeout(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_server_rewrites_against_http_origin() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/css/site.css"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "text/css")
                .insert_header("Cache-Control", "max-age=600")
                .set_body_string("body {  margin : 0 ; }"),
        )
        .expect(1)
        .mount(&origin)
        .await;

    let dir = TempDir::new().unwrap();
    let mut config = ServerConfig::with_cache_path(dir.path().to_string_lossy().into_owned());
    config.num_rewrite_threads = 2;
    config.num_expensive_rewrite_threads = 1;
    config.rewrite.filters = vec!["rewrite_css".to_string()];
    config.rewrite.rewrite_deadline_ms = 5000;
    let server = ServerContext::new(config).unwrap();

    let page = Url::parse(&format!("{}/index.html", origin.uri())).unwrap();
    let html: &[u8] = b"<link rel=stylesheet href=\"css/site.css\">";
    let out = server.rewrite_html(&page, &HeaderMap::new(), [html]).unwrap();
    let out = String::from_utf8(out).unwrap();
    assert!(out.contains("/css/site.css.pagespeed.cf."), "got {}", out);

    let generated = out
        .split('"')
        .find(|part| part.contains(".pagespeed.cf."))
        .unwrap();
    let served = server
        .serve_resource(&Url::parse(generated).unwrap(), &HeaderMap::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(served.body, b"body{margin :0}");
}
