//! Integration tests for the read-only admin endpoint

use pingora_pagespeed::{AdminEndpoint, MessageRing, ServerConfig, ServerContext};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

async fn start_admin(dir: &TempDir, messages: MessageRing) -> (String, tokio::task::JoinHandle<()>) {
    let mut config = ServerConfig::with_cache_path(dir.path().to_string_lossy().into_owned());
    config.num_rewrite_threads = 1;
    config.num_expensive_rewrite_threads = 1;
    config.rewrite.filters = vec!["extend_cache".to_string()];
    let server = Arc::new(ServerContext::new(config).unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let endpoint = AdminEndpoint::new(server, addr).with_messages(messages);
    let handle = tokio::spawn(async move {
        let _ = endpoint.serve(listener).await;
    });
    (format!("http://{}", addr), handle)
}

#[tokio::test]
async fn test_admin_endpoint_starts() {
    let dir = TempDir::new().unwrap();
    let mut config = ServerConfig::with_cache_path(dir.path().to_string_lossy().into_owned());
    config.num_rewrite_threads = 1;
    config.num_expensive_rewrite_threads = 1;
    let server = Arc::new(ServerContext::new(config).unwrap());

    let addr = "127.0.0.1:0".parse().unwrap();
    let endpoint = AdminEndpoint::new(server, addr);
    let handle = tokio::spawn(async move { endpoint.start().await });

    // Give it a moment to start
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_admin_pages() {
    let dir = TempDir::new().unwrap();
    let messages = MessageRing::new(10);
    messages.push("[INFO] pingora_pagespeed: hello from the log".to_string());
    let (base, handle) = start_admin(&dir, messages).await;
    let client = reqwest::Client::new();

    let health = client.get(format!("{}/health", base)).send().await.unwrap();
    assert_eq!(health.status(), 200);
    assert_eq!(health.text().await.unwrap(), "OK\n");

    let stats = client
        .get(format!("{}/pagespeed_admin/statistics", base))
        .send()
        .await
        .unwrap();
    assert_eq!(stats.status(), 200);
    assert!(stats
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
    let body = stats.text().await.unwrap();
    assert!(body.contains("pagespeed_cache_misses_total"));
    assert!(body.contains("pagespeed_fetches_total"));

    let history = client
        .get(format!("{}/pagespeed_admin/message_history", base))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(history.contains("hello from the log"));

    let cache: serde_json::Value = serde_json::from_str(
        &client
            .get(format!("{}/pagespeed_admin/cache", base))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap(),
    )
    .unwrap();
    let tiers = cache["tiers"].as_array().unwrap();
    assert_eq!(tiers.len(), 2);
    assert_eq!(tiers[0]["name"], "lru");
    assert_eq!(tiers[1]["name"], "file");
    assert_eq!(cache["invalidation_timestamp_ms"], 0);

    let config: serde_json::Value = serde_json::from_str(
        &client
            .get(format!("{}/pagespeed_admin/config", base))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap(),
    )
    .unwrap();
    assert_eq!(config["rewrite"]["filters"][0], "extend_cache");

    handle.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_admin_is_read_only() {
    let dir = TempDir::new().unwrap();
    let (base, handle) = start_admin(&dir, MessageRing::default()).await;
    let client = reqwest::Client::new();

    let post = client
        .post(format!("{}/pagespeed_admin/config", base))
        .body("rewrite: {}")
        .send()
        .await
        .unwrap();
    assert_eq!(post.status(), 405);

    let missing = client
        .get(format!("{}/pagespeed_admin/nope", base))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);

    handle.abort();
}
