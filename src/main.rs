//! Pingora Pagespeed Server
//!
//! Loads configuration, sets up logging, starts the rewrite server and its
//! admin endpoint, and runs the HTTP proxy service.

use anyhow::Context;
use pingora::server::Server;
use pingora_pagespeed::{AdminEndpoint, MessageRing, PagespeedProxy, ServerConfig, ServerContext};
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

/// Main entry point
///
/// # Usage
/// ```bash
/// # Start with default config (pingora_pagespeed.yaml)
/// cargo run
///
/// # Start with custom config
/// cargo run -- /path/to/config.yaml
/// ```
fn main() {
    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "pingora_pagespeed.yaml".to_string());

    let config = ServerConfig::from_file(&config_path);
    let history = config
        .as_ref()
        .ok()
        .and_then(|c| c.admin.as_ref())
        .map_or(pingora_pagespeed::message_ring::DEFAULT_MESSAGE_HISTORY, |a| {
            a.message_history_size
        });
    let messages = MessageRing::new(history);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_line_number(true)
                .with_filter(LevelFilter::INFO),
        )
        .with(messages.clone().with_filter(LevelFilter::INFO))
        .init();

    info!("Starting Pingora Pagespeed Server");
    info!("Loading configuration from: {}", config_path);

    let config = match config {
        Ok(cfg) => {
            info!("Configuration loaded successfully");
            info!("  - Upstream address: {}", cfg.upstream_address);
            info!("  - Listen address: {}", cfg.listen_address);
            info!("  - File cache: {}", cfg.file_cache_path);
            info!("  - LRU cache: {} KB", cfg.lru_cache_kb);
            info!("  - Filters: {:?}", cfg.rewrite.filters);
            cfg
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            error!("Please ensure the configuration file exists and is valid");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(config, messages) {
        error!("Server failed: {:#}", e);
        std::process::exit(1);
    }
}

fn run(config: ServerConfig, messages: MessageRing) -> anyhow::Result<()> {
    let server_context = Arc::new(ServerContext::new(config.clone()).context("starting rewrite server")?);

    if let Some(admin) = config.admin.as_ref().filter(|a| a.enabled) {
        let addr: SocketAddr = admin
            .address
            .parse()
            .with_context(|| format!("invalid admin address {}", admin.address))?;
        let endpoint = AdminEndpoint::new(server_context.clone(), addr).with_messages(messages);
        std::thread::Builder::new()
            .name("pagespeed-admin".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!("Failed to start admin runtime: {}", e);
                        return;
                    }
                };
                if let Err(e) = runtime.block_on(endpoint.start()) {
                    error!("Admin endpoint error: {}", e);
                }
            })
            .context("spawning admin thread")?;
    }

    let mut server = Server::new(None).map_err(|e| anyhow::anyhow!("creating proxy server: {}", e))?;
    server.bootstrap();

    let mut proxy_service = pingora_proxy::http_proxy_service(
        &server.configuration,
        PagespeedProxy::new(server_context),
    );
    proxy_service.add_tcp(&config.listen_address);
    server.add_service(proxy_service);

    info!("Proxy listening on {}", config.listen_address);
    server.run_forever()
}
