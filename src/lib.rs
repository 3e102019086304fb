//! Pingora Pagespeed
//!
//! A web-page rewriting proxy core for Pingora. HTML passing through the
//! proxy is parsed as a token stream and its resource references (style
//! sheets, images, scripts) are replaced by optimized, content-hashed,
//! long-cacheable URLs. Rewrites run asynchronously against a tiered cache
//! and never hold up the page past a short deadline: a rewrite that is not
//! ready in time leaves the original URL in place and finishes in the
//! background so the next request benefits.
//!
//! # Features
//!
//! - **Streaming HTML Rewriting**: Tokens are emitted at every flush; only
//!   the region about to be written waits on pending rewrites
//! - **Deadline-Bounded Rewrites**: Slow rewrites are abandoned, not waited on
//! - **Single-Flight Contexts**: Identical concurrent rewrites share one
//!   fetch and one optimization
//! - **Tiered Cache**: In-process LRU, optional memcached or shared-memory
//!   L2 with a size-threshold fallback to disk, and a janitor-managed file
//!   cache
//! - **In-Place Resource Optimization**: Resources passing through the proxy
//!   are recorded and optimized variants served under the original URL
//! - **Cache Flush**: Touching a flush file invalidates everything older
//! - **Metrics Collection**: Prometheus statistics and a read-only admin
//!   endpoint
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use pingora_pagespeed::{ServerConfig, ServerContext};
//! use http::HeaderMap;
//! use url::Url;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServerConfig::from_file("pingora_pagespeed.yaml")?;
//! let server = ServerContext::new(config)?;
//!
//! let url = Url::parse("http://www.example.com/index.html")?;
//! let html: &[u8] = b"<link rel=stylesheet href=a.css><p>hello</p>";
//! let rewritten = server.rewrite_html(&url, &HeaderMap::new(), [html])?;
//! println!("{}", String::from_utf8_lossy(&rewritten));
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`ServerContext`]: Process-scoped startup, teardown and entry points
//! - [`RewriteDriver`]: Rewrites one HTML document through a filter chain
//! - [`RewriteContext`]: One resource rewrite, shared across requests
//! - [`DriverPool`]: Reuses drivers per option signature
//! - [`CacheStack`]: Ordered cache tiers with validity checks
//! - [`HttpCache`]: HTTP-aware caching of fetched and generated resources
//! - [`InPlaceRecorder`]: Observes pass-through resources for optimization
//! - [`PagespeedProxy`]: Pingora `ProxyHttp` adapter
//! - [`AdminEndpoint`]: Statistics, message history and cache summary
//!
//! # Configuration
//!
//! Configuration is loaded from a YAML file:
//!
//! ```yaml
//! file_cache_path: "/var/cache/pagespeed"
//! lru_cache_kb: 8192
//! memcached_server: "127.0.0.1:11211"
//! upstream_address: "origin.example.com:80"
//! rewrite:
//!   filters: ["rewrite_css", "extend_cache"]
//!   domains: ["www.example.com"]
//! ```
//!
//! See [`ServerConfig`] for every option.
//!
//! # Error Handling
//!
//! ```rust,no_run
//! use pingora_pagespeed::{PagespeedError, ServerConfig};
//!
//! # fn main() {
//! match ServerConfig::from_file("config.yaml") {
//!     Ok(_config) => println!("Config loaded successfully"),
//!     Err(PagespeedError::ConfigError(msg)) => eprintln!("Config error: {}", msg),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! # }
//! ```

pub mod admin;
pub mod cache;
pub mod config;
pub mod context;
pub mod domain;
pub mod driver;
pub mod error;
pub mod fetcher;
pub mod filter;
pub mod filters;
pub mod html;
pub mod http_cache;
pub mod invalidation;
pub mod ipro;
pub mod message_ring;
pub mod optimizer;
pub mod options;
pub mod pool;
pub mod proxy;
pub mod resource_namer;
pub mod scheduler;
pub mod scoreboard;
pub mod server_context;
pub mod stats;

pub use admin::AdminEndpoint;
pub use cache::{CacheEntry, CacheInterface, CacheStack};
pub use config::{AdminConfig, ConfigChanges, RewriteConfig, ServerConfig};
pub use context::{ResourceInput, RewriteContext, RewriteOutcome};
pub use domain::DomainLawyer;
pub use driver::{DriverState, RewriteDriver, SharedBuffer};
pub use error::{PagespeedError, Result};
pub use fetcher::{AsyncFetch, FetchResponse, HttpFetcher, StaticFetcher, UrlAsyncFetcher};
pub use http_cache::{CachedResponse, HttpCache, HttpLookup};
pub use invalidation::{FlushFilePoller, InvalidationClock};
pub use ipro::InPlaceRecorder;
pub use message_ring::MessageRing;
pub use options::{FilterId, RewriteOptions, RewriteOptionsBuilder, Signature};
pub use pool::DriverPool;
pub use proxy::{PagespeedCtx, PagespeedProxy};
pub use server_context::{RewriteEngine, ServerContext, ServerContextBuilder};
pub use stats::RewriteStats;
