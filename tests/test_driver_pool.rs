//! Integration tests for driver reuse and the driver lifecycle

use http::HeaderMap;
use pingora_pagespeed::driver::SharedBuffer;
use pingora_pagespeed::pool::DEFAULT_MAX_SIGNATURES;
use pingora_pagespeed::{DriverState, FilterId, PagespeedError, RewriteOptionsBuilder, ServerConfig, ServerContext};
use std::sync::Arc;
use tempfile::TempDir;
use url::Url;

fn server(dir: &TempDir, pool_size: usize) -> ServerContext {
    let mut config = ServerConfig::with_cache_path(dir.path().to_string_lossy().into_owned());
    config.num_rewrite_threads = 1;
    config.num_expensive_rewrite_threads = 1;
    config.driver_pool_size = pool_size;
    ServerContext::new(config).unwrap()
}

fn page() -> Url {
    Url::parse("http://www.example.com/index.html").unwrap()
}

#[test]
fn test_recycled_driver_is_reused() {
    let dir = TempDir::new().unwrap();
    let server = server(&dir, 4);
    let options = server.options();

    let driver = server.acquire_driver(options.clone());
    let constructed = server.stats().drivers_constructed.get();
    server.recycle_driver(driver);
    assert_eq!(server.idle_drivers(), 1);

    let driver = server.acquire_driver(options.clone());
    assert_eq!(server.idle_drivers(), 0);
    assert_eq!(server.stats().drivers_constructed.get(), constructed);
    assert_eq!(driver.state(), DriverState::Idle);
    server.recycle_driver(driver);
}

#[test]
fn test_full_free_list_destroys_driver() {
    let dir = TempDir::new().unwrap();
    let server = server(&dir, 1);
    let options = server.options();

    let first = server.acquire_driver(options.clone());
    let second = server.acquire_driver(options.clone());
    server.recycle_driver(first);
    server.recycle_driver(second);

    assert_eq!(server.idle_drivers(), 1);
    assert_eq!(server.stats().drivers_recycled.get(), 1);
    assert_eq!(server.stats().drivers_destroyed.get(), 1);
}

#[test]
fn test_drivers_pooled_per_signature() {
    let dir = TempDir::new().unwrap();
    let server = server(&dir, 1);

    let plain = Arc::new(RewriteOptionsBuilder::new().freeze());
    let debug = Arc::new(RewriteOptionsBuilder::new().enable_filter(FilterId::Debug).freeze());
    assert_ne!(plain.signature(), debug.signature());

    let a = server.acquire_driver(plain.clone());
    let b = server.acquire_driver(debug.clone());
    assert_eq!(b.signature(), debug.signature());
    server.recycle_driver(a);
    server.recycle_driver(b);

    // Each signature has its own free list
    assert_eq!(server.idle_drivers(), 2);
    assert_eq!(server.stats().drivers_destroyed.get(), 0);
}

#[test]
fn test_cache_flush_retires_pooled_drivers() {
    let dir = TempDir::new().unwrap();
    let server = server(&dir, 4);

    let before_flush = server.acquire_driver(server.options());
    let in_flight = server.acquire_driver(server.options());
    server.recycle_driver(before_flush);
    assert_eq!(server.idle_drivers(), 1);

    let flushed_at = server.clock().current() + 1_000;
    assert!(server.clock().advance_to(flushed_at));
    let destroyed = server.stats().drivers_destroyed.get();

    // A driver signed before the flush is not kept
    server.recycle_driver(in_flight);
    assert_eq!(server.stats().drivers_destroyed.get(), destroyed + 2);
    assert_eq!(server.idle_drivers(), 0);
    assert_eq!(server.pooled_signatures(), 0);

    let after_flush = server.acquire_driver(server.options());
    assert_eq!(after_flush.options().cache_invalidation_timestamp_ms(), flushed_at);
    server.recycle_driver(after_flush);
    assert_eq!(server.idle_drivers(), 1);
    assert_eq!(server.pooled_signatures(), 1);
}

#[test]
fn test_repeated_flushes_keep_one_generation() {
    let dir = TempDir::new().unwrap();
    let server = server(&dir, 4);
    let start = server.clock().current();

    for generation in 1..=10 {
        let driver = server.acquire_driver(server.options());
        server.recycle_driver(driver);
        server.clock().advance_to(start + generation * 1_000);
    }
    let driver = server.acquire_driver(server.options());
    server.recycle_driver(driver);

    assert_eq!(server.pooled_signatures(), 1);
    assert_eq!(server.idle_drivers(), 1);
}

#[test]
fn test_distinct_signatures_are_bounded() {
    let dir = TempDir::new().unwrap();
    let server = server(&dir, 4);
    let extra = 4;

    for deadline in 0..(DEFAULT_MAX_SIGNATURES + extra) as u64 {
        let options = Arc::new(RewriteOptionsBuilder::new().rewrite_deadline_ms(deadline + 1).freeze());
        let driver = server.acquire_driver(options);
        server.recycle_driver(driver);
    }

    assert_eq!(server.pooled_signatures(), DEFAULT_MAX_SIGNATURES);
    assert_eq!(server.idle_drivers(), DEFAULT_MAX_SIGNATURES);
    assert_eq!(server.stats().drivers_destroyed.get(), extra as u64);
}

#[test]
fn test_driver_state_transitions() {
    let dir = TempDir::new().unwrap();
    let server = server(&dir, 2);
    let mut driver = server.acquire_driver(server.options());
    let output = SharedBuffer::new();
    driver.set_writer(Box::new(output.clone()));

    assert!(matches!(driver.parse_text(b"<p>"), Err(PagespeedError::InvalidState { .. })));

    driver.start_parse(page(), HeaderMap::new()).unwrap();
    assert_eq!(driver.state(), DriverState::Parsing);
    assert!(matches!(
        driver.start_parse(page(), HeaderMap::new()),
        Err(PagespeedError::InvalidState { .. })
    ));

    driver.parse_text(b"<p>hello").unwrap();
    driver.flush().unwrap();
    assert_eq!(driver.state(), DriverState::Parsing);
    driver.parse_text(b"</p>").unwrap();
    driver.finish_parse().unwrap();
    assert_eq!(driver.state(), DriverState::IdleDirty);
    assert_eq!(output.take(), b"<p>hello</p>".to_vec());

    // A finished driver must be cleared before the next document
    assert!(driver.start_parse(page(), HeaderMap::new()).is_err());
    driver.clear();
    assert_eq!(driver.state(), DriverState::Idle);
    driver.start_parse(page(), HeaderMap::new()).unwrap();
    server.recycle_driver(driver);
}

#[test]
fn test_aborted_driver_drops_pending_output() {
    let dir = TempDir::new().unwrap();
    let server = server(&dir, 2);
    let mut driver = server.acquire_driver(server.options());
    let output = SharedBuffer::new();
    driver.set_writer(Box::new(output.clone()));

    driver.start_parse(page(), HeaderMap::new()).unwrap();
    driver.parse_text(b"<div>never written</div>").unwrap();
    driver.abort();
    assert_eq!(driver.state(), DriverState::Aborted);
    assert!(driver.flush().is_err());
    assert!(output.is_empty());

    server.recycle_driver(driver);
    let driver = server.acquire_driver(server.options());
    assert_eq!(driver.state(), DriverState::Idle);
}
