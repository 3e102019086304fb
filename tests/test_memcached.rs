//! Memcached tier against an in-process text-protocol server

use bytes::Bytes;
use pingora_pagespeed::cache::memcached::{MemcachedCache, MemcachedConfig};
use pingora_pagespeed::CacheInterface;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

type Store = Arc<Mutex<HashMap<String, Vec<u8>>>>;

/// Minimal memcached speaking get/set/delete
async fn spawn_fake_memcached() -> (String, Store) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let store: Store = Arc::new(Mutex::new(HashMap::new()));
    let shared = store.clone();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let store = shared.clone();
            tokio::spawn(async move {
                let mut conn = BufReader::new(stream);
                let mut line = String::new();
                loop {
                    line.clear();
                    match conn.read_line(&mut line).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                    let fields: Vec<String> =
                        line.split_whitespace().map(str::to_string).collect();
                    let reply = match fields.first().map(String::as_str) {
                        Some("get") => {
                            let store = store.lock().await;
                            match store.get(&fields[1]) {
                                Some(value) => {
                                    let mut out = format!("VALUE {} 0 {}\r\n", fields[1], value.len())
                                        .into_bytes();
                                    out.extend_from_slice(value);
                                    out.extend_from_slice(b"\r\nEND\r\n");
                                    out
                                }
                                None => b"END\r\n".to_vec(),
                            }
                        }
                        Some("set") => {
                            let len: usize = fields[4].parse().unwrap();
                            let mut data = vec![0u8; len + 2];
                            if conn.read_exact(&mut data).await.is_err() {
                                break;
                            }
                            data.truncate(len);
                            store.lock().await.insert(fields[1].clone(), data);
                            b"STORED\r\n".to_vec()
                        }
                        Some("delete") => match store.lock().await.remove(&fields[1]) {
                            Some(_) => b"DELETED\r\n".to_vec(),
                            None => b"NOT_FOUND\r\n".to_vec(),
                        },
                        _ => b"ERROR\r\n".to_vec(),
                    };
                    if conn.get_mut().write_all(&reply).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    (addr, store)
}

fn cache_for(addr: &str) -> MemcachedCache {
    let mut config = MemcachedConfig::new(addr);
    config.op_timeout = Duration::from_secs(2);
    MemcachedCache::new(config)
}

#[tokio::test]
async fn test_put_get_delete() {
    let (addr, store) = spawn_fake_memcached().await;
    let cache = cache_for(&addr);

    assert!(cache.get("http://a.com/x.css").await.is_none());

    cache
        .put("http://a.com/x.css", Bytes::from_static(b"a{color:red}"))
        .await;
    assert_eq!(store.lock().await.len(), 1);
    assert_eq!(
        cache.get("http://a.com/x.css").await,
        Some(Bytes::from_static(b"a{color:red}"))
    );

    cache.delete("http://a.com/x.css").await;
    assert!(cache.get("http://a.com/x.css").await.is_none());
    assert!(store.lock().await.is_empty());

    let stats = cache.get_stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 2);
    assert_eq!(stats.errors, 0);
    assert!(stats.healthy);
}

#[tokio::test]
async fn test_binary_value_with_crlf() {
    let (addr, _store) = spawn_fake_memcached().await;
    let cache = cache_for(&addr);

    let value = Bytes::from(b"line one\r\nEND\r\n\x00\xff".to_vec());
    cache.put("k", value.clone()).await;
    assert_eq!(cache.get("k").await, Some(value));
}

#[tokio::test]
async fn test_keys_are_hashed_on_the_wire() {
    let (addr, store) = spawn_fake_memcached().await;
    let cache = cache_for(&addr);

    cache
        .put("rname/ce/http://a.com/has spaces.css", Bytes::from_static(b"v"))
        .await;
    let store = store.lock().await;
    let key = store.keys().next().unwrap();
    assert!(key.starts_with("ps:"));
    assert!(!key.contains(' '));
}
