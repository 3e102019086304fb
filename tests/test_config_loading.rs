use pingora_pagespeed::cache::compression::CompressionAlgorithm;
use pingora_pagespeed::config::ServerConfig;
use pingora_pagespeed::options::FilterId;
use pingora_pagespeed::PagespeedError;

#[test]
fn test_load_demo_config() {
    let config = ServerConfig::from_file("demos/pingora_pagespeed.yaml");
    assert!(config.is_ok(), "Failed to load demo config: {:?}", config.err());

    let config = config.unwrap();
    assert_eq!(config.file_cache_path, "/var/cache/pagespeed");
    assert_eq!(config.lru_cache_kb, 8192);
    assert_eq!(config.memcached_server.as_deref(), Some("127.0.0.1:11211"));
    assert_eq!(config.upstream_address, "origin.example.com:80");
    assert_eq!(
        config.file_cache_compression.algorithm,
        CompressionAlgorithm::Zstd
    );
    assert_eq!(config.rewrite.filters.len(), 4);

    let admin = config.admin.as_ref().unwrap();
    assert!(admin.enabled);
    assert_eq!(admin.message_history_size, 500);

    let options = config.rewrite.to_options().unwrap();
    assert!(options.is_enabled(FilterId::CombineCss));
    assert!(options.is_enabled(FilterId::ExtendCache));
    assert!(!options.is_enabled(FilterId::Debug));
    assert_eq!(options.rewrite_deadline_ms(), 20);
}

#[test]
fn test_load_minimal_config() {
    let minimal_yaml = r#"
file_cache_path: "/tmp/pagespeed-minimal"
"#;

    std::fs::write("test_ps_minimal.yaml", minimal_yaml).unwrap();

    let config = ServerConfig::from_file("test_ps_minimal.yaml");
    assert!(config.is_ok());

    let config = config.unwrap();
    assert_eq!(config.file_cache_path, "/tmp/pagespeed-minimal");
    // Check defaults are applied
    assert_eq!(config.driver_pool_size, 50);
    assert_eq!(config.flush_filename, "cache.flush");
    assert_eq!(config.cache_flush_poll_interval_ms, 5000);
    assert!(config.memcached_server.is_none());
    assert!(config.admin.is_none());
    assert!(config.rewrite.enabled);
    assert!(config.rewrite.filters.is_empty());
    assert_eq!(config.rewrite.rewrite_deadline_ms, 50);

    std::fs::remove_file("test_ps_minimal.yaml").unwrap();
}

#[test]
fn test_load_invalid_config() {
    let invalid_yaml = r#"
memcached_server: "localhost"
"#;

    std::fs::write("test_ps_invalid.yaml", invalid_yaml).unwrap();

    let config = ServerConfig::from_file("test_ps_invalid.yaml");
    assert!(
        matches!(config, Err(PagespeedError::ConfigError(_))),
        "memcached_server without a port should fail validation"
    );

    std::fs::remove_file("test_ps_invalid.yaml").unwrap();
}

#[test]
fn test_memcached_and_shm_are_exclusive() {
    let yaml = r#"
memcached_server: "127.0.0.1:11211"
shm_cache_size_kb: 1024
"#;
    assert!(ServerConfig::from_yaml_str(yaml).is_err());
}

#[test]
fn test_flush_filename_must_be_bare() {
    let yaml = "flush_filename: \"sub/cache.flush\"\n";
    assert!(ServerConfig::from_yaml_str(yaml).is_err());
}

#[test]
fn test_load_nonexistent_file() {
    let config = ServerConfig::from_file("nonexistent_pagespeed.yaml");
    assert!(config.is_err(), "Should fail when file doesn't exist");
}

#[test]
fn test_reload_reports_changes() {
    let mut config = ServerConfig::from_file("demos/pingora_pagespeed.yaml").unwrap();

    let mut updated = config.clone();
    updated.rewrite.filters.push("debug".to_string());
    updated.admin.as_mut().unwrap().message_history_size = 10;

    let changes = config.update_from(&updated).unwrap();
    assert!(changes.has_changes());
    assert!(changes.rewrite_options_changed);
    assert!(changes.admin_changed);
    assert!(!changes.restart_required);
    assert_eq!(config.rewrite.filters.len(), 5);

    let unchanged = config.clone();
    let changes = config.update_from(&unchanged).unwrap();
    assert!(!changes.has_changes());
}
