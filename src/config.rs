//! Server configuration
//!
//! [`ServerConfig`] is loaded from YAML once at startup. Cache geometry and
//! thread counts are fixed for the life of the process; the `rewrite`
//! section seeds the base [`RewriteOptions`] and may be hot-reloaded.

use crate::cache::compression::CompressionConfig;
use crate::cache::fallback::{DEFAULT_FALLBACK_CEILING, DEFAULT_L2_VALUE_CEILING};
use crate::error::{PagespeedError, Result};
use crate::options::{FilterId, RewriteOptions, RewriteOptionsBuilder};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Process-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Root of the file cache; also holds the flush file
    #[serde(default = "default_file_cache_path")]
    pub file_cache_path: String,

    /// How often the file cache janitor runs (default: 1 hour)
    #[serde(default = "default_file_cache_clean_interval_ms")]
    pub file_cache_clean_interval_ms: u64,

    /// Janitor size target in KiB (default: 100 MiB)
    #[serde(default = "default_file_cache_clean_size_kb")]
    pub file_cache_clean_size_kb: u64,

    /// Janitor inode target (default: 500000)
    #[serde(default = "default_file_cache_clean_inode_limit")]
    pub file_cache_clean_inode_limit: u64,

    #[serde(default)]
    pub file_cache_compression: CompressionConfig,

    /// Process-local LRU capacity in KiB
    #[serde(default = "default_lru_cache_kb")]
    pub lru_cache_kb: usize,

    /// Largest value admitted to the LRU
    #[serde(default = "default_lru_cache_byte_limit")]
    pub lru_cache_byte_limit: usize,

    /// Memcached `host:port`; when set it is the L2 tier
    #[serde(default)]
    pub memcached_server: Option<String>,

    #[serde(default = "default_memcached_timeout_ms")]
    pub memcached_timeout_ms: u64,

    /// Shared-memory L2 size in KiB, used when no memcached server is set
    #[serde(default)]
    pub shm_cache_size_kb: Option<usize>,

    /// Largest value stored inline in L2; larger values are fallback-encoded
    #[serde(default = "default_l2_value_ceiling")]
    pub l2_value_ceiling_bytes: usize,

    /// Values above this are not cached at all
    #[serde(default = "default_fallback_value_ceiling")]
    pub fallback_value_ceiling_bytes: usize,

    #[serde(default = "default_num_rewrite_threads")]
    pub num_rewrite_threads: usize,

    #[serde(default = "default_num_expensive_rewrite_threads")]
    pub num_expensive_rewrite_threads: usize,

    /// Name of the flush file under `file_cache_path`
    #[serde(default = "default_flush_filename")]
    pub flush_filename: String,

    #[serde(default = "default_cache_flush_poll_interval_ms")]
    pub cache_flush_poll_interval_ms: u64,

    /// Responses larger than this are not recorded for in-place optimization
    #[serde(default = "default_ipro_max_response_bytes")]
    pub ipro_max_response_bytes: usize,

    #[serde(default = "default_ipro_max_concurrent_recordings")]
    pub ipro_max_concurrent_recordings: usize,

    /// Idle drivers kept per options signature
    #[serde(default = "default_driver_pool_size")]
    pub driver_pool_size: usize,

    /// Largest response body the HTTP cache stores
    #[serde(default = "default_max_cacheable_response_bytes")]
    pub max_cacheable_response_bytes: usize,

    /// Concurrent fetches allowed per origin host
    #[serde(default = "default_fetch_concurrency_per_host")]
    pub fetch_concurrency_per_host: usize,

    /// Fetches waiting per host beyond which new fetches are dropped
    #[serde(default = "default_fetch_queue_per_host")]
    pub fetch_queue_per_host: usize,

    /// Origin server for the proxy binary
    #[serde(default = "default_upstream")]
    pub upstream_address: String,

    /// Listen address for the proxy binary
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    #[serde(default)]
    pub admin: Option<AdminConfig>,

    #[serde(default)]
    pub rewrite: RewriteConfig,
}

/// Read-only admin endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdminConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_admin_address")]
    pub address: String,

    /// Log lines retained for `/pagespeed_admin/message_history`
    #[serde(default = "default_message_history_size")]
    pub message_history_size: usize,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_admin_address(),
            message_history_size: default_message_history_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DomainMapping {
    pub to: String,
    pub from: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShardMapping {
    pub domain: String,
    pub shards: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxyMapping {
    pub proxy: String,
    pub origin: String,
}

/// Base rewrite options
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RewriteConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Filter names, e.g. `extend_cache`
    #[serde(default)]
    pub filters: Vec<String>,

    /// Additional domains whose resources may be rewritten
    #[serde(default)]
    pub domains: Vec<String>,

    #[serde(default)]
    pub allow: Vec<String>,

    #[serde(default)]
    pub disallow: Vec<String>,

    #[serde(default)]
    pub map_rewrite_domain: Vec<DomainMapping>,

    #[serde(default)]
    pub map_origin_domain: Vec<DomainMapping>,

    #[serde(default)]
    pub shard_domain: Vec<ShardMapping>,

    #[serde(default)]
    pub map_proxy_domain: Vec<ProxyMapping>,

    #[serde(default)]
    pub respect_vary: bool,

    #[serde(default = "default_true")]
    pub modify_caching_headers: bool,

    #[serde(default)]
    pub in_place_resource_optimization: bool,

    #[serde(default = "default_image_inline_max_bytes")]
    pub image_inline_max_bytes: usize,

    #[serde(default = "default_max_rewrites_outstanding")]
    pub max_rewrites_outstanding: usize,

    /// Bound on how long an HTML flush waits for rewrites
    #[serde(default = "default_rewrite_deadline_ms")]
    pub rewrite_deadline_ms: u64,

    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,

    #[serde(default = "default_ttl_ms")]
    pub implicit_cache_ttl_ms: u64,

    #[serde(default = "default_ttl_ms")]
    pub max_negative_ttl_ms: u64,

    #[serde(default)]
    pub cache_invalidation_timestamp_ms: i64,
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            filters: Vec::new(),
            domains: Vec::new(),
            allow: Vec::new(),
            disallow: Vec::new(),
            map_rewrite_domain: Vec::new(),
            map_origin_domain: Vec::new(),
            shard_domain: Vec::new(),
            map_proxy_domain: Vec::new(),
            respect_vary: false,
            modify_caching_headers: true,
            in_place_resource_optimization: false,
            image_inline_max_bytes: default_image_inline_max_bytes(),
            max_rewrites_outstanding: default_max_rewrites_outstanding(),
            rewrite_deadline_ms: default_rewrite_deadline_ms(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            implicit_cache_ttl_ms: default_ttl_ms(),
            max_negative_ttl_ms: default_ttl_ms(),
            cache_invalidation_timestamp_ms: 0,
        }
    }
}

impl RewriteConfig {
    /// Build the signed base options
    pub fn to_options(&self) -> Result<RewriteOptions> {
        let mut builder = RewriteOptionsBuilder::new();
        builder.enabled = self.enabled;
        for name in &self.filters {
            let filter = FilterId::from_name(name)
                .ok_or_else(|| PagespeedError::ConfigError(format!("Unknown filter '{}'", name)))?;
            builder.enabled_filters.insert(filter);
        }
        for domain in &self.domains {
            builder.domain_lawyer.add_domain(domain.as_str());
        }
        for pattern in &self.allow {
            builder.allow_disallow.allow(pattern.as_str());
        }
        for pattern in &self.disallow {
            builder.allow_disallow.disallow(pattern.as_str());
        }
        for mapping in &self.map_rewrite_domain {
            builder
                .domain_lawyer
                .add_rewrite_domain_mapping(&mapping.to, &mapping.from);
        }
        for mapping in &self.map_origin_domain {
            builder
                .domain_lawyer
                .add_origin_domain_mapping(&mapping.to, &mapping.from);
        }
        for shard in &self.shard_domain {
            let shards: Vec<&str> = shard.shards.iter().map(String::as_str).collect();
            builder.domain_lawyer.add_shard(&shard.domain, &shards);
        }
        for mapping in &self.map_proxy_domain {
            builder
                .domain_lawyer
                .add_proxy_domain_mapping(&mapping.proxy, &mapping.origin);
        }
        builder.respect_vary = self.respect_vary;
        builder.modify_caching_headers = self.modify_caching_headers;
        builder.in_place_resource_optimization = self.in_place_resource_optimization;
        builder.image_inline_max_bytes = self.image_inline_max_bytes;
        builder.max_rewrites_outstanding = self.max_rewrites_outstanding;
        builder.rewrite_deadline_ms = self.rewrite_deadline_ms;
        builder.fetch_timeout_ms = self.fetch_timeout_ms;
        builder.implicit_cache_ttl_ms = self.implicit_cache_ttl_ms;
        builder.max_negative_ttl_ms = self.max_negative_ttl_ms;
        builder.cache_invalidation_timestamp_ms = self.cache_invalidation_timestamp_ms;
        Ok(builder.freeze())
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_file_cache_path() -> String {
    "/var/cache/pagespeed".to_string()
}

fn default_file_cache_clean_interval_ms() -> u64 {
    60 * 60 * 1000 // 1 hour
}

fn default_file_cache_clean_size_kb() -> u64 {
    100 * 1024 // 100MB
}

fn default_file_cache_clean_inode_limit() -> u64 {
    500_000
}

fn default_lru_cache_kb() -> usize {
    16 * 1024 // 16MB
}

fn default_lru_cache_byte_limit() -> usize {
    16 * 1024
}

fn default_memcached_timeout_ms() -> u64 {
    500
}

fn default_l2_value_ceiling() -> usize {
    DEFAULT_L2_VALUE_CEILING
}

fn default_fallback_value_ceiling() -> usize {
    DEFAULT_FALLBACK_CEILING
}

fn available_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_num_rewrite_threads() -> usize {
    available_threads()
}

fn default_num_expensive_rewrite_threads() -> usize {
    (available_threads() / 2).max(1)
}

fn default_flush_filename() -> String {
    "cache.flush".to_string()
}

fn default_cache_flush_poll_interval_ms() -> u64 {
    5000
}

fn default_ipro_max_response_bytes() -> usize {
    10 * 1024 * 1024 // 10MB
}

fn default_ipro_max_concurrent_recordings() -> usize {
    10
}

fn default_driver_pool_size() -> usize {
    50
}

fn default_max_cacheable_response_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_fetch_concurrency_per_host() -> usize {
    8
}

fn default_fetch_queue_per_host() -> usize {
    64
}

fn default_upstream() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_listen_address() -> String {
    "0.0.0.0:6188".to_string()
}

fn default_admin_address() -> String {
    "127.0.0.1:9090".to_string()
}

fn default_message_history_size() -> usize {
    1000
}

fn default_image_inline_max_bytes() -> usize {
    3072
}

fn default_max_rewrites_outstanding() -> usize {
    100
}

fn default_rewrite_deadline_ms() -> u64 {
    50
}

fn default_fetch_timeout_ms() -> u64 {
    5000
}

fn default_ttl_ms() -> u64 {
    5 * 60 * 1000
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            file_cache_path: default_file_cache_path(),
            file_cache_clean_interval_ms: default_file_cache_clean_interval_ms(),
            file_cache_clean_size_kb: default_file_cache_clean_size_kb(),
            file_cache_clean_inode_limit: default_file_cache_clean_inode_limit(),
            file_cache_compression: CompressionConfig::default(),
            lru_cache_kb: default_lru_cache_kb(),
            lru_cache_byte_limit: default_lru_cache_byte_limit(),
            memcached_server: None,
            memcached_timeout_ms: default_memcached_timeout_ms(),
            shm_cache_size_kb: None,
            l2_value_ceiling_bytes: default_l2_value_ceiling(),
            fallback_value_ceiling_bytes: default_fallback_value_ceiling(),
            num_rewrite_threads: default_num_rewrite_threads(),
            num_expensive_rewrite_threads: default_num_expensive_rewrite_threads(),
            flush_filename: default_flush_filename(),
            cache_flush_poll_interval_ms: default_cache_flush_poll_interval_ms(),
            ipro_max_response_bytes: default_ipro_max_response_bytes(),
            ipro_max_concurrent_recordings: default_ipro_max_concurrent_recordings(),
            driver_pool_size: default_driver_pool_size(),
            max_cacheable_response_bytes: default_max_cacheable_response_bytes(),
            fetch_concurrency_per_host: default_fetch_concurrency_per_host(),
            fetch_queue_per_host: default_fetch_queue_per_host(),
            upstream_address: default_upstream(),
            listen_address: default_listen_address(),
            admin: None,
            rewrite: RewriteConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Configuration rooted at `file_cache_path` with all other defaults
    pub fn with_cache_path(path: impl Into<String>) -> Self {
        Self {
            file_cache_path: path.into(),
            ..Default::default()
        }
    }

    /// Load configuration from a YAML file
    ///
    /// # Arguments
    /// * `path` - Path to the YAML configuration file
    ///
    /// # Returns
    /// * `Ok(ServerConfig)` if loading and validation succeed
    /// * `Err(PagespeedError)` if the file cannot be read or the config is invalid
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            PagespeedError::ConfigError(format!("Failed to read config file: {}", e))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parse and validate YAML configuration text
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: ServerConfig = serde_yaml::from_str(content).map_err(|e| {
            PagespeedError::ConfigError(format!("Failed to parse config file: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Validation Rules
    /// - file_cache_path must not be empty
    /// - the LRU per-entry limit must not exceed the LRU capacity
    /// - the L2 ceiling must be below the fallback ceiling
    /// - thread counts, pool size and per-host fetch concurrency must be > 0
    /// - flush_filename must be a bare file name
    /// - every rewrite filter name must be known
    pub fn validate(&self) -> Result<()> {
        if self.file_cache_path.is_empty() {
            return Err(PagespeedError::ConfigError(
                "file_cache_path must not be empty".to_string(),
            ));
        }

        if self.lru_cache_byte_limit > self.lru_cache_kb * 1024 {
            return Err(PagespeedError::ConfigError(format!(
                "lru_cache_byte_limit ({}) exceeds lru_cache_kb ({}KB)",
                self.lru_cache_byte_limit, self.lru_cache_kb
            )));
        }

        if self.l2_value_ceiling_bytes == 0
            || self.l2_value_ceiling_bytes >= self.fallback_value_ceiling_bytes
        {
            return Err(PagespeedError::ConfigError(format!(
                "l2_value_ceiling_bytes must be in 1..{}, got {}",
                self.fallback_value_ceiling_bytes, self.l2_value_ceiling_bytes
            )));
        }

        if self.memcached_server.is_some() && self.shm_cache_size_kb.is_some() {
            return Err(PagespeedError::ConfigError(
                "memcached_server and shm_cache_size_kb are mutually exclusive".to_string(),
            ));
        }

        if let Some(server) = &self.memcached_server {
            if !server.contains(':') {
                return Err(PagespeedError::ConfigError(format!(
                    "memcached_server must be host:port, got '{}'",
                    server
                )));
            }
        }

        if self.num_rewrite_threads == 0 || self.num_expensive_rewrite_threads == 0 {
            return Err(PagespeedError::ConfigError(
                "rewrite thread counts must be greater than 0".to_string(),
            ));
        }

        if self.driver_pool_size == 0 {
            return Err(PagespeedError::ConfigError(
                "driver_pool_size must be greater than 0".to_string(),
            ));
        }

        if self.fetch_concurrency_per_host == 0 {
            return Err(PagespeedError::ConfigError(
                "fetch_concurrency_per_host must be greater than 0".to_string(),
            ));
        }

        if self.flush_filename.is_empty() || self.flush_filename.contains('/') {
            return Err(PagespeedError::ConfigError(format!(
                "flush_filename must be a file name, got '{}'",
                self.flush_filename
            )));
        }

        if self.ipro_max_concurrent_recordings == 0 {
            return Err(PagespeedError::ConfigError(
                "ipro_max_concurrent_recordings must be greater than 0".to_string(),
            ));
        }

        self.rewrite.to_options()?;
        Ok(())
    }

    pub fn flush_file_path(&self) -> PathBuf {
        Path::new(&self.file_cache_path).join(&self.flush_filename)
    }

    pub fn cache_flush_poll_interval(&self) -> Duration {
        Duration::from_millis(self.cache_flush_poll_interval_ms)
    }

    /// Update configuration from another config
    ///
    /// Only the `rewrite` section and the admin settings take effect at
    /// runtime; other differences are reported but require a restart.
    pub fn update_from(&mut self, new_config: &ServerConfig) -> Result<ConfigChanges> {
        new_config.validate()?;

        let mut changes = ConfigChanges::default();

        if self.rewrite != new_config.rewrite {
            changes.rewrite_options_changed = true;
            self.rewrite = new_config.rewrite.clone();
        }

        if self.admin != new_config.admin {
            changes.admin_changed = true;
            self.admin = new_config.admin.clone();
        }

        let mut fixed = self.clone();
        fixed.rewrite = new_config.rewrite.clone();
        fixed.admin = new_config.admin.clone();
        changes.restart_required = fixed != *new_config;

        Ok(changes)
    }

    /// Reload configuration from file and apply changes
    pub fn reload_from_file<P: AsRef<Path>>(&mut self, path: P) -> Result<ConfigChanges> {
        let new_config = Self::from_file(path)?;
        self.update_from(&new_config)
    }
}

/// Description of configuration changes after hot reload
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConfigChanges {
    pub rewrite_options_changed: bool,
    pub admin_changed: bool,
    /// Fields that only take effect after a restart differ
    pub restart_required: bool,
}

impl ConfigChanges {
    pub fn has_changes(&self) -> bool {
        self.rewrite_options_changed || self.admin_changed || self.restart_required
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.driver_pool_size, 50);
        assert_eq!(config.cache_flush_poll_interval_ms, 5000);
        assert_eq!(config.flush_filename, "cache.flush");
    }

    #[test]
    fn test_yaml_rewrite_section() {
        let yaml = r#"
file_cache_path: /tmp/ps
rewrite:
  filters: [extend_cache, rewrite-css]
  domains: ["cdn.example.com"]
  map_rewrite_domain:
    - to: "http://static.example.com/"
      from: "http://www.example.com/"
  rewrite_deadline_ms: 20
"#;
        let config = ServerConfig::from_yaml_str(yaml).unwrap();
        let options = config.rewrite.to_options().unwrap();
        assert!(options.is_enabled(FilterId::ExtendCache));
        assert!(options.is_enabled(FilterId::RewriteCss));
        assert!(!options.is_enabled(FilterId::RewriteImages));
        assert_eq!(options.rewrite_deadline_ms(), 20);
        assert_eq!(config.flush_file_path(), PathBuf::from("/tmp/ps/cache.flush"));
    }

    #[test]
    fn test_unknown_filter_rejected() {
        let yaml = "rewrite:\n  filters: [make_it_fast]\n";
        assert!(matches!(
            ServerConfig::from_yaml_str(yaml),
            Err(PagespeedError::ConfigError(_))
        ));
    }

    #[test]
    fn test_l2_ceiling_must_be_below_fallback() {
        let config = ServerConfig {
            l2_value_ceiling_bytes: 100,
            fallback_value_ceiling_bytes: 100,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_update_from_reports_restart() {
        let mut config = ServerConfig::default();
        let mut new_config = config.clone();
        new_config.rewrite.filters = vec!["extend_cache".to_string()];
        let changes = config.update_from(&new_config).unwrap();
        assert!(changes.rewrite_options_changed);
        assert!(!changes.restart_required);

        new_config.lru_cache_kb *= 2;
        let changes = config.update_from(&new_config).unwrap();
        assert!(!changes.rewrite_options_changed);
        assert!(changes.restart_required);
        assert_eq!(config.lru_cache_kb, ServerConfig::default().lru_cache_kb);
    }
}
