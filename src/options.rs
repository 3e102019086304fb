//! Rewrite options
//!
//! [`RewriteOptions`] is the merged configuration for one request. It is
//! built through a [`RewriteOptionsBuilder`] and frozen; freezing computes a
//! 128-bit signature over every value-affecting field. A frozen options
//! object cannot change: a cache flush or a per-request override produces a
//! new object with a new signature.

use crate::domain::{DomainLawyer, WildcardGroup};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use url::Url;
use xxhash_rust::xxh3::xxh3_128;

/// Identity of a rewrite filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterId {
    CombineCss,
    RewriteCss,
    RewriteImages,
    ExtendCache,
    Debug,
}

impl FilterId {
    /// Every filter, in chain registration order
    pub const ALL: [FilterId; 5] = [
        FilterId::CombineCss,
        FilterId::RewriteCss,
        FilterId::RewriteImages,
        FilterId::ExtendCache,
        FilterId::Debug,
    ];

    /// Two-letter code used in generated URLs
    pub fn code(&self) -> &'static str {
        match self {
            FilterId::CombineCss => "cc",
            FilterId::RewriteCss => "cf",
            FilterId::RewriteImages => "ic",
            FilterId::ExtendCache => "ce",
            FilterId::Debug => "db",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| f.code() == code)
    }

    /// Configuration name, e.g. `extend_cache`
    pub fn name(&self) -> &'static str {
        match self {
            FilterId::CombineCss => "combine_css",
            FilterId::RewriteCss => "rewrite_css",
            FilterId::RewriteImages => "rewrite_images",
            FilterId::ExtendCache => "extend_cache",
            FilterId::Debug => "debug",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().replace('-', "_");
        Self::ALL.iter().copied().find(|f| f.name() == name)
    }
}

impl fmt::Display for FilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 128-bit options signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Signature(pub u128);

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Mutable options under construction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewriteOptionsBuilder {
    pub enabled: bool,
    pub enabled_filters: BTreeSet<FilterId>,
    pub image_inline_max_bytes: usize,
    pub max_rewrites_outstanding: usize,
    pub max_negative_ttl_ms: u64,
    pub implicit_cache_ttl_ms: u64,
    pub allow_disallow: WildcardGroup,
    pub domain_lawyer: DomainLawyer,
    pub cache_invalidation_timestamp_ms: i64,
    pub respect_vary: bool,
    pub modify_caching_headers: bool,
    pub in_place_resource_optimization: bool,
    pub rewrite_deadline_ms: u64,
    pub fetch_timeout_ms: u64,
}

impl Default for RewriteOptionsBuilder {
    fn default() -> Self {
        Self {
            enabled: true,
            enabled_filters: BTreeSet::new(),
            image_inline_max_bytes: 3072,
            max_rewrites_outstanding: 100,
            max_negative_ttl_ms: 5 * 60 * 1000,
            implicit_cache_ttl_ms: 5 * 60 * 1000,
            allow_disallow: WildcardGroup::new(),
            domain_lawyer: DomainLawyer::new(),
            cache_invalidation_timestamp_ms: 0,
            respect_vary: false,
            modify_caching_headers: true,
            in_place_resource_optimization: false,
            rewrite_deadline_ms: 50,
            fetch_timeout_ms: 5000,
        }
    }
}

impl RewriteOptionsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable_filter(mut self, filter: FilterId) -> Self {
        self.enabled_filters.insert(filter);
        self
    }

    pub fn disable_filter(mut self, filter: FilterId) -> Self {
        self.enabled_filters.remove(&filter);
        self
    }

    pub fn allow(mut self, pattern: &str) -> Self {
        self.allow_disallow.allow(pattern);
        self
    }

    pub fn disallow(mut self, pattern: &str) -> Self {
        self.allow_disallow.disallow(pattern);
        self
    }

    pub fn rewrite_deadline_ms(mut self, ms: u64) -> Self {
        self.rewrite_deadline_ms = ms;
        self
    }

    pub fn fetch_timeout_ms(mut self, ms: u64) -> Self {
        self.fetch_timeout_ms = ms;
        self
    }

    pub fn in_place_resource_optimization(mut self, on: bool) -> Self {
        self.in_place_resource_optimization = on;
        self
    }

    pub fn cache_invalidation_timestamp_ms(mut self, ts: i64) -> Self {
        self.cache_invalidation_timestamp_ms = ts;
        self
    }

    /// Freeze and sign
    pub fn freeze(self) -> RewriteOptions {
        let signature = Signature(hash_canonical(&self));
        RewriteOptions {
            inner: self,
            signature,
        }
    }
}

fn hash_canonical<T: Serialize>(value: &T) -> u128 {
    // bincode over BTreeSet/Vec fields is deterministic for a given value
    match bincode::serialize(value) {
        Ok(bytes) => xxh3_128(&bytes),
        Err(_) => 0,
    }
}

/// Frozen, signed options shared by a driver, its contexts and cache keys
#[derive(Debug, Clone, PartialEq)]
pub struct RewriteOptions {
    inner: RewriteOptionsBuilder,
    signature: Signature,
}

impl Default for RewriteOptions {
    fn default() -> Self {
        RewriteOptionsBuilder::default().freeze()
    }
}

#[derive(Serialize)]
struct FragmentFields<'a> {
    filter: &'a str,
    image_inline_max_bytes: Option<usize>,
    domain_lawyer: &'a DomainLawyer,
    respect_vary: bool,
    nested: Vec<FilterId>,
}

impl RewriteOptions {
    pub fn signature(&self) -> Signature {
        self.signature
    }

    /// Hash over the fields that affect `filter`'s output
    ///
    /// Excludes the invalidation timestamp so partition keys survive a
    /// cache flush; staleness is carried by validity tokens instead.
    pub fn signature_fragment(&self, filter: FilterId) -> u64 {
        let nested: Vec<FilterId> = match filter {
            FilterId::RewriteCss => [FilterId::RewriteImages, FilterId::ExtendCache]
                .into_iter()
                .filter(|f| self.is_enabled(*f))
                .collect(),
            _ => Vec::new(),
        };
        let fields = FragmentFields {
            filter: filter.code(),
            image_inline_max_bytes: match filter {
                FilterId::RewriteImages | FilterId::RewriteCss => {
                    Some(self.inner.image_inline_max_bytes)
                }
                _ => None,
            },
            domain_lawyer: &self.inner.domain_lawyer,
            respect_vary: self.inner.respect_vary,
            nested,
        };
        hash_canonical(&fields) as u64
    }

    pub fn enabled(&self) -> bool {
        self.inner.enabled
    }

    pub fn is_enabled(&self, filter: FilterId) -> bool {
        self.inner.enabled && self.inner.enabled_filters.contains(&filter)
    }

    pub fn enabled_filters(&self) -> impl Iterator<Item = FilterId> + '_ {
        FilterId::ALL.into_iter().filter(|f| self.is_enabled(*f))
    }

    pub fn image_inline_max_bytes(&self) -> usize {
        self.inner.image_inline_max_bytes
    }

    pub fn max_rewrites_outstanding(&self) -> usize {
        self.inner.max_rewrites_outstanding
    }

    pub fn max_negative_ttl_ms(&self) -> u64 {
        self.inner.max_negative_ttl_ms
    }

    pub fn implicit_cache_ttl_ms(&self) -> u64 {
        self.inner.implicit_cache_ttl_ms
    }

    pub fn domain_lawyer(&self) -> &DomainLawyer {
        &self.inner.domain_lawyer
    }

    pub fn cache_invalidation_timestamp_ms(&self) -> i64 {
        self.inner.cache_invalidation_timestamp_ms
    }

    pub fn respect_vary(&self) -> bool {
        self.inner.respect_vary
    }

    pub fn modify_caching_headers(&self) -> bool {
        self.inner.modify_caching_headers
    }

    pub fn in_place_resource_optimization(&self) -> bool {
        self.inner.in_place_resource_optimization
    }

    pub fn rewrite_deadline_ms(&self) -> u64 {
        self.inner.rewrite_deadline_ms
    }

    pub fn fetch_timeout_ms(&self) -> u64 {
        self.inner.fetch_timeout_ms
    }

    /// Whether a resource referenced from `base` may be rewritten
    pub fn is_allowed(&self, base: &Url, resource: &Url) -> bool {
        self.inner.domain_lawyer.is_authorized(base, resource)
            && self.inner.allow_disallow.matches(resource.as_str(), true)
    }

    /// Builder seeded with these options, for deriving a new signed object
    pub fn to_builder(&self) -> RewriteOptionsBuilder {
        self.inner.clone()
    }

    /// Same options re-signed with a newer invalidation timestamp
    ///
    /// Never moves the timestamp backwards.
    pub fn with_invalidation_timestamp(&self, ts: i64) -> RewriteOptions {
        if ts <= self.inner.cache_invalidation_timestamp_ms {
            return self.clone();
        }
        let mut builder = self.to_builder();
        builder.cache_invalidation_timestamp_ms = ts;
        builder.freeze()
    }

    /// Apply `PageSpeed` / `PageSpeedFilters` query parameters
    ///
    /// Returns `None` when the URL carries no overrides.
    pub fn with_query_overrides(&self, url: &Url) -> Option<RewriteOptions> {
        let mut builder = self.to_builder();
        let mut changed = false;
        for (name, value) in url.query_pairs() {
            match name.as_ref() {
                "PageSpeed" => {
                    builder.enabled = !value.eq_ignore_ascii_case("off");
                    changed = true;
                }
                "PageSpeedFilters" => {
                    builder.enabled_filters = value
                        .split(',')
                        .filter_map(FilterId::from_name)
                        .collect();
                    changed = true;
                }
                _ => {}
            }
        }
        changed.then(|| builder.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_codes_round_trip() {
        for filter in FilterId::ALL {
            assert_eq!(FilterId::from_code(filter.code()), Some(filter));
            assert_eq!(FilterId::from_name(filter.name()), Some(filter));
        }
        assert_eq!(FilterId::from_name("extend-cache"), Some(FilterId::ExtendCache));
        assert_eq!(FilterId::from_code("zz"), None);
    }

    #[test]
    fn test_signature_stable_for_equal_options() {
        let a = RewriteOptionsBuilder::new().enable_filter(FilterId::ExtendCache).freeze();
        let b = RewriteOptionsBuilder::new().enable_filter(FilterId::ExtendCache).freeze();
        assert_eq!(a.signature(), b.signature());

        let c = RewriteOptionsBuilder::new().enable_filter(FilterId::RewriteCss).freeze();
        assert_ne!(a.signature(), c.signature());
    }

    #[test]
    fn test_fragment_ignores_invalidation_timestamp() {
        let a = RewriteOptionsBuilder::new().enable_filter(FilterId::ExtendCache).freeze();
        let b = a.with_invalidation_timestamp(1_000);
        assert_ne!(a.signature(), b.signature());
        assert_eq!(
            a.signature_fragment(FilterId::ExtendCache),
            b.signature_fragment(FilterId::ExtendCache)
        );
    }

    #[test]
    fn test_invalidation_timestamp_is_monotonic() {
        let a = RewriteOptionsBuilder::new().cache_invalidation_timestamp_ms(5_000).freeze();
        let b = a.with_invalidation_timestamp(1_000);
        assert_eq!(b.cache_invalidation_timestamp_ms(), 5_000);
        assert_eq!(a.signature(), b.signature());
    }

    #[test]
    fn test_image_threshold_only_affects_image_fragments() {
        let a = RewriteOptionsBuilder::new().freeze();
        let mut builder = a.to_builder();
        builder.image_inline_max_bytes = 10;
        let b = builder.freeze();

        assert_ne!(
            a.signature_fragment(FilterId::RewriteImages),
            b.signature_fragment(FilterId::RewriteImages)
        );
        assert_eq!(
            a.signature_fragment(FilterId::ExtendCache),
            b.signature_fragment(FilterId::ExtendCache)
        );
    }

    #[test]
    fn test_query_overrides() {
        let base = RewriteOptionsBuilder::new().enable_filter(FilterId::ExtendCache).freeze();
        let url = Url::parse("http://a.com/p.html?PageSpeedFilters=rewrite_css,bogus").unwrap();
        let overridden = base.with_query_overrides(&url).unwrap();
        assert!(overridden.is_enabled(FilterId::RewriteCss));
        assert!(!overridden.is_enabled(FilterId::ExtendCache));

        let off = Url::parse("http://a.com/p.html?PageSpeed=off").unwrap();
        assert!(!base.with_query_overrides(&off).unwrap().enabled());

        let none = Url::parse("http://a.com/p.html?x=1").unwrap();
        assert!(base.with_query_overrides(&none).is_none());
    }

    #[test]
    fn test_allow_disallow() {
        let options = RewriteOptionsBuilder::new().disallow("*/private/*").freeze();
        let base = Url::parse("http://a.com/").unwrap();
        assert!(options.is_allowed(&base, &Url::parse("http://a.com/x.css").unwrap()));
        assert!(!options.is_allowed(&base, &Url::parse("http://a.com/private/x.css").unwrap()));
        assert!(!options.is_allowed(&base, &Url::parse("http://b.com/x.css").unwrap()));
    }
}
