//! Domain authorization and URL mapping
//!
//! Decides which resource URLs a page may rewrite and how generated URLs
//! are mapped between the domain the browser sees, the domain we fetch
//! from, and any shards.

use serde::{Deserialize, Serialize};
use url::Url;
use xxhash_rust::xxh3::xxh3_64;

/// Shell-style wildcard supporting `*` (any run) and `?` (one char)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wildcard {
    pattern: String,
}

impl Wildcard {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Match `text` against the pattern
    ///
    /// Greedy backtracking over the last `*` seen; linear for the common
    /// single-star patterns.
    pub fn matches(&self, text: &str) -> bool {
        let p: Vec<char> = self.pattern.chars().collect();
        let t: Vec<char> = text.chars().collect();
        let (mut pi, mut ti) = (0usize, 0usize);
        let mut star: Option<usize> = None;
        let mut star_ti = 0usize;

        while ti < t.len() {
            if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
                pi += 1;
                ti += 1;
            } else if pi < p.len() && p[pi] == '*' {
                star = Some(pi);
                star_ti = ti;
                pi += 1;
            } else if let Some(s) = star {
                pi = s + 1;
                star_ti += 1;
                ti = star_ti;
            } else {
                return false;
            }
        }
        while pi < p.len() && p[pi] == '*' {
            pi += 1;
        }
        pi == p.len()
    }
}

/// Ordered allow/disallow list where the last matching rule wins
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WildcardGroup {
    rules: Vec<(Wildcard, bool)>,
}

impl WildcardGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(&mut self, pattern: impl Into<String>) {
        self.rules.push((Wildcard::new(pattern), true));
    }

    pub fn disallow(&mut self, pattern: impl Into<String>) {
        self.rules.push((Wildcard::new(pattern), false));
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluate `text`, returning `default` when no rule matches
    pub fn matches(&self, text: &str, default: bool) -> bool {
        self.rules
            .iter()
            .rev()
            .find(|(wildcard, _)| wildcard.matches(text))
            .map(|(_, allowed)| *allowed)
            .unwrap_or(default)
    }
}

/// A prefix-to-prefix URL mapping rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixRule {
    pub from: String,
    pub to: String,
}

impl PrefixRule {
    fn apply(&self, url: &str) -> Option<String> {
        url.strip_prefix(&self.from)
            .map(|rest| format!("{}{}", self.to, rest))
    }
}

/// Domain authorization plus rewrite/origin/shard/proxy mapping
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainLawyer {
    authorized: Vec<Wildcard>,
    rewrite_rules: Vec<PrefixRule>,
    origin_rules: Vec<PrefixRule>,
    shards: Vec<(String, Vec<String>)>,
}

fn normalize_prefix(prefix: &str) -> String {
    let mut prefix = prefix.trim().to_string();
    if !prefix.contains("://") {
        prefix = format!("http://{}", prefix);
    }
    if !prefix.ends_with('/') {
        prefix.push('/');
    }
    prefix
}

impl DomainLawyer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Authorize resources on a host, e.g. `cdn.example.com` or `*.example.com`
    pub fn add_domain(&mut self, domain: impl Into<String>) {
        self.authorized.push(Wildcard::new(domain));
    }

    /// Emit generated URLs for resources under `from` on `to` instead
    pub fn add_rewrite_domain_mapping(&mut self, to: &str, from: &str) {
        let rule = PrefixRule {
            from: normalize_prefix(from),
            to: normalize_prefix(to),
        };
        self.authorize_prefix(&rule.from);
        self.authorize_prefix(&rule.to);
        self.rewrite_rules.push(rule);
    }

    /// Fetch resources under `from` from `to`
    pub fn add_origin_domain_mapping(&mut self, to: &str, from: &str) {
        let rule = PrefixRule {
            from: normalize_prefix(from),
            to: normalize_prefix(to),
        };
        self.authorize_prefix(&rule.from);
        self.origin_rules.push(rule);
    }

    /// Spread generated URLs for `domain` across `shards`
    pub fn add_shard(&mut self, domain: &str, shards: &[&str]) {
        let domain = normalize_prefix(domain);
        let shards: Vec<String> = shards.iter().map(|s| normalize_prefix(s)).collect();
        for shard in &shards {
            self.authorize_prefix(shard);
        }
        self.shards.push((domain, shards));
    }

    /// Serve `origin`'s resources as if they lived under `proxy`
    pub fn add_proxy_domain_mapping(&mut self, proxy: &str, origin: &str) {
        self.add_rewrite_domain_mapping(proxy, origin);
        self.add_origin_domain_mapping(origin, proxy);
    }

    fn authorize_prefix(&mut self, prefix: &str) {
        if let Ok(url) = Url::parse(prefix) {
            if let Some(host) = url.host_str() {
                let host = host.to_string();
                if !self.authorized.iter().any(|w| w.pattern() == host) {
                    self.authorized.push(Wildcard::new(host));
                }
            }
        }
    }

    /// Whether `resource` may be rewritten on a page at `base`
    pub fn is_authorized(&self, base: &Url, resource: &Url) -> bool {
        if !matches!(resource.scheme(), "http" | "https") {
            return false;
        }
        let Some(host) = resource.host_str() else {
            return false;
        };
        if base.host_str() == Some(host) && base.port_or_known_default() == resource.port_or_known_default() {
            return true;
        }
        self.authorized.iter().any(|w| w.matches(host))
    }

    /// URL to fetch for a resource the page refers to as `url`
    pub fn map_origin(&self, url: &str) -> String {
        self.origin_rules
            .iter()
            .find_map(|rule| rule.apply(url))
            .unwrap_or_else(|| url.to_string())
    }

    /// URL to emit in HTML for a generated resource whose canonical URL is `url`
    pub fn map_rewrite(&self, url: &str) -> String {
        let mapped = self
            .rewrite_rules
            .iter()
            .find_map(|rule| rule.apply(url))
            .unwrap_or_else(|| url.to_string());
        self.shard(&mapped)
    }

    fn shard(&self, url: &str) -> String {
        for (domain, shards) in &self.shards {
            if let Some(rest) = url.strip_prefix(domain.as_str()) {
                if shards.is_empty() {
                    break;
                }
                let index = (xxh3_64(rest.as_bytes()) % shards.len() as u64) as usize;
                return format!("{}{}", shards[index], rest);
            }
        }
        url.to_string()
    }

    /// Undo rewrite/shard mapping for an incoming request on a mapped host
    pub fn reverse_map_rewrite(&self, url: &str) -> String {
        for (domain, shards) in &self.shards {
            for shard in shards {
                if let Some(rest) = url.strip_prefix(shard.as_str()) {
                    return self.reverse_rewrite_rules(&format!("{}{}", domain, rest));
                }
            }
        }
        self.reverse_rewrite_rules(url)
    }

    fn reverse_rewrite_rules(&self, url: &str) -> String {
        self.rewrite_rules
            .iter()
            .find_map(|rule| {
                url.strip_prefix(rule.to.as_str())
                    .map(|rest| format!("{}{}", rule.from, rest))
            })
            .unwrap_or_else(|| url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_matching() {
        assert!(Wildcard::new("*.example.com").matches("cdn.example.com"));
        assert!(!Wildcard::new("*.example.com").matches("example.org"));
        assert!(Wildcard::new("http://a.com/*.png").matches("http://a.com/x/y.png"));
        assert!(Wildcard::new("img?.png").matches("img1.png"));
        assert!(!Wildcard::new("img?.png").matches("img12.png"));
        assert!(Wildcard::new("*").matches(""));
        assert!(Wildcard::new("a*b*c").matches("aXbYc"));
        assert!(!Wildcard::new("a*b*c").matches("aXbY"));
    }

    #[test]
    fn test_wildcard_group_last_match_wins() {
        let mut group = WildcardGroup::new();
        group.disallow("*.js");
        group.allow("*/jquery*.js");

        assert!(!group.matches("http://a.com/app.js", true));
        assert!(group.matches("http://a.com/lib/jquery.min.js", true));
        assert!(group.matches("http://a.com/style.css", true));
        assert!(!group.matches("http://a.com/style.css", false));
    }

    #[test]
    fn test_authorization() {
        let mut lawyer = DomainLawyer::new();
        lawyer.add_domain("*.cdn.com");
        let base = Url::parse("http://example.com/page.html").unwrap();

        assert!(lawyer.is_authorized(&base, &Url::parse("http://example.com/a.css").unwrap()));
        assert!(lawyer.is_authorized(&base, &Url::parse("http://static.cdn.com/a.css").unwrap()));
        assert!(!lawyer.is_authorized(&base, &Url::parse("http://evil.com/a.css").unwrap()));
        assert!(!lawyer.is_authorized(&base, &Url::parse("data:text/css,x").unwrap()));
    }

    #[test]
    fn test_origin_and_rewrite_mapping() {
        let mut lawyer = DomainLawyer::new();
        lawyer.add_origin_domain_mapping("localhost:8080", "example.com");
        lawyer.add_rewrite_domain_mapping("cdn.example.com", "example.com");

        assert_eq!(
            lawyer.map_origin("http://example.com/a.css"),
            "http://localhost:8080/a.css"
        );
        assert_eq!(
            lawyer.map_rewrite("http://example.com/a.css"),
            "http://cdn.example.com/a.css"
        );
        assert_eq!(
            lawyer.reverse_map_rewrite("http://cdn.example.com/a.css"),
            "http://example.com/a.css"
        );
    }

    #[test]
    fn test_sharding_is_stable() {
        let mut lawyer = DomainLawyer::new();
        lawyer.add_shard("example.com", &["s1.example.com", "s2.example.com"]);

        let first = lawyer.map_rewrite("http://example.com/a.png");
        let second = lawyer.map_rewrite("http://example.com/a.png");
        assert_eq!(first, second);
        assert!(first.starts_with("http://s1.example.com/") || first.starts_with("http://s2.example.com/"));
        assert_eq!(lawyer.reverse_map_rewrite(&first), "http://example.com/a.png");
    }

    #[test]
    fn test_proxy_mapping() {
        let mut lawyer = DomainLawyer::new();
        lawyer.add_proxy_domain_mapping("example.com/external", "external.com");

        assert_eq!(
            lawyer.map_rewrite("http://external.com/lib.js"),
            "http://example.com/external/lib.js"
        );
        assert_eq!(
            lawyer.map_origin("http://example.com/external/lib.js"),
            "http://external.com/lib.js"
        );
    }
}
