//! Rewrite filters
//!
//! Each filter has an HTML half (an [`HtmlFilter`](crate::filter::HtmlFilter)
//! that finds references and hands them off) and, except `debug`, an
//! [`Optimizer`] half that runs inside the rewrite context.

pub mod combine_css;
pub mod debug;
pub mod extend_cache;
pub mod rewrite_css;
pub mod rewrite_images;

pub use combine_css::{CombineCssFilter, CombineCssOptimizer};
pub use debug::DebugFilter;
pub use extend_cache::{ExtendCacheFilter, ExtendCacheOptimizer};
pub use rewrite_css::{RewriteCssFilter, RewriteCssOptimizer};
pub use rewrite_images::{ImageCodec, ImageOptimizer, NoopImageCodec, RewriteImagesFilter};

use crate::html::Element;
use crate::optimizer::Optimizer;
use crate::options::{FilterId, RewriteOptions};
use std::collections::HashMap;
use std::sync::Arc;

/// Optimizers for every filter that has one
pub fn default_optimizers(codec: Arc<dyn ImageCodec>) -> HashMap<FilterId, Arc<dyn Optimizer>> {
    let optimizers: Vec<Arc<dyn Optimizer>> = vec![
        Arc::new(CombineCssOptimizer),
        Arc::new(RewriteCssOptimizer),
        Arc::new(ImageOptimizer::new(codec)),
        Arc::new(ExtendCacheOptimizer),
    ];
    optimizers.into_iter().map(|o| (o.filter(), o)).collect()
}

/// `href` of a `<link rel=stylesheet>`
pub fn stylesheet_href(element: &Element) -> Option<&str> {
    if element.name() != "link" {
        return None;
    }
    let rel = element.attr("rel")?;
    if !rel
        .split_ascii_whitespace()
        .any(|r| r.eq_ignore_ascii_case("stylesheet"))
        || rel.to_ascii_lowercase().contains("alternate")
    {
        return None;
    }
    element.attr("href")
}

/// Filter that rewrites a lone stylesheet reference
pub fn stylesheet_filter(options: &RewriteOptions) -> Option<FilterId> {
    [FilterId::RewriteCss, FilterId::ExtendCache]
        .into_iter()
        .find(|f| options.is_enabled(*f))
}

/// Positions of a `url(...)` reference inside CSS
struct UrlRef {
    /// Start of `url(`
    start: usize,
    /// One past the closing `)`
    end: usize,
    value: String,
}

fn find_url_refs(css: &str) -> Vec<UrlRef> {
    let bytes = css.as_bytes();
    let lower = css.to_ascii_lowercase();
    let mut refs = Vec::new();
    let mut from = 0;
    while let Some(offset) = lower[from..].find("url(") {
        let start = from + offset;
        let mut pos = start + 4;
        while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        let (value, after) = match bytes.get(pos) {
            Some(&quote) if quote == b'"' || quote == b'\'' => {
                match css[pos + 1..].find(quote as char) {
                    Some(len) => (&css[pos + 1..pos + 1 + len], pos + 1 + len + 1),
                    None => break,
                }
            }
            Some(_) => match css[pos..].find(')') {
                Some(len) => (css[pos..pos + len].trim_end(), pos + len),
                None => break,
            },
            None => break,
        };
        let mut close = after;
        while close < bytes.len() && bytes[close].is_ascii_whitespace() {
            close += 1;
        }
        if bytes.get(close) != Some(&b')') {
            from = start + 4;
            continue;
        }
        refs.push(UrlRef {
            start,
            end: close + 1,
            value: value.to_string(),
        });
        from = close + 1;
    }
    refs
}

/// Every `url()` value referenced by `css`, in order
pub fn css_urls(css: &str) -> Vec<String> {
    find_url_refs(css).into_iter().map(|r| r.value).collect()
}

/// Replace `url()` references for which `replace` returns a new value
pub fn rewrite_css_urls(css: &str, mut replace: impl FnMut(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(css.len());
    let mut last = 0;
    for r in find_url_refs(css) {
        if let Some(new) = replace(&r.value) {
            out.push_str(&css[last..r.start]);
            if new.contains(|c: char| c.is_whitespace() || matches!(c, '(' | ')' | '"' | '\'')) {
                out.push_str(&format!("url(\"{}\")", new.replace('"', "\\\"")));
            } else {
                out.push_str(&format!("url({})", new));
            }
            last = r.end;
        }
    }
    out.push_str(&css[last..]);
    out
}

/// Strip comments and collapse insignificant whitespace
pub fn minify_css(css: &str) -> String {
    let mut out = String::with_capacity(css.len());
    let mut chars = css.chars().peekable();
    let mut pending_space = false;

    while let Some(c) = chars.next() {
        match c {
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
                pending_space = true;
            }
            '"' | '\'' => {
                flush_space(&mut out, &mut pending_space, c);
                out.push(c);
                let mut escaped = false;
                for s in chars.by_ref() {
                    out.push(s);
                    if escaped {
                        escaped = false;
                    } else if s == '\\' {
                        escaped = true;
                    } else if s == c {
                        break;
                    }
                }
            }
            c if c.is_whitespace() => pending_space = true,
            c => {
                if matches!(c, '{' | '}' | ';' | ',' | '>') {
                    pending_space = false;
                    if c == '}' && out.ends_with(';') {
                        out.pop();
                    }
                }
                flush_space(&mut out, &mut pending_space, c);
                out.push(c);
            }
        }
    }
    out.trim().to_string()
}

fn flush_space(out: &mut String, pending: &mut bool, next: char) {
    if *pending {
        let after_punct = matches!(out.chars().last(), None | Some('{' | '}' | ';' | ',' | '>' | ':'));
        if !after_punct && !matches!(next, '{' | '}' | ';' | ',' | '>') {
            out.push(' ');
        }
        *pending = false;
    }
}
