//! HTML filter capability set
//!
//! Every filter sees every token in registration order through a
//! [`FilterContext`], which exposes the operations a filter may perform on
//! the stream: read or mutate pending tokens, claim an attribute, hand a
//! rewrite off to the engine and inject diagnostic comments.

use crate::context::RewriteRequest;
use crate::driver::DriverCore;
use crate::filters::{CombineCssFilter, DebugFilter, ExtendCacheFilter, RewriteCssFilter, RewriteImagesFilter};
use crate::html::{Element, Token};
use crate::options::{FilterId, RewriteOptions};
use crate::resource_namer::is_generated;
use url::Url;

/// A streaming HTML token transformer
pub trait HtmlFilter: Send {
    fn id(&self) -> FilterId;

    fn start_document(&mut self, _ctx: &mut FilterContext<'_>) {}

    /// Called once per lexed token; `index` addresses it in the stream
    fn token(&mut self, ctx: &mut FilterContext<'_>, index: usize);

    /// Called at a flush boundary before the driver waits on rewrites
    fn flush(&mut self, _ctx: &mut FilterContext<'_>) {}

    fn end_document(&mut self, _ctx: &mut FilterContext<'_>) {}

    /// Forget per-document state before the driver is reused
    fn clear(&mut self) {}
}

/// Counters describing a document's rewrites so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewriteSummary {
    pub initiated: usize,
    pub pending: usize,
    pub rendered: usize,
    pub abandoned: usize,
}

/// A filter's view of the driver
pub struct FilterContext<'a> {
    core: &'a mut DriverCore,
}

impl<'a> FilterContext<'a> {
    pub(crate) fn new(core: &'a mut DriverCore) -> Self {
        Self { core }
    }

    pub fn token(&self, index: usize) -> Option<&Token> {
        self.core.token(index)
    }

    pub fn token_mut(&mut self, index: usize) -> Option<&mut Token> {
        self.core.token_mut(index)
    }

    pub fn element(&self, index: usize) -> Option<&Element> {
        self.token(index).and_then(Token::as_element)
    }

    pub fn element_mut(&mut self, index: usize) -> Option<&mut Element> {
        self.token_mut(index).and_then(Token::as_element_mut)
    }

    /// Document base; `None` outside a document
    pub fn base_url(&self) -> Option<&Url> {
        self.core.base_url()
    }

    pub fn options(&self) -> &RewriteOptions {
        self.core.options()
    }

    /// Resolve an attribute value to a URL the engine may rewrite
    pub fn resolve(&self, value: &str) -> Option<Url> {
        resolve_rewritable(self.base_url()?, self.options(), value)
    }

    /// Take ownership of `attr` on token `index`; false if another filter
    /// already did
    pub fn claim(&mut self, index: usize, attr: &str) -> bool {
        self.core.claim(index, attr)
    }

    pub fn is_claimed(&self, index: usize, attr: &str) -> bool {
        self.core.is_claimed(index, attr)
    }

    /// Hand a rewrite to the engine
    ///
    /// Returns false when the document already has the maximum number of
    /// outstanding rewrites; the slots then keep their original values.
    pub fn initiate_rewrite(&mut self, request: RewriteRequest) -> bool {
        self.core.initiate_rewrite(request)
    }

    /// Inject `<!--text-->` at the current position, or after the enclosing
    /// literal element when one is open
    pub fn inject_comment(&mut self, text: &str) {
        self.core.inject(Token::comment(text));
    }

    pub fn summary(&self) -> RewriteSummary {
        self.core.summary()
    }
}

/// Resolve `value` against `base` and check it may be rewritten
pub fn resolve_rewritable(base: &Url, options: &RewriteOptions, value: &str) -> Option<Url> {
    let value = value.trim();
    if value.is_empty() || value.starts_with('#') {
        return None;
    }
    let lower = value.get(..5).map(str::to_ascii_lowercase);
    if lower.as_deref() == Some("data:") {
        return None;
    }
    let url = base.join(value).ok()?;
    if !matches!(url.scheme(), "http" | "https") || is_generated(url.as_str()) {
        return None;
    }
    options.is_allowed(base, &url).then_some(url)
}

/// Build the filter chain for `options` in registration order
pub fn build_chain(options: &RewriteOptions) -> Vec<Box<dyn HtmlFilter>> {
    options
        .enabled_filters()
        .map(|id| -> Box<dyn HtmlFilter> {
            match id {
                FilterId::CombineCss => Box::new(CombineCssFilter::new()),
                FilterId::RewriteCss => Box::new(RewriteCssFilter::new()),
                FilterId::RewriteImages => Box::new(RewriteImagesFilter::new()),
                FilterId::ExtendCache => Box::new(ExtendCacheFilter::new()),
                FilterId::Debug => Box::new(DebugFilter::new()),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::RewriteOptionsBuilder;

    #[test]
    fn test_resolve_rewritable() {
        let options = RewriteOptionsBuilder::new().freeze();
        let base = Url::parse("http://a.com/dir/page.html").unwrap();
        assert_eq!(
            resolve_rewritable(&base, &options, " x.js ").map(|u| u.to_string()),
            Some("http://a.com/dir/x.js".to_string())
        );
        assert!(resolve_rewritable(&base, &options, "data:image/png;base64,AAAA").is_none());
        assert!(resolve_rewritable(&base, &options, "javascript:void(0)").is_none());
        assert!(resolve_rewritable(&base, &options, "x.js.pagespeed.ce.0123456789.js").is_none());
        assert!(resolve_rewritable(&base, &options, "http://other.com/x.js").is_none());
    }

    #[test]
    fn test_chain_follows_registration_order() {
        let options = RewriteOptionsBuilder::new()
            .enable_filter(FilterId::ExtendCache)
            .enable_filter(FilterId::CombineCss)
            .enable_filter(FilterId::Debug)
            .freeze();
        let ids: Vec<FilterId> = build_chain(&options).iter().map(|f| f.id()).collect();
        assert_eq!(ids, vec![FilterId::CombineCss, FilterId::ExtendCache, FilterId::Debug]);
    }

    #[test]
    fn test_disabled_options_build_empty_chain() {
        let mut builder = RewriteOptionsBuilder::new().enable_filter(FilterId::ExtendCache);
        builder.enabled = false;
        assert!(build_chain(&builder.freeze()).is_empty());
    }
}
