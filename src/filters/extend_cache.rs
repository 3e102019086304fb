//! Cache extension
//!
//! Rewrites `<link href>`, `<script src>` and `<img src>` to content-hashed
//! URLs serving identical bytes, so they can be cached for a year.

use super::stylesheet_href;
use crate::context::{ResourceInput, RewriteRequest, Slot};
use crate::error::{PagespeedError, Result};
use crate::filter::{FilterContext, HtmlFilter};
use crate::optimizer::{InputResource, OptimizeEnv, OptimizedOutput, Optimizer};
use crate::options::FilterId;
use crate::resource_namer::content_type_for_extension;
use async_trait::async_trait;

/// The URL-valued attribute cache extension rewrites on `element`
fn extendable_attr(element: &crate::html::Element) -> Option<&'static str> {
    match element.name() {
        "link" => stylesheet_href(element).map(|_| "href"),
        "script" => element.has_attr("src").then_some("src"),
        "img" => element.has_attr("src").then_some("src"),
        _ => None,
    }
}

#[derive(Debug, Default)]
pub struct ExtendCacheFilter;

impl ExtendCacheFilter {
    pub fn new() -> Self {
        Self
    }
}

impl HtmlFilter for ExtendCacheFilter {
    fn id(&self) -> FilterId {
        FilterId::ExtendCache
    }

    fn token(&mut self, ctx: &mut FilterContext<'_>, index: usize) {
        let Some(element) = ctx.element(index) else {
            return;
        };
        let Some(attr) = extendable_attr(element) else {
            return;
        };
        let Some(url) = element.attr(attr).and_then(|value| ctx.resolve(value)) else {
            return;
        };
        if !ctx.claim(index, attr) {
            return;
        }
        ctx.initiate_rewrite(RewriteRequest {
            filter: FilterId::ExtendCache,
            inputs: vec![ResourceInput::Url(url)],
            slots: vec![Slot::attribute(index, attr)],
        });
    }
}

/// Same bytes under a content-hashed URL
pub struct ExtendCacheOptimizer;

#[async_trait]
impl Optimizer for ExtendCacheOptimizer {
    fn filter(&self) -> FilterId {
        FilterId::ExtendCache
    }

    async fn optimize(&self, inputs: Vec<InputResource>, _env: &OptimizeEnv<'_>) -> Result<OptimizedOutput> {
        let input = inputs
            .into_iter()
            .next()
            .ok_or_else(|| PagespeedError::OptimizerDeclined("no input".to_string()))?;
        let content_type = if input.content_type.is_empty() {
            input
                .url
                .as_ref()
                .and_then(|url| url.path().rsplit_once('.'))
                .and_then(|(_, ext)| content_type_for_extension(ext))
                .map(str::to_string)
                .ok_or_else(|| PagespeedError::OptimizerDeclined("unknown content type".to_string()))?
        } else {
            input.content_type
        };
        Ok(OptimizedOutput::new(input.body, content_type))
    }
}
