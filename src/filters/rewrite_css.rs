//! CSS rewriting
//!
//! Minifies external stylesheets and `<style>` blocks, and rewrites the
//! `url()` references inside them through nested image or cache-extension
//! rewrites.

use super::{css_urls, minify_css, rewrite_css_urls, stylesheet_href};
use crate::context::{ResourceInput, RewriteRequest, Slot, SlotKind};
use crate::error::{PagespeedError, Result};
use crate::filter::{resolve_rewritable, FilterContext, HtmlFilter};
use crate::html::Token;
use crate::optimizer::{InputResource, OptimizeEnv, OptimizedOutput, Optimizer};
use crate::options::FilterId;
use crate::resource_namer::{content_type_for_extension, ResourceKind};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use std::collections::HashMap;
use url::Url;

#[derive(Debug, Default)]
pub struct RewriteCssFilter {
    /// Text tokens of the open `<style>` block
    style: Option<Vec<usize>>,
}

impl RewriteCssFilter {
    pub fn new() -> Self {
        Self::default()
    }

    fn finish_style(&mut self, ctx: &mut FilterContext<'_>) {
        let Some(texts) = self.style.take() else {
            return;
        };
        let mut content = Vec::new();
        for index in &texts {
            if let Some(Token::Characters(bytes)) = ctx.token(*index) {
                content.extend_from_slice(bytes);
            }
        }
        if content.iter().all(u8::is_ascii_whitespace) {
            return;
        }

        let slots = texts
            .iter()
            .enumerate()
            .map(|(i, index)| Slot {
                index: *index,
                kind: if i == 0 {
                    SlotKind::ReplaceText
                } else {
                    SlotKind::ClearText
                },
            })
            .collect();
        let Some(base) = ctx.base_url().cloned() else {
            return;
        };
        ctx.initiate_rewrite(RewriteRequest {
            filter: FilterId::RewriteCss,
            inputs: vec![ResourceInput::Inline {
                content: Bytes::from(content),
                content_type: "text/css".to_string(),
                base,
            }],
            slots,
        });
    }
}

impl HtmlFilter for RewriteCssFilter {
    fn id(&self) -> FilterId {
        FilterId::RewriteCss
    }

    fn token(&mut self, ctx: &mut FilterContext<'_>, index: usize) {
        match ctx.token(index) {
            Some(Token::Characters(_)) => {
                if let Some(texts) = &mut self.style {
                    texts.push(index);
                }
            }
            Some(Token::EndTag { name, .. }) if name == "style" => self.finish_style(ctx),
            Some(Token::StartTag(element)) if element.name() == "style" => {
                let is_css = element
                    .attr("type")
                    .map_or(true, |t| t.trim().eq_ignore_ascii_case("text/css"));
                if is_css && !element.self_closing() {
                    self.style = Some(Vec::new());
                }
            }
            Some(Token::StartTag(element)) => {
                let Some(url) = stylesheet_href(element).and_then(|href| ctx.resolve(href)) else {
                    return;
                };
                if ctx.claim(index, "href") {
                    ctx.initiate_rewrite(RewriteRequest {
                        filter: FilterId::RewriteCss,
                        inputs: vec![ResourceInput::Url(url)],
                        slots: vec![Slot::attribute(index, "href")],
                    });
                }
            }
            _ => {}
        }
    }

    fn clear(&mut self) {
        self.style = None;
    }
}

pub struct RewriteCssOptimizer;

impl RewriteCssOptimizer {
    /// Rewrite one referenced resource as a nested context
    async fn rewrite_reference(env: &OptimizeEnv<'_>, url: Url) -> Option<String> {
        let options = env.options();
        let is_image = url
            .path()
            .rsplit_once('.')
            .and_then(|(_, ext)| content_type_for_extension(ext))
            .is_some_and(|ct| ct.starts_with("image/"));

        if is_image && options.is_enabled(FilterId::RewriteImages) {
            let outcome = env.nested(FilterId::RewriteImages, url.clone()).await;
            if let Some(replacement) = outcome.replacement(options) {
                return Some(replacement);
            }
        }
        if options.is_enabled(FilterId::ExtendCache) {
            return env
                .nested(FilterId::ExtendCache, url)
                .await
                .replacement(options);
        }
        None
    }
}

#[async_trait]
impl Optimizer for RewriteCssOptimizer {
    fn filter(&self) -> FilterId {
        FilterId::RewriteCss
    }

    async fn optimize(&self, inputs: Vec<InputResource>, env: &OptimizeEnv<'_>) -> Result<OptimizedOutput> {
        let input = inputs
            .into_iter()
            .next()
            .ok_or_else(|| PagespeedError::OptimizerDeclined("no input".to_string()))?;
        if !input.content_type.is_empty()
            && ResourceKind::from_content_type(&input.content_type) != ResourceKind::Css
        {
            return Err(PagespeedError::OptimizerDeclined(format!(
                "not CSS: {}",
                input.content_type
            )));
        }
        let base = input
            .base
            .clone()
            .ok_or_else(|| PagespeedError::OptimizerDeclined("no base URL".to_string()))?;
        let css = input.text().into_owned();
        let options = env.options();

        let mut references: Vec<Url> = Vec::new();
        for value in css_urls(&css) {
            if let Some(url) = resolve_rewritable(&base, options, &value) {
                if !references.contains(&url) {
                    references.push(url);
                }
            }
        }

        let rewritten = if references.is_empty() {
            css
        } else {
            let results = join_all(
                references
                    .iter()
                    .map(|url| Self::rewrite_reference(env, url.clone())),
            )
            .await;
            let replacements: HashMap<String, String> = references
                .iter()
                .zip(results)
                .filter_map(|(url, result)| result.map(|r| (url.to_string(), r)))
                .collect();
            rewrite_css_urls(&css, |value| {
                resolve_rewritable(&base, options, value)
                    .and_then(|url| replacements.get(url.as_str()).cloned())
            })
        };

        Ok(OptimizedOutput::new(minify_css(&rewritten), "text/css"))
    }
}
