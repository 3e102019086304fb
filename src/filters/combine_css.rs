//! CSS combining
//!
//! Adjacent `<link rel=stylesheet>` elements with the same media are merged
//! into one generated stylesheet. The first link receives the combined URL
//! and the others are removed. A batch ends at any other content or at a
//! flush; a batch of one is handed to whichever single-stylesheet filter is
//! enabled.

use super::{rewrite_css_urls, stylesheet_filter, stylesheet_href};
use crate::context::{ResourceInput, RewriteRequest, Slot, SlotKind};
use crate::error::{PagespeedError, Result};
use crate::filter::{FilterContext, HtmlFilter};
use crate::html::Token;
use crate::optimizer::{InputResource, OptimizeEnv, OptimizedOutput, Optimizer};
use crate::options::FilterId;
use crate::resource_namer::ResourceKind;
use async_trait::async_trait;
use url::Url;

/// Upper bound on stylesheets merged into one URL
const MAX_COMBINED: usize = 16;

fn directory(url: &Url) -> &str {
    let s = url.as_str();
    let end = s.find(['?', '#']).unwrap_or(s.len());
    match s[..end].rfind('/') {
        Some(pos) => &s[..=pos],
        None => s,
    }
}

#[derive(Debug, Default)]
pub struct CombineCssFilter {
    batch: Vec<(usize, Url)>,
    media: Option<String>,
}

impl CombineCssFilter {
    pub fn new() -> Self {
        Self::default()
    }

    fn accepts(&self, url: &Url, media: &Option<String>) -> bool {
        match self.batch.first() {
            None => true,
            Some((_, first)) => {
                self.batch.len() < MAX_COMBINED
                    && *media == self.media
                    && url.as_str().starts_with(directory(first))
            }
        }
    }

    fn close_batch(&mut self, ctx: &mut FilterContext<'_>) {
        let batch = std::mem::take(&mut self.batch);
        self.media = None;
        match batch.len() {
            0 => {}
            1 => {
                let filter = stylesheet_filter(ctx.options());
                if let (Some(filter), Some((index, url))) = (filter, batch.into_iter().next()) {
                    ctx.initiate_rewrite(RewriteRequest {
                        filter,
                        inputs: vec![ResourceInput::Url(url)],
                        slots: vec![Slot::attribute(index, "href")],
                    });
                }
            }
            _ => {
                let slots = batch
                    .iter()
                    .enumerate()
                    .map(|(i, (index, _))| {
                        if i == 0 {
                            Slot::attribute(*index, "href")
                        } else {
                            Slot {
                                index: *index,
                                kind: SlotKind::DeleteElement,
                            }
                        }
                    })
                    .collect();
                ctx.initiate_rewrite(RewriteRequest {
                    filter: FilterId::CombineCss,
                    inputs: batch.into_iter().map(|(_, url)| ResourceInput::Url(url)).collect(),
                    slots,
                });
            }
        }
    }
}

impl HtmlFilter for CombineCssFilter {
    fn id(&self) -> FilterId {
        FilterId::CombineCss
    }

    fn token(&mut self, ctx: &mut FilterContext<'_>, index: usize) {
        let candidate = match ctx.token(index) {
            Some(Token::Characters(text)) if text.iter().all(u8::is_ascii_whitespace) => return,
            Some(Token::StartTag(element)) => stylesheet_href(element)
                .and_then(|href| ctx.resolve(href))
                .map(|url| (url, element.attr("media").map(|m| m.trim().to_ascii_lowercase()))),
            _ => None,
        };

        let Some((url, media)) = candidate else {
            self.close_batch(ctx);
            return;
        };
        if !self.accepts(&url, &media) {
            self.close_batch(ctx);
        }
        if ctx.claim(index, "href") {
            if self.batch.is_empty() {
                self.media = media;
            }
            self.batch.push((index, url));
        }
    }

    fn flush(&mut self, ctx: &mut FilterContext<'_>) {
        self.close_batch(ctx);
    }

    fn end_document(&mut self, ctx: &mut FilterContext<'_>) {
        self.close_batch(ctx);
    }

    fn clear(&mut self) {
        self.batch.clear();
        self.media = None;
    }
}

/// Concatenates stylesheets, absolutifying references that would no longer
/// resolve from the combined URL's directory
pub struct CombineCssOptimizer;

#[async_trait]
impl Optimizer for CombineCssOptimizer {
    fn filter(&self) -> FilterId {
        FilterId::CombineCss
    }

    async fn optimize(&self, inputs: Vec<InputResource>, _env: &OptimizeEnv<'_>) -> Result<OptimizedOutput> {
        if inputs.len() < 2 {
            return Err(PagespeedError::OptimizerDeclined(
                "nothing to combine".to_string(),
            ));
        }
        let first_dir = inputs[0]
            .url
            .as_ref()
            .map(|u| directory(u).to_string())
            .unwrap_or_default();

        let mut combined = String::new();
        for input in &inputs {
            if !input.content_type.is_empty()
                && ResourceKind::from_content_type(&input.content_type) != ResourceKind::Css
            {
                return Err(PagespeedError::OptimizerDeclined(format!(
                    "not CSS: {}",
                    input.content_type
                )));
            }
            let css = input.text();
            let css = match &input.url {
                Some(url) if directory(url) != first_dir => rewrite_css_urls(&css, |value| {
                    let lower = value.to_ascii_lowercase();
                    if lower.starts_with("data:") || lower.contains("://") || value.starts_with('/') {
                        return None;
                    }
                    url.join(value).ok().map(|u| u.to_string())
                }),
                _ => css.into_owned(),
            };
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&css);
        }
        Ok(OptimizedOutput::new(combined, "text/css"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory() {
        let url = Url::parse("http://a.com/css/a.css?v=1").unwrap();
        assert_eq!(directory(&url), "http://a.com/css/");
    }
}
