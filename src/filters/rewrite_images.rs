//! Image rewriting
//!
//! Images are handed to a pluggable [`ImageCodec`] on the expensive pool.
//! Results no larger than the inline threshold are written back as `data:`
//! URLs instead of links.

use crate::context::{ResourceInput, RewriteRequest, Slot};
use crate::error::{PagespeedError, Result};
use crate::filter::{FilterContext, HtmlFilter};
use crate::optimizer::{InputResource, OptimizeEnv, OptimizedOutput, Optimizer};
use crate::options::FilterId;
use crate::resource_namer::ResourceKind;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

/// Image recompression backend
///
/// Returning [`PagespeedError::OptimizerDeclined`] leaves the image alone.
pub trait ImageCodec: Send + Sync {
    fn recompress(&self, content_type: &str, body: &[u8]) -> Result<Vec<u8>>;
}

/// Codec used when no image library is configured
#[derive(Debug, Default)]
pub struct NoopImageCodec;

impl ImageCodec for NoopImageCodec {
    fn recompress(&self, content_type: &str, _body: &[u8]) -> Result<Vec<u8>> {
        Err(PagespeedError::OptimizerDeclined(format!(
            "no codec for {}",
            content_type
        )))
    }
}

#[derive(Debug, Default)]
pub struct RewriteImagesFilter;

impl RewriteImagesFilter {
    pub fn new() -> Self {
        Self
    }
}

impl HtmlFilter for RewriteImagesFilter {
    fn id(&self) -> FilterId {
        FilterId::RewriteImages
    }

    fn token(&mut self, ctx: &mut FilterContext<'_>, index: usize) {
        let Some(element) = ctx.element(index) else {
            return;
        };
        if element.name() != "img" {
            return;
        }
        let Some(url) = element.attr("src").and_then(|src| ctx.resolve(src)) else {
            return;
        };
        if !ctx.claim(index, "src") {
            return;
        }
        ctx.initiate_rewrite(RewriteRequest {
            filter: FilterId::RewriteImages,
            inputs: vec![ResourceInput::Url(url)],
            slots: vec![Slot::attribute(index, "src")],
        });
    }
}

pub struct ImageOptimizer {
    codec: Arc<dyn ImageCodec>,
}

impl ImageOptimizer {
    pub fn new(codec: Arc<dyn ImageCodec>) -> Self {
        Self { codec }
    }
}

#[async_trait]
impl Optimizer for ImageOptimizer {
    fn filter(&self) -> FilterId {
        FilterId::RewriteImages
    }

    async fn optimize(&self, inputs: Vec<InputResource>, env: &OptimizeEnv<'_>) -> Result<OptimizedOutput> {
        let input = inputs
            .into_iter()
            .next()
            .ok_or_else(|| PagespeedError::OptimizerDeclined("no input".to_string()))?;
        if ResourceKind::from_content_type(&input.content_type) != ResourceKind::Image {
            return Err(PagespeedError::OptimizerDeclined(format!(
                "not an image: {:?}",
                input.content_type
            )));
        }

        let codec = self.codec.clone();
        let content_type = input.content_type.clone();
        let original = input.body.clone();
        let recompressed = env
            .run_expensive(move || codec.recompress(&content_type, &original))
            .await?;

        let body = if recompressed.len() < input.body.len() {
            Bytes::from(recompressed)
        } else {
            debug!(
                "Recompressed image is not smaller ({} >= {} bytes), keeping original",
                recompressed.len(),
                input.body.len()
            );
            input.body
        };

        let mut output = OptimizedOutput::new(body, input.content_type);
        if output.body.len() <= env.options().image_inline_max_bytes() {
            output.inline = Some(format!(
                "data:{};base64,{}",
                output.content_type,
                STANDARD.encode(&output.body)
            ));
        }
        Ok(output)
    }
}
