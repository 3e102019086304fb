//! Optimizer contract
//!
//! An [`Optimizer`] turns fetched inputs into one output artifact. It runs
//! inside a rewrite context and may start nested rewrites of resources it
//! references (e.g. images inside CSS) through [`OptimizeEnv::nested`].

use crate::context::{ResourceInput, RewriteContext, RewriteOutcome};
use crate::error::{PagespeedError, Result};
use crate::options::{FilterId, RewriteOptions};
use crate::server_context::RewriteEngine;
use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use std::borrow::Cow;
use tracing::debug;
use url::Url;

/// Nested rewrites deeper than this fail without running
pub const MAX_NESTING_DEPTH: usize = 2;

/// A fetched (or inline) input handed to an optimizer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputResource {
    /// `None` for inline content
    pub url: Option<Url>,
    /// URL that relative references inside the content resolve against
    pub base: Option<Url>,
    pub content_type: String,
    pub body: Bytes,
    /// Absolute expiry in epoch milliseconds
    pub expires_ms: i64,
}

impl InputResource {
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// What an optimizer produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimizedOutput {
    pub body: Bytes,
    pub content_type: String,
    /// Replacement to write instead of a URL, e.g. a `data:` URL
    pub inline: Option<String>,
}

impl OptimizedOutput {
    pub fn new(body: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            content_type: content_type.into(),
            inline: None,
        }
    }
}

/// Turn inputs into an optimized artifact
///
/// Declining is reported as [`PagespeedError::OptimizerDeclined`]; the
/// context caches the decline so the work is not retried until the
/// negative record expires.
#[async_trait]
pub trait Optimizer: Send + Sync {
    fn filter(&self) -> FilterId;

    async fn optimize(&self, inputs: Vec<InputResource>, env: &OptimizeEnv<'_>) -> Result<OptimizedOutput>;
}

/// Services available to a running optimizer
pub struct OptimizeEnv<'a> {
    engine: &'a RewriteEngine,
    options: &'a RewriteOptions,
    request_headers: &'a HeaderMap,
    depth: usize,
}

impl<'a> OptimizeEnv<'a> {
    pub(crate) fn new(
        engine: &'a RewriteEngine,
        options: &'a RewriteOptions,
        request_headers: &'a HeaderMap,
        depth: usize,
    ) -> Self {
        Self {
            engine,
            options,
            request_headers,
            depth,
        }
    }

    pub fn options(&self) -> &RewriteOptions {
        self.options
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Rewrite `url` with `filter` as a child of the running context
    ///
    /// The child shares the parent's deadline; its result is returned to
    /// the parent directly.
    pub async fn nested(&self, filter: FilterId, url: Url) -> RewriteOutcome {
        if self.depth >= MAX_NESTING_DEPTH {
            debug!("Not nesting {} for {}: depth {}", filter, url, self.depth);
            return RewriteOutcome::Failed;
        }
        let inputs = [ResourceInput::Url(url)];
        let child = RewriteContext::new(
            self.engine,
            filter,
            &inputs,
            self.options,
            self.request_headers,
            self.depth + 1,
        );
        Box::pin(child.run()).await
    }

    /// Run CPU-heavy work on the blocking pool, bounded by the expensive
    /// rewrite thread count
    pub async fn run_expensive<F, T>(&self, work: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self
            .engine
            .expensive_permits()
            .acquire()
            .await
            .map_err(|_| PagespeedError::InternalError("expensive pool closed".to_string()))?;
        tokio::task::spawn_blocking(work)
            .await
            .map_err(|e| PagespeedError::InternalError(format!("expensive task failed: {}", e)))?
    }
}
