//! Rewrite contexts
//!
//! A [`RewriteContext`] takes one (filter, input set) pair from reference to
//! result: it derives the partition key, joins the process-wide
//! [`SingleFlight`] table, consults the cache, fetches inputs, runs the
//! optimizer and stores the artifact. Concurrent contexts for the same
//! partition key fan in on the primary's result instead of repeating the
//! work.
//!
//! Contexts never touch the HTML token stream. The driver owns the slots a
//! context is bound to and renders them from the [`RewriteOutcome`].

use crate::cache::now_ms;
use crate::error::PagespeedError;
use crate::http_cache::CachedResponse;
use crate::optimizer::{InputResource, OptimizeEnv, OptimizedOutput};
use crate::options::{FilterId, RewriteOptions};
use crate::resource_namer::{content_hash, encode, extension_for};
use crate::server_context::RewriteEngine;
use bytes::Bytes;
use futures::future::join_all;
use http::HeaderMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::watch;
use tracing::{debug, warn};
use url::Url;
use xxhash_rust::xxh3::xxh3_128;

/// Cache lifetime of generated artifacts
pub const ARTIFACT_MAX_AGE_SECS: u64 = 365 * 24 * 60 * 60;

/// One input of a rewrite
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceInput {
    /// An external resource, fetched through the HTTP cache
    Url(Url),
    /// Content taken from the document itself, e.g. a `<style>` block
    Inline {
        content: Bytes,
        content_type: String,
        base: Url,
    },
}

impl ResourceInput {
    pub fn url(&self) -> Option<&Url> {
        match self {
            ResourceInput::Url(url) => Some(url),
            ResourceInput::Inline { .. } => None,
        }
    }
}

/// How a successful rewrite updates one token
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SlotKind {
    /// Replace an attribute value with the new URL (or inline replacement)
    Attribute(String),
    /// Remove the element, e.g. a stylesheet merged into a combination
    DeleteElement,
    /// Replace a text token with the inline result
    ReplaceText,
    /// Empty a text token whose content moved into another slot
    ClearText,
}

/// A token position bound to a rewrite
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    /// Index of the token in the driver's stream
    pub index: usize,
    pub kind: SlotKind,
}

impl Slot {
    pub fn attribute(index: usize, name: &str) -> Self {
        Self {
            index,
            kind: SlotKind::Attribute(name.to_string()),
        }
    }
}

/// A filter's hand-off to the rewrite engine
#[derive(Debug, Clone)]
pub struct RewriteRequest {
    pub filter: FilterId,
    pub inputs: Vec<ResourceInput>,
    pub slots: Vec<Slot>,
}

/// Terminal result of a context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteOutcome {
    Optimized {
        /// Canonical generated URL (before rewrite-domain mapping)
        url: Option<String>,
        /// Replacement written instead of the URL when present
        inline: Option<String>,
    },
    Declined,
    Failed,
}

impl RewriteOutcome {
    pub fn is_optimized(&self) -> bool {
        matches!(self, RewriteOutcome::Optimized { .. })
    }

    /// Value to write in place of the original reference
    ///
    /// The inline replacement wins; otherwise the generated URL mapped
    /// onto the rewrite domain.
    pub fn replacement(&self, options: &RewriteOptions) -> Option<String> {
        match self {
            RewriteOutcome::Optimized { url, inline } => inline
                .clone()
                .or_else(|| url.as_deref().map(|u| options.domain_lawyer().map_rewrite(u))),
            RewriteOutcome::Declined | RewriteOutcome::Failed => None,
        }
    }
}

/// What a partition key maps to in the cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RewriteRecord {
    Optimized {
        url: Option<String>,
        content_type: String,
        /// Earliest expiry among the inputs
        expires_ms: i64,
        inline: Option<String>,
    },
    Declined {
        expires_ms: i64,
    },
}

impl RewriteRecord {
    pub fn expires_ms(&self) -> i64 {
        match self {
            RewriteRecord::Optimized { expires_ms, .. } | RewriteRecord::Declined { expires_ms } => *expires_ms,
        }
    }
}

/// Cache key for a rewrite: filter id, input fingerprint, option fragment
pub fn partition_key(filter: FilterId, inputs: &[ResourceInput], options: &RewriteOptions) -> String {
    let mut material = Vec::new();
    for input in inputs {
        match input {
            ResourceInput::Url(url) => {
                material.extend_from_slice(b"u:");
                material.extend_from_slice(url.as_str().as_bytes());
            }
            ResourceInput::Inline {
                content,
                content_type,
                base,
            } => {
                material.extend_from_slice(b"i:");
                material.extend_from_slice(format!("{:032x}", xxh3_128(content)).as_bytes());
                material.push(b' ');
                material.extend_from_slice(content_type.as_bytes());
                material.push(b' ');
                material.extend_from_slice(base.as_str().as_bytes());
            }
        }
        material.push(b'\n');
    }
    format!(
        "rname/{}/{:032x}/{:016x}",
        filter.code(),
        xxh3_128(&material),
        options.signature_fragment(filter)
    )
}

type FlightResult = Option<RewriteOutcome>;

/// Process-wide table of in-flight partitions
#[derive(Default)]
pub struct SingleFlight {
    inflight: Mutex<HashMap<String, watch::Receiver<FlightResult>>>,
}

/// Role of a context within the single-flight table
pub enum Flight<'a> {
    Primary(FlightGuard<'a>),
    Follower(watch::Receiver<FlightResult>),
}

/// Held by the primary; clears the table entry when dropped
pub struct FlightGuard<'a> {
    table: &'a SingleFlight,
    key: String,
    tx: watch::Sender<FlightResult>,
}

impl FlightGuard<'_> {
    /// Publish the result to followers
    pub fn complete(self, outcome: RewriteOutcome) {
        self.tx.send_replace(Some(outcome));
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.table.inflight.lock().remove(&self.key);
    }
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Become primary for `key`, or follow the existing primary
    pub fn join(&self, key: &str) -> Flight<'_> {
        let mut inflight = self.inflight.lock();
        if let Some(rx) = inflight.get(key) {
            return Flight::Follower(rx.clone());
        }
        let (tx, rx) = watch::channel(None);
        inflight.insert(key.to_string(), rx);
        Flight::Primary(FlightGuard {
            table: self,
            key: key.to_string(),
            tx,
        })
    }

    pub fn in_flight(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Wait for a primary's result; a vanished primary counts as failure
    pub async fn follow(mut rx: watch::Receiver<FlightResult>) -> RewriteOutcome {
        match rx.wait_for(|result| result.is_some()).await {
            Ok(result) => result.clone().unwrap_or(RewriteOutcome::Failed),
            Err(_) => RewriteOutcome::Failed,
        }
    }
}

/// Lifecycle of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Created,
    Initiating,
    CacheLookup,
    Fetching,
    Rewriting,
    Harvesting,
    Ready,
    Failed,
}

/// One rewrite in progress
pub struct RewriteContext<'a> {
    engine: &'a RewriteEngine,
    filter: FilterId,
    inputs: &'a [ResourceInput],
    options: &'a RewriteOptions,
    request_headers: &'a HeaderMap,
    depth: usize,
    key: String,
    state: ContextState,
}

impl<'a> RewriteContext<'a> {
    pub fn new(
        engine: &'a RewriteEngine,
        filter: FilterId,
        inputs: &'a [ResourceInput],
        options: &'a RewriteOptions,
        request_headers: &'a HeaderMap,
        depth: usize,
    ) -> Self {
        Self {
            engine,
            filter,
            inputs,
            options,
            request_headers,
            depth,
            key: partition_key(filter, inputs, options),
            state: ContextState::Created,
        }
    }

    pub fn partition_key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    fn transition(&mut self, next: ContextState) {
        debug!("Context {} {:?} -> {:?}", self.key, self.state, next);
        self.state = next;
    }

    /// Drive the context to a terminal state
    pub async fn run(mut self) -> RewriteOutcome {
        self.transition(ContextState::Initiating);
        let engine = self.engine;
        let stats = engine.stats().clone();
        match engine.single_flight().join(&self.key) {
            Flight::Follower(rx) => {
                stats.rewrites_fan_in.inc();
                debug!("Context {} fanning in on in-flight primary", self.key);
                let outcome = SingleFlight::follow(rx).await;
                self.finish(&outcome);
                outcome
            }
            Flight::Primary(guard) => {
                let outcome = self.run_primary().await;
                self.finish(&outcome);
                guard.complete(outcome.clone());
                outcome
            }
        }
    }

    fn finish(&mut self, outcome: &RewriteOutcome) {
        let state = match outcome {
            RewriteOutcome::Optimized { .. } => ContextState::Ready,
            RewriteOutcome::Declined | RewriteOutcome::Failed => ContextState::Failed,
        };
        self.transition(state);
    }

    async fn run_primary(&mut self) -> RewriteOutcome {
        let stats = self.engine.stats().clone();

        self.transition(ContextState::CacheLookup);
        if let Some(outcome) = self.cache_lookup().await {
            stats.rewrites_cache_hits.inc();
            return outcome;
        }

        stats.rewrites_started.inc();
        self.transition(ContextState::Fetching);
        let inputs = match self.fetch().await {
            Ok(inputs) => inputs,
            Err(e) => {
                debug!("Context {} failed fetching inputs: {}", self.key, e);
                stats.rewrites_failed.inc();
                return RewriteOutcome::Failed;
            }
        };

        self.transition(ContextState::Rewriting);
        match self.rewrite(inputs.clone()).await {
            Ok(output) => {
                self.transition(ContextState::Harvesting);
                match self.harvest(&inputs, output).await {
                    Some(outcome) => {
                        stats.rewrites_succeeded.inc();
                        outcome
                    }
                    None => {
                        stats.rewrites_failed.inc();
                        RewriteOutcome::Failed
                    }
                }
            }
            Err(e) if e.is_content() => {
                debug!("Optimizer {} declined {}: {}", self.filter, self.key, e);
                stats.rewrites_declined.inc();
                self.remember_decline().await;
                RewriteOutcome::Declined
            }
            Err(e) => {
                warn!("Rewrite {} failed: {}", self.key, e);
                stats.rewrites_failed.inc();
                RewriteOutcome::Failed
            }
        }
    }

    /// A valid record ends the context; a live decline also suppresses
    /// becoming primary for the work itself
    async fn cache_lookup(&self) -> Option<RewriteOutcome> {
        let entry = self
            .engine
            .cache()
            .lookup(&self.key, self.options.cache_invalidation_timestamp_ms())
            .await?;
        let record: RewriteRecord = match bincode::deserialize(&entry.payload) {
            Ok(record) => record,
            Err(e) => {
                warn!("Corrupt rewrite record for {}: {}", self.key, e);
                return None;
            }
        };
        if record.expires_ms() <= now_ms() {
            debug!("Rewrite record for {} expired", self.key);
            return None;
        }
        Some(match record {
            RewriteRecord::Optimized { url, inline, .. } => RewriteOutcome::Optimized { url, inline },
            RewriteRecord::Declined { .. } => RewriteOutcome::Declined,
        })
    }

    async fn fetch(&self) -> Result<Vec<InputResource>, PagespeedError> {
        let fetches = self.inputs.iter().map(|input| async move {
            match input {
                ResourceInput::Url(url) => {
                    let response = self
                        .engine
                        .fetch_resource(url, self.request_headers, self.options)
                        .await?;
                    Ok::<_, PagespeedError>(input_from_response(url.clone(), response))
                }
                ResourceInput::Inline {
                    content,
                    content_type,
                    base,
                } => Ok::<_, PagespeedError>(InputResource {
                    url: None,
                    base: Some(base.clone()),
                    content_type: content_type.clone(),
                    body: content.clone(),
                    expires_ms: i64::MAX,
                }),
            }
        });
        join_all(fetches).await.into_iter().collect()
    }

    async fn rewrite(&self, inputs: Vec<InputResource>) -> Result<OptimizedOutput, PagespeedError> {
        let optimizer = self.engine.optimizer(self.filter).ok_or_else(|| {
            PagespeedError::InternalError(format!("no optimizer registered for {}", self.filter))
        })?;
        self.engine.stats().record_optimizer_invocation(self.filter);
        let env = OptimizeEnv::new(self.engine, self.options, self.request_headers, self.depth);
        optimizer.optimize(inputs, &env).await
    }

    /// Store the artifact and the record; `None` when nothing could be stored
    async fn harvest(&self, inputs: &[InputResource], output: OptimizedOutput) -> Option<RewriteOutcome> {
        let urls: Vec<Url> = self.inputs.iter().filter_map(|i| i.url().cloned()).collect();
        let expires_ms = inputs.iter().map(|i| i.expires_ms).min().unwrap_or(i64::MAX);

        let url = if urls.len() == self.inputs.len() && !urls.is_empty() {
            let (generated, artifact) = build_artifact(self.filter, &urls, &output)?;
            self.engine
                .http_cache()
                .put(&generated, &HeaderMap::new(), artifact, self.options)
                .await?;
            Some(generated)
        } else {
            None
        };

        let inline = output
            .inline
            .or_else(|| url.is_none().then(|| String::from_utf8_lossy(&output.body).into_owned()));

        let record = RewriteRecord::Optimized {
            url: url.clone(),
            content_type: output.content_type,
            expires_ms,
            inline: inline.clone(),
        };
        self.write_record(&record).await;
        Some(RewriteOutcome::Optimized { url, inline })
    }

    async fn remember_decline(&self) {
        let ttl = self.options.max_negative_ttl_ms() as i64;
        let record = RewriteRecord::Declined {
            expires_ms: now_ms() + ttl,
        };
        self.write_record(&record).await;
    }

    async fn write_record(&self, record: &RewriteRecord) {
        match bincode::serialize(record) {
            Ok(payload) => {
                self.engine
                    .cache()
                    .put(
                        &self.key,
                        payload,
                        None,
                        self.options.cache_invalidation_timestamp_ms(),
                    )
                    .await
            }
            Err(e) => warn!("Failed to encode rewrite record for {}: {}", self.key, e),
        }
    }
}

pub(crate) fn input_from_response(url: Url, response: CachedResponse) -> InputResource {
    let content_type = response
        .content_type()
        .map(str::to_string)
        .unwrap_or_default();
    InputResource {
        base: Some(url.clone()),
        url: Some(url),
        content_type,
        expires_ms: response.expires_ms,
        body: Bytes::from(response.body),
    }
}

/// Generated URL and long-lived artifact for `output` rewritten from `urls`
pub(crate) fn build_artifact(
    filter: FilterId,
    urls: &[Url],
    output: &OptimizedOutput,
) -> Option<(String, CachedResponse)> {
    let ext = extension_for(&output.content_type)
        .map(str::to_string)
        .or_else(|| urls.first().and_then(url_extension))?;
    let generated = encode(filter, urls, &content_hash(&output.body), &ext)?;
    let artifact = CachedResponse::new(
        200,
        vec![
            ("Content-Type".to_string(), output.content_type.clone()),
            (
                "Cache-Control".to_string(),
                format!("max-age={}", ARTIFACT_MAX_AGE_SECS),
            ),
        ],
        output.body.to_vec(),
    );
    Some((generated, artifact))
}

fn url_extension(url: &Url) -> Option<String> {
    let leaf = url.path_segments()?.next_back()?;
    let (_, ext) = leaf.rsplit_once('.')?;
    (!ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric())).then(|| ext.to_ascii_lowercase())
}
