//! Rewrite driver
//!
//! One [`RewriteDriver`] rewrites one HTML document. It lexes incoming
//! bytes, runs every token through the filter chain, registers the rewrite
//! contexts filters hand off, and at each flush waits (bounded by the
//! rewrite deadline) for the contexts whose slots fall inside the region
//! about to be emitted. Results that miss the deadline are abandoned: the
//! original URLs are emitted and the contexts keep running in the
//! background to warm the cache.
//!
//! The driver is synchronous. Context tasks run on the server's runtime
//! and report back through a [`Scoreboard`].

use crate::context::{RewriteOutcome, RewriteRequest, Slot, SlotKind};
use crate::error::{PagespeedError, Result};
use crate::fetcher::AsyncFetch;
use crate::filter::{build_chain, FilterContext, HtmlFilter, RewriteSummary};
use crate::html::{is_literal_element, serialize, Lexer, Token};
use crate::options::{RewriteOptions, Signature};
use crate::scoreboard::Scoreboard;
use crate::server_context::RewriteEngine;
use http::HeaderMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

/// Driver lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Parsing,
    Flushing,
    Finishing,
    /// Finished, awaiting `clear`
    IdleDirty,
    Aborted,
}

/// Cloneable in-memory sink for driver output
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything written so far
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.inner.lock())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Per-document state shared with filters through [`FilterContext`]
pub(crate) struct DriverCore {
    engine: Arc<RewriteEngine>,
    options: Arc<RewriteOptions>,
    state: DriverState,
    url: Option<Url>,
    base: Option<Url>,
    request_headers: HeaderMap,
    /// Tokens not yet emitted; `pending[0]` has stream index `base_index`
    pending: Vec<Token>,
    base_index: usize,
    /// Open literal element and the index of its start tag
    literal: Option<(String, usize)>,
    /// Comments injected while a literal element was open
    deferred: Vec<Token>,
    contexts: HashMap<u64, Vec<Slot>>,
    claims: HashSet<(usize, String)>,
    rendered: HashSet<(usize, SlotKind)>,
    scoreboard: Arc<Scoreboard>,
    cancel: CancellationToken,
    summary: RewriteSummary,
    writer: Box<dyn Write + Send>,
}

impl DriverCore {
    pub(crate) fn token(&self, index: usize) -> Option<&Token> {
        index
            .checked_sub(self.base_index)
            .and_then(|i| self.pending.get(i))
    }

    pub(crate) fn token_mut(&mut self, index: usize) -> Option<&mut Token> {
        index
            .checked_sub(self.base_index)
            .and_then(|i| self.pending.get_mut(i))
    }

    pub(crate) fn base_url(&self) -> Option<&Url> {
        self.base.as_ref()
    }

    pub(crate) fn options(&self) -> &RewriteOptions {
        &self.options
    }

    pub(crate) fn claim(&mut self, index: usize, attr: &str) -> bool {
        self.claims.insert((index, attr.to_ascii_lowercase()))
    }

    pub(crate) fn is_claimed(&self, index: usize, attr: &str) -> bool {
        self.claims.contains(&(index, attr.to_ascii_lowercase()))
    }

    pub(crate) fn summary(&self) -> RewriteSummary {
        RewriteSummary {
            pending: self.contexts.len(),
            ..self.summary
        }
    }

    pub(crate) fn initiate_rewrite(&mut self, request: RewriteRequest) -> bool {
        if self.contexts.len() >= self.options.max_rewrites_outstanding() {
            debug!(
                "Not rewriting {:?}: {} rewrites outstanding",
                request.inputs,
                self.contexts.len()
            );
            return false;
        }
        let id = self.engine.next_context_id();
        self.engine.start_rewrite(
            id,
            request.filter,
            request.inputs,
            self.options.clone(),
            self.request_headers.clone(),
            self.scoreboard.clone(),
            self.cancel.child_token(),
        );
        self.contexts.insert(id, request.slots);
        self.summary.initiated += 1;
        true
    }

    pub(crate) fn inject(&mut self, token: Token) {
        if self.literal.is_some() {
            self.deferred.push(token);
        } else {
            self.pending.push(token);
        }
    }

    fn push(&mut self, token: Token) -> usize {
        let index = self.base_index + self.pending.len();
        self.pending.push(token);
        index
    }

    /// Driver bookkeeping before filters see token `index`
    fn observe(&mut self, index: usize) {
        let Some(Token::StartTag(element)) = self.token(index) else {
            return;
        };
        if element.name() == "base" {
            let href = element.attr("href").map(str::to_string);
            if let (Some(href), Some(url)) = (href, self.url.as_ref()) {
                if let Ok(base) = url.join(href.trim()) {
                    self.base = Some(base);
                }
            }
        } else if !element.self_closing() && is_literal_element(element.name()) {
            self.literal = Some((element.name().to_string(), index));
        }
    }

    /// Driver bookkeeping after every filter saw token `index`
    fn after_filters(&mut self, index: usize) {
        let closes_literal = match (self.token(index), &self.literal) {
            (Some(Token::EndTag { name, .. }), Some((open, _))) => name == open,
            _ => false,
        };
        if closes_literal {
            self.literal = None;
            let deferred = std::mem::take(&mut self.deferred);
            self.pending.extend(deferred);
        }
    }

    /// Index up to which tokens may be emitted at a flush
    fn flush_boundary(&self) -> usize {
        match &self.literal {
            Some((_, start)) => *start,
            None => self.base_index + self.pending.len(),
        }
    }

    /// Wait for contexts whose slots all precede `boundary`, then render or
    /// abandon them
    fn resolve(&mut self, boundary: usize, deadline: Instant) {
        let due: Vec<u64> = self
            .contexts
            .iter()
            .filter(|(_, slots)| slots.iter().all(|slot| slot.index < boundary))
            .map(|(id, _)| *id)
            .collect();
        if due.is_empty() {
            return;
        }
        if !self.scoreboard.wait_for(&due, deadline) {
            debug!("Rewrite deadline passed with contexts outstanding");
        }
        for id in due {
            let Some(slots) = self.contexts.remove(&id) else {
                continue;
            };
            match self.scoreboard.take(id) {
                Some(outcome) => self.render(id, &outcome, &slots),
                None => {
                    debug!("Abandoning context {} at deadline", id);
                    self.scoreboard.abandon(id);
                    self.abandon_slots(&slots);
                }
            }
        }
    }

    fn abandon_slots(&mut self, slots: &[Slot]) {
        self.summary.abandoned += 1;
        self.engine.stats().slots_abandoned.inc_by(slots.len() as u64);
    }

    fn render(&mut self, id: u64, outcome: &RewriteOutcome, slots: &[Slot]) {
        let Some(replacement) = outcome.replacement(&self.options) else {
            debug!("Context {} produced no replacement: {:?}", id, outcome);
            self.abandon_slots(slots);
            return;
        };
        let mut rendered = 0u64;
        for slot in slots {
            if !self.rendered.insert((slot.index, slot.kind.clone())) {
                continue;
            }
            let Some(token) = self.token_mut(slot.index) else {
                debug!("Dropping render for emitted token {}", slot.index);
                continue;
            };
            match &slot.kind {
                SlotKind::Attribute(name) => {
                    if let Some(element) = token.as_element_mut() {
                        element.set_attr(name, &replacement);
                    }
                }
                SlotKind::DeleteElement => {
                    if let Some(element) = token.as_element_mut() {
                        element.delete();
                    }
                }
                SlotKind::ReplaceText => *token = Token::Characters(replacement.clone().into_bytes()),
                SlotKind::ClearText => *token = Token::Characters(Vec::new()),
            }
            rendered += 1;
        }
        self.summary.rendered += 1;
        self.engine.stats().slots_rendered.inc_by(rendered);
    }

    fn abandon_all(&mut self) {
        let ids: Vec<u64> = self.contexts.keys().copied().collect();
        for id in ids {
            if let Some(slots) = self.contexts.remove(&id) {
                self.scoreboard.abandon(id);
                self.abandon_slots(&slots);
            }
        }
    }

    /// Serialize and write tokens before `boundary`
    fn emit(&mut self, boundary: usize) -> Result<()> {
        let count = boundary.saturating_sub(self.base_index).min(self.pending.len());
        let emitted: Vec<Token> = self.pending.drain(..count).collect();
        self.base_index += count;
        let base_index = self.base_index;
        self.claims.retain(|(index, _)| *index >= base_index);
        self.rendered.retain(|(index, _)| *index >= base_index);

        let bytes = serialize(&emitted);
        if bytes.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.writer.write_all(&bytes) {
            warn!("Client write failed, aborting rewrite: {}", e);
            self.abort();
            return Err(e.into());
        }
        Ok(())
    }

    fn abort(&mut self) {
        self.state = DriverState::Aborted;
        self.cancel.cancel();
        for id in self.contexts.keys() {
            self.scoreboard.abandon(*id);
        }
        self.contexts.clear();
        self.pending.clear();
        self.deferred.clear();
    }
}

/// Rewrites one HTML document at a time
pub struct RewriteDriver {
    filters: Vec<Box<dyn HtmlFilter>>,
    lexer: Lexer,
    signature: Signature,
    core: DriverCore,
}

impl RewriteDriver {
    pub fn new(engine: Arc<RewriteEngine>, options: Arc<RewriteOptions>) -> Self {
        engine.stats().drivers_constructed.inc();
        Self {
            filters: build_chain(&options),
            lexer: Lexer::new(),
            signature: options.signature(),
            core: DriverCore {
                engine,
                options,
                state: DriverState::Idle,
                url: None,
                base: None,
                request_headers: HeaderMap::new(),
                pending: Vec::new(),
                base_index: 0,
                literal: None,
                deferred: Vec::new(),
                contexts: HashMap::new(),
                claims: HashSet::new(),
                rendered: HashSet::new(),
                scoreboard: Arc::new(Scoreboard::new()),
                cancel: CancellationToken::new(),
                summary: RewriteSummary::default(),
                writer: Box::new(std::io::sink()),
            },
        }
    }

    pub fn state(&self) -> DriverState {
        self.core.state
    }

    pub fn options(&self) -> &Arc<RewriteOptions> {
        &self.core.options
    }

    /// Signature of the options the filter chain was built for
    pub fn signature(&self) -> Signature {
        self.signature
    }

    pub fn summary(&self) -> RewriteSummary {
        self.core.summary()
    }

    /// Replace the options with an equal-signature object
    pub(crate) fn set_options(&mut self, options: Arc<RewriteOptions>) {
        debug_assert_eq!(options.signature(), self.signature);
        self.core.options = options;
    }

    /// Where rewritten bytes go; defaults to a sink
    pub fn set_writer(&mut self, writer: Box<dyn Write + Send>) {
        self.core.writer = writer;
    }

    fn expect_state(&self, expected: DriverState) -> Result<()> {
        if self.core.state != expected {
            return Err(PagespeedError::invalid_state(
                format!("{:?}", expected),
                self.core.state,
            ));
        }
        Ok(())
    }

    fn run_filters(&mut self, mut f: impl FnMut(&mut dyn HtmlFilter, &mut FilterContext<'_>)) {
        for filter in self.filters.iter_mut() {
            let mut ctx = FilterContext::new(&mut self.core);
            f(filter.as_mut(), &mut ctx);
        }
    }

    fn dispatch(&mut self, tokens: Vec<Token>) {
        for token in tokens {
            let index = self.core.push(token);
            self.core.observe(index);
            self.run_filters(|filter, ctx| filter.token(ctx, index));
            self.core.after_filters(index);
        }
    }

    /// Begin a document
    pub fn start_parse(&mut self, url: Url, request_headers: HeaderMap) -> Result<()> {
        self.expect_state(DriverState::Idle)?;
        debug!("Starting rewrite of {}", url);
        self.core.base = Some(url.clone());
        self.core.url = Some(url);
        self.core.request_headers = request_headers;
        self.core.state = DriverState::Parsing;
        self.run_filters(|filter, ctx| filter.start_document(ctx));
        Ok(())
    }

    /// Feed a chunk of the document; never waits on rewrites
    pub fn parse_text(&mut self, bytes: &[u8]) -> Result<()> {
        self.expect_state(DriverState::Parsing)?;
        let mut tokens = Vec::new();
        self.lexer.feed(bytes, &mut tokens);
        self.dispatch(tokens);
        Ok(())
    }

    /// Bytes lexed but not yet emitted
    pub fn buffered_bytes(&self) -> usize {
        self.lexer.buffered()
            + self
                .core
                .pending
                .iter()
                .map(|t| match t {
                    Token::Characters(b) | Token::Comment(b) | Token::Directive(b) => b.len(),
                    _ => 16,
                })
                .sum::<usize>()
    }

    fn deadline(&self) -> Instant {
        Instant::now() + Duration::from_millis(self.core.options.rewrite_deadline_ms())
    }

    /// Emit everything seen so far, waiting up to the rewrite deadline for
    /// rewrites inside the emitted region
    ///
    /// An open literal element is held back whole, together with any
    /// comments injected while it is open.
    pub fn flush(&mut self) -> Result<()> {
        self.expect_state(DriverState::Parsing)?;
        self.core.state = DriverState::Flushing;
        self.run_filters(|filter, ctx| filter.flush(ctx));

        let boundary = self.core.flush_boundary();
        let deadline = self.deadline();
        self.core.resolve(boundary, deadline);
        self.core.emit(boundary)?;
        if let Err(e) = self.core.writer.flush() {
            warn!("Client flush failed, aborting rewrite: {}", e);
            self.core.abort();
            return Err(e.into());
        }
        self.core.state = DriverState::Parsing;
        Ok(())
    }

    /// End the document: emit the rest, abandoning rewrites that miss the
    /// deadline
    pub fn finish_parse(&mut self) -> Result<()> {
        self.expect_state(DriverState::Parsing)?;
        let mut tokens = Vec::new();
        self.lexer.finish(&mut tokens);
        self.dispatch(tokens);

        self.core.state = DriverState::Finishing;
        self.run_filters(|filter, ctx| filter.end_document(ctx));
        if self.core.literal.take().is_some() {
            let deferred = std::mem::take(&mut self.core.deferred);
            self.core.pending.extend(deferred);
        }

        let boundary = self.core.base_index + self.core.pending.len();
        let deadline = self.deadline();
        self.core.resolve(boundary, deadline);
        self.core.abandon_all();
        self.core.emit(boundary)?;
        if let Err(e) = self.core.writer.flush() {
            warn!("Client flush failed: {}", e);
            self.core.abort();
            return Err(e.into());
        }

        self.core.state = DriverState::IdleDirty;
        self.core.engine.stats().html_documents_rewritten.inc();
        Ok(())
    }

    /// Give up on the document: cancel its rewrites and drop pending output
    pub fn abort(&mut self) {
        if self.core.state != DriverState::Idle {
            self.core.abort();
        }
    }

    /// Reset per-document state so the driver can be reused
    pub fn clear(&mut self) {
        if matches!(
            self.core.state,
            DriverState::Parsing | DriverState::Flushing | DriverState::Finishing
        ) {
            self.core.abort();
        }
        self.core.abandon_all();
        self.lexer.reset();
        for filter in self.filters.iter_mut() {
            filter.clear();
        }
        let core = &mut self.core;
        core.url = None;
        core.base = None;
        core.request_headers = HeaderMap::new();
        core.pending.clear();
        core.base_index = 0;
        core.literal = None;
        core.deferred.clear();
        core.claims.clear();
        core.rendered.clear();
        core.scoreboard = Arc::new(Scoreboard::new());
        core.cancel = CancellationToken::new();
        core.summary = RewriteSummary::default();
        core.writer = Box::new(std::io::sink());
        core.state = DriverState::Idle;
    }

    /// Look up (and optionally fetch) the in-place optimized variant of `url`
    ///
    /// `fetch` is completed exactly once, from a runtime thread.
    pub fn fetch_in_place_resource(&self, url: &Url, perform_http_fetch: bool, fetch: Box<dyn AsyncFetch>) {
        self.core.engine.fetch_in_place(
            url.clone(),
            self.core.options.clone(),
            self.core.request_headers.clone(),
            perform_http_fetch,
            fetch,
        );
    }
}

impl Drop for RewriteDriver {
    fn drop(&mut self) {
        if matches!(
            self.core.state,
            DriverState::Parsing | DriverState::Flushing | DriverState::Finishing
        ) {
            self.core.cancel.cancel();
        }
    }
}
