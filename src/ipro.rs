//! In-place resource optimization recorder
//!
//! A recorder observes a resource response passing through the proxy.
//! Body chunks are buffered up to a size bound; once the response ends and
//! its final headers are known, an eligible response is written to the
//! HTTP cache as if it had been fetched on demand and an optimized variant
//! is produced in the background. Later requests for the same URL are then
//! served the variant. The recorder never alters the bytes it observes.

use crate::http_cache::{find_header, CachePolicy, CachedResponse, FailureKind};
use crate::options::{FilterId, RewriteOptions};
use crate::resource_namer::ResourceKind;
use crate::server_context::RewriteEngine;
use http::HeaderMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// Filter producing the in-place variant for a resource kind
pub fn in_place_filter(kind: ResourceKind, options: &RewriteOptions) -> Option<FilterId> {
    let candidates: &[FilterId] = match kind {
        ResourceKind::Css => &[FilterId::RewriteCss, FilterId::ExtendCache],
        ResourceKind::Image => &[FilterId::RewriteImages, FilterId::ExtendCache],
        ResourceKind::Javascript => &[FilterId::ExtendCache],
        ResourceKind::Html | ResourceKind::Other => &[],
    };
    candidates.iter().copied().find(|f| options.is_enabled(*f))
}

/// One of a bounded number of concurrent recordings
#[derive(Debug)]
pub struct RecordingSlot {
    active: Arc<AtomicUsize>,
}

impl RecordingSlot {
    /// Claim a slot unless `limit` recordings are already active
    pub fn try_acquire(active: &Arc<AtomicUsize>, limit: usize) -> Option<Self> {
        active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1))
            .ok()
            .map(|_| Self {
                active: Arc::clone(active),
            })
    }
}

impl Drop for RecordingSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recording {
    Buffering,
    /// Gave up; the remaining bytes are passed through unrecorded
    Failed,
}

pub struct InPlaceRecorder {
    engine: Arc<RewriteEngine>,
    url: Url,
    options: Arc<RewriteOptions>,
    request_headers: HeaderMap,
    max_bytes: usize,
    buffer: Vec<u8>,
    state: Recording,
    _slot: RecordingSlot,
}

impl InPlaceRecorder {
    pub(crate) fn new(
        engine: Arc<RewriteEngine>,
        url: Url,
        options: Arc<RewriteOptions>,
        request_headers: HeaderMap,
        max_bytes: usize,
        slot: RecordingSlot,
    ) -> Self {
        Self {
            engine,
            url,
            options,
            request_headers,
            max_bytes,
            buffer: Vec::new(),
            state: Recording::Buffering,
            _slot: slot,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn is_failed(&self) -> bool {
        self.state == Recording::Failed
    }

    fn fail(&mut self) {
        self.state = Recording::Failed;
        self.buffer = Vec::new();
    }

    fn fail_for_size(&mut self) {
        if self.state == Recording::Buffering {
            debug!("Not recording {}: exceeds {} bytes", self.url, self.max_bytes);
            self.engine.stats().ipro_recorder_dropped_due_to_size.inc();
            self.fail();
        }
    }

    /// Early look at the upstream headers; a declared length over the bound
    /// ends the recording before any body is buffered
    pub fn consider_response_headers(&mut self, status: u16, headers: &[(String, String)]) {
        if status != 200 {
            return;
        }
        let declared = find_header(headers, "content-length").and_then(|v| v.trim().parse::<usize>().ok());
        if declared.is_some_and(|len| len > self.max_bytes) {
            self.fail_for_size();
        }
    }

    /// Observe one body chunk
    pub fn write(&mut self, chunk: &[u8]) {
        if self.state != Recording::Buffering {
            return;
        }
        if self.buffer.len() + chunk.len() > self.max_bytes {
            self.fail_for_size();
            return;
        }
        self.buffer.extend_from_slice(chunk);
    }

    /// Final headers are known and the body has ended
    ///
    /// `complete` is false when the response was cut short.
    pub fn done(mut self, status: u16, headers: Vec<(String, String)>, complete: bool) {
        let stats = self.engine.stats().clone();
        if self.state == Recording::Failed {
            return;
        }
        if !complete {
            debug!("Recording of {} incomplete", self.url);
            stats.ipro_recorder_failed.inc();
            return;
        }

        if let Some(kind) = FailureKind::from_status(status) {
            debug!("Remembering {:?} for {} from recorded status {}", kind, self.url, status);
            stats.ipro_recorder_failed.inc();
            let engine = self.engine.clone();
            let url = self.url.to_string();
            let options = self.options.clone();
            self.engine.spawn_background(async move {
                engine.http_cache().remember_failure(&url, kind, &options).await;
            });
            return;
        }
        if status != 200 {
            stats.ipro_recorder_failed.inc();
            return;
        }

        let content_type = find_header(&headers, "content-type").unwrap_or("");
        let Some(filter) = in_place_filter(ResourceKind::from_content_type(content_type), &self.options) else {
            debug!("Not recording {}: no in-place filter for {:?}", self.url, content_type);
            return;
        };

        let policy = CachePolicy::analyze(status, &headers, self.options.implicit_cache_ttl_ms());
        let varies = !self.options.respect_vary()
            && find_header(&headers, "vary").is_some_and(|vary| {
                vary.split(',')
                    .map(str::trim)
                    .any(|h| !h.is_empty() && !h.eq_ignore_ascii_case("accept-encoding"))
            });
        if !policy.cacheable || varies {
            debug!("Not recording {}: not cacheable", self.url);
            stats.ipro_recorder_not_cacheable.inc();
            return;
        }

        let body = std::mem::take(&mut self.buffer);
        let response = CachedResponse::new(status, headers, body);
        let engine = self.engine.clone();
        let url = self.url.clone();
        let options = self.options.clone();
        let request_headers = std::mem::take(&mut self.request_headers);
        self.engine.spawn_background(async move {
            if engine
                .http_cache()
                .put(url.as_str(), &request_headers, response, &options)
                .await
                .is_none()
            {
                engine.stats().ipro_recorder_not_cacheable.inc();
                return;
            }
            engine.stats().ipro_recorder_inserted_into_cache.inc();
            engine
                .optimize_in_place(&url, &request_headers, &options, filter)
                .await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::RewriteOptionsBuilder;

    #[test]
    fn test_in_place_filter_prefers_enabled() {
        let options = RewriteOptionsBuilder::new()
            .enable_filter(FilterId::ExtendCache)
            .freeze();
        assert_eq!(in_place_filter(ResourceKind::Css, &options), Some(FilterId::ExtendCache));
        assert_eq!(in_place_filter(ResourceKind::Html, &options), None);

        let options = options
            .to_builder()
            .enable_filter(FilterId::RewriteCss)
            .freeze();
        assert_eq!(in_place_filter(ResourceKind::Css, &options), Some(FilterId::RewriteCss));
    }

    #[test]
    fn test_recording_slots_are_bounded() {
        let active = Arc::new(AtomicUsize::new(0));
        let a = RecordingSlot::try_acquire(&active, 2).unwrap();
        let _b = RecordingSlot::try_acquire(&active, 2).unwrap();
        assert!(RecordingSlot::try_acquire(&active, 2).is_none());
        drop(a);
        assert!(RecordingSlot::try_acquire(&active, 2).is_some());
    }
}
