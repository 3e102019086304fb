//! Diagnostic comments at flush boundaries

use crate::filter::{FilterContext, HtmlFilter};
use crate::options::FilterId;

#[derive(Debug, Default)]
pub struct DebugFilter {
    flushes: usize,
}

impl DebugFilter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HtmlFilter for DebugFilter {
    fn id(&self) -> FilterId {
        FilterId::Debug
    }

    fn token(&mut self, _ctx: &mut FilterContext<'_>, _index: usize) {}

    fn flush(&mut self, ctx: &mut FilterContext<'_>) {
        self.flushes += 1;
        let summary = ctx.summary();
        ctx.inject_comment(&format!(
            "Flush {}: {} rewrites initiated, {} pending, {} rendered, {} abandoned",
            self.flushes, summary.initiated, summary.pending, summary.rendered, summary.abandoned
        ));
    }

    fn end_document(&mut self, ctx: &mut FilterContext<'_>) {
        let summary = ctx.summary();
        ctx.inject_comment(&format!(
            "Summary: {} rewrites initiated, {} awaiting the final deadline",
            summary.initiated, summary.pending
        ));
    }

    fn clear(&mut self) {
        self.flushes = 0;
    }
}
