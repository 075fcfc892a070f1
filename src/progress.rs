//! Progress reporting for conversion jobs.
//!
//! The library never prints. Callers who want progress output implement
//! [`JobProgressCallback`] and hand it to the config; the CLI binary wires
//! in an indicatif-backed implementation, tests use recording fakes, and
//! embedders can forward events to whatever UI they have.
//!
//! Callbacks fire from worker tasks, hence `Send + Sync`. Implementations
//! should return quickly; slow callbacks stall the worker that fired them.

use crate::cache::PageRecord;
use crate::error::PageError;
use std::sync::Arc;

/// Receiver for per-page and per-job progress events.
pub trait JobProgressCallback: Send + Sync {
    /// The job is starting; `page_count` pages remain after resume
    /// validation.
    fn on_job_start(&self, job_id: &str, page_count: usize, resumed_from: usize) {
        let _ = (job_id, page_count, resumed_from);
    }

    /// A worker picked up a page.
    fn on_page_start(&self, page_index: usize) {
        let _ = page_index;
    }

    /// A page was satisfied from the cache.
    fn on_page_cached(&self, page_index: usize) {
        let _ = page_index;
    }

    /// A page finished processing (fresh work, not a cache hit).
    fn on_page_complete(&self, page_index: usize, record: &PageRecord) {
        let _ = (page_index, record);
    }

    /// A page failed permanently for this run.
    fn on_page_error(&self, page_index: usize, error: &PageError) {
        let _ = (page_index, error);
    }

    /// A checkpoint was durably saved with the cursor at `cursor`.
    fn on_checkpoint(&self, cursor: usize) {
        let _ = cursor;
    }

    /// The job reached a terminal state.
    fn on_job_complete(&self, job_id: &str, pages_done: usize, failed_pages: usize) {
        let _ = (job_id, pages_done, failed_pages);
    }
}

/// Callback that ignores every event; the default when none is configured.
pub struct NoopProgress;

impl JobProgressCallback for NoopProgress {}

/// Shared handle to a progress callback.
pub type ProgressHandle = Arc<dyn JobProgressCallback>;
