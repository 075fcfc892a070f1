//! Error types for the pdf2epub library.
//!
//! Three distinct error types reflect three distinct failure modes:
//!
//! * [`ConvertError`] — **Fatal**: the job cannot proceed at all (missing
//!   input, no provider configured, storage broken beyond local retries,
//!   auth/quota failure from the recognition service). Returned as
//!   `Err(ConvertError)` from the top-level `run_job*` functions.
//!
//! * [`PageError`] — **Non-fatal**: a single page failed (extraction glitch,
//!   recognition retries exhausted) but other pages are fine. Persisted
//!   inside the page's cache record so resumed runs and callers can inspect
//!   partial success rather than losing the whole book to one bad page.
//!
//! * [`RecognitionError`] — the classified outcome of one remote call.
//!   Classification happens at the provider boundary: the retry loop in
//!   [`crate::pipeline::recognize`] only ever asks
//!   [`RecognitionError::is_retryable`], never inspects provider-specific
//!   details.
//!
//! The separation lets callers decide their own tolerance: abort on the
//! first page failure, log and continue, or collect all errors for a
//! post-run report.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the pdf2epub library.
///
/// Page-level failures use [`PageError`] and are stored in the page cache
/// rather than propagated here.
#[derive(Debug, Error)]
pub enum ConvertError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input directory was not found at the given path.
    #[error("input directory not found: '{path}'\nCheck the path exists and is readable.")]
    InputNotFound { path: PathBuf },

    /// Process does not have read permission on the input.
    #[error("permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input directory contains no recognisable page files.
    #[error("no page files found in '{path}'\nExpected page-NNNN.png / page-NNNN.txt pairs.")]
    NoPages { path: PathBuf },

    // ── Storage errors ────────────────────────────────────────────────────
    /// Cache or checkpoint I/O failed even after bounded local retries.
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    // ── Recognition errors (job-fatal class) ──────────────────────────────
    /// No recognition provider was configured and none could be built.
    #[error("recognition provider not configured.\n{hint}")]
    ProviderNotConfigured { hint: String },

    /// The recognition service rejected our credentials. Retrying or
    /// continuing to later pages cannot succeed.
    #[error("recognition service authentication failed (page {page}): {detail}\nCheck the API key, then re-run the same command to resume.")]
    AuthFailed { page: usize, detail: String },

    /// The recognition service reported an exhausted quota. Job-fatal for
    /// the same reason as auth failure.
    #[error("recognition quota exhausted (page {page}): {detail}\nTop up the quota, then re-run the same command to resume.")]
    QuotaExhausted { page: usize, detail: String },

    /// A page failed and `abort_on_page_failure` is set.
    #[error("page {page} failed: {source}")]
    PageFailed {
        page: usize,
        #[source]
        source: PageError,
    },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the assembled output file.
    #[error("failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Cache / checkpoint persistence failure.
///
/// Callers treat reads as retryable and writes as fatal once the store's
/// bounded local retries are exhausted; by the time a `StorageError`
/// escapes [`crate::cache::CacheStore`] those retries have already happened.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem operation failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A record could not be serialised. Should never happen with
    /// well-formed records; surfaced rather than panicking.
    #[error("serialisation failed: {0}")]
    Serialize(String),
}

/// Classified outcome of a single remote recognition call.
///
/// Produced at the provider boundary. The retry loop decides what to do
/// based solely on [`is_retryable`](Self::is_retryable) and
/// [`is_job_fatal`](Self::is_job_fatal).
#[derive(Debug, Clone, Error)]
pub enum RecognitionError {
    /// The call exceeded the configured hard timeout.
    #[error("recognition call timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// Connection-level failure (reset, refused, DNS).
    #[error("connection error: {detail}")]
    Connection { detail: String },

    /// HTTP 429-equivalent. `retry_after_secs` carries a server-specified
    /// delay when present; exponential backoff applies otherwise.
    #[error("rate limited by recognition service")]
    RateLimited { retry_after_secs: Option<u64> },

    /// Transient server-side failure (HTTP 5xx).
    #[error("recognition service error: HTTP {status}")]
    ServerError { status: u16 },

    /// Authentication/authorisation failure (HTTP 401/403). Never retried.
    #[error("authentication failed: {detail}")]
    AuthFailed { detail: String },

    /// Quota exhausted. Never retried, job-fatal.
    #[error("quota exhausted: {detail}")]
    QuotaExhausted { detail: String },

    /// The request itself was malformed (HTTP 400-class other than auth).
    /// Never retried; an identical bad request cannot succeed later.
    #[error("malformed request: {detail}")]
    MalformedRequest { detail: String },

    /// Anything the boundary could not classify. Escalated to permanent so
    /// an unexpected failure mode can never cause an infinite retry loop.
    #[error("unclassified recognition failure: {detail}")]
    Unknown { detail: String },
}

impl RecognitionError {
    /// Whether the retry loop should back off and try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RecognitionError::Timeout { .. }
                | RecognitionError::Connection { .. }
                | RecognitionError::RateLimited { .. }
                | RecognitionError::ServerError { .. }
        )
    }

    /// Whether this failure makes the whole job pointless (auth/quota):
    /// later pages would hit the same wall, so the controller halts and
    /// checkpoints instead of burning through the page list.
    pub fn is_job_fatal(&self) -> bool {
        matches!(
            self,
            RecognitionError::AuthFailed { .. } | RecognitionError::QuotaExhausted { .. }
        )
    }
}

/// A non-fatal error for a single page.
///
/// Stored inside the page's cache record when a page ends up `Failed`.
/// The overall job continues unless `abort_on_page_failure` is set or the
/// underlying cause is job-fatal (see [`RecognitionError::is_job_fatal`]).
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum PageError {
    /// The content extractor could not supply this page. Treated as
    /// permanent for the page.
    #[error("page {page}: extraction failed: {detail}")]
    Extraction { page: usize, detail: String },

    /// Every recognition attempt failed with a retryable error.
    #[error("page {page}: recognition failed after {attempts} attempts: {detail}")]
    RetriesExhausted {
        page: usize,
        attempts: u32,
        detail: String,
    },

    /// Recognition failed with a permanent error on the first attempt.
    #[error("page {page}: permanent recognition failure: {detail}")]
    Permanent { page: usize, detail: String },
}

impl PageError {
    /// The page index this error belongs to.
    pub fn page(&self) -> usize {
        match self {
            PageError::Extraction { page, .. }
            | PageError::RetriesExhausted { page, .. }
            | PageError::Permanent { page, .. } => *page,
        }
    }
}
