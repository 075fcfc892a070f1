//! # pdf2epub
//!
//! Resumable conversion of multi-page documents into e-book XHTML using a
//! remote vision-recognition service.
//!
//! ## Why this crate?
//!
//! Recognition-backed conversion of a long document is slow, metered, and
//! interruptible: a 400-page book means 400 remote calls, any of which can
//! time out, and the process can be killed at any point. This crate treats
//! the conversion as a resumable job — every recognised page lands in a
//! durable content-addressed cache, progress is checkpointed as it commits,
//! and a re-run after a crash, cancellation, or quota failure continues from
//! where the previous run verifiably got to, never paying for the same page
//! twice.
//!
//! ## Pipeline Overview
//!
//! ```text
//! page files (page-NNNN.png / .txt)
//!  │
//!  ├─ 1. Extract     read one page's image bytes + embedded text layer
//!  ├─ 2. Cache       fingerprint lookup; hit = done, no remote call
//!  ├─ 3. Recognize   remote vision-OCR with retry/backoff/timeout
//!  │                 (skipped entirely for pages with a text layer)
//!  ├─ 4. Clean       deterministic text cleanup rules
//!  ├─ 5. Classify    page type (cover/toc/table/footnote/body) + XHTML
//!  └─ 6. Commit      cache write, in-order cursor advance, checkpoint
//! ```
//!
//! Pages execute concurrently but commit strictly in order, so the
//! persisted cursor always means "everything below me is durably done".
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pdf2epub::{convert_to_file, CancelFlag, JobConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = JobConfig::builder()
//!         .endpoint("https://dashscope.example.com/v1")
//!         .api_key(std::env::var("PDF2EPUB_API_KEY")?)
//!         .build()?;
//!     let output = convert_to_file("./book-pages", "book.xhtml", &config, CancelFlag::new()).await?;
//!     eprintln!(
//!         "{} pages, {} cache hits, {} remote calls",
//!         output.usage.pages_done, output.usage.cache_hits, output.usage.remote_calls
//!     );
//!     Ok(())
//! }
//! ```
//!
//! Running the same command again is always safe: completed pages are cache
//! hits, failed pages get one more attempt, and the job picks up at the
//! validated cursor.
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdf2epub` binary (clap + indicatif + anyhow + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! pdf2epub = { version = "0.3", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod convert;
pub mod error;
pub mod job;
pub mod output;
pub mod pipeline;
pub mod progress;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use cache::{CacheStore, PageFingerprint, PageRecord, PageStatus};
pub use checkpoint::{CheckpointManager, JobState, JobStatus, UsageTotals};
pub use config::{JobConfig, JobConfigBuilder};
pub use convert::{assemble_to_file, convert_to_file, reset_job, run_job};
pub use error::{ConvertError, PageError, RecognitionError, StorageError};
pub use job::{CancelFlag, JobController};
pub use output::JobOutput;
pub use pipeline::classify::PageType;
pub use pipeline::extract::{ContentExtractor, DirectoryExtractor, RawPageContent};
pub use pipeline::recognize::{
    HttpVisionProvider, PagePayload, Recognition, RecognitionProvider,
};
pub use progress::{JobProgressCallback, NoopProgress, ProgressHandle};
