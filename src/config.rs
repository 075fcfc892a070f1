//! Configuration for a conversion job.
//!
//! All job behaviour is controlled through [`JobConfig`], built via its
//! [`JobConfigBuilder`]. Keeping every knob in one struct makes it trivial
//! to share configs across tasks, log them, and diff two runs to
//! understand why their outputs differ. There is deliberately no
//! process-wide configuration state: the controller receives its config at
//! construction and nothing else reads the environment at run time.
//!
//! # Design choice: builder over constructor
//! A twenty-field constructor is unreadable and breaks on every new field.
//! The builder lets callers set only what they care about and rely on
//! well-documented defaults for the rest.

use crate::error::ConvertError;
use crate::pipeline::recognize::RecognitionProvider;
use crate::progress::JobProgressCallback;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Configuration for a document-to-ebook conversion job.
///
/// Built via [`JobConfig::builder()`] or [`JobConfig::default()`].
///
/// # Example
/// ```rust
/// use pdf2epub::JobConfig;
///
/// let config = JobConfig::builder()
///     .concurrency(4)
///     .checkpoint_interval(5)
///     .max_retries(3)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct JobConfig {
    /// Directory holding the page cache and checkpoints. Default: `./.pdf2epub-cache`.
    ///
    /// One subdirectory per job id; safe to point several jobs at the same
    /// root. The cache is the source of truth for completed pages — delete
    /// it only when you want a full re-run.
    pub cache_dir: PathBuf,

    /// Number of pages processed concurrently by the worker pool. Default: 4.
    ///
    /// Recognition is network-bound; a handful of in-flight pages hides the
    /// round-trip latency. The cursor still commits strictly in order, so
    /// raising this never changes the on-disk resume semantics.
    pub concurrency: usize,

    /// Global cap on simultaneous remote recognition calls. Default: 2.
    ///
    /// Independent of `concurrency`: a wide worker pool with a narrow
    /// remote cap lets cache hits and text-layer pages race ahead while the
    /// recognition service sees a steady, polite request rate.
    pub remote_concurrency: usize,

    /// Total recognition attempts per page, first try included. Default: 3.
    ///
    /// Only retryable failures (timeout, connection reset, 429, 5xx) lead
    /// to another attempt. Permanent failures (auth, quota, malformed
    /// request) abort the page on the first attempt.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds (exponential backoff). Default: 500.
    ///
    /// Doubles after each attempt: 500 ms → 1 s → 2 s. Exponential backoff
    /// avoids the thundering-herd problem where N workers retry
    /// simultaneously and immediately re-overwhelm a recovering endpoint.
    pub backoff_base_ms: u64,

    /// Upper bound on a single backoff delay in milliseconds. Default: 8000.
    pub backoff_cap_ms: u64,

    /// Hard per-call timeout for recognition requests in seconds. Default: 60.
    ///
    /// Exceeding it counts as a retryable failure, never as a hang: a
    /// worker is always bounded by this when asked to finish its in-flight
    /// page during shutdown.
    pub api_timeout_secs: u64,

    /// Bounded local retries for cache/checkpoint I/O. Default: 3.
    pub storage_retries: u32,

    /// Save a checkpoint every this many completed pages. Default: 10.
    ///
    /// Checkpoints are also written unconditionally on interruption, on
    /// fatal errors, and at completion, so this only tunes how much work a
    /// hard crash can lose.
    pub checkpoint_interval: usize,

    /// Number of recent checkpoints retained per job. Default: 3.
    pub max_checkpoints: usize,

    /// Abort the job on the first failed page instead of recording the
    /// failure and continuing. Default: false.
    pub abort_on_page_failure: bool,

    /// Process at most this many pages (debugging aid). Default: None.
    pub max_pages: Option<usize>,

    /// Pre-constructed recognition provider. Takes precedence over
    /// `endpoint`/`api_key`/`model`.
    pub provider: Option<Arc<dyn RecognitionProvider>>,

    /// Base URL of an OpenAI-compatible vision endpoint, used to build the
    /// bundled HTTP provider when `provider` is not set.
    pub endpoint: Option<String>,

    /// API key for the bundled HTTP provider.
    pub api_key: Option<String>,

    /// Model identifier for the bundled HTTP provider. Default: "qwen-vl-ocr".
    pub model: String,

    /// Optional progress callback receiving per-page events.
    pub progress_callback: Option<Arc<dyn JobProgressCallback>>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./.pdf2epub-cache"),
            concurrency: 4,
            remote_concurrency: 2,
            max_retries: 3,
            backoff_base_ms: 500,
            backoff_cap_ms: 8000,
            api_timeout_secs: 60,
            storage_retries: 3,
            checkpoint_interval: 10,
            max_checkpoints: 3,
            abort_on_page_failure: false,
            max_pages: None,
            provider: None,
            endpoint: None,
            api_key: None,
            model: "qwen-vl-ocr".to_string(),
            progress_callback: None,
        }
    }
}

impl fmt::Debug for JobConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobConfig")
            .field("cache_dir", &self.cache_dir)
            .field("concurrency", &self.concurrency)
            .field("remote_concurrency", &self.remote_concurrency)
            .field("max_retries", &self.max_retries)
            .field("backoff_base_ms", &self.backoff_base_ms)
            .field("backoff_cap_ms", &self.backoff_cap_ms)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("storage_retries", &self.storage_retries)
            .field("checkpoint_interval", &self.checkpoint_interval)
            .field("max_checkpoints", &self.max_checkpoints)
            .field("abort_on_page_failure", &self.abort_on_page_failure)
            .field("max_pages", &self.max_pages)
            .field(
                "provider",
                &self.provider.as_ref().map(|_| "<dyn RecognitionProvider>"),
            )
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .finish()
    }
}

impl JobConfig {
    /// Create a new builder for `JobConfig`.
    pub fn builder() -> JobConfigBuilder {
        JobConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`JobConfig`].
pub struct JobConfigBuilder {
    config: JobConfig,
}

impl JobConfigBuilder {
    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.cache_dir = dir.into();
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn remote_concurrency(mut self, n: usize) -> Self {
        self.config.remote_concurrency = n.max(1);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn backoff_base_ms(mut self, ms: u64) -> Self {
        self.config.backoff_base_ms = ms;
        self
    }

    pub fn backoff_cap_ms(mut self, ms: u64) -> Self {
        self.config.backoff_cap_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs.max(1);
        self
    }

    pub fn storage_retries(mut self, n: u32) -> Self {
        self.config.storage_retries = n;
        self
    }

    pub fn checkpoint_interval(mut self, pages: usize) -> Self {
        self.config.checkpoint_interval = pages.max(1);
        self
    }

    pub fn max_checkpoints(mut self, n: usize) -> Self {
        self.config.max_checkpoints = n.max(1);
        self
    }

    pub fn abort_on_page_failure(mut self, v: bool) -> Self {
        self.config.abort_on_page_failure = v;
        self
    }

    pub fn max_pages(mut self, n: usize) -> Self {
        self.config.max_pages = Some(n);
        self
    }

    pub fn provider(mut self, provider: Arc<dyn RecognitionProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn endpoint(mut self, url: impl Into<String>) -> Self {
        self.config.endpoint = Some(url.into());
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn progress_callback(mut self, cb: Arc<dyn JobProgressCallback>) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<JobConfig, ConvertError> {
        let c = &self.config;
        if c.concurrency == 0 {
            return Err(ConvertError::InvalidConfig("concurrency must be ≥ 1".into()));
        }
        if c.backoff_cap_ms < c.backoff_base_ms {
            return Err(ConvertError::InvalidConfig(format!(
                "backoff cap ({}ms) must be ≥ backoff base ({}ms)",
                c.backoff_cap_ms, c.backoff_base_ms
            )));
        }
        if c.max_checkpoints == 0 {
            return Err(ConvertError::InvalidConfig(
                "at least one checkpoint must be retained".into(),
            ));
        }
        Ok(self.config)
    }
}
