//! Per-page processing stage: the glue between cache, extractor, and
//! recognition client.
//!
//! [`PageStage::process`] owns the at-most-once guarantee: for a given
//! fingerprint the remote service is called at most once across the life
//! of the cache, enforced by the cache lookup plus a per-fingerprint
//! single-flight guard for calls racing inside one run. The guard
//! serialises only same-fingerprint work; distinct pages never wait on
//! each other here, and the cache itself is never locked across a network
//! call.
//!
//! Outcomes:
//! * cache hit — return the stored record untouched;
//! * text-layer page — skip recognition entirely, zero tokens;
//! * recognition success — clean, classify, store a `Cached` record;
//! * retries exhausted / permanent page failure — store a `Failed` record
//!   so resumed runs know the page was attempted;
//! * auth/quota failure — store a `Failed` record, then propagate as
//!   job-fatal; a `Failed` record reads as a cache miss, so a later run
//!   with fixed credentials reprocesses the page.

use crate::cache::{CacheStore, PageFingerprint, PageRecord, PageStatus};
use crate::error::{PageError, RecognitionError, StorageError};
use crate::pipeline::classify::classify_and_format;
use crate::pipeline::clean::clean_page_text;
use crate::pipeline::extract::{ContentExtractor, RawPageContent};
use crate::pipeline::recognize::{PagePayload, RecognitionClient, RecognitionFailure};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Failure that escapes the stage instead of becoming a `Failed` record.
#[derive(Debug, Error)]
pub enum StageError {
    /// Cache I/O broke beyond its local retries; resume correctness can no
    /// longer be guaranteed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Auth/quota failure: every later page would hit the same wall.
    #[error("job-fatal recognition failure on page {page}: {error}")]
    JobFatal {
        page: usize,
        error: RecognitionError,
    },
}

/// Result of processing one page.
#[derive(Debug)]
pub struct StageOutcome {
    pub record: PageRecord,
    /// Whether the record came from the cache rather than fresh work.
    pub cache_hit: bool,
}

/// Processes single pages end to end behind the cache.
pub struct PageStage {
    cache: CacheStore,
    client: RecognitionClient,
    extractor: Arc<dyn ContentExtractor>,
    /// Per-fingerprint guards for the single-flight discipline. Entries
    /// accumulate for the run's duration, bounded by the page count.
    inflight: Mutex<HashMap<PageFingerprint, Arc<Mutex<()>>>>,
}

impl PageStage {
    pub fn new(
        cache: CacheStore,
        client: RecognitionClient,
        extractor: Arc<dyn ContentExtractor>,
    ) -> Self {
        Self {
            cache,
            client,
            extractor,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Process one page: extract, consult the cache, recognise if needed,
    /// clean, classify, and durably store the result.
    pub async fn process(&self, page_index: usize) -> Result<StageOutcome, StageError> {
        let content = match self.extractor.extract(page_index).await {
            Ok(content) => content,
            Err(e) => {
                // No content means no content-derived fingerprint; a
                // positional sentinel stands in so the failure is durable.
                // A later run that extracts successfully produces a real
                // fingerprint, misses, and reprocesses the page.
                warn!("page {page_index}: {e}");
                let fingerprint = PageFingerprint::compute(page_index, &[]);
                let record = PageRecord::failed(
                    fingerprint,
                    PageError::Extraction {
                        page: page_index,
                        detail: e.detail,
                    },
                );
                self.cache.put(&record).await?;
                return Ok(StageOutcome {
                    record,
                    cache_hit: false,
                });
            }
        };

        let fingerprint = content.fingerprint();

        // Single flight: racing calls for the same fingerprint queue here;
        // the first does the work, the rest find its record in the cache.
        let guard = {
            let mut inflight = self.inflight.lock().await;
            Arc::clone(inflight.entry(fingerprint.clone()).or_default())
        };
        let _in_flight = guard.lock().await;

        if let Some(record) = self.cache.get(&fingerprint).await? {
            if record.status == PageStatus::Cached {
                debug!("page {page_index}: cache hit");
                return Ok(StageOutcome {
                    record,
                    cache_hit: true,
                });
            }
            // A Failed record is an attempt marker, not a result; fall
            // through and try again, replacing it on completion.
            debug!("page {page_index}: retrying previously failed page");
        }

        let record = self.process_fresh(&content, fingerprint).await?;
        let cached = record.status == PageStatus::Cached;
        self.cache.put(&record).await?;
        debug!(
            "page {page_index}: processed fresh ({})",
            if cached { "ok" } else { "failed" }
        );
        Ok(StageOutcome {
            record,
            cache_hit: false,
        })
    }

    /// Produce a record for a page with no usable cache entry.
    async fn process_fresh(
        &self,
        content: &RawPageContent,
        fingerprint: PageFingerprint,
    ) -> Result<PageRecord, StageError> {
        let page_index = content.page_index;

        let (raw_text, input_tokens, output_tokens, via_recognition) = if content.has_text_layer()
        {
            // The document already carries this page's text; the cheaper
            // extraction path wins and the remote call is skipped.
            let text = content.text_layer.clone().unwrap_or_default();
            (text, 0, 0, false)
        } else {
            let payload = PagePayload::from_content(content);
            match self.client.recognize(&payload).await {
                Ok(recognition) => (
                    recognition.text,
                    recognition.input_tokens,
                    recognition.output_tokens,
                    true,
                ),
                Err(failure) if failure.is_job_fatal() => {
                    let error = match failure {
                        RecognitionFailure::Permanent(e) => e,
                        RecognitionFailure::Exhausted { last, .. } => last,
                    };
                    let record = PageRecord::failed(
                        fingerprint,
                        PageError::Permanent {
                            page: page_index,
                            detail: error.to_string(),
                        },
                    );
                    self.cache.put(&record).await?;
                    return Err(StageError::JobFatal {
                        page: page_index,
                        error,
                    });
                }
                Err(RecognitionFailure::Exhausted { attempts, last }) => {
                    return Ok(PageRecord::failed(
                        fingerprint,
                        PageError::RetriesExhausted {
                            page: page_index,
                            attempts,
                            detail: last.to_string(),
                        },
                    ));
                }
                Err(RecognitionFailure::Permanent(e)) => {
                    return Ok(PageRecord::failed(
                        fingerprint,
                        PageError::Permanent {
                            page: page_index,
                            detail: e.to_string(),
                        },
                    ));
                }
            }
        };

        let text = clean_page_text(&raw_text);
        let formatted = classify_and_format(page_index, &text);

        Ok(PageRecord::cached(
            fingerprint,
            text,
            formatted.xhtml,
            formatted.page_type,
            input_tokens,
            output_tokens,
            via_recognition,
        ))
    }
}
