//! Job controller: the ordered heart of a conversion run.
//!
//! Pages execute out of order across a bounded worker pool
//! (`buffer_unordered`), but completion is *committed* strictly in page
//! order through a single cursor. A page is committed only when every page
//! before it has been committed, so the persisted cursor always means
//! "every page below me has a durable cache record" — the invariant resume
//! depends on.
//!
//! ## Shutdown paths
//!
//! * cooperative cancel — the [`CancelFlag`] stops new dispatch; in-flight
//!   pages finish (bounded by the per-call timeout), a checkpoint is saved
//!   with status `Interrupted`, and the run returns normally;
//! * job-fatal error — auth/quota failures and broken storage halt the run
//!   immediately; a checkpoint with status `Failed` is saved and the error
//!   propagates;
//! * fail-fast — with `abort_on_page_failure`, the first `Failed` page
//!   halts the run the same way, with the cursor at the last page that
//!   actually succeeded.

use crate::cache::PageStatus;
use crate::checkpoint::{CheckpointManager, JobState, JobStatus};
use crate::config::JobConfig;
use crate::error::{ConvertError, PageError, RecognitionError};
use crate::output::JobOutput;
use crate::pipeline::stage::{PageStage, StageError, StageOutcome};
use crate::progress::{NoopProgress, ProgressHandle};
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Shared cancellation signal.
///
/// Setting it stops the controller from dispatching further pages;
/// in-flight pages run to completion so their cache writes land. Cheap to
/// clone and safe to trigger from signal handlers or other tasks.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    inner: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cooperative shutdown. Idempotent.
    pub fn cancel(&self) {
        self.inner.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }
}

/// Drives one job from its current cursor to a terminal state.
pub struct JobController {
    stage: Arc<PageStage>,
    checkpoints: CheckpointManager,
    state: JobState,
    concurrency: usize,
    checkpoint_interval: usize,
    abort_on_page_failure: bool,
    progress: ProgressHandle,
    cancel: CancelFlag,
}

impl JobController {
    pub fn new(
        stage: Arc<PageStage>,
        checkpoints: CheckpointManager,
        state: JobState,
        config: &JobConfig,
        cancel: CancelFlag,
    ) -> Self {
        let progress = config
            .progress_callback
            .clone()
            .unwrap_or_else(|| Arc::new(NoopProgress));
        Self {
            stage,
            checkpoints,
            state,
            concurrency: config.concurrency,
            checkpoint_interval: config.checkpoint_interval,
            abort_on_page_failure: config.abort_on_page_failure,
            progress,
            cancel,
        }
    }

    /// Run until completion, interruption, or a fatal error.
    pub async fn run(mut self) -> Result<JobOutput, ConvertError> {
        let started = Instant::now();
        let start_cursor = self.state.cursor;
        let page_count = self.state.page_count;

        self.state.status = JobStatus::Processing;
        self.progress
            .on_job_start(&self.state.job_id, page_count, start_cursor);
        info!(
            "job {} starting: {} pages, cursor at {}",
            self.state.job_id, page_count, start_cursor
        );

        let mut failures: Vec<PageError> = Vec::new();
        let mut pending: BTreeMap<usize, StageOutcome> = BTreeMap::new();
        let mut since_checkpoint = 0usize;

        {
            let cancel = self.cancel.clone();
            let stage = Arc::clone(&self.stage);
            let progress = Arc::clone(&self.progress);
            let mut results = Box::pin(
                stream::iter(start_cursor..page_count)
                .take_while(move |_| {
                    let keep_going = !cancel.is_cancelled();
                    async move { keep_going }
                })
                .map(move |page_index| {
                    let stage = Arc::clone(&stage);
                    let progress = Arc::clone(&progress);
                    async move {
                        progress.on_page_start(page_index);
                        (page_index, stage.process(page_index).await)
                    }
                })
                    .buffer_unordered(self.concurrency.max(1)),
            );

            while let Some((page_index, result)) = results.next().await {
                let outcome = match result {
                    Ok(outcome) => outcome,
                    Err(StageError::Storage(e)) => {
                        drop(results);
                        return Err(self.halt(ConvertError::Storage(e)).await);
                    }
                    Err(StageError::JobFatal { page, error }) => {
                        drop(results);
                        return Err(self.halt(job_fatal_error(page, error)).await);
                    }
                };

                let failed = outcome.record.status == PageStatus::Failed;
                if outcome.cache_hit {
                    self.progress.on_page_cached(page_index);
                } else if failed {
                    if let Some(error) = &outcome.record.error {
                        self.progress.on_page_error(page_index, error);
                    }
                } else {
                    self.progress.on_page_complete(page_index, &outcome.record);
                }

                pending.insert(page_index, outcome);

                if failed && self.abort_on_page_failure {
                    // Fail fast: commit what is already in order below the
                    // failure, never the failure itself, then halt with the
                    // cursor at the last page that succeeded.
                    let halted_at = page_index;
                    while self.state.cursor < halted_at
                        && self
                            .commit_next(&mut pending, &mut failures, &mut since_checkpoint)
                            .await?
                            .is_some()
                    {}
                    let error = pending
                        .remove(&halted_at)
                        .and_then(|o| o.record.error)
                        .unwrap_or(PageError::Extraction {
                            page: halted_at,
                            detail: "page failed".into(),
                        });
                    drop(results);
                    return Err(self
                        .halt(ConvertError::PageFailed {
                            page: halted_at,
                            source: error,
                        })
                        .await);
                }

                while self
                    .commit_next(&mut pending, &mut failures, &mut since_checkpoint)
                    .await?
                    .is_some()
                {}
            }
        }

        let interrupted = self.cancel.is_cancelled() && self.state.cursor < page_count;
        self.state.status = if interrupted {
            JobStatus::Interrupted
        } else {
            JobStatus::Completed
        };
        self.checkpoints.save(&self.state).await?;
        self.progress.on_checkpoint(self.state.cursor);
        self.progress.on_job_complete(
            &self.state.job_id,
            self.state.usage.pages_done,
            self.state.usage.failed_pages,
        );
        info!(
            "job {} {}: {}/{} pages, {} cache hits, {} remote calls, {} failed",
            self.state.job_id,
            if interrupted { "interrupted" } else { "completed" },
            self.state.usage.pages_done,
            page_count,
            self.state.usage.cache_hits,
            self.state.usage.remote_calls,
            self.state.usage.failed_pages,
        );

        Ok(JobOutput {
            job_id: self.state.job_id.clone(),
            status: self.state.status,
            page_count,
            usage: self.state.usage,
            failures,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Commit the outcome sitting at the cursor, if it has arrived.
    /// Returns the committed page index, or `None` when the next page in
    /// order is still in flight.
    async fn commit_next(
        &mut self,
        pending: &mut BTreeMap<usize, StageOutcome>,
        failures: &mut Vec<PageError>,
        since_checkpoint: &mut usize,
    ) -> Result<Option<usize>, ConvertError> {
        let Some(outcome) = pending.remove(&self.state.cursor) else {
            return Ok(None);
        };
        let page_index = self.state.cursor;
        let record = &outcome.record;

        if outcome.cache_hit {
            self.state.usage.cache_hits += 1;
        } else if record.via_recognition {
            self.state.usage.remote_calls += 1;
            self.state.usage.input_tokens += record.input_tokens as u64;
            self.state.usage.output_tokens += record.output_tokens as u64;
        }
        if record.status == PageStatus::Failed {
            self.state.usage.failed_pages += 1;
            if let Some(error) = &record.error {
                failures.push(error.clone());
            }
        }

        self.state.cursor += 1;
        self.state.usage.pages_done = self.state.cursor;

        *since_checkpoint += 1;
        if *since_checkpoint >= self.checkpoint_interval {
            self.checkpoints.save(&self.state).await?;
            self.progress.on_checkpoint(self.state.cursor);
            *since_checkpoint = 0;
        }

        Ok(Some(page_index))
    }

    /// Checkpoint a fatal halt, then hand the error back for propagation.
    async fn halt(&mut self, err: ConvertError) -> ConvertError {
        self.state.status = JobStatus::Failed;
        if let Err(e) = self.checkpoints.save(&self.state).await {
            warn!("could not checkpoint after fatal error: {e}");
        }
        warn!(
            "job {} halted at cursor {}: {err}",
            self.state.job_id, self.state.cursor
        );
        err
    }
}

/// Map a job-fatal recognition failure onto the top-level error.
fn job_fatal_error(page: usize, error: RecognitionError) -> ConvertError {
    match error {
        RecognitionError::AuthFailed { detail } => ConvertError::AuthFailed { page, detail },
        RecognitionError::QuotaExhausted { detail } => ConvertError::QuotaExhausted { page, detail },
        other => ConvertError::Internal(format!(
            "non-fatal recognition error treated as fatal on page {page}: {other}"
        )),
    }
}
