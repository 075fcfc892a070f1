//! Top-level conversion API.
//!
//! [`run_job`] is the main entry point: open the input, resume from the
//! latest validated checkpoint if one exists, process every remaining page
//! through the worker pool, and leave behind a durable cache plus a final
//! checkpoint. [`assemble_to_file`] turns a completed cache into a single
//! XHTML document; [`convert_to_file`] chains the two. [`reset_job`]
//! discards all persisted state for an input, forcing the next run to start
//! from scratch.
//!
//! Resume is automatic and safe to invoke blindly: a first run simply finds
//! no checkpoint. Checkpoints are hints — before trusting one, the cursor
//! is validated against the page cache and rolled back over any page whose
//! record is missing or failed, so a stale checkpoint can cause cheap cache
//! hits but never skipped or double-recognised pages.

use crate::cache::{CacheStore, PageStatus};
use crate::checkpoint::{CheckpointManager, JobState, JobStatus};
use crate::config::JobConfig;
use crate::error::ConvertError;
use crate::job::{CancelFlag, JobController};
use crate::output::JobOutput;
use crate::pipeline::extract::{ContentExtractor, DirectoryExtractor};
use crate::pipeline::recognize::{HttpVisionProvider, RecognitionClient, RecognitionProvider};
use crate::pipeline::stage::PageStage;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Run (or resume) a conversion job over a directory of page files.
///
/// Returns when the job completes, is cancelled through `cancel`, or hits
/// a job-fatal error. All three paths leave a durable checkpoint behind;
/// calling `run_job` again continues from it.
pub async fn run_job(
    input_dir: impl AsRef<Path>,
    config: &JobConfig,
    cancel: CancelFlag,
) -> Result<JobOutput, ConvertError> {
    let input_dir = input_dir.as_ref();
    let extractor: Arc<dyn ContentExtractor> = Arc::new(DirectoryExtractor::open(input_dir)?);

    let mut page_count = extractor.page_count();
    if let Some(max) = config.max_pages {
        page_count = page_count.min(max);
    }

    let (job_id, job_dir, source) = job_paths(input_dir, config);
    let cache = CacheStore::open(&job_dir, config.storage_retries).await?;
    let mut checkpoints = CheckpointManager::open(&job_dir, config.max_checkpoints).await?;

    let state = match checkpoints.load_latest().await? {
        Some(mut state) => {
            // Page count can shrink between runs (max_pages, re-exported
            // input); the cursor must never point past the end.
            state.page_count = page_count;
            state.cursor = state.cursor.min(page_count);

            let fingerprints = fingerprints_below(extractor.as_ref(), state.cursor).await;
            checkpoints
                .validate(&mut state, &cache, &fingerprints)
                .await?;
            info!(
                "resuming job {} at page {}/{}",
                state.job_id, state.cursor, page_count
            );
            state
        }
        None => JobState::new(job_id, source, page_count),
    };

    let provider = resolve_provider(config)?;
    let client = RecognitionClient::new(
        provider,
        config.remote_concurrency,
        config.max_retries,
        Duration::from_millis(config.backoff_base_ms),
        Duration::from_millis(config.backoff_cap_ms),
        Duration::from_secs(config.api_timeout_secs),
    );
    let stage = Arc::new(PageStage::new(cache, client, extractor));

    JobController::new(stage, checkpoints, state, config, cancel)
        .run()
        .await
}

/// Assemble the cached results for an input into one XHTML document.
///
/// Only `Cached` pages contribute content; failed or missing pages leave a
/// marker comment so their absence is visible in the output. Returns the
/// number of pages with content. The write is atomic: a partially
/// assembled file never replaces an existing output.
pub async fn assemble_to_file(
    input_dir: impl AsRef<Path>,
    config: &JobConfig,
    output_path: impl AsRef<Path>,
) -> Result<usize, ConvertError> {
    let input_dir = input_dir.as_ref();
    let output_path = output_path.as_ref();
    let extractor = DirectoryExtractor::open(input_dir)?;

    let mut page_count = extractor.page_count();
    if let Some(max) = config.max_pages {
        page_count = page_count.min(max);
    }

    let (_, job_dir, _) = job_paths(input_dir, config);
    let cache = CacheStore::open(&job_dir, config.storage_retries).await?;

    let title = input_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "Converted document".to_string());

    let mut body = String::new();
    let mut written = 0;
    for page_index in 0..page_count {
        let record = match extractor.extract(page_index).await {
            Ok(content) => cache.get(&content.fingerprint()).await?,
            Err(e) => {
                warn!("assembly: {e}");
                None
            }
        };
        match record {
            Some(record) if record.status == PageStatus::Cached => {
                body.push_str(&format!(
                    "<section class=\"page\" id=\"page-{page_index}\">\n{}</section>\n",
                    record.formatted
                ));
                written += 1;
            }
            _ => {
                body.push_str(&format!("<!-- page {page_index} unavailable -->\n"));
            }
        }
    }

    let document = format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n\
         <!DOCTYPE html>\n\
         <html xmlns=\"http://www.w3.org/1999/xhtml\">\n\
         <head><title>{}</title><meta charset=\"utf-8\"/></head>\n\
         <body>\n{}</body>\n</html>\n",
        crate::pipeline::classify::escape_xhtml(&title),
        body
    );

    atomic_write_output(output_path, document.as_bytes()).await?;
    info!(
        "assembled {}/{} pages into {}",
        written,
        page_count,
        output_path.display()
    );
    Ok(written)
}

/// Run (or resume) a job, then assemble the output file on completion.
///
/// Assembly is skipped when the run ends interrupted, so a half-done job
/// never overwrites a previous full output.
pub async fn convert_to_file(
    input_dir: impl AsRef<Path>,
    output_path: impl AsRef<Path>,
    config: &JobConfig,
    cancel: CancelFlag,
) -> Result<JobOutput, ConvertError> {
    let input_dir = input_dir.as_ref();
    let output = run_job(input_dir, config, cancel).await?;
    if output.status == JobStatus::Completed {
        assemble_to_file(input_dir, config, output_path).await?;
    }
    Ok(output)
}

/// Discard all cached pages and checkpoints for an input.
pub async fn reset_job(
    input_dir: impl AsRef<Path>,
    config: &JobConfig,
) -> Result<(), ConvertError> {
    let (job_id, job_dir, _) = job_paths(input_dir.as_ref(), config);
    let cache = CacheStore::open(&job_dir, config.storage_retries).await?;
    let mut checkpoints = CheckpointManager::open(&job_dir, config.max_checkpoints).await?;
    cache.clear().await?;
    checkpoints.clear().await?;
    info!("reset job {job_id}");
    Ok(())
}

/// Stable identity and on-disk location for an input's job.
fn job_paths(input_dir: &Path, config: &JobConfig) -> (String, PathBuf, String) {
    let source = std::fs::canonicalize(input_dir)
        .unwrap_or_else(|_| input_dir.to_path_buf())
        .to_string_lossy()
        .into_owned();
    let job_id = JobState::derive_job_id(&source);
    let job_dir = config.cache_dir.join(&job_id);
    (job_id, job_dir, source)
}

/// Fingerprints for pages `0..cursor`, stopping early if a page no longer
/// extracts — validation then rolls the cursor back to the last page that
/// still verifies.
async fn fingerprints_below(
    extractor: &dyn ContentExtractor,
    cursor: usize,
) -> Vec<crate::cache::PageFingerprint> {
    let mut fingerprints = Vec::with_capacity(cursor);
    for page_index in 0..cursor {
        match extractor.extract(page_index).await {
            Ok(content) => fingerprints.push(content.fingerprint()),
            Err(e) => {
                warn!("validation: {e}");
                break;
            }
        }
    }
    fingerprints
}

fn resolve_provider(config: &JobConfig) -> Result<Arc<dyn RecognitionProvider>, ConvertError> {
    if let Some(provider) = &config.provider {
        return Ok(Arc::clone(provider));
    }
    match (&config.endpoint, &config.api_key) {
        (Some(endpoint), Some(api_key)) => Ok(Arc::new(HttpVisionProvider::new(
            endpoint,
            api_key,
            &config.model,
        ))),
        _ => Err(ConvertError::ProviderNotConfigured {
            hint: "Set an endpoint and API key (--endpoint / --api-key, or the \
                   PDF2EPUB_API_KEY environment variable), or inject a provider \
                   through JobConfig::builder().provider(..)."
                .into(),
        }),
    }
}

/// Atomic output write: temp file next to the target, then rename.
async fn atomic_write_output(target: &Path, bytes: &[u8]) -> Result<(), ConvertError> {
    let dir = target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let target_buf = target.to_path_buf();
    let bytes = bytes.to_vec();
    tokio::task::spawn_blocking(move || {
        use std::io::Write;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&target_buf).map_err(|e| e.error)?;
        Ok::<(), std::io::Error>(())
    })
    .await
    .map_err(|e| {
        ConvertError::Internal(format!("output write task panicked: {e}"))
    })?
    .map_err(|source| ConvertError::OutputWriteFailed {
        path: target.to_path_buf(),
        source,
    })
}
