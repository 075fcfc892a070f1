//! End-to-end tests for the conversion pipeline: resume, caching,
//! retry/backoff, cancellation, and failure handling through the public
//! `run_job` / `assemble_to_file` API.

use async_trait::async_trait;
use pdf2epub::{
    assemble_to_file, reset_job, run_job, CancelFlag, ConvertError, JobConfig, JobStatus,
    PageError, PagePayload, Recognition, RecognitionError, RecognitionProvider,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Recognition backend driven by a per-page behavior function.
///
/// `behavior(page_index, nth_attempt_for_page)` decides each call's
/// outcome; every call is recorded for later assertions.
struct TestProvider {
    behavior: Box<
        dyn Fn(usize, usize) -> Result<Recognition, RecognitionError> + Send + Sync,
    >,
    calls: Mutex<Vec<usize>>,
    attempts_per_page: Mutex<HashMap<usize, usize>>,
}

impl TestProvider {
    fn new(
        behavior: impl Fn(usize, usize) -> Result<Recognition, RecognitionError>
            + Send
            + Sync
            + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            behavior: Box::new(behavior),
            calls: Mutex::new(Vec::new()),
            attempts_per_page: Mutex::new(HashMap::new()),
        })
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn calls_for_page(&self, page_index: usize) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|&&p| p == page_index)
            .count()
    }
}

#[async_trait]
impl RecognitionProvider for TestProvider {
    fn name(&self) -> &str {
        "test-provider"
    }

    async fn recognize(&self, payload: &PagePayload) -> Result<Recognition, RecognitionError> {
        let page = payload.page_index;
        self.calls.lock().unwrap().push(page);
        let attempt = {
            let mut attempts = self.attempts_per_page.lock().unwrap();
            let n = attempts.entry(page).or_insert(0);
            *n += 1;
            *n
        };
        (self.behavior)(page, attempt)
    }
}

/// Provider that measures how many calls are in flight simultaneously.
struct GaugedProvider {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl GaugedProvider {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl RecognitionProvider for GaugedProvider {
    fn name(&self) -> &str {
        "gauged"
    }

    async fn recognize(&self, payload: &PagePayload) -> Result<Recognition, RecognitionError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        // Hold the slot long enough for other workers to pile up behind
        // the limiter.
        tokio::time::sleep(Duration::from_millis(25)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        ok_page(payload.page_index)
    }
}

fn ok_page(page: usize) -> Result<Recognition, RecognitionError> {
    Ok(Recognition {
        text: format!("Recognised prose for page {page}.\n\nSecond paragraph."),
        input_tokens: 100,
        output_tokens: 40,
    })
}

/// Write `n` page image files into `dir`, each with distinct content.
fn make_input(dir: &Path, n: usize) {
    for i in 1..=n {
        std::fs::write(
            dir.join(format!("page-{i:04}.png")),
            format!("image bytes for page {i}"),
        )
        .unwrap();
    }
}

fn config_with(provider: Arc<dyn RecognitionProvider>, cache_dir: &Path) -> JobConfig {
    JobConfig::builder()
        .cache_dir(cache_dir)
        .provider(provider)
        .concurrency(2)
        .remote_concurrency(2)
        .max_retries(3)
        .backoff_base_ms(1)
        .backoff_cap_ms(5)
        .checkpoint_interval(2)
        .build()
        .unwrap()
}

#[tokio::test]
async fn full_run_recognises_each_page_once_and_assembles() {
    let input = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    make_input(input.path(), 5);

    let provider = TestProvider::new(|page, _| ok_page(page));
    let config = config_with(provider.clone(), cache.path());

    let output = run_job(input.path(), &config, CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(output.status, JobStatus::Completed);
    assert_eq!(output.usage.pages_done, 5);
    assert_eq!(output.usage.remote_calls, 5);
    assert!(output.failures.is_empty());
    assert_eq!(provider.total_calls(), 5);
    for page in 0..5 {
        assert_eq!(provider.calls_for_page(page), 1);
    }

    let out_file = cache.path().join("book.xhtml");
    let written = assemble_to_file(input.path(), &config, &out_file)
        .await
        .unwrap();
    assert_eq!(written, 5);
    let doc = std::fs::read_to_string(&out_file).unwrap();
    assert!(doc.contains("id=\"page-0\""));
    assert!(doc.contains("id=\"page-4\""));
    assert!(doc.contains("Recognised prose for page 2."));
}

#[tokio::test]
async fn rerun_pays_for_nothing() {
    let input = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    make_input(input.path(), 4);

    let provider = TestProvider::new(|page, _| ok_page(page));
    let config = config_with(provider.clone(), cache.path());

    run_job(input.path(), &config, CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(provider.total_calls(), 4);

    // Identical second run resumes at the validated cursor: no work at all.
    let output = run_job(input.path(), &config, CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(output.status, JobStatus::Completed);
    assert_eq!(output.usage.pages_done, 4);
    assert_eq!(provider.total_calls(), 4);
}

#[tokio::test]
async fn stale_checkpoint_rolls_back_to_cache_truth() {
    let input = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    make_input(input.path(), 5);

    let provider = TestProvider::new(|page, _| ok_page(page));
    let config = config_with(provider.clone(), cache.path());
    run_job(input.path(), &config, CancelFlag::new())
        .await
        .unwrap();

    // Simulate the crash window: the checkpoint says page 2 is done, but
    // its cache record is gone.
    let job_dirs: Vec<_> = std::fs::read_dir(cache.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.is_dir())
        .collect();
    assert_eq!(job_dirs.len(), 1);
    let pages_dir = job_dirs[0].join("pages");
    let victim = std::fs::read_dir(&pages_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("00002-"))
        })
        .expect("record for page 2");
    std::fs::remove_file(victim).unwrap();

    let output = run_job(input.path(), &config, CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(output.status, JobStatus::Completed);
    // Only the missing page is re-recognised; pages 3 and 4 come back as
    // cache hits while the cursor re-walks them.
    assert_eq!(provider.calls_for_page(2), 2);
    assert_eq!(provider.total_calls(), 6);
    assert_eq!(output.usage.cache_hits, 2);
}

#[tokio::test]
async fn retryable_failure_uses_exactly_max_retries_attempts() {
    let input = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    make_input(input.path(), 3);

    let provider = TestProvider::new(|page, _| {
        if page == 1 {
            Err(RecognitionError::ServerError { status: 503 })
        } else {
            ok_page(page)
        }
    });
    let config = config_with(provider.clone(), cache.path());

    let output = run_job(input.path(), &config, CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(output.status, JobStatus::Completed);
    assert_eq!(output.usage.failed_pages, 1);
    assert_eq!(output.failures.len(), 1);
    assert!(matches!(
        output.failures[0],
        PageError::RetriesExhausted {
            page: 1,
            attempts: 3,
            ..
        }
    ));
    assert_eq!(provider.calls_for_page(1), 3);
    // Successful calls are counted once each; the failed page contributes
    // nothing to usage.
    assert_eq!(output.usage.remote_calls, 2);
}

#[tokio::test]
async fn permanent_failure_aborts_the_page_after_one_attempt() {
    let input = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    make_input(input.path(), 3);

    let provider = TestProvider::new(|page, _| {
        if page == 0 {
            Err(RecognitionError::MalformedRequest {
                detail: "image too large".into(),
            })
        } else {
            ok_page(page)
        }
    });
    let config = config_with(provider.clone(), cache.path());

    let output = run_job(input.path(), &config, CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(output.status, JobStatus::Completed);
    assert_eq!(provider.calls_for_page(0), 1);
    assert!(matches!(
        output.failures[0],
        PageError::Permanent { page: 0, .. }
    ));
}

#[tokio::test]
async fn transient_timeouts_then_success_counts_usage_once() {
    let input = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    make_input(input.path(), 2);

    let provider = TestProvider::new(|page, attempt| {
        if page == 1 && attempt < 3 {
            Err(RecognitionError::Timeout { elapsed_ms: 10 })
        } else {
            ok_page(page)
        }
    });
    let config = config_with(provider.clone(), cache.path());

    let output = run_job(input.path(), &config, CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(output.status, JobStatus::Completed);
    assert!(output.failures.is_empty());
    assert_eq!(provider.calls_for_page(1), 3);
    // One logical request per page despite the retries.
    assert_eq!(output.usage.remote_calls, 2);
    assert_eq!(output.usage.input_tokens, 200);
    assert_eq!(output.usage.output_tokens, 80);
}

#[tokio::test]
async fn cancellation_checkpoints_and_resume_finishes_the_job() {
    let input = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    make_input(input.path(), 4);

    // The flag flips while page 0 is in flight; with a single worker the
    // in-flight page finishes and commits, then dispatch stops.
    let cancel = CancelFlag::new();
    let trip = cancel.clone();
    let provider = TestProvider::new(move |page, _| {
        trip.cancel();
        ok_page(page)
    });
    let config = JobConfig::builder()
        .cache_dir(cache.path())
        .provider(provider.clone())
        .concurrency(1)
        .backoff_base_ms(1)
        .backoff_cap_ms(5)
        .build()
        .unwrap();

    let output = run_job(input.path(), &config, cancel).await.unwrap();
    assert_eq!(output.status, JobStatus::Interrupted);
    assert_eq!(output.usage.pages_done, 1);
    assert_eq!(provider.total_calls(), 1);

    // Resume with a fresh flag: page 0 is never paid for again.
    let resumed = run_job(input.path(), &config, CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(resumed.status, JobStatus::Completed);
    assert_eq!(resumed.usage.pages_done, 4);
    assert_eq!(provider.calls_for_page(0), 1);
    assert_eq!(provider.total_calls(), 4);
}

#[tokio::test]
async fn remote_concurrency_cap_holds_under_a_wide_worker_pool() {
    let input = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    make_input(input.path(), 8);

    let provider = GaugedProvider::new();
    let config = JobConfig::builder()
        .cache_dir(cache.path())
        .provider(provider.clone())
        .concurrency(8)
        .remote_concurrency(2)
        .backoff_base_ms(1)
        .backoff_cap_ms(5)
        .build()
        .unwrap();

    let output = run_job(input.path(), &config, CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(output.status, JobStatus::Completed);
    assert_eq!(output.usage.remote_calls, 8);

    // Eight workers, but the limiter never admits more than two calls at
    // once.
    let observed = provider.max_in_flight.load(Ordering::SeqCst);
    assert!(observed >= 1);
    assert!(observed <= 2, "saw {observed} simultaneous remote calls");
}

#[tokio::test]
async fn quota_exhaustion_halts_the_job_and_resumes_after_the_fix() {
    let input = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    make_input(input.path(), 5);

    let provider = TestProvider::new(|page, _| {
        if page >= 2 {
            Err(RecognitionError::QuotaExhausted {
                detail: "monthly cap reached".into(),
            })
        } else {
            ok_page(page)
        }
    });
    let config = JobConfig::builder()
        .cache_dir(cache.path())
        .provider(provider.clone())
        .concurrency(1)
        .backoff_base_ms(1)
        .backoff_cap_ms(5)
        .build()
        .unwrap();

    let err = run_job(input.path(), &config, CancelFlag::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ConvertError::QuotaExhausted { page: 2, .. }));
    assert_eq!(provider.calls_for_page(2), 1);

    // Same broken quota: the identical failure repeats, no progress is
    // lost and no completed page is re-billed.
    let err = run_job(input.path(), &config, CancelFlag::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ConvertError::QuotaExhausted { page: 2, .. }));
    assert_eq!(provider.calls_for_page(0), 1);
    assert_eq!(provider.calls_for_page(1), 1);

    // Quota restored: the run picks up at page 2 and completes.
    let fixed = TestProvider::new(|page, _| ok_page(page));
    let config = JobConfig::builder()
        .cache_dir(cache.path())
        .provider(fixed.clone())
        .concurrency(1)
        .backoff_base_ms(1)
        .backoff_cap_ms(5)
        .build()
        .unwrap();
    let output = run_job(input.path(), &config, CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(output.status, JobStatus::Completed);
    assert_eq!(fixed.total_calls(), 3);
    assert_eq!(fixed.calls_for_page(0), 0);
}

#[tokio::test]
async fn abort_on_page_failure_fails_fast_with_cursor_at_last_success() {
    let input = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    make_input(input.path(), 4);

    let provider = TestProvider::new(|page, _| {
        if page == 1 {
            Err(RecognitionError::MalformedRequest {
                detail: "bad page".into(),
            })
        } else {
            ok_page(page)
        }
    });
    let config = JobConfig::builder()
        .cache_dir(cache.path())
        .provider(provider.clone())
        .concurrency(1)
        .backoff_base_ms(1)
        .backoff_cap_ms(5)
        .abort_on_page_failure(true)
        .build()
        .unwrap();

    let err = run_job(input.path(), &config, CancelFlag::new())
        .await
        .unwrap_err();
    match err {
        ConvertError::PageFailed { page, source } => {
            assert_eq!(page, 1);
            assert!(matches!(source, PageError::Permanent { .. }));
        }
        other => panic!("expected PageFailed, got {other}"),
    }
    // Page 0 committed, pages past the failure never dispatched.
    assert_eq!(provider.calls_for_page(0), 1);
    assert_eq!(provider.calls_for_page(2), 0);
}

#[tokio::test]
async fn failed_pages_get_one_more_attempt_on_resume() {
    let input = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    make_input(input.path(), 3);

    let flaky_until_rerun = TestProvider::new(|page, _| {
        if page == 1 {
            Err(RecognitionError::ServerError { status: 500 })
        } else {
            ok_page(page)
        }
    });
    let config = config_with(flaky_until_rerun.clone(), cache.path());
    let output = run_job(input.path(), &config, CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(output.usage.failed_pages, 1);

    // The outage is over; resume re-attempts the failed page only.
    let recovered = TestProvider::new(|page, _| ok_page(page));
    let config = config_with(recovered.clone(), cache.path());
    let output = run_job(input.path(), &config, CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(output.status, JobStatus::Completed);
    assert!(output.failures.is_empty());
    assert_eq!(recovered.total_calls(), 1);
    assert_eq!(recovered.calls_for_page(1), 1);
}

#[tokio::test]
async fn text_layer_pages_never_touch_the_network() {
    let input = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    make_input(input.path(), 3);
    std::fs::write(
        input.path().join("page-0002.txt"),
        "Embedded text layer for page two.",
    )
    .unwrap();

    let provider = TestProvider::new(|page, _| ok_page(page));
    let config = config_with(provider.clone(), cache.path());

    let output = run_job(input.path(), &config, CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(output.status, JobStatus::Completed);
    assert_eq!(output.usage.remote_calls, 2);
    assert_eq!(provider.calls_for_page(1), 0);
}

#[tokio::test]
async fn changed_page_content_invalidates_only_that_page() {
    let input = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    make_input(input.path(), 3);

    let provider = TestProvider::new(|page, _| ok_page(page));
    let config = config_with(provider.clone(), cache.path());
    run_job(input.path(), &config, CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(provider.total_calls(), 3);

    // Re-export changes page 1's content; its fingerprint changes, the
    // cache misses, and only that page is re-recognised.
    std::fs::write(
        input.path().join("page-0002.png"),
        "different image bytes for page 2",
    )
    .unwrap();
    run_job(input.path(), &config, CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(provider.calls_for_page(1), 2);
    assert_eq!(provider.total_calls(), 4);
}

#[tokio::test]
async fn reset_forces_a_full_reprocess() {
    let input = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    make_input(input.path(), 3);

    let provider = TestProvider::new(|page, _| ok_page(page));
    let config = config_with(provider.clone(), cache.path());

    run_job(input.path(), &config, CancelFlag::new())
        .await
        .unwrap();
    reset_job(input.path(), &config).await.unwrap();
    run_job(input.path(), &config, CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(provider.total_calls(), 6);
}

#[tokio::test]
async fn missing_provider_is_a_configuration_error() {
    let input = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    make_input(input.path(), 1);

    let config = JobConfig::builder()
        .cache_dir(cache.path())
        .build()
        .unwrap();
    let err = run_job(input.path(), &config, CancelFlag::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ConvertError::ProviderNotConfigured { .. }));
}

#[tokio::test]
async fn max_pages_limits_the_run() {
    let input = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    make_input(input.path(), 10);

    let provider = TestProvider::new(|page, _| ok_page(page));
    let config = JobConfig::builder()
        .cache_dir(cache.path())
        .provider(provider.clone())
        .max_pages(3)
        .backoff_base_ms(1)
        .backoff_cap_ms(5)
        .build()
        .unwrap();

    let output = run_job(input.path(), &config, CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(output.status, JobStatus::Completed);
    assert_eq!(output.page_count, 3);
    assert_eq!(provider.total_calls(), 3);
}
