//! CLI binary for pdf2epub.
//!
//! A thin shim over the library crate that maps CLI flags to `JobConfig`,
//! wires Ctrl-C into cooperative cancellation, and prints results.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use pdf2epub::{
    assemble_to_file, reset_job, run_job, CancelFlag, ConvertError, JobConfig,
    JobProgressCallback, JobStatus, PageError, PageRecord, ProgressHandle,
};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: renders a live progress bar and per-page log
/// lines using [indicatif]. Pages complete out-of-order under concurrency;
/// the bar tracks totals, the log lines carry the page numbers.
struct CliProgressCallback {
    /// The single progress bar anchored at the bottom of the terminal.
    bar: ProgressBar,
    /// Count of pages that errored out.
    errors: AtomicUsize,
    /// Count of pages answered straight from the cache.
    cache_hits: AtomicUsize,
}

impl CliProgressCallback {
    /// Create a callback whose progress-bar length is set dynamically by
    /// `on_job_start` (called before any pages are processed).
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0); // length set in on_job_start

        // Initial style: spinner only (no counter until we know the total).
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Opening input…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            errors: AtomicUsize::new(0),
            cache_hits: AtomicUsize::new(0),
        })
    }

    /// Switch to the full progress-bar style once we know `total`.
    fn activate_bar(&self, total: usize, resumed_from: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        self.bar.set_length(total as u64);
        self.bar.set_position(resumed_from as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Converting");
        self.bar.reset_eta();
    }
}

impl JobProgressCallback for CliProgressCallback {
    fn on_job_start(&self, _job_id: &str, page_count: usize, resumed_from: usize) {
        self.activate_bar(page_count, resumed_from);
        if resumed_from > 0 {
            self.bar.println(format!(
                "{} {}",
                cyan("◆"),
                bold(&format!(
                    "Resuming at page {resumed_from}/{page_count}…"
                ))
            ));
        } else {
            self.bar.println(format!(
                "{} {}",
                cyan("◆"),
                bold(&format!("Starting conversion of {page_count} pages…"))
            ));
        }
    }

    fn on_page_start(&self, page_index: usize) {
        self.bar.set_message(format!("page {}", page_index + 1));
    }

    fn on_page_cached(&self, _page_index: usize) {
        self.cache_hits.fetch_add(1, Ordering::SeqCst);
        self.bar.inc(1);
    }

    fn on_page_complete(&self, page_index: usize, record: &PageRecord) {
        self.bar.println(format!(
            "  {} Page {:>4}  {:<10}  {}",
            green("✓"),
            page_index + 1,
            dim(&format!("{:>5} chars", record.text.len())),
            dim(if record.via_recognition {
                "recognised"
            } else {
                "text layer"
            }),
        ));
        self.bar.inc(1);
    }

    fn on_page_error(&self, page_index: usize, error: &PageError) {
        self.errors.fetch_add(1, Ordering::SeqCst);

        // Truncate very long error messages to keep output tidy.
        let msg = error.to_string();
        let msg = if msg.len() > 80 {
            let mut cut = 79;
            while !msg.is_char_boundary(cut) {
                cut -= 1;
            }
            format!("{}\u{2026}", &msg[..cut])
        } else {
            msg
        };

        self.bar.println(format!(
            "  {} Page {:>4}  {}",
            red("✗"),
            page_index + 1,
            red(&msg),
        ));
        self.bar.inc(1);
    }

    fn on_job_complete(&self, _job_id: &str, pages_done: usize, failed_pages: usize) {
        self.bar.finish_and_clear();
        let cache_hits = self.cache_hits.load(Ordering::SeqCst);

        if failed_pages == 0 {
            eprintln!(
                "{} {} pages done  {}",
                green("✔"),
                bold(&pages_done.to_string()),
                dim(&format!("({cache_hits} from cache)")),
            );
        } else {
            eprintln!(
                "{} {} pages done  ({} failed, {} from cache)",
                cyan("⚠"),
                bold(&pages_done.to_string()),
                red(&failed_pages.to_string()),
                cache_hits,
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert a directory of exported page files
  pdf2epub ./book-pages -o book.xhtml

  # Resume after an interruption or crash (same command — resume is automatic)
  pdf2epub ./book-pages -o book.xhtml

  # Limit concurrency and remote call rate
  pdf2epub --concurrency 8 --remote-concurrency 2 ./book-pages -o book.xhtml

  # Process only the first 20 pages
  pdf2epub --max-pages 20 ./book-pages -o sample.xhtml

  # Stop at the first failed page instead of recording and continuing
  pdf2epub --abort-on-failure ./book-pages -o book.xhtml

  # Discard all cached pages and checkpoints for this input
  pdf2epub --reset ./book-pages

  # JSON summary for scripting
  pdf2epub --json ./book-pages -o book.xhtml > summary.json

INPUT FORMAT:
  A directory of page files exported by an upstream tool
  (pdftoppm, mutool draw, or similar):

    book-pages/
      page-0001.png      page image, recognised remotely
      page-0001.txt      optional embedded text layer — skips recognition
      page-0002.png
      ...

RESUME SEMANTICS:
  Every recognised page is stored in a content-addressed cache under
  --cache-dir, and progress is checkpointed as pages commit in order.
  Interrupt with Ctrl-C at any time: in-flight pages finish, a checkpoint
  is saved, and the next run continues where this one verifiably stopped.
  The same page content is never paid for twice.

ENVIRONMENT VARIABLES:
  PDF2EPUB_API_KEY     API key for the recognition endpoint
  PDF2EPUB_ENDPOINT    OpenAI-compatible vision endpoint base URL
  PDF2EPUB_MODEL       Model identifier (default: qwen-vl-ocr)

SETUP:
  1. Export pages:    pdftoppm -png -r 150 book.pdf book-pages/page
  2. Set credentials: export PDF2EPUB_API_KEY=sk-...
  3. Convert:         pdf2epub ./book-pages -o book.xhtml
"#;

/// Convert a directory of page files into an e-book XHTML document.
#[derive(Parser, Debug)]
#[command(
    name = "pdf2epub",
    version,
    about = "Convert scanned page files to e-book XHTML using a remote vision-OCR service",
    long_about = "Convert a directory of exported page images (plus optional embedded text \
layers) into a single XHTML document using a remote vision-recognition service. Jobs are \
resumable: completed pages are cached by content, progress is checkpointed, and re-running \
the same command continues where the previous run stopped.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Directory of page-NNNN.png / page-NNNN.txt files.
    input: PathBuf,

    /// Write the assembled XHTML to this file.
    #[arg(short, long, env = "PDF2EPUB_OUTPUT")]
    output: Option<PathBuf>,

    /// Base URL of an OpenAI-compatible vision endpoint.
    #[arg(long, env = "PDF2EPUB_ENDPOINT")]
    endpoint: Option<String>,

    /// API key for the recognition endpoint.
    #[arg(long, env = "PDF2EPUB_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Model identifier for the recognition endpoint.
    #[arg(long, env = "PDF2EPUB_MODEL", default_value = "qwen-vl-ocr")]
    model: String,

    /// Number of pages processed concurrently.
    #[arg(short, long, env = "PDF2EPUB_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Global cap on simultaneous remote recognition calls.
    #[arg(long, env = "PDF2EPUB_REMOTE_CONCURRENCY", default_value_t = 2)]
    remote_concurrency: usize,

    /// Total recognition attempts per page (first try included).
    #[arg(long, env = "PDF2EPUB_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Initial retry delay in milliseconds (doubles per attempt).
    #[arg(long, env = "PDF2EPUB_BACKOFF_BASE_MS", default_value_t = 500)]
    backoff_base_ms: u64,

    /// Upper bound on a single retry delay in milliseconds.
    #[arg(long, env = "PDF2EPUB_BACKOFF_CAP_MS", default_value_t = 8000)]
    backoff_cap_ms: u64,

    /// Per-call recognition timeout in seconds.
    #[arg(long, env = "PDF2EPUB_API_TIMEOUT", default_value_t = 60)]
    api_timeout: u64,

    /// Checkpoint every N committed pages.
    #[arg(long, env = "PDF2EPUB_CHECKPOINT_INTERVAL", default_value_t = 10)]
    checkpoint_interval: usize,

    /// Number of recent checkpoints retained per job.
    #[arg(long, env = "PDF2EPUB_MAX_CHECKPOINTS", default_value_t = 3)]
    max_checkpoints: usize,

    /// Directory holding the page cache and checkpoints.
    #[arg(long, env = "PDF2EPUB_CACHE_DIR", default_value = "./.pdf2epub-cache")]
    cache_dir: PathBuf,

    /// Process at most this many pages.
    #[arg(long, env = "PDF2EPUB_MAX_PAGES")]
    max_pages: Option<usize>,

    /// Abort on the first failed page instead of recording and continuing.
    #[arg(long, env = "PDF2EPUB_ABORT_ON_FAILURE")]
    abort_on_failure: bool,

    /// Discard cached pages and checkpoints for this input, then exit.
    #[arg(long)]
    reset: bool,

    /// Output a structured JSON summary instead of the human-readable one.
    #[arg(long, env = "PDF2EPUB_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "PDF2EPUB_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PDF2EPUB_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PDF2EPUB_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Suppress INFO-level library logs when the progress bar is active;
    // the bar provides all the feedback that matters to the user.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Reset mode ───────────────────────────────────────────────────────
    if cli.reset {
        let config = build_config(&cli, None)?;
        reset_job(&cli.input, &config)
            .await
            .context("Failed to reset job state")?;
        if !cli.quiet {
            eprintln!("{} cache and checkpoints cleared", green("✔"));
        }
        return Ok(());
    }

    // ── Build config ─────────────────────────────────────────────────────
    let progress_cb: Option<ProgressHandle> = if show_progress {
        let cb = CliProgressCallback::new_dynamic();
        Some(cb as Arc<dyn JobProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb)?;

    // ── Ctrl-C → cooperative cancellation ────────────────────────────────
    // First Ctrl-C requests a clean stop: in-flight pages finish and a
    // checkpoint is saved. A second Ctrl-C kills the process the hard way.
    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        let quiet = cli.quiet;
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                if !quiet {
                    eprintln!(
                        "\n{} interrupt received — finishing in-flight pages, checkpointing…",
                        cyan("◆")
                    );
                }
                cancel.cancel();
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("{} second interrupt — exiting immediately", red("✘"));
                    std::process::exit(130);
                }
            }
        });
    }

    // ── Run the job ──────────────────────────────────────────────────────
    let output = match run_job(&cli.input, &config, cancel).await {
        Ok(output) => output,
        Err(e @ (ConvertError::AuthFailed { .. } | ConvertError::QuotaExhausted { .. })) => {
            // Job-fatal but resumable: the checkpoint is already saved.
            eprintln!("{} {e}", red("✘"));
            std::process::exit(2);
        }
        Err(e) => return Err(e).context("Conversion failed"),
    };

    if output.status == JobStatus::Completed {
        if let Some(ref output_path) = cli.output {
            let written = assemble_to_file(&cli.input, &config, output_path)
                .await
                .context("Assembly failed")?;
            if !cli.quiet && !cli.json {
                eprintln!(
                    "{}  {}/{} pages  →  {}",
                    if output.failures.is_empty() {
                        green("✔")
                    } else {
                        cyan("⚠")
                    },
                    written,
                    output.page_count,
                    bold(&output_path.display().to_string()),
                );
            }
        }
    } else if !cli.quiet && !cli.json {
        eprintln!(
            "{} interrupted at page {}/{} — run the same command to resume",
            cyan("◆"),
            output.usage.pages_done,
            output.page_count,
        );
    }

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("Failed to serialise summary")?
        );
    } else if !cli.quiet {
        eprintln!(
            "   {} remote calls  /  {} tokens in  /  {} tokens out  —  {}ms total",
            dim(&output.usage.remote_calls.to_string()),
            dim(&output.usage.input_tokens.to_string()),
            dim(&output.usage.output_tokens.to_string()),
            output.elapsed_ms,
        );
    }

    if !output.failures.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}

/// Map CLI args to `JobConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressHandle>) -> Result<JobConfig> {
    let mut builder = JobConfig::builder()
        .cache_dir(&cli.cache_dir)
        .concurrency(cli.concurrency)
        .remote_concurrency(cli.remote_concurrency)
        .max_retries(cli.max_retries)
        .backoff_base_ms(cli.backoff_base_ms)
        .backoff_cap_ms(cli.backoff_cap_ms)
        .api_timeout_secs(cli.api_timeout)
        .checkpoint_interval(cli.checkpoint_interval)
        .max_checkpoints(cli.max_checkpoints)
        .abort_on_page_failure(cli.abort_on_failure)
        .model(&cli.model);

    if let Some(ref endpoint) = cli.endpoint {
        builder = builder.endpoint(endpoint);
    }
    if let Some(ref api_key) = cli.api_key {
        builder = builder.api_key(api_key);
    }
    if let Some(max_pages) = cli.max_pages {
        builder = builder.max_pages(max_pages);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}
