//! Persistent page cache: fingerprint → processing result.
//!
//! The cache is the long-lived source of truth for completed pages.
//! Checkpoints are derived, rebuildable metadata; if the two ever disagree,
//! recovery trusts the cache (see [`crate::checkpoint`]).
//!
//! ## Layout
//!
//! One JSON file per record under `<job_dir>/pages/`, named by the
//! fingerprint's key string. File-per-record keeps every write independent:
//! a crash while writing page 12 can never damage page 11.
//!
//! ## Crash safety
//!
//! Every `put` writes to a temp file in the same directory and renames it
//! over the target. Rename is atomic on POSIX filesystems, so a reader
//! observes either the old record or the new one, never a torn write.
//!
//! ## Local retry policy
//!
//! Transient filesystem errors are retried a bounded number of times with a
//! short pause. A read that still fails is surfaced as a `StorageError`; a
//! record that parses as garbage is treated as a cache miss so the page is
//! simply reprocessed instead of wedging the job.

use crate::error::{PageError, StorageError};
use crate::pipeline::classify::PageType;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Pause between local I/O retries.
const RETRY_PAUSE: Duration = Duration::from_millis(50);

/// Stable content-derived identity of one page.
///
/// Two components: the blake3 hash of the page's raw content and the page's
/// position in the document. Identical fingerprint ⇒ identical expected
/// output, which is what makes cache reuse across runs sound: if the source
/// page changes, its hash changes, the lookup misses, and the page is
/// reprocessed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageFingerprint {
    /// Zero-based position of the page in the document.
    pub page_index: usize,
    /// Hex blake3 hash of the raw page content (image bytes + text layer).
    pub content_hash: String,
}

impl PageFingerprint {
    /// Compute the fingerprint for a page's raw content.
    pub fn compute(page_index: usize, content: &[u8]) -> Self {
        Self {
            page_index,
            content_hash: blake3::hash(content).to_hex().to_string(),
        }
    }

    /// Filesystem-safe key string, also the cache file stem.
    ///
    /// The page index is zero-padded so a directory listing sorts in
    /// document order.
    pub fn to_key_string(&self) -> String {
        format!("{:05}-{}", self.page_index, self.content_hash)
    }
}

/// Lifecycle status of a [`PageRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageStatus {
    /// Processing has started but not durably finished. Only ever observed
    /// in memory; pending records are not written to disk.
    Pending,
    /// The page was fully processed; the record is immutable from now on.
    Cached,
    /// The page failed permanently for this run. Reprocessing writes a
    /// fresh record in its place rather than mutating this one.
    Failed,
}

/// The durable result of processing one page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageRecord {
    pub fingerprint: PageFingerprint,
    /// Raw text for the page: the embedded text layer, or the recognition
    /// service's transcription.
    pub text: String,
    /// Formatted output produced by the page classifier.
    pub formatted: String,
    /// Page type assigned by the classifier.
    pub page_type: PageType,
    /// Tokens consumed by recognition, attributed once per logical page
    /// request regardless of retries. Zero for text-layer pages.
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Whether the remote recognition service was invoked for this record.
    pub via_recognition: bool,
    pub status: PageStatus,
    /// Failure detail when `status == Failed`.
    pub error: Option<PageError>,
    /// Unix timestamp (seconds) of record creation.
    pub created_at: u64,
}

impl PageRecord {
    /// Build a `Cached` record for a successfully processed page.
    #[allow(clippy::too_many_arguments)]
    pub fn cached(
        fingerprint: PageFingerprint,
        text: String,
        formatted: String,
        page_type: PageType,
        input_tokens: u32,
        output_tokens: u32,
        via_recognition: bool,
    ) -> Self {
        Self {
            fingerprint,
            text,
            formatted,
            page_type,
            input_tokens,
            output_tokens,
            via_recognition,
            status: PageStatus::Cached,
            error: None,
            created_at: unix_now(),
        }
    }

    /// Build a `Failed` record carrying the page-level error.
    pub fn failed(fingerprint: PageFingerprint, error: PageError) -> Self {
        Self {
            fingerprint,
            text: String::new(),
            formatted: String::new(),
            page_type: PageType::Body,
            input_tokens: 0,
            output_tokens: 0,
            via_recognition: false,
            status: PageStatus::Failed,
            error: Some(error),
            created_at: unix_now(),
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Persistent key-value store for [`PageRecord`]s, one job per directory.
#[derive(Debug, Clone)]
pub struct CacheStore {
    pages_dir: PathBuf,
    retries: u32,
}

impl CacheStore {
    /// Open (creating if necessary) the page cache under `job_dir`.
    pub async fn open(job_dir: &Path, retries: u32) -> Result<Self, StorageError> {
        let pages_dir = job_dir.join("pages");
        tokio::fs::create_dir_all(&pages_dir)
            .await
            .map_err(|e| StorageError::Io {
                path: pages_dir.clone(),
                source: e,
            })?;
        debug!("page cache open at {}", pages_dir.display());
        Ok(Self { pages_dir, retries })
    }

    fn record_path(&self, fingerprint: &PageFingerprint) -> PathBuf {
        self.pages_dir
            .join(format!("{}.json", fingerprint.to_key_string()))
    }

    /// Look up the record for a fingerprint.
    ///
    /// Side-effect-free. A record that fails to parse is logged and treated
    /// as absent, so the caller reprocesses the page — an invalid cached
    /// result must never be trusted.
    pub async fn get(
        &self,
        fingerprint: &PageFingerprint,
    ) -> Result<Option<PageRecord>, StorageError> {
        let path = self.record_path(fingerprint);
        let mut last_err: Option<std::io::Error> = None;

        for attempt in 0..=self.retries {
            if attempt > 0 {
                tokio::time::sleep(RETRY_PAUSE).await;
            }
            match tokio::fs::read(&path).await {
                Ok(bytes) => {
                    return match serde_json::from_slice::<PageRecord>(&bytes) {
                        Ok(record) => Ok(Some(record)),
                        Err(e) => {
                            warn!(
                                "discarding unreadable cache record {}: {}",
                                path.display(),
                                e
                            );
                            Ok(None)
                        }
                    };
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => {
                    warn!(
                        "cache read attempt {}/{} failed for {}: {}",
                        attempt + 1,
                        self.retries + 1,
                        path.display(),
                        e
                    );
                    last_err = Some(e);
                }
            }
        }

        Err(StorageError::Io {
            path,
            source: last_err
                .unwrap_or_else(|| std::io::Error::other("read failed with no recorded cause")),
        })
    }

    /// Durably store a record, replacing any previous record for the same
    /// fingerprint.
    ///
    /// Atomic with respect to crash: temp file in the same directory, then
    /// rename. Retried locally; a `StorageError` from here is fatal to the
    /// job (a cache that cannot accept writes cannot guarantee resume
    /// correctness).
    pub async fn put(&self, record: &PageRecord) -> Result<(), StorageError> {
        let path = self.record_path(&record.fingerprint);
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| StorageError::Serialize(e.to_string()))?;

        let mut last_err: Option<std::io::Error> = None;
        for attempt in 0..=self.retries {
            if attempt > 0 {
                tokio::time::sleep(RETRY_PAUSE).await;
            }
            match atomic_write(&self.pages_dir, &path, &json).await {
                Ok(()) => {
                    debug!(
                        "cached page {} ({:?})",
                        record.fingerprint.page_index, record.status
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "cache write attempt {}/{} failed for {}: {}",
                        attempt + 1,
                        self.retries + 1,
                        path.display(),
                        e
                    );
                    last_err = Some(e);
                }
            }
        }

        Err(StorageError::Io {
            path,
            source: last_err
                .unwrap_or_else(|| std::io::Error::other("write failed with no recorded cause")),
        })
    }

    /// Drop the record for a fingerprint, if any.
    pub async fn invalidate(&self, fingerprint: &PageFingerprint) -> Result<(), StorageError> {
        let path = self.record_path(fingerprint);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io { path, source: e }),
        }
    }

    /// Keep only the `keep_latest_n` most recently created records.
    pub async fn prune(&self, keep_latest_n: usize) -> Result<usize, StorageError> {
        let mut entries = self.list().await?;
        if entries.len() <= keep_latest_n {
            return Ok(0);
        }
        // Newest first; delete the tail.
        entries.sort_by(|a, b| b.1.created_at.cmp(&a.1.created_at));
        let mut removed = 0;
        for (path, _) in entries.into_iter().skip(keep_latest_n) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::Io { path, source: e }),
            }
        }
        debug!("pruned {} cache records", removed);
        Ok(removed)
    }

    /// Remove every record in this job's cache.
    pub async fn clear(&self) -> Result<(), StorageError> {
        for (path, _) in self.list().await? {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::Io { path, source: e }),
            }
        }
        Ok(())
    }

    /// All parseable records currently on disk, unordered.
    pub async fn list(&self) -> Result<Vec<(PathBuf, PageRecord)>, StorageError> {
        let mut dir = tokio::fs::read_dir(&self.pages_dir)
            .await
            .map_err(|e| StorageError::Io {
                path: self.pages_dir.clone(),
                source: e,
            })?;

        let mut out = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(|e| StorageError::Io {
            path: self.pages_dir.clone(),
            source: e,
        })? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<PageRecord>(&bytes) {
                    Ok(record) => out.push((path, record)),
                    Err(e) => warn!("skipping unreadable record {}: {}", path.display(), e),
                },
                Err(e) => warn!("skipping unreadable record {}: {}", path.display(), e),
            }
        }
        Ok(out)
    }
}

/// Write `bytes` to `target` via a temp file in `dir` plus atomic rename.
async fn atomic_write(dir: &Path, target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = dir.to_path_buf();
    let target = target.to_path_buf();
    let bytes = bytes.to_vec();
    // NamedTempFile is blocking I/O; keep it off the async hot path.
    tokio::task::spawn_blocking(move || {
        use std::io::Write;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&target).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(|e| std::io::Error::other(format!("atomic write task panicked: {e}")))?
}
