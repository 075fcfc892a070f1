//! Job state and checkpoint persistence.
//!
//! A checkpoint is a durable snapshot of [`JobState`] — cursor, usage
//! counters, lifecycle status. It is a *hint*, not ground truth: the page
//! cache is authoritative for which pages are actually done. Recovery
//! therefore always runs [`CheckpointManager::validate`] before trusting a
//! loaded state, rolling the cursor back to the last page whose cache
//! record really exists and is `Cached`. This is what makes the
//! crash-between-cache-write-and-checkpoint window safe: the worst a stale
//! checkpoint can do is cause cheap cache hits, never double recognition
//! and never skipped pages.
//!
//! Checkpoints are numbered `ckpt-NNNNNN.json` under
//! `<job_dir>/checkpoints/` and written with the same temp-file-plus-rename
//! discipline as the page cache. The newest `max_checkpoints` are retained;
//! older ones are deleted only after a newer one has been durably written,
//! and the last remaining checkpoint is never deleted.

use crate::cache::{CacheStore, PageFingerprint, PageStatus};
use crate::error::StorageError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Bounded local retries for checkpoint writes, with this pause between
/// attempts. A save that still fails is fatal to the job.
const SAVE_RETRIES: u32 = 3;
const RETRY_PAUSE: Duration = Duration::from_millis(50);

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Created, not yet started.
    Idle,
    /// Pages are being processed.
    Processing,
    /// Stopped by a cancellation request; resumable.
    Interrupted,
    /// Halted by a job-fatal error; resumable after the cause is fixed.
    Failed,
    /// All pages durably resolved.
    Completed,
}

/// Aggregate usage counters, persisted with every checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotals {
    /// Pages resolved below the cursor (Cached or acknowledged Failed).
    pub pages_done: usize,
    /// Pages answered straight from the cache with no work.
    pub cache_hits: usize,
    /// Successful remote recognition calls, one per logical page request.
    pub remote_calls: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Pages that ended in a Failed record during this run.
    pub failed_pages: usize,
}

/// The controller-owned state of one conversion job.
///
/// Owned exclusively by the job controller; the checkpoint manager only
/// reads and writes its serialized form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobState {
    /// Stable identifier derived from the source, so a re-run of the same
    /// input finds its earlier cache and checkpoints.
    pub job_id: String,
    /// Human-readable source description (input directory path).
    pub source: String,
    /// Total pages in the document.
    pub page_count: usize,
    /// Next page to process. Every page below the cursor has a durable
    /// cache record; the cursor never advances past an unrecorded page.
    pub cursor: usize,
    pub usage: UsageTotals,
    pub status: JobStatus,
    /// Unix timestamp (seconds) of the last checkpoint write.
    pub last_checkpoint: u64,
}

impl JobState {
    /// Fresh state for a job starting from page zero.
    pub fn new(job_id: String, source: String, page_count: usize) -> Self {
        Self {
            job_id,
            source,
            page_count,
            cursor: 0,
            usage: UsageTotals::default(),
            status: JobStatus::Idle,
            last_checkpoint: 0,
        }
    }

    /// Derive a stable job id from the source identifier.
    pub fn derive_job_id(source: &str) -> String {
        // Shortened hash keeps directory names readable while still making
        // collisions between different inputs implausible.
        let hash = blake3::hash(source.as_bytes()).to_hex().to_string();
        format!("job-{}", &hash[..16])
    }
}

/// One durable snapshot on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Checkpoint {
    seq: u64,
    saved_at: u64,
    state: JobState,
}

/// Saves, loads, and validates [`JobState`] snapshots for one job.
#[derive(Debug)]
pub struct CheckpointManager {
    dir: PathBuf,
    max_checkpoints: usize,
    next_seq: u64,
}

impl CheckpointManager {
    /// Open the checkpoint directory for a job, creating it if needed and
    /// scanning existing snapshots to continue the sequence numbering.
    pub async fn open(job_dir: &Path, max_checkpoints: usize) -> Result<Self, StorageError> {
        let dir = job_dir.join("checkpoints");
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StorageError::Io {
                path: dir.clone(),
                source: e,
            })?;

        let next_seq = list_checkpoint_files(&dir)
            .await?
            .last()
            .map(|(seq, _)| seq + 1)
            .unwrap_or(0);

        Ok(Self {
            dir,
            max_checkpoints: max_checkpoints.max(1),
            next_seq,
        })
    }

    /// Persist a snapshot of `state`, then prune old snapshots.
    ///
    /// Pruning happens strictly after the new snapshot is durably on disk,
    /// and never removes the only remaining checkpoint.
    pub async fn save(&mut self, state: &JobState) -> Result<(), StorageError> {
        let seq = self.next_seq;
        let checkpoint = Checkpoint {
            seq,
            saved_at: unix_now(),
            state: state.clone(),
        };
        let json = serde_json::to_vec_pretty(&checkpoint)
            .map_err(|e| StorageError::Serialize(e.to_string()))?;

        let path = self.dir.join(format!("ckpt-{seq:06}.json"));
        let mut last_err: Option<std::io::Error> = None;
        for attempt in 0..=SAVE_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(RETRY_PAUSE).await;
            }
            match atomic_write(&self.dir, &path, &json).await {
                Ok(()) => {
                    last_err = None;
                    break;
                }
                Err(e) => {
                    warn!(
                        "checkpoint write attempt {}/{} failed for {}: {}",
                        attempt + 1,
                        SAVE_RETRIES + 1,
                        path.display(),
                        e
                    );
                    last_err = Some(e);
                }
            }
        }
        if let Some(source) = last_err {
            return Err(StorageError::Io { path, source });
        }
        self.next_seq += 1;
        debug!(
            "checkpoint {} saved (cursor={}, status={:?})",
            seq, state.cursor, state.status
        );

        self.prune_old().await
    }

    /// Load the most recent parseable snapshot, or `None` if the job has
    /// never checkpointed. Corrupt snapshots are skipped with a warning;
    /// an older valid one is better than refusing to resume.
    pub async fn load_latest(&self) -> Result<Option<JobState>, StorageError> {
        let files = list_checkpoint_files(&self.dir).await?;
        for (seq, path) in files.into_iter().rev() {
            match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<Checkpoint>(&bytes) {
                    Ok(checkpoint) => {
                        info!("loaded checkpoint {} (cursor={})", seq, checkpoint.state.cursor);
                        return Ok(Some(checkpoint.state));
                    }
                    Err(e) => warn!("skipping corrupt checkpoint {}: {}", path.display(), e),
                },
                Err(e) => warn!("skipping unreadable checkpoint {}: {}", path.display(), e),
            }
        }
        Ok(None)
    }

    /// Verify a loaded state against the cache and roll the cursor back to
    /// the first page below it whose record is missing or not `Cached`.
    ///
    /// `fingerprints` must cover at least pages `0..state.cursor` in
    /// document order. Returns the validated cursor. A `Failed` record
    /// counts as unverified, so resumed runs re-attempt failed pages.
    pub async fn validate(
        &self,
        state: &mut JobState,
        cache: &CacheStore,
        fingerprints: &[PageFingerprint],
    ) -> Result<usize, StorageError> {
        let claimed = state.cursor.min(fingerprints.len());
        let mut verified = 0;
        for fingerprint in fingerprints.iter().take(claimed) {
            match cache.get(fingerprint).await? {
                Some(record) if record.status == PageStatus::Cached => verified += 1,
                other => {
                    warn!(
                        "checkpoint claims page {} done but cache record is {}; rolling back",
                        fingerprint.page_index,
                        match other {
                            Some(_) => "not Cached",
                            None => "missing",
                        }
                    );
                    break;
                }
            }
        }
        if verified != state.cursor {
            info!(
                "cursor rolled back from {} to {} after cache validation",
                state.cursor, verified
            );
            state.cursor = verified;
            state.usage.pages_done = verified;
        }
        Ok(verified)
    }

    /// Delete everything in the checkpoint directory (job reset).
    pub async fn clear(&mut self) -> Result<(), StorageError> {
        for (_, path) in list_checkpoint_files(&self.dir).await? {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::Io { path, source: e }),
            }
        }
        self.next_seq = 0;
        Ok(())
    }

    async fn prune_old(&self) -> Result<(), StorageError> {
        let files = list_checkpoint_files(&self.dir).await?;
        if files.len() <= self.max_checkpoints {
            return Ok(());
        }
        let excess = files.len() - self.max_checkpoints;
        for (seq, path) in files.into_iter().take(excess) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!("pruned checkpoint {}", seq),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::Io { path, source: e }),
            }
        }
        Ok(())
    }
}

/// Checkpoint files in ascending sequence order.
async fn list_checkpoint_files(dir: &Path) -> Result<Vec<(u64, PathBuf)>, StorageError> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| StorageError::Io {
            path: dir.to_path_buf(),
            source: e,
        })?;

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| StorageError::Io {
        path: dir.to_path_buf(),
        source: e,
    })? {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(seq) = name
            .strip_prefix("ckpt-")
            .and_then(|rest| rest.strip_suffix(".json"))
            .and_then(|digits| digits.parse::<u64>().ok())
        {
            files.push((seq, path));
        }
    }
    files.sort_by_key(|(seq, _)| *seq);
    Ok(files)
}

async fn atomic_write(dir: &Path, target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = dir.to_path_buf();
    let target = target.to_path_buf();
    let bytes = bytes.to_vec();
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

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
