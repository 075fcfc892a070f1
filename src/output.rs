//! Job result summary returned to callers.

use crate::checkpoint::{JobStatus, UsageTotals};
use crate::error::PageError;
use serde::{Deserialize, Serialize};

/// Outcome of a conversion run: terminal status, aggregate counters, and
/// per-page failures for the run.
///
/// Serialisable so the CLI can emit it as JSON for scripting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutput {
    pub job_id: String,
    /// Terminal status: `Completed` or `Interrupted`. Job-fatal halts are
    /// reported as errors from `run_job`, not through this struct.
    pub status: JobStatus,
    /// Total pages in scope for this run.
    pub page_count: usize,
    /// Counters accumulated across this run and any resumed-from runs.
    pub usage: UsageTotals,
    /// Pages that ended `Failed` during this run, in page order.
    pub failures: Vec<PageError>,
    pub elapsed_ms: u64,
}

impl JobOutput {
    /// Whether every page resolved and none failed.
    pub fn is_clean_completion(&self) -> bool {
        self.status == JobStatus::Completed && self.failures.is_empty()
    }
}
