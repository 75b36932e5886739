//! Batch job guard and progress reporting
//!
//! Long-running passes (recalculation, decay, clustering, weekly activity,
//! pyramid scans) must not overlap for the same season. A `JobLocks` hands out
//! at most one `JobPermit` per `(job, season)`; the permit releases on drop.

use crate::error::{Result, TallyError};
use crate::types::Season;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Kinds of guarded batch jobs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Recalculate,
    Decay,
    Clustering,
    WalletChecks,
    Behavioral,
    WeeklyActivity,
    PyramidScan,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobKind::Recalculate => "recalculate",
            JobKind::Decay => "decay",
            JobKind::Clustering => "clustering",
            JobKind::WalletChecks => "wallet_checks",
            JobKind::Behavioral => "behavioral",
            JobKind::WeeklyActivity => "weekly_activity",
            JobKind::PyramidScan => "pyramid_scan",
        };
        f.write_str(name)
    }
}

/// Registry of running jobs
#[derive(Clone, Debug, Default)]
pub struct JobLocks {
    running: Arc<Mutex<HashSet<(JobKind, Season)>>>,
}

impl JobLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `(kind, season)` or fail with `BatchInProgress`
    pub fn try_acquire(&self, kind: JobKind, season: Season) -> Result<JobPermit> {
        let mut running = self.running.lock();
        if !running.insert((kind, season)) {
            return Err(TallyError::BatchInProgress(format!(
                "{kind} for season {season}"
            )));
        }
        Ok(JobPermit {
            key: (kind, season),
            running: Arc::clone(&self.running),
        })
    }

    pub fn is_running(&self, kind: JobKind, season: Season) -> bool {
        self.running.lock().contains(&(kind, season))
    }
}

/// Held for the duration of one batch pass
#[derive(Debug)]
pub struct JobPermit {
    key: (JobKind, Season),
    running: Arc<Mutex<HashSet<(JobKind, Season)>>>,
}

impl Drop for JobPermit {
    fn drop(&mut self) {
        self.running.lock().remove(&self.key);
    }
}

/// Partial-progress outcome of a batch pass
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub job: JobKind,
    pub season: Season,
    pub total: usize,
    pub processed: usize,
    pub failed: usize,
    /// Items intentionally left alone (e.g. manually reviewed flags)
    pub skipped: usize,
    /// First error encountered, if any
    pub error: Option<String>,
}

impl BatchReport {
    pub fn new(job: JobKind, season: Season, total: usize) -> Self {
        Self {
            job,
            season,
            total,
            processed: 0,
            failed: 0,
            skipped: 0,
            error: None,
        }
    }

    pub fn record_failure(&mut self, err: &TallyError) {
        self.failed += 1;
        if self.error.is_none() {
            self.error = Some(err.to_string());
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }

    pub fn summary(&self) -> String {
        format!(
            "{} season {}: processed {} of {} ({} failed, {} skipped)",
            self.job, self.season, self.processed, self.total, self.failed, self.skipped
        )
    }
}
