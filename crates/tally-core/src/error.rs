//! Error types for Tally operations

use crate::types::{Season, SeasonStatus};
use thiserror::Error;

/// Result type alias for Tally operations
pub type Result<T> = std::result::Result<T, TallyError>;

/// Errors surfaced by the scoring and allocation core
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TallyError {
    // === Caller Errors ===
    /// Bad input shape; rejected before any mutation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Caller lacks rights for an admin operation
    #[error("Authorization error: {0}")]
    Authorization(String),

    /// Caller exceeded an attempt budget
    #[error("Rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    // === Lifecycle Errors ===
    /// Season state machine misuse
    #[error("Invalid transition: cannot {action} season {season} while {from}")]
    InvalidTransition {
        season: Season,
        from: SeasonStatus,
        action: &'static str,
    },

    /// A snapshot with a different root already exists
    #[error("Snapshot conflict for season {season}: stored root differs")]
    SnapshotConflict { season: Season },

    /// A snapshot failed and its automatic freeze could not be undone; the
    /// season stays frozen until a snapshot is generated
    #[error("Snapshot of season {season} failed ({cause}); season left frozen: {rollback}")]
    FrozenWithoutSnapshot {
        season: Season,
        cause: String,
        rollback: String,
    },

    /// Another pass of the same batch job is running
    #[error("Batch job already running: {0}")]
    BatchInProgress(String),

    // === Referral Errors ===
    /// Referral code does not resolve
    #[error("Invalid referral code: {0}")]
    InvalidCode(String),

    /// Caller tried to redeem their own code
    #[error("Cannot use own referral code")]
    SelfReferral,

    /// Caller already has an inbound referrer
    #[error("User already referred")]
    AlreadyReferred,

    /// Redeeming would close a loop in the referral graph
    #[error("Circular referral blocked")]
    CircularReferral,

    // === Lookup / Storage Errors ===
    /// No such user, season or allocation
    #[error("Not found: {0}")]
    NotFound(String),

    /// Backing store failure
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),
}

impl TallyError {
    /// Stable error code for API responses
    pub fn code(&self) -> u32 {
        match self {
            Self::Validation(_) => 1001,
            Self::Authorization(_) => 1002,
            Self::RateLimited { .. } => 1003,
            Self::InvalidTransition { .. } => 2001,
            Self::SnapshotConflict { .. } => 2002,
            Self::BatchInProgress(_) => 2003,
            Self::FrozenWithoutSnapshot { .. } => 2004,
            Self::InvalidCode(_) => 3001,
            Self::SelfReferral => 3002,
            Self::AlreadyReferred => 3003,
            Self::CircularReferral => 3004,
            Self::NotFound(_) => 4004,
            Self::StorageUnavailable(_) => 5003,
        }
    }

    /// Check if retrying the same call can succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::StorageUnavailable(_)
                | Self::BatchInProgress(_)
                | Self::FrozenWithoutSnapshot { .. }
        )
    }
}
