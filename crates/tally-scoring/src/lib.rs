//! # Tally Scoring
//!
//! Turns participation events into per-season contribution scores.
//!
//! ## Record path
//!
//! ```text
//!   record_event ──► resolve season/week ──► cooldown ──► EventStore::record
//!                                                              │
//!                          ContributionScore ◄── weekly cap ◄──┘
//! ```
//!
//! Batch passes (`recalculate_all_scores`, `apply_decay`,
//! `process_weekly_activity`) rebuild or adjust the aggregates and never
//! overlap for the same season.

pub mod engine;
pub mod event_store;
pub mod metrics;
pub mod queue;
pub mod streaks;

pub use engine::{
    rank_scores, AllocationEstimate, EventRequest, EventTarget, RecordOutcome, ScoringEngine,
};
pub use event_store::{EventFilter, EventStore};
pub use metrics::ScoringMetrics;
pub use queue::PointsQueue;
pub use streaks::WeeklyActivityReport;
