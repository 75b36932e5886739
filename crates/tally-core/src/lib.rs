//! # Tally Core
//!
//! Shared building blocks for the Tally seasonal points engine:
//! - `types` - participation events, scores, sybil flags, referrals, seasons, allocations
//! - `error` - the `TallyError` taxonomy every crate returns
//! - `config` - the immutable `EngineConfig` injected at construction
//! - `clock` - wall-clock abstraction
//! - `batch` - guards and progress reports for batch passes
//! - `math` - exact fixed-point pool partitioning

pub mod batch;
pub mod clock;
pub mod config;
pub mod error;
pub mod math;
pub mod types;

pub use batch::*;
pub use clock::*;
pub use config::*;
pub use error::*;
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::batch::{BatchReport, JobKind, JobLocks};
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::EngineConfig;
    pub use crate::error::{Result, TallyError};
    pub use crate::types::*;
}
