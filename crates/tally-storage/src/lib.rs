//! # Tally Storage
//!
//! The narrow persistence interface the engine is written against, plus an
//! in-memory implementation used by tests and the operator CLI.
//!
//! ## Guarantees every backend must provide
//!
//! - `append_event` assigns strictly increasing ids and is idempotent per
//!   `(user_id, dedupe_key)`
//! - `append_and_apply` commits the event and its score row together, and
//!   applies rows in event id order
//! - `update_score` / `update_flag` are atomic read-modify-write per row
//! - `transition_season` is a conditional update on the current status and
//!   refuses a second `active` season
//! - seasons, snapshots, referral links, inbound edges and decay adjustments
//!   are inserted under unique constraints

pub mod error;
pub mod memory;
pub mod repository;

pub use error::*;
pub use memory::MemoryRepository;
pub use repository::*;
