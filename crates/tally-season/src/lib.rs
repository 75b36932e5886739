//! Tally Season Lifecycle and Allocation
//!
//! - `lifecycle`: the pending → active → frozen → claiming → completed
//!   state machine, all transitions conditional in the store
//! - `snapshot`: pro-rata pool allocation over frozen scores, committed into
//!   a BLAKE3 Merkle tree with per-wallet proofs

pub mod lifecycle;
pub mod snapshot;

pub use lifecycle::SeasonController;
pub use snapshot::{compute_snapshot, proof_for, verify, SnapshotGenerator, UserProof};
