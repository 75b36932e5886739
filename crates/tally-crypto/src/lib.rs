//! # Tally Cryptography
//!
//! BLAKE3 helpers and the Merkle commitment published for every season
//! snapshot. Claimants receive a `MerkleProof` for their allocation leaf and
//! anyone holding the root can check it offline.

pub mod hash;
pub mod merkle;

pub use hash::*;
pub use merkle::{allocation_leaf, verify, MerkleProof, MerkleTree, EMPTY_ROOT};
