//! Merkle commitment over a season's allocation list
//!
//! Leaves are `BLAKE3(0x00 || address || amount_be16)` where `address` is
//! the lowercase `0x`-prefixed ASCII form. Interior nodes are
//! `BLAKE3(0x01 || left || right)`. When a level has an odd width its last
//! node is carried up unchanged, so a proof does not always contain one
//! sibling per level. Proofs therefore carry the leaf count and the
//! verifier replays the level widths.

use crate::hash::{hash_concat, hash_node, LEAF_PREFIX};
use serde::{Deserialize, Serialize};
use tally_core::types::{hex32, WalletAddress};

/// Root of an empty allocation set
pub const EMPTY_ROOT: [u8; 32] = [0u8; 32];

/// Canonical allocation leaf
pub fn allocation_leaf(wallet: &WalletAddress, amount: u128) -> [u8; 32] {
    hash_concat(&[
        &[LEAF_PREFIX],
        wallet.as_str().as_bytes(),
        &amount.to_be_bytes(),
    ])
}

/// Inclusion proof for one leaf
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf_index: u32,
    pub leaf_count: u32,
    #[serde(with = "hex32::vec")]
    pub siblings: Vec<[u8; 32]>,
}

/// Fully materialized tree, levels stored bottom-up
#[derive(Clone, Debug)]
pub struct MerkleTree {
    levels: Vec<Vec<[u8; 32]>>,
}

impl MerkleTree {
    /// Build from leaves in their final (already sorted) order
    pub fn build(leaves: Vec<[u8; 32]>) -> Self {
        let mut levels = vec![leaves];

        while levels.last().map(|l| l.len() > 1).unwrap_or(false) {
            let current = &levels[levels.len() - 1];
            let next: Vec<[u8; 32]> = current
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => hash_node(left, right),
                    _ => pair[0],
                })
                .collect();
            levels.push(next);
        }

        Self { levels }
    }

    pub fn root(&self) -> [u8; 32] {
        self.levels
            .last()
            .and_then(|l| l.first())
            .copied()
            .unwrap_or(EMPTY_ROOT)
    }

    pub fn leaf_count(&self) -> usize {
        self.levels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn leaf(&self, index: usize) -> Option<[u8; 32]> {
        self.levels.first().and_then(|l| l.get(index)).copied()
    }

    /// Sibling path for the leaf at `index`
    pub fn proof(&self, index: usize) -> Option<MerkleProof> {
        let leaf_count = self.leaf_count();
        if index >= leaf_count {
            return None;
        }

        let mut siblings = Vec::new();
        let mut idx = index;
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling = if idx % 2 == 1 {
                Some(idx - 1)
            } else if idx + 1 < level.len() {
                Some(idx + 1)
            } else {
                None
            };
            if let Some(s) = sibling {
                siblings.push(level[s]);
            }
            idx /= 2;
        }

        Some(MerkleProof {
            leaf_index: index as u32,
            leaf_count: leaf_count as u32,
            siblings,
        })
    }
}

/// Re-derive the root from `leaf` and `proof` and compare
pub fn verify(root: &[u8; 32], leaf: &[u8; 32], proof: &MerkleProof) -> bool {
    let mut width = proof.leaf_count as usize;
    let mut idx = proof.leaf_index as usize;
    if idx >= width {
        return false;
    }

    let mut siblings = proof.siblings.iter();
    let mut node = *leaf;
    while width > 1 {
        if idx % 2 == 1 {
            match siblings.next() {
                Some(s) => node = hash_node(s, &node),
                None => return false,
            }
        } else if idx + 1 < width {
            match siblings.next() {
                Some(s) => node = hash_node(&node, s),
                None => return false,
            }
        }
        idx /= 2;
        width = width.div_ceil(2);
    }

    siblings.next().is_none() && &node == root
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn wallet(n: u8) -> WalletAddress {
        WalletAddress::parse(&format!("0x{}", hex::encode([n; 20]))).unwrap()
    }

    fn leaves(n: usize) -> Vec<[u8; 32]> {
        (0..n)
            .map(|i| allocation_leaf(&wallet(i as u8), 1_000 + i as u128))
            .collect()
    }

    #[test]
    fn test_empty_tree() {
        let tree = MerkleTree::build(Vec::new());
        assert_eq!(tree.root(), EMPTY_ROOT);
        assert!(tree.proof(0).is_none());
    }

    #[test]
    fn test_single_leaf_root_is_leaf() {
        let leaves = leaves(1);
        let tree = MerkleTree::build(leaves.clone());
        assert_eq!(tree.root(), leaves[0]);

        let proof = tree.proof(0).unwrap();
        assert!(proof.siblings.is_empty());
        assert!(verify(&tree.root(), &leaves[0], &proof));
    }

    #[test]
    fn test_two_leaf_root() {
        let leaves = leaves(2);
        let tree = MerkleTree::build(leaves.clone());
        assert_eq!(tree.root(), hash_node(&leaves[0], &leaves[1]));
    }

    #[test]
    fn test_odd_level_carries_lone_node() {
        let leaves = leaves(3);
        let tree = MerkleTree::build(leaves.clone());
        let expected = hash_node(&hash_node(&leaves[0], &leaves[1]), &leaves[2]);
        assert_eq!(tree.root(), expected);

        // The carried leaf has a single sibling: the left subtree
        let proof = tree.proof(2).unwrap();
        assert_eq!(proof.siblings.len(), 1);
        assert!(verify(&tree.root(), &leaves[2], &proof));
    }

    #[test]
    fn test_every_leaf_verifies() {
        for n in 1..=17 {
            let leaves = leaves(n);
            let tree = MerkleTree::build(leaves.clone());
            for (i, leaf) in leaves.iter().enumerate() {
                let proof = tree.proof(i).unwrap();
                assert!(verify(&tree.root(), leaf, &proof), "n={n} i={i}");
            }
        }
    }

    #[test]
    fn test_tampered_amount_fails() {
        let w = wallet(7);
        let tree = MerkleTree::build(vec![
            allocation_leaf(&wallet(1), 10),
            allocation_leaf(&w, 300_000),
            allocation_leaf(&wallet(9), 5),
        ]);
        let proof = tree.proof(1).unwrap();

        assert!(verify(&tree.root(), &allocation_leaf(&w, 300_000), &proof));
        assert!(!verify(&tree.root(), &allocation_leaf(&w, 300_001), &proof));
        assert!(!verify(&tree.root(), &allocation_leaf(&w, 299_999), &proof));
    }

    #[test]
    fn test_malformed_proofs_fail() {
        let leaves = leaves(4);
        let tree = MerkleTree::build(leaves.clone());
        let mut proof = tree.proof(1).unwrap();

        let mut extra = proof.clone();
        extra.siblings.push([0u8; 32]);
        assert!(!verify(&tree.root(), &leaves[1], &extra));

        proof.leaf_index = 9;
        assert!(!verify(&tree.root(), &leaves[1], &proof));
    }

    #[test]
    fn test_proof_json_uses_hex() {
        let tree = MerkleTree::build(leaves(2));
        let proof = tree.proof(0).unwrap();
        let json = serde_json::to_string(&proof).unwrap();
        assert!(json.contains("\"0x"));
        let back: MerkleProof = serde_json::from_str(&json).unwrap();
        assert_eq!(back, proof);
    }

    proptest! {
        #[test]
        fn prop_random_trees_verify(amounts in prop::collection::vec(1u128..u128::MAX, 1..40), pick in any::<prop::sample::Index>()) {
            let leaves: Vec<_> = amounts
                .iter()
                .enumerate()
                .map(|(i, a)| allocation_leaf(&wallet(i as u8), *a))
                .collect();
            let tree = MerkleTree::build(leaves.clone());
            let i = pick.index(leaves.len());
            let proof = tree.proof(i).unwrap();
            prop_assert!(verify(&tree.root(), &leaves[i], &proof));
        }
    }
}
