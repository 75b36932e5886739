//! Allocation snapshots
//!
//! Turns a frozen season's scores into wallet allocations, commits them into
//! a Merkle tree and serves per-wallet proofs.

use crate::lifecycle::SeasonController;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tally_core::clock::Clock;
use tally_core::config::EngineConfig;
use tally_core::error::{Result, TallyError};
use tally_core::math::{pro_rata, score_units};
use tally_core::types::{Allocation, Caller, Season, SeasonSnapshot, SeasonStatus, WalletAddress};
use tally_crypto::{allocation_leaf, MerkleProof, MerkleTree, EMPTY_ROOT};
use tally_storage::{Repository, StorageError};
use tracing::{debug, error, info, warn};

/// Claim data for one wallet
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserProof {
    pub eligible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<u128>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof: Option<MerkleProof>,
}

impl UserProof {
    fn ineligible() -> Self {
        Self {
            eligible: false,
            amount: None,
            index: None,
            proof: None,
        }
    }
}

/// Per-wallet totals before allocation
#[derive(Default)]
struct WalletTotal {
    score: f64,
    units: u128,
}

/// Builds allocation snapshots from a season's contribution scores
pub fn compute_snapshot(
    season: Season,
    pool_size: u128,
    wallet_scores: impl IntoIterator<Item = (WalletAddress, f64)>,
    precision: u64,
    generated_at: chrono::DateTime<chrono::Utc>,
) -> Result<SeasonSnapshot> {
    let mut totals: BTreeMap<WalletAddress, WalletTotal> = BTreeMap::new();
    for (wallet, score) in wallet_scores {
        let units = score_units(score, precision);
        if units == 0 {
            continue;
        }
        let total = totals.entry(wallet).or_default();
        total.score += score;
        total.units = total
            .units
            .checked_add(units)
            .ok_or_else(|| TallyError::Validation("score units overflow".into()))?;
    }

    let total_units = totals
        .values()
        .try_fold(0u128, |acc, t| acc.checked_add(t.units))
        .ok_or_else(|| TallyError::Validation("score units overflow".into()))?;

    let mut allocations = Vec::with_capacity(totals.len());
    let mut allocated = 0u128;
    if total_units > 0 {
        for (wallet, total) in totals {
            let amount = pro_rata(total.units, pool_size, total_units)?;
            if amount == 0 {
                continue;
            }
            allocated += amount;
            allocations.push(Allocation {
                wallet_address: wallet,
                total_score: total.score,
                share_pct: total.units as f64 / total_units as f64,
                allocation_amount: amount,
                merkle_index: allocations.len() as u32,
            });
        }
    }

    let merkle_root = if allocations.is_empty() {
        EMPTY_ROOT
    } else {
        tree_for(&allocations).root()
    };

    Ok(SeasonSnapshot {
        season,
        pool_size,
        merkle_root,
        total_score_units: total_units,
        allocated,
        dust: pool_size - allocated,
        allocations,
        generated_at,
    })
}

fn tree_for(allocations: &[Allocation]) -> MerkleTree {
    MerkleTree::build(
        allocations
            .iter()
            .map(|a| allocation_leaf(&a.wallet_address, a.allocation_amount))
            .collect(),
    )
}

/// Everything but the generation time
fn same_allocation(a: &SeasonSnapshot, b: &SeasonSnapshot) -> bool {
    a.season == b.season
        && a.pool_size == b.pool_size
        && a.merkle_root == b.merkle_root
        && a.total_score_units == b.total_score_units
        && a.allocations == b.allocations
}

/// Claim data for `wallet` from a published snapshot
pub fn proof_for(snapshot: &SeasonSnapshot, wallet: &WalletAddress) -> UserProof {
    let Some(allocation) = snapshot.allocation_for(wallet) else {
        return UserProof::ineligible();
    };
    let proof = tree_for(&snapshot.allocations).proof(allocation.merkle_index as usize);
    UserProof {
        eligible: true,
        amount: Some(allocation.allocation_amount),
        index: Some(allocation.merkle_index),
        proof,
    }
}

/// Recompute the root from a claim
pub fn verify(root: &[u8; 32], wallet: &WalletAddress, amount: u128, proof: &MerkleProof) -> bool {
    tally_crypto::verify(root, &allocation_leaf(wallet, amount), proof)
}

pub struct SnapshotGenerator {
    repo: Arc<dyn Repository>,
    seasons: Arc<SeasonController>,
    config: Arc<EngineConfig>,
    clock: Arc<dyn Clock>,
}

impl SnapshotGenerator {
    pub fn new(
        repo: Arc<dyn Repository>,
        seasons: Arc<SeasonController>,
        config: Arc<EngineConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repo,
            seasons,
            config,
            clock,
        }
    }

    /// Freeze (if still active), allocate `pool_size` and store the result.
    /// On failure an automatic freeze is undone.
    pub fn generate_snapshot(
        &self,
        caller: &Caller,
        season: Season,
        pool_size: u128,
    ) -> Result<SeasonSnapshot> {
        caller.require_admin()?;
        let row = self.seasons.get(season)?;
        let auto_frozen = match row.status {
            SeasonStatus::Active => {
                self.seasons.freeze_active(season)?;
                info!(season, "Season frozen for snapshot");
                true
            }
            SeasonStatus::Frozen => false,
            from => {
                return Err(TallyError::InvalidTransition {
                    season,
                    from,
                    action: "snapshot",
                })
            }
        };

        match self.build_and_store(season, pool_size) {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                warn!(season, "Snapshot failed: {}", e);
                if !auto_frozen {
                    return Err(e);
                }
                match self.seasons.rollback_freeze(season) {
                    Ok(_) => Err(e),
                    Err(rollback) => {
                        error!(season, "Could not roll back automatic freeze: {}", rollback);
                        Err(TallyError::FrozenWithoutSnapshot {
                            season,
                            cause: e.to_string(),
                            rollback: rollback.to_string(),
                        })
                    }
                }
            }
        }
    }

    fn build_and_store(&self, season: Season, pool_size: u128) -> Result<SeasonSnapshot> {
        let mut wallet_scores = Vec::new();
        for score in self.repo.season_scores(season)? {
            if score.total_score <= 0.0 {
                continue;
            }
            match self.repo.get_user(&score.user_id)?.and_then(|u| u.wallet_address) {
                Some(wallet) => wallet_scores.push((wallet, score.total_score)),
                None => debug!(user = %score.user_id, "No wallet bound, left out of snapshot"),
            }
        }

        let snapshot = compute_snapshot(
            season,
            pool_size,
            wallet_scores,
            self.config.scoring.score_precision,
            self.clock.now(),
        )?;

        match self.repo.insert_snapshot(snapshot.clone()) {
            Ok(()) => {
                info!(
                    season,
                    root = %snapshot.root_hex(),
                    wallets = snapshot.allocations.len(),
                    allocated = %snapshot.allocated,
                    dust = %snapshot.dust,
                    "Snapshot generated"
                );
                Ok(snapshot)
            }
            Err(StorageError::Conflict(_)) => {
                let stored = self
                    .repo
                    .get_snapshot(season)?
                    .ok_or(TallyError::SnapshotConflict { season })?;
                if same_allocation(&stored, &snapshot) {
                    debug!(season, "Snapshot unchanged, returning stored copy");
                    Ok(stored)
                } else {
                    Err(TallyError::SnapshotConflict { season })
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_snapshot(&self, season: Season) -> Result<SeasonSnapshot> {
        self.repo
            .get_snapshot(season)?
            .ok_or_else(|| TallyError::NotFound(format!("snapshot for season {season}")))
    }

    pub fn get_user_proof(&self, wallet: &WalletAddress, season: Season) -> Result<UserProof> {
        Ok(proof_for(&self.get_snapshot(season)?, wallet))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;
    use tally_crypto::hash_node;

    fn wallet(n: u8) -> WalletAddress {
        WalletAddress::parse(&format!("0x{}", hex::encode([n; 20]))).unwrap()
    }

    fn at() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 9, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_two_wallet_split() {
        let a = wallet(0xaa);
        let b = wallet(0xbb);
        let snap = compute_snapshot(1, 1_000_000, [(b.clone(), 700.0), (a.clone(), 300.0)], 1_000_000, at())
            .unwrap();

        assert_eq!(snap.allocations.len(), 2);
        assert_eq!(snap.allocations[0].wallet_address, a);
        assert_eq!(snap.allocations[0].allocation_amount, 300_000);
        assert_eq!(snap.allocations[1].allocation_amount, 700_000);
        assert_eq!(snap.dust, 0);
        assert!((snap.allocations[0].share_pct - 0.3).abs() < 1e-12);
        assert_eq!(
            snap.merkle_root,
            hash_node(&allocation_leaf(&a, 300_000), &allocation_leaf(&b, 700_000))
        );
    }

    #[test]
    fn test_shared_wallet_merges() {
        let w = wallet(1);
        let snap = compute_snapshot(1, 90, [(w.clone(), 1.0), (wallet(2), 1.0), (w, 1.0)], 1_000_000, at())
            .unwrap();
        assert_eq!(snap.allocations.len(), 2);
        assert_eq!(snap.allocations[0].allocation_amount, 60);
        assert_eq!(snap.allocations[0].total_score, 2.0);
    }

    #[test]
    fn test_zero_amounts_dropped() {
        let snap = compute_snapshot(1, 1, [(wallet(1), 1.0), (wallet(2), 1.0), (wallet(3), 1.0)], 1_000_000, at())
            .unwrap();
        assert!(snap.allocations.is_empty());
        assert_eq!(snap.merkle_root, EMPTY_ROOT);
        assert_eq!(snap.dust, 1);
    }

    #[test]
    fn test_empty_season() {
        let snap = compute_snapshot(1, 500, Vec::new(), 1_000_000, at()).unwrap();
        assert_eq!(snap.total_score_units, 0);
        assert_eq!(snap.dust, 500);
        assert_eq!(snap.merkle_root, EMPTY_ROOT);
    }

    #[test]
    fn test_verify_rejects_tampered_amount() {
        let entries: Vec<_> = (1..=5u8).map(|n| (wallet(n), n as f64 * 10.0)).collect();
        let snap = compute_snapshot(1, 1_000_000, entries, 1_000_000, at()).unwrap();
        let tree = tree_for(&snap.allocations);
        for alloc in &snap.allocations {
            let proof = tree.proof(alloc.merkle_index as usize).unwrap();
            assert!(verify(&snap.merkle_root, &alloc.wallet_address, alloc.allocation_amount, &proof));
            assert!(!verify(&snap.merkle_root, &alloc.wallet_address, alloc.allocation_amount + 1, &proof));
            assert!(!verify(&snap.merkle_root, &alloc.wallet_address, alloc.allocation_amount - 1, &proof));
        }
    }

    proptest! {
        #[test]
        fn prop_allocation_conserves_pool(
            scores in prop::collection::vec(0.01f64..100_000.0, 1..40),
            pool in 0u128..=1_000_000_000_000_000_000_000u128,
        ) {
            let entries: Vec<_> = scores
                .iter()
                .enumerate()
                .map(|(i, s)| (wallet(i as u8), *s))
                .collect();
            let participants = entries.len() as u128;
            let snap = compute_snapshot(1, pool, entries, 1_000_000, at()).unwrap();
            let sum: u128 = snap.allocations.iter().map(|a| a.allocation_amount).sum();
            prop_assert_eq!(sum, snap.allocated);
            prop_assert!(sum <= pool);
            prop_assert!(pool - sum < participants.max(1));
            prop_assert!(snap.allocations.windows(2).all(|w| w[0].wallet_address < w[1].wallet_address));
        }
    }
}
