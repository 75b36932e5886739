//! Integration tests for the Tally season flow
//!
//! These tests drive a season from seeding through scoring, snapshot,
//! claims and completion against the in-memory store.

use chrono::{Duration, TimeZone, Utc};
use std::sync::Arc;
use tally_core::clock::{Clock, ManualClock};
use tally_core::config::EngineConfig;
use tally_core::error::TallyError;
use tally_core::types::{Caller, EventType, SeasonStatus, UserId, UserRecord, WalletAddress};
use tally_crypto::{allocation_leaf, hash_node};
use tally_scoring::{EventRequest, RecordOutcome, ScoringEngine};
use tally_season::{verify, SeasonController, SnapshotGenerator};
use tally_storage::{MemoryRepository, Repository};
use tally_sybil::{ReviewDecision, StaticInspector, SybilEvaluator};

struct World {
    repo: Arc<MemoryRepository>,
    clock: Arc<ManualClock>,
    engine: ScoringEngine,
    seasons: Arc<SeasonController>,
    snapshots: SnapshotGenerator,
    evaluator: SybilEvaluator,
    admin: Caller,
}

fn world() -> World {
    let repo = Arc::new(MemoryRepository::new());
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 7, 6, 10, 0, 0).unwrap(),
    ));
    let config = Arc::new(EngineConfig::default());

    let engine = ScoringEngine::new(repo.clone(), config.clone(), clock.clone()).unwrap();
    let seasons = Arc::new(SeasonController::new(repo.clone(), config.clone(), clock.clone()));
    let snapshots =
        SnapshotGenerator::new(repo.clone(), seasons.clone(), config.clone(), clock.clone());
    let evaluator = SybilEvaluator::new(
        repo.clone(),
        Arc::new(StaticInspector::new()),
        config,
        clock.clone(),
    );

    World {
        repo,
        clock,
        engine,
        seasons,
        snapshots,
        evaluator,
        admin: Caller::admin("ops"),
    }
}

fn wallet(byte: u8) -> WalletAddress {
    WalletAddress::parse(&format!("0x{}", hex::encode([byte; 20]))).unwrap()
}

impl World {
    fn start_season(&self) {
        self.seasons.create_season(&self.admin, 1, None).unwrap();
        self.seasons.activate(&self.admin, 1, Some(1_000_000), None).unwrap();
    }

    fn register(&self, user: &str, wallet: &WalletAddress) {
        self.repo
            .upsert_user(UserRecord {
                user_id: UserId::new(user),
                wallet_address: Some(wallet.clone()),
                created_at: self.clock.now(),
            })
            .unwrap();
    }

    fn award(&self, user: &str, points: i64) -> RecordOutcome {
        self.engine
            .try_record(EventRequest::new(UserId::new(user), EventType::FindingAccepted).points(points))
            .unwrap()
    }
}

mod allocation_tests {
    use super::*;

    #[test]
    fn test_three_hundred_seven_hundred_split() {
        let w = world();
        w.start_season();
        let a = wallet(0x0a);
        let b = wallet(0x0b);
        w.register("alice", &a);
        w.register("bob", &b);
        w.award("alice", 300);
        w.award("bob", 700);

        let snap = w.snapshots.generate_snapshot(&w.admin, 1, 1_000_000).unwrap();
        assert_eq!(w.seasons.get(1).unwrap().status, SeasonStatus::Frozen);
        assert_eq!(snap.allocations.len(), 2);
        assert_eq!(snap.allocations[0].wallet_address, a);
        assert_eq!(snap.allocations[0].allocation_amount, 300_000);
        assert_eq!(snap.allocations[1].allocation_amount, 700_000);
        assert_eq!(snap.dust, 0);
        assert_eq!(
            snap.merkle_root,
            hash_node(&allocation_leaf(&a, 300_000), &allocation_leaf(&b, 700_000))
        );

        for (addr, amount) in [(&a, 300_000u128), (&b, 700_000)] {
            let claim = w.snapshots.get_user_proof(addr, 1).unwrap();
            assert!(claim.eligible);
            assert_eq!(claim.amount, Some(amount));
            let proof = claim.proof.unwrap();
            assert!(verify(&snap.merkle_root, addr, amount, &proof));
            assert!(!verify(&snap.merkle_root, addr, amount + 1, &proof));
        }

        let stranger = w.snapshots.get_user_proof(&wallet(0x0c), 1).unwrap();
        assert!(!stranger.eligible);
        assert_eq!(
            serde_json::to_value(&stranger).unwrap(),
            serde_json::json!({ "eligible": false })
        );
    }

    #[test]
    fn test_wallet_without_score_rows_is_excluded() {
        let w = world();
        w.start_season();
        w.register("alice", &wallet(1));
        w.award("alice", 500);
        // Scored but never linked a wallet
        w.award("ghost", 500);

        let snap = w.snapshots.generate_snapshot(&w.admin, 1, 1_000).unwrap();
        assert_eq!(snap.allocations.len(), 1);
        assert_eq!(snap.allocations[0].allocation_amount, 1_000);
    }

    #[test]
    fn test_rejected_wallet_gets_nothing() {
        let w = world();
        w.start_season();
        let honest = wallet(1);
        let sybil = wallet(2);
        w.register("alice", &honest);
        w.register("mallory", &sybil);
        w.award("alice", 100);
        w.award("mallory", 900);

        w.evaluator
            .review(&w.admin, &sybil, ReviewDecision::Reject)
            .unwrap();
        let mallory = w.repo.get_score(&UserId::new("mallory"), 1).unwrap().unwrap();
        assert_eq!(mallory.total_score, 0.0);
        assert_eq!(mallory.security_points, 900);

        let snap = w.snapshots.generate_snapshot(&w.admin, 1, 10_000).unwrap();
        assert_eq!(snap.allocations.len(), 1);
        assert_eq!(snap.allocations[0].wallet_address, honest);
        assert_eq!(snap.allocated, 10_000);
    }

    #[test]
    fn test_snapshot_without_season_is_not_found() {
        let w = world();
        assert!(matches!(
            w.snapshots.get_user_proof(&wallet(1), 1),
            Err(TallyError::NotFound(_))
        ));
    }
}

mod lifecycle_tests {
    use super::*;

    #[test]
    fn test_full_season_flow() {
        let w = world();
        w.start_season();
        w.register("alice", &wallet(1));
        assert!(matches!(w.award("alice", 100), RecordOutcome::Recorded { .. }));

        w.clock.advance(Duration::days(30));
        let snap = w.snapshots.generate_snapshot(&w.admin, 1, 5_000).unwrap();

        // Scoring is closed once frozen
        assert!(matches!(w.award("alice", 100), RecordOutcome::AuditOnly { .. }));
        let score = w.repo.get_score(&UserId::new("alice"), 1).unwrap().unwrap();
        assert_eq!(score.security_points, 100);

        // Regenerating the same frozen season returns the stored snapshot
        let again = w.snapshots.generate_snapshot(&w.admin, 1, 5_000).unwrap();
        assert_eq!(again, snap);
        // A different pool cannot replace it
        assert_eq!(
            w.snapshots.generate_snapshot(&w.admin, 1, 6_000),
            Err(TallyError::SnapshotConflict { season: 1 })
        );

        w.seasons.open_claim_window(&w.admin, 1).unwrap();
        assert!(matches!(
            w.snapshots.generate_snapshot(&w.admin, 1, 5_000),
            Err(TallyError::InvalidTransition { from: SeasonStatus::Claiming, .. })
        ));

        let done = w.seasons.complete(&w.admin, 1).unwrap();
        assert_eq!(done.status, SeasonStatus::Completed);
        let next = w.seasons.get(2).unwrap();
        assert_eq!(next.status, SeasonStatus::Pending);

        // Seeding the next season is idempotent
        w.seasons.create_season(&w.admin, 2, None).unwrap();
        assert_eq!(w.seasons.list().unwrap().len(), 2);

        w.seasons.activate(&w.admin, 2, None, None).unwrap();
        assert!(matches!(
            w.award("alice", 10),
            RecordOutcome::Recorded { season: 2, .. }
        ));
    }

    #[test]
    fn test_failed_snapshot_rolls_back_freeze() {
        let w = world();
        w.start_season();
        w.register("alice", &wallet(1));
        w.award("alice", 100);

        w.repo.fail_next("insert_snapshot", 1);
        let err = w.snapshots.generate_snapshot(&w.admin, 1, 1_000).unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(w.seasons.get(1).unwrap().status, SeasonStatus::Active);

        w.snapshots.generate_snapshot(&w.admin, 1, 1_000).unwrap();
        assert_eq!(w.seasons.get(1).unwrap().status, SeasonStatus::Frozen);
    }

    #[test]
    fn test_failed_rollback_is_reported() {
        let w = world();
        w.start_season();
        w.register("alice", &wallet(1));
        w.award("alice", 100);

        // The freeze goes through; the snapshot write and the rollback fail
        w.repo.fail_next("insert_snapshot", 1);
        w.repo.fail_after("transition_season", 1, 1);
        let err = w.snapshots.generate_snapshot(&w.admin, 1, 1_000).unwrap_err();
        assert!(matches!(err, TallyError::FrozenWithoutSnapshot { season: 1, .. }));
        assert!(err.is_recoverable());
        assert_eq!(w.seasons.get(1).unwrap().status, SeasonStatus::Frozen);

        // Retrying finishes the snapshot on the frozen season
        let snap = w.snapshots.generate_snapshot(&w.admin, 1, 1_000).unwrap();
        assert_eq!(snap.allocated, 1_000);
    }

    #[test]
    fn test_snapshot_requires_admin() {
        let w = world();
        w.start_season();
        assert!(matches!(
            w.snapshots.generate_snapshot(&Caller::user("alice"), 1, 1_000),
            Err(TallyError::Authorization(_))
        ));
        assert_eq!(w.seasons.get(1).unwrap().status, SeasonStatus::Active);
    }

    #[test]
    fn test_pending_season_cannot_snapshot() {
        let w = world();
        w.seasons.create_season(&w.admin, 1, None).unwrap();
        assert!(matches!(
            w.snapshots.generate_snapshot(&w.admin, 1, 1_000),
            Err(TallyError::InvalidTransition { from: SeasonStatus::Pending, .. })
        ));
    }
}
