//! Tally Referral Subsystem
//!
//! Referral codes, referrer → referred edges and the bonuses they earn:
//!
//! - **Codes**: one stable `wc-xxxxxx` code per user, derived with BLAKE3
//! - **Qualification**: first qualifying action pays the referrer once, tapered
//!   by how many referrals they already qualified
//! - **Upline bonuses**: a share of each contribution flows up to five levels
//! - **Pyramid detection**: downline shape and quality signals feed the sybil
//!   evaluator

pub mod codes;
pub mod pyramid;
pub mod rate_limit;
pub mod service;

pub use codes::{derive_code, CODE_ALPHABET};
pub use pyramid::{PyramidAction, PyramidReport, PyramidScanReport};
pub use rate_limit::AttemptLimiter;
pub use service::{Qualification, ReferralService, ReferralStats, UplineBonus, UplineEntry};

#[cfg(test)]
pub(crate) mod testing {
    use crate::service::ReferralService;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use tally_core::clock::ManualClock;
    use tally_core::config::EngineConfig;
    use tally_core::types::{
        ContributionScore, SeasonConfig, SeasonStatus, UserId, UserRecord, WalletAddress,
    };
    use tally_scoring::ScoringEngine;
    use tally_storage::{MemoryRepository, Repository};
    use tally_sybil::{StaticInspector, SybilEvaluator};

    pub struct Harness {
        pub repo: Arc<MemoryRepository>,
        pub engine: Arc<ScoringEngine>,
        pub evaluator: Arc<SybilEvaluator>,
        pub referrals: ReferralService,
    }

    impl Harness {
        pub fn new() -> Self {
            let start = Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).unwrap();
            let clock = Arc::new(ManualClock::new(start));
            let config = Arc::new(EngineConfig::default());
            let repo = Arc::new(MemoryRepository::new());

            let mut season = SeasonConfig::pending(1, 5000);
            season.status = SeasonStatus::Active;
            season.start_date = Some(start);
            repo.insert_season(season).unwrap();

            let engine =
                Arc::new(ScoringEngine::new(repo.clone(), config.clone(), clock.clone()).unwrap());
            let evaluator = Arc::new(SybilEvaluator::new(
                repo.clone(),
                Arc::new(StaticInspector::new()),
                config,
                clock,
            ));
            let referrals = ReferralService::new(engine.clone(), evaluator.clone());
            Self {
                repo,
                engine,
                evaluator,
                referrals,
            }
        }

        pub fn wallet(n: u8) -> WalletAddress {
            WalletAddress::parse(&format!("0x{}", hex::encode([n; 20]))).unwrap()
        }

        pub fn register(&self, user: &str, n: u8) -> WalletAddress {
            let wallet = Self::wallet(n);
            self.repo
                .upsert_user(UserRecord {
                    user_id: UserId::new(user),
                    wallet_address: Some(wallet.clone()),
                    created_at: Utc::now(),
                })
                .unwrap();
            wallet
        }

        /// Each user refers the next one
        pub fn chain(&self, users: &[&str]) {
            for pair in users.windows(2) {
                let code = self
                    .referrals
                    .get_or_create_referral_code(&UserId::new(pair[0]))
                    .unwrap()
                    .code;
                self.referrals
                    .apply_referral_code(&UserId::new(pair[1]), &code)
                    .unwrap();
            }
        }

        pub fn score(&self, user: &str) -> ContributionScore {
            self.repo.get_score(&UserId::new(user), 1).unwrap().unwrap()
        }
    }
}
