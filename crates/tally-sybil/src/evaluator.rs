//! Anti-sybil evaluator

use crate::behavioral::behavior_signals;
use crate::clustering::find_clusters;
use crate::hygiene::{wallet_hygiene, HygieneSignal};
use crate::inspector::ChainInspector;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tally_core::batch::{BatchReport, JobKind, JobLocks};
use tally_core::clock::Clock;
use tally_core::config::EngineConfig;
use tally_core::error::{Result, TallyError};
use tally_core::types::{AntiSybilFlag, Caller, Season, UserId, WalletAddress};
use tally_storage::{EventQuery, Repository};
use tracing::{debug, info, warn};

/// Job key for passes that span every season
const ALL_SEASONS: Season = 0;

/// Flag set by the clustering batch
pub const FUNDING_CLUSTER: &str = "funding_cluster";

/// Clamp to [0, 1] at 1e-6 resolution so stacked steps land on band edges
fn round_risk(risk: f64) -> f64 {
    ((risk * 1e6).round() / 1e6).clamp(0.0, 1.0)
}

/// Manual review verdicts
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewDecision {
    Approve,
    Reject,
    Flag,
}

/// Effect of a detection pass on one wallet
#[derive(Clone, Debug, PartialEq)]
pub enum RaiseOutcome {
    /// New signals were added
    Raised {
        previous_risk: f64,
        flag: AntiSybilFlag,
    },
    /// Every signal was already present
    Unchanged(AntiSybilFlag),
    /// Manually reviewed; left alone
    Reviewed(AntiSybilFlag),
}

impl RaiseOutcome {
    pub fn flag(&self) -> &AntiSybilFlag {
        match self {
            RaiseOutcome::Raised { flag, .. }
            | RaiseOutcome::Unchanged(flag)
            | RaiseOutcome::Reviewed(flag) => flag,
        }
    }
}

/// Composite wallet verdict
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WalletCheck {
    pub wallet_address: WalletAddress,
    pub is_sybil: bool,
    pub risk_score: f64,
    pub multiplier: f64,
    pub flags: BTreeSet<String>,
    pub cluster_id: Option<String>,
    pub reviewed: bool,
}

/// Outcome of a clustering pass
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusteringReport {
    pub batch: BatchReport,
    pub clusters: usize,
}

/// Anti-sybil evaluator
pub struct SybilEvaluator {
    repo: Arc<dyn Repository>,
    inspector: Arc<dyn ChainInspector>,
    config: Arc<EngineConfig>,
    clock: Arc<dyn Clock>,
    jobs: JobLocks,
}

impl SybilEvaluator {
    pub fn new(
        repo: Arc<dyn Repository>,
        inspector: Arc<dyn ChainInspector>,
        config: Arc<EngineConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repo,
            inspector,
            config,
            clock,
            jobs: JobLocks::new(),
        }
    }

    pub fn jobs(&self) -> &JobLocks {
        &self.jobs
    }

    /// Score multiplier for a risk value
    pub fn multiplier(&self, risk: f64) -> f64 {
        self.config.sybil.multiplier_for(risk)
    }

    /// Add any signals the wallet does not carry yet. Never lowers risk and
    /// never touches a reviewed wallet.
    pub fn raise_risk(
        &self,
        wallet: &WalletAddress,
        signals: &[HygieneSignal],
        cluster_id: Option<&str>,
    ) -> Result<RaiseOutcome> {
        let now = self.clock.now();
        let mut previous = None;
        let mut reviewed = false;

        let flag = self.repo.update_flag(wallet, &mut |row| {
            let flag = row.get_or_insert_with(|| AntiSybilFlag::new(wallet.clone(), now));
            if flag.reviewed {
                reviewed = true;
                return;
            }

            let before = flag.risk_score;
            let mut changed = false;
            for signal in signals {
                if flag.flags.insert(signal.flag.clone()) {
                    flag.risk_score = round_risk(flag.risk_score + signal.increment);
                    changed = true;
                }
            }
            if let Some(id) = cluster_id {
                if flag.cluster_id.as_deref() != Some(id) {
                    flag.cluster_id = Some(id.to_string());
                    changed = true;
                }
            }
            if changed {
                flag.updated_at = now;
                previous = Some(before);
            }
        })?;
        let flag = flag.ok_or_else(|| {
            TallyError::StorageUnavailable(format!("flag write for {wallet} was lost"))
        })?;

        if reviewed {
            return Ok(RaiseOutcome::Reviewed(flag));
        }
        let Some(previous_risk) = previous else {
            return Ok(RaiseOutcome::Unchanged(flag));
        };

        if flag.risk_score >= self.config.sybil.sybil_threshold
            && previous_risk < self.config.sybil.sybil_threshold
        {
            warn!(
                wallet = %wallet,
                risk = flag.risk_score,
                flags = ?flag.flags,
                "Wallet crossed sybil threshold"
            );
        }
        self.propagate_multiplier(wallet, flag.risk_score)?;

        Ok(RaiseOutcome::Raised {
            previous_risk,
            flag,
        })
    }

    /// Push the wallet's multiplier to every score row of its users in
    /// seasons without a snapshot; returns the number of rows touched
    pub fn propagate_multiplier(&self, wallet: &WalletAddress, risk: f64) -> Result<usize> {
        let multiplier = self.multiplier(risk);
        let mut touched = 0;

        for user_id in self.repo.users_for_wallet(wallet)? {
            for score in self.repo.user_scores(&user_id)? {
                if self.repo.get_snapshot(score.season)?.is_some() {
                    continue;
                }
                self.repo.update_score(&user_id, score.season, &mut |row| {
                    if let Some(score) = row {
                        score.sybil_multiplier = multiplier;
                        score.recompute_total();
                    }
                })?;
                touched += 1;
            }
        }

        debug!(wallet = %wallet, multiplier, rows = touched, "Multiplier propagated");
        Ok(touched)
    }

    /// Wallet hygiene for a single wallet
    pub async fn run_wallet_checks(&self, wallet: &WalletAddress) -> Result<RaiseOutcome> {
        let signals = wallet_hygiene(self.inspector.as_ref(), wallet, &self.config.sybil).await;
        self.raise_risk(wallet, &signals, None)
    }

    /// Wallet hygiene for every registered wallet
    pub async fn run_wallet_checks_batch(&self) -> Result<BatchReport> {
        let _permit = self.jobs.try_acquire(JobKind::WalletChecks, ALL_SEASONS)?;
        let wallets = self.registered_wallets()?;
        let mut report = BatchReport::new(JobKind::WalletChecks, ALL_SEASONS, wallets.len());

        for wallet in &wallets {
            match self.run_wallet_checks(wallet).await {
                Ok(RaiseOutcome::Reviewed(_)) => report.skipped += 1,
                Ok(_) => report.processed += 1,
                Err(e) => {
                    warn!(wallet = %wallet, "Wallet check failed: {}", e);
                    report.record_failure(&e);
                }
            }
        }

        info!("{}", report.summary());
        Ok(report)
    }

    /// Timing and diversity checks over a user's recent events, applied to
    /// the user's wallet; `None` when no wallet is bound
    pub fn run_behavioral_checks(&self, user_id: &UserId) -> Result<Option<RaiseOutcome>> {
        let Some(wallet) = self.repo.get_user(user_id)?.and_then(|u| u.wallet_address) else {
            return Ok(None);
        };
        let behavioral = &self.config.sybil.behavioral;
        let query = EventQuery::for_user(user_id.clone()).page(0, behavioral.window);
        let mut events = self.repo.query_events(&query)?;
        events.reverse();

        let signals = behavior_signals(&events, behavioral);
        if !signals.is_empty() {
            debug!(user = %user_id, wallet = %wallet, ?signals, "Behavioral signals");
        }
        self.raise_risk(&wallet, &signals, None).map(Some)
    }

    /// Behavioral checks for every user with a wallet
    pub fn run_behavioral_batch(&self) -> Result<BatchReport> {
        let _permit = self.jobs.try_acquire(JobKind::Behavioral, ALL_SEASONS)?;
        let users: Vec<UserId> = self
            .repo
            .list_users()?
            .into_iter()
            .filter(|u| u.wallet_address.is_some())
            .map(|u| u.user_id)
            .collect();
        let mut report = BatchReport::new(JobKind::Behavioral, ALL_SEASONS, users.len());

        for user_id in &users {
            match self.run_behavioral_checks(user_id) {
                Ok(Some(RaiseOutcome::Reviewed(_))) => report.skipped += 1,
                Ok(_) => report.processed += 1,
                Err(e) => {
                    warn!(user = %user_id, "Behavioral check failed: {}", e);
                    report.record_failure(&e);
                }
            }
        }

        info!("{}", report.summary());
        Ok(report)
    }

    /// Group registered wallets by funding source and bump clustered ones
    pub async fn run_clustering(&self) -> Result<ClusteringReport> {
        let _permit = self.jobs.try_acquire(JobKind::Clustering, ALL_SEASONS)?;
        let wallets = self.registered_wallets()?;

        let mut funding = Vec::with_capacity(wallets.len());
        for wallet in wallets {
            let funder = match self.inspector.first_funder(&wallet).await {
                Ok(funder) => funder,
                Err(e) => {
                    debug!(wallet = %wallet, "Funding source unavailable: {}", e);
                    None
                }
            };
            funding.push((wallet, funder));
        }

        let clusters = find_clusters(&funding, self.config.sybil.min_cluster_size);
        let mut report = ClusteringReport {
            batch: BatchReport::new(JobKind::Clustering, ALL_SEASONS, funding.len()),
            clusters: clusters.len(),
        };
        let clustered: usize = clusters.iter().map(|c| c.members.len()).sum();
        report.batch.processed = funding.len() - clustered;

        for cluster in &clusters {
            let signals = self.cluster_signals(cluster.members.len());
            if signals.is_empty() {
                report.batch.processed += cluster.members.len();
                continue;
            }
            for member in &cluster.members {
                match self.raise_risk(member, &signals, Some(&cluster.cluster_id)) {
                    Ok(RaiseOutcome::Reviewed(_)) => report.batch.skipped += 1,
                    Ok(_) => report.batch.processed += 1,
                    Err(e) => {
                        warn!(wallet = %member, "Cluster flag failed: {}", e);
                        report.batch.record_failure(&e);
                    }
                }
            }
        }

        info!(clusters = report.clusters, "{}", report.batch.summary());
        Ok(report)
    }

    /// One signal per size tier reached. The base tier carries
    /// `funding_cluster`; larger tiers add `funding_cluster_<size>` with the
    /// step over the tier below, so a grown cluster tops members up.
    fn cluster_signals(&self, size: usize) -> Vec<HygieneSignal> {
        self.config
            .sybil
            .cluster_tiers(size)
            .into_iter()
            .enumerate()
            .map(|(i, (min_size, step))| HygieneSignal {
                flag: if i == 0 {
                    FUNDING_CLUSTER.to_string()
                } else {
                    format!("{FUNDING_CLUSTER}_{min_size}")
                },
                increment: step,
            })
            .collect()
    }

    /// Set a reviewed risk; the only way risk goes down
    pub fn review(
        &self,
        caller: &Caller,
        wallet: &WalletAddress,
        decision: ReviewDecision,
    ) -> Result<AntiSybilFlag> {
        caller.require_admin()?;
        let risk = match decision {
            ReviewDecision::Approve => self.config.sybil.approve_score,
            ReviewDecision::Reject => self.config.sybil.reject_score,
            ReviewDecision::Flag => self.config.sybil.flag_score,
        };
        let now = self.clock.now();

        let flag = self
            .repo
            .update_flag(wallet, &mut |row| {
                let flag = row.get_or_insert_with(|| AntiSybilFlag::new(wallet.clone(), now));
                flag.risk_score = risk;
                flag.reviewed = true;
                flag.reviewed_by = Some(caller.id.clone());
                flag.updated_at = now;
            })?
            .ok_or_else(|| TallyError::StorageUnavailable(format!("review of {wallet} was lost")))?;

        info!(wallet = %wallet, reviewer = %caller.id, ?decision, risk, "Wallet reviewed");
        self.propagate_multiplier(wallet, risk)?;
        Ok(flag)
    }

    /// Return a wallet to automatic evaluation, keeping its current risk
    pub fn unreview(&self, caller: &Caller, wallet: &WalletAddress) -> Result<AntiSybilFlag> {
        caller.require_admin()?;
        let now = self.clock.now();
        let flag = self
            .repo
            .update_flag(wallet, &mut |row| {
                if let Some(flag) = row {
                    flag.reviewed = false;
                    flag.reviewed_by = None;
                    flag.updated_at = now;
                }
            })?
            .ok_or_else(|| TallyError::NotFound(format!("sybil flag for {wallet}")))?;
        info!(wallet = %wallet, reviewer = %caller.id, "Review cleared");
        Ok(flag)
    }

    /// Current verdict for a wallet; unknown wallets are clean
    pub fn check_wallet(&self, wallet: &WalletAddress) -> Result<WalletCheck> {
        let flag = self.repo.get_flag(wallet)?;
        let risk = flag.as_ref().map_or(0.0, |f| f.risk_score);
        Ok(WalletCheck {
            wallet_address: wallet.clone(),
            is_sybil: risk >= self.config.sybil.sybil_threshold,
            risk_score: risk,
            multiplier: self.multiplier(risk),
            flags: flag.as_ref().map(|f| f.flags.clone()).unwrap_or_default(),
            cluster_id: flag.as_ref().and_then(|f| f.cluster_id.clone()),
            reviewed: flag.as_ref().is_some_and(|f| f.reviewed),
        })
    }

    fn registered_wallets(&self) -> Result<Vec<WalletAddress>> {
        let mut wallets: Vec<WalletAddress> = self
            .repo
            .list_users()?
            .into_iter()
            .filter_map(|u| u.wallet_address)
            .collect();
        wallets.sort();
        wallets.dedup();
        Ok(wallets)
    }
}
