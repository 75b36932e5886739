//! Pyramid-farming detection
//!
//! Scores a referrer's downline for coordinated abuse. Signals add up to a
//! risk in `[0, 1]`; farming referrers have their wallet risk raised through
//! the sybil evaluator.

use crate::service::ReferralService;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tally_core::batch::{BatchReport, JobKind};
use tally_core::error::Result;
use tally_core::types::{EventType, ParticipationEvent, ReferralEdge, UserId};
use tally_storage::EventQuery;
use tally_sybil::{HygieneSignal, RaiseOutcome};
use tracing::{debug, info, warn};

pub const LARGE_UNQUALIFIED_NETWORK: &str = "large_unqualified_network";
pub const LOW_QUALIFICATION_RATE: &str = "low_qualification_rate";
pub const DOWNLINE_SAME_CLUSTER: &str = "downline_same_cluster";
pub const MASS_REGISTRATION: &str = "mass_registration";
pub const LOW_QUALITY_NETWORK: &str = "low_quality_network";
pub const COPY_PASTE_SUBMISSIONS: &str = "copy_paste_submissions";

/// Sybil flag raised on a farming referrer's wallet
pub const PYRAMID_FARMING: &str = "pyramid_farming";

/// Referrers below this many referrals are not scanned
const SCAN_MIN_REFERRED: u64 = 20;

/// Most recent downline submissions compared for copy-paste
const TITLE_SAMPLE: usize = 50;

const FARMING_RISK: f64 = 0.6;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PyramidAction {
    Allow,
    Warn,
    Suppress,
    Ban,
}

impl PyramidAction {
    pub fn for_risk(risk: f64) -> Self {
        if risk >= 0.8 {
            PyramidAction::Ban
        } else if risk >= 0.6 {
            PyramidAction::Suppress
        } else if risk >= 0.4 {
            PyramidAction::Warn
        } else {
            PyramidAction::Allow
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PyramidReport {
    pub user_id: UserId,
    pub is_farming: bool,
    pub risk_score: f64,
    pub flags: Vec<String>,
    pub downline_count: usize,
    pub qualified_ratio: f64,
    pub action: PyramidAction,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PyramidScanReport {
    pub batch: BatchReport,
    pub flagged: usize,
    pub suppressed: usize,
}

impl ReferralService {
    /// Score one referrer's network
    pub fn detect_pyramid_farming(&self, user_id: &UserId) -> Result<PyramidReport> {
        let direct = self.repo.downline(user_id)?;
        let network = self.network(user_id)?;

        let total = network.len();
        let qualified = network.iter().filter(|e| e.qualified).count();
        let qualified_ratio = if total > 0 {
            qualified as f64 / total as f64
        } else {
            0.0
        };

        let mut flags = Vec::new();
        let mut risk = 0.0;
        let mut signal = |flag: &str, weight: f64| {
            flags.push(flag.to_string());
            risk += weight;
        };

        if total > 100 && qualified_ratio < 0.05 {
            signal(LARGE_UNQUALIFIED_NETWORK, 0.5);
        }
        if total > 50 && qualified_ratio < 0.1 {
            signal(LOW_QUALIFICATION_RATE, 0.3);
        }
        if self.downline_clustered(&direct)? {
            signal(DOWNLINE_SAME_CLUSTER, 0.4);
        }
        if self.registration_burst(&direct) {
            signal(MASS_REGISTRATION, 0.35);
        }

        let members: Vec<UserId> = network.iter().map(|e| e.referred_user_id.clone()).collect();
        let submissions = self.events_of(&members, EventType::FindingSubmitted)?;
        if poor_quality(submissions.len(), self.accepted_count(&members)?) {
            signal(LOW_QUALITY_NETWORK, 0.3);
        }
        if members.len() >= 5 && copy_paste(submissions) {
            signal(COPY_PASTE_SUBMISSIONS, 0.4);
        }

        let risk_score = f64::min(risk, 1.0);
        let report = PyramidReport {
            user_id: user_id.clone(),
            is_farming: risk_score >= FARMING_RISK,
            risk_score,
            flags,
            downline_count: total,
            qualified_ratio,
            action: PyramidAction::for_risk(risk_score),
        };

        if report.is_farming {
            self.suppress(&report)?;
        } else if report.action == PyramidAction::Warn {
            info!(user = %user_id, risk = risk_score, flags = ?report.flags, "Referral network needs review");
        }
        Ok(report)
    }

    /// Scan every referrer with a sizeable downline
    pub fn scan_for_pyramid_farming(&self) -> Result<PyramidScanReport> {
        let _permit = self.jobs.try_acquire(JobKind::PyramidScan, 0)?;

        let mut referrers: Vec<_> = self
            .repo
            .list_links()?
            .into_iter()
            .filter(|l| l.total_referred >= SCAN_MIN_REFERRED)
            .collect();
        referrers.sort_by(|a, b| b.total_referred.cmp(&a.total_referred));

        let mut report = PyramidScanReport {
            batch: BatchReport::new(JobKind::PyramidScan, 0, referrers.len()),
            flagged: 0,
            suppressed: 0,
        };
        for link in &referrers {
            match self.detect_pyramid_farming(&link.user_id) {
                Ok(found) => {
                    report.batch.processed += 1;
                    if found.is_farming {
                        report.flagged += 1;
                    }
                    if matches!(found.action, PyramidAction::Suppress | PyramidAction::Ban) {
                        report.suppressed += 1;
                    }
                }
                Err(e) => {
                    warn!(user = %link.user_id, "Pyramid scan failed: {}", e);
                    report.batch.record_failure(&e);
                }
            }
        }

        info!(
            flagged = report.flagged,
            suppressed = report.suppressed,
            "{}",
            report.batch.summary()
        );
        Ok(report)
    }

    fn suppress(&self, report: &PyramidReport) -> Result<()> {
        let wallet = self
            .repo
            .get_user(&report.user_id)?
            .and_then(|u| u.wallet_address);
        let Some(wallet) = wallet else {
            warn!(user = %report.user_id, risk = report.risk_score, "Pyramid farmer has no wallet to flag");
            return Ok(());
        };

        let signal = [HygieneSignal {
            flag: PYRAMID_FARMING.to_string(),
            increment: report.risk_score,
        }];
        match self.evaluator.raise_risk(&wallet, &signal, None)? {
            RaiseOutcome::Raised { flag, .. } => warn!(
                user = %report.user_id,
                wallet = %wallet,
                risk = flag.risk_score,
                action = ?report.action,
                "Pyramid farming suppressed"
            ),
            RaiseOutcome::Unchanged(_) => debug!(user = %report.user_id, "Pyramid farming already flagged"),
            RaiseOutcome::Reviewed(_) => debug!(user = %report.user_id, "Reviewed wallet left alone"),
        }
        Ok(())
    }

    /// Referral edges below `user_id`, level by level up to the configured depth
    fn network(&self, user_id: &UserId) -> Result<Vec<ReferralEdge>> {
        let max_depth = self.config().referral.max_depth;
        let mut seen = HashSet::from([user_id.clone()]);
        let mut queue = VecDeque::from([(user_id.clone(), 0u32)]);
        let mut edges = Vec::new();

        while let Some((current, depth)) = queue.pop_front() {
            if depth == max_depth {
                continue;
            }
            for edge in self.repo.downline(&current)? {
                if seen.insert(edge.referred_user_id.clone()) {
                    queue.push_back((edge.referred_user_id.clone(), depth + 1));
                    edges.push(edge);
                }
            }
        }
        Ok(edges)
    }

    /// More than half of at least five direct referrals share a funding cluster
    fn downline_clustered(&self, direct: &[ReferralEdge]) -> Result<bool> {
        if direct.len() < 5 {
            return Ok(false);
        }
        let mut per_cluster: HashMap<String, usize> = HashMap::new();
        for edge in direct {
            let Some(wallet) = self
                .repo
                .get_user(&edge.referred_user_id)?
                .and_then(|u| u.wallet_address)
            else {
                continue;
            };
            if let Some(cluster) = self.repo.get_flag(&wallet)?.and_then(|f| f.cluster_id) {
                *per_cluster.entry(cluster).or_default() += 1;
            }
        }
        let largest = per_cluster.values().copied().max().unwrap_or(0);
        Ok(largest as f64 / direct.len() as f64 > 0.5)
    }

    /// At least twenty direct referrals with too many in one clock hour
    fn registration_burst(&self, direct: &[ReferralEdge]) -> bool {
        if direct.len() < 20 {
            return false;
        }
        let mut per_hour: BTreeMap<i64, u32> = BTreeMap::new();
        for edge in direct {
            *per_hour.entry(edge.created_at.timestamp().div_euclid(3600)).or_default() += 1;
        }
        let busiest = per_hour.values().copied().max().unwrap_or(0);
        busiest > self.config().referral.velocity_per_hour
    }

    fn events_of(&self, users: &[UserId], event_type: EventType) -> Result<Vec<ParticipationEvent>> {
        let mut events = Vec::new();
        for user in users {
            events.extend(
                self.repo
                    .query_events(&EventQuery::for_user(user.clone()).event_type(event_type))?,
            );
        }
        Ok(events)
    }

    fn accepted_count(&self, users: &[UserId]) -> Result<usize> {
        let accepted = self.events_of(users, EventType::FindingAccepted)?.len()
            + self.events_of(users, EventType::FindingPaid)?.len();
        Ok(accepted)
    }
}

/// Ten or more submissions with under 5% accepted
fn poor_quality(submitted: usize, accepted: usize) -> bool {
    submitted >= 10 && (accepted as f64 / submitted as f64) < 0.05
}

/// Share of repeated titles among recent submissions above 0.7
fn copy_paste(mut submissions: Vec<ParticipationEvent>) -> bool {
    submissions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    let titles: Vec<String> = submissions
        .iter()
        .take(TITLE_SAMPLE)
        .filter_map(|e| e.metadata.get("title").and_then(|t| t.as_str()))
        .map(|t| t.trim().to_lowercase())
        .collect();
    if titles.len() < 5 {
        return false;
    }
    let unique: HashSet<&String> = titles.iter().collect();
    let similarity = 1.0 - unique.len() as f64 / titles.len() as f64;
    debug!(similarity, sample = titles.len(), "Submission title similarity");
    similarity > 0.7
}
