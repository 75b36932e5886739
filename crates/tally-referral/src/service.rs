//! Referral service
//!
//! Owns referral codes, the referrer → referred edges, qualification and the
//! bonuses that flow up the chain. Points always go through the scoring
//! engine so caps, multipliers and dedupe apply uniformly.

use crate::codes::{derive_code, normalize_code};
use crate::rate_limit::AttemptLimiter;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tally_core::batch::JobLocks;
use tally_core::clock::week_of;
use tally_core::config::EngineConfig;
use tally_core::error::{Result, TallyError};
use tally_core::types::{
    EventType, ReferralCounter, ReferralEdge, ReferralLink, Season, SeasonStatus, UserId,
};
use tally_scoring::{EventRequest, RecordOutcome, ScoringEngine};
use tally_storage::{EventQuery, Repository, StorageError};
use tally_sybil::SybilEvaluator;
use tracing::{debug, info, warn};

fn bonus_key(referred: &UserId) -> String {
    format!("referral:{referred}")
}

/// Collision attempts before code allocation gives up
const MAX_CODE_SALT: u32 = 64;

/// Outcome of a first-time qualification
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Qualification {
    pub edge: ReferralEdge,
    pub bonus: i64,
    pub outcome: RecordOutcome,
}

/// One ancestor's share of a contribution
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UplineBonus {
    pub referrer: UserId,
    pub level: u32,
    pub points: i64,
    pub outcome: RecordOutcome,
}

/// An ancestor in a user's referral chain; level 1 is the direct referrer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UplineEntry {
    pub user_id: UserId,
    pub level: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReferralStats {
    pub code: Option<String>,
    pub total_referred: u64,
    pub qualified_referred: u64,
    pub bonus_earned: i64,
    /// Direct referrals, oldest first
    pub referrals: Vec<ReferralEdge>,
}

/// Referral subsystem
pub struct ReferralService {
    pub(crate) repo: Arc<dyn Repository>,
    pub(crate) engine: Arc<ScoringEngine>,
    pub(crate) evaluator: Arc<SybilEvaluator>,
    pub(crate) jobs: JobLocks,
    limiter: AttemptLimiter,
}

impl ReferralService {
    pub fn new(engine: Arc<ScoringEngine>, evaluator: Arc<SybilEvaluator>) -> Self {
        let referral = &engine.config().referral;
        let limiter = AttemptLimiter::new(
            referral.max_attempts,
            referral.window_secs,
            Arc::clone(engine.clock()),
        );
        Self {
            repo: Arc::clone(engine.repo()),
            engine,
            evaluator,
            jobs: JobLocks::new(),
            limiter,
        }
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        self.engine.config()
    }

    /// The user's code, created on first request and stable afterwards
    pub fn get_or_create_referral_code(&self, user_id: &UserId) -> Result<ReferralLink> {
        if let Some(link) = self.repo.link_by_user(user_id)? {
            return Ok(link);
        }

        let referral = &self.config().referral;
        for salt in 0..MAX_CODE_SALT {
            let code = derive_code(user_id, salt, &referral.code_prefix, referral.code_length);
            if self.repo.link_by_code(&code)?.is_some() {
                debug!(user = %user_id, salt, "Referral code collision");
                continue;
            }

            let link = ReferralLink {
                user_id: user_id.clone(),
                code,
                total_referred: 0,
                qualified_referred: 0,
                bonus_earned: 0,
                created_at: self.engine.clock().now(),
            };
            match self.repo.insert_link(link.clone()) {
                Ok(()) => {
                    info!(user = %user_id, code = %link.code, "Referral code created");
                    return Ok(link);
                }
                Err(StorageError::Conflict(_)) => {
                    // Lost a race: either this user already got a code or the
                    // code was just taken by someone else
                    if let Some(existing) = self.repo.link_by_user(user_id)? {
                        return Ok(existing);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(TallyError::Validation(format!(
            "could not allocate a referral code for {user_id}"
        )))
    }

    /// Bind `user_id` to the owner of `code`
    pub fn apply_referral_code(&self, user_id: &UserId, code: &str) -> Result<ReferralEdge> {
        let code = normalize_code(code);
        if code.is_empty() {
            return Err(TallyError::Validation("referral code is empty".into()));
        }
        self.limiter.check(user_id)?;

        let link = self
            .repo
            .link_by_code(&code)?
            .ok_or_else(|| TallyError::InvalidCode(code.clone()))?;
        if &link.user_id == user_id {
            return Err(TallyError::SelfReferral);
        }
        if self.repo.inbound_edge(user_id)?.is_some() {
            return Err(TallyError::AlreadyReferred);
        }
        if self.ancestors(&link.user_id, usize::MAX)?.contains(user_id) {
            return Err(TallyError::CircularReferral);
        }

        let edge = ReferralEdge {
            referrer_user_id: link.user_id.clone(),
            referred_user_id: user_id.clone(),
            code,
            created_at: self.engine.clock().now(),
            qualified: false,
            qualified_at: None,
            qualifying_action: None,
        };
        match self.repo.insert_edge(edge.clone()) {
            Ok(()) => {}
            Err(StorageError::Conflict(_)) => return Err(TallyError::AlreadyReferred),
            Err(e) => return Err(e.into()),
        }
        self.repo
            .increment_counter(&link.user_id, ReferralCounter::TotalReferred, 1)?;

        info!(referrer = %link.user_id, referred = %user_id, "Referral applied");
        Ok(edge)
    }

    /// Mark the user's inbound referral qualified and pay the referrer once.
    /// Later calls return `None`, unless the bonus of an earlier flip never
    /// reached the log; then the bonus is paid under the same dedupe key.
    pub fn qualify(&self, user_id: &UserId, action: &str) -> Result<Option<Qualification>> {
        let now = self.engine.clock().now();
        let edge = match self.repo.qualify_edge(user_id, action, now)? {
            Some(edge) => edge,
            // Flipped earlier but the bonus never landed: finish that pass
            None => match self.repo.inbound_edge(user_id)? {
                Some(edge) if edge.qualified && !self.paid_bonuses(&edge)?.0 => {
                    info!(referred = %user_id, "Resuming unpaid referral bonus");
                    edge
                }
                _ => {
                    debug!(user = %user_id, action, "Nothing to qualify");
                    return Ok(None);
                }
            },
        };
        let referrer = edge.referrer_user_id.clone();

        let (_, previously_qualified) = self.paid_bonuses(&edge)?;
        let bonus = self.qualification_bonus(user_id, previously_qualified)?;
        let request = EventRequest::new(referrer.clone(), EventType::ReferralQualified)
            .points(bonus)
            .meta("referred_user", user_id.as_str())
            .meta(
                "qualifying_action",
                edge.qualifying_action.as_deref().unwrap_or(action),
            )
            .dedupe_key(bonus_key(user_id));
        let outcome = self.engine.try_record(request)?;

        // Counters are bookkeeping; the bonus event above is the record
        if let Err(e) = self
            .repo
            .increment_counter(&referrer, ReferralCounter::QualifiedReferred, 1)
        {
            warn!(referrer = %referrer, "Qualified counter not updated: {}", e);
        }
        let counted = outcome.counted_points();
        if counted > 0 {
            if let Err(e) = self
                .repo
                .increment_counter(&referrer, ReferralCounter::BonusEarned, counted)
            {
                warn!(referrer = %referrer, "Bonus counter not updated: {}", e);
            }
        }

        info!(referrer = %referrer, referred = %user_id, action, bonus, "Referral qualified");
        Ok(Some(Qualification {
            edge,
            bonus,
            outcome,
        }))
    }

    /// Whether this edge's bonus is already in the log, and how many
    /// qualification bonuses the referrer holds in total
    fn paid_bonuses(&self, edge: &ReferralEdge) -> Result<(bool, u64)> {
        let query = EventQuery::for_user(edge.referrer_user_id.clone())
            .event_type(EventType::ReferralQualified);
        let events = self.repo.query_events(&query)?;
        let key = bonus_key(&edge.referred_user_id);
        let paid = events.iter().any(|e| e.dedupe_key.as_deref() == Some(key.as_str()));
        Ok((paid, events.len() as u64))
    }

    /// Tapered bonus for the referrer of `referred`
    fn qualification_bonus(&self, referred: &UserId, previously_qualified: u64) -> Result<i64> {
        let config = self.config();
        let table_points = config
            .scoring
            .table
            .rule(EventType::ReferralQualified)
            .map_or(0, |r| r.points);

        let contributed = match self.active_season()? {
            Some(season) => self
                .repo
                .get_score(referred, season)?
                .map_or(0, |s| s.security_points + s.growth_points),
            None => 0,
        };
        let share = config.referral.level_percentages.first().copied().unwrap_or(0.0);
        let base = table_points.max((contributed as f64 * share).floor() as i64);

        let tapered = (base as f64 * config.referral.taper_factor(previously_qualified)).floor() as i64;
        Ok(tapered.max(config.referral.min_bonus))
    }

    /// Pay each ancestor its level percentage of `base_points`. Nothing flows
    /// until the contributor's own referral has qualified.
    pub fn distribute_contribution_bonus(
        &self,
        contributor: &UserId,
        base_points: i64,
        season: Season,
    ) -> Result<Vec<UplineBonus>> {
        if base_points <= 0 {
            return Ok(Vec::new());
        }
        let Some(inbound) = self.repo.inbound_edge(contributor)? else {
            return Ok(Vec::new());
        };
        if !inbound.qualified {
            debug!(user = %contributor, "Contributor not qualified, no upline bonus");
            return Ok(Vec::new());
        }

        let season_row = self
            .repo
            .get_season(season)?
            .ok_or_else(|| TallyError::NotFound(format!("season {season}")))?;
        let now = self.engine.clock().now();
        let week = week_of(season_row.start_date.unwrap_or(now), now);

        let referral = &self.config().referral;
        let depth = (referral.max_depth as usize).min(referral.level_percentages.len());
        let mut paid = Vec::new();

        for entry in self.upline_to_depth(contributor, depth)? {
            let share = referral.level_percentages[(entry.level - 1) as usize];
            let points = (base_points as f64 * share).floor() as i64;
            if points <= 0 {
                continue;
            }

            let outcome = self.engine.record(
                EventRequest::new(entry.user_id.clone(), EventType::ReferralBonus)
                    .points(points)
                    .at(season, week)
                    .meta("contributor", contributor.as_str())
                    .meta("level", entry.level)
                    .meta("base_points", base_points),
            );
            let counted = outcome.counted_points();
            if counted > 0 {
                self.repo
                    .increment_counter(&entry.user_id, ReferralCounter::BonusEarned, counted)?;
            }
            paid.push(UplineBonus {
                referrer: entry.user_id,
                level: entry.level,
                points,
                outcome,
            });
        }

        debug!(user = %contributor, season, levels = paid.len(), "Upline bonus distributed");
        Ok(paid)
    }

    pub fn referral_stats(&self, user_id: &UserId) -> Result<ReferralStats> {
        let link = self.repo.link_by_user(user_id)?;
        let referrals = self.repo.downline(user_id)?;
        Ok(ReferralStats {
            code: link.as_ref().map(|l| l.code.clone()),
            total_referred: link.as_ref().map_or(0, |l| l.total_referred),
            qualified_referred: link.as_ref().map_or(0, |l| l.qualified_referred),
            bonus_earned: link.as_ref().map_or(0, |l| l.bonus_earned),
            referrals,
        })
    }

    /// Ancestors up to the configured depth
    pub fn upline(&self, user_id: &UserId) -> Result<Vec<UplineEntry>> {
        self.upline_to_depth(user_id, self.config().referral.max_depth as usize)
    }

    fn upline_to_depth(&self, user_id: &UserId, depth: usize) -> Result<Vec<UplineEntry>> {
        Ok(self
            .ancestors(user_id, depth)?
            .into_iter()
            .enumerate()
            .map(|(i, user_id)| UplineEntry {
                user_id,
                level: i as u32 + 1,
            })
            .collect())
    }

    /// Walk inbound edges upward, stopping at `limit` or at a repeated user
    fn ancestors(&self, user_id: &UserId, limit: usize) -> Result<Vec<UserId>> {
        let mut chain = Vec::new();
        let mut seen = HashSet::from([user_id.clone()]);
        let mut current = user_id.clone();

        while chain.len() < limit {
            let Some(edge) = self.repo.inbound_edge(&current)? else {
                break;
            };
            if !seen.insert(edge.referrer_user_id.clone()) {
                warn!(user = %user_id, at = %edge.referrer_user_id, "Referral cycle in store");
                break;
            }
            chain.push(edge.referrer_user_id.clone());
            current = edge.referrer_user_id;
        }
        Ok(chain)
    }

    fn active_season(&self) -> Result<Option<Season>> {
        Ok(self
            .repo
            .list_seasons()?
            .into_iter()
            .find(|s| s.status == SeasonStatus::Active)
            .map(|s| s.season))
    }
}
