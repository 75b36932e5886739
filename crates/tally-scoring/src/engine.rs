//! Scoring engine
//!
//! Live recording applies each event to its `(user, season)` row through the
//! store's atomic `update_score`. Recalculation rebuilds the same rows from
//! the event log with the same capping rules, so both paths agree.

use crate::event_store::{EventFilter, EventStore};
use crate::metrics::ScoringMetrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tally_core::batch::{BatchReport, JobKind, JobLocks};
use tally_core::clock::{week_of, Clock};
use tally_core::config::{Cooldown, EngineConfig};
use tally_core::error::{Result, TallyError};
use tally_core::math::{pro_rata, score_units};
use tally_core::types::{
    Category, ContributionScore, DecayAdjustment, EventId, EventType, Metadata, NewEvent,
    ParticipationEvent, Season, SeasonConfig, SeasonStatus, UserId, Week,
};
use tally_storage::{Repository, StorageError};
use tracing::{debug, info, warn};

/// Swap attempts per row before recalculation reports the user as failed
const REBUILD_ATTEMPTS: u32 = 3;

/// Where an event should land
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EventTarget {
    /// The active season and the week containing "now"
    #[default]
    Current,
    /// An explicit season-week (batch jobs, bonus distribution)
    At { season: Season, week: Week },
}

/// Full recording request
#[derive(Clone, Debug, PartialEq)]
pub struct EventRequest {
    pub user_id: UserId,
    pub event_type: EventType,
    pub metadata: Metadata,
    /// Replaces the table's base points (referral bonuses, upline shares)
    pub points_override: Option<i64>,
    /// Makes the request idempotent per user
    pub dedupe_key: Option<String>,
    pub verified: bool,
    pub target: EventTarget,
}

impl EventRequest {
    pub fn new(user_id: UserId, event_type: EventType) -> Self {
        Self {
            user_id,
            event_type,
            metadata: Metadata::new(),
            points_override: None,
            dedupe_key: None,
            verified: false,
            target: EventTarget::Current,
        }
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn points(mut self, points: i64) -> Self {
        self.points_override = Some(points);
        self
    }

    pub fn dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    pub fn verified(mut self) -> Self {
        self.verified = true;
        self
    }

    pub fn at(mut self, season: Season, week: Week) -> Self {
        self.target = EventTarget::At { season, week };
        self
    }
}

/// What happened to a recording request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecordOutcome {
    /// Stored and applied; `counted_points` is after the weekly cap
    Recorded {
        event_id: EventId,
        season: Season,
        week: Week,
        counted_points: i64,
    },
    /// Stored against a season that no longer accepts score changes
    AuditOnly { event_id: EventId, season: Season },
    /// Dedupe key already used; nothing changed
    Duplicate { event_id: EventId },
    /// Cooldown not elapsed; not stored
    CooledDown,
    /// No season to record against; not stored
    NoSeason,
    /// Swallowed failure (fire-and-forget path only)
    Failed { error: String },
}

impl RecordOutcome {
    pub fn event_id(&self) -> Option<EventId> {
        match self {
            RecordOutcome::Recorded { event_id, .. }
            | RecordOutcome::AuditOnly { event_id, .. }
            | RecordOutcome::Duplicate { event_id } => Some(*event_id),
            _ => None,
        }
    }

    pub fn counted_points(&self) -> i64 {
        match self {
            RecordOutcome::Recorded { counted_points, .. } => *counted_points,
            _ => 0,
        }
    }
}

/// Read model for "what would I get if the season ended now"
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AllocationEstimate {
    pub user_id: UserId,
    pub season: Season,
    pub total_score: f64,
    pub rank: Option<u32>,
    pub participants: usize,
    pub season_total_score: f64,
    /// Fraction of the pool, in [0, 1]
    pub share: f64,
    pub pool_size: Option<u128>,
    pub estimated_allocation: Option<u128>,
}

/// Apply `points` to `score` under the weekly cap; returns the counted amount
pub(crate) fn apply_capped(
    score: &mut ContributionScore,
    category: Category,
    points: i64,
    week: Week,
    cap: i64,
) -> i64 {
    let counted = if points > 0 {
        let counted = points.min(score.remaining_cap(week, cap));
        *score.weekly_positive.entry(week).or_insert(0) += counted;
        counted
    } else {
        points
    };
    if counted != 0 {
        score.apply_points(category, counted);
    }
    counted
}

/// A dedupe hit: keys derived from a cooldown read as a cooldown
fn duplicate_outcome(derived_key: bool, event_id: EventId) -> RecordOutcome {
    if derived_key {
        RecordOutcome::CooledDown
    } else {
        RecordOutcome::Duplicate { event_id }
    }
}

/// Order rows by score and assign 1-based ranks in place.
///
/// Ties go to the earlier row, then to the lower user id.
pub fn rank_scores(rows: &mut [ContributionScore]) {
    rows.sort_by(|a, b| {
        b.total_score
            .total_cmp(&a.total_score)
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.user_id.cmp(&b.user_id))
    });
    for (i, row) in rows.iter_mut().enumerate() {
        row.rank = Some(i as u32 + 1);
    }
}

/// Scoring engine
pub struct ScoringEngine {
    repo: Arc<dyn Repository>,
    events: EventStore,
    config: Arc<EngineConfig>,
    clock: Arc<dyn Clock>,
    jobs: JobLocks,
    metrics: Arc<ScoringMetrics>,
}

impl ScoringEngine {
    pub fn new(
        repo: Arc<dyn Repository>,
        config: Arc<EngineConfig>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let metrics = ScoringMetrics::new()
            .map_err(|e| TallyError::Validation(format!("metrics: {e}")))?;
        Ok(Self {
            events: EventStore::new(Arc::clone(&repo)),
            repo,
            config,
            clock,
            jobs: JobLocks::new(),
            metrics: Arc::new(metrics),
        })
    }

    pub fn repo(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    pub fn events(&self) -> &EventStore {
        &self.events
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn jobs(&self) -> &JobLocks {
        &self.jobs
    }

    pub fn metrics(&self) -> &ScoringMetrics {
        &self.metrics
    }

    /// Fire-and-forget recording against the current season. Never fails;
    /// storage errors are logged and reported as `Failed`.
    pub fn record_event(
        &self,
        user_id: &UserId,
        event_type: EventType,
        metadata: Metadata,
    ) -> RecordOutcome {
        let request = EventRequest::new(user_id.clone(), event_type).metadata(metadata);
        self.record(request)
    }

    /// Fire-and-forget variant of `try_record`
    pub fn record(&self, request: EventRequest) -> RecordOutcome {
        let user_id = request.user_id.clone();
        let event_type = request.event_type;
        match self.try_record(request) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    user = %user_id,
                    event_type = %event_type,
                    "Failed to record event: {}",
                    e
                );
                self.metrics
                    .events_dropped
                    .with_label_values(&["error"])
                    .inc();
                RecordOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    /// Record one event and roll it into the user's score
    pub fn try_record(&self, request: EventRequest) -> Result<RecordOutcome> {
        let rule = self
            .config
            .scoring
            .table
            .rule(request.event_type)
            .cloned()
            .ok_or_else(|| {
                TallyError::Validation(format!("no scoring rule for {}", request.event_type))
            })?;
        let now = self.clock.now();

        let Some((season, week, audit_only)) = self.resolve_target(request.target, now)? else {
            debug!(user = %request.user_id, event_type = %request.event_type, "No season, event dropped");
            self.metrics
                .events_dropped
                .with_label_values(&["no_season"])
                .inc();
            return Ok(RecordOutcome::NoSeason);
        };

        let (cooldown_key, within) = match rule.cooldown {
            Cooldown::Unlimited => (None, None),
            Cooldown::OneTime => (Some(format!("once:{}", request.event_type)), None),
            Cooldown::Weekly => (
                Some(format!(
                    "weekly:{}:{}:{}",
                    season.season, week, request.event_type
                )),
                Some((season.season, week)),
            ),
        };
        if cooldown_key.is_some()
            && self
                .events
                .has_event(&request.user_id, request.event_type, within)?
        {
            self.metrics
                .events_dropped
                .with_label_values(&["cooldown"])
                .inc();
            return Ok(RecordOutcome::CooledDown);
        }

        let derived_key = request.dedupe_key.is_none() && cooldown_key.is_some();
        let mut points = request.points_override.unwrap_or(rule.points);
        if rule.category == Category::Penalty {
            points = -points.abs();
        }

        let event = NewEvent {
            user_id: request.user_id.clone(),
            event_type: request.event_type,
            season: season.season,
            week,
            points,
            metadata: request.metadata,
            verified: request.verified,
            audit_only,
            dedupe_key: request.dedupe_key.or(cooldown_key),
            created_at: now,
        };

        if audit_only {
            let appended = self.events.record(event)?;
            if !appended.inserted {
                return Ok(duplicate_outcome(derived_key, appended.id));
            }
            debug!(
                user = %request.user_id,
                season = season.season,
                "Event stored for audit only, season is {}",
                season.status
            );
            self.metrics.events_audit_only.inc();
            return Ok(RecordOutcome::AuditOnly {
                event_id: appended.id,
                season: season.season,
            });
        }

        let multiplier = self.multiplier_for_user(&request.user_id)?;
        let mut counted = 0;
        let appended = self.events.record_applied(event, &mut |event_id, row| {
            let score = row.get_or_insert_with(|| {
                ContributionScore::new(request.user_id.clone(), season.season, multiplier, now)
            });
            counted = apply_capped(score, rule.category, points, week, season.weekly_cap);
            if points > 0 {
                score.last_active_at = now;
            }
            score.last_event_id = score.last_event_id.max(event_id);
            score.recompute_total();
        })?;
        if !appended.inserted {
            return Ok(duplicate_outcome(derived_key, appended.id));
        }

        if points > 0 && counted < points {
            self.metrics.events_capped.inc();
        }
        self.metrics
            .events_recorded
            .with_label_values(&[request.event_type.as_str()])
            .inc();
        debug!(
            user = %request.user_id,
            event_type = %request.event_type,
            points,
            counted,
            "Event recorded"
        );

        Ok(RecordOutcome::Recorded {
            event_id: appended.id,
            season: season.season,
            week,
            counted_points: counted,
        })
    }

    /// Season, week and audit flag for a target, or `None` to drop
    fn resolve_target(
        &self,
        target: EventTarget,
        now: DateTime<Utc>,
    ) -> Result<Option<(SeasonConfig, Week, bool)>> {
        match target {
            EventTarget::Current => {
                let seasons = self.repo.list_seasons()?;
                if let Some(active) = seasons.iter().find(|s| s.status == SeasonStatus::Active) {
                    let week = week_of(active.start_date.unwrap_or(now), now);
                    return Ok(Some((active.clone(), week, false)));
                }
                let closed = seasons
                    .into_iter()
                    .filter(|s| matches!(s.status, SeasonStatus::Frozen | SeasonStatus::Claiming))
                    .max_by_key(|s| s.season);
                Ok(closed.map(|s| {
                    let week = week_of(s.start_date.unwrap_or(now), now);
                    (s, week, true)
                }))
            }
            EventTarget::At { season, week } => {
                if week == 0 {
                    return Err(TallyError::Validation("weeks are 1-based".into()));
                }
                let config = self
                    .repo
                    .get_season(season)?
                    .ok_or_else(|| TallyError::NotFound(format!("season {season}")))?;
                match config.status {
                    SeasonStatus::Pending => Err(TallyError::Validation(format!(
                        "season {season} has not started"
                    ))),
                    SeasonStatus::Active => Ok(Some((config, week, false))),
                    _ => Ok(Some((config, week, true))),
                }
            }
        }
    }

    /// Current sybil multiplier of the wallet bound to `user_id`
    pub fn multiplier_for_user(&self, user_id: &UserId) -> Result<f64> {
        let wallet = match self.repo.get_user(user_id)? {
            Some(user) => user.wallet_address,
            None => None,
        };
        let Some(wallet) = wallet else {
            return Ok(1.0);
        };
        Ok(self
            .repo
            .get_flag(&wallet)?
            .map(|flag| self.config.sybil.multiplier_for(flag.risk_score))
            .unwrap_or(1.0))
    }

    /// Rebuild every score row of a season from its event log
    pub fn recalculate_all_scores(&self, season: Season) -> Result<BatchReport> {
        let _permit = self.jobs.try_acquire(JobKind::Recalculate, season)?;
        let config = self
            .repo
            .get_season(season)?
            .ok_or_else(|| TallyError::NotFound(format!("season {season}")))?;

        let existing: HashMap<UserId, ContributionScore> = self
            .repo
            .season_scores(season)?
            .into_iter()
            .map(|s| (s.user_id.clone(), s))
            .collect();

        let mut by_user: BTreeMap<UserId, Vec<ParticipationEvent>> = BTreeMap::new();
        for event in self.events.season_events(season)? {
            if !event.audit_only {
                by_user.entry(event.user_id.clone()).or_default().push(event);
            }
        }
        for user_id in existing.keys() {
            by_user.entry(user_id.clone()).or_default();
        }

        let mut report = BatchReport::new(JobKind::Recalculate, season, by_user.len());
        for (user_id, events) in &by_user {
            match self.rebuild_score(&config, user_id, events, existing.get(user_id)) {
                Ok(()) => report.processed += 1,
                Err(e) => {
                    warn!(user = %user_id, season, "Recalculation failed: {}", e);
                    report.record_failure(&e);
                }
            }
        }

        if let Err(e) = self.refresh_ranks(season) {
            warn!(season, "Rank refresh failed: {}", e);
            report.record_failure(&e);
        }

        self.metrics
            .batch_passes
            .with_label_values(&["recalculate"])
            .inc();
        info!("{}", report.summary());
        Ok(report)
    }

    /// Rebuild one row and swap it in, unless live events landed after the
    /// log was read; then re-read that user's events and try again.
    fn rebuild_score(
        &self,
        config: &SeasonConfig,
        user_id: &UserId,
        events: &[ParticipationEvent],
        existing: Option<&ContributionScore>,
    ) -> Result<()> {
        let mut events = events.to_vec();
        for attempt in 1..=REBUILD_ATTEMPTS {
            let score = self.rebuilt_row(config, user_id, &events, existing)?;
            let covered = score.last_event_id;
            let mut stale = false;
            self.repo.update_score(user_id, config.season, &mut |row| {
                if row.as_ref().map_or(0, |r| r.last_event_id) > covered {
                    stale = true;
                    return;
                }
                let mut rebuilt = score.clone();
                if let Some(current) = row.as_ref() {
                    rebuilt.streak_weeks = current.streak_weeks;
                    rebuilt.rank = current.rank;
                }
                *row = Some(rebuilt);
            })?;
            if !stale {
                return Ok(());
            }

            debug!(user = %user_id, attempt, "Row moved during recalculation, re-reading events");
            let mut fresh = self
                .events
                .query(user_id, config.season, &EventFilter::default())?;
            fresh.retain(|e| !e.audit_only);
            fresh.reverse();
            events = fresh;
        }
        Err(TallyError::StorageUnavailable(format!(
            "score row of {user_id} kept changing during recalculation"
        )))
    }

    fn rebuilt_row(
        &self,
        config: &SeasonConfig,
        user_id: &UserId,
        events: &[ParticipationEvent],
        existing: Option<&ContributionScore>,
    ) -> Result<ContributionScore> {
        let multiplier = self.multiplier_for_user(user_id)?;
        let decay_factor: f64 = self
            .repo
            .decay_adjustments(user_id, config.season)?
            .iter()
            .map(|d| 1.0 - d.rate)
            .product();

        let created_at = existing
            .map(|s| s.created_at)
            .or_else(|| events.first().map(|e| e.created_at))
            .unwrap_or_else(|| self.clock.now());

        let mut score = ContributionScore::new(user_id.clone(), config.season, multiplier, created_at);
        score.decay_factor = decay_factor;
        score.streak_weeks = existing.map_or(0, |s| s.streak_weeks);
        score.rank = existing.and_then(|s| s.rank);

        for event in events {
            score.last_event_id = score.last_event_id.max(event.id);
            let Some(rule) = self.config.scoring.table.rule(event.event_type) else {
                continue;
            };
            apply_capped(&mut score, rule.category, event.points, event.week, config.weekly_cap);
            if event.points > 0 && event.created_at > score.last_active_at {
                score.last_active_at = event.created_at;
            }
        }
        score.recompute_total();
        Ok(score)
    }

    /// Persist live ranks on every row of the season
    pub fn refresh_ranks(&self, season: Season) -> Result<()> {
        let mut rows = self.repo.season_scores(season)?;
        rank_scores(&mut rows);
        for row in rows {
            let rank = row.rank;
            self.repo.update_score(&row.user_id, season, &mut |current| {
                if let Some(current) = current {
                    current.rank = rank;
                }
            })?;
        }
        Ok(())
    }

    /// Apply inactivity decay to every row of an active season
    pub fn apply_decay(&self, season: Season) -> Result<BatchReport> {
        let _permit = self.jobs.try_acquire(JobKind::Decay, season)?;
        let config = self
            .repo
            .get_season(season)?
            .ok_or_else(|| TallyError::NotFound(format!("season {season}")))?;
        if config.status != SeasonStatus::Active {
            return Err(TallyError::InvalidTransition {
                season,
                from: config.status,
                action: "decay",
            });
        }

        let now = self.clock.now();
        let week = week_of(config.start_date.unwrap_or(now), now);
        let rows = self.repo.season_scores(season)?;
        let mut report = BatchReport::new(JobKind::Decay, season, rows.len());

        for row in rows {
            let inactive_weeks = (now - row.last_active_at).num_weeks().max(0) as u32;
            let Some(rate) = self.config.decay.rate_for(inactive_weeks) else {
                report.processed += 1;
                continue;
            };

            match self.decay_row(&row, week, inactive_weeks, rate, now) {
                Ok(true) => report.processed += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    warn!(user = %row.user_id, season, "Decay failed: {}", e);
                    report.record_failure(&e);
                }
            }
        }

        self.metrics.batch_passes.with_label_values(&["decay"]).inc();
        info!("{}", report.summary());
        Ok(report)
    }

    /// Returns false when this week's adjustment already exists
    fn decay_row(
        &self,
        row: &ContributionScore,
        week: Week,
        inactive_weeks: u32,
        rate: f64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let adjustment = DecayAdjustment {
            user_id: row.user_id.clone(),
            season: row.season,
            week,
            inactive_weeks,
            rate,
            score_before: row.total_score,
            score_after: row.total_score * (1.0 - rate),
            created_at: now,
        };
        match self.repo.insert_decay(adjustment) {
            Ok(()) => {}
            Err(StorageError::Conflict(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        self.repo.update_score(&row.user_id, row.season, &mut |current| {
            if let Some(score) = current {
                score.decay_factor *= 1.0 - rate;
                score.recompute_total();
            }
        })?;
        debug!(user = %row.user_id, inactive_weeks, rate, "Decay applied");
        Ok(true)
    }

    /// Top `limit` rows with live ranks
    pub fn leaderboard(&self, season: Season, limit: usize) -> Result<Vec<ContributionScore>> {
        let mut rows = self.repo.season_scores(season)?;
        rank_scores(&mut rows);
        rows.truncate(limit);
        Ok(rows)
    }

    /// A user's current standing and projected pool share
    pub fn estimate_allocation(
        &self,
        user_id: &UserId,
        season: Season,
    ) -> Result<AllocationEstimate> {
        let config = self
            .repo
            .get_season(season)?
            .ok_or_else(|| TallyError::NotFound(format!("season {season}")))?;

        let mut rows = self.repo.season_scores(season)?;
        rank_scores(&mut rows);
        let mine = rows
            .iter()
            .find(|r| &r.user_id == user_id)
            .ok_or_else(|| TallyError::NotFound(format!("score for {user_id} in season {season}")))?;

        let precision = self.config.scoring.score_precision;
        let positive: Vec<&ContributionScore> =
            rows.iter().filter(|r| r.total_score > 0.0).collect();
        let total_units: u128 = positive
            .iter()
            .map(|r| score_units(r.total_score, precision))
            .sum();
        let my_units = score_units(mine.total_score, precision);

        let share = if total_units == 0 {
            0.0
        } else {
            my_units as f64 / total_units as f64
        };
        let estimated_allocation = match config.pool_size {
            Some(pool) if total_units > 0 => Some(pro_rata(my_units, pool, total_units)?),
            Some(_) => Some(0),
            None => None,
        };

        Ok(AllocationEstimate {
            user_id: user_id.clone(),
            season,
            total_score: mine.total_score,
            rank: mine.rank,
            participants: positive.len(),
            season_total_score: positive.iter().map(|r| r.total_score).sum(),
            share,
            pool_size: config.pool_size,
            estimated_allocation,
        })
    }
}
