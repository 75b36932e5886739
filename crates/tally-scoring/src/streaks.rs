//! Weekly activity and streak processing

use crate::engine::{EventRequest, RecordOutcome, ScoringEngine};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tally_core::batch::{BatchReport, JobKind};
use tally_core::error::{Result, TallyError};
use tally_core::types::{EventType, Season, UserId, Week};
use tally_storage::EventQuery;
use tracing::{info, warn};

/// Outcome of one weekly activity pass
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeeklyActivityReport {
    pub batch: BatchReport,
    pub active_users: usize,
    pub streak_bonuses: usize,
}

/// Consecutive active weeks ending at `week`
fn streak_ending_at(active_weeks: &BTreeSet<Week>, week: Week) -> u32 {
    let mut streak = 0;
    let mut w = week;
    while w > 0 && active_weeks.contains(&w) {
        streak += 1;
        w -= 1;
    }
    streak
}

impl ScoringEngine {
    /// Award weekly participation, update streaks and pay streak milestones
    pub fn process_weekly_activity(
        &self,
        season: Season,
        week: Week,
    ) -> Result<WeeklyActivityReport> {
        if week == 0 {
            return Err(TallyError::Validation("weeks are 1-based".into()));
        }
        let _permit = self.jobs().try_acquire(JobKind::WeeklyActivity, season)?;

        let users = self.repo().list_users()?;
        let mut report = WeeklyActivityReport {
            batch: BatchReport::new(JobKind::WeeklyActivity, season, users.len()),
            active_users: 0,
            streak_bonuses: 0,
        };

        for user in users {
            match self.process_user_week(&user.user_id, season, week) {
                Ok(Some(bonuses)) => {
                    report.active_users += 1;
                    report.streak_bonuses += bonuses;
                    report.batch.processed += 1;
                }
                Ok(None) => report.batch.processed += 1,
                Err(e) => {
                    warn!(user = %user.user_id, season, week, "Weekly activity failed: {}", e);
                    report.batch.record_failure(&e);
                }
            }
        }

        self.metrics()
            .batch_passes
            .with_label_values(&["weekly_activity"])
            .inc();
        info!(
            active = report.active_users,
            streak_bonuses = report.streak_bonuses,
            "{}",
            report.batch.summary()
        );
        Ok(report)
    }

    /// `Some(streak bonuses paid)` when the user was active in `week`
    fn process_user_week(
        &self,
        user_id: &UserId,
        season: Season,
        week: Week,
    ) -> Result<Option<usize>> {
        let events = self
            .repo()
            .query_events(&EventQuery::for_user(user_id.clone()).season(season))?;

        let activity: Vec<_> = events
            .iter()
            .filter(|e| !e.audit_only && e.points > 0 && !e.event_type.is_activity_meta())
            .collect();
        let active_weeks: BTreeSet<Week> = activity.iter().map(|e| e.week).collect();

        if !active_weeks.contains(&week) {
            self.repo().update_score(user_id, season, &mut |row| {
                if let Some(score) = row {
                    score.streak_weeks = 0;
                }
            })?;
            return Ok(None);
        }

        self.try_record(
            EventRequest::new(user_id.clone(), EventType::WeeklyActive)
                .at(season, week)
                .meta("week", week),
        )?;

        let submitted = activity
            .iter()
            .any(|e| e.week == week && e.event_type == EventType::FindingSubmitted);
        if submitted {
            self.try_record(
                EventRequest::new(user_id.clone(), EventType::WeeklySubmission)
                    .at(season, week)
                    .meta("week", week),
            )?;
        }

        let streak = streak_ending_at(&active_weeks, week);
        self.repo().update_score(user_id, season, &mut |row| {
            if let Some(score) = row {
                score.streak_weeks = streak;
            }
        })?;

        let mut bonuses = 0;
        if self.config().streaks.milestones.contains(&streak) {
            let outcome = self.try_record(
                EventRequest::new(user_id.clone(), EventType::StreakBonus)
                    .at(season, week)
                    .meta("streak_weeks", streak)
                    .meta("milestone", streak)
                    .dedupe_key(format!("streak:{season}:{streak}")),
            )?;
            if matches!(outcome, RecordOutcome::Recorded { .. }) {
                bonuses += 1;
            }
        }

        Ok(Some(bonuses))
    }
}
