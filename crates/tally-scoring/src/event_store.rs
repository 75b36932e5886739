//! Append-only participation event log

use std::sync::Arc;
use tally_core::error::Result;
use tally_core::types::{EventType, NewEvent, ParticipationEvent, Season, UserId, Week};
use tally_storage::{Appended, EventApply, EventQuery, Repository};

/// Optional filters for `EventStore::query`
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EventFilter {
    pub event_type: Option<EventType>,
    pub week: Option<Week>,
    pub offset: usize,
    pub limit: Option<usize>,
}

/// Thin facade over the repository's event table
#[derive(Clone)]
pub struct EventStore {
    repo: Arc<dyn Repository>,
}

impl EventStore {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    /// Append one event. Duplicates are valid distinct events unless they
    /// share a dedupe key, in which case the original id comes back.
    pub fn record(&self, event: NewEvent) -> Result<Appended> {
        let appended = self.repo.append_event(event)?;
        Ok(appended)
    }

    /// Append one event and fold it into its score row atomically
    pub fn record_applied(&self, event: NewEvent, apply: EventApply<'_>) -> Result<Appended> {
        Ok(self.repo.append_and_apply(event, apply)?)
    }

    /// A user's events in a season, newest first
    pub fn query(
        &self,
        user_id: &UserId,
        season: Season,
        filter: &EventFilter,
    ) -> Result<Vec<ParticipationEvent>> {
        let mut query = EventQuery::for_user(user_id.clone()).season(season);
        query.week = filter.week;
        if let Some(t) = filter.event_type {
            query = query.event_type(t);
        }
        query.offset = filter.offset;
        query.limit = filter.limit;
        Ok(self.repo.query_events(&query)?)
    }

    /// Every event of a season, in append order
    pub fn season_events(&self, season: Season) -> Result<Vec<ParticipationEvent>> {
        Ok(self.repo.season_events(season)?)
    }

    /// Whether the user already has an event of this type, optionally
    /// restricted to one season-week
    pub fn has_event(
        &self,
        user_id: &UserId,
        event_type: EventType,
        within: Option<(Season, Week)>,
    ) -> Result<bool> {
        let mut query = EventQuery::for_user(user_id.clone())
            .event_type(event_type)
            .page(0, 1);
        if let Some((season, week)) = within {
            query = query.season(season).week(week);
        }
        Ok(!self.repo.query_events(&query)?.is_empty())
    }
}
