//! Persistence interface

use crate::error::StorageResult;
use chrono::{DateTime, Utc};
use tally_core::types::{
    AntiSybilFlag, ContributionScore, DecayAdjustment, EventId, EventType, NewEvent,
    ParticipationEvent, ReferralCounter, ReferralEdge, ReferralLink, Season, SeasonConfig,
    SeasonSnapshot, SeasonStatus, UserId, UserRecord, WalletAddress, Week,
};

/// Result of an event append
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Appended {
    pub id: EventId,
    /// False when a matching dedupe key already existed
    pub inserted: bool,
}

/// Event query filters; results are newest first
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EventQuery {
    pub user_id: Option<UserId>,
    pub season: Option<Season>,
    pub week: Option<Week>,
    pub event_types: Vec<EventType>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl EventQuery {
    pub fn for_user(user_id: UserId) -> Self {
        Self {
            user_id: Some(user_id),
            ..Default::default()
        }
    }

    pub fn season(mut self, season: Season) -> Self {
        self.season = Some(season);
        self
    }

    pub fn week(mut self, week: Week) -> Self {
        self.week = Some(week);
        self
    }

    pub fn event_type(mut self, event_type: EventType) -> Self {
        self.event_types.push(event_type);
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, event: &ParticipationEvent) -> bool {
        self.user_id.as_ref().map_or(true, |u| &event.user_id == u)
            && self.season.map_or(true, |s| event.season == s)
            && self.week.map_or(true, |w| event.week == w)
            && (self.event_types.is_empty() || self.event_types.contains(&event.event_type))
    }
}

/// Row mutation callback for atomic updates. Receives the current row (or
/// `None`) and leaves the desired row in place; setting `None` is a no-op.
pub type RowUpdate<'a, T> = &'a mut dyn FnMut(&mut Option<T>);

/// Score mutation run with the id of the event just appended
pub type EventApply<'a> = &'a mut dyn FnMut(EventId, &mut Option<ContributionScore>);

/// Everything the engine needs from a persistent store
pub trait Repository: Send + Sync {
    // === Users ===
    fn upsert_user(&self, user: UserRecord) -> StorageResult<()>;
    fn get_user(&self, user_id: &UserId) -> StorageResult<Option<UserRecord>>;
    fn users_for_wallet(&self, wallet: &WalletAddress) -> StorageResult<Vec<UserId>>;
    fn list_users(&self) -> StorageResult<Vec<UserRecord>>;

    // === Events ===
    fn append_event(&self, event: NewEvent) -> StorageResult<Appended>;
    /// Append an event and fold it into its `(user, season)` row as one
    /// unit. `apply` runs only when the event was inserted. On error neither
    /// the log nor the row changes, so the whole call can be retried.
    fn append_and_apply(&self, event: NewEvent, apply: EventApply<'_>)
        -> StorageResult<Appended>;
    fn query_events(&self, query: &EventQuery) -> StorageResult<Vec<ParticipationEvent>>;
    /// All events of a season in append order
    fn season_events(&self, season: Season) -> StorageResult<Vec<ParticipationEvent>>;

    // === Scores ===
    fn get_score(&self, user_id: &UserId, season: Season)
        -> StorageResult<Option<ContributionScore>>;
    /// Atomic read-modify-write of one `(user, season)` row
    fn update_score(
        &self,
        user_id: &UserId,
        season: Season,
        update: RowUpdate<'_, ContributionScore>,
    ) -> StorageResult<Option<ContributionScore>>;
    fn season_scores(&self, season: Season) -> StorageResult<Vec<ContributionScore>>;
    fn user_scores(&self, user_id: &UserId) -> StorageResult<Vec<ContributionScore>>;

    // === Sybil flags ===
    fn get_flag(&self, wallet: &WalletAddress) -> StorageResult<Option<AntiSybilFlag>>;
    fn update_flag(
        &self,
        wallet: &WalletAddress,
        update: RowUpdate<'_, AntiSybilFlag>,
    ) -> StorageResult<Option<AntiSybilFlag>>;
    fn list_flags(&self) -> StorageResult<Vec<AntiSybilFlag>>;

    // === Referrals ===
    /// Unique on both `user_id` and `code`
    fn insert_link(&self, link: ReferralLink) -> StorageResult<()>;
    fn link_by_user(&self, user_id: &UserId) -> StorageResult<Option<ReferralLink>>;
    fn link_by_code(&self, code: &str) -> StorageResult<Option<ReferralLink>>;
    fn increment_counter(
        &self,
        user_id: &UserId,
        counter: ReferralCounter,
        delta: i64,
    ) -> StorageResult<ReferralLink>;
    /// Unique on `referred_user_id`
    fn insert_edge(&self, edge: ReferralEdge) -> StorageResult<()>;
    fn inbound_edge(&self, referred: &UserId) -> StorageResult<Option<ReferralEdge>>;
    fn downline(&self, referrer: &UserId) -> StorageResult<Vec<ReferralEdge>>;
    /// Flip the inbound edge to qualified if it is not already; returns the
    /// edge only when this call performed the flip
    fn qualify_edge(
        &self,
        referred: &UserId,
        action: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<Option<ReferralEdge>>;
    fn list_links(&self) -> StorageResult<Vec<ReferralLink>>;

    // === Seasons ===
    fn insert_season(&self, season: SeasonConfig) -> StorageResult<()>;
    fn get_season(&self, season: Season) -> StorageResult<Option<SeasonConfig>>;
    fn list_seasons(&self) -> StorageResult<Vec<SeasonConfig>>;
    /// Apply `mutate` only if the row is currently in `expected`
    fn transition_season(
        &self,
        season: Season,
        expected: SeasonStatus,
        mutate: &mut dyn FnMut(&mut SeasonConfig),
    ) -> StorageResult<SeasonConfig>;

    // === Snapshots ===
    fn insert_snapshot(&self, snapshot: SeasonSnapshot) -> StorageResult<()>;
    fn get_snapshot(&self, season: Season) -> StorageResult<Option<SeasonSnapshot>>;

    // === Decay ===
    /// Unique on `(user_id, season, week)`
    fn insert_decay(&self, adjustment: DecayAdjustment) -> StorageResult<()>;
    fn decay_adjustments(
        &self,
        user_id: &UserId,
        season: Season,
    ) -> StorageResult<Vec<DecayAdjustment>>;
}
