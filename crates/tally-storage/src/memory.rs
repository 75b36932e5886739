//! In-memory repository
//!
//! Each table sits behind its own `RwLock`. Every method that must be atomic
//! takes the write lock of its table for the whole read-modify-write.

use crate::error::{StorageError, StorageResult};
use crate::repository::{Appended, EventApply, EventQuery, Repository, RowUpdate};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use tally_core::types::{
    AntiSybilFlag, ContributionScore, DecayAdjustment, EventId, NewEvent, ParticipationEvent,
    ReferralCounter, ReferralEdge, ReferralLink, Season, SeasonConfig, SeasonSnapshot,
    SeasonStatus, UserId, UserRecord, WalletAddress,
};

#[derive(Default)]
struct EventLog {
    events: Vec<ParticipationEvent>,
    dedupe: HashMap<(UserId, String), EventId>,
}

#[derive(Default)]
struct LinkTable {
    by_user: HashMap<UserId, ReferralLink>,
    by_code: HashMap<String, UserId>,
}

/// Reference `Repository` backed by process memory
#[derive(Default)]
pub struct MemoryRepository {
    users: RwLock<HashMap<UserId, UserRecord>>,
    events: RwLock<EventLog>,
    scores: RwLock<HashMap<(UserId, Season), ContributionScore>>,
    flags: RwLock<HashMap<WalletAddress, AntiSybilFlag>>,
    links: RwLock<LinkTable>,
    edges: RwLock<HashMap<UserId, ReferralEdge>>,
    seasons: RwLock<BTreeMap<Season, SeasonConfig>>,
    snapshots: RwLock<HashMap<Season, SeasonSnapshot>>,
    decay: RwLock<HashMap<(UserId, Season), Vec<DecayAdjustment>>>,
    /// Injected failures by operation name
    failures: Mutex<HashMap<&'static str, Injected>>,
}

/// Pending failures for one operation
#[derive(Clone, Copy, Debug)]
struct Injected {
    /// Calls that still succeed before failures start
    pass: u32,
    /// Failures left; `u32::MAX` = forever
    fail: u32,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` calls of `op` fail with `Unavailable`
    pub fn fail_next(&self, op: &'static str, times: u32) {
        self.fail_after(op, 0, times);
    }

    /// Let `pass` calls of `op` through, then fail the following `times`
    pub fn fail_after(&self, op: &'static str, pass: u32, times: u32) {
        self.failures.lock().insert(op, Injected { pass, fail: times });
    }

    /// Make every call of `op` fail until `heal`
    pub fn fail_always(&self, op: &'static str) {
        self.fail_after(op, 0, u32::MAX);
    }

    pub fn heal(&self) {
        self.failures.lock().clear();
    }

    pub fn event_count(&self) -> usize {
        self.events.read().events.len()
    }

    fn check(&self, op: &'static str) -> StorageResult<()> {
        let mut failures = self.failures.lock();
        let Some(injected) = failures.get_mut(op) else {
            return Ok(());
        };
        if injected.pass > 0 {
            injected.pass -= 1;
            return Ok(());
        }
        if injected.fail != u32::MAX {
            injected.fail = injected.fail.saturating_sub(1);
            if injected.fail == 0 {
                failures.remove(op);
            }
        }
        tracing::debug!(op, "injected storage failure");
        Err(StorageError::Unavailable(format!("{op}: injected failure")))
    }
}

impl Repository for MemoryRepository {
    fn upsert_user(&self, user: UserRecord) -> StorageResult<()> {
        self.check("upsert_user")?;
        self.users.write().insert(user.user_id.clone(), user);
        Ok(())
    }

    fn get_user(&self, user_id: &UserId) -> StorageResult<Option<UserRecord>> {
        self.check("get_user")?;
        Ok(self.users.read().get(user_id).cloned())
    }

    fn users_for_wallet(&self, wallet: &WalletAddress) -> StorageResult<Vec<UserId>> {
        self.check("users_for_wallet")?;
        let mut ids: Vec<UserId> = self
            .users
            .read()
            .values()
            .filter(|u| u.wallet_address.as_ref() == Some(wallet))
            .map(|u| u.user_id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn list_users(&self) -> StorageResult<Vec<UserRecord>> {
        self.check("list_users")?;
        let mut users: Vec<UserRecord> = self.users.read().values().cloned().collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(users)
    }

    fn append_event(&self, event: NewEvent) -> StorageResult<Appended> {
        self.check("append_event")?;
        let mut log = self.events.write();

        if let Some(key) = &event.dedupe_key {
            if let Some(&id) = log.dedupe.get(&(event.user_id.clone(), key.clone())) {
                return Ok(Appended {
                    id,
                    inserted: false,
                });
            }
        }

        let id = log.events.len() as EventId + 1;
        if let Some(key) = &event.dedupe_key {
            log.dedupe.insert((event.user_id.clone(), key.clone()), id);
        }
        log.events.push(event.into_event(id));
        Ok(Appended { id, inserted: true })
    }

    fn append_and_apply(
        &self,
        event: NewEvent,
        apply: EventApply<'_>,
    ) -> StorageResult<Appended> {
        self.check("append_event")?;
        self.check("update_score")?;
        // Lock order is events then scores; the row sees events in id order
        let mut log = self.events.write();

        if let Some(key) = &event.dedupe_key {
            if let Some(&id) = log.dedupe.get(&(event.user_id.clone(), key.clone())) {
                return Ok(Appended {
                    id,
                    inserted: false,
                });
            }
        }

        let id = log.events.len() as EventId + 1;
        let key = (event.user_id.clone(), event.season);
        let mut scores = self.scores.write();
        let mut row = scores.get(&key).cloned();
        apply(id, &mut row);
        if let Some(updated) = row {
            scores.insert(key, updated);
        }

        if let Some(dedupe) = &event.dedupe_key {
            log.dedupe.insert((event.user_id.clone(), dedupe.clone()), id);
        }
        log.events.push(event.into_event(id));
        Ok(Appended { id, inserted: true })
    }

    fn query_events(&self, query: &EventQuery) -> StorageResult<Vec<ParticipationEvent>> {
        self.check("query_events")?;
        let log = self.events.read();
        let matching = log
            .events
            .iter()
            .rev()
            .filter(|e| query.matches(e))
            .skip(query.offset)
            .cloned();
        Ok(match query.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        })
    }

    fn season_events(&self, season: Season) -> StorageResult<Vec<ParticipationEvent>> {
        self.check("season_events")?;
        Ok(self
            .events
            .read()
            .events
            .iter()
            .filter(|e| e.season == season)
            .cloned()
            .collect())
    }

    fn get_score(
        &self,
        user_id: &UserId,
        season: Season,
    ) -> StorageResult<Option<ContributionScore>> {
        self.check("get_score")?;
        Ok(self
            .scores
            .read()
            .get(&(user_id.clone(), season))
            .cloned())
    }

    fn update_score(
        &self,
        user_id: &UserId,
        season: Season,
        update: RowUpdate<'_, ContributionScore>,
    ) -> StorageResult<Option<ContributionScore>> {
        self.check("update_score")?;
        let key = (user_id.clone(), season);
        let mut scores = self.scores.write();
        let mut row = scores.get(&key).cloned();
        update(&mut row);
        if let Some(updated) = &row {
            scores.insert(key, updated.clone());
        }
        Ok(row)
    }

    fn season_scores(&self, season: Season) -> StorageResult<Vec<ContributionScore>> {
        self.check("season_scores")?;
        let mut rows: Vec<ContributionScore> = self
            .scores
            .read()
            .values()
            .filter(|s| s.season == season)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(rows)
    }

    fn user_scores(&self, user_id: &UserId) -> StorageResult<Vec<ContributionScore>> {
        self.check("user_scores")?;
        let mut rows: Vec<ContributionScore> = self
            .scores
            .read()
            .values()
            .filter(|s| &s.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.season);
        Ok(rows)
    }

    fn get_flag(&self, wallet: &WalletAddress) -> StorageResult<Option<AntiSybilFlag>> {
        self.check("get_flag")?;
        Ok(self.flags.read().get(wallet).cloned())
    }

    fn update_flag(
        &self,
        wallet: &WalletAddress,
        update: RowUpdate<'_, AntiSybilFlag>,
    ) -> StorageResult<Option<AntiSybilFlag>> {
        self.check("update_flag")?;
        let mut flags = self.flags.write();
        let mut row = flags.get(wallet).cloned();
        update(&mut row);
        if let Some(updated) = &row {
            flags.insert(wallet.clone(), updated.clone());
        }
        Ok(row)
    }

    fn list_flags(&self) -> StorageResult<Vec<AntiSybilFlag>> {
        self.check("list_flags")?;
        let mut flags: Vec<AntiSybilFlag> = self.flags.read().values().cloned().collect();
        flags.sort_by(|a, b| a.wallet_address.cmp(&b.wallet_address));
        Ok(flags)
    }

    fn insert_link(&self, link: ReferralLink) -> StorageResult<()> {
        self.check("insert_link")?;
        let mut links = self.links.write();
        if links.by_user.contains_key(&link.user_id) {
            return Err(StorageError::Conflict(format!(
                "user {} already has a referral code",
                link.user_id
            )));
        }
        if links.by_code.contains_key(&link.code) {
            return Err(StorageError::Conflict(format!(
                "referral code {} already taken",
                link.code
            )));
        }
        links.by_code.insert(link.code.clone(), link.user_id.clone());
        links.by_user.insert(link.user_id.clone(), link);
        Ok(())
    }

    fn link_by_user(&self, user_id: &UserId) -> StorageResult<Option<ReferralLink>> {
        self.check("link_by_user")?;
        Ok(self.links.read().by_user.get(user_id).cloned())
    }

    fn link_by_code(&self, code: &str) -> StorageResult<Option<ReferralLink>> {
        self.check("link_by_code")?;
        let links = self.links.read();
        Ok(links
            .by_code
            .get(code)
            .and_then(|user| links.by_user.get(user))
            .cloned())
    }

    fn increment_counter(
        &self,
        user_id: &UserId,
        counter: ReferralCounter,
        delta: i64,
    ) -> StorageResult<ReferralLink> {
        self.check("increment_counter")?;
        let mut links = self.links.write();
        let link = links
            .by_user
            .get_mut(user_id)
            .ok_or_else(|| StorageError::NotFound(format!("referral link for {user_id}")))?;
        match counter {
            ReferralCounter::TotalReferred => {
                link.total_referred = link.total_referred.saturating_add_signed(delta)
            }
            ReferralCounter::QualifiedReferred => {
                link.qualified_referred = link.qualified_referred.saturating_add_signed(delta)
            }
            ReferralCounter::BonusEarned => link.bonus_earned += delta,
        }
        Ok(link.clone())
    }

    fn insert_edge(&self, edge: ReferralEdge) -> StorageResult<()> {
        self.check("insert_edge")?;
        let mut edges = self.edges.write();
        if edges.contains_key(&edge.referred_user_id) {
            return Err(StorageError::Conflict(format!(
                "{} already has a referrer",
                edge.referred_user_id
            )));
        }
        edges.insert(edge.referred_user_id.clone(), edge);
        Ok(())
    }

    fn inbound_edge(&self, referred: &UserId) -> StorageResult<Option<ReferralEdge>> {
        self.check("inbound_edge")?;
        Ok(self.edges.read().get(referred).cloned())
    }

    fn downline(&self, referrer: &UserId) -> StorageResult<Vec<ReferralEdge>> {
        self.check("downline")?;
        let mut edges: Vec<ReferralEdge> = self
            .edges
            .read()
            .values()
            .filter(|e| &e.referrer_user_id == referrer)
            .cloned()
            .collect();
        edges.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.referred_user_id.cmp(&b.referred_user_id))
        });
        Ok(edges)
    }

    fn qualify_edge(
        &self,
        referred: &UserId,
        action: &str,
        at: DateTime<Utc>,
    ) -> StorageResult<Option<ReferralEdge>> {
        self.check("qualify_edge")?;
        let mut edges = self.edges.write();
        match edges.get_mut(referred) {
            Some(edge) if !edge.qualified => {
                edge.qualified = true;
                edge.qualified_at = Some(at);
                edge.qualifying_action = Some(action.to_string());
                Ok(Some(edge.clone()))
            }
            _ => Ok(None),
        }
    }

    fn list_links(&self) -> StorageResult<Vec<ReferralLink>> {
        self.check("list_links")?;
        let mut links: Vec<ReferralLink> = self.links.read().by_user.values().cloned().collect();
        links.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(links)
    }

    fn insert_season(&self, season: SeasonConfig) -> StorageResult<()> {
        self.check("insert_season")?;
        let mut seasons = self.seasons.write();
        if seasons.contains_key(&season.season) {
            return Err(StorageError::Conflict(format!(
                "season {} already exists",
                season.season
            )));
        }
        seasons.insert(season.season, season);
        Ok(())
    }

    fn get_season(&self, season: Season) -> StorageResult<Option<SeasonConfig>> {
        self.check("get_season")?;
        Ok(self.seasons.read().get(&season).cloned())
    }

    fn list_seasons(&self) -> StorageResult<Vec<SeasonConfig>> {
        self.check("list_seasons")?;
        Ok(self.seasons.read().values().cloned().collect())
    }

    fn transition_season(
        &self,
        season: Season,
        expected: SeasonStatus,
        mutate: &mut dyn FnMut(&mut SeasonConfig),
    ) -> StorageResult<SeasonConfig> {
        self.check("transition_season")?;
        let mut seasons = self.seasons.write();
        let current = seasons
            .get(&season)
            .ok_or_else(|| StorageError::NotFound(format!("season {season}")))?;
        if current.status != expected {
            return Err(StorageError::Conflict(format!(
                "season {season} is {}, expected {expected}",
                current.status
            )));
        }

        let mut next = current.clone();
        mutate(&mut next);
        if next.status == SeasonStatus::Active
            && seasons
                .values()
                .any(|s| s.season != season && s.status == SeasonStatus::Active)
        {
            return Err(StorageError::Conflict(
                "another season is already active".to_string(),
            ));
        }

        seasons.insert(season, next.clone());
        Ok(next)
    }

    fn insert_snapshot(&self, snapshot: SeasonSnapshot) -> StorageResult<()> {
        self.check("insert_snapshot")?;
        let mut snapshots = self.snapshots.write();
        if snapshots.contains_key(&snapshot.season) {
            return Err(StorageError::Conflict(format!(
                "snapshot for season {} already exists",
                snapshot.season
            )));
        }
        snapshots.insert(snapshot.season, snapshot);
        Ok(())
    }

    fn get_snapshot(&self, season: Season) -> StorageResult<Option<SeasonSnapshot>> {
        self.check("get_snapshot")?;
        Ok(self.snapshots.read().get(&season).cloned())
    }

    fn insert_decay(&self, adjustment: DecayAdjustment) -> StorageResult<()> {
        self.check("insert_decay")?;
        let mut decay = self.decay.write();
        let rows = decay
            .entry((adjustment.user_id.clone(), adjustment.season))
            .or_default();
        if rows.iter().any(|r| r.week == adjustment.week) {
            return Err(StorageError::Conflict(format!(
                "decay already applied to {} in season {} week {}",
                adjustment.user_id, adjustment.season, adjustment.week
            )));
        }
        rows.push(adjustment);
        Ok(())
    }

    fn decay_adjustments(
        &self,
        user_id: &UserId,
        season: Season,
    ) -> StorageResult<Vec<DecayAdjustment>> {
        self.check("decay_adjustments")?;
        Ok(self
            .decay
            .read()
            .get(&(user_id.clone(), season))
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::types::{EventType, Metadata};

    fn new_event(user: &str, season: Season, dedupe: Option<&str>) -> NewEvent {
        NewEvent {
            user_id: UserId::new(user),
            event_type: EventType::FindingSubmitted,
            season,
            week: 1,
            points: 50,
            metadata: Metadata::new(),
            verified: true,
            audit_only: false,
            dedupe_key: dedupe.map(str::to_string),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_append_assigns_increasing_ids() {
        let repo = MemoryRepository::new();
        let a = repo.append_event(new_event("u1", 1, None)).unwrap();
        let b = repo.append_event(new_event("u1", 1, None)).unwrap();
        assert!(b.id > a.id);
        assert!(a.inserted && b.inserted);
        assert_eq!(repo.event_count(), 2);
    }

    #[test]
    fn test_dedupe_key_is_idempotent() {
        let repo = MemoryRepository::new();
        let first = repo.append_event(new_event("u1", 1, Some("k"))).unwrap();
        let second = repo.append_event(new_event("u1", 1, Some("k"))).unwrap();
        assert_eq!(first.id, second.id);
        assert!(!second.inserted);

        // Same key for a different user is a different event
        let other = repo.append_event(new_event("u2", 1, Some("k"))).unwrap();
        assert!(other.inserted);
        assert_eq!(repo.event_count(), 2);
    }

    #[test]
    fn test_query_newest_first_with_paging() {
        let repo = MemoryRepository::new();
        for _ in 0..5 {
            repo.append_event(new_event("u1", 1, None)).unwrap();
        }
        repo.append_event(new_event("u2", 1, None)).unwrap();

        let page = repo
            .query_events(&EventQuery::for_user(UserId::new("u1")).page(1, 2))
            .unwrap();
        let ids: Vec<EventId> = page.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![4, 3]);
    }

    #[test]
    fn test_update_score_is_read_modify_write() {
        let repo = MemoryRepository::new();
        let user = UserId::new("u1");
        for _ in 0..3 {
            repo.update_score(&user, 1, &mut |row| {
                let score = row.get_or_insert_with(|| {
                    ContributionScore::new(UserId::new("u1"), 1, 1.0, Utc::now())
                });
                score.security_points += 10;
            })
            .unwrap();
        }
        assert_eq!(repo.get_score(&user, 1).unwrap().unwrap().security_points, 30);
    }

    #[test]
    fn test_transition_is_conditional() {
        let repo = MemoryRepository::new();
        repo.insert_season(SeasonConfig::pending(1, 5000)).unwrap();
        repo.insert_season(SeasonConfig::pending(2, 5000)).unwrap();

        let err = repo
            .transition_season(1, SeasonStatus::Active, &mut |s| {
                s.status = SeasonStatus::Frozen
            })
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
        assert_eq!(
            repo.get_season(1).unwrap().unwrap().status,
            SeasonStatus::Pending
        );

        repo.transition_season(1, SeasonStatus::Pending, &mut |s| {
            s.status = SeasonStatus::Active
        })
        .unwrap();

        // Only one active season at a time
        let err = repo
            .transition_season(2, SeasonStatus::Pending, &mut |s| {
                s.status = SeasonStatus::Active
            })
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
    }

    #[test]
    fn test_qualify_edge_flips_once() {
        let repo = MemoryRepository::new();
        repo.insert_edge(ReferralEdge {
            referrer_user_id: UserId::new("a"),
            referred_user_id: UserId::new("b"),
            code: "wc-abcdef".into(),
            created_at: Utc::now(),
            qualified: false,
            qualified_at: None,
            qualifying_action: None,
        })
        .unwrap();

        let first = repo
            .qualify_edge(&UserId::new("b"), "finding_submitted", Utc::now())
            .unwrap();
        assert!(first.is_some());
        let second = repo
            .qualify_edge(&UserId::new("b"), "finding_submitted", Utc::now())
            .unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn test_unique_constraints() {
        let repo = MemoryRepository::new();
        let link = ReferralLink {
            user_id: UserId::new("a"),
            code: "wc-aaaaaa".into(),
            total_referred: 0,
            qualified_referred: 0,
            bonus_earned: 0,
            created_at: Utc::now(),
        };
        repo.insert_link(link.clone()).unwrap();
        assert!(repo.insert_link(link.clone()).is_err());

        let mut same_code = link;
        same_code.user_id = UserId::new("b");
        assert!(matches!(
            repo.insert_link(same_code),
            Err(StorageError::Conflict(_))
        ));
    }

    #[test]
    fn test_append_and_apply_is_all_or_nothing() {
        let repo = MemoryRepository::new();
        let mut apply = |id: EventId, row: &mut Option<ContributionScore>| {
            let score = row.get_or_insert_with(|| {
                ContributionScore::new(UserId::new("u1"), 1, 1.0, Utc::now())
            });
            score.security_points += 50;
            score.last_event_id = id;
        };

        repo.fail_next("update_score", 1);
        assert!(repo.append_and_apply(new_event("u1", 1, Some("k")), &mut apply).is_err());
        assert_eq!(repo.event_count(), 0);
        assert!(repo.get_score(&UserId::new("u1"), 1).unwrap().is_none());

        let first = repo.append_and_apply(new_event("u1", 1, Some("k")), &mut apply).unwrap();
        assert!(first.inserted);
        let again = repo.append_and_apply(new_event("u1", 1, Some("k")), &mut apply).unwrap();
        assert!(!again.inserted);
        assert_eq!(again.id, first.id);

        let row = repo.get_score(&UserId::new("u1"), 1).unwrap().unwrap();
        assert_eq!(row.security_points, 50);
        assert_eq!(row.last_event_id, first.id);
        assert_eq!(repo.event_count(), 1);
    }

    #[test]
    fn test_injected_failures() {
        let repo = MemoryRepository::new();
        repo.fail_next("append_event", 2);
        assert!(repo.append_event(new_event("u1", 1, None)).is_err());
        assert!(repo.append_event(new_event("u1", 1, None)).is_err());
        assert!(repo.append_event(new_event("u1", 1, None)).is_ok());

        repo.fail_after("get_season", 1, 1);
        assert!(repo.get_season(1).is_ok());
        assert!(repo.get_season(1).is_err());
        assert!(repo.get_season(1).is_ok());

        repo.fail_always("get_season");
        assert!(repo.get_season(1).is_err());
        repo.heal();
        assert!(repo.get_season(1).is_ok());
    }
}
