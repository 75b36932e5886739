//! Season lifecycle
//!
//! ```text
//! pending --activate--> active --freeze--> frozen --open_claim_window--> claiming --complete--> completed
//! ```
//!
//! Every transition is a conditional update in the store; a call made from
//! the wrong status fails with `InvalidTransition` and changes nothing.

use std::sync::Arc;
use tally_core::clock::Clock;
use tally_core::config::EngineConfig;
use tally_core::error::{Result, TallyError};
use tally_core::types::{Caller, Season, SeasonConfig, SeasonStatus};
use tally_storage::{Repository, StorageError};
use tracing::{info, warn};

/// Drives seasons through their states
pub struct SeasonController {
    repo: Arc<dyn Repository>,
    config: Arc<EngineConfig>,
    clock: Arc<dyn Clock>,
}

impl SeasonController {
    pub fn new(repo: Arc<dyn Repository>, config: Arc<EngineConfig>, clock: Arc<dyn Clock>) -> Self {
        Self {
            repo,
            config,
            clock,
        }
    }

    /// Seed a pending season; an existing row is returned unchanged
    pub fn create_season(
        &self,
        caller: &Caller,
        season: Season,
        weekly_cap: Option<i64>,
    ) -> Result<SeasonConfig> {
        caller.require_admin()?;
        let cap = self.checked_cap(weekly_cap)?;
        if season == 0 {
            return Err(TallyError::Validation("seasons are numbered from 1".into()));
        }
        self.seed(season, cap)
    }

    pub fn activate(
        &self,
        caller: &Caller,
        season: Season,
        pool_size: Option<u128>,
        weekly_cap: Option<i64>,
    ) -> Result<SeasonConfig> {
        caller.require_admin()?;
        if let Some(cap) = weekly_cap {
            self.checked_cap(Some(cap))?;
        }
        let now = self.clock.now();
        let row = self.transition(season, SeasonStatus::Pending, "activate", &mut |s| {
            s.status = SeasonStatus::Active;
            s.start_date = Some(now);
            if pool_size.is_some() {
                s.pool_size = pool_size;
            }
            if let Some(cap) = weekly_cap {
                s.weekly_cap = cap;
            }
        })?;
        info!(season, weekly_cap = row.weekly_cap, "Season activated");
        Ok(row)
    }

    /// Stop scoring; later events for the season are kept for audit only
    pub fn freeze(&self, caller: &Caller, season: Season) -> Result<SeasonConfig> {
        caller.require_admin()?;
        let row = self.freeze_active(season)?;
        info!(season, "Season frozen");
        Ok(row)
    }

    pub fn open_claim_window(&self, caller: &Caller, season: Season) -> Result<SeasonConfig> {
        caller.require_admin()?;
        let current = self.get(season)?;
        if current.status != SeasonStatus::Frozen {
            return Err(TallyError::InvalidTransition {
                season,
                from: current.status,
                action: "open claims for",
            });
        }
        if self.repo.get_snapshot(season)?.is_none() {
            return Err(TallyError::Validation(format!(
                "season {season} has no snapshot to claim against"
            )));
        }

        let row = self.transition(season, SeasonStatus::Frozen, "open claims for", &mut |s| {
            s.status = SeasonStatus::Claiming;
        })?;
        info!(season, "Claim window open");
        Ok(row)
    }

    /// Close the season and seed the next one as pending
    pub fn complete(&self, caller: &Caller, season: Season) -> Result<SeasonConfig> {
        caller.require_admin()?;
        let row = self.transition(season, SeasonStatus::Claiming, "complete", &mut |s| {
            s.status = SeasonStatus::Completed;
        })?;
        let next = self.seed(season + 1, row.weekly_cap)?;
        info!(season, next = next.season, "Season completed");
        Ok(row)
    }

    pub fn get(&self, season: Season) -> Result<SeasonConfig> {
        self.repo
            .get_season(season)?
            .ok_or_else(|| TallyError::NotFound(format!("season {season}")))
    }

    /// The active season, if any
    pub fn current(&self) -> Result<Option<SeasonConfig>> {
        Ok(self
            .repo
            .list_seasons()?
            .into_iter()
            .find(|s| s.status == SeasonStatus::Active))
    }

    pub fn list(&self) -> Result<Vec<SeasonConfig>> {
        Ok(self.repo.list_seasons()?)
    }

    pub(crate) fn freeze_active(&self, season: Season) -> Result<SeasonConfig> {
        let now = self.clock.now();
        self.transition(season, SeasonStatus::Active, "freeze", &mut |s| {
            s.status = SeasonStatus::Frozen;
            s.end_date = Some(now);
        })
    }

    /// Undo a freeze made on behalf of a failed snapshot
    pub(crate) fn rollback_freeze(&self, season: Season) -> Result<SeasonConfig> {
        let row = self.transition(season, SeasonStatus::Frozen, "unfreeze", &mut |s| {
            s.status = SeasonStatus::Active;
            s.end_date = None;
        })?;
        info!(season, "Automatic freeze rolled back");
        Ok(row)
    }

    fn seed(&self, season: Season, weekly_cap: i64) -> Result<SeasonConfig> {
        match self.repo.insert_season(SeasonConfig::pending(season, weekly_cap)) {
            Ok(()) => {
                info!(season, "Season seeded");
                self.get(season)
            }
            Err(StorageError::Conflict(_)) => self.get(season),
            Err(e) => Err(e.into()),
        }
    }

    fn checked_cap(&self, weekly_cap: Option<i64>) -> Result<i64> {
        let cap = weekly_cap.unwrap_or(self.config.scoring.default_weekly_cap);
        if cap <= 0 {
            return Err(TallyError::Validation(format!(
                "weekly cap must be positive, got {cap}"
            )));
        }
        Ok(cap)
    }

    fn transition(
        &self,
        season: Season,
        expected: SeasonStatus,
        action: &'static str,
        mutate: &mut dyn FnMut(&mut SeasonConfig),
    ) -> Result<SeasonConfig> {
        match self.repo.transition_season(season, expected, mutate) {
            Ok(row) => Ok(row),
            Err(StorageError::Conflict(reason)) => {
                let from = self.get(season)?.status;
                warn!(season, %from, action, "Rejected season transition: {}", reason);
                Err(TallyError::InvalidTransition {
                    season,
                    from,
                    action,
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tally_core::clock::ManualClock;
    use tally_storage::MemoryRepository;

    fn controller() -> (Arc<MemoryRepository>, SeasonController) {
        let repo = Arc::new(MemoryRepository::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap(),
        ));
        let controller =
            SeasonController::new(repo.clone(), Arc::new(EngineConfig::default()), clock);
        (repo, controller)
    }

    #[test]
    fn test_activate_and_freeze() {
        let (_, seasons) = controller();
        let admin = Caller::admin("ops");
        seasons.create_season(&admin, 1, None).unwrap();

        let active = seasons.activate(&admin, 1, Some(1_000_000), Some(2500)).unwrap();
        assert_eq!(active.status, SeasonStatus::Active);
        assert_eq!(active.weekly_cap, 2500);
        assert_eq!(active.pool_size, Some(1_000_000));
        assert!(active.start_date.is_some());
        assert_eq!(seasons.current().unwrap().map(|s| s.season), Some(1));

        let frozen = seasons.freeze(&admin, 1).unwrap();
        assert_eq!(frozen.status, SeasonStatus::Frozen);
        assert!(frozen.end_date.is_some());
        assert!(seasons.current().unwrap().is_none());
    }

    #[test]
    fn test_freeze_pending_is_rejected() {
        let (_, seasons) = controller();
        let admin = Caller::admin("ops");
        seasons.create_season(&admin, 1, None).unwrap();

        let err = seasons.freeze(&admin, 1).unwrap_err();
        assert_eq!(
            err,
            TallyError::InvalidTransition {
                season: 1,
                from: SeasonStatus::Pending,
                action: "freeze",
            }
        );
        assert_eq!(seasons.get(1).unwrap().status, SeasonStatus::Pending);
    }

    #[test]
    fn test_single_active_season() {
        let (_, seasons) = controller();
        let admin = Caller::admin("ops");
        seasons.create_season(&admin, 1, None).unwrap();
        seasons.create_season(&admin, 2, None).unwrap();
        seasons.activate(&admin, 1, None, None).unwrap();

        assert!(matches!(
            seasons.activate(&admin, 2, None, None),
            Err(TallyError::InvalidTransition { season: 2, .. })
        ));
        assert_eq!(seasons.get(2).unwrap().status, SeasonStatus::Pending);
    }

    #[test]
    fn test_claim_window_needs_snapshot() {
        let (_, seasons) = controller();
        let admin = Caller::admin("ops");
        seasons.create_season(&admin, 1, None).unwrap();
        seasons.activate(&admin, 1, None, None).unwrap();

        assert!(matches!(
            seasons.open_claim_window(&admin, 1),
            Err(TallyError::InvalidTransition { from: SeasonStatus::Active, .. })
        ));
        seasons.freeze(&admin, 1).unwrap();
        assert!(matches!(
            seasons.open_claim_window(&admin, 1),
            Err(TallyError::Validation(_))
        ));
        assert_eq!(seasons.get(1).unwrap().status, SeasonStatus::Frozen);
    }

    #[test]
    fn test_admin_only() {
        let (repo, seasons) = controller();
        let user = Caller::user("alice");
        assert!(matches!(
            seasons.create_season(&user, 1, None),
            Err(TallyError::Authorization(_))
        ));
        assert!(repo.list_seasons().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_season() {
        let (_, seasons) = controller();
        assert!(matches!(
            seasons.activate(&Caller::admin("ops"), 9, None, None),
            Err(TallyError::NotFound(_))
        ));
    }

    #[test]
    fn test_rollback_freeze() {
        let (_, seasons) = controller();
        let admin = Caller::admin("ops");
        seasons.create_season(&admin, 1, None).unwrap();
        seasons.activate(&admin, 1, None, None).unwrap();
        seasons.freeze_active(1).unwrap();
        seasons.rollback_freeze(1).unwrap();
        let row = seasons.get(1).unwrap();
        assert_eq!(row.status, SeasonStatus::Active);
        assert!(row.end_date.is_none());

        assert!(matches!(
            seasons.rollback_freeze(1),
            Err(TallyError::InvalidTransition { from: SeasonStatus::Active, .. })
        ));
    }
}
