//! Offline replay of an exported event log
//!
//! Rebuilds a season in memory from a JSON log, runs the weekly passes and
//! produces the snapshot an operator would publish.

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tally_core::clock::ManualClock;
use tally_core::config::EngineConfig;
use tally_core::types::{Caller, EventType, Metadata, Season, SeasonSnapshot, UserId, UserRecord, WalletAddress, Week};
use tally_scoring::{EventRequest, PointsQueue, ScoringEngine};
use tally_season::{SeasonController, SnapshotGenerator};
use tally_storage::{MemoryRepository, Repository};
use tracing::{info, warn};

fn first_season() -> Season {
    1
}

fn first_week() -> Week {
    1
}

#[derive(Debug, Deserialize)]
pub struct ReplayLog {
    #[serde(default = "first_season")]
    pub season: Season,
    pub start: DateTime<Utc>,
    pub pool_size: u128,
    #[serde(default)]
    pub weekly_cap: Option<i64>,
    pub users: Vec<ReplayUser>,
    pub events: Vec<ReplayEvent>,
}

#[derive(Debug, Deserialize)]
pub struct ReplayUser {
    pub user_id: UserId,
    #[serde(default)]
    pub wallet_address: Option<WalletAddress>,
}

#[derive(Debug, Deserialize)]
pub struct ReplayEvent {
    pub user_id: UserId,
    pub event_type: EventType,
    #[serde(default = "first_week")]
    pub week: Week,
    #[serde(default)]
    pub points: Option<i64>,
    #[serde(default)]
    pub dedupe_key: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// What a replay produced
#[derive(Debug, Serialize)]
pub struct ReplayOutput {
    pub events_applied: usize,
    pub weeks_processed: Week,
    pub snapshot: SeasonSnapshot,
    /// Prometheus text exposition of the replay's engine
    #[serde(skip)]
    pub metrics: String,
}

impl ReplayLog {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading replay log {}", path.display()))?;
        let log: ReplayLog = serde_json::from_str(&raw)
            .with_context(|| format!("parsing replay log {}", path.display()))?;
        if log.season == 0 {
            bail!("replay season must be at least 1");
        }
        Ok(log)
    }
}

/// Replay `log` through a fresh in-memory engine
pub async fn replay(log: ReplayLog, config: EngineConfig) -> anyhow::Result<ReplayOutput> {
    let config = Arc::new(config);
    let repo = Arc::new(MemoryRepository::new());
    let clock = Arc::new(ManualClock::new(log.start));
    let admin = Caller::admin("replay");

    for user in &log.users {
        repo.upsert_user(UserRecord {
            user_id: user.user_id.clone(),
            wallet_address: user.wallet_address.clone(),
            created_at: log.start,
        })?;
    }

    let engine = Arc::new(ScoringEngine::new(repo.clone(), config.clone(), clock.clone())?);
    let seasons = Arc::new(SeasonController::new(repo.clone(), config.clone(), clock.clone()));
    seasons.create_season(&admin, log.season, log.weekly_cap)?;
    seasons.activate(&admin, log.season, Some(log.pool_size), log.weekly_cap)?;

    let queue = PointsQueue::spawn(engine.clone(), &config.queue);
    let mut last_week = 1;
    for event in log.events {
        last_week = last_week.max(event.week);
        let mut request = EventRequest::new(event.user_id, event.event_type)
            .metadata(event.metadata)
            .at(log.season, event.week);
        if let Some(points) = event.points {
            request = request.points(points);
        }
        if let Some(key) = event.dedupe_key {
            request = request.dedupe_key(key);
        }
        if !queue.send(request).await {
            bail!("points queue closed during replay");
        }
    }
    let events_applied = queue.shutdown().await;
    info!(events_applied, "Event log replayed");

    for week in 1..=last_week {
        let report = engine.process_weekly_activity(log.season, week)?;
        if report.batch.failed > 0 {
            warn!(week, "{}", report.batch.summary());
        }
    }

    let recalc = engine.recalculate_all_scores(log.season)?;
    if !recalc.is_complete() {
        bail!("recalculation incomplete: {}", recalc.summary());
    }

    let snapshots = SnapshotGenerator::new(repo, seasons, config, clock);
    let snapshot = snapshots.generate_snapshot(&admin, log.season, log.pool_size)?;

    Ok(ReplayOutput {
        events_applied,
        weeks_processed: last_week,
        snapshot,
        metrics: engine.metrics().render(),
    })
}
