//! Engine configuration types
//!
//! Every section has a `Default` impl carrying the programme's production
//! values, so a TOML file only needs to mention what it overrides.

use crate::error::{Result, TallyError};
use crate::types::{Category, EventType};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for overrides (`TALLY__SCORING__DEFAULT_WEEKLY_CAP=...`)
pub const ENV_PREFIX: &str = "TALLY";

/// Complete engine configuration, injected immutably at construction
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Point table and caps
    #[serde(default)]
    pub scoring: ScoringConfig,

    /// Inactivity decay tiers
    #[serde(default)]
    pub decay: DecayConfig,

    /// Weekly streak milestones
    #[serde(default)]
    pub streaks: StreakConfig,

    /// Anti-sybil heuristics
    #[serde(default)]
    pub sybil: SybilConfig,

    /// Referral programme
    #[serde(default)]
    pub referral: ReferralConfig,

    /// Fire-and-forget points queue
    #[serde(default)]
    pub queue: QueueConfig,
}

impl EngineConfig {
    /// Load from a TOML file, then apply `TALLY__*` environment overrides
    pub fn load(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.to_path_buf()))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .map_err(|e| TallyError::Validation(format!("config: {e}")))?;

        let cfg: EngineConfig = settings
            .try_deserialize()
            .map_err(|e| TallyError::Validation(format!("config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a TOML document without consulting the environment
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let cfg: EngineConfig =
            toml::from_str(raw).map_err(|e| TallyError::Validation(format!("config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| TallyError::Validation(format!("config: {e}")))
    }

    /// Reject tables whose step functions would not be monotone
    pub fn validate(&self) -> Result<()> {
        if self.scoring.default_weekly_cap <= 0 {
            return Err(TallyError::Validation(
                "scoring.default_weekly_cap must be positive".into(),
            ));
        }
        if self.scoring.score_precision == 0 {
            return Err(TallyError::Validation(
                "scoring.score_precision must be non-zero".into(),
            ));
        }
        for t in EventType::ALL {
            if self.scoring.table.rule(t).is_none() {
                return Err(TallyError::Validation(format!(
                    "scoring.table has no rule for {t}"
                )));
            }
        }

        let bands = &self.sybil.multiplier_bands;
        for pair in bands.windows(2) {
            if pair[0].min_risk <= pair[1].min_risk || pair[0].multiplier > pair[1].multiplier {
                return Err(TallyError::Validation(
                    "sybil.multiplier_bands must be sorted by descending risk with ascending multipliers"
                        .into(),
                ));
            }
        }
        if bands.iter().any(|b| !(0.0..=1.0).contains(&b.multiplier)) {
            return Err(TallyError::Validation(
                "sybil multipliers must lie in [0, 1]".into(),
            ));
        }

        for pair in self.decay.tiers.windows(2) {
            if pair[0].min_inactive_weeks <= pair[1].min_inactive_weeks {
                return Err(TallyError::Validation(
                    "decay.tiers must be sorted by descending inactivity".into(),
                ));
            }
        }
        if self.decay.tiers.iter().any(|t| !(0.0..1.0).contains(&t.rate)) {
            return Err(TallyError::Validation("decay rates must lie in [0, 1)".into()));
        }

        if self.referral.level_percentages.len() < self.referral.max_depth as usize {
            return Err(TallyError::Validation(
                "referral.level_percentages must cover max_depth levels".into(),
            ));
        }
        Ok(())
    }
}

/// How often one user may earn a given event type
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cooldown {
    Unlimited,
    /// Once per user, ever
    OneTime,
    /// Once per user per season-week
    Weekly,
}

/// Category, base points and cooldown for one event type
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventRule {
    pub event_type: EventType,
    pub category: Category,
    pub points: i64,
    #[serde(default = "default_cooldown")]
    pub cooldown: Cooldown,
}

fn default_cooldown() -> Cooldown {
    Cooldown::Unlimited
}

/// Immutable event type → rule table
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoringTable {
    pub rules: Vec<EventRule>,
}

impl ScoringTable {
    pub fn rule(&self, event_type: EventType) -> Option<&EventRule> {
        self.rules.iter().find(|r| r.event_type == event_type)
    }
}

impl Default for ScoringTable {
    fn default() -> Self {
        use Category::*;
        use Cooldown::*;
        use EventType::*;

        let rule = |event_type, category, points, cooldown| EventRule {
            event_type,
            category,
            points,
            cooldown,
        };

        Self {
            rules: vec![
                rule(FindingSubmitted, Security, 50, Unlimited),
                rule(FindingAccepted, Security, 500, Unlimited),
                rule(FindingPaid, Security, 1000, Unlimited),
                rule(EncryptedReport, Security, 25, Unlimited),
                rule(CriticalFinding, Security, 2000, Unlimited),
                rule(PocProvided, Security, 50, Unlimited),
                rule(ProtocolRegistered, Growth, 200, OneTime),
                rule(BountyCreated, Growth, 300, OneTime),
                rule(BountyFunded, Growth, 500, Unlimited),
                rule(ScopePublished, Growth, 100, Unlimited),
                rule(ReferralQualified, Growth, 100, Unlimited),
                rule(ReferralBonus, Growth, 0, Unlimited),
                rule(SbtMinted, Engagement, 100, OneTime),
                rule(SbtMintedEarly, Engagement, 200, OneTime),
                rule(AgentRegistered, Engagement, 25, OneTime),
                rule(WeeklyActive, Engagement, 10, Weekly),
                rule(WeeklySubmission, Engagement, 25, Weekly),
                rule(StreakBonus, Engagement, 100, Unlimited),
                rule(HeartbeatActive, Engagement, 5, Weekly),
                rule(XClaimed, Social, 50, OneTime),
                rule(XShareFinding, Social, 15, Unlimited),
                rule(FindingRejected, Penalty, -25, Unlimited),
                rule(FindingDuplicate, Penalty, -15, Unlimited),
                rule(SpamSubmission, Penalty, -100, Unlimited),
                rule(RateLimitPenalty, Penalty, -50, Unlimited),
                rule(LowQualityReport, Penalty, -30, Unlimited),
                rule(SybilDetected, Penalty, -500, Unlimited),
                rule(FarmingPattern, Penalty, -200, Unlimited),
            ],
        }
    }
}

/// Scoring configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ScoringConfig {
    /// Positive points countable per user per season-week when the season sets none
    #[serde(default = "default_weekly_cap")]
    pub default_weekly_cap: i64,

    /// Fixed-point units per score point used for allocation math
    #[serde(default = "default_score_precision")]
    pub score_precision: u64,

    #[serde(default)]
    pub table: ScoringTable,
}

fn default_weekly_cap() -> i64 {
    5000
}

fn default_score_precision() -> u64 {
    1_000_000
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            default_weekly_cap: default_weekly_cap(),
            score_precision: default_score_precision(),
            table: ScoringTable::default(),
        }
    }
}

/// One inactivity decay step
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DecayTier {
    pub min_inactive_weeks: u32,
    pub rate: f64,
}

/// Decay configuration; tiers sorted by descending inactivity
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DecayConfig {
    #[serde(default = "default_decay_tiers")]
    pub tiers: Vec<DecayTier>,
}

fn default_decay_tiers() -> Vec<DecayTier> {
    vec![
        DecayTier { min_inactive_weeks: 9, rate: 0.15 },
        DecayTier { min_inactive_weeks: 5, rate: 0.10 },
        DecayTier { min_inactive_weeks: 3, rate: 0.05 },
    ]
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            tiers: default_decay_tiers(),
        }
    }
}

impl DecayConfig {
    /// Rate for a given inactivity, if any tier applies
    pub fn rate_for(&self, inactive_weeks: u32) -> Option<f64> {
        self.tiers
            .iter()
            .find(|t| inactive_weeks >= t.min_inactive_weeks)
            .map(|t| t.rate)
    }
}

/// Streak configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StreakConfig {
    #[serde(default = "default_milestones")]
    pub milestones: Vec<u32>,
}

fn default_milestones() -> Vec<u32> {
    vec![4, 8, 12, 26, 52]
}

impl Default for StreakConfig {
    fn default() -> Self {
        Self {
            milestones: default_milestones(),
        }
    }
}

/// Risk → multiplier step
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RiskBand {
    pub min_risk: f64,
    pub multiplier: f64,
}

/// Cluster size → risk bump step
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ClusterBump {
    pub min_size: usize,
    pub bump: f64,
}

/// Anti-sybil configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SybilConfig {
    #[serde(default = "default_zero_tx_increment")]
    pub zero_transactions_increment: f64,

    #[serde(default = "default_low_balance_increment")]
    pub low_balance_increment: f64,

    #[serde(default = "default_no_history_increment")]
    pub no_history_increment: f64,

    /// Below this balance (wei) the `low_balance` flag applies
    #[serde(default = "default_min_balance_wei")]
    pub min_balance_wei: u64,

    /// Sorted by descending `min_risk`; risk below every band maps to 1.0
    #[serde(default = "default_multiplier_bands")]
    pub multiplier_bands: Vec<RiskBand>,

    #[serde(default = "default_min_cluster_size")]
    pub min_cluster_size: usize,

    /// Sorted by descending `min_size`
    #[serde(default = "default_cluster_bumps")]
    pub cluster_bumps: Vec<ClusterBump>,

    #[serde(default = "default_approve_score")]
    pub approve_score: f64,

    #[serde(default = "default_reject_score")]
    pub reject_score: f64,

    #[serde(default = "default_flag_score")]
    pub flag_score: f64,

    /// `check_wallet` reports `is_sybil` at or above this risk
    #[serde(default = "default_sybil_threshold")]
    pub sybil_threshold: f64,

    #[serde(default = "default_behavioral")]
    pub behavioral: BehavioralConfig,
}

/// Event-timing and event-diversity checks
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BehavioralConfig {
    /// Most recent events examined per user
    #[serde(default = "default_behavior_window")]
    pub window: usize,

    #[serde(default = "default_behavior_min_events")]
    pub min_events: usize,

    /// Gaps must be this uniform (std dev / mean) to look scripted
    #[serde(default = "default_regular_max_cv")]
    pub regular_max_cv: f64,

    #[serde(default = "default_regular_max_mean_secs")]
    pub regular_max_mean_secs: f64,

    /// More events than this, all of one type, is spam
    #[serde(default = "default_single_type_min_events")]
    pub single_type_min_events: usize,

    #[serde(default = "default_behavior_increment")]
    pub increment: f64,

    /// Ceiling on what this layer adds in total
    #[serde(default = "default_behavior_cap")]
    pub cap: f64,
}

fn default_behavioral() -> BehavioralConfig {
    BehavioralConfig::default()
}

fn default_behavior_window() -> usize {
    100
}

fn default_behavior_min_events() -> usize {
    5
}

fn default_regular_max_cv() -> f64 {
    0.1
}

fn default_regular_max_mean_secs() -> f64 {
    60.0
}

fn default_single_type_min_events() -> usize {
    20
}

fn default_behavior_increment() -> f64 {
    0.15
}

fn default_behavior_cap() -> f64 {
    0.5
}

impl Default for BehavioralConfig {
    fn default() -> Self {
        Self {
            window: default_behavior_window(),
            min_events: default_behavior_min_events(),
            regular_max_cv: default_regular_max_cv(),
            regular_max_mean_secs: default_regular_max_mean_secs(),
            single_type_min_events: default_single_type_min_events(),
            increment: default_behavior_increment(),
            cap: default_behavior_cap(),
        }
    }
}

fn default_zero_tx_increment() -> f64 {
    0.3
}

fn default_low_balance_increment() -> f64 {
    0.15
}

fn default_no_history_increment() -> f64 {
    0.2
}

fn default_min_balance_wei() -> u64 {
    100_000_000_000_000
}

fn default_multiplier_bands() -> Vec<RiskBand> {
    vec![
        RiskBand { min_risk: 0.8, multiplier: 0.0 },
        RiskBand { min_risk: 0.5, multiplier: 0.25 },
        RiskBand { min_risk: 0.2, multiplier: 0.75 },
    ]
}

fn default_min_cluster_size() -> usize {
    3
}

fn default_cluster_bumps() -> Vec<ClusterBump> {
    vec![
        ClusterBump { min_size: 10, bump: 0.5 },
        ClusterBump { min_size: 5, bump: 0.35 },
        ClusterBump { min_size: 3, bump: 0.2 },
    ]
}

fn default_approve_score() -> f64 {
    0.0
}

fn default_reject_score() -> f64 {
    1.0
}

fn default_flag_score() -> f64 {
    0.6
}

fn default_sybil_threshold() -> f64 {
    0.6
}

impl Default for SybilConfig {
    fn default() -> Self {
        Self {
            zero_transactions_increment: default_zero_tx_increment(),
            low_balance_increment: default_low_balance_increment(),
            no_history_increment: default_no_history_increment(),
            min_balance_wei: default_min_balance_wei(),
            multiplier_bands: default_multiplier_bands(),
            min_cluster_size: default_min_cluster_size(),
            cluster_bumps: default_cluster_bumps(),
            approve_score: default_approve_score(),
            reject_score: default_reject_score(),
            flag_score: default_flag_score(),
            sybil_threshold: default_sybil_threshold(),
            behavioral: BehavioralConfig::default(),
        }
    }
}

impl SybilConfig {
    /// Step function from risk to score multiplier; non-increasing in risk
    pub fn multiplier_for(&self, risk: f64) -> f64 {
        self.multiplier_bands
            .iter()
            .find(|b| risk >= b.min_risk)
            .map(|b| b.multiplier)
            .unwrap_or(1.0)
    }

    /// Risk bump for a funding cluster of `size` wallets
    pub fn cluster_bump(&self, size: usize) -> Option<f64> {
        if size < self.min_cluster_size {
            return None;
        }
        self.cluster_bumps
            .iter()
            .find(|b| size >= b.min_size)
            .map(|b| b.bump)
    }

    /// Size tiers a cluster of `size` has reached, smallest first, each with
    /// the risk it adds over the tier below. The steps sum to
    /// `cluster_bump(size)`.
    pub fn cluster_tiers(&self, size: usize) -> Vec<(usize, f64)> {
        if size < self.min_cluster_size {
            return Vec::new();
        }
        let mut reached: Vec<&ClusterBump> = self
            .cluster_bumps
            .iter()
            .filter(|b| size >= b.min_size)
            .collect();
        reached.sort_by_key(|b| b.min_size);

        let mut below = 0.0_f64;
        reached
            .into_iter()
            .map(|b| {
                let step = (b.bump - below).max(0.0);
                below = below.max(b.bump);
                (b.min_size, step)
            })
            .collect()
    }
}

/// Referral bonus multiplier once a referrer reaches `min_qualified`
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TaperStep {
    pub min_qualified: u64,
    pub factor: f64,
}

/// Referral configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ReferralConfig {
    #[serde(default = "default_code_prefix")]
    pub code_prefix: String,

    #[serde(default = "default_code_length")]
    pub code_length: usize,

    /// Redemption attempts allowed per window
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Sorted by descending `min_qualified`
    #[serde(default = "default_taper")]
    pub taper: Vec<TaperStep>,

    /// Minimum bonus after tapering
    #[serde(default = "default_min_bonus")]
    pub min_bonus: i64,

    /// Upline share of contributed points, level 1 first
    #[serde(default = "default_level_percentages")]
    pub level_percentages: Vec<f64>,

    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    /// Registrations per hour above which a referrer looks automated
    #[serde(default = "default_velocity_per_hour")]
    pub velocity_per_hour: u32,
}

fn default_code_prefix() -> String {
    "wc-".to_string()
}

fn default_code_length() -> usize {
    6
}

fn default_max_attempts() -> u32 {
    5
}

fn default_window_secs() -> u64 {
    3600
}

fn default_taper() -> Vec<TaperStep> {
    vec![
        TaperStep { min_qualified: 50, factor: 0.25 },
        TaperStep { min_qualified: 20, factor: 0.5 },
        TaperStep { min_qualified: 10, factor: 0.75 },
    ]
}

fn default_min_bonus() -> i64 {
    50
}

fn default_level_percentages() -> Vec<f64> {
    vec![0.10, 0.05, 0.025, 0.01, 0.005]
}

fn default_max_depth() -> u32 {
    5
}

fn default_velocity_per_hour() -> u32 {
    20
}

impl Default for ReferralConfig {
    fn default() -> Self {
        Self {
            code_prefix: default_code_prefix(),
            code_length: default_code_length(),
            max_attempts: default_max_attempts(),
            window_secs: default_window_secs(),
            taper: default_taper(),
            min_bonus: default_min_bonus(),
            level_percentages: default_level_percentages(),
            max_depth: default_max_depth(),
            velocity_per_hour: default_velocity_per_hour(),
        }
    }
}

impl ReferralConfig {
    /// Taper factor for a referrer that already has `qualified` referrals
    pub fn taper_factor(&self, qualified: u64) -> f64 {
        self.taper
            .iter()
            .find(|s| qualified >= s.min_qualified)
            .map(|s| s.factor)
            .unwrap_or(1.0)
    }
}

/// Points queue configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_capacity() -> usize {
    1024
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    50
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl QueueConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}
