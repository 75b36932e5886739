//! Domain types shared by every Tally crate
//!
//! Identifiers are newtypes so that a user id can never be passed where a
//! wallet address is expected. Wallet addresses are normalized to lowercase
//! on construction, which makes them usable as canonical sort keys.

use crate::error::{Result, TallyError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Season number (1-based)
pub type Season = u32;

/// Week number within a season (1-based)
pub type Week = u32;

/// Store-assigned, strictly increasing event identifier
pub type EventId = u64;

/// Opaque event metadata. Ordered so serialized events are deterministic.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Stable user identifier handed out by the identity resolver
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// EVM wallet address, `0x` + 40 lowercase hex characters
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WalletAddress(String);

impl WalletAddress {
    /// Parse and normalize an address
    pub fn parse(raw: &str) -> Result<Self> {
        let lowered = raw.trim().to_ascii_lowercase();
        let body = lowered
            .strip_prefix("0x")
            .ok_or_else(|| TallyError::Validation(format!("address must start with 0x: {raw}")))?;

        if body.len() != 40 || hex::decode(body).is_err() {
            return Err(TallyError::Validation(format!(
                "address must be 20 hex-encoded bytes: {raw}"
            )));
        }

        Ok(Self(lowered))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Raw 20 address bytes
    pub fn to_bytes(&self) -> [u8; 20] {
        let mut out = [0u8; 20];
        // Validated at construction
        if let Ok(decoded) = hex::decode(&self.0[2..]) {
            out.copy_from_slice(&decoded);
        }
        out
    }
}

impl fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for WalletAddress {
    type Err = TallyError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for WalletAddress {
    type Error = TallyError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<WalletAddress> for String {
    fn from(value: WalletAddress) -> Self {
        value.0
    }
}

/// Score column an event type contributes to
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Security,
    Growth,
    Engagement,
    Social,
    /// Penalties accumulate as absolute values in `penalty_points`
    Penalty,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::Security => "security",
            Category::Growth => "growth",
            Category::Engagement => "engagement",
            Category::Social => "social",
            Category::Penalty => "penalty",
        };
        f.write_str(name)
    }
}

/// Every participation event the programme knows about
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Security
    FindingSubmitted,
    FindingAccepted,
    FindingPaid,
    EncryptedReport,
    CriticalFinding,
    PocProvided,
    // Growth
    ProtocolRegistered,
    BountyCreated,
    BountyFunded,
    ScopePublished,
    ReferralQualified,
    ReferralBonus,
    // Engagement
    SbtMinted,
    SbtMintedEarly,
    AgentRegistered,
    WeeklyActive,
    WeeklySubmission,
    StreakBonus,
    HeartbeatActive,
    // Social
    XClaimed,
    XShareFinding,
    // Penalties
    FindingRejected,
    FindingDuplicate,
    SpamSubmission,
    RateLimitPenalty,
    LowQualityReport,
    SybilDetected,
    FarmingPattern,
}

impl EventType {
    pub const ALL: [EventType; 28] = [
        EventType::FindingSubmitted,
        EventType::FindingAccepted,
        EventType::FindingPaid,
        EventType::EncryptedReport,
        EventType::CriticalFinding,
        EventType::PocProvided,
        EventType::ProtocolRegistered,
        EventType::BountyCreated,
        EventType::BountyFunded,
        EventType::ScopePublished,
        EventType::ReferralQualified,
        EventType::ReferralBonus,
        EventType::SbtMinted,
        EventType::SbtMintedEarly,
        EventType::AgentRegistered,
        EventType::WeeklyActive,
        EventType::WeeklySubmission,
        EventType::StreakBonus,
        EventType::HeartbeatActive,
        EventType::XClaimed,
        EventType::XShareFinding,
        EventType::FindingRejected,
        EventType::FindingDuplicate,
        EventType::SpamSubmission,
        EventType::RateLimitPenalty,
        EventType::LowQualityReport,
        EventType::SybilDetected,
        EventType::FarmingPattern,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::FindingSubmitted => "finding_submitted",
            EventType::FindingAccepted => "finding_accepted",
            EventType::FindingPaid => "finding_paid",
            EventType::EncryptedReport => "encrypted_report",
            EventType::CriticalFinding => "critical_finding",
            EventType::PocProvided => "poc_provided",
            EventType::ProtocolRegistered => "protocol_registered",
            EventType::BountyCreated => "bounty_created",
            EventType::BountyFunded => "bounty_funded",
            EventType::ScopePublished => "scope_published",
            EventType::ReferralQualified => "referral_qualified",
            EventType::ReferralBonus => "referral_bonus",
            EventType::SbtMinted => "sbt_minted",
            EventType::SbtMintedEarly => "sbt_minted_early",
            EventType::AgentRegistered => "agent_registered",
            EventType::WeeklyActive => "weekly_active",
            EventType::WeeklySubmission => "weekly_submission",
            EventType::StreakBonus => "streak_bonus",
            EventType::HeartbeatActive => "heartbeat_active",
            EventType::XClaimed => "x_claimed",
            EventType::XShareFinding => "x_share_finding",
            EventType::FindingRejected => "finding_rejected",
            EventType::FindingDuplicate => "finding_duplicate",
            EventType::SpamSubmission => "spam_submission",
            EventType::RateLimitPenalty => "rate_limit_penalty",
            EventType::LowQualityReport => "low_quality_report",
            EventType::SybilDetected => "sybil_detected",
            EventType::FarmingPattern => "farming_pattern",
        }
    }

    /// Bookkeeping events emitted by the weekly activity job itself.
    /// They never count as "activity" when computing streaks.
    pub fn is_activity_meta(&self) -> bool {
        matches!(
            self,
            EventType::WeeklyActive
                | EventType::WeeklySubmission
                | EventType::StreakBonus
                | EventType::HeartbeatActive
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = TallyError;

    fn from_str(s: &str) -> Result<Self> {
        EventType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| TallyError::Validation(format!("unknown event type: {s}")))
    }
}

/// Immutable participation fact
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParticipationEvent {
    pub id: EventId,
    pub user_id: UserId,
    pub event_type: EventType,
    pub season: Season,
    pub week: Week,
    /// Signed base points; negative for penalties
    pub points: i64,
    #[serde(default)]
    pub metadata: Metadata,
    pub verified: bool,
    /// Recorded against a season that no longer accepts score changes
    #[serde(default)]
    pub audit_only: bool,
    #[serde(default)]
    pub dedupe_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Event as submitted to the store, before an id is assigned
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub user_id: UserId,
    pub event_type: EventType,
    pub season: Season,
    pub week: Week,
    pub points: i64,
    pub metadata: Metadata,
    pub verified: bool,
    pub audit_only: bool,
    pub dedupe_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NewEvent {
    pub fn into_event(self, id: EventId) -> ParticipationEvent {
        ParticipationEvent {
            id,
            user_id: self.user_id,
            event_type: self.event_type,
            season: self.season,
            week: self.week,
            points: self.points,
            metadata: self.metadata,
            verified: self.verified,
            audit_only: self.audit_only,
            dedupe_key: self.dedupe_key,
            created_at: self.created_at,
        }
    }
}

/// Per-(user, season) aggregate
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContributionScore {
    pub user_id: UserId,
    pub season: Season,
    pub security_points: i64,
    pub growth_points: i64,
    pub engagement_points: i64,
    pub social_points: i64,
    /// Absolute value of all penalties
    pub penalty_points: i64,
    pub total_score: f64,
    pub sybil_multiplier: f64,
    /// Product of recorded decay adjustments
    pub decay_factor: f64,
    /// Positive points counted toward the weekly cap, per week
    pub weekly_positive: BTreeMap<Week, i64>,
    pub streak_weeks: u32,
    pub rank: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    /// Highest event id folded into this row
    #[serde(default)]
    pub last_event_id: EventId,
}

impl ContributionScore {
    pub fn new(user_id: UserId, season: Season, sybil_multiplier: f64, at: DateTime<Utc>) -> Self {
        Self {
            user_id,
            season,
            security_points: 0,
            growth_points: 0,
            engagement_points: 0,
            social_points: 0,
            penalty_points: 0,
            total_score: 0.0,
            sybil_multiplier,
            decay_factor: 1.0,
            weekly_positive: BTreeMap::new(),
            streak_weeks: 0,
            rank: None,
            created_at: at,
            last_active_at: at,
            last_event_id: 0,
        }
    }

    /// Category sum minus penalties, floored at zero
    pub fn base_points(&self) -> i64 {
        let earned =
            self.security_points + self.growth_points + self.engagement_points + self.social_points;
        (earned - self.penalty_points).max(0)
    }

    /// Re-derive `total_score` from the breakdown and multipliers
    pub fn recompute_total(&mut self) {
        self.total_score = self.base_points() as f64 * self.sybil_multiplier * self.decay_factor;
    }

    /// Add already-capped points to a category column
    pub fn apply_points(&mut self, category: Category, points: i64) {
        match category {
            Category::Security => self.security_points += points,
            Category::Growth => self.growth_points += points,
            Category::Engagement => self.engagement_points += points,
            Category::Social => self.social_points += points,
            Category::Penalty => self.penalty_points += points.abs(),
        }
    }

    /// Positive points still countable in `week` under `cap`
    pub fn remaining_cap(&self, week: Week, cap: i64) -> i64 {
        let used = self.weekly_positive.get(&week).copied().unwrap_or(0);
        (cap - used).max(0)
    }
}

/// Per-wallet sybil risk record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AntiSybilFlag {
    pub wallet_address: WalletAddress,
    pub risk_score: f64,
    pub flags: BTreeSet<String>,
    pub cluster_id: Option<String>,
    pub reviewed: bool,
    pub reviewed_by: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl AntiSybilFlag {
    pub fn new(wallet_address: WalletAddress, at: DateTime<Utc>) -> Self {
        Self {
            wallet_address,
            risk_score: 0.0,
            flags: BTreeSet::new(),
            cluster_id: None,
            reviewed: false,
            reviewed_by: None,
            updated_at: at,
        }
    }
}

/// Directed referral relationship; `referred_user_id` is unique across edges
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReferralEdge {
    pub referrer_user_id: UserId,
    pub referred_user_id: UserId,
    pub code: String,
    pub created_at: DateTime<Utc>,
    pub qualified: bool,
    pub qualified_at: Option<DateTime<Utc>>,
    pub qualifying_action: Option<String>,
}

/// A user's referral code and its counters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReferralLink {
    pub user_id: UserId,
    pub code: String,
    pub total_referred: u64,
    pub qualified_referred: u64,
    pub bonus_earned: i64,
    pub created_at: DateTime<Utc>,
}

/// Atomically incremented referral counters
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReferralCounter {
    TotalReferred,
    QualifiedReferred,
    BonusEarned,
}

/// Identity link between a user and their wallet
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: UserId,
    pub wallet_address: Option<WalletAddress>,
    pub created_at: DateTime<Utc>,
}

/// Season lifecycle states
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeasonStatus {
    Pending,
    Active,
    Frozen,
    Claiming,
    Completed,
}

impl SeasonStatus {
    /// Whether events recorded now roll into scores
    pub fn accepts_score_changes(&self) -> bool {
        matches!(self, SeasonStatus::Active)
    }
}

impl fmt::Display for SeasonStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SeasonStatus::Pending => "pending",
            SeasonStatus::Active => "active",
            SeasonStatus::Frozen => "frozen",
            SeasonStatus::Claiming => "claiming",
            SeasonStatus::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// Season parameters and lifecycle state
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SeasonConfig {
    pub season: Season,
    pub status: SeasonStatus,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    /// Reward pool in the smallest currency unit
    pub pool_size: Option<u128>,
    pub weekly_cap: i64,
    #[serde(default)]
    pub metadata: Metadata,
}

impl SeasonConfig {
    pub fn pending(season: Season, weekly_cap: i64) -> Self {
        Self {
            season,
            status: SeasonStatus::Pending,
            start_date: None,
            end_date: None,
            pool_size: None,
            weekly_cap,
            metadata: Metadata::new(),
        }
    }
}

/// Auditable record of one decay application
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DecayAdjustment {
    pub user_id: UserId,
    pub season: Season,
    pub week: Week,
    pub inactive_weeks: u32,
    pub rate: f64,
    pub score_before: f64,
    pub score_after: f64,
    pub created_at: DateTime<Utc>,
}

/// One participant's share of a season pool
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub wallet_address: WalletAddress,
    pub total_score: f64,
    pub share_pct: f64,
    pub allocation_amount: u128,
    pub merkle_index: u32,
}

/// Frozen allocation set for a season together with its commitment
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SeasonSnapshot {
    pub season: Season,
    pub pool_size: u128,
    #[serde(with = "hex32")]
    pub merkle_root: [u8; 32],
    pub total_score_units: u128,
    pub allocated: u128,
    /// Rounding remainder left in the pool
    pub dust: u128,
    pub allocations: Vec<Allocation>,
    pub generated_at: DateTime<Utc>,
}

impl SeasonSnapshot {
    pub fn root_hex(&self) -> String {
        format!("0x{}", hex::encode(self.merkle_root))
    }

    pub fn allocation_for(&self, wallet: &WalletAddress) -> Option<&Allocation> {
        self.allocations
            .binary_search_by(|a| a.wallet_address.cmp(wallet))
            .ok()
            .map(|i| &self.allocations[i])
    }
}

/// Serde helper rendering 32-byte digests as `0x`-prefixed hex
pub mod hex32 {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let raw = String::deserialize(d)?;
        parse(&raw).map_err(D::Error::custom)
    }

    /// Parse a 32-byte hex digest, with or without `0x`
    pub fn parse(raw: &str) -> Result<[u8; 32], String> {
        let body = raw.strip_prefix("0x").unwrap_or(raw);
        let decoded = hex::decode(body).map_err(|e| format!("invalid hex digest: {e}"))?;
        decoded
            .try_into()
            .map_err(|_| "digest must be 32 bytes".to_string())
    }

    /// Same encoding for digest lists
    pub mod vec {
        use serde::{de::Error, Deserialize, Deserializer, Serializer, ser::SerializeSeq};

        pub fn serialize<S: Serializer>(items: &[[u8; 32]], s: S) -> Result<S::Ok, S::Error> {
            let mut seq = s.serialize_seq(Some(items.len()))?;
            for item in items {
                seq.serialize_element(&format!("0x{}", hex::encode(item)))?;
            }
            seq.end()
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<[u8; 32]>, D::Error> {
            let raw = Vec::<String>::deserialize(d)?;
            raw.iter()
                .map(|r| super::parse(r).map_err(D::Error::custom))
                .collect()
        }
    }
}

/// Role of the party invoking an operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

/// Authenticated caller, as produced by the identity resolver
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub id: String,
    pub role: Role,
}

impl Caller {
    pub fn admin(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::Admin,
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::User,
        }
    }

    /// Gate for administrative operations
    pub fn require_admin(&self) -> Result<()> {
        match self.role {
            Role::Admin => Ok(()),
            Role::User => Err(TallyError::Authorization(format!(
                "{} is not allowed to perform admin operations",
                self.id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wallet_address_normalization() {
        let addr = WalletAddress::parse("0xABCDEFabcdef0123456789abcdef0123456789AB").unwrap();
        assert_eq!(addr.as_str(), "0xabcdefabcdef0123456789abcdef0123456789ab");
        assert_eq!(addr.to_bytes()[0], 0xab);
    }

    #[test]
    fn test_wallet_address_rejects_garbage() {
        assert!(WalletAddress::parse("abcdef").is_err());
        assert!(WalletAddress::parse("0x1234").is_err());
        assert!(WalletAddress::parse("0xzz00000000000000000000000000000000000000").is_err());
    }

    #[test]
    fn test_event_type_round_trip_names() {
        for t in EventType::ALL {
            assert_eq!(t.as_str().parse::<EventType>().unwrap(), t);
            let json = serde_json::to_string(&t).unwrap();
            assert_eq!(json, format!("\"{}\"", t.as_str()));
        }
    }

    #[test]
    fn test_total_score_invariant() {
        let mut score = ContributionScore::new(UserId::new("u1"), 1, 0.75, Utc::now());
        score.apply_points(Category::Security, 500);
        score.apply_points(Category::Social, 20);
        score.apply_points(Category::Penalty, -100);
        score.recompute_total();

        assert_eq!(score.penalty_points, 100);
        assert_eq!(score.base_points(), 420);
        assert!((score.total_score - 315.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_total_score_floors_at_zero() {
        let mut score = ContributionScore::new(UserId::new("u1"), 1, 1.0, Utc::now());
        score.apply_points(Category::Growth, 10);
        score.apply_points(Category::Penalty, -500);
        score.recompute_total();
        assert_eq!(score.total_score, 0.0);
    }

    #[test]
    fn test_snapshot_root_serializes_as_hex() {
        let snapshot = SeasonSnapshot {
            season: 1,
            pool_size: 10,
            merkle_root: [0xab; 32],
            total_score_units: 0,
            allocated: 0,
            dust: 10,
            allocations: Vec::new(),
            generated_at: Utc::now(),
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["merkle_root"], serde_json::json!(snapshot.root_hex()));

        let back: SeasonSnapshot = serde_json::from_value(json).unwrap();
        assert_eq!(back, snapshot);
    }

    #[test]
    fn test_caller_admin_gate() {
        assert!(Caller::admin("ops").require_admin().is_ok());
        let err = Caller::user("alice").require_admin().unwrap_err();
        assert!(matches!(err, TallyError::Authorization(_)));
    }
}
