//! Behavioral checks over a user's own event history
//!
//! Scripted clients tend to fire events at near-constant intervals, or to
//! hammer a single event type. Both are read from the event log alone.

use crate::hygiene::HygieneSignal;
use std::collections::HashSet;
use tally_core::config::BehavioralConfig;
use tally_core::types::ParticipationEvent;

pub const REGULAR_TIMING_PATTERN: &str = "regular_timing_pattern";
pub const SINGLE_EVENT_TYPE_SPAM: &str = "single_event_type_spam";

/// Signals for `events`, which must be in chronological order
pub fn behavior_signals(
    events: &[ParticipationEvent],
    config: &BehavioralConfig,
) -> Vec<HygieneSignal> {
    if events.len() < config.min_events {
        return Vec::new();
    }

    let mut flags = Vec::new();
    if regular_timing(events, config) {
        flags.push(REGULAR_TIMING_PATTERN);
    }
    let types: HashSet<_> = events.iter().map(|e| e.event_type).collect();
    if types.len() == 1 && events.len() > config.single_type_min_events {
        flags.push(SINGLE_EVENT_TYPE_SPAM);
    }

    let mut budget = config.cap;
    flags
        .into_iter()
        .map(|flag| {
            let increment = config.increment.min(budget).max(0.0);
            budget -= increment;
            HygieneSignal {
                flag: flag.to_string(),
                increment,
            }
        })
        .collect()
}

fn regular_timing(events: &[ParticipationEvent], config: &BehavioralConfig) -> bool {
    let gaps: Vec<f64> = events
        .windows(2)
        .map(|pair| (pair[1].created_at - pair[0].created_at).num_milliseconds() as f64 / 1000.0)
        .collect();
    if gaps.len() <= 3 {
        return false;
    }

    let n = gaps.len() as f64;
    let mean = gaps.iter().sum::<f64>() / n;
    let variance = gaps.iter().map(|g| (g - mean).powi(2)).sum::<f64>() / n;
    let cv = variance.sqrt() / if mean == 0.0 { 1.0 } else { mean };
    cv < config.regular_max_cv && mean < config.regular_max_mean_secs
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use tally_core::types::{EventType, Metadata, UserId};

    fn events(offsets_secs: &[i64], types: &[EventType]) -> Vec<ParticipationEvent> {
        let start = Utc.with_ymd_and_hms(2026, 4, 1, 12, 0, 0).unwrap();
        offsets_secs
            .iter()
            .enumerate()
            .map(|(i, secs)| ParticipationEvent {
                id: i as u64 + 1,
                user_id: UserId::new("bot"),
                event_type: types[i % types.len()],
                season: 1,
                week: 1,
                points: 10,
                metadata: Metadata::new(),
                verified: false,
                audit_only: false,
                dedupe_key: None,
                created_at: start + Duration::seconds(*secs),
            })
            .collect()
    }

    fn flags(signals: &[HygieneSignal]) -> Vec<&str> {
        signals.iter().map(|s| s.flag.as_str()).collect()
    }

    #[test]
    fn test_metronome_timing_is_flagged() {
        let offsets: Vec<i64> = (0..10).map(|i| i * 30).collect();
        let signals = behavior_signals(
            &events(&offsets, &[EventType::FindingSubmitted, EventType::XShareFinding]),
            &BehavioralConfig::default(),
        );
        assert_eq!(flags(&signals), vec![REGULAR_TIMING_PATTERN]);
        assert_eq!(signals[0].increment, 0.15);
    }

    #[test]
    fn test_human_timing_passes() {
        let offsets = [0, 40, 400, 460, 3_000, 3_100, 9_000];
        let signals = behavior_signals(
            &events(&offsets, &[EventType::FindingSubmitted, EventType::XShareFinding]),
            &BehavioralConfig::default(),
        );
        assert!(signals.is_empty());
    }

    #[test]
    fn test_regular_but_slow_passes() {
        let offsets: Vec<i64> = (0..10).map(|i| i * 3_600).collect();
        let signals = behavior_signals(
            &events(&offsets, &[EventType::FindingSubmitted, EventType::XShareFinding]),
            &BehavioralConfig::default(),
        );
        assert!(signals.is_empty());
    }

    #[test]
    fn test_single_type_spam_and_cap() {
        let offsets: Vec<i64> = (0..21).map(|i| i * 10).collect();
        let mut config = BehavioralConfig::default();
        let signals = behavior_signals(&events(&offsets, &[EventType::XShareFinding]), &config);
        assert_eq!(
            flags(&signals),
            vec![REGULAR_TIMING_PATTERN, SINGLE_EVENT_TYPE_SPAM]
        );

        config.cap = 0.2;
        let capped = behavior_signals(&events(&offsets, &[EventType::XShareFinding]), &config);
        let total: f64 = capped.iter().map(|s| s.increment).sum();
        assert!((total - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_twenty_events_of_one_type_is_not_spam() {
        let offsets = [0, 5, 700, 710, 2_000, 2_600, 2_601, 5_000, 5_300, 8_000,
            8_100, 9_000, 9_500, 12_000, 12_001, 15_000, 15_900, 16_000, 20_000, 20_500];
        let signals = behavior_signals(
            &events(&offsets, &[EventType::XShareFinding]),
            &BehavioralConfig::default(),
        );
        assert!(signals.is_empty());
    }

    #[test]
    fn test_too_few_events() {
        let signals = behavior_signals(
            &events(&[0, 1, 2, 3], &[EventType::XShareFinding]),
            &BehavioralConfig::default(),
        );
        assert!(signals.is_empty());
    }
}
