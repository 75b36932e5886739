//! Prometheus counters for the scoring engine

use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

/// Scoring engine metrics
pub struct ScoringMetrics {
    registry: Registry,
    /// Events that rolled into a score, by event type
    pub events_recorded: IntCounterVec,
    /// Events whose points were partially or fully cut by the weekly cap
    pub events_capped: IntCounter,
    /// Events dropped by cooldowns, missing seasons or storage failures
    pub events_dropped: IntCounterVec,
    /// Events stored against a frozen season
    pub events_audit_only: IntCounter,
    /// Completed batch passes, by job
    pub batch_passes: IntCounterVec,
}

impl ScoringMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let events_recorded = IntCounterVec::new(
            Opts::new("tally_events_recorded_total", "Events rolled into scores"),
            &["event_type"],
        )?;
        let events_capped = IntCounter::new(
            "tally_events_capped_total",
            "Events reduced by the weekly cap",
        )?;
        let events_dropped = IntCounterVec::new(
            Opts::new("tally_events_dropped_total", "Events not recorded"),
            &["reason"],
        )?;
        let events_audit_only = IntCounter::new(
            "tally_events_audit_only_total",
            "Events stored for audit only",
        )?;
        let batch_passes = IntCounterVec::new(
            Opts::new("tally_batch_passes_total", "Completed batch passes"),
            &["job"],
        )?;

        registry.register(Box::new(events_recorded.clone()))?;
        registry.register(Box::new(events_capped.clone()))?;
        registry.register(Box::new(events_dropped.clone()))?;
        registry.register(Box::new(events_audit_only.clone()))?;
        registry.register(Box::new(batch_passes.clone()))?;

        Ok(Self {
            registry,
            events_recorded,
            events_capped,
            events_dropped,
            events_audit_only,
            batch_passes,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render in the Prometheus text exposition format
    pub fn render(&self) -> String {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_counters() {
        let metrics = ScoringMetrics::new().unwrap();
        metrics
            .events_recorded
            .with_label_values(&["finding_submitted"])
            .inc();
        metrics.events_capped.inc();

        let text = metrics.render();
        assert!(text.contains("tally_events_recorded_total{event_type=\"finding_submitted\"} 1"));
        assert!(text.contains("tally_events_capped_total 1"));
    }
}
