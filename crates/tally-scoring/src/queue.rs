//! Fire-and-forget points queue
//!
//! Request handlers push `EventRequest`s and return immediately. A single
//! worker task applies them in order, retrying transient storage failures
//! with linear backoff. An event and its score update commit together, so a
//! retried request never leaves a second copy in the log.

use crate::engine::{EventRequest, RecordOutcome, ScoringEngine};
use std::sync::Arc;
use tally_core::config::QueueConfig;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Handle to the background recording worker
pub struct PointsQueue {
    tx: mpsc::Sender<EventRequest>,
    worker: JoinHandle<usize>,
}

impl PointsQueue {
    /// Spawn the worker on the current tokio runtime
    pub fn spawn(engine: Arc<ScoringEngine>, config: &QueueConfig) -> Self {
        let (tx, mut rx) = mpsc::channel::<EventRequest>(config.capacity.max(1));
        let max_retries = config.max_retries;
        let backoff = config.backoff();

        let worker = tokio::spawn(async move {
            let mut applied = 0usize;
            while let Some(request) = rx.recv().await {
                let mut attempt = 0u32;
                loop {
                    match engine.try_record(request.clone()) {
                        Ok(outcome) => {
                            if matches!(outcome, RecordOutcome::Recorded { .. }) {
                                applied += 1;
                            }
                            debug!(user = %request.user_id, ?outcome, "Queued event processed");
                            break;
                        }
                        Err(e) if e.is_recoverable() && attempt < max_retries => {
                            attempt += 1;
                            debug!(attempt, "Retrying queued event: {}", e);
                            tokio::time::sleep(backoff * attempt).await;
                        }
                        Err(e) => {
                            warn!(
                                user = %request.user_id,
                                event_type = %request.event_type,
                                attempts = attempt + 1,
                                "Dropping queued event: {}",
                                e
                            );
                            engine
                                .metrics()
                                .events_dropped
                                .with_label_values(&["queue"])
                                .inc();
                            break;
                        }
                    }
                }
            }
            applied
        });

        Self { tx, worker }
    }

    /// Enqueue without waiting; returns false if the queue is full or closed
    pub fn submit(&self, request: EventRequest) -> bool {
        match self.tx.try_send(request) {
            Ok(()) => true,
            Err(e) => {
                warn!("Points queue rejected event: {}", e);
                false
            }
        }
    }

    /// Enqueue, waiting for capacity
    pub async fn send(&self, request: EventRequest) -> bool {
        self.tx.send(request).await.is_ok()
    }

    /// Drain outstanding requests and stop; returns how many were applied
    pub async fn shutdown(self) -> usize {
        drop(self.tx);
        match self.worker.await {
            Ok(applied) => applied,
            Err(e) => {
                warn!("Points queue worker failed: {}", e);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tally_core::clock::ManualClock;
    use tally_core::config::EngineConfig;
    use tally_core::types::{EventType, SeasonConfig, SeasonStatus, UserId};
    use tally_storage::{MemoryRepository, Repository};

    fn engine(repo: Arc<MemoryRepository>) -> Arc<ScoringEngine> {
        let start = Utc.with_ymd_and_hms(2026, 2, 2, 0, 0, 0).unwrap();
        let mut season = SeasonConfig::pending(1, 5000);
        season.status = SeasonStatus::Active;
        season.start_date = Some(start);
        repo.insert_season(season).unwrap();
        Arc::new(
            ScoringEngine::new(
                repo,
                Arc::new(EngineConfig::default()),
                Arc::new(ManualClock::new(start)),
            )
            .unwrap(),
        )
    }

    fn quick() -> QueueConfig {
        QueueConfig {
            capacity: 16,
            max_retries: 3,
            backoff_ms: 1,
        }
    }

    #[tokio::test]
    async fn test_queue_applies_in_background() {
        let repo = Arc::new(MemoryRepository::new());
        let queue = PointsQueue::spawn(engine(repo.clone()), &quick());

        for _ in 0..5 {
            assert!(queue.submit(EventRequest::new(
                UserId::new("alice"),
                EventType::FindingSubmitted
            )));
        }
        assert_eq!(queue.shutdown().await, 5);

        let score = repo.get_score(&UserId::new("alice"), 1).unwrap().unwrap();
        assert_eq!(score.security_points, 250);
    }

    #[tokio::test]
    async fn test_queue_retries_transient_failures() {
        let repo = Arc::new(MemoryRepository::new());
        let queue = PointsQueue::spawn(engine(repo.clone()), &quick());

        repo.fail_next("append_event", 2);
        assert!(queue.send(EventRequest::new(UserId::new("bob"), EventType::FindingAccepted)).await);
        assert_eq!(queue.shutdown().await, 1);
        assert_eq!(repo.event_count(), 1);
    }

    #[tokio::test]
    async fn test_retry_after_score_failure_records_once() {
        let repo = Arc::new(MemoryRepository::new());
        let engine = engine(repo.clone());
        let queue = PointsQueue::spawn(engine.clone(), &quick());

        repo.fail_next("update_score", 1);
        assert!(queue.send(EventRequest::new(UserId::new("dave"), EventType::FindingAccepted)).await);
        assert_eq!(queue.shutdown().await, 1);
        assert_eq!(repo.event_count(), 1);

        let live = repo.get_score(&UserId::new("dave"), 1).unwrap().unwrap();
        assert_eq!(live.security_points, 500);
        engine.recalculate_all_scores(1).unwrap();
        let rebuilt = repo.get_score(&UserId::new("dave"), 1).unwrap().unwrap();
        assert_eq!(rebuilt.security_points, 500);
    }

    #[tokio::test]
    async fn test_queue_gives_up_after_retries() {
        let repo = Arc::new(MemoryRepository::new());
        let engine = engine(repo.clone());
        let queue = PointsQueue::spawn(engine.clone(), &quick());

        repo.fail_always("append_event");
        queue.send(EventRequest::new(UserId::new("carol"), EventType::FindingAccepted)).await;
        assert_eq!(queue.shutdown().await, 0);
        assert_eq!(
            engine
                .metrics()
                .events_dropped
                .with_label_values(&["queue"])
                .get(),
            1
        );
    }
}
