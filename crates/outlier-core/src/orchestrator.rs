//! Online detection for a single incoming event.
//!
//! ```text
//! Received ─► Persisted ─► WindowResolved ─► FeaturesComputed ─► Decided ─► Returned
//! ```
//!
//! A failure at any step aborts the rest and moves the detection to
//! [`DetectionStage::Failed`]; the reason travels as the returned
//! [`DetectError`], and the span's `stage` field reads `failed`. The log
//! append is never rolled back: the event happened whether or not it could
//! be scored.
//!
//! The window is pruned and touched at the local clock. Only aggregation
//! uses `as_of = max(now, event.timestamp)`, so an event stamped far ahead
//! cannot push older events out of the window or keep the entity alive.

use crate::clock::Clock;
use crate::ensemble;
use crate::error::DetectError;
use crate::event::{Event, FeatureVector};
use crate::features::Aggregator;
use crate::models::ModelRegistry;
use crate::store::LogStore;
use crate::verdict::EnsembleDecision;
use crate::window::{WindowState, WindowStore};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, Span, debug, field, info_span, warn};

/// Last step a detection completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionStage {
    Received,
    Persisted,
    WindowResolved,
    FeaturesComputed,
    Decided,
    Returned,
    /// Terminal: some step returned an error.
    Failed,
}

impl DetectionStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Persisted => "persisted",
            Self::WindowResolved => "window_resolved",
            Self::FeaturesComputed => "features_computed",
            Self::Decided => "decided",
            Self::Returned => "returned",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for DetectionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectionOutcome {
    pub event: Event,
    pub features: FeatureVector,
    pub decision: EnsembleDecision,
    /// Whether the entity's window was already cached
    pub window_hit: bool,
}

impl DetectionOutcome {
    pub fn reason(&self) -> String {
        self.decision.reason()
    }
}

pub struct Orchestrator {
    log_store: Arc<dyn LogStore>,
    windows: Arc<WindowStore>,
    models: Arc<ModelRegistry>,
    aggregator: Aggregator,
    clock: Arc<dyn Clock>,
    detect_timeout: Duration,
}

impl Orchestrator {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(
        log_store: Arc<dyn LogStore>,
        windows: Arc<WindowStore>,
        models: Arc<ModelRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let aggregator = Aggregator::new(windows.config().window_length);
        Self {
            log_store,
            windows,
            models,
            aggregator,
            clock,
            detect_timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, detect_timeout: Duration) -> Self {
        self.detect_timeout = detect_timeout;
        self
    }

    pub fn windows(&self) -> &Arc<WindowStore> {
        &self.windows
    }

    pub fn models(&self) -> &Arc<ModelRegistry> {
        &self.models
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    /// Persist, window, aggregate and score one event.
    pub async fn detect(&self, event: Event) -> Result<DetectionOutcome, DetectError> {
        let span = info_span!(
            "detect",
            entity = %event.entity_key,
            status = event.status_code,
            stage = field::Empty,
        );
        let mut stage = DetectionStage::Received;

        let result = tokio::time::timeout(self.detect_timeout, self.run(event, &mut stage))
            .instrument(span.clone())
            .await
            .unwrap_or(Err(DetectError::TimedOut(self.detect_timeout)));

        if let Err(e) = &result {
            span.record("stage", DetectionStage::Failed.as_str());
            span.in_scope(|| {
                warn!(kind = e.kind(), after = %stage, error = %e, "Detection failed");
            });
        }
        result
    }

    async fn run(
        &self,
        event: Event,
        stage: &mut DetectionStage,
    ) -> Result<DetectionOutcome, DetectError> {
        self.log_store.append(&event).await?;
        advance(stage, DetectionStage::Persisted);

        let now = self.clock.now();
        let as_of = now.max(event.timestamp);
        let (window, window_hit) = self.resolve_window(&event, now).await?;
        advance(stage, DetectionStage::WindowResolved);

        let features = self.aggregator.aggregate(&event.entity_key, &window.events, as_of);
        advance(stage, DetectionStage::FeaturesComputed);

        let models = self.models.current();
        if models.is_empty() {
            return Err(DetectError::NoModelsAvailable);
        }
        let decision = ensemble::decide(&features, &models).await?;
        advance(stage, DetectionStage::Decided);

        advance(stage, DetectionStage::Returned);
        Ok(DetectionOutcome {
            event,
            features,
            decision,
            window_hit,
        })
    }

    async fn resolve_window(
        &self,
        event: &Event,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<(WindowState, bool), DetectError> {
        let key = event.entity_key.as_str();
        if let Some(window) = self.windows.merge_existing(key, event.clone(), now) {
            debug!(entity = %key, events = window.len(), "Window cache hit");
            return Ok((window, true));
        }

        // open-ended, so events stamped at or after `now` come back too; no
        // window lock is held across the query
        let start = self.aggregator.window_start(now);
        let mut backfill = self.log_store.query_since(key, start).await?;
        debug!(entity = %key, backfilled = backfill.len(), "Window cache miss");

        backfill.push(event.clone());
        Ok((self.windows.seed(key, backfill, now), false))
    }
}

fn advance(stage: &mut DetectionStage, next: DetectionStage) {
    *stage = next;
    Span::current().record("stage", next.as_str());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::{ScoringError, StorageError};
    use crate::models::{Scorer, StaticModelProvider};
    use crate::store::SqliteStore;
    use crate::verdict::ModelVerdict;
    use crate::window::WindowConfig;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};

    struct Threshold {
        id: &'static str,
        max_client_errors: u64,
    }

    #[async_trait]
    impl Scorer for Threshold {
        fn model_id(&self) -> &str {
            self.id
        }

        async fn score(&self, f: &FeatureVector) -> Result<ModelVerdict, ScoringError> {
            let score = f.client_error_count as f64;
            Ok(ModelVerdict::new(self.id, f.client_error_count > self.max_client_errors, score))
        }
    }

    struct Sleepy;

    #[async_trait]
    impl Scorer for Sleepy {
        fn model_id(&self) -> &str {
            "sleepy"
        }

        async fn score(&self, _f: &FeatureVector) -> Result<ModelVerdict, ScoringError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(ModelVerdict::new("sleepy", false, 0.0))
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 10, 27, 10, 0, 0).unwrap()
    }

    fn secs(s: i64) -> DateTime<Utc> {
        t0() + chrono::Duration::seconds(s)
    }

    struct Harness {
        store: Arc<SqliteStore>,
        clock: Arc<ManualClock>,
        orchestrator: Orchestrator,
    }

    async fn harness(model_ids: &[&str]) -> Harness {
        let provider = StaticModelProvider::new()
            .with_scorer(Arc::new(Threshold { id: "lof", max_client_errors: 1 }))
            .with_scorer(Arc::new(Threshold { id: "iforest", max_client_errors: 1 }))
            .with_scorer(Arc::new(Threshold { id: "knn", max_client_errors: 5 }))
            .with_scorer(Arc::new(Sleepy));
        let models = Arc::new(ModelRegistry::new(Arc::new(provider)));
        if !model_ids.is_empty() {
            let ids: Vec<String> = model_ids.iter().map(|s| s.to_string()).collect();
            models.reload(&ids).await.unwrap();
        }

        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(t0()));
        let windows = Arc::new(WindowStore::new(WindowConfig::default()));
        let orchestrator = Orchestrator::new(store.clone(), windows, models, clock.clone());
        Harness {
            store,
            clock,
            orchestrator,
        }
    }

    #[tokio::test]
    async fn test_detect_majority_over_window() {
        let h = harness(&["lof", "iforest", "knn"]).await;
        let codes = [(10, 200), (20, 404), (30, 500), (50, 401)];

        let mut last = None;
        for (s, code) in codes {
            h.clock.set(secs(s));
            last = Some(
                h.orchestrator
                    .detect(Event::new(secs(s), "192.168.1.1", "/api", code))
                    .await
                    .unwrap(),
            );
        }

        let outcome = last.unwrap();
        assert_eq!(outcome.features.request_count, 4);
        assert_eq!(outcome.features.client_error_count, 2);
        assert_eq!(outcome.features.server_error_count, 1);
        assert!(outcome.window_hit);
        // lof and iforest fire, knn does not
        assert!(outcome.decision.is_anomaly);
        assert_eq!(outcome.reason(), "2 out of 3 models flagged it as an anomaly.");
    }

    #[tokio::test]
    async fn test_empty_model_set_still_persists() {
        let h = harness(&[]).await;
        let event = Event::new(t0(), "10.0.0.9", "/", 200);

        let err = h.orchestrator.detect(event.clone()).await.unwrap_err();
        assert!(matches!(err, DetectError::NoModelsAvailable));
        assert_eq!(err.kind(), "not_ready");
        assert_eq!(h.store.all_events().await.unwrap(), vec![event]);
    }

    #[tokio::test]
    async fn test_miss_backfills_from_log() {
        let h = harness(&["lof"]).await;
        h.store.append(&Event::new(secs(-120), "a", "/", 404)).await.unwrap();
        h.store.append(&Event::new(secs(-400), "a", "/", 404)).await.unwrap();

        let outcome = h.orchestrator.detect(Event::new(t0(), "a", "/", 200)).await.unwrap();
        assert!(!outcome.window_hit);
        assert_eq!(outcome.features.request_count, 2);
        assert_eq!(outcome.features.client_error_count, 1);
    }

    #[tokio::test]
    async fn test_event_ahead_of_clock_counts_itself() {
        let h = harness(&["lof"]).await;
        let ahead = Event::new(secs(3), "a", "/", 500);
        let outcome = h.orchestrator.detect(ahead).await.unwrap();
        assert_eq!(outcome.features.window_end, secs(3));
        assert_eq!(outcome.features.server_error_count, 1);
    }

    #[tokio::test]
    async fn test_timeout_keeps_persisted_event() {
        let h = harness(&["sleepy"]).await;
        let orchestrator = Orchestrator::new(
            h.store.clone(),
            Arc::clone(h.orchestrator.windows()),
            Arc::clone(h.orchestrator.models()),
            h.clock.clone(),
        )
        .with_timeout(Duration::from_millis(50));

        let err = orchestrator.detect(Event::new(t0(), "a", "/", 200)).await.unwrap_err();
        assert!(matches!(err, DetectError::TimedOut(_)));
        assert_eq!(err.kind(), "timeout");
        assert_eq!(h.store.all_events().await.unwrap().len(), 1);
    }

    struct BrokenLog;

    #[async_trait]
    impl LogStore for BrokenLog {
        async fn append(&self, _event: &Event) -> Result<(), StorageError> {
            Err(StorageError::Task("disk full".into()))
        }

        async fn query(
            &self,
            _entity_key: &str,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
        ) -> Result<Vec<Event>, StorageError> {
            Ok(Vec::new())
        }

        async fn query_since(
            &self,
            _entity_key: &str,
            _start: DateTime<Utc>,
        ) -> Result<Vec<Event>, StorageError> {
            Ok(Vec::new())
        }

        async fn all_events(&self) -> Result<Vec<Event>, StorageError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_append_failure_is_storage_error() {
        let h = harness(&["lof"]).await;
        let orchestrator = Orchestrator::new(
            Arc::new(BrokenLog),
            Arc::clone(h.orchestrator.windows()),
            Arc::clone(h.orchestrator.models()),
            h.clock.clone(),
        );

        let err = orchestrator.detect(Event::new(t0(), "a", "/", 200)).await.unwrap_err();
        assert_eq!(err.kind(), "storage");
        assert!(orchestrator.windows().is_empty());
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(DetectionStage::WindowResolved.to_string(), "window_resolved");
        assert_eq!(DetectionStage::Returned.as_str(), "returned");
        assert_eq!(DetectionStage::Failed.to_string(), "failed");
    }
}
