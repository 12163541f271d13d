//! Full recomputation of the feature table from the event log.
//!
//! Runs on a slow external cadence. Nothing on the online path waits for it,
//! and a failed run leaves the previous feature table in place.

use crate::error::StorageError;
use crate::event::{Event, FeatureVector};
use crate::features::Aggregator;
use crate::store::{FeatureStore, LogStore};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub entities: usize,
    pub vectors: usize,
    pub elapsed: Duration,
}

pub struct BatchPipeline {
    log_store: Arc<dyn LogStore>,
    feature_store: Arc<dyn FeatureStore>,
    aggregator: Aggregator,
}

impl BatchPipeline {
    pub fn new(
        log_store: Arc<dyn LogStore>,
        feature_store: Arc<dyn FeatureStore>,
        aggregator: Aggregator,
    ) -> Self {
        Self {
            log_store,
            feature_store,
            aggregator,
        }
    }

    /// Read every event, rebuild every rolling feature vector and replace the
    /// feature table.
    pub async fn recompute(&self) -> Result<BatchReport, StorageError> {
        let started = Instant::now();
        info!(
            window_secs = self.aggregator.window_length().num_seconds(),
            "Starting batch feature recomputation"
        );

        let result = self.run().await;
        match result {
            Ok((entities, vectors)) => {
                let report = BatchReport {
                    entities,
                    vectors,
                    elapsed: started.elapsed(),
                };
                info!(
                    entities = report.entities,
                    vectors = report.vectors,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "Batch feature recomputation finished"
                );
                Ok(report)
            }
            Err(e) => {
                error!(error = %e, "Batch feature recomputation failed");
                Err(e)
            }
        }
    }

    async fn run(&self) -> Result<(usize, usize), StorageError> {
        let events = self.log_store.all_events().await?;
        let features = compute_all(&self.aggregator, events);
        let entities = features.len();
        let vectors = features.values().map(Vec::len).sum();
        self.feature_store.replace_all(features).await?;
        Ok((entities, vectors))
    }
}

/// One feature vector per distinct event, as of that event's timestamp,
/// grouped by entity.
pub fn compute_all(
    aggregator: &Aggregator,
    events: impl IntoIterator<Item = Event>,
) -> BTreeMap<String, Vec<FeatureVector>> {
    let mut by_entity: BTreeMap<String, Vec<Event>> = BTreeMap::new();
    for event in events {
        by_entity.entry(event.entity_key.clone()).or_default().push(event);
    }

    by_entity
        .into_iter()
        .map(|(entity_key, mut events)| {
            events.sort_unstable();
            events.dedup();

            let vectors = events
                .iter()
                .map(|event| {
                    let as_of = event.timestamp;
                    let start = aggregator.window_start(as_of);
                    let lo = events.partition_point(|e| e.timestamp < start);
                    let hi = events.partition_point(|e| e.timestamp <= as_of);
                    aggregator.aggregate(&entity_key, &events[lo..hi], as_of)
                })
                .collect();
            (entity_key, vectors)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 10, 27, h, m, s).unwrap()
    }

    fn five_minutes() -> Aggregator {
        Aggregator::new(chrono::Duration::minutes(5))
    }

    fn sample_log() -> Vec<Event> {
        vec![
            Event::new(at(10, 0, 10), "192.168.1.1", "/api/login", 200),
            Event::new(at(10, 0, 20), "192.168.1.1", "/api/data", 404),
            Event::new(at(10, 0, 30), "192.168.1.1", "/api/data", 500),
            Event::new(at(10, 0, 50), "192.168.1.1", "/api/admin", 401),
            Event::new(at(10, 1, 0), "192.168.1.2", "/api/login", 200),
        ]
    }

    fn counts(v: &FeatureVector) -> (u64, u64, u64) {
        (v.request_count, v.client_error_count, v.server_error_count)
    }

    #[test]
    fn test_rolling_vectors_per_entity() {
        let features = compute_all(&five_minutes(), sample_log());
        assert_eq!(features.len(), 2);

        let first = &features["192.168.1.1"];
        assert_eq!(
            first.iter().map(counts).collect::<Vec<_>>(),
            vec![(1, 0, 0), (2, 1, 0), (3, 1, 1), (4, 2, 1)]
        );
        assert_eq!(first[3].window_end, at(10, 0, 50));

        let second = &features["192.168.1.2"];
        assert_eq!(second.iter().map(counts).collect::<Vec<_>>(), vec![(1, 0, 0)]);
    }

    #[test]
    fn test_old_events_roll_out() {
        let events = vec![
            Event::new(at(10, 0, 0), "a", "/", 500),
            Event::new(at(10, 5, 0), "a", "/", 200),
            Event::new(at(10, 5, 1), "a", "/", 200),
        ];
        let features = compute_all(&five_minutes(), events);
        let rows = features["a"].iter().map(counts).collect::<Vec<_>>();
        // 10:05:00 still sees 10:00:00 on the boundary; 10:05:01 does not
        assert_eq!(rows, vec![(1, 0, 1), (2, 0, 1), (2, 0, 0)]);
    }

    #[test]
    fn test_unsorted_and_duplicated_log() {
        let mut events = sample_log();
        events.reverse();
        events.push(events[0].clone());
        let features = compute_all(&five_minutes(), events);
        assert_eq!(features["192.168.1.1"].len(), 4);
        assert_eq!(counts(features["192.168.1.1"].last().unwrap()), (4, 2, 1));
    }

    #[test]
    fn test_matches_aggregate_over_full_log() {
        let aggregator = five_minutes();
        let log = sample_log();
        let features = compute_all(&aggregator, log.clone());
        for (entity, vectors) in &features {
            for v in vectors {
                assert_eq!(*v, aggregator.aggregate(entity, &log, v.window_end));
            }
        }
    }

    #[tokio::test]
    async fn test_recompute_writes_feature_table() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        for event in sample_log() {
            store.append(&event).await.unwrap();
        }

        let pipeline = BatchPipeline::new(store.clone(), store.clone(), five_minutes());
        let report = pipeline.recompute().await.unwrap();
        assert_eq!(report.entities, 2);
        assert_eq!(report.vectors, 5);

        let stored = store.features_for("192.168.1.1").await.unwrap();
        assert_eq!(counts(stored.last().unwrap()), (4, 2, 1));

        // a rerun replaces rather than appends
        pipeline.recompute().await.unwrap();
        assert_eq!(store.features_for("192.168.1.1").await.unwrap().len(), 4);
    }
}
