//! Feature aggregation over a trailing window.
//!
//! The online path and the batch pipeline both go through
//! [`Aggregator::aggregate`]; keeping one rule is what makes their feature
//! values identical for the same entity, instant and event set.

use crate::event::{Event, FeatureVector};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy)]
pub struct Aggregator {
    window_length: Duration,
}

impl Aggregator {
    pub fn new(window_length: Duration) -> Self {
        Self { window_length }
    }

    pub fn window_length(&self) -> Duration {
        self.window_length
    }

    /// First instant still inside the window ending at `as_of`.
    pub fn window_start(&self, as_of: DateTime<Utc>) -> DateTime<Utc> {
        as_of - self.window_length
    }

    /// Count requests and error classes for `entity_key` in
    /// `[as_of - window_length, as_of]`.
    ///
    /// Input order does not matter and duplicate events count once. Events of
    /// other entities are ignored.
    pub fn aggregate(&self, entity_key: &str, events: &[Event], as_of: DateTime<Utc>) -> FeatureVector {
        let start = self.window_start(as_of);
        let in_window: BTreeSet<&Event> = events
            .iter()
            .filter(|e| e.entity_key == entity_key && e.timestamp >= start && e.timestamp <= as_of)
            .collect();

        let mut features = FeatureVector::empty(entity_key, as_of);
        for event in in_window {
            features.request_count += 1;
            if event.is_client_error() {
                features.client_error_count += 1;
            } else if event.is_server_error() {
                features.server_error_count += 1;
            }
        }
        features
    }
}
