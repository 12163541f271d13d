//! Access log events and the feature vectors derived from them.
//!
//! Field names are the storage and wire contract shared with the Log Store
//! and Feature Store; change them only together with the SQLite schema.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single access log line.
///
/// Ordering is by timestamp first, then entity, endpoint and status, so a
/// sorted `Vec<Event>` is also sorted by time and two events compare equal
/// exactly when they are the same event.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    #[serde(alias = "ip_address")]
    pub entity_key: String,
    #[serde(alias = "service_endpoint")]
    pub endpoint: String,
    #[serde(alias = "http_response_code")]
    pub status_code: u16,
}

impl Event {
    pub fn new(
        timestamp: DateTime<Utc>,
        entity_key: impl Into<String>,
        endpoint: impl Into<String>,
        status_code: u16,
    ) -> Self {
        Self {
            timestamp,
            entity_key: entity_key.into(),
            endpoint: endpoint.into(),
            status_code,
        }
    }

    /// 4xx response
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code)
    }

    /// 5xx response
    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status_code)
    }
}

/// Aggregate counts over one entity's trailing window.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FeatureVector {
    pub entity_key: String,
    /// Inclusive end of the window (the `as_of` instant)
    pub window_end: DateTime<Utc>,
    pub request_count: u64,
    pub client_error_count: u64,
    pub server_error_count: u64,
}

impl FeatureVector {
    /// Number of numeric features handed to models.
    pub const DIMENSIONS: usize = 3;

    pub fn empty(entity_key: impl Into<String>, window_end: DateTime<Utc>) -> Self {
        Self {
            entity_key: entity_key.into(),
            window_end,
            request_count: 0,
            client_error_count: 0,
            server_error_count: 0,
        }
    }

    /// Numeric view in model input order.
    pub fn as_array(&self) -> [f64; Self::DIMENSIONS] {
        [
            self.request_count as f64,
            self.client_error_count as f64,
            self.server_error_count as f64,
        ]
    }
}
