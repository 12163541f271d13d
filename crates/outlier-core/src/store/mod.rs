//! Durable stores the core talks to.
//!
//! The online path only appends and queries the Log Store; the Feature Store
//! is written by the batch pipeline alone.

pub mod sqlite;

pub use sqlite::SqliteStore;

use crate::error::StorageError;
use crate::event::{Event, FeatureVector};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Append-only event log.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn append(&self, event: &Event) -> Result<(), StorageError>;

    /// Events for one entity with `start <= timestamp < end`, oldest first.
    async fn query(
        &self,
        entity_key: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Event>, StorageError>;

    /// Events for one entity with `timestamp >= start`, oldest first. Used to
    /// rebuild an evicted window, which must also hold events stamped ahead
    /// of the local clock.
    async fn query_since(
        &self,
        entity_key: &str,
        start: DateTime<Utc>,
    ) -> Result<Vec<Event>, StorageError>;

    /// Every stored event. Used by batch recomputation.
    async fn all_events(&self) -> Result<Vec<Event>, StorageError>;
}

/// Materialized feature table.
#[async_trait]
pub trait FeatureStore: Send + Sync {
    /// Replace the whole table with `features`.
    async fn replace_all(
        &self,
        features: BTreeMap<String, Vec<FeatureVector>>,
    ) -> Result<(), StorageError>;
}
