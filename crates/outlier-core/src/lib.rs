//! Outlier Core: windowed feature cache and ensemble decision engine.
//!
//! Access log events arrive keyed by client address. Each event is persisted,
//! merged into a bounded per-entity window, reduced to a small feature vector
//! and scored by every model in the active model generation. A majority vote
//! turns the per-model verdicts into one decision.
//!
//! ```text
//! event ──► Orchestrator ──► LogStore.append
//!                 │
//!                 ├──► WindowStore (hit) ─┐
//!                 └──► LogStore.query_since ┴─► Aggregator ─► ensemble::decide ─► outcome
//!                      (miss, backfill)                         ▲
//!                                                   ModelRegistry.current()
//! ```
//!
//! The batch side (`batch::BatchPipeline`) reruns the same aggregation rule
//! over the whole log and replaces the feature table.

pub mod batch;
pub mod clock;
pub mod config;
pub mod ensemble;
pub mod error;
pub mod event;
pub mod features;
pub mod models;
pub mod orchestrator;
pub mod store;
pub mod verdict;
pub mod window;

pub use batch::{BatchPipeline, BatchReport};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::DetectorConfig;
pub use error::{
    ConfigError, DetectError, ModelLoadError, ReloadFailure, ScoringError, StorageError,
};
pub use event::{Event, FeatureVector};
pub use features::Aggregator;
pub use models::{ModelProvider, ModelRegistry, ModelSet, Scorer};
pub use orchestrator::{DetectionOutcome, DetectionStage, Orchestrator};
pub use store::{FeatureStore, LogStore, SqliteStore};
pub use verdict::{EnsembleDecision, ModelVerdict};
pub use window::{WindowConfig, WindowState, WindowStats, WindowStore};
