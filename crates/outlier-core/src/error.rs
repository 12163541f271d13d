//! Error taxonomy.
//!
//! Storage and scoring failures surface to the caller; model load failures
//! are collected during a reload and only become fatal when no model
//! survives.

use std::time::Duration;
use thiserror::Error;

/// Durable I/O against the Log Store or Feature Store failed.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt row in {table}: {reason}")]
    CorruptRow { table: &'static str, reason: String },
    #[error("storage task failed: {0}")]
    Task(String),
}

/// One model could not be loaded during a reload.
#[derive(Debug, Error)]
pub enum ModelLoadError {
    #[error("model '{model_id}' not found at {location}")]
    NotFound { model_id: String, location: String },
    #[error("model '{model_id}' is invalid: {reason}")]
    Invalid { model_id: String, reason: String },
    #[error("model '{model_id}' could not be read: {source}")]
    Io {
        model_id: String,
        #[source]
        source: std::io::Error,
    },
}

impl ModelLoadError {
    pub fn model_id(&self) -> &str {
        match self {
            Self::NotFound { model_id, .. }
            | Self::Invalid { model_id, .. }
            | Self::Io { model_id, .. } => model_id,
        }
    }
}

/// A model raised while scoring a feature vector.
#[derive(Debug, Error)]
pub enum ScoringError {
    #[error("model '{model_id}' failed to score: {reason}")]
    Failed { model_id: String, reason: String },
    #[error("model '{model_id}' panicked while scoring")]
    Panicked { model_id: String },
}

/// Reload produced an empty model set. The previous generation stays active.
#[derive(Debug, Error)]
#[error("no models available after reload of {requested:?}")]
pub struct ReloadFailure {
    pub requested: Vec<String>,
    pub failures: Vec<ModelLoadError>,
}

/// Request-level failure of an online detection.
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
    #[error("no models are loaded; cannot perform detection")]
    NoModelsAvailable,
    #[error("scoring failure: {0}")]
    Scoring(#[from] ScoringError),
    #[error("detection timed out after {0:?}")]
    TimedOut(Duration),
}

impl DetectError {
    /// Stable kind tag for transports and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Storage(_) => "storage",
            Self::NoModelsAvailable => "not_ready",
            Self::Scoring(_) => "scoring",
            Self::TimedOut(_) => "timeout",
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_error_kinds_are_distinct() {
        let kinds = [
            DetectError::Storage(StorageError::Task("join".into())).kind(),
            DetectError::NoModelsAvailable.kind(),
            DetectError::Scoring(ScoringError::Panicked {
                model_id: "lof".into(),
            })
            .kind(),
            DetectError::TimedOut(Duration::from_secs(1)).kind(),
        ];

        for (i, a) in kinds.iter().enumerate() {
            for b in &kinds[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_model_load_error_id() {
        let err = ModelLoadError::Invalid {
            model_id: "knn".into(),
            reason: "bad json".into(),
        };
        assert_eq!(err.model_id(), "knn");
    }
}
