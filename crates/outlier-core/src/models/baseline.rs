//! File-backed baseline models.
//!
//! Each model lives in `<dir>/outlier_model_<id>.json` and describes the
//! normal range of the three window features. Producing these files is the
//! training pipeline's job.

use super::{ModelProvider, Scorer};
use crate::error::{ModelLoadError, ScoringError};
use crate::event::FeatureVector;
use crate::verdict::ModelVerdict;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const MIN_STD_DEV: f64 = 1e-9;

/// Z-score baseline over `[request_count, client_error_count, server_error_count]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineModel {
    pub model_id: String,
    pub mean: [f64; FeatureVector::DIMENSIONS],
    pub std_dev: [f64; FeatureVector::DIMENSIONS],
    /// Votes anomaly when the largest |z| exceeds this
    pub threshold: f64,
}

impl BaselineModel {
    pub fn validate(&self) -> Result<(), String> {
        if !self.threshold.is_finite() || self.threshold <= 0.0 {
            return Err(format!("threshold must be positive, got {}", self.threshold));
        }
        if self.mean.iter().chain(self.std_dev.iter()).any(|v| !v.is_finite()) {
            return Err("mean and std_dev must be finite".to_string());
        }
        if self.std_dev.iter().any(|s| *s < 0.0) {
            return Err("std_dev must be non-negative".to_string());
        }
        Ok(())
    }

    /// Largest absolute z-score across the features.
    pub fn z_score(&self, features: &FeatureVector) -> f64 {
        features
            .as_array()
            .iter()
            .zip(self.mean.iter().zip(self.std_dev.iter()))
            .map(|(x, (mean, std))| ((x - mean) / std.max(MIN_STD_DEV)).abs())
            .fold(0.0, f64::max)
    }
}

#[async_trait]
impl Scorer for BaselineModel {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn score(&self, features: &FeatureVector) -> Result<ModelVerdict, ScoringError> {
        let score = self.z_score(features);
        if !score.is_finite() {
            return Err(ScoringError::Failed {
                model_id: self.model_id.clone(),
                reason: format!("non-finite score for {}", features.entity_key),
            });
        }
        Ok(ModelVerdict::new(&self.model_id, score > self.threshold, score))
    }
}

/// Loads `outlier_model_<id>.json` files from a directory.
#[derive(Debug, Clone)]
pub struct JsonModelProvider {
    dir: PathBuf,
}

impl JsonModelProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn model_path(&self, model_id: &str) -> PathBuf {
        self.dir.join(format!("outlier_model_{model_id}.json"))
    }
}

#[async_trait]
impl ModelProvider for JsonModelProvider {
    async fn load(&self, model_id: &str) -> Result<Arc<dyn Scorer>, ModelLoadError> {
        let path = self.model_path(model_id);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ModelLoadError::NotFound {
                    model_id: model_id.to_string(),
                    location: path.display().to_string(),
                });
            }
            Err(source) => {
                return Err(ModelLoadError::Io {
                    model_id: model_id.to_string(),
                    source,
                });
            }
        };

        let mut model: BaselineModel =
            serde_json::from_str(&raw).map_err(|e| ModelLoadError::Invalid {
                model_id: model_id.to_string(),
                reason: e.to_string(),
            })?;
        model.validate().map_err(|reason| ModelLoadError::Invalid {
            model_id: model_id.to_string(),
            reason,
        })?;

        // the registry keys models by the id they were requested under
        model.model_id = model_id.to_string();
        Ok(Arc::new(model))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn features(requests: u64, client: u64, server: u64) -> FeatureVector {
        FeatureVector {
            entity_key: "10.0.0.1".into(),
            window_end: Utc.with_ymd_and_hms(2023, 1, 1, 10, 0, 0).unwrap(),
            request_count: requests,
            client_error_count: client,
            server_error_count: server,
        }
    }

    fn model() -> BaselineModel {
        BaselineModel {
            model_id: "lof".into(),
            mean: [5.0, 1.0, 0.0],
            std_dev: [2.0, 1.0, 0.5],
            threshold: 3.0,
        }
    }

    #[tokio::test]
    async fn test_baseline_scoring() {
        let m = model();
        let normal = m.score(&features(6, 1, 0)).await.unwrap();
        assert!(!normal.is_anomaly);
        assert!((normal.score - 0.5).abs() < 1e-9);

        let burst = m.score(&features(40, 1, 0)).await.unwrap();
        assert!(burst.is_anomaly);
        assert_eq!(burst.model_id, "lof");
    }

    #[test]
    fn test_zero_std_dev_does_not_divide_by_zero() {
        let mut m = model();
        m.std_dev = [0.0, 0.0, 0.0];
        assert!(m.z_score(&features(5, 1, 0)).abs() < 1e-9);
        assert!(m.z_score(&features(6, 1, 0)) > 1e6);
    }

    #[test]
    fn test_validate() {
        let mut m = model();
        assert!(m.validate().is_ok());
        m.threshold = 0.0;
        assert!(m.validate().is_err());
        m.threshold = 3.0;
        m.std_dev[1] = -1.0;
        assert!(m.validate().is_err());
    }

    #[tokio::test]
    async fn test_json_provider_load() {
        let dir = tempfile::tempdir().unwrap();
        let provider = JsonModelProvider::new(dir.path());
        std::fs::write(
            provider.model_path("knn"),
            serde_json::to_string(&model()).unwrap(),
        )
        .unwrap();
        std::fs::write(provider.model_path("broken"), "{ not json").unwrap();

        let knn = provider.load("knn").await.unwrap();
        assert_eq!(knn.model_id(), "knn");

        assert!(matches!(
            provider.load("iforest").await,
            Err(ModelLoadError::NotFound { .. })
        ));
        assert!(matches!(
            provider.load("broken").await,
            Err(ModelLoadError::Invalid { .. })
        ));
    }
}
