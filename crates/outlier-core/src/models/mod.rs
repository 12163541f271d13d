//! Model providers, scorers and the atomically published model set.
//!
//! The anomaly algorithms themselves are opaque here: a provider turns a
//! model id into a [`Scorer`], and a scorer turns a feature vector into a
//! [`ModelVerdict`].

pub mod baseline;
pub mod registry;

pub use baseline::{BaselineModel, JsonModelProvider};
pub use registry::ModelRegistry;

use crate::error::{ModelLoadError, ScoringError};
use crate::event::FeatureVector;
use crate::verdict::ModelVerdict;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// A loaded model's scoring capability.
#[async_trait]
pub trait Scorer: Send + Sync {
    fn model_id(&self) -> &str;
    async fn score(&self, features: &FeatureVector) -> Result<ModelVerdict, ScoringError>;
}

/// Loads scorers by id.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn load(&self, model_id: &str) -> Result<Arc<dyn Scorer>, ModelLoadError>;
}

/// One immutable generation of active models.
#[derive(Clone, Default)]
pub struct ModelSet {
    generation: u64,
    models: BTreeMap<String, Arc<dyn Scorer>>,
}

impl ModelSet {
    /// Generation 0: nothing loaded yet.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(generation: u64, models: BTreeMap<String, Arc<dyn Scorer>>) -> Self {
        Self { generation, models }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn get(&self, model_id: &str) -> Option<&Arc<dyn Scorer>> {
        self.models.get(model_id)
    }

    pub fn model_ids(&self) -> Vec<String> {
        self.models.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn Scorer>)> {
        self.models.iter()
    }
}

impl std::fmt::Debug for ModelSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSet")
            .field("generation", &self.generation)
            .field("models", &self.models.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// In-process provider over pre-built scorers.
#[derive(Default, Clone)]
pub struct StaticModelProvider {
    scorers: HashMap<String, Arc<dyn Scorer>>,
}

impl StaticModelProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn Scorer>) -> Self {
        self.insert(scorer);
        self
    }

    pub fn insert(&mut self, scorer: Arc<dyn Scorer>) {
        self.scorers.insert(scorer.model_id().to_string(), scorer);
    }
}

#[async_trait]
impl ModelProvider for StaticModelProvider {
    async fn load(&self, model_id: &str) -> Result<Arc<dyn Scorer>, ModelLoadError> {
        self.scorers
            .get(model_id)
            .cloned()
            .ok_or_else(|| ModelLoadError::NotFound {
                model_id: model_id.to_string(),
                location: "static provider".to_string(),
            })
    }
}
