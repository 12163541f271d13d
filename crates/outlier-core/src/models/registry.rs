//! Active Model Set with Atomic Hot-Swap
//!
//! Model sets are built off to the side and published as immutable
//! generations. Readers take an `Arc` snapshot and keep scoring against it
//! even if a reload publishes a newer generation mid-request.
//!
//! The registry keeps a small in-memory history of previous generations for
//! fast rollback.

use super::{ModelProvider, ModelSet};
use crate::error::ReloadFailure;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{error, info, warn};

const DEFAULT_HISTORY_LIMIT: usize = 4;

pub struct ModelRegistry {
    provider: Arc<dyn ModelProvider>,
    active: ArcSwap<ModelSet>,
    history: Mutex<VecDeque<Arc<ModelSet>>>,
    history_limit: usize,
    next_generation: Mutex<u64>,
    /// Serializes reload/rollback so generations publish in order
    publish_lock: tokio::sync::Mutex<()>,
}

impl ModelRegistry {
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self {
            provider,
            active: ArcSwap::from_pointee(ModelSet::empty()),
            history: Mutex::new(VecDeque::new()),
            history_limit: DEFAULT_HISTORY_LIMIT,
            next_generation: Mutex::new(1),
            publish_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Snapshot of the active generation. Never blocks on a reload.
    pub fn current(&self) -> Arc<ModelSet> {
        self.active.load_full()
    }

    pub fn generation(&self) -> u64 {
        self.active.load().generation()
    }

    /// Load every requested model into a new generation and publish it.
    ///
    /// Models that fail to load are skipped. If none load, the active
    /// generation is left untouched and `ReloadFailure` is returned.
    pub async fn reload(&self, model_ids: &[String]) -> Result<Arc<ModelSet>, ReloadFailure> {
        let _publishing = self.publish_lock.lock().await;
        info!(models = ?model_ids, "Initiating model reload");

        let mut loaded = BTreeMap::new();
        let mut failures = Vec::new();
        for model_id in model_ids {
            if loaded.contains_key(model_id) {
                continue;
            }
            match self.provider.load(model_id).await {
                Ok(scorer) => {
                    info!(model = %model_id, "Loaded model");
                    loaded.insert(model_id.clone(), scorer);
                }
                Err(e) => {
                    warn!(model = %model_id, error = %e, "Model failed to load; excluding it");
                    failures.push(e);
                }
            }
        }

        if loaded.is_empty() {
            error!(
                models = ?model_ids,
                active_generation = self.generation(),
                "Reload produced no models; keeping the active set"
            );
            return Err(ReloadFailure {
                requested: model_ids.to_vec(),
                failures,
            });
        }

        let generation = {
            let mut next = self.next_generation.lock();
            let g = *next;
            *next += 1;
            g
        };
        let set = Arc::new(ModelSet::new(generation, loaded));
        if set.len() % 2 == 0 {
            warn!(
                generation,
                models = set.len(),
                "Even number of models: a tied vote resolves to anomaly"
            );
        }

        self.publish(Arc::clone(&set));
        info!(generation, models = ?set.model_ids(), failed = failures.len(), "Model reload complete");
        Ok(set)
    }

    /// Re-publish the most recent previous non-empty generation.
    pub async fn rollback(&self) -> Option<Arc<ModelSet>> {
        let _publishing = self.publish_lock.lock().await;
        let previous = {
            let mut history = self.history.lock();
            loop {
                match history.pop_back() {
                    Some(set) if !set.is_empty() => break Some(set),
                    Some(_) => continue,
                    None => break None,
                }
            }
        }?;

        let replaced = self.active.swap(Arc::clone(&previous));
        info!(
            from = replaced.generation(),
            to = previous.generation(),
            "Rolled back model set"
        );
        Some(previous)
    }

    /// Generations available for rollback, oldest first.
    pub fn history_generations(&self) -> Vec<u64> {
        self.history.lock().iter().map(|s| s.generation()).collect()
    }

    fn publish(&self, set: Arc<ModelSet>) {
        let previous = self.active.swap(set);
        let mut history = self.history.lock();
        history.push_back(previous);
        while history.len() > self.history_limit {
            history.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScoringError;
    use crate::event::FeatureVector;
    use crate::models::{Scorer, StaticModelProvider};
    use crate::verdict::ModelVerdict;
    use async_trait::async_trait;

    struct Fixed(&'static str);

    #[async_trait]
    impl Scorer for Fixed {
        fn model_id(&self) -> &str {
            self.0
        }

        async fn score(&self, _features: &FeatureVector) -> Result<ModelVerdict, ScoringError> {
            Ok(ModelVerdict::new(self.0, false, 0.0))
        }
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn registry() -> ModelRegistry {
        let provider = StaticModelProvider::new()
            .with_scorer(Arc::new(Fixed("lof")))
            .with_scorer(Arc::new(Fixed("iforest")))
            .with_scorer(Arc::new(Fixed("knn")));
        ModelRegistry::new(Arc::new(provider))
    }

    #[tokio::test]
    async fn test_starts_empty() {
        let registry = registry();
        assert!(registry.current().is_empty());
        assert_eq!(registry.generation(), 0);
    }

    #[tokio::test]
    async fn test_reload_all_succeed() {
        let registry = registry();
        let set = registry.reload(&ids(&["lof", "iforest", "knn"])).await.unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.generation(), 1);
        assert_eq!(registry.current().generation(), 1);
    }

    #[tokio::test]
    async fn test_reload_partial_keeps_successful_subset() {
        let registry = registry();
        let set = registry.reload(&ids(&["lof", "missing", "knn"])).await.unwrap();
        assert_eq!(set.model_ids(), vec!["knn", "lof"]);
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_previous_set() {
        let registry = registry();
        registry.reload(&ids(&["lof", "knn", "iforest"])).await.unwrap();

        let err = registry.reload(&ids(&["nope", "gone"])).await.unwrap_err();
        assert_eq!(err.failures.len(), 2);
        assert_eq!(err.requested, ids(&["nope", "gone"]));

        let current = registry.current();
        assert_eq!(current.generation(), 1);
        assert_eq!(current.len(), 3);
    }

    #[tokio::test]
    async fn test_failed_first_reload_stays_empty() {
        let registry = registry();
        assert!(registry.reload(&ids(&["nope"])).await.is_err());
        assert!(registry.current().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_survives_reload() {
        let registry = registry();
        registry.reload(&ids(&["lof", "knn", "iforest"])).await.unwrap();
        let in_flight = registry.current();

        registry.reload(&ids(&["lof"])).await.unwrap();
        assert_eq!(in_flight.len(), 3);
        assert_eq!(in_flight.generation(), 1);
        assert_eq!(registry.current().len(), 1);
        assert_eq!(registry.current().generation(), 2);
    }

    #[tokio::test]
    async fn test_rollback_to_previous_generation() {
        let registry = registry();
        registry.reload(&ids(&["lof", "knn", "iforest"])).await.unwrap();
        registry.reload(&ids(&["lof"])).await.unwrap();

        let restored = registry.rollback().await.unwrap();
        assert_eq!(restored.generation(), 1);
        assert_eq!(registry.current().len(), 3);

        // only the empty startup set is left behind it
        assert!(registry.rollback().await.is_none());
        assert_eq!(registry.current().generation(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_readers_see_whole_generations() {
        let registry = Arc::new(registry());
        registry.reload(&ids(&["lof", "knn", "iforest"])).await.unwrap();

        let reader = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                for _ in 0..1_000 {
                    let set = registry.current();
                    let expected = if set.generation() % 2 == 1 { 3 } else { 1 };
                    assert_eq!(set.len(), expected);
                    tokio::task::yield_now().await;
                }
            })
        };

        for i in 0..50 {
            let list = if i % 2 == 0 { ids(&["lof"]) } else { ids(&["lof", "knn", "iforest"]) };
            registry.reload(&list).await.unwrap();
            tokio::task::yield_now().await;
        }
        reader.await.unwrap();
    }
}
