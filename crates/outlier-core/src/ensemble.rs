//! Ensemble decision: every model in one generation votes on the same
//! feature vector, majority wins.
//!
//! Scoring is fail-closed. A model that errors or panics fails the whole
//! decision instead of being dropped from the count, since dropping a voter
//! would silently move the majority threshold.

use crate::error::{DetectError, ScoringError};
use crate::event::FeatureVector;
use crate::models::ModelSet;
use crate::verdict::{EnsembleDecision, ModelVerdict};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::{self, JoinSet};
use tracing::{debug, warn};

/// Score `features` with every model in `models` concurrently and combine
/// the verdicts.
pub async fn decide(
    features: &FeatureVector,
    models: &ModelSet,
) -> Result<EnsembleDecision, DetectError> {
    if models.is_empty() {
        return Err(DetectError::NoModelsAvailable);
    }

    let features = Arc::new(features.clone());
    let mut tasks = JoinSet::new();
    let mut task_models: HashMap<task::Id, String> = HashMap::with_capacity(models.len());
    for (model_id, scorer) in models.iter() {
        let owned_id = model_id.clone();
        let scorer = Arc::clone(scorer);
        let features = Arc::clone(&features);
        let handle = tasks.spawn(async move {
            let result = scorer.score(&features).await;
            (owned_id, result)
        });
        task_models.insert(handle.id(), model_id.clone());
    }

    let mut verdicts: Vec<ModelVerdict> = Vec::with_capacity(models.len());
    while let Some(joined) = tasks.join_next().await {
        let (model_id, result) = match joined {
            Ok(pair) => pair,
            Err(join_error) => {
                let model_id = task_models
                    .remove(&join_error.id())
                    .unwrap_or_else(|| format!("<generation {}>", models.generation()));
                warn!(
                    generation = models.generation(),
                    model = %model_id,
                    error = %join_error,
                    "Scorer task died"
                );
                return Err(ScoringError::Panicked { model_id }.into());
            }
        };

        let mut verdict = result?;
        // vote under the id the model was registered with
        verdict.model_id = model_id;
        verdicts.push(verdict);
    }

    let decision = EnsembleDecision::from_verdicts(models.generation(), verdicts);
    debug!(
        entity = %features.entity_key,
        generation = decision.generation,
        votes_for = decision.votes_for,
        votes_total = decision.votes_total,
        is_anomaly = decision.is_anomaly,
        "Ensemble decision"
    );
    Ok(decision)
}
