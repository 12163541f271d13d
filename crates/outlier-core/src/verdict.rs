//! Per-model verdicts and the combined ensemble decision.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One model's call on a feature vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVerdict {
    pub model_id: String,
    pub is_anomaly: bool,
    /// Model-specific anomaly score; higher is more anomalous
    pub score: f64,
}

impl ModelVerdict {
    pub fn new(model_id: impl Into<String>, is_anomaly: bool, score: f64) -> Self {
        Self {
            model_id: model_id.into(),
            is_anomaly,
            score,
        }
    }
}

/// Majority vote across one model generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleDecision {
    pub is_anomaly: bool,
    pub votes_for: usize,
    pub votes_total: usize,
    /// Model set generation every verdict came from
    pub generation: u64,
    pub per_model: BTreeMap<String, ModelVerdict>,
}

impl EnsembleDecision {
    /// At-least-half rule. With an even model count a tie resolves to
    /// anomaly (1 of 2 is enough); odd counts never tie.
    pub fn majority(votes_for: usize, votes_total: usize) -> bool {
        votes_total > 0 && votes_for * 2 >= votes_total
    }

    pub fn from_verdicts(generation: u64, verdicts: impl IntoIterator<Item = ModelVerdict>) -> Self {
        let per_model: BTreeMap<String, ModelVerdict> = verdicts
            .into_iter()
            .map(|v| (v.model_id.clone(), v))
            .collect();
        let votes_total = per_model.len();
        let votes_for = per_model.values().filter(|v| v.is_anomaly).count();

        Self {
            is_anomaly: Self::majority(votes_for, votes_total),
            votes_for,
            votes_total,
            generation,
            per_model,
        }
    }

    /// Human-readable explanation
    pub fn reason(&self) -> String {
        format!(
            "{} out of {} models flagged it as an anomaly.",
            self.votes_for, self.votes_total
        )
    }
}
