use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{rank, ActionProbability};
use crate::error::{DecisionServiceError, Result};

/// Largest action count a model may declare.
pub const MAX_ACTIONS: u32 = 10_000;

fn default_temperature() -> f32 {
    1.0
}

/// Per-action linear scores turned into a softmax distribution.
///
/// `weights[feature][a]` is the weight of `feature` for action `a + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LinearPolicy {
    pub num_actions: u32,
    #[serde(default)]
    pub weights: BTreeMap<String, Vec<f32>>,
    #[serde(default)]
    pub bias: Vec<f32>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

pub(crate) fn check_action_count(num_actions: u32) -> Result<()> {
    if num_actions == 0 {
        return Err(DecisionServiceError::mapper("model declares zero actions"));
    }
    if num_actions > MAX_ACTIONS {
        return Err(DecisionServiceError::mapper(format!(
            "model declares {num_actions} actions, at most {MAX_ACTIONS} are supported"
        )));
    }
    Ok(())
}

impl LinearPolicy {
    /// Checks shapes and finiteness; a model failing here cannot be served.
    pub fn validate(&self) -> Result<()> {
        let n = self.num_actions as usize;
        check_action_count(self.num_actions)?;
        if !self.bias.is_empty() && self.bias.len() != n {
            return Err(DecisionServiceError::mapper(format!(
                "bias has {} entries, expected {n}",
                self.bias.len()
            )));
        }
        if let Some((name, row)) = self.weights.iter().find(|(_, row)| row.len() != n) {
            return Err(DecisionServiceError::mapper(format!(
                "feature '{name}' has {} weights, expected {n}",
                row.len()
            )));
        }
        let all_finite = self
            .weights
            .values()
            .flatten()
            .chain(self.bias.iter())
            .all(|w| w.is_finite());
        if !all_finite || !(self.temperature.is_finite() && self.temperature > 0.0) {
            return Err(DecisionServiceError::mapper(
                "model contains non-finite weights or a non-positive temperature",
            ));
        }
        Ok(())
    }

    pub fn scores(&self, features: &[(String, f32)]) -> Vec<f32> {
        let n = self.num_actions as usize;
        let mut scores = if self.bias.is_empty() {
            vec![0.0; n]
        } else {
            self.bias.clone()
        };
        for (name, value) in features {
            if let Some(row) = self.weights.get(name) {
                for (score, w) in scores.iter_mut().zip(row) {
                    *score += w * value;
                }
            }
        }
        scores
    }

    pub fn distribution(&self, features: &[(String, f32)]) -> Vec<ActionProbability> {
        let scores = self.scores(features);
        let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exps: Vec<f32> = scores
            .iter()
            .map(|s| ((s - max) / self.temperature).exp())
            .collect();
        let total: f32 = exps.iter().sum();
        let probabilities: Vec<f32> = if total.is_finite() && total > 0.0 {
            exps.iter().map(|e| e / total).collect()
        } else {
            vec![1.0 / scores.len() as f32; scores.len()]
        };
        rank(&probabilities)
    }

    pub fn has_feature(&self, name: &str) -> bool {
        self.weights.contains_key(name)
    }
}
