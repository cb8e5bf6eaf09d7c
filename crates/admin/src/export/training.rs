//! Contextual-bandit training lines in Vowpal Wabbit text format.
//!
//! Fixed action sets produce one line per decision:
//!
//! ```text
//! 2:-1:0.7 |f age:30 device=mobile
//! ```
//!
//! ADF argument sets (`--cb_adf`, `--cb_explore_adf`) produce a shared line,
//! one line per ranked action, and a blank separator. Cost is the negated
//! reward; decisions without a joined reward are written unlabeled.

use chrono::{DateTime, Duration, Utc};
use mwt_core::{
    events::{InteractionEvent, ObservationEvent},
    mapper::flatten_features,
    ApplicationClientMetadata, ApplicationExtraMetadata,
};
use std::{collections::HashMap, fmt::Write as _};

const ADF_FLAGS: [&str; 2] = ["--cb_adf", "--cb_explore_adf"];

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingEncoder {
    adf: bool,
    num_actions: Option<u32>,
    unit: Duration,
}

impl TrainingEncoder {
    pub fn new(meta: &ApplicationClientMetadata, extra: &ApplicationExtraMetadata) -> Self {
        let adf = meta
            .train_arguments
            .split_whitespace()
            .any(|token| ADF_FLAGS.contains(&token));
        Self {
            adf,
            num_actions: meta.training_number_of_actions(),
            unit: Duration::seconds(i64::from(extra.experimental_unit_duration)),
        }
    }

    /// Window after a decision in which its reward is accepted.
    pub fn experimental_unit(&self) -> Duration {
        self.unit
    }

    /// Renders one decision, `None` when it cannot be used for training.
    pub fn encode(&self, interaction: &InteractionEvent, reward: Option<f32>) -> Option<String> {
        // The client logs the chosen action first, with its real probability.
        let chosen = interaction.ranking.first()?;
        if let Some(limit) = self.num_actions {
            if chosen.action == 0 || chosen.action > limit {
                tracing::warn!(
                    event_id = %interaction.event_id,
                    action = chosen.action,
                    limit,
                    "skipping decision outside the configured action set"
                );
                return None;
            }
        }

        let features = feature_namespace(&interaction.context);
        let label = |action: u32| {
            reward.map(|r| format!("{action}:{}:{}", cost(r), chosen.probability))
        };

        let mut out = String::new();
        if self.adf {
            let _ = writeln!(out, "shared {features}");
            let mut actions: Vec<u32> = interaction.ranking.iter().map(|a| a.action).collect();
            actions.sort_unstable();
            for action in actions {
                match label(action).filter(|_| action == chosen.action) {
                    Some(label) => {
                        let _ = writeln!(out, "{label} |a id={action}");
                    }
                    None => {
                        let _ = writeln!(out, "|a id={action}");
                    }
                }
            }
            out.push('\n');
        } else {
            match label(chosen.action) {
                Some(label) => {
                    let _ = writeln!(out, "{label} {features}");
                }
                None => {
                    let _ = writeln!(out, "{features}");
                }
            }
        }
        Some(out)
    }
}

fn cost(reward: f32) -> f32 {
    if reward == 0.0 {
        0.0
    } else {
        -reward
    }
}

fn feature_namespace(context: &serde_json::Value) -> String {
    let mut out = String::from("|f");
    for (name, value) in flatten_features(context) {
        out.push(' ');
        out.push_str(&sanitize(&name));
        if value != 1.0 {
            let _ = write!(out, ":{value}");
        }
    }
    out
}

// '|', ':' and whitespace are separators in the text format.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c == '|' || c == ':' || c.is_whitespace() { '_' } else { c })
        .collect()
}

/// Observation rewards keyed by event id.
#[derive(Debug, Default)]
pub struct RewardIndex {
    by_event: HashMap<String, Vec<(DateTime<Utc>, f32)>>,
}

impl RewardIndex {
    pub fn insert(&mut self, observation: &ObservationEvent) {
        self.by_event
            .entry(observation.event_id.clone())
            .or_default()
            .push((observation.timestamp, observation.reward));
    }

    pub fn len(&self) -> usize {
        self.by_event.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_event.is_empty()
    }

    /// Earliest reward reported within `unit` of the decision.
    pub fn reward_for(&self, interaction: &InteractionEvent, unit: Duration) -> Option<f32> {
        let deadline = interaction.timestamp + unit;
        self.by_event
            .get(&interaction.event_id)?
            .iter()
            .filter(|(ts, _)| *ts >= interaction.timestamp && *ts < deadline)
            .min_by_key(|(ts, _)| *ts)
            .map(|(_, reward)| *reward)
    }
}
