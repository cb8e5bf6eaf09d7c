//! Policy mappers: context in, ranked action-probability distribution out.
//!
//! A mapper is anything implementing [`ContextMapper`]. Two are provided: the
//! binary-model mapper, which reflects typed contexts through a
//! [`TypeInspector`], and the JSON-context mapper for string contexts. Callers
//! bring their own by passing a constructor to the factory in [`crate::service`].

use std::io::Read;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DecisionServiceError, Result};

mod binary;
mod json;
mod linear;

pub use binary::BinaryModelMapper;
pub use json::JsonContextMapper;
pub use linear::{LinearPolicy, MAX_ACTIONS};

/// Model bytes, read exactly once by the mapper that receives them.
pub type ModelStream = Box<dyn Read + Send>;

/// Named numeric features extracted from a context.
pub type Features = Vec<(String, f32)>;

/// One candidate action. Actions are numbered from 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActionProbability {
    pub action: u32,
    pub probability: f32,
}

pub trait ContextMapper<C>: Send + Sync {
    /// Ranked distribution for `context`, highest probability first.
    fn map_context(&self, context: &C) -> Result<Vec<ActionProbability>>;

    /// Fixed action count of the underlying model, if it has one.
    fn num_actions(&self) -> Option<u32> {
        None
    }
}

impl<C, M: ContextMapper<C> + ?Sized> ContextMapper<C> for Box<M> {
    fn map_context(&self, context: &C) -> Result<Vec<ActionProbability>> {
        (**self).map_context(context)
    }

    fn num_actions(&self) -> Option<u32> {
        (**self).num_actions()
    }
}

/// Reflects the shape of a typed context into features.
pub trait TypeInspector<C>: Send + Sync {
    fn features(&self, context: &C) -> Result<Features>;
}

/// Inspects any `Serialize` context through its JSON representation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerdeInspector;

impl<C: Serialize> TypeInspector<C> for SerdeInspector {
    fn features(&self, context: &C) -> Result<Features> {
        let value = serde_json::to_value(context)
            .map_err(|err| DecisionServiceError::Decision(format!("context not serializable: {err}")))?;
        Ok(flatten_features(&value))
    }
}

/// Flattens a JSON value into features.
///
/// Nested object keys are joined with `.`, booleans map to 0/1, strings become
/// one-hot `key=value` features, numeric array entries are indexed as `key[i]`.
pub fn flatten_features(value: &Value) -> Features {
    let mut out = Vec::new();
    flatten_into("", value, &mut out);
    out
}

fn flatten_into(prefix: &str, value: &Value, out: &mut Features) {
    let join = |key: &str| {
        if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{prefix}.{key}")
        }
    };
    match value {
        Value::Null => {}
        Value::Bool(b) => out.push((prefix.to_string(), if *b { 1.0 } else { 0.0 })),
        Value::Number(n) => {
            if let Some(v) = n.as_f64() {
                out.push((prefix.to_string(), v as f32));
            }
        }
        Value::String(s) => out.push((format!("{prefix}={s}"), 1.0)),
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                flatten_into(&format!("{prefix}[{i}]"), item, out);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                flatten_into(&join(key), item, out);
            }
        }
    }
}

/// Orders per-action probabilities (index 0 is action 1) highest first,
/// breaking ties by action number.
pub fn rank(probabilities: &[f32]) -> Vec<ActionProbability> {
    let mut ranked: Vec<ActionProbability> = probabilities
        .iter()
        .enumerate()
        .map(|(i, p)| ActionProbability {
            action: i as u32 + 1,
            probability: *p,
        })
        .collect();
    // Stable and total: equal probabilities keep action order, NaN cannot panic the sort.
    ranked.sort_by(|a, b| b.probability.total_cmp(&a.probability));
    ranked
}

/// Degenerate exploration: only the top-ranked action, with probability 1.
pub fn collapse_to_top(ranking: &[ActionProbability]) -> Vec<ActionProbability> {
    ranking
        .first()
        .map(|top| {
            vec![ActionProbability {
                action: top.action,
                probability: 1.0,
            }]
        })
        .unwrap_or_default()
}

pub(crate) fn read_model(mut stream: ModelStream) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    stream
        .read_to_end(&mut bytes)
        .map_err(|err| DecisionServiceError::mapper(format!("model stream unreadable: {err}")))?;
    Ok(bytes)
}
