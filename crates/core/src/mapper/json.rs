use serde_json::Value;

use super::{flatten_features, read_model, ActionProbability, ContextMapper, LinearPolicy, ModelStream};
use crate::error::{DecisionServiceError, Result};

/// Maps JSON-object string contexts through a JSON linear model.
///
/// In development mode a context that is not a JSON object is scored with no
/// features (bias only) instead of being rejected.
#[derive(Debug, Clone)]
pub struct JsonContextMapper {
    policy: LinearPolicy,
    development_mode: bool,
}

impl JsonContextMapper {
    pub fn new(model: ModelStream, development_mode: bool) -> Result<Self> {
        let bytes = read_model(model)?;
        let policy: LinearPolicy = serde_json::from_slice(&bytes)
            .map_err(|err| DecisionServiceError::mapper(format!("invalid JSON model: {err}")))?;
        policy.validate()?;
        Ok(Self {
            policy,
            development_mode,
        })
    }

    fn parse_context(&self, context: &str) -> Result<Value> {
        let parsed = serde_json::from_str::<Value>(context)
            .map_err(|err| err.to_string())
            .and_then(|value| match value {
                Value::Object(_) => Ok(value),
                other => Err(format!("expected a JSON object, got {other}")),
            });
        match parsed {
            Ok(value) => Ok(value),
            Err(reason) if self.development_mode => {
                tracing::warn!(%reason, "development mode: scoring malformed context without features");
                Ok(Value::Null)
            }
            Err(reason) => Err(DecisionServiceError::Decision(format!(
                "malformed JSON context: {reason}"
            ))),
        }
    }
}

impl ContextMapper<String> for JsonContextMapper {
    fn map_context(&self, context: &String) -> Result<Vec<ActionProbability>> {
        let value = self.parse_context(context)?;
        Ok(self.policy.distribution(&flatten_features(&value)))
    }

    fn num_actions(&self) -> Option<u32> {
        Some(self.policy.num_actions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const MODEL: &str = r#"{"numActions":3,"weights":{"device=mobile":[0.0,2.0,0.0]},"bias":[0.5,0.0,0.0]}"#;

    fn mapper(development_mode: bool) -> JsonContextMapper {
        JsonContextMapper::new(Box::new(Cursor::new(MODEL.as_bytes().to_vec())), development_mode)
            .unwrap()
    }

    #[test]
    fn scores_string_contexts() {
        let ranked = mapper(false)
            .map_context(&r#"{"device":"mobile"}"#.to_string())
            .unwrap();
        assert_eq!(ranked.len(), 3);
        assert_eq!(ranked[0].action, 2);

        let ranked = mapper(false)
            .map_context(&r#"{"device":"desktop"}"#.to_string())
            .unwrap();
        assert_eq!(ranked[0].action, 1);
    }

    #[test]
    fn malformed_context_depends_on_development_mode() {
        let ctx = "not json".to_string();
        assert!(matches!(
            mapper(false).map_context(&ctx),
            Err(DecisionServiceError::Decision(_))
        ));
        let ranked = mapper(true).map_context(&ctx).unwrap();
        assert_eq!(ranked[0].action, 1);
    }

    #[test]
    fn invalid_model_fails_construction() {
        let err = JsonContextMapper::new(Box::new(Cursor::new(b"{\"numActions\":2,\"bias\":[1.0]}".to_vec())), false)
            .unwrap_err();
        assert!(matches!(err, DecisionServiceError::MapperConstructionFailed(_)));
    }

    #[test]
    fn absurd_action_count_fails_construction() {
        let model = br#"{"numActions":4294967295}"#.to_vec();
        let err = JsonContextMapper::new(Box::new(Cursor::new(model)), false).unwrap_err();
        assert!(matches!(err, DecisionServiceError::MapperConstructionFailed(_)));
    }
}
