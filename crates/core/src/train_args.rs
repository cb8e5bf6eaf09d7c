//! Action-count extraction from training arguments.
//!
//! Native arguments carry the count as a `--cb_explore <N>` token. BYOM
//! arguments are a JSON object whose `numActions` entry holds the count.

use serde_json::{Map, Value};
use thiserror::Error;

pub const CB_EXPLORE_FLAG: &str = "--cb_explore";
pub const NUM_ACTIONS_KEY: &str = "numActions";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ActionCountError {
    #[error("BYOM train arguments are not a JSON object: {0}")]
    InvalidByomArguments(String),
    #[error("'{key}' is not a non-negative integer: {value}")]
    InvalidCount { key: &'static str, value: String },
}

/// Returns the count following the first `--cb_explore` flag that is followed
/// by digits. `--cb_explore_adf` and friends are different flags and never match.
pub fn cb_explore_actions(train_arguments: &str) -> Option<u32> {
    let mut tokens = train_arguments.split_whitespace().peekable();
    while let Some(token) = tokens.next() {
        if token != CB_EXPLORE_FLAG {
            continue;
        }
        let Some(next) = tokens.peek() else {
            return None;
        };
        let digits: String = next.chars().take_while(char::is_ascii_digit).collect();
        if !digits.is_empty() {
            return digits.parse().ok();
        }
    }
    None
}

/// Looks up `numActions` in a BYOM argument object. String and number values
/// are both accepted.
pub fn byom_num_actions(byom_train_arguments: &str) -> Result<Option<u32>, ActionCountError> {
    let map: Map<String, Value> = serde_json::from_str(byom_train_arguments)
        .map_err(|err| ActionCountError::InvalidByomArguments(err.to_string()))?;

    let Some(value) = map.get(NUM_ACTIONS_KEY) else {
        return Ok(None);
    };

    let invalid = || ActionCountError::InvalidCount {
        key: NUM_ACTIONS_KEY,
        value: value.to_string(),
    };
    match value {
        Value::String(s) => s.trim().parse().map(Some).map_err(|_| invalid()),
        Value::Number(n) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .map(Some)
            .ok_or_else(invalid),
        _ => Err(invalid()),
    }
}

/// Resolves the fixed action count of an application, if any.
///
/// A non-empty BYOM argument string is authoritative; the native arguments are
/// only consulted when it is absent. Malformed BYOM arguments resolve to `None`.
pub fn training_number_of_actions(
    train_arguments: &str,
    byom_train_arguments: Option<&str>,
) -> Option<u32> {
    match byom_train_arguments.filter(|s| !s.trim().is_empty()) {
        Some(byom) => match byom_num_actions(byom) {
            Ok(count) => count,
            Err(err) => {
                tracing::warn!(error = %err, "ignoring malformed BYOM train arguments");
                None
            }
        },
        None => cb_explore_actions(train_arguments),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_arguments_yield_count() {
        assert_eq!(
            training_number_of_actions("--cb_explore 5 --epsilon 0.2", None),
            Some(5)
        );
        assert_eq!(cb_explore_actions("-q ab --cb_explore   12"), Some(12));
    }

    #[test]
    fn byom_overrides_native_arguments() {
        assert_eq!(
            training_number_of_actions("--cb_explore 5", Some(r#"{"numActions":"3"}"#)),
            Some(3)
        );
        assert_eq!(byom_num_actions(r#"{"numActions":7}"#), Ok(Some(7)));
    }

    #[test]
    fn no_match_yields_none() {
        assert_eq!(training_number_of_actions("--cb_explore_adf --epsilon 0.1", None), None);
        assert_eq!(training_number_of_actions("", None), None);
        assert_eq!(training_number_of_actions("--cb_explore", None), None);
        assert_eq!(
            training_number_of_actions("--cb_explore 5", Some(r#"{"learningRate":"0.1"}"#)),
            None
        );
    }

    #[test]
    fn empty_byom_falls_back_to_native() {
        assert_eq!(training_number_of_actions("--cb_explore 4", Some("  ")), Some(4));
    }

    #[test]
    fn malformed_byom_is_reported_by_explicit_parser() {
        assert!(matches!(
            byom_num_actions("not json"),
            Err(ActionCountError::InvalidByomArguments(_))
        ));
        assert!(matches!(
            byom_num_actions(r#"{"numActions":"three"}"#),
            Err(ActionCountError::InvalidCount { .. })
        ));
        assert_eq!(training_number_of_actions("--cb_explore 5", Some("not json")), None);
    }
}
