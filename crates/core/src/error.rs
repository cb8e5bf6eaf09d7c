use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DecisionServiceError>;

#[derive(Debug, Error)]
pub enum DecisionServiceError {
    /// Remote fetch, deserialization or lookup of the metadata record failed.
    #[error("metadata unavailable from '{uri}': {reason}")]
    MetadataUnavailable { uri: String, reason: String },

    /// The model stream could not be read or does not describe a usable policy.
    #[error("mapper construction failed: {0}")]
    MapperConstructionFailed(String),

    /// The mapper rejected the context handed to `decide`.
    #[error("decision failed: {0}")]
    Decision(String),

    #[error("event sink error: {0}")]
    EventSink(String),

    #[error("metadata store error: {0}")]
    Store(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serde JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DecisionServiceError {
    pub(crate) fn metadata_unavailable(uri: &str, reason: impl ToString) -> Self {
        Self::MetadataUnavailable {
            uri: uri.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn mapper(reason: impl ToString) -> Self {
        Self::MapperConstructionFailed(reason.to_string())
    }
}
