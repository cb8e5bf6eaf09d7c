use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use mwt_core::StoreError;
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AdminError>;

#[derive(Debug, Error)]
pub enum AdminError {
    /// Shared secret missing, wrong, or not configured on the server.
    #[error("unauthorized")]
    Unauthorized,

    #[error("unrecognized data format '{0}'")]
    InvalidFormat(String),

    #[error("invalid {field} '{value}', expected yyyyMMddHHmm")]
    InvalidTimestamp { field: &'static str, value: String },

    #[error("application settings unavailable: {0}")]
    MetadataUnavailable(String),

    /// Interaction storage failed while an export was streaming.
    #[error("storage fault: {0}")]
    StorageFault(String),

    #[error("metadata store error: {0}")]
    Store(#[from] StoreError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("Serde JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AdminError {
    pub fn status(&self) -> StatusCode {
        match self {
            AdminError::Unauthorized => StatusCode::UNAUTHORIZED,
            AdminError::InvalidFormat(_) | AdminError::InvalidTimestamp { .. } => {
                StatusCode::BAD_REQUEST
            }
            AdminError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            AdminError::MetadataUnavailable(_)
            | AdminError::StorageFault(_)
            | AdminError::Store(_)
            | AdminError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "admin request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
