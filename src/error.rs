use std::time::Duration;

use axum::http::StatusCode;
use axum::Json;

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("{0}")]
    Validation(String),

    #[error("no active schema (reset or initialize to recover)")]
    NoActiveSchema,

    #[error("a schema reset is already in progress")]
    ResetInProgress,

    #[error("schema {0} is already active")]
    SchemaActive(String),

    #[error("store connection failed: {0}")]
    Connection(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("store call timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("schema lifecycle failed: {0}")]
    Lifecycle(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AuditError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NoActiveSchema => StatusCode::SERVICE_UNAVAILABLE,
            Self::ResetInProgress | Self::SchemaActive(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<r2d2::Error> for AuditError {
    fn from(e: r2d2::Error) -> Self {
        Self::Connection(e.to_string())
    }
}

impl axum::response::IntoResponse for AuditError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = Json(serde_json::json!({ "success": false, "error": self.to_string() }));
        (status, body).into_response()
    }
}
