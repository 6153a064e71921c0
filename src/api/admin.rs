//! Schema reset and recovery handlers.

use axum::extract::State;
use axum::Json;

use crate::error::AuditError;
use crate::AppState;

/// POST /cleanup: drop the active schema and start over on a fresh one.
pub(super) async fn cleanup(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AuditError> {
    let schema = state.lifecycle.reset().await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "message": format!("Database has been reset. New DB: {schema}"),
        "schema": schema.as_str(),
    })))
}

/// POST /initialize: bring a schema up after a failed reset left none active.
pub(super) async fn initialize(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AuditError> {
    let schema = state.lifecycle.initialize().await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "message": format!("Database initialized. New DB: {schema}"),
        "schema": schema.as_str(),
    })))
}
