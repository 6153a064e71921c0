use axum::extract::{DefaultBodyLimit, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::db::{ScanRecord, TerminalRecord, VisitRecord};
use crate::AppState;

mod admin;
mod records;

use admin::*;
use records::*;

pub const API_PREFIX: &str = "/api/audit_visit/three_table_join";

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/uploadVisit", post(upload::<VisitRecord>))
        .route("/uploadTerminal", post(upload::<TerminalRecord>))
        .route("/uploadScan", post(upload::<ScanRecord>))
        .route("/getMergedData", get(merged_data))
        .route("/cleanup", post(cleanup))
        .route("/initialize", post(initialize))
        .route("/status", get(status));

    // uploads are whole spreadsheets, so the limit is far above axum's default
    let body_limit = state.body_limit;
    Router::new()
        .nest(API_PREFIX, api)
        .route("/health", get(status))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /status, /health: active schema and process info.
async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let s = state.lifecycle.status().await;
    Json(serde_json::json!({
        "success": true,
        "active": s.active,
        "schema": s.schema,
        "generation": s.generation,
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
