//! Upload and merged-query handlers.

use axum::extract::{Query, State};
use axum::Json;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info};

use crate::db::{self, IngestRecord, MergedFilter};
use crate::error::AuditError;
use crate::AppState;

#[derive(Deserialize)]
struct UploadBody<R> {
    records: Vec<R>,
}

fn parse_batch<R>(body: &[u8]) -> Result<Vec<R>, AuditError>
where
    R: IngestRecord + DeserializeOwned,
{
    serde_json::from_slice::<UploadBody<R>>(body)
        .map(|b| b.records)
        .map_err(|e| {
            debug!(kind = R::KIND, error = %e, "upload body rejected");
            AuditError::Validation(format!("Invalid {} data provided: {e}", R::KIND))
        })
}

/// POST /upload{Visit,Terminal,Scan}: body `{records: [...]}`.
pub(super) async fn upload<R>(
    State(state): State<AppState>,
    body: axum::body::Bytes,
) -> Result<Json<serde_json::Value>, AuditError>
where
    R: IngestRecord + DeserializeOwned,
{
    let records: Vec<R> = parse_batch(&body)?;
    let requested = records.len();
    let count = db::ingest(state.supervisor(), records).await?;
    info!(kind = R::KIND, requested, count, "records imported");

    let mut message = format!("{count} {} records imported successfully", R::KIND);
    if R::SKIPS_DUPLICATES {
        message.push_str(" (duplicates automatically skipped)");
    }
    Ok(Json(serde_json::json!({
        "success": true,
        "count": count,
        "message": message,
    })))
}

/// GET /getMergedData?customerName=&customerCode=&area=&region=
pub(super) async fn merged_data(
    State(state): State<AppState>,
    Query(filter): Query<MergedFilter>,
) -> Result<Json<serde_json::Value>, AuditError> {
    let rows = db::query_merged(state.supervisor(), filter).await?;
    debug!(rows = rows.len(), "merged query");
    Ok(Json(serde_json::json!({
        "success": true,
        "data": rows,
    })))
}
