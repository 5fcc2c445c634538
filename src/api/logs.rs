//! Structured processing-log queries and per-stage performance metrics.

use super::{ApiError, ApiResult};
use crate::pipeline::Deps;
use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::{json, Value};
use std::sync::Arc;

/// GET /logs/correlation/:id
pub async fn by_correlation(
    State(deps): State<Arc<Deps>>,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    let entries = deps.store.logs_by_correlation(&id)?;
    Ok(Json(json!({
        "success": true,
        "correlationId": id,
        "count": entries.len(),
        "entries": entries,
    })))
}

/// GET /logs/record/:id: identical keying; workers correlate by record id.
pub async fn by_record(
    State(deps): State<Arc<Deps>>,
    Path(id): Path<String>,
) -> ApiResult<Value> {
    if deps.store.get_record(&id)?.is_none() {
        return Err(ApiError::NotFound(format!("record {}", id)));
    }
    let entries = deps.store.logs_by_correlation(&id)?;
    Ok(Json(json!({
        "success": true,
        "recordId": id,
        "count": entries.len(),
        "entries": entries,
    })))
}

/// GET /metrics/:stage: latency percentiles over the last 1000 completions.
pub async fn stage_metrics(
    State(deps): State<Arc<Deps>>,
    Path(stage): Path<String>,
) -> ApiResult<Value> {
    let metrics = deps.store.stage_metrics(&stage)?;
    Ok(Json(json!({"success": true, "metrics": metrics})))
}
