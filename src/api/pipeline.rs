//! Pipeline control endpoints: bulk stage starts, pause/resume, status,
//! queue logs, and the live SSE stream.

use super::{ApiError, ApiResult};
use crate::models::{BatchKind, Stage, StageStatus};
use crate::pipeline::batch::create_batch;
use crate::pipeline::queue::{JobOptions, JobPayload, QueueName};
use crate::pipeline::Deps;
use axum::{
    extract::{Path, Query, State},
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    Json,
};
use futures_util::{stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;

#[derive(Debug, Default, Deserialize)]
pub struct StartRequest {
    pub force: Option<bool>,
    pub scope: Option<String>,
}

/// Per-job stagger spacing used to smooth downstream rate limits when
/// bulk-seeding a queue.
fn stagger_for(queue: QueueName) -> Duration {
    match queue {
        QueueName::Analysis => Duration::from_secs(2),
        QueueName::DocLookup => Duration::from_millis(500),
        _ => Duration::from_millis(100),
    }
}

async fn start_stage(
    deps: Arc<Deps>,
    stage: Stage,
    request: Option<Json<StartRequest>>,
) -> ApiResult<Value> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let force = request.force.unwrap_or(false);
    let scope = request.scope.unwrap_or_else(|| "all".to_string());

    let candidates = deps.store.candidates_for_stage(stage, force)?;
    let queue = QueueName::for_stage(stage);
    let batch = create_batch(
        &deps,
        BatchKind::from_stage(stage),
        candidates.len() as u32,
        Some(format!("scope={}, force={}", scope, force)),
    )?;

    let mut stagger = stagger_for(queue);
    if deps
        .queues
        .over_highwater(queue, deps.config.queue_highwater_mult)
    {
        // Backpressure: spread the seed further apart instead of flooding.
        stagger *= 4;
    }

    for (index, record_id) in candidates.iter().enumerate() {
        deps.queues.add(
            queue,
            JobPayload {
                record_id: record_id.clone(),
                batch_id: Some(batch.id.clone()),
                seq: Some(index as u32),
            },
            JobOptions {
                delay: Some(stagger * index as u32),
                ..Default::default()
            },
        );
    }

    info!(
        stage = stage.as_str(),
        total = candidates.len(),
        force,
        "Bulk stage run seeded"
    );

    let mut body = json!({
        "success": true,
        "batchId": batch.id,
        "total": candidates.len(),
        "reprocessing": force,
        "scope": scope,
    });
    if deps.queues.is_disabled() {
        body["warning"] = json!("queue store unavailable");
    }
    Ok(Json(body))
}

macro_rules! start_handler {
    ($name:ident, $stage:expr) => {
        pub async fn $name(
            State(deps): State<Arc<Deps>>,
            request: Option<Json<StartRequest>>,
        ) -> ApiResult<Value> {
            start_stage(deps, $stage, request).await
        }
    };
}

start_handler!(start_doc, Stage::DocLookup);
start_handler!(start_normalization, Stage::Normalization);
start_handler!(start_geocoding, Stage::Geocoding);
start_handler!(start_places, Stage::Places);
start_handler!(start_analysis, Stage::Analysis);
start_handler!(start_analyst, Stage::Analyst);

/// POST /pipeline/retry-failed: clears failed analyses and re-enqueues.
pub async fn retry_failed(State(deps): State<Arc<Deps>>) -> ApiResult<Value> {
    let ids = deps.store.all_record_ids()?;
    let mut retried = 0usize;
    for id in ids {
        let Some(mut record) = deps.store.get_record(&id)? else {
            continue;
        };
        if record.stages.analysis.status() != StageStatus::Fail {
            continue;
        }
        record.visual = Default::default();
        record.stages.analysis = Default::default();
        deps.store.upsert_record(&record)?;
        deps.queues.add(
            QueueName::Analysis,
            JobPayload {
                record_id: id,
                batch_id: None,
                seq: Some(retried as u32),
            },
            JobOptions {
                delay: Some(stagger_for(QueueName::Analysis) * retried as u32),
                ..Default::default()
            },
        );
        retried += 1;
    }
    Ok(Json(json!({"success": true, "retried": retried})))
}

fn parse_queue(name: &str) -> Result<QueueName, ApiError> {
    QueueName::parse(name).ok_or_else(|| ApiError::BadRequest(format!("unknown queue {}", name)))
}

/// POST /pipeline/pause/:queue
pub async fn pause_queue(
    State(deps): State<Arc<Deps>>,
    Path(name): Path<String>,
) -> ApiResult<Value> {
    let queue = parse_queue(&name)?;
    deps.queues.pause(queue);
    Ok(Json(json!({"success": true, "queue": queue.as_str(), "paused": true})))
}

/// POST /pipeline/resume/:queue
pub async fn resume_queue(
    State(deps): State<Arc<Deps>>,
    Path(name): Path<String>,
) -> ApiResult<Value> {
    let queue = parse_queue(&name)?;
    deps.queues.resume(queue);
    Ok(Json(json!({"success": true, "queue": queue.as_str(), "paused": false})))
}

/// GET /pipeline/paused-status
pub async fn paused_status(State(deps): State<Arc<Deps>>) -> ApiResult<Value> {
    let mut queues = serde_json::Map::new();
    for queue in QueueName::ALL {
        queues.insert(
            queue.as_str().to_string(),
            json!(deps.queues.is_paused(queue)),
        );
    }
    Ok(Json(json!({
        "success": true,
        "pausedCount": deps.queues.paused_count(),
        "queues": queues,
    })))
}

/// GET /pipeline/status: queue counters plus per-stage database counts.
pub async fn status(State(deps): State<Arc<Deps>>) -> ApiResult<Value> {
    let mut queues = serde_json::Map::new();
    for queue in QueueName::ALL {
        queues.insert(
            queue.as_str().to_string(),
            json!({
                "waiting": deps.queues.waiting_count(queue),
                "active": deps.queues.active_count(queue),
                "completed": deps.queues.completed_count(queue),
                "failed": deps.queues.failed_count(queue),
                "paused": deps.queues.is_paused(queue),
            }),
        );
    }

    let mut stages = serde_json::Map::new();
    for stage in Stage::ALL {
        stages.insert(stage.as_str().to_string(), json!(deps.store.stage_counts(stage)?));
    }

    let mut body = json!({
        "success": true,
        "records": deps.store.count_records()?,
        "queues": queues,
        "stages": stages,
        "cache": deps.cache.stats(),
    });
    if deps.queues.is_disabled() {
        body["warning"] = json!("queue store unavailable");
    }
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<usize>,
}

/// GET /pipeline/queue-logs/:queue
pub async fn queue_logs(
    State(deps): State<Arc<Deps>>,
    Path(name): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Value> {
    let queue = parse_queue(&name)?;
    let limit = query.limit.unwrap_or(50).min(500);
    Ok(Json(json!({
        "success": true,
        "queue": queue.as_str(),
        "completed": deps.queues.get_completed(queue, limit),
        "failed": deps.queues.get_failed(queue, limit),
        "active": deps.queues.get_active(queue),
        "batches": deps.store.recent_batches(5)?,
    })))
}

/// GET /pipeline/queue-logs-stream/:queue: live SSE feed of worker events.
pub async fn queue_logs_stream(
    State(deps): State<Arc<Deps>>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let queue = parse_queue(&name)?;
    let receiver = deps.broadcaster.subscribe(queue);

    let connected = stream::once(async move {
        Ok::<Event, Infallible>(
            Event::default()
                .json_data(json!({
                    "type": "connected",
                    "queue": queue.as_str(),
                    "timestamp": chrono::Utc::now(),
                }))
                .expect("static event serializes"),
        )
    });
    let events = BroadcastStream::new(receiver).filter_map(|event| async move {
        // A lagging subscriber silently skips dropped events.
        event
            .ok()
            .and_then(|e| Event::default().json_data(&e).ok())
            .map(Ok::<Event, Infallible>)
    });

    let sse = Sse::new(connected.chain(events)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("heartbeat"),
    );

    let mut response = sse.into_response();
    let headers = response.headers_mut();
    headers.insert("Cache-Control", "no-cache".parse().expect("static header"));
    headers.insert("Connection", "keep-alive".parse().expect("static header"));
    headers.insert("X-Accel-Buffering", "no".parse().expect("static header"));
    Ok(response)
}
