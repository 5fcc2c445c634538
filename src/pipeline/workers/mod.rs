//! Stage workers. Each worker follows the same skeleton: load the record,
//! flip the stage to PROCESSING, do the work, persist the outcome, count it
//! against the batch, and chain the next stage.
//!
//! Workers never bubble domain failures: non-retryable provider errors are
//! written onto the record as stage status + reason. Only retryable errors
//! propagate, so the queue's backoff policy applies; on the final attempt
//! the worker itself records the FAIL before returning.

pub mod analysis;
pub mod analyst;
pub mod doc_lookup;
pub mod duplicates;
pub mod geocoding;
pub mod normalization;
pub mod places;

use super::batch;
use super::queue::{JobOptions, JobPayload, JobRecord, QueueName};
use super::Deps;
use crate::models::{Record, Stage, StageStatus};
use crate::storage::ProcessingLogEntry;
use anyhow::Result;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Dispatch a claimed job to its stage worker, with structured logging of
/// the completion.
pub async fn run_job(deps: Arc<Deps>, queue: QueueName, job: JobRecord) -> Result<Value> {
    let started = std::time::Instant::now();
    let record_id = job.payload.record_id.clone();

    let outcome = match queue {
        QueueName::DocLookup => doc_lookup::run(&deps, &job).await,
        QueueName::Normalization => normalization::run(&deps, &job).await,
        QueueName::Geocoding => geocoding::run(&deps, &job).await,
        QueueName::Places => places::run(&deps, &job).await,
        QueueName::Analysis => analysis::run(&deps, &job).await,
        QueueName::DuplicateDetection => duplicates::run(&deps, &job).await,
        QueueName::Analyst => analyst::run(&deps, &job).await,
    };

    let elapsed_ms = started.elapsed().as_millis() as i64;
    let (level, message, output) = match &outcome {
        Ok(value) => ("INFO", format!("{} completed", queue.as_str()), Some(value.clone())),
        Err(e) => ("ERROR", format!("{} failed: {}", queue.as_str(), e), None),
    };
    let entry = ProcessingLogEntry {
        correlation_id: record_id,
        timestamp: Utc::now(),
        stage: queue.as_str().to_string(),
        operation: "worker".to_string(),
        level: level.to_string(),
        message,
        execution_time_ms: Some(elapsed_ms),
        input_json: Some(json!({"job_id": job.id, "attempt": job.attempt})),
        output_json: output,
        transformations_json: None,
        validations_json: None,
        alerts_json: None,
    };
    if let Err(e) = deps.store.append_log(&entry) {
        warn!(error = %e, "Failed to append processing log");
    }

    outcome
}

/// Load the job's record; a missing record drops the job silently.
pub(crate) fn load_record(deps: &Deps, job: &JobRecord) -> Result<Option<Record>> {
    let record = deps.store.get_record(&job.payload.record_id)?;
    if record.is_none() {
        info!(record_id = %job.payload.record_id, "Record gone; dropping job");
    }
    Ok(record)
}

/// Flip the stage to PROCESSING with a fresh start timestamp.
pub(crate) fn begin_stage(deps: &Deps, record: &mut Record, stage: Stage) -> Result<()> {
    let state = record.stages.get_mut(stage);
    state.status = Some(StageStatus::Processing);
    state.started_at = Some(Utc::now());
    state.finished_at = None;
    state.error = None;
    deps.store.upsert_record(record)
}

/// Record a terminal stage outcome.
pub(crate) fn finish_stage(
    deps: &Deps,
    record: &mut Record,
    stage: Stage,
    status: StageStatus,
    error: Option<String>,
) -> Result<()> {
    let state = record.stages.get_mut(stage);
    state.status = Some(status);
    state.finished_at = Some(Utc::now());
    state.error = error;
    deps.store.upsert_record(record)
}

/// Count the job against its batch ledger, if it carries one.
pub(crate) fn count_batch(deps: &Deps, queue: QueueName, job: &JobRecord, success: bool) {
    if let Some(batch_id) = &job.payload.batch_id {
        batch::record_result(deps, queue, batch_id, success);
    }
}

/// Enqueue the next stage for the same record. Batches are per-stage and
/// never propagate; the bulk-seed ordinal does, so downstream chains can
/// keep their stagger.
pub(crate) fn chain(
    deps: &Deps,
    next: QueueName,
    record_id: &str,
    delay: Duration,
    seq: Option<u32>,
) {
    deps.queues.add(
        next,
        JobPayload {
            record_id: record_id.to_string(),
            batch_id: None,
            seq,
        },
        JobOptions {
            delay: Some(delay),
            ..Default::default()
        },
    );
}

/// Shared decision for retryable provider failures: retry while attempts
/// remain; on the last attempt mark the stage FAIL and swallow the error so
/// the terminal state lands on the record.
pub(crate) fn is_last_attempt(job: &JobRecord) -> bool {
    job.attempt >= job.max_attempts
}
