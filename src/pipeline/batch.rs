//! Batch ledger helpers shared by the bulk-start endpoints and the workers.

use super::broadcaster::QueueEvent;
use super::queue::QueueName;
use super::Deps;
use crate::models::{Batch, BatchKind, BatchStatus};
use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tracing::info;

/// Open a new ledger row for a bulk stage run.
pub fn create_batch(deps: &Deps, kind: BatchKind, total: u32, note: Option<String>) -> Result<Batch> {
    let batch = Batch {
        id: uuid::Uuid::new_v4().to_string(),
        kind,
        status: BatchStatus::Started,
        total,
        processed: 0,
        success: 0,
        failed: 0,
        started_at: Utc::now(),
        finished_at: None,
        note,
    };
    deps.store.insert_batch(&batch)?;
    info!(batch_id = %batch.id, kind = kind.as_str(), total, "Batch started");
    Ok(batch)
}

/// Count one worker outcome against the ledger. Emits the batch summary
/// event when the last job lands.
pub fn record_result(deps: &Deps, queue: QueueName, batch_id: &str, success: bool) {
    match deps.store.increment_batch(batch_id, success) {
        Ok(Some(batch)) if batch.status == BatchStatus::Completed => {
            info!(
                batch_id,
                total = batch.total,
                success = batch.success,
                failed = batch.failed,
                "Batch completed"
            );
            deps.broadcaster.publish(
                QueueEvent::new(
                    "batch_summary",
                    queue,
                    batch_id,
                    format!(
                        "batch {} completed: {}/{} ok, {} failed",
                        batch_id, batch.success, batch.total, batch.failed
                    ),
                )
                .with_details(json!({
                    "total": batch.total,
                    "processed": batch.processed,
                    "success": batch.success,
                    "failed": batch.failed,
                })),
            );
        }
        Ok(_) => {}
        Err(e) => {
            tracing::warn!(batch_id, error = %e, "Failed to update batch ledger");
        }
    }
}
