//! Named durable-ish job queues over tokio primitives: delayed enqueue,
//! retry with exponential backoff, pause/resume, per-queue worker pools,
//! bounded completed/failed retention, and a no-op mode for when the
//! backing store is unavailable.

use super::broadcaster::{Broadcaster, QueueEvent};
use crate::models::Stage;
use anyhow::Result;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const RETENTION: usize = 500;
const DEFAULT_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    DocLookup,
    Normalization,
    Geocoding,
    Places,
    Analysis,
    DuplicateDetection,
    Analyst,
}

impl QueueName {
    pub const ALL: [QueueName; 7] = [
        QueueName::DocLookup,
        QueueName::Normalization,
        QueueName::Geocoding,
        QueueName::Places,
        QueueName::Analysis,
        QueueName::DuplicateDetection,
        QueueName::Analyst,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::DocLookup => "doc-lookup",
            QueueName::Normalization => "normalization",
            QueueName::Geocoding => "geocoding",
            QueueName::Places => "places",
            QueueName::Analysis => "analysis",
            QueueName::DuplicateDetection => "duplicate-detection",
            QueueName::Analyst => "analyst",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "doc-lookup" | "doc_lookup" | "doc" => Some(QueueName::DocLookup),
            "normalization" => Some(QueueName::Normalization),
            "geocoding" => Some(QueueName::Geocoding),
            "places" => Some(QueueName::Places),
            "analysis" => Some(QueueName::Analysis),
            "duplicate-detection" | "duplicates" => Some(QueueName::DuplicateDetection),
            "analyst" => Some(QueueName::Analyst),
            _ => None,
        }
    }

    pub fn default_concurrency(&self) -> usize {
        match self {
            QueueName::DocLookup => 5,
            QueueName::Normalization => 5,
            QueueName::Geocoding => 3,
            QueueName::Places => 3,
            QueueName::Analysis => 1,
            QueueName::DuplicateDetection => 2,
            QueueName::Analyst => 2,
        }
    }

    pub fn for_stage(stage: Stage) -> Self {
        match stage {
            Stage::DocLookup => QueueName::DocLookup,
            Stage::Normalization => QueueName::Normalization,
            Stage::Geocoding => QueueName::Geocoding,
            Stage::Places => QueueName::Places,
            Stage::Analysis => QueueName::Analysis,
            Stage::Analyst => QueueName::Analyst,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub record_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    /// Ordinal within a bulk seed; downstream chains use it to widen their
    /// stagger and smooth provider rate limits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub delay: Option<Duration>,
    pub attempts: Option<u32>,
    pub job_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Waiting,
    Active,
    Completed,
    Failed,
}

/// Snapshot of one job as exposed by the log endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: String,
    pub queue: String,
    pub payload: JobPayload,
    pub status: JobStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct WaitingJob {
    record: JobRecord,
    due_at: Instant,
}

#[derive(Default)]
struct QueueInner {
    waiting: Vec<WaitingJob>,
    active: HashMap<String, JobRecord>,
    completed: VecDeque<JobRecord>,
    failed: VecDeque<JobRecord>,
    completed_total: u64,
    failed_total: u64,
    paused: bool,
    /// Record ids with a waiting or active job; enforces at most one
    /// in-flight job per (record, queue).
    in_flight: HashSet<String>,
}

pub struct Queue {
    name: QueueName,
    concurrency: usize,
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl Queue {
    fn new(name: QueueName, concurrency: usize) -> Self {
        Self {
            name,
            concurrency,
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
        }
    }
}

/// Handler invoked by worker slots; returns a JSON result recorded on the
/// completion event.
pub type JobHandler = Arc<
    dyn Fn(QueueName, JobRecord) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>>
        + Send
        + Sync,
>;

pub struct QueueManager {
    queues: HashMap<QueueName, Arc<Queue>>,
    broadcaster: Broadcaster,
    backoff_base_ms: u64,
    backoff_cap_ms: u64,
    disabled: bool,
}

impl QueueManager {
    pub fn new(broadcaster: Broadcaster, backoff_base_ms: u64, backoff_cap_ms: u64) -> Self {
        let mut queues = HashMap::new();
        for name in QueueName::ALL {
            queues.insert(
                name,
                Arc::new(Queue::new(name, name.default_concurrency())),
            );
        }
        Self {
            queues,
            broadcaster,
            backoff_base_ms,
            backoff_cap_ms,
            disabled: false,
        }
    }

    /// No-op manager used when the backing store is unreachable: enqueue
    /// succeeds without scheduling anything.
    pub fn disabled(broadcaster: Broadcaster) -> Self {
        let mut manager = Self::new(broadcaster, 2000, 30_000);
        manager.disabled = true;
        manager
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    fn queue(&self, name: QueueName) -> &Arc<Queue> {
        self.queues.get(&name).expect("all queues registered")
    }

    /// Enqueue a job. Returns the job id, or None when suppressed (manager
    /// disabled, or the record already has a job in flight on this queue).
    pub fn add(&self, name: QueueName, payload: JobPayload, opts: JobOptions) -> Option<String> {
        if self.disabled {
            debug!(queue = name.as_str(), "Queue store unavailable; enqueue dropped");
            return None;
        }
        let queue = self.queue(name);
        let mut inner = queue.inner.lock();
        if inner.in_flight.contains(&payload.record_id) {
            debug!(
                queue = name.as_str(),
                record_id = %payload.record_id,
                "Job already in flight; enqueue suppressed"
            );
            return None;
        }

        let id = opts
            .job_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let record = JobRecord {
            id: id.clone(),
            queue: name.as_str().to_string(),
            payload: payload.clone(),
            status: JobStatus::Waiting,
            attempt: 0,
            max_attempts: opts.attempts.unwrap_or(DEFAULT_ATTEMPTS),
            enqueued_at: chrono::Utc::now(),
            finished_at: None,
            error: None,
        };
        inner.in_flight.insert(payload.record_id.clone());
        inner.waiting.push(WaitingJob {
            record,
            due_at: Instant::now() + opts.delay.unwrap_or(Duration::ZERO),
        });
        drop(inner);
        queue.notify.notify_waiters();
        Some(id)
    }

    pub fn pause(&self, name: QueueName) {
        self.queue(name).inner.lock().paused = true;
        info!(queue = name.as_str(), "Queue paused");
    }

    pub fn resume(&self, name: QueueName) {
        let queue = self.queue(name);
        queue.inner.lock().paused = false;
        queue.notify.notify_waiters();
        info!(queue = name.as_str(), "Queue resumed");
    }

    pub fn is_paused(&self, name: QueueName) -> bool {
        self.queue(name).inner.lock().paused
    }

    pub fn paused_count(&self) -> usize {
        QueueName::ALL.iter().filter(|q| self.is_paused(**q)).count()
    }

    pub fn waiting_count(&self, name: QueueName) -> usize {
        self.queue(name).inner.lock().waiting.len()
    }

    pub fn active_count(&self, name: QueueName) -> usize {
        self.queue(name).inner.lock().active.len()
    }

    pub fn completed_count(&self, name: QueueName) -> u64 {
        self.queue(name).inner.lock().completed_total
    }

    pub fn failed_count(&self, name: QueueName) -> u64 {
        self.queue(name).inner.lock().failed_total
    }

    pub fn get_completed(&self, name: QueueName, limit: usize) -> Vec<JobRecord> {
        let inner = self.queue(name).inner.lock();
        inner.completed.iter().rev().take(limit).cloned().collect()
    }

    pub fn get_failed(&self, name: QueueName, limit: usize) -> Vec<JobRecord> {
        let inner = self.queue(name).inner.lock();
        inner.failed.iter().rev().take(limit).cloned().collect()
    }

    pub fn get_active(&self, name: QueueName) -> Vec<JobRecord> {
        let inner = self.queue(name).inner.lock();
        inner.active.values().cloned().collect()
    }

    /// High-water mark for enqueue-side backpressure.
    pub fn over_highwater(&self, name: QueueName, multiplier: usize) -> bool {
        self.waiting_count(name) > name.default_concurrency() * multiplier
    }

    /// `base * 2^attempt`, capped; `attempt` counts attempts made so far.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(10);
        let base = self.backoff_base_ms.saturating_mul(1u64 << exp);
        let capped = base.min(self.backoff_cap_ms);
        // Jitter de-synchronizes herds of retries.
        let jitter = rand::thread_rng().gen_range(0..=capped / 10 + 1);
        Duration::from_millis(capped + jitter)
    }

    /// Spawn the worker pools. Each slot loops: claim the next due job, run
    /// the handler, retry with backoff or finalize.
    pub fn start_workers(self: &Arc<Self>, handler: JobHandler) {
        if self.disabled {
            warn!("Queue manager disabled; no workers started");
            return;
        }
        for name in QueueName::ALL {
            let queue = self.queue(name).clone();
            for slot in 0..queue.concurrency {
                let manager = Arc::clone(self);
                let queue = queue.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    manager.worker_loop(queue, slot, handler).await;
                });
            }
        }
        info!("Queue workers started");
    }

    async fn claim_next(&self, queue: &Queue) -> JobRecord {
        loop {
            let wait: Option<Duration> = {
                let mut inner = queue.inner.lock();
                if inner.paused {
                    None
                } else {
                    let now = Instant::now();
                    let due_idx = inner
                        .waiting
                        .iter()
                        .enumerate()
                        .filter(|(_, j)| j.due_at <= now)
                        .min_by_key(|(_, j)| j.due_at)
                        .map(|(i, _)| i);
                    if let Some(idx) = due_idx {
                        let mut job = inner.waiting.remove(idx);
                        job.record.status = JobStatus::Active;
                        job.record.attempt += 1;
                        let record = job.record.clone();
                        inner.active.insert(record.id.clone(), record.clone());
                        drop(inner);
                        self.broadcaster.publish(
                            QueueEvent::new(
                                "active",
                                queue.name,
                                &record.id,
                                format!(
                                    "processing record {} (attempt {}/{})",
                                    record.payload.record_id, record.attempt, record.max_attempts
                                ),
                            ),
                        );
                        return record;
                    }
                    inner
                        .waiting
                        .iter()
                        .map(|j| j.due_at)
                        .min()
                        .map(|earliest| earliest.saturating_duration_since(now))
                }
            };
            match wait {
                Some(d) if d > Duration::ZERO => {
                    tokio::select! {
                        _ = tokio::time::sleep(d) => {}
                        _ = queue.notify.notified() => {}
                    }
                }
                Some(_) => {}
                None => queue.notify.notified().await,
            }
        }
    }

    async fn worker_loop(&self, queue: Arc<Queue>, slot: usize, handler: JobHandler) {
        loop {
            let record = self.claim_next(&queue).await;
            let outcome = handler(queue.name, record.clone()).await;

            let mut inner = queue.inner.lock();
            let Some(mut job) = inner.active.remove(&record.id) else {
                continue;
            };
            match outcome {
                Ok(result) => {
                    job.status = JobStatus::Completed;
                    job.finished_at = Some(chrono::Utc::now());
                    inner.in_flight.remove(&job.payload.record_id);
                    inner.completed_total += 1;
                    inner.completed.push_back(job.clone());
                    if inner.completed.len() > RETENTION {
                        inner.completed.pop_front();
                    }
                    drop(inner);
                    self.broadcaster.publish(
                        QueueEvent::new(
                            "completed",
                            queue.name,
                            &job.id,
                            format!("record {} done", job.payload.record_id),
                        )
                        .with_details(result),
                    );
                }
                Err(e) => {
                    if job.attempt < job.max_attempts {
                        let delay = self.backoff_delay(job.attempt);
                        job.status = JobStatus::Waiting;
                        job.error = Some(e.to_string());
                        let due_at = Instant::now() + delay;
                        inner.waiting.push(WaitingJob {
                            record: job.clone(),
                            due_at,
                        });
                        drop(inner);
                        warn!(
                            queue = queue.name.as_str(),
                            slot,
                            job_id = %job.id,
                            attempt = job.attempt,
                            error = %e,
                            "Job failed; retrying with backoff"
                        );
                        self.broadcaster.publish(QueueEvent::new(
                            "progress",
                            queue.name,
                            &job.id,
                            format!(
                                "retry {}/{} in {}ms: {}",
                                job.attempt,
                                job.max_attempts,
                                delay.as_millis(),
                                e
                            ),
                        ));
                        queue.notify.notify_waiters();
                    } else {
                        job.status = JobStatus::Failed;
                        job.finished_at = Some(chrono::Utc::now());
                        job.error = Some(e.to_string());
                        inner.in_flight.remove(&job.payload.record_id);
                        inner.failed_total += 1;
                        inner.failed.push_back(job.clone());
                        if inner.failed.len() > RETENTION {
                            inner.failed.pop_front();
                        }
                        drop(inner);
                        warn!(
                            queue = queue.name.as_str(),
                            job_id = %job.id,
                            error = %e,
                            "Job exhausted retries"
                        );
                        self.broadcaster.publish(QueueEvent::new(
                            "failed",
                            queue.name,
                            &job.id,
                            format!("record {} failed: {}", job.payload.record_id, e),
                        ));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn manager() -> Arc<QueueManager> {
        Arc::new(QueueManager::new(Broadcaster::new(), 10, 100))
    }

    fn payload(record_id: &str) -> JobPayload {
        JobPayload {
            record_id: record_id.to_string(),
            batch_id: None,
            seq: None,
        }
    }

    #[tokio::test]
    async fn jobs_run_and_complete() {
        let manager = manager();
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let handler: JobHandler = Arc::new(move |_, _| {
            let c = c.clone();
            Box::pin(async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(serde_json::json!({"ok": true}))
            })
        });
        manager.start_workers(handler);

        manager
            .add(QueueName::Geocoding, payload("r1"), JobOptions::default())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(manager.completed_count(QueueName::Geocoding), 1);
        assert_eq!(manager.waiting_count(QueueName::Geocoding), 0);
        assert_eq!(manager.get_completed(QueueName::Geocoding, 10).len(), 1);
    }

    #[tokio::test]
    async fn failing_jobs_retry_then_land_in_failed_ring() {
        let manager = manager();
        let attempts = Arc::new(AtomicU32::new(0));
        let a = attempts.clone();
        let handler: JobHandler = Arc::new(move |_, _| {
            let a = a.clone();
            Box::pin(async move {
                a.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("boom"))
            })
        });
        manager.start_workers(handler);

        manager
            .add(
                QueueName::Places,
                payload("r1"),
                JobOptions {
                    attempts: Some(2),
                    ..Default::default()
                },
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(manager.failed_count(QueueName::Places), 1);
        let failed = manager.get_failed(QueueName::Places, 10);
        assert_eq!(failed.len(), 1);
        assert!(failed[0].error.as_deref().unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn at_most_one_in_flight_per_record() {
        let manager = manager();
        let first = manager.add(QueueName::Analysis, payload("r1"), JobOptions::default());
        let second = manager.add(QueueName::Analysis, payload("r1"), JobOptions::default());
        let other = manager.add(QueueName::Analysis, payload("r2"), JobOptions::default());
        assert!(first.is_some());
        assert!(second.is_none());
        assert!(other.is_some());
        // Same record on a different queue is fine.
        assert!(manager
            .add(QueueName::Geocoding, payload("r1"), JobOptions::default())
            .is_some());
    }

    #[tokio::test]
    async fn paused_queue_holds_jobs() {
        let manager = manager();
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let handler: JobHandler = Arc::new(move |_, _| {
            let c = c.clone();
            Box::pin(async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            })
        });
        manager.start_workers(handler);

        manager.pause(QueueName::DocLookup);
        assert!(manager.is_paused(QueueName::DocLookup));
        manager
            .add(QueueName::DocLookup, payload("r1"), JobOptions::default())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(manager.waiting_count(QueueName::DocLookup), 1);

        manager.resume(QueueName::DocLookup);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn delayed_jobs_wait_for_due_time() {
        let manager = manager();
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let handler: JobHandler = Arc::new(move |_, _| {
            let c = c.clone();
            Box::pin(async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            })
        });
        manager.start_workers(handler);

        manager.add(
            QueueName::Analyst,
            payload("r1"),
            JobOptions {
                delay: Some(Duration::from_millis(200)),
                ..Default::default()
            },
        );
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disabled_manager_drops_enqueues() {
        let manager = Arc::new(QueueManager::disabled(Broadcaster::new()));
        assert!(manager
            .add(QueueName::Geocoding, payload("r1"), JobOptions::default())
            .is_none());
        assert_eq!(manager.waiting_count(QueueName::Geocoding), 0);
        assert!(manager.is_disabled());
    }

    #[test]
    fn backoff_follows_exponential_formula() {
        let manager = QueueManager::new(Broadcaster::new(), 2000, 30_000);
        let first = manager.backoff_delay(1).as_millis() as u64;
        assert!((4000..=4401).contains(&first), "got {}", first);
        let second = manager.backoff_delay(2).as_millis() as u64;
        assert!((8000..=8801).contains(&second), "got {}", second);
        // The cap kicks in at the fourth attempt.
        let fourth = manager.backoff_delay(4).as_millis() as u64;
        assert!((30_000..=33_001).contains(&fourth), "got {}", fourth);
    }

    #[test]
    fn queue_name_round_trip() {
        for name in QueueName::ALL {
            assert_eq!(QueueName::parse(name.as_str()), Some(name));
        }
        assert_eq!(QueueName::parse("doc"), Some(QueueName::DocLookup));
        assert_eq!(QueueName::parse("nope"), None);
    }
}
