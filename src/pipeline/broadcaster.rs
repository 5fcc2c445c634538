//! Fan-out of worker events to live subscribers, one broadcast channel per
//! queue. Delivery is per-subscriber ordered and best-effort: a lagging
//! subscriber loses old events rather than blocking workers.

use super::queue::QueueName;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
pub struct QueueEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub queue: String,
    pub job_id: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl QueueEvent {
    pub fn new(event_type: &str, queue: QueueName, job_id: &str, message: String) -> Self {
        Self {
            event_type: event_type.to_string(),
            timestamp: Utc::now(),
            queue: queue.as_str().to_string(),
            job_id: job_id.to_string(),
            message,
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[derive(Clone)]
pub struct Broadcaster {
    senders: Arc<HashMap<QueueName, broadcast::Sender<QueueEvent>>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        let mut senders = HashMap::new();
        for queue in QueueName::ALL {
            let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
            senders.insert(queue, tx);
        }
        Self {
            senders: Arc::new(senders),
        }
    }

    /// Publish an event; silently dropped when nobody listens.
    pub fn publish(&self, event: QueueEvent) {
        if let Some(queue) = QueueName::parse(&event.queue) {
            if let Some(sender) = self.senders.get(&queue) {
                let _ = sender.send(event);
            }
        }
    }

    pub fn subscribe(&self, queue: QueueName) -> broadcast::Receiver<QueueEvent> {
        self.senders
            .get(&queue)
            .expect("all queues registered at construction")
            .subscribe()
    }

    pub fn subscriber_count(&self, queue: QueueName) -> usize {
        self.senders
            .get(&queue)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_subscriber_in_order() {
        let broadcaster = Broadcaster::new();
        let mut rx = broadcaster.subscribe(QueueName::Geocoding);

        for i in 0..3 {
            broadcaster.publish(QueueEvent::new(
                "completed",
                QueueName::Geocoding,
                &format!("job-{}", i),
                "done".to_string(),
            ));
        }

        for i in 0..3 {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.job_id, format!("job-{}", i));
            assert_eq!(event.queue, "geocoding");
        }
    }

    #[tokio::test]
    async fn queues_are_isolated() {
        let broadcaster = Broadcaster::new();
        let mut geocoding = broadcaster.subscribe(QueueName::Geocoding);

        broadcaster.publish(QueueEvent::new(
            "completed",
            QueueName::Places,
            "job-1",
            "done".to_string(),
        ));
        assert!(geocoding.try_recv().is_err());
    }
}
