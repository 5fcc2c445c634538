//! Pipeline wiring: queues, workers, batches, and live event fan-out.

pub mod batch;
pub mod broadcaster;
pub mod queue;
pub mod workers;

use crate::cache::Cache;
use crate::models::Config;
use crate::providers::Providers;
use crate::storage::Store;
use broadcaster::Broadcaster;
use queue::QueueManager;
use std::sync::Arc;

/// Shared context passed explicitly into workers and HTTP handlers.
pub struct Deps {
    pub config: Config,
    pub store: Store,
    pub cache: Cache,
    pub providers: Providers,
    pub queues: Arc<QueueManager>,
    pub broadcaster: Broadcaster,
}

impl Deps {
    /// Wire the queue manager's worker pools to the stage dispatcher.
    pub fn start_pipeline(self: &Arc<Self>) {
        let deps = Arc::clone(self);
        let handler: queue::JobHandler = Arc::new(move |queue_name, job| {
            let deps = Arc::clone(&deps);
            Box::pin(async move { workers::run_job(deps, queue_name, job).await })
        });
        self.queues.start_workers(handler);
    }
}
