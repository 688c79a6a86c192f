//! The service container.
//!
//! Built once at startup and passed by `Arc` into every handler; no
//! module-level singletons, no environment reads after boot.

use crate::chunker::ContextualChunker;
use crate::gdrive::SourceOrigin;
use crate::pool::TaskPool;
use graphloom_db::PipelineStore;
use graphloom_extract::ExtractionService;
use graphloom_graph::GraphIngestor;
use graphloom_kv::QueueBroker;
use graphloom_storage::StorageGateway;
use std::sync::Arc;
use tracing::warn;

/// Bounded queue for side-channel progress writes.
const PROGRESS_POOL_CAPACITY: usize = 64;

pub struct Services {
    pub store: PipelineStore,
    pub broker: QueueBroker,
    pub storage: StorageGateway,
    pub extractor: ExtractionService,
    pub chunker: ContextualChunker,
    pub ingestor: GraphIngestor,
    pub origin: Arc<dyn SourceOrigin>,
    progress_pool: TaskPool,
}

impl Services {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: PipelineStore,
        broker: QueueBroker,
        storage: StorageGateway,
        extractor: ExtractionService,
        chunker: ContextualChunker,
        ingestor: GraphIngestor,
        origin: Arc<dyn SourceOrigin>,
    ) -> Self {
        Self {
            store,
            broker,
            storage,
            extractor,
            chunker,
            ingestor,
            origin,
            progress_pool: TaskPool::new(PROGRESS_POOL_CAPACITY),
        }
    }

    /// Fire-and-forget progress update on the broker job record.
    /// Lossy on overflow; progress is cosmetic.
    pub fn report_progress(&self, broker_job_id: &str, progress: u8) {
        let broker = self.broker.clone();
        let job_id = broker_job_id.to_string();
        self.progress_pool.submit(async move {
            if let Err(err) = broker.set_progress(&job_id, progress).await {
                warn!(job_id, %err, "failed to write progress");
            }
        });
    }

    /// Drain in-flight side-channel work before process exit.
    pub async fn shutdown(self) {
        self.progress_pool.shutdown().await;
    }
}
