//! Named FIFO work queues over the KV store.
//!
//! One list per queue, one sorted set of delayed items per queue
//! (score = ready time), and one record per broker job carrying
//! status, timestamps, description, progress, and the typed payload.
//! The broker never retries on its own; retries belong to the worker
//! runtime, and a lost item's backstop is the orphan reaper.

use crate::clock::Clock;
use crate::error::Result;
use crate::kv::Kv;
use graphloom_protocol::{QueueName, QueuePayload};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerJobStatus {
    Queued,
    Scheduled,
    Running,
    Finished,
    Failed,
}

/// Broker-side view of one queue item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerJob {
    pub id: String,
    pub queue: QueueName,
    pub description: String,
    pub status: BrokerJobStatus,
    pub payload: QueuePayload,
    /// Guard timeout recorded for observability; not enforced here.
    pub timeout_secs: u64,
    pub enqueued_at: f64,
    pub started_at: Option<f64>,
    pub ended_at: Option<f64>,
    /// 0–100, written by handlers as work advances.
    pub progress: u8,
    pub result: Option<Value>,
}

#[derive(Clone)]
pub struct QueueBroker {
    kv: Arc<dyn Kv>,
    clock: Arc<dyn Clock>,
}

impl QueueBroker {
    pub fn new(kv: Arc<dyn Kv>, clock: Arc<dyn Clock>) -> Self {
        Self { kv, clock }
    }

    fn list_key(queue: QueueName) -> String {
        format!("queue:{queue}")
    }

    fn scheduled_key(queue: QueueName) -> String {
        format!("queue:{queue}:scheduled")
    }

    fn job_key(job_id: &str) -> String {
        format!("queue:job:{job_id}")
    }

    /// Enqueue an item for immediate processing. Returns the broker
    /// job id. Re-enqueueing an id overwrites the previous record
    /// (retries deliberately reuse the id of the attempt they retry).
    pub async fn enqueue(
        &self,
        queue: QueueName,
        payload: &QueuePayload,
        job_id: &str,
        description: &str,
    ) -> Result<String> {
        self.store_job(queue, payload, job_id, description, BrokerJobStatus::Queued)
            .await?;
        self.kv.push_back(&Self::list_key(queue), job_id).await?;
        info!(queue = %queue, job_id, "enqueued");
        Ok(job_id.to_string())
    }

    /// Enqueue an item that becomes dequeueable no earlier than
    /// `delay_secs` from now. The scheduler promotes ripe items.
    pub async fn enqueue_in(
        &self,
        queue: QueueName,
        delay_secs: u64,
        payload: &QueuePayload,
        job_id: &str,
        description: &str,
    ) -> Result<String> {
        self.store_job(
            queue,
            payload,
            job_id,
            description,
            BrokerJobStatus::Scheduled,
        )
        .await?;
        let ready_at = self.clock.now_secs() + delay_secs as f64;
        self.kv
            .zadd(&Self::scheduled_key(queue), job_id, ready_at)
            .await?;
        info!(queue = %queue, job_id, delay_secs, "enqueued delayed");
        Ok(job_id.to_string())
    }

    /// Pop the next ready item and mark it running. Items whose record
    /// has vanished are skipped.
    pub async fn dequeue(&self, queue: QueueName) -> Result<Option<BrokerJob>> {
        let list_key = Self::list_key(queue);
        while let Some(job_id) = self.kv.pop_front(&list_key).await? {
            let Some(mut job) = self.fetch(&job_id).await? else {
                debug!(queue = %queue, job_id, "dropping item without record");
                continue;
            };
            job.status = BrokerJobStatus::Running;
            job.started_at = Some(self.clock.now_secs());
            self.save_job(&job).await?;
            return Ok(Some(job));
        }
        Ok(None)
    }

    /// Move ripe delayed items into their queue. Called by the
    /// scheduler loop at least every 5 seconds.
    pub async fn promote_scheduled(&self, queue: QueueName) -> Result<usize> {
        let scheduled_key = Self::scheduled_key(queue);
        let now = self.clock.now_secs();
        let ripe = self.kv.zrangebyscore(&scheduled_key, now).await?;

        for job_id in &ripe {
            self.kv.zrem(&scheduled_key, job_id).await?;
            if let Some(mut job) = self.fetch(job_id).await? {
                job.status = BrokerJobStatus::Queued;
                self.save_job(&job).await?;
            }
            self.kv.push_back(&Self::list_key(queue), job_id).await?;
        }

        if !ripe.is_empty() {
            debug!(queue = %queue, promoted = ripe.len(), "promoted delayed items");
        }
        Ok(ripe.len())
    }

    pub async fn fetch(&self, job_id: &str) -> Result<Option<BrokerJob>> {
        match self.kv.get(&Self::job_key(job_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn set_progress(&self, job_id: &str, progress: u8) -> Result<()> {
        if let Some(mut job) = self.fetch(job_id).await? {
            job.progress = progress.min(100);
            self.save_job(&job).await?;
        }
        Ok(())
    }

    /// Record the handler's outcome. The broker item is complete even
    /// when the handler reports a domain failure.
    pub async fn finish(&self, job_id: &str, result: Value) -> Result<()> {
        self.end_job(job_id, BrokerJobStatus::Finished, Some(result))
            .await
    }

    pub async fn fail(&self, job_id: &str, error: &str) -> Result<()> {
        self.end_job(
            job_id,
            BrokerJobStatus::Failed,
            Some(Value::String(error.to_string())),
        )
        .await
    }

    pub async fn queue_len(&self, queue: QueueName) -> Result<u64> {
        self.kv.list_len(&Self::list_key(queue)).await
    }

    async fn end_job(
        &self,
        job_id: &str,
        status: BrokerJobStatus,
        result: Option<Value>,
    ) -> Result<()> {
        if let Some(mut job) = self.fetch(job_id).await? {
            job.status = status;
            job.ended_at = Some(self.clock.now_secs());
            job.result = result;
            self.save_job(&job).await?;
        }
        Ok(())
    }

    async fn store_job(
        &self,
        queue: QueueName,
        payload: &QueuePayload,
        job_id: &str,
        description: &str,
        status: BrokerJobStatus,
    ) -> Result<()> {
        let job = BrokerJob {
            id: job_id.to_string(),
            queue,
            description: description.to_string(),
            status,
            payload: payload.clone(),
            timeout_secs: queue.default_timeout_secs(),
            enqueued_at: self.clock.now_secs(),
            started_at: None,
            ended_at: None,
            progress: 0,
            result: None,
        };
        self.save_job(&job).await
    }

    async fn save_job(&self, job: &BrokerJob) -> Result<()> {
        self.kv
            .set(&Self::job_key(&job.id), &serde_json::to_string(job)?)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::mem::MemoryKv;
    use graphloom_protocol::KgIngestPayload;

    fn payload(job: &str) -> QueuePayload {
        QueuePayload::KgIngest(KgIngestPayload {
            pipeline_job_id: job.to_string(),
            document_id: "doc-1".into(),
            source_name: "a.txt".into(),
            source_platform: "manual_upload".into(),
            tenant_id: "org_1".into(),
            retry_count: 0,
            parent_phase_id: None,
            metadata: Default::default(),
        })
    }

    fn broker() -> (QueueBroker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000.0));
        let kv = Arc::new(MemoryKv::new(clock.clone()));
        (QueueBroker::new(kv, clock.clone()), clock)
    }

    #[tokio::test]
    async fn dequeue_is_fifo_and_marks_running() {
        let (broker, _) = broker();
        let q = QueueName::KgIngest;

        broker.enqueue(q, &payload("p1"), "kg_p1", "first").await.unwrap();
        broker.enqueue(q, &payload("p2"), "kg_p2", "second").await.unwrap();
        assert_eq!(broker.queue_len(q).await.unwrap(), 2);

        let job = broker.dequeue(q).await.unwrap().unwrap();
        assert_eq!(job.id, "kg_p1");
        assert_eq!(job.status, BrokerJobStatus::Running);
        assert!(job.started_at.is_some());

        let job = broker.dequeue(q).await.unwrap().unwrap();
        assert_eq!(job.id, "kg_p2");
        assert!(broker.dequeue(q).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delayed_items_wait_for_promotion() {
        let (broker, clock) = broker();
        let q = QueueName::KgIngest;

        broker
            .enqueue_in(q, 60, &payload("p1"), "kg_p1", "retry")
            .await
            .unwrap();

        // Not ripe yet.
        assert_eq!(broker.promote_scheduled(q).await.unwrap(), 0);
        assert!(broker.dequeue(q).await.unwrap().is_none());
        assert_eq!(
            broker.fetch("kg_p1").await.unwrap().unwrap().status,
            BrokerJobStatus::Scheduled
        );

        clock.advance(61.0);
        assert_eq!(broker.promote_scheduled(q).await.unwrap(), 1);
        let job = broker.dequeue(q).await.unwrap().unwrap();
        assert_eq!(job.id, "kg_p1");
    }

    #[tokio::test]
    async fn progress_and_result_round_trip() {
        let (broker, _) = broker();
        let q = QueueName::KgIngest;

        broker.enqueue(q, &payload("p1"), "kg_p1", "job").await.unwrap();
        broker.set_progress("kg_p1", 70).await.unwrap();
        assert_eq!(broker.fetch("kg_p1").await.unwrap().unwrap().progress, 70);

        broker
            .finish("kg_p1", serde_json::json!({"status": "success"}))
            .await
            .unwrap();
        let job = broker.fetch("kg_p1").await.unwrap().unwrap();
        assert_eq!(job.status, BrokerJobStatus::Finished);
        assert!(job.ended_at.is_some());
    }

    #[tokio::test]
    async fn queue_timeouts_follow_the_table() {
        let (broker, _) = broker();
        broker
            .enqueue(QueueName::KgIngest, &payload("p1"), "kg_p1", "job")
            .await
            .unwrap();
        let job = broker.fetch("kg_p1").await.unwrap().unwrap();
        assert_eq!(job.timeout_secs, 20 * 60);
        assert_eq!(QueueName::Extraction.default_timeout_secs(), 45 * 60);
        assert_eq!(QueueName::IngestExtract.default_timeout_secs(), 60 * 60);
        assert_eq!(QueueName::Chunking.default_timeout_secs(), 30 * 60);
    }
}
