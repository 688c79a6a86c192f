//! Requeue pipeline jobs that failed in the graph phase.
//!
//! Operator tool for after an engine outage: every failed job whose
//! document still has chunks is reopened at kg_ingest and enqueued
//! fresh (retry_count 0 — this is a new campaign, not a retry chain).

use graphloom_db::PipelineStore;
use graphloom_kv::QueueBroker;
use graphloom_protocol::{KgIngestPayload, QueueName, QueuePayload};
use serde_json::Map;
use tracing::info;

pub async fn requeue_failed_kg_jobs(
    store: &PipelineStore,
    broker: &QueueBroker,
) -> anyhow::Result<usize> {
    let jobs = store.jobs_failed_in_kg_ingest().await?;
    if jobs.is_empty() {
        info!("no failed kg_ingest jobs to requeue");
        return Ok(0);
    }

    let mut requeued = 0;
    for job in jobs {
        let metadata = job.metadata();
        let source_name = metadata
            .get("source_name")
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown file")
            .to_string();
        let source_platform = metadata
            .get("source_platform")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();

        store.reopen_job_for_kg(&job.id).await?;

        let payload = QueuePayload::KgIngest(KgIngestPayload {
            pipeline_job_id: job.id.clone(),
            document_id: job.document_id.clone(),
            source_name: source_name.clone(),
            source_platform,
            tenant_id: job.tenant_id.clone(),
            retry_count: 0,
            parent_phase_id: None,
            metadata: Map::new(),
        });
        broker
            .enqueue(
                QueueName::KgIngest,
                &payload,
                &QueueName::KgIngest.job_id(&job.id, 0),
                &format!("KG ingesting {source_name}"),
            )
            .await?;

        info!(pipeline_job_id = %job.id, document_id = %job.document_id, "requeued kg ingest");
        requeued += 1;
    }

    Ok(requeued)
}
