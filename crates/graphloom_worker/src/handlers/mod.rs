//! Phase handlers, one per queue.

pub mod chunking;
pub mod extraction;
pub mod ingest_extract;
pub mod kg_ingest;

use crate::runtime::{broker_job_id, db_error, kv_error};
use crate::services::Services;
use graphloom_protocol::{
    ChunkingPayload, DocumentStatus, KgIngestPayload, Phase, PipelineError, QueueName,
    QueuePayload,
};
use serde_json::{json, Map, Value};
use tracing::info;

/// Advance the job to chunking and enqueue it. Both extraction paths
/// converge here.
pub(crate) async fn advance_to_chunking(
    services: &Services,
    pipeline_job_id: &str,
    document_id: &str,
    text_location: &str,
    source_name: &str,
    source_platform: &str,
    tenant_id: &str,
    passthrough: &Map<String, Value>,
) -> Result<(), PipelineError> {
    services
        .store
        .set_job_phase(pipeline_job_id, Phase::Chunking)
        .await
        .map_err(db_error)?;

    let payload = QueuePayload::Chunking(ChunkingPayload {
        pipeline_job_id: pipeline_job_id.to_string(),
        document_id: document_id.to_string(),
        text_location: text_location.to_string(),
        source_name: source_name.to_string(),
        source_platform: source_platform.to_string(),
        tenant_id: tenant_id.to_string(),
        retry_count: 0,
        parent_phase_id: None,
        metadata: passthrough.clone(),
    });
    let queue_job = broker_job_id(QueueName::Chunking, pipeline_job_id, 0);
    services
        .broker
        .enqueue(
            QueueName::Chunking,
            &payload,
            &queue_job,
            &format!("Chunking {source_name}"),
        )
        .await
        .map_err(kv_error)?;
    Ok(())
}

/// Advance the job to graph ingest and enqueue it.
pub(crate) async fn advance_to_kg_ingest(
    services: &Services,
    pipeline_job_id: &str,
    document_id: &str,
    source_name: &str,
    source_platform: &str,
    tenant_id: &str,
    passthrough: &Map<String, Value>,
) -> Result<(), PipelineError> {
    services
        .store
        .set_job_phase(pipeline_job_id, Phase::KgIngest)
        .await
        .map_err(db_error)?;

    let payload = QueuePayload::KgIngest(KgIngestPayload {
        pipeline_job_id: pipeline_job_id.to_string(),
        document_id: document_id.to_string(),
        source_name: source_name.to_string(),
        source_platform: source_platform.to_string(),
        tenant_id: tenant_id.to_string(),
        retry_count: 0,
        parent_phase_id: None,
        metadata: passthrough.clone(),
    });
    let queue_job = broker_job_id(QueueName::KgIngest, pipeline_job_id, 0);
    services
        .broker
        .enqueue(
            QueueName::KgIngest,
            &payload,
            &queue_job,
            &format!("KG ingesting {source_name}"),
        )
        .await
        .map_err(kv_error)?;
    Ok(())
}

/// Terminal success: the job completes and the document becomes
/// available to retrieval.
pub(crate) async fn advance_document_available(
    services: &Services,
    pipeline_job_id: &str,
    document_id: &str,
) -> Result<(), PipelineError> {
    services
        .store
        .complete_job(pipeline_job_id)
        .await
        .map_err(db_error)?;
    services
        .store
        .update_document_status(document_id, DocumentStatus::Available)
        .await
        .map_err(db_error)?;
    Ok(())
}

/// Empty extraction: nothing to chunk or ingest. The phase and the
/// job both complete, and the document becomes available as-is.
pub(crate) async fn complete_empty_extraction(
    services: &Services,
    pipeline_job_id: &str,
    document_id: &str,
    phase_id: &str,
) -> Result<Value, PipelineError> {
    let mut metadata = Map::new();
    metadata.insert("empty_extraction".to_string(), json!(true));
    metadata.insert(
        "reason".to_string(),
        json!("No text content extracted (file may have no speech or readable text)"),
    );
    services
        .store
        .complete_phase(phase_id, None, metadata)
        .await
        .map_err(db_error)?;
    services
        .store
        .complete_job(pipeline_job_id)
        .await
        .map_err(db_error)?;
    services
        .store
        .update_document_status(document_id, DocumentStatus::Available)
        .await
        .map_err(db_error)?;

    info!(
        pipeline_job_id,
        document_id, "pipeline completed with empty extraction"
    );
    Ok(json!({
        "status": "success",
        "document_id": document_id,
        "empty_extraction": true,
        "message": "File processed but contained no extractable text content",
    }))
}
