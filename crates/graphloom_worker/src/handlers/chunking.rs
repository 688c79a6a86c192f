//! Chunking handler. All sources converge here: extracted text in,
//! contextual chunks in the database out.

use crate::handlers::advance_to_kg_ingest;
use crate::runtime::{
    begin_phase, clear_retry_metadata, db_error, handle_failure, job_gate, skipped_outcome,
    storage_error, FailedPhase, FailureContext, Gate,
};
use crate::services::Services;
use graphloom_db::NewChunk;
use graphloom_protocol::{ChunkingPayload, Phase, PipelineError, QueueName, QueuePayload};
use serde_json::{json, Map, Value};
use tracing::info;

pub async fn run(services: &Services, payload: ChunkingPayload, broker_job_id: &str) -> Value {
    info!(
        document_id = %payload.document_id,
        pipeline_job_id = %payload.pipeline_job_id,
        source_platform = %payload.source_platform,
        retry_count = payload.retry_count,
        "chunking starting"
    );

    match job_gate(services, &payload.pipeline_job_id).await {
        Ok(Gate::Proceed(_)) => {}
        Ok(Gate::Skip(reason)) => return skipped_outcome(&payload.document_id, reason),
        Err(err) => return fail(services, &payload, None, err).await,
    }

    if payload.retry_count > 0 {
        if let Err(err) =
            clear_retry_metadata(services, &payload.pipeline_job_id, payload.retry_count).await
        {
            return fail(services, &payload, None, err).await;
        }
    }

    let phase = match begin_phase(
        services,
        &payload.pipeline_job_id,
        Phase::Chunking,
        Some(&payload.text_location),
        payload.retry_count,
        payload.parent_phase_id.as_deref(),
    )
    .await
    {
        Ok(phase) => phase,
        Err(err) => return fail(services, &payload, None, err).await,
    };
    let phase_id = phase.id;
    services.report_progress(broker_job_id, 10);

    let text = match services
        .storage
        .load_extracted_text(&payload.text_location)
        .await
    {
        Ok(text) => text,
        Err(err) => return fail(services, &payload, Some(phase_id), storage_error(err)).await,
    };
    let text_length = text.len();
    let word_count = text.split_whitespace().count();
    services.report_progress(broker_job_id, 20);

    let chunks = match services
        .chunker
        .chunk_document(&text, Some(&payload.source_name))
        .await
    {
        Ok(chunks) => chunks,
        Err(err) => return fail(services, &payload, Some(phase_id), err).await,
    };
    let chunk_count = chunks.len();
    services.report_progress(broker_job_id, 70);

    // One atomic batch; a retried phase replaces its previous rows so
    // indexes stay dense and duplicate-free.
    let rows: Vec<NewChunk> = chunks
        .into_iter()
        .map(|chunk| NewChunk {
            chunk_index: chunk.chunk_index,
            content: chunk.text,
            context: chunk.context,
            token_count: chunk.token_count,
            char_start: chunk.char_start,
            char_end: chunk.char_end,
        })
        .collect();
    if let Err(err) = services.store.replace_chunks(&payload.document_id, &rows).await {
        return fail(services, &payload, Some(phase_id), db_error(err)).await;
    }
    services.report_progress(broker_job_id, 85);

    let mut metadata = Map::new();
    metadata.insert("chunk_count".to_string(), json!(chunk_count));
    metadata.insert("text_length".to_string(), json!(text_length));
    metadata.insert("word_count".to_string(), json!(word_count));
    if let Err(err) = services.store.complete_phase(&phase_id, None, metadata).await {
        return fail(services, &payload, Some(phase_id), db_error(err)).await;
    }

    let mut processing = Map::new();
    processing.insert("chunk_count".to_string(), json!(chunk_count));
    if let Err(err) = services
        .store
        .merge_document_metadata(&payload.document_id, processing)
        .await
    {
        return fail(services, &payload, Some(phase_id), db_error(err)).await;
    }

    if let Err(err) = advance_to_kg_ingest(
        services,
        &payload.pipeline_job_id,
        &payload.document_id,
        &payload.source_name,
        &payload.source_platform,
        &payload.tenant_id,
        &payload.metadata,
    )
    .await
    {
        return fail(services, &payload, Some(phase_id), err).await;
    }
    services.report_progress(broker_job_id, 100);

    info!(
        document_id = %payload.document_id,
        chunk_count,
        "chunking complete"
    );
    json!({
        "status": "success",
        "document_id": payload.document_id,
        "chunk_count": chunk_count,
        "text_length": text_length,
    })
}

async fn fail(
    services: &Services,
    payload: &ChunkingPayload,
    phase_id: Option<String>,
    err: PipelineError,
) -> Value {
    let retry_payload = QueuePayload::Chunking(ChunkingPayload {
        retry_count: payload.retry_count + 1,
        parent_phase_id: phase_id.clone(),
        ..payload.clone()
    });
    handle_failure(
        FailureContext {
            services,
            queue: QueueName::Chunking,
            pipeline_job_id: &payload.pipeline_job_id,
            document_id: &payload.document_id,
            description: format!("Chunking {}", payload.source_name),
            failed_phases: vec![FailedPhase {
                phase: Phase::Chunking,
                phase_id,
                input_location: Some(payload.text_location.clone()),
                already_marked: false,
            }],
            retry_payload,
            retry_count: payload.retry_count,
        },
        err,
    )
    .await
}
