//! Extraction handler (local-upload path).
//!
//! The artifact is already in the object store: download, extract
//! text by MIME type, store the text, hand off to chunking.

use crate::handlers::{advance_to_chunking, complete_empty_extraction};
use crate::runtime::{
    begin_phase, clear_retry_metadata, handle_failure, job_gate, skipped_outcome, storage_error,
    FailedPhase, FailureContext, Gate,
};
use crate::services::Services;
use graphloom_protocol::mime::{mime_from_file_type, validate_file_size};
use graphloom_protocol::{ExtractionPayload, Phase, PipelineError, QueueName, QueuePayload};
use serde_json::{json, Map, Value};
use tracing::info;

pub async fn run(services: &Services, payload: ExtractionPayload, broker_job_id: &str) -> Value {
    info!(
        document_id = %payload.document_id,
        pipeline_job_id = %payload.pipeline_job_id,
        source_name = %payload.source_name,
        retry_count = payload.retry_count,
        "extraction starting"
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
        Phase::Extraction,
        Some(&payload.raw_location),
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

    let data = match services.storage.load_raw_document(&payload.raw_location).await {
        Ok(data) => data,
        Err(err) => return fail(services, &payload, Some(phase_id), storage_error(err)).await,
    };
    let file_size_mb = data.len() as f64 / (1024.0 * 1024.0);
    services.report_progress(broker_job_id, 30);

    let mime_type = mime_from_file_type(&payload.file_type);
    if let Err(message) = validate_file_size(data.len() as u64, &mime_type) {
        return fail(
            services,
            &payload,
            Some(phase_id),
            PipelineError::InvalidInput(message),
        )
        .await;
    }
    let extraction = match services.extractor.extract(data, &mime_type).await {
        Ok(extraction) => extraction,
        Err(err) => return fail(services, &payload, Some(phase_id), err.into()).await,
    };
    let text_length = extraction.text.len();
    let word_count = extraction.word_count();

    if text_length == 0 || word_count == 0 {
        return match complete_empty_extraction(
            services,
            &payload.pipeline_job_id,
            &payload.document_id,
            &phase_id,
        )
        .await
        {
            Ok(outcome) => {
                services.report_progress(broker_job_id, 100);
                outcome
            }
            Err(err) => fail(services, &payload, Some(phase_id), err).await,
        };
    }
    services.report_progress(broker_job_id, 70);

    let text_location = match services
        .storage
        .store_extracted_text(&payload.document_id, &extraction.text)
        .await
    {
        Ok(location) => location,
        Err(err) => return fail(services, &payload, Some(phase_id), storage_error(err)).await,
    };
    services.report_progress(broker_job_id, 85);

    let mut metadata = Map::new();
    metadata.insert("text_length".to_string(), json!(text_length));
    metadata.insert("word_count".to_string(), json!(word_count));
    metadata.insert("file_size_mb".to_string(), json!(file_size_mb));
    if let Some(transcript) = &extraction.transcript {
        metadata.insert(
            "duration_seconds".to_string(),
            json!(transcript.duration_seconds),
        );
        metadata.insert(
            "estimated_cost_usd".to_string(),
            json!(transcript.estimated_cost_usd()),
        );
        metadata.insert("confidence".to_string(), json!(transcript.confidence));
    }
    if let Err(err) = services
        .store
        .complete_phase(&phase_id, Some(&text_location), metadata)
        .await
    {
        return fail(
            services,
            &payload,
            Some(phase_id),
            crate::runtime::db_error(err),
        )
        .await;
    }

    // Processing results land in the document's namespaced metadata;
    // the source namespace is preserved by the merge.
    let mut processing = Map::new();
    processing.insert("content_length".to_string(), json!(text_length));
    processing.insert("word_count".to_string(), json!(word_count));
    if let Err(err) = services
        .store
        .merge_document_metadata(&payload.document_id, processing)
        .await
    {
        return fail(
            services,
            &payload,
            Some(phase_id),
            crate::runtime::db_error(err),
        )
        .await;
    }

    if let Err(err) = advance_to_chunking(
        services,
        &payload.pipeline_job_id,
        &payload.document_id,
        &text_location,
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
        text_length,
        word_count,
        "extraction complete"
    );
    json!({
        "status": "success",
        "document_id": payload.document_id,
        "text_length": text_length,
        "word_count": word_count,
    })
}

async fn fail(
    services: &Services,
    payload: &ExtractionPayload,
    phase_id: Option<String>,
    err: PipelineError,
) -> Value {
    let retry_payload = QueuePayload::Extraction(ExtractionPayload {
        retry_count: payload.retry_count + 1,
        parent_phase_id: phase_id.clone(),
        ..payload.clone()
    });
    handle_failure(
        FailureContext {
            services,
            queue: QueueName::Extraction,
            pipeline_job_id: &payload.pipeline_job_id,
            document_id: &payload.document_id,
            description: format!("Extracting {}", payload.source_name),
            failed_phases: vec![FailedPhase {
                phase: Phase::Extraction,
                phase_id,
                input_location: Some(payload.raw_location.clone()),
                already_marked: false,
            }],
            retry_payload,
            retry_count: payload.retry_count,
        },
        err,
    )
    .await
}
