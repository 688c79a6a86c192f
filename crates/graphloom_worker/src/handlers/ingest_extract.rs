//! Combined ingest+extract handler (external-source path).
//!
//! The one handler that owns two phase rows per invocation. The
//! downloaded file stays in memory between ingestion and extraction —
//! no intermediate object-store write unless `store_raw` asks for the
//! raw artifact. On failure both rows fail and both retry rows are
//! created as siblings, linked through their own parent ids.

use crate::handlers::{advance_to_chunking, complete_empty_extraction};
use crate::runtime::{
    begin_phase, clear_retry_metadata, db_error, handle_failure, job_gate, skipped_outcome,
    storage_error, FailedPhase, FailureContext, Gate,
};
use crate::services::Services;
use graphloom_protocol::mime::extension_for_mime;
use graphloom_protocol::{IngestExtractPayload, Phase, PipelineError, QueueName, QueuePayload};
use serde_json::{json, Map, Value};
use tracing::info;

pub async fn run(
    services: &Services,
    payload: IngestExtractPayload,
    broker_job_id: &str,
) -> Value {
    info!(
        document_id = %payload.document_id,
        pipeline_job_id = %payload.pipeline_job_id,
        source_location = %payload.source_location,
        retry_count = payload.retry_count,
        "ingest+extract starting"
    );

    match job_gate(services, &payload.pipeline_job_id).await {
        Ok(Gate::Proceed(_)) => {}
        Ok(Gate::Skip(reason)) => return skipped_outcome(&payload.document_id, reason),
        Err(err) => return fail(services, &payload, None, None, err).await,
    }

    if payload.retry_count > 0 {
        if let Err(err) =
            clear_retry_metadata(services, &payload.pipeline_job_id, payload.retry_count).await
        {
            return fail(services, &payload, None, None, err).await;
        }
    }

    // ------------------------------------------------------------------
    // Ingestion phase: download into memory.
    // ------------------------------------------------------------------
    let ingest_phase = match begin_phase(
        services,
        &payload.pipeline_job_id,
        Phase::Ingestion,
        Some(&payload.source_location),
        payload.retry_count,
        payload.parent_ingest_phase_id.as_deref(),
    )
    .await
    {
        Ok(phase) => phase,
        Err(err) => return fail(services, &payload, None, None, err).await,
    };
    let ingest_phase_id = ingest_phase.id;
    services.report_progress(broker_job_id, 10);

    let origin_file = match services
        .origin
        .fetch(&payload.source_location, &payload.user_id, &payload.tenant_id)
        .await
    {
        Ok(file) => file,
        Err(err) => {
            return fail(services, &payload, Some(ingest_phase_id), None, err).await;
        }
    };
    let file_size_mb = origin_file.data.len() as f64 / (1024.0 * 1024.0);
    services.report_progress(broker_job_id, 30);

    // In-memory hand-off: the ingestion row completes with no output
    // location on purpose.
    let mut ingest_metadata = Map::new();
    ingest_metadata.insert("file_size_mb".to_string(), json!(file_size_mb));
    ingest_metadata.insert("mime_type".to_string(), json!(origin_file.mime_type));
    if let Err(err) = services
        .store
        .complete_phase(&ingest_phase_id, None, ingest_metadata)
        .await
    {
        return fail(services, &payload, Some(ingest_phase_id), None, db_error(err)).await;
    }

    // ------------------------------------------------------------------
    // Extraction phase: text from the in-memory bytes.
    // ------------------------------------------------------------------
    if let Err(err) = services
        .store
        .set_job_phase(&payload.pipeline_job_id, Phase::Extraction)
        .await
    {
        return fail(services, &payload, Some(ingest_phase_id), None, db_error(err)).await;
    }

    let extract_phase = match begin_phase(
        services,
        &payload.pipeline_job_id,
        Phase::Extraction,
        Some(&payload.source_location),
        payload.retry_count,
        payload.parent_extract_phase_id.as_deref(),
    )
    .await
    {
        Ok(phase) => phase,
        Err(err) => return fail(services, &payload, Some(ingest_phase_id), None, err).await,
    };
    let extract_phase_id = extract_phase.id;
    services.report_progress(broker_job_id, 40);

    let extraction = match services
        .extractor
        .extract(origin_file.data.clone(), &origin_file.mime_type)
        .await
    {
        Ok(extraction) => extraction,
        Err(err) => {
            return fail(
                services,
                &payload,
                Some(ingest_phase_id),
                Some(extract_phase_id),
                err.into(),
            )
            .await;
        }
    };
    let text_length = extraction.text.len();
    let word_count = extraction.word_count();

    if text_length == 0 || word_count == 0 {
        return match complete_empty_extraction(
            services,
            &payload.pipeline_job_id,
            &payload.document_id,
            &extract_phase_id,
        )
        .await
        {
            Ok(outcome) => {
                services.report_progress(broker_job_id, 100);
                outcome
            }
            Err(err) => {
                fail(
                    services,
                    &payload,
                    Some(ingest_phase_id),
                    Some(extract_phase_id),
                    err,
                )
                .await
            }
        };
    }
    services.report_progress(broker_job_id, 70);

    let text_location = match services
        .storage
        .store_extracted_text(&payload.document_id, &extraction.text)
        .await
    {
        Ok(location) => location,
        Err(err) => {
            return fail(
                services,
                &payload,
                Some(ingest_phase_id),
                Some(extract_phase_id),
                storage_error(err),
            )
            .await;
        }
    };

    // Optional raw preservation, for files that are expensive to
    // re-download or re-process.
    let mut raw_location = None;
    if payload.store_raw {
        let extension = extension_for_mime(&origin_file.mime_type).unwrap_or("bin");
        match services
            .storage
            .store_raw_document(&payload.document_id, origin_file.data.clone(), extension)
            .await
        {
            Ok(location) => raw_location = Some(location),
            Err(err) => {
                return fail(
                    services,
                    &payload,
                    Some(ingest_phase_id),
                    Some(extract_phase_id),
                    storage_error(err),
                )
                .await;
            }
        }
    }
    services.report_progress(broker_job_id, 85);

    let mut metadata = Map::new();
    metadata.insert("text_length".to_string(), json!(text_length));
    metadata.insert("word_count".to_string(), json!(word_count));
    metadata.insert("raw_stored".to_string(), json!(payload.store_raw));
    metadata.insert("raw_location".to_string(), json!(raw_location));
    if let Some(transcript) = &extraction.transcript {
        metadata.insert(
            "duration_seconds".to_string(),
            json!(transcript.duration_seconds),
        );
        metadata.insert(
            "estimated_cost_usd".to_string(),
            json!(transcript.estimated_cost_usd()),
        );
    }
    if let Err(err) = services
        .store
        .complete_phase(&extract_phase_id, Some(&text_location), metadata)
        .await
    {
        return fail(
            services,
            &payload,
            Some(ingest_phase_id),
            Some(extract_phase_id),
            db_error(err),
        )
        .await;
    }

    // Processing results merge into the document's namespaced
    // metadata; the source namespace (origin ids, ingested_at) is
    // preserved for the re-import dedup check.
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
            Some(ingest_phase_id),
            Some(extract_phase_id),
            db_error(err),
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
        return fail(
            services,
            &payload,
            Some(ingest_phase_id),
            Some(extract_phase_id),
            err,
        )
        .await;
    }
    services.report_progress(broker_job_id, 100);

    info!(
        document_id = %payload.document_id,
        text_length,
        raw_stored = payload.store_raw,
        "ingest+extract complete"
    );
    json!({
        "status": "success",
        "document_id": payload.document_id,
        "text_length": text_length,
        "word_count": word_count,
        "raw_stored": payload.store_raw,
    })
}

async fn fail(
    services: &Services,
    payload: &IngestExtractPayload,
    ingest_phase_id: Option<String>,
    extract_phase_id: Option<String>,
    err: PipelineError,
) -> Value {
    let retry_payload = QueuePayload::IngestExtract(IngestExtractPayload {
        retry_count: payload.retry_count + 1,
        parent_ingest_phase_id: ingest_phase_id.clone(),
        parent_extract_phase_id: extract_phase_id.clone(),
        ..payload.clone()
    });
    handle_failure(
        FailureContext {
            services,
            queue: QueueName::IngestExtract,
            pipeline_job_id: &payload.pipeline_job_id,
            document_id: &payload.document_id,
            description: format!("Ingesting+Extracting {}", payload.source_name),
            // Both labels retry as siblings, each chained to its own
            // failed row (or to nothing if the row never existed).
            failed_phases: vec![
                FailedPhase {
                    phase: Phase::Ingestion,
                    phase_id: ingest_phase_id,
                    input_location: Some(payload.source_location.clone()),
                    already_marked: false,
                },
                FailedPhase {
                    phase: Phase::Extraction,
                    phase_id: extract_phase_id,
                    input_location: Some(payload.source_location.clone()),
                    already_marked: false,
                },
            ],
            retry_payload,
            retry_count: payload.retry_count,
        },
        err,
    )
    .await
}
