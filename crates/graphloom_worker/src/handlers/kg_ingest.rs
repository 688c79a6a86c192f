//! Knowledge-graph ingest handler — the final phase.
//!
//! Chunks come from the database, episodes go to the graph engine
//! under the tenant's group id, provenance lands in the mapping
//! table. Partial failure is a failure: the adapter compensates, the
//! phase records the counts, and the retry re-processes every chunk.

use crate::handlers::advance_document_available;
use crate::runtime::{
    begin_phase, clear_retry_metadata, db_error, handle_failure, job_gate, skipped_outcome,
    FailedPhase, FailureContext, Gate,
};
use crate::services::Services;
use graphloom_protocol::{KgIngestPayload, Phase, PipelineError, QueueName, QueuePayload};
use serde_json::{json, Map, Value};
use tracing::{error, info};

pub async fn run(services: &Services, payload: KgIngestPayload, broker_job_id: &str) -> Value {
    info!(
        document_id = %payload.document_id,
        pipeline_job_id = %payload.pipeline_job_id,
        tenant_id = %payload.tenant_id,
        retry_count = payload.retry_count,
        "kg ingest starting"
    );

    match job_gate(services, &payload.pipeline_job_id).await {
        Ok(Gate::Proceed(_)) => {}
        Ok(Gate::Skip(reason)) => return skipped_outcome(&payload.document_id, reason),
        Err(err) => return fail(services, &payload, None, false, err).await,
    }

    if payload.retry_count > 0 {
        if let Err(err) =
            clear_retry_metadata(services, &payload.pipeline_job_id, payload.retry_count).await
        {
            return fail(services, &payload, None, false, err).await;
        }
    }

    let phase = match begin_phase(
        services,
        &payload.pipeline_job_id,
        Phase::KgIngest,
        None,
        payload.retry_count,
        payload.parent_phase_id.as_deref(),
    )
    .await
    {
        Ok(phase) => phase,
        Err(err) => return fail(services, &payload, None, false, err).await,
    };
    let phase_id = phase.id;
    services.report_progress(broker_job_id, 10);

    let chunks = match services.store.chunks_for_document(&payload.document_id).await {
        Ok(chunks) => chunks,
        Err(err) => return fail(services, &payload, Some(phase_id), false, db_error(err)).await,
    };
    if chunks.is_empty() {
        let err = PipelineError::InvalidInput(format!(
            "No chunks found for document {}",
            payload.document_id
        ));
        return fail(services, &payload, Some(phase_id), false, err).await;
    }
    let chunk_count = chunks.len();
    services.report_progress(broker_job_id, 20);

    let document = match services.store.fetch_document(&payload.document_id).await {
        Ok(Some(document)) => document,
        Ok(None) => {
            let err = PipelineError::NotFound(format!("document {}", payload.document_id));
            return fail(services, &payload, Some(phase_id), false, err).await;
        }
        Err(err) => return fail(services, &payload, Some(phase_id), false, db_error(err)).await,
    };

    match services.ingestor.ingest_document(&document, &chunks).await {
        Ok(report) => {
            services.report_progress(broker_job_id, 85);

            let mut metadata = Map::new();
            metadata.insert("episode_count".to_string(), json!(report.episode_count));
            metadata.insert("chunk_count".to_string(), json!(report.chunk_count));
            metadata.insert(
                "episode_ids".to_string(),
                json!(report.sample_episode_ids),
            );
            if let Err(err) = services.store.complete_phase(&phase_id, None, metadata).await {
                return fail(services, &payload, Some(phase_id), false, db_error(err)).await;
            }

            if let Err(err) =
                advance_document_available(services, &payload.pipeline_job_id, &payload.document_id)
                    .await
            {
                return fail(services, &payload, Some(phase_id), false, err).await;
            }
            services.report_progress(broker_job_id, 100);

            info!(
                document_id = %payload.document_id,
                episode_count = report.episode_count,
                "pipeline completed"
            );
            json!({
                "status": "success",
                "document_id": payload.document_id,
                "episode_count": report.episode_count,
                "chunk_count": chunk_count,
            })
        }
        Err(failure) => {
            // Compensation already ran inside the adapter; record the
            // counts on the phase before handing the retry decision to
            // the policy.
            let mut metadata = Map::new();
            metadata.insert(
                "episode_count".to_string(),
                json!(failure.chunk_count - failure.failed_count),
            );
            metadata.insert("chunk_count".to_string(), json!(failure.chunk_count));
            metadata.insert("failed_count".to_string(), json!(failure.failed_count));
            metadata.insert(
                "cleaned_up_episodes".to_string(),
                json!(failure.cleaned_up_episodes),
            );
            if let Err(db_err) = services
                .store
                .fail_phase(
                    &phase_id,
                    "PartialIngestFailure",
                    &format!(
                        "Partial failure: {}/{} chunks failed to ingest",
                        failure.failed_count, failure.chunk_count
                    ),
                    Some(metadata),
                )
                .await
            {
                error!(%db_err, "failed to record partial ingest counts");
            }

            let err = PipelineError::PartialIngest(failure.message());
            fail(services, &payload, Some(phase_id), true, err).await
        }
    }
}

async fn fail(
    services: &Services,
    payload: &KgIngestPayload,
    phase_id: Option<String>,
    already_marked: bool,
    err: PipelineError,
) -> Value {
    let retry_payload = QueuePayload::KgIngest(KgIngestPayload {
        retry_count: payload.retry_count + 1,
        parent_phase_id: phase_id.clone(),
        ..payload.clone()
    });
    handle_failure(
        FailureContext {
            services,
            queue: QueueName::KgIngest,
            pipeline_job_id: &payload.pipeline_job_id,
            document_id: &payload.document_id,
            description: format!("KG ingesting {}", payload.source_name),
            failed_phases: vec![FailedPhase {
                phase: Phase::KgIngest,
                phase_id,
                input_location: None,
                already_marked,
            }],
            retry_payload,
            retry_count: payload.retry_count,
        },
        err,
    )
    .await
}
