//! Pipeline coordinator: turn a submission into a job plus its first
//! queued phase, and expose cancellation.

use chrono::Utc;
use graphloom_db::{DbError, NewPhase, PipelineStore};
use graphloom_kv::{KvError, QueueBroker};
use graphloom_protocol::defaults::DOCUMENT_DELETED_MESSAGE;
use graphloom_protocol::{
    ExtractionPayload, IngestExtractPayload, Phase, PhaseStatus, QueueName, QueuePayload,
};
use serde_json::{json, Map};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("tenant mismatch: {0}")]
    TenantMismatch(String),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error("queue error: {0}")]
    Queue(#[from] KvError),
}

/// One submission. Exactly one of `raw_location` / `source_location`
/// must be present.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub document_id: String,
    pub tenant_id: String,
    pub source_name: String,
    pub source_platform: String,
    pub file_type: String,
    /// Artifact already resident in the object store.
    pub raw_location: Option<String>,
    /// External origin URI (`gdrive://<id>`).
    pub source_location: Option<String>,
    pub store_raw: bool,
    /// Required for external sources (origin OAuth lookup).
    pub user_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SubmitReceipt {
    pub pipeline_job_id: String,
    pub queue_job_id: String,
}

pub struct PipelineCoordinator {
    store: PipelineStore,
    broker: QueueBroker,
}

impl PipelineCoordinator {
    pub fn new(store: PipelineStore, broker: QueueBroker) -> Self {
        Self { store, broker }
    }

    /// Create the pipeline job and enqueue its first real phase.
    ///
    /// Local uploads enter at extraction, with a synthetic `skipped`
    /// ingestion row so phase history is uniform across both paths.
    /// External sources enter at ingestion via the combined queue.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitReceipt, SubmitError> {
        match (&request.raw_location, &request.source_location) {
            (Some(_), Some(_)) => {
                return Err(SubmitError::Validation(
                    "exactly one of raw_location and source_location must be set".to_string(),
                ))
            }
            (None, None) => {
                return Err(SubmitError::Validation(
                    "one of raw_location or source_location is required".to_string(),
                ))
            }
            _ => {}
        }

        let document = self
            .store
            .fetch_document(&request.document_id)
            .await?
            .ok_or_else(|| {
                SubmitError::Validation(format!("document {} not found", request.document_id))
            })?;
        if document.tenant_id != request.tenant_id {
            return Err(SubmitError::TenantMismatch(format!(
                "document {} does not belong to tenant {}",
                request.document_id, request.tenant_id
            )));
        }

        let entry_phase = if request.raw_location.is_some() {
            Phase::Extraction
        } else {
            if request.user_id.is_none() {
                return Err(SubmitError::Validation(
                    "user_id is required for external sources".to_string(),
                ));
            }
            Phase::Ingestion
        };

        let mut job_metadata = Map::new();
        job_metadata.insert("source_name".to_string(), json!(request.source_name));
        job_metadata.insert(
            "source_platform".to_string(),
            json!(request.source_platform),
        );
        job_metadata.insert("store_raw".to_string(), json!(request.store_raw));

        let job = self
            .store
            .create_job(
                &request.document_id,
                &request.tenant_id,
                entry_phase,
                job_metadata,
            )
            .await?;
        info!(
            pipeline_job_id = %job.id,
            document_id = %request.document_id,
            entry_phase = %entry_phase,
            "created pipeline job"
        );

        let queue_job_id = if let Some(raw_location) = &request.raw_location {
            let mut skip_metadata = Map::new();
            skip_metadata.insert("reason".to_string(), json!(request.source_platform));
            self.store
                .insert_phase(NewPhase {
                    pipeline_job_id: job.id.clone(),
                    phase: Phase::Ingestion,
                    status: PhaseStatus::Skipped,
                    parent_phase_id: None,
                    retry_count: 0,
                    input_location: None,
                    queued_at: Some(Utc::now()),
                    started_at: None,
                    expected_completion_at: None,
                    metadata: skip_metadata,
                })
                .await?;

            let payload = QueuePayload::Extraction(ExtractionPayload {
                pipeline_job_id: job.id.clone(),
                document_id: request.document_id.clone(),
                raw_location: raw_location.clone(),
                file_type: request.file_type.clone(),
                source_name: request.source_name.clone(),
                source_platform: request.source_platform.clone(),
                tenant_id: request.tenant_id.clone(),
                retry_count: 0,
                parent_phase_id: None,
                metadata: Map::new(),
            });
            let queue_job_id = QueueName::Extraction.job_id(&job.id, 0);
            self.broker
                .enqueue(
                    QueueName::Extraction,
                    &payload,
                    &queue_job_id,
                    &format!("Extracting {}", request.source_name),
                )
                .await?
        } else {
            let source_location = request.source_location.clone().unwrap();
            let user_id = request.user_id.clone().unwrap();

            let payload = QueuePayload::IngestExtract(IngestExtractPayload {
                pipeline_job_id: job.id.clone(),
                document_id: request.document_id.clone(),
                source_location,
                file_type: request.file_type.clone(),
                source_name: request.source_name.clone(),
                source_platform: request.source_platform.clone(),
                tenant_id: request.tenant_id.clone(),
                store_raw: request.store_raw,
                user_id,
                retry_count: 0,
                parent_ingest_phase_id: None,
                parent_extract_phase_id: None,
                metadata: Map::new(),
            });
            let queue_job_id = QueueName::IngestExtract.job_id(&job.id, 0);
            self.broker
                .enqueue(
                    QueueName::IngestExtract,
                    &payload,
                    &queue_job_id,
                    &format!("Ingesting+Extracting {}", request.source_name),
                )
                .await?
        };

        Ok(SubmitReceipt {
            pipeline_job_id: job.id,
            queue_job_id,
        })
    }

    /// Cancel every in-flight job for a document. Queue items are not
    /// removed; workers observe the cancellation at their job gate and
    /// exit before doing any work.
    pub async fn cancel_for_document(
        &self,
        document_id: &str,
        tenant_id: &str,
    ) -> Result<usize, SubmitError> {
        cancel_jobs_for_document(&self.store, document_id, tenant_id).await
    }
}

/// Shared by the coordinator and the deletion path.
pub(crate) async fn cancel_jobs_for_document(
    store: &PipelineStore,
    document_id: &str,
    tenant_id: &str,
) -> Result<usize, SubmitError> {
    let jobs = store.active_jobs_for_document(document_id).await?;
    let mut cancelled = 0;
    for job in jobs {
        if job.tenant_id != tenant_id {
            continue;
        }
        store.cancel_job(&job.id, DOCUMENT_DELETED_MESSAGE).await?;
        cancelled += 1;
    }
    if cancelled > 0 {
        info!(document_id, cancelled, "cancelled in-flight pipeline jobs");
    }
    Ok(cancelled)
}
