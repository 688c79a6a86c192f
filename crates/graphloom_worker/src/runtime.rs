//! Worker loop and the shared handler skeleton.
//!
//! Every handler invocation follows the same bracket: gate on the
//! job, clear stale retry metadata, insert a processing phase row, do
//! the work, then either advance the pipeline or consult the retry
//! policy. The pieces of that bracket live here so the four handlers
//! stay about the phase work itself.

use crate::handlers;
use crate::services::Services;
use chrono::{Duration as ChronoDuration, Utc};
use graphloom_db::{DbError, NewPhase, PipelineJob, PipelinePhase};
use graphloom_kv::BrokerJob;
use graphloom_protocol::defaults::LAST_ERROR_MAX_CHARS;
use graphloom_protocol::retry::{phase_timeout_secs, retry_delay_secs, MAX_RETRIES};
use graphloom_protocol::{JobStatus, Phase, PhaseStatus, PipelineError, QueueName, QueuePayload};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Pull items off the named queues and run their handlers. One item
/// at a time per worker; parallelism lives inside the handlers.
pub struct Worker {
    services: Arc<Services>,
    queues: Vec<QueueName>,
}

impl Worker {
    pub fn new(services: Arc<Services>, queues: Vec<QueueName>) -> Self {
        let queues = if queues.is_empty() {
            QueueName::ALL.to_vec()
        } else {
            queues
        };
        Self { services, queues }
    }

    /// Main loop. Runs until the surrounding task is cancelled.
    pub async fn run(&self) {
        info!(queues = ?self.queues, "worker entering event loop");
        loop {
            if !self.process_next().await {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }
    }

    /// Try each queue once; returns whether an item was handled.
    pub async fn process_next(&self) -> bool {
        for queue in &self.queues {
            match self.services.broker.dequeue(*queue).await {
                Ok(Some(job)) => {
                    self.dispatch(job).await;
                    return true;
                }
                Ok(None) => {}
                Err(err) => {
                    error!(queue = %queue, %err, "dequeue failed");
                }
            }
        }
        false
    }

    /// Drain all queues to empty. Test and maintenance helper; the
    /// production loop uses `run`.
    pub async fn drain(&self) -> usize {
        let mut handled = 0;
        while self.process_next().await {
            handled += 1;
        }
        handled
    }

    async fn dispatch(&self, job: BrokerJob) {
        let broker_job_id = job.id.clone();
        info!(
            queue = %job.queue,
            broker_job_id,
            pipeline_job_id = job.payload.pipeline_job_id(),
            "handling item"
        );

        let outcome = match job.payload {
            QueuePayload::Extraction(payload) => {
                handlers::extraction::run(&self.services, payload, &broker_job_id).await
            }
            QueuePayload::IngestExtract(payload) => {
                handlers::ingest_extract::run(&self.services, payload, &broker_job_id).await
            }
            QueuePayload::Chunking(payload) => {
                handlers::chunking::run(&self.services, payload, &broker_job_id).await
            }
            QueuePayload::KgIngest(payload) => {
                handlers::kg_ingest::run(&self.services, payload, &broker_job_id).await
            }
        };

        if let Err(err) = self.services.broker.finish(&broker_job_id, outcome).await {
            error!(broker_job_id, %err, "failed to record broker outcome");
        }
    }
}

// ============================================================================
// Handler skeleton pieces
// ============================================================================

/// Broker job id for an attempt; see `QueueName::job_id`.
pub fn broker_job_id(queue: QueueName, pipeline_job_id: &str, retry_count: u32) -> String {
    queue.job_id(pipeline_job_id, retry_count)
}

pub(crate) enum Gate {
    Proceed(Box<PipelineJob>),
    Skip(&'static str),
}

/// Defensive check before any work: the job must still exist and not
/// be cancelled or completed. This is where cancellation propagates —
/// cooperatively, at phase boundaries, before any external side
/// effect.
pub(crate) async fn job_gate(
    services: &Services,
    pipeline_job_id: &str,
) -> Result<Gate, PipelineError> {
    let job = services
        .store
        .fetch_job(pipeline_job_id)
        .await
        .map_err(db_error)?;

    Ok(match job {
        None => Gate::Skip("pipeline_job_not_found"),
        Some(job) => match job.status() {
            Some(JobStatus::Cancelled) => Gate::Skip("pipeline_job_cancelled"),
            Some(JobStatus::Completed) => Gate::Skip("pipeline_job_completed"),
            _ => Gate::Proceed(Box::new(job)),
        },
    })
}

/// Clear the retry banner so the UI stops showing "Retrying in …".
pub(crate) async fn clear_retry_metadata(
    services: &Services,
    pipeline_job_id: &str,
    retry_count: u32,
) -> Result<(), PipelineError> {
    let mut patch = Map::new();
    patch.insert("retry_at".to_string(), Value::Null);
    patch.insert("retry_count".to_string(), json!(retry_count));
    patch.insert("last_error".to_string(), Value::Null);
    services
        .store
        .merge_job_metadata(pipeline_job_id, patch)
        .await
        .map_err(db_error)
}

/// Open the processing row for this attempt, stamping the deadline
/// the orphan reaper enforces. First attempts insert a fresh row; a
/// retry claims the queued row the retry scheduler already created,
/// so one attempt is exactly one row.
pub(crate) async fn begin_phase(
    services: &Services,
    pipeline_job_id: &str,
    phase: Phase,
    input_location: Option<&str>,
    retry_count: u32,
    parent_phase_id: Option<&str>,
) -> Result<PipelinePhase, PipelineError> {
    let now = Utc::now();
    let timeout = ChronoDuration::seconds(phase_timeout_secs(phase) as i64);

    if retry_count > 0 {
        if let Some(claimed) = services
            .store
            .claim_queued_phase(pipeline_job_id, phase, retry_count, now, now + timeout)
            .await
            .map_err(db_error)?
        {
            return Ok(claimed);
        }
    }

    services
        .store
        .insert_phase(NewPhase {
            pipeline_job_id: pipeline_job_id.to_string(),
            phase,
            status: PhaseStatus::Processing,
            parent_phase_id: parent_phase_id.map(str::to_string),
            retry_count,
            input_location: input_location.map(str::to_string),
            queued_at: None,
            started_at: Some(now),
            expected_completion_at: Some(now + timeout),
            metadata: Map::new(),
        })
        .await
        .map_err(db_error)
}

pub(crate) fn skipped_outcome(document_id: &str, reason: &str) -> Value {
    json!({
        "status": "skipped",
        "reason": reason,
        "document_id": document_id,
    })
}

pub(crate) fn db_error(err: DbError) -> PipelineError {
    PipelineError::Internal(err.to_string())
}

pub(crate) fn kv_error(err: graphloom_kv::KvError) -> PipelineError {
    PipelineError::Internal(err.to_string())
}

pub(crate) fn storage_error(err: graphloom_storage::StorageError) -> PipelineError {
    match err {
        graphloom_storage::StorageError::NotFound(location) => PipelineError::NotFound(location),
        other => PipelineError::Internal(other.to_string()),
    }
}

/// One phase row involved in a failed invocation. The combined
/// handler reports two; everyone else reports one.
pub(crate) struct FailedPhase {
    pub phase: Phase,
    /// None when the row was never created (failure before insert).
    pub phase_id: Option<String>,
    pub input_location: Option<String>,
    /// True when the handler already wrote the failed status itself
    /// (e.g. partial-ingest compensation records its own metadata).
    pub already_marked: bool,
}

pub(crate) struct FailureContext<'a> {
    pub services: &'a Services,
    pub queue: QueueName,
    pub pipeline_job_id: &'a str,
    pub document_id: &'a str,
    pub description: String,
    pub failed_phases: Vec<FailedPhase>,
    /// Payload for the next attempt, with retry_count and parent
    /// phase ids already advanced.
    pub retry_payload: QueuePayload,
    pub retry_count: u32,
}

/// The retry policy, applied. Marks failed phases, then either
/// schedules a delayed retry (new queued phase rows linked to the
/// failed ones, retry banner in job metadata, delayed re-enqueue) or
/// fails the job for good. Never lets an error escape.
pub(crate) async fn handle_failure(ctx: FailureContext<'_>, err: PipelineError) -> Value {
    let error_message = err.to_string();
    error!(
        pipeline_job_id = ctx.pipeline_job_id,
        document_id = ctx.document_id,
        error_type = err.error_type(),
        %error_message,
        "phase failed"
    );

    for failed in &ctx.failed_phases {
        if failed.already_marked {
            continue;
        }
        if let Some(phase_id) = &failed.phase_id {
            if let Err(db_err) = ctx
                .services
                .store
                .fail_phase(phase_id, err.error_type(), &error_message, None)
                .await
            {
                error!(phase_id, %db_err, "failed to mark phase failed");
            }
        }
    }

    let retryable = err.is_retryable();
    if ctx.retry_count < MAX_RETRIES && retryable {
        let delay = retry_delay_secs(ctx.retry_count, Some(&err));
        let next_retry = ctx.retry_count + 1;
        let retry_at = Utc::now() + ChronoDuration::seconds(delay as i64);

        info!(
            pipeline_job_id = ctx.pipeline_job_id,
            next_retry,
            max_retries = MAX_RETRIES,
            delay,
            "scheduling retry"
        );

        for failed in &ctx.failed_phases {
            let queued = ctx
                .services
                .store
                .insert_phase(NewPhase {
                    pipeline_job_id: ctx.pipeline_job_id.to_string(),
                    phase: failed.phase,
                    status: PhaseStatus::Queued,
                    parent_phase_id: failed.phase_id.clone(),
                    retry_count: next_retry,
                    input_location: failed.input_location.clone(),
                    queued_at: Some(retry_at),
                    started_at: None,
                    expected_completion_at: None,
                    metadata: Map::new(),
                })
                .await;
            if let Err(db_err) = queued {
                error!(%db_err, "failed to insert queued retry phase");
            }
        }

        let mut patch = Map::new();
        patch.insert("retry_at".to_string(), json!(retry_at.to_rfc3339()));
        patch.insert("retry_count".to_string(), json!(next_retry));
        patch.insert(
            "last_error".to_string(),
            json!(truncate(&error_message, LAST_ERROR_MAX_CHARS)),
        );
        if let Err(db_err) = ctx
            .services
            .store
            .merge_job_metadata(ctx.pipeline_job_id, patch)
            .await
        {
            error!(%db_err, "failed to write retry metadata");
        }

        let retry_id = broker_job_id(ctx.queue, ctx.pipeline_job_id, next_retry);
        if let Err(broker_err) = ctx
            .services
            .broker
            .enqueue_in(ctx.queue, delay, &ctx.retry_payload, &retry_id, &ctx.description)
            .await
        {
            error!(%broker_err, "failed to enqueue retry");
        }

        return json!({
            "status": "retrying",
            "error": error_message,
            "retry_count": ctx.retry_count,
            "next_retry": next_retry,
            "delay_secs": delay,
        });
    }

    let reason = if !retryable {
        format!("non-retryable error ({})", err.error_type())
    } else {
        format!("max retries ({MAX_RETRIES}) exceeded")
    };
    warn!(
        pipeline_job_id = ctx.pipeline_job_id,
        document_id = ctx.document_id,
        reason,
        "giving up"
    );

    if let Err(db_err) = ctx.services.store.fail_job(ctx.pipeline_job_id).await {
        error!(%db_err, "failed to mark job failed");
    }
    let mut patch = Map::new();
    patch.insert(
        "final_error".to_string(),
        json!(truncate(&error_message, LAST_ERROR_MAX_CHARS)),
    );
    if let Err(db_err) = ctx
        .services
        .store
        .merge_job_metadata(ctx.pipeline_job_id, patch)
        .await
    {
        error!(%db_err, "failed to write final error");
    }

    json!({
        "status": "failed",
        "error": error_message,
        "retry_count": ctx.retry_count,
    })
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_ids_distinguish_attempts() {
        assert_eq!(broker_job_id(QueueName::Extraction, "j1", 0), "extract_j1");
        assert_eq!(broker_job_id(QueueName::Chunking, "j1", 2), "chunk_j1_r2");
        assert_eq!(broker_job_id(QueueName::KgIngest, "j1", 1), "kg_j1_r1");
        assert_eq!(
            broker_job_id(QueueName::IngestExtract, "j1", 0),
            "ingest_extract_j1"
        );
    }

    #[test]
    fn truncation_is_char_safe() {
        assert_eq!(truncate("abcdef", 3), "abc");
        assert_eq!(truncate("héllo", 2), "hé");
    }
}
