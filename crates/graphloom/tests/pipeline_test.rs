//! End-to-end pipeline tests.
//!
//! Everything runs in-process: in-memory KV and SQLite, in-memory
//! object store, an in-memory graph engine, and scripted LLM /
//! transcription / origin fakes. The worker is driven by draining the
//! queues; delayed retries are released by advancing the manual clock
//! and promoting, exactly as the scheduler process would.

use async_trait::async_trait;
use bytes::Bytes;
use graphloom_conductor::{
    requeue_failed_kg_jobs, DeletionCoordinator, OrphanReaper, PipelineCoordinator, SubmitRequest,
};
use graphloom_db::{NewChunk, NewDocument, NewPhase, PipelineStore};
use graphloom_extract::{ExtractError, ExtractionService, Transcriber, Transcript};
use graphloom_graph::{
    EpisodeReceipt, EpisodeRequest, GraphClient, GraphError, GraphIngestor, MemoryGraphClient,
    SearchResult,
};
use graphloom_kv::{ManualClock, MemoryKv, QueueBroker, RateGovernor};
use graphloom_protocol::{
    JobStatus, KgIngestPayload, Phase, PhaseStatus, QueueName, QueuePayload,
};
use graphloom_worker::{
    ContextModel, ContextualChunker, LlmError, OriginFile, Services, SituateReply, SourceOrigin,
    Worker,
};
use graphloom_storage::StorageGateway;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Map;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// ============================================================================
// Fakes
// ============================================================================

/// LLM fake: optional hard failures for the first N calls, then
/// canned contexts.
struct ScriptedModel {
    calls: AtomicUsize,
    fail_first_n: usize,
}

impl ScriptedModel {
    fn ok() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail_first_n: 0,
        })
    }

    fn failing_first(n: usize) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail_first_n: n,
        })
    }
}

#[async_trait]
impl ContextModel for ScriptedModel {
    async fn situate(
        &self,
        _system_prompt: &str,
        _user_content: &str,
    ) -> Result<SituateReply, LlmError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.fail_first_n {
            return Err(LlmError::Http {
                status: 500,
                message: "model backend unavailable".into(),
            });
        }
        Ok(SituateReply {
            text: format!("situating context {call}"),
            cache_creation_input_tokens: 0,
            cache_read_input_tokens: 0,
        })
    }
}

struct StaticTranscriber;

#[async_trait]
impl Transcriber for StaticTranscriber {
    async fn transcribe(&self, _audio: Bytes, _mime: &str) -> Result<Transcript, ExtractError> {
        Ok(Transcript {
            text: "spoken words from the recording".into(),
            confidence: Some(0.95),
            duration_seconds: Some(30.0),
        })
    }
}

/// Origin fake standing in for the Drive adapter.
struct ScriptedOrigin {
    data: Bytes,
    mime_type: String,
}

#[async_trait]
impl SourceOrigin for ScriptedOrigin {
    async fn fetch(
        &self,
        _source_location: &str,
        _user_id: &str,
        _tenant_id: &str,
    ) -> Result<OriginFile, graphloom_protocol::PipelineError> {
        Ok(OriginFile {
            data: self.data.clone(),
            mime_type: self.mime_type.clone(),
            name: None,
        })
    }
}

/// Graph engine that fails one specific add_episode call.
struct FlakyGraph {
    inner: MemoryGraphClient,
    calls: AtomicUsize,
    fail_on_call: usize,
}

#[async_trait]
impl GraphClient for FlakyGraph {
    async fn add_episode(&self, request: &EpisodeRequest) -> Result<EpisodeReceipt, GraphError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_on_call {
            return Err(GraphError::Http {
                status: 500,
                message: "engine hiccup".into(),
            });
        }
        self.inner.add_episode(request).await
    }

    async fn remove_episode(&self, uuid: &str) -> Result<(), GraphError> {
        self.inner.remove_episode(uuid).await
    }

    async fn search(
        &self,
        query: &str,
        num_results: usize,
        group_ids: &[String],
    ) -> Result<Vec<SearchResult>, GraphError> {
        self.inner.search(query, num_results, group_ids).await
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    clock: Arc<ManualClock>,
    store: PipelineStore,
    broker: QueueBroker,
    storage: StorageGateway,
    services: Arc<Services>,
    worker: Worker,
    coordinator: PipelineCoordinator,
}

impl Harness {
    async fn build(
        graph: Arc<dyn GraphClient>,
        model: Arc<dyn ContextModel>,
        origin: Arc<dyn SourceOrigin>,
    ) -> Self {
        let clock = Arc::new(ManualClock::new(1_000_000.0));
        let kv = Arc::new(MemoryKv::new(clock.clone()));
        let store = PipelineStore::connect_memory().await.unwrap();
        let broker = QueueBroker::new(kv.clone(), clock.clone());
        let storage = StorageGateway::memory();

        let extractor = ExtractionService::new(Arc::new(StaticTranscriber));
        let chunker = ContextualChunker::new(
            model,
            Arc::new(RateGovernor::new(
                kv.clone(),
                clock.clone(),
                "anthropic",
                None,
                None,
            )),
            3,
        );
        let ingestor = GraphIngestor::new(
            graph,
            store.clone(),
            Arc::new(RateGovernor::new(
                kv.clone(),
                clock.clone(),
                "openai",
                None,
                None,
            )),
            4,
        );

        let services = Arc::new(Services::new(
            store.clone(),
            broker.clone(),
            storage.clone(),
            extractor,
            chunker,
            ingestor,
            origin,
        ));
        let worker = Worker::new(services.clone(), QueueName::ALL.to_vec());
        let coordinator = PipelineCoordinator::new(store.clone(), broker.clone());

        Self {
            clock,
            store,
            broker,
            storage,
            services,
            worker,
            coordinator,
        }
    }

    async fn simple(graph: Arc<dyn GraphClient>) -> Self {
        Self::build(
            graph,
            ScriptedModel::ok(),
            Arc::new(ScriptedOrigin {
                data: Bytes::from_static(b"origin text body."),
                mime_type: "text/plain".into(),
            }),
        )
        .await
    }

    async fn insert_document(&self, id: &str, tenant: &str, file_type: &str) {
        self.store
            .insert_document(NewDocument {
                id: id.to_string(),
                tenant_id: tenant.to_string(),
                title: format!("Title of {id}"),
                file_type: file_type.to_string(),
                source_platform: "manual_upload".to_string(),
                folder_id: None,
                storage_path: None,
                source_metadata: Map::new(),
            })
            .await
            .unwrap();
    }

    /// Advance the clock past the longest retry delay and promote, as
    /// the scheduler process would.
    async fn release_retries(&self) {
        self.clock.advance(1_000.0);
        for queue in QueueName::ALL {
            self.broker.promote_scheduled(queue).await.unwrap();
        }
    }

    async fn job_status(&self, job_id: &str) -> (JobStatus, Phase) {
        let job = self.store.fetch_job(job_id).await.unwrap().unwrap();
        (job.status().unwrap(), job.phase().unwrap())
    }

    /// Invariant 1: a terminal job leaves no non-terminal phases.
    async fn assert_phases_terminal(&self, job_id: &str) {
        for phase in self.store.phases_for_job(job_id).await.unwrap() {
            assert!(
                phase.status().unwrap().is_terminal(),
                "phase {} ({}) left in {}",
                phase.id,
                phase.phase,
                phase.status
            );
        }
    }
}

fn long_text(sentences: usize) -> String {
    (0..sentences)
        .map(|i| {
            format!("Sentence number {i} covers topic {} in enough words to make the packing interesting.", i % 5)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// Scenarios
// ============================================================================

/// S1: a short text document flows through every phase and lands as
/// one chunk whose context is the document title.
#[tokio::test]
async fn short_text_document_end_to_end() {
    let graph = Arc::new(MemoryGraphClient::new());
    let harness = Harness::simple(graph.clone()).await;
    harness.insert_document("doc-1", "org_1", "txt").await;

    let body = "This is a short note. ".repeat(18); // ~400 chars
    harness
        .storage
        .put("raw_documents/doc-1.txt", Bytes::from(body))
        .await
        .unwrap();

    let receipt = harness
        .coordinator
        .submit(SubmitRequest {
            document_id: "doc-1".into(),
            tenant_id: "org_1".into(),
            source_name: "note.txt".into(),
            source_platform: "manual_upload".into(),
            file_type: "txt".into(),
            raw_location: Some("raw_documents/doc-1.txt".into()),
            source_location: None,
            store_raw: false,
            user_id: None,
        })
        .await
        .unwrap();

    assert_eq!(harness.worker.drain().await, 3); // extract, chunk, kg

    let (status, phase) = harness.job_status(&receipt.pipeline_job_id).await;
    assert_eq!(status, JobStatus::Completed);
    assert_eq!(phase, Phase::Completed);
    harness.assert_phases_terminal(&receipt.pipeline_job_id).await;

    let phases = harness
        .store
        .phases_for_job(&receipt.pipeline_job_id)
        .await
        .unwrap();
    let by_label = |label: Phase| {
        phases
            .iter()
            .filter(|p| p.phase().unwrap() == label)
            .collect::<Vec<_>>()
    };
    assert_eq!(by_label(Phase::Ingestion)[0].status().unwrap(), PhaseStatus::Skipped);
    assert_eq!(by_label(Phase::Extraction)[0].status().unwrap(), PhaseStatus::Completed);
    assert_eq!(by_label(Phase::Chunking)[0].status().unwrap(), PhaseStatus::Completed);
    assert_eq!(by_label(Phase::KgIngest)[0].status().unwrap(), PhaseStatus::Completed);

    let chunks = harness.store.chunks_for_document("doc-1").await.unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].chunk_index, 0);
    // Short document: the context is the title, no LLM involved.
    assert_eq!(chunks[0].context, "note.txt");

    let mappings = harness.store.mappings_for_document("doc-1").await.unwrap();
    assert_eq!(mappings.len(), 1);
    assert_eq!(mappings[0].tenant_id, "org_1");
    assert_eq!(graph.episode_count(), 1);
    assert_eq!(graph.group_ids(), vec!["org_1".to_string()]);

    let document = harness.store.fetch_document("doc-1").await.unwrap().unwrap();
    assert_eq!(document.processing_status, "available");

    // Processing results merged into the namespaced metadata.
    let metadata = document.source_metadata();
    assert_eq!(metadata["processing"]["chunk_count"], 1);
    assert!(metadata["processing"]["word_count"].as_u64().unwrap() > 0);
    assert!(metadata.get("source").is_some());
}

/// S2: an external-source import runs the combined ingest+extract
/// handler — two phase rows in one invocation, raw not stored by
/// default.
#[tokio::test]
async fn external_source_import_uses_combined_phase_pair() {
    let graph = Arc::new(MemoryGraphClient::new());
    let harness = Harness::simple(graph.clone()).await;
    harness.insert_document("doc-2", "org_1", "gdoc").await;

    let receipt = harness
        .coordinator
        .submit(SubmitRequest {
            document_id: "doc-2".into(),
            tenant_id: "org_1".into(),
            source_name: "Imported Doc".into(),
            source_platform: "google_drive".into(),
            file_type: "gdoc".into(),
            raw_location: None,
            source_location: Some("gdrive://abc".into()),
            store_raw: false,
            user_id: Some("user-1".into()),
        })
        .await
        .unwrap();

    assert_eq!(harness.worker.drain().await, 3); // ingest+extract, chunk, kg

    let (status, _) = harness.job_status(&receipt.pipeline_job_id).await;
    assert_eq!(status, JobStatus::Completed);

    let phases = harness
        .store
        .phases_for_job(&receipt.pipeline_job_id)
        .await
        .unwrap();
    let ingestion: Vec<_> = phases
        .iter()
        .filter(|p| p.phase().unwrap() == Phase::Ingestion)
        .collect();
    assert_eq!(ingestion.len(), 1);
    assert_eq!(ingestion[0].status().unwrap(), PhaseStatus::Completed);
    // In-memory hand-off: the ingestion row has no output location.
    assert!(ingestion[0].output_location.is_none());

    let extraction: Vec<_> = phases
        .iter()
        .filter(|p| p.phase().unwrap() == Phase::Extraction)
        .collect();
    assert_eq!(extraction.len(), 1);
    assert_eq!(
        extraction[0].output_location.as_deref(),
        Some("extracted_text/doc-2.txt")
    );

    // Extracted text matches the origin payload; raw was not stored.
    let text = harness
        .storage
        .load_extracted_text("extracted_text/doc-2.txt")
        .await
        .unwrap();
    assert_eq!(text, "origin text body.");
    assert!(harness
        .storage
        .load_raw_document("raw_documents/doc-2.txt")
        .await
        .is_err());

    assert_eq!(graph.episode_count(), 1);
}

/// A transient chunking failure retries after the delay and
/// converges; the failed and retry attempts form a parent chain.
#[tokio::test]
async fn transient_chunking_failure_retries_and_converges() {
    let graph = Arc::new(MemoryGraphClient::new());
    let harness = Harness::build(
        graph.clone(),
        ScriptedModel::failing_first(1),
        Arc::new(ScriptedOrigin {
            data: Bytes::new(),
            mime_type: "text/plain".into(),
        }),
    )
    .await;
    tokio::time::pause();
    harness.insert_document("doc-3", "org_1", "txt").await;
    harness
        .storage
        .put("raw_documents/doc-3.txt", Bytes::from(long_text(150)))
        .await
        .unwrap();

    let receipt = harness
        .coordinator
        .submit(SubmitRequest {
            document_id: "doc-3".into(),
            tenant_id: "org_1".into(),
            source_name: "big.txt".into(),
            source_platform: "manual_upload".into(),
            file_type: "txt".into(),
            raw_location: Some("raw_documents/doc-3.txt".into()),
            source_location: None,
            store_raw: false,
            user_id: None,
        })
        .await
        .unwrap();

    // First pass: extraction succeeds, chunking fails on the model.
    harness.worker.drain().await;
    let (status, phase) = harness.job_status(&receipt.pipeline_job_id).await;
    assert_eq!(status, JobStatus::Processing);
    assert_eq!(phase, Phase::Chunking);

    let job = harness
        .store
        .fetch_job(&receipt.pipeline_job_id)
        .await
        .unwrap()
        .unwrap();
    let metadata = job.metadata();
    assert!(metadata.get("retry_at").is_some());
    assert_eq!(metadata["retry_count"], 1);

    // Release the delayed retry; the second attempt succeeds.
    harness.release_retries().await;
    harness.worker.drain().await;

    let (status, _) = harness.job_status(&receipt.pipeline_job_id).await;
    assert_eq!(status, JobStatus::Completed);
    harness.assert_phases_terminal(&receipt.pipeline_job_id).await;

    // Retry banner cleared on the successful attempt.
    let job = harness
        .store
        .fetch_job(&receipt.pipeline_job_id)
        .await
        .unwrap()
        .unwrap();
    assert!(job.metadata().get("retry_at").is_none());

    // Exactly one failed attempt chained to one successful retry.
    let chunking: Vec<_> = harness
        .store
        .phases_for_job(&receipt.pipeline_job_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|p| p.phase().unwrap() == Phase::Chunking)
        .collect();
    assert_eq!(chunking.len(), 2);
    let failed = chunking
        .iter()
        .find(|p| p.status().unwrap() == PhaseStatus::Failed)
        .unwrap();
    let succeeded = chunking
        .iter()
        .find(|p| p.status().unwrap() == PhaseStatus::Completed)
        .unwrap();
    assert_eq!(succeeded.parent_phase_id.as_deref(), Some(failed.id.as_str()));
    assert_eq!(succeeded.retry_count, failed.retry_count + 1);

    // No duplicate chunk rows after the retry.
    let chunks = harness.store.chunks_for_document("doc-3").await.unwrap();
    let indexes: Vec<i64> = chunks.iter().map(|c| c.chunk_index).collect();
    assert_eq!(indexes, (0..chunks.len() as i64).collect::<Vec<_>>());
}

/// Four consecutive transient failures exhaust the retry budget and
/// fail the job.
#[tokio::test]
async fn retry_budget_exhaustion_fails_the_job() {
    let graph = Arc::new(MemoryGraphClient::new());
    let harness = Harness::build(
        graph,
        ScriptedModel::failing_first(10_000),
        Arc::new(ScriptedOrigin {
            data: Bytes::new(),
            mime_type: "text/plain".into(),
        }),
    )
    .await;
    tokio::time::pause();
    harness.insert_document("doc-4", "org_1", "txt").await;
    harness
        .storage
        .put("raw_documents/doc-4.txt", Bytes::from(long_text(150)))
        .await
        .unwrap();

    let receipt = harness
        .coordinator
        .submit(SubmitRequest {
            document_id: "doc-4".into(),
            tenant_id: "org_1".into(),
            source_name: "doomed.txt".into(),
            source_platform: "manual_upload".into(),
            file_type: "txt".into(),
            raw_location: Some("raw_documents/doc-4.txt".into()),
            source_location: None,
            store_raw: false,
            user_id: None,
        })
        .await
        .unwrap();

    // Initial attempt plus three retries.
    for _ in 0..4 {
        harness.worker.drain().await;
        harness.release_retries().await;
    }
    harness.worker.drain().await;

    let (status, _) = harness.job_status(&receipt.pipeline_job_id).await;
    assert_eq!(status, JobStatus::Failed);
    harness.assert_phases_terminal(&receipt.pipeline_job_id).await;

    let chunking: Vec<_> = harness
        .store
        .phases_for_job(&receipt.pipeline_job_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|p| p.phase().unwrap() == Phase::Chunking)
        .collect();
    assert_eq!(chunking.len(), 4);
    let mut counts: Vec<i64> = chunking.iter().map(|p| p.retry_count).collect();
    counts.sort();
    assert_eq!(counts, vec![0, 1, 2, 3]);
    // One root, everyone else chained.
    assert_eq!(
        chunking.iter().filter(|p| p.parent_phase_id.is_none()).count(),
        1
    );
}

/// S4: a partial graph ingest compensates fully, retries, and the
/// retry lands every chunk.
#[tokio::test]
async fn partial_graph_ingest_compensates_then_retries_clean() {
    let flaky = Arc::new(FlakyGraph {
        inner: MemoryGraphClient::new(),
        calls: AtomicUsize::new(0),
        fail_on_call: 5,
    });
    let harness = Harness::simple(flaky.clone()).await;
    tokio::time::pause();
    harness.insert_document("doc-5", "org_1", "txt").await;

    let job = harness
        .store
        .create_job("doc-5", "org_1", Phase::KgIngest, Map::new())
        .await
        .unwrap();
    let chunks: Vec<NewChunk> = (0..10)
        .map(|i| NewChunk {
            chunk_index: i,
            content: format!("chunk body {i}"),
            context: format!("chunk context {i}"),
            token_count: 16,
            char_start: i * 120,
            char_end: (i + 1) * 120,
        })
        .collect();
    harness.store.replace_chunks("doc-5", &chunks).await.unwrap();

    let payload = QueuePayload::KgIngest(KgIngestPayload {
        pipeline_job_id: job.id.clone(),
        document_id: "doc-5".into(),
        source_name: "big.txt".into(),
        source_platform: "manual_upload".into(),
        tenant_id: "org_1".into(),
        retry_count: 0,
        parent_phase_id: None,
        metadata: Map::new(),
    });
    harness
        .broker
        .enqueue(
            QueueName::KgIngest,
            &payload,
            &QueueName::KgIngest.job_id(&job.id, 0),
            "KG ingesting big.txt",
        )
        .await
        .unwrap();

    harness.worker.drain().await;

    // Compensation: no mappings, no episodes left behind.
    assert!(harness.store.mappings_for_document("doc-5").await.unwrap().is_empty());
    assert_eq!(flaky.inner.episode_count(), 0);

    let phases = harness.store.phases_for_job(&job.id).await.unwrap();
    let failed = phases
        .iter()
        .find(|p| p.status().unwrap() == PhaseStatus::Failed)
        .unwrap();
    assert_eq!(failed.error_type.as_deref(), Some("PartialIngestFailure"));
    let queued = phases
        .iter()
        .find(|p| p.status().unwrap() == PhaseStatus::Queued)
        .unwrap();
    assert_eq!(queued.parent_phase_id.as_deref(), Some(failed.id.as_str()));

    // Retry with no injection: all ten land.
    harness.release_retries().await;
    harness.worker.drain().await;

    let (status, _) = harness.job_status(&job.id).await;
    assert_eq!(status, JobStatus::Completed);
    assert_eq!(
        harness.store.mappings_for_document("doc-5").await.unwrap().len(),
        10
    );
    assert_eq!(flaky.inner.episode_count(), 10);
    harness.assert_phases_terminal(&job.id).await;
}

/// S5: a phase stuck past its deadline is reaped to a timeout
/// failure, taking its job with it.
#[tokio::test]
async fn orphaned_phase_is_reaped() {
    let graph = Arc::new(MemoryGraphClient::new());
    let harness = Harness::simple(graph).await;
    harness.insert_document("doc-6", "org_1", "txt").await;

    let job = harness
        .store
        .create_job("doc-6", "org_1", Phase::Extraction, Map::new())
        .await
        .unwrap();
    // A worker crashed mid-phase: processing, deadline in the past.
    let now = Utc::now();
    let phase = harness
        .store
        .insert_phase(NewPhase {
            pipeline_job_id: job.id.clone(),
            phase: Phase::Extraction,
            status: PhaseStatus::Processing,
            parent_phase_id: None,
            retry_count: 0,
            input_location: None,
            queued_at: None,
            started_at: Some(now - ChronoDuration::seconds(4000)),
            expected_completion_at: Some(now - ChronoDuration::seconds(100)),
            metadata: Map::new(),
        })
        .await
        .unwrap();

    let reaper = OrphanReaper::new(harness.store.clone());
    assert_eq!(reaper.sweep_once().await.unwrap(), 1);

    let phase = harness.store.fetch_phase(&phase.id).await.unwrap().unwrap();
    assert_eq!(phase.status().unwrap(), PhaseStatus::Failed);
    assert_eq!(phase.error_type.as_deref(), Some("TimeoutError"));

    let (status, _) = harness.job_status(&job.id).await;
    assert_eq!(status, JobStatus::Failed);
    let job = harness.store.fetch_job(&job.id).await.unwrap().unwrap();
    assert_eq!(job.metadata()["orphaned"], true);

    // Second sweep finds nothing.
    assert_eq!(reaper.sweep_once().await.unwrap(), 0);
}

/// S6: deleting a document mid-flight cancels the job; the late
/// worker short-circuits at its gate and leaves nothing behind.
#[tokio::test]
async fn mid_flight_delete_cancels_and_cleans_up() {
    let graph = Arc::new(MemoryGraphClient::new());
    let harness = Harness::simple(graph.clone()).await;
    harness.insert_document("doc-7", "org_1", "mp4").await;
    harness
        .storage
        .put("raw_documents/doc-7.mp4", Bytes::from_static(b"fake-video"))
        .await
        .unwrap();

    let receipt = harness
        .coordinator
        .submit(SubmitRequest {
            document_id: "doc-7".into(),
            tenant_id: "org_1".into(),
            source_name: "talk.mp4".into(),
            source_platform: "manual_upload".into(),
            file_type: "mp4".into(),
            raw_location: Some("raw_documents/doc-7.mp4".into()),
            source_location: None,
            store_raw: false,
            user_id: None,
        })
        .await
        .unwrap();

    // Deletion lands while the item is still queued.
    let deleter = DeletionCoordinator::new(harness.store.clone(), graph.clone());
    deleter.delete("doc-7", "org_1").await.unwrap();

    // The late-starting worker checks the job and exits cleanly.
    assert_eq!(harness.worker.drain().await, 1);
    let broker_job = harness
        .broker
        .fetch(&receipt.queue_job_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(broker_job.result.unwrap()["status"], "skipped");

    let (status, _) = harness.job_status(&receipt.pipeline_job_id).await;
    assert_eq!(status, JobStatus::Cancelled);
    harness.assert_phases_terminal(&receipt.pipeline_job_id).await;

    assert!(harness.store.fetch_document("doc-7").await.unwrap().is_none());
    assert!(harness.store.chunks_for_document("doc-7").await.unwrap().is_empty());
    assert!(harness.store.mappings_for_document("doc-7").await.unwrap().is_empty());
    assert_eq!(graph.episode_count(), 0);
}

/// Deleting a completed document removes its episodes from the graph
/// via the mapping ledger.
#[tokio::test]
async fn delete_after_completion_removes_graph_entities() {
    let graph = Arc::new(MemoryGraphClient::new());
    let harness = Harness::simple(graph.clone()).await;
    harness.insert_document("doc-8", "org_1", "txt").await;
    harness
        .storage
        .put("raw_documents/doc-8.txt", Bytes::from_static(b"A short note."))
        .await
        .unwrap();

    harness
        .coordinator
        .submit(SubmitRequest {
            document_id: "doc-8".into(),
            tenant_id: "org_1".into(),
            source_name: "note.txt".into(),
            source_platform: "manual_upload".into(),
            file_type: "txt".into(),
            raw_location: Some("raw_documents/doc-8.txt".into()),
            source_location: None,
            store_raw: false,
            user_id: None,
        })
        .await
        .unwrap();
    harness.worker.drain().await;
    assert_eq!(graph.episode_count(), 1);

    // Cross-tenant deletion is refused outright.
    let deleter = DeletionCoordinator::new(harness.store.clone(), graph.clone());
    assert!(deleter.delete("doc-8", "org_other").await.is_err());
    assert_eq!(graph.episode_count(), 1);

    deleter.delete("doc-8", "org_1").await.unwrap();
    assert_eq!(graph.episode_count(), 0);
    assert!(harness.store.mappings_for_document("doc-8").await.unwrap().is_empty());
}

/// A non-retryable extraction error fails the job immediately, with
/// no retry phases scheduled.
#[tokio::test]
async fn non_retryable_error_fails_without_retries() {
    let graph = Arc::new(MemoryGraphClient::new());
    let harness = Harness::simple(graph).await;
    harness.insert_document("doc-9", "org_1", "zip").await;
    harness
        .storage
        .put("raw_documents/doc-9.zip", Bytes::from_static(b"PK\x03\x04"))
        .await
        .unwrap();

    let receipt = harness
        .coordinator
        .submit(SubmitRequest {
            document_id: "doc-9".into(),
            tenant_id: "org_1".into(),
            source_name: "archive.zip".into(),
            source_platform: "manual_upload".into(),
            file_type: "zip".into(),
            raw_location: Some("raw_documents/doc-9.zip".into()),
            source_location: None,
            store_raw: false,
            user_id: None,
        })
        .await
        .unwrap();

    harness.worker.drain().await;

    let (status, _) = harness.job_status(&receipt.pipeline_job_id).await;
    assert_eq!(status, JobStatus::Failed);

    let phases = harness
        .store
        .phases_for_job(&receipt.pipeline_job_id)
        .await
        .unwrap();
    // Skipped ingestion plus the one failed extraction; no queued
    // retries for a ValueError.
    assert_eq!(phases.len(), 2);
    let failed = phases
        .iter()
        .find(|p| p.status().unwrap() == PhaseStatus::Failed)
        .unwrap();
    assert_eq!(failed.error_type.as_deref(), Some("ValueError"));

    // The worker never touches the document status on failure.
    let document = harness.store.fetch_document("doc-9").await.unwrap().unwrap();
    assert_eq!(document.processing_status, "processing");
}

/// An empty extraction is not an error: the job completes without
/// later phases and the document becomes available as-is.
#[tokio::test]
async fn empty_extraction_completes_without_later_phases() {
    let graph = Arc::new(MemoryGraphClient::new());
    let harness = Harness::build(
        graph.clone(),
        ScriptedModel::ok(),
        Arc::new(ScriptedOrigin {
            data: Bytes::new(),
            mime_type: "text/plain".into(),
        }),
    )
    .await;
    harness.insert_document("doc-11", "org_1", "txt").await;

    let receipt = harness
        .coordinator
        .submit(SubmitRequest {
            document_id: "doc-11".into(),
            tenant_id: "org_1".into(),
            source_name: "silence.txt".into(),
            source_platform: "google_drive".into(),
            file_type: "txt".into(),
            raw_location: None,
            source_location: Some("gdrive://empty".into()),
            store_raw: false,
            user_id: Some("user-1".into()),
        })
        .await
        .unwrap();

    // One invocation: ingest+extract, then nothing else to do.
    assert_eq!(harness.worker.drain().await, 1);

    let (status, phase) = harness.job_status(&receipt.pipeline_job_id).await;
    assert_eq!(status, JobStatus::Completed);
    assert_eq!(phase, Phase::Completed);

    let phases = harness
        .store
        .phases_for_job(&receipt.pipeline_job_id)
        .await
        .unwrap();
    let extraction = phases
        .iter()
        .find(|p| p.phase().unwrap() == Phase::Extraction)
        .unwrap();
    assert_eq!(extraction.metadata()["empty_extraction"], true);

    assert!(harness.store.chunks_for_document("doc-11").await.unwrap().is_empty());
    assert_eq!(graph.episode_count(), 0);
    let document = harness.store.fetch_document("doc-11").await.unwrap().unwrap();
    assert_eq!(document.processing_status, "available");
}

/// Failed kg jobs whose chunks survived can be requeued wholesale.
#[tokio::test]
async fn requeue_reopens_failed_kg_jobs() {
    // Fail enough calls to exhaust the retry budget (initial attempt
    // plus three retries, one call each before compensation).
    let flaky = Arc::new(FlakyGraph {
        inner: MemoryGraphClient::new(),
        calls: AtomicUsize::new(0),
        fail_on_call: 1,
    });

    let harness = Harness::simple(flaky.clone()).await;
    tokio::time::pause();
    harness.insert_document("doc-10", "org_1", "txt").await;
    let job = harness
        .store
        .create_job("doc-10", "org_1", Phase::KgIngest, Map::new())
        .await
        .unwrap();
    harness
        .store
        .replace_chunks(
            "doc-10",
            &[NewChunk {
                chunk_index: 0,
                content: "only chunk".into(),
                context: "ctx".into(),
                token_count: 4,
                char_start: 0,
                char_end: 10,
            }],
        )
        .await
        .unwrap();

    let payload = QueuePayload::KgIngest(KgIngestPayload {
        pipeline_job_id: job.id.clone(),
        document_id: "doc-10".into(),
        source_name: "solo.txt".into(),
        source_platform: "manual_upload".into(),
        tenant_id: "org_1".into(),
        retry_count: 0,
        parent_phase_id: None,
        metadata: Map::new(),
    });
    harness
        .broker
        .enqueue(
            QueueName::KgIngest,
            &payload,
            &QueueName::KgIngest.job_id(&job.id, 0),
            "KG ingesting solo.txt",
        )
        .await
        .unwrap();

    // Only the very first add_episode fails, but that exhausts the
    // attempt; the job retries and eventually succeeds... so force
    // failure by exhausting retries with a one-shot drain instead.
    harness.worker.drain().await;
    let phases = harness.store.phases_for_job(&job.id).await.unwrap();
    assert!(phases
        .iter()
        .any(|p| p.status().unwrap() == PhaseStatus::Failed));

    // Simulate the operator path: mark the job failed at kg_ingest,
    // then requeue it.
    harness.store.fail_job(&job.id).await.unwrap();
    let requeued = requeue_failed_kg_jobs(&harness.store, &harness.broker).await.unwrap();
    assert_eq!(requeued, 1);

    let (status, phase) = harness.job_status(&job.id).await;
    assert_eq!(status, JobStatus::Processing);
    assert_eq!(phase, Phase::KgIngest);

    harness.worker.drain().await;
    let (status, _) = harness.job_status(&job.id).await;
    assert_eq!(status, JobStatus::Completed);
    assert_eq!(flaky.inner.episode_count(), 1);
    drop(harness.services);
}
