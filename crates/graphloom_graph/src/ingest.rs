//! Episode ingest with compensation.
//!
//! Each chunk becomes one episode, context-prefixed for retrieval.
//! The invariant this module restores on failure: the set of graph
//! entities associated with a document is either empty or complete.
//! The engine is not transactional with the relational store, so the
//! mapping table is the reconciliation ledger.

use crate::client::{EpisodeRequest, GraphClient};
use graphloom_db::{Document, DocumentChunk, PipelineStore};
use graphloom_kv::RateGovernor;
use graphloom_protocol::defaults::KG_PROVIDER_GRAPHITI;
use graphloom_protocol::tokens::estimate_call_tokens;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// Counts reported on a fully successful ingest.
#[derive(Debug, Clone)]
pub struct IngestReport {
    pub episode_count: usize,
    pub chunk_count: usize,
    /// First few episode ids, for phase metadata.
    pub sample_episode_ids: Vec<String>,
}

/// Partial failure, reported after compensation has already run.
#[derive(Debug, Clone)]
pub struct IngestFailure {
    pub chunk_count: usize,
    pub failed_count: usize,
    pub cleaned_up_episodes: usize,
}

impl IngestFailure {
    pub fn message(&self) -> String {
        format!(
            "Partial KG ingest failure: {}/{} chunks failed. Cleaned up {} episodes. Retry will re-process all chunks.",
            self.failed_count, self.chunk_count, self.cleaned_up_episodes
        )
    }
}

pub struct GraphIngestor {
    client: Arc<dyn GraphClient>,
    store: PipelineStore,
    governor: Arc<RateGovernor>,
    max_concurrent: usize,
}

impl GraphIngestor {
    pub fn new(
        client: Arc<dyn GraphClient>,
        store: PipelineStore,
        governor: Arc<RateGovernor>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            client,
            store,
            governor,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Submit every chunk as an episode, recording provenance rows as
    /// episodes land. Any chunk failure triggers compensation: all
    /// mapping rows for the document are deleted and every episode
    /// created in this attempt is removed (best effort, not rate
    /// governed — removal is a local graph operation).
    pub async fn ingest_document(
        &self,
        document: &Document,
        chunks: &[DocumentChunk],
    ) -> Result<IngestReport, IngestFailure> {
        let chunk_count = chunks.len();
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        // Every episode the engine created this attempt, whether or
        // not its mapping row landed; compensation must see them all.
        let created: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let tasks = chunks.iter().map(|chunk| {
            let semaphore = semaphore.clone();
            let created = created.clone();
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                match self.ingest_chunk(document, chunk, &created).await {
                    Ok(uuid) => Some(uuid),
                    Err(err) => {
                        warn!(
                            chunk_index = chunk.chunk_index,
                            document_id = %document.id,
                            %err,
                            "chunk failed to ingest"
                        );
                        None
                    }
                }
            }
        });

        let results = futures::future::join_all(tasks).await;
        let episode_ids: Vec<String> = results.into_iter().flatten().collect();
        let failed_count = chunk_count - episode_ids.len();

        if failed_count > 0 {
            let created_ids = created.lock().expect("ingest lock poisoned").clone();
            warn!(
                document_id = %document.id,
                failed_count,
                chunk_count,
                created = created_ids.len(),
                "partial ingest, compensating"
            );
            let cleaned = self.compensate(&document.id, &created_ids).await;
            return Err(IngestFailure {
                chunk_count,
                failed_count,
                cleaned_up_episodes: cleaned,
            });
        }

        info!(
            document_id = %document.id,
            episodes = episode_ids.len(),
            "graph ingest complete"
        );
        Ok(IngestReport {
            episode_count: episode_ids.len(),
            chunk_count,
            sample_episode_ids: episode_ids.into_iter().take(10).collect(),
        })
    }

    async fn ingest_chunk(
        &self,
        document: &Document,
        chunk: &DocumentChunk,
        created: &Mutex<Vec<String>>,
    ) -> Result<String, String> {
        // Context-prefixed body, per the retrieval pattern.
        let body = format!("{}\n\n{}", chunk.context, chunk.content);
        let estimated_tokens = estimate_call_tokens("", &body, None);

        self.governor
            .wait_for_request()
            .await
            .map_err(|e| e.to_string())?;
        self.governor
            .wait_for_tokens(estimated_tokens)
            .await
            .map_err(|e| e.to_string())?;

        let request = EpisodeRequest {
            name: format!("{} - Chunk {}", document.title, chunk.chunk_index),
            episode_body: body,
            source_description: chunk.context.clone(),
            reference_time: document.created_at,
            group_id: document.tenant_id.clone(),
        };

        let receipt = self
            .client
            .add_episode(&request)
            .await
            .map_err(|e| e.to_string())?;
        created
            .lock()
            .expect("ingest lock poisoned")
            .push(receipt.uuid.clone());

        self.store
            .insert_mapping(
                &document.tenant_id,
                &document.id,
                &receipt.uuid,
                KG_PROVIDER_GRAPHITI,
                &[chunk.id.clone()],
            )
            .await
            .map_err(|e| e.to_string())?;

        Ok(receipt.uuid)
    }

    /// Roll back partial external state: ledger rows first, then the
    /// episodes themselves. A missing episode is already gone.
    async fn compensate(&self, document_id: &str, created_ids: &[String]) -> usize {
        if let Err(err) = self.store.delete_mappings_for_document(document_id).await {
            warn!(document_id, %err, "failed to clear mapping rows during compensation");
        }

        let mut cleaned = 0;
        for uuid in created_ids {
            match self.client.remove_episode(uuid).await {
                Ok(()) => cleaned += 1,
                Err(err) => warn!(uuid, %err, "failed to remove episode during compensation"),
            }
        }
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{EpisodeReceipt, GraphError, MemoryGraphClient, SearchResult};
    use async_trait::async_trait;
    use graphloom_db::{NewChunk, NewDocument};
    use graphloom_kv::{ManualClock, MemoryKv};
    use serde_json::Map;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn fixture(chunk_count: u32) -> (PipelineStore, Document, Vec<DocumentChunk>) {
        let store = PipelineStore::connect_memory().await.unwrap();
        let document = store
            .insert_document(NewDocument {
                id: "doc-1".into(),
                tenant_id: "org_1".into(),
                title: "Quarterly Report".into(),
                file_type: "pdf".into(),
                source_platform: "manual_upload".into(),
                folder_id: None,
                storage_path: None,
                source_metadata: Map::new(),
            })
            .await
            .unwrap();

        let chunks: Vec<NewChunk> = (0..chunk_count)
            .map(|i| NewChunk {
                chunk_index: i,
                content: format!("content {i}"),
                context: format!("context {i}"),
                token_count: 10,
                char_start: i * 100,
                char_end: (i + 1) * 100,
            })
            .collect();
        store.replace_chunks("doc-1", &chunks).await.unwrap();
        let chunks = store.chunks_for_document("doc-1").await.unwrap();
        (store, document, chunks)
    }

    fn governor() -> Arc<RateGovernor> {
        let clock = Arc::new(ManualClock::new(0.0));
        let kv = Arc::new(MemoryKv::new(clock.clone()));
        Arc::new(RateGovernor::new(kv, clock, "openai", None, None))
    }

    /// Fails the nth add_episode call, passes the rest through.
    struct FlakyGraph {
        inner: MemoryGraphClient,
        calls: AtomicUsize,
        fail_on_call: usize,
    }

    #[async_trait]
    impl GraphClient for FlakyGraph {
        async fn add_episode(
            &self,
            request: &EpisodeRequest,
        ) -> Result<EpisodeReceipt, GraphError> {
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

    #[tokio::test]
    async fn full_success_records_one_mapping_per_chunk() {
        let (store, document, chunks) = fixture(4).await;
        let graph = Arc::new(MemoryGraphClient::new());
        let ingestor = GraphIngestor::new(graph.clone(), store.clone(), governor(), 2);

        let report = ingestor.ingest_document(&document, &chunks).await.unwrap();
        assert_eq!(report.episode_count, 4);
        assert_eq!(graph.episode_count(), 4);
        assert!(graph.group_ids().iter().all(|g| g == "org_1"));

        let mappings = store.mappings_for_document("doc-1").await.unwrap();
        assert_eq!(mappings.len(), 4);
        assert!(mappings.iter().all(|m| m.provider == "graphiti"));
    }

    #[tokio::test]
    async fn partial_failure_compensates_everything() {
        let (store, document, chunks) = fixture(10).await;
        let graph = Arc::new(FlakyGraph {
            inner: MemoryGraphClient::new(),
            calls: AtomicUsize::new(0),
            fail_on_call: 5,
        });
        // Serial execution so the 5th call is deterministic.
        let ingestor = GraphIngestor::new(graph.clone(), store.clone(), governor(), 1);

        let failure = ingestor
            .ingest_document(&document, &chunks)
            .await
            .unwrap_err();
        assert_eq!(failure.chunk_count, 10);
        assert_eq!(failure.failed_count, 1);
        assert_eq!(failure.cleaned_up_episodes, 9);

        // Ledger empty, graph empty: the invariant is restored.
        assert!(store.mappings_for_document("doc-1").await.unwrap().is_empty());
        assert_eq!(graph.inner.episode_count(), 0);
        assert!(failure.message().contains("1/10"));
    }
}
