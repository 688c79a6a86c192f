//! Deletion coordinator.
//!
//! Removing a document means: cancel what is in flight, remove its
//! graph entities (via the mapping ledger), then delete the row —
//! chunks and mappings cascade. Jobs survive as the audit trail.

use crate::coordinator::cancel_jobs_for_document;
use crate::coordinator::SubmitError;
use futures::future::join_all;
use graphloom_db::{DbError, KgEntityMapping, PipelineStore};
use graphloom_graph::{GraphClient, GraphError};
use graphloom_protocol::defaults::KG_PROVIDER_GRAPHITI;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum DeleteError {
    #[error("document not found: {0}")]
    NotFound(String),

    #[error("tenant mismatch: {0}")]
    TenantMismatch(String),

    #[error("unsupported KG providers found: {0:?}. Only 'graphiti' is currently supported")]
    UnsupportedProviders(Vec<String>),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error("graph engine error: {0}")]
    Graph(#[from] GraphError),
}

impl From<SubmitError> for DeleteError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::Db(db) => DeleteError::Db(db),
            other => DeleteError::TenantMismatch(other.to_string()),
        }
    }
}

pub struct DeletionCoordinator {
    store: PipelineStore,
    graph: Arc<dyn GraphClient>,
}

impl DeletionCoordinator {
    pub fn new(store: PipelineStore, graph: Arc<dyn GraphClient>) -> Self {
        Self { store, graph }
    }

    /// Delete one document: cancel jobs, remove episodes, drop the
    /// row. Missing episodes are non-fatal; other graph failures
    /// abort before the row is deleted so the ledger stays usable.
    pub async fn delete(&self, document_id: &str, tenant_id: &str) -> Result<(), DeleteError> {
        let document = self
            .store
            .fetch_document(document_id)
            .await?
            .ok_or_else(|| DeleteError::NotFound(document_id.to_string()))?;
        if document.tenant_id != tenant_id {
            return Err(DeleteError::TenantMismatch(format!(
                "document {document_id} does not belong to tenant {tenant_id}"
            )));
        }

        cancel_jobs_for_document(&self.store, document_id, tenant_id).await?;

        let mappings = self.store.mappings_for_document(document_id).await?;
        info!(
            document_id,
            entities = mappings.len(),
            "removing graph entities"
        );
        for mapping in &mappings {
            self.graph.remove_episode(&mapping.entity_id).await?;
        }

        self.store.delete_document(document_id, tenant_id).await?;
        info!(document_id, "document deleted");
        Ok(())
    }

    /// Batch deletion: cancellation and graph removal fan out in
    /// parallel; an unsupported provider label anywhere aborts the
    /// batch before any removal.
    pub async fn delete_batch(
        &self,
        document_ids: &[String],
        tenant_id: &str,
    ) -> Result<(usize, Vec<String>), DeleteError> {
        if document_ids.is_empty() {
            return Ok((0, Vec::new()));
        }

        let mut present = Vec::new();
        for document_id in document_ids {
            match self.store.fetch_document(document_id).await? {
                Some(document) if document.tenant_id != tenant_id => {
                    return Err(DeleteError::TenantMismatch(format!(
                        "document {document_id} does not belong to tenant {tenant_id}"
                    )));
                }
                Some(_) => present.push(document_id.clone()),
                None => warn!(document_id, "skipping missing document in batch delete"),
            }
        }

        let cancellations = present
            .iter()
            .map(|id| cancel_jobs_for_document(&self.store, id, tenant_id));
        for result in join_all(cancellations).await {
            if let Err(err) = result {
                warn!(%err, "cancellation failed during batch delete");
            }
        }

        let mut mappings: Vec<KgEntityMapping> = Vec::new();
        for document_id in &present {
            mappings.extend(self.store.mappings_for_document(document_id).await?);
        }

        let unsupported: BTreeSet<String> = mappings
            .iter()
            .filter(|m| m.provider != KG_PROVIDER_GRAPHITI)
            .map(|m| m.provider.clone())
            .collect();
        if !unsupported.is_empty() {
            return Err(DeleteError::UnsupportedProviders(
                unsupported.into_iter().collect(),
            ));
        }

        let removals = mappings
            .iter()
            .map(|mapping| self.graph.remove_episode(&mapping.entity_id));
        let mut errors = Vec::new();
        for result in join_all(removals).await {
            if let Err(err) = result {
                warn!(%err, "episode removal failed during batch delete");
                errors.push(err.to_string());
            }
        }

        let mut deleted = 0;
        for document_id in &present {
            self.store.delete_document(document_id, tenant_id).await?;
            deleted += 1;
        }

        info!(deleted, errors = errors.len(), "batch deletion complete");
        Ok((deleted, errors))
    }
}
