//! `PipelineStore` — all relational access behind one handle.
//!
//! Plain sqlx over a SQLite pool. Atomic units (chunk batches,
//! compensation) are explicit transactions; everything else is single
//! statements.

use crate::error::{DbError, Result};
use crate::metadata;
use crate::models::*;
use crate::schema;
use chrono::{DateTime, Utc};
use graphloom_protocol::{DocumentStatus, JobStatus, Phase, PhaseStatus};
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

#[derive(Clone)]
pub struct PipelineStore {
    pool: Pool<Sqlite>,
}

impl PipelineStore {
    /// Open the store and apply the schema. Foreign keys are enabled
    /// explicitly; the chunk and mapping cascades depend on them.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);

        // A shared in-memory database only exists on one connection.
        let is_memory = database_url.contains(":memory:");
        let max_connections = if is_memory { 1 } else { 5 };

        let mut pool_options = SqlitePoolOptions::new().max_connections(max_connections);
        if is_memory {
            // The sole in-memory connection must never be reaped: losing it
            // would drop the database, and reconnecting behind a paused
            // test clock can race the pool's acquire timeout.
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }

        let pool = pool_options.connect_with(options).await?;

        schema::init_schema(&pool).await?;
        info!("Connected to pipeline store");
        Ok(Self { pool })
    }

    /// In-memory store for tests and local experiments.
    pub async fn connect_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    // ========================================================================
    // Documents
    // ========================================================================

    pub async fn insert_document(&self, doc: NewDocument) -> Result<Document> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO document
                (id, tenant_id, title, file_type, source_platform, folder_id,
                 storage_path, processing_status, source_metadata, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.tenant_id)
        .bind(&doc.title)
        .bind(&doc.file_type)
        .bind(&doc.source_platform)
        .bind(&doc.folder_id)
        .bind(&doc.storage_path)
        .bind(DocumentStatus::Processing.as_str())
        .bind(serde_json::to_string(&doc.source_metadata)?)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.fetch_document(&doc.id)
            .await?
            .ok_or_else(|| DbError::not_found(format!("document {}", doc.id)))
    }

    pub async fn fetch_document(&self, id: &str) -> Result<Option<Document>> {
        Ok(
            sqlx::query_as::<_, Document>("SELECT * FROM document WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn update_document_status(&self, id: &str, status: DocumentStatus) -> Result<()> {
        sqlx::query("UPDATE document SET processing_status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Merge processing results into the document's namespaced source
    /// metadata, preserving the `source` namespace.
    pub async fn merge_document_metadata(
        &self,
        id: &str,
        processing_results: Map<String, Value>,
    ) -> Result<()> {
        let doc = self
            .fetch_document(id)
            .await?
            .ok_or_else(|| DbError::not_found(format!("document {id}")))?;
        let merged = metadata::merge_document_metadata(&doc.source_metadata(), processing_results);

        sqlx::query("UPDATE document SET source_metadata = ?, updated_at = ? WHERE id = ?")
            .bind(serde_json::to_string(&merged)?)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Hard-delete a document. Chunks and entity mappings cascade;
    /// pipeline jobs remain as the audit trail.
    pub async fn delete_document(&self, id: &str, tenant_id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM document WHERE id = ? AND tenant_id = ?")
            .bind(id)
            .bind(tenant_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::not_found(format!("document {id}")));
        }
        Ok(())
    }

    // ========================================================================
    // Pipeline jobs
    // ========================================================================

    pub async fn create_job(
        &self,
        document_id: &str,
        tenant_id: &str,
        current_phase: Phase,
        metadata_map: Map<String, Value>,
    ) -> Result<PipelineJob> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO pipeline_job
                (id, document_id, tenant_id, current_phase, status, started_at, updated_at, metadata)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(document_id)
        .bind(tenant_id)
        .bind(current_phase.as_str())
        .bind(JobStatus::Processing.as_str())
        .bind(now)
        .bind(now)
        .bind(serde_json::to_string(&metadata_map)?)
        .execute(&self.pool)
        .await?;

        self.fetch_job(&id)
            .await?
            .ok_or_else(|| DbError::not_found(format!("pipeline_job {id}")))
    }

    pub async fn fetch_job(&self, id: &str) -> Result<Option<PipelineJob>> {
        Ok(
            sqlx::query_as::<_, PipelineJob>("SELECT * FROM pipeline_job WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn set_job_phase(&self, id: &str, phase: Phase) -> Result<()> {
        sqlx::query("UPDATE pipeline_job SET current_phase = ?, updated_at = ? WHERE id = ?")
            .bind(phase.as_str())
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Terminal success: status and phase both land on completed.
    pub async fn complete_job(&self, id: &str) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE pipeline_job
            SET status = ?, current_phase = ?, completed_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(JobStatus::Completed.as_str())
        .bind(Phase::Completed.as_str())
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fail_job(&self, id: &str) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE pipeline_job SET status = ?, completed_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(JobStatus::Failed.as_str())
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Merge new keys into job metadata without clobbering the rest.
    /// A `Value::Null` removes the key, matching "clear retry_at".
    pub async fn merge_job_metadata(&self, id: &str, patch: Map<String, Value>) -> Result<()> {
        let job = self
            .fetch_job(id)
            .await?
            .ok_or_else(|| DbError::not_found(format!("pipeline_job {id}")))?;

        let mut merged = job.metadata();
        for (key, value) in patch {
            if value.is_null() {
                merged.remove(&key);
            } else {
                merged.insert(key, value);
            }
        }

        sqlx::query("UPDATE pipeline_job SET metadata = ?, updated_at = ? WHERE id = ?")
            .bind(serde_json::to_string(&merged)?)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Jobs for a document that are still in flight.
    pub async fn active_jobs_for_document(&self, document_id: &str) -> Result<Vec<PipelineJob>> {
        Ok(sqlx::query_as::<_, PipelineJob>(
            r#"
            SELECT * FROM pipeline_job
            WHERE document_id = ? AND status IN ('pending', 'processing')
            "#,
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Cancel a job and its non-terminal phases.
    pub async fn cancel_job(&self, job_id: &str, message: &str) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE pipeline_job SET status = ?, completed_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(JobStatus::Cancelled.as_str())
        .bind(now)
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            UPDATE pipeline_phase
            SET status = ?, completed_at = ?, error_message = ?
            WHERE pipeline_job_id = ? AND status IN ('queued', 'processing')
            "#,
        )
        .bind(PhaseStatus::Cancelled.as_str())
        .bind(now)
        .bind(message)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Failed jobs stuck on the graph phase whose document still has
    /// chunks — the candidates for a kg requeue.
    pub async fn jobs_failed_in_kg_ingest(&self) -> Result<Vec<PipelineJob>> {
        Ok(sqlx::query_as::<_, PipelineJob>(
            r#"
            SELECT j.* FROM pipeline_job j
            WHERE j.status = 'failed'
              AND j.current_phase = 'kg_ingest'
              AND EXISTS (SELECT 1 FROM document_chunk c WHERE c.document_id = j.document_id)
            "#,
        )
        .fetch_all(&self.pool)
        .await?)
    }

    /// Put a failed job back into processing for a fresh kg attempt.
    pub async fn reopen_job_for_kg(&self, job_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE pipeline_job
            SET status = ?, current_phase = ?, completed_at = NULL, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(JobStatus::Processing.as_str())
        .bind(Phase::KgIngest.as_str())
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ========================================================================
    // Pipeline phases
    // ========================================================================

    pub async fn insert_phase(&self, phase: NewPhase) -> Result<PipelinePhase> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO pipeline_phase
                (id, pipeline_job_id, phase, status, parent_phase_id, retry_count,
                 input_location, queued_at, started_at, expected_completion_at,
                 completed_at, metadata)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&phase.pipeline_job_id)
        .bind(phase.phase.as_str())
        .bind(phase.status.as_str())
        .bind(&phase.parent_phase_id)
        .bind(phase.retry_count as i64)
        .bind(&phase.input_location)
        .bind(phase.queued_at)
        .bind(phase.started_at)
        .bind(phase.expected_completion_at)
        // Synthetic skipped rows are terminal the moment they exist.
        .bind(if phase.status == PhaseStatus::Skipped {
            Some(Utc::now())
        } else {
            None
        })
        .bind(serde_json::to_string(&phase.metadata)?)
        .execute(&self.pool)
        .await?;

        self.fetch_phase(&id)
            .await?
            .ok_or_else(|| DbError::not_found(format!("pipeline_phase {id}")))
    }

    pub async fn fetch_phase(&self, id: &str) -> Result<Option<PipelinePhase>> {
        Ok(
            sqlx::query_as::<_, PipelinePhase>("SELECT * FROM pipeline_phase WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn phases_for_job(&self, job_id: &str) -> Result<Vec<PipelinePhase>> {
        Ok(sqlx::query_as::<_, PipelinePhase>(
            "SELECT * FROM pipeline_phase WHERE pipeline_job_id = ? ORDER BY started_at, queued_at",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn complete_phase(
        &self,
        id: &str,
        output_location: Option<&str>,
        metadata_map: Map<String, Value>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE pipeline_phase
            SET status = ?, completed_at = ?, output_location = ?, metadata = ?
            WHERE id = ?
            "#,
        )
        .bind(PhaseStatus::Completed.as_str())
        .bind(Utc::now())
        .bind(output_location)
        .bind(serde_json::to_string(&metadata_map)?)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fail_phase(
        &self,
        id: &str,
        error_type: &str,
        error_message: &str,
        metadata_map: Option<Map<String, Value>>,
    ) -> Result<()> {
        match metadata_map {
            Some(map) => {
                sqlx::query(
                    r#"
                    UPDATE pipeline_phase
                    SET status = ?, completed_at = ?, error_type = ?, error_message = ?, metadata = ?
                    WHERE id = ?
                    "#,
                )
                .bind(PhaseStatus::Failed.as_str())
                .bind(Utc::now())
                .bind(error_type)
                .bind(error_message)
                .bind(serde_json::to_string(&map)?)
                .bind(id)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE pipeline_phase
                    SET status = ?, completed_at = ?, error_type = ?, error_message = ?
                    WHERE id = ?
                    "#,
                )
                .bind(PhaseStatus::Failed.as_str())
                .bind(Utc::now())
                .bind(error_type)
                .bind(error_message)
                .bind(id)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    /// Claim the scheduled row for a retry attempt, moving it from
    /// queued to processing. The retry scheduler creates one queued
    /// row per attempt; the worker claims it at start so an attempt
    /// is exactly one row. Returns None when no queued row matches
    /// (the attempt was enqueued without a scheduled row).
    pub async fn claim_queued_phase(
        &self,
        job_id: &str,
        phase: Phase,
        retry_count: u32,
        started_at: DateTime<Utc>,
        expected_completion_at: DateTime<Utc>,
    ) -> Result<Option<PipelinePhase>> {
        let row = sqlx::query_as::<_, PipelinePhase>(
            r#"
            SELECT * FROM pipeline_phase
            WHERE pipeline_job_id = ? AND phase = ? AND retry_count = ? AND status = 'queued'
            ORDER BY queued_at
            LIMIT 1
            "#,
        )
        .bind(job_id)
        .bind(phase.as_str())
        .bind(retry_count as i64)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        sqlx::query(
            r#"
            UPDATE pipeline_phase
            SET status = ?, started_at = ?, expected_completion_at = ?
            WHERE id = ?
            "#,
        )
        .bind(PhaseStatus::Processing.as_str())
        .bind(started_at)
        .bind(expected_completion_at)
        .bind(&row.id)
        .execute(&self.pool)
        .await?;

        self.fetch_phase(&row.id).await
    }

    /// Phases stuck in processing past their deadline.
    pub async fn orphaned_phases(&self, now: DateTime<Utc>) -> Result<Vec<PipelinePhase>> {
        Ok(sqlx::query_as::<_, PipelinePhase>(
            r#"
            SELECT * FROM pipeline_phase
            WHERE status = 'processing' AND expected_completion_at < ?
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?)
    }

    // ========================================================================
    // Document chunks
    // ========================================================================

    /// Replace a document's chunks with a new batch, atomically.
    /// All-or-nothing: a failed insert rolls back the delete too, so a
    /// retried chunking phase can never leave duplicates or gaps.
    pub async fn replace_chunks(&self, document_id: &str, chunks: &[NewChunk]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        sqlx::query("DELETE FROM document_chunk WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO document_chunk
                    (id, document_id, chunk_index, content, context, token_count,
                     char_start, char_end, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(Uuid::new_v4().to_string())
            .bind(document_id)
            .bind(chunk.chunk_index as i64)
            .bind(&chunk.content)
            .bind(&chunk.context)
            .bind(chunk.token_count as i64)
            .bind(chunk.char_start as i64)
            .bind(chunk.char_end as i64)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(chunks.len())
    }

    pub async fn chunks_for_document(&self, document_id: &str) -> Result<Vec<DocumentChunk>> {
        Ok(sqlx::query_as::<_, DocumentChunk>(
            "SELECT * FROM document_chunk WHERE document_id = ? ORDER BY chunk_index",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?)
    }

    // ========================================================================
    // KG entity mappings
    // ========================================================================

    pub async fn insert_mapping(
        &self,
        tenant_id: &str,
        document_id: &str,
        entity_id: &str,
        provider: &str,
        source_chunk_ids: &[String],
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kg_entity_mapping
                (id, tenant_id, document_id, entity_id, provider, source_chunk_ids, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(tenant_id)
        .bind(document_id)
        .bind(entity_id)
        .bind(provider)
        .bind(serde_json::to_string(source_chunk_ids)?)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mappings_for_document(&self, document_id: &str) -> Result<Vec<KgEntityMapping>> {
        Ok(sqlx::query_as::<_, KgEntityMapping>(
            "SELECT * FROM kg_entity_mapping WHERE document_id = ?",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn delete_mappings_for_document(&self, document_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM kg_entity_mapping WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ========================================================================
    // OAuth tokens
    // ========================================================================

    pub async fn fetch_oauth_token(
        &self,
        user_id: &str,
        tenant_id: &str,
    ) -> Result<Option<OAuthToken>> {
        Ok(sqlx::query_as::<_, OAuthToken>(
            "SELECT * FROM oauth_token WHERE user_id = ? AND tenant_id = ?",
        )
        .bind(user_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn upsert_oauth_token(&self, token: &OAuthToken) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO oauth_token (user_id, tenant_id, access_token, refresh_token, expires_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (user_id, tenant_id) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(&token.user_id)
        .bind(&token.tenant_id)
        .bind(&token.access_token)
        .bind(&token.refresh_token)
        .bind(token.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
