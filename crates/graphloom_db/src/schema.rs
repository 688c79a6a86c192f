//! Schema bootstrap.
//!
//! Applied idempotently at startup. `pipeline_job` has no foreign key
//! to `document` on purpose: jobs are an audit log and must survive
//! document deletion. Chunks and entity mappings cascade.

use crate::error::Result;
use sqlx::{Pool, Sqlite};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS document (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        title TEXT NOT NULL,
        file_type TEXT NOT NULL,
        source_platform TEXT NOT NULL,
        folder_id TEXT,
        storage_path TEXT,
        processing_status TEXT NOT NULL DEFAULT 'processing',
        source_metadata TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pipeline_job (
        id TEXT PRIMARY KEY,
        document_id TEXT NOT NULL,
        tenant_id TEXT NOT NULL,
        current_phase TEXT NOT NULL,
        status TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT,
        updated_at TEXT NOT NULL,
        metadata TEXT NOT NULL DEFAULT '{}'
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_pipeline_job_document
        ON pipeline_job (document_id, status)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pipeline_phase (
        id TEXT PRIMARY KEY,
        pipeline_job_id TEXT NOT NULL,
        phase TEXT NOT NULL,
        status TEXT NOT NULL,
        parent_phase_id TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        input_location TEXT,
        output_location TEXT,
        queued_at TEXT,
        started_at TEXT,
        completed_at TEXT,
        expected_completion_at TEXT,
        error_type TEXT,
        error_message TEXT,
        metadata TEXT NOT NULL DEFAULT '{}'
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_pipeline_phase_job
        ON pipeline_phase (pipeline_job_id, phase)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_pipeline_phase_orphan
        ON pipeline_phase (status, expected_completion_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS document_chunk (
        id TEXT PRIMARY KEY,
        document_id TEXT NOT NULL REFERENCES document(id) ON DELETE CASCADE,
        chunk_index INTEGER NOT NULL,
        content TEXT NOT NULL,
        context TEXT NOT NULL,
        token_count INTEGER NOT NULL,
        char_start INTEGER NOT NULL,
        char_end INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE (document_id, chunk_index)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS kg_entity_mapping (
        id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        document_id TEXT NOT NULL REFERENCES document(id) ON DELETE CASCADE,
        entity_id TEXT NOT NULL,
        provider TEXT NOT NULL,
        source_chunk_ids TEXT NOT NULL DEFAULT '[]',
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_kg_entity_mapping_document
        ON kg_entity_mapping (document_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS oauth_token (
        user_id TEXT NOT NULL,
        tenant_id TEXT NOT NULL,
        access_token TEXT NOT NULL,
        refresh_token TEXT,
        expires_at TEXT,
        PRIMARY KEY (user_id, tenant_id)
    )
    "#,
];

pub async fn init_schema(pool: &Pool<Sqlite>) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
