//! Database models.
//!
//! Enum-valued and JSON-valued columns are stored as TEXT and exposed
//! through typed accessors, keeping the `FromRow` derives trivial.

use chrono::{DateTime, Utc};
use graphloom_protocol::{DocumentStatus, JobStatus, Phase, PhaseStatus};
use serde_json::{Map, Value};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct Document {
    pub id: String,
    pub tenant_id: String,
    pub title: String,
    pub file_type: String,
    pub source_platform: String,
    pub folder_id: Option<String>,
    pub storage_path: Option<String>,
    pub processing_status: String,
    pub source_metadata: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn status(&self) -> Option<DocumentStatus> {
        self.processing_status.parse().ok()
    }

    /// Parsed source metadata; malformed rows read as empty.
    pub fn source_metadata(&self) -> Map<String, Value> {
        serde_json::from_str(&self.source_metadata).unwrap_or_default()
    }
}

/// Insert shape for a document row.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub id: String,
    pub tenant_id: String,
    pub title: String,
    pub file_type: String,
    pub source_platform: String,
    pub folder_id: Option<String>,
    pub storage_path: Option<String>,
    pub source_metadata: Map<String, Value>,
}

#[derive(Debug, Clone, FromRow)]
pub struct PipelineJob {
    pub id: String,
    pub document_id: String,
    pub tenant_id: String,
    pub current_phase: String,
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub metadata: String,
}

impl PipelineJob {
    pub fn status(&self) -> Option<JobStatus> {
        self.status.parse().ok()
    }

    pub fn phase(&self) -> Option<Phase> {
        self.current_phase.parse().ok()
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_some_and(|s| s.is_terminal())
    }

    pub fn metadata(&self) -> Map<String, Value> {
        serde_json::from_str(&self.metadata).unwrap_or_default()
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct PipelinePhase {
    pub id: String,
    pub pipeline_job_id: String,
    pub phase: String,
    pub status: String,
    pub parent_phase_id: Option<String>,
    pub retry_count: i64,
    pub input_location: Option<String>,
    pub output_location: Option<String>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expected_completion_at: Option<DateTime<Utc>>,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub metadata: String,
}

impl PipelinePhase {
    pub fn status(&self) -> Option<PhaseStatus> {
        self.status.parse().ok()
    }

    pub fn phase(&self) -> Option<Phase> {
        self.phase.parse().ok()
    }

    pub fn metadata(&self) -> Map<String, Value> {
        serde_json::from_str(&self.metadata).unwrap_or_default()
    }
}

/// Insert shape for a phase attempt row.
#[derive(Debug, Clone)]
pub struct NewPhase {
    pub pipeline_job_id: String,
    pub phase: Phase,
    pub status: PhaseStatus,
    pub parent_phase_id: Option<String>,
    pub retry_count: u32,
    pub input_location: Option<String>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub expected_completion_at: Option<DateTime<Utc>>,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, FromRow)]
pub struct DocumentChunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub content: String,
    pub context: String,
    pub token_count: i64,
    pub char_start: i64,
    pub char_end: i64,
    pub created_at: DateTime<Utc>,
}

/// Insert shape for one chunk of a batch.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub chunk_index: u32,
    pub content: String,
    pub context: String,
    pub token_count: u32,
    pub char_start: u32,
    pub char_end: u32,
}

#[derive(Debug, Clone, FromRow)]
pub struct KgEntityMapping {
    pub id: String,
    pub tenant_id: String,
    pub document_id: String,
    pub entity_id: String,
    pub provider: String,
    pub source_chunk_ids: String,
    pub created_at: DateTime<Utc>,
}

impl KgEntityMapping {
    pub fn source_chunk_ids(&self) -> Vec<String> {
        serde_json::from_str(&self.source_chunk_ids).unwrap_or_default()
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct OAuthToken {
    pub user_id: String,
    pub tenant_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}
