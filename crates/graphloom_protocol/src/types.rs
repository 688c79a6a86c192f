//! Core pipeline types: phases, statuses, queues, and queue payloads.
//!
//! Queue payloads are closed, versionable structs. Anything a caller
//! wants to smuggle through the pipeline untouched rides in the
//! explicit `metadata` object; there is no open kwargs forwarding.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Phases
// ============================================================================

/// Pipeline phases in topology order. The topology is fixed at compile
/// time; `next()` is the only way a job advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Ingestion,
    Extraction,
    Chunking,
    KgIngest,
    Completed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Ingestion => "ingestion",
            Phase::Extraction => "extraction",
            Phase::Chunking => "chunking",
            Phase::KgIngest => "kg_ingest",
            Phase::Completed => "completed",
        }
    }

    /// The phase that follows this one. `Completed` is absorbing.
    pub fn next(&self) -> Phase {
        match self {
            Phase::Ingestion => Phase::Extraction,
            Phase::Extraction => Phase::Chunking,
            Phase::Chunking => Phase::KgIngest,
            Phase::KgIngest => Phase::Completed,
            Phase::Completed => Phase::Completed,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ingestion" => Ok(Phase::Ingestion),
            "extraction" => Ok(Phase::Extraction),
            "chunking" => Ok(Phase::Chunking),
            "kg_ingest" => Ok(Phase::KgIngest),
            "completed" => Ok(Phase::Completed),
            other => Err(format!("unknown phase: {other}")),
        }
    }
}

// ============================================================================
// Statuses
// ============================================================================

/// Lifecycle of a pipeline job. Terminal statuses are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Lifecycle of one phase attempt. A row only moves
/// queued → processing → {completed, failed, cancelled}; `skipped` is
/// written once at creation for synthetic rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseStatus::Queued => "queued",
            PhaseStatus::Processing => "processing",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Failed => "failed",
            PhaseStatus::Skipped => "skipped",
            PhaseStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PhaseStatus::Completed
                | PhaseStatus::Failed
                | PhaseStatus::Skipped
                | PhaseStatus::Cancelled
        )
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(PhaseStatus::Queued),
            "processing" => Ok(PhaseStatus::Processing),
            "completed" => Ok(PhaseStatus::Completed),
            "failed" => Ok(PhaseStatus::Failed),
            "skipped" => Ok(PhaseStatus::Skipped),
            "cancelled" => Ok(PhaseStatus::Cancelled),
            other => Err(format!("unknown phase status: {other}")),
        }
    }
}

/// User-visible document processing state. The worker only ever moves
/// this forward to `Available`; failures are read off the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Processing,
    Available,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Processing => "processing",
            DocumentStatus::Available => "available",
            DocumentStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(DocumentStatus::Processing),
            "available" => Ok(DocumentStatus::Available),
            "failed" => Ok(DocumentStatus::Failed),
            other => Err(format!("unknown document status: {other}")),
        }
    }
}

// ============================================================================
// Queues
// ============================================================================

/// Named work queues. `Extraction` serves local uploads (artifact
/// already in the object store); `IngestExtract` serves external
/// sources and runs two phases in one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    Extraction,
    IngestExtract,
    Chunking,
    KgIngest,
}

impl QueueName {
    pub const ALL: [QueueName; 4] = [
        QueueName::Extraction,
        QueueName::IngestExtract,
        QueueName::Chunking,
        QueueName::KgIngest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Extraction => "extraction",
            QueueName::IngestExtract => "ingest_extract",
            QueueName::Chunking => "chunking",
            QueueName::KgIngest => "kg_ingest",
        }
    }

    /// Canonical broker job id for an attempt. Retries carry their
    /// attempt number so records never clobber each other.
    pub fn job_id(&self, pipeline_job_id: &str, retry_count: u32) -> String {
        let prefix = match self {
            QueueName::Extraction => "extract",
            QueueName::IngestExtract => "ingest_extract",
            QueueName::Chunking => "chunk",
            QueueName::KgIngest => "kg",
        };
        if retry_count == 0 {
            format!("{prefix}_{pipeline_job_id}")
        } else {
            format!("{prefix}_{pipeline_job_id}_r{retry_count}")
        }
    }

    /// Broker-level guard timeout. Far above any sane execution time;
    /// the orphan reaper is the real backstop.
    pub fn default_timeout_secs(&self) -> u64 {
        match self {
            QueueName::Extraction => 45 * 60,
            QueueName::IngestExtract => 60 * 60,
            QueueName::Chunking => 30 * 60,
            QueueName::KgIngest => 20 * 60,
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "extraction" => Ok(QueueName::Extraction),
            "ingest_extract" => Ok(QueueName::IngestExtract),
            "chunking" => Ok(QueueName::Chunking),
            "kg_ingest" => Ok(QueueName::KgIngest),
            other => Err(format!("unknown queue: {other}")),
        }
    }
}

// ============================================================================
// Queue payloads
// ============================================================================

/// Payload for the `extraction` queue (local uploads).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionPayload {
    pub pipeline_job_id: String,
    pub document_id: String,
    /// Object-store path, e.g. `raw_documents/{id}.mp4`.
    pub raw_location: String,
    pub file_type: String,
    pub source_name: String,
    pub source_platform: String,
    pub tenant_id: String,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub parent_phase_id: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Payload for the `ingest_extract` queue (external sources). Carries
/// two parent ids because the handler owns two phase rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestExtractPayload {
    pub pipeline_job_id: String,
    pub document_id: String,
    /// Origin URI, e.g. `gdrive://<file_id>`.
    pub source_location: String,
    pub file_type: String,
    pub source_name: String,
    pub source_platform: String,
    pub tenant_id: String,
    #[serde(default)]
    pub store_raw: bool,
    /// Needed for the origin OAuth token lookup.
    pub user_id: String,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub parent_ingest_phase_id: Option<String>,
    #[serde(default)]
    pub parent_extract_phase_id: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Payload for the `chunking` queue (all sources converge here).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkingPayload {
    pub pipeline_job_id: String,
    pub document_id: String,
    /// Object-store path to the extracted text.
    pub text_location: String,
    pub source_name: String,
    pub source_platform: String,
    pub tenant_id: String,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub parent_phase_id: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Payload for the `kg_ingest` queue (chunks come from the database).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KgIngestPayload {
    pub pipeline_job_id: String,
    pub document_id: String,
    pub source_name: String,
    pub source_platform: String,
    pub tenant_id: String,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub parent_phase_id: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Tagged union of all queue payloads; the tag is the queue name so a
/// mis-routed item fails deserialization instead of a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "queue", rename_all = "snake_case")]
pub enum QueuePayload {
    Extraction(ExtractionPayload),
    IngestExtract(IngestExtractPayload),
    Chunking(ChunkingPayload),
    KgIngest(KgIngestPayload),
}

impl QueuePayload {
    pub fn queue(&self) -> QueueName {
        match self {
            QueuePayload::Extraction(_) => QueueName::Extraction,
            QueuePayload::IngestExtract(_) => QueueName::IngestExtract,
            QueuePayload::Chunking(_) => QueueName::Chunking,
            QueuePayload::KgIngest(_) => QueueName::KgIngest,
        }
    }

    pub fn pipeline_job_id(&self) -> &str {
        match self {
            QueuePayload::Extraction(p) => &p.pipeline_job_id,
            QueuePayload::IngestExtract(p) => &p.pipeline_job_id,
            QueuePayload::Chunking(p) => &p.pipeline_job_id,
            QueuePayload::KgIngest(p) => &p.pipeline_job_id,
        }
    }

    pub fn document_id(&self) -> &str {
        match self {
            QueuePayload::Extraction(p) => &p.document_id,
            QueuePayload::IngestExtract(p) => &p.document_id,
            QueuePayload::Chunking(p) => &p.document_id,
            QueuePayload::KgIngest(p) => &p.document_id,
        }
    }

    pub fn retry_count(&self) -> u32 {
        match self {
            QueuePayload::Extraction(p) => p.retry_count,
            QueuePayload::IngestExtract(p) => p.retry_count,
            QueuePayload::Chunking(p) => p.retry_count,
            QueuePayload::KgIngest(p) => p.retry_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_topology_is_left_to_right() {
        assert_eq!(Phase::Ingestion.next(), Phase::Extraction);
        assert_eq!(Phase::Extraction.next(), Phase::Chunking);
        assert_eq!(Phase::Chunking.next(), Phase::KgIngest);
        assert_eq!(Phase::KgIngest.next(), Phase::Completed);
        assert_eq!(Phase::Completed.next(), Phase::Completed);
    }

    #[test]
    fn status_round_trips() {
        for s in ["pending", "processing", "completed", "failed", "cancelled"] {
            assert_eq!(s.parse::<JobStatus>().unwrap().as_str(), s);
        }
        for s in [
            "queued",
            "processing",
            "completed",
            "failed",
            "skipped",
            "cancelled",
        ] {
            assert_eq!(s.parse::<PhaseStatus>().unwrap().as_str(), s);
        }
    }

    #[test]
    fn payload_tag_matches_queue_name() {
        let payload = QueuePayload::Chunking(ChunkingPayload {
            pipeline_job_id: "job-1".into(),
            document_id: "doc-1".into(),
            text_location: "extracted_text/doc-1.txt".into(),
            source_name: "notes.pdf".into(),
            source_platform: "manual_upload".into(),
            tenant_id: "org_1".into(),
            retry_count: 0,
            parent_phase_id: None,
            metadata: Map::new(),
        });

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["queue"], "chunking");

        let back: QueuePayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
        assert_eq!(back.queue(), QueueName::Chunking);
    }

    #[test]
    fn payload_defaults_apply_on_missing_fields() {
        let json = serde_json::json!({
            "queue": "kg_ingest",
            "pipeline_job_id": "job-2",
            "document_id": "doc-2",
            "source_name": "talk.mp4",
            "source_platform": "google_drive",
            "tenant_id": "org_2",
        });
        let payload: QueuePayload = serde_json::from_value(json).unwrap();
        assert_eq!(payload.retry_count(), 0);
    }

    #[test]
    fn unknown_metadata_is_preserved() {
        let json = serde_json::json!({
            "queue": "extraction",
            "pipeline_job_id": "job-3",
            "document_id": "doc-3",
            "raw_location": "raw_documents/doc-3.pdf",
            "file_type": "pdf",
            "source_name": "a.pdf",
            "source_platform": "manual_upload",
            "tenant_id": "org_3",
            "metadata": {"import_batch": "2024-11"},
        });
        let payload: QueuePayload = serde_json::from_value(json).unwrap();
        let QueuePayload::Extraction(p) = &payload else {
            panic!("wrong variant");
        };
        assert_eq!(p.metadata["import_batch"], "2024-11");
    }
}
