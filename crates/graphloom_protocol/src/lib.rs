//! Shared vocabulary for the Graphloom ingestion pipeline.
//!
//! Everything that crosses a process boundary lives here: phase and
//! status enums, queue names and their typed payloads, the retry and
//! timeout policy, the error taxonomy, MIME tables, token estimation,
//! and environment configuration.

pub mod config;
pub mod defaults;
pub mod error;
pub mod mime;
pub mod retry;
pub mod tokens;
pub mod types;

pub use config::{AppConfig, ConfigError};
pub use error::PipelineError;
pub use types::{
    ChunkingPayload, DocumentStatus, ExtractionPayload, IngestExtractPayload, JobStatus,
    KgIngestPayload, Phase, PhaseStatus, QueueName, QueuePayload,
};
