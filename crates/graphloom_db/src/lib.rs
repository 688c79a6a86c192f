//! Relational store for the Graphloom pipeline.
//!
//! The single source of truth for documents, jobs, phase attempts,
//! chunks, graph entity mappings, and origin OAuth tokens. Multi-row
//! units that must be atomic (chunk batches, compensation) run inside
//! one transaction.

pub mod error;
pub mod metadata;
pub mod models;
pub mod schema;
pub mod store;

pub use error::{DbError, Result};
pub use models::{
    Document, DocumentChunk, KgEntityMapping, NewChunk, NewDocument, NewPhase, OAuthToken,
    PipelineJob, PipelinePhase,
};
pub use store::PipelineStore;
