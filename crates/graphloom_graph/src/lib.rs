//! Knowledge-graph engine client and the episode ingest adapter.
//!
//! The engine contract is small: add an episode, remove an episode
//! (idempotent), search within tenant groups. Tenant isolation rides
//! on `group_id` — every episode and every search carries it.

pub mod client;
pub mod ingest;

pub use client::{
    EpisodeReceipt, EpisodeRequest, GraphClient, GraphError, HttpGraphClient, MemoryGraphClient,
    SearchResult,
};
pub use ingest::{GraphIngestor, IngestFailure, IngestReport};
