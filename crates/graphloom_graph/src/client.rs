//! Graph engine client: HTTP implementation plus an in-memory engine
//! for tests and single-node development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use graphloom_protocol::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("graph engine connection failed: {0}")]
    Connection(String),

    #[error("graph engine timed out: {0}")]
    Timeout(String),

    #[error("graph engine error ({status}): {message}")]
    Http { status: u16, message: String },

    #[error("malformed graph engine response: {0}")]
    MalformedResponse(String),
}

impl From<GraphError> for PipelineError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::Connection(m) => PipelineError::Connection(m),
            GraphError::Timeout(m) => PipelineError::Timeout(m),
            GraphError::Http { status, message } => PipelineError::from_status(status, message),
            GraphError::MalformedResponse(m) => PipelineError::Internal(m),
        }
    }
}

/// One episode to insert.
#[derive(Debug, Clone, Serialize)]
pub struct EpisodeRequest {
    pub name: String,
    pub episode_body: String,
    pub source_description: String,
    pub reference_time: DateTime<Utc>,
    /// Tenant isolation key. Never optional.
    pub group_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EpisodeReceipt {
    pub uuid: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchResult {
    pub uuid: String,
    pub name: String,
    pub group_id: String,
    #[serde(default)]
    pub fact: Option<String>,
}

#[async_trait]
pub trait GraphClient: Send + Sync {
    async fn add_episode(&self, request: &EpisodeRequest) -> Result<EpisodeReceipt, GraphError>;

    /// Remove an episode. Removing a missing episode is success.
    async fn remove_episode(&self, uuid: &str) -> Result<(), GraphError>;

    async fn search(
        &self,
        query: &str,
        num_results: usize,
        group_ids: &[String],
    ) -> Result<Vec<SearchResult>, GraphError>;
}

// ============================================================================
// HTTP client
// ============================================================================

#[derive(Debug, Deserialize)]
struct AddEpisodeResponse {
    episode: EpisodeReceipt,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
}

pub struct HttpGraphClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpGraphClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, GraphError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| GraphError::Connection(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn classify(err: reqwest::Error) -> GraphError {
        if err.is_timeout() {
            GraphError::Timeout(err.to_string())
        } else {
            GraphError::Connection(err.to_string())
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, GraphError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(GraphError::Http {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl GraphClient for HttpGraphClient {
    async fn add_episode(&self, request: &EpisodeRequest) -> Result<EpisodeReceipt, GraphError> {
        let response = self
            .http
            .post(format!("{}/episodes", self.base_url))
            .json(request)
            .send()
            .await
            .map_err(Self::classify)?;

        let body: AddEpisodeResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| GraphError::MalformedResponse(e.to_string()))?;
        Ok(body.episode)
    }

    async fn remove_episode(&self, uuid: &str) -> Result<(), GraphError> {
        let response = self
            .http
            .delete(format!("{}/episodes/{uuid}", self.base_url))
            .send()
            .await
            .map_err(Self::classify)?;

        // Missing episode counts as removed.
        if response.status().as_u16() == 404 {
            return Ok(());
        }
        Self::check(response).await?;
        Ok(())
    }

    async fn search(
        &self,
        query: &str,
        num_results: usize,
        group_ids: &[String],
    ) -> Result<Vec<SearchResult>, GraphError> {
        let response = self
            .http
            .post(format!("{}/search", self.base_url))
            .json(&serde_json::json!({
                "query": query,
                "num_results": num_results,
                "group_ids": group_ids,
            }))
            .send()
            .await
            .map_err(Self::classify)?;

        let body: SearchResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| GraphError::MalformedResponse(e.to_string()))?;
        Ok(body.results)
    }
}

// ============================================================================
// In-memory engine
// ============================================================================

#[derive(Debug, Clone)]
struct StoredEpisode {
    name: String,
    body: String,
    group_id: String,
}

/// In-memory graph engine with the same contract. Used in tests and
/// as a local development backend.
#[derive(Default)]
pub struct MemoryGraphClient {
    episodes: Mutex<HashMap<String, StoredEpisode>>,
}

impl MemoryGraphClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn episode_count(&self) -> usize {
        self.episodes.lock().expect("graph lock poisoned").len()
    }

    pub fn contains(&self, uuid: &str) -> bool {
        self.episodes
            .lock()
            .expect("graph lock poisoned")
            .contains_key(uuid)
    }

    pub fn group_ids(&self) -> Vec<String> {
        self.episodes
            .lock()
            .expect("graph lock poisoned")
            .values()
            .map(|e| e.group_id.clone())
            .collect()
    }
}

#[async_trait]
impl GraphClient for MemoryGraphClient {
    async fn add_episode(&self, request: &EpisodeRequest) -> Result<EpisodeReceipt, GraphError> {
        let uuid = Uuid::new_v4().to_string();
        self.episodes.lock().expect("graph lock poisoned").insert(
            uuid.clone(),
            StoredEpisode {
                name: request.name.clone(),
                body: request.episode_body.clone(),
                group_id: request.group_id.clone(),
            },
        );
        debug!(name = %request.name, group_id = %request.group_id, "stored episode");
        Ok(EpisodeReceipt { uuid })
    }

    async fn remove_episode(&self, uuid: &str) -> Result<(), GraphError> {
        self.episodes
            .lock()
            .expect("graph lock poisoned")
            .remove(uuid);
        Ok(())
    }

    async fn search(
        &self,
        query: &str,
        num_results: usize,
        group_ids: &[String],
    ) -> Result<Vec<SearchResult>, GraphError> {
        let query = query.to_lowercase();
        let episodes = self.episodes.lock().expect("graph lock poisoned");
        let mut results: Vec<SearchResult> = episodes
            .iter()
            .filter(|(_, e)| group_ids.contains(&e.group_id))
            .filter(|(_, e)| query.is_empty() || e.body.to_lowercase().contains(&query))
            .map(|(uuid, e)| SearchResult {
                uuid: uuid.clone(),
                name: e.name.clone(),
                group_id: e.group_id.clone(),
                fact: None,
            })
            .collect();
        results.truncate(num_results);
        Ok(results)
    }
}
