//! LLM provider for contextual chunking.
//!
//! Non-streaming Messages API client. The document rides in a
//! cacheable system block (`cache_control: ephemeral`) so that only
//! the chunk varies per request; usage counters for cache writes and
//! reads come back for observability.

use async_trait::async_trait;
use graphloom_protocol::PipelineError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Anthropic API base URL
const API_BASE_URL: &str = "https://api.anthropic.com/v1";

/// Model used for situating contexts (cost-effective choice)
const DEFAULT_MODEL: &str = "claude-3-haiku-20240307";

/// API version header
const API_VERSION: &str = "2023-06-01";

/// Contexts are 1-2 sentences; cap the output hard.
const MAX_CONTEXT_TOKENS: u32 = 100;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum LlmError {
    /// Provider-signalled rate limit, with the Retry-After hint when
    /// the response carried one.
    #[error("rate limited (retry_after: {retry_after:?})")]
    RateLimited { retry_after: Option<u64> },

    #[error("llm provider error ({status}): {message}")]
    Http { status: u16, message: String },

    #[error("llm request timed out: {0}")]
    Timeout(String),

    #[error("llm connection failed: {0}")]
    Connection(String),

    #[error("malformed llm response: {0}")]
    MalformedResponse(String),
}

impl From<LlmError> for PipelineError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::RateLimited { retry_after } => {
                PipelineError::rate_limited("llm rate limited", retry_after)
            }
            LlmError::Http { status, message } => PipelineError::from_status(status, message),
            LlmError::Timeout(m) => PipelineError::Timeout(m),
            LlmError::Connection(m) => PipelineError::Connection(m),
            LlmError::MalformedResponse(m) => PipelineError::Internal(m),
        }
    }
}

/// One situating-context completion.
#[derive(Debug, Clone)]
pub struct SituateReply {
    pub text: String,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
}

/// The chunker's view of the model: a cacheable system prefix and a
/// variable user message in, a short context out.
#[async_trait]
pub trait ContextModel: Send + Sync {
    async fn situate(&self, system_prompt: &str, user_content: &str)
        -> Result<SituateReply, LlmError>;
}

// ============================================================================
// API Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    system: Vec<SystemBlock>,
    messages: Vec<ApiMessage>,
}

#[derive(Debug, Serialize)]
struct SystemBlock {
    #[serde(rename = "type")]
    block_type: &'static str,
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_control: Option<CacheControl>,
}

#[derive(Debug, Serialize)]
struct CacheControl {
    #[serde(rename = "type")]
    control_type: &'static str,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    cache_creation_input_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
}

// ============================================================================
// Claude provider
// ============================================================================

pub struct ClaudeProvider {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl ClaudeProvider {
    /// Provider-level retries stay off; rate-limit handling belongs
    /// to the chunker's wave protocol and the job retry policy.
    pub fn new(api_key: impl Into<String>) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| LlmError::Connection(e.to_string()))?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

#[async_trait]
impl ContextModel for ClaudeProvider {
    async fn situate(
        &self,
        system_prompt: &str,
        user_content: &str,
    ) -> Result<SituateReply, LlmError> {
        let request = MessagesRequest {
            model: self.model.clone(),
            max_tokens: MAX_CONTEXT_TOKENS,
            system: vec![SystemBlock {
                block_type: "text",
                text: system_prompt.to_string(),
                cache_control: Some(CacheControl {
                    control_type: "ephemeral",
                }),
            }],
            messages: vec![ApiMessage {
                role: "user",
                content: user_content.to_string(),
            }],
        };

        let response = self
            .http
            .post(format!("{API_BASE_URL}/messages"))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(e.to_string())
                } else {
                    LlmError::Connection(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(LlmError::RateLimited { retry_after });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let body: MessagesResponse = response
            .json()
            .await
            .map_err(|e| LlmError::MalformedResponse(e.to_string()))?;

        let text = body
            .content
            .iter()
            .map(|ContentBlock::Text { text }| text.as_str())
            .collect::<String>()
            .trim()
            .to_string();
        if text.is_empty() {
            return Err(LlmError::MalformedResponse(
                "response carried no text content".to_string(),
            ));
        }

        if body.usage.cache_read_input_tokens > 0 {
            debug!(
                tokens = body.usage.cache_read_input_tokens,
                "prompt cache hit"
            );
        } else if body.usage.cache_creation_input_tokens > 0 {
            debug!(
                tokens = body.usage.cache_creation_input_tokens,
                "prompt cache write"
            );
        }

        Ok(SituateReply {
            text,
            cache_creation_input_tokens: body.usage.cache_creation_input_tokens,
            cache_read_input_tokens: body.usage.cache_read_input_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_with_cache_control() {
        let request = MessagesRequest {
            model: DEFAULT_MODEL.to_string(),
            max_tokens: MAX_CONTEXT_TOKENS,
            system: vec![SystemBlock {
                block_type: "text",
                text: "<document>body</document>".to_string(),
                cache_control: Some(CacheControl {
                    control_type: "ephemeral",
                }),
            }],
            messages: vec![ApiMessage {
                role: "user",
                content: "<chunk>piece</chunk>".to_string(),
            }],
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["system"][0]["cache_control"]["type"], "ephemeral");
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["max_tokens"], 100);
    }

    #[test]
    fn response_parses_usage_counters() {
        let body = r#"{
            "content": [{"type": "text", "text": " situates the chunk. "}],
            "usage": {"input_tokens": 900, "output_tokens": 30,
                      "cache_creation_input_tokens": 850, "cache_read_input_tokens": 0}
        }"#;
        let parsed: MessagesResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.usage.cache_creation_input_tokens, 850);
        let ContentBlock::Text { text } = &parsed.content[0];
        assert_eq!(text.trim(), "situates the chunk.");
    }
}
