//! Transcription provider client.
//!
//! Pre-recorded transcription over HTTP: audio bytes in, transcript
//! plus confidence and duration out. The provider bills per minute;
//! the cost estimate is recorded for observability only.

use crate::error::ExtractError;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::time::Duration;
use tracing::{info, warn};

const API_BASE_URL: &str = "https://api.deepgram.com/v1";
const DEFAULT_MODEL: &str = "nova-3";
const DEFAULT_LANGUAGE: &str = "en";
/// Large audio files can take a while; provider-level ceiling.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);
/// Network-flakiness retries only; real errors surface immediately.
const NETWORK_RETRIES: u32 = 2;
const COST_PER_MINUTE_USD: f64 = 0.0043;

/// Result of one transcription call.
#[derive(Debug, Clone)]
pub struct Transcript {
    pub text: String,
    pub confidence: Option<f64>,
    pub duration_seconds: Option<f64>,
}

impl Transcript {
    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }

    /// Billed-minutes estimate, for phase metadata.
    pub fn estimated_cost_usd(&self) -> Option<f64> {
        self.duration_seconds
            .map(|secs| (secs / 60.0 * COST_PER_MINUTE_USD * 10_000.0).round() / 10_000.0)
    }
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: Bytes, mime_type: &str) -> Result<Transcript, ExtractError>;
}

// ============================================================================
// Provider response types
// ============================================================================

#[derive(Debug, Deserialize)]
struct ListenResponse {
    #[serde(default)]
    metadata: Option<ListenMetadata>,
    results: ListenResults,
}

#[derive(Debug, Deserialize)]
struct ListenMetadata {
    duration: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ListenResults {
    channels: Vec<ListenChannel>,
}

#[derive(Debug, Deserialize)]
struct ListenChannel {
    alternatives: Vec<ListenAlternative>,
}

#[derive(Debug, Deserialize)]
struct ListenAlternative {
    transcript: String,
    confidence: Option<f64>,
}

// ============================================================================
// HTTP client
// ============================================================================

pub struct DeepgramClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    language: String,
}

impl DeepgramClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self, ExtractError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ExtractError::Connection(e.to_string()))?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            language: DEFAULT_LANGUAGE.to_string(),
        })
    }

    async fn call(&self, audio: &Bytes, mime_type: &str) -> Result<Transcript, ExtractError> {
        let url = format!(
            "{API_BASE_URL}/listen?model={}&language={}&smart_format=true&paragraphs=true&punctuate=true",
            self.model, self.language
        );

        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Token {}", self.api_key))
            .header("Content-Type", mime_type)
            .body(audio.clone())
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ExtractError::Provider {
                status: status.as_u16(),
                message,
            });
        }

        let body: ListenResponse = response
            .json()
            .await
            .map_err(|e| ExtractError::MalformedResponse(e.to_string()))?;

        let alternative = body
            .results
            .channels
            .first()
            .and_then(|c| c.alternatives.first())
            .ok_or_else(|| {
                ExtractError::MalformedResponse("response carried no alternatives".to_string())
            })?;

        Ok(Transcript {
            text: alternative.transcript.trim().to_string(),
            confidence: alternative.confidence,
            duration_seconds: body.metadata.and_then(|m| m.duration),
        })
    }
}

#[async_trait]
impl Transcriber for DeepgramClient {
    async fn transcribe(&self, audio: Bytes, mime_type: &str) -> Result<Transcript, ExtractError> {
        let mut attempt = 0;
        loop {
            match self.call(&audio, mime_type).await {
                Ok(transcript) => {
                    info!(
                        chars = transcript.text.len(),
                        confidence = ?transcript.confidence,
                        duration = ?transcript.duration_seconds,
                        cost_usd = ?transcript.estimated_cost_usd(),
                        "transcription complete"
                    );
                    return Ok(transcript);
                }
                // Only network flakiness earns a provider-level retry;
                // everything else belongs to the job retry policy.
                Err(err @ (ExtractError::Timeout(_) | ExtractError::Connection(_)))
                    if attempt < NETWORK_RETRIES =>
                {
                    attempt += 1;
                    warn!(%err, attempt, "transient transcription failure, retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> ExtractError {
    if err.is_timeout() {
        ExtractError::Timeout(err.to_string())
    } else {
        ExtractError::Connection(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_estimate_is_per_minute() {
        let transcript = Transcript {
            text: "hello world".to_string(),
            confidence: Some(0.97),
            duration_seconds: Some(600.0),
        };
        assert_eq!(transcript.word_count(), 2);
        assert_eq!(transcript.estimated_cost_usd(), Some(0.043));

        let unknown = Transcript {
            text: String::new(),
            confidence: None,
            duration_seconds: None,
        };
        assert_eq!(unknown.estimated_cost_usd(), None);
    }

    #[test]
    fn provider_response_parses() {
        let body = r#"{
            "metadata": {"duration": 12.5},
            "results": {"channels": [{"alternatives": [
                {"transcript": "  hello there ", "confidence": 0.98}
            ]}]}
        }"#;
        let parsed: ListenResponse = serde_json::from_str(body).unwrap();
        assert_eq!(
            parsed.results.channels[0].alternatives[0].transcript,
            "  hello there "
        );
        assert_eq!(parsed.metadata.unwrap().duration, Some(12.5));
    }
}
