//! Contextual chunking.
//!
//! Sentence-aligned packing into ~800-token chunks with ~100 tokens
//! of overlap, then an LLM-generated situating context per chunk
//! using a prompt-cached document prefix. Token counts here are a
//! packing heuristic (4 chars ≈ 1 token), not billing numbers.

use crate::llm::{ContextModel, LlmError};
use graphloom_kv::{KvError, RateGovernor};
use graphloom_protocol::defaults::DEFAULT_RETRY_AFTER_SECS;
use graphloom_protocol::tokens::estimate_tokens;
use graphloom_protocol::PipelineError;
use regex::Regex;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{info, warn};

/// Target chunk size in tokens.
const CHUNK_SIZE_TOKENS: u64 = 800;
/// Overlap carried from the tail of the previous chunk.
const CHUNK_OVERLAP_TOKENS: u64 = 100;
/// Output budget reserved per context request.
const CONTEXT_OUTPUT_TOKENS: u64 = 100;
/// Stagger between request starts inside a wave.
const WAVE_STAGGER: Duration = Duration::from_millis(250);
/// Pause between waves; keeps the ramp under the provider's
/// acceleration limit.
const WAVE_PAUSE: Duration = Duration::from_secs(2);
/// Whole-wave retries before the rate limit surfaces to the runtime.
const MAX_WAVE_RETRIES: u32 = 10;

/// A chunk with its situating context and source span.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub text: String,
    pub context: String,
    pub chunk_index: u32,
    pub char_start: u32,
    pub char_end: u32,
    pub token_count: u32,
}

#[derive(Debug, Clone)]
struct BaseChunk {
    text: String,
    char_start: u32,
    char_end: u32,
    token_count: u32,
}

fn sentence_boundary() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[.!?]+\s+").unwrap())
}

/// Split on sentence-final punctuation followed by whitespace. Good
/// enough for packing; no NLP machinery.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut last = 0;

    for m in sentence_boundary().find_iter(text) {
        let end = m.start() + m.as_str().trim_end().len();
        let sentence = text[last..end].trim();
        if !sentence.is_empty() {
            sentences.push(sentence);
        }
        last = m.end();
    }

    let tail = text[last..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

/// Pack sentences into chunks under the token target, carrying the
/// last few sentences of each chunk forward as overlap.
fn pack_chunks(text: &str) -> Vec<BaseChunk> {
    let sentences = split_sentences(text);
    let mut chunks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_tokens = 0u64;
    let mut char_position = 0u64;

    for sentence in sentences {
        let sentence_tokens = estimate_tokens(sentence);

        if current_tokens + sentence_tokens > CHUNK_SIZE_TOKENS && !current.is_empty() {
            let chunk_text = current.join(" ");
            chunks.push(BaseChunk {
                char_start: char_position.saturating_sub(chunk_text.len() as u64) as u32,
                char_end: char_position as u32,
                token_count: current_tokens as u32,
                text: chunk_text,
            });

            // Overlap: walk backwards until the budget is spent.
            let mut overlap: Vec<&str> = Vec::new();
            let mut overlap_tokens = 0u64;
            for s in current.iter().rev() {
                let s_tokens = estimate_tokens(s);
                if overlap_tokens + s_tokens > CHUNK_OVERLAP_TOKENS {
                    break;
                }
                overlap.insert(0, s);
                overlap_tokens += s_tokens;
            }
            current = overlap;
            current_tokens = overlap_tokens;
        }

        current_tokens += sentence_tokens;
        char_position += sentence.len() as u64 + 1;
        current.push(sentence);
    }

    if !current.is_empty() {
        let chunk_text = current.join(" ");
        chunks.push(BaseChunk {
            char_start: char_position.saturating_sub(chunk_text.len() as u64) as u32,
            char_end: char_position as u32,
            token_count: current_tokens as u32,
            text: chunk_text,
        });
    }

    chunks
}

fn build_system_prompt(full_document: &str, document_title: Option<&str>) -> String {
    let title_note = document_title
        .map(|t| format!(" The document is titled: {t}"))
        .unwrap_or_default();
    format!(
        "<document>\n{full_document}\n</document>\n\n\
         You will receive chunks from this document. For each chunk, provide a brief \
         (1-2 sentence) description that situates it within the context of the overall \
         document. Focus on what the chunk is about and how it relates to the document's \
         main topics.{title_note}\n\nProvide only the contextual description, no preamble."
    )
}

pub struct ContextualChunker {
    model: Arc<dyn ContextModel>,
    governor: Arc<RateGovernor>,
    max_concurrent: usize,
}

impl ContextualChunker {
    pub fn new(
        model: Arc<dyn ContextModel>,
        governor: Arc<RateGovernor>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            model,
            governor,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Chunk a document and attach situating contexts.
    ///
    /// Documents shorter than one chunk budget skip the LLM entirely:
    /// one chunk whose context is the title.
    pub async fn chunk_document(
        &self,
        text: &str,
        document_title: Option<&str>,
    ) -> Result<Vec<Chunk>, PipelineError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(PipelineError::InvalidInput(
                "Document text is empty".to_string(),
            ));
        }

        let text_tokens = estimate_tokens(text);
        if text_tokens < CHUNK_SIZE_TOKENS {
            info!(
                tokens = text_tokens,
                "document shorter than one chunk budget, skipping contextual retrieval"
            );
            return Ok(vec![Chunk {
                text: text.to_string(),
                context: document_title.unwrap_or("Short document").to_string(),
                chunk_index: 0,
                char_start: 0,
                char_end: text.len() as u32,
                token_count: text_tokens as u32,
            }]);
        }

        let base_chunks = pack_chunks(text);
        info!(
            chars = text.len(),
            tokens = text_tokens,
            chunks = base_chunks.len(),
            "packed base chunks"
        );

        let contexts = self
            .generate_contexts(text, &base_chunks, document_title)
            .await?;

        Ok(base_chunks
            .into_iter()
            .zip(contexts)
            .enumerate()
            .map(|(i, (base, context))| Chunk {
                text: base.text,
                context,
                chunk_index: i as u32,
                char_start: base.char_start,
                char_end: base.char_end,
                token_count: base.token_count,
            })
            .collect())
    }

    /// First chunk alone (writes the prompt cache), then waves of
    /// `max_concurrent` with intra-wave stagger and an inter-wave
    /// pause. A provider 429 pauses and retries the whole wave.
    async fn generate_contexts(
        &self,
        full_document: &str,
        base_chunks: &[BaseChunk],
        document_title: Option<&str>,
    ) -> Result<Vec<String>, PipelineError> {
        let system_prompt = build_system_prompt(full_document, document_title);

        let first = self
            .generate_one(&system_prompt, &base_chunks[0], true)
            .await?;
        let mut contexts = vec![first];

        let remaining = &base_chunks[1..];
        if remaining.is_empty() {
            return Ok(contexts);
        }

        let mut wave_start = 0;
        let mut wave_retries = 0u32;

        while wave_start < remaining.len() {
            let wave_end = (wave_start + self.max_concurrent).min(remaining.len());
            let wave = &remaining[wave_start..wave_end];

            let tasks = wave.iter().enumerate().map(|(i, chunk)| {
                let system_prompt = &system_prompt;
                async move {
                    if i > 0 {
                        tokio::time::sleep(WAVE_STAGGER * i as u32).await;
                    }
                    self.generate_one(system_prompt, chunk, false).await
                }
            });
            let results = futures::future::join_all(tasks).await;

            // A rate-limited wave pauses and runs again as a whole.
            let retry_after = results.iter().find_map(|r| match r {
                Err(PipelineError::RateLimited { retry_after, .. }) => {
                    Some(retry_after.unwrap_or(DEFAULT_RETRY_AFTER_SECS))
                }
                _ => None,
            });

            if let Some(pause) = retry_after {
                wave_retries += 1;
                if wave_retries > MAX_WAVE_RETRIES {
                    warn!(wave_retries, "exceeded wave retry budget, giving up");
                    return Err(PipelineError::rate_limited(
                        format!("chunking exceeded {MAX_WAVE_RETRIES} wave retries"),
                        Some(pause),
                    ));
                }
                warn!(
                    pause,
                    attempt = wave_retries,
                    "rate limit inside wave, pausing and retrying the wave"
                );
                tokio::time::sleep(Duration::from_secs(pause)).await;
                continue;
            }

            for result in results {
                contexts.push(result?);
            }
            wave_retries = 0;
            wave_start = wave_end;

            if wave_start < remaining.len() {
                tokio::time::sleep(WAVE_PAUSE).await;
            }
        }

        Ok(contexts)
    }

    async fn generate_one(
        &self,
        system_prompt: &str,
        chunk: &BaseChunk,
        is_first_chunk: bool,
    ) -> Result<String, PipelineError> {
        let user_content = format!("<chunk>\n{}\n</chunk>", chunk.text);

        // First chunk pays the cache write: document + chunk +
        // output. Later chunks ride the cache and pay chunk + output.
        let chunk_tokens = estimate_tokens(&user_content);
        let estimated = if is_first_chunk {
            estimate_tokens(system_prompt) + chunk_tokens + CONTEXT_OUTPUT_TOKENS
        } else {
            chunk_tokens + CONTEXT_OUTPUT_TOKENS
        };

        self.governor
            .wait_for_tokens(estimated)
            .await
            .map_err(governor_error)?;

        let reply = self
            .model
            .situate(system_prompt, &user_content)
            .await
            .map_err(|e| match e {
                LlmError::RateLimited { retry_after } => {
                    PipelineError::rate_limited("llm rate limited", retry_after)
                }
                other => other.into(),
            })?;

        Ok(reply.text)
    }
}

fn governor_error(err: KvError) -> PipelineError {
    // Capacity exhaustion is retryable at the job level.
    PipelineError::Internal(err.to_string())
}
