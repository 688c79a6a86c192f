//! Environment-driven configuration.
//!
//! Loaded once at startup into the service container and passed down;
//! nothing reads the environment after boot. Every value is required —
//! a missing variable is a fatal startup error, not a default.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("{0} is not a valid value for {1}")]
    Invalid(String, &'static str),
}

/// Full application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Relational store URL (sqlite:...).
    pub database_url: String,
    /// Coordination KV store URL (redis://...). Optional at load time
    /// because the launcher can run on the in-process KV backend
    /// (`--memory-kv`) instead; see `require_redis_url`.
    pub redis_url: Option<String>,
    /// Object store root directory.
    pub storage_root: String,
    /// Knowledge-graph engine service URL.
    pub graph_engine_url: String,
    /// LLM provider key (contextual chunking).
    pub anthropic_api_key: String,
    /// Transcription provider key.
    pub deepgram_api_key: String,
    /// TPM cap for the chunking LLM provider.
    pub anthropic_tpm_limit: u64,
    /// RPM cap for the graph engine's model provider.
    pub openai_rpm_limit: u64,
    /// TPM cap for the graph engine's model provider.
    pub openai_tpm_limit: u64,
    /// Wave size for concurrent context generation.
    pub chunking_max_concurrent: usize,
    /// Concurrent episode submissions during graph ingest.
    pub kg_max_concurrent: usize,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: require("DATABASE_URL")?,
            redis_url: optional("REDIS_URL"),
            storage_root: require("STORAGE_ROOT")?,
            graph_engine_url: require("GRAPH_ENGINE_URL")?,
            anthropic_api_key: require("ANTHROPIC_API_KEY")?,
            deepgram_api_key: require("DEEPGRAM_API_KEY")?,
            anthropic_tpm_limit: require_parsed("ANTHROPIC_TPM_LIMIT")?,
            openai_rpm_limit: require_parsed("OPENAI_RPM_LIMIT")?,
            openai_tpm_limit: require_parsed("OPENAI_TPM_LIMIT")?,
            chunking_max_concurrent: require_parsed("CHUNKING_MAX_CONCURRENT")?,
            kg_max_concurrent: require_parsed("KG_MAX_CONCURRENT")?,
        })
    }

    /// The Redis URL, required whenever the in-process KV backend was
    /// not selected. Missing is still a fatal startup error.
    pub fn require_redis_url(&self) -> Result<&str, ConfigError> {
        self.redis_url
            .as_deref()
            .ok_or(ConfigError::Missing("REDIS_URL"))
    }
}

fn require(name: &'static str) -> Result<String, ConfigError> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(name)),
    }
}

fn optional(name: &'static str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn require_parsed<T: std::str::FromStr>(name: &'static str) -> Result<T, ConfigError> {
    let raw = require(name)?;
    raw.parse()
        .map_err(|_| ConfigError::Invalid(raw.clone(), name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_variable_is_fatal() {
        // Deliberately unlikely to exist.
        let err = require("GRAPHLOOM_TEST_UNSET_VARIABLE").unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));
    }

    #[test]
    fn redis_url_is_only_demanded_when_asked_for() {
        let config = AppConfig {
            database_url: "sqlite::memory:".into(),
            redis_url: None,
            storage_root: "/tmp/graphloom".into(),
            graph_engine_url: "http://localhost:8800".into(),
            anthropic_api_key: "key".into(),
            deepgram_api_key: "key".into(),
            anthropic_tpm_limit: 1,
            openai_rpm_limit: 1,
            openai_tpm_limit: 1,
            chunking_max_concurrent: 1,
            kg_max_concurrent: 1,
        };
        assert!(matches!(
            config.require_redis_url(),
            Err(ConfigError::Missing("REDIS_URL"))
        ));

        let with_url = AppConfig {
            redis_url: Some("redis://localhost:6379".into()),
            ..config
        };
        assert_eq!(
            with_url.require_redis_url().unwrap(),
            "redis://localhost:6379"
        );
    }
}
