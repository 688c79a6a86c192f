//! Error types for the coordination layer.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, KvError>;

#[derive(Debug, Error)]
pub enum KvError {
    /// Redis transport or command error.
    #[error("kv backend error: {0}")]
    Backend(#[from] redis::RedisError),

    /// Malformed stored value (queue records, zset members).
    #[error("kv serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Rate-governor capacity could not be acquired within the
    /// bounded attempt budget. Retryable at the job level.
    #[error("rate capacity exhausted: {0}")]
    CapacityExhausted(String),

    #[error("{0}")]
    Other(String),
}
