//! Pipeline error taxonomy.
//!
//! The stored `error_type` strings are part of the data contract: the
//! retry policy and the UI both match on them, so they are stable
//! names, not Rust type names.

use thiserror::Error;

/// Errors a phase handler can surface. Every variant maps to a stable
/// `error_type` name and a retryability class.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// Bad input to the coordinator or a handler.
    #[error("validation error: {0}")]
    Validation(String),

    /// Invalid value in otherwise well-formed input (e.g. a video with
    /// no audio track, a file over the size limit).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A referenced artifact or row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The file bytes do not match the declared format.
    #[error("invalid file format: {0}")]
    InvalidFileFormat(String),

    /// Bad credentials against an external provider.
    #[error("authentication error: {0}")]
    Authentication(String),

    /// Tenant mismatch or provider-side permission denial.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Connection-level transport failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// A request or operation timed out.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Provider-signalled rate limit, optionally with a retry hint.
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<u64>,
    },

    /// Provider reported itself unavailable.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Some but not all chunks reached the graph engine. Always raised
    /// after compensation has run, so a retry starts from zero.
    #[error("partial ingest failure: {0}")]
    PartialIngest(String),

    /// HTTP failure with a status code; retryability follows the code.
    #[error("http {status}: {message}")]
    Http { status: u16, message: String },

    /// Anything unclassified. Retried, conservatively.
    #[error("{0}")]
    Internal(String),
}

impl PipelineError {
    pub fn rate_limited(message: impl Into<String>, retry_after: Option<u64>) -> Self {
        PipelineError::RateLimited {
            message: message.into(),
            retry_after,
        }
    }

    /// Stable name recorded in `pipeline_phase.error_type`.
    pub fn error_type(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "ValidationError",
            PipelineError::InvalidInput(_) => "ValueError",
            PipelineError::NotFound(_) => "FileNotFoundError",
            PipelineError::InvalidFileFormat(_) => "InvalidFileFormat",
            PipelineError::Authentication(_) => "AuthenticationError",
            PipelineError::PermissionDenied(_) => "PermissionDenied",
            PipelineError::Connection(_) => "ConnectionError",
            PipelineError::Timeout(_) => "TimeoutError",
            PipelineError::RateLimited { .. } => "RateLimitError",
            PipelineError::ServiceUnavailable(_) => "ServiceUnavailable",
            PipelineError::PartialIngest(_) => "PartialIngestError",
            PipelineError::Http { .. } => "HTTPError",
            PipelineError::Internal(_) => "InternalError",
        }
    }

    /// Whether the worker runtime should schedule a retry. Unknown
    /// errors default to retryable; client errors never retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Validation(_)
            | PipelineError::InvalidInput(_)
            | PipelineError::NotFound(_)
            | PipelineError::InvalidFileFormat(_)
            | PipelineError::Authentication(_)
            | PipelineError::PermissionDenied(_) => false,
            PipelineError::Connection(_)
            | PipelineError::Timeout(_)
            | PipelineError::RateLimited { .. }
            | PipelineError::ServiceUnavailable(_)
            | PipelineError::PartialIngest(_) => true,
            // 4xx is a client error, except 429 which is a rate limit.
            PipelineError::Http { status, .. } => {
                !(400..500).contains(status) || *status == 429
            }
            PipelineError::Internal(_) => true,
        }
    }

    /// Provider retry hint, if the error carried one.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            PipelineError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Map an HTTP status to the matching variant.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        match status {
            429 => PipelineError::RateLimited {
                message: message.into(),
                retry_after: None,
            },
            401 | 403 => PipelineError::Authentication(message.into()),
            503 => PipelineError::ServiceUnavailable(message.into()),
            _ => PipelineError::Http {
                status,
                message: message.into(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_never_retry() {
        assert!(!PipelineError::Validation("bad".into()).is_retryable());
        assert!(!PipelineError::InvalidInput("no audio".into()).is_retryable());
        assert!(!PipelineError::NotFound("gone".into()).is_retryable());
        assert!(!PipelineError::InvalidFileFormat("pdf".into()).is_retryable());
        assert!(!PipelineError::Authentication("key".into()).is_retryable());
        assert!(!PipelineError::PermissionDenied("org".into()).is_retryable());
        assert!(!PipelineError::Http {
            status: 404,
            message: "missing".into()
        }
        .is_retryable());
    }

    #[test]
    fn transient_and_unknown_errors_retry() {
        assert!(PipelineError::Connection("reset".into()).is_retryable());
        assert!(PipelineError::Timeout("read".into()).is_retryable());
        assert!(PipelineError::rate_limited("429", Some(7)).is_retryable());
        assert!(PipelineError::ServiceUnavailable("503".into()).is_retryable());
        assert!(PipelineError::PartialIngest("5/10".into()).is_retryable());
        assert!(PipelineError::Http {
            status: 500,
            message: "boom".into()
        }
        .is_retryable());
        assert!(PipelineError::Internal("???".into()).is_retryable());
    }

    #[test]
    fn status_429_maps_to_rate_limit() {
        let err = PipelineError::from_status(429, "slow down");
        assert_eq!(err.error_type(), "RateLimitError");
        assert!(err.is_retryable());
    }

    #[test]
    fn error_type_names_are_stable() {
        assert_eq!(
            PipelineError::Timeout("t".into()).error_type(),
            "TimeoutError"
        );
        assert_eq!(
            PipelineError::PartialIngest("p".into()).error_type(),
            "PartialIngestError"
        );
    }
}
