//! Extraction error types and their mapping into the pipeline
//! taxonomy.

use graphloom_protocol::PipelineError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractError {
    /// MIME type the service has no parser or provider for.
    #[error("unsupported MIME type for extraction: {0}")]
    Unsupported(String),

    /// Video container without a single audio stream.
    #[error("file contains no audio tracks: {0}")]
    NoAudioTrack(String),

    /// Bytes do not parse as the declared format.
    #[error("invalid file format: {0}")]
    InvalidFormat(String),

    /// ffmpeg/ffprobe failure.
    #[error("media processing failed: {0}")]
    Media(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Transcription provider timed out.
    #[error("transcription timed out: {0}")]
    Timeout(String),

    /// Transcription provider unreachable.
    #[error("transcription connection failed: {0}")]
    Connection(String),

    /// Transcription provider returned an error status.
    #[error("transcription provider error ({status}): {message}")]
    Provider { status: u16, message: String },

    /// Provider response did not have the expected shape.
    #[error("malformed provider response: {0}")]
    MalformedResponse(String),
}

impl From<ExtractError> for PipelineError {
    fn from(err: ExtractError) -> Self {
        match err {
            ExtractError::Unsupported(m) | ExtractError::NoAudioTrack(m) => {
                PipelineError::InvalidInput(m)
            }
            ExtractError::InvalidFormat(m) => PipelineError::InvalidFileFormat(m),
            ExtractError::Media(m) => PipelineError::Internal(m),
            ExtractError::Io(e) => PipelineError::Internal(e.to_string()),
            ExtractError::Timeout(m) => PipelineError::Timeout(m),
            ExtractError::Connection(m) => PipelineError::Connection(m),
            ExtractError::Provider { status, message } => {
                PipelineError::from_status(status, message)
            }
            ExtractError::MalformedResponse(m) => PipelineError::Internal(m),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_keeps_retry_classes() {
        let no_audio: PipelineError = ExtractError::NoAudioTrack("clip.mp4".into()).into();
        assert!(!no_audio.is_retryable());
        assert_eq!(no_audio.error_type(), "ValueError");

        let timeout: PipelineError = ExtractError::Timeout("600s".into()).into();
        assert!(timeout.is_retryable());

        let gone: PipelineError = ExtractError::Provider {
            status: 503,
            message: "down".into(),
        }
        .into();
        assert!(gone.is_retryable());
    }
}
