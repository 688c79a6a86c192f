//! MIME dispatch: route bytes to the right extraction primitive.

use crate::error::ExtractError;
use crate::media;
use crate::text;
use crate::transcribe::{Transcriber, Transcript};
use bytes::Bytes;
use graphloom_protocol::mime::{self, MIME_DOCX, MIME_GOOGLE_DOC};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::info;

/// Extraction result. `transcript` is present for audio/video inputs
/// so handlers can record duration and cost in phase metadata.
#[derive(Debug, Clone)]
pub struct ExtractionOutcome {
    pub text: String,
    pub transcript: Option<Transcript>,
}

impl ExtractionOutcome {
    fn text_only(text: String) -> Self {
        Self {
            text,
            transcript: None,
        }
    }

    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }
}

pub struct ExtractionService {
    transcriber: Arc<dyn Transcriber>,
}

impl ExtractionService {
    pub fn new(transcriber: Arc<dyn Transcriber>) -> Self {
        Self { transcriber }
    }

    /// Extract text from file bytes. Empty output is not an error
    /// here; the caller decides what an empty extraction means.
    pub async fn extract(
        &self,
        data: Bytes,
        mime_type: &str,
    ) -> Result<ExtractionOutcome, ExtractError> {
        if mime::is_audio_video(mime_type) {
            return self.transcribe_media(data, mime_type).await;
        }

        let text = match mime_type {
            "application/pdf" => text::extract_pdf(&data)?,
            MIME_DOCX | MIME_GOOGLE_DOC => text::extract_docx(&data)?,
            "application/msword" => text::extract_doc(&data)?,
            "text/plain" => text::extract_txt(&data)?,
            "text/vtt" => text::extract_vtt(&data)?,
            "text/srt" | "application/x-subrip" => text::extract_srt(&data)?,
            other => return Err(ExtractError::Unsupported(other.to_string())),
        };

        info!(mime_type, chars = text.len(), "extracted document text");
        Ok(ExtractionOutcome::text_only(text.trim().to_string()))
    }

    /// Audio goes straight to the provider; video is probed for an
    /// audio track and reduced to MP3 first.
    async fn transcribe_media(
        &self,
        data: Bytes,
        mime_type: &str,
    ) -> Result<ExtractionOutcome, ExtractError> {
        let transcript = if mime::is_video(mime_type) {
            let extension = mime::extension_for_mime(mime_type)
                .ok_or_else(|| ExtractError::Unsupported(mime_type.to_string()))?;
            let video_file = write_temp_file(&data, extension).await?;

            if !media::has_audio_track(video_file.path()).await? {
                return Err(ExtractError::NoAudioTrack(format!(
                    "video ({mime_type}) contains no audio tracks; cannot transcribe"
                )));
            }

            let audio_file = media::extract_audio_track(video_file.path()).await?;
            let audio_bytes = tokio::fs::read(audio_file.path()).await?;
            self.transcriber
                .transcribe(Bytes::from(audio_bytes), "audio/mpeg")
                .await?
        } else {
            self.transcriber.transcribe(data, mime_type).await?
        };

        Ok(ExtractionOutcome {
            text: transcript.text.clone(),
            transcript: Some(transcript),
        })
    }
}

async fn write_temp_file(
    data: &Bytes,
    extension: &str,
) -> Result<tempfile::NamedTempFile, ExtractError> {
    let file = tempfile::Builder::new()
        .suffix(&format!(".{extension}"))
        .tempfile()?;
    let mut handle = tokio::fs::File::create(file.path()).await?;
    handle.write_all(data).await?;
    handle.flush().await?;
    Ok(file)
}
