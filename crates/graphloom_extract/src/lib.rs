//! Extraction service: file bytes + MIME type in, text out.
//!
//! Documents and subtitles are parsed in-process; audio and video go
//! through the transcription provider, with video reduced to an audio
//! track first.

pub mod error;
pub mod media;
pub mod service;
pub mod text;
pub mod transcribe;

pub use error::ExtractError;
pub use service::{ExtractionOutcome, ExtractionService};
pub use transcribe::{DeepgramClient, Transcriber, Transcript};
