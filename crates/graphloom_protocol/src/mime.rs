//! MIME tables, size limits, and file-type helpers.

/// 1200 MB cap for audio/video (bounds transcription time and cost).
pub const MAX_AUDIO_VIDEO_BYTES: u64 = 1200 * 1024 * 1024;

/// 50 MB cap for documents.
pub const MAX_DOCUMENT_BYTES: u64 = 50 * 1024 * 1024;

pub const AUDIO_MIME_TYPES: [&str; 8] = [
    "audio/mpeg",
    "audio/mp4",
    "audio/wav",
    "audio/flac",
    "audio/ogg",
    "audio/opus",
    "audio/x-m4a",
    "audio/x-wav",
];

pub const VIDEO_MIME_TYPES: [&str; 6] = [
    "video/mp4",
    "video/quicktime",
    "video/x-msvideo",
    "video/x-matroska",
    "video/webm",
    "video/mpeg",
];

pub const DOCUMENT_MIME_TYPES: [&str; 5] = [
    "application/pdf",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/msword",
    "text/plain",
    "application/vnd.google-apps.document",
];

pub const SUBTITLE_MIME_TYPES: [&str; 3] = ["text/vtt", "text/srt", "application/x-subrip"];

pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_GOOGLE_DOC: &str = "application/vnd.google-apps.document";

/// Audio/video files skip the storage round-trip and go straight to
/// transcription. Prefix fallback catches types outside the explicit
/// lists.
pub fn is_audio_video(mime_type: &str) -> bool {
    AUDIO_MIME_TYPES.contains(&mime_type)
        || VIDEO_MIME_TYPES.contains(&mime_type)
        || mime_type.starts_with("audio/")
        || mime_type.starts_with("video/")
}

pub fn is_video(mime_type: &str) -> bool {
    VIDEO_MIME_TYPES.contains(&mime_type) || mime_type.starts_with("video/")
}

pub fn is_document(mime_type: &str) -> bool {
    DOCUMENT_MIME_TYPES.contains(&mime_type)
}

pub fn is_subtitle(mime_type: &str) -> bool {
    SUBTITLE_MIME_TYPES.contains(&mime_type)
}

/// Resolve a file-type label (e.g. "mp3") or a full MIME type to a
/// MIME type. Unknown labels fall back to octet-stream.
pub fn mime_from_file_type(file_type: &str) -> String {
    if file_type.contains('/') {
        return file_type.to_string();
    }
    let mime = match file_type.to_ascii_lowercase().as_str() {
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "wav" => "audio/wav",
        "flac" => "audio/flac",
        "ogg" => "audio/ogg",
        "opus" => "audio/opus",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "mpeg" => "video/mpeg",
        "pdf" => "application/pdf",
        "docx" => MIME_DOCX,
        "doc" => "application/msword",
        "txt" => "text/plain",
        "gdoc" => MIME_GOOGLE_DOC,
        "vtt" => "text/vtt",
        "srt" => "text/srt",
        _ => "application/octet-stream",
    };
    mime.to_string()
}

/// File extension (without dot) for storage keys. Google Docs are
/// always exported and stored as DOCX.
pub fn extension_for_mime(mime_type: &str) -> Option<&'static str> {
    let ext = match mime_type {
        "audio/mpeg" => "mp3",
        "audio/mp4" | "audio/x-m4a" => "m4a",
        "audio/wav" | "audio/x-wav" => "wav",
        "audio/flac" => "flac",
        "audio/ogg" => "ogg",
        "audio/opus" => "opus",
        "video/mp4" => "mp4",
        "video/quicktime" => "mov",
        "video/x-msvideo" => "avi",
        "video/x-matroska" => "mkv",
        "video/webm" => "webm",
        "video/mpeg" => "mpeg",
        "application/pdf" => "pdf",
        MIME_DOCX | MIME_GOOGLE_DOC => "docx",
        "application/msword" => "doc",
        "text/plain" => "txt",
        "text/vtt" => "vtt",
        "text/srt" | "application/x-subrip" => "srt",
        _ => return None,
    };
    Some(ext)
}

/// Human-readable label stored in `document.file_type`.
pub fn file_type_label(mime_type: &str) -> &'static str {
    match mime_type {
        "application/vnd.google-apps.document" => "gdoc",
        other => extension_for_mime(other).unwrap_or("unknown"),
    }
}

/// Size gate applied before any download. Returns the rejection
/// message for oversized files.
pub fn validate_file_size(size_bytes: u64, mime_type: &str) -> Result<(), String> {
    let (cap, kind) = if is_audio_video(mime_type) {
        (MAX_AUDIO_VIDEO_BYTES, "audio/video")
    } else {
        (MAX_DOCUMENT_BYTES, "document")
    };

    if size_bytes > cap {
        let size_mb = size_bytes as f64 / (1024.0 * 1024.0);
        let cap_mb = cap / (1024 * 1024);
        return Err(format!(
            "File too large: {size_mb:.1} MB exceeds maximum of {cap_mb} MB for {kind} files"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_video_detection_uses_lists_then_prefix() {
        assert!(is_audio_video("audio/mpeg"));
        assert!(is_audio_video("video/mp4"));
        assert!(is_audio_video("audio/aac")); // prefix fallback
        assert!(!is_audio_video("application/pdf"));
        assert!(is_video("video/webm"));
        assert!(!is_video("audio/mpeg"));
    }

    #[test]
    fn label_and_mime_round_trip() {
        assert_eq!(mime_from_file_type("mp3"), "audio/mpeg");
        assert_eq!(mime_from_file_type("audio/mpeg"), "audio/mpeg");
        assert_eq!(file_type_label("video/quicktime"), "mov");
        assert_eq!(file_type_label(MIME_GOOGLE_DOC), "gdoc");
        // Google Docs stored as docx regardless of label.
        assert_eq!(extension_for_mime(MIME_GOOGLE_DOC), Some("docx"));
    }

    #[test]
    fn size_limits_split_by_kind() {
        assert!(validate_file_size(100 * 1024 * 1024, "audio/mpeg").is_ok());
        assert!(validate_file_size(MAX_AUDIO_VIDEO_BYTES + 1, "audio/mpeg").is_err());
        assert!(validate_file_size(10 * 1024 * 1024, "application/pdf").is_ok());
        let err = validate_file_size(MAX_DOCUMENT_BYTES + 1, "application/pdf").unwrap_err();
        assert!(err.contains("50 MB"));
    }
}
