//! Document and subtitle text extraction.
//!
//! PDF extraction in particular loses spacing; the repair pass fixes
//! the common artifacts (missing spaces at case transitions, at
//! letter/digit boundaries, and after sentence punctuation) and
//! rebuilds paragraph structure.

use crate::error::ExtractError;
use regex::Regex;
use std::io::Read;
use std::sync::OnceLock;

fn regexes() -> &'static SpacingRegexes {
    static REGEXES: OnceLock<SpacingRegexes> = OnceLock::new();
    REGEXES.get_or_init(SpacingRegexes::new)
}

struct SpacingRegexes {
    case_transition: Regex,
    after_punctuation: Regex,
    digit_then_letter: Regex,
    letter_then_digit: Regex,
    multi_space: Regex,
    excess_newlines: Regex,
    control_chars: Regex,
    whitespace_run: Regex,
    sentence_end: Regex,
}

impl SpacingRegexes {
    fn new() -> Self {
        Self {
            case_transition: Regex::new(r"([a-z])([A-Z])").unwrap(),
            after_punctuation: Regex::new(r"([.!?;:])([A-Za-z])").unwrap(),
            digit_then_letter: Regex::new(r"(\d)([A-Za-z])").unwrap(),
            letter_then_digit: Regex::new(r"([A-Za-z])(\d)").unwrap(),
            multi_space: Regex::new(r" +").unwrap(),
            excess_newlines: Regex::new(r"\n{3,}").unwrap(),
            control_chars: Regex::new(r"[\x00-\x08\x0B\x0C\x0E-\x1F\x7F]").unwrap(),
            whitespace_run: Regex::new(r"\s+").unwrap(),
            sentence_end: Regex::new(r"[.!?]+").unwrap(),
        }
    }
}

// ============================================================================
// PDF
// ============================================================================

pub fn extract_pdf(data: &[u8]) -> Result<String, ExtractError> {
    let raw = pdf_extract::extract_text_from_mem(data)
        .map_err(|e| ExtractError::InvalidFormat(format!("pdf: {e}")))?;
    Ok(fix_pdf_spacing(&raw))
}

/// Repair the usual PDF extraction artifacts and rebuild paragraphs.
pub fn fix_pdf_spacing(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let r = regexes();

    let text = r.case_transition.replace_all(text, "$1 $2");
    let text = r.after_punctuation.replace_all(&text, "$1 $2");
    let text = r.digit_then_letter.replace_all(&text, "$1 $2");
    let text = r.letter_then_digit.replace_all(&text, "$1 $2");

    let cleaned_lines: Vec<String> = text
        .lines()
        .map(|line| r.multi_space.replace_all(line.trim(), " ").into_owned())
        .filter(|line| !line.is_empty())
        .collect();

    rebuild_paragraphs(&cleaned_lines)
}

/// Group cleaned lines into paragraphs: short ALL-CAPS lines stand
/// alone as headers, sentence-final lines close a paragraph.
fn rebuild_paragraphs(lines: &[String]) -> String {
    let mut paragraphs: Vec<String> = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in lines {
        let is_header = line.len() < 10
            && line.chars().any(|c| c.is_alphabetic())
            && !line.chars().any(|c| c.is_lowercase());

        if is_header {
            if !current.is_empty() {
                paragraphs.push(current.join(" "));
                current.clear();
            }
            paragraphs.push(line.clone());
        } else if line.ends_with('.') || line.ends_with('!') || line.ends_with('?') {
            current.push(line);
            paragraphs.push(current.join(" "));
            current.clear();
        } else {
            current.push(line);
        }
    }

    if !current.is_empty() {
        paragraphs.push(current.join(" "));
    }

    paragraphs.join("\n\n")
}

// ============================================================================
// DOCX (and Google Docs exports)
// ============================================================================

pub fn extract_docx(data: &[u8]) -> Result<String, ExtractError> {
    let cursor = std::io::Cursor::new(data);
    let mut archive = zip::ZipArchive::new(cursor)
        .map_err(|e| ExtractError::InvalidFormat(format!("docx container: {e}")))?;

    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|e| ExtractError::InvalidFormat(format!("docx body missing: {e}")))?
        .read_to_string(&mut xml)
        .map_err(|e| ExtractError::InvalidFormat(format!("docx body unreadable: {e}")))?;

    parse_docx_xml(&xml)
}

/// Pull run text out of the WordprocessingML body, paragraph by
/// paragraph.
fn parse_docx_xml(xml: &str) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_str(xml);
    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.name().as_ref() == b"w:t" => in_text = true,
            Ok(Event::End(e)) if e.name().as_ref() == b"w:t" => in_text = false,
            Ok(Event::Text(t)) if in_text => {
                let piece = t
                    .unescape()
                    .map_err(|e| ExtractError::InvalidFormat(format!("docx text: {e}")))?;
                current.push_str(&piece);
            }
            Ok(Event::Empty(e)) if e.name().as_ref() == b"w:tab" => current.push(' '),
            Ok(Event::Empty(e)) if e.name().as_ref() == b"w:br" => current.push('\n'),
            Ok(Event::End(e)) if e.name().as_ref() == b"w:p" => {
                let paragraph = regexes()
                    .whitespace_run
                    .replace_all(current.trim(), " ")
                    .into_owned();
                if !paragraph.is_empty() {
                    paragraphs.push(paragraph);
                }
                current.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::InvalidFormat(format!("docx xml: {e}"))),
            _ => {}
        }
    }

    Ok(paragraphs.join("\n\n"))
}

// ============================================================================
// Legacy DOC
// ============================================================================

/// Legacy DOC is a binary format. Some files are actually OOXML under
/// a .doc name, so try the DOCX path first, then fall back to a lossy
/// scan with word-boundary repair.
pub fn extract_doc(data: &[u8]) -> Result<String, ExtractError> {
    if let Ok(text) = extract_docx(data) {
        if !text.trim().is_empty() {
            return Ok(text);
        }
    }

    let lossy: String = data
        .iter()
        .map(|&b| b as char)
        .filter(|c| c.is_ascii_graphic() || c.is_ascii_whitespace())
        .collect();

    let cleaned = clean_binary_text(&lossy);
    if cleaned.len() > 50 {
        Ok(cleaned)
    } else {
        Err(ExtractError::InvalidFormat(
            "could not extract readable text from DOC file".to_string(),
        ))
    }
}

/// Word-boundary repair for text scraped out of a binary container.
fn clean_binary_text(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let r = regexes();

    let text = r.control_chars.replace_all(text, " ");
    let text = r.case_transition.replace_all(&text, "$1 $2");
    let text = r.digit_then_letter.replace_all(&text, "$1 $2");
    let text = r.letter_then_digit.replace_all(&text, "$1 $2");
    let text = r.after_punctuation.replace_all(&text, "$1 $2");
    let text = r.whitespace_run.replace_all(&text, " ");

    let mut sentences: Vec<String> = Vec::new();
    for fragment in r.sentence_end.split(&text) {
        let fragment = fragment.trim();
        if fragment.len() <= 10 {
            continue;
        }
        let mut chars = fragment.chars();
        let sentence = match chars.next() {
            Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
            None => continue,
        };
        sentences.push(sentence);
    }

    if sentences.is_empty() {
        return String::new();
    }
    let mut result = sentences.join(". ");
    if !result.ends_with('.') {
        result.push('.');
    }
    result
}

// ============================================================================
// Plain text
// ============================================================================

pub fn extract_txt(data: &[u8]) -> Result<String, ExtractError> {
    // UTF-8 (with or without BOM), falling back to latin-1.
    let text = match std::str::from_utf8(data) {
        Ok(text) => text.trim_start_matches('\u{feff}').to_string(),
        Err(_) => data.iter().map(|&b| b as char).collect(),
    };

    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let text = regexes().excess_newlines.replace_all(&text, "\n\n");
    Ok(text.trim().to_string())
}

// ============================================================================
// Subtitles
// ============================================================================

/// WebVTT: drop the header, NOTE/STYLE/REGION blocks, cue ids and
/// timestamp lines; keep cue payload lines.
pub fn extract_vtt(data: &[u8]) -> Result<String, ExtractError> {
    let raw = extract_txt(data)?;
    let mut lines: Vec<&str> = Vec::new();
    let mut in_cue = false;

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            in_cue = false;
            continue;
        }
        if line.starts_with("WEBVTT")
            || line.starts_with("NOTE")
            || line.starts_with("STYLE")
            || line.starts_with("REGION")
        {
            in_cue = false;
            continue;
        }
        if line.contains("-->") {
            in_cue = true;
            continue;
        }
        if in_cue {
            lines.push(line);
        }
        // Anything else before a timestamp is a cue id; skip it.
    }

    Ok(lines.join("\n"))
}

/// SubRip: drop sequence numbers and timestamp lines.
pub fn extract_srt(data: &[u8]) -> Result<String, ExtractError> {
    let raw = extract_txt(data)?;
    let lines: Vec<&str> = raw
        .lines()
        .map(str::trim)
        .filter(|line| {
            !line.is_empty()
                && !line.contains("-->")
                && !line.chars().all(|c| c.is_ascii_digit())
        })
        .collect();
    Ok(lines.join("\n"))
}
