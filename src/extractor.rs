//! Output Extractor
//!
//! Isolates the single JSON document a worker prints on stdout, possibly
//! surrounded by diagnostic noise.
//!
//! Workers that wrap their payload in the frame markers are read exactly.
//! Otherwise the span from the first `{` to the last `}` is taken. That
//! fallback breaks if trailing noise contains a `}` after the real end of the
//! object, which is why the mapper always re-validates the candidate.

pub const FRAME_START: &str = "@@CLASSIFICATION_BEGIN@@";
pub const FRAME_END: &str = "@@CLASSIFICATION_END@@";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionMethod {
    /// Text between the frame markers
    Framed,
    /// First `{` through last `}`
    BraceSpan,
    /// No document boundary found; the whole trimmed output
    Whole,
}

/// Candidate document found in worker stdout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedDocument {
    pub text: String,
    pub method: ExtractionMethod,
}

impl ExtractedDocument {
    /// True when a document boundary was actually located
    pub fn has_boundary(&self) -> bool {
        self.method != ExtractionMethod::Whole
    }
}

pub fn extract_document(stdout: &[u8]) -> ExtractedDocument {
    let raw = String::from_utf8_lossy(stdout);
    extract_from_text(&raw)
}

pub fn extract_from_text(raw: &str) -> ExtractedDocument {
    let trimmed = raw.trim();

    if let Some(framed) = framed_payload(trimmed) {
        return ExtractedDocument {
            text: framed.trim().to_string(),
            method: ExtractionMethod::Framed,
        };
    }

    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => ExtractedDocument {
            text: trimmed[start..=end].to_string(),
            method: ExtractionMethod::BraceSpan,
        },
        _ => ExtractedDocument {
            text: trimmed.to_string(),
            method: ExtractionMethod::Whole,
        },
    }
}

fn framed_payload(text: &str) -> Option<&str> {
    let start = text.find(FRAME_START)? + FRAME_START.len();
    let end = text[start..].find(FRAME_END)? + start;
    Some(&text[start..end])
}
