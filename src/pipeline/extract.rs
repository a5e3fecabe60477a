//! Text extraction: turn a downloaded document into plain text.
//!
//! Pure and synchronous. PDF parsing can take a while on large bulletins, so
//! the orchestrator runs [`extract_text`] under `spawn_blocking`.
//!
//! ## PDF strategy
//!
//! `lopdf` extracts page by page, which keeps page order and works on most
//! official bulletins. Some generators embed fonts lopdf cannot map; when it
//! fails or returns only whitespace, `pdf-extract` gets the same bytes.
//!
//! ## Cleanup rules
//!
//! Whatever the source, the text goes through the same deterministic passes
//! (applied in order):
//! 1. Normalise line endings (CRLF → LF)
//! 2. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens)
//! 3. Collapse runs of spaces and tabs, trim each line
//! 4. Collapse 3+ consecutive blank lines down to 1

use crate::error::AnalysisError;
use crate::pipeline::fetch::{DocumentKind, RawDocument};
use lopdf::Document;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Which engine produced the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionEngine {
    Lopdf,
    PdfExtract,
    Html,
    Json,
    PlainText,
}

/// Plain text extracted from one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedText {
    pub kind: DocumentKind,
    pub text: String,
    /// Pages seen by lopdf; `None` for non-PDF sources or the fallback engine.
    pub page_count: Option<usize>,
    pub engine: ExtractionEngine,
}

impl ExtractedText {
    pub fn char_count(&self) -> usize {
        self.text.chars().count()
    }
}

/// Extract plain text from a fetched document.
///
/// Fails with an extraction-class error when the document is corrupt, of an
/// unsupported type, or yields no text at all.
pub fn extract_text(doc: &RawDocument) -> Result<ExtractedText, AnalysisError> {
    let url = doc.url.as_str();

    let (text, page_count, engine) = match doc.kind {
        DocumentKind::Pdf => extract_pdf(url, &doc.bytes)?,
        DocumentKind::Html => (
            html_to_text(&String::from_utf8_lossy(&doc.bytes)),
            None,
            ExtractionEngine::Html,
        ),
        DocumentKind::Json => match json_to_text(&doc.bytes) {
            Some(text) => (text, None, ExtractionEngine::Json),
            None => {
                debug!("Body at {} is not valid JSON, treating as plain text", url);
                (String::from_utf8_lossy(&doc.bytes).into_owned(), None, ExtractionEngine::PlainText)
            }
        },
        DocumentKind::PlainText => (
            String::from_utf8_lossy(&doc.bytes).into_owned(),
            None,
            ExtractionEngine::PlainText,
        ),
        DocumentKind::Other => {
            return Err(AnalysisError::UnsupportedContent {
                url: url.to_string(),
                content_type: doc
                    .declared_type
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
            })
        }
    };

    let text = clean_text(&text);
    if text.is_empty() {
        return Err(AnalysisError::EmptyDocument {
            url: url.to_string(),
        });
    }

    debug!(
        "Extracted {} chars from {} via {:?}",
        text.chars().count(),
        url,
        engine
    );

    Ok(ExtractedText {
        kind: doc.kind,
        text,
        page_count,
        engine,
    })
}

// ── PDF ──────────────────────────────────────────────────────────────────────

fn extract_pdf(
    url: &str,
    bytes: &[u8],
) -> Result<(String, Option<usize>, ExtractionEngine), AnalysisError> {
    let lopdf_err = match extract_with_lopdf(bytes) {
        Ok((text, pages)) if !text.trim().is_empty() => {
            return Ok((text, Some(pages), ExtractionEngine::Lopdf));
        }
        Ok((_, pages)) => format!("lopdf found no text on {pages} page(s)"),
        Err(e) => e,
    };

    warn!("{} for {}, falling back to pdf-extract", lopdf_err, url);

    match extract_with_pdf_extract(bytes) {
        Ok(text) => Ok((text, None, ExtractionEngine::PdfExtract)),
        Err(e) => Err(AnalysisError::CorruptPdf {
            url: url.to_string(),
            detail: format!("{lopdf_err}; {e}"),
        }),
    }
}

fn extract_with_lopdf(bytes: &[u8]) -> Result<(String, usize), String> {
    // lopdf can panic on malformed streams.
    std::panic::catch_unwind(|| lopdf_text(bytes)).map_err(|_| "lopdf panicked".to_string())?
}

fn lopdf_text(bytes: &[u8]) -> Result<(String, usize), String> {
    let mut doc = Document::load_mem(bytes).map_err(|e| format!("lopdf could not parse: {e}"))?;

    // Many official PDFs are "encrypted" with an empty user password.
    if doc.is_encrypted() {
        doc.decrypt("")
            .map_err(|e| format!("lopdf could not decrypt: {e}"))?;
        debug!("Decrypted PDF with empty password");
    }

    let pages = doc.get_pages();
    let page_count = pages.len();
    let mut text = String::new();
    for page_num in pages.keys() {
        match doc.extract_text(&[*page_num]) {
            Ok(content) => {
                text.push_str(&content);
                text.push('\n');
            }
            Err(e) => debug!("lopdf skipped page {}: {}", page_num, e),
        }
    }
    Ok((text, page_count))
}

fn extract_with_pdf_extract(bytes: &[u8]) -> Result<String, String> {
    // pdf-extract panics on some malformed inputs instead of returning Err.
    let result = std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes))
        .map_err(|_| "pdf-extract panicked".to_string())?;
    let text = result.map_err(|e| format!("pdf-extract failed: {e}"))?;
    if text.trim().is_empty() {
        return Err("pdf-extract returned empty content".to_string());
    }
    Ok(text)
}

// ── HTML ─────────────────────────────────────────────────────────────────────

static RE_COMMENTS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());

// The regex crate has no backreferences, so one pattern per element.
static RE_DROPPED_ELEMENTS: Lazy<Vec<Regex>> = Lazy::new(|| {
    ["script", "style", "noscript", "svg", "template"]
        .iter()
        .map(|tag| Regex::new(&format!(r"(?is)<{tag}\b[^>]*>.*?</{tag}\s*>")).unwrap())
        .collect()
});

static RE_BLOCK_TAGS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)</?(?:p|div|br|li|ul|ol|tr|table|thead|tbody|h[1-6]|section|article|header|footer|nav|main|aside|dl|dd|dt|blockquote|pre|title|form|fieldset|hr)\b[^>]*>",
    )
    .unwrap()
});

static RE_CELL_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)</?(?:td|th)\b[^>]*>").unwrap());

static RE_ANY_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());

static RE_ENTITY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"&(#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[a-zA-Z]{2,8});").unwrap());

/// Reduce an HTML page to readable text.
pub fn html_to_text(html: &str) -> String {
    let s = RE_COMMENTS.replace_all(html, "");
    let mut s = s.into_owned();
    for re in RE_DROPPED_ELEMENTS.iter() {
        s = re.replace_all(&s, "").into_owned();
    }
    let s = RE_BLOCK_TAGS.replace_all(&s, "\n");
    let s = RE_CELL_TAGS.replace_all(&s, " ");
    let s = RE_ANY_TAG.replace_all(&s, "");
    decode_entities(&s)
}

/// Decode numeric entities and the named ones common in Spanish pages.
pub fn decode_entities(input: &str) -> String {
    RE_ENTITY
        .replace_all(input, |caps: &Captures| {
            let body = &caps[1];
            let decoded = if let Some(hex) = body.strip_prefix("#x").or_else(|| body.strip_prefix("#X")) {
                u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
            } else if let Some(dec) = body.strip_prefix('#') {
                dec.parse::<u32>().ok().and_then(char::from_u32)
            } else {
                named_entity(body)
            };
            decoded.map_or_else(|| caps[0].to_string(), |c| c.to_string())
        })
        .into_owned()
}

fn named_entity(name: &str) -> Option<char> {
    let c = match name {
        "nbsp" => ' ',
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "aacute" => 'á',
        "eacute" => 'é',
        "iacute" => 'í',
        "oacute" => 'ó',
        "uacute" => 'ú',
        "Aacute" => 'Á',
        "Eacute" => 'É',
        "Iacute" => 'Í',
        "Oacute" => 'Ó',
        "Uacute" => 'Ú',
        "ntilde" => 'ñ',
        "Ntilde" => 'Ñ',
        "uuml" => 'ü',
        "Uuml" => 'Ü',
        "ccedil" => 'ç',
        "iexcl" => '¡',
        "iquest" => '¿',
        "ordf" => 'ª',
        "ordm" => 'º',
        "euro" => '€',
        "laquo" => '«',
        "raquo" => '»',
        "ndash" => '–',
        "mdash" => '—',
        "hellip" => '…',
        "middot" => '·',
        "deg" => '°',
        "copy" => '©',
        _ => return None,
    };
    Some(c)
}

// ── JSON ─────────────────────────────────────────────────────────────────────

/// Pretty-print a JSON body. `None` when it does not parse; an empty string
/// when it carries no scalar data at all.
fn json_to_text(bytes: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(bytes).ok()?;
    if !has_content(&value) {
        return Some(String::new());
    }
    serde_json::to_string_pretty(&value).ok()
}

fn has_content(value: &serde_json::Value) -> bool {
    use serde_json::Value;
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Bool(_) | Value::Number(_) => true,
        Value::Array(items) => items.iter().any(has_content),
        Value::Object(map) => map.values().any(has_content),
    }
}

// ── Cleanup ──────────────────────────────────────────────────────────────────

/// Apply the cleanup rules listed in the module docs.
pub fn clean_text(input: &str) -> String {
    let s = normalise_line_endings(input);
    let s = remove_invisible_chars(&s);
    let s = collapse_inline_whitespace(&s);
    collapse_blank_lines(&s).trim().to_string()
}

// Rule 1
fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// Rule 2
fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

// Rule 3
static RE_INLINE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t\u{00A0}\f\v]+").unwrap());

fn collapse_inline_whitespace(input: &str) -> String {
    input
        .lines()
        .map(|line| RE_INLINE_WS.replace_all(line, " ").trim().to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

// Rule 4
static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n").to_string()
}
