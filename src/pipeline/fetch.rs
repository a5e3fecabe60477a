//! Document fetching: HTTP GET with timeout, redirect limit and browser headers.
//!
//! The subsidy portal rejects bare clients, so [`HttpFetcher`] sends the same
//! headers a desktop browser would. The whole body is read into memory; BDNS
//! documents are a few megabytes at most.
//!
//! The fetcher sits behind the [`DocumentFetcher`] trait so the orchestrator
//! can be driven by an in-memory fake in tests.

use crate::error::AnalysisError;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE, USER_AGENT};
use reqwest::{redirect, Client, Url};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

const BROWSER_ACCEPT: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,application/pdf,application/json;q=0.9,*/*;q=0.8";

/// What a fetched document contains, decided from headers and magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Pdf,
    Html,
    Json,
    PlainText,
    /// Anything we cannot turn into text (images, archives, …).
    Other,
}

impl DocumentKind {
    /// Classify a body.
    ///
    /// Magic bytes win over the declared type: the portal serves PDFs as
    /// `application/octet-stream` and error pages as `application/pdf`.
    pub fn detect(declared: Option<&str>, bytes: &[u8]) -> Self {
        if bytes.starts_with(b"%PDF") {
            return DocumentKind::Pdf;
        }

        let mime = declared
            .and_then(|d| d.split(';').next())
            .map(|m| m.trim().to_ascii_lowercase())
            .unwrap_or_default();

        match mime.as_str() {
            "text/html" | "application/xhtml+xml" => return DocumentKind::Html,
            "application/json" | "text/json" => return DocumentKind::Json,
            "text/plain" => return DocumentKind::PlainText,
            _ => {}
        }
        if mime.ends_with("+json") {
            return DocumentKind::Json;
        }

        match first_non_whitespace(bytes) {
            Some(b'<') => DocumentKind::Html,
            Some(b'{') | Some(b'[') => DocumentKind::Json,
            Some(_) if mime.is_empty() || mime.starts_with("text/") => DocumentKind::PlainText,
            // A declared PDF without the magic bytes is usually an error page.
            Some(_) if mime == "application/pdf" => DocumentKind::PlainText,
            Some(_) => DocumentKind::Other,
            None => DocumentKind::PlainText,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Pdf => "pdf",
            DocumentKind::Html => "html",
            DocumentKind::Json => "json",
            DocumentKind::PlainText => "plain_text",
            DocumentKind::Other => "other",
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn first_non_whitespace(bytes: &[u8]) -> Option<u8> {
    // Skip a UTF-8 BOM as well.
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    bytes.iter().copied().find(|b| !b.is_ascii_whitespace())
}

/// A downloaded document, still undecoded.
#[derive(Clone)]
pub struct RawDocument {
    /// Final URL after redirects.
    pub url: Url,
    pub bytes: Vec<u8>,
    pub kind: DocumentKind,
    /// Raw `Content-Type` header, if the server sent one.
    pub declared_type: Option<String>,
}

impl RawDocument {
    /// Build a document, detecting its kind from the body.
    pub fn new(url: Url, bytes: Vec<u8>, declared_type: Option<String>) -> Self {
        let kind = DocumentKind::detect(declared_type.as_deref(), &bytes);
        Self {
            url,
            bytes,
            kind,
            declared_type,
        }
    }

    /// A reasonable name for the document, used as its prompt header.
    pub fn display_name(&self) -> String {
        document_name(&self.url)
    }
}

impl fmt::Debug for RawDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawDocument")
            .field("url", &self.url.as_str())
            .field("bytes", &self.bytes.len())
            .field("kind", &self.kind)
            .field("declared_type", &self.declared_type)
            .finish()
    }
}

/// Last meaningful path segment of a URL, or its host.
pub fn document_name(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
        .map(str::to_string)
        .or_else(|| url.host_str().map(str::to_string))
        .unwrap_or_else(|| "document".to_string())
}

/// Downloads one URL.
#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<RawDocument, AnalysisError>;
}

/// Production fetcher built on `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    timeout_secs: u64,
}

impl HttpFetcher {
    pub fn new(timeout_secs: u64, max_redirects: usize) -> Result<Self, AnalysisError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
        headers.insert(ACCEPT, HeaderValue::from_static(BROWSER_ACCEPT));
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static("es-ES,es;q=0.9,en;q=0.8"),
        );

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .redirect(redirect::Policy::limited(max_redirects))
            .default_headers(headers)
            .build()
            .map_err(|e| AnalysisError::Internal(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            timeout_secs,
        })
    }

    fn map_send_error(&self, url: &Url, e: reqwest::Error) -> AnalysisError {
        if e.is_timeout() {
            AnalysisError::DownloadTimeout {
                url: url.to_string(),
                secs: self.timeout_secs,
            }
        } else {
            AnalysisError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl DocumentFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> Result<RawDocument, AnalysisError> {
        info!("Downloading: {}", url);

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| self.map_send_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AnalysisError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let final_url = response.url().clone();
        let declared_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let bytes = response
            .bytes()
            .await
            .map_err(|e| self.map_send_error(url, e))?;

        let document = RawDocument::new(final_url, bytes.to_vec(), declared_type);
        debug!(
            "Downloaded {} bytes from {} ({})",
            document.bytes.len(),
            document.url,
            document.kind
        );
        Ok(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_bytes_beat_declared_type() {
        let kind = DocumentKind::detect(Some("application/octet-stream"), b"%PDF-1.7\n...");
        assert_eq!(kind, DocumentKind::Pdf);
    }

    #[test]
    fn declared_types_are_honoured() {
        assert_eq!(
            DocumentKind::detect(Some("text/html; charset=utf-8"), b"hello"),
            DocumentKind::Html
        );
        assert_eq!(
            DocumentKind::detect(Some("application/json"), b"{}"),
            DocumentKind::Json
        );
        assert_eq!(
            DocumentKind::detect(Some("application/problem+json"), b"{}"),
            DocumentKind::Json
        );
    }

    #[test]
    fn sniffing_without_header() {
        assert_eq!(DocumentKind::detect(None, b"  <!DOCTYPE html>"), DocumentKind::Html);
        assert_eq!(DocumentKind::detect(None, b"\n{\"a\":1}"), DocumentKind::Json);
        assert_eq!(DocumentKind::detect(None, b"plain words"), DocumentKind::PlainText);
        assert_eq!(DocumentKind::detect(None, b""), DocumentKind::PlainText);
    }

    #[test]
    fn binary_with_foreign_type_is_other() {
        assert_eq!(
            DocumentKind::detect(Some("image/png"), b"\x89PNG\r\n"),
            DocumentKind::Other
        );
    }

    #[test]
    fn document_name_prefers_last_segment() {
        let url = Url::parse("https://example.com/docs/bases.pdf").unwrap();
        assert_eq!(document_name(&url), "bases.pdf");
        let url = Url::parse("https://example.com/").unwrap();
        assert_eq!(document_name(&url), "example.com");
    }

    #[test]
    fn client_builds_with_limits() {
        assert!(HttpFetcher::new(30, 5).is_ok());
    }
}
