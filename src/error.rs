//! Error types for the subsidy-analyzer library.
//!
//! Every failure the pipeline can produce is an [`AnalysisError`]. Each
//! variant belongs to exactly one [`ErrorKind`], and the kind alone decides
//! how the orchestrator reacts:
//!
//! | Kind | Retry policy |
//! |------|--------------|
//! | [`ErrorKind::InvalidInput`] | surfaced immediately |
//! | [`ErrorKind::Fetch`] | one re-attempt (alternate URL when known) |
//! | [`ErrorKind::Extraction`] | one fallback attempt (alternate URL when known) |
//! | [`ErrorKind::Llm`] | one retry with the fallback model |
//! | [`ErrorKind::Validation`] | surfaced immediately |
//! | [`ErrorKind::Internal`] | surfaced immediately |
//!
//! Errors never escape [`crate::analyze::Analyzer::analyze`] as `Err`; they
//! are folded into [`crate::output::AnalysisFailure`] together with whatever
//! partial data was gathered before the failing step.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// All errors returned by the subsidy-analyzer library.
#[derive(Debug, Error)]
pub enum AnalysisError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Neither a BDNS code nor a URL was supplied.
    #[error("Invalid request: provide either a BDNS code or a source URL")]
    MissingSource,

    /// Both a BDNS code and a URL were supplied.
    #[error("Invalid request: provide a BDNS code or a source URL, not both")]
    AmbiguousSource,

    /// The BDNS code is not a short string of ASCII digits.
    #[error("Invalid BDNS code '{code}': expected 1–10 digits")]
    InvalidCode { code: String },

    /// The URL does not parse or does not use http/https.
    #[error("Invalid source URL '{input}': {reason}")]
    InvalidUrl { input: String, reason: String },

    /// Builder or environment validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Fetch errors ──────────────────────────────────────────────────────
    /// Network-level failure (DNS, TLS, connection reset, redirect loop).
    #[error("Failed to download '{url}': {reason}")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    /// Server answered with a non-2xx status.
    #[error("HTTP {status} from '{url}'")]
    HttpStatus { url: String, status: u16 },

    // ── Extraction errors ─────────────────────────────────────────────────
    /// The document contained no extractable text.
    #[error("Document '{url}' contains no extractable text")]
    EmptyDocument { url: String },

    /// PDF could not be parsed by any extraction engine.
    #[error("PDF '{url}' is corrupt or unreadable: {detail}")]
    CorruptPdf { url: String, detail: String },

    /// The extraction worker panicked or was cancelled.
    #[error("Extraction of '{url}' aborted: {detail}")]
    ExtractionAborted { url: String, detail: String },

    /// Content type we cannot turn into text (images, archives, …).
    #[error("Unsupported content type '{content_type}' at '{url}'")]
    UnsupportedContent { url: String, content_type: String },

    // ── LLM errors ────────────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// The LLM API returned an error.
    #[error("LLM API error from '{model}': {message}")]
    LlmApiError { model: String, message: String },

    /// HTTP 429 from the provider.
    #[error("Rate limit exceeded for model '{model}'")]
    RateLimitExceeded { model: String },

    /// The LLM call did not answer within `api_timeout_secs`.
    #[error("LLM call to '{model}' timed out after {secs}s")]
    LlmTimeout { model: String, secs: u64 },

    /// The model answered with no content at all.
    #[error("LLM '{model}' returned an empty response")]
    EmptyResponse { model: String },

    // ── Validation errors ─────────────────────────────────────────────────
    /// The model output contains no parseable JSON object.
    #[error("Could not extract a valid JSON record from the LLM response: {detail}")]
    MalformedResponse { detail: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the output JSON file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AnalysisError {
    /// The failure class that drives retry policy and reporting.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AnalysisError::MissingSource
            | AnalysisError::AmbiguousSource
            | AnalysisError::InvalidCode { .. }
            | AnalysisError::InvalidUrl { .. }
            | AnalysisError::InvalidConfig(_) => ErrorKind::InvalidInput,

            AnalysisError::DownloadFailed { .. }
            | AnalysisError::DownloadTimeout { .. }
            | AnalysisError::HttpStatus { .. } => ErrorKind::Fetch,

            AnalysisError::EmptyDocument { .. }
            | AnalysisError::CorruptPdf { .. }
            | AnalysisError::ExtractionAborted { .. }
            | AnalysisError::UnsupportedContent { .. } => ErrorKind::Extraction,

            AnalysisError::ProviderNotConfigured { .. }
            | AnalysisError::LlmApiError { .. }
            | AnalysisError::RateLimitExceeded { .. }
            | AnalysisError::LlmTimeout { .. }
            | AnalysisError::EmptyResponse { .. } => ErrorKind::Llm,

            AnalysisError::MalformedResponse { .. } => ErrorKind::Validation,

            AnalysisError::OutputWriteFailed { .. } | AnalysisError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether the orchestrator grants this error one more attempt.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

/// Failure classes, serialised with the names used in reports and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "InvalidInputError")]
    InvalidInput,
    #[serde(rename = "FetchError")]
    Fetch,
    #[serde(rename = "ExtractionError")]
    Extraction,
    #[serde(rename = "LLMError")]
    Llm,
    #[serde(rename = "ValidationError")]
    Validation,
    /// Environment failures unrelated to the request (runtime, HTTP client,
    /// output file).
    #[serde(rename = "InternalError")]
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "InvalidInputError",
            ErrorKind::Fetch => "FetchError",
            ErrorKind::Extraction => "ExtractionError",
            ErrorKind::Llm => "LLMError",
            ErrorKind::Validation => "ValidationError",
            ErrorKind::Internal => "InternalError",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Fetch | ErrorKind::Extraction | ErrorKind::Llm)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
