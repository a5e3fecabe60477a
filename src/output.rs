//! Result types returned by an analysis run.
//!
//! A run always produces an [`AnalysisResult`]: either the validated record
//! with its metadata, or a structured failure carrying the error class, the
//! stage that failed and everything gathered up to that point. Both
//! serialise to JSON with a `status` tag so the CLI output and the library
//! result are the same document.

use crate::error::ErrorKind;
use crate::pipeline::bdns::LinkedDocument;
use crate::pipeline::fetch::DocumentKind;
use crate::pipeline::Stage;
use crate::schema::StructuredRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AnalysisResult {
    Success(AnalysisOutput),
    Failure(AnalysisFailure),
}

impl AnalysisResult {
    pub fn is_success(&self) -> bool {
        matches!(self, AnalysisResult::Success(_))
    }

    pub fn output(&self) -> Option<&AnalysisOutput> {
        match self {
            AnalysisResult::Success(output) => Some(output),
            AnalysisResult::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&AnalysisFailure> {
        match self {
            AnalysisResult::Success(_) => None,
            AnalysisResult::Failure(failure) => Some(failure),
        }
    }

    /// Per-attempt step log, whichever way the run ended.
    pub fn steps(&self) -> &[StepRecord] {
        match self {
            AnalysisResult::Success(output) => &output.metadata.steps,
            AnalysisResult::Failure(failure) => &failure.steps,
        }
    }
}

/// A validated record and how it was obtained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisOutput {
    pub record: StructuredRecord,
    pub metadata: AnalysisMetadata,
}

/// Provenance and statistics for a successful run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisMetadata {
    pub bdns_code: Option<String>,
    /// URL the primary document was read from (after any fallback).
    pub source_url: String,
    pub document_kind: DocumentKind,
    /// Characters of source text extracted, across all documents.
    pub extracted_chars: usize,
    /// Source text was cut to fit the prompt.
    pub truncated: bool,
    /// Attached PDFs whose text reached the prompt.
    pub linked_documents: Vec<LinkedDocument>,
    pub model_used: String,
    pub used_fallback_model: bool,
    pub input_tokens: usize,
    pub output_tokens: usize,
    /// `section.field` paths the model could not fill.
    pub missing_fields: Vec<String>,
    pub analysis_date: DateTime<Utc>,
    pub total_duration_ms: u64,
    pub steps: Vec<StepRecord>,
}

/// A run that ended in the `Failed` state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisFailure {
    pub kind: ErrorKind,
    /// Stage whose last attempt failed.
    pub stage: Stage,
    pub message: String,
    pub partial: PartialData,
    pub analysis_date: DateTime<Utc>,
    pub total_duration_ms: u64,
    pub steps: Vec<StepRecord>,
}

/// Whatever the run learned before it failed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bdns_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_kind: Option<DocumentKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_chars: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_chars: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_used: Option<String>,
    /// Model reply that failed validation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
}

/// One attempt of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub stage: Stage,
    /// 1 for the first attempt, 2 for the retry.
    pub attempt: u32,
    pub duration_ms: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepRecord {
    /// Number of attempts recorded for `stage`.
    pub fn attempts(steps: &[StepRecord], stage: Stage) -> usize {
        steps.iter().filter(|s| s.stage == stage).count()
    }
}
