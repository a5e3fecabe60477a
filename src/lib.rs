//! # subsidy-analyzer
//!
//! Extract a structured record from a Spanish public subsidy announcement
//! (BDNS, *Base de Datos Nacional de Subvenciones*) using a Large Language
//! Model.
//!
//! ## Why this crate?
//!
//! Announcements are published as HTML pages, JSON records and scanned or
//! generated PDFs with no common layout. Instead of one parser per publisher,
//! this crate turns every source into plain text and asks an LLM to fill a
//! fixed schema. Anything the documents do not state is reported as
//! `"No especificado"`, never guessed.
//!
//! ## Pipeline Overview
//!
//! ```text
//! BDNS code or URL
//!  │
//!  ├─ 1. Resolve   canonical announcement URL (+ API URL as alternate)
//!  ├─ 2. Fetch     HTTP GET with timeout and redirect limit
//!  ├─ 3. Extract   PDF (lopdf → pdf-extract) / HTML / JSON → plain text
//!  │     └─ 3b.    PDFs attached to the BDNS record
//!  ├─ 4. Prompt    source text + JSON template + extraction rules
//!  ├─ 5. LLM       gpt-4o-mini, one retry with gpt-4o
//!  └─ 6. Validate  JSON → StructuredRecord, field by field
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use subsidy_analyzer::{analyze, AnalysisRequest, AnalysisResult, AnalyzerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider API key from OPENAI_API_KEY (or the configured provider's variable)
//!     let config = AnalyzerConfig::from_env()?;
//!     match analyze(&AnalysisRequest::from_code("845133"), &config).await {
//!         AnalysisResult::Success(output) => {
//!             println!("{}", serde_json::to_string_pretty(&output.record)?);
//!             eprintln!("missing: {:?}", output.metadata.missing_fields);
//!         }
//!         AnalysisResult::Failure(failure) => {
//!             eprintln!("{} at {}: {}", failure.kind, failure.stage, failure.message);
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `subsidy-analyzer` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library to avoid pulling in CLI-only deps:
//! ```toml
//! subsidy-analyzer = { version = "0.3", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod analyze;
pub mod config;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod schema;
pub mod trace;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use analyze::{analyze, analyze_sync, analyze_to_file, Analyzer, AnalyzerBuilder};
pub use config::{AnalyzerConfig, AnalyzerConfigBuilder};
pub use error::{AnalysisError, ErrorKind};
pub use output::{
    AnalysisFailure, AnalysisMetadata, AnalysisOutput, AnalysisResult, PartialData, StepRecord,
};
pub use pipeline::resolve::AnalysisRequest;
pub use pipeline::Stage;
pub use progress::{AnalysisProgressCallback, NoopProgressCallback, ProgressCallback};
pub use schema::{Extracted, StructuredRecord, NOT_FOUND};
