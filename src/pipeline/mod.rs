//! Pipeline stages for subsidy analysis.
//!
//! Each submodule implements exactly one step and knows nothing about the
//! others; [`crate::analyze`] sequences them and applies the retry policy.
//!
//! ## Data Flow
//!
//! ```text
//! resolve ──▶ fetch ──▶ extract ──▶ prompts ──▶ llm ──▶ validate
//! (code/URL)  (HTTP)    (PDF/HTML)  (schema)    (LLM)   (record)
//!                          │
//!                          └─▶ bdns  (linked PDFs from an API record)
//! ```
//!
//! 1. [`resolve`]: turn a BDNS code or URL into a canonical URL
//! 2. [`fetch`]: HTTP GET with timeout and redirect limit
//! 3. [`extract`]: PDF/HTML/JSON bytes to plain text; pure
//! 4. [`bdns`]: list the PDFs attached to a BDNS API record
//! 5. [`llm`]: one model call, plus the single fallback-model retry
//! 6. [`validate`]: parse the reply into a [`crate::schema::StructuredRecord`]

pub mod bdns;
pub mod extract;
pub mod fetch;
pub mod llm;
pub mod resolve;
pub mod validate;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Orchestrator states, in execution order.
///
/// `Failed` is reachable from every non-terminal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Resolving,
    Fetching,
    Extracting,
    Prompting,
    InvokingLlm,
    Validating,
    Done,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Resolving => "resolving",
            Stage::Fetching => "fetching",
            Stage::Extracting => "extracting",
            Stage::Prompting => "prompting",
            Stage::InvokingLlm => "invoking_llm",
            Stage::Validating => "validating",
            Stage::Done => "done",
            Stage::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done | Stage::Failed)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
