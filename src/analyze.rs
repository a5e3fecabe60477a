//! Workflow orchestration: one request through every stage.
//!
//! ```text
//! Resolving → Fetching → Extracting → Prompting → InvokingLlm → Validating → Done
//!      └──────────┴───────────┴────────────┴────────────┴────────────┴──▶ Failed
//! ```
//!
//! The workflow is a plain sequence of async calls, each wrapped in
//! [`StepTracer::run`]. Fetch and extraction failures get one fallback
//! attempt (the alternate URL when the resolver produced one), LLM failures
//! get one retry with the fallback model, and validation failures are final.
//!
//! [`Analyzer::analyze`] never returns `Err`: whatever happens, the caller
//! receives an [`AnalysisResult`] with the step log and, on failure, all the
//! partial data gathered before the failing step.

use crate::config::AnalyzerConfig;
use crate::error::AnalysisError;
use crate::output::{AnalysisFailure, AnalysisMetadata, AnalysisOutput, AnalysisResult, PartialData};
use crate::pipeline::bdns::{self, LinkedDocument};
use crate::pipeline::extract::{self, ExtractedText};
use crate::pipeline::fetch::{DocumentFetcher, DocumentKind, HttpFetcher, RawDocument};
use crate::pipeline::llm::{invoke_with_fallback, CompletionSettings, ModelPair};
use crate::pipeline::resolve::{self, AnalysisRequest, ResolvedSource};
use crate::pipeline::{validate, Stage};
use crate::prompts::{build_prompt, DocumentText, SourceMaterial};
use crate::trace::StepTracer;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use reqwest::Url;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Linked documents downloaded at once; results keep record order.
const LINKED_FETCH_CONCURRENCY: usize = 4;

/// Runs analyses with one configuration, fetcher and model pair.
///
/// # Example
/// ```rust,no_run
/// use subsidy_analyzer::{AnalysisRequest, Analyzer, AnalyzerConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let analyzer = Analyzer::from_config(AnalyzerConfig::from_env()?)?;
/// let result = analyzer.analyze(&AnalysisRequest::from_code("845133")).await;
/// println!("{}", serde_json::to_string_pretty(&result)?);
/// # Ok(())
/// # }
/// ```
pub struct Analyzer {
    config: AnalyzerConfig,
    fetcher: Arc<dyn DocumentFetcher>,
    models: ModelPair,
}

/// Builder for [`Analyzer`]; unset components are created from the config.
pub struct AnalyzerBuilder {
    config: AnalyzerConfig,
    fetcher: Option<Arc<dyn DocumentFetcher>>,
    models: Option<ModelPair>,
}

impl AnalyzerBuilder {
    pub fn fetcher(mut self, fetcher: Arc<dyn DocumentFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn models(mut self, models: ModelPair) -> Self {
        self.models = Some(models);
        self
    }

    /// Fails when the HTTP client cannot be built or the provider is not
    /// configured (e.g. its API key is missing).
    pub fn build(self) -> Result<Analyzer, AnalysisError> {
        let fetcher = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpFetcher::new(
                self.config.download_timeout_secs,
                self.config.max_redirects,
            )?),
        };
        let models = match self.models {
            Some(models) => models,
            None => ModelPair::from_config(&self.config)?,
        };
        Ok(Analyzer {
            config: self.config,
            fetcher,
            models,
        })
    }
}

/// The step that failed and why.
struct StageFailure {
    stage: Stage,
    error: AnalysisError,
}

fn at(stage: Stage) -> impl FnOnce(AnalysisError) -> StageFailure {
    move |error| StageFailure { stage, error }
}

/// A fetched document and its text.
struct Acquired {
    document: RawDocument,
    text: ExtractedText,
}

impl Analyzer {
    pub fn builder(config: AnalyzerConfig) -> AnalyzerBuilder {
        AnalyzerBuilder {
            config,
            fetcher: None,
            models: None,
        }
    }

    /// Production analyzer: `reqwest` fetcher and provider-backed models.
    pub fn from_config(config: AnalyzerConfig) -> Result<Self, AnalysisError> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Run one request to completion.
    pub async fn analyze(&self, request: &AnalysisRequest) -> AnalysisResult {
        let analysis_date = Utc::now();
        let tracer = StepTracer::new(&self.config);
        let mut partial = PartialData::default();
        info!("Starting analysis: {}", describe(request));

        match self.run(request, &tracer, &mut partial, analysis_date).await {
            Ok(mut output) => {
                let (steps, total_ms) = tracer.finish(Stage::Done);
                output.metadata.steps = steps;
                output.metadata.total_duration_ms = total_ms;
                info!(
                    "Analysis complete: {}/{} fields found, {}ms total",
                    output.record.found_count(),
                    output.record.found_count() + output.metadata.missing_fields.len(),
                    total_ms
                );
                AnalysisResult::Success(output)
            }
            Err(StageFailure { stage, error }) => {
                let (steps, total_ms) = tracer.finish(Stage::Failed);
                warn!("Analysis failed at {} ({}): {}", stage, error.kind(), error);
                AnalysisResult::Failure(AnalysisFailure {
                    kind: error.kind(),
                    stage,
                    message: error.to_string(),
                    partial,
                    analysis_date,
                    total_duration_ms: total_ms,
                    steps,
                })
            }
        }
    }

    async fn run(
        &self,
        request: &AnalysisRequest,
        tracer: &StepTracer,
        partial: &mut PartialData,
        analysis_date: DateTime<Utc>,
    ) -> Result<AnalysisOutput, StageFailure> {
        // ── Step 1: Resolve source ───────────────────────────────────────────
        let resolved = tracer
            .run(Stage::Resolving, 1, async { resolve::resolve(request) })
            .await
            .map_err(at(Stage::Resolving))?;
        partial.bdns_code = resolved.bdns_code.as_ref().map(ToString::to_string);
        partial.resolved_url = Some(resolved.url.to_string());

        // ── Steps 2-3: Fetch and extract ─────────────────────────────────────
        let primary = self.acquire(&resolved, tracer, partial).await?;
        let source_url = primary.document.url.to_string();
        let document_kind = primary.document.kind;
        partial.document_kind = Some(document_kind);
        partial.extracted_chars = Some(primary.text.char_count());

        // ── Step 3b: Announcement record and linked documents ────────────────
        let (material, linked_documents) = self.gather(&resolved, primary, tracer).await;
        let extracted_chars = material_chars(&material);
        partial.extracted_chars = Some(extracted_chars);

        // ── Step 4: Build prompt ─────────────────────────────────────────────
        let max_prompt_chars = self.config.max_prompt_chars;
        let prompt = tracer
            .run(Stage::Prompting, 1, async {
                Ok(build_prompt(&material, max_prompt_chars))
            })
            .await
            .map_err(at(Stage::Prompting))?;
        partial.prompt_chars = Some(prompt.char_count());
        if prompt.truncated {
            warn!(
                "Source text truncated: {} of {} chars sent",
                max_prompt_chars, prompt.source_chars
            );
        }

        // ── Step 5: Invoke model ─────────────────────────────────────────────
        let settings = CompletionSettings::from_config(&self.config);
        partial.model_used = Some(self.models.primary.model_name().to_string());
        let invocation = match invoke_with_fallback(&self.models, &prompt, &settings, tracer).await
        {
            Ok(invocation) => invocation,
            Err(error) => {
                if error.is_retryable() {
                    partial.model_used = Some(self.models.retry_model().model_name().to_string());
                }
                return Err(at(Stage::InvokingLlm)(error));
            }
        };
        partial.model_used = Some(invocation.reply.model.clone());
        partial.raw_response = Some(invocation.reply.content.clone());

        // ── Step 6: Validate ─────────────────────────────────────────────────
        let content = invocation.reply.content.as_str();
        let record = tracer
            .run(Stage::Validating, 1, async { validate::validate(content) })
            .await
            .map_err(at(Stage::Validating))?;

        let missing_fields = record
            .missing_fields()
            .into_iter()
            .map(str::to_string)
            .collect();

        Ok(AnalysisOutput {
            record,
            metadata: AnalysisMetadata {
                bdns_code: partial.bdns_code.clone(),
                source_url,
                document_kind,
                extracted_chars,
                truncated: prompt.truncated,
                linked_documents,
                model_used: invocation.reply.model,
                used_fallback_model: invocation.used_fallback,
                input_tokens: invocation.reply.input_tokens,
                output_tokens: invocation.reply.output_tokens,
                missing_fields,
                analysis_date,
                total_duration_ms: 0,
                steps: Vec::new(),
            },
        })
    }

    /// Fetch and extract the primary document, with one fallback attempt
    /// for each kind of failure.
    async fn acquire(
        &self,
        resolved: &ResolvedSource,
        tracer: &StepTracer,
        partial: &mut PartialData,
    ) -> Result<Acquired, StageFailure> {
        let (document, fetched_from) = self
            .fetch_with_retry(&resolved.url, resolved.alternate.as_ref(), tracer)
            .await
            .map_err(at(Stage::Fetching))?;
        partial.resolved_url = Some(document.url.to_string());
        partial.document_kind = Some(document.kind);

        let error = match tracer
            .run(Stage::Extracting, 1, extract_blocking(document))
            .await
        {
            Ok(acquired) => return Ok(acquired),
            Err(error) => error,
        };
        if !error.is_retryable() {
            return Err(at(Stage::Extracting)(error));
        }

        let fallback = match &resolved.alternate {
            Some(alternate) if *alternate != fetched_from => alternate,
            _ => &fetched_from,
        };
        tracer.retry(Stage::Extracting, format!("re-fetch of {fallback}"));

        let document = tracer
            .run(Stage::Fetching, 2, self.fetcher.fetch(fallback))
            .await
            .map_err(at(Stage::Fetching))?;
        partial.resolved_url = Some(document.url.to_string());
        partial.document_kind = Some(document.kind);

        tracer
            .run(Stage::Extracting, 2, extract_blocking(document))
            .await
            .map_err(at(Stage::Extracting))
    }

    /// GET `url`; on a retryable failure try once more, against `alternate`
    /// when given. Returns the document and the URL that produced it.
    async fn fetch_with_retry(
        &self,
        url: &Url,
        alternate: Option<&Url>,
        tracer: &StepTracer,
    ) -> Result<(RawDocument, Url), AnalysisError> {
        match tracer.run(Stage::Fetching, 1, self.fetcher.fetch(url)).await {
            Ok(document) => return Ok((document, url.clone())),
            Err(error) if !error.is_retryable() => return Err(error),
            Err(_) => {}
        }

        let target = alternate.unwrap_or(url);
        let detail = match alternate {
            Some(alternate) => format!("alternate URL {alternate}"),
            None => "same URL".to_string(),
        };
        tracer.retry(Stage::Fetching, detail);

        let document = tracer
            .run(Stage::Fetching, 2, self.fetcher.fetch(target))
            .await?;
        Ok((document, target.clone()))
    }

    /// Assemble the prompt material: the primary text plus, when a BDNS code
    /// is known, the API record and the PDFs it lists. Nothing here is fatal.
    async fn gather(
        &self,
        resolved: &ResolvedSource,
        primary: Acquired,
        tracer: &StepTracer,
    ) -> (SourceMaterial, Vec<LinkedDocument>) {
        let mut material = SourceMaterial::default();
        let mut record: Option<Value> = None;
        let primary_url = primary.document.url.clone();

        if primary.document.kind == DocumentKind::Json {
            record = serde_json::from_slice(&primary.document.bytes).ok();
            material.announcement_data = Some(primary.text.text);
        } else {
            material.documents.push(DocumentText {
                name: primary.document.display_name(),
                text: primary.text.text,
            });
        }

        let Some(code) = resolved
            .bdns_code
            .as_ref()
            .filter(|_| self.config.follow_linked_documents)
        else {
            return (material, Vec::new());
        };

        if record.is_none() {
            match code.api_url() {
                Ok(api_url) => {
                    if let Some((value, text)) = self.fetch_record(&api_url, tracer).await {
                        record = Some(value);
                        material.announcement_data = Some(text);
                    }
                }
                Err(e) => debug!("No API URL for {}: {}", code, e),
            }
        }

        let Some(record) = record else {
            return (material, Vec::new());
        };

        let mut linked = bdns::linked_documents(&record, code);
        linked.retain(|doc| doc.url != primary_url && doc.url != resolved.url);
        if linked.len() > self.config.max_linked_documents {
            info!(
                "Reading the first {} of {} linked documents",
                self.config.max_linked_documents,
                linked.len()
            );
            linked.truncate(self.config.max_linked_documents);
        }

        let fetched: Vec<(LinkedDocument, Result<Acquired, AnalysisError>)> = stream::iter(linked)
            .map(|doc| async move {
                let result = match self.fetch_with_retry(&doc.url, None, tracer).await {
                    Ok((document, _)) => {
                        tracer
                            .run(Stage::Extracting, 1, extract_blocking(document))
                            .await
                    }
                    Err(e) => Err(e),
                };
                (doc, result)
            })
            .buffered(LINKED_FETCH_CONCURRENCY)
            .collect()
            .await;

        let mut used = Vec::with_capacity(fetched.len());
        for (doc, result) in fetched {
            match result {
                Ok(acquired) => {
                    material.documents.push(DocumentText {
                        name: doc.name.clone(),
                        text: acquired.text.text,
                    });
                    used.push(doc);
                }
                Err(e) => debug!("Skipping linked document {}: {}", doc.name, e),
            }
        }

        info!("Read {} linked document(s)", used.len());
        (material, used)
    }

    /// Download the BDNS API record once. Returns the parsed value and its
    /// prompt text.
    async fn fetch_record(&self, api_url: &Url, tracer: &StepTracer) -> Option<(Value, String)> {
        let document = match tracer.run(Stage::Fetching, 1, self.fetcher.fetch(api_url)).await {
            Ok(document) => document,
            Err(e) => {
                debug!("Announcement record unavailable: {}", e);
                return None;
            }
        };
        let value: Value = match serde_json::from_slice(&document.bytes) {
            Ok(value) => value,
            Err(e) => {
                debug!("Announcement record is not JSON: {}", e);
                return None;
            }
        };
        match extract::extract_text(&document) {
            Ok(text) => Some((value, text.text)),
            Err(e) => {
                debug!("Announcement record has no text: {}", e);
                None
            }
        }
    }
}

async fn extract_blocking(document: RawDocument) -> Result<Acquired, AnalysisError> {
    let url = document.url.to_string();
    tokio::task::spawn_blocking(move || {
        let text = extract::extract_text(&document)?;
        Ok(Acquired { document, text })
    })
    .await
    .map_err(|e| extraction_aborted(url, e))?
}

/// A worker that panicked while decoding is an unreadable document.
fn extraction_aborted(url: String, err: tokio::task::JoinError) -> AnalysisError {
    AnalysisError::ExtractionAborted {
        url,
        detail: err.to_string(),
    }
}

fn material_chars(material: &SourceMaterial) -> usize {
    let data = material
        .announcement_data
        .as_deref()
        .map_or(0, |d| d.chars().count());
    data + material
        .documents
        .iter()
        .map(|d| d.text.chars().count())
        .sum::<usize>()
}

fn describe(request: &AnalysisRequest) -> String {
    match (&request.bdns_code, &request.source_url) {
        (Some(code), None) => format!("BDNS {code}"),
        (None, Some(url)) => url.clone(),
        _ => format!("{request:?}"),
    }
}

/// Failure for a run that could not start (bad configuration, missing key).
fn setup_failure(error: AnalysisError) -> AnalysisResult {
    warn!("Analysis could not start: {}", error);
    AnalysisResult::Failure(AnalysisFailure {
        kind: error.kind(),
        stage: Stage::Resolving,
        message: error.to_string(),
        partial: PartialData::default(),
        analysis_date: Utc::now(),
        total_duration_ms: 0,
        steps: Vec::new(),
    })
}

// ── Convenience entry points ─────────────────────────────────────────────────

/// Analyse one request with a production [`Analyzer`].
///
/// Setup errors (unbuildable HTTP client, unconfigured provider) are
/// reported as a failure at the `Resolving` stage with an empty step log.
pub async fn analyze(request: &AnalysisRequest, config: &AnalyzerConfig) -> AnalysisResult {
    match Analyzer::from_config(config.clone()) {
        Ok(analyzer) => analyzer.analyze(request).await,
        Err(e) => setup_failure(e),
    }
}

/// Synchronous wrapper around [`analyze`].
///
/// Creates a temporary tokio runtime internally.
pub fn analyze_sync(request: &AnalysisRequest, config: &AnalyzerConfig) -> AnalysisResult {
    match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime.block_on(analyze(request, config)),
        Err(e) => setup_failure(AnalysisError::Internal(format!(
            "Failed to create tokio runtime: {e}"
        ))),
    }
}

/// Analyse a request and write the result as pretty JSON.
///
/// Uses atomic write (temp file + rename) to prevent partial files. The
/// result is written and returned whether the run succeeded or not; `Err` is
/// only for the write itself.
pub async fn analyze_to_file(
    request: &AnalysisRequest,
    output_path: impl AsRef<Path>,
    config: &AnalyzerConfig,
) -> Result<AnalysisResult, AnalysisError> {
    let result = analyze(request, config).await;
    write_result(&result, output_path.as_ref()).await?;
    Ok(result)
}

/// Atomically write `result` to `path` as pretty JSON.
pub async fn write_result(result: &AnalysisResult, path: &Path) -> Result<(), AnalysisError> {
    let json = serde_json::to_string_pretty(result)
        .map_err(|e| AnalysisError::Internal(format!("Failed to serialise result: {e}")))?;

    let write_err = |source| AnalysisError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }

    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, json).await.map_err(write_err)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(write_err)?;

    debug!("Wrote result to {}", path.display());
    Ok(())
}
