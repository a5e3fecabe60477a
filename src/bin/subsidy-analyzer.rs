//! CLI binary for subsidy-analyzer.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `AnalyzerConfig` and prints results.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use subsidy_analyzer::schema::{MonetaryAmount, SubmissionWindow};
use subsidy_analyzer::{
    analyze, analyze_to_file, AnalysisProgressCallback, AnalysisRequest, AnalysisResult,
    AnalyzerConfig, ErrorKind, Extracted, ProgressCallback, Stage, StructuredRecord, NOT_FOUND,
};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: a spinner naming the running stage, plus one
/// log line per finished attempt.
struct CliProgressCallback {
    bar: ProgressBar,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}  {elapsed:.dim}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("Analysing");
        bar.set_message("Starting…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }
}

fn stage_label(stage: Stage) -> &'static str {
    match stage {
        Stage::Resolving => "Resolving source",
        Stage::Fetching => "Downloading",
        Stage::Extracting => "Extracting text",
        Stage::Prompting => "Building prompt",
        Stage::InvokingLlm => "Calling model",
        Stage::Validating => "Validating record",
        Stage::Done => "Done",
        Stage::Failed => "Failed",
    }
}

impl AnalysisProgressCallback for CliProgressCallback {
    fn on_stage_start(&self, stage: Stage) {
        self.bar.set_message(format!("{}…", stage_label(stage)));
    }

    fn on_stage_complete(&self, stage: Stage, elapsed_ms: u64) {
        self.bar.println(format!(
            "  {} {:<20} {}",
            green("✓"),
            stage_label(stage),
            dim(&format!("{:.1}s", elapsed_ms as f64 / 1000.0)),
        ));
    }

    fn on_stage_error(&self, stage: Stage, kind: ErrorKind, error: String) {
        // Keep the log to one line.
        let first_line = error.lines().next().unwrap_or_default();
        let msg = match first_line.char_indices().nth(90) {
            Some((idx, _)) => format!("{}…", &first_line[..idx]),
            None => first_line.to_string(),
        };
        self.bar.println(format!(
            "  {} {:<20} {} {}",
            red("✗"),
            stage_label(stage),
            dim(kind.as_str()),
            red(&msg),
        ));
    }

    fn on_retry(&self, stage: Stage, detail: String) {
        self.bar.println(format!(
            "  {} {:<20} {}",
            cyan("↻"),
            stage_label(stage),
            dim(&format!("retrying with {detail}")),
        ));
    }

    fn on_analysis_complete(&self, final_stage: Stage, total_ms: u64) {
        self.bar.finish_and_clear();
        let mark = if final_stage == Stage::Done {
            green("✔")
        } else {
            red("✘")
        };
        eprintln!(
            "{} Analysis {} in {:.1}s",
            mark,
            if final_stage == Stage::Done { "finished" } else { "failed" },
            total_ms as f64 / 1000.0
        );
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Analyse a BDNS announcement by code
  subsidy-analyzer --code 845133

  # Analyse a document URL and save the JSON result
  subsidy-analyzer --url https://www.boe.es/boe/dias/2024/03/15/pdfs/BOE-B-2024-1234.pdf -o result.json

  # Read the request from a file: {"bdns_code": "845133"} or {"source_url": "https://…"}
  subsidy-analyzer --input request.json --json

  # Larger primary model, no fallback, step tracing on
  FALLBACK_MODEL=none subsidy-analyzer --code 845133 --model gpt-4o --trace

OUTPUT SECTIONS:
  identificacion          organismo emisor, título, base reguladora
  detalles                beneficiarios, finalidad
  condiciones_economicas  presupuesto total, distribución territorial, cuantía por solicitud
  plazos_procedimiento    plazo de presentación y resolución, medio, enlace al trámite

  Fields the documents do not state are reported as "No especificado".

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key (default provider)
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  DEFAULT_MODEL           Primary model (default: gpt-4o-mini)
  FALLBACK_MODEL          Retry model (default: gpt-4o; "none" disables)
  SUBSIDY_LLM_PROVIDER    Provider (openai, anthropic, gemini, ollama, …)
  SUBSIDY_TRACING         Log every step at INFO
  SUBSIDY_PROJECT         Project name attached to step spans
  RUST_LOG                Log filter (overrides -v / -q)

EXIT STATUS:
  0  the record was extracted
  1  the analysis failed (the failure is still printed / written)
"#;

/// Extract structured data from Spanish public subsidy announcements.
#[derive(Parser, Debug)]
#[command(
    name = "subsidy-analyzer",
    version,
    about = "Extract structured data from Spanish public subsidy announcements (BDNS)",
    long_about = "Resolve a BDNS code or document URL, download the announcement, extract its \
text and let an LLM fill a fixed schema: issuing body, beneficiaries, budget, territorial \
distribution, deadlines and application channel.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP,
    group(clap::ArgGroup::new("source").required(true).args(["code", "url", "input"]))
)]
struct Cli {
    /// BDNS announcement code (e.g. 845133).
    #[arg(long)]
    code: Option<String>,

    /// Announcement or document URL (http/https).
    #[arg(long)]
    url: Option<String>,

    /// JSON request file: {"bdns_code": "…"} or {"source_url": "…"}.
    #[arg(long)]
    input: Option<PathBuf>,

    /// Write the JSON result to this file.
    #[arg(short, long, env = "SUBSIDY_OUTPUT")]
    output: Option<PathBuf>,

    /// Print the full JSON result to stdout instead of a summary.
    #[arg(long)]
    json: bool,

    /// Primary LLM model ID.
    #[arg(long, env = "DEFAULT_MODEL")]
    model: Option<String>,

    /// Model for the single retry after an LLM failure ("none" disables).
    #[arg(long, env = "FALLBACK_MODEL")]
    fallback_model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, …
    #[arg(long, env = "SUBSIDY_LLM_PROVIDER")]
    provider: Option<String>,

    /// LLM temperature (0.0–2.0). Default: 0.0.
    #[arg(long)]
    temperature: Option<f32>,

    /// Max LLM output tokens. Default: 4000.
    #[arg(long)]
    max_tokens: Option<usize>,

    /// Max source characters embedded in the prompt. Default: 120000.
    #[arg(long)]
    max_prompt_chars: Option<usize>,

    /// HTTP download timeout in seconds. Default: 60.
    #[arg(long)]
    download_timeout: Option<u64>,

    /// LLM call timeout in seconds. Default: 120.
    #[arg(long)]
    api_timeout: Option<u64>,

    /// Do not fetch the PDFs attached to the BDNS record.
    #[arg(long)]
    no_linked_documents: bool,

    /// Log every pipeline step at INFO level.
    #[arg(long, env = "SUBSIDY_TRACING")]
    trace: bool,

    /// Project name attached to step spans.
    #[arg(long, env = "SUBSIDY_PROJECT")]
    project: Option<String>,

    /// Disable the progress spinner.
    #[arg(long, env = "SUBSIDY_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long)]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The spinner replaces INFO logs unless step tracing was asked for.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || (show_progress && !cli.trace) {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Build request and config ─────────────────────────────────────────
    let request = build_request(&cli).await?;

    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn AnalysisProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress_cb)?;

    // ── Run analysis ─────────────────────────────────────────────────────
    let result = match cli.output {
        Some(ref output_path) => {
            let result = analyze_to_file(&request, output_path, &config)
                .await
                .context("Failed to write result")?;
            if !cli.quiet {
                eprintln!("   →  {}", bold(&output_path.display().to_string()));
            }
            result
        }
        None => analyze(&request, &config).await,
    };

    if cli.json {
        let json = serde_json::to_string_pretty(&result).context("Failed to serialise result")?;
        println!("{json}");
    } else if !cli.quiet {
        print_result(&result);
    }

    if !result.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

/// Map `--code` / `--url` / `--input` to a request.
async fn build_request(cli: &Cli) -> Result<AnalysisRequest> {
    if let Some(ref code) = cli.code {
        return Ok(AnalysisRequest::from_code(code.clone()));
    }
    if let Some(ref url) = cli.url {
        return Ok(AnalysisRequest::from_url(url.clone()));
    }
    let path = cli
        .input
        .as_ref()
        .context("One of --code, --url or --input is required")?;
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read request from {:?}", path))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid request JSON in {:?}", path))
}

/// Map CLI args to `AnalyzerConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<AnalyzerConfig> {
    let mut builder = AnalyzerConfig::builder()
        .follow_linked_documents(!cli.no_linked_documents)
        .tracing(cli.trace);

    if let Some(ref model) = cli.model {
        builder = builder.model(model.clone());
    }
    if let Some(ref fallback) = cli.fallback_model {
        builder = if fallback.eq_ignore_ascii_case("none") {
            builder.no_fallback_model()
        } else {
            builder.fallback_model(fallback.clone())
        };
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider.clone());
    }
    if let Some(t) = cli.temperature {
        builder = builder.temperature(t);
    }
    if let Some(n) = cli.max_tokens {
        builder = builder.max_tokens(n);
    }
    if let Some(n) = cli.max_prompt_chars {
        builder = builder.max_prompt_chars(n);
    }
    if let Some(secs) = cli.download_timeout {
        builder = builder.download_timeout_secs(secs);
    }
    if let Some(secs) = cli.api_timeout {
        builder = builder.api_timeout_secs(secs);
    }
    if let Some(ref project) = cli.project {
        builder = builder.tracing_project(project.clone());
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

// ── Human-readable output ────────────────────────────────────────────────────

fn print_result(result: &AnalysisResult) {
    match result {
        AnalysisResult::Success(output) => {
            print_record(&output.record);
            let meta = &output.metadata;
            println!();
            println!(
                "{}",
                dim(&format!(
                    "Fuente: {} ({}, {} caracteres{})",
                    meta.source_url,
                    meta.document_kind,
                    meta.extracted_chars,
                    if meta.truncated { ", truncado" } else { "" }
                ))
            );
            println!(
                "{}",
                dim(&format!(
                    "Modelo: {}{}  ·  {} tokens in / {} tokens out  ·  {}ms",
                    meta.model_used,
                    if meta.used_fallback_model { " (fallback)" } else { "" },
                    meta.input_tokens,
                    meta.output_tokens,
                    meta.total_duration_ms
                ))
            );
            if !meta.missing_fields.is_empty() {
                println!(
                    "{}",
                    dim(&format!("Sin datos: {}", meta.missing_fields.join(", ")))
                );
            }
        }
        AnalysisResult::Failure(failure) => {
            eprintln!(
                "{} {} during {}: {}",
                red("✘"),
                bold(failure.kind.as_str()),
                failure.stage,
                failure.message
            );
            if let Some(ref url) = failure.partial.resolved_url {
                eprintln!("   {}", dim(&format!("URL: {url}")));
            }
        }
    }
}

fn print_record(record: &StructuredRecord) {
    let id = &record.identificacion;
    section("IDENTIFICACIÓN");
    field("Organismo emisor", show(&id.organismo_emisor, String::clone));
    field("Título", show(&id.titulo_convocatoria, String::clone));
    field("Base reguladora", show(&id.base_reguladora, String::clone));

    let det = &record.detalles;
    section("DETALLES");
    field("Beneficiarios", show(&det.beneficiarios, |b| b.join("; ")));
    field("Finalidad", show(&det.finalidad_ayuda, String::clone));

    let eco = &record.condiciones_economicas;
    section("CONDICIONES ECONÓMICAS");
    field("Presupuesto total", show(&eco.presupuesto_total, amount));
    field(
        "Distribución territorial",
        show(&eco.distribucion_territorial, |map| {
            map.iter()
                .map(|(territory, a)| format!("{territory}: {}", amount(a)))
                .collect::<Vec<_>>()
                .join("; ")
        }),
    );
    field("Cuantía por solicitud", show(&eco.cuantia_por_solicitud, amount));

    let plz = &record.plazos_procedimiento;
    section("PLAZOS Y PROCEDIMIENTO");
    field("Plazo de presentación", show(&plz.plazo_presentacion, window));
    field("Plazo de resolución", show(&plz.plazo_resolucion, String::clone));
    field("Medio de presentación", show(&plz.medio_presentacion, String::clone));
    field("Enlace al trámite", show(&plz.enlace_tramite, String::clone));
}

fn section(title: &str) {
    println!();
    println!("{}", cyan(&bold(title)));
}

fn field(label: &str, value: String) {
    println!("  {:<26} {}", format!("{label}:"), value);
}

fn show<T>(value: &Extracted<T>, render: impl Fn(&T) -> String) -> String {
    match value.found() {
        Some(v) => render(v),
        None => dim(NOT_FOUND),
    }
}

fn amount(a: &MonetaryAmount) -> String {
    match a.value {
        Some(v) if a.text.is_empty() => v.to_string(),
        _ => a.text.clone(),
    }
}

fn window(w: &SubmissionWindow) -> String {
    match (w.start, w.end) {
        (Some(start), Some(end)) => format!("{}  {}", w.text, dim(&format!("[{start} → {end}]"))),
        (None, Some(end)) => format!("{}  {}", w.text, dim(&format!("[→ {end}]"))),
        (Some(start), None) => format!("{}  {}", w.text, dim(&format!("[{start} →]"))),
        (None, None) => w.text.clone(),
    }
}
