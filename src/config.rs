//! Configuration types for subsidy analysis.
//!
//! All run behaviour is controlled through [`AnalyzerConfig`], built via its
//! [`AnalyzerConfigBuilder`] or read from the environment with
//! [`AnalyzerConfig::from_env`]. One struct holds every knob so a run can be
//! logged, diffed, and reproduced.

use crate::error::AnalysisError;
use crate::progress::ProgressCallback;
use std::fmt;

/// Default primary model.
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Default model used for the single LLM retry.
pub const DEFAULT_FALLBACK_MODEL: &str = "gpt-4o";

/// Default LLM provider name passed to `edgequake_llm::ProviderFactory`.
pub const DEFAULT_PROVIDER: &str = "openai";

/// Configuration for one analysis run.
///
/// # Example
/// ```rust
/// use subsidy_analyzer::AnalyzerConfig;
///
/// let config = AnalyzerConfig::builder()
///     .model("gpt-4o-mini")
///     .fallback_model("gpt-4o")
///     .max_prompt_chars(60_000)
///     .build()
///     .unwrap();
/// assert_eq!(config.temperature, 0.0);
/// ```
#[derive(Clone)]
pub struct AnalyzerConfig {
    /// Primary LLM model identifier. Default: `gpt-4o-mini`.
    pub model: String,

    /// Model used for the one retry after an LLM failure. Default: `gpt-4o`.
    ///
    /// `None` retries with the primary model.
    pub fallback_model: Option<String>,

    /// Provider name understood by `edgequake_llm::ProviderFactory`
    /// (`openai`, `anthropic`, `gemini`, `ollama`, …). Default: `openai`.
    pub provider_name: String,

    /// Sampling temperature. Default: 0.0 so identical inputs give identical records.
    pub temperature: f32,

    /// Maximum tokens the model may generate. Default: 4000.
    pub max_tokens: usize,

    /// Upper bound on source characters embedded in the prompt. Default: 120 000.
    ///
    /// Longer material is cut on a character boundary and the run metadata
    /// reports `truncated = true`.
    pub max_prompt_chars: usize,

    /// Per-request HTTP timeout in seconds. Default: 60.
    pub download_timeout_secs: u64,

    /// Per-LLM-call timeout in seconds. Default: 120.
    pub api_timeout_secs: u64,

    /// Redirects followed before the fetch fails. Default: 10.
    pub max_redirects: usize,

    /// Fetch PDFs listed in a BDNS API record. Default: true.
    pub follow_linked_documents: bool,

    /// Cap on linked PDFs fetched per run. Default: 10.
    pub max_linked_documents: usize,

    /// Emit step spans and events at INFO instead of DEBUG. Default: false.
    pub tracing_enabled: bool,

    /// Project name attached to every step span.
    pub tracing_project: Option<String>,

    /// Optional per-stage progress callback.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            fallback_model: Some(DEFAULT_FALLBACK_MODEL.to_string()),
            provider_name: DEFAULT_PROVIDER.to_string(),
            temperature: 0.0,
            max_tokens: 4000,
            max_prompt_chars: 120_000,
            download_timeout_secs: 60,
            api_timeout_secs: 120,
            max_redirects: 10,
            follow_linked_documents: true,
            max_linked_documents: 10,
            tracing_enabled: false,
            tracing_project: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for AnalyzerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalyzerConfig")
            .field("model", &self.model)
            .field("fallback_model", &self.fallback_model)
            .field("provider_name", &self.provider_name)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_prompt_chars", &self.max_prompt_chars)
            .field("download_timeout_secs", &self.download_timeout_secs)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("follow_linked_documents", &self.follow_linked_documents)
            .field("tracing_enabled", &self.tracing_enabled)
            .field("tracing_project", &self.tracing_project)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn AnalysisProgressCallback>"),
            )
            .finish()
    }
}

impl AnalyzerConfig {
    /// Create a new builder for `AnalyzerConfig`.
    pub fn builder() -> AnalyzerConfigBuilder {
        AnalyzerConfigBuilder {
            config: Self::default(),
        }
    }

    /// Build a configuration from environment variables.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `DEFAULT_MODEL` | `model` |
    /// | `FALLBACK_MODEL` | `fallback_model` (`none` disables) |
    /// | `SUBSIDY_LLM_PROVIDER` | `provider_name` |
    /// | `SUBSIDY_TRACING` | `tracing_enabled` (`true`/`1`/`yes`) |
    /// | `SUBSIDY_PROJECT` | `tracing_project` |
    pub fn from_env() -> Result<Self, AnalysisError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AnalysisError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let mut builder = Self::builder();
        if let Some(model) = get("DEFAULT_MODEL") {
            builder = builder.model(model);
        }
        if let Some(fallback) = get("FALLBACK_MODEL") {
            builder = if fallback.eq_ignore_ascii_case("none") {
                builder.no_fallback_model()
            } else {
                builder.fallback_model(fallback)
            };
        }
        if let Some(provider) = get("SUBSIDY_LLM_PROVIDER") {
            builder = builder.provider_name(provider);
        }
        if let Some(flag) = get("SUBSIDY_TRACING") {
            builder = builder.tracing(parse_flag(&flag));
        }
        if let Some(project) = get("SUBSIDY_PROJECT") {
            builder = builder.tracing_project(project);
        }
        builder.build()
    }

    /// Environment variable holding the API key for the configured provider.
    ///
    /// `None` for providers that run locally without a key.
    pub fn api_key_var(&self) -> Option<&'static str> {
        match self.provider_name.to_ascii_lowercase().as_str() {
            "openai" => Some("OPENAI_API_KEY"),
            "anthropic" => Some("ANTHROPIC_API_KEY"),
            "gemini" | "google" => Some("GEMINI_API_KEY"),
            "mistral" => Some("MISTRAL_API_KEY"),
            "openrouter" => Some("OPENROUTER_API_KEY"),
            "azure" => Some("AZURE_OPENAI_API_KEY"),
            _ => None,
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Builder for [`AnalyzerConfig`].
#[derive(Debug)]
pub struct AnalyzerConfigBuilder {
    config: AnalyzerConfig,
}

impl AnalyzerConfigBuilder {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn fallback_model(mut self, model: impl Into<String>) -> Self {
        self.config.fallback_model = Some(model.into());
        self
    }

    pub fn no_fallback_model(mut self) -> Self {
        self.config.fallback_model = None;
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = name.into();
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t;
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_prompt_chars(mut self, n: usize) -> Self {
        self.config.max_prompt_chars = n;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn max_redirects(mut self, n: usize) -> Self {
        self.config.max_redirects = n;
        self
    }

    pub fn follow_linked_documents(mut self, v: bool) -> Self {
        self.config.follow_linked_documents = v;
        self
    }

    pub fn max_linked_documents(mut self, n: usize) -> Self {
        self.config.max_linked_documents = n;
        self
    }

    pub fn tracing(mut self, enabled: bool) -> Self {
        self.config.tracing_enabled = enabled;
        self
    }

    pub fn tracing_project(mut self, project: impl Into<String>) -> Self {
        self.config.tracing_project = Some(project.into());
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<AnalyzerConfig, AnalysisError> {
        let c = &self.config;
        if c.model.trim().is_empty() {
            return Err(AnalysisError::InvalidConfig("model must not be empty".into()));
        }
        if !(0.0..=2.0).contains(&c.temperature) {
            return Err(AnalysisError::InvalidConfig(format!(
                "temperature must be 0.0–2.0, got {}",
                c.temperature
            )));
        }
        if c.max_tokens == 0 {
            return Err(AnalysisError::InvalidConfig("max_tokens must be ≥ 1".into()));
        }
        if c.max_prompt_chars < 1_000 {
            return Err(AnalysisError::InvalidConfig(format!(
                "max_prompt_chars must be ≥ 1000, got {}",
                c.max_prompt_chars
            )));
        }
        if c.download_timeout_secs == 0 || c.api_timeout_secs == 0 {
            return Err(AnalysisError::InvalidConfig("timeouts must be ≥ 1s".into()));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_deterministic() {
        let config = AnalyzerConfig::default();
        assert_eq!(config.model, "gpt-4o-mini");
        assert_eq!(config.fallback_model.as_deref(), Some("gpt-4o"));
        assert_eq!(config.temperature, 0.0);
        assert!(config.follow_linked_documents);
    }

    #[test]
    fn build_rejects_out_of_range_temperature() {
        let err = AnalyzerConfig::builder().temperature(3.5).build().unwrap_err();
        assert!(err.to_string().contains("temperature"));
    }

    #[test]
    fn build_rejects_zero_timeout() {
        assert!(AnalyzerConfig::builder()
            .download_timeout_secs(0)
            .build()
            .is_err());
    }

    #[test]
    fn from_lookup_reads_models_and_tracing() {
        let env: HashMap<&str, &str> = [
            ("DEFAULT_MODEL", "gpt-4.1-mini"),
            ("FALLBACK_MODEL", "none"),
            ("SUBSIDY_TRACING", "TRUE"),
            ("SUBSIDY_PROJECT", "bdns-eval"),
        ]
        .into_iter()
        .collect();

        let config =
            AnalyzerConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.model, "gpt-4.1-mini");
        assert_eq!(config.fallback_model, None);
        assert!(config.tracing_enabled);
        assert_eq!(config.tracing_project.as_deref(), Some("bdns-eval"));
    }

    #[test]
    fn blank_env_values_are_ignored() {
        let config = AnalyzerConfig::from_lookup(|k| {
            (k == "DEFAULT_MODEL").then(|| "   ".to_string())
        })
        .unwrap();
        assert_eq!(config.model, DEFAULT_MODEL);
    }

    #[test]
    fn api_key_var_per_provider() {
        let mut config = AnalyzerConfig::default();
        assert_eq!(config.api_key_var(), Some("OPENAI_API_KEY"));
        config.provider_name = "ollama".into();
        assert_eq!(config.api_key_var(), None);
    }
}
