//! LLM interaction: send the extraction prompt and collect the reply.
//!
//! [`ChatModel`] is the seam between the orchestrator and a hosted model. The
//! production implementation, [`ProviderModel`], wraps an
//! `edgequake_llm::LLMProvider` and bounds every call with the configured
//! timeout. Tests drive the orchestrator with scripted models instead.
//!
//! ## Retry Strategy
//!
//! One attempt with the primary model, then exactly one retry with the
//! fallback model (or the primary again when no fallback is configured). A
//! larger model is the usual cure for the failures that survive a first
//! attempt: malformed tool output, context overflow, provider hiccups.

use crate::config::AnalyzerConfig;
use crate::error::AnalysisError;
use crate::pipeline::Stage;
use crate::prompts::BuiltPrompt;
use crate::trace::StepTracer;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, LlmError, ProviderFactory};
use std::sync::Arc;
use tokio::time::{timeout, Duration};
use tracing::debug;

/// Sampling and budget settings for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionSettings {
    pub temperature: f32,
    pub max_tokens: usize,
    pub timeout_secs: u64,
}

impl CompletionSettings {
    pub fn from_config(config: &AnalyzerConfig) -> Self {
        Self {
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout_secs: config.api_timeout_secs,
        }
    }

    fn to_options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        }
    }
}

/// Raw model output plus usage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelReply {
    pub content: String,
    pub model: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

/// A chat model that answers one system + user exchange.
#[async_trait]
pub trait ChatModel: Send + Sync {
    fn model_name(&self) -> &str;

    async fn complete(
        &self,
        system: &str,
        user: &str,
        settings: &CompletionSettings,
    ) -> Result<ModelReply, AnalysisError>;
}

/// [`ChatModel`] backed by an `edgequake_llm` provider.
pub struct ProviderModel {
    provider: Arc<dyn LLMProvider>,
    model: String,
}

impl ProviderModel {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }
}

#[async_trait]
impl ChatModel for ProviderModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        system: &str,
        user: &str,
        settings: &CompletionSettings,
    ) -> Result<ModelReply, AnalysisError> {
        let messages = vec![ChatMessage::system(system), ChatMessage::user(user)];
        let options = settings.to_options();

        let call = self.provider.chat(&messages, Some(&options));
        let response = match timeout(Duration::from_secs(settings.timeout_secs), call).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                return Err(classify_provider_error(&self.model, e, settings.timeout_secs))
            }
            Err(_) => {
                return Err(AnalysisError::LlmTimeout {
                    model: self.model.clone(),
                    secs: settings.timeout_secs,
                })
            }
        };

        if response.content.trim().is_empty() {
            return Err(AnalysisError::EmptyResponse {
                model: self.model.clone(),
            });
        }

        debug!(
            "{}: {} input tokens, {} output tokens",
            self.model, response.prompt_tokens, response.completion_tokens
        );

        Ok(ModelReply {
            content: response.content,
            model: self.model.clone(),
            input_tokens: response.prompt_tokens,
            output_tokens: response.completion_tokens,
        })
    }
}

/// Map a provider error onto the LLM error variants.
pub fn classify_provider_error(model: &str, err: LlmError, timeout_secs: u64) -> AnalysisError {
    match err {
        LlmError::RateLimited(_) => AnalysisError::RateLimitExceeded {
            model: model.to_string(),
        },
        LlmError::Timeout => AnalysisError::LlmTimeout {
            model: model.to_string(),
            secs: timeout_secs,
        },
        other => AnalysisError::LlmApiError {
            model: model.to_string(),
            message: other.to_string(),
        },
    }
}

/// Create a provider-backed model for `model` using the configured provider.
///
/// Fails early with a configuration hint when the provider's API key is not
/// set, so a missing key is reported before any document is downloaded.
pub fn create_provider_model(
    config: &AnalyzerConfig,
    model: &str,
) -> Result<ProviderModel, AnalysisError> {
    if let Some(var) = config.api_key_var() {
        let present = std::env::var(var).is_ok_and(|v| !v.trim().is_empty());
        if !present {
            return Err(AnalysisError::ProviderNotConfigured {
                provider: config.provider_name.clone(),
                hint: format!("Set {var} or choose another provider with --provider."),
            });
        }
    }

    let provider =
        ProviderFactory::create_llm_provider(&config.provider_name, model).map_err(|e| {
            AnalysisError::ProviderNotConfigured {
                provider: config.provider_name.clone(),
                hint: format!("{e}"),
            }
        })?;
    Ok(ProviderModel::new(provider, model))
}

/// The primary model and the optional model used for the retry.
#[derive(Clone)]
pub struct ModelPair {
    pub primary: Arc<dyn ChatModel>,
    pub fallback: Option<Arc<dyn ChatModel>>,
}

impl ModelPair {
    pub fn new(primary: Arc<dyn ChatModel>, fallback: Option<Arc<dyn ChatModel>>) -> Self {
        Self { primary, fallback }
    }

    /// Build both models from configuration.
    pub fn from_config(config: &AnalyzerConfig) -> Result<Self, AnalysisError> {
        let primary: Arc<dyn ChatModel> = Arc::new(create_provider_model(config, &config.model)?);
        let fallback = match config.fallback_model.as_deref() {
            Some(name) if name != config.model => {
                Some(Arc::new(create_provider_model(config, name)?) as Arc<dyn ChatModel>)
            }
            _ => None,
        };
        Ok(Self { primary, fallback })
    }

    /// Model for the second attempt.
    pub fn retry_model(&self) -> &Arc<dyn ChatModel> {
        self.fallback.as_ref().unwrap_or(&self.primary)
    }
}

/// Reply from [`invoke_with_fallback`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub reply: ModelReply,
    pub used_fallback: bool,
}

/// Call the primary model; on failure retry once with the fallback model.
///
/// Each attempt is one `InvokingLlm` step in `tracer`.
pub async fn invoke_with_fallback(
    models: &ModelPair,
    prompt: &BuiltPrompt,
    settings: &CompletionSettings,
    tracer: &StepTracer,
) -> Result<Invocation, AnalysisError> {
    let first = tracer
        .run(
            Stage::InvokingLlm,
            1,
            models.primary.complete(&prompt.system, &prompt.user, settings),
        )
        .await;

    let first_err = match first {
        Ok(reply) => {
            return Ok(Invocation {
                reply,
                used_fallback: false,
            })
        }
        Err(e) => e,
    };
    if !first_err.is_retryable() {
        return Err(first_err);
    }

    let retry = models.retry_model();
    tracer.retry(
        Stage::InvokingLlm,
        format!("model {}", retry.model_name()),
    );

    let reply = tracer
        .run(
            Stage::InvokingLlm,
            2,
            retry.complete(&prompt.system, &prompt.user, settings),
        )
        .await?;
    Ok(Invocation {
        reply,
        used_fallback: models.fallback.is_some(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompts::{build_prompt, SourceMaterial};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedModel {
        name: String,
        replies: Mutex<VecDeque<Result<String, AnalysisError>>>,
        calls: Mutex<usize>,
    }

    impl ScriptedModel {
        fn new(name: &str, replies: Vec<Result<String, AnalysisError>>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        fn model_name(&self) -> &str {
            &self.name
        }

        async fn complete(
            &self,
            _system: &str,
            _user: &str,
            _settings: &CompletionSettings,
        ) -> Result<ModelReply, AnalysisError> {
            *self.calls.lock().unwrap() += 1;
            let next = self.replies.lock().unwrap().pop_front();
            match next {
                Some(Ok(content)) => Ok(ModelReply {
                    content,
                    model: self.name.clone(),
                    input_tokens: 10,
                    output_tokens: 5,
                }),
                Some(Err(e)) => Err(e),
                None => Err(AnalysisError::EmptyResponse {
                    model: self.name.clone(),
                }),
            }
        }
    }

    fn api_error(model: &str) -> AnalysisError {
        AnalysisError::LlmApiError {
            model: model.into(),
            message: "503 Service Unavailable".into(),
        }
    }

    fn setup() -> (BuiltPrompt, CompletionSettings, StepTracer) {
        let config = AnalyzerConfig::default();
        (
            build_prompt(&SourceMaterial::default(), 10_000),
            CompletionSettings::from_config(&config),
            StepTracer::new(&config),
        )
    }

    #[test]
    fn settings_follow_config() {
        let settings = CompletionSettings::from_config(&AnalyzerConfig::default());
        assert_eq!(settings.temperature, 0.0);
        assert_eq!(settings.max_tokens, 4000);
        let opts = settings.to_options();
        assert_eq!(opts.temperature, Some(0.0));
        assert_eq!(opts.max_tokens, Some(4000));
    }

    #[test]
    fn provider_errors_map_by_variant() {
        let limited = LlmError::RateLimited("slow down".into());
        let e = classify_provider_error("gpt-4o-mini", limited, 120);
        assert!(matches!(e, AnalysisError::RateLimitExceeded { .. }));

        let e = classify_provider_error("gpt-4o-mini", LlmError::Timeout, 120);
        assert!(matches!(e, AnalysisError::LlmTimeout { secs: 120, .. }));

        // Message text never decides the class.
        let e = classify_provider_error(
            "gpt-4o-mini",
            LlmError::ApiError("quota 429 of 1000 used; request timeout exceeded".into()),
            120,
        );
        assert!(matches!(e, AnalysisError::LlmApiError { .. }), "{e:?}");
    }

    #[tokio::test]
    async fn first_success_uses_primary_only() {
        let primary = ScriptedModel::new("small", vec![Ok("{}".into())]);
        let fallback = ScriptedModel::new("large", vec![]);
        let models = ModelPair::new(primary.clone(), Some(fallback.clone()));
        let (prompt, settings, tracer) = setup();

        let inv = invoke_with_fallback(&models, &prompt, &settings, &tracer)
            .await
            .unwrap();
        assert!(!inv.used_fallback);
        assert_eq!(inv.reply.model, "small");
        assert_eq!(fallback.calls(), 0);
    }

    #[tokio::test]
    async fn failure_retries_once_with_fallback() {
        let primary = ScriptedModel::new("small", vec![Err(api_error("small"))]);
        let fallback = ScriptedModel::new("large", vec![Ok("{}".into())]);
        let models = ModelPair::new(primary.clone(), Some(fallback.clone()));
        let (prompt, settings, tracer) = setup();

        let inv = invoke_with_fallback(&models, &prompt, &settings, &tracer)
            .await
            .unwrap();
        assert!(inv.used_fallback);
        assert_eq!(inv.reply.model, "large");
        assert_eq!((primary.calls(), fallback.calls()), (1, 1));
    }

    #[tokio::test]
    async fn without_fallback_primary_is_retried_once() {
        let primary = ScriptedModel::new("small", vec![Err(api_error("small")), Err(api_error("small"))]);
        let models = ModelPair::new(primary.clone(), None);
        let (prompt, settings, tracer) = setup();

        let err = invoke_with_fallback(&models, &prompt, &settings, &tracer)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Llm);
        assert_eq!(primary.calls(), 2);
        let (steps, _) = tracer.finish(Stage::Failed);
        assert_eq!(steps.len(), 2);
    }
}
