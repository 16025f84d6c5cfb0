//! Provider adapter abstraction and implementations.
//!
//! Provides the [`ProviderAdapter`] trait and implementations:
//! - [`StaticProvider`]: testing/demo adapter with canned responses
//! - [`OpenAiAdapter`]: OpenAI chat completions (structured-output specialist)
//! - [`GeminiAdapter`]: Google Gemini (long-context specialist)
//!
//! Providers are a closed set: the routing rules enumerate the known
//! targets explicitly, so [`ProviderId`] is a two-variant enum rather than
//! an open plugin registry.
//!
//! ## Environment Variables
//!
//! - `OPENAI_API_KEY`: required for [`OpenAiAdapter`]
//! - `GOOGLE_API_KEY`: required for [`GeminiAdapter`]

use crate::GatewayError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Identity of an upstream model provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderId {
    /// OpenAI, the structured-output specialist.
    OpenAi,
    /// Google Gemini, the long-context specialist.
    Gemini,
}

impl ProviderId {
    /// Stable lowercase name, used in logs, metrics labels, and audit
    /// payloads.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Gemini => "gemini",
        }
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized request to any provider.
///
/// The tuple `(provider id, prompt, strict_json, max_tokens, temperature)`
/// fully determines the cache fingerprint of a governed call.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderRequest {
    /// Prompt text sent to the model.
    pub prompt: String,
    /// Whether the provider must be asked for strictly structured JSON.
    pub strict_json: bool,
    /// Maximum tokens to generate.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
}

impl ProviderRequest {
    /// Create a request with default generation parameters.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            strict_json: false,
            max_tokens: 1024,
            temperature: 0.2,
        }
    }

    /// Build a request from a task's description and output requirements.
    pub fn from_task(task: &crate::task::Task) -> Self {
        Self::new(task.description.clone()).with_strict_json(task.requires_strict_json)
    }

    /// Require strictly structured JSON output.
    pub fn with_strict_json(mut self, strict: bool) -> Self {
        self.strict_json = strict;
        self
    }

    /// Set the maximum tokens to generate.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Normalized outcome of one provider call.
///
/// Produced by adapters, consumed by the governor and the ensemble arbiter.
/// Never mutated after creation. Transport and provider errors are carried
/// here with `success = false`; they are a different failure class from
/// governance rejections, which never reach the provider at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResult {
    /// Which provider served (or failed to serve) the call.
    pub provider: ProviderId,
    /// Concrete model name reported by the provider.
    pub model: String,
    /// Whether the call completed successfully.
    pub success: bool,
    /// Response content (empty on failure).
    pub content: String,
    /// Prompt tokens consumed.
    pub input_tokens: u64,
    /// Completion tokens produced.
    pub output_tokens: u64,
    /// Cost of the call in USD, computed from token counts.
    pub cost: f64,
    /// Round-trip latency in milliseconds.
    pub latency_ms: u64,
    /// Error description when `success` is false.
    pub error: Option<String>,
}

impl ProviderResult {
    /// Build a failed result with zeroed usage.
    pub fn failure(provider: ProviderId, model: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            success: false,
            content: String::new(),
            input_tokens: 0,
            output_tokens: 0,
            cost: 0.0,
            latency_ms: 0,
            error: Some(error.into()),
        }
    }
}

/// Trait for upstream model providers.
///
/// Implementations must be thread-safe (`Send + Sync`); the trait is
/// object-safe for dynamic dispatch via `Arc<dyn ProviderAdapter>`.
///
/// `invoke` is infallible at the type level: transport and provider errors
/// come back as a [`ProviderResult`] with `success = false`, keeping the
/// provider-failure class distinct from governance failures.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// The provider this adapter speaks for.
    fn id(&self) -> ProviderId;

    /// Perform one call and normalize the outcome.
    async fn invoke(&self, request: &ProviderRequest) -> ProviderResult;
}

/// The closed set of provider adapters the gateway dispatches to.
#[derive(Clone)]
pub struct ProviderSet {
    openai: Arc<dyn ProviderAdapter>,
    gemini: Arc<dyn ProviderAdapter>,
}

impl ProviderSet {
    /// Build the set from one adapter per provider.
    pub fn new(openai: Arc<dyn ProviderAdapter>, gemini: Arc<dyn ProviderAdapter>) -> Self {
        Self { openai, gemini }
    }

    /// Look up the adapter for a provider.
    pub fn get(&self, id: ProviderId) -> &Arc<dyn ProviderAdapter> {
        match id {
            ProviderId::OpenAi => &self.openai,
            ProviderId::Gemini => &self.gemini,
        }
    }
}

impl std::fmt::Debug for ProviderSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSet")
            .field("openai", &self.openai.id())
            .field("gemini", &self.gemini.id())
            .finish()
    }
}

// ============================================================================
// Static Provider (testing / demos)
// ============================================================================

/// Canned-response adapter for tests and demos.
///
/// Returns a configurable content string with a simulated latency, or a
/// configured failure. Token counts are derived from the prompt and content
/// lengths so downstream accounting stays plausible.
pub struct StaticProvider {
    id: ProviderId,
    model: String,
    content: String,
    cost: f64,
    delay: Duration,
    fail_with: Option<String>,
}

impl StaticProvider {
    /// Create an adapter that answers for `id` with an empty response.
    pub fn new(id: ProviderId) -> Self {
        Self {
            id,
            model: format!("{id}-static"),
            content: String::new(),
            cost: 0.001,
            delay: Duration::ZERO,
            fail_with: None,
        }
    }

    /// Set the canned response content.
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    /// Set the reported per-call cost.
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    /// Set a simulated inference delay.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Make every call fail with the given error.
    pub fn failing(mut self, error: impl Into<String>) -> Self {
        self.fail_with = Some(error.into());
        self
    }
}

#[async_trait]
impl ProviderAdapter for StaticProvider {
    fn id(&self) -> ProviderId {
        self.id
    }

    async fn invoke(&self, request: &ProviderRequest) -> ProviderResult {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if let Some(error) = &self.fail_with {
            return ProviderResult::failure(self.id, self.model.clone(), error.clone());
        }

        ProviderResult {
            provider: self.id,
            model: self.model.clone(),
            success: true,
            content: self.content.clone(),
            input_tokens: request.prompt.split_whitespace().count() as u64,
            output_tokens: self.content.split_whitespace().count() as u64,
            cost: self.cost,
            latency_ms: self.delay.as_millis() as u64,
            error: None,
        }
    }
}

// ============================================================================
// OpenAI Adapter
// ============================================================================

#[derive(Debug, Serialize)]
struct OpenAiMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

/// OpenAI chat-completions adapter.
///
/// Requires the `OPENAI_API_KEY` environment variable; misconfiguration
/// surfaces at construction, not at the first call.
pub struct OpenAiAdapter {
    client: reqwest::Client,
    api_key: String,
    model: String,
    input_rate_per_1k: f64,
    output_rate_per_1k: f64,
    timeout: Duration,
}

impl OpenAiAdapter {
    /// Create an adapter for the given model.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] if `OPENAI_API_KEY` is not set.
    pub fn new(model: impl Into<String>) -> Result<Self, GatewayError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| GatewayError::Config("OPENAI_API_KEY not set".to_string()))?;

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model: model.into(),
            input_rate_per_1k: 0.000_15,
            output_rate_per_1k: 0.000_6,
            timeout: Duration::from_secs(30),
        })
    }

    /// Set the per-1k-token pricing used for cost reporting.
    pub fn with_rates(mut self, input_per_1k: f64, output_per_1k: f64) -> Self {
        self.input_rate_per_1k = input_per_1k;
        self.output_rate_per_1k = output_per_1k;
        self
    }

    /// Set the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::OpenAi
    }

    async fn invoke(&self, request: &ProviderRequest) -> ProviderResult {
        let body = OpenAiRequest {
            model: self.model.clone(),
            messages: vec![OpenAiMessage {
                role: "user",
                content: request.prompt.clone(),
            }],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            response_format: request
                .strict_json
                .then(|| serde_json::json!({ "type": "json_object" })),
        };

        let start = Instant::now();
        let response = match self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                return ProviderResult::failure(
                    ProviderId::OpenAi,
                    self.model.clone(),
                    format!("OpenAI request failed: {e}"),
                )
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return ProviderResult::failure(
                ProviderId::OpenAi,
                self.model.clone(),
                format!("OpenAI API error {status}: {detail}"),
            );
        }

        let latency_ms = start.elapsed().as_millis() as u64;
        let parsed: OpenAiResponse = match response.json().await {
            Ok(p) => p,
            Err(e) => {
                return ProviderResult::failure(
                    ProviderId::OpenAi,
                    self.model.clone(),
                    format!("OpenAI response parsing failed: {e}"),
                )
            }
        };

        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();
        let (input_tokens, output_tokens) = parsed
            .usage
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or((0, 0));

        ProviderResult {
            provider: ProviderId::OpenAi,
            model: self.model.clone(),
            success: true,
            content,
            input_tokens,
            output_tokens,
            cost: token_cost(input_tokens, self.input_rate_per_1k)
                + token_cost(output_tokens, self.output_rate_per_1k),
            latency_ms,
            error: None,
        }
    }
}

// ============================================================================
// Gemini Adapter
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

/// Google Gemini adapter.
///
/// Requires the `GOOGLE_API_KEY` environment variable.
pub struct GeminiAdapter {
    client: reqwest::Client,
    api_key: String,
    model: String,
    input_rate_per_1k: f64,
    output_rate_per_1k: f64,
    timeout: Duration,
}

impl GeminiAdapter {
    /// Create an adapter for the given model.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] if `GOOGLE_API_KEY` is not set.
    pub fn new(model: impl Into<String>) -> Result<Self, GatewayError> {
        let api_key = std::env::var("GOOGLE_API_KEY")
            .map_err(|_| GatewayError::Config("GOOGLE_API_KEY not set".to_string()))?;

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model: model.into(),
            input_rate_per_1k: 0.000_075,
            output_rate_per_1k: 0.000_3,
            timeout: Duration::from_secs(30),
        })
    }

    /// Set the per-1k-token pricing used for cost reporting.
    pub fn with_rates(mut self, input_per_1k: f64, output_per_1k: f64) -> Self {
        self.input_rate_per_1k = input_per_1k;
        self.output_rate_per_1k = output_per_1k;
        self
    }

    /// Set the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::Gemini
    }

    async fn invoke(&self, request: &ProviderRequest) -> ProviderResult {
        let body = GeminiRequest {
            contents: vec![GeminiContent {
                parts: vec![GeminiPart {
                    text: request.prompt.clone(),
                }],
            }],
            generation_config: GeminiGenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_tokens,
                response_mime_type: request.strict_json.then_some("application/json"),
            },
        };

        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, self.api_key
        );

        let start = Instant::now();
        let response = match self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                return ProviderResult::failure(
                    ProviderId::Gemini,
                    self.model.clone(),
                    format!("Gemini request failed: {e}"),
                )
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return ProviderResult::failure(
                ProviderId::Gemini,
                self.model.clone(),
                format!("Gemini API error {status}: {detail}"),
            );
        }

        let latency_ms = start.elapsed().as_millis() as u64;
        let parsed: GeminiResponse = match response.json().await {
            Ok(p) => p,
            Err(e) => {
                return ProviderResult::failure(
                    ProviderId::Gemini,
                    self.model.clone(),
                    format!("Gemini response parsing failed: {e}"),
                )
            }
        };

        let content = parsed
            .candidates
            .as_ref()
            .and_then(|c| c.first())
            .and_then(|c| c.content.as_ref())
            .and_then(|c| c.parts.first())
            .map(|p| p.text.clone())
            .unwrap_or_default();
        let (input_tokens, output_tokens) = parsed
            .usage_metadata
            .map(|u| (u.prompt_token_count, u.candidates_token_count))
            .unwrap_or((0, 0));

        ProviderResult {
            provider: ProviderId::Gemini,
            model: self.model.clone(),
            success: true,
            content,
            input_tokens,
            output_tokens,
            cost: token_cost(input_tokens, self.input_rate_per_1k)
                + token_cost(output_tokens, self.output_rate_per_1k),
            latency_ms,
            error: None,
        }
    }
}

/// Cost of `tokens` at a per-1k-token rate.
fn token_cost(tokens: u64, rate_per_1k: f64) -> f64 {
    (tokens as f64 / 1000.0) * rate_per_1k
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_provider_success_shape() {
        let provider = StaticProvider::new(ProviderId::OpenAi)
            .with_content("all clear")
            .with_cost(0.02);
        let result = provider.invoke(&ProviderRequest::new("check this")).await;

        assert!(result.success);
        assert_eq!(result.provider, ProviderId::OpenAi);
        assert_eq!(result.content, "all clear");
        assert_eq!(result.input_tokens, 2);
        assert_eq!(result.output_tokens, 2);
        assert!((result.cost - 0.02).abs() < f64::EPSILON);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_static_provider_failure_shape() {
        let provider = StaticProvider::new(ProviderId::Gemini).failing("connection reset");
        let result = provider.invoke(&ProviderRequest::new("x")).await;

        assert!(!result.success);
        assert_eq!(result.cost, 0.0);
        assert_eq!(result.error.as_deref(), Some("connection reset"));
    }

    #[test]
    fn test_provider_id_display() {
        assert_eq!(ProviderId::OpenAi.to_string(), "openai");
        assert_eq!(ProviderId::Gemini.to_string(), "gemini");
    }

    #[test]
    fn test_request_from_task_carries_strict_json() {
        let task = crate::task::Task::new("extract fields").with_strict_json(true);
        let request = ProviderRequest::from_task(&task);
        assert!(request.strict_json);
        assert_eq!(request.prompt, "extract fields");
    }

    #[test]
    fn test_token_cost() {
        assert!((token_cost(2000, 0.5) - 1.0).abs() < f64::EPSILON);
        assert_eq!(token_cost(0, 0.5), 0.0);
    }

    #[test]
    fn test_provider_set_lookup() {
        let set = ProviderSet::new(
            Arc::new(StaticProvider::new(ProviderId::OpenAi)),
            Arc::new(StaticProvider::new(ProviderId::Gemini)),
        );
        assert_eq!(set.get(ProviderId::OpenAi).id(), ProviderId::OpenAi);
        assert_eq!(set.get(ProviderId::Gemini).id(), ProviderId::Gemini);
    }
}
