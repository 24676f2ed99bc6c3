#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **meshframe-llm-gateway** – Secure LLM transport abstraction with
//! memory-safe configuration.
//!
//! This crate is the runtime's one concrete collaborator for the LLM
//! transport client that the orchestrator treats as an external, out-of-scope
//! dependency: a thin `LlmTransport` trait plus a sanitizing, validating,
//! rate-limited gateway around it.
//!
//! ## Security features
//!
//! - **Memory-safe secrets**: `secrecy` prevents API keys leaking into debug
//!   output.
//! - **Automatic cleanup**: sensitive data is zeroized on drop.
//! - **Rate limiting**: `governor`-backed per-correlation throttling.
//! - **Request sanitization**: blocks or redacts dangerous prompt patterns.
//! - **Response validation**: blocks harmful output patterns.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshframe_llm_gateway::{LlmGateway, LlmRequest};
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let config = meshframe_llm_gateway::Config::from_env()?;
//! let gateway = LlmGateway::new(config).await?;
//!
//! let request = LlmRequest::new("Explain Rust ownership")?;
//! let response = gateway.complete(request).await?;
//! println!("{}", response.content());
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use governor::{Quota, RateLimiter};
use meshframe_types::CorrelationId;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

pub mod config;
pub mod providers;
pub mod sanitizer;
pub mod validator;

pub use config::{Config, EnvLoader, ProviderConfig};
pub use providers::{AnthropicProvider, LlmTransport, OpenAiProvider};
pub use sanitizer::RequestSanitizer;
pub use validator::ResponseValidator;

/// Maximum allowed prompt length, to bound memory use.
pub const MAX_PROMPT_LENGTH: usize = 32_768;

/// Maximum allowed response length, to bound memory use.
pub const MAX_RESPONSE_LENGTH: usize = 1_048_576;

/// Default rate limit: 60 requests per minute per correlation.
pub const DEFAULT_RATE_LIMIT: u32 = 60;

/// Request to an LLM provider with security constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmRequest {
    prompt: String,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    metadata: RequestMetadata,
}

/// Metadata attached to LLM requests for auditing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMetadata {
    /// Correlation the request was issued on behalf of, if any. Set by the
    /// orchestrator when building a synthesis/repair prompt; `None` for a
    /// standalone request.
    pub correlation_id: Option<CorrelationId>,
    /// Request timestamp, unix epoch seconds.
    pub timestamp: u64,
    /// Request id for tracing.
    pub request_id: String,
}

/// Response from an LLM provider after validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    content: String,
    usage: TokenUsage,
    metadata: ResponseMetadata,
}

/// Token usage statistics for cost tracking and monitoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the prompt.
    pub prompt_tokens: u32,
    /// Tokens in the completion.
    pub completion_tokens: u32,
    /// Total tokens used.
    pub total_tokens: u32,
}

/// Metadata attached to LLM responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    /// Provider that generated the response.
    pub provider: String,
    /// Model used for generation.
    pub model: String,
    /// Response timestamp, unix epoch seconds.
    pub timestamp: u64,
    /// Processing duration in milliseconds.
    pub duration_ms: u64,
}

/// Safety constraints advertised alongside an `LlmRequest`. Informational —
/// enforcement lives in `RequestSanitizer`/`ResponseValidator`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyConstraints {
    /// Maximum tokens allowed in a response.
    pub max_response_tokens: u32,
    /// Whether to filter potentially harmful content.
    pub content_filtering: bool,
    /// Whether to validate code-like outputs.
    pub code_validation: bool,
    /// Custom safety rules, descriptive only.
    pub custom_rules: Vec<String>,
}

impl Default for SafetyConstraints {
    fn default() -> Self {
        Self {
            max_response_tokens: 4096,
            content_filtering: true,
            code_validation: true,
            custom_rules: vec![
                "No file system operations outside sandbox".to_string(),
                "No network requests to external services".to_string(),
                "No execution of system commands".to_string(),
            ],
        }
    }
}

type KeyedRateLimiter = RateLimiter<
    String,
    governor::state::keyed::DashMapStateStore<String>,
    governor::clock::DefaultClock,
    governor::middleware::NoOpMiddleware,
>;

/// Gateway providing rate-limited, sanitized, validated access to an
/// `LlmTransport`.
pub struct LlmGateway {
    provider: Box<dyn LlmTransport>,
    rate_limiter: Arc<KeyedRateLimiter>,
    sanitizer: RequestSanitizer,
    validator: ResponseValidator,
    config: Arc<Config>,
    metrics: Arc<RwLock<GatewayMetrics>>,
}

/// Metrics collected by the gateway for monitoring.
#[derive(Debug, Default, Clone)]
pub struct GatewayMetrics {
    /// Total requests processed.
    pub total_requests: u64,
    /// Total successful responses.
    pub successful_responses: u64,
    /// Total failed requests.
    pub failed_requests: u64,
    /// Total tokens consumed.
    pub total_tokens: u64,
    /// Rolling average response time in milliseconds.
    pub avg_response_time_ms: f64,
}

impl LlmRequest {
    /// Build a request, validating prompt length and emptiness.
    pub fn new(prompt: impl Into<String>) -> Result<Self> {
        let prompt = prompt.into();

        if prompt.len() > MAX_PROMPT_LENGTH {
            anyhow::bail!("prompt too long: {} > {} characters", prompt.len(), MAX_PROMPT_LENGTH);
        }
        if prompt.trim().is_empty() {
            anyhow::bail!("prompt cannot be empty");
        }

        Ok(Self {
            prompt,
            max_tokens: None,
            temperature: None,
            metadata: RequestMetadata {
                correlation_id: None,
                timestamp: std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_secs(),
                request_id: uuid::Uuid::new_v4().to_string(),
            },
        })
    }

    /// Attach a correlation id, e.g. when building a synthesis prompt for a
    /// `TaskPlan`.
    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.metadata.correlation_id = Some(correlation_id);
        self
    }

    /// Set the maximum tokens to generate.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Set temperature (0.0 = deterministic, 1.0 = very random).
    pub fn with_temperature(mut self, temperature: f32) -> Result<Self> {
        if !(0.0..=1.0).contains(&temperature) {
            anyhow::bail!("temperature must be between 0.0 and 1.0, got {temperature}");
        }
        self.temperature = Some(temperature);
        Ok(self)
    }

    /// The prompt text.
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// The max-tokens setting, if any.
    pub fn max_tokens(&self) -> Option<u32> {
        self.max_tokens
    }

    /// The temperature setting, if any.
    pub fn temperature(&self) -> Option<f32> {
        self.temperature
    }

    /// Request metadata.
    pub fn metadata(&self) -> &RequestMetadata {
        &self.metadata
    }
}

impl LlmResponse {
    /// Build a response, rejecting content over `MAX_RESPONSE_LENGTH`.
    pub fn new(content: String, usage: TokenUsage, provider: String, model: String, duration: Duration) -> Result<Self> {
        if content.len() > MAX_RESPONSE_LENGTH {
            anyhow::bail!("response too long: {} > {} characters", content.len(), MAX_RESPONSE_LENGTH);
        }

        Ok(Self {
            content,
            usage,
            metadata: ResponseMetadata {
                provider,
                model,
                timestamp: std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_secs(),
                duration_ms: duration.as_millis() as u64,
            },
        })
    }

    /// The generated content.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Token usage statistics.
    pub fn usage(&self) -> &TokenUsage {
        &self.usage
    }

    /// Response metadata.
    pub fn metadata(&self) -> &ResponseMetadata {
        &self.metadata
    }
}

impl LlmGateway {
    /// Build a gateway from `config`, instantiating its configured provider.
    pub async fn new(config: Config) -> Result<Self> {
        info!(provider = config.provider_name(), "initializing llm gateway");

        let provider = config.create_provider().await.context("failed to create llm provider")?;

        let quota = Quota::per_minute(std::num::NonZeroU32::new(config.rate_limit()).unwrap());
        let rate_limiter = Arc::new(RateLimiter::keyed(quota));

        Ok(Self {
            provider,
            rate_limiter,
            sanitizer: RequestSanitizer::new(),
            validator: ResponseValidator::new(),
            config: Arc::new(config),
            metrics: Arc::new(RwLock::new(GatewayMetrics::default())),
        })
    }

    /// Complete `request`, applying rate limiting, sanitization, the
    /// underlying transport call, and response validation in order.
    pub async fn complete(&self, mut request: LlmRequest) -> Result<LlmResponse> {
        let start_time = std::time::Instant::now();

        let rate_key = match &request.metadata.correlation_id {
            Some(id) => id.to_string(),
            None => "anonymous".to_string(),
        };
        if self.rate_limiter.check_key(&rate_key).is_err() {
            warn!(key = %rate_key, "rate limit exceeded");
            anyhow::bail!("rate limit exceeded");
        }

        request = self.sanitizer.sanitize(request).context("failed to sanitize request")?;

        debug!(correlation_id = ?request.metadata.correlation_id, "processing llm request");

        let response = match self.provider.complete(&request).await {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, "llm provider request failed");
                self.increment_failed_requests().await;
                return Err(e);
            }
        };

        let validated_response = self.validator.validate(response).context("response validation failed")?;

        let duration = start_time.elapsed();
        self.update_metrics(duration, &validated_response).await;

        info!(duration_ms = duration.as_millis(), "completed llm request");

        Ok(validated_response)
    }

    /// Current gateway metrics snapshot.
    pub async fn metrics(&self) -> GatewayMetrics {
        self.metrics.read().await.clone()
    }

    /// Underlying provider's name, for diagnostics.
    pub fn provider_name(&self) -> &'static str {
        self.config.provider_name()
    }

    async fn update_metrics(&self, duration: Duration, response: &LlmResponse) {
        let mut metrics = self.metrics.write().await;
        metrics.total_requests += 1;
        metrics.successful_responses += 1;
        metrics.total_tokens += response.usage.total_tokens as u64;

        let current_avg = metrics.avg_response_time_ms;
        let new_duration_ms = duration.as_millis() as f64;
        let total_responses = metrics.successful_responses as f64;
        metrics.avg_response_time_ms = (current_avg * (total_responses - 1.0) + new_duration_ms) / total_responses;
    }

    async fn increment_failed_requests(&self) {
        let mut metrics = self.metrics.write().await;
        metrics.total_requests += 1;
        metrics.failed_requests += 1;
    }
}

impl Drop for LlmGateway {
    fn drop(&mut self) {
        debug!("cleaning up llm gateway resources");
    }
}

mod uuid {
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    pub struct Uuid;

    impl Uuid {
        pub fn new_v4() -> Self {
            Self
        }

        #[allow(clippy::inherent_to_string)]
        pub fn to_string(&self) -> String {
            let timestamp = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos();
            let counter = COUNTER.fetch_add(1, Ordering::SeqCst);
            format!("req_{timestamp}_{counter}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_rejects_empty_prompt() {
        assert!(LlmRequest::new("   ").is_err());
    }

    #[test]
    fn request_rejects_overlong_prompt() {
        let prompt = "a".repeat(MAX_PROMPT_LENGTH + 1);
        assert!(LlmRequest::new(prompt).is_err());
    }

    #[test]
    fn request_rejects_out_of_range_temperature() {
        let request = LlmRequest::new("hello").unwrap();
        assert!(request.with_temperature(1.5).is_err());
    }

    #[test]
    fn response_rejects_overlong_content() {
        let content = "a".repeat(MAX_RESPONSE_LENGTH + 1);
        let usage = TokenUsage { prompt_tokens: 1, completion_tokens: 1, total_tokens: 2 };
        let result = LlmResponse::new(content, usage, "test".to_string(), "test".to_string(), Duration::from_millis(1));
        assert!(result.is_err());
    }

    #[test]
    fn safety_constraints_default_to_conservative_rules() {
        let constraints = SafetyConstraints::default();
        assert!(constraints.content_filtering);
        assert_eq!(constraints.custom_rules.len(), 3);
    }
}
