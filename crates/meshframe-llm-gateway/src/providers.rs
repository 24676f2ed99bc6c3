//! LLM provider implementations with secure API key handling.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument};
use url::Url;

use crate::{LlmRequest, LlmResponse, TokenUsage};

/// A transport to a concrete LLM backend.
///
/// This is the seam spec.md leaves as an external collaborator: the
/// orchestrator only ever calls `complete`, never reaches past this trait
/// into a specific vendor's wire format.
#[async_trait::async_trait]
pub trait LlmTransport: Send + Sync {
    /// Complete a text generation request.
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse>;

    /// Provider name for logging and metrics.
    fn provider_name(&self) -> &'static str;

    /// Model currently in use.
    fn model_name(&self) -> &str;

    /// Maximum token limit for this provider/model.
    fn max_tokens(&self) -> u32;

    /// Minimal liveness check.
    async fn health_check(&self) -> Result<()>;
}

/// Anthropic Claude provider with secure API key handling.
pub struct AnthropicProvider {
    client: Client,
    api_key: Secret<String>,
    model: String,
    base_url: Url,
    max_tokens: u32,
}

/// OpenAI GPT provider with secure API key handling.
pub struct OpenAiProvider {
    client: Client,
    api_key: Secret<String>,
    model: String,
    organization: Option<String>,
    base_url: Url,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
    usage: AnthropicUsage,
    model: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(rename = "type")]
    content_type: String,
    text: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct OpenAiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    usage: OpenAiUsage,
    model: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

impl AnthropicProvider {
    /// Build a provider, validating the API key's expected prefix.
    pub async fn new(
        api_key: Secret<String>,
        model: String,
        base_url: Option<String>,
        timeout_seconds: u64,
    ) -> Result<Self> {
        if !api_key.expose_secret().starts_with("sk-ant-") {
            anyhow::bail!("invalid anthropic api key format");
        }

        let base_url = base_url.unwrap_or_else(|| "https://api.anthropic.com".to_string());
        let base_url = Url::parse(&base_url).context("invalid anthropic base url")?;

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .user_agent("meshframe-llm-gateway/0.2.1")
            .build()
            .context("failed to create http client")?;

        let max_tokens = match model.as_str() {
            "claude-3-5-sonnet-20241022" => 8192,
            "claude-3-haiku-20240307" => 4096,
            "claude-3-opus-20240229" => 4096,
            _ => 4096,
        };

        debug!(model = %model, "initialized anthropic provider");

        Ok(Self { client, api_key, model, base_url, max_tokens })
    }

    fn create_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let auth_value = format!("Bearer {}", self.api_key.expose_secret());
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&auth_value).context("invalid authorization header")?);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("x-api-version", HeaderValue::from_static("2023-06-01"));
        Ok(headers)
    }
}

#[async_trait::async_trait]
impl LlmTransport for AnthropicProvider {
    #[instrument(skip(self, request), fields(model = %self.model))]
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let start_time = std::time::Instant::now();
        debug!("making anthropic api request");

        let anthropic_request = AnthropicRequest {
            model: self.model.clone(),
            max_tokens: request.max_tokens().unwrap_or(self.max_tokens).min(self.max_tokens),
            messages: vec![AnthropicMessage { role: "user".to_string(), content: request.prompt().to_string() }],
            temperature: request.temperature(),
        };

        let headers = self.create_headers().context("failed to create request headers")?;
        let url = self.base_url.join("/v1/messages").context("failed to construct api url")?;

        let response = self
            .client
            .post(url)
            .headers(headers)
            .json(&anthropic_request)
            .send()
            .await
            .context("failed to send request to anthropic api")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_else(|_| "unknown error".to_string());
            error!(%status, %error_text, "anthropic api error");
            anyhow::bail!("anthropic api error {status}: {error_text}");
        }

        let anthropic_response: AnthropicResponse =
            response.json().await.context("failed to parse anthropic api response")?;

        let content = anthropic_response
            .content
            .into_iter()
            .find(|c| c.content_type == "text")
            .map(|c| c.text)
            .unwrap_or_default();

        if content.is_empty() {
            anyhow::bail!("empty response from anthropic api");
        }

        let usage = TokenUsage {
            prompt_tokens: anthropic_response.usage.input_tokens,
            completion_tokens: anthropic_response.usage.output_tokens,
            total_tokens: anthropic_response.usage.input_tokens + anthropic_response.usage.output_tokens,
        };

        let duration = start_time.elapsed();
        debug!(duration_ms = duration.as_millis(), "anthropic api request completed");

        LlmResponse::new(content, usage, "anthropic".to_string(), anthropic_response.model, duration)
    }

    fn provider_name(&self) -> &'static str {
        "anthropic"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn max_tokens(&self) -> u32 {
        self.max_tokens
    }

    async fn health_check(&self) -> Result<()> {
        let test_request = LlmRequest::new("health check")?.with_max_tokens(1);
        self.complete(&test_request).await.map(|_| ()).map_err(|e| e.context("anthropic health check failed"))
    }
}

impl OpenAiProvider {
    /// Build a provider, validating the API key's expected prefix.
    pub async fn new(
        api_key: Secret<String>,
        model: String,
        organization: Option<String>,
        base_url: Option<String>,
        timeout_seconds: u64,
    ) -> Result<Self> {
        if !api_key.expose_secret().starts_with("sk-") {
            anyhow::bail!("invalid openai api key format");
        }

        let base_url = base_url.unwrap_or_else(|| "https://api.openai.com".to_string());
        let base_url = Url::parse(&base_url).context("invalid openai base url")?;

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .user_agent("meshframe-llm-gateway/0.2.1")
            .build()
            .context("failed to create http client")?;

        let max_tokens = match model.as_str() {
            "gpt-4" => 8192,
            "gpt-4-turbo" => 4096,
            "gpt-3.5-turbo" => 4096,
            _ => 4096,
        };

        debug!(model = %model, "initialized openai provider");

        Ok(Self { client, api_key, model, organization, base_url, max_tokens })
    }

    fn create_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let auth_value = format!("Bearer {}", self.api_key.expose_secret());
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&auth_value).context("invalid authorization header")?);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(org) = &self.organization {
            headers.insert("OpenAI-Organization", HeaderValue::from_str(org).context("invalid organization header")?);
        }
        Ok(headers)
    }
}

#[async_trait::async_trait]
impl LlmTransport for OpenAiProvider {
    #[instrument(skip(self, request), fields(model = %self.model))]
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let start_time = std::time::Instant::now();
        debug!("making openai api request");

        let openai_request = OpenAiRequest {
            model: self.model.clone(),
            messages: vec![OpenAiMessage { role: "user".to_string(), content: request.prompt().to_string() }],
            max_tokens: request.max_tokens().map(|t| t.min(self.max_tokens)),
            temperature: request.temperature(),
        };

        let headers = self.create_headers().context("failed to create request headers")?;
        let url = self.base_url.join("/v1/chat/completions").context("failed to construct api url")?;

        let response = self
            .client
            .post(url)
            .headers(headers)
            .json(&openai_request)
            .send()
            .await
            .context("failed to send request to openai api")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_else(|_| "unknown error".to_string());
            error!(%status, %error_text, "openai api error");
            anyhow::bail!("openai api error {status}: {error_text}");
        }

        let openai_response: OpenAiResponse = response.json().await.context("failed to parse openai api response")?;

        let content = openai_response.choices.first().map(|choice| choice.message.content.clone()).unwrap_or_default();

        if content.is_empty() {
            anyhow::bail!("empty response from openai api");
        }

        let usage = TokenUsage {
            prompt_tokens: openai_response.usage.prompt_tokens,
            completion_tokens: openai_response.usage.completion_tokens,
            total_tokens: openai_response.usage.total_tokens,
        };

        let duration = start_time.elapsed();
        debug!(duration_ms = duration.as_millis(), "openai api request completed");

        LlmResponse::new(content, usage, "openai".to_string(), openai_response.model, duration)
    }

    fn provider_name(&self) -> &'static str {
        "openai"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn max_tokens(&self) -> u32 {
        self.max_tokens
    }

    async fn health_check(&self) -> Result<()> {
        let test_request = LlmRequest::new("health check")?.with_max_tokens(1);
        self.complete(&test_request).await.map(|_| ()).map_err(|e| e.context("openai health check failed"))
    }
}

impl Drop for AnthropicProvider {
    fn drop(&mut self) {
        debug!("cleaning up anthropic provider");
    }
}

impl Drop for OpenAiProvider {
    fn drop(&mut self) {
        debug!("cleaning up openai provider");
    }
}
