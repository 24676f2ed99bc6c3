//! Secure configuration loading with memory-safe environment variable handling.
//!
//! Provider credentials are cached through `secrecy::Secret` and zeroized on
//! drop so that a crash dump or debug log line never leaks an API key.

use std::collections::HashMap;
use std::env;

use anyhow::{Context, Result};
use secrecy::{ExposeSecret, Secret};
use tracing::{debug, warn};

use crate::providers::{AnthropicProvider, LlmTransport, OpenAiProvider};
use crate::DEFAULT_RATE_LIMIT;

/// Configuration for the LLM gateway with secure secret handling.
#[derive(Debug, Clone)]
pub struct Config {
    provider: ProviderConfig,
    rate_limit: u32,
    timeout_seconds: u64,
    debug_mode: bool,
    additional_settings: HashMap<String, String>,
}

/// Provider-specific configuration with secure secret storage.
#[derive(Debug, Clone)]
pub enum ProviderConfig {
    /// Anthropic Claude configuration.
    Anthropic {
        /// API key, held in a zeroize-on-drop wrapper.
        api_key: Secret<String>,
        /// Model identifier, e.g. `claude-3-5-sonnet-20241022`.
        model: String,
        /// Override for the API base URL.
        base_url: Option<String>,
    },
    /// OpenAI GPT configuration.
    OpenAi {
        /// API key, held in a zeroize-on-drop wrapper.
        api_key: Secret<String>,
        /// Model identifier, e.g. `gpt-4`.
        model: String,
        /// Optional organization id.
        organization: Option<String>,
        /// Override for the API base URL.
        base_url: Option<String>,
    },
    /// A locally hosted model server. Not yet wired to a concrete
    /// [`LlmTransport`](crate::LlmTransport) — this runtime ships
    /// Anthropic/OpenAI as the illustrative HTTP-backed providers, with the
    /// LLM transport client itself treated as an external collaborator.
    Local {
        /// Server endpoint.
        endpoint: String,
        /// Model identifier.
        model: String,
        /// Optional bearer token.
        auth_token: Option<Secret<String>>,
    },
}

/// Secure environment variable loader with automatic cleanup.
pub struct EnvLoader {
    env_cache: HashMap<String, Secret<String>>,
}

impl EnvLoader {
    /// Load the fixed set of recognized environment variables into a
    /// secure cache.
    pub fn new() -> Result<Self> {
        let mut env_cache = HashMap::new();

        let env_vars = [
            "ANTHROPIC_API_KEY",
            "OPENAI_API_KEY",
            "AMCP_LLM_PROVIDER",
            "AMCP_LLM_MODEL",
            "AMCP_LLM_BASE_URL",
            "AMCP_LLM_RATE_LIMIT",
            "AMCP_LLM_TIMEOUT",
            "AMCP_LLM_DEBUG",
            "OPENAI_ORGANIZATION",
            "LOCAL_LLM_ENDPOINT",
            "LOCAL_LLM_AUTH_TOKEN",
        ];

        for var_name in &env_vars {
            if let Ok(value) = env::var(var_name) {
                env_cache.insert(var_name.to_string(), Secret::new(value));
            }
        }

        debug!("loaded {} environment variables into secure cache", env_cache.len());
        Ok(Self { env_cache })
    }

    /// Fetch a required variable, erroring with its name if absent.
    pub fn get_required(&self, key: &str) -> Result<&Secret<String>> {
        self.env_cache
            .get(key)
            .with_context(|| format!("required environment variable {key} not found"))
    }

    /// Fetch an optional variable.
    pub fn get_optional(&self, key: &str) -> Option<&Secret<String>> {
        self.env_cache.get(key)
    }

    /// Fetch a non-sensitive value as a plain string.
    pub fn get_public(&self, key: &str) -> Option<String> {
        self.env_cache.get(key).map(|secret| secret.expose_secret().clone())
    }

    /// Parse a numeric variable, falling back to `default` if unset or
    /// unparseable.
    pub fn get_numeric<T>(&self, key: &str, default: T) -> T
    where
        T: std::str::FromStr + Copy,
        T::Err: std::fmt::Display,
    {
        self.get_public(key)
            .and_then(|value| {
                value
                    .parse()
                    .map_err(|e| {
                        warn!("failed to parse {} as numeric: {}", key, e);
                        e
                    })
                    .ok()
            })
            .unwrap_or(default)
    }

    /// Parse a boolean variable, falling back to `default` if unset.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get_public(key)
            .map(|value| matches!(value.to_lowercase().as_str(), "true" | "1" | "yes" | "on"))
            .unwrap_or(default)
    }
}

impl Drop for EnvLoader {
    fn drop(&mut self) {
        for (key, secret) in self.env_cache.drain() {
            debug!("clearing cached environment variable: {}", key);
            drop(secret);
        }
    }
}

impl Config {
    /// Load configuration from `ANTHROPIC_API_KEY`/`OPENAI_API_KEY`/
    /// `AMCP_LLM_*`/`LOCAL_LLM_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let env_loader = EnvLoader::new().context("failed to create secure environment loader")?;
        Self::from_env_loader(env_loader)
    }

    /// Load configuration from an already-populated loader; used directly
    /// by tests that want to avoid touching the real environment.
    pub fn from_env_loader(env_loader: EnvLoader) -> Result<Self> {
        let provider_type = env_loader
            .get_public("AMCP_LLM_PROVIDER")
            .unwrap_or_else(|| Self::auto_detect_provider(&env_loader));

        debug!("using llm provider: {}", provider_type);

        let provider = match provider_type.to_lowercase().as_str() {
            "anthropic" => {
                let api_key = env_loader
                    .get_required("ANTHROPIC_API_KEY")
                    .context("ANTHROPIC_API_KEY required for anthropic provider")?
                    .clone();
                let model = env_loader
                    .get_public("AMCP_LLM_MODEL")
                    .unwrap_or_else(|| "claude-3-5-sonnet-20241022".to_string());
                let base_url = env_loader.get_public("AMCP_LLM_BASE_URL");
                ProviderConfig::Anthropic { api_key, model, base_url }
            }
            "openai" => {
                let api_key = env_loader
                    .get_required("OPENAI_API_KEY")
                    .context("OPENAI_API_KEY required for openai provider")?
                    .clone();
                let model = env_loader.get_public("AMCP_LLM_MODEL").unwrap_or_else(|| "gpt-4".to_string());
                let organization = env_loader.get_public("OPENAI_ORGANIZATION");
                let base_url = env_loader.get_public("AMCP_LLM_BASE_URL");
                ProviderConfig::OpenAi { api_key, model, organization, base_url }
            }
            "local" => {
                let endpoint = env_loader
                    .get_public("LOCAL_LLM_ENDPOINT")
                    .context("LOCAL_LLM_ENDPOINT required for local provider")?;
                let model = env_loader.get_public("AMCP_LLM_MODEL").unwrap_or_else(|| "local-model".to_string());
                let auth_token = env_loader.get_optional("LOCAL_LLM_AUTH_TOKEN").cloned();
                ProviderConfig::Local { endpoint, model, auth_token }
            }
            unknown => {
                anyhow::bail!("unknown llm provider '{unknown}'; supported: anthropic, openai, local");
            }
        };

        let rate_limit = env_loader.get_numeric("AMCP_LLM_RATE_LIMIT", DEFAULT_RATE_LIMIT);
        let timeout_seconds = env_loader.get_numeric("AMCP_LLM_TIMEOUT", 30u64);
        let debug_mode = env_loader.get_bool("AMCP_LLM_DEBUG", false);

        if debug_mode {
            warn!("debug mode enabled - be careful with sensitive data in logs");
        }

        Ok(Self {
            provider,
            rate_limit,
            timeout_seconds,
            debug_mode,
            additional_settings: HashMap::new(),
        })
    }

    fn auto_detect_provider(env_loader: &EnvLoader) -> String {
        if env_loader.get_optional("ANTHROPIC_API_KEY").is_some() {
            "anthropic".to_string()
        } else if env_loader.get_optional("OPENAI_API_KEY").is_some() {
            "openai".to_string()
        } else if env_loader.get_optional("LOCAL_LLM_ENDPOINT").is_some() {
            "local".to_string()
        } else {
            "anthropic".to_string()
        }
    }

    /// Instantiate the configured provider.
    pub async fn create_provider(&self) -> Result<Box<dyn LlmTransport>> {
        match &self.provider {
            ProviderConfig::Anthropic { api_key, model, base_url } => {
                let provider =
                    AnthropicProvider::new(api_key.clone(), model.clone(), base_url.clone(), self.timeout_seconds)
                        .await?;
                Ok(Box::new(provider))
            }
            ProviderConfig::OpenAi { api_key, model, organization, base_url } => {
                let provider = OpenAiProvider::new(
                    api_key.clone(),
                    model.clone(),
                    organization.clone(),
                    base_url.clone(),
                    self.timeout_seconds,
                )
                .await?;
                Ok(Box::new(provider))
            }
            ProviderConfig::Local { .. } => {
                anyhow::bail!("local llm provider not implemented")
            }
        }
    }

    /// Provider name for logging and metrics.
    pub fn provider_name(&self) -> &'static str {
        match &self.provider {
            ProviderConfig::Anthropic { .. } => "anthropic",
            ProviderConfig::OpenAi { .. } => "openai",
            ProviderConfig::Local { .. } => "local",
        }
    }

    /// Configured requests-per-minute rate limit.
    pub fn rate_limit(&self) -> u32 {
        self.rate_limit
    }

    /// Configured per-request timeout.
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_seconds)
    }

    /// Whether debug mode is enabled.
    pub fn debug_mode(&self) -> bool {
        self.debug_mode
    }

    /// Configured model name.
    pub fn model_name(&self) -> &str {
        match &self.provider {
            ProviderConfig::Anthropic { model, .. } => model,
            ProviderConfig::OpenAi { model, .. } => model,
            ProviderConfig::Local { model, .. } => model,
        }
    }

    /// A provider-specific setting not covered by a dedicated field.
    pub fn additional_setting(&self, key: &str) -> Option<&str> {
        self.additional_settings.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn env_loader_caches_and_clears_secrets() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("TEST_SECRET_VALUE", "sensitive");
        {
            let loader = EnvLoader::new().unwrap();
            assert!(loader.get_optional("TEST_SECRET_VALUE").is_none());
        }
        env::remove_var("TEST_SECRET_VALUE");
    }

    #[test]
    fn auto_detects_provider_from_available_api_key() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::remove_var("ANTHROPIC_API_KEY");
        env::remove_var("OPENAI_API_KEY");
        env::remove_var("LOCAL_LLM_ENDPOINT");

        env::set_var("ANTHROPIC_API_KEY", "test-key");
        let loader = EnvLoader::new().unwrap();
        assert_eq!(Config::auto_detect_provider(&loader), "anthropic");
        env::remove_var("ANTHROPIC_API_KEY");

        env::set_var("OPENAI_API_KEY", "test-key");
        let loader = EnvLoader::new().unwrap();
        assert_eq!(Config::auto_detect_provider(&loader), "openai");
        env::remove_var("OPENAI_API_KEY");
    }
}
