//! Adapter from [`crate::prompt::Prompt`] to the blocking-completion LLM
//! transport the orchestrator treats as an external collaborator
//! (spec.md §1). Kept as a narrow trait so the planner and fallback
//! manager can be tested against a stub instead of a real gateway.

use async_trait::async_trait;
use meshframe_llm_gateway::LlmGateway;

use crate::prompt::Prompt;

/// A blocking `Complete(prompt) -> text` capability.
#[async_trait]
pub trait LlmCompleter: Send + Sync {
    /// Issue `prompt` and return the raw completion text.
    async fn complete(&self, prompt: &Prompt) -> Result<String, anyhow::Error>;
}

/// Adapts [`LlmGateway`] (sanitization, rate limiting, validation) to
/// [`LlmCompleter`].
pub struct GatewayCompleter {
    gateway: LlmGateway,
}

impl GatewayCompleter {
    /// Wrap an already-constructed gateway.
    pub fn new(gateway: LlmGateway) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl LlmCompleter for GatewayCompleter {
    async fn complete(&self, prompt: &Prompt) -> Result<String, anyhow::Error> {
        let request = meshframe_llm_gateway::LlmRequest::new(prompt.text.clone())?
            .with_max_tokens(prompt.max_tokens)
            .with_temperature(prompt.temperature)?;
        let response = self.gateway.complete(request).await?;
        Ok(response.content().to_string())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;

    use super::*;

    /// A completer returning a fixed, queued sequence of responses — used
    /// by planner/fallback tests to script repair-then-success scenarios.
    pub struct ScriptedCompleter {
        responses: Mutex<Vec<Result<String, String>>>,
    }

    impl ScriptedCompleter {
        pub fn new(responses: Vec<Result<String, String>>) -> Self {
            // Reverse so `pop()` yields them in call order.
            let mut responses = responses;
            responses.reverse();
            Self { responses: Mutex::new(responses) }
        }
    }

    #[async_trait]
    impl LlmCompleter for ScriptedCompleter {
        async fn complete(&self, _prompt: &Prompt) -> Result<String, anyhow::Error> {
            let mut responses = self.responses.lock().unwrap();
            match responses.pop() {
                Some(Ok(text)) => Ok(text),
                Some(Err(err)) => Err(anyhow::anyhow!(err)),
                None => Err(anyhow::anyhow!("scripted completer exhausted")),
            }
        }
    }
}
