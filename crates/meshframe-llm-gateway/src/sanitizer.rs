//! Request sanitization to prevent injection attacks and ensure safe inputs.

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{debug, warn};

use crate::LlmRequest;

/// Request sanitizer that prevents various attack vectors before a prompt
/// reaches the provider.
pub struct RequestSanitizer {
    dangerous_patterns: Vec<DangerousPattern>,
    max_sanitized_length: usize,
}

#[derive(Debug, Clone)]
struct DangerousPattern {
    pattern: Regex,
    description: String,
    block_request: bool,
}

impl RequestSanitizer {
    /// Build a sanitizer with the default security pattern set.
    pub fn new() -> Self {
        let dangerous_patterns = vec![
            DangerousPattern {
                pattern: Regex::new(r"(?i)(system|exec|eval|subprocess|shell|cmd|powershell|bash|sh)\s*\(").unwrap(),
                description: "System command injection attempt".to_string(),
                block_request: true,
            },
            DangerousPattern {
                pattern: Regex::new(r"(?i)(open|read|write|delete|rm|mv|cp|mkdir|rmdir)\s*\(").unwrap(),
                description: "File system access attempt".to_string(),
                block_request: true,
            },
            DangerousPattern {
                pattern: Regex::new(r"(?i)(urllib|requests|curl|wget|http|ftp|ssh|telnet)").unwrap(),
                description: "Network access attempt".to_string(),
                block_request: true,
            },
            DangerousPattern {
                pattern: Regex::new(
                    r"(?i)(ignore\s+previous|forget\s+instructions|new\s+instructions|system\s+prompt|you\s+are\s+now)",
                )
                .unwrap(),
                description: "Prompt injection attempt".to_string(),
                block_request: true,
            },
            DangerousPattern {
                pattern: Regex::new(r"(?i)(__import__|import\s+os|import\s+sys|from\s+os|from\s+sys)").unwrap(),
                description: "Python code execution attempt".to_string(),
                block_request: true,
            },
            DangerousPattern {
                pattern: Regex::new(r"(?i)(union\s+select|drop\s+table|delete\s+from|insert\s+into|update\s+set)")
                    .unwrap(),
                description: "SQL injection attempt".to_string(),
                block_request: false,
            },
            DangerousPattern {
                pattern: Regex::new(r"(?i)(api[_\s]?key|secret|token|password|credential|private[_\s]?key)")
                    .unwrap(),
                description: "Potential data exfiltration attempt".to_string(),
                block_request: false,
            },
            DangerousPattern {
                pattern: Regex::new(r"(?i)(jailbreak|bypass|override|hack|exploit|vulnerability)").unwrap(),
                description: "Jailbreak attempt".to_string(),
                block_request: false,
            },
        ];

        Self {
            dangerous_patterns,
            max_sanitized_length: 32_768,
        }
    }

    /// Sanitize `request`, returning an error if a blocking pattern
    /// matched, otherwise a rewritten request with non-blocking patterns
    /// redacted, whitespace normalized, encoding cleaned, and length
    /// capped.
    pub fn sanitize(&self, request: LlmRequest) -> Result<LlmRequest> {
        debug!("sanitizing request against {} patterns", self.dangerous_patterns.len());

        let original_prompt = request.prompt().to_string();
        let mut sanitized_prompt = original_prompt.clone();
        let mut blocked_patterns = Vec::new();
        let mut sanitized_patterns = Vec::new();

        for pattern in &self.dangerous_patterns {
            if pattern.pattern.is_match(&sanitized_prompt) {
                if pattern.block_request {
                    blocked_patterns.push(pattern.description.clone());
                } else {
                    sanitized_prompt = pattern.pattern.replace_all(&sanitized_prompt, "[SANITIZED]").to_string();
                    sanitized_patterns.push(pattern.description.clone());
                }
            }
        }

        if !blocked_patterns.is_empty() {
            warn!(patterns = ?blocked_patterns, "blocking request due to dangerous patterns");
            anyhow::bail!("{}", blocked_patterns.join(", "));
        }

        if !sanitized_patterns.is_empty() {
            warn!(patterns = ?sanitized_patterns, "sanitized request");
        }

        sanitized_prompt = self.normalize_whitespace(&sanitized_prompt);
        sanitized_prompt = self.clean_encoding(&sanitized_prompt)?;

        if sanitized_prompt.len() > self.max_sanitized_length {
            sanitized_prompt.truncate(self.max_sanitized_length);
            if let Some(last_space) = sanitized_prompt.rfind(' ') {
                sanitized_prompt.truncate(last_space);
            }
        }

        if sanitized_prompt.trim().is_empty() {
            anyhow::bail!("prompt became empty after sanitization");
        }

        let sanitized_request = LlmRequest::new(sanitized_prompt)?.with_max_tokens(request.max_tokens());
        let sanitized_request = match request.temperature() {
            Some(temp) => sanitized_request.with_temperature(temp)?,
            None => sanitized_request,
        };

        if original_prompt != sanitized_request.prompt() {
            debug!(
                before = original_prompt.len(),
                after = sanitized_request.prompt().len(),
                "prompt modified during sanitization"
            );
        }

        Ok(sanitized_request)
    }

    fn normalize_whitespace(&self, prompt: &str) -> String {
        let whitespace = Regex::new(r"\s+").unwrap();
        whitespace.replace_all(prompt, " ").trim().to_string()
    }

    fn clean_encoding(&self, prompt: &str) -> Result<String> {
        let cleaned: String = prompt
            .chars()
            .filter(|&c| c.is_ascii_graphic() || c.is_ascii_whitespace() || (!c.is_ascii() && !c.is_control()))
            .collect();

        if cleaned.is_ascii() {
            return Ok(cleaned);
        }
        match String::from_utf8(cleaned.as_bytes().to_vec()) {
            Ok(valid) => Ok(valid),
            Err(_) => {
                warn!("invalid utf-8 sequence detected, using lossy conversion");
                Ok(String::from_utf8_lossy(cleaned.as_bytes()).to_string())
            }
        }
    }

    /// Register an additional pattern at runtime.
    pub fn add_pattern(&mut self, pattern: &str, description: String, block_request: bool) -> Result<()> {
        let regex = Regex::new(pattern).with_context(|| format!("invalid regex pattern: {pattern}"))?;
        self.dangerous_patterns.push(DangerousPattern { pattern: regex, description, block_request });
        Ok(())
    }

    /// Number of configured patterns.
    pub fn pattern_count(&self) -> usize {
        self.dangerous_patterns.len()
    }

    /// Whether `prompt` would be blocked, without constructing a request.
    pub fn would_block(&self, prompt: &str) -> bool {
        self.dangerous_patterns.iter().any(|p| p.block_request && p.pattern.is_match(prompt))
    }
}

impl Default for RequestSanitizer {
    fn default() -> Self {
        Self::new()
    }
}
