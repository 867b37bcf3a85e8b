//! LLM providers for transcript cleaning and invoice extraction.
//!
//! The normalizer and the extractor both talk to a language model through the
//! [`LlmProvider`] trait. Providers return plain text; structured extraction
//! goes through [`LlmProvider::complete_json`], which OpenAI implements with
//! server-side JSON-schema enforcement and others implement by parsing the
//! completion.

mod anthropic;
mod openai;
pub mod prompts;

pub use anthropic::AnthropicLlmProvider;
pub use openai::OpenAiLlmProvider;

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Default timeout for LLM API requests.
pub const DEFAULT_LLM_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that can occur during LLM operations.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("API error: {0}")]
    Api(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("No API key configured for provider: {0}")]
    NoApiKey(String),
}

/// A named JSON schema for structured completions.
#[derive(Debug, Clone)]
pub struct JsonSchemaSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub schema: Value,
}

/// Trait for LLM providers.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Complete a prompt and return the response text.
    async fn complete(&self, system_prompt: &str, user_message: &str) -> Result<String, LlmError>;

    /// Complete a prompt and return JSON matching `schema`.
    ///
    /// The default implementation asks for JSON in the prompt and parses the
    /// completion; providers with native structured-output support override it.
    async fn complete_json(
        &self,
        system_prompt: &str,
        user_message: &str,
        schema: &JsonSchemaSpec,
    ) -> Result<Value, LlmError> {
        let system_prompt = format!(
            "{}\n\nReturn ONLY valid JSON matching this JSON Schema (no markdown, no extra keys):\n{}",
            system_prompt, schema.schema
        );
        let text = self.complete(&system_prompt, user_message).await?;
        parse_json_completion(&text)
    }

    /// Get the provider name.
    fn name(&self) -> &'static str;

    /// Get the model being used.
    fn model(&self) -> &str;
}

/// Parse a completion that should contain a JSON object.
///
/// Models occasionally wrap JSON in a markdown fence despite instructions;
/// strip one before giving up.
pub(crate) fn parse_json_completion(text: &str) -> Result<Value, LlmError> {
    let trimmed = text.trim();
    let candidate = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed);

    serde_json::from_str(candidate).map_err(|e| {
        LlmError::InvalidResponse(format!(
            "Completion was not valid JSON: {} (content: {})",
            e, candidate
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_json() {
        let v = parse_json_completion(r#"{"customer_name": "John Smith"}"#).unwrap();
        assert_eq!(v["customer_name"], "John Smith");
    }

    #[test]
    fn test_parse_fenced_json() {
        let v = parse_json_completion("```json\n{\"labour_hours\": 3}\n```").unwrap();
        assert_eq!(v["labour_hours"], 3);
    }

    #[test]
    fn test_parse_rejects_prose() {
        assert!(parse_json_completion("Sure! Here is the invoice.").is_err());
    }
}
