//! OpenAI LLM provider.
//!
//! Uses the Responses API. Structured extraction uses Structured Outputs
//! (server-side JSON schema enforcement), which keeps the extractor's parsing
//! deterministic.

use super::{parse_json_completion, JsonSchemaSpec, LlmError, LlmProvider, DEFAULT_LLM_TIMEOUT};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

const OPENAI_API_URL: &str = "https://api.openai.com/v1/responses";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

pub struct OpenAiLlmProvider {
    client: Client,
    api_key: String,
    model: String,
    timeout: Option<Duration>,
}

impl OpenAiLlmProvider {
    /// Create a new OpenAI provider with the given API key.
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model: DEFAULT_MODEL.to_string(),
            timeout: Some(DEFAULT_LLM_TIMEOUT),
        }
    }

    /// Create with a specific model.
    pub fn with_model(api_key: String, model: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model,
            timeout: Some(DEFAULT_LLM_TIMEOUT),
        }
    }

    /// Set the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn supports_structured_outputs(model: &str) -> bool {
        // Conservative allowlist to avoid 400s on unsupported models.
        model.starts_with("gpt-4.1") || model.starts_with("gpt-4o") || model.starts_with("gpt-5")
    }

    async fn send(&self, request: &ResponsesRequest) -> Result<Value, LlmError> {
        if self.api_key.is_empty() {
            return Err(LlmError::NoApiKey("openai".to_string()));
        }

        let mut req = self
            .client
            .post(OPENAI_API_URL)
            .bearer_auth(&self.api_key)
            .json(request);
        if let Some(timeout) = self.timeout {
            req = req.timeout(timeout);
        }

        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                self.timeout.map(LlmError::Timeout).unwrap_or(LlmError::Network(e))
            } else {
                LlmError::Network(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            if let Ok(error_response) = serde_json::from_str::<ErrorResponse>(&error_text) {
                return Err(LlmError::Api(format!(
                    "OpenAI API error ({}): {}",
                    status, error_response.error.message
                )));
            }
            return Err(LlmError::Api(format!(
                "OpenAI API error ({}): {}",
                status, error_text
            )));
        }

        response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(format!("Failed to parse response: {}", e)))
    }

    fn extract_output_text(value: &Value) -> Result<String, LlmError> {
        // Prefer the SDK-style convenience field when present.
        if let Some(s) = value.get("output_text").and_then(|v| v.as_str()) {
            return Ok(s.to_string());
        }

        let output = value
            .get("output")
            .and_then(|v| v.as_array())
            .ok_or_else(|| {
                LlmError::InvalidResponse("Responses API returned no 'output' array".to_string())
            })?;

        for item in output {
            if item.get("type").and_then(|t| t.as_str()) != Some("message") {
                continue;
            }
            let content = match item.get("content").and_then(|c| c.as_array()) {
                Some(c) => c,
                None => continue,
            };
            for part in content {
                match part.get("type").and_then(|t| t.as_str()) {
                    Some("refusal") => {
                        let refusal =
                            part.get("refusal").and_then(|r| r.as_str()).unwrap_or("");
                        return Err(LlmError::Api(format!("OpenAI refusal: {}", refusal)));
                    }
                    Some("output_text") => {
                        if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                            return Ok(text.to_string());
                        }
                    }
                    _ => {}
                }
            }
        }

        Err(LlmError::InvalidResponse(
            "Responses API returned no output_text content".to_string(),
        ))
    }
}

#[derive(Debug, Serialize)]
struct ResponsesRequest {
    model: String,
    input: Vec<InputMessage>,
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<TextConfig>,
}

#[derive(Debug, Serialize)]
struct InputMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct TextConfig {
    format: TextFormat,
}

#[derive(Debug, Serialize)]
struct TextFormat {
    #[serde(rename = "type")]
    format_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    strict: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    schema: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

fn input_messages(system_prompt: &str, user_message: &str) -> Vec<InputMessage> {
    vec![
        InputMessage {
            role: "system".to_string(),
            content: system_prompt.to_string(),
        },
        InputMessage {
            role: "user".to_string(),
            content: user_message.to_string(),
        },
    ]
}

#[async_trait]
impl LlmProvider for OpenAiLlmProvider {
    async fn complete(&self, system_prompt: &str, user_message: &str) -> Result<String, LlmError> {
        let request = ResponsesRequest {
            model: self.model.clone(),
            input: input_messages(system_prompt, user_message),
            max_output_tokens: 4096,
            temperature: Some(0.0),
            text: None,
        };

        let response = self.send(&request).await?;
        Self::extract_output_text(&response)
    }

    async fn complete_json(
        &self,
        system_prompt: &str,
        user_message: &str,
        schema: &JsonSchemaSpec,
    ) -> Result<Value, LlmError> {
        if !Self::supports_structured_outputs(&self.model) {
            // Older models: fall back to prompt-level JSON instructions.
            let system_prompt = format!(
                "{}\n\nReturn ONLY valid JSON matching this JSON Schema (no markdown, no extra keys):\n{}",
                system_prompt, schema.schema
            );
            let text = self.complete(&system_prompt, user_message).await?;
            return parse_json_completion(&text);
        }

        // A short explicit instruction reduces accidental prose even though the
        // schema is enforced server-side.
        let system_prompt = format!(
            "{}\n\nReturn ONLY valid JSON that matches the provided JSON Schema (no markdown, no extra keys).",
            system_prompt
        );

        let request = ResponsesRequest {
            model: self.model.clone(),
            input: input_messages(&system_prompt, user_message),
            max_output_tokens: 4096,
            temperature: Some(0.0),
            text: Some(TextConfig {
                format: TextFormat {
                    format_type: "json_schema".to_string(),
                    name: Some(schema.name.to_string()),
                    strict: Some(true),
                    schema: Some(schema.schema.clone()),
                    description: Some(schema.description.to_string()),
                },
            }),
        };

        let response = self.send(&request).await?;
        let output_text = Self::extract_output_text(&response)?;
        parse_json_completion(&output_text)
    }

    fn name(&self) -> &'static str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }
}
