//! OpenAI transcription provider (`/v1/audio/transcriptions`).

use super::{SttError, SttProvider};
use async_trait::async_trait;
use reqwest::multipart;
use std::time::Duration;

const TRANSCRIPTIONS_URL: &str = "https://api.openai.com/v1/audio/transcriptions";
const DEFAULT_MODEL: &str = "whisper-1";

/// Whisper only considers roughly this many prompt tokens; clamp by chars for
/// predictable behavior.
const WHISPER_PROMPT_MAX_CHARS: usize = 224;

pub struct OpenAiSttProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    /// Domain prompt biasing transcription toward trade/invoicing vocabulary.
    prompt: Option<String>,
}

impl OpenAiSttProvider {
    /// Create a new OpenAI STT provider.
    ///
    /// `prompt` is an optional transcription hint; invoicing callers pass a
    /// short vocabulary primer (trade terms, "CIS", "VAT") to reduce
    /// mis-hearings of the tokens extraction depends on.
    pub fn new(api_key: String, model: Option<String>, prompt: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            prompt: prompt
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string()),
        }
    }

    fn clamped_prompt(&self) -> Option<String> {
        let prompt = self.prompt.as_deref()?;
        if self.model == "whisper-1" && prompt.chars().count() > WHISPER_PROMPT_MAX_CHARS {
            return Some(prompt.chars().take(WHISPER_PROMPT_MAX_CHARS).collect());
        }
        Some(prompt.to_string())
    }
}

#[async_trait]
impl SttProvider for OpenAiSttProvider {
    async fn transcribe(&self, audio: &[u8]) -> Result<String, SttError> {
        if self.api_key.is_empty() {
            return Err(SttError::Config(
                "OpenAI STT provider requires an API key".to_string(),
            ));
        }

        let part = multipart::Part::bytes(audio.to_vec())
            .file_name("recording.wav")
            .mime_str("audio/wav")
            .map_err(|e| SttError::Audio(format!("Failed to create multipart: {}", e)))?;

        let mut form = multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone());

        if let Some(prompt) = self.clamped_prompt() {
            form = form.text("prompt", prompt);
        }

        let response = self
            .client
            .post(TRANSCRIPTIONS_URL)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| if e.is_timeout() { SttError::Timeout } else { SttError::Network(e) })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(SttError::Api(format!(
                "OpenAI transcription API error ({}): {}",
                status, error_text
            )));
        }

        let result: serde_json::Value = response.json().await?;
        Ok(result["text"].as_str().unwrap_or("").to_string())
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_creation() {
        let provider = OpenAiSttProvider::new("test-key".to_string(), None, None);
        assert_eq!(provider.name(), "openai");
        assert_eq!(provider.model, "whisper-1");
    }

    #[test]
    fn test_blank_prompt_is_dropped() {
        let provider =
            OpenAiSttProvider::new("test-key".to_string(), None, Some("   ".to_string()));
        assert!(provider.clamped_prompt().is_none());
    }

    #[test]
    fn test_multibyte_prompt_under_limit_is_not_clamped() {
        // 220 chars but far more bytes; the clamp counts chars.
        let prompt = "£".repeat(220);
        let provider =
            OpenAiSttProvider::new("test-key".to_string(), None, Some(prompt.clone()));
        assert_eq!(provider.clamped_prompt().unwrap(), prompt);
    }

    #[test]
    fn test_long_whisper_prompt_is_clamped() {
        let long = "CIS VAT plumber ".repeat(40);
        let provider = OpenAiSttProvider::new("test-key".to_string(), None, Some(long));
        let clamped = provider.clamped_prompt().unwrap();
        assert_eq!(clamped.chars().count(), WHISPER_PROMPT_MAX_CHARS);
    }
}
