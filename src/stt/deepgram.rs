//! Deepgram STT provider (`/v1/listen`).

use super::{SttError, SttProvider};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Url;
use std::time::Duration;

const DEFAULT_MODEL: &str = "nova-2";

pub struct DeepgramSttProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl DeepgramSttProvider {
    /// Create a new Deepgram STT provider.
    pub fn new(api_key: String, model: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        }
    }

    /// Build the /v1/listen URL.
    ///
    /// `smart_format` keeps numerals and currency readable, which matters for
    /// the amounts the extractor depends on; `punctuate` keeps sentence
    /// boundaries usable by the canonicalizer.
    fn listen_url(&self) -> Result<Url, SttError> {
        let mut url = Url::parse("https://api.deepgram.com/v1/listen")
            .map_err(|e| SttError::Config(format!("Invalid Deepgram base URL: {}", e)))?;

        url.query_pairs_mut()
            .append_pair("model", &self.model)
            .append_pair("smart_format", "true")
            .append_pair("punctuate", "true");

        Ok(url)
    }
}

#[async_trait]
impl SttProvider for DeepgramSttProvider {
    async fn transcribe(&self, audio: &[u8]) -> Result<String, SttError> {
        if self.api_key.is_empty() {
            return Err(SttError::Config(
                "Deepgram STT provider requires an API key".to_string(),
            ));
        }

        let url = self.listen_url()?;

        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Token {}", self.api_key))
            .header(CONTENT_TYPE, "audio/wav")
            .body(audio.to_vec())
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
                "Deepgram API error ({}): {}",
                status, error_text
            )));
        }

        let result: serde_json::Value = response.json().await?;

        let transcript = result["results"]["channels"][0]["alternatives"][0]["transcript"]
            .as_str()
            .unwrap_or("")
            .to_string();

        Ok(transcript)
    }

    fn name(&self) -> &'static str {
        "deepgram"
    }
}
