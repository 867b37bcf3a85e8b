//! Speech-to-text provider abstraction and per-owner rate limiting.
//!
//! Providers accept a bounded WAV buffer and return plain text. There is no
//! automatic retry anywhere in this pipeline: a failed transcription is
//! surfaced to the user, who re-records.

mod deepgram;
mod openai;

pub use deepgram::DeepgramSttProvider;
pub use openai::OpenAiSttProvider;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Errors that can occur during STT operations.
#[derive(Debug, thiserror::Error)]
pub enum SttError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("API error: {0}")]
    Api(String),

    #[error("Audio processing error: {0}")]
    Audio(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timeout: transcription took too long")]
    Timeout,
}

/// Trait for speech-to-text providers.
#[async_trait]
pub trait SttProvider: Send + Sync {
    /// Transcribe a WAV buffer to text. The buffer's header carries the
    /// sample rate and channel count the service needs.
    async fn transcribe(&self, audio: &[u8]) -> Result<String, SttError>;

    /// Get the name of this provider.
    fn name(&self) -> &'static str;
}

/// Per-owner sliding-window rate limiter for transcription calls.
///
/// The external STT services are metered per user per hour at this calling
/// layer; exceeding the window is reported as a distinct user-facing error by
/// the orchestrator, not a generic failure.
pub struct RateLimiter {
    max_per_window: usize,
    window: Duration,
    calls: Mutex<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_per_window: usize, window: Duration) -> Self {
        Self {
            max_per_window,
            window,
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Hourly limiter with the given per-owner call budget.
    pub fn hourly(max_per_hour: usize) -> Self {
        Self::new(max_per_hour, Duration::from_secs(3600))
    }

    /// Record an attempt for `owner_id`. Returns false when the owner has
    /// exhausted the window; the attempt is not recorded in that case.
    pub fn try_acquire(&self, owner_id: &str) -> bool {
        self.try_acquire_at(owner_id, Instant::now())
    }

    fn try_acquire_at(&self, owner_id: &str, now: Instant) -> bool {
        let mut calls = match self.calls.lock() {
            Ok(c) => c,
            // A poisoned limiter should never block invoicing.
            Err(poisoned) => poisoned.into_inner(),
        };

        let entry = calls.entry(owner_id.to_string()).or_default();
        entry.retain(|t| now.duration_since(*t) < self.window);

        if entry.len() >= self.max_per_window {
            return false;
        }
        entry.push(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct MockProvider;

    #[async_trait]
    impl SttProvider for MockProvider {
        async fn transcribe(&self, _audio: &[u8]) -> Result<String, SttError> {
            Ok("test transcript".to_string())
        }

        fn name(&self) -> &'static str {
            "mock"
        }
    }

    #[tokio::test]
    async fn test_mock_provider_roundtrip() {
        let provider: Arc<dyn SttProvider> = Arc::new(MockProvider);
        let text = provider.transcribe(&[0u8; 64]).await.unwrap();
        assert_eq!(text, "test transcript");
    }

    #[test]
    fn test_rate_limiter_allows_up_to_budget() {
        let limiter = RateLimiter::hourly(3);
        assert!(limiter.try_acquire("owner-a"));
        assert!(limiter.try_acquire("owner-a"));
        assert!(limiter.try_acquire("owner-a"));
        assert!(!limiter.try_acquire("owner-a"));
    }

    #[test]
    fn test_rate_limiter_is_per_owner() {
        let limiter = RateLimiter::hourly(1);
        assert!(limiter.try_acquire("owner-a"));
        assert!(!limiter.try_acquire("owner-a"));
        assert!(limiter.try_acquire("owner-b"));
    }

    #[test]
    fn test_rate_limiter_window_expiry() {
        let limiter = RateLimiter::new(1, Duration::from_millis(10));
        let start = Instant::now();
        assert!(limiter.try_acquire_at("owner-a", start));
        assert!(!limiter.try_acquire_at("owner-a", start + Duration::from_millis(5)));
        assert!(limiter.try_acquire_at("owner-a", start + Duration::from_millis(20)));
    }
}
