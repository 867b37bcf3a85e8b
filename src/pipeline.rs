//! Voice-to-invoice pipeline that orchestrates recording → STT → transcript
//! cleaning → field extraction → tax resolution → persistence.
//!
//! Hardening:
//! - Cancellation tokens for aborting an in-flight run
//! - Timeout on the STT request
//! - Proper error recovery (failures don't wedge the pipeline)
//! - Explicit state machine with guards
//! - Entitlement pre-check before the microphone is ever touched

use crate::audio_capture::{AudioCaptureError, SharedLevelMeter};
use crate::customers::CustomerStore;
use crate::draft::InvoiceDraft;
use crate::entitlements::{EntitlementCache, PlanAccess, PlanEntitlements};
use crate::extract::{extract, ExtractError};
use crate::invoices::{InvoiceStore, NewInvoice, PersistedInvoice, StoreError, UsageLog};
use crate::llm::LlmProvider;
use crate::normalize::{clean_transcript, NormalizeError};
use crate::session::{RecordingSession, SessionError, SessionEvent};
use crate::stt::{RateLimiter, SttError, SttProvider};
use crate::tax::{self, TaxCalculation};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default timeout for STT transcription requests.
const DEFAULT_TRANSCRIPTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Default per-owner STT call budget per hour.
const DEFAULT_MAX_TRANSCRIPTIONS_PER_HOUR: usize = 30;

/// Errors that can occur in the voice-to-invoice pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Invoice limit reached: {0}")]
    LimitReached(String),

    #[error("Microphone error: {0}")]
    Microphone(#[from] AudioCaptureError),

    #[error("Recording session error: {0}")]
    Session(SessionError),

    #[error("Too many transcription requests, try again later")]
    RateLimited,

    #[error("Transcription error: {0}")]
    Transcription(#[from] SttError),

    #[error("Transcript cleaning error: {0}")]
    Cleaning(#[from] NormalizeError),

    #[error("Extraction error: {0}")]
    Extraction(#[from] ExtractError),

    #[error("Entitlement check failed: {0}")]
    Entitlement(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Transcription timeout after {0:?}")]
    Timeout(Duration),

    #[error("Lock error: {0}")]
    Lock(String),
}

impl From<SessionError> for PipelineError {
    fn from(e: SessionError) -> Self {
        // Microphone failures keep their own variant so callers can tell a
        // device problem from a lifecycle misuse.
        match e {
            SessionError::Capture(inner) => PipelineError::Microphone(inner),
            other => PipelineError::Session(other),
        }
    }
}

/// Pipeline state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Idle, ready to start recording.
    Idle,
    /// Actively recording audio.
    Recording,
    /// Transcribing recorded audio.
    Transcribing,
    /// Cleaning the raw transcript.
    Cleaning,
    /// Extracting invoice fields.
    Extracting,
    /// Resolving tax flags and persisting the invoice.
    Saving,
    /// A stage failed (recoverable, a new recording can start).
    Error,
}

impl PipelineState {
    pub fn can_start_recording(&self) -> bool {
        matches!(self, PipelineState::Idle | PipelineState::Error)
    }

    pub fn can_stop_recording(&self) -> bool {
        matches!(self, PipelineState::Recording)
    }

    /// Cancellation is honoured while recording and while waiting on STT.
    /// Later stages run to completion; the invoice stays a draft either way.
    pub fn can_cancel(&self) -> bool {
        matches!(self, PipelineState::Recording | PipelineState::Transcribing)
    }
}

/// Configuration for the voice-to-invoice pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum recording duration in seconds.
    pub max_duration_secs: f32,
    /// Recordings shorter than this are discarded.
    pub min_duration_secs: f32,
    /// The owner's standard labour rate, per hour.
    pub labour_rate: f64,
    /// CIS deduction rate as a percentage.
    pub cis_rate: f64,
    /// VAT rate as a percentage.
    pub vat_rate: f64,
    /// Trade hint for extraction (e.g. "plumber"). Biases terminology only.
    pub trade_context: String,
    /// Timeout for the STT request.
    pub transcription_timeout: Duration,
    /// Per-owner STT call budget per hour.
    pub max_transcriptions_per_hour: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_duration_secs: crate::session::DEFAULT_MAX_DURATION_SECS,
            min_duration_secs: crate::session::MIN_DURATION_SECS,
            labour_rate: 0.0,
            cis_rate: tax::DEFAULT_CIS_RATE,
            vat_rate: tax::DEFAULT_VAT_RATE,
            trade_context: String::new(),
            transcription_timeout: DEFAULT_TRANSCRIPTION_TIMEOUT,
            max_transcriptions_per_hour: DEFAULT_MAX_TRANSCRIPTIONS_PER_HOUR,
        }
    }
}

/// Result of a completed pipeline run.
#[derive(Debug, Clone)]
pub struct CreatedInvoice {
    /// The persisted draft invoice.
    pub invoice: PersistedInvoice,
    /// The extracted draft, tri-state flags intact for UI follow-up prompts.
    pub draft: InvoiceDraft,
    /// Display tax breakdown recomputed from the stored inputs, rounded.
    pub tax: TaxCalculation,
    /// The cleaned transcript the invoice was built from.
    pub transcript: String,
    /// Length of the source recording in seconds.
    pub recording_secs: f32,
}

/// Internal state for the pipeline.
struct PipelineInner {
    session: RecordingSession,
    state: PipelineState,
    config: PipelineConfig,
    /// Cancellation token for the current run.
    cancel_token: Option<CancellationToken>,
}

impl PipelineInner {
    fn new(config: PipelineConfig) -> Self {
        let session =
            RecordingSession::with_limits(config.max_duration_secs, config.min_duration_secs);
        Self {
            session,
            state: PipelineState::Idle,
            config,
            cancel_token: None,
        }
    }

    /// Reset to idle, clearing any error condition.
    fn reset_to_idle(&mut self) {
        self.state = PipelineState::Idle;
        self.cancel_token = None;
    }

    fn set_error(&mut self, msg: &str) {
        log::error!("Pipeline error: {}", msg);
        self.state = PipelineState::Error;
        self.cancel_token = None;
    }
}

/// Thread-safe voice-to-invoice pipeline.
///
/// Uses a standard Mutex so it is Send + Sync for host-framework state
/// management. The mutex is held only for state transitions; network stages
/// run outside it.
pub struct SharedPipeline {
    inner: Arc<Mutex<PipelineInner>>,
    stt: Arc<dyn SttProvider>,
    llm: Arc<dyn LlmProvider>,
    plan: Arc<dyn PlanAccess>,
    customers: Arc<CustomerStore>,
    invoices: Arc<InvoiceStore>,
    usage: Arc<UsageLog>,
    rate_limiter: RateLimiter,
    entitlements: tokio::sync::Mutex<EntitlementCache>,
}

impl SharedPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: PipelineConfig,
        stt: Arc<dyn SttProvider>,
        llm: Arc<dyn LlmProvider>,
        plan: Arc<dyn PlanAccess>,
        customers: Arc<CustomerStore>,
        invoices: Arc<InvoiceStore>,
        usage: Arc<UsageLog>,
    ) -> Self {
        let rate_limiter = RateLimiter::hourly(config.max_transcriptions_per_hour);
        Self {
            inner: Arc::new(Mutex::new(PipelineInner::new(config))),
            stt,
            llm,
            plan,
            customers,
            invoices,
            usage,
            rate_limiter,
            entitlements: tokio::sync::Mutex::new(EntitlementCache::new()),
        }
    }

    /// Current pipeline state.
    pub fn state(&self) -> Result<PipelineState, PipelineError> {
        let inner = self
            .inner
            .lock()
            .map_err(|e| PipelineError::Lock(e.to_string()))?;
        Ok(inner.state)
    }

    /// Live input level meter (0-128) for UI feedback while recording.
    pub fn level_meter(&self) -> Result<SharedLevelMeter, PipelineError> {
        let inner = self
            .inner
            .lock()
            .map_err(|e| PipelineError::Lock(e.to_string()))?;
        Ok(inner.session.level_meter())
    }

    /// Seconds recorded so far in the current session.
    pub fn recording_duration_secs(&self) -> Result<f32, PipelineError> {
        let inner = self
            .inner
            .lock()
            .map_err(|e| PipelineError::Lock(e.to_string()))?;
        Ok(inner.session.duration_secs())
    }

    /// Drain session events (e.g. the ceiling auto-stop) since the last poll.
    pub fn poll_session_events(&self) -> Result<Vec<SessionEvent>, PipelineError> {
        let inner = self
            .inner
            .lock()
            .map_err(|e| PipelineError::Lock(e.to_string()))?;
        Ok(inner.session.poll_events())
    }

    async fn entitlements_for(&self, owner_id: &str) -> Result<PlanEntitlements, PipelineError> {
        let mut cache = self.entitlements.lock().await;
        cache
            .get(self.plan.as_ref(), owner_id)
            .await
            .map_err(|e| PipelineError::Entitlement(e.to_string()))
    }

    /// Start recording for the given owner.
    ///
    /// The plan allowance is checked first: an owner at their invoice limit
    /// is refused before the microphone is acquired.
    pub async fn start_recording(&self, owner_id: &str) -> Result<(), PipelineError> {
        let entitlements = self.entitlements_for(owner_id).await?;
        if !entitlements.invoice_allowance.allowed {
            let reason = entitlements
                .invoice_allowance
                .reason
                .unwrap_or_else(|| "plan limit reached".to_string());
            log::info!("Pipeline: Refusing recording for owner {}: {}", owner_id, reason);
            return Err(PipelineError::LimitReached(reason));
        }

        let mut inner = self
            .inner
            .lock()
            .map_err(|e| PipelineError::Lock(e.to_string()))?;

        if !inner.state.can_start_recording() {
            return Err(PipelineError::Session(SessionError::AlreadyRecording));
        }

        let cancel_token = CancellationToken::new();

        match inner.session.start() {
            Ok(()) => {
                inner.cancel_token = Some(cancel_token);
                inner.state = PipelineState::Recording;
                log::info!("Pipeline: Recording started for owner {}", owner_id);
                Ok(())
            }
            Err(e) => {
                // A failed start leaves the pipeline idle; nothing was acquired.
                inner.reset_to_idle();
                log::warn!("Pipeline: Failed to start recording: {}", e);
                Err(e.into())
            }
        }
    }

    /// Cancel the current run, discarding any captured audio.
    pub fn cancel(&self) -> Result<(), PipelineError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| PipelineError::Lock(e.to_string()))?;

        if !inner.state.can_cancel() {
            return Err(PipelineError::Session(SessionError::NotRecording));
        }

        if let Some(token) = &inner.cancel_token {
            token.cancel();
        }
        if inner.state == PipelineState::Recording {
            let _ = inner.session.cancel();
            inner.reset_to_idle();
        }
        log::info!("Pipeline: Run cancelled");
        Ok(())
    }

    /// Stop recording and run the full pipeline, returning the persisted
    /// draft invoice.
    ///
    /// Stages: transcription → cleaning → extraction → tax flag resolution →
    /// customer resolution → persistence → best-effort usage logging.
    pub async fn stop_and_create_invoice(
        &self,
        owner_id: &str,
    ) -> Result<CreatedInvoice, PipelineError> {
        // Phase 1: stop the recording and snapshot run inputs (holds the lock
        // briefly, no awaits).
        let (wav_bytes, recording_secs, config, cancel_token) = {
            let mut inner = self
                .inner
                .lock()
                .map_err(|e| PipelineError::Lock(e.to_string()))?;

            if !inner.state.can_stop_recording() {
                return Err(PipelineError::Session(SessionError::NotRecording));
            }

            let (wav_bytes, duration) = match inner.session.finish() {
                Ok(out) => out,
                Err(e @ SessionError::TooShort { .. }) => {
                    // An accidental tap is not a fault; stay ready.
                    inner.reset_to_idle();
                    return Err(e.into());
                }
                Err(e) => {
                    inner.set_error(&format!("Failed to stop recording: {}", e));
                    return Err(e.into());
                }
            };

            inner.state = PipelineState::Transcribing;
            let cancel_token = inner
                .cancel_token
                .clone()
                .unwrap_or_else(CancellationToken::new);

            (wav_bytes, duration, inner.config.clone(), cancel_token)
        };

        self.run_stages(owner_id, wav_bytes, recording_secs, &config, cancel_token)
            .await
    }

    /// Run the full pipeline from already-captured WAV audio.
    ///
    /// Used to retry a failed run from persisted audio without re-recording.
    /// Subject to the same entitlement and rate-limit checks as a live run.
    pub async fn create_invoice_from_wav(
        &self,
        owner_id: &str,
        wav_bytes: Vec<u8>,
        recording_secs: f32,
    ) -> Result<CreatedInvoice, PipelineError> {
        let entitlements = self.entitlements_for(owner_id).await?;
        if !entitlements.invoice_allowance.allowed {
            let reason = entitlements
                .invoice_allowance
                .reason
                .unwrap_or_else(|| "plan limit reached".to_string());
            return Err(PipelineError::LimitReached(reason));
        }

        let (config, cancel_token) = {
            let mut inner = self
                .inner
                .lock()
                .map_err(|e| PipelineError::Lock(e.to_string()))?;

            // A retry may not interrupt a live run.
            if !inner.state.can_start_recording() {
                return Err(PipelineError::Session(SessionError::AlreadyRecording));
            }

            inner.state = PipelineState::Transcribing;
            let cancel_token = CancellationToken::new();
            inner.cancel_token = Some(cancel_token.clone());
            (inner.config.clone(), cancel_token)
        };

        self.run_stages(owner_id, wav_bytes, recording_secs, &config, cancel_token)
            .await
    }

    async fn run_stages(
        &self,
        owner_id: &str,
        wav_bytes: Vec<u8>,
        recording_secs: f32,
        config: &PipelineConfig,
        cancel_token: CancellationToken,
    ) -> Result<CreatedInvoice, PipelineError> {
        // The rate limit guards the STT call itself, so a discarded recording
        // never consumes budget.
        if !self.rate_limiter.try_acquire(owner_id) {
            self.fail("transcription rate limit exhausted")?;
            return Err(PipelineError::RateLimited);
        }

        log::info!(
            "Pipeline: Starting transcription ({} bytes, {:.2}s, timeout {:?})",
            wav_bytes.len(),
            recording_secs,
            config.transcription_timeout
        );

        // Phase 2: STT, racing cancellation and the timeout.
        let timeout = config.transcription_timeout;
        let stt = self.stt.clone();
        let transcription_future = async { stt.transcribe(&wav_bytes).await };

        let stt_result = tokio::select! {
            biased;

            _ = cancel_token.cancelled() => {
                log::info!("Pipeline: Transcription cancelled");
                Err(PipelineError::Cancelled)
            }

            _ = tokio::time::sleep(timeout) => {
                log::warn!("Pipeline: Transcription timed out after {:?}", timeout);
                Err(PipelineError::Timeout(timeout))
            }

            result = transcription_future => {
                result.map_err(PipelineError::from)
            }
        };

        let raw_transcript = match stt_result {
            Ok(t) => t,
            Err(e) => {
                let mut inner = self
                    .inner
                    .lock()
                    .map_err(|err| PipelineError::Lock(err.to_string()))?;
                if matches!(e, PipelineError::Cancelled) {
                    inner.reset_to_idle();
                } else {
                    inner.set_error(&e.to_string());
                }
                return Err(e);
            }
        };
        log::info!("Pipeline: STT complete, {} chars", raw_transcript.len());

        // Phase 3: clean the transcript.
        self.set_state(PipelineState::Cleaning)?;
        let cleaned = match clean_transcript(self.llm.as_ref(), &raw_transcript).await {
            Ok(t) => t,
            Err(e) => {
                self.fail(&format!("Transcript cleaning failed: {}", e))?;
                return Err(e.into());
            }
        };
        log::info!("Pipeline: Cleaning complete, {} chars", cleaned.len());

        // Phase 4: extract invoice fields.
        self.set_state(PipelineState::Extracting)?;
        let draft = match extract(self.llm.as_ref(), &cleaned, &config.trade_context).await {
            Ok(d) => d,
            Err(e) => {
                self.fail(&format!("Extraction failed: {}", e))?;
                return Err(e.into());
            }
        };

        // Phase 5: resolve flags and persist.
        self.set_state(PipelineState::Saving)?;
        let result = self
            .save_invoice(owner_id, config, draft, &cleaned, recording_secs)
            .await;

        match result {
            Ok(created) => {
                self.set_state(PipelineState::Idle)?;
                log::info!(
                    "Pipeline: Complete, invoice {} created for owner {}",
                    created.invoice.id,
                    owner_id
                );
                Ok(created)
            }
            Err(e) => {
                self.fail(&e.to_string())?;
                Err(e)
            }
        }
    }

    async fn save_invoice(
        &self,
        owner_id: &str,
        config: &PipelineConfig,
        draft: InvoiceDraft,
        transcript: &str,
        recording_secs: f32,
    ) -> Result<CreatedInvoice, PipelineError> {
        let entitlements = self.entitlements_for(owner_id).await?;

        // A plan without the scheme always stores false, whatever was said.
        // Otherwise an unresolved flag stores false and the draft keeps its
        // tri-state so the UI can ask.
        let cis_enabled = entitlements.cis_enabled && draft.cis_job.resolve_or(false);
        let vat_enabled = entitlements.vat_enabled && draft.vat_registered.resolve_or(false);

        let customer_id = self
            .customers
            .ensure_customer(owner_id, &draft.customer_name)?;

        let invoice = self.invoices.create(NewInvoice {
            owner_id: owner_id.to_string(),
            customer_id,
            job_summary: draft.job_summary.clone(),
            labour_hours: draft.labour_hours,
            labour_rate: config.labour_rate,
            cis_enabled,
            cis_rate: config.cis_rate,
            vat_enabled,
            vat_rate: config.vat_rate,
            materials: draft.materials.clone(),
            notes: (!draft.notes.is_empty()).then(|| draft.notes.clone()),
        })?;

        // Usage logging is best-effort: the invoice exists, so a log failure
        // must not fail the run.
        if let Err(e) = self.usage.append(
            owner_id,
            &invoice.id,
            transcript.chars().count(),
            recording_secs,
        ) {
            log::warn!("Pipeline: Failed to record usage event: {}", e);
        }

        let tax = tax::calculate(
            invoice.labour_hours,
            invoice.labour_rate,
            &invoice.materials,
            invoice.cis_enabled,
            invoice.cis_rate,
            invoice.vat_enabled,
            invoice.vat_rate,
        )
        .rounded();

        Ok(CreatedInvoice {
            invoice,
            draft,
            tax,
            transcript: transcript.to_string(),
            recording_secs,
        })
    }

    fn set_state(&self, state: PipelineState) -> Result<(), PipelineError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| PipelineError::Lock(e.to_string()))?;
        if state == PipelineState::Idle {
            inner.reset_to_idle();
        } else {
            inner.state = state;
        }
        Ok(())
    }

    fn fail(&self, msg: &str) -> Result<(), PipelineError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| PipelineError::Lock(e.to_string()))?;
        inner.set_error(msg);
        Ok(())
    }
}
