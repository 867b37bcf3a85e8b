//! Recording session lifecycle.
//!
//! Wraps [`AudioCapture`](crate::audio_capture::AudioCapture) in an explicit
//! state machine with a duration ceiling and floor. A watchdog thread ticks
//! once a second while recording and auto-stops the session at the ceiling,
//! emitting [`SessionEvent::MaxDurationReached`] so callers can surface it.

use crate::audio_capture::{AudioCapture, AudioCaptureError, SharedLevelMeter};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Default maximum recording length in seconds.
pub const DEFAULT_MAX_DURATION_SECS: f32 = 120.0;

/// Recordings shorter than this are discarded as accidental taps.
pub const MIN_DURATION_SECS: f32 = 1.0;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Capture(#[from] AudioCaptureError),

    #[error("No recording in progress")]
    NotRecording,

    #[error("Already recording")]
    AlreadyRecording,

    #[error("Recording too short ({actual:.2}s, minimum {minimum:.1}s)")]
    TooShort { actual: f32, minimum: f32 },
}

/// Events emitted by the session watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// One-second progress heartbeat while recording.
    Tick { elapsed_secs: u32 },
    /// The duration ceiling was hit and the recording stopped automatically.
    MaxDurationReached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Idle,
    Recording,
}

struct Watchdog {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// A single recording session.
///
/// State transitions: Idle -> Recording on `start`, back to Idle via `finish`
/// (returning audio), `cancel` (discarding it), or the watchdog hitting the
/// ceiling. A failed `start` leaves the session Idle.
pub struct RecordingSession {
    capture: Arc<Mutex<AudioCapture>>,
    state: SessionState,
    max_duration_secs: f32,
    min_duration_secs: f32,
    watchdog: Option<Watchdog>,
    event_rx: Option<mpsc::Receiver<SessionEvent>>,
}

impl RecordingSession {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_DURATION_SECS, MIN_DURATION_SECS)
    }

    pub fn with_limits(max_duration_secs: f32, min_duration_secs: f32) -> Self {
        Self {
            capture: Arc::new(Mutex::new(AudioCapture::new())),
            state: SessionState::Idle,
            max_duration_secs,
            min_duration_secs,
            watchdog: None,
            event_rx: None,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.state == SessionState::Recording
    }

    /// Live input level meter for the current capture, 0-128.
    pub fn level_meter(&self) -> SharedLevelMeter {
        self.capture
            .lock()
            .map(|c| c.level_meter())
            .unwrap_or_default()
    }

    /// Seconds of audio captured so far.
    pub fn duration_secs(&self) -> f32 {
        self.capture
            .lock()
            .map(|c| c.duration_secs())
            .unwrap_or(0.0)
    }

    /// Drain any events the watchdog produced since the last poll.
    pub fn poll_events(&self) -> Vec<SessionEvent> {
        match &self.event_rx {
            Some(rx) => rx.try_iter().collect(),
            None => Vec::new(),
        }
    }

    /// Begin recording from the default input device.
    pub fn start(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Recording {
            return Err(SessionError::AlreadyRecording);
        }

        {
            let mut capture = self
                .capture
                .lock()
                .map_err(|_| AudioCaptureError::DeviceConfig("capture lock poisoned".into()))?;
            capture.start(self.max_duration_secs)?;
        }

        let (event_tx, event_rx) = mpsc::channel();
        self.event_rx = Some(event_rx);
        self.spawn_watchdog(event_tx);
        self.state = SessionState::Recording;
        log::info!("Recording session started (ceiling {:.0}s)", self.max_duration_secs);
        Ok(())
    }

    /// Stop recording and return the captured audio as WAV bytes with its
    /// duration.
    ///
    /// Recordings below the floor are discarded and reported as
    /// [`SessionError::TooShort`].
    pub fn finish(&mut self) -> Result<(Vec<u8>, f32), SessionError> {
        if self.state != SessionState::Recording {
            return Err(SessionError::NotRecording);
        }
        self.stop_watchdog();
        self.state = SessionState::Idle;

        let (wav, duration) = {
            let mut capture = self
                .capture
                .lock()
                .map_err(|_| AudioCaptureError::Encoding("capture lock poisoned".into()))?;
            capture.stop_and_get_wav()?
        };

        if duration < self.min_duration_secs {
            log::warn!(
                "Recording discarded: {:.2}s below the {:.1}s floor",
                duration,
                self.min_duration_secs
            );
            return Err(SessionError::TooShort {
                actual: duration,
                minimum: self.min_duration_secs,
            });
        }

        Ok((wav, duration))
    }

    /// Abort the recording and discard all captured audio.
    pub fn cancel(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Recording {
            return Err(SessionError::NotRecording);
        }
        self.stop_watchdog();
        self.state = SessionState::Idle;

        if let Ok(mut capture) = self.capture.lock() {
            capture.stop();
        }
        log::info!("Recording session cancelled, audio discarded");
        Ok(())
    }

    fn spawn_watchdog(&mut self, event_tx: mpsc::Sender<SessionEvent>) {
        let (stop_tx, stop_rx) = mpsc::channel();
        let capture = self.capture.clone();
        let ceiling = self.max_duration_secs;

        let handle = thread::spawn(move || loop {
            match stop_rx.recv_timeout(Duration::from_secs(1)) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => return,
                Err(mpsc::RecvTimeoutError::Timeout) => {}
            }
            let elapsed = capture.lock().map(|c| c.duration_secs()).unwrap_or(0.0);
            let _ = event_tx.send(SessionEvent::Tick {
                elapsed_secs: elapsed as u32,
            });
            if elapsed >= ceiling {
                log::info!("Recording hit the {:.0}s ceiling, stopping", ceiling);
                if let Ok(mut c) = capture.lock() {
                    c.stop();
                }
                let _ = event_tx.send(SessionEvent::MaxDurationReached);
                return;
            }
        });

        self.watchdog = Some(Watchdog { stop_tx, handle });
    }

    fn stop_watchdog(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            let _ = watchdog.stop_tx.send(());
            let _ = watchdog.handle.join();
        }
    }
}

impl Default for RecordingSession {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        self.stop_watchdog();
        if let Ok(mut capture) = self.capture.lock() {
            capture.stop();
        }
    }
}
