//! Audio capture using cpal for cross-platform microphone input.
//!
//! Capture runs on a dedicated thread (cpal streams are not Send) with a
//! command channel for shutdown. Samples accumulate in a shared buffer and
//! are encoded to WAV at stop time. A [`SharedLevelMeter`] publishes a live
//! 0–128 input level for UI feedback while recording.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;
use hound::{WavSpec, WavWriter};
use std::io::Cursor;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex as StdMutex};
use std::thread::{self, JoinHandle};

/// Errors that can occur during audio capture.
#[derive(Debug, thiserror::Error)]
pub enum AudioCaptureError {
    #[error("No input device available")]
    NoInputDevice,

    #[error("Microphone permission denied or device unavailable: {0}")]
    DeviceConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuild(String),

    #[error("Failed to start audio stream: {0}")]
    StreamStart(String),

    #[error("Failed to encode audio: {0}")]
    Encoding(String),
}

/// Audio buffer that accumulates samples during recording.
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
    max_duration_secs: f32,
}

impl AudioBuffer {
    pub fn new(sample_rate: u32, channels: u16, max_duration_secs: f32) -> Self {
        let capacity = (sample_rate as f32 * max_duration_secs * channels as f32) as usize;
        Self {
            samples: Vec::with_capacity(capacity),
            sample_rate,
            channels,
            max_duration_secs,
        }
    }

    /// Append samples, dropping anything past the duration ceiling.
    ///
    /// The ceiling is enforced here as well as by the session watchdog so the
    /// encoded recording can never exceed the bound even if a stop is late by
    /// a tick.
    pub fn append(&mut self, new_samples: &[f32]) {
        let max_samples =
            (self.sample_rate as f32 * self.max_duration_secs * self.channels as f32) as usize;
        let remaining = max_samples.saturating_sub(self.samples.len());
        if remaining == 0 {
            return;
        }
        let take = remaining.min(new_samples.len());
        self.samples.extend_from_slice(&new_samples[..take]);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration of buffered audio in seconds.
    pub fn duration_secs(&self) -> f32 {
        self.samples.len() as f32 / (self.sample_rate as f32 * self.channels as f32)
    }

    /// Convert the buffer contents to 16-bit PCM WAV bytes.
    pub fn to_wav_bytes(&self) -> Result<Vec<u8>, AudioCaptureError> {
        let spec = WavSpec {
            channels: self.channels,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = WavWriter::new(&mut cursor, spec)
                .map_err(|e| AudioCaptureError::Encoding(e.to_string()))?;

            for &sample in &self.samples {
                let sample_i16 = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                writer
                    .write_sample(sample_i16)
                    .map_err(|e| AudioCaptureError::Encoding(e.to_string()))?;
            }

            writer
                .finalize()
                .map_err(|e| AudioCaptureError::Encoding(e.to_string()))?;
        }

        Ok(cursor.into_inner())
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }
}

/// Live input level for UI feedback, 0–128.
///
/// Smoothed instantaneous amplitude of the most recent capture callback, not
/// a moving average over time: responsive, and noisy by design. Cheap to
/// clone and read from any thread.
#[derive(Clone, Default)]
pub struct SharedLevelMeter {
    level: Arc<AtomicU32>,
}

impl SharedLevelMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current level, 0–128.
    pub fn level(&self) -> u8 {
        self.level.load(Ordering::Relaxed).min(128) as u8
    }

    /// Feed one callback's samples into the meter.
    pub(crate) fn update(&self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        let mean_abs: f32 =
            samples.iter().map(|s| s.abs()).sum::<f32>() / samples.len() as f32;
        let instant = (mean_abs * 128.0 * 4.0).min(128.0);
        let previous = self.level.load(Ordering::Relaxed) as f32;
        // Light exponential smoothing to avoid flicker without hiding peaks.
        let smoothed = previous * 0.5 + instant * 0.5;
        self.level.store(smoothed as u32, Ordering::Relaxed);
    }

    /// Zero the meter on release so a dead session never shows a live level.
    pub(crate) fn reset(&self) {
        self.level.store(0, Ordering::Relaxed);
    }
}

/// Commands sent to the capture thread.
enum CaptureCommand {
    Stop,
}

struct CaptureHandle {
    command_tx: mpsc::Sender<CaptureCommand>,
    thread_handle: JoinHandle<Result<(), AudioCaptureError>>,
}

/// Thread-safe audio capture manager.
///
/// Owns the microphone exclusively while active. `stop` (and `Drop`) release
/// the device deterministically on every exit path.
pub struct AudioCapture {
    buffer: Arc<StdMutex<AudioBuffer>>,
    capture_handle: Option<CaptureHandle>,
    level_meter: SharedLevelMeter,
    sample_rate: u32,
    channels: u16,
}

impl AudioCapture {
    pub fn new() -> Self {
        Self {
            buffer: Arc::new(StdMutex::new(AudioBuffer::new(44100, 1, 120.0))),
            capture_handle: None,
            level_meter: SharedLevelMeter::new(),
            sample_rate: 44100,
            channels: 1,
        }
    }

    /// Handle for reading the live input level without touching the capture.
    pub fn level_meter(&self) -> SharedLevelMeter {
        self.level_meter.clone()
    }

    /// Start recording from the default input device.
    ///
    /// Fails without acquiring anything when no device is available or its
    /// configuration cannot be read (typically a permission denial).
    pub fn start(&mut self, max_duration_secs: f32) -> Result<(), AudioCaptureError> {
        // Stop any existing recording first.
        self.stop();

        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(AudioCaptureError::NoInputDevice)?;

        let config = device
            .default_input_config()
            .map_err(|e| AudioCaptureError::DeviceConfig(e.to_string()))?;

        self.sample_rate = config.sample_rate().0;
        self.channels = config.channels();

        log::info!(
            "Audio config: {} Hz, {} channels, {:?}",
            self.sample_rate,
            self.channels,
            config.sample_format()
        );

        self.buffer = Arc::new(StdMutex::new(AudioBuffer::new(
            self.sample_rate,
            self.channels,
            max_duration_secs,
        )));
        self.level_meter.reset();

        let buffer = self.buffer.clone();
        let meter = self.level_meter.clone();
        let (command_tx, command_rx) = mpsc::channel();
        let sample_format = config.sample_format();
        let stream_config: cpal::StreamConfig = config.into();

        let thread_handle = thread::spawn(move || {
            run_capture_thread(device, stream_config, sample_format, buffer, meter, command_rx)
        });

        self.capture_handle = Some(CaptureHandle {
            command_tx,
            thread_handle,
        });

        log::info!("Audio capture started");
        Ok(())
    }

    /// Stop recording and return the captured audio as WAV bytes plus its
    /// duration in seconds.
    pub fn stop_and_get_wav(&mut self) -> Result<(Vec<u8>, f32), AudioCaptureError> {
        self.stop();

        let buffer = self
            .buffer
            .lock()
            .map_err(|_| AudioCaptureError::Encoding("Failed to lock buffer".to_string()))?;

        let duration = buffer.duration_secs();
        let wav_bytes = buffer.to_wav_bytes()?;

        log::info!(
            "Audio capture stopped, {} bytes captured ({:.2}s)",
            wav_bytes.len(),
            duration
        );

        Ok((wav_bytes, duration))
    }

    /// Stop recording and release the device without returning audio.
    pub fn stop(&mut self) {
        if let Some(handle) = self.capture_handle.take() {
            log::info!("Stopping audio capture");
            // Ignore send errors: the thread may already have exited.
            let _ = handle.command_tx.send(CaptureCommand::Stop);
            let _ = handle.thread_handle.join();
        }
        self.level_meter.reset();
    }

    /// Check if currently recording.
    pub fn is_recording(&self) -> bool {
        self.capture_handle.is_some()
    }

    /// Duration of recorded audio so far, in seconds.
    pub fn duration_secs(&self) -> f32 {
        self.buffer.lock().map(|b| b.duration_secs()).unwrap_or(0.0)
    }
}

impl Default for AudioCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run the audio capture on a dedicated thread.
fn run_capture_thread(
    device: cpal::Device,
    config: cpal::StreamConfig,
    sample_format: SampleFormat,
    buffer: Arc<StdMutex<AudioBuffer>>,
    meter: SharedLevelMeter,
    command_rx: mpsc::Receiver<CaptureCommand>,
) -> Result<(), AudioCaptureError> {
    use cpal::Sample;

    let err_fn = |err| {
        log::error!("Audio stream error: {}", err);
    };

    let stream = match sample_format {
        SampleFormat::F32 => {
            let buffer = buffer.clone();
            let meter = meter.clone();
            device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    meter.update(data);
                    if let Ok(mut buf) = buffer.lock() {
                        buf.append(data);
                    }
                },
                err_fn,
                None,
            )
        }
        SampleFormat::I16 => {
            let buffer = buffer.clone();
            let meter = meter.clone();
            device.build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let samples: Vec<f32> = data.iter().map(|&s| s.to_float_sample()).collect();
                    meter.update(&samples);
                    if let Ok(mut buf) = buffer.lock() {
                        buf.append(&samples);
                    }
                },
                err_fn,
                None,
            )
        }
        SampleFormat::U16 => {
            let buffer = buffer.clone();
            let meter = meter.clone();
            device.build_input_stream(
                &config,
                move |data: &[u16], _: &cpal::InputCallbackInfo| {
                    let samples: Vec<f32> = data.iter().map(|&s| s.to_float_sample()).collect();
                    meter.update(&samples);
                    if let Ok(mut buf) = buffer.lock() {
                        buf.append(&samples);
                    }
                },
                err_fn,
                None,
            )
        }
        _ => {
            return Err(AudioCaptureError::DeviceConfig(format!(
                "Unsupported sample format: {:?}",
                sample_format
            )));
        }
    }
    .map_err(|e| AudioCaptureError::StreamBuild(e.to_string()))?;

    stream
        .play()
        .map_err(|e| AudioCaptureError::StreamStart(e.to_string()))?;

    // Wait for stop; the stream drops (and the device releases) on return.
    loop {
        match command_rx.recv_timeout(std::time::Duration::from_millis(100)) {
            Ok(CaptureCommand::Stop) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_buffer_creation() {
        let buffer = AudioBuffer::new(16000, 1, 60.0);
        assert!(buffer.is_empty());
        assert_eq!(buffer.sample_rate(), 16000);
        assert_eq!(buffer.channels(), 1);
    }

    #[test]
    fn test_audio_buffer_append_and_duration() {
        let mut buffer = AudioBuffer::new(1000, 1, 60.0);
        buffer.append(&[0.0; 500]);
        assert_eq!(buffer.len(), 500);
        assert!((buffer.duration_secs() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_audio_buffer_never_exceeds_ceiling() {
        let mut buffer = AudioBuffer::new(1000, 1, 1.0);
        // Two seconds offered against a one second ceiling.
        buffer.append(&[0.0; 1500]);
        buffer.append(&[0.0; 500]);
        assert_eq!(buffer.len(), 1000);
        assert!((buffer.duration_secs() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_audio_buffer_keeps_earliest_audio_at_ceiling() {
        let mut buffer = AudioBuffer::new(4, 1, 1.0);
        buffer.append(&[0.1, 0.2, 0.3]);
        buffer.append(&[0.4, 0.5, 0.6]);
        // The start of the recording is what matters; overflow is dropped.
        assert_eq!(buffer.len(), 4);
    }

    #[test]
    fn test_audio_buffer_to_wav() {
        let mut buffer = AudioBuffer::new(16000, 1, 60.0);
        buffer.append(&[0.0; 1600]);
        let wav_bytes = buffer.to_wav_bytes().expect("Failed to encode WAV");

        // 44-byte WAV header plus samples.
        assert!(wav_bytes.len() > 44);
        assert_eq!(&wav_bytes[0..4], b"RIFF");
    }

    #[test]
    fn test_level_meter_silence_is_zero() {
        let meter = SharedLevelMeter::new();
        meter.update(&[0.0; 256]);
        assert_eq!(meter.level(), 0);
    }

    #[test]
    fn test_level_meter_full_scale_clamps_at_128() {
        let meter = SharedLevelMeter::new();
        // Repeated updates converge on the clamped instantaneous value.
        for _ in 0..16 {
            meter.update(&[1.0; 256]);
        }
        assert_eq!(meter.level(), 128);
    }

    #[test]
    fn test_level_meter_resets_on_release() {
        let meter = SharedLevelMeter::new();
        for _ in 0..8 {
            meter.update(&[0.8; 256]);
        }
        assert!(meter.level() > 0);
        meter.reset();
        assert_eq!(meter.level(), 0);
    }
}
