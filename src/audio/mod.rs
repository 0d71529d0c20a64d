//! Audio I/O for the live session
//!
//! Microphone capture and speaker playback both use CPAL. Each CPAL stream
//! lives on its own device thread (streams are `!Send`); the session only
//! holds `Send` handles that talk to those threads through channels.

pub mod capture;
pub mod output;
pub mod pcm;
pub mod playback;

pub use capture::{BlockAssembler, CaptureControl, CaptureHandle, CapturePipeline};
pub use output::{CpalOutput, Mixer};
pub use pcm::{
    decode_base64, decode_blob, decode_pcm16, encode_input_block, encode_pcm16, AudioBuffer,
    DecodeError, PcmBlob, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE,
};
pub use playback::{PlaybackDevice, PlaybackScheduler, ScheduleOutcome, Ticket, UnitId};

use std::thread::JoinHandle;

use tokio::sync::mpsc;

/// Frames per microphone block handed to the encoder
pub const CAPTURE_BLOCK_SIZE: usize = 4096;

/// Notifications raised from device threads
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// A scheduled playback unit finished naturally
    UnitEnded(UnitId),
    /// The device reported an error; treated as fatal to the session
    Fault(String),
}

/// Unbounded so audio callbacks never block or lose an end notification
pub type DeviceEventSender = mpsc::UnboundedSender<DeviceEvent>;
pub type DeviceEventReceiver = mpsc::UnboundedReceiver<DeviceEvent>;

/// Errors that can occur while opening or driving audio devices.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioError {
    NoInputDevice,
    NoOutputDevice,
    NoSupportedConfig,
    StreamCreationFailed(String),
    StreamPlayFailed(String),
    DeviceThreadFailed(String),
}

impl std::fmt::Display for AudioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioError::NoInputDevice => write!(f, "No audio input device found"),
            AudioError::NoOutputDevice => write!(f, "No audio output device found"),
            AudioError::NoSupportedConfig => write!(f, "No supported audio configuration"),
            AudioError::StreamCreationFailed(e) => {
                write!(f, "Failed to create audio stream: {}", e)
            }
            AudioError::StreamPlayFailed(e) => write!(f, "Failed to start audio stream: {}", e),
            AudioError::DeviceThreadFailed(e) => write!(f, "Audio device thread failed: {}", e),
        }
    }
}

impl std::error::Error for AudioError {}

/// Let a device thread finish after it has been told to stop
///
/// On a tokio runtime the join moves to the blocking pool so the caller
/// returns at once; elsewhere it joins in place.
fn join_device_thread(thread: JoinHandle<()>, name: &'static str) {
    let join = move || {
        if thread.join().is_err() {
            log::warn!("{}: device thread panicked during shutdown", name);
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(join);
        }
        Err(_) => join(),
    }
}

/// Pick a stream config at `preferred_rate` if the device supports it,
/// otherwise fall back to the device default.
fn pick_config<I>(
    ranges: Option<I>,
    default: Result<cpal::SupportedStreamConfig, cpal::DefaultStreamConfigError>,
    preferred_rate: u32,
) -> Result<cpal::SupportedStreamConfig, AudioError>
where
    I: Iterator<Item = cpal::SupportedStreamConfigRange>,
{
    if let Some(ranges) = ranges {
        let mut candidates: Vec<_> = ranges
            .filter(|r| {
                r.min_sample_rate().0 <= preferred_rate && r.max_sample_rate().0 >= preferred_rate
            })
            .collect();
        // Fewest channels first: mono capture, simplest output
        candidates.sort_by_key(|r| r.channels());
        if let Some(range) = candidates.into_iter().next() {
            return Ok(range.with_sample_rate(cpal::SampleRate(preferred_rate)));
        }
    }

    default.map_err(|_| AudioError::NoSupportedConfig)
}
