//! Speaker output using CPAL
//!
//! `CpalOutput` implements [`PlaybackDevice`] on top of a CPAL output stream.
//! The stream callback pulls from a [`Mixer`] that holds every scheduled unit
//! with its start frame; the mixer's rendered-frame counter is the device
//! clock. Units that finish inside a callback are reported as
//! [`DeviceEvent::UnitEnded`].

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};

use super::pcm::{stretch_to_len, AudioBuffer};
use super::playback::{PlaybackDevice, UnitId};
use super::{join_device_thread, pick_config, AudioError, DeviceEvent, DeviceEventSender};

struct Voice {
    unit: UnitId,
    start_frame: u64,
    /// Planar samples already at the mixer rate
    channels: Vec<Vec<f32>>,
}

impl Voice {
    fn len(&self) -> u64 {
        self.channels.first().map(Vec::len).unwrap_or(0) as u64
    }

    fn end_frame(&self) -> u64 {
        self.start_frame + self.len()
    }

    fn sample(&self, channel: usize, index: usize) -> f32 {
        let ch = channel.min(self.channels.len().saturating_sub(1));
        self.channels
            .get(ch)
            .and_then(|c| c.get(index))
            .copied()
            .unwrap_or(0.0)
    }
}

/// Sample-accurate mixer of scheduled playback units
///
/// Thread-safety: This struct is NOT internally synchronized.
/// `CpalOutput` shares it with the audio callback behind a `Mutex`.
pub struct Mixer {
    voices: Vec<Voice>,
    frames_rendered: u64,
    sample_rate: u32,
    channels: u16,
}

impl Mixer {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            voices: Vec::new(),
            frames_rendered: 0,
            sample_rate,
            channels: channels.max(1),
        }
    }

    /// Device clock in seconds
    pub fn clock(&self) -> f64 {
        self.frames_rendered as f64 / self.sample_rate as f64
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn voice_count(&self) -> usize {
        self.voices.len()
    }

    /// Queue a buffer at `start_at` seconds
    ///
    /// The unit covers the frames from `start_at` up to `start_at + duration`,
    /// both rounded to the device rate, so a unit scheduled at the previous
    /// unit's end starts on the very next frame. Start times already in the
    /// past are clamped to the current frame so the unit plays from its
    /// beginning.
    pub fn add(&mut self, unit: UnitId, buffer: &AudioBuffer, start_at: f64) {
        let rate = self.sample_rate as f64;
        let start_at = start_at.max(0.0);
        let requested = (start_at * rate).round() as u64;
        let end = ((start_at + buffer.duration()) * rate).round() as u64;
        let frames = end.saturating_sub(requested) as usize;

        let channels = (0..buffer.channel_count())
            .filter_map(|i| buffer.channel(i))
            .map(|samples| stretch_to_len(samples, frames))
            .collect();

        self.voices.push(Voice {
            unit,
            start_frame: requested.max(self.frames_rendered),
            channels,
        });
    }

    /// Drop a unit without reporting it as ended
    pub fn remove(&mut self, unit: UnitId) -> bool {
        let before = self.voices.len();
        self.voices.retain(|v| v.unit != unit);
        self.voices.len() != before
    }

    /// Render one interleaved block, advancing the clock
    ///
    /// Units whose last frame falls inside the block are removed and pushed
    /// onto `ended`.
    pub fn render(&mut self, out: &mut [f32], ended: &mut Vec<UnitId>) {
        out.fill(0.0);

        let channels = self.channels as usize;
        let frames = out.len() / channels;
        let block_start = self.frames_rendered;
        let block_end = block_start + frames as u64;

        for voice in &self.voices {
            let from = voice.start_frame.max(block_start);
            let to = voice.end_frame().min(block_end);
            for t in from..to {
                let src = (t - voice.start_frame) as usize;
                let dst = (t - block_start) as usize * channels;
                for c in 0..channels {
                    out[dst + c] += voice.sample(c, src);
                }
            }
        }

        for s in out.iter_mut() {
            *s = s.clamp(-1.0, 1.0);
        }

        self.frames_rendered = block_end;
        self.voices.retain(|v| {
            if v.end_frame() <= block_end {
                ended.push(v.unit);
                false
            } else {
                true
            }
        });
    }

    pub fn clear(&mut self) {
        self.voices.clear();
    }
}

fn lock_mixer(mixer: &Mutex<Mixer>) -> MutexGuard<'_, Mixer> {
    mixer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Output device backed by the default CPAL output
pub struct CpalOutput {
    mixer: Arc<Mutex<Mixer>>,
    shutdown_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalOutput {
    /// Open the default output device, preferring `preferred_rate`
    ///
    /// Blocks until the stream is playing or has failed to start.
    pub fn open(preferred_rate: u32, events: DeviceEventSender) -> Result<Self, AudioError> {
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<Arc<Mutex<Mixer>>, AudioError>>();
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("astra-output".to_string())
            .spawn(move || {
                let stream = match build_output_stream(preferred_rate, events) {
                    Ok((stream, mixer)) => {
                        let _ = ready_tx.send(Ok(mixer));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Park until shutdown is requested or the handle is dropped
                let _ = shutdown_rx.recv();
                if let Err(e) = stream.pause() {
                    log::debug!("Output: pause during shutdown failed: {}", e);
                }
                drop(stream);
                log::info!("Output: stream closed");
            })
            .map_err(|e| AudioError::DeviceThreadFailed(e.to_string()))?;

        let mixer = ready_rx
            .recv()
            .map_err(|e| AudioError::DeviceThreadFailed(e.to_string()))??;

        Ok(Self {
            mixer,
            shutdown_tx: Some(shutdown_tx),
            thread: Some(thread),
        })
    }
}

impl PlaybackDevice for CpalOutput {
    fn current_time(&self) -> f64 {
        lock_mixer(&self.mixer).clock()
    }

    fn schedule(
        &mut self,
        unit: UnitId,
        buffer: AudioBuffer,
        start_at: f64,
    ) -> Result<(), AudioError> {
        if self.shutdown_tx.is_none() {
            return Err(AudioError::StreamPlayFailed(
                "output already shut down".to_string(),
            ));
        }
        lock_mixer(&self.mixer).add(unit, &buffer, start_at);
        Ok(())
    }

    fn stop(&mut self, unit: UnitId) {
        lock_mixer(&self.mixer).remove(unit);
    }

    fn shutdown(&mut self) {
        let Some(tx) = self.shutdown_tx.take() else {
            return;
        };
        lock_mixer(&self.mixer).clear();
        let _ = tx.send(());
        if let Some(thread) = self.thread.take() {
            join_device_thread(thread, "Output");
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn build_output_stream(
    preferred_rate: u32,
    events: DeviceEventSender,
) -> Result<(cpal::Stream, Arc<Mutex<Mixer>>), AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(AudioError::NoOutputDevice)?;

    log::info!("Using audio output device: {:?}", device.name());

    let supported = pick_config(
        device.supported_output_configs().ok(),
        device.default_output_config(),
        preferred_rate,
    )?;

    log::info!(
        "Output config: {} Hz, {} channels, {:?}",
        supported.sample_rate().0,
        supported.channels(),
        supported.sample_format()
    );

    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.into();
    let mixer = Arc::new(Mutex::new(Mixer::new(
        config.sample_rate.0,
        config.channels,
    )));

    let stream = match sample_format {
        SampleFormat::F32 => build_stream_typed::<f32>(&device, &config, mixer.clone(), events),
        SampleFormat::I16 => build_stream_typed::<i16>(&device, &config, mixer.clone(), events),
        SampleFormat::U16 => build_stream_typed::<u16>(&device, &config, mixer.clone(), events),
        _ => Err(AudioError::NoSupportedConfig),
    }?;

    stream
        .play()
        .map_err(|e| AudioError::StreamPlayFailed(e.to_string()))?;

    Ok((stream, mixer))
}

fn build_stream_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mixer: Arc<Mutex<Mixer>>,
    events: DeviceEventSender,
) -> Result<cpal::Stream, AudioError>
where
    T: cpal::SizedSample + cpal::FromSample<f32> + Send + 'static,
{
    let fault_events = events.clone();
    let err_fn = move |err: cpal::StreamError| {
        log::error!("Output stream error: {}", err);
        let _ = fault_events.send(DeviceEvent::Fault(err.to_string()));
    };

    let mut scratch: Vec<f32> = Vec::new();
    let mut ended: Vec<UnitId> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                scratch.resize(data.len(), 0.0);
                lock_mixer(&mixer).render(&mut scratch, &mut ended);

                for (out, &s) in data.iter_mut().zip(scratch.iter()) {
                    *out = T::from_sample(s);
                }
                for unit in ended.drain(..) {
                    let _ = events.send(DeviceEvent::UnitEnded(unit));
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(seq: u64) -> UnitId {
        UnitId::new(0, seq)
    }

    #[test]
    fn test_clock_advances_with_render() {
        let mut mixer = Mixer::new(1000, 2);
        let mut out = vec![0.0; 200]; // 100 frames stereo
        let mut ended = Vec::new();

        mixer.render(&mut out, &mut ended);
        assert!((mixer.clock() - 0.1).abs() < 1e-9);
        assert!(ended.is_empty());
    }

    #[test]
    fn test_back_to_back_units_render_without_gap() {
        let mut mixer = Mixer::new(1000, 1);
        mixer.add(unit(0), &AudioBuffer::mono(1000, vec![0.5; 3]), 0.0);
        mixer.add(unit(1), &AudioBuffer::mono(1000, vec![0.25; 2]), 0.003);

        let mut out = vec![0.0; 6];
        let mut ended = Vec::new();
        mixer.render(&mut out, &mut ended);

        assert_eq!(out, vec![0.5, 0.5, 0.5, 0.25, 0.25, 0.0]);
        assert_eq!(ended, vec![unit(0), unit(1)]);
        assert_eq!(mixer.voice_count(), 0);
    }

    #[test]
    fn test_unit_spanning_blocks_ends_once() {
        let mut mixer = Mixer::new(1000, 1);
        mixer.add(unit(0), &AudioBuffer::mono(1000, vec![0.1; 5]), 0.002);

        let mut ended = Vec::new();
        let mut out = vec![0.0; 4];
        mixer.render(&mut out, &mut ended);
        assert_eq!(out, vec![0.0, 0.0, 0.1, 0.1]);
        assert!(ended.is_empty());

        mixer.render(&mut out, &mut ended);
        assert_eq!(out, vec![0.1, 0.1, 0.1, 0.0]);
        assert_eq!(ended, vec![unit(0)]);
    }

    #[test]
    fn test_past_start_is_clamped_to_now() {
        let mut mixer = Mixer::new(1000, 1);
        let mut out = vec![0.0; 10];
        let mut ended = Vec::new();
        mixer.render(&mut out, &mut ended);

        mixer.add(unit(0), &AudioBuffer::mono(1000, vec![0.3; 2]), 0.0);
        let mut out = vec![0.0; 3];
        mixer.render(&mut out, &mut ended);
        assert_eq!(out, vec![0.3, 0.3, 0.0]);
    }

    #[test]
    fn test_removed_unit_is_silent_and_not_reported() {
        let mut mixer = Mixer::new(1000, 1);
        mixer.add(unit(0), &AudioBuffer::mono(1000, vec![0.5; 4]), 0.0);
        assert!(mixer.remove(unit(0)));
        assert!(!mixer.remove(unit(0)));

        let mut out = vec![0.0; 4];
        let mut ended = Vec::new();
        mixer.render(&mut out, &mut ended);
        assert_eq!(out, vec![0.0; 4]);
        assert!(ended.is_empty());
    }

    #[test]
    fn test_mono_unit_fills_all_output_channels() {
        let mut mixer = Mixer::new(1000, 2);
        mixer.add(unit(0), &AudioBuffer::mono(1000, vec![0.5, -0.5]), 0.0);

        let mut out = vec![0.0; 4];
        let mut ended = Vec::new();
        mixer.render(&mut out, &mut ended);
        assert_eq!(out, vec![0.5, 0.5, -0.5, -0.5]);
    }

    #[test]
    fn test_overlap_is_clipped() {
        let mut mixer = Mixer::new(1000, 1);
        mixer.add(unit(0), &AudioBuffer::mono(1000, vec![0.8; 2]), 0.0);
        mixer.add(unit(1), &AudioBuffer::mono(1000, vec![0.8; 2]), 0.0);

        let mut out = vec![0.0; 2];
        let mut ended = Vec::new();
        mixer.render(&mut out, &mut ended);
        assert_eq!(out, vec![1.0, 1.0]);
    }

    #[test]
    fn test_resamples_to_device_rate() {
        let mut mixer = Mixer::new(2000, 1);
        // 1000 Hz source, 4 frames = 4ms -> 8 frames at 2000 Hz
        mixer.add(unit(0), &AudioBuffer::mono(1000, vec![0.2; 4]), 0.0);

        let mut out = vec![0.0; 8];
        let mut ended = Vec::new();
        mixer.render(&mut out, &mut ended);
        assert!(out.iter().all(|&s| (s - 0.2).abs() < 1e-6));
        assert_eq!(ended, vec![unit(0)]);
    }

    #[test]
    fn test_consecutive_units_tile_at_uneven_rate() {
        // 24kHz speech on a 44.1kHz device: 1004 samples is 1844.85 frames
        let mut mixer = Mixer::new(44100, 1);
        let mut cursor = 0.0;
        for seq in 0..4 {
            let buffer = AudioBuffer::mono(24000, vec![0.5; 1004 + seq as usize * 7]);
            mixer.add(unit(seq), &buffer, cursor);
            cursor += buffer.duration();
        }
        let total = (cursor * 44100.0).round() as usize;

        let mut rendered = Vec::new();
        let mut ended = Vec::new();
        let mut block = vec![0.0; 441];
        while rendered.len() < total + 441 {
            mixer.render(&mut block, &mut ended);
            rendered.extend_from_slice(&block);
        }

        let gaps: Vec<usize> = (0..total).filter(|&i| rendered[i] == 0.0).collect();
        assert!(gaps.is_empty(), "silent frames inside the stream: {:?}", gaps);
        assert!(rendered[total..].iter().all(|&s| s == 0.0));
        assert_eq!(ended, (0..4).map(unit).collect::<Vec<_>>());
    }
}
