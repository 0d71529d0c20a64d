//! Microphone capture pipeline using CPAL
//!
//! Pulls audio from the default input device, downmixes to mono, resamples
//! to 16kHz and cuts fixed 4096-sample blocks. Each block is encoded to a
//! PCM16 wire chunk and offered to the outbound transport with `try_send`:
//! if the transport can't take it right now the block is dropped. Stale
//! microphone audio has no value, so there is no backlog.
//!
//! ```text
//! CPAL callback ──▶ downmix ──▶ resample ──▶ BlockAssembler ──▶ encode ──▶ try_send
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Sample, SampleFormat, StreamConfig};
use tokio::sync::mpsc;

use super::pcm::{encode_pcm16, LinearResampler, PcmBlob};
use super::{join_device_thread, pick_config, AudioError, DeviceEvent, DeviceEventSender};

/// Anything the session can tear down as "the microphone"
pub trait CaptureControl: Send {
    /// Stop the callback and release the device. Idempotent.
    fn shutdown(&mut self);
}

/// Cuts a resampled mono stream into fixed-size blocks
///
/// Callback buffers are treated as one continuous signal: the resampler
/// phase carries over from one `push` to the next.
///
/// Thread-safety: This struct is NOT internally synchronized.
#[derive(Debug)]
pub struct BlockAssembler {
    resampler: LinearResampler,
    block_size: usize,
    pending: Vec<f32>,
}

impl BlockAssembler {
    pub fn new(source_rate: u32, target_rate: u32, block_size: usize) -> Self {
        Self {
            resampler: LinearResampler::new(source_rate, target_rate),
            block_size: block_size.max(1),
            pending: Vec::with_capacity(block_size * 2),
        }
    }

    /// Feed mono samples at the source rate; returns every completed block
    pub fn push(&mut self, mono: &[f32]) -> Vec<Vec<f32>> {
        let resampled = self.resampler.process(mono);
        self.pending.extend(resampled);

        let mut blocks = Vec::new();
        while self.pending.len() >= self.block_size {
            blocks.push(self.pending.drain(..self.block_size).collect());
        }
        blocks
    }

    /// Samples waiting for the next block
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Average interleaved frames down to one channel
pub fn downmix_to_mono(interleaved: &[f32], channels: u16) -> Vec<f32> {
    let channels = channels.max(1) as usize;
    if channels == 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Hand one block to the transport, dropping it if the transport can't take it
///
/// Returns true if the chunk was accepted.
pub fn offer_block(block: &[f32], sample_rate: u32, chunks: &mpsc::Sender<PcmBlob>) -> bool {
    match chunks.try_send(encode_pcm16(block, sample_rate)) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            log::debug!("Capture: transport busy, block dropped");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            log::trace!("Capture: transport closed, block dropped");
            false
        }
    }
}

/// Capture settings
#[derive(Debug, Clone)]
pub struct CapturePipeline {
    /// Rate sent on the wire (16kHz)
    pub target_sample_rate: u32,
    /// Samples per outbound block (4096)
    pub block_size: usize,
}

impl Default for CapturePipeline {
    fn default() -> Self {
        Self {
            target_sample_rate: super::INPUT_SAMPLE_RATE,
            block_size: super::CAPTURE_BLOCK_SIZE,
        }
    }
}

impl CapturePipeline {
    /// Open the default microphone and start streaming blocks into `chunks`
    ///
    /// Device denial or absence surfaces here as an error.
    pub fn start(
        &self,
        chunks: mpsc::Sender<PcmBlob>,
        events: DeviceEventSender,
    ) -> Result<CaptureHandle, AudioError> {
        let is_capturing = Arc::new(AtomicBool::new(true));
        let blocks_sent = Arc::new(AtomicU64::new(0));
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), AudioError>>();
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();

        let settings = self.clone();
        let flag = is_capturing.clone();
        let counter = blocks_sent.clone();

        let thread = std::thread::Builder::new()
            .name("astra-capture".to_string())
            .spawn(move || {
                let stream = match settings.build_input_stream(chunks, events, flag, counter) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                let _ = shutdown_rx.recv();
                if let Err(e) = stream.pause() {
                    log::debug!("Capture: pause during shutdown failed: {}", e);
                }
                drop(stream);
                log::info!("Capture: microphone released");
            })
            .map_err(|e| AudioError::DeviceThreadFailed(e.to_string()))?;

        ready_rx
            .recv()
            .map_err(|e| AudioError::DeviceThreadFailed(e.to_string()))??;

        log::info!(
            "Capture: started ({} Hz, {}-sample blocks)",
            self.target_sample_rate,
            self.block_size
        );

        Ok(CaptureHandle {
            is_capturing,
            blocks_sent,
            shutdown_tx: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    fn build_input_stream(
        &self,
        chunks: mpsc::Sender<PcmBlob>,
        events: DeviceEventSender,
        is_capturing: Arc<AtomicBool>,
        blocks_sent: Arc<AtomicU64>,
    ) -> Result<cpal::Stream, AudioError> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(AudioError::NoInputDevice)?;

        log::info!("Using audio input device: {:?}", device.name());

        let supported = pick_config(
            device.supported_input_configs().ok(),
            device.default_input_config(),
            self.target_sample_rate,
        )?;

        log::info!(
            "Audio config: {} Hz, {} channels, {:?}",
            supported.sample_rate().0,
            supported.channels(),
            supported.sample_format()
        );

        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.into();
        let assembler = BlockAssembler::new(
            config.sample_rate.0,
            self.target_sample_rate,
            self.block_size,
        );

        let fault_events = events;
        let err_fn = move |err: cpal::StreamError| {
            log::error!("Audio stream error: {}", err);
            let _ = fault_events.send(DeviceEvent::Fault(err.to_string()));
        };

        let stream = match sample_format {
            SampleFormat::I16 => self.build_stream_typed::<i16>(
                &device,
                &config,
                assembler,
                chunks,
                is_capturing,
                blocks_sent,
                err_fn,
            ),
            SampleFormat::U16 => self.build_stream_typed::<u16>(
                &device,
                &config,
                assembler,
                chunks,
                is_capturing,
                blocks_sent,
                err_fn,
            ),
            SampleFormat::F32 => self.build_stream_typed::<f32>(
                &device,
                &config,
                assembler,
                chunks,
                is_capturing,
                blocks_sent,
                err_fn,
            ),
            _ => Err(AudioError::NoSupportedConfig),
        }?;

        stream
            .play()
            .map_err(|e| AudioError::StreamPlayFailed(e.to_string()))?;

        Ok(stream)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_stream_typed<T>(
        &self,
        device: &cpal::Device,
        config: &StreamConfig,
        mut assembler: BlockAssembler,
        chunks: mpsc::Sender<PcmBlob>,
        is_capturing: Arc<AtomicBool>,
        blocks_sent: Arc<AtomicU64>,
        err_fn: impl FnMut(cpal::StreamError) + Send + 'static,
    ) -> Result<cpal::Stream, AudioError>
    where
        T: cpal::SizedSample + Send + 'static,
        f32: cpal::FromSample<T>,
    {
        let channels = config.channels;
        let target_rate = self.target_sample_rate;

        device
            .build_input_stream(
                config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    if !is_capturing.load(Ordering::SeqCst) {
                        return;
                    }

                    let floats: Vec<f32> = data.iter().map(|&s| f32::from_sample(s)).collect();
                    let mono = downmix_to_mono(&floats, channels);

                    for block in assembler.push(&mono) {
                        if offer_block(&block, target_rate, &chunks) {
                            let sent = blocks_sent.fetch_add(1, Ordering::Relaxed) + 1;
                            if sent % 50 == 0 {
                                log::debug!("Capture: sent {} blocks", sent);
                            }
                        }
                    }
                },
                err_fn,
                None,
            )
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))
    }
}

/// Handle to the running microphone stream
///
/// Dropping the handle releases the microphone.
pub struct CaptureHandle {
    is_capturing: Arc<AtomicBool>,
    blocks_sent: Arc<AtomicU64>,
    shutdown_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    pub fn blocks_sent(&self) -> u64 {
        self.blocks_sent.load(Ordering::Relaxed)
    }

    pub fn is_capturing(&self) -> bool {
        self.is_capturing.load(Ordering::SeqCst)
    }
}

impl CaptureControl for CaptureHandle {
    fn shutdown(&mut self) {
        // Silence the callback first so nothing is emitted during teardown
        self.is_capturing.store(false, Ordering::SeqCst);

        let Some(tx) = self.shutdown_tx.take() else {
            return;
        };
        let _ = tx.send(());
        if let Some(thread) = self.thread.take() {
            join_device_thread(thread, "Capture");
        }
        log::info!("Capture: stopped after {} blocks", self.blocks_sent());
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
