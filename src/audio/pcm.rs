//! PCM16 wire codec for the live session
//!
//! Outbound microphone blocks are float samples in [-1.0, 1.0]; the wire wants
//! little-endian signed 16-bit PCM, base64-wrapped and tagged with a MIME
//! descriptor such as `audio/pcm;rate=16000`. Inbound speech arrives in the
//! same shape at 24kHz and is decoded back into float buffers for playback.
//!
//! Both directions are pure and synchronous.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

/// Sample rate of microphone audio sent to the service
pub const INPUT_SAMPLE_RATE: u32 = 16000;

/// Sample rate of synthesized speech received from the service
pub const OUTPUT_SAMPLE_RATE: u32 = 24000;

/// Divisor used for both directions so encode/decode are symmetric
const PCM16_SCALE: f32 = 32768.0;

/// Errors raised when an inbound chunk violates the PCM16 contract
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Base64 payload could not be decoded
    InvalidBase64(String),
    /// Byte length is not a whole number of 16-bit samples
    OddLength(usize),
    /// Sample count does not divide evenly across channels
    ChannelMismatch { samples: usize, channels: u16 },
    /// Zero channels requested
    NoChannels,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::InvalidBase64(e) => write!(f, "Invalid base64 audio payload: {}", e),
            DecodeError::OddLength(len) => {
                write!(f, "PCM16 payload has odd length ({} bytes)", len)
            }
            DecodeError::ChannelMismatch { samples, channels } => write!(
                f,
                "{} samples cannot be split across {} channels",
                samples, channels
            ),
            DecodeError::NoChannels => write!(f, "Channel count must be at least 1"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// One encoded chunk ready for the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PcmBlob {
    /// MIME descriptor, e.g. `audio/pcm;rate=16000`
    pub mime_type: String,
    /// Base64-encoded little-endian PCM16 samples
    pub data: String,
}

impl PcmBlob {
    /// Number of PCM16 samples carried (derived from the base64 length)
    pub fn sample_count(&self) -> usize {
        let padding = self.data.bytes().rev().take_while(|&b| b == b'=').count();
        (self.data.len() / 4 * 3).saturating_sub(padding) / 2
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Decoded, device-ready audio: one sample vector per channel
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    sample_rate: u32,
    channels: Vec<Vec<f32>>,
}

impl AudioBuffer {
    /// Build a buffer from planar channel data
    ///
    /// All channels are expected to have the same length; shorter ones are
    /// padded with silence.
    pub fn from_channels(sample_rate: u32, mut channels: Vec<Vec<f32>>) -> Self {
        let frames = channels.iter().map(Vec::len).max().unwrap_or(0);
        for ch in channels.iter_mut() {
            ch.resize(frames, 0.0);
        }
        Self {
            sample_rate,
            channels,
        }
    }

    /// Single-channel buffer
    pub fn mono(sample_rate: u32, samples: Vec<f32>) -> Self {
        Self::from_channels(sample_rate, vec![samples])
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Number of frames (samples per channel)
    pub fn frames(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.frames() == 0
    }

    /// Playback duration in seconds
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.channels.get(index).map(Vec::as_slice)
    }
}

/// Encode float samples into a wire chunk at the given rate
///
/// Samples are clamped to [-1.0, 1.0] and scaled to the signed 16-bit range.
/// Empty input yields a chunk with an empty payload.
pub fn encode_pcm16(samples: &[f32], sample_rate: u32) -> PcmBlob {
    let bytes: Vec<u8> = samples
        .iter()
        .flat_map(|&s| float_to_i16(s).to_le_bytes())
        .collect();

    PcmBlob {
        mime_type: pcm_mime_type(sample_rate),
        data: STANDARD.encode(&bytes),
    }
}

/// Encode a microphone block at the fixed input rate (16kHz)
pub fn encode_input_block(samples: &[f32]) -> PcmBlob {
    encode_pcm16(samples, INPUT_SAMPLE_RATE)
}

/// Decode raw little-endian PCM16 bytes into an interleaved-to-planar buffer
///
/// Samples are distributed round-robin across `channels`. Odd byte lengths
/// and sample counts that don't divide across channels are rejected.
pub fn decode_pcm16(
    bytes: &[u8],
    sample_rate: u32,
    channels: u16,
) -> Result<AudioBuffer, DecodeError> {
    if channels == 0 {
        return Err(DecodeError::NoChannels);
    }
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddLength(bytes.len()));
    }

    let sample_count = bytes.len() / 2;
    let channel_count = channels as usize;
    if sample_count % channel_count != 0 {
        return Err(DecodeError::ChannelMismatch {
            samples: sample_count,
            channels,
        });
    }

    let frames = sample_count / channel_count;
    let mut planar = vec![Vec::with_capacity(frames); channel_count];
    for (i, pair) in bytes.chunks_exact(2).enumerate() {
        let sample = i16::from_le_bytes([pair[0], pair[1]]);
        planar[i % channel_count].push(sample as f32 / PCM16_SCALE);
    }

    Ok(AudioBuffer {
        sample_rate,
        channels: planar,
    })
}

/// Strip the base64 wire wrapping from an inbound payload
pub fn decode_base64(data: &str) -> Result<Vec<u8>, DecodeError> {
    STANDARD
        .decode(data)
        .map_err(|e| DecodeError::InvalidBase64(e.to_string()))
}

/// Decode a wire chunk (base64 + MIME) into a mono buffer
///
/// The `rate=` parameter of the MIME descriptor wins; otherwise
/// `default_rate` is used.
pub fn decode_blob(
    data: &str,
    mime_type: Option<&str>,
    default_rate: u32,
) -> Result<AudioBuffer, DecodeError> {
    let bytes = decode_base64(data)?;
    let rate = mime_type.and_then(parse_mime_rate).unwrap_or(default_rate);
    decode_pcm16(&bytes, rate, 1)
}

/// Build the MIME descriptor for raw PCM at a rate
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// Extract the `rate=` parameter from a MIME descriptor like `audio/pcm;rate=24000`
pub fn parse_mime_rate(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("rate"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .filter(|&rate| rate > 0)
}

/// Streaming linear-interpolation resampler
///
/// Keeps the fractional read position and the last input sample between
/// calls, so feeding a signal in arbitrary chunks gives the same output as
/// feeding it in one piece. Rates that match (or are zero) pass through.
#[derive(Debug, Clone)]
pub struct LinearResampler {
    /// Input samples advanced per output sample
    step: f64,
    /// Read position of the next output, relative to the next chunk's first
    /// sample. Lies in [-1, 0) when it falls between `last` and that sample.
    position: f64,
    last: Option<f32>,
}

impl LinearResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        let step = if from_rate == 0 || to_rate == 0 {
            log::warn!(
                "Invalid sample rate (source: {}, target: {}), passing audio through",
                from_rate,
                to_rate
            );
            1.0
        } else {
            from_rate as f64 / to_rate as f64
        };
        Self {
            step,
            position: 0.0,
            last: None,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.step == 1.0
    }

    /// Resample the next chunk of a continuous signal
    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if self.is_passthrough() || input.is_empty() {
            return input.to_vec();
        }

        let last_index = (input.len() - 1) as f64;
        let mut output = Vec::with_capacity((input.len() as f64 / self.step).ceil() as usize + 1);
        let mut pos = self.position;

        while pos <= last_index {
            let base = pos.floor();
            let frac = (pos - base) as f32;
            let (s0, s1) = if base < 0.0 {
                (self.last.unwrap_or(input[0]), input[0])
            } else {
                let i = base as usize;
                let s0 = input[i];
                (s0, input.get(i + 1).copied().unwrap_or(s0))
            };
            output.push(s0 + frac * (s1 - s0));
            pos += self.step;
        }

        self.position = pos - input.len() as f64;
        self.last = input.last().copied();
        output
    }

    /// Forget the carried phase, e.g. before an unrelated signal
    pub fn reset(&mut self) {
        self.position = 0.0;
        self.last = None;
    }
}

/// Linearly stretch `input` to exactly `frames` samples
///
/// Used where the output length is fixed by the timeline rather than by the
/// rate ratio.
pub fn stretch_to_len(input: &[f32], frames: usize) -> Vec<f32> {
    if input.len() == frames {
        return input.to_vec();
    }
    let Some(&tail) = input.last() else {
        return vec![0.0; frames];
    };

    let step = input.len() as f64 / frames as f64;
    (0..frames)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = pos.floor() as usize;
            let frac = (pos - idx as f64) as f32;
            let s0 = input.get(idx).copied().unwrap_or(tail);
            let s1 = input.get(idx + 1).copied().unwrap_or(s0);
            s0 + frac * (s1 - s0)
        })
        .collect()
}

fn float_to_i16(sample: f32) -> i16 {
    // NaN maps to silence
    if sample.is_nan() {
        return 0;
    }
    let scaled = (sample.clamp(-1.0, 1.0) * PCM16_SCALE).round();
    scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_bytes(blob: &PcmBlob) -> Vec<u8> {
        decode_base64(&blob.data).unwrap()
    }

    #[test]
    fn test_encode_little_endian_and_mime() {
        let blob = encode_input_block(&[0.0, 0.5, -0.5]);
        assert_eq!(blob.mime_type, "audio/pcm;rate=16000");

        let bytes = raw_bytes(&blob);
        // 0.5 * 32768 = 16384 = 0x4000, -16384 = 0xC000
        assert_eq!(bytes, vec![0x00, 0x00, 0x00, 0x40, 0x00, 0xC0]);
    }

    #[test]
    fn test_encode_clamps_out_of_range() {
        let bytes = raw_bytes(&encode_input_block(&[1.0, 2.5, -1.0, -7.0]));
        let samples: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|p| i16::from_le_bytes([p[0], p[1]]))
            .collect();
        assert_eq!(samples, vec![i16::MAX, i16::MAX, i16::MIN, i16::MIN]);
    }

    #[test]
    fn test_encode_nan_is_silence() {
        let bytes = raw_bytes(&encode_input_block(&[f32::NAN]));
        assert_eq!(bytes, vec![0, 0]);
    }

    #[test]
    fn test_empty_input_both_directions() {
        let blob = encode_input_block(&[]);
        assert!(blob.is_empty());
        assert_eq!(blob.sample_count(), 0);

        let buffer = decode_pcm16(&[], OUTPUT_SAMPLE_RATE, 1).unwrap();
        assert!(buffer.is_empty());
        assert_eq!(buffer.duration(), 0.0);
    }

    #[test]
    fn test_round_trip_within_quantization() {
        let samples: Vec<f32> = (0..512)
            .map(|i| ((i as f32) * 0.037).sin() * 0.9)
            .chain([1.0, -1.0, 0.0, 1.0 / 32768.0])
            .collect();

        let blob = encode_input_block(&samples);
        assert_eq!(blob.sample_count(), samples.len());

        let decoded = decode_pcm16(&raw_bytes(&blob), INPUT_SAMPLE_RATE, 1).unwrap();
        let channel = decoded.channel(0).unwrap();
        assert_eq!(channel.len(), samples.len());
        for (orig, back) in samples.iter().zip(channel) {
            assert!(
                (orig - back).abs() <= 1.0 / 32768.0,
                "{} vs {}",
                orig,
                back
            );
        }
    }

    #[test]
    fn test_decode_stereo_round_robin() {
        // L=16384, R=-16384, L=0, R=8192
        let bytes = [0x00, 0x40, 0x00, 0xC0, 0x00, 0x00, 0x00, 0x20];
        let buffer = decode_pcm16(&bytes, 24000, 2).unwrap();

        assert_eq!(buffer.channel_count(), 2);
        assert_eq!(buffer.frames(), 2);
        assert_eq!(buffer.channel(0).unwrap(), &[0.5, 0.0]);
        assert_eq!(buffer.channel(1).unwrap(), &[-0.5, 0.25]);
    }

    #[test]
    fn test_decode_rejects_odd_length() {
        let err = decode_pcm16(&[0, 1, 2], 24000, 1).unwrap_err();
        assert_eq!(err, DecodeError::OddLength(3));
    }

    #[test]
    fn test_decode_rejects_channel_mismatch() {
        let err = decode_pcm16(&[0, 0, 0, 0, 0, 0], 24000, 2).unwrap_err();
        assert!(matches!(err, DecodeError::ChannelMismatch { samples: 3, .. }));

        let err = decode_pcm16(&[0, 0], 24000, 0).unwrap_err();
        assert_eq!(err, DecodeError::NoChannels);
    }

    #[test]
    fn test_duration() {
        let buffer = decode_pcm16(&vec![0u8; 4800], 24000, 1).unwrap();
        // 2400 samples at 24kHz = 100ms
        assert_eq!(buffer.frames(), 2400);
        assert!((buffer.duration() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_decode_blob_uses_mime_rate() {
        let blob = encode_pcm16(&[0.25; 160], 8000);
        let buffer = decode_blob(&blob.data, Some(&blob.mime_type), 24000).unwrap();
        assert_eq!(buffer.sample_rate(), 8000);

        let buffer = decode_blob(&blob.data, None, 24000).unwrap();
        assert_eq!(buffer.sample_rate(), 24000);

        assert!(matches!(
            decode_blob("not base64!!", None, 24000),
            Err(DecodeError::InvalidBase64(_))
        ));
    }

    #[test]
    fn test_parse_mime_rate() {
        assert_eq!(parse_mime_rate("audio/pcm;rate=24000"), Some(24000));
        assert_eq!(parse_mime_rate("audio/pcm; Rate = 16000"), Some(16000));
        assert_eq!(parse_mime_rate("audio/pcm"), None);
        assert_eq!(parse_mime_rate("audio/pcm;rate=abc"), None);
        assert_eq!(parse_mime_rate("audio/pcm;rate=0"), None);
    }

    #[test]
    fn test_resampler_same_rate_passes_through() {
        let mut resampler = LinearResampler::new(16000, 16000);
        let input = vec![0.1, 0.2, 0.3];
        assert!(resampler.is_passthrough());
        assert_eq!(resampler.process(&input), input);
    }

    #[test]
    fn test_resampler_downsample_picks_every_third() {
        // 48kHz -> 16kHz = 3:1
        let mut resampler = LinearResampler::new(48000, 16000);
        let input: Vec<f32> = (0..48).map(|i| i as f32).collect();
        let output = resampler.process(&input);
        assert_eq!(output.len(), 16);
        assert_eq!(output[1], 3.0);
        assert_eq!(output[15], 45.0);
    }

    #[test]
    fn test_resampler_upsample_interpolates_across_chunks() {
        let mut resampler = LinearResampler::new(24000, 48000);
        assert_eq!(resampler.process(&[0.0, 1.0]), vec![0.0, 0.5, 1.0]);
        // The point between the chunks is interpolated from the carried sample
        assert_eq!(resampler.process(&[2.0]), vec![1.5, 2.0]);
    }

    #[test]
    fn test_resampler_chunked_matches_whole_signal() {
        let signal: Vec<f32> = (0..44_100).map(|i| ((i as f32) * 0.01).sin()).collect();

        let whole = LinearResampler::new(44_100, 16_000).process(&signal);

        let mut resampler = LinearResampler::new(44_100, 16_000);
        let mut chunked = Vec::new();
        for chunk in signal.chunks(437) {
            chunked.extend(resampler.process(chunk));
        }

        assert_eq!(chunked.len(), whole.len());
        for (a, b) in chunked.iter().zip(whole.iter()) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn test_resampler_zero_rate_passes_through() {
        let input = vec![0.1, 0.2];
        assert_eq!(LinearResampler::new(0, 16000).process(&input), input);
        assert_eq!(LinearResampler::new(48000, 0).process(&input), input);
    }

    #[test]
    fn test_stretch_to_len() {
        assert_eq!(stretch_to_len(&[0.1, 0.2], 2), vec![0.1, 0.2]);
        assert_eq!(stretch_to_len(&[0.0, 1.0], 4), vec![0.0, 0.5, 1.0, 1.0]);
        assert_eq!(stretch_to_len(&[], 3), vec![0.0; 3]);
        assert!(stretch_to_len(&[0.5; 10], 0).is_empty());
    }
}
