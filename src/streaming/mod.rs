//! Streaming transport for the live voice session
//!
//! This module provides WebSocket-based streaming to the Live API: microphone
//! chunks go out as `realtimeInput`, synthesized speech and transcripts come
//! back as `serverContent`.
//!
//! # Architecture
//!
//! ```text
//! CaptureHandle ──try_send──▶ writer task ──▶ WebSocket ──▶ Live API
//!                                                              │
//! Session loop ◀── TransportEvent channel ◀── reader task ◀────┘
//! ```
//!
//! # Failure Strategy
//!
//! - Initial connection retries 3 times with exponential backoff
//! - Mid-session failures surface as `TransportEvent::Error` (no reconnection)
//! - Closing is graceful when possible, bounded by the caller

mod live_client;
mod protocol;
mod transcript_aggregator;

pub use live_client::{connect_live, get_api_key, ConnectOptions, LiveLink};
pub use protocol::{
    ClientMessage, ServerContent, ServerMessage, SetupConfig, Transcription, TransportEvent,
    LIVE_API_URL,
};
pub use transcript_aggregator::TranscriptAggregator;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use crate::audio::PcmBlob;

/// Receiver for inbound transport events
pub type EventReceiver = mpsc::Receiver<TransportEvent>;

/// An open duplex channel to the remote service
///
/// Outbound audio goes through the sender returned by [`audio_sender`];
/// inbound events arrive on the [`EventReceiver`] handed out at connect time.
///
/// [`audio_sender`]: Transport::audio_sender
pub trait Transport: Send {
    /// Sender the capture pipeline feeds encoded chunks into
    fn audio_sender(&self) -> mpsc::Sender<PcmBlob>;

    /// Graceful close handshake. Callers bound the wait.
    fn close(self: Box<Self>) -> BoxFuture<'static, ()>;
}

/// Errors that can occur while establishing or using the live session
#[derive(Debug, Clone, PartialEq)]
pub enum StreamingError {
    /// API key not configured
    MissingApiKey,
    /// Failed to establish WebSocket connection
    ConnectionFailed(String),
    /// Service rejected the setup message (bad key, unknown model)
    SetupRejected(String),
    /// WebSocket protocol error
    ProtocolError(String),
    /// Connection was closed unexpectedly
    Disconnected(String),
    /// Failed to send audio data
    SendFailed(String),
}

impl StreamingError {
    /// Whether another connection attempt could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StreamingError::ConnectionFailed(_) | StreamingError::Disconnected(_)
        )
    }
}

impl std::fmt::Display for StreamingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamingError::MissingApiKey => {
                write!(
                    f,
                    "API key not configured. Set GEMINI_API_KEY (or API_KEY) environment variable."
                )
            }
            StreamingError::ConnectionFailed(e) => {
                write!(f, "Failed to connect to Live API: {}", e)
            }
            StreamingError::SetupRejected(e) => {
                write!(f, "Session setup rejected: {}", e)
            }
            StreamingError::ProtocolError(e) => {
                write!(f, "WebSocket protocol error: {}", e)
            }
            StreamingError::Disconnected(e) => {
                write!(f, "WebSocket disconnected: {}", e)
            }
            StreamingError::SendFailed(e) => {
                write!(f, "Failed to send audio: {}", e)
            }
        }
    }
}

impl std::error::Error for StreamingError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streaming_error_display() {
        let err = StreamingError::MissingApiKey;
        assert!(err.to_string().contains("GEMINI_API_KEY"));

        let err = StreamingError::ConnectionFailed("timeout".to_string());
        assert!(err.to_string().contains("timeout"));

        let err = StreamingError::SetupRejected("invalid key".to_string());
        assert!(err.to_string().contains("invalid key"));
    }

    #[test]
    fn test_retryable_errors() {
        assert!(StreamingError::ConnectionFailed("x".into()).is_retryable());
        assert!(StreamingError::Disconnected("x".into()).is_retryable());
        assert!(!StreamingError::MissingApiKey.is_retryable());
        assert!(!StreamingError::SetupRejected("x".into()).is_retryable());
    }
}
