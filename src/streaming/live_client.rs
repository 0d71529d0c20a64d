//! Live API WebSocket client
//!
//! Manages the WebSocket connection lifecycle for a voice session.
//!
//! # Connection Flow
//!
//! 1. `connect_live()` - Establish WebSocket, send `setup`, wait for `setupComplete`
//! 2. Writer task drains the outbound chunk queue into `realtimeInput` frames
//! 3. Reader task publishes inbound `TransportEvent`s
//! 4. `close()` - Close frame, then both tasks wind down
//!
//! # Retry Strategy
//!
//! Initial connection retries with exponential backoff (1s, 2s, 4s).
//! Mid-session disconnects do NOT reconnect - the session ends in Error.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{FutureExt, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config, tungstenite::client::IntoClientRequest, tungstenite::Message,
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;

use super::protocol::{ClientMessage, ServerMessage, SetupConfig, TransportEvent, LIVE_API_URL};
use super::{EventReceiver, StreamingError, Transport};
use crate::audio::PcmBlob;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

/// Inbound event queue depth
const INCOMING_CAPACITY: usize = 100;

/// Connection tuning
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Timeout for the WebSocket handshake
    pub connect_timeout: Duration,
    /// Timeout for `setupComplete` after sending `setup`
    pub setup_timeout: Duration,
    /// Total connection attempts (first try included)
    pub max_attempts: u32,
    /// Base delay for exponential backoff (doubles each retry)
    pub retry_base_delay: Duration,
    /// Outbound chunk queue depth; full queue means dropped microphone blocks
    pub outbound_capacity: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            setup_timeout: Duration::from_secs(5),
            max_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
            outbound_capacity: 8,
        }
    }
}

/// Handle to an open Live API session
///
/// Owns the background reader/writer tasks. Dropping the link aborts both.
pub struct LiveLink {
    audio_tx: mpsc::Sender<PcmBlob>,
    shutdown: CancellationToken,
    writer_task: Option<tokio::task::JoinHandle<()>>,
    reader_task: tokio::task::JoinHandle<()>,
    chunks_sent: Arc<AtomicU64>,
}

impl LiveLink {
    pub fn chunks_sent(&self) -> u64 {
        self.chunks_sent.load(Ordering::Relaxed)
    }

    /// Send a close frame and wait for the writer to finish
    pub async fn close(mut self) {
        log::info!("Disconnecting from Live API...");
        self.shutdown.cancel();

        if let Some(writer) = self.writer_task.take() {
            if let Err(e) = writer.await {
                log::warn!("Live API: writer task ended abnormally: {}", e);
            }
        }
        self.reader_task.abort();
    }
}

impl Transport for LiveLink {
    fn audio_sender(&self) -> mpsc::Sender<PcmBlob> {
        self.audio_tx.clone()
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
        LiveLink::close(*self).boxed()
    }
}

impl Drop for LiveLink {
    fn drop(&mut self) {
        // Ensure tasks are stopped if the link is dropped without close()
        self.shutdown.cancel();
        if let Some(writer) = self.writer_task.take() {
            writer.abort();
        }
        self.reader_task.abort();
    }
}

/// Connect to the Live API and complete the setup handshake
///
/// Retries transient failures with exponential backoff. Returns the link and
/// the receiver of inbound events.
pub async fn connect_live(
    api_key: &str,
    setup: &SetupConfig,
    options: &ConnectOptions,
) -> Result<(LiveLink, EventReceiver), StreamingError> {
    if api_key.is_empty() {
        return Err(StreamingError::MissingApiKey);
    }

    ensure_crypto_provider();

    let mut last_error = None;
    for attempt in 0..options.max_attempts.max(1) {
        if attempt > 0 {
            let delay = options.retry_base_delay * 2u32.pow(attempt - 1);
            log::info!(
                "Retrying WebSocket connection in {:?} (attempt {}/{})",
                delay,
                attempt + 1,
                options.max_attempts
            );
            tokio::time::sleep(delay).await;
        }

        match try_connect(api_key, setup, options).await {
            Ok(connected) => return Ok(connected),
            Err(e) if e.is_retryable() => {
                log::warn!("Connection attempt {} failed: {}", attempt + 1, e);
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_error
        .unwrap_or_else(|| StreamingError::ConnectionFailed("Max retries exceeded".to_string())))
}

/// Single connection attempt (no retries)
async fn try_connect(
    api_key: &str,
    setup: &SetupConfig,
    options: &ConnectOptions,
) -> Result<(LiveLink, EventReceiver), StreamingError> {
    let url = format!("{}?key={}", LIVE_API_URL, api_key);
    let request = url
        .into_client_request()
        .map_err(|e| StreamingError::ConnectionFailed(e.to_string()))?;

    log::info!("Connecting to Live API ({})...", setup.model);

    let (ws_stream, _response) = timeout(
        options.connect_timeout,
        connect_async_with_config(
            request, None, false, // disable_nagle (we want low latency)
        ),
    )
    .await
    .map_err(|_| StreamingError::ConnectionFailed("Connection timeout".to_string()))?
    .map_err(|e| StreamingError::ConnectionFailed(e.to_string()))?;

    let (mut write, mut read) = ws_stream.split();

    let setup_json = serde_json::to_string(&ClientMessage::setup(setup.clone()))
        .map_err(|e| StreamingError::ProtocolError(e.to_string()))?;
    write
        .send(Message::Text(setup_json))
        .await
        .map_err(|e| StreamingError::SendFailed(e.to_string()))?;

    log::info!("WebSocket connected, waiting for setupComplete...");

    timeout(options.setup_timeout, wait_for_setup(&mut read))
        .await
        .map_err(|_| StreamingError::ConnectionFailed("Session setup timeout".to_string()))??;

    log::info!("Live session ready");

    let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_CAPACITY);
    let (audio_tx, audio_rx) = mpsc::channel(options.outbound_capacity.max(1));
    let shutdown = CancellationToken::new();
    let chunks_sent = Arc::new(AtomicU64::new(0));

    let reader_task = tokio::spawn(run_reader(read, incoming_tx.clone()));
    let writer_task = tokio::spawn(run_writer(
        write,
        audio_rx,
        shutdown.clone(),
        incoming_tx,
        chunks_sent.clone(),
    ));

    Ok((
        LiveLink {
            audio_tx,
            shutdown,
            writer_task: Some(writer_task),
            reader_task,
            chunks_sent,
        },
        incoming_rx,
    ))
}

async fn wait_for_setup(read: &mut WsRead) -> Result<(), StreamingError> {
    while let Some(msg_result) = read.next().await {
        let text = match msg_result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
            Ok(Message::Close(frame)) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .unwrap_or_else(|| "no reason".to_string());
                return Err(StreamingError::SetupRejected(format!(
                    "Connection closed before setup completed: {}",
                    reason
                )));
            }
            Ok(_) => continue, // Ignore ping/pong
            Err(e) => return Err(StreamingError::ProtocolError(e.to_string())),
        };

        match serde_json::from_str::<ServerMessage>(&text) {
            Ok(msg) if msg.is_setup_complete() => return Ok(()),
            Ok(ServerMessage {
                error: Some(error), ..
            }) => return Err(StreamingError::SetupRejected(error.message)),
            Ok(_) => log::debug!("Ignoring message while waiting for setupComplete"),
            Err(e) => log::warn!("Failed to parse message: {}", e),
        }
    }
    Err(StreamingError::Disconnected("Stream ended".to_string()))
}

/// Parse inbound frames into events until the socket ends
async fn run_reader(mut read: WsRead, incoming_tx: mpsc::Sender<TransportEvent>) {
    let closing_event = loop {
        let Some(msg_result) = read.next().await else {
            break TransportEvent::Closed {
                reason: "stream ended".to_string(),
            };
        };

        let parsed = match msg_result {
            Ok(Message::Text(text)) => serde_json::from_str::<ServerMessage>(&text),
            Ok(Message::Binary(bytes)) => serde_json::from_slice::<ServerMessage>(&bytes),
            Ok(Message::Close(frame)) => {
                log::info!("WebSocket closed by server");
                break TransportEvent::Closed {
                    reason: frame
                        .map(|f| f.reason.to_string())
                        .unwrap_or_else(|| "closed by server".to_string()),
                };
            }
            Err(e) => {
                log::warn!("WebSocket error: {}", e);
                break TransportEvent::Error {
                    message: e.to_string(),
                };
            }
            Ok(_) => continue, // Ignore ping/pong
        };

        match parsed {
            Ok(msg) => {
                for event in msg.into_events() {
                    if incoming_tx.send(event).await.is_err() {
                        log::debug!("Receiver channel closed");
                        return;
                    }
                }
            }
            Err(e) => log::warn!("Failed to parse message: {}", e),
        }
    };

    let _ = incoming_tx.send(closing_event).await;
    log::debug!("Reader task exiting");
}

/// Forward outbound chunks until shutdown, then send a close frame
async fn run_writer(
    mut write: WsWrite,
    mut audio_rx: mpsc::Receiver<PcmBlob>,
    shutdown: CancellationToken,
    incoming_tx: mpsc::Sender<TransportEvent>,
    chunks_sent: Arc<AtomicU64>,
) {
    loop {
        let chunk = tokio::select! {
            _ = shutdown.cancelled() => break,
            chunk = audio_rx.recv() => chunk,
        };
        let Some(chunk) = chunk else {
            break;
        };

        let json = match serde_json::to_string(&ClientMessage::audio(chunk)) {
            Ok(json) => json,
            Err(e) => {
                log::warn!("Failed to serialize audio chunk: {}", e);
                continue;
            }
        };

        if let Err(e) = write.send(Message::Text(json)).await {
            log::warn!("Failed to send audio chunk: {}", e);
            let _ = incoming_tx
                .send(TransportEvent::Error {
                    message: StreamingError::SendFailed(e.to_string()).to_string(),
                })
                .await;
            return;
        }

        let sent = chunks_sent.fetch_add(1, Ordering::Relaxed) + 1;
        if sent % 50 == 0 {
            log::debug!("Live API: sent {} chunks", sent);
        }
    }

    if let Err(e) = write.close().await {
        log::warn!("Error closing WebSocket: {}", e);
    }
    log::debug!("Writer task exiting");
}

/// rustls needs one process-wide crypto provider when several are compiled in
fn ensure_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Get the API key from environment (`GEMINI_API_KEY`, then `API_KEY`)
pub fn get_api_key() -> Option<String> {
    api_key_from(|name| std::env::var(name).ok())
}

/// First non-blank key among the supported variable names
fn api_key_from(lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
    API_KEY_VARS
        .iter()
        .filter_map(|name| lookup(*name))
        .find(|k| !k.trim().is_empty())
}

const API_KEY_VARS: [&str; 2] = ["GEMINI_API_KEY", "API_KEY"];

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| {
            vars.iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.to_string())
        }
    }

    #[test]
    fn test_api_key_prefers_gemini_variable() {
        let vars = [("API_KEY", "fallback"), ("GEMINI_API_KEY", "primary")];
        assert_eq!(api_key_from(lookup(&vars)), Some("primary".to_string()));
    }

    #[test]
    fn test_api_key_falls_back_to_api_key() {
        let vars = [("API_KEY", "fallback")];
        assert_eq!(api_key_from(lookup(&vars)), Some("fallback".to_string()));
    }

    #[test]
    fn test_api_key_blank_values_count_as_missing() {
        let vars = [("GEMINI_API_KEY", "   "), ("API_KEY", "fallback")];
        assert_eq!(api_key_from(lookup(&vars)), Some("fallback".to_string()));

        let vars = [("GEMINI_API_KEY", ""), ("API_KEY", "\t")];
        assert_eq!(api_key_from(lookup(&vars)), None);
        assert_eq!(api_key_from(lookup(&[])), None);
    }

    #[test]
    fn test_connect_options_default() {
        let options = ConnectOptions::default();
        assert_eq!(options.max_attempts, 3);
        assert_eq!(options.connect_timeout, Duration::from_secs(10));
        assert_eq!(options.setup_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_empty_key_rejected_without_network() {
        let setup = SetupConfig::audio_session("models/m", None, None);
        let result = connect_live("", &setup, &ConnectOptions::default()).await;
        assert!(matches!(result, Err(StreamingError::MissingApiKey)));
    }

    #[tokio::test]
    #[ignore] // Requires valid API key
    async fn test_live_connection() {
        let api_key = get_api_key().expect("GEMINI_API_KEY required");
        let setup = SetupConfig::audio_session(
            crate::settings::DEFAULT_MODEL,
            Some("Answer briefly."),
            None,
        );

        let (link, _events) = connect_live(&api_key, &setup, &ConnectOptions::default())
            .await
            .expect("Connection failed");

        // Send some silence
        let silence = crate::audio::encode_input_block(&[0.0; 4096]);
        assert!(link.audio_sender().try_send(silence).is_ok());

        link.close().await;
    }
}
