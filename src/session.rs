//! Session orchestrator runtime
//!
//! One tokio task owns everything that changes during a conversation: the
//! reducer state, the transport handle, the microphone handle and the
//! playback scheduler. Device threads, the connect task and the transport
//! reader only talk to it through channels, so there are no locks around
//! session state.
//!
//! ```text
//! SessionController ──Command──▶ ┌──────────────┐ ──watch──▶ UiSnapshot observers
//! connect task / timers ───────▶ │ session loop │
//! transport reader ────────────▶ │  (reduce +   │ ──▶ PlaybackScheduler ──▶ output device
//! device threads ──────────────▶ │   effects)   │
//!                                └──────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audio::{
    decode_blob, AudioError, CaptureControl, CapturePipeline, CpalOutput, DeviceEvent,
    DeviceEventReceiver, DeviceEventSender, PcmBlob, PlaybackDevice, PlaybackScheduler,
    ScheduleOutcome, OUTPUT_SAMPLE_RATE,
};
use crate::settings::LiveSettings;
use crate::state_machine::{reduce, Conversation, Effect, Event, Status, TranscriptEntry};
use crate::streaming::{
    connect_live, get_api_key, EventReceiver, StreamingError, Transport, TransportEvent,
};

/// An established transport plus the stream of its inbound events
pub type Connection = (Box<dyn Transport>, EventReceiver);

/// Opens the external resources a session needs.
///
/// The real implementation is [`LiveBackend`]; tests substitute in-memory fakes.
pub trait SessionBackend: Send + Sync + 'static {
    /// Establish the transport. Dropping the future abandons the attempt.
    fn connect(&self) -> BoxFuture<'static, Result<Connection, StreamingError>>;

    fn open_playback(
        &self,
        events: DeviceEventSender,
    ) -> Result<Box<dyn PlaybackDevice>, AudioError>;

    /// Start the microphone feeding encoded chunks into `chunks`
    fn open_capture(
        &self,
        chunks: mpsc::Sender<PcmBlob>,
        events: DeviceEventSender,
    ) -> Result<Box<dyn CaptureControl>, AudioError>;
}

/// Live API over WebSocket, default CPAL devices
pub struct LiveBackend {
    settings: LiveSettings,
    api_key: Option<String>,
}

impl LiveBackend {
    pub fn new(settings: LiveSettings, api_key: Option<String>) -> Self {
        Self { settings, api_key }
    }

    /// Read the API key from `GEMINI_API_KEY` / `API_KEY`
    pub fn from_env(settings: LiveSettings) -> Self {
        Self::new(settings, get_api_key())
    }
}

impl SessionBackend for LiveBackend {
    fn connect(&self) -> BoxFuture<'static, Result<Connection, StreamingError>> {
        let api_key = self.api_key.clone();
        let setup = self.settings.setup_config();
        let options = self.settings.connect_options();

        async move {
            let api_key = api_key.ok_or(StreamingError::MissingApiKey)?;
            let (link, events) = connect_live(&api_key, &setup, &options).await?;
            Ok((Box::new(link) as Box<dyn Transport>, events))
        }
        .boxed()
    }

    fn open_playback(
        &self,
        events: DeviceEventSender,
    ) -> Result<Box<dyn PlaybackDevice>, AudioError> {
        let output = CpalOutput::open(self.settings.output_sample_rate, events)?;
        Ok(Box::new(output))
    }

    fn open_capture(
        &self,
        chunks: mpsc::Sender<PcmBlob>,
        events: DeviceEventSender,
    ) -> Result<Box<dyn CaptureControl>, AudioError> {
        let pipeline = CapturePipeline {
            target_sample_rate: self.settings.input_sample_rate,
            block_size: self.settings.capture_block_size,
        };
        Ok(Box::new(pipeline.start(chunks, events)?))
    }
}

/// Everything a presentation layer needs to render the conversation
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UiSnapshot {
    pub status: Status,
    /// At least one playback unit is queued or playing
    pub is_speaking: bool,
    pub is_processing: bool,
    pub transcript: Vec<TranscriptEntry>,
    pub last_error: Option<String>,
    /// User speech of the turn in progress
    pub input_caption: String,
    /// Agent speech of the turn in progress
    pub output_caption: String,
    /// Microphone and speaker are open and streaming
    pub microphone_open: bool,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Time spent in Disconnected before Idle
    pub cooldown: Duration,
    /// Bound on the graceful transport close
    pub close_timeout: Duration,
    /// Decode rate for speech chunks without a `rate=` parameter
    pub output_sample_rate: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(1),
            close_timeout: Duration::from_secs(2),
            output_sample_rate: OUTPUT_SAMPLE_RATE,
        }
    }
}

impl From<&LiveSettings> for SessionOptions {
    fn from(settings: &LiveSettings) -> Self {
        Self {
            cooldown: settings.cooldown(),
            close_timeout: settings.close_timeout(),
            output_sample_rate: settings.output_sample_rate,
        }
    }
}

enum Command {
    Start,
    Stop,
    Shutdown,
}

/// Completions the loop schedules for itself
enum Internal {
    ConnectFinished {
        id: Uuid,
        result: Result<Connection, StreamingError>,
    },
    DevicesOpened {
        id: Uuid,
        result: Result<AudioDevices, AudioError>,
    },
    CooldownElapsed {
        id: Uuid,
    },
}

/// Speaker and microphone of one session, opened together off the loop
struct AudioDevices {
    playback: Box<dyn PlaybackDevice>,
    capture: Box<dyn CaptureControl>,
}

impl AudioDevices {
    /// Output first so the first reply has somewhere to go. A microphone
    /// failure releases the speaker again before reporting.
    fn open(
        backend: &dyn SessionBackend,
        chunks: mpsc::Sender<PcmBlob>,
        events: DeviceEventSender,
    ) -> Result<Self, AudioError> {
        let mut playback = backend.open_playback(events.clone())?;
        match backend.open_capture(chunks, events) {
            Ok(capture) => Ok(Self { playback, capture }),
            Err(e) => {
                playback.shutdown();
                Err(e)
            }
        }
    }

    fn release(mut self) {
        self.capture.shutdown();
        self.playback.shutdown();
    }
}

enum LoopInput {
    Command(Option<Command>),
    Internal(Internal),
    Transport(Option<TransportEvent>),
    Device(Option<DeviceEvent>),
}

/// Resources of one connection, created on start and released exactly once
struct Session {
    id: Uuid,
    connecting: Option<CancellationToken>,
    transport: Option<Box<dyn Transport>>,
    capture: Option<Box<dyn CaptureControl>>,
    playback: Option<PlaybackScheduler<Box<dyn PlaybackDevice>>>,
    torn_down: bool,
}

impl Session {
    fn new(id: Uuid) -> Self {
        Self {
            id,
            connecting: None,
            transport: None,
            capture: None,
            playback: None,
            torn_down: false,
        }
    }

    fn is_speaking(&self) -> bool {
        self.playback
            .as_ref()
            .map_or(false, |playback| playback.is_speaking())
    }

    /// Halt capture, release the output device and hand back the transport
    /// for a graceful close. Later calls are no-ops.
    fn teardown(&mut self) -> Option<Box<dyn Transport>> {
        if self.torn_down {
            log::debug!("Session {}: already torn down", self.id);
            return None;
        }
        self.torn_down = true;
        log::info!("Session {}: tearing down", self.id);

        if let Some(token) = self.connecting.take() {
            token.cancel();
        }
        if let Some(mut capture) = self.capture.take() {
            capture.shutdown();
        }
        if let Some(mut playback) = self.playback.take() {
            playback.shutdown();
        }
        self.transport.take()
    }
}

struct SessionRuntime {
    backend: Arc<dyn SessionBackend>,
    options: SessionOptions,
    conversation: Conversation,
    session: Option<Session>,
    transport_rx: Option<EventReceiver>,
    device_rx: Option<DeviceEventReceiver>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    ui_tx: watch::Sender<UiSnapshot>,
}

impl SessionRuntime {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        log::info!("Session loop started");

        loop {
            let input = tokio::select! {
                cmd = commands.recv() => LoopInput::Command(cmd),
                Some(msg) = self.internal_rx.recv() => LoopInput::Internal(msg),
                event = next_transport_event(&mut self.transport_rx) => LoopInput::Transport(event),
                event = next_device_event(&mut self.device_rx) => LoopInput::Device(event),
            };

            match input {
                LoopInput::Command(Some(Command::Start)) => self.dispatch(Event::StartRequested),
                LoopInput::Command(Some(Command::Stop)) => self.dispatch(Event::StopRequested),
                LoopInput::Command(Some(Command::Shutdown)) | LoopInput::Command(None) => break,
                LoopInput::Internal(msg) => self.on_internal(msg),
                LoopInput::Transport(event) => self.on_transport(event),
                LoopInput::Device(event) => self.on_device(event),
            }

            // Derived flags (is_speaking) can change without a status change
            self.publish();
        }

        self.unmount().await;
        log::info!("Session loop ended");
    }

    /// Controller went away: stop as if the user had, but wait for the close
    async fn unmount(&mut self) {
        let (next, _) = reduce(&self.conversation, Event::StopRequested);
        self.conversation = next;

        let transport = self.session.as_mut().and_then(Session::teardown);
        self.transport_rx = None;
        self.device_rx = None;
        self.publish();

        if let Some(transport) = transport {
            close_transport(transport, self.options.close_timeout).await;
        }
    }

    fn dispatch(&mut self, event: Event) {
        log::debug!("Session event: {:?}", event);

        let previous = self.conversation.status;
        let (next, effects) = reduce(&self.conversation, event);
        if previous != next.status {
            log::info!("Status transition: {} -> {}", previous, next.status);
        }
        self.conversation = next;

        for effect in effects {
            self.run_effect(effect);
        }
    }

    fn run_effect(&mut self, effect: Effect) {
        match effect {
            Effect::Connect { id } => self.begin_connect(id),
            Effect::StartDevices { id } => self.start_devices(id),
            Effect::InterruptPlayback { id } => {
                if let Some(playback) = self
                    .current_session(id)
                    .and_then(|session| session.playback.as_mut())
                {
                    playback.interrupt();
                }
            }
            Effect::Teardown { id } => self.teardown(id),
            Effect::StartCooldown { id } => self.start_cooldown(id),
            Effect::EmitUi => self.publish(),
        }
    }

    fn current_session(&mut self, id: Uuid) -> Option<&mut Session> {
        self.session.as_mut().filter(|session| session.id == id)
    }

    /// Id of the session whose resources are still live
    fn live_session_id(&self) -> Option<Uuid> {
        self.session
            .as_ref()
            .filter(|session| !session.torn_down)
            .map(|session| session.id)
    }

    fn begin_connect(&mut self, id: Uuid) {
        if let Some(mut previous) = self.session.take() {
            if let Some(transport) = previous.teardown() {
                self.spawn_close(transport);
            }
        }
        self.transport_rx = None;
        self.device_rx = None;

        let token = CancellationToken::new();
        let mut session = Session::new(id);
        session.connecting = Some(token.clone());
        self.session = Some(session);

        log::info!("Session {}: connecting", id);
        let connect = self.backend.connect();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    log::debug!("Session {}: connect cancelled", id);
                }
                result = connect => {
                    let _ = tx.send(Internal::ConnectFinished { id, result });
                }
            }
        });
    }

    /// Open the devices on the blocking pool; the result comes back as
    /// [`Internal::DevicesOpened`]
    fn start_devices(&mut self, id: Uuid) {
        let Some(audio_tx) = self
            .session
            .as_ref()
            .filter(|session| session.id == id && !session.torn_down)
            .and_then(|session| session.transport.as_ref())
            .map(|transport| transport.audio_sender())
        else {
            return;
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.device_rx = Some(events_rx);

        let backend = self.backend.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            // Device threads block until their streams are running
            let result = tokio::task::spawn_blocking(move || {
                AudioDevices::open(backend.as_ref(), audio_tx, events_tx)
            })
            .await
            .unwrap_or_else(|e| Err(AudioError::DeviceThreadFailed(e.to_string())));

            if let Err(mpsc::error::SendError(unsent)) =
                tx.send(Internal::DevicesOpened { id, result })
            {
                // Loop already gone
                if let Internal::DevicesOpened {
                    result: Ok(devices),
                    ..
                } = unsent
                {
                    devices.release();
                }
            }
        });
    }

    fn teardown(&mut self, id: Uuid) {
        let Some(session) = self.current_session(id) else {
            return;
        };
        let transport = session.teardown();
        self.transport_rx = None;
        self.device_rx = None;
        if let Some(transport) = transport {
            self.spawn_close(transport);
        }
    }

    fn spawn_close(&self, transport: Box<dyn Transport>) {
        tokio::spawn(close_transport(transport, self.options.close_timeout));
    }

    fn start_cooldown(&self, id: Uuid) {
        let tx = self.internal_tx.clone();
        let delay = self.options.cooldown;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Internal::CooldownElapsed { id });
        });
    }

    fn on_internal(&mut self, msg: Internal) {
        match msg {
            Internal::ConnectFinished { id, result } => {
                let live = self.live_session_id() == Some(id);
                match result {
                    Ok((transport, events)) if live => {
                        if let Some(session) = self.session.as_mut() {
                            session.connecting = None;
                            session.transport = Some(transport);
                        }
                        self.transport_rx = Some(events);
                        log::info!("Session {}: connected", id);
                        self.dispatch(Event::Connected { id });
                    }
                    Ok((transport, _)) => {
                        log::info!("Session {}: closing connection that arrived after stop", id);
                        self.spawn_close(transport);
                    }
                    Err(e) => self.dispatch(Event::ConnectFailed {
                        id,
                        err: e.to_string(),
                    }),
                }
            }
            Internal::DevicesOpened { id, result } => {
                let live = self.live_session_id() == Some(id);
                match result {
                    Ok(devices) if live => {
                        if let Some(session) = self.session.as_mut() {
                            session.playback = Some(PlaybackScheduler::new(devices.playback));
                            session.capture = Some(devices.capture);
                        }
                        log::info!("Session {}: microphone and speaker open", id);
                    }
                    Ok(devices) => {
                        log::info!("Session {}: releasing devices that opened after stop", id);
                        devices.release();
                    }
                    Err(e) if live => self.dispatch(Event::DeviceFailed {
                        id,
                        err: e.to_string(),
                    }),
                    Err(e) => log::debug!("Session {}: late device failure ignored: {}", id, e),
                }
            }
            Internal::CooldownElapsed { id } => self.dispatch(Event::CooldownElapsed { id }),
        }
    }

    fn on_transport(&mut self, event: Option<TransportEvent>) {
        let Some(id) = self.live_session_id() else {
            return;
        };
        let Some(event) = event else {
            self.transport_rx = None;
            self.dispatch(Event::TransportClosed {
                id,
                reason: "event stream ended".to_string(),
            });
            return;
        };

        match event {
            TransportEvent::InputTranscript { text, finished } => {
                self.dispatch(Event::InputTranscript { id, text, finished })
            }
            TransportEvent::OutputTranscript { text } => {
                self.dispatch(Event::OutputTranscript { id, text })
            }
            TransportEvent::SpeechAudio { data, mime_type } => {
                self.on_speech_audio(id, &data, &mime_type)
            }
            TransportEvent::TurnComplete => self.dispatch(Event::TurnComplete { id }),
            TransportEvent::Interrupted => self.dispatch(Event::Interrupted { id }),
            TransportEvent::Error { message } => {
                self.dispatch(Event::TransportError { id, err: message })
            }
            TransportEvent::Closed { reason } => {
                self.transport_rx = None;
                self.dispatch(Event::TransportClosed { id, reason })
            }
        }
    }

    /// Decode and queue one speech chunk
    ///
    /// The ticket is taken before decoding; an interrupt handled in between
    /// makes the buffer stale and it is dropped.
    fn on_speech_audio(&mut self, id: Uuid, data: &str, mime_type: &str) {
        let default_rate = self.options.output_sample_rate;
        let Some(playback) = self
            .session
            .as_mut()
            .and_then(|session| session.playback.as_mut())
        else {
            log::debug!("Session {}: speech before output device is open, dropped", id);
            return;
        };

        let ticket = playback.ticket();
        let mime = Some(mime_type).filter(|m| !m.is_empty());
        let buffer = match decode_blob(data, mime, default_rate) {
            Ok(buffer) => buffer,
            Err(e) => {
                log::warn!("Session {}: skipping undecodable speech chunk: {}", id, e);
                return;
            }
        };

        match playback.schedule(ticket, buffer) {
            Ok(ScheduleOutcome::Scheduled { .. }) => self.dispatch(Event::PlaybackStarted { id }),
            Ok(ScheduleOutcome::Stale) | Ok(ScheduleOutcome::Empty) => {}
            Err(e) => self.dispatch(Event::DeviceFailed {
                id,
                err: e.to_string(),
            }),
        }
    }

    fn on_device(&mut self, event: Option<DeviceEvent>) {
        let Some(id) = self.live_session_id() else {
            return;
        };

        match event {
            None => self.device_rx = None,
            Some(DeviceEvent::UnitEnded(unit)) => {
                let drained = self
                    .session
                    .as_mut()
                    .and_then(|session| session.playback.as_mut())
                    .map_or(false, |playback| playback.on_unit_ended(unit));
                if drained {
                    self.dispatch(Event::PlaybackDrained { id });
                }
            }
            Some(DeviceEvent::Fault(message)) => {
                self.dispatch(Event::DeviceFailed { id, err: message })
            }
        }
    }

    fn snapshot(&self) -> UiSnapshot {
        let conversation = &self.conversation;
        UiSnapshot {
            status: conversation.status,
            is_speaking: self.session.as_ref().map_or(false, Session::is_speaking),
            is_processing: conversation.is_processing,
            transcript: conversation.transcript.clone(),
            last_error: conversation.last_error.clone(),
            input_caption: conversation.input.current_text().to_string(),
            output_caption: conversation.output.current_text().to_string(),
            microphone_open: self
                .session
                .as_ref()
                .map_or(false, |session| session.capture.is_some()),
        }
    }

    fn publish(&self) {
        let snapshot = self.snapshot();
        self.ui_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

async fn next_transport_event(rx: &mut Option<EventReceiver>) -> Option<TransportEvent> {
    match rx.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_device_event(rx: &mut Option<DeviceEventReceiver>) -> Option<DeviceEvent> {
    match rx.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn close_transport(transport: Box<dyn Transport>, limit: Duration) {
    if tokio::time::timeout(limit, transport.close()).await.is_err() {
        log::warn!("Transport close timed out after {:?}", limit);
    }
}

/// Handle the presentation layer holds
///
/// Dropping the controller stops the session and releases all devices.
pub struct SessionController {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<UiSnapshot>,
    task: Option<JoinHandle<()>>,
}

impl SessionController {
    /// Spawn the session loop on the current tokio runtime
    pub fn spawn(backend: Arc<dyn SessionBackend>, options: SessionOptions) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (ui_tx, snapshots) = watch::channel(UiSnapshot::default());

        let runtime = SessionRuntime {
            backend,
            options,
            conversation: Conversation::new(),
            session: None,
            transport_rx: None,
            device_rx: None,
            internal_tx,
            internal_rx,
            ui_tx,
        };
        let task = tokio::spawn(runtime.run(command_rx));

        Self {
            commands,
            snapshots,
            task: Some(task),
        }
    }

    /// Begin a session; ignored while one is active
    pub fn start(&self) {
        self.send(Command::Start);
    }

    /// End the session; safe to call repeatedly
    pub fn stop(&self) {
        self.send(Command::Stop);
    }

    pub fn snapshot(&self) -> UiSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<UiSnapshot> {
        self.snapshots.clone()
    }

    /// Stop the loop and wait for teardown, including the bounded close
    pub async fn shutdown(mut self) {
        self.send(Command::Shutdown);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::warn!("Session loop ended abnormally: {}", e);
            }
        }
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            log::warn!("Session loop is not running");
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        // The loop also exits when the command channel closes
        let _ = self.commands.send(Command::Shutdown);
    }
}
