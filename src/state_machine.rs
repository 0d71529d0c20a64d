//! State machine for the live conversation
//!
//! This module implements the session lifecycle using a single-writer pattern.
//! All state transitions go through the `reduce()` function, which returns
//! a new state and a list of effects to execute.

use serde::Serialize;
use uuid::Uuid;

use crate::streaming::TranscriptAggregator;

/// Lifecycle status shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Status {
    #[default]
    Idle,
    Connecting,
    Connected,
    Listening,
    Processing,
    Speaking,
    Error,
    Disconnected,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Idle => "idle",
            Status::Connecting => "connecting",
            Status::Connected => "connected",
            Status::Listening => "listening",
            Status::Processing => "processing",
            Status::Speaking => "speaking",
            Status::Error => "error",
            Status::Disconnected => "disconnected",
        }
    }

    /// A session is open or being opened
    pub fn is_active(&self) -> bool {
        matches!(self, Status::Connecting) || self.is_connected()
    }

    /// Connected or one of its sub-states
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            Status::Connected | Status::Listening | Status::Processing | Status::Speaking
        )
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Speaker {
    User,
    Agent,
}

/// One finalized turn of the transcript log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
}

impl TranscriptEntry {
    pub fn new(speaker: Speaker, text: impl Into<String>) -> Self {
        Self {
            speaker,
            text: text.into(),
        }
    }
}

/// Authoritative conversation state
///
/// `is_speaking` is not stored here: it is derived from the playback
/// scheduler's active-unit set by the runtime.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conversation {
    pub status: Status,
    /// Identity of the current (or last) session; guards against stale events
    pub session_id: Option<Uuid>,
    pub is_processing: bool,
    /// Append-only log of finalized turns
    pub transcript: Vec<TranscriptEntry>,
    /// In-progress user speech
    pub input: TranscriptAggregator,
    /// In-progress agent speech
    pub output: TranscriptAggregator,
    pub last_error: Option<String>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flush accumulated text into transcript entries, User before Agent
    fn flush_turn(&mut self) {
        if let Some(text) = self.input.take_text() {
            self.transcript.push(TranscriptEntry::new(Speaker::User, text));
        }
        if let Some(text) = self.output.take_text() {
            self.transcript.push(TranscriptEntry::new(Speaker::Agent, text));
        }
    }

    /// Session resources are gone; scratch state goes with them
    fn end_session(&mut self, status: Status) {
        self.status = status;
        self.is_processing = false;
        self.input.reset();
        self.output.reset();
    }
}

/// Events that can trigger state transitions.
/// These are sent from the controller, the connect task, the transport and the audio devices.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// User asked to start a session
    StartRequested,
    /// User asked to stop (also sent on unmount)
    StopRequested,

    // Connection events
    Connected {
        id: Uuid,
    },
    ConnectFailed {
        id: Uuid,
        err: String,
    },

    // Device events
    DeviceFailed {
        id: Uuid,
        err: String,
    },
    /// A speech chunk was decoded and queued for playback
    PlaybackStarted {
        id: Uuid,
    },
    /// The last active playback unit ended naturally
    PlaybackDrained {
        id: Uuid,
    },

    // Transport events
    InputTranscript {
        id: Uuid,
        text: String,
        finished: bool,
    },
    OutputTranscript {
        id: Uuid,
        text: String,
    },
    TurnComplete {
        id: Uuid,
    },
    Interrupted {
        id: Uuid,
    },
    TransportError {
        id: Uuid,
        err: String,
    },
    TransportClosed {
        id: Uuid,
        reason: String,
    },

    /// Disconnected cool-down finished (includes id to prevent stale timers)
    CooldownElapsed {
        id: Uuid,
    },
}

impl Event {
    /// Session the event belongs to, if it is session-scoped
    pub fn session_id(&self) -> Option<Uuid> {
        use Event::*;
        match self {
            StartRequested | StopRequested => None,
            Connected { id }
            | ConnectFailed { id, .. }
            | DeviceFailed { id, .. }
            | PlaybackStarted { id }
            | PlaybackDrained { id }
            | InputTranscript { id, .. }
            | OutputTranscript { id, .. }
            | TurnComplete { id }
            | Interrupted { id }
            | TransportError { id, .. }
            | TransportClosed { id, .. }
            | CooldownElapsed { id } => Some(*id),
        }
    }
}

/// Effects to be executed after a state transition.
/// The session runtime executes them in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Begin establishing the transport
    Connect { id: Uuid },
    /// Open the output device, then the microphone
    StartDevices { id: Uuid },
    /// Barge-in: stop all queued speech
    InterruptPlayback { id: Uuid },
    /// Release every resource of the session (idempotent)
    Teardown { id: Uuid },
    /// Schedule `CooldownElapsed` after the settle delay
    StartCooldown { id: Uuid },
    /// Signal to publish a UI snapshot
    EmitUi,
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Ignore events with stale session IDs
/// - Teardown always precedes EmitUi, so the UI never sees Error with live devices
pub fn reduce(state: &Conversation, event: Event) -> (Conversation, Vec<Effect>) {
    use Effect::*;
    use Event::*;

    if let Some(eid) = event.session_id() {
        if state.session_id != Some(eid) {
            log::debug!("Ignoring stale event for session {}", eid);
            return (state.clone(), vec![]);
        }
    }

    let mut next = state.clone();
    let status = state.status;

    match event {
        // -----------------
        // Start / stop
        // -----------------
        StartRequested if status.is_active() => {
            log::warn!("Start ignored: session already {}", status);
            (next, vec![])
        }
        StartRequested => {
            let id = Uuid::new_v4();
            next.session_id = Some(id);
            next.last_error = None;
            next.end_session(Status::Connecting);
            (next, vec![Connect { id }, EmitUi])
        }

        StopRequested => match (status, state.session_id) {
            (Status::Idle | Status::Disconnected, _) | (_, None) => (next, vec![]),
            (_, Some(id)) => {
                next.end_session(Status::Disconnected);
                (next, vec![Teardown { id }, StartCooldown { id }, EmitUi])
            }
        },

        // -----------------
        // Connecting
        // -----------------
        Connected { id } if status == Status::Connecting => {
            next.status = Status::Connected;
            (next, vec![StartDevices { id }, EmitUi])
        }
        ConnectFailed { id, err } if status == Status::Connecting => fail(next, id, err),

        // -----------------
        // Connected and its sub-states
        // -----------------
        DeviceFailed { id, err } if status.is_active() => fail(next, id, err),
        TransportError { id, err } if status.is_active() => fail(next, id, err),
        TransportClosed { id, reason } if status.is_active() => {
            log::info!("Session {} closed: {}", id, reason);
            next.end_session(Status::Disconnected);
            (next, vec![Teardown { id }, StartCooldown { id }, EmitUi])
        }

        InputTranscript { text, finished, .. } if status.is_connected() => {
            next.input.process_fragment(&text);
            next.is_processing = true;
            next.status = if finished {
                Status::Processing
            } else {
                Status::Listening
            };
            (next, vec![EmitUi])
        }
        OutputTranscript { text, .. } if status.is_connected() => {
            next.output.process_fragment(&text);
            (next, vec![EmitUi])
        }
        PlaybackStarted { .. } if status.is_connected() => {
            next.status = Status::Speaking;
            next.is_processing = false;
            (next, vec![EmitUi])
        }
        PlaybackDrained { .. } if status == Status::Speaking => {
            next.status = Status::Connected;
            (next, vec![EmitUi])
        }
        TurnComplete { .. } if status.is_connected() => {
            next.flush_turn();
            next.is_processing = false;
            next.status = Status::Connected;
            (next, vec![EmitUi])
        }
        Interrupted { id } if status.is_connected() => {
            next.status = Status::Listening;
            (next, vec![InterruptPlayback { id }, EmitUi])
        }

        // -----------------
        // Disconnected
        // -----------------
        CooldownElapsed { .. } if status == Status::Disconnected => {
            next.status = Status::Idle;
            (next, vec![EmitUi])
        }

        // -----------------
        // Unhandled: no transition
        // -----------------
        _ => (next, vec![]),
    }
}

fn fail(mut next: Conversation, id: Uuid, err: String) -> (Conversation, Vec<Effect>) {
    log::error!("Session {} failed: {}", id, err);
    next.last_error = Some(err);
    next.end_session(Status::Error);
    (next, vec![Effect::Teardown { id }, Effect::EmitUi])
}
