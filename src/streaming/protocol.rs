//! Live API protocol types
//!
//! JSON messages exchanged with the bidirectional Live streaming endpoint
//! over WebSocket.
//!
//! # Protocol Overview
//!
//! 1. Connect to `wss://generativelanguage.googleapis.com/ws/...BidiGenerateContent?key=...`
//! 2. Send `setup` (model, AUDIO response modality, transcription enabled)
//! 3. Receive `setupComplete`
//! 4. Stream microphone audio via `realtimeInput.mediaChunks`
//! 5. Receive `serverContent`: transcription fragments, speech audio,
//!    `turnComplete`, `interrupted`

use serde::{Deserialize, Serialize};

use crate::audio::PcmBlob;

/// Live API WebSocket endpoint (API key appended as `key` query parameter)
pub const LIVE_API_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Session setup parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupConfig {
    /// Fully qualified model name, e.g. `models/gemini-...`
    pub model: String,

    pub generation_config: GenerationConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,

    /// Empty object enables transcription of the user's speech
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<TranscriptionConfig>,

    /// Empty object enables transcription of the model's speech
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<TranscriptionConfig>,
}

impl SetupConfig {
    /// Audio-out session with both transcription directions enabled
    pub fn audio_session(
        model: &str,
        system_instruction: Option<&str>,
        voice_name: Option<&str>,
    ) -> Self {
        Self {
            model: model.to_string(),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: voice_name.map(SpeechConfig::prebuilt),
            },
            system_instruction: system_instruction
                .filter(|s| !s.trim().is_empty())
                .map(Content::text),
            input_audio_transcription: Some(TranscriptionConfig {}),
            output_audio_transcription: Some(TranscriptionConfig {}),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

impl SpeechConfig {
    fn prebuilt(voice_name: &str) -> Self {
        Self {
            voice_config: VoiceConfig {
                prebuilt_voice_config: PrebuiltVoiceConfig {
                    voice_name: voice_name.to_string(),
                },
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

/// Transcription toggle (no options yet)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscriptionConfig {}

/// A multi-part content block
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn text(text: &str) -> Self {
        Self {
            role: None,
            parts: vec![Part {
                text: Some(text.to_string()),
                inline_data: None,
            }],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<PcmBlob>,
}

// ============================================================================
// Client Messages (sent TO the service)
// ============================================================================

/// Messages sent from client to the Live API
///
/// Externally tagged: `{"setup": {...}}` / `{"realtimeInput": {...}}`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    /// First message on every connection
    Setup(SetupConfig),

    /// Streamed microphone audio
    RealtimeInput(RealtimeInput),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<PcmBlob>,
}

impl ClientMessage {
    pub fn setup(config: SetupConfig) -> Self {
        Self::Setup(config)
    }

    /// Wrap one encoded microphone chunk
    pub fn audio(chunk: PcmBlob) -> Self {
        Self::RealtimeInput(RealtimeInput {
            media_chunks: vec![chunk],
        })
    }
}

// ============================================================================
// Server Messages (received FROM the service)
// ============================================================================

/// Messages received from the Live API
///
/// The service sends one object per frame with exactly one populated field;
/// unknown fields (usage metadata, tool calls) are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,

    #[serde(default)]
    pub server_content: Option<ServerContent>,

    #[serde(default)]
    pub go_away: Option<GoAway>,

    #[serde(default)]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,

    #[serde(default)]
    pub turn_complete: bool,

    #[serde(default)]
    pub interrupted: bool,

    #[serde(default)]
    pub input_transcription: Option<Transcription>,

    #[serde(default)]
    pub output_transcription: Option<Transcription>,
}

/// One transcription fragment
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transcription {
    #[serde(default)]
    pub text: String,

    /// Set on the last fragment of an utterance
    #[serde(default)]
    pub finished: bool,
}

/// Server announces it will close the connection soon
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

/// Error information from the API
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorInfo {
    #[serde(default)]
    pub code: Option<i64>,

    #[serde(default)]
    pub message: String,

    #[serde(default)]
    pub status: Option<String>,
}

/// Inbound events the session orchestrator reacts to
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Fragment of the user's speech transcript
    InputTranscript { text: String, finished: bool },
    /// Fragment of the agent's speech transcript
    OutputTranscript { text: String },
    /// Synthesized speech chunk (base64 PCM16 + MIME descriptor)
    SpeechAudio { data: String, mime_type: String },
    /// The remote side finished its turn
    TurnComplete,
    /// The remote side cut off its own speech (barge-in)
    Interrupted,
    /// Mid-session failure reported by the transport
    Error { message: String },
    /// The connection closed
    Closed { reason: String },
}

impl ServerMessage {
    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Split one server message into ordered session events
    ///
    /// Order within a message: input transcript, output transcript, speech
    /// audio, interrupt, turn complete.
    pub fn into_events(self) -> Vec<TransportEvent> {
        let mut events = Vec::new();

        if let Some(error) = self.error {
            events.push(TransportEvent::Error {
                message: error.message,
            });
        }

        if let Some(go_away) = self.go_away {
            log::warn!(
                "Live API: server going away (time left: {})",
                go_away.time_left.as_deref().unwrap_or("unknown")
            );
        }

        let Some(content) = self.server_content else {
            return events;
        };

        if let Some(t) = content.input_transcription {
            if !t.text.is_empty() || t.finished {
                events.push(TransportEvent::InputTranscript {
                    text: t.text,
                    finished: t.finished,
                });
            }
        }

        if let Some(t) = content.output_transcription {
            if !t.text.is_empty() {
                events.push(TransportEvent::OutputTranscript { text: t.text });
            }
        }

        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                if let Some(blob) = part.inline_data {
                    if blob.mime_type.starts_with("audio/") && !blob.data.is_empty() {
                        events.push(TransportEvent::SpeechAudio {
                            data: blob.data,
                            mime_type: blob.mime_type,
                        });
                    }
                }
            }
        }

        if content.interrupted {
            events.push(TransportEvent::Interrupted);
        }

        if content.turn_complete {
            events.push(TransportEvent::TurnComplete);
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::encode_input_block;

    #[test]
    fn test_setup_serialization() {
        let msg = ClientMessage::setup(SetupConfig::audio_session(
            "models/test-model",
            Some("Be nice."),
            None,
        ));
        let json = serde_json::to_string(&msg).unwrap();

        assert!(json.starts_with("{\"setup\":"));
        assert!(json.contains("\"model\":\"models/test-model\""));
        assert!(json.contains("\"responseModalities\":[\"AUDIO\"]"));
        assert!(json.contains("\"inputAudioTranscription\":{}"));
        assert!(json.contains("\"outputAudioTranscription\":{}"));
        assert!(json.contains("\"text\":\"Be nice.\""));
        assert!(!json.contains("speechConfig"));
    }

    #[test]
    fn test_setup_with_voice() {
        let config = SetupConfig::audio_session("models/m", None, Some("Puck"));
        let json = serde_json::to_string(&config).unwrap();

        assert!(json.contains("\"voiceName\":\"Puck\""));
        assert!(!json.contains("systemInstruction"));
    }

    #[test]
    fn test_realtime_input_serialization() {
        let msg = ClientMessage::audio(encode_input_block(&[0.0, 0.5]));
        let json = serde_json::to_string(&msg).unwrap();

        assert!(json.starts_with("{\"realtimeInput\":{\"mediaChunks\":[{"));
        assert!(json.contains("\"mimeType\":\"audio/pcm;rate=16000\""));
        assert!(json.contains("\"data\":\"AAAAQA==\""));
    }

    #[test]
    fn test_setup_complete_deserialization() {
        let msg: ServerMessage = serde_json::from_str(r#"{"setupComplete": {}}"#).unwrap();
        assert!(msg.is_setup_complete());
        assert!(msg.into_events().is_empty());
    }

    #[test]
    fn test_transcription_events() {
        let json = r#"{
            "serverContent": {
                "inputTranscription": {"text": "hel"},
                "outputTranscription": {"text": "Hi"}
            }
        }"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();

        assert_eq!(
            msg.into_events(),
            vec![
                TransportEvent::InputTranscript {
                    text: "hel".to_string(),
                    finished: false
                },
                TransportEvent::OutputTranscript {
                    text: "Hi".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_audio_and_turn_complete_ordering() {
        let json = r#"{
            "serverContent": {
                "modelTurn": {
                    "parts": [
                        {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAA="}},
                        {"text": "thinking"}
                    ]
                },
                "turnComplete": true
            }
        }"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();

        assert_eq!(
            msg.into_events(),
            vec![
                TransportEvent::SpeechAudio {
                    data: "AAA=".to_string(),
                    mime_type: "audio/pcm;rate=24000".to_string()
                },
                TransportEvent::TurnComplete,
            ]
        );
    }

    #[test]
    fn test_interrupted() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{"serverContent": {"interrupted": true}}"#).unwrap();
        assert_eq!(msg.into_events(), vec![TransportEvent::Interrupted]);
    }

    #[test]
    fn test_finished_marker_without_text() {
        let msg: ServerMessage = serde_json::from_str(
            r#"{"serverContent": {"inputTranscription": {"finished": true}}}"#,
        )
        .unwrap();
        assert_eq!(
            msg.into_events(),
            vec![TransportEvent::InputTranscript {
                text: String::new(),
                finished: true
            }]
        );
    }

    #[test]
    fn test_error_message() {
        let msg: ServerMessage = serde_json::from_str(
            r#"{"error": {"code": 401, "message": "API key not valid", "status": "UNAUTHENTICATED"}}"#,
        )
        .unwrap();
        assert_eq!(
            msg.into_events(),
            vec![TransportEvent::Error {
                message: "API key not valid".to_string()
            }]
        );
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let msg: ServerMessage = serde_json::from_str(
            r#"{"usageMetadata": {"totalTokenCount": 12}, "goAway": {"timeLeft": "10s"}}"#,
        )
        .unwrap();
        assert!(msg.into_events().is_empty());
    }
}
