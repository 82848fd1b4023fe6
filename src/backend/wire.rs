//! Wire protocol for the premium streaming session.
//!
//! JSON control frames over the WebSocket; audio rides inside them as
//! base64. Client frames are serialized with serde; server frames are
//! parsed by tag so unknown event types can be skipped instead of
//! failing the stream.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Server-VAD tuning sent with the session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f64,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

impl Default for TurnDetection {
    fn default() -> Self {
        Self {
            kind: "server_vad".to_owned(),
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
        }
    }
}

/// Session configuration declared on every (re)connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub modalities: Vec<String>,
    pub instructions: String,
    pub voice: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub turn_detection: TurnDetection,
    pub tools: Vec<Value>,
    pub temperature: f64,
}

impl SessionConfig {
    /// Standard text+audio session with PCM16 both ways.
    pub fn new(instructions: String, voice: String, tools: Vec<Value>, temperature: f64) -> Self {
        Self {
            modalities: vec!["text".to_owned(), "audio".to_owned()],
            instructions,
            voice,
            input_audio_format: "pcm16".to_owned(),
            output_audio_format: "pcm16".to_owned(),
            turn_detection: TurnDetection::default(),
            tools,
            temperature,
        }
    }
}

/// A conversation item injected by the client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ConversationItem {
    /// A user text turn.
    #[serde(rename = "message")]
    Message {
        role: String,
        content: Vec<Value>,
    },
    /// A tool result answering a prior function call.
    #[serde(rename = "function_call_output")]
    FunctionCallOutput { call_id: String, output: String },
}

impl ConversationItem {
    pub fn user_text(text: &str) -> Self {
        Self::Message {
            role: "user".to_owned(),
            content: vec![serde_json::json!({ "type": "input_text", "text": text })],
        }
    }

    pub fn tool_output(call_id: &str, payload: &Value) -> Self {
        Self::FunctionCallOutput {
            call_id: call_id.to_owned(),
            output: payload.to_string(),
        }
    }
}

/// Frames the client sends.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioAppend { audio: String },
    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioCommit,
    #[serde(rename = "response.create")]
    ResponseCreate,
    #[serde(rename = "conversation.item.create")]
    ItemCreate { item: ConversationItem },
}

impl ClientEvent {
    /// Serialize to the JSON text frame.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Frames the server sends, reduced to the semantic set the backend
/// consumes.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    SessionCreated,
    SessionUpdated,
    SpeechStarted,
    SpeechStopped,
    /// Base64 PCM16 response audio.
    AudioDelta(String),
    AudioDone,
    TranscriptDelta(String),
    TranscriptDone(String),
    FunctionCall {
        call_id: String,
        name: String,
        /// JSON-encoded arguments string.
        arguments: String,
    },
    ResponseDone,
    Error(String),
}

impl ServerEvent {
    /// Parse a server text frame. Returns `Ok(None)` for event types the
    /// backend does not consume.
    pub fn parse(raw: &str) -> Result<Option<Self>, serde_json::Error> {
        let value: Value = serde_json::from_str(raw)?;
        let kind = value.get("type").and_then(Value::as_str).unwrap_or("");

        let event = match kind {
            "session.created" => Some(Self::SessionCreated),
            "session.updated" => Some(Self::SessionUpdated),
            "input_audio_buffer.speech_started" => Some(Self::SpeechStarted),
            "input_audio_buffer.speech_stopped" => Some(Self::SpeechStopped),
            "response.audio.delta" => value
                .get("delta")
                .and_then(Value::as_str)
                .map(|d| Self::AudioDelta(d.to_owned())),
            "response.audio.done" => Some(Self::AudioDone),
            "response.audio_transcript.delta" => value
                .get("delta")
                .and_then(Value::as_str)
                .map(|d| Self::TranscriptDelta(d.to_owned())),
            "response.audio_transcript.done" => value
                .get("transcript")
                .and_then(Value::as_str)
                .map(|t| Self::TranscriptDone(t.to_owned())),
            "response.function_call_arguments.done" => {
                let call_id = value.get("call_id").and_then(Value::as_str);
                let name = value.get("name").and_then(Value::as_str);
                let arguments = value.get("arguments").and_then(Value::as_str);
                match (call_id, name, arguments) {
                    (Some(call_id), Some(name), Some(arguments)) => Some(Self::FunctionCall {
                        call_id: call_id.to_owned(),
                        name: name.to_owned(),
                        arguments: arguments.to_owned(),
                    }),
                    _ => None,
                }
            }
            "response.done" => Some(Self::ResponseDone),
            "error" => {
                let message = value
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown server error");
                Some(Self::Error(message.to_owned()))
            }
            _ => None,
        };

        Ok(event)
    }
}
