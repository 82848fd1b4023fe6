//! Dual-backend conversation engine.
//!
//! Both backends speak one protocol: audio in; audio, tool calls, and
//! transcripts out. [`Backend`] is the tagged variant the orchestrator
//! drives; it never matches on backend internals beyond this surface.

pub mod efficient;
pub mod history;
pub mod premium;
pub mod wire;

pub use efficient::EfficientBackend;
pub use premium::PremiumBackend;

use crate::audio::AudioFrame;
use crate::config::Mode;
use crate::error::Result;
use crate::events::EventBus;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::broadcast;

/// A model-issued request to execute a named function.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    /// Unique per session; answered exactly once.
    pub call_id: String,
    /// Function name, validated against the catalog by the executor.
    pub name: String,
    /// Parsed JSON arguments.
    pub arguments: Value,
}

/// REST chain stage names, surfaced in stage/retry events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Transcribing,
    Reasoning,
    Synthesizing,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transcribing => write!(f, "transcribing"),
            Self::Reasoning => write!(f, "reasoning"),
            Self::Synthesizing => write!(f, "synthesizing"),
        }
    }
}

/// Normalized backend event stream shared by both transports.
#[derive(Debug, Clone)]
pub enum BackendEvent {
    /// The session is configured and ready for audio.
    SessionReady,
    /// Server-side VAD detected speech start (premium only).
    SpeechStarted,
    /// Server-side VAD detected speech end (premium only).
    SpeechStopped,
    /// A chunk of response audio.
    AudioChunk(Bytes),
    /// The response audio stream ended.
    AudioDone,
    /// Incremental response transcript.
    TextDelta(String),
    /// Full response transcript.
    TextDone(String),
    /// The model requested a function execution.
    ToolCall(ToolCall),
    /// The full response (text + audio + tool calls) completed.
    ResponseDone,
    /// REST chain entered a stage (efficient only).
    Stage(Stage),
    /// Transcription finished (efficient only).
    Transcription(String),
    /// Reasoning produced the assistant text (efficient only).
    Response(String),
    /// Synthesis finished with the full audio buffer (efficient only).
    Audio(Bytes),
    /// A stage attempt failed transiently and a retry is scheduled.
    Retry {
        stage: Stage,
        attempt: u32,
        delay_ms: u64,
    },
    /// A reconnection attempt is scheduled (premium only).
    Reconnecting { attempt: u32, delay_ms: u64 },
    /// Reconnection succeeded (premium only).
    Reconnected { attempt: u32 },
    /// All reconnection attempts failed (premium only).
    ReconnectionFailed,
    /// Backend error; fatal unless the orchestrator can resync.
    Error(String),
    /// The transport closed.
    Disconnected { code: Option<u16>, reason: String },
}

/// The conversation engine behind a common capability set.
pub enum Backend {
    Premium(PremiumBackend),
    Efficient(EfficientBackend),
}

impl Backend {
    /// Which mode this backend serves.
    pub fn mode(&self) -> Mode {
        match self {
            Self::Premium(_) => Mode::Premium,
            Self::Efficient(_) => Mode::Efficient,
        }
    }

    /// Subscribe to the backend event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        match self {
            Self::Premium(backend) => backend.subscribe(),
            Self::Efficient(backend) => backend.subscribe(),
        }
    }

    /// Stream one captured frame into the current utterance.
    pub async fn append_audio(&mut self, frame: AudioFrame) -> Result<()> {
        match self {
            Self::Premium(backend) => backend.append_audio(frame).await,
            Self::Efficient(backend) => backend.append_audio(frame),
        }
    }

    /// Mark end-of-utterance and request a response.
    pub async fn commit_audio(&mut self) -> Result<()> {
        match self {
            Self::Premium(backend) => backend.commit_audio().await,
            Self::Efficient(backend) => backend.commit_audio().await,
        }
    }

    /// Inject a user text turn.
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        match self {
            Self::Premium(backend) => backend.send_text(text).await,
            Self::Efficient(backend) => backend.send_text(text).await,
        }
    }

    /// Answer a tool call. Each `call_id` is answered exactly once.
    pub async fn send_tool_result(&mut self, call_id: &str, payload: Value) -> Result<()> {
        match self {
            Self::Premium(backend) => backend.send_tool_result(call_id, payload).await,
            Self::Efficient(backend) => backend.send_tool_result(call_id, payload).await,
        }
    }

    /// Tear the backend down. `intentional` suppresses reconnection.
    pub async fn disconnect(&mut self, intentional: bool) -> Result<()> {
        match self {
            Self::Premium(backend) => backend.disconnect(intentional).await,
            Self::Efficient(backend) => backend.disconnect(),
        }
    }
}

/// Event bus type shared by backend implementations.
pub(crate) type BackendBus = EventBus<BackendEvent>;
