//! Narrow command/event envelopes for embedding shells.
//!
//! Hosts that forbid direct access between their UI layer and the core
//! (sandboxed renderers, native shells) talk to the agent only through
//! these versioned, serde-typed envelopes. The surface is deliberately
//! small: lifecycle, settings I/O, metrics, confirmation responses, and
//! text injection — everything else arrives as subscribed events.

use crate::cost::CostMetrics;
use crate::config::Mode;
use crate::events::{AgentEvent, SessionStatus};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Envelope contract version.
pub const BRIDGE_VERSION: u32 = 1;

/// Commands a host shell may issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum BridgeCommand {
    /// Start the agent session.
    #[serde(rename = "agent.start")]
    AgentStart,
    /// Stop the agent session.
    #[serde(rename = "agent.stop")]
    AgentStop,
    /// Query the session status and mode.
    #[serde(rename = "agent.state")]
    AgentState,
    /// Stop and restart in one step.
    #[serde(rename = "agent.reset")]
    AgentReset,
    /// Read the effective settings.
    #[serde(rename = "settings.get")]
    SettingsGet,
    /// Merge a partial settings patch.
    #[serde(rename = "settings.patch")]
    SettingsPatch { patch: Value },
    /// Query cost metrics.
    #[serde(rename = "metrics.get")]
    MetricsGet,
    /// Inject a user text turn.
    #[serde(rename = "conversation.inject_text")]
    InjectText { text: String },
    /// Answer a pending confirmation request.
    #[serde(rename = "confirmation.respond")]
    ConfirmationRespond { id: String, approved: bool },
}

/// A versioned, correlated command frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub v: u32,
    /// Correlation id echoed in the response.
    pub id: String,
    #[serde(flatten)]
    pub command: BridgeCommand,
}

impl CommandEnvelope {
    pub fn new(id: impl Into<String>, command: BridgeCommand) -> Self {
        Self {
            v: BRIDGE_VERSION,
            id: id.into(),
            command,
        }
    }
}

/// A command response frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub v: u32,
    /// Correlation id of the command this answers.
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseEnvelope {
    pub fn ok(id: impl Into<String>, payload: Value) -> Self {
        Self {
            v: BRIDGE_VERSION,
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            v: BRIDGE_VERSION,
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(error.into()),
        }
    }
}

/// An event frame pushed to the shell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub v: u32,
    pub event: String,
    pub payload: Value,
}

impl EventEnvelope {
    fn new(event: &str, payload: Value) -> Self {
        Self {
            v: BRIDGE_VERSION,
            event: event.to_owned(),
            payload,
        }
    }

    /// Render an orchestrator event in wire form.
    pub fn from_agent_event(event: &AgentEvent) -> Self {
        match event {
            AgentEvent::Status(status) => {
                Self::new("status", json!({ "status": status }))
            }
            AgentEvent::Transcript {
                role,
                text,
                is_final,
            } => Self::new(
                "transcript",
                json!({ "role": role, "text": text, "final": is_final }),
            ),
            AgentEvent::Metrics(metrics) => Self::new("metrics", metrics_payload(metrics)),
            AgentEvent::AudioPlaying => Self::new("audio_playing", json!({})),
            AgentEvent::AudioStopped => Self::new("audio_stopped", json!({})),
            AgentEvent::InteractionComplete { mode } => {
                Self::new("interaction_complete", json!({ "mode": mode }))
            }
            AgentEvent::Wakeword(keyword) => {
                Self::new("wakeword", json!({ "keyword": keyword }))
            }
            AgentEvent::Error(message) => Self::new("error", json!({ "message": message })),
        }
    }
}

/// State payload for `agent.state` responses.
pub fn state_payload(status: SessionStatus, mode: Mode) -> Value {
    json!({ "status": status, "mode": mode })
}

fn metrics_payload(metrics: &CostMetrics) -> Value {
    json!({
        "total": metrics.total,
        "today": metrics.today,
        "month": metrics.month,
        "count": metrics.count,
        "avg": metrics.avg,
        "daily_remaining": metrics.daily_remaining,
    })
}
