//! Wisp: adaptive voice-agent orchestrator.
//!
//! Turns a continuous 16 kHz PCM stream and system events into spoken
//! responses and gated host-OS actions, while policing cost and latency.
//!
//! # Architecture
//!
//! The core is four coupled subsystems wired through one event loop:
//! - **Routing**: [`routing::AdaptiveRouter`] picks the backend per
//!   interaction from live budget, time of day, and hints
//! - **Backends**: [`backend::PremiumBackend`] streams speech-to-speech
//!   over a WebSocket session; [`backend::EfficientBackend`] runs the
//!   transcribe → reason → synthesize REST chain
//! - **Resilience**: [`resilience`] provides reconnect backoff for the
//!   stream and per-stage retry with jitter for the chain
//! - **Functions**: [`functions::FunctionExecutor`] validates,
//!   whitelists, and confirmation-gates host-OS side effects
//!
//! The [`orchestrator::ConversationOrchestrator`] owns the session state
//! machine and routes audio, tool calls, and playback between them.

pub mod audio;
pub mod backend;
pub mod bridge;
pub mod clock;
pub mod config;
pub mod cost;
pub mod credentials;
pub mod error;
pub mod events;
pub mod functions;
pub mod orchestrator;
pub mod resilience;
pub mod routing;
pub mod wakeword;

pub use config::{AgentConfig, Mode};
pub use error::{AgentError, Result};
pub use events::{AgentEvent, SessionStatus};
pub use orchestrator::ConversationOrchestrator;
