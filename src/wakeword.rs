//! External wake-signal seam.
//!
//! Detection itself is out of scope; a wake source (hotkey, external
//! spotter, shell command) pushes [`WakeEvent`]s and the orchestrator
//! surfaces them as `wakeword` events.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

/// One wake signal from the external source.
#[derive(Debug, Clone)]
pub struct WakeEvent {
    /// Keyword the source matched (configured, e.g. "jarvis").
    pub keyword: String,
    /// Source-reported confidence, 0.0–1.0.
    pub confidence: f32,
    pub at: DateTime<Utc>,
}

/// Sender half handed to the external wake source.
pub type WakeSender = mpsc::Sender<WakeEvent>;

/// Receiver half consumed by the orchestrator.
pub type WakeReceiver = mpsc::Receiver<WakeEvent>;

/// Create the wake signal channel.
pub fn channel() -> (WakeSender, WakeReceiver) {
    mpsc::channel(8)
}
