//! Typed event fan-out.
//!
//! Each component that publishes events owns an [`EventBus`] typed by its
//! event enum. Consumers call [`EventBus::subscribe`] and hold the returned
//! receiver; dropping the receiver is the unsubscribe. There is no shared
//! emitter mixin — every bus is explicit and local to its component.

use crate::cost::CostMetrics;
use crate::config::Mode;
use tokio::sync::broadcast;

/// Default per-bus buffer. Slow subscribers that fall further behind than
/// this lose the oldest events (broadcast lag), never block the publisher.
const DEFAULT_CAPACITY: usize = 256;

/// A publish/subscribe registry for one event type.
#[derive(Debug)]
pub struct EventBus<E: Clone> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone> EventBus<E> {
    /// Create a bus with the default buffer capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus with an explicit buffer capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events published after this call. Drop the receiver
    /// to unsubscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers. Publishing with no
    /// subscribers is not an error.
    pub fn emit(&self, event: E) {
        let _ = self.sender.send(event);
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

/// Session status published by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Listening,
    Thinking,
    Speaking,
    Executing,
    Error,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Listening => write!(f, "listening"),
            Self::Thinking => write!(f, "thinking"),
            Self::Speaking => write!(f, "speaking"),
            Self::Executing => write!(f, "executing"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Events published by the orchestrator to its host.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// Session status transition.
    Status(SessionStatus),
    /// A user or assistant transcript line.
    Transcript {
        /// `"user"` or `"assistant"`.
        role: &'static str,
        text: String,
        is_final: bool,
    },
    /// Updated cost metrics after an interaction completes.
    Metrics(CostMetrics),
    /// Response playback started.
    AudioPlaying,
    /// Response playback finished and the sink was flushed.
    AudioStopped,
    /// One full interaction (utterance → response) completed.
    InteractionComplete { mode: Mode },
    /// External wake signal surfaced.
    Wakeword(String),
    /// Fatal error; the session requires stop/start to recover.
    Error(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_receives_emitted_events() {
        let bus: EventBus<u32> = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(7);
        bus.emit(8);
        assert_eq!(rx.recv().await.unwrap(), 7);
        assert_eq!(rx.recv().await.unwrap(), 8);
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_ok() {
        let bus: EventBus<u32> = EventBus::new();
        bus.emit(1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn dropping_receiver_unsubscribes() {
        let bus: EventBus<u32> = EventBus::new();
        let rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(rx);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn subscribers_only_see_events_after_subscription() {
        let bus: EventBus<u32> = EventBus::new();
        let mut early = bus.subscribe();
        bus.emit(1);
        let mut late = bus.subscribe();
        bus.emit(2);

        assert_eq!(early.recv().await.unwrap(), 1);
        assert_eq!(early.recv().await.unwrap(), 2);
        assert_eq!(late.recv().await.unwrap(), 2);
    }

    #[test]
    fn status_display_matches_wire_names() {
        assert_eq!(SessionStatus::Idle.to_string(), "idle");
        assert_eq!(SessionStatus::Executing.to_string(), "executing");
    }
}
