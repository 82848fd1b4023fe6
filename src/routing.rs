//! Adaptive mode router.
//!
//! Evaluated at startup and at every utterance boundary. The cascade is
//! strict: forced mode, then budget, then time of day, then interaction
//! hint, then the configured default. Estimates ride along for telemetry
//! and never gate behaviour.

use crate::clock::Clock;
use crate::config::{Mode, RoutingConfig};
use crate::cost::SharedLedger;
use std::sync::Arc;
use tracing::debug;

/// Why a routing decision picked its mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteReason {
    UserPreference,
    CostLimit,
    TimeOfDay,
    InteractionType,
    Default,
}

/// Caller-supplied hint about the upcoming interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionHint {
    /// Short factual exchange; the REST chain is good enough.
    Simple,
    /// Open-ended conversation.
    Complex,
}

/// A per-utterance backend choice.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingDecision {
    pub mode: Mode,
    pub reason: RouteReason,
    /// Rough per-interaction cost, telemetry only.
    pub estimated_cost: f64,
    /// Rough first-audio latency, telemetry only.
    pub estimated_latency_ms: u64,
}

impl RoutingDecision {
    fn for_mode(mode: Mode, reason: RouteReason) -> Self {
        let (estimated_cost, estimated_latency_ms) = match mode {
            Mode::Premium => (0.12, 500),
            Mode::Efficient => (0.004, 2_000),
        };
        Self {
            mode,
            reason,
            estimated_cost,
            estimated_latency_ms,
        }
    }
}

/// Chooses the backend for each interaction.
pub struct AdaptiveRouter {
    config: RoutingConfig,
    ledger: SharedLedger,
    clock: Arc<dyn Clock>,
    forced: Option<Mode>,
}

impl AdaptiveRouter {
    pub fn new(config: RoutingConfig, ledger: SharedLedger, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            ledger,
            clock,
            forced: None,
        }
    }

    /// Pin the mode regardless of budget and time. `None` restores
    /// automatic routing.
    pub fn set_forced_mode(&mut self, mode: Option<Mode>) {
        self.forced = mode;
    }

    /// Currently forced mode, if any.
    pub fn forced_mode(&self) -> Option<Mode> {
        self.forced
    }

    /// Decide the mode for the next interaction.
    pub fn route(&self, hint: Option<InteractionHint>) -> RoutingDecision {
        if let Some(mode) = self.forced {
            return RoutingDecision::for_mode(mode, RouteReason::UserPreference);
        }

        let usage_pct = self
            .ledger
            .lock()
            .map(|ledger| ledger.daily_usage_pct(self.clock.now()))
            .unwrap_or(0.0);
        if usage_pct >= self.config.budget_threshold_pct {
            debug!(usage_pct, threshold = self.config.budget_threshold_pct, "budget trip");
            return RoutingDecision::for_mode(Mode::Efficient, RouteReason::CostLimit);
        }

        let hour = self.clock.hour_of_day();
        if hour < self.config.peak_hours_start || hour >= self.config.peak_hours_end {
            return RoutingDecision::for_mode(Mode::Efficient, RouteReason::TimeOfDay);
        }

        if hint == Some(InteractionHint::Simple) {
            return RoutingDecision::for_mode(Mode::Efficient, RouteReason::InteractionType);
        }

        RoutingDecision::for_mode(self.config.default_mode, RouteReason::Default)
    }
}
