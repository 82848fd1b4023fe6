//! Routing scenarios driven through the public API with a pinned clock
//! and a pre-loaded ledger.

use std::sync::{Arc, Mutex};

use chrono::{TimeZone, Utc};
use wisp::clock::ManualClock;
use wisp::config::{Mode, RoutingConfig};
use wisp::cost::{CostLedger, SharedLedger};
use wisp::routing::{AdaptiveRouter, RouteReason};

fn ledger_with_spend_today(spent: f64) -> SharedLedger {
    let now = Utc.with_ymd_and_hms(2025, 6, 15, 11, 0, 0).unwrap();
    let mut ledger = CostLedger::new(1.0, 30.0);
    if spent > 0.0 {
        // Synthesis bills $0.015 per 1k characters.
        let chars = (spent / 0.015 * 1_000.0).round() as u64;
        ledger.record_synthesis(now, chars);
    }
    Arc::new(Mutex::new(ledger))
}

fn router(hour: u32, spent_today: f64) -> AdaptiveRouter {
    let now = Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap();
    AdaptiveRouter::new(
        RoutingConfig::default(),
        ledger_with_spend_today(spent_today),
        Arc::new(ManualClock::new(now, hour)),
    )
}

/// S1 — $0.60 spent today against a $1.00 budget with a 50% threshold
/// forces efficient routing.
#[test]
fn s1_routing_by_budget() {
    let router = router(12, 0.60);
    let decision = router.route(None);
    assert_eq!(decision.mode, Mode::Efficient);
    assert_eq!(decision.reason, RouteReason::CostLimit);
}

/// S2 — hour 8 is off-peak, hour 12 is peak with a clean budget.
#[test]
fn s2_routing_by_hour() {
    let early = router(8, 0.0);
    let decision = early.route(None);
    assert_eq!(decision.mode, Mode::Efficient);
    assert_eq!(decision.reason, RouteReason::TimeOfDay);

    let midday = router(12, 0.0);
    let decision = midday.route(None);
    assert_eq!(decision.mode, Mode::Premium);
    assert_eq!(decision.reason, RouteReason::Default);
}

/// Budget at exactly the threshold trips (`≥`, not `>`).
#[test]
fn threshold_boundary_is_inclusive() {
    let at = router(12, 0.50);
    assert_eq!(at.route(None).reason, RouteReason::CostLimit);

    let under = router(12, 0.4999);
    assert_eq!(under.route(None).reason, RouteReason::Default);
}

/// Setting a forced mode then clearing it returns routing to automatic
/// behaviour.
#[test]
fn forced_mode_round_trip() {
    let mut router = router(8, 0.90);
    router.set_forced_mode(Some(Mode::Premium));
    let decision = router.route(None);
    assert_eq!(decision.mode, Mode::Premium);
    assert_eq!(decision.reason, RouteReason::UserPreference);

    router.set_forced_mode(None);
    let decision = router.route(None);
    // Budget trips first once the override is gone.
    assert_eq!(decision.mode, Mode::Efficient);
    assert_eq!(decision.reason, RouteReason::CostLimit);
}
