//! Cost accounting: fixed price table, append-only ledger, budget checks.

pub mod ledger;
pub mod pricing;

pub use ledger::{CostEntry, CostLedger, CostMetrics, CostStage};

/// Ledger handle shared between the orchestrator (writer) and metrics
/// consumers (readers). Writes are append-only; the lock is held only
/// across synchronous sections.
pub type SharedLedger = std::sync::Arc<std::sync::Mutex<CostLedger>>;
