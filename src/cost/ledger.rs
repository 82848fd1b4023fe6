//! Append-only cost ledger with rolling-window aggregates.

use super::pricing;
use crate::config::Mode;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Retention window for [`CostLedger::trim`].
const RETENTION_DAYS: i64 = 30;

/// Which billing stage produced a cost entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostStage {
    /// Premium streaming session (audio + text combined per response).
    Realtime,
    /// Efficient stage 1.
    Transcribe,
    /// Efficient stage 2.
    Reason,
    /// Efficient stage 3.
    Synthesize,
}

/// One recorded cost. Entries are never mutated after append; the only
/// removal path is the explicit retention trim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEntry {
    pub timestamp: DateTime<Utc>,
    pub mode: Mode,
    pub stage: CostStage,
    /// USD amount for this entry.
    pub amount: f64,
    /// Token count, when the stage is token-billed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    /// Audio duration, when the stage is duration-billed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_seconds: Option<f64>,
}

/// Aggregated view of the ledger at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostMetrics {
    /// Sum of every retained entry.
    pub total: f64,
    /// Sum over the trailing 24 hours.
    pub today: f64,
    /// Sum over the trailing 30 days.
    pub month: f64,
    /// Number of retained entries.
    pub count: usize,
    /// Mean entry amount (0 when empty).
    pub avg: f64,
    /// Dollars left of the daily budget (never negative).
    pub daily_remaining: f64,
}

/// Append-only record of per-stage costs with budget checks.
///
/// Single writer, many readers: the orchestrator loop appends, metrics
/// consumers scan. Aggregates are derived from filtered scans, never
/// cached, so the total is exactly the sum of the entries.
#[derive(Debug)]
pub struct CostLedger {
    entries: Vec<CostEntry>,
    daily_budget: f64,
    monthly_budget: f64,
}

impl CostLedger {
    /// Create an empty ledger with the given budgets.
    pub fn new(daily_budget: f64, monthly_budget: f64) -> Self {
        Self {
            entries: Vec::new(),
            daily_budget,
            monthly_budget,
        }
    }

    /// Rebuild a ledger from exported entries, e.g. an external snapshot.
    ///
    /// Entries are re-sorted by timestamp so the append order (and with it
    /// the monotone running total) is preserved regardless of export order.
    pub fn replay(daily_budget: f64, monthly_budget: f64, mut entries: Vec<CostEntry>) -> Self {
        entries.sort_by_key(|e| e.timestamp);
        Self {
            entries,
            daily_budget,
            monthly_budget,
        }
    }

    /// Record one premium response: streamed audio both ways plus any
    /// token-billed text. Returns the computed cost.
    pub fn record_realtime(
        &mut self,
        now: DateTime<Utc>,
        input_seconds: f64,
        output_seconds: f64,
        text_in_tokens: u64,
        text_out_tokens: u64,
    ) -> f64 {
        let amount = pricing::realtime_audio_cost(input_seconds, output_seconds)
            + pricing::realtime_text_cost(text_in_tokens, text_out_tokens);
        self.entries.push(CostEntry {
            timestamp: now,
            mode: Mode::Premium,
            stage: CostStage::Realtime,
            amount,
            tokens: Some(text_in_tokens + text_out_tokens),
            audio_seconds: Some(input_seconds + output_seconds),
        });
        amount
    }

    /// Record one transcription call. Returns the computed cost.
    pub fn record_transcription(&mut self, now: DateTime<Utc>, audio_seconds: f64) -> f64 {
        let amount = pricing::transcribe_cost(audio_seconds);
        self.entries.push(CostEntry {
            timestamp: now,
            mode: Mode::Efficient,
            stage: CostStage::Transcribe,
            amount,
            tokens: None,
            audio_seconds: Some(audio_seconds),
        });
        amount
    }

    /// Record one reasoning call. Returns the computed cost.
    pub fn record_reasoning(
        &mut self,
        now: DateTime<Utc>,
        input_tokens: u64,
        output_tokens: u64,
    ) -> f64 {
        let amount = pricing::reason_cost(input_tokens, output_tokens);
        self.entries.push(CostEntry {
            timestamp: now,
            mode: Mode::Efficient,
            stage: CostStage::Reason,
            amount,
            tokens: Some(input_tokens + output_tokens),
            audio_seconds: None,
        });
        amount
    }

    /// Record one synthesis call. Returns the computed cost.
    pub fn record_synthesis(&mut self, now: DateTime<Utc>, characters: u64) -> f64 {
        let amount = pricing::synthesize_cost(characters);
        self.entries.push(CostEntry {
            timestamp: now,
            mode: Mode::Efficient,
            stage: CostStage::Synthesize,
            amount,
            tokens: None,
            audio_seconds: None,
        });
        amount
    }

    /// Sum of entries newer than `now − window`.
    fn window_total(&self, now: DateTime<Utc>, window: Duration) -> f64 {
        let cutoff = now - window;
        self.entries
            .iter()
            .filter(|e| e.timestamp > cutoff)
            .map(|e| e.amount)
            .sum()
    }

    /// Aggregated metrics at `now`.
    pub fn metrics(&self, now: DateTime<Utc>) -> CostMetrics {
        let total: f64 = self.entries.iter().map(|e| e.amount).sum();
        let today = self.window_total(now, Duration::hours(24));
        let month = self.window_total(now, Duration::days(30));
        let count = self.entries.len();
        let avg = if count == 0 { 0.0 } else { total / count as f64 };
        CostMetrics {
            total,
            today,
            month,
            count,
            avg,
            daily_remaining: (self.daily_budget - today).max(0.0),
        }
    }

    /// Trailing-24h spend as a percentage of the daily budget.
    pub fn daily_usage_pct(&self, now: DateTime<Utc>) -> f64 {
        if self.daily_budget <= 0.0 {
            return 100.0;
        }
        self.window_total(now, Duration::hours(24)) / self.daily_budget * 100.0
    }

    /// Whether trailing-24h spend has reached the daily budget.
    pub fn exceeded_daily(&self, now: DateTime<Utc>) -> bool {
        self.window_total(now, Duration::hours(24)) >= self.daily_budget
    }

    /// Whether trailing-30d spend has reached the monthly budget.
    pub fn exceeded_monthly(&self, now: DateTime<Utc>) -> bool {
        self.window_total(now, Duration::days(30)) >= self.monthly_budget
    }

    /// Drop entries older than the 30-day retention window.
    pub fn trim(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::days(RETENTION_DAYS);
        let before = self.entries.len();
        self.entries.retain(|e| e.timestamp > cutoff);
        before - self.entries.len()
    }

    /// All retained entries, oldest first. Suitable for external snapshot.
    pub fn entries(&self) -> &[CostEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 15, hour, min, 0).unwrap()
    }

    #[test]
    fn record_returns_computed_cost() {
        let mut ledger = CostLedger::new(1.0, 30.0);
        let cost = ledger.record_transcription(at(10, 0), 60.0);
        assert!((cost - 0.006).abs() < 1e-9);
        assert_eq!(ledger.entries().len(), 1);
    }

    #[test]
    fn total_is_exact_sum_of_stage_costs() {
        let mut ledger = CostLedger::new(1.0, 30.0);
        let mut expected = 0.0;
        expected += ledger.record_transcription(at(10, 0), 2.0);
        expected += ledger.record_reasoning(at(10, 0), 500, 200);
        expected += ledger.record_synthesis(at(10, 0), 180);
        expected += ledger.record_realtime(at(11, 0), 5.0, 8.0, 0, 0);

        let metrics = ledger.metrics(at(12, 0));
        assert!((metrics.total - expected).abs() < 1e-12);
        assert_eq!(metrics.count, 4);
        assert!((metrics.avg - expected / 4.0).abs() < 1e-12);
    }

    #[test]
    fn today_window_excludes_older_entries() {
        let mut ledger = CostLedger::new(1.0, 30.0);
        let yesterday = Utc.with_ymd_and_hms(2025, 6, 13, 9, 0, 0).unwrap();
        ledger.record_synthesis(yesterday, 10_000);
        ledger.record_synthesis(at(9, 0), 10_000);

        let metrics = ledger.metrics(at(12, 0));
        assert!((metrics.today - 0.15).abs() < 1e-9);
        assert!((metrics.month - 0.30).abs() < 1e-9);
    }

    #[test]
    fn daily_usage_pct_against_budget() {
        let mut ledger = CostLedger::new(1.0, 30.0);
        // $0.60 of synthesis today.
        ledger.record_synthesis(at(9, 0), 40_000);
        let pct = ledger.daily_usage_pct(at(10, 0));
        assert!((pct - 60.0).abs() < 1e-9);
        assert!(!ledger.exceeded_daily(at(10, 0)));
        assert!(!ledger.exceeded_monthly(at(10, 0)));
    }

    #[test]
    fn exceeded_daily_at_exact_budget() {
        let mut ledger = CostLedger::new(0.15, 30.0);
        ledger.record_synthesis(at(9, 0), 10_000); // exactly $0.15
        assert!(ledger.exceeded_daily(at(10, 0)));
    }

    #[test]
    fn daily_remaining_never_negative() {
        let mut ledger = CostLedger::new(0.10, 30.0);
        ledger.record_synthesis(at(9, 0), 20_000); // $0.30
        let metrics = ledger.metrics(at(10, 0));
        assert_eq!(metrics.daily_remaining, 0.0);
    }

    #[test]
    fn trim_drops_only_expired_entries() {
        let mut ledger = CostLedger::new(1.0, 30.0);
        let old = Utc.with_ymd_and_hms(2025, 4, 1, 9, 0, 0).unwrap();
        ledger.record_synthesis(old, 1_000);
        ledger.record_synthesis(at(9, 0), 1_000);

        let dropped = ledger.trim(at(10, 0));
        assert_eq!(dropped, 1);
        assert_eq!(ledger.entries().len(), 1);
    }

    #[test]
    fn replay_restores_timestamp_order() {
        let mut ledger = CostLedger::new(1.0, 30.0);
        ledger.record_synthesis(at(9, 0), 1_000);
        ledger.record_transcription(at(10, 0), 2.0);
        ledger.record_reasoning(at(11, 0), 100, 50);

        // Export, shuffle, replay.
        let mut exported = ledger.entries().to_vec();
        exported.reverse();
        let replayed = CostLedger::replay(1.0, 30.0, exported);

        let stamps: Vec<_> = replayed.entries().iter().map(|e| e.timestamp).collect();
        let mut sorted = stamps.clone();
        sorted.sort();
        assert_eq!(stamps, sorted);
        assert!(
            (replayed.metrics(at(12, 0)).total - ledger.metrics(at(12, 0)).total).abs() < 1e-12
        );
    }

    #[test]
    fn entries_serde_round_trip() {
        let mut ledger = CostLedger::new(1.0, 30.0);
        ledger.record_reasoning(at(9, 0), 700, 300);
        let json = serde_json::to_string(ledger.entries()).unwrap();
        let parsed: Vec<CostEntry> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ledger.entries());
    }

    #[test]
    fn empty_ledger_metrics() {
        let ledger = CostLedger::new(1.0, 30.0);
        let metrics = ledger.metrics(at(10, 0));
        assert_eq!(metrics.total, 0.0);
        assert_eq!(metrics.count, 0);
        assert_eq!(metrics.avg, 0.0);
        assert_eq!(metrics.daily_remaining, 1.0);
    }
}
