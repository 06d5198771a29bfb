//! Win-rate analytics over resolved setup outcomes.
//!
//! Rates always use the resolved denominator (triggered rows with a final
//! outcome), so pending trades never dilute them. Every rate carries a Wilson
//! score interval.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::{bucket_key, combo_key, DateRange, FinalOutcome, OutcomeRow};

/// z for a two-sided 95% interval.
pub const WILSON_Z_95: f64 = 1.96;

/// Rounds half away from zero to `decimals` places.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Binomial confidence interval in percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfidenceInterval {
    pub sample_size: u32,
    pub point_pct: f64,
    pub lower_pct: f64,
    pub upper_pct: f64,
}

impl ConfidenceInterval {
    /// No information: the whole range is plausible.
    pub fn empty() -> Self {
        Self {
            sample_size: 0,
            point_pct: 0.0,
            lower_pct: 0.0,
            upper_pct: 100.0,
        }
    }
}

impl Default for ConfidenceInterval {
    fn default() -> Self {
        Self::empty()
    }
}

/// Wilson score interval for `successes` out of `sample_size`.
pub fn wilson_interval(successes: u32, sample_size: u32) -> ConfidenceInterval {
    wilson_interval_z(successes, sample_size, WILSON_Z_95)
}

pub fn wilson_interval_z(successes: u32, sample_size: u32, z: f64) -> ConfidenceInterval {
    if sample_size == 0 {
        return ConfidenceInterval::empty();
    }

    let n = sample_size as f64;
    let p = (successes.min(sample_size) as f64) / n;
    let z2 = z * z;
    let denominator = 1.0 + z2 / n;
    let center = (p + z2 / (2.0 * n)) / denominator;
    let margin = z * ((p * (1.0 - p) / n) + z2 / (4.0 * n * n)).sqrt() / denominator;

    let point_pct = round_to(p * 100.0, 2);
    // clamp so rounding can never push a bound past the point estimate
    let lower_pct = round_to(((center - margin) * 100.0).max(0.0), 2).min(point_pct);
    let upper_pct = round_to(((center + margin) * 100.0).min(100.0), 2).max(point_pct);

    ConfidenceInterval {
        sample_size,
        point_pct,
        lower_pct,
        upper_pct,
    }
}

/// Percentage over the resolved denominator, 0 when nothing resolved.
pub fn rate_pct(count: u32, denominator: u32) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        round_to((count as f64 / denominator as f64) * 100.0, 2)
    }
}

/// Running counts for one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeCounter {
    pub triggered: u32,
    pub resolved: u32,
    pub t1_wins: u32,
    pub t2_wins: u32,
    pub stops_before_t1: u32,
    pub invalidated_other: u32,
    pub expired_unresolved: u32,
}

impl OutcomeCounter {
    pub fn record(&mut self, row: &OutcomeRow) {
        if !row.is_triggered() {
            return;
        }
        self.triggered += 1;
        if let Some(outcome) = row.final_outcome {
            self.apply(outcome);
        }
    }

    pub fn apply(&mut self, outcome: FinalOutcome) {
        self.resolved += 1;
        match outcome {
            FinalOutcome::T2BeforeStop => {
                self.t2_wins += 1;
                self.t1_wins += 1;
            }
            FinalOutcome::T1BeforeStop => self.t1_wins += 1,
            FinalOutcome::StopBeforeT1 => self.stops_before_t1 += 1,
            FinalOutcome::InvalidatedOther => self.invalidated_other += 1,
            FinalOutcome::ExpiredUnresolved => self.expired_unresolved += 1,
        }
    }

    pub fn pending(&self) -> u32 {
        self.triggered.saturating_sub(self.resolved)
    }
}

/// Aggregated counts and rates for one dimension value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WinRateBucket {
    pub key: String,
    pub triggered_count: u32,
    pub resolved_count: u32,
    pub pending_count: u32,
    pub t1_wins: u32,
    pub t2_wins: u32,
    pub stops_before_t1: u32,
    pub invalidated_other: u32,
    pub expired_unresolved: u32,
    pub t1_win_rate_pct: f64,
    pub t2_win_rate_pct: f64,
    pub failure_rate_pct: f64,
    pub t1_confidence95: ConfidenceInterval,
    pub t2_confidence95: ConfidenceInterval,
    pub failure_confidence95: ConfidenceInterval,
}

impl WinRateBucket {
    pub fn from_counter(key: String, counter: &OutcomeCounter) -> Self {
        let denominator = counter.resolved;
        Self {
            key,
            triggered_count: counter.triggered,
            resolved_count: counter.resolved,
            pending_count: counter.pending(),
            t1_wins: counter.t1_wins,
            t2_wins: counter.t2_wins,
            stops_before_t1: counter.stops_before_t1,
            invalidated_other: counter.invalidated_other,
            expired_unresolved: counter.expired_unresolved,
            t1_win_rate_pct: rate_pct(counter.t1_wins, denominator),
            t2_win_rate_pct: rate_pct(counter.t2_wins, denominator),
            failure_rate_pct: rate_pct(counter.stops_before_t1, denominator),
            t1_confidence95: wilson_interval(counter.t1_wins, denominator),
            t2_confidence95: wilson_interval(counter.t2_wins, denominator),
            failure_confidence95: wilson_interval(counter.stops_before_t1, denominator),
        }
    }
}

/// Grouping dimension for bucketed analytics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grouping {
    SetupType,
    Regime,
    Tier,
    SetupRegime,
}

impl Grouping {
    fn key_for(&self, row: &OutcomeRow) -> String {
        match self {
            Grouping::SetupType => bucket_key(Some(&row.setup_type)),
            Grouping::Regime => bucket_key(row.regime.as_deref()),
            Grouping::Tier => bucket_key(row.tier.as_deref()),
            Grouping::SetupRegime => combo_key(&row.setup_type, row.regime.as_deref()),
        }
    }
}

/// Buckets sorted by triggered count descending, then key ascending.
pub fn compute_buckets(rows: &[OutcomeRow], grouping: Grouping) -> Vec<WinRateBucket> {
    let mut counters: HashMap<String, OutcomeCounter> = HashMap::new();
    for row in rows.iter().filter(|r| r.is_triggered()) {
        counters.entry(grouping.key_for(row)).or_default().record(row);
    }

    let mut buckets: Vec<WinRateBucket> = counters
        .into_iter()
        .map(|(key, counter)| WinRateBucket::from_counter(key, &counter))
        .collect();
    buckets.sort_by(|a, b| {
        b.triggered_count
            .cmp(&a.triggered_count)
            .then_with(|| a.key.cmp(&b.key))
    });
    buckets
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Denominator {
    ResolvedTriggered,
}

/// Date range of an analytics report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl From<DateRange> for ReportRange {
    fn from(range: DateRange) -> Self {
        Self {
            from: range.from,
            to: range.to,
        }
    }
}

/// Overall and bucketed win-rate report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WinRateAnalytics {
    pub date_range: ReportRange,
    pub denominator: Denominator,
    pub triggered_count: u32,
    pub resolved_count: u32,
    pub pending_count: u32,
    pub t1_wins: u32,
    pub t2_wins: u32,
    pub stops_before_t1: u32,
    pub invalidated_other: u32,
    pub expired_unresolved: u32,
    pub t1_win_rate_pct: f64,
    pub t2_win_rate_pct: f64,
    pub failure_rate_pct: f64,
    pub t1_confidence95: ConfidenceInterval,
    pub t2_confidence95: ConfidenceInterval,
    pub failure_confidence95: ConfidenceInterval,
    pub by_setup_type: Vec<WinRateBucket>,
    pub by_regime: Vec<WinRateBucket>,
    pub by_tier: Vec<WinRateBucket>,
    pub by_setup_regime: Vec<WinRateBucket>,
}

/// Rolls outcome rows into a win-rate report. Untriggered rows are ignored.
pub fn summarize(rows: &[OutcomeRow], range: DateRange) -> WinRateAnalytics {
    let mut overall = OutcomeCounter::default();
    for row in rows {
        overall.record(row);
    }
    let headline = WinRateBucket::from_counter(String::new(), &overall);

    WinRateAnalytics {
        date_range: range.into(),
        denominator: Denominator::ResolvedTriggered,
        triggered_count: headline.triggered_count,
        resolved_count: headline.resolved_count,
        pending_count: headline.pending_count,
        t1_wins: headline.t1_wins,
        t2_wins: headline.t2_wins,
        stops_before_t1: headline.stops_before_t1,
        invalidated_other: headline.invalidated_other,
        expired_unresolved: headline.expired_unresolved,
        t1_win_rate_pct: headline.t1_win_rate_pct,
        t2_win_rate_pct: headline.t2_win_rate_pct,
        failure_rate_pct: headline.failure_rate_pct,
        t1_confidence95: headline.t1_confidence95,
        t2_confidence95: headline.t2_confidence95,
        failure_confidence95: headline.failure_confidence95,
        by_setup_type: compute_buckets(rows, Grouping::SetupType),
        by_regime: compute_buckets(rows, Grouping::Regime),
        by_tier: compute_buckets(rows, Grouping::Tier),
        by_setup_regime: compute_buckets(rows, Grouping::SetupRegime),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;
    use chrono::{TimeZone, Utc};
    use rand::Rng;

    fn create_test_row(
        id: &str,
        setup_type: &str,
        regime: Option<&str>,
        triggered: bool,
        outcome: Option<FinalOutcome>,
    ) -> OutcomeRow {
        OutcomeRow {
            engine_setup_id: id.to_string(),
            session_date: NaiveDate::from_ymd_opt(2026, 3, 10).unwrap(),
            setup_type: setup_type.to_string(),
            direction: Direction::Bullish,
            regime: regime.map(str::to_string),
            tier: None,
            triggered_at: triggered.then(|| Utc.with_ymd_and_hms(2026, 3, 10, 15, 0, 0).unwrap()),
            final_outcome: outcome,
            t1_hit_at: None,
            t2_hit_at: None,
            stop_hit_at: None,
            realized_r: None,
            entry_fill_price: None,
            ambiguous: false,
        }
    }

    fn test_range() -> DateRange {
        let d = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        DateRange { from: d, to: d }
    }

    #[test]
    fn test_wilson_interval_bounds() {
        let mut rng = rand::thread_rng();
        for _ in 0..2000 {
            let n: u32 = rng.gen_range(1..=500);
            let wins: u32 = rng.gen_range(0..=n);
            let ci = wilson_interval(wins, n);
            assert!(ci.lower_pct >= 0.0);
            assert!(ci.lower_pct <= ci.point_pct, "{:?}", ci);
            assert!(ci.point_pct <= ci.upper_pct, "{:?}", ci);
            assert!(ci.upper_pct <= 100.0);
            assert_eq!(ci.point_pct, round_to(100.0 * wins as f64 / n as f64, 2));
        }
    }

    #[test]
    fn test_wilson_interval_edges() {
        assert_eq!(wilson_interval(0, 0), ConfidenceInterval::empty());

        let none = wilson_interval(0, 20);
        assert_eq!(none.point_pct, 0.0);
        assert_eq!(none.lower_pct, 0.0);
        assert!(none.upper_pct > 0.0);

        let all = wilson_interval(20, 20);
        assert_eq!(all.point_pct, 100.0);
        assert_eq!(all.upper_pct, 100.0);
        assert!(all.lower_pct < 100.0);

        // 9 of 20: point 45, upper ~66
        let ci = wilson_interval(9, 20);
        assert_eq!(ci.point_pct, 45.0);
        assert!(ci.upper_pct > 65.0 && ci.upper_pct < 67.0);
    }

    #[test]
    fn test_summarize_counts_resolved_denominator() {
        let rows = vec![
            create_test_row("a", "fade_at_wall", Some("ranging"), true, Some(FinalOutcome::T2BeforeStop)),
            create_test_row("b", "fade_at_wall", Some("ranging"), true, Some(FinalOutcome::T1BeforeStop)),
            create_test_row("c", "orb_breakout", Some("trending"), true, Some(FinalOutcome::StopBeforeT1)),
            create_test_row("d", "orb_breakout", None, true, Some(FinalOutcome::StopBeforeT1)),
            create_test_row("e", "orb_breakout", None, false, None),
        ];

        let analytics = summarize(&rows, test_range());
        assert_eq!(analytics.triggered_count, 4);
        assert_eq!(analytics.resolved_count, 4);
        assert_eq!(analytics.pending_count, 0);
        assert_eq!(analytics.t1_wins, 2);
        assert_eq!(analytics.t2_wins, 1);
        assert_eq!(analytics.stops_before_t1, 2);
        assert_eq!(analytics.t1_win_rate_pct, 50.0);
        assert_eq!(analytics.t2_win_rate_pct, 25.0);
        assert_eq!(analytics.failure_rate_pct, 50.0);
    }

    #[test]
    fn test_pending_rows_do_not_dilute_rate() {
        let rows = vec![
            create_test_row("a", "fade_at_wall", None, true, Some(FinalOutcome::T1BeforeStop)),
            create_test_row("b", "fade_at_wall", None, true, None),
            create_test_row("c", "fade_at_wall", None, true, None),
        ];

        let analytics = summarize(&rows, test_range());
        assert_eq!(analytics.triggered_count, 3);
        assert_eq!(analytics.resolved_count, 1);
        assert_eq!(analytics.pending_count, 2);
        assert_eq!(analytics.t1_win_rate_pct, 100.0);
    }

    #[test]
    fn test_bucket_ordering() {
        let rows = vec![
            create_test_row("a", "trend_pullback", Some("trending"), true, None),
            create_test_row("b", "fade_at_wall", Some("ranging"), true, None),
            create_test_row("c", "orb_breakout", Some("ranging"), true, None),
            create_test_row("d", "orb_breakout", None, true, None),
        ];

        let by_type = compute_buckets(&rows, Grouping::SetupType);
        let keys: Vec<&str> = by_type.iter().map(|b| b.key.as_str()).collect();
        assert_eq!(keys, vec!["orb_breakout", "fade_at_wall", "trend_pullback"]);

        let by_regime = compute_buckets(&rows, Grouping::Regime);
        let keys: Vec<&str> = by_regime.iter().map(|b| b.key.as_str()).collect();
        assert_eq!(keys, vec!["ranging", "trending", "unknown"]);

        let by_combo = compute_buckets(&rows, Grouping::SetupRegime);
        assert!(by_combo.iter().any(|b| b.key == "orb_breakout|unknown"));
    }
}
