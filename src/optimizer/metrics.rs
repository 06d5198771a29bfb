//! Walk-forward metrics and the objective function.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::candidate::ScanRow;
use super::profile::ObjectiveWeights;
use crate::analytics::{rate_pct, round_to, wilson_interval, ConfidenceInterval, OutcomeCounter, WILSON_Z_95};
use crate::types::FinalOutcome;

/// Commission charged per trade, in R.
pub const COMMISSION_R: f64 = 0.04;

/// Scores for one filtered row set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationMetrics {
    pub trade_count: u32,
    pub resolved_count: u32,
    pub t1_wins: u32,
    pub t2_wins: u32,
    pub stops_before_t1: u32,
    pub t1_win_rate_pct: f64,
    pub t2_win_rate_pct: f64,
    pub failure_rate_pct: f64,
    pub expectancy_r: f64,
    pub expectancy_lower_bound_r: f64,
    pub positive_realized_rate_pct: f64,
    pub objective_score: f64,
    pub objective_score_conservative: f64,
    pub t1_confidence95: ConfidenceInterval,
    pub t2_confidence95: ConfidenceInterval,
    pub failure_confidence95: ConfidenceInterval,
}

/// Per-key performance slice reported in the scorecard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceBucket {
    pub key: String,
    pub trade_count: u32,
    pub resolved_count: u32,
    pub t1_win_rate_pct: f64,
    pub t2_win_rate_pct: f64,
    pub failure_rate_pct: f64,
    pub t1_confidence95: ConfidenceInterval,
    pub t2_confidence95: ConfidenceInterval,
    pub failure_confidence95: ConfidenceInterval,
}

/// Realized R of a resolved row under a partial-exit policy.
///
/// Returns `None` for unresolved rows, rows without usable targets and
/// `invalidated_other` outcomes.
pub fn realized_r_for(row: &ScanRow, partial_at_t1_pct: f64) -> Option<f64> {
    let outcome = row.final_outcome?;
    let t1 = row.target1_r.filter(|r| r.is_finite())?;
    let t2 = row.target2_r.filter(|r| r.is_finite()).unwrap_or(t1);
    let p = partial_at_t1_pct;

    match outcome {
        FinalOutcome::T2BeforeStop => Some(p * t1 + (1.0 - p) * t2 - COMMISSION_R),
        FinalOutcome::T1BeforeStop => {
            let runner = if row.stop_hit && !row.move_stop_to_breakeven {
                -1.0
            } else {
                0.0
            };
            Some(p * t1 + (1.0 - p) * runner - COMMISSION_R)
        }
        FinalOutcome::StopBeforeT1 => Some(-1.0 - COMMISSION_R),
        FinalOutcome::ExpiredUnresolved => Some(-COMMISSION_R),
        FinalOutcome::InvalidatedOther => None,
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Sample standard deviation.
fn standard_deviation(values: &[f64]) -> f64 {
    if values.len() <= 1 {
        return 0.0;
    }
    let avg = mean(values);
    let variance = values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.max(0.0).sqrt()
}

/// Lower 95% bound of the mean, `mean - z * sd / sqrt(n)`.
pub fn mean_lower_bound(values: &[f64]) -> f64 {
    match values.len() {
        0 => 0.0,
        1 => values[0],
        n => mean(values) - WILSON_Z_95 * standard_deviation(values) / (n as f64).sqrt(),
    }
}

/// Scores a row set. Untriggered rows are ignored.
pub fn compute_metrics<'a, I>(rows: I, weights: &ObjectiveWeights, partial_at_t1_pct: f64) -> OptimizationMetrics
where
    I: IntoIterator<Item = &'a ScanRow>,
{
    let mut counter = OutcomeCounter::default();
    let mut realized = Vec::new();

    for row in rows {
        if !row.triggered {
            continue;
        }
        counter.triggered += 1;
        let Some(outcome) = row.final_outcome else {
            continue;
        };
        counter.apply(outcome);
        if let Some(r) = realized_r_for(row, partial_at_t1_pct).filter(|r| r.is_finite()) {
            realized.push(r);
        }
    }

    let resolved = counter.resolved;
    let t1_confidence95 = wilson_interval(counter.t1_wins, resolved);
    let t2_confidence95 = wilson_interval(counter.t2_wins, resolved);
    let failure_confidence95 = wilson_interval(counter.stops_before_t1, resolved);

    let t1_win_rate_pct = rate_pct(counter.t1_wins, resolved);
    let t2_win_rate_pct = rate_pct(counter.t2_wins, resolved);
    let failure_rate_pct = rate_pct(counter.stops_before_t1, resolved);

    let expectancy = mean(&realized);
    let expectancy_lower = mean_lower_bound(&realized);
    let positive = realized.iter().filter(|r| **r > 0.0).count() as u32;

    // single rounding keeps conservative <= headline
    let objective_score = round_to(
        t1_win_rate_pct * weights.t1 + t2_win_rate_pct * weights.t2 - failure_rate_pct * weights.failure_penalty
            + expectancy * weights.expectancy_r,
        2,
    );
    let objective_score_conservative = if resolved > 0 {
        round_to(
            t1_confidence95.lower_pct * weights.t1 + t2_confidence95.lower_pct * weights.t2
                - failure_confidence95.upper_pct * weights.failure_penalty
                + expectancy_lower * weights.expectancy_r,
            2,
        )
    } else {
        round_to(expectancy_lower * weights.expectancy_r, 2)
    };

    OptimizationMetrics {
        trade_count: counter.triggered,
        resolved_count: resolved,
        t1_wins: counter.t1_wins,
        t2_wins: counter.t2_wins,
        stops_before_t1: counter.stops_before_t1,
        t1_win_rate_pct,
        t2_win_rate_pct,
        failure_rate_pct,
        expectancy_r: round_to(expectancy, 4),
        expectancy_lower_bound_r: round_to(expectancy_lower, 4),
        positive_realized_rate_pct: rate_pct(positive, realized.len() as u32),
        objective_score,
        objective_score_conservative,
        t1_confidence95,
        t2_confidence95,
        failure_confidence95,
    }
}

/// Groups triggered rows by `key_of` and scores each group, sorted by trade
/// count descending then key.
pub fn evaluate_buckets<'a, I, F>(
    rows: I,
    key_of: F,
    weights: &ObjectiveWeights,
    partial_at_t1_pct: f64,
) -> Vec<PerformanceBucket>
where
    I: IntoIterator<Item = &'a ScanRow>,
    F: Fn(&ScanRow) -> String,
{
    let mut groups: HashMap<String, Vec<&ScanRow>> = HashMap::new();
    for row in rows.into_iter().filter(|r| r.triggered) {
        groups.entry(key_of(row)).or_default().push(row);
    }

    let mut buckets: Vec<PerformanceBucket> = groups
        .into_iter()
        .map(|(key, rows)| {
            let metrics = compute_metrics(rows, weights, partial_at_t1_pct);
            PerformanceBucket {
                key,
                trade_count: metrics.trade_count,
                resolved_count: metrics.resolved_count,
                t1_win_rate_pct: metrics.t1_win_rate_pct,
                t2_win_rate_pct: metrics.t2_win_rate_pct,
                failure_rate_pct: metrics.failure_rate_pct,
                t1_confidence95: metrics.t1_confidence95,
                t2_confidence95: metrics.t2_confidence95,
                failure_confidence95: metrics.failure_confidence95,
            }
        })
        .collect();
    buckets.sort_by(|a, b| b.trade_count.cmp(&a.trade_count).then_with(|| a.key.cmp(&b.key)));
    buckets
}
