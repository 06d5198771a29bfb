//! Price-path matcher.
//!
//! Replays an ordered bar series against a setup's entry zone, stop and
//! targets and reports the first bar at which each level was touched. Touch
//! tests are inclusive of bar extremes. A bar whose range reaches both the
//! active stop and a pending target cannot be sequenced at its resolution;
//! the verdict is then marked ambiguous and carries no outcome.

use chrono::{DateTime, Duration, Utc};

use crate::types::{Direction, EntryZone, FinalOutcome, PriceBar, SetupInstance};

/// Levels the matcher tests, after any execution adjustments.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelPlan {
    pub direction: Direction,
    pub entry_zone: EntryZone,
    pub stop: f64,
    pub target1: f64,
    pub target2: Option<f64>,
    /// Added against the trade to a detected trigger price.
    pub entry_slip: f64,
    pub move_stop_to_breakeven: bool,
}

impl LevelPlan {
    /// Unadjusted levels taken straight from a setup.
    pub fn from_setup(setup: &SetupInstance, move_stop_to_breakeven: bool) -> Self {
        Self {
            direction: setup.direction,
            entry_zone: setup.entry_zone,
            stop: setup.stop_price,
            target1: setup.target1_price,
            target2: setup.target2_price.filter(|p| p.is_finite()),
            entry_slip: 0.0,
            move_stop_to_breakeven,
        }
    }

    fn fill_price(&self, trigger_price: f64) -> f64 {
        match self.direction {
            Direction::Bullish => trigger_price + self.entry_slip,
            Direction::Bearish => trigger_price - self.entry_slip,
        }
    }

    fn reaches_target(&self, level: f64, low: f64, high: f64) -> bool {
        match self.direction {
            Direction::Bullish => high >= level,
            Direction::Bearish => low <= level,
        }
    }

    fn reaches_stop(&self, level: f64, low: f64, high: f64) -> bool {
        match self.direction {
            Direction::Bullish => low <= level,
            Direction::Bearish => high >= level,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchOptions {
    /// Bars opening before this instant are ignored.
    pub not_before: Option<DateTime<Utc>>,
    /// How long after the trigger the matcher keeps looking.
    pub ttl: Duration,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            not_before: None,
            ttl: Duration::minutes(90),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchVerdict {
    pub triggered_at: Option<DateTime<Utc>>,
    pub trigger_price: Option<f64>,
    pub entry_fill_price: Option<f64>,
    pub t1_hit_at: Option<DateTime<Utc>>,
    pub t2_hit_at: Option<DateTime<Utc>>,
    pub stop_hit_at: Option<DateTime<Utc>>,
    pub outcome: Option<FinalOutcome>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub last_price: Option<f64>,
    pub last_observed_at: Option<DateTime<Utc>>,
    pub ambiguous: bool,
}

impl MatchVerdict {
    pub fn is_triggered(&self) -> bool {
        self.triggered_at.is_some()
    }
}

/// Intrabar path: up bars visit the low first, down bars the high.
fn bar_path(bar: &PriceBar) -> [f64; 4] {
    if bar.c >= bar.o {
        [bar.o, bar.l, bar.h, bar.c]
    } else {
        [bar.o, bar.h, bar.l, bar.c]
    }
}

/// Price at which a path segment first enters the entry zone.
pub(crate) fn find_entry_trigger(start: f64, end: f64, zone: &EntryZone) -> Option<f64> {
    let (low, high) = zone.bounds();
    if start >= low && start <= high {
        return Some(start);
    }
    if start == end {
        return None;
    }
    let crosses_low = start < low && end >= low;
    let crosses_high = start > high && end <= high;
    if end > start {
        if crosses_low {
            return Some(low);
        }
        if crosses_high {
            return Some(high);
        }
    } else {
        if crosses_high {
            return Some(high);
        }
        if crosses_low {
            return Some(low);
        }
    }
    None
}

fn extremes(points: &[f64]) -> (f64, f64) {
    points.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &p| {
        (lo.min(p), hi.max(p))
    })
}

/// Replays `bars` (ascending by time) against `plan`.
pub fn match_levels(plan: &LevelPlan, bars: &[PriceBar], options: &MatchOptions) -> MatchVerdict {
    let mut verdict = MatchVerdict::default();
    let ttl_ms = options.ttl.num_milliseconds().max(0);
    let not_before = options.not_before.map(|t| t.timestamp_millis());
    let mut window_end: Option<i64> = None;

    for bar in bars {
        if !bar.is_finite() {
            continue;
        }
        if not_before.is_some_and(|t| bar.t < t) {
            continue;
        }
        if window_end.is_some_and(|end| bar.t >= end) {
            break;
        }
        let Some(ts) = bar.timestamp() else {
            continue;
        };

        let path = bar_path(bar);
        let mut segment: Vec<f64> = path.to_vec();

        if verdict.triggered_at.is_none() {
            let entry = (0..path.len() - 1).find_map(|i| {
                find_entry_trigger(path[i], path[i + 1], &plan.entry_zone).map(|price| (i, price))
            });
            let Some((index, price)) = entry else {
                continue;
            };
            verdict.triggered_at = Some(ts);
            verdict.trigger_price = Some(price);
            verdict.entry_fill_price = Some(plan.fill_price(price));
            window_end = Some(bar.t + ttl_ms);
            segment = std::iter::once(price).chain(path[index + 1..].iter().copied()).collect();
        }

        verdict.last_price = Some(bar.c);
        verdict.last_observed_at = Some(ts);

        let (low, high) = extremes(&segment);
        let active_stop = match (verdict.t1_hit_at, verdict.entry_fill_price) {
            (Some(_), Some(fill)) if plan.move_stop_to_breakeven => fill,
            _ => plan.stop,
        };
        let pending_target = if verdict.t1_hit_at.is_none() {
            Some(plan.target1)
        } else {
            plan.target2
        };

        let stop_touched = plan.reaches_stop(active_stop, low, high);
        let target_touched = pending_target.is_some_and(|level| plan.reaches_target(level, low, high));

        if stop_touched && target_touched {
            verdict.ambiguous = true;
            break;
        }

        if stop_touched {
            verdict.stop_hit_at = Some(ts);
            verdict.resolved_at = Some(ts);
            verdict.outcome = Some(if verdict.t1_hit_at.is_some() {
                FinalOutcome::T1BeforeStop
            } else {
                FinalOutcome::StopBeforeT1
            });
            break;
        }

        if plan.target2.is_some_and(|level| plan.reaches_target(level, low, high)) {
            verdict.t1_hit_at.get_or_insert(ts);
            verdict.t2_hit_at = Some(ts);
            verdict.resolved_at = Some(ts);
            verdict.outcome = Some(FinalOutcome::T2BeforeStop);
            break;
        }

        if verdict.t1_hit_at.is_none() && plan.reaches_target(plan.target1, low, high) {
            verdict.t1_hit_at = Some(ts);
        }
    }

    if verdict.is_triggered() && verdict.outcome.is_none() && !verdict.ambiguous {
        verdict.outcome = Some(if verdict.t1_hit_at.is_some() {
            FinalOutcome::T1BeforeStop
        } else {
            FinalOutcome::ExpiredUnresolved
        });
        verdict.resolved_at = verdict.last_observed_at.or(verdict.triggered_at);
    }

    verdict
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const BASE_MS: i64 = 1_773_149_400_000; // 2026-03-10 13:30:00 UTC

    fn bar(minute: i64, o: f64, h: f64, l: f64, c: f64) -> PriceBar {
        PriceBar { t: BASE_MS + minute * 60_000, o, h, l, c, v: 100.0 }
    }

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(BASE_MS + minute * 60_000).unwrap()
    }

    fn bullish_plan() -> LevelPlan {
        LevelPlan {
            direction: Direction::Bullish,
            entry_zone: EntryZone { low: 5000.0, high: 5002.0 },
            stop: 4995.0,
            target1: 5010.0,
            target2: Some(5020.0),
            entry_slip: 0.0,
            move_stop_to_breakeven: true,
        }
    }

    fn opening_bars() -> Vec<PriceBar> {
        vec![
            bar(0, 5005.0, 5006.0, 5003.0, 5004.0),
            bar(1, 5004.0, 5004.5, 5001.0, 5003.0),
        ]
    }

    #[test]
    fn test_find_entry_trigger() {
        let zone = EntryZone { low: 5002.0, high: 5000.0 };
        assert_eq!(find_entry_trigger(5001.0, 5010.0, &zone), Some(5001.0));
        assert_eq!(find_entry_trigger(4990.0, 5005.0, &zone), Some(5000.0));
        assert_eq!(find_entry_trigger(5010.0, 4990.0, &zone), Some(5002.0));
        assert_eq!(find_entry_trigger(5010.0, 5005.0, &zone), None);
        assert_eq!(find_entry_trigger(5010.0, 5010.0, &zone), None);
    }

    #[test]
    fn test_bullish_runs_to_target2() {
        let mut bars = opening_bars();
        bars.push(bar(2, 5003.0, 5011.0, 5002.0, 5010.0));
        bars.push(bar(3, 5010.0, 5021.0, 5009.0, 5019.0));

        let verdict = match_levels(&bullish_plan(), &bars, &MatchOptions::default());

        assert_eq!(verdict.triggered_at, Some(at(1)));
        assert_eq!(verdict.trigger_price, Some(5002.0));
        assert_eq!(verdict.t1_hit_at, Some(at(2)));
        assert_eq!(verdict.t2_hit_at, Some(at(3)));
        assert_eq!(verdict.outcome, Some(FinalOutcome::T2BeforeStop));
        assert_eq!(verdict.resolved_at, Some(at(3)));
        assert!(!verdict.ambiguous);
    }

    #[test]
    fn test_stop_before_target1() {
        let mut bars = opening_bars();
        bars.push(bar(2, 5003.0, 5004.0, 4994.0, 4996.0));

        let verdict = match_levels(&bullish_plan(), &bars, &MatchOptions::default());
        assert_eq!(verdict.outcome, Some(FinalOutcome::StopBeforeT1));
        assert_eq!(verdict.stop_hit_at, Some(at(2)));
        assert!(verdict.t1_hit_at.is_none());
    }

    #[test]
    fn test_bar_covering_stop_and_target_is_ambiguous() {
        let mut bars = opening_bars();
        bars.push(bar(2, 5003.0, 5011.0, 4994.0, 5000.0));
        bars.push(bar(3, 5000.0, 5021.0, 4999.0, 5020.0));

        let verdict = match_levels(&bullish_plan(), &bars, &MatchOptions::default());
        assert!(verdict.ambiguous);
        assert!(verdict.is_triggered());
        assert!(verdict.outcome.is_none());
        assert!(verdict.resolved_at.is_none());
    }

    #[test]
    fn test_window_closes_after_ttl() {
        let mut bars = opening_bars();
        bars.push(bar(2, 5003.0, 5008.0, 5001.0, 5006.0));
        bars.push(bar(3, 5006.0, 5021.0, 5005.0, 5020.0));

        let options = MatchOptions { ttl: Duration::minutes(2), ..MatchOptions::default() };
        let verdict = match_levels(&bullish_plan(), &bars, &options);

        assert_eq!(verdict.outcome, Some(FinalOutcome::ExpiredUnresolved));
        assert_eq!(verdict.resolved_at, Some(at(2)));
        assert_eq!(verdict.last_price, Some(5006.0));
        assert!(verdict.t2_hit_at.is_none());
    }

    #[test]
    fn test_breakeven_stop_after_target1() {
        let mut bars = opening_bars();
        bars.push(bar(2, 5003.0, 5011.0, 5002.5, 5010.0));
        bars.push(bar(3, 5008.0, 5009.0, 5001.5, 5002.0));

        let verdict = match_levels(&bullish_plan(), &bars, &MatchOptions::default());
        assert_eq!(verdict.outcome, Some(FinalOutcome::T1BeforeStop));
        assert_eq!(verdict.stop_hit_at, Some(at(3)));

        let plan = LevelPlan { move_stop_to_breakeven: false, ..bullish_plan() };
        let verdict = match_levels(&plan, &bars, &MatchOptions::default());
        assert_eq!(verdict.outcome, Some(FinalOutcome::T1BeforeStop));
        assert!(verdict.stop_hit_at.is_none());
    }

    #[test]
    fn test_bars_opening_before_first_seen_are_ignored() {
        let first_seen = Utc.timestamp_millis_opt(BASE_MS + 40_000).unwrap();
        let bars = vec![
            bar(0, 5001.0, 5011.0, 5000.5, 5010.0),
            bar(1, 5010.0, 5012.0, 5008.0, 5011.0),
            bar(2, 5011.0, 5011.5, 5001.5, 5002.0),
            bar(3, 5002.0, 5021.0, 5001.0, 5020.0),
        ];
        let options = MatchOptions { not_before: Some(first_seen), ..MatchOptions::default() };

        let verdict = match_levels(&bullish_plan(), &bars, &options);
        assert_eq!(verdict.triggered_at, Some(at(2)));
        assert!(verdict.triggered_at.is_some_and(|t| t >= first_seen));
        assert_eq!(verdict.t2_hit_at, Some(at(3)));
        assert_eq!(verdict.outcome, Some(FinalOutcome::T2BeforeStop));

        // a bar opening exactly at first-seen still counts
        let options = MatchOptions { not_before: Some(at(0)), ..MatchOptions::default() };
        let verdict = match_levels(&bullish_plan(), &bars, &options);
        assert_eq!(verdict.triggered_at, Some(at(0)));
    }

    #[test]
    fn test_entry_slip_moves_fill_against_trade() {
        let plan = LevelPlan { entry_slip: 0.2, ..bullish_plan() };
        let verdict = match_levels(&plan, &opening_bars(), &MatchOptions::default());
        assert_eq!(verdict.entry_fill_price, Some(5002.2));
    }

    #[test]
    fn test_bearish_mirror() {
        let plan = LevelPlan {
            direction: Direction::Bearish,
            entry_zone: EntryZone { low: 5000.0, high: 5002.0 },
            stop: 5008.0,
            target1: 4990.0,
            target2: Some(4980.0),
            entry_slip: 0.0,
            move_stop_to_breakeven: true,
        };
        let bars = vec![
            bar(0, 4998.0, 5001.0, 4997.0, 5000.0),
            bar(1, 5000.0, 5003.0, 4989.0, 4991.0),
            bar(2, 4991.0, 4995.0, 4979.0, 4981.0),
        ];

        let verdict = match_levels(&plan, &bars, &MatchOptions::default());
        assert_eq!(verdict.trigger_price, Some(5000.0));
        assert_eq!(verdict.t1_hit_at, Some(at(1)));
        assert_eq!(verdict.outcome, Some(FinalOutcome::T2BeforeStop));
    }

    #[test]
    fn test_untriggered_and_non_finite_bars() {
        let bars = vec![
            bar(0, 5010.0, 5012.0, 5008.0, 5011.0),
            PriceBar { t: BASE_MS + 60_000, o: f64::NAN, h: 5001.0, l: 4990.0, c: 5000.0, v: 0.0 },
        ];
        let verdict = match_levels(&bullish_plan(), &bars, &MatchOptions::default());
        assert!(!verdict.is_triggered());
        assert!(verdict.outcome.is_none());
    }
}
