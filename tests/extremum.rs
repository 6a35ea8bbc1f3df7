//! Integration tests for the extremum (zigzag) tracker.

use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;
use yasf::matchers::helpers::is_zigzag;
use yasf::prelude::*;

fn t(i: usize) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + i as i64 * 60, 0).unwrap()
}

/// Bars following a close-to-close path, with a fixed wick on both sides
fn walk(closes: &[f64], wick: f64) -> Vec<Bar> {
    let mut prev = closes.first().copied().unwrap_or(100.0);
    closes
        .iter()
        .enumerate()
        .map(|(i, &c)| {
            let bar = Bar::new(i, t(i), prev, prev.max(c) + wick, prev.min(c) - wick, c);
            prev = c;
            bar
        })
        .collect()
}

fn tracker(deviation: f64) -> ExtremumTracker {
    ExtremumTracker::new(TrackerConfig {
        deviation: Percent::new(deviation).unwrap(),
        ..TrackerConfig::default()
    })
}

// ============================================================
// SCENARIOS
// ============================================================

#[test]
fn test_swings_follow_price() {
    let closes = [100.0, 104.0, 108.0, 112.0, 106.0, 100.0, 96.0, 103.0, 110.0, 104.0];
    let mut tracker = tracker(2.0);
    let mut confirmed = Vec::new();
    for bar in walk(&closes, 0.0) {
        confirmed.extend(tracker.observe(&bar));
    }

    let values: Vec<f64> = tracker.confirmed().iter().map(|e| e.value).collect();
    assert_eq!(values, vec![100.0, 112.0, 96.0, 110.0]);
    assert_eq!(confirmed.len(), 4);
    assert_eq!(tracker.confirmed()[1].index, 3);
    assert_eq!(tracker.tail().map(|e| e.kind), Some(ExtremumKind::Trough));
}

#[test]
fn test_flat_market_stays_warming() {
    let mut tracker = tracker(1.0);
    for bar in walk(&[100.0; 50], 0.2) {
        assert!(tracker.observe(&bar).is_none());
    }
    assert!(tracker.is_warming());
    assert!(tracker.sequence().is_empty());
    assert_eq!(tracker.bars_seen(), 50);
}

#[test]
fn test_rebuild_matches_incremental() {
    let closes: Vec<f64> = (0..200).map(|i| 100.0 + (i as f64 * 0.3).sin() * 8.0).collect();
    let bars = walk(&closes, 0.1);

    let mut incremental = tracker(1.0);
    for bar in &bars {
        incremental.observe(bar);
    }
    let mut rebuilt = tracker(1.0);
    rebuilt.rebuild(&bars).unwrap();

    assert_eq!(incremental.confirmed(), rebuilt.confirmed());
    assert_eq!(incremental.tail(), rebuilt.tail());
}

#[test]
fn test_rebuild_short_history() {
    let mut tracker = tracker(5.0);
    let err = tracker.rebuild(&walk(&[100.0, 101.0], 0.0)).unwrap_err();
    assert!(matches!(err, SetupError::InsufficientHistory { need: 2, .. }));
}

// ============================================================
// PROPERTIES
// ============================================================

fn closes_strategy() -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(-3.0f64..3.0, 1..400).prop_map(|steps| {
        let mut price = 1000.0;
        steps
            .into_iter()
            .map(|s| {
                price += s;
                price
            })
            .collect()
    })
}

proptest! {
    #[test]
    fn prop_confirmed_sequence_alternates(
        closes in closes_strategy(),
        deviation in 0.05f64..2.0,
        wick in 0.0f64..1.0,
    ) {
        let mut tracker = tracker(deviation);
        for bar in walk(&closes, wick) {
            tracker.observe(&bar);
        }

        let confirmed = tracker.confirmed();
        prop_assert!(is_zigzag(confirmed));
        prop_assert!(confirmed.windows(2).all(|w| w[0].index < w[1].index));
        if let (Some(last), Some(tail)) = (confirmed.last(), tracker.tail()) {
            prop_assert_eq!(tail.kind, last.kind.opposite());
            prop_assert!(last.index <= tail.index);
        }
    }

    #[test]
    fn prop_history_is_bounded(closes in closes_strategy()) {
        let mut tracker = ExtremumTracker::new(TrackerConfig {
            deviation: Percent::new(0.05).unwrap(),
            max_extrema: Period::new(8).unwrap(),
            ..TrackerConfig::default()
        });
        for bar in walk(&closes, 0.5) {
            tracker.observe(&bar);
        }
        prop_assert!(tracker.confirmed().len() <= 8);
    }
}
