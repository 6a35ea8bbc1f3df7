//! Zigzag extremum tracking
//!
//! Turns a bar stream into a strictly alternating sequence of swing highs
//! (peaks) and swing lows (troughs). The most recent extremum, the *tail*,
//! keeps moving while price extends it. It is confirmed once price retraces
//! from it by more than the deviation threshold, at which point a new tail of
//! the opposite kind opens at the current bar.
//!
//! A retracement exactly at the threshold does not confirm: the tail is only
//! confirmed by a strict break.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    params::{get_percent, get_period, ParamMeta, Parameterized},
    Bar, Level, Percent, Period, Result, SetupError,
};

/// Kind of swing point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExtremumKind {
    Peak,
    Trough,
}

impl ExtremumKind {
    #[inline]
    pub fn opposite(self) -> Self {
        match self {
            ExtremumKind::Peak => ExtremumKind::Trough,
            ExtremumKind::Trough => ExtremumKind::Peak,
        }
    }
}

/// A swing point of the zigzag
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extremum {
    pub value: f64,
    pub index: usize,
    pub open_time: DateTime<Utc>,
    pub kind: ExtremumKind,
}

impl Extremum {
    pub fn new(value: f64, index: usize, open_time: DateTime<Utc>, kind: ExtremumKind) -> Self {
        Self {
            value,
            index,
            open_time,
            kind,
        }
    }

    fn peak_of(bar: &Bar) -> Self {
        Self::new(bar.high, bar.index, bar.open_time, ExtremumKind::Peak)
    }

    fn trough_of(bar: &Bar) -> Self {
        Self::new(bar.low, bar.index, bar.open_time, ExtremumKind::Trough)
    }

    #[inline]
    pub fn level(&self) -> Level {
        Level::new(self.value, self.index, self.open_time)
    }

    #[inline]
    pub fn is_peak(&self) -> bool {
        self.kind == ExtremumKind::Peak
    }
}

/// What the deviation percentage is measured against
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviationBasis {
    /// Percent of the tail extremum's price
    #[default]
    Price,
    /// Percent of the leg from the last confirmed extremum to the tail.
    /// The first leg has no confirmed start and falls back to `Price`.
    LegRange,
}

/// Tracker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub deviation: Percent,
    pub basis: DeviationBasis,
    /// Confirmed extremums kept in memory; older ones are pruned
    pub max_extrema: Period,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            deviation: Percent::new_const(0.5),
            basis: DeviationBasis::Price,
            max_extrema: Period::new_const(100),
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.deviation.get() <= 0.0 {
            return Err(SetupError::InvalidConfig(
                "tracker deviation must be > 0".to_string(),
            ));
        }
        if self.max_extrema.get() < MIN_EXTREMA {
            return Err(SetupError::OutOfRange {
                field: "max_extrema",
                value: self.max_extrema.get() as f64,
                min: MIN_EXTREMA as f64,
                max: f64::INFINITY,
            });
        }
        Ok(())
    }
}

/// Room for the widest matcher window (impulse: origin + five waves)
const MIN_EXTREMA: usize = 6;

/// Extremums needed before the tracker leaves its warming state
pub const WARM_EXTREMA: usize = 2;

static TRACKER_PARAMS: [ParamMeta; 2] = [
    ParamMeta::percent(
        "deviation",
        0.5,
        (0.05, 5.0, 0.05),
        "Retracement that confirms a swing, percent",
    ),
    ParamMeta::period(
        "max_extrema",
        100.0,
        (6.0, 1000.0, 50.0),
        "Confirmed extremums kept in memory",
    ),
];

impl Parameterized for TrackerConfig {
    fn param_meta() -> &'static [ParamMeta] {
        &TRACKER_PARAMS
    }

    fn with_params(params: &HashMap<&str, f64>) -> Result<Self> {
        let defaults = Self::default();
        for meta in Self::param_meta() {
            if let Some(&value) = params.get(meta.name) {
                meta.validate(value)?;
            }
        }
        let config = Self {
            deviation: get_percent(params, "deviation", defaults.deviation.get())?,
            basis: defaults.basis,
            max_extrema: get_period(params, "max_extrema", defaults.max_extrema.get())?,
        };
        config.validate()?;
        Ok(config)
    }

    fn config_name() -> &'static str {
        "tracker"
    }
}

/// Incremental zigzag over a bar stream.
///
/// Bars must arrive in increasing index order; [`SetupFinder`](crate::finder::SetupFinder)
/// enforces that before calling [`observe`](Self::observe).
#[derive(Debug, Clone)]
pub struct ExtremumTracker {
    config: TrackerConfig,
    confirmed: Vec<Extremum>,
    tail: Option<Extremum>,
    /// Highest high and lowest low seen while warming
    anchors: Option<(Extremum, Extremum)>,
    bars_seen: usize,
}

impl ExtremumTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            confirmed: Vec::new(),
            tail: None,
            anchors: None,
            bars_seen: 0,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Confirmed extremums, oldest first. Never revised.
    #[inline]
    pub fn confirmed(&self) -> &[Extremum] {
        &self.confirmed
    }

    /// The most recent, still revisable extremum
    #[inline]
    pub fn tail(&self) -> Option<&Extremum> {
        self.tail.as_ref()
    }

    /// Confirmed extremums followed by the tail
    pub fn sequence(&self) -> Vec<Extremum> {
        self.confirmed.iter().chain(self.tail.iter()).copied().collect()
    }

    /// True until the first two extremums exist
    #[inline]
    pub fn is_warming(&self) -> bool {
        self.tail.is_none()
    }

    #[inline]
    pub fn bars_seen(&self) -> usize {
        self.bars_seen
    }

    pub fn reset(&mut self) {
        self.confirmed.clear();
        self.tail = None;
        self.anchors = None;
        self.bars_seen = 0;
    }

    /// Reset and replay `bars`. Fails with `InsufficientHistory` when the
    /// history is too short to establish the first two extremums.
    pub fn rebuild(&mut self, bars: &[Bar]) -> Result<()> {
        self.reset();
        for bar in bars {
            self.observe(bar);
        }
        if self.is_warming() {
            return Err(SetupError::InsufficientHistory {
                need: WARM_EXTREMA,
                got: 0,
            });
        }
        Ok(())
    }

    /// Feed the next bar. Returns the extremum confirmed by this bar, if any.
    pub fn observe(&mut self, bar: &Bar) -> Option<Extremum> {
        self.bars_seen += 1;

        let Some(tail) = self.tail else {
            return self.observe_warming(bar);
        };

        match tail.kind {
            ExtremumKind::Peak => {
                if bar.high > tail.value {
                    self.tail = Some(Extremum::peak_of(bar));
                    None
                } else if bar.low < self.retrace_threshold(&tail) {
                    self.confirm(tail, Extremum::trough_of(bar))
                } else {
                    None
                }
            }
            ExtremumKind::Trough => {
                if bar.low < tail.value {
                    self.tail = Some(Extremum::trough_of(bar));
                    None
                } else if bar.high > self.retrace_threshold(&tail) {
                    self.confirm(tail, Extremum::peak_of(bar))
                } else {
                    None
                }
            }
        }
    }

    fn observe_warming(&mut self, bar: &Bar) -> Option<Extremum> {
        let Some((high, low)) = self.anchors else {
            self.anchors = Some((Extremum::peak_of(bar), Extremum::trough_of(bar)));
            return None;
        };

        let rises = bar.high > self.retrace_threshold(&low);
        let falls = bar.low < self.retrace_threshold(&high);

        let first = match (rises, falls) {
            (false, false) => {
                let high = if bar.high > high.value { Extremum::peak_of(bar) } else { high };
                let low = if bar.low < low.value { Extremum::trough_of(bar) } else { low };
                self.anchors = Some((high, low));
                return None;
            }
            (true, false) => low,
            (false, true) => high,
            // Outside bar breaking both ways: the older anchor formed first
            (true, true) if low.index <= high.index => low,
            (true, true) => high,
        };

        self.anchors = None;
        let next = match first.kind {
            ExtremumKind::Trough => Extremum::peak_of(bar),
            ExtremumKind::Peak => Extremum::trough_of(bar),
        };
        self.confirm(first, next)
    }

    fn confirm(&mut self, extremum: Extremum, next_tail: Extremum) -> Option<Extremum> {
        self.confirmed.push(extremum);
        let max = self.config.max_extrema.get();
        if self.confirmed.len() > max {
            let excess = self.confirmed.len() - max;
            self.confirmed.drain(..excess);
        }
        self.tail = Some(next_tail);
        Some(extremum)
    }

    /// Price that must be strictly crossed to confirm `tail`
    fn retrace_threshold(&self, tail: &Extremum) -> f64 {
        let deviation = self.config.deviation.fraction();
        let distance = match (self.config.basis, self.confirmed.last()) {
            (DeviationBasis::LegRange, Some(start)) => (tail.value - start.value).abs() * deviation,
            _ => tail.value.abs() * deviation,
        };
        match tail.kind {
            ExtremumKind::Peak => tail.value - distance,
            ExtremumKind::Trough => tail.value + distance,
        }
    }
}

impl Default for ExtremumTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn flat(i: usize, price: f64) -> Bar {
        let t = Utc.timestamp_opt(1_700_000_000 + i as i64 * 60, 0).unwrap();
        Bar::new(i, t, price, price, price, price)
    }

    fn tracker(deviation: f64) -> ExtremumTracker {
        ExtremumTracker::new(TrackerConfig {
            deviation: Percent::new(deviation).unwrap(),
            ..TrackerConfig::default()
        })
    }

    #[test]
    fn test_warming_until_first_swing() {
        let mut zz = tracker(10.0);
        assert!(zz.observe(&flat(0, 100.0)).is_none());
        assert!(zz.observe(&flat(1, 105.0)).is_none());
        assert!(zz.is_warming());

        // 100 -> 111 is more than 10% above the low anchor
        let first = zz.observe(&flat(2, 111.0)).unwrap();
        assert_eq!(first.kind, ExtremumKind::Trough);
        assert_eq!(first.index, 0);
        assert!(!zz.is_warming());
        assert_eq!(zz.tail().unwrap().value, 111.0);
    }

    #[test]
    fn test_threshold_tie_does_not_confirm() {
        let mut zz = tracker(25.0);
        zz.observe(&flat(0, 100.0));
        zz.observe(&flat(1, 130.0));
        assert_eq!(zz.confirmed().len(), 1);

        // Exactly 25% below the 130 peak
        assert!(zz.observe(&flat(2, 97.5)).is_none());
        assert_eq!(zz.confirmed().len(), 1);

        let peak = zz.observe(&flat(3, 97.0)).unwrap();
        assert_eq!(peak.kind, ExtremumKind::Peak);
        assert_eq!(peak.value, 130.0);
        assert_eq!(zz.tail().unwrap().kind, ExtremumKind::Trough);
    }

    #[test]
    fn test_tail_is_revised_until_confirmed() {
        let mut zz = tracker(5.0);
        for (i, p) in [100.0, 110.0, 115.0, 118.0].into_iter().enumerate() {
            zz.observe(&flat(i, p));
        }
        let tail = zz.tail().unwrap();
        assert_eq!(tail.value, 118.0);
        assert_eq!(tail.index, 3);
        assert_eq!(zz.sequence().len(), 2);
    }

    #[test]
    fn test_leg_range_basis() {
        let mut zz = ExtremumTracker::new(TrackerConfig {
            deviation: Percent::new(50.0).unwrap(),
            basis: DeviationBasis::LegRange,
            ..TrackerConfig::default()
        });
        zz.observe(&flat(0, 100.0));
        zz.observe(&flat(1, 200.0));
        // Leg 100 -> 200: half of it is 50, so 150 is a tie
        assert!(zz.observe(&flat(2, 150.0)).is_none());
        assert!(zz.observe(&flat(3, 149.0)).is_some());
    }

    #[test]
    fn test_pruning_keeps_most_recent() {
        let mut zz = ExtremumTracker::new(TrackerConfig {
            deviation: Percent::new(1.0).unwrap(),
            max_extrema: Period::new(6).unwrap(),
            ..TrackerConfig::default()
        });
        for i in 0..40 {
            let p = if i % 2 == 0 { 100.0 } else { 110.0 };
            zz.observe(&flat(i, p));
        }
        assert_eq!(zz.confirmed().len(), 6);
        assert_eq!(zz.confirmed().last().unwrap().index, 38);
    }

    #[test]
    fn test_rebuild_short_history() {
        let mut zz = tracker(10.0);
        let bars = vec![flat(0, 100.0), flat(1, 101.0)];
        assert!(matches!(
            zz.rebuild(&bars),
            Err(SetupError::InsufficientHistory { need: 2, .. })
        ));
        assert!(zz.is_warming());
        assert_eq!(zz.bars_seen(), 2);
    }

    #[test]
    fn test_config_validation() {
        assert!(TrackerConfig::default().validate().is_ok());
        let bad = TrackerConfig {
            max_extrema: Period::new(3).unwrap(),
            ..TrackerConfig::default()
        };
        assert!(bad.validate().is_err());
        let zero = TrackerConfig {
            deviation: Percent::new(0.0).unwrap(),
            ..TrackerConfig::default()
        };
        assert!(zero.validate().is_err());
    }
}
