//! Impulse (five-wave) pattern matching
//!
//! Works on the last six confirmed extremums: the origin and the ends of
//! waves 1 to 5. Structural rules follow the usual impulse conventions (no
//! overlap, wave 3 never the shortest, balanced corrections). Optional leg-ratio
//! bands reuse the harmonic rule mechanism with the points numbered 0..=5.
//!
//! A match does not enter immediately. Its entry is a trigger level inside the
//! impulse that price must correct to before the setup becomes active.

use std::collections::HashMap;

use log::trace;
use serde::{Deserialize, Serialize};

use super::{
    harmonic::{evaluate_rules, LegRule, LegSpan},
    helpers::{is_zigzag, FIB_236, FIB_618, FIB_886},
};
use crate::{
    extremum::{Extremum, ExtremumKind},
    params::{get_multiplier, get_percent, get_period, get_ratio, ParamMeta, Parameterized},
    Direction, Level, PatternCandidate, Percent, Period, Ratio, Result, SetupError, SignalPayload,
};

impl_with_defaults!(ImpulseConfig);

/// Origin plus five wave ends
pub const IMPULSE_POINTS: usize = 6;

/// Impulse matcher configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImpulseConfig {
    /// Wave 4 and wave 2 durations may differ by at most this factor, in percent (>= 100)
    pub correction_allowance_pct: f64,
    /// Minimum bars from origin to the end of wave 5
    pub min_bars: Period,
    /// Correction depth, as a fraction of the impulse, where the entry triggers
    pub trigger_ratio: Ratio,
    /// Stop offset beyond the origin, percent of the entry-to-origin distance
    pub stop_allowance: Percent,
    /// Target pulled back from the impulse end, percent of the entry-to-end distance
    pub take_profit_allowance: Percent,
    /// Extra ratio bands, points numbered 0..=5
    pub rules: Vec<LegRule>,
    pub tolerance: Percent,
}

impl Default for ImpulseConfig {
    fn default() -> Self {
        Self {
            correction_allowance_pct: 135.0,
            min_bars: Period::new_const(15),
            trigger_ratio: Ratio::new_const(0.61),
            stop_allowance: Percent::new_const(1.0),
            take_profit_allowance: Percent::new_const(0.0),
            rules: vec![
                // Wave 2 retraces 0.236-0.886 of wave 1
                LegRule::new(LegSpan::new(1, 2), LegSpan::new(0, 1), FIB_236, FIB_886),
                // Wave 4 retraces 0.236-0.618 of wave 3
                LegRule::new(LegSpan::new(3, 4), LegSpan::new(2, 3), FIB_236, FIB_618),
            ],
            tolerance: Percent::new_const(5.0),
        }
    }
}

impl ImpulseConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.correction_allowance_pct.is_finite() || self.correction_allowance_pct < 100.0 {
            return Err(SetupError::OutOfRange {
                field: "correction_allowance_pct",
                value: self.correction_allowance_pct,
                min: 100.0,
                max: f64::INFINITY,
            });
        }
        let trigger = self.trigger_ratio.get();
        if trigger <= 0.0 || trigger >= 1.0 {
            return Err(SetupError::OutOfRange {
                field: "trigger_ratio",
                value: trigger,
                min: 0.0,
                max: 1.0,
            });
        }
        for rule in &self.rules {
            rule.validate(IMPULSE_POINTS)?;
        }
        Ok(())
    }
}

static IMPULSE_PARAMS: [ParamMeta; 6] = [
    ParamMeta::multiplier(
        "correction_allowance_pct",
        135.0,
        (100.0, 300.0, 5.0),
        "Allowed wave 4 / wave 2 duration mismatch, percent",
    ),
    ParamMeta::period("min_bars", 15.0, (5.0, 100.0, 5.0), "Minimum impulse length in bars"),
    ParamMeta::ratio(
        "trigger_ratio",
        0.61,
        (0.236, 0.886, 0.05),
        "Correction depth that triggers the entry",
    ),
    ParamMeta::percent("stop_allowance", 1.0, (0.0, 10.0, 0.5), "Stop offset beyond origin, percent"),
    ParamMeta::percent(
        "take_profit_allowance",
        0.0,
        (0.0, 20.0, 1.0),
        "Target pull-back from the impulse end, percent",
    ),
    ParamMeta::percent("tolerance", 5.0, (1.0, 10.0, 1.0), "Ratio band widening, percent"),
];

impl Parameterized for ImpulseConfig {
    fn param_meta() -> &'static [ParamMeta] {
        &IMPULSE_PARAMS
    }

    fn with_params(params: &HashMap<&str, f64>) -> Result<Self> {
        let d = Self::default();
        for meta in Self::param_meta() {
            if let Some(&value) = params.get(meta.name) {
                meta.validate(value)?;
            }
        }
        let config = Self {
            correction_allowance_pct: get_multiplier(
                params,
                "correction_allowance_pct",
                d.correction_allowance_pct,
            )?,
            min_bars: get_period(params, "min_bars", d.min_bars.get())?,
            trigger_ratio: get_ratio(params, "trigger_ratio", d.trigger_ratio.get())?,
            stop_allowance: get_percent(params, "stop_allowance", d.stop_allowance.get())?,
            take_profit_allowance: get_percent(
                params,
                "take_profit_allowance",
                d.take_profit_allowance.get(),
            )?,
            rules: d.rules,
            tolerance: get_percent(params, "tolerance", d.tolerance.get())?,
        };
        config.validate()?;
        Ok(config)
    }

    fn config_name() -> &'static str {
        "impulse"
    }
}

/// Test the last six extremums for a five-wave impulse.
///
/// Returns at most one candidate. Its `entry` is the trigger level, pinned
/// to the end of wave 5 until the correction reaches it.
pub fn try_match_impulse(
    extrema: &[Extremum],
    config: &ImpulseConfig,
) -> Result<Vec<PatternCandidate>> {
    // rules address points by position; an out-of-range one must not reach `LegSpan::range`
    config.validate()?;
    if extrema.len() < IMPULSE_POINTS {
        return Ok(Vec::new());
    }
    let points = &extrema[extrema.len() - IMPULSE_POINTS..];
    if !is_zigzag(points) {
        return Ok(Vec::new());
    }

    match check_impulse(points, config) {
        Ok(Some(candidate)) => Ok(vec![candidate]),
        Ok(None) => Ok(Vec::new()),
        Err(SetupError::DegenerateLeg { leg }) => {
            trace!("impulse ending at {} rejected: degenerate {}", points[5].index, leg);
            Ok(Vec::new())
        }
        Err(e) => Err(e),
    }
}

fn check_impulse(points: &[Extremum], config: &ImpulseConfig) -> Result<Option<PatternCandidate>> {
    let direction = match points[0].kind {
        ExtremumKind::Trough => Direction::Bullish,
        ExtremumKind::Peak => Direction::Bearish,
    };
    let sign = direction.sign();
    let value = |i: usize| points[i].value;
    let wave = |i: usize| sign * (value(i + 1) - value(i));
    let waves = [wave(0), wave(1), wave(2), wave(3), wave(4)];

    if waves[0] <= 0.0 || waves[2] <= 0.0 || waves[4] <= 0.0 {
        return Ok(None);
    }
    // Wave 2 must not retrace past the origin
    if sign * (value(2) - value(0)) <= 0.0 {
        return Ok(None);
    }
    // Wave 4 must not overlap the end of wave 1
    if sign * (value(4) - value(1)) <= 0.0 {
        return Ok(None);
    }
    if waves[2] < waves[0] && waves[2] < waves[4] {
        trace!("impulse rejected: wave 3 is the shortest");
        return Ok(None);
    }
    if points[5].index - points[0].index < config.min_bars.get() {
        return Ok(None);
    }

    let wave2_bars = points[2].index.saturating_sub(points[1].index);
    let wave4_bars = points[4].index.saturating_sub(points[3].index);
    if wave2_bars == 0 || wave4_bars == 0 {
        return Err(SetupError::DegenerateLeg {
            leg: "correction duration".to_string(),
        });
    }
    let duration_ratio = wave4_bars as f64 / wave2_bars as f64;
    let allowance = config.correction_allowance_pct / 100.0;
    if duration_ratio < 1.0 / allowance || duration_ratio > allowance {
        trace!("impulse rejected: correction durations {wave2_bars} vs {wave4_bars} bars");
        return Ok(None);
    }

    if evaluate_rules(&config.rules, points, config.tolerance)?.is_none() {
        return Ok(None);
    }

    let origin = points[0];
    let end = points[5];
    let length = (end.value - origin.value).abs();
    let trigger = end.value - sign * length * config.trigger_ratio.get();
    let take_profit = end.value - sign * (end.value - trigger).abs() * config.take_profit_allowance.fraction();
    let stop_loss = origin.value - sign * (trigger - origin.value).abs() * config.stop_allowance.fraction();

    Ok(Some(PatternCandidate {
        name: "Impulse".to_string(),
        direction,
        legs: points.iter().map(Extremum::level).collect(),
        entry: Level::new(trigger, end.index, end.open_time),
        take_profit: end.level().with_price(take_profit),
        stop_loss: origin.level().with_price(stop_loss),
        payload: SignalPayload::Impulse {
            trigger,
            duration_ratio,
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn wave_points(values: &[f64], indices: &[usize]) -> Vec<Extremum> {
        values
            .iter()
            .zip(indices)
            .enumerate()
            .map(|(n, (&v, &i))| {
                let kind = if n % 2 == 0 {
                    ExtremumKind::Trough
                } else {
                    ExtremumKind::Peak
                };
                Extremum::new(v, i, Utc.timestamp_opt(i as i64 * 3600, 0).unwrap(), kind)
            })
            .collect()
    }

    // 100 -> 110 -> 105 -> 125 -> 118 -> 130, evenly spaced corrections
    fn textbook() -> Vec<Extremum> {
        wave_points(&[100.0, 110.0, 105.0, 125.0, 118.0, 130.0], &[0, 4, 8, 14, 18, 22])
    }

    #[test]
    fn test_textbook_impulse_matches() {
        let config = ImpulseConfig::with_defaults();
        let found = try_match_impulse(&textbook(), &config).unwrap();
        assert_eq!(found.len(), 1);

        let c = &found[0];
        assert_eq!(c.direction, Direction::Bullish);
        assert_eq!(c.legs.len(), IMPULSE_POINTS);
        // 130 - 30 * 0.61
        assert!((c.entry.price - 111.7).abs() < 1e-9);
        assert_eq!(c.take_profit.price, 130.0);
        // 100 - (111.7 - 100) * 1%
        assert!((c.stop_loss.price - 99.883).abs() < 1e-9);
        assert_eq!(c.entry.index, 22);
    }

    #[test]
    fn test_overlap_rejected() {
        // Wave 4 drops below the end of wave 1 (110)
        let points = wave_points(&[100.0, 110.0, 105.0, 125.0, 109.0, 130.0], &[0, 4, 8, 14, 18, 22]);
        let mut config = ImpulseConfig::default();
        config.rules.clear();
        assert!(try_match_impulse(&points, &config).unwrap().is_empty());
    }

    #[test]
    fn test_shortest_wave_three_rejected() {
        let points = wave_points(&[100.0, 115.0, 110.0, 118.0, 116.0, 135.0], &[0, 4, 8, 14, 18, 22]);
        let mut config = ImpulseConfig::default();
        config.rules.clear();
        assert!(try_match_impulse(&points, &config).unwrap().is_empty());
    }

    #[test]
    fn test_unbalanced_corrections_rejected() {
        // Wave 2 takes 4 bars, wave 4 takes 12
        let points = wave_points(&[100.0, 110.0, 105.0, 125.0, 118.0, 130.0], &[0, 4, 8, 14, 26, 30]);
        assert!(try_match_impulse(&points, &ImpulseConfig::default()).unwrap().is_empty());
    }

    #[test]
    fn test_too_short_rejected() {
        let points = wave_points(&[100.0, 110.0, 105.0, 125.0, 118.0, 130.0], &[0, 1, 2, 4, 5, 6]);
        assert!(try_match_impulse(&points, &ImpulseConfig::default()).unwrap().is_empty());
    }

    #[test]
    fn test_bearish_mirror() {
        let points: Vec<Extremum> = textbook()
            .into_iter()
            .map(|e| Extremum {
                value: 300.0 - e.value,
                kind: e.kind.opposite(),
                ..e
            })
            .collect();
        let found = try_match_impulse(&points, &ImpulseConfig::default()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].direction, Direction::Bearish);
        assert!((found[0].entry.price - (300.0 - 111.7)).abs() < 1e-9);
    }

    #[test]
    fn test_config_validation() {
        assert!(ImpulseConfig::default().validate().is_ok());
        let mut bad = ImpulseConfig::default();
        bad.correction_allowance_pct = 90.0;
        assert!(bad.validate().is_err());

        let mut bad_rule = ImpulseConfig::default();
        bad_rule.rules.push(LegRule::exact(LegSpan::new(5, 6), LegSpan::new(0, 1), 1.0));
        assert!(bad_rule.validate().is_err());
    }

    #[test]
    fn test_rule_outside_window_is_an_error() {
        // points 0..=5 exist; a span ending at 6 would index past the window
        let mut config = ImpulseConfig::default();
        config.rules = vec![LegRule::new(LegSpan::new(0, 6), LegSpan::new(0, 1), 0.5, 2.0)];
        assert!(matches!(
            try_match_impulse(&textbook(), &config),
            Err(SetupError::InvalidConfig(_))
        ));

        // too few points is no excuse for a broken config
        assert!(try_match_impulse(&textbook()[..3], &config).is_err());
    }
}
