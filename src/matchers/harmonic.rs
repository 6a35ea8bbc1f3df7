//! Harmonic (XABCD) pattern matching
//!
//! A pattern definition is a named list of leg-ratio rules. Each rule says that
//! one leg must measure between `min` and `max` times a reference leg, e.g.
//! "BC is 0.382-0.886 of AB". Bands are inclusive and widened by the configured
//! tolerance. A definition matches only when every rule holds at once.
//!
//! The catalogue of definitions is configuration data: [`PatternTable::classic`]
//! ships the usual Gartley/Butterfly/Bat/Crab family, and tables load from JSON.

use std::{collections::HashMap, fmt, str::FromStr};

use log::trace;
use serde::{Deserialize, Serialize};

use super::helpers::{
    band_closeness, is_zigzag, leg_ratio, widen, FIB_1130, FIB_1270, FIB_1410, FIB_1618, FIB_382,
    FIB_500, FIB_618, FIB_786, FIB_886, MIN_LEG,
};
use crate::{
    extremum::{Extremum, ExtremumKind},
    params::{get_multiplier, get_percent, get_ratio, ParamMeta, Parameterized},
    Direction, PatternCandidate, Percent, Ratio, Result, SetupError, SignalPayload,
};

impl_with_defaults!(HarmonicConfig);

/// Points in a harmonic window: X, A, B, C, D
pub const HARMONIC_POINTS: usize = 5;

const POINT_NAMES: [char; 6] = ['X', 'A', 'B', 'C', 'D', 'E'];

// ============================================================
// LEGS AND RULES
// ============================================================

/// Price span between two points of a window, by position (X = 0)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LegSpan {
    pub from: usize,
    pub to: usize,
}

impl LegSpan {
    pub const XA: Self = Self::new(0, 1);
    pub const AB: Self = Self::new(1, 2);
    pub const BC: Self = Self::new(2, 3);
    pub const CD: Self = Self::new(3, 4);
    pub const AD: Self = Self::new(1, 4);
    pub const XC: Self = Self::new(0, 3);

    pub const fn new(from: usize, to: usize) -> Self {
        Self { from, to }
    }

    /// Signed price change from `from` to `to`
    #[inline]
    pub fn range(&self, points: &[Extremum]) -> f64 {
        points[self.to].value - points[self.from].value
    }

    fn fits(&self, points: usize) -> bool {
        self.from != self.to && self.from < points && self.to < points
    }
}

impl fmt::Display for LegSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = |i: usize| POINT_NAMES.get(i).copied().unwrap_or('?');
        write!(f, "{}{}", name(self.from), name(self.to))
    }
}

impl FromStr for LegSpan {
    type Err = SetupError;

    fn from_str(s: &str) -> Result<Self> {
        let position = |c: char| POINT_NAMES.iter().position(|&n| n == c.to_ascii_uppercase());
        let mut chars = s.chars();
        match (chars.next(), chars.next(), chars.next()) {
            (Some(a), Some(b), None) => match (position(a), position(b)) {
                (Some(from), Some(to)) if from != to => Ok(Self::new(from, to)),
                _ => Err(SetupError::InvalidConfig(format!("invalid leg '{s}'"))),
            },
            _ => Err(SetupError::InvalidConfig(format!("invalid leg '{s}'"))),
        }
    }
}

impl Serialize for LegSpan {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LegSpan {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(d)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// `leg / reference` must fall inside `[min, max]` (widened by the tolerance)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LegRule {
    pub leg: LegSpan,
    pub reference: LegSpan,
    pub min: f64,
    pub max: f64,
}

impl LegRule {
    pub fn new(leg: LegSpan, reference: LegSpan, min: f64, max: f64) -> Self {
        Self {
            leg,
            reference,
            min,
            max,
        }
    }

    pub fn exact(leg: LegSpan, reference: LegSpan, ratio: f64) -> Self {
        Self::new(leg, reference, ratio, ratio)
    }

    #[inline]
    pub fn midpoint(&self) -> f64 {
        (self.min + self.max) / 2.0
    }

    #[inline]
    pub fn band(&self, tolerance: Percent) -> (f64, f64) {
        widen(self.min, self.max, tolerance)
    }

    /// Realized ratio of this rule's leg to its reference leg
    pub fn measure(&self, points: &[Extremum]) -> Result<f64> {
        leg_ratio(self.leg.range(points), self.reference.range(points), || {
            self.reference.to_string()
        })
    }

    pub fn validate(&self, points: usize) -> Result<()> {
        if !self.leg.fits(points) || !self.reference.fits(points) {
            return Err(SetupError::InvalidConfig(format!(
                "rule {}/{} addresses points outside a {points}-point window",
                self.leg, self.reference
            )));
        }
        if !self.min.is_finite() || !self.max.is_finite() || self.min <= 0.0 || self.min > self.max
        {
            return Err(SetupError::InvalidConfig(format!(
                "rule {}/{} has invalid band [{}, {}]",
                self.leg, self.reference, self.min, self.max
            )));
        }
        Ok(())
    }
}

/// Evaluate `rules` on `points`: `Some(accuracy)` when every band holds
pub fn evaluate_rules(
    rules: &[LegRule],
    points: &[Extremum],
    tolerance: Percent,
) -> Result<Option<f64>> {
    let mut closeness = 0.0;
    for rule in rules {
        let ratio = rule.measure(points)?;
        let (lo, hi) = rule.band(tolerance);
        if ratio < lo || ratio > hi {
            return Ok(None);
        }
        closeness += band_closeness(ratio, lo, hi);
    }
    if rules.is_empty() {
        return Ok(Some(1.0));
    }
    Ok(Some(closeness / rules.len() as f64))
}

// ============================================================
// DEFINITIONS AND TABLES
// ============================================================

fn default_primary_leg() -> LegSpan {
    LegSpan::AD
}

/// A named harmonic pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternDefinition {
    pub name: String,
    pub rules: Vec<LegRule>,
    /// Leg whose size scales the take-profit and stop-loss distances
    #[serde(default = "default_primary_leg")]
    pub primary_leg: LegSpan,
}

impl PatternDefinition {
    pub fn new(name: impl Into<String>, primary_leg: LegSpan) -> Self {
        Self {
            name: name.into(),
            rules: Vec::new(),
            primary_leg,
        }
    }

    pub fn rule(mut self, rule: LegRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(SetupError::InvalidConfig(
                "pattern definition without a name".to_string(),
            ));
        }
        if self.rules.is_empty() {
            return Err(SetupError::InvalidConfig(format!(
                "pattern '{}' has no rules",
                self.name
            )));
        }
        if !self.primary_leg.fits(HARMONIC_POINTS) {
            return Err(SetupError::InvalidConfig(format!(
                "pattern '{}' has invalid primary leg {}",
                self.name, self.primary_leg
            )));
        }
        for rule in &self.rules {
            rule.validate(HARMONIC_POINTS)?;
        }
        Ok(())
    }

    /// `Some(accuracy)` when every rule holds on `points`
    pub fn evaluate(&self, points: &[Extremum], tolerance: Percent) -> Result<Option<f64>> {
        evaluate_rules(&self.rules, points, tolerance)
    }
}

/// Ordered set of pattern definitions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatternTable(Vec<PatternDefinition>);

impl PatternTable {
    pub fn new(definitions: Vec<PatternDefinition>) -> Self {
        Self(definitions)
    }

    /// Gartley, Butterfly, Bat, Alternate Bat, Crab, Deep Crab and Cypher.
    ///
    /// Each is expressed with three independent rules: XB = AB/XA, AC = BC/AB
    /// and XD = AD/XA.
    pub fn classic() -> Self {
        fn def(
            name: &str,
            xb: (f64, f64),
            ac: (f64, f64),
            xd: (f64, f64),
            primary: LegSpan,
        ) -> PatternDefinition {
            PatternDefinition::new(name, primary)
                .rule(LegRule::new(LegSpan::AB, LegSpan::XA, xb.0, xb.1))
                .rule(LegRule::new(LegSpan::BC, LegSpan::AB, ac.0, ac.1))
                .rule(LegRule::new(LegSpan::AD, LegSpan::XA, xd.0, xd.1))
        }

        let ac = (FIB_382, FIB_886);
        Self(vec![
            def("Gartley", (FIB_618, FIB_618), ac, (FIB_786, FIB_786), LegSpan::AD),
            def("Butterfly", (FIB_786, FIB_786), ac, (FIB_1270, FIB_1410), LegSpan::AD),
            def("Bat", (FIB_382, FIB_500), ac, (FIB_886, FIB_886), LegSpan::AD),
            def("Alternate Bat", (FIB_382, FIB_382), ac, (FIB_1130, FIB_1130), LegSpan::AD),
            def("Crab", (FIB_382, FIB_618), ac, (FIB_1618, FIB_1618), LegSpan::AD),
            def("Deep Crab", (FIB_886, FIB_886), ac, (FIB_1618, FIB_1618), LegSpan::AD),
            def("Cypher", (FIB_382, FIB_618), (FIB_1130, FIB_1410), (FIB_786, FIB_786), LegSpan::CD),
        ])
    }

    pub fn push(&mut self, definition: PatternDefinition) {
        self.0.push(definition);
    }

    pub fn iter(&self) -> impl Iterator<Item = &PatternDefinition> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&PatternDefinition> {
        self.0.iter().find(|d| d.name == name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(SetupError::InvalidConfig("empty pattern table".to_string()));
        }
        self.0.iter().try_for_each(PatternDefinition::validate)
    }
}

// ============================================================
// CONFIG
// ============================================================

/// Harmonic matcher configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarmonicConfig {
    pub table: PatternTable,
    /// Widening applied to both edges of every band
    pub tolerance: Percent,
    /// Target distance as a fraction of the primary leg
    pub take_profit_ratio: Ratio,
    pub take_profit_2_ratio: Ratio,
    /// Stop distance beyond D as a fraction of the primary leg
    pub stop_loss_ratio: Ratio,
    /// Floor for the stop distance, percent of the entry price
    pub min_stop_pct: Percent,
    /// Largest accepted stop distance over target distance
    pub max_stop_to_target: f64,
}

impl Default for HarmonicConfig {
    fn default() -> Self {
        Self {
            table: PatternTable::classic(),
            tolerance: Percent::new_const(5.0),
            take_profit_ratio: Ratio::new_const(0.37),
            take_profit_2_ratio: Ratio::new_const(0.618),
            stop_loss_ratio: Ratio::new_const(0.28),
            min_stop_pct: Percent::new_const(0.01),
            max_stop_to_target: 2.0,
        }
    }
}

impl HarmonicConfig {
    pub fn with_table(table: PatternTable) -> Self {
        Self {
            table,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.table.validate()?;
        if self.take_profit_ratio.get() <= 0.0 {
            return Err(SetupError::InvalidConfig(
                "take_profit_ratio must be > 0".to_string(),
            ));
        }
        if self.stop_loss_ratio.get() <= 0.0 && self.min_stop_pct.get() <= 0.0 {
            return Err(SetupError::InvalidConfig(
                "stop_loss_ratio and min_stop_pct cannot both be zero".to_string(),
            ));
        }
        if !self.max_stop_to_target.is_finite() || self.max_stop_to_target <= 0.0 {
            return Err(SetupError::OutOfRange {
                field: "max_stop_to_target",
                value: self.max_stop_to_target,
                min: 0.0,
                max: f64::INFINITY,
            });
        }
        Ok(())
    }
}

static HARMONIC_PARAMS: [ParamMeta; 6] = [
    ParamMeta::percent("tolerance", 5.0, (1.0, 10.0, 1.0), "Band widening, percent"),
    ParamMeta::ratio(
        "take_profit_ratio",
        0.37,
        (0.2, 0.8, 0.05),
        "Target as a fraction of the primary leg",
    ),
    ParamMeta::ratio(
        "take_profit_2_ratio",
        0.618,
        (0.382, 1.0, 0.1),
        "Second target as a fraction of the primary leg",
    ),
    ParamMeta::ratio(
        "stop_loss_ratio",
        0.28,
        (0.1, 0.6, 0.02),
        "Stop beyond D as a fraction of the primary leg",
    ),
    ParamMeta::percent(
        "min_stop_pct",
        0.01,
        (0.0, 1.0, 0.01),
        "Minimum stop distance, percent of entry",
    ),
    ParamMeta::multiplier(
        "max_stop_to_target",
        2.0,
        (0.5, 5.0, 0.25),
        "Largest stop/target distance ratio",
    ),
];

impl Parameterized for HarmonicConfig {
    fn param_meta() -> &'static [ParamMeta] {
        &HARMONIC_PARAMS
    }

    fn with_params(params: &HashMap<&str, f64>) -> Result<Self> {
        let d = Self::default();
        for meta in Self::param_meta() {
            if let Some(&value) = params.get(meta.name) {
                meta.validate(value)?;
            }
        }
        let config = Self {
            table: d.table,
            tolerance: get_percent(params, "tolerance", d.tolerance.get())?,
            take_profit_ratio: get_ratio(params, "take_profit_ratio", d.take_profit_ratio.get())?,
            take_profit_2_ratio: get_ratio(
                params,
                "take_profit_2_ratio",
                d.take_profit_2_ratio.get(),
            )?,
            stop_loss_ratio: get_ratio(params, "stop_loss_ratio", d.stop_loss_ratio.get())?,
            min_stop_pct: get_percent(params, "min_stop_pct", d.min_stop_pct.get())?,
            max_stop_to_target: get_multiplier(
                params,
                "max_stop_to_target",
                d.max_stop_to_target,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    fn config_name() -> &'static str {
        "harmonic"
    }
}

// ============================================================
// MATCHING
// ============================================================

/// Test the last five extremums against every definition in `config.table`.
///
/// Returns every matching candidate in table order. A malformed definition is
/// an error; degenerate legs only reject the definition they occur in.
pub fn try_match(extrema: &[Extremum], config: &HarmonicConfig) -> Result<Vec<PatternCandidate>> {
    let mut matches = Vec::new();
    if extrema.len() < HARMONIC_POINTS {
        return Ok(matches);
    }
    let points = &extrema[extrema.len() - HARMONIC_POINTS..];
    if !is_zigzag(points) {
        trace!("harmonic window ending at {} is not a zigzag", points[4].index);
        return Ok(matches);
    }
    let direction = match points[0].kind {
        ExtremumKind::Trough => Direction::Bullish,
        ExtremumKind::Peak => Direction::Bearish,
    };

    for definition in config.table.iter() {
        definition.validate()?;

        let candidate = definition
            .evaluate(points, config.tolerance)
            .and_then(|accuracy| match accuracy {
                Some(accuracy) => build_candidate(definition, points, direction, accuracy, config),
                None => Ok(None),
            });

        match candidate {
            Ok(Some(candidate)) => matches.push(candidate),
            Ok(None) => {}
            Err(SetupError::DegenerateLeg { leg }) => {
                trace!("{} rejected: degenerate leg {}", definition.name, leg);
            }
            Err(e) => return Err(e),
        }
    }

    Ok(matches)
}

fn build_candidate(
    definition: &PatternDefinition,
    points: &[Extremum],
    direction: Direction,
    accuracy: f64,
    config: &HarmonicConfig,
) -> Result<Option<PatternCandidate>> {
    let size = definition.primary_leg.range(points).abs();
    if !size.is_finite() || size < MIN_LEG {
        return Err(SetupError::DegenerateLeg {
            leg: definition.primary_leg.to_string(),
        });
    }

    let entry = points[HARMONIC_POINTS - 1].level();
    let sign = direction.sign();
    let target = size * config.take_profit_ratio.get();
    let stop = (size * config.stop_loss_ratio.get())
        .max(entry.price.abs() * config.min_stop_pct.fraction());

    if stop > target * config.max_stop_to_target {
        trace!(
            "{} rejected: stop {:.5} exceeds {}x target {:.5}",
            definition.name,
            stop,
            config.max_stop_to_target,
            target
        );
        return Ok(None);
    }

    Ok(Some(PatternCandidate {
        name: definition.name.clone(),
        direction,
        legs: points.iter().map(Extremum::level).collect(),
        entry,
        take_profit: entry.with_price(entry.price + sign * target),
        stop_loss: entry.with_price(entry.price - sign * stop),
        payload: SignalPayload::Harmonic {
            accuracy,
            take_profit_2: entry.price + sign * size * config.take_profit_2_ratio.get(),
        },
    }))
}
