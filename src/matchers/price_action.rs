//! Price action setups
//!
//! The last three bars are compared against classic candle shapes: hammers,
//! pin bars, outer and inner bars and pivot point reversals. A shape enters at
//! the close of the bar that completes it, with the stop beyond the shape's
//! protective extreme and the target a multiple of that risk.

use std::collections::HashMap;

use log::trace;
use serde::{Deserialize, Serialize};

use crate::{
    params::{get_multiplier, get_ratio, ParamMeta, Parameterized},
    Bar, Direction, Level, OHLCVExt, PatternCandidate, Ratio, Result, SetupError, SignalPayload,
    OHLCV,
};

impl_with_defaults!(PriceActionConfig);

/// Bars every shape is evaluated on, the completing bar last
pub const CANDLE_WINDOW: usize = 3;

// ============================================================
// SHAPES
// ============================================================

/// A recognised candle formation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandleShape {
    /// Body in the top of a long lower shadow
    Hammer,
    /// Body in the bottom of a long upper shadow
    ShootingStar,
    UpPinBar,
    DownPinBar,
    UpOuterBar,
    DownOuterBar,
    UpOuterBarBodies,
    DownOuterBarBodies,
    UpInnerBar,
    DownInnerBar,
    /// Pivot point reversal
    UpPpr,
    DownPpr,
}

impl CandleShape {
    pub const ALL: [CandleShape; 12] = [
        CandleShape::Hammer,
        CandleShape::ShootingStar,
        CandleShape::UpPinBar,
        CandleShape::DownPinBar,
        CandleShape::UpOuterBar,
        CandleShape::DownOuterBar,
        CandleShape::UpOuterBarBodies,
        CandleShape::DownOuterBarBodies,
        CandleShape::UpInnerBar,
        CandleShape::DownInnerBar,
        CandleShape::UpPpr,
        CandleShape::DownPpr,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CandleShape::Hammer => "hammer",
            CandleShape::ShootingStar => "shooting_star",
            CandleShape::UpPinBar => "up_pin_bar",
            CandleShape::DownPinBar => "down_pin_bar",
            CandleShape::UpOuterBar => "up_outer_bar",
            CandleShape::DownOuterBar => "down_outer_bar",
            CandleShape::UpOuterBarBodies => "up_outer_bar_bodies",
            CandleShape::DownOuterBarBodies => "down_outer_bar_bodies",
            CandleShape::UpInnerBar => "up_inner_bar",
            CandleShape::DownInnerBar => "down_inner_bar",
            CandleShape::UpPpr => "up_ppr",
            CandleShape::DownPpr => "down_ppr",
        }
    }

    pub fn direction(self) -> Direction {
        match self {
            CandleShape::Hammer
            | CandleShape::UpPinBar
            | CandleShape::UpOuterBar
            | CandleShape::UpOuterBarBodies
            | CandleShape::UpInnerBar
            | CandleShape::UpPpr => Direction::Bullish,
            _ => Direction::Bearish,
        }
    }

    /// Bars that make up the shape
    pub fn bars(self) -> usize {
        match self {
            CandleShape::Hammer | CandleShape::ShootingStar => 1,
            CandleShape::UpPinBar
            | CandleShape::DownPinBar
            | CandleShape::UpPpr
            | CandleShape::DownPpr => 3,
            _ => 2,
        }
    }

    /// Bar holding the protective extreme, counted back from the completing
    /// bar. `None`: the extreme over all of the shape's bars.
    fn stop_bar(self) -> Option<usize> {
        match self {
            CandleShape::Hammer
            | CandleShape::ShootingStar
            | CandleShape::UpOuterBar
            | CandleShape::DownOuterBar => Some(0),
            CandleShape::UpOuterBarBodies | CandleShape::DownOuterBarBodies => None,
            _ => Some(1),
        }
    }

    /// True when the last [`CANDLE_WINDOW`] bars of `window` form this shape
    pub fn matches<T: OHLCV>(self, window: &[T], shadow_ratio: Ratio) -> bool {
        if window.len() < CANDLE_WINDOW {
            return false;
        }
        let n = window.len();
        let (c3, c2, c1) = (&window[n - 3], &window[n - 2], &window[n - 1]);

        match self {
            CandleShape::Hammer => {
                let floor = c1.low() + c1.range() * shadow_ratio.get();
                c1.is_bullish() && c1.open() > floor && c1.close() > floor
            }
            CandleShape::ShootingStar => {
                let ceiling = c1.high() - c1.range() * shadow_ratio.get();
                c1.is_bearish() && c1.open() < ceiling && c1.close() < ceiling
            }
            CandleShape::UpPinBar => {
                let upper_third = c2.high() - c2.range() / 3.0;
                let half = c2.high() - c2.range() / 2.0;
                c2.body_low() >= upper_third
                    && c3.low() >= half
                    && c2.close() <= c3.high()
                    && c1.low() >= half
                    && c1.close() > c2.high()
            }
            CandleShape::DownPinBar => {
                let lower_third = c2.low() + c2.range() / 3.0;
                let half = c2.low() + c2.range() / 2.0;
                c2.body_high() <= lower_third
                    && c3.high() <= half
                    && c2.close() >= c3.low()
                    && c1.high() <= half
                    && c1.close() < c2.low()
            }
            CandleShape::UpOuterBar => {
                c1.is_bullish()
                    && c2.open() > c1.close()
                    && c2.high() < c1.high()
                    && c2.low() > c1.low()
            }
            CandleShape::DownOuterBar => {
                c1.is_bearish()
                    && c2.open() < c1.close()
                    && c2.high() < c1.high()
                    && c2.low() > c1.low()
            }
            CandleShape::UpOuterBarBodies => {
                c1.is_bullish() && c2.body_high() <= c1.body_high() && c2.body_low() >= c1.body_low()
            }
            CandleShape::DownOuterBarBodies => {
                c1.is_bearish() && c2.body_high() <= c1.body_high() && c2.body_low() >= c1.body_low()
            }
            CandleShape::UpInnerBar => {
                c1.is_bullish()
                    && c2.high() > c1.high()
                    && c2.low() < c1.low()
                    && c2.close() > c1.open()
                    && c2.open() <= c1.open()
            }
            CandleShape::DownInnerBar => {
                c1.is_bearish()
                    && c2.is_bullish()
                    && c2.high() > c1.high()
                    && c2.low() < c1.low()
                    && c2.close() >= c1.open()
            }
            CandleShape::UpPpr => {
                c3.is_bearish()
                    && c2.is_bearish()
                    && c3.high() > c2.high()
                    && c1.is_bullish()
                    && c1.low() > c2.low()
                    && c3.low() > c2.low()
            }
            CandleShape::DownPpr => {
                c3.is_bullish()
                    && c2.is_bullish()
                    && c3.low() < c2.low()
                    && c1.is_bearish()
                    && c1.high() < c2.high()
                    && c3.high() < c2.high()
            }
        }
    }
}

// ============================================================
// CONFIGURATION
// ============================================================

/// Price action matcher configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriceActionConfig {
    /// Shapes to look for, in priority order
    pub shapes: Vec<CandleShape>,
    /// Share of a single bar's range the shadow of a hammer or shooting star spans
    pub shadow_ratio: Ratio,
    /// Extra stop distance beyond the protective extreme, as a share of the
    /// entry-to-extreme distance
    pub stop_allowance: Ratio,
    /// Target distance as a multiple of the stop distance
    pub take_profit_ratio: f64,
}

impl Default for PriceActionConfig {
    fn default() -> Self {
        Self {
            shapes: CandleShape::ALL.to_vec(),
            shadow_ratio: Ratio::new_const(0.7),
            stop_allowance: Ratio::new_const(0.1),
            take_profit_ratio: 1.5,
        }
    }
}

impl PriceActionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.shapes.is_empty() {
            return Err(SetupError::InvalidConfig("no candle shapes configured".to_string()));
        }
        let shadow = self.shadow_ratio.get();
        if shadow <= 0.0 || shadow >= 1.0 {
            return Err(SetupError::OutOfRange {
                field: "shadow_ratio",
                value: shadow,
                min: 0.0,
                max: 1.0,
            });
        }
        if !self.take_profit_ratio.is_finite() || self.take_profit_ratio <= 0.0 {
            return Err(SetupError::InvalidValue("take_profit_ratio must be finite and > 0"));
        }
        Ok(())
    }
}

static PRICE_ACTION_PARAMS: [ParamMeta; 3] = [
    ParamMeta::ratio(
        "shadow_ratio",
        0.7,
        (0.5, 0.9, 0.05),
        "Shadow share of a hammer's range",
    ),
    ParamMeta::ratio(
        "stop_allowance",
        0.1,
        (0.0, 0.5, 0.05),
        "Stop distance beyond the extreme, share of the risk",
    ),
    ParamMeta::multiplier(
        "take_profit_ratio",
        1.5,
        (0.5, 5.0, 0.25),
        "Target distance over stop distance",
    ),
];

impl Parameterized for PriceActionConfig {
    fn param_meta() -> &'static [ParamMeta] {
        &PRICE_ACTION_PARAMS
    }

    fn with_params(params: &HashMap<&str, f64>) -> Result<Self> {
        let d = Self::default();
        for meta in Self::param_meta() {
            if let Some(&value) = params.get(meta.name) {
                meta.validate(value)?;
            }
        }
        let config = Self {
            shapes: d.shapes,
            shadow_ratio: get_ratio(params, "shadow_ratio", d.shadow_ratio.get())?,
            stop_allowance: get_ratio(params, "stop_allowance", d.stop_allowance.get())?,
            take_profit_ratio: get_multiplier(params, "take_profit_ratio", d.take_profit_ratio)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn config_name() -> &'static str {
        "price_action"
    }
}

// ============================================================
// MATCHING
// ============================================================

/// Protective extreme of `shape` in `window`, pinned to its bar
fn protective_level(shape: CandleShape, window: &[Bar]) -> Option<Level> {
    let last = window.len().checked_sub(1)?;
    let extreme_of = |bar: &Bar| match shape.direction() {
        Direction::Bullish => bar.level(bar.low),
        Direction::Bearish => bar.level(bar.high),
    };
    match shape.stop_bar() {
        Some(back) => window.get(last.checked_sub(back)?).map(extreme_of),
        None => {
            let sign = shape.direction().sign();
            window[window.len().saturating_sub(shape.bars())..]
                .iter()
                .map(extreme_of)
                // lowest low for longs, highest high for shorts; the later bar wins ties
                .reduce(|best, l| if sign * (l.price - best.price) <= 0.0 { l } else { best })
        }
    }
}

/// Every configured shape completed by the last bar of `window`
pub fn try_match_price_action(
    window: &[Bar],
    config: &PriceActionConfig,
) -> Result<Vec<PatternCandidate>> {
    config.validate()?;
    let Some(last) = window.last() else {
        return Ok(Vec::new());
    };
    if window.len() < CANDLE_WINDOW {
        return Ok(Vec::new());
    }

    let mut found = Vec::new();
    for &shape in &config.shapes {
        if !shape.matches(window, config.shadow_ratio) {
            continue;
        }
        let Some(extreme) = protective_level(shape, window) else {
            continue;
        };
        let direction = shape.direction();
        let sign = direction.sign();
        let entry = last.level(last.close);

        let room = sign * (entry.price - extreme.price);
        if !room.is_finite() || room <= 0.0 {
            trace!("{} on bar {} rejected: close at the extreme", shape.as_str(), last.index);
            continue;
        }
        let stop_loss = extreme.with_price(extreme.price - sign * room * config.stop_allowance.get());
        let risk = sign * (entry.price - stop_loss.price);

        found.push(PatternCandidate {
            name: shape.as_str().to_string(),
            direction,
            legs: vec![extreme, entry],
            entry,
            take_profit: entry.with_price(entry.price + sign * risk * config.take_profit_ratio),
            stop_loss,
            payload: SignalPayload::PriceAction {
                shape,
                bars: shape.bars(),
            },
        });
    }
    Ok(found)
}

/// Rolling window of the most recent bars
#[derive(Debug, Clone)]
pub struct PriceActionMatcher {
    config: PriceActionConfig,
    window: Vec<Bar>,
}

impl PriceActionMatcher {
    pub fn new(config: PriceActionConfig) -> Self {
        Self {
            config,
            window: Vec::with_capacity(CANDLE_WINDOW + 1),
        }
    }

    pub fn config(&self) -> &PriceActionConfig {
        &self.config
    }

    pub fn observe(&mut self, bar: &Bar) {
        self.window.push(*bar);
        if self.window.len() > CANDLE_WINDOW {
            self.window.remove(0);
        }
    }

    pub fn window(&self) -> &[Bar] {
        &self.window
    }

    pub fn try_match(&self) -> Result<Vec<PatternCandidate>> {
        try_match_price_action(&self.window, &self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn t(i: usize) -> DateTime<Utc> {
        Utc.timestamp_opt(i as i64 * 3600, 0).unwrap()
    }

    fn window(ohlc: &[(f64, f64, f64, f64)]) -> Vec<Bar> {
        ohlc.iter()
            .enumerate()
            .map(|(i, &(o, h, l, c))| Bar::new(i, t(i), o, h, l, c))
            .collect()
    }

    /// Price-mirrored copy: highs become lows and bullish bars bearish
    fn mirrored(bars: &[Bar]) -> Vec<Bar> {
        bars.iter()
            .map(|b| Bar::new(b.index, b.open_time, 200.0 - b.open, 200.0 - b.low, 200.0 - b.high, 200.0 - b.close))
            .collect()
    }

    fn shapes(bars: &[Bar]) -> Vec<CandleShape> {
        try_match_price_action(bars, &PriceActionConfig::default())
            .unwrap()
            .into_iter()
            .map(|c| match c.payload {
                SignalPayload::PriceAction { shape, .. } => shape,
                other => panic!("unexpected payload {other:?}"),
            })
            .collect()
    }

    fn pin_bar() -> Vec<Bar> {
        window(&[(9.0, 9.6, 8.6, 9.2), (9.2, 10.0, 7.0, 9.5), (9.5, 10.3, 9.4, 10.2)])
    }

    #[test]
    fn test_hammer_levels() {
        let bars = window(&[(10.0, 10.1, 9.9, 10.0), (10.0, 10.05, 9.5, 9.6), (9.8, 10.0, 9.0, 9.9)]);
        let found = try_match_price_action(&bars, &PriceActionConfig::default()).unwrap();
        assert_eq!(found.len(), 1);

        let c = &found[0];
        assert_eq!(c.name, "hammer");
        assert_eq!(c.direction, Direction::Bullish);
        assert_eq!(c.entry.price, 9.9);
        assert_eq!(c.entry.index, 2);
        // 0.9 to the low plus a 10% allowance
        assert!((c.stop_loss.price - 8.91).abs() < 1e-9);
        assert!((c.take_profit.price - (9.9 + 0.99 * 1.5)).abs() < 1e-9);
        assert_eq!(c.anchor_time(), t(2));
    }

    #[test]
    fn test_pin_bar_and_mirror() {
        let found = try_match_price_action(&pin_bar(), &PriceActionConfig::default()).unwrap();
        let pin = found.iter().find(|c| c.name == "up_pin_bar").unwrap();
        // the pin's own low protects the entry
        assert_eq!(pin.legs[0].price, 7.0);
        assert_eq!(pin.legs[0].index, 1);

        assert!(shapes(&mirrored(&pin_bar())).contains(&CandleShape::DownPinBar));
        assert!(!shapes(&mirrored(&pin_bar())).contains(&CandleShape::UpPinBar));
    }

    #[test]
    fn test_pivot_point_reversal() {
        let bars = window(&[(10.0, 10.2, 9.4, 9.5), (9.5, 9.6, 8.8, 9.0), (9.0, 9.8, 8.9, 9.7)]);
        let found = shapes(&bars);
        assert!(found.contains(&CandleShape::UpPpr));
        // the bodies nest as well
        assert!(found.contains(&CandleShape::UpOuterBarBodies));
        assert!(shapes(&mirrored(&bars)).contains(&CandleShape::DownPpr));
    }

    #[test]
    fn test_outer_bodies_stop_is_lowest_low() {
        let bars = window(&[(10.0, 10.2, 9.4, 9.5), (9.5, 9.6, 8.8, 9.0), (9.0, 9.8, 8.9, 9.7)]);
        let found = try_match_price_action(&bars, &PriceActionConfig::default()).unwrap();
        let outer = found.iter().find(|c| c.name == "up_outer_bar_bodies").unwrap();
        assert_eq!(outer.legs[0].price, 8.8);
        assert_eq!(outer.legs[0].index, 1);
    }

    #[test]
    fn test_shape_filter() {
        let config = PriceActionConfig {
            shapes: vec![CandleShape::Hammer],
            ..PriceActionConfig::default()
        };
        assert!(try_match_price_action(&pin_bar(), &config).unwrap().is_empty());
    }

    #[test]
    fn test_short_window_is_quiet() {
        let bars = pin_bar();
        assert!(try_match_price_action(&bars[1..], &PriceActionConfig::default()).unwrap().is_empty());
        assert!(!CandleShape::Hammer.matches(&bars[2..], Ratio::new_const(0.7)));
    }

    #[test]
    fn test_matcher_keeps_last_bars() {
        let mut matcher = PriceActionMatcher::new(PriceActionConfig::with_defaults());
        for bar in window(&[(1.0, 1.0, 1.0, 1.0), (1.0, 1.0, 1.0, 1.0)]).iter().chain(&pin_bar()) {
            matcher.observe(bar);
        }
        assert_eq!(matcher.window().len(), CANDLE_WINDOW);
        assert_eq!(matcher.window()[0].close, 9.2);
    }

    #[test]
    fn test_config_validation() {
        assert!(PriceActionConfig::default().validate().is_ok());
        let empty = PriceActionConfig {
            shapes: Vec::new(),
            ..PriceActionConfig::default()
        };
        assert!(matches!(empty.validate(), Err(SetupError::InvalidConfig(_))));
        assert!(try_match_price_action(&pin_bar(), &empty).is_err());

        let mut params = HashMap::new();
        params.insert("take_profit_ratio", 2.0);
        let tuned = PriceActionConfig::with_params(&params).unwrap();
        assert_eq!(tuned.take_profit_ratio, 2.0);
        assert_eq!(tuned.shapes.len(), CandleShape::ALL.len());
    }
}
