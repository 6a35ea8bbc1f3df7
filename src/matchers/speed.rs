//! Speed (momentum) setups
//!
//! Speed is the percent change of price over a rolling window of bars:
//! `100 * (price - price_n_bars_ago) / price_n_bars_ago`. Two windows are
//! tracked. A setup triggers when the major speed exceeds the trigger threshold;
//! its stop is the close of the most recent bar where the minor speed pointed
//! the other way.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    params::{get_multiplier, get_period, ParamMeta, Parameterized},
    Direction, Level, PatternCandidate, Period, Result, SetupError, SignalPayload,
};

impl_with_defaults!(SpeedConfig);

/// Speed matcher configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeedConfig {
    pub major_period: Period,
    pub minor_period: Period,
    /// Major speed magnitude, percent per window, that triggers a setup
    pub trigger_pct: f64,
    /// Target distance as a multiple of the stop distance
    pub take_profit_ratio: f64,
    /// Resolve an active setup at market once the minor speed turns against it
    pub exit_on_reversal: bool,
}

impl Default for SpeedConfig {
    fn default() -> Self {
        Self {
            major_period: Period::new_const(20),
            minor_period: Period::new_const(5),
            trigger_pct: 1.0,
            take_profit_ratio: 1.5,
            exit_on_reversal: false,
        }
    }
}

impl SpeedConfig {
    pub fn validate(&self) -> Result<()> {
        if self.minor_period > self.major_period {
            return Err(SetupError::InvalidConfig(format!(
                "minor_period {} exceeds major_period {}",
                self.minor_period.get(),
                self.major_period.get()
            )));
        }
        if !self.trigger_pct.is_finite() || self.trigger_pct <= 0.0 {
            return Err(SetupError::InvalidValue("trigger_pct must be finite and > 0"));
        }
        if !self.take_profit_ratio.is_finite() || self.take_profit_ratio <= 0.0 {
            return Err(SetupError::InvalidValue("take_profit_ratio must be finite and > 0"));
        }
        Ok(())
    }
}

static SPEED_PARAMS: [ParamMeta; 4] = [
    ParamMeta::period("major_period", 20.0, (5.0, 100.0, 5.0), "Major window, bars"),
    ParamMeta::period("minor_period", 5.0, (2.0, 30.0, 1.0), "Minor window, bars"),
    ParamMeta::multiplier(
        "trigger_pct",
        1.0,
        (0.1, 10.0, 0.1),
        "Major speed that triggers a setup, percent per window",
    ),
    ParamMeta::multiplier(
        "take_profit_ratio",
        1.5,
        (0.5, 5.0, 0.25),
        "Target distance over stop distance",
    ),
];

impl Parameterized for SpeedConfig {
    fn param_meta() -> &'static [ParamMeta] {
        &SPEED_PARAMS
    }

    fn with_params(params: &HashMap<&str, f64>) -> Result<Self> {
        let d = Self::default();
        for meta in Self::param_meta() {
            if let Some(&value) = params.get(meta.name) {
                meta.validate(value)?;
            }
        }
        let config = Self {
            major_period: get_period(params, "major_period", d.major_period.get())?,
            minor_period: get_period(params, "minor_period", d.minor_period.get())?,
            trigger_pct: get_multiplier(params, "trigger_pct", d.trigger_pct)?,
            take_profit_ratio: get_multiplier(params, "take_profit_ratio", d.take_profit_ratio)?,
            exit_on_reversal: d.exit_on_reversal,
        };
        config.validate()?;
        Ok(config)
    }

    fn config_name() -> &'static str {
        "speed"
    }
}

/// Speed of one bar
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SpeedSample {
    pub index: usize,
    pub open_time: DateTime<Utc>,
    pub price: f64,
    pub speed: f64,
}

impl SpeedSample {
    #[inline]
    pub fn level(&self) -> Level {
        Level::new(self.price, self.index, self.open_time)
    }
}

/// Rolling rate of change over `period` bars
#[derive(Debug, Clone)]
pub struct SpeedTracker {
    period: usize,
    prices: VecDeque<f64>,
    history: VecDeque<SpeedSample>,
    history_len: usize,
    last_index: Option<usize>,
}

impl SpeedTracker {
    pub fn new(period: Period) -> Self {
        let period = period.get();
        Self {
            period,
            prices: VecDeque::with_capacity(period + 1),
            history: VecDeque::new(),
            history_len: (period * 4).max(64),
            last_index: None,
        }
    }

    pub fn period(&self) -> usize {
        self.period
    }

    /// Observe `price` for bar `index`. Repeating the last index (a tick inside
    /// the current bar) replaces that bar's price instead of adding a new one.
    pub fn observe(&mut self, index: usize, open_time: DateTime<Utc>, price: f64) {
        if self.last_index == Some(index) {
            self.prices.pop_back();
            if self.history.back().is_some_and(|s| s.index == index) {
                self.history.pop_back();
            }
        }
        self.last_index = Some(index);
        self.prices.push_back(price);
        if self.prices.len() > self.period + 1 {
            self.prices.pop_front();
        }

        // samples exist only once the window is full
        let Some(speed) = self.compute() else {
            return;
        };
        self.history.push_back(SpeedSample {
            index,
            open_time,
            price,
            speed,
        });
        if self.history.len() > self.history_len {
            self.history.pop_front();
        }
    }

    fn compute(&self) -> Option<f64> {
        if !self.is_ready() {
            return None;
        }
        let ago = *self.prices.front()?;
        let now = *self.prices.back()?;
        (ago.abs() > f64::EPSILON).then(|| 100.0 * (now - ago) / ago)
    }

    /// True once a full window of bars has been seen
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.prices.len() > self.period
    }

    /// Current speed, `None` while the window is filling
    pub fn speed(&self) -> Option<f64> {
        self.compute()
    }

    /// Recent samples, oldest first
    pub fn history(&self) -> impl DoubleEndedIterator<Item = &SpeedSample> {
        self.history.iter()
    }

    pub fn reset(&mut self) {
        self.prices.clear();
        self.history.clear();
        self.last_index = None;
    }
}

/// Major and minor speed windows over one price stream
#[derive(Debug, Clone)]
pub struct SpeedMatcher {
    config: SpeedConfig,
    major: SpeedTracker,
    minor: SpeedTracker,
}

impl SpeedMatcher {
    pub fn new(config: SpeedConfig) -> Self {
        Self {
            major: SpeedTracker::new(config.major_period),
            minor: SpeedTracker::new(config.minor_period),
            config,
        }
    }

    pub fn config(&self) -> &SpeedConfig {
        &self.config
    }

    pub fn observe(&mut self, index: usize, open_time: DateTime<Utc>, price: f64) {
        self.major.observe(index, open_time, price);
        self.minor.observe(index, open_time, price);
    }

    pub fn major(&self) -> &SpeedTracker {
        &self.major
    }

    pub fn minor(&self) -> &SpeedTracker {
        &self.minor
    }

    /// True when the minor speed points against `direction`
    pub fn reversed_against(&self, direction: Direction) -> bool {
        self.minor
            .speed()
            .is_some_and(|s| direction.sign() * s < 0.0)
    }

    /// Candidate for entering at `at`, if the major speed is past the trigger
    pub fn try_match(&self, at: Level) -> Result<Vec<PatternCandidate>> {
        let (Some(major), Some(minor)) = (self.major.speed(), self.minor.speed()) else {
            return Ok(Vec::new());
        };
        if major.abs() <= self.config.trigger_pct {
            return Ok(Vec::new());
        }
        let direction = if major > 0.0 {
            Direction::Bullish
        } else {
            Direction::Bearish
        };
        let sign = direction.sign();

        let Some(protective) = self
            .minor
            .history()
            .rev()
            .find(|s| s.index < at.index && sign * s.speed <= 0.0)
        else {
            return Ok(Vec::new());
        };

        let risk = sign * (at.price - protective.price);
        if !risk.is_finite() || risk <= 0.0 {
            return Ok(Vec::new());
        }

        let stop_loss = protective.level();
        Ok(vec![PatternCandidate {
            name: "Speed".to_string(),
            direction,
            legs: vec![stop_loss],
            entry: at,
            take_profit: at.with_price(at.price + sign * risk * self.config.take_profit_ratio),
            stop_loss,
            payload: SignalPayload::Speed { major, minor },
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(i: usize) -> DateTime<Utc> {
        Utc.timestamp_opt(i as i64 * 60, 0).unwrap()
    }

    #[test]
    fn test_speed_over_window() {
        let mut tracker = SpeedTracker::new(Period::new(2).unwrap());
        tracker.observe(0, t(0), 100.0);
        tracker.observe(1, t(1), 101.0);
        assert!(tracker.speed().is_none());
        tracker.observe(2, t(2), 102.0);
        assert!((tracker.speed().unwrap() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_tick_updates_current_bar() {
        let mut tracker = SpeedTracker::new(Period::new(1).unwrap());
        tracker.observe(0, t(0), 100.0);
        tracker.observe(1, t(1), 101.0);
        tracker.observe(1, t(1), 103.0);
        assert!((tracker.speed().unwrap() - 3.0).abs() < 1e-12);
        assert_eq!(tracker.history().count(), 1);
    }

    #[test]
    fn test_major_trigger_and_protective_level() {
        let config = SpeedConfig {
            major_period: Period::new(4).unwrap(),
            minor_period: Period::new(1).unwrap(),
            trigger_pct: 2.0,
            take_profit_ratio: 2.0,
            exit_on_reversal: false,
        };
        let mut matcher = SpeedMatcher::new(config);
        // dip at bar 2, then a rally
        let prices = [100.0, 100.5, 99.0, 101.0, 103.0, 105.0];
        for (i, p) in prices.iter().enumerate() {
            matcher.observe(i, t(i), *p);
        }

        let at = Level::new(105.0, 5, t(5));
        let found = matcher.try_match(at).unwrap();
        assert_eq!(found.len(), 1);
        let c = &found[0];
        assert_eq!(c.direction, Direction::Bullish);
        assert_eq!(c.stop_loss.index, 2);
        assert_eq!(c.stop_loss.price, 99.0);
        // risk 6, target 2x
        assert!((c.take_profit.price - 117.0).abs() < 1e-9);
    }

    #[test]
    fn test_below_trigger_is_quiet() {
        let mut matcher = SpeedMatcher::new(SpeedConfig {
            major_period: Period::new(3).unwrap(),
            minor_period: Period::new(1).unwrap(),
            trigger_pct: 5.0,
            ..SpeedConfig::default()
        });
        for (i, p) in [100.0, 100.5, 101.0, 101.5].iter().enumerate() {
            matcher.observe(i, t(i), *p);
        }
        assert!(matcher.try_match(Level::new(101.5, 3, t(3))).unwrap().is_empty());
    }

    #[test]
    fn test_config_validation() {
        assert!(SpeedConfig::default().validate().is_ok());
        let inverted = SpeedConfig {
            major_period: Period::new(5).unwrap(),
            minor_period: Period::new(10).unwrap(),
            ..SpeedConfig::default()
        };
        assert!(inverted.validate().is_err());
    }
}
