//! # YASF - Yet Another Setup Finder
//!
//! Streaming trade-setup detection for technical analysis. A zigzag
//! [`ExtremumTracker`](extremum::ExtremumTracker) turns bars into swing points,
//! harmonic, impulse, momentum and candle matchers classify them, and a per-instrument
//! [`SetupFinder`](finder::SetupFinder) follows every setup from entry to
//! take-profit or stop-loss, surviving restarts through a [`StateBook`](store::StateBook).
//!
//! ## Quick Start
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use yasf::prelude::*;
//!
//! // One finder per instrument, harmonic patterns by default
//! let mut finder = SetupFinder::builder("EURUSD", "H1")
//!     .config(FinderConfig::default())
//!     .build()
//!     .unwrap();
//!
//! // Feed completed bars in order and collect lifecycle events
//! let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
//! let bar = Bar::new(0, t0, 1.1000, 1.1010, 1.0990, 1.1005);
//! let events = finder.check_bar(&bar).unwrap();
//! assert!(events.is_empty());
//! ```

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use finder::SetupEvent;
use matchers::CandleShape;

pub mod extremum;
pub mod finder;
pub mod matchers;
pub mod params;
pub mod store;

pub mod prelude {
    pub use crate::{
        // Tracker
        extremum::{DeviationBasis, Extremum, ExtremumKind, ExtremumTracker, TrackerConfig},
        // State machine
        finder::{
            signal_id, ActiveSetup, Cancellation, ChannelSink, DetectorConfig, EnteredSetup,
            EventSink, FinderBuilder, FinderConfig, IntrabarPolicy, PendingSetup, Resolution,
            SelectionPolicy, SetupEvent, SetupFinder, SetupPhase, StopMoved,
        },
        // Matchers
        matchers::*,
        // Parameters
        params::{get_percent, get_period, get_ratio, ParamMeta, ParamType, Parameterized},
        // Parallel
        replay_parallel,
        // Persistence
        store::{initialize, InstrumentState, JsonFileStore, MemoryStore, StateBook, StateMap, StateStore},
        // Types
        Bar,
        BarsProvider,
        Direction,
        Level,
        OHLCVExt,
        PatternCandidate,
        PatternFamily,
        Percent,
        Period,
        Ratio,
        ReplayError,
        ReplayJob,
        ReplayResult,
        // Errors
        Result,
        SetupError,
        SignalPayload,
        VecBars,
        OHLCV,
    };
}

// ============================================================
// ERRORS
// ============================================================

pub type Result<T> = std::result::Result<T, SetupError>;

/// Errors that can occur while tracking, matching or persisting setups
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("Invalid value: {0}")]
    InvalidValue(&'static str),

    #[error("{field} = {value} out of range [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// Not enough swing points yet. Recoverable: wait for more bars.
    #[error("Insufficient history: need {need} extrema, got {got}")]
    InsufficientHistory { need: usize, got: usize },

    /// A leg with zero or non-finite range. The match is rejected, never fatal.
    #[error("Degenerate leg {leg}: zero or invalid range")]
    DegenerateLeg { leg: String },

    #[error("Invalid bar at index {index}: {reason}")]
    InvalidBar { index: usize, reason: &'static str },

    #[error(
        "[{symbol}] out-of-order bar: index {index} at {open_time} after index {last_index} at {last_open_time}"
    )]
    OutOfOrderBar {
        symbol: String,
        index: usize,
        open_time: DateTime<Utc>,
        last_index: usize,
        last_open_time: DateTime<Utc>,
    },

    #[error("Corrupt state in {}: {reason}", path.display())]
    CorruptState { path: PathBuf, reason: String },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The transition happened and its events reached the sinks, but the
    /// state book could not record it. The write is retried on the next call.
    #[error("[{symbol}] state not persisted after {} events: {source}", .events.len())]
    NotPersisted {
        symbol: String,
        events: Vec<SetupEvent>,
        #[source]
        source: Box<SetupError>,
    },
}

// ============================================================
// VALIDATED TYPES
// ============================================================

/// Normalized value in range 0.0..=1.0
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Ratio(f64);

impl Ratio {
    /// Create a new Ratio, validating the value is in [0.0, 1.0]
    pub fn new(value: f64) -> Result<Self> {
        if value.is_nan() || value.is_infinite() {
            return Err(SetupError::InvalidValue("Ratio cannot be NaN or infinite"));
        }
        if !(0.0..=1.0).contains(&value) {
            return Err(SetupError::OutOfRange {
                field: "Ratio",
                value,
                min: 0.0,
                max: 1.0,
            });
        }
        Ok(Self(value))
    }

    #[doc(hidden)]
    pub const fn new_const(value: f64) -> Self {
        Self(value)
    }

    #[inline]
    pub fn get(self) -> f64 {
        self.0
    }
}

impl Serialize for Ratio {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        self.0.serialize(s)
    }
}

impl<'de> Deserialize<'de> for Ratio {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let value = f64::deserialize(d)?;
        Ratio::new(value).map_err(serde::de::Error::custom)
    }
}

/// Percentage in range 0.0..=100.0 (deviation thresholds, tolerance bands)
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Percent(f64);

impl Percent {
    /// Create a new Percent, validating the value is in [0.0, 100.0]
    pub fn new(value: f64) -> Result<Self> {
        if value.is_nan() || value.is_infinite() {
            return Err(SetupError::InvalidValue("Percent cannot be NaN or infinite"));
        }
        if !(0.0..=100.0).contains(&value) {
            return Err(SetupError::OutOfRange {
                field: "Percent",
                value,
                min: 0.0,
                max: 100.0,
            });
        }
        Ok(Self(value))
    }

    #[doc(hidden)]
    pub const fn new_const(value: f64) -> Self {
        Self(value)
    }

    #[inline]
    pub fn get(self) -> f64 {
        self.0
    }

    /// The percentage as a fraction, `5%` -> `0.05`
    #[inline]
    pub fn fraction(self) -> f64 {
        self.0 / 100.0
    }
}

impl Serialize for Percent {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        self.0.serialize(s)
    }
}

impl<'de> Deserialize<'de> for Percent {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let value = f64::deserialize(d)?;
        Percent::new(value).map_err(serde::de::Error::custom)
    }
}

/// Period (must be > 0)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Period(usize);

impl Period {
    /// Create a new Period, validating value is > 0
    pub fn new(value: usize) -> Result<Self> {
        if value == 0 {
            return Err(SetupError::InvalidValue("Period must be > 0"));
        }
        Ok(Self(value))
    }

    #[doc(hidden)]
    pub const fn new_const(value: usize) -> Self {
        Self(value)
    }

    #[inline]
    pub fn get(self) -> usize {
        self.0
    }
}

impl Serialize for Period {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        self.0.serialize(s)
    }
}

impl<'de> Deserialize<'de> for Period {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let value = usize::deserialize(d)?;
        Period::new(value).map_err(serde::de::Error::custom)
    }
}

// ============================================================
// OHLC TRAITS
// ============================================================

/// Core OHLC price trait
pub trait OHLCV {
    fn open(&self) -> f64;
    fn high(&self) -> f64;
    fn low(&self) -> f64;
    fn close(&self) -> f64;
}

/// Extension trait with computed properties for OHLC data
pub trait OHLCVExt: OHLCV {
    #[inline]
    fn body(&self) -> f64 {
        (self.close() - self.open()).abs()
    }

    #[inline]
    fn body_high(&self) -> f64 {
        self.open().max(self.close())
    }

    #[inline]
    fn body_low(&self) -> f64 {
        self.open().min(self.close())
    }

    #[inline]
    fn range(&self) -> f64 {
        self.high() - self.low()
    }

    #[inline]
    fn is_bullish(&self) -> bool {
        self.close() > self.open()
    }

    #[inline]
    fn is_bearish(&self) -> bool {
        self.close() < self.open()
    }

    /// True when `price` lies inside the bar's high/low range
    #[inline]
    fn spans(&self, price: f64) -> bool {
        self.low() <= price && price <= self.high()
    }

    /// Validate OHLC data consistency
    fn validate(&self) -> Result<()> {
        let values = [self.open(), self.high(), self.low(), self.close()];
        if values.iter().any(|v| v.is_nan()) {
            return Err(SetupError::InvalidBar {
                index: 0,
                reason: "NaN in OHLC",
            });
        }
        if values.iter().any(|v| v.is_infinite()) {
            return Err(SetupError::InvalidBar {
                index: 0,
                reason: "Infinite value in OHLC",
            });
        }
        if self.high() < self.low() {
            return Err(SetupError::InvalidBar {
                index: 0,
                reason: "high < low",
            });
        }
        Ok(())
    }
}

impl<T: OHLCV> OHLCVExt for T {}

// ============================================================
// BARS AND LEVELS
// ============================================================

/// One completed bar of the instrument's stream.
///
/// `index` addresses the bar within one run, `open_time` identifies it across runs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub index: usize,
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl Bar {
    pub fn new(
        index: usize,
        open_time: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
    ) -> Self {
        Self {
            index,
            open_time,
            open,
            high,
            low,
            close,
        }
    }

    /// A price pinned to this bar
    #[inline]
    pub fn level(&self, price: f64) -> Level {
        Level::new(price, self.index, self.open_time)
    }
}

impl OHLCV for Bar {
    fn open(&self) -> f64 {
        self.open
    }

    fn high(&self) -> f64 {
        self.high
    }

    fn low(&self) -> f64 {
        self.low
    }

    fn close(&self) -> f64 {
        self.close
    }
}

/// A price pinned to a point in time
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Level {
    pub price: f64,
    pub index: usize,
    pub open_time: DateTime<Utc>,
}

impl Level {
    pub fn new(price: f64, index: usize, open_time: DateTime<Utc>) -> Self {
        Self {
            price,
            index,
            open_time,
        }
    }

    /// Same point in time, different price
    #[inline]
    pub fn with_price(self, price: f64) -> Self {
        Self { price, ..self }
    }
}

/// Trade direction of a setup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Bullish,
    Bearish,
}

impl Direction {
    #[inline]
    pub fn is_bullish(self) -> bool {
        matches!(self, Direction::Bullish)
    }

    #[inline]
    pub fn is_bearish(self) -> bool {
        matches!(self, Direction::Bearish)
    }

    /// +1.0 for bullish, -1.0 for bearish
    #[inline]
    pub fn sign(self) -> f64 {
        match self {
            Direction::Bullish => 1.0,
            Direction::Bearish => -1.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Bullish => "long",
            Direction::Bearish => "short",
        }
    }
}

// ============================================================
// PATTERN CANDIDATE
// ============================================================

/// Pattern family a candidate comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternFamily {
    Harmonic,
    Impulse,
    Speed,
    PriceAction,
}

impl PatternFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            PatternFamily::Harmonic => "harmonic",
            PatternFamily::Impulse => "impulse",
            PatternFamily::Speed => "speed",
            PatternFamily::PriceAction => "price_action",
        }
    }
}

/// Family-specific part of a candidate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum SignalPayload {
    /// Vertices are the candidate's `legs` (X, A, B, C, D)
    Harmonic {
        /// Mean closeness of every leg ratio to its band centre, 0.0..=1.0
        accuracy: f64,
        /// Second, more distant target (informational)
        take_profit_2: f64,
    },
    /// Waves are the candidate's `legs` (origin and five wave ends)
    Impulse {
        /// Price where the correction triggers the entry
        trigger: f64,
        /// Wave 4 duration over wave 2 duration
        duration_ratio: f64,
    },
    Speed {
        /// Major-window speed, percent per window
        major: f64,
        /// Minor-window speed, percent per window
        minor: f64,
    },
    /// Legs are the protective extreme and the entry close
    PriceAction {
        shape: CandleShape,
        /// Bars that make up the shape
        bars: usize,
    },
}

impl SignalPayload {
    pub fn family(&self) -> PatternFamily {
        match self {
            SignalPayload::Harmonic { .. } => PatternFamily::Harmonic,
            SignalPayload::Impulse { .. } => PatternFamily::Impulse,
            SignalPayload::Speed { .. } => PatternFamily::Speed,
            SignalPayload::PriceAction { .. } => PatternFamily::PriceAction,
        }
    }
}

/// A matched pattern with its trade levels. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternCandidate {
    pub name: String,
    pub direction: Direction,
    /// Pattern vertices in time order
    pub legs: Vec<Level>,
    pub entry: Level,
    pub take_profit: Level,
    pub stop_loss: Level,
    pub payload: SignalPayload,
}

impl PatternCandidate {
    #[inline]
    pub fn family(&self) -> PatternFamily {
        self.payload.family()
    }

    /// Quality score used to rank simultaneous matches
    pub fn accuracy(&self) -> f64 {
        match self.payload {
            SignalPayload::Harmonic { accuracy, .. } => accuracy,
            _ => 1.0,
        }
    }

    /// Time of the vertex that completed the pattern. Used to never signal
    /// the same pattern twice, including across restarts.
    pub fn anchor_time(&self) -> DateTime<Utc> {
        self.legs
            .last()
            .map(|l| l.open_time)
            .unwrap_or(self.entry.open_time)
    }

    /// True when `price` already reached the target or the stop
    pub fn is_stale_at(&self, price: f64) -> bool {
        let sign = self.direction.sign();
        sign * (price - self.take_profit.price) >= 0.0 || sign * (price - self.stop_loss.price) <= 0.0
    }
}

// ============================================================
// BAR SOURCE
// ============================================================

/// Indexed access to an instrument's bar history
pub trait BarsProvider {
    fn count(&self) -> usize;

    /// First index with enough history behind it to run the tracker
    fn start_index_limit(&self) -> usize {
        0
    }

    fn open_time(&self, index: usize) -> Option<DateTime<Utc>>;
    fn open(&self, index: usize) -> Option<f64>;
    fn high(&self, index: usize) -> Option<f64>;
    fn low(&self, index: usize) -> Option<f64>;
    fn close(&self, index: usize) -> Option<f64>;

    fn bar(&self, index: usize) -> Option<Bar> {
        Some(Bar::new(
            index,
            self.open_time(index)?,
            self.open(index)?,
            self.high(index)?,
            self.low(index)?,
            self.close(index)?,
        ))
    }
}

/// In-memory bar history
#[derive(Debug, Clone, Default)]
pub struct VecBars {
    bars: Vec<Bar>,
    start_index_limit: usize,
}

impl VecBars {
    pub fn new(bars: Vec<Bar>) -> Self {
        Self {
            bars,
            start_index_limit: 0,
        }
    }

    pub fn with_start_index_limit(mut self, limit: usize) -> Self {
        self.start_index_limit = limit;
        self
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }
}

impl BarsProvider for VecBars {
    fn count(&self) -> usize {
        self.bars.len()
    }

    fn start_index_limit(&self) -> usize {
        self.start_index_limit
    }

    fn open_time(&self, index: usize) -> Option<DateTime<Utc>> {
        self.bars.get(index).map(|b| b.open_time)
    }

    fn open(&self, index: usize) -> Option<f64> {
        self.bars.get(index).map(|b| b.open)
    }

    fn high(&self, index: usize) -> Option<f64> {
        self.bars.get(index).map(|b| b.high)
    }

    fn low(&self, index: usize) -> Option<f64> {
        self.bars.get(index).map(|b| b.low)
    }

    fn close(&self, index: usize) -> Option<f64> {
        self.bars.get(index).map(|b| b.close)
    }

    fn bar(&self, index: usize) -> Option<Bar> {
        self.bars.get(index).copied()
    }
}

// ============================================================
// PARALLEL REPLAY
// ============================================================

use rayon::prelude::*;

use finder::{FinderConfig, SetupFinder};

/// One instrument to replay
#[derive(Debug, Clone, Copy)]
pub struct ReplayJob<'a> {
    pub symbol: &'a str,
    pub time_frame: &'a str,
    pub config: &'a FinderConfig,
    pub bars: &'a [Bar],
}

/// Events produced by replaying a single instrument
#[derive(Debug)]
pub struct ReplayResult {
    pub symbol: String,
    pub events: Vec<SetupEvent>,
}

/// Error from replaying a single instrument
#[derive(Debug)]
pub struct ReplayError {
    pub symbol: String,
    pub error: SetupError,
}

/// Replay independent instruments on the rayon pool, one fresh finder each
pub fn replay_parallel<'a, I>(jobs: I) -> (Vec<ReplayResult>, Vec<ReplayError>)
where
    I: IntoParallelIterator<Item = ReplayJob<'a>>,
{
    let results: Vec<_> = jobs
        .into_par_iter()
        .map(|job| {
            let run = || -> Result<Vec<SetupEvent>> {
                let mut finder = SetupFinder::builder(job.symbol, job.time_frame)
                    .config(job.config.clone())
                    .build()?;
                let mut events = Vec::new();
                for bar in job.bars {
                    events.extend(finder.check_bar(bar)?);
                }
                Ok(events)
            };
            run()
                .map(|events| ReplayResult {
                    symbol: job.symbol.to_string(),
                    events,
                })
                .map_err(|error| ReplayError {
                    symbol: job.symbol.to_string(),
                    error,
                })
        })
        .collect();

    let mut successes = Vec::new();
    let mut errors = Vec::new();

    for result in results {
        match result {
            Ok(r) => successes.push(r),
            Err(e) => errors.push(e),
        }
    }

    (successes, errors)
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(i: usize) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + i as i64 * 3600, 0).unwrap()
    }

    fn bar(i: usize, o: f64, h: f64, l: f64, c: f64) -> Bar {
        Bar::new(i, t(i), o, h, l, c)
    }

    #[test]
    fn test_ratio_validation() {
        assert!(Ratio::new(0.5).is_ok());
        assert!(Ratio::new(0.0).is_ok());
        assert!(Ratio::new(1.0).is_ok());
        assert!(Ratio::new(-0.1).is_err());
        assert!(Ratio::new(1.1).is_err());
        assert!(Ratio::new(f64::NAN).is_err());
    }

    #[test]
    fn test_percent_validation() {
        assert!(Percent::new(0.0).is_ok());
        assert!(Percent::new(100.0).is_ok());
        assert!((Percent::new(5.0).unwrap().fraction() - 0.05).abs() < f64::EPSILON);
        assert!(Percent::new(100.5).is_err());
        assert!(Percent::new(-1.0).is_err());
        assert!(Percent::new(f64::INFINITY).is_err());
    }

    #[test]
    fn test_percent_deserialize_validates() {
        let ok: Percent = serde_json::from_str("12.5").unwrap();
        assert_eq!(ok.get(), 12.5);
        assert!(serde_json::from_str::<Percent>("150").is_err());
    }

    #[test]
    fn test_period_validation() {
        assert!(Period::new(1).is_ok());
        assert!(Period::new(0).is_err());
    }

    #[test]
    fn test_bar_validation() {
        assert!(bar(0, 10.0, 11.0, 9.0, 10.5).validate().is_ok());
        assert!(matches!(
            bar(0, 10.0, 9.0, 11.0, 10.5).validate(),
            Err(SetupError::InvalidBar { reason: "high < low", .. })
        ));
        assert!(bar(0, f64::NAN, 11.0, 9.0, 10.5).validate().is_err());
    }

    #[test]
    fn test_ohlcv_ext() {
        let b = bar(3, 10.0, 12.0, 9.0, 11.0);
        assert_eq!(b.range(), 3.0);
        assert_eq!(b.body(), 1.0);
        assert_eq!((b.body_low(), b.body_high()), (10.0, 11.0));
        assert!(b.is_bullish());
        assert!(!b.is_bearish());
        assert!(b.spans(9.0));
        assert!(b.spans(12.0));
        assert!(!b.spans(12.5));
    }

    #[test]
    fn test_direction_sign() {
        assert_eq!(Direction::Bullish.sign(), 1.0);
        assert_eq!(Direction::Bearish.sign(), -1.0);
        assert!(Direction::Bearish.is_bearish());
    }

    #[test]
    fn test_candidate_staleness() {
        let at = Level::new(100.0, 5, t(5));
        let candidate = PatternCandidate {
            name: "test".into(),
            direction: Direction::Bullish,
            legs: vec![at],
            entry: at,
            take_profit: at.with_price(110.0),
            stop_loss: at.with_price(95.0),
            payload: SignalPayload::Speed {
                major: 2.0,
                minor: 1.0,
            },
        };
        assert!(!candidate.is_stale_at(105.0));
        assert!(candidate.is_stale_at(110.0));
        assert!(candidate.is_stale_at(94.0));
        assert_eq!(candidate.family(), PatternFamily::Speed);
        assert_eq!(candidate.anchor_time(), t(5));
    }

    #[test]
    fn test_vec_bars_provider() {
        let provider =
            VecBars::new(vec![bar(0, 1.0, 2.0, 0.5, 1.5), bar(1, 1.5, 2.5, 1.0, 2.0)])
                .with_start_index_limit(1);
        assert_eq!(provider.count(), 2);
        assert_eq!(provider.start_index_limit(), 1);
        assert_eq!(provider.high(1), Some(2.5));
        assert_eq!(provider.bar(1).map(|b| b.close), Some(2.0));
        assert!(provider.bar(2).is_none());
    }

    #[test]
    fn test_parallel_replay() {
        let bars: Vec<Bar> = (0..50)
            .map(|i| {
                let p = 100.0 + (i as f64 * 0.7).sin() * 5.0;
                bar(i, p, p + 0.5, p - 0.5, p)
            })
            .collect();
        let config = FinderConfig::default();
        let jobs = vec![
            ReplayJob {
                symbol: "AAA",
                time_frame: "H1",
                config: &config,
                bars: &bars,
            },
            ReplayJob {
                symbol: "BBB",
                time_frame: "H1",
                config: &config,
                bars: &bars[..10],
            },
        ];

        let (results, errors) = replay_parallel(jobs);
        assert_eq!(results.len(), 2);
        assert!(errors.is_empty());
    }

    #[test]
    fn test_parallel_replay_reports_out_of_order() {
        let bars = vec![bar(1, 1.0, 1.0, 1.0, 1.0), bar(0, 1.0, 1.0, 1.0, 1.0)];
        let config = FinderConfig::default();
        let jobs = vec![ReplayJob {
            symbol: "BAD",
            time_frame: "M5",
            config: &config,
            bars: &bars,
        }];

        let (results, errors) = replay_parallel(jobs);
        assert!(results.is_empty());
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].symbol, "BAD");
        assert!(matches!(errors[0].error, SetupError::OutOfOrderBar { .. }));
    }
}
