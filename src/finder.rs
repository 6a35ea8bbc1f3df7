//! Per-instrument setup state machine
//!
//! A [`SetupFinder`] consumes one instrument's bars in order, runs the
//! extremum tracker and the configured matcher, and follows at most one setup
//! at a time:
//!
//! ```text
//! Searching --candidate--> InSetup --target--> TookProfit --> Searching
//!     |                     |  \------stop----> HitStop    --> Searching
//!     |                     \--breakeven--> InSetup (stop at entry)
//!     \--impulse--> AwaitingTrigger --trigger--> InSetup
//!                        \--cancelled--> Searching
//! ```
//!
//! Every transition is committed to the shared [`StateBook`] so a restarted
//! finder resumes an active or pending setup instead of signalling it again.
//! A commit that fails is reported as [`SetupError::NotPersisted`], carrying
//! the events that were already delivered.

use std::{
    collections::HashMap,
    fmt,
    path::PathBuf,
    sync::{mpsc, Arc},
};

use chrono::{DateTime, Utc};
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    extremum::{ExtremumTracker, TrackerConfig},
    matchers::{
        harmonic, impulse::try_match_impulse, HarmonicConfig, ImpulseConfig, PriceActionConfig,
        PriceActionMatcher, SpeedConfig, SpeedMatcher,
    },
    params::{check_known, Parameterized},
    store::{InstrumentState, StateBook},
    Bar, BarsProvider, Direction, Level, OHLCVExt, PatternCandidate, PatternFamily, Ratio, Result,
    SetupError,
};

// ============================================================
// CONFIGURATION
// ============================================================

/// Matcher a finder runs, with its configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum DetectorConfig {
    Harmonic(HarmonicConfig),
    Impulse(ImpulseConfig),
    Speed(SpeedConfig),
    PriceAction(PriceActionConfig),
}

impl Default for DetectorConfig {
    fn default() -> Self {
        DetectorConfig::Harmonic(HarmonicConfig::default())
    }
}

impl DetectorConfig {
    pub fn family(&self) -> PatternFamily {
        match self {
            DetectorConfig::Harmonic(_) => PatternFamily::Harmonic,
            DetectorConfig::Impulse(_) => PatternFamily::Impulse,
            DetectorConfig::Speed(_) => PatternFamily::Speed,
            DetectorConfig::PriceAction(_) => PatternFamily::PriceAction,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            DetectorConfig::Harmonic(c) => c.validate(),
            DetectorConfig::Impulse(c) => c.validate(),
            DetectorConfig::Speed(c) => c.validate(),
            DetectorConfig::PriceAction(c) => c.validate(),
        }
    }

    /// Same family, scalar parameters replaced. Parameters not named take
    /// their defaults; the pattern table, impulse rules, reversal exit and
    /// candle shapes are kept.
    pub fn with_params(&self, params: &HashMap<&str, f64>) -> Result<Self> {
        Ok(match self {
            DetectorConfig::Harmonic(current) => {
                check_known::<HarmonicConfig>(params)?;
                let mut config = HarmonicConfig::with_params(params)?;
                config.table = current.table.clone();
                DetectorConfig::Harmonic(config)
            }
            DetectorConfig::Impulse(current) => {
                check_known::<ImpulseConfig>(params)?;
                let mut config = ImpulseConfig::with_params(params)?;
                config.rules = current.rules.clone();
                DetectorConfig::Impulse(config)
            }
            DetectorConfig::Speed(current) => {
                check_known::<SpeedConfig>(params)?;
                let mut config = SpeedConfig::with_params(params)?;
                config.exit_on_reversal = current.exit_on_reversal;
                DetectorConfig::Speed(config)
            }
            DetectorConfig::PriceAction(current) => {
                check_known::<PriceActionConfig>(params)?;
                let mut config = PriceActionConfig::with_params(params)?;
                config.shapes = current.shapes.clone();
                DetectorConfig::PriceAction(config)
            }
        })
    }
}

/// Which level a bar that spans both target and stop is assumed to hit first
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntrabarPolicy {
    /// The level closer to the bar's open. Equal distances resolve to the stop.
    #[default]
    NearestToOpen,
    StopFirst,
    TargetFirst,
}

/// How one candidate is picked when several match on the same bar
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Highest accuracy; ties go to the earlier definition
    #[default]
    BestAccuracy,
    FirstInTable,
}

/// Everything a [`SetupFinder`] needs besides its instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinderConfig {
    pub tracker: TrackerConfig,
    pub detector: DetectorConfig,
    pub intrabar: IntrabarPolicy,
    pub selection: SelectionPolicy,
    /// Write the state book on every transition; otherwise only on `flush`
    pub persist_on_transition: bool,
    /// Move the stop to the entry once price covers this share of the way
    /// from entry to target
    pub breakeven_ratio: Option<Ratio>,
}

/// Parameter name that sets [`FinderConfig::breakeven_ratio`]; 0 turns it off
pub const BREAKEVEN_PARAM: &str = "breakeven_ratio";

impl Default for FinderConfig {
    fn default() -> Self {
        Self {
            tracker: TrackerConfig::default(),
            detector: DetectorConfig::default(),
            intrabar: IntrabarPolicy::default(),
            selection: SelectionPolicy::default(),
            persist_on_transition: true,
            breakeven_ratio: None,
        }
    }
}

impl FinderConfig {
    pub fn with_detector(detector: DetectorConfig) -> Self {
        Self {
            detector,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.tracker.validate()?;
        if let Some(ratio) = self.breakeven_ratio.filter(|r| r.get() <= 0.0) {
            return Err(SetupError::OutOfRange {
                field: BREAKEVEN_PARAM,
                value: ratio.get(),
                min: f64::EPSILON,
                max: 1.0,
            });
        }
        self.detector.validate()
    }

    /// Apply `name=value` overrides, routing each name to the tracker, the
    /// detector or the breakeven ratio. Unknown names are `InvalidConfig`.
    pub fn with_params(&self, params: &HashMap<&str, f64>) -> Result<Self> {
        let (tracker, detector): (HashMap<&str, f64>, HashMap<&str, f64>) = params
            .iter()
            .filter(|(k, _)| **k != BREAKEVEN_PARAM)
            .map(|(k, v)| (*k, *v))
            .partition(|(k, _)| TrackerConfig::accepts(k));

        let mut config = self.clone();
        if let Some(&ratio) = params.get(BREAKEVEN_PARAM) {
            config.breakeven_ratio = (ratio != 0.0).then(|| Ratio::new(ratio)).transpose()?;
        }
        if !tracker.is_empty() {
            config.tracker = TrackerConfig {
                basis: self.tracker.basis,
                ..TrackerConfig::with_params(&tracker)?
            };
        }
        if !detector.is_empty() {
            config.detector = self.detector.with_params(&detector)?;
        }
        config.validate()?;
        Ok(config)
    }
}

// ============================================================
// PHASES AND EVENTS
// ============================================================

/// Levels of the setup being followed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveSetup {
    pub signal_id: Option<Uuid>,
    pub family: Option<PatternFamily>,
    pub direction: Direction,
    pub entry: f64,
    pub take_profit: f64,
    pub stop_loss: f64,
    pub trigger_index: Option<usize>,
    pub trigger_time: Option<DateTime<Utc>>,
    /// The stop was moved to the entry
    pub breakeven: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Exit {
    TakeProfit(f64),
    StopLoss(f64),
}

impl ActiveSetup {
    fn from_candidate(candidate: &PatternCandidate, signal_id: Uuid, at: Level) -> Self {
        Self {
            signal_id: Some(signal_id),
            family: Some(candidate.family()),
            direction: candidate.direction,
            entry: candidate.entry.price,
            take_profit: candidate.take_profit.price,
            stop_loss: candidate.stop_loss.price,
            trigger_index: Some(at.index),
            trigger_time: Some(at.open_time),
            breakeven: false,
        }
    }

    fn from_state(state: &InstrumentState) -> Option<Self> {
        Some(Self {
            signal_id: state.setup_signal_id,
            family: state.setup_family,
            direction: state.active_direction()?,
            entry: state.trigger_level?,
            take_profit: state.setup_end_price?,
            stop_loss: state.setup_start_price?,
            trigger_index: state.trigger_bar_index,
            trigger_time: state.trigger_time,
            breakeven: state.breakeven,
        })
    }

    /// Bars at or before the trigger bar never resolve the setup. Time decides
    /// when known, since indices restart with every run.
    fn is_after_trigger(&self, index: usize, time: DateTime<Utc>) -> bool {
        match (self.trigger_time, self.trigger_index) {
            (Some(trigger), _) => time > trigger,
            (None, Some(trigger)) => index > trigger,
            (None, None) => true,
        }
    }

    fn exit_on_bar(&self, bar: &Bar, policy: IntrabarPolicy) -> Option<Exit> {
        let sign = self.direction.sign();
        let (favourable, adverse) = extremes(self.direction, bar);
        let target_hit = sign * (favourable - self.take_profit) >= 0.0;
        let stop_hit = sign * (adverse - self.stop_loss) <= 0.0;

        let target_first = match (target_hit, stop_hit) {
            (false, false) => return None,
            (true, false) => true,
            (false, true) => false,
            (true, true) => match policy {
                IntrabarPolicy::StopFirst => false,
                IntrabarPolicy::TargetFirst => true,
                IntrabarPolicy::NearestToOpen => {
                    (bar.open - self.take_profit).abs() < (bar.open - self.stop_loss).abs()
                }
            },
        };
        Some(if target_first {
            Exit::TakeProfit(self.take_profit)
        } else {
            Exit::StopLoss(self.stop_loss)
        })
    }

    /// Price at `ratio` of the way from entry to target
    pub fn breakeven_level(&self, ratio: Ratio) -> f64 {
        self.entry + (self.take_profit - self.entry) * ratio.get()
    }

    fn reaches_breakeven(&self, bar: &Bar, ratio: Ratio) -> bool {
        let (favourable, _) = extremes(self.direction, bar);
        !self.breakeven && self.direction.sign() * (favourable - self.breakeven_level(ratio)) >= 0.0
    }
}

/// (high, low) for longs, (low, high) for shorts
#[inline]
fn extremes(direction: Direction, bar: &Bar) -> (f64, f64) {
    match direction {
        Direction::Bullish => (bar.high, bar.low),
        Direction::Bearish => (bar.low, bar.high),
    }
}

/// An impulse found but not yet entered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSetup {
    pub signal_id: Uuid,
    pub candidate: PatternCandidate,
    pub found_index: usize,
    /// Only input after this time can trigger or cancel it
    pub found_time: DateTime<Utc>,
}

/// Where a finder is in a setup's lifecycle
#[derive(Debug, Clone, PartialEq)]
pub enum SetupPhase {
    Searching,
    /// Impulse found; waiting for the correction to reach the entry
    AwaitingTrigger(PendingSetup),
    InSetup(ActiveSetup),
}

impl SetupPhase {
    pub fn name(&self) -> &'static str {
        match self {
            SetupPhase::Searching => "searching",
            SetupPhase::AwaitingTrigger(_) => "awaiting_trigger",
            SetupPhase::InSetup(_) => "in_setup",
        }
    }

    #[inline]
    pub fn is_searching(&self) -> bool {
        matches!(self, SetupPhase::Searching)
    }

    #[inline]
    pub fn is_in_setup(&self) -> bool {
        matches!(self, SetupPhase::InSetup(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnteredSetup {
    pub symbol: String,
    pub time_frame: String,
    /// Stable across restarts for the same pattern
    pub signal_id: Uuid,
    pub bar_index: usize,
    pub open_time: DateTime<Utc>,
    pub candidate: PatternCandidate,
}

/// How an active setup ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub symbol: String,
    pub time_frame: String,
    pub signal_id: Option<Uuid>,
    pub family: Option<PatternFamily>,
    pub direction: Direction,
    pub entry: f64,
    /// Exit price, pinned to the bar that resolved the setup
    pub level: Level,
}

/// A pending setup dropped before its trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cancellation {
    pub symbol: String,
    pub time_frame: String,
    pub signal_id: Uuid,
    pub reason: String,
    /// Close of the input that cancelled it
    pub level: Level,
}

/// The stop of an active setup moved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopMoved {
    pub symbol: String,
    pub time_frame: String,
    pub signal_id: Option<Uuid>,
    pub entry: f64,
    /// New stop, pinned to the input that moved it
    pub stop_loss: Level,
}

/// Lifecycle notification.
///
/// An `Entered` is always followed by exactly one `TookProfit` or `HitStop`
/// before the next `Entered`, with at most one `Breakeven` in between. A
/// `Pending` is followed by either `Entered` or `Canceled`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SetupEvent {
    Pending(EnteredSetup),
    Canceled(Cancellation),
    Entered(EnteredSetup),
    Breakeven(StopMoved),
    TookProfit(Resolution),
    HitStop(Resolution),
}

impl SetupEvent {
    pub fn symbol(&self) -> &str {
        match self {
            SetupEvent::Pending(e) | SetupEvent::Entered(e) => &e.symbol,
            SetupEvent::Canceled(c) => &c.symbol,
            SetupEvent::Breakeven(m) => &m.symbol,
            SetupEvent::TookProfit(r) | SetupEvent::HitStop(r) => &r.symbol,
        }
    }

    /// Tag used in the serialized form
    pub fn kind(&self) -> &'static str {
        match self {
            SetupEvent::Pending(_) => "pending",
            SetupEvent::Canceled(_) => "canceled",
            SetupEvent::Entered(_) => "entered",
            SetupEvent::Breakeven(_) => "breakeven",
            SetupEvent::TookProfit(_) => "took_profit",
            SetupEvent::HitStop(_) => "hit_stop",
        }
    }

    /// Ends a setup's lifecycle, entered or pending
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SetupEvent::Canceled(_) | SetupEvent::TookProfit(_) | SetupEvent::HitStop(_)
        )
    }
}

/// Receives every event a finder emits, in order
pub trait EventSink: Send {
    fn deliver(&mut self, event: &SetupEvent);
}

impl<F> EventSink for F
where
    F: FnMut(&SetupEvent) + Send,
{
    fn deliver(&mut self, event: &SetupEvent) {
        self(event)
    }
}

/// Forwards events to a channel
#[derive(Debug, Clone)]
pub struct ChannelSink(pub mpsc::Sender<SetupEvent>);

impl EventSink for ChannelSink {
    fn deliver(&mut self, event: &SetupEvent) {
        if self.0.send(event.clone()).is_err() {
            trace!("event receiver for {} is gone", event.symbol());
        }
    }
}

/// Deterministic id of a signal: the same pattern on the same instrument
/// always gets the same id
pub fn signal_id(symbol: &str, time_frame: &str, candidate: &PatternCandidate) -> Uuid {
    let name = format!(
        "{}|{}|{}|{}|{}",
        symbol,
        time_frame,
        candidate.family().as_str(),
        candidate.name,
        candidate.anchor_time().to_rfc3339()
    );
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
}

// ============================================================
// BUILDER
// ============================================================

pub struct FinderBuilder {
    symbol: String,
    time_frame: String,
    config: FinderConfig,
    book: Option<Arc<StateBook>>,
    state: Option<InstrumentState>,
    sinks: Vec<Box<dyn EventSink>>,
}

impl FinderBuilder {
    pub fn config(mut self, config: FinderConfig) -> Self {
        self.config = config;
        self
    }

    /// Load this instrument's state from `book` and commit every transition
    /// to it. A book holds one finder per symbol at a time.
    pub fn state_book(mut self, book: Arc<StateBook>) -> Self {
        self.book = Some(book);
        self
    }

    /// Start from `state` instead of the book's record
    pub fn state(mut self, state: InstrumentState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn sink(mut self, sink: impl EventSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn build(self) -> Result<SetupFinder> {
        self.config.validate()?;

        let location = self
            .book
            .as_ref()
            .map(|b| b.location())
            .unwrap_or_else(|| PathBuf::from("<memory>"));
        let mut state = self
            .state
            .or_else(|| self.book.as_ref().and_then(|b| b.get(&self.symbol)))
            .unwrap_or_else(|| InstrumentState::new(&self.symbol, &self.time_frame));
        state.symbol.clone_from(&self.symbol);
        if state.time_frame.is_empty() {
            state.time_frame.clone_from(&self.time_frame);
        }
        state.validate(&location)?;

        let phase = if state.is_in_setup {
            let active = ActiveSetup::from_state(&state).ok_or_else(|| SetupError::CorruptState {
                path: location.clone(),
                reason: format!("[{}] active setup without levels", self.symbol),
            })?;
            info!(
                "[{} {}] resuming {} setup: entry {:.5}, tp {:.5}, sl {:.5}",
                self.symbol,
                self.time_frame,
                active.direction.as_str(),
                active.entry,
                active.take_profit,
                active.stop_loss
            );
            SetupPhase::InSetup(active)
        } else if let Some(pending) = state.pending.clone() {
            if pending.candidate.family() == self.config.detector.family() {
                info!(
                    "[{} {}] resuming pending {} at {:.5}",
                    self.symbol, self.time_frame, pending.candidate.name, pending.candidate.entry.price
                );
                SetupPhase::AwaitingTrigger(pending)
            } else {
                debug!(
                    "[{} {}] dropping pending {} from another detector",
                    self.symbol, self.time_frame, pending.candidate.name
                );
                state.pending = None;
                SetupPhase::Searching
            }
        } else {
            SetupPhase::Searching
        };

        let speed = match &self.config.detector {
            DetectorConfig::Speed(c) => Some(SpeedMatcher::new(c.clone())),
            _ => None,
        };
        let candles = match &self.config.detector {
            DetectorConfig::PriceAction(c) => Some(PriceActionMatcher::new(c.clone())),
            _ => None,
        };

        // Last step: a failed build must not hold the claim
        if let Some(book) = &self.book {
            book.claim(&self.symbol)?;
        }

        Ok(SetupFinder {
            tracker: ExtremumTracker::new(self.config.tracker.clone()),
            speed,
            candles,
            phase,
            state,
            symbol: self.symbol,
            time_frame: self.time_frame,
            config: self.config,
            book: self.book,
            sinks: self.sinks,
            last_bar: None,
            last_tick: None,
            dirty: false,
        })
    }
}

// ============================================================
// SETUP FINDER
// ============================================================

/// One instrument, one pattern configuration, at most one active setup
pub struct SetupFinder {
    symbol: String,
    time_frame: String,
    config: FinderConfig,
    tracker: ExtremumTracker,
    speed: Option<SpeedMatcher>,
    candles: Option<PriceActionMatcher>,
    phase: SetupPhase,
    state: InstrumentState,
    book: Option<Arc<StateBook>>,
    sinks: Vec<Box<dyn EventSink>>,
    last_bar: Option<(usize, DateTime<Utc>)>,
    last_tick: Option<DateTime<Utc>>,
    /// State changed since the last successful write
    dirty: bool,
}

impl SetupFinder {
    pub fn builder(symbol: impl Into<String>, time_frame: impl Into<String>) -> FinderBuilder {
        FinderBuilder {
            symbol: symbol.into(),
            time_frame: time_frame.into(),
            config: FinderConfig::default(),
            book: None,
            state: None,
            sinks: Vec::new(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn time_frame(&self) -> &str {
        &self.time_frame
    }

    pub fn config(&self) -> &FinderConfig {
        &self.config
    }

    pub fn state(&self) -> &InstrumentState {
        &self.state
    }

    pub fn phase(&self) -> &SetupPhase {
        &self.phase
    }

    pub fn tracker(&self) -> &ExtremumTracker {
        &self.tracker
    }

    pub fn speed(&self) -> Option<&SpeedMatcher> {
        self.speed.as_ref()
    }

    /// Process one completed bar.
    ///
    /// Returns the events this bar produced, in order. Bars must arrive with
    /// increasing index and non-decreasing open time; anything else is
    /// `OutOfOrderBar` and leaves the finder untouched. When the state book
    /// rejects the write the events were still delivered and come back inside
    /// `NotPersisted`.
    pub fn check_bar(&mut self, bar: &Bar) -> Result<Vec<SetupEvent>> {
        self.accept_bar(bar)?;
        let confirmed = self.tracker.observe(bar).is_some();
        if let Some(speed) = &mut self.speed {
            speed.observe(bar.index, bar.open_time, bar.close);
        }
        if let Some(candles) = &mut self.candles {
            candles.observe(bar);
        }

        let mut events = Vec::new();
        match self.phase.clone() {
            SetupPhase::InSetup(active) => {
                events.extend(self.resolve_bar(bar, &active));
            }
            SetupPhase::AwaitingTrigger(pending) => {
                events.extend(self.check_trigger(bar, &pending, confirmed));
            }
            SetupPhase::Searching => {}
        }

        let searched = if self.phase.is_searching() {
            self.search(bar, confirmed)
        } else {
            if confirmed && self.phase.is_in_setup() {
                trace!("[{} {}] swing confirmed while in setup", self.symbol, self.time_frame);
            }
            Ok(None)
        };

        match searched {
            Ok(found) => {
                events.extend(found);
                self.publish(events)
            }
            Err(e) => {
                // Transitions of this bar still reach the sinks and the book
                self.publish(events)?;
                Err(e)
            }
        }
    }

    /// Follow a single price between bars: resolves an active setup, moves its
    /// stop, or triggers and cancels a pending one. Never starts a search.
    pub fn check_tick(&mut self, time: DateTime<Utc>, price: f64) -> Result<Vec<SetupEvent>> {
        let index = self.last_bar.map_or(0, |(i, _)| i + 1);
        let last = self.last_tick.max(self.last_bar.map(|(_, t)| t));
        if let Some(last_time) = last.filter(|&t| time < t) {
            return Err(self.out_of_order(index, time, last_time));
        }
        if !price.is_finite() {
            return Err(SetupError::InvalidBar {
                index,
                reason: "non-finite tick price",
            });
        }
        self.last_tick = Some(time);
        if let Some(speed) = &mut self.speed {
            speed.observe(index, time, price);
        }

        let tick = Bar::new(index, time, price, price, price, price);
        let mut events = Vec::new();
        match self.phase.clone() {
            SetupPhase::InSetup(active) => events.extend(self.resolve_bar(&tick, &active)),
            SetupPhase::AwaitingTrigger(pending) => {
                events.extend(self.check_trigger(&tick, &pending, false))
            }
            SetupPhase::Searching => {}
        }
        self.publish(events)
    }

    /// Feed history without matching. Only follows a setup that was already
    /// active or pending, e.g. one restored from the state book.
    pub fn warm_up(&mut self, bars: &[Bar]) -> Result<Vec<SetupEvent>> {
        let mut events = Vec::new();
        for bar in bars {
            self.accept_bar(bar)?;
            let confirmed = self.tracker.observe(bar).is_some();
            if let Some(speed) = &mut self.speed {
                speed.observe(bar.index, bar.open_time, bar.close);
            }
            if let Some(candles) = &mut self.candles {
                candles.observe(bar);
            }
            match self.phase.clone() {
                SetupPhase::InSetup(active) => events.extend(self.resolve_bar(bar, &active)),
                SetupPhase::AwaitingTrigger(pending) => {
                    events.extend(self.check_trigger(bar, &pending, confirmed))
                }
                SetupPhase::Searching => {}
            }
        }
        debug!(
            "[{} {}] warmed up on {} bars, {} swings",
            self.symbol,
            self.time_frame,
            bars.len(),
            self.tracker.confirmed().len()
        );
        self.publish(events)
    }

    /// Feed every bar of `bars` from its start index limit
    pub fn replay<B: BarsProvider + ?Sized>(&mut self, bars: &B) -> Result<Vec<SetupEvent>> {
        let mut events = Vec::new();
        for index in bars.start_index_limit()..bars.count() {
            let bar = bars.bar(index).ok_or(SetupError::InvalidBar {
                index,
                reason: "missing bar",
            })?;
            match self.check_bar(&bar) {
                Ok(found) => events.extend(found),
                Err(SetupError::NotPersisted {
                    symbol,
                    events: found,
                    source,
                }) => {
                    events.extend(found);
                    return Err(SetupError::NotPersisted {
                        symbol,
                        events,
                        source,
                    });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(events)
    }

    /// Record that a consumer delivered signal `id`
    pub fn acknowledge(&mut self, id: Uuid) -> Result<()> {
        self.state.last_signal_id = Some(id.to_string());
        self.dirty = true;
        self.persist()
    }

    /// Write this instrument's state to the book's store now
    pub fn flush(&mut self) -> Result<()> {
        if let Some(book) = &self.book {
            book.commit(&self.state, true)?;
        }
        self.dirty = false;
        Ok(())
    }

    // ------------------------------------------------------------

    fn out_of_order(&self, index: usize, time: DateTime<Utc>, last_time: DateTime<Utc>) -> SetupError {
        warn!(
            "[{} {}] rejected out-of-order input at {} (index {})",
            self.symbol, self.time_frame, time, index
        );
        SetupError::OutOfOrderBar {
            symbol: self.symbol.clone(),
            index,
            open_time: time,
            last_index: self.last_bar.map_or(0, |(i, _)| i),
            last_open_time: last_time,
        }
    }

    fn accept_bar(&mut self, bar: &Bar) -> Result<()> {
        if let Some((last_index, last_time)) = self.last_bar {
            if bar.index <= last_index || bar.open_time < last_time {
                return Err(self.out_of_order(bar.index, bar.open_time, last_time));
            }
        }
        bar.validate().map_err(|e| match e {
            SetupError::InvalidBar { reason, .. } => SetupError::InvalidBar {
                index: bar.index,
                reason,
            },
            other => other,
        })?;
        self.last_bar = Some((bar.index, bar.open_time));
        Ok(())
    }

    fn search(&mut self, bar: &Bar, confirmed: bool) -> Result<Option<SetupEvent>> {
        let candidates = match &self.config.detector {
            DetectorConfig::Harmonic(c) if confirmed => {
                harmonic::try_match(self.tracker.confirmed(), c)?
            }
            DetectorConfig::Impulse(c) if confirmed => {
                try_match_impulse(self.tracker.confirmed(), c)?
            }
            DetectorConfig::Speed(_) => match &self.speed {
                Some(speed) => speed.try_match(bar.level(bar.close))?,
                None => return Ok(None),
            },
            DetectorConfig::PriceAction(_) => match &self.candles {
                Some(candles) => candles.try_match()?,
                None => return Ok(None),
            },
            _ => return Ok(None),
        };

        let Some(candidate) = self.select(candidates, bar) else {
            return Ok(None);
        };

        if candidate.family() == PatternFamily::Impulse {
            return Ok(Some(self.await_trigger(bar, candidate)));
        }
        Ok(Some(self.enter(bar.level(bar.close), candidate)))
    }

    /// Drop already signalled and stale candidates, then apply the selection policy
    fn select(&self, candidates: Vec<PatternCandidate>, bar: &Bar) -> Option<PatternCandidate> {
        let fresh: Vec<PatternCandidate> = candidates
            .into_iter()
            .filter(|c| {
                if self.state.last_pattern_time.is_some_and(|t| c.anchor_time() <= t) {
                    debug!(
                        "[{} {}] {} at {} already signalled",
                        self.symbol,
                        self.time_frame,
                        c.name,
                        c.anchor_time()
                    );
                    return false;
                }
                // An impulse entry lies ahead of price, so only the others can be stale
                if c.family() != PatternFamily::Impulse && c.is_stale_at(bar.close) {
                    warn!(
                        "[{} {}] {} is stale: close {:.5} already past tp {:.5} or sl {:.5}",
                        self.symbol,
                        self.time_frame,
                        c.name,
                        bar.close,
                        c.take_profit.price,
                        c.stop_loss.price
                    );
                    return false;
                }
                true
            })
            .collect();

        let mut best = 0;
        if self.config.selection == SelectionPolicy::BestAccuracy {
            for (i, c) in fresh.iter().enumerate().skip(1) {
                if c.accuracy() > fresh[best].accuracy() {
                    best = i;
                }
            }
        }
        for (i, c) in fresh.iter().enumerate() {
            if i != best {
                debug!(
                    "[{} {}] also matched {} (accuracy {:.3})",
                    self.symbol,
                    self.time_frame,
                    c.name,
                    c.accuracy()
                );
            }
        }
        fresh.into_iter().nth(best)
    }

    fn await_trigger(&mut self, bar: &Bar, candidate: PatternCandidate) -> SetupEvent {
        let id = signal_id(&self.symbol, &self.time_frame, &candidate);
        info!(
            "[{} {}] {} {} found, waiting for {:.5} ({})",
            self.symbol,
            self.time_frame,
            candidate.name,
            candidate.direction.as_str(),
            candidate.entry.price,
            id
        );
        let pending = PendingSetup {
            signal_id: id,
            candidate,
            found_index: bar.index,
            found_time: bar.open_time,
        };
        self.state.pending = Some(pending.clone());
        self.state.last_pattern_time = Some(pending.candidate.anchor_time());
        self.dirty = true;

        let event = SetupEvent::Pending(EnteredSetup {
            symbol: self.symbol.clone(),
            time_frame: self.time_frame.clone(),
            signal_id: id,
            bar_index: bar.index,
            open_time: bar.open_time,
            candidate: pending.candidate.clone(),
        });
        self.phase = SetupPhase::AwaitingTrigger(pending);
        event
    }

    fn check_trigger(
        &mut self,
        bar: &Bar,
        pending: &PendingSetup,
        confirmed: bool,
    ) -> Option<SetupEvent> {
        if bar.open_time <= pending.found_time {
            return None;
        }
        let candidate = &pending.candidate;
        let sign = candidate.direction.sign();
        let (Some(origin), Some(end)) = (candidate.legs.first(), candidate.legs.last()) else {
            return Some(self.cancel(pending, bar, "impulse without legs"));
        };
        let (favourable, adverse) = extremes(candidate.direction, bar);
        let trigger = candidate.entry.price;

        let cancelled = if confirmed {
            Some("a newer swing was confirmed")
        } else if sign * (favourable - end.price) > 0.0 {
            Some("price went past the impulse end")
        } else if sign * (adverse - origin.price) <= 0.0 {
            Some("price breached the impulse origin")
        } else {
            None
        };
        if let Some(reason) = cancelled {
            return Some(self.cancel(pending, bar, reason));
        }

        if sign * (adverse - trigger) > 0.0 {
            return None;
        }
        // A gap through the trigger fills at the open
        let price = if sign * (bar.open - trigger) < 0.0 {
            bar.open
        } else {
            trigger
        };
        let triggered = PatternCandidate {
            entry: bar.level(price),
            ..candidate.clone()
        };
        Some(self.enter(bar.level(price), triggered))
    }

    fn cancel(&mut self, pending: &PendingSetup, bar: &Bar, reason: &str) -> SetupEvent {
        info!(
            "[{} {}] {} cancelled at bar {}: {}",
            self.symbol, self.time_frame, pending.candidate.name, bar.index, reason
        );
        self.state.pending = None;
        self.phase = SetupPhase::Searching;
        self.dirty = true;
        SetupEvent::Canceled(Cancellation {
            symbol: self.symbol.clone(),
            time_frame: self.time_frame.clone(),
            signal_id: pending.signal_id,
            reason: reason.to_string(),
            level: bar.level(bar.close),
        })
    }

    /// `at` is the input the setup is entered on; its index and time become
    /// the trigger
    fn enter(&mut self, at: Level, candidate: PatternCandidate) -> SetupEvent {
        let id = signal_id(&self.symbol, &self.time_frame, &candidate);
        let active = ActiveSetup::from_candidate(&candidate, id, at);

        let state = &mut self.state;
        state.is_in_setup = true;
        state.setup_start_index = Some(candidate.stop_loss.index);
        state.setup_start_price = Some(candidate.stop_loss.price);
        state.setup_end_index = Some(candidate.take_profit.index);
        state.setup_end_price = Some(candidate.take_profit.price);
        state.trigger_level = Some(candidate.entry.price);
        state.trigger_bar_index = Some(at.index);
        state.trigger_time = Some(at.open_time);
        state.last_pattern_time = Some(candidate.anchor_time());
        state.setup_signal_id = Some(id);
        state.setup_family = Some(candidate.family());
        state.setup_direction = Some(candidate.direction);
        state.breakeven = false;
        state.pending = None;

        info!(
            "[{} {}] entered {} {} at {:.5}, tp {:.5}, sl {:.5} ({})",
            self.symbol,
            self.time_frame,
            candidate.name,
            candidate.direction.as_str(),
            candidate.entry.price,
            candidate.take_profit.price,
            candidate.stop_loss.price,
            id
        );

        self.phase = SetupPhase::InSetup(active);
        self.dirty = true;
        SetupEvent::Entered(EnteredSetup {
            symbol: self.symbol.clone(),
            time_frame: self.time_frame.clone(),
            signal_id: id,
            bar_index: at.index,
            open_time: at.open_time,
            candidate,
        })
    }

    fn resolve_bar(&mut self, bar: &Bar, active: &ActiveSetup) -> Option<SetupEvent> {
        if !active.is_after_trigger(bar.index, bar.open_time) {
            return None;
        }
        match active
            .exit_on_bar(bar, self.config.intrabar)
            .or_else(|| self.reversal_exit(active, bar.close))
        {
            Some(exit) => Some(self.finish(active, exit, bar.level(bar.close))),
            None => self.move_to_breakeven(active, bar),
        }
    }

    /// Market exit for speed setups once the minor speed turns against them
    fn reversal_exit(&self, active: &ActiveSetup, close: f64) -> Option<Exit> {
        let DetectorConfig::Speed(config) = &self.config.detector else {
            return None;
        };
        if !config.exit_on_reversal || active.family != Some(PatternFamily::Speed) {
            return None;
        }
        let speed = self.speed.as_ref()?;
        if !speed.reversed_against(active.direction) {
            return None;
        }
        Some(if active.direction.sign() * (close - active.entry) > 0.0 {
            Exit::TakeProfit(close)
        } else {
            Exit::StopLoss(close)
        })
    }

    /// Stop to entry once the bar covered the configured share of the way to
    /// the target. Checked after the exits, so the bar that moves the stop
    /// never also hits it.
    fn move_to_breakeven(&mut self, active: &ActiveSetup, bar: &Bar) -> Option<SetupEvent> {
        let ratio = self.config.breakeven_ratio?;
        if !active.reaches_breakeven(bar, ratio) {
            return None;
        }
        info!(
            "[{} {}] {:.5} reached on bar {}, stop {:.5} -> {:.5}",
            self.symbol,
            self.time_frame,
            active.breakeven_level(ratio),
            bar.index,
            active.stop_loss,
            active.entry
        );

        self.state.setup_start_price = Some(active.entry);
        self.state.setup_start_index = Some(bar.index);
        self.state.breakeven = true;
        self.phase = SetupPhase::InSetup(ActiveSetup {
            stop_loss: active.entry,
            breakeven: true,
            ..active.clone()
        });
        self.dirty = true;
        Some(SetupEvent::Breakeven(StopMoved {
            symbol: self.symbol.clone(),
            time_frame: self.time_frame.clone(),
            signal_id: active.signal_id,
            entry: active.entry,
            stop_loss: bar.level(active.entry),
        }))
    }

    fn finish(&mut self, active: &ActiveSetup, exit: Exit, at: Level) -> SetupEvent {
        let (price, label) = match exit {
            Exit::TakeProfit(price) => (price, "took profit"),
            Exit::StopLoss(price) => (price, "hit stop"),
        };
        let resolution = Resolution {
            symbol: self.symbol.clone(),
            time_frame: self.time_frame.clone(),
            signal_id: active.signal_id,
            family: active.family,
            direction: active.direction,
            entry: active.entry,
            level: at.with_price(price),
        };
        info!(
            "[{} {}] {} at {:.5} on bar {} (entry {:.5})",
            self.symbol, self.time_frame, label, price, at.index, active.entry
        );

        self.state.clear_setup();
        self.phase = SetupPhase::Searching;
        self.dirty = true;
        match exit {
            Exit::TakeProfit(_) => SetupEvent::TookProfit(resolution),
            Exit::StopLoss(_) => SetupEvent::HitStop(resolution),
        }
    }

    /// Deliver `events` to every sink, then commit. The events are returned
    /// either way; a failed commit wraps them in `NotPersisted` and leaves the
    /// state dirty for the next call.
    fn publish(&mut self, events: Vec<SetupEvent>) -> Result<Vec<SetupEvent>> {
        for event in &events {
            for sink in &mut self.sinks {
                sink.deliver(event);
            }
        }
        match self.persist() {
            Ok(()) => Ok(events),
            Err(e) => Err(SetupError::NotPersisted {
                symbol: self.symbol.clone(),
                events,
                source: Box::new(e),
            }),
        }
    }

    fn persist(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let Some(book) = &self.book else {
            self.dirty = false;
            return Ok(());
        };
        let write = self.config.persist_on_transition;
        if let Err(e) = book.commit(&self.state, write) {
            warn!(
                "[{} {}] failed to persist state: {}",
                self.symbol, self.time_frame, e
            );
            return Err(e);
        }
        if write {
            self.dirty = false;
        }
        Ok(())
    }
}

impl Drop for SetupFinder {
    fn drop(&mut self) {
        if let Some(book) = &self.book {
            book.release(&self.symbol);
        }
    }
}

impl fmt::Debug for SetupFinder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetupFinder")
            .field("symbol", &self.symbol)
            .field("time_frame", &self.time_frame)
            .field("phase", &self.phase.name())
            .field("swings", &self.tracker.confirmed().len())
            .field("sinks", &self.sinks.len())
            .finish()
    }
}
