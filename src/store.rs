//! Per-instrument state that survives restarts
//!
//! Every [`SetupFinder`](crate::finder::SetupFinder) owns one [`InstrumentState`].
//! All instruments share one [`StateBook`], which holds the map of states and
//! the [`StateStore`] behind a single mutex, so a load or save never interleaves
//! with another write.

use std::{
    collections::{BTreeMap, HashSet},
    fs, io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use log::{debug, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{finder::PendingSetup, Direction, PatternFamily, Result, SetupError};

// ============================================================
// INSTRUMENT STATE
// ============================================================

/// Persisted record of one instrument.
///
/// Unknown fields are ignored and missing fields take their defaults, so
/// records written by older or newer versions still load.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentState {
    pub symbol: String,
    pub time_frame: String,
    pub is_in_setup: bool,
    /// Stop-loss level of the active setup
    pub setup_start_index: Option<usize>,
    pub setup_start_price: Option<f64>,
    /// Take-profit level of the active setup
    pub setup_end_index: Option<usize>,
    pub setup_end_price: Option<f64>,
    /// Entry price of the active setup
    pub trigger_level: Option<f64>,
    pub trigger_bar_index: Option<usize>,
    /// Opaque id of the last signal a consumer acknowledged
    pub last_signal_id: Option<String>,
    pub trigger_time: Option<DateTime<Utc>>,
    /// Anchor time of the last signalled pattern
    pub last_pattern_time: Option<DateTime<Utc>>,
    pub setup_signal_id: Option<Uuid>,
    pub setup_family: Option<PatternFamily>,
    pub setup_direction: Option<Direction>,
    /// The stop of the active setup sits at its entry
    pub breakeven: bool,
    /// Impulse waiting for its trigger
    pub pending: Option<PendingSetup>,
}

impl InstrumentState {
    pub fn new(symbol: impl Into<String>, time_frame: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            time_frame: time_frame.into(),
            ..Self::default()
        }
    }

    /// Forget the active setup. Dedup and acknowledgement fields are kept.
    pub fn clear_setup(&mut self) {
        self.is_in_setup = false;
        self.setup_start_index = None;
        self.setup_start_price = None;
        self.setup_end_index = None;
        self.setup_end_price = None;
        self.trigger_level = None;
        self.trigger_bar_index = None;
        self.trigger_time = None;
        self.setup_signal_id = None;
        self.setup_family = None;
        self.setup_direction = None;
        self.breakeven = false;
        self.pending = None;
    }

    /// Direction of the active setup, from the stored field or from the
    /// relative position of its target and stop
    pub fn active_direction(&self) -> Option<Direction> {
        if let Some(direction) = self.setup_direction {
            return Some(direction);
        }
        let (tp, sl) = (self.setup_end_price?, self.setup_start_price?);
        if tp > sl {
            Some(Direction::Bullish)
        } else if tp < sl {
            Some(Direction::Bearish)
        } else {
            None
        }
    }

    /// Check that an active setup carries usable levels
    pub fn validate(&self, location: &Path) -> Result<()> {
        if !self.is_in_setup {
            return Ok(());
        }
        let corrupt = |reason: String| SetupError::CorruptState {
            path: location.to_path_buf(),
            reason: format!("[{}] {}", self.symbol, reason),
        };

        let levels = [
            ("trigger_level", self.trigger_level),
            ("setup_start_price", self.setup_start_price),
            ("setup_end_price", self.setup_end_price),
        ];
        for (name, value) in levels {
            match value {
                Some(v) if v.is_finite() => {}
                Some(v) => return Err(corrupt(format!("{name} is {v}"))),
                None => return Err(corrupt(format!("in setup without {name}"))),
            }
        }

        let direction = self
            .active_direction()
            .ok_or_else(|| corrupt("take-profit equals stop-loss".to_string()))?;
        let sign = direction.sign();
        if let (Some(tp), Some(sl)) = (self.setup_end_price, self.setup_start_price) {
            if sign * (tp - sl) <= 0.0 {
                return Err(corrupt(format!(
                    "{} setup with take-profit {tp} and stop-loss {sl}",
                    direction.as_str()
                )));
            }
        }
        Ok(())
    }
}

/// States keyed by symbol
pub type StateMap = BTreeMap<String, InstrumentState>;

/// Carry over known symbols, create defaults for new ones, drop the rest
pub fn initialize<S: AsRef<str>>(symbols: &[S], time_frame: &str, previous: &StateMap) -> StateMap {
    symbols
        .iter()
        .map(|symbol| {
            let symbol = symbol.as_ref();
            let state = previous
                .get(symbol)
                .cloned()
                .unwrap_or_else(|| InstrumentState::new(symbol, time_frame));
            (symbol.to_string(), state)
        })
        .collect()
}

// ============================================================
// STORES
// ============================================================

/// Durable backing for a [`StateMap`]
pub trait StateStore: Send {
    /// Where the state lives, for error messages
    fn location(&self) -> &Path;

    /// Load every record. An absent store is an empty map; an unreadable one
    /// is `CorruptState`.
    fn load(&self) -> Result<StateMap>;

    /// Replace the stored map. Readers see either the old or the new map.
    fn save(&self, states: &StateMap) -> Result<()>;

    /// Delete the stored state. Resetting an absent store succeeds.
    fn reset(&self) -> Result<()>;
}

fn io_error(path: &Path, source: io::Error) -> SetupError {
    SetupError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn parse_states(text: &str, path: &Path) -> Result<StateMap> {
    if text.trim().is_empty() {
        return Ok(StateMap::new());
    }
    serde_json::from_str(text).map_err(|e| SetupError::CorruptState {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Pretty JSON file, replaced atomically through a sibling `.tmp` file
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

impl StateStore for JsonFileStore {
    fn location(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<StateMap> {
        let _guard = self.lock.lock();
        match fs::read_to_string(&self.path) {
            Ok(text) => parse_states(&text, &self.path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(StateMap::new()),
            Err(e) => Err(io_error(&self.path, e)),
        }
    }

    fn save(&self, states: &StateMap) -> Result<()> {
        let _guard = self.lock.lock();
        let text = serde_json::to_string_pretty(states).map_err(|e| SetupError::CorruptState {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| io_error(dir, e))?;
        }
        let tmp = self.tmp_path();
        fs::write(&tmp, text).map_err(|e| io_error(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| io_error(&self.path, e))?;
        debug!("saved {} instrument states to {}", states.len(), self.path.display());
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        let _guard = self.lock.lock();
        for path in [self.tmp_path(), self.path.clone()] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_error(&path, e)),
            }
        }
        Ok(())
    }
}

/// Serialized state held in memory
#[derive(Debug)]
pub struct MemoryStore {
    payload: Mutex<Option<String>>,
    location: PathBuf,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            payload: Mutex::new(None),
            location: PathBuf::from("<memory>"),
        }
    }

    /// Start from an already serialized payload, as if read from disk
    pub fn with_payload(payload: impl Into<String>) -> Self {
        Self {
            payload: Mutex::new(Some(payload.into())),
            ..Self::new()
        }
    }

    pub fn payload(&self) -> Option<String> {
        self.payload.lock().clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore for MemoryStore {
    fn location(&self) -> &Path {
        &self.location
    }

    fn load(&self) -> Result<StateMap> {
        match self.payload.lock().as_deref() {
            Some(text) => parse_states(text, &self.location),
            None => Ok(StateMap::new()),
        }
    }

    fn save(&self, states: &StateMap) -> Result<()> {
        let text = serde_json::to_string(states).map_err(|e| SetupError::CorruptState {
            path: self.location.clone(),
            reason: e.to_string(),
        })?;
        *self.payload.lock() = Some(text);
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        *self.payload.lock() = None;
        Ok(())
    }
}

// ============================================================
// STATE BOOK
// ============================================================

struct Book {
    states: StateMap,
    store: Box<dyn StateStore>,
    /// Symbols some live finder writes to
    claimed: HashSet<String>,
}

/// The shared map of instrument states and its store, behind one mutex
pub struct StateBook {
    inner: Mutex<Book>,
}

impl StateBook {
    /// Load the store's current map. `CorruptState` is fatal for this book.
    pub fn open(store: impl StateStore + 'static) -> Result<Self> {
        let states = store.load()?;
        info!(
            "loaded {} instrument states from {}",
            states.len(),
            store.location().display()
        );
        Ok(Self {
            inner: Mutex::new(Book {
                states,
                store: Box::new(store),
                claimed: HashSet::new(),
            }),
        })
    }

    /// Load, keep only `symbols` (adding defaults for new ones) and save
    pub fn open_for<S: AsRef<str>>(
        store: impl StateStore + 'static,
        symbols: &[S],
        time_frame: &str,
    ) -> Result<Self> {
        let book = Self::open(store)?;
        {
            let mut inner = book.inner.lock();
            inner.states = initialize(symbols, time_frame, &inner.states);
            inner.store.save(&inner.states)?;
        }
        Ok(book)
    }

    pub fn location(&self) -> PathBuf {
        self.inner.lock().store.location().to_path_buf()
    }

    pub fn get(&self, symbol: &str) -> Option<InstrumentState> {
        self.inner.lock().states.get(symbol).cloned()
    }

    /// Record `state` in the map; write the whole map when `persist` is set
    pub fn commit(&self, state: &InstrumentState, persist: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.states.insert(state.symbol.clone(), state.clone());
        if persist {
            inner.store.save(&inner.states)?;
        }
        Ok(())
    }

    /// Reserve `symbol` for one finder. Records are keyed by symbol, so a
    /// second finder on the same symbol would overwrite the first one's state.
    pub fn claim(&self, symbol: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.claimed.insert(symbol.to_string()) {
            return Err(SetupError::InvalidConfig(format!(
                "{symbol} already has a finder on the state book at {}",
                inner.store.location().display()
            )));
        }
        Ok(())
    }

    pub fn release(&self, symbol: &str) {
        self.inner.lock().claimed.remove(symbol);
    }

    pub fn snapshot(&self) -> StateMap {
        self.inner.lock().states.clone()
    }

    pub fn save(&self) -> Result<()> {
        let inner = self.inner.lock();
        inner.store.save(&inner.states)
    }

    /// Forget every state, in memory and in the store
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.states.clear();
        inner.store.reset()
    }
}

impl std::fmt::Debug for StateBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("StateBook")
            .field("location", &inner.store.location())
            .field("states", &inner.states.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active() -> InstrumentState {
        InstrumentState {
            is_in_setup: true,
            trigger_level: Some(100.0),
            setup_start_price: Some(95.0),
            setup_end_price: Some(110.0),
            ..InstrumentState::new("EURUSD", "H1")
        }
    }

    #[test]
    fn test_clear_setup_keeps_dedup_fields() {
        let mut state = active();
        state.last_signal_id = Some("abc".into());
        state.last_pattern_time = Some(DateTime::<Utc>::UNIX_EPOCH);
        state.clear_setup();

        assert!(!state.is_in_setup);
        assert!(state.trigger_level.is_none());
        assert_eq!(state.last_signal_id.as_deref(), Some("abc"));
        assert!(state.last_pattern_time.is_some());
    }

    #[test]
    fn test_validate_active_setup() {
        let location = Path::new("<test>");
        assert!(active().validate(location).is_ok());
        assert_eq!(active().active_direction(), Some(Direction::Bullish));

        let missing = InstrumentState {
            trigger_level: None,
            ..active()
        };
        assert!(matches!(
            missing.validate(location),
            Err(SetupError::CorruptState { .. })
        ));

        let inverted = InstrumentState {
            setup_direction: Some(Direction::Bearish),
            ..active()
        };
        assert!(inverted.validate(location).is_err());
    }

    #[test]
    fn test_initialize_merges() {
        let mut previous = StateMap::new();
        previous.insert("EURUSD".into(), active());
        previous.insert("OLD".into(), InstrumentState::new("OLD", "H1"));

        let states = initialize(&["EURUSD", "GBPUSD"], "H1", &previous);
        assert_eq!(states.len(), 2);
        assert!(states["EURUSD"].is_in_setup);
        assert!(!states["GBPUSD"].is_in_setup);
        assert_eq!(states["GBPUSD"].time_frame, "H1");
        assert!(!states.contains_key("OLD"));
    }

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert!(store.load().unwrap().is_empty());

        let mut states = StateMap::new();
        states.insert("EURUSD".into(), active());
        store.save(&states).unwrap();
        assert_eq!(store.load().unwrap(), states);

        store.reset().unwrap();
        assert!(store.payload().is_none());
    }

    #[test]
    fn test_book_commit_and_reset() {
        let book = StateBook::open_for(MemoryStore::new(), &["EURUSD"], "H1").unwrap();
        assert!(book.get("EURUSD").is_some());

        book.commit(&active(), true).unwrap();
        assert!(book.snapshot()["EURUSD"].is_in_setup);

        book.reset().unwrap();
        book.reset().unwrap();
        assert!(book.get("EURUSD").is_none());
    }

    #[test]
    fn test_one_claim_per_symbol() {
        let book = StateBook::open_for(MemoryStore::new(), &["EURUSD", "GBPUSD"], "H1").unwrap();
        book.claim("EURUSD").unwrap();
        book.claim("GBPUSD").unwrap();
        assert!(matches!(book.claim("EURUSD"), Err(SetupError::InvalidConfig(_))));

        book.release("EURUSD");
        assert!(book.claim("EURUSD").is_ok());
    }

    #[test]
    fn test_clear_setup_drops_pending_and_breakeven() {
        let mut state = InstrumentState {
            breakeven: true,
            ..active()
        };
        state.clear_setup();
        assert!(!state.breakeven);
        assert!(state.pending.is_none());
    }
}
