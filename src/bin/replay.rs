//! Replay a JSON bar history through one setup finder and print every
//! lifecycle event as a JSON line.
//!
//! ```text
//! yasf-replay --bars eurusd_h1.json --symbol EURUSD --time-frame H1 \
//!     --state state.json --param deviation=1.0 --param tolerance=7.5
//! ```

use std::{
    collections::HashMap,
    error::Error,
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use clap::Parser;
use log::{error, info, LevelFilter};
use serde::Deserialize;

use yasf::prelude::{
    Bar, FinderConfig, JsonFileStore, SetupError, SetupEvent, SetupFinder, StateBook, StateStore,
    VecBars,
};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON array of bars: {open_time, open, high, low, close[, index]}
    #[arg(long)]
    bars: PathBuf,

    /// Finder configuration as JSON; defaults to harmonic patterns
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "SYMBOL")]
    symbol: String,

    #[arg(long, default_value = "H1")]
    time_frame: String,

    /// Persist instrument state to this file and resume from it
    #[arg(long)]
    state: Option<PathBuf>,

    /// Delete the persisted state before replaying
    #[arg(long, default_value_t = false)]
    reset: bool,

    /// Parameter override, e.g. `deviation=1.0`; repeatable
    #[arg(long = "param", value_parser = parse_param)]
    params: Vec<(String, f64)>,

    /// Feed this many leading bars as history only, without matching
    #[arg(long, default_value_t = 0)]
    warm_up: usize,

    /// Debug logging for the engine
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

fn parse_param(text: &str) -> Result<(String, f64), String> {
    let (name, value) = text
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{text}'"))?;
    let value = value
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("bad value for {name}: {e}"))?;
    Ok((name.trim().to_string(), value))
}

#[derive(Debug, Deserialize)]
struct BarRecord {
    index: Option<usize>,
    open_time: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
}

fn load_bars(path: &Path) -> Result<Vec<Bar>, Box<dyn Error>> {
    let text = fs::read_to_string(path)?;
    let records: Vec<BarRecord> = serde_json::from_str(&text)?;
    Ok(records
        .into_iter()
        .enumerate()
        .map(|(i, r)| Bar::new(r.index.unwrap_or(i), r.open_time, r.open, r.high, r.low, r.close))
        .collect())
}

fn load_config(cli: &Cli) -> Result<FinderConfig, Box<dyn Error>> {
    let config = match &cli.config {
        Some(path) => serde_json::from_str::<FinderConfig>(&fs::read_to_string(path)?)?,
        None => FinderConfig::default(),
    };
    if cli.params.is_empty() {
        config.validate()?;
        return Ok(config);
    }
    let params: HashMap<&str, f64> = cli.params.iter().map(|(k, v)| (k.as_str(), *v)).collect();
    Ok(config.with_params(&params)?)
}

fn run(cli: &Cli) -> Result<(), Box<dyn Error>> {
    let config = load_config(cli)?;
    let bars = load_bars(&cli.bars)?;
    info!(
        "replaying {} bars of {} {} with {} setups",
        bars.len(),
        cli.symbol,
        cli.time_frame,
        config.detector.family().as_str()
    );

    let mut builder = SetupFinder::builder(&cli.symbol, &cli.time_frame)
        .config(config)
        .sink(|event: &SetupEvent| match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(e) => error!("could not serialize event: {e}"),
        });

    let book = match &cli.state {
        Some(path) => {
            let store = JsonFileStore::new(path);
            if cli.reset {
                store.reset()?;
                info!("reset state in {}", path.display());
            }
            let book = Arc::new(StateBook::open_for(store, &[cli.symbol.as_str()], &cli.time_frame)?);
            builder = builder.state_book(Arc::clone(&book));
            Some(book)
        }
        None => None,
    };

    let mut finder = builder.build()?;

    let split = cli.warm_up.min(bars.len());
    let replayed = finder
        .warm_up(&bars[..split])
        .and_then(|mut events| {
            events.extend(finder.replay(&VecBars::new(bars).with_start_index_limit(split))?);
            Ok(events)
        });
    let events = match replayed {
        Ok(events) => events,
        Err(SetupError::NotPersisted { events, source, .. }) => {
            error!("{} events printed before the state file failed", events.len());
            return Err((*source).into());
        }
        Err(e) => return Err(e.into()),
    };

    if book.is_some() {
        finder.flush()?;
    }

    info!(
        "{} setups entered, {} took profit, {} hit stop, {} cancelled, finder {}",
        count(&events, "entered"),
        count(&events, "took_profit"),
        count(&events, "hit_stop"),
        count(&events, "canceled"),
        finder.phase().name()
    );
    Ok(())
}

fn count(events: &[SetupEvent], kind: &str) -> usize {
    events.iter().filter(|e| e.kind() == kind).count()
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let mut builder = env_logger::Builder::new();
    builder
        .filter(None, LevelFilter::Warn)
        .filter(Some("yasf"), level)
        .filter(Some("yasf_replay"), level);
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    builder.init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_param() {
        assert_eq!(parse_param("deviation=1.5"), Ok(("deviation".to_string(), 1.5)));
        assert_eq!(parse_param(" tolerance = 7 "), Ok(("tolerance".to_string(), 7.0)));
        assert!(parse_param("deviation").unwrap_err().contains("name=value"));
        assert!(parse_param("deviation=wide").unwrap_err().contains("deviation"));
    }

    #[test]
    fn test_load_bars() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{"open_time": "2024-01-01T00:00:00Z", "open": 1.0, "high": 1.2, "low": 0.9, "close": 1.1}},
                {{"open_time": "2024-01-01T01:00:00Z", "open": 1.1, "high": 1.3, "low": 1.0, "close": 1.2}}
            ]"#
        )
        .unwrap();
        let bars = load_bars(file.path()).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[1].index, 1);
        assert_eq!(bars[1].close, 1.2);
        assert_eq!(bars[1].open_time.to_rfc3339(), "2024-01-01T01:00:00+00:00");

        let mut indexed = tempfile::NamedTempFile::new().unwrap();
        write!(
            indexed,
            r#"[{{"index": 40, "open_time": "2024-01-01T00:00:00Z", "open": 1.0, "high": 1.2, "low": 0.9, "close": 1.1}}]"#
        )
        .unwrap();
        assert_eq!(load_bars(indexed.path()).unwrap()[0].index, 40);

        let mut broken = tempfile::NamedTempFile::new().unwrap();
        write!(broken, r#"[{{"open": 1.0}}]"#).unwrap();
        assert!(load_bars(broken.path()).is_err());
    }
}
