//! Benchmarks for swing tracking and setup finding.

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use yasf::prelude::*;

fn t(i: usize) -> DateTime<Utc> {
  Utc.timestamp_opt(1_700_000_000 + i as i64 * 60, 0).unwrap()
}

/// Generate a deterministic swinging bar series
fn generate_bars(n: usize) -> Vec<Bar> {
  let mut bars = Vec::with_capacity(n);
  let mut price = 100.0;

  for i in 0..n {
    let drift = ((i as f64) * 0.05).sin() * 0.8;
    let noise = ((i * 7 + 13) % 100) as f64 / 100.0 - 0.5; // Deterministic "random"
    let volatility = 0.3 + ((i * 3) % 10) as f64 / 20.0;

    let o = price;
    let c = (price + drift + noise).max(1.0);
    let h = o.max(c) + volatility * 0.5;
    let l = o.min(c) - volatility * 0.5;

    bars.push(Bar::new(i, t(i), o, h, l, c));
    price = c;
  }

  bars
}

fn finder(detector: DetectorConfig) -> SetupFinder {
  SetupFinder::builder("BENCH", "M1").config(FinderConfig::with_detector(detector)).build().unwrap()
}

fn run(mut finder: SetupFinder, bars: &[Bar]) -> usize {
  bars.iter().map(|bar| finder.check_bar(bar).map_or(0, |e| e.len())).sum()
}

fn bench_tracker(c: &mut Criterion) {
  let bars = generate_bars(10_000);

  c.bench_function("tracker_10000_bars", |b| {
    b.iter(|| {
      let mut tracker = ExtremumTracker::default();
      for bar in &bars {
        black_box(tracker.observe(black_box(bar)));
      }
    })
  });
}

fn bench_families(c: &mut Criterion) {
  let bars = generate_bars(5_000);
  let mut group = c.benchmark_group("finder_5000_bars");

  let detectors = [
    ("harmonic", DetectorConfig::Harmonic(HarmonicConfig::default())),
    ("impulse", DetectorConfig::Impulse(ImpulseConfig::default())),
    ("speed", DetectorConfig::Speed(SpeedConfig::default())),
    ("price_action", DetectorConfig::PriceAction(PriceActionConfig::default())),
  ];
  for (name, detector) in detectors {
    group.bench_function(name, |b| {
      b.iter(|| black_box(run(finder(detector.clone()), black_box(&bars))))
    });
  }

  group.finish();
}

fn bench_scaling(c: &mut Criterion) {
  let mut group = c.benchmark_group("scaling");

  for size in [1_000, 5_000, 20_000].iter() {
    let bars = generate_bars(*size);

    group.bench_with_input(BenchmarkId::new("harmonic", size), size, |b, _| {
      b.iter(|| black_box(run(finder(DetectorConfig::default()), black_box(&bars))))
    });
  }

  group.finish();
}

/// Swing tracking sensitivity: every tenth grid value of the deviation parameter
fn bench_deviation_sweep(c: &mut Criterion) {
  let bars = generate_bars(5_000);
  let Some(deviation) = TrackerConfig::param_meta().iter().find(|m| m.name == "deviation") else {
    return;
  };
  let mut group = c.benchmark_group("deviation_sweep");

  for value in deviation.generate_grid().into_iter().step_by(10) {
    let params = HashMap::from([("deviation", value)]);
    let config = FinderConfig::default().with_params(&params).unwrap();
    group.bench_with_input(BenchmarkId::new("harmonic", format!("{value:.2}")), &config, |b, config| {
      b.iter(|| {
        let finder = SetupFinder::builder("BENCH", "M1").config(config.clone()).build().unwrap();
        black_box(run(finder, black_box(&bars)))
      })
    });
  }

  group.finish();
}

fn bench_parallel_replay(c: &mut Criterion) {
  let bars: Vec<Vec<Bar>> = (0..4).map(|_| generate_bars(5_000)).collect();
  let config = FinderConfig::default();
  let symbols = ["SYM1", "SYM2", "SYM3", "SYM4"];

  c.bench_function("parallel_replay_4_instruments", |b| {
    b.iter(|| {
      let jobs: Vec<ReplayJob> = symbols
        .iter()
        .zip(&bars)
        .map(|(&symbol, bars)| ReplayJob {
          symbol,
          time_frame: "M1",
          config: &config,
          bars: bars.as_slice(),
        })
        .collect();
      black_box(replay_parallel(jobs))
    })
  });
}

criterion_group!(
  benches,
  bench_tracker,
  bench_families,
  bench_scaling,
  bench_deviation_sweep,
  bench_parallel_replay,
);

criterion_main!(benches);
