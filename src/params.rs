//! Parameter metadata for tracker and matcher configurations
//!
//! This module describes every tunable knob, enabling:
//! - Grid search optimization of deviation, tolerance and target ratios
//! - Parameter documentation
//! - Command-line overrides (`yasf-replay --param tolerance=7.5`)
//!
//! # Example
//!
//! ```rust
//! use std::collections::HashMap;
//! use yasf::prelude::*;
//!
//! for param in HarmonicConfig::param_meta() {
//!     println!("{}: {:?} (default: {})", param.name, param.param_type, param.default);
//! }
//!
//! let mut params = HashMap::new();
//! params.insert("tolerance", 7.5);
//! let config = HarmonicConfig::with_params(&params).unwrap();
//! assert_eq!(config.tolerance.get(), 7.5);
//! ```

use std::collections::HashMap;

use crate::{Percent, Period, Ratio, Result, SetupError};

// ============================================================
// PARAMETER TYPES
// ============================================================

/// Type of parameter value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
  /// Fraction in 0.0..=1.0
  Ratio,
  /// Percentage in 0.0..=100.0
  Percent,
  /// Positive integer
  Period,
  /// Positive, unbounded multiplier (e.g. 1.5x risk)
  Multiplier,
}

/// Metadata for a single configuration parameter
#[derive(Debug, Clone)]
pub struct ParamMeta {
  /// Parameter name (e.g., "tolerance")
  pub name: &'static str,
  pub param_type: ParamType,
  pub default: f64,
  /// Range for optimization: (min, max, step)
  pub range: (f64, f64, f64),
  /// Human-readable description
  pub description: &'static str,
}

impl ParamMeta {
  pub const fn ratio(
    name: &'static str,
    default: f64,
    range: (f64, f64, f64),
    description: &'static str,
  ) -> Self {
    Self { name, param_type: ParamType::Ratio, default, range, description }
  }

  pub const fn percent(
    name: &'static str,
    default: f64,
    range: (f64, f64, f64),
    description: &'static str,
  ) -> Self {
    Self { name, param_type: ParamType::Percent, default, range, description }
  }

  pub const fn period(
    name: &'static str,
    default: f64,
    range: (f64, f64, f64),
    description: &'static str,
  ) -> Self {
    Self { name, param_type: ParamType::Period, default, range, description }
  }

  pub const fn multiplier(
    name: &'static str,
    default: f64,
    range: (f64, f64, f64),
    description: &'static str,
  ) -> Self {
    Self { name, param_type: ParamType::Multiplier, default, range, description }
  }

  /// Generate all values for grid search. Every value passes `validate`.
  pub fn generate_grid(&self) -> Vec<f64> {
    let (min, max, step) = self.range;
    if step <= 0.0 || max < min {
      return vec![min];
    }
    let steps = ((max - min) / step + 1e-9).floor() as usize;
    (0..=steps).map(|i| (min + i as f64 * step).min(max)).collect()
  }

  /// Validate a value for this parameter
  pub fn validate(&self, value: f64) -> Result<()> {
    let (min, max, _) = self.range;
    if value.is_nan() || value < min || value > max {
      return Err(SetupError::OutOfRange { field: self.name, value, min, max });
    }
    match self.param_type {
      ParamType::Period if value < 1.0 || value.fract() != 0.0 => {
        Err(SetupError::InvalidValue("Period must be a positive integer"))
      },
      ParamType::Multiplier if value <= 0.0 => {
        Err(SetupError::InvalidValue("Multiplier must be > 0"))
      },
      // Ratio and Percent bounds are enforced by their newtypes
      _ => Ok(()),
    }
  }
}

// ============================================================
// PARAMETERIZED CONFIG TRAIT
// ============================================================

/// Trait for configurations that support parameterization
///
/// Implementing this trait enables:
/// - Discovery of available parameters
/// - Creation of configs with custom parameter values
/// - Grid search optimization
pub trait Parameterized: Sized {
  /// Returns metadata for all configurable parameters
  fn param_meta() -> &'static [ParamMeta];

  /// Creates a config with parameters from a HashMap
  ///
  /// Missing parameters use their default values.
  fn with_params(params: &HashMap<&str, f64>) -> Result<Self>;

  /// Short name used in logs and CLI help
  fn config_name() -> &'static str;

  /// True when `name` is one of this config's parameters
  fn accepts(name: &str) -> bool {
    Self::param_meta().iter().any(|m| m.name == name)
  }
}

// ============================================================
// PARAMETER VALUE HELPERS
// ============================================================

/// Helper to get a Ratio from params with default fallback
pub fn get_ratio(params: &HashMap<&str, f64>, key: &str, default: f64) -> Result<Ratio> {
  let value = params.get(key).copied().unwrap_or(default);
  Ratio::new(value)
}

/// Helper to get a Percent from params with default fallback
pub fn get_percent(params: &HashMap<&str, f64>, key: &str, default: f64) -> Result<Percent> {
  let value = params.get(key).copied().unwrap_or(default);
  Percent::new(value)
}

/// Helper to get a Period from params with default fallback
pub fn get_period(params: &HashMap<&str, f64>, key: &str, default: usize) -> Result<Period> {
  let value = params.get(key).copied().unwrap_or(default as f64);
  Period::new(value as usize)
}

/// Helper to get a positive multiplier from params with default fallback
pub fn get_multiplier(params: &HashMap<&str, f64>, key: &str, default: f64) -> Result<f64> {
  let value = params.get(key).copied().unwrap_or(default);
  if !value.is_finite() || value <= 0.0 {
    return Err(SetupError::InvalidValue("Multiplier must be finite and > 0"));
  }
  Ok(value)
}

/// Reject keys no parameter of `P` knows about
pub fn check_known<P: Parameterized>(params: &HashMap<&str, f64>) -> Result<()> {
  for (key, value) in params {
    match P::param_meta().iter().find(|m| m.name == *key) {
      Some(meta) => meta.validate(*value)?,
      None => {
        return Err(SetupError::InvalidConfig(format!(
          "unknown {} parameter '{}'",
          P::config_name(),
          key
        )))
      },
    }
  }
  Ok(())
}

// ============================================================
// TESTS
// ============================================================
