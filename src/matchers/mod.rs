//! Setup matchers
//!
//! Every matcher is a pure function of the extremum sequence (speed windows,
//! candle window) it is given, and reports all matches rather than picking one.
//!
//! # Families
//!
//! - **Harmonic**: five-point XABCD structures validated by Fibonacci leg-ratio bands
//! - **Impulse**: five-wave impulsive moves under Elliott-style structural rules
//! - **Speed**: momentum setups from the rate of price change over two windows
//! - **Price action**: candle shapes over the last three bars

pub mod helpers;

/// Generate `with_defaults()` -> `Self::default()` for multiple config types.
macro_rules! impl_with_defaults {
  ($($config:ty),* $(,)?) => {
    $(impl $config {
      pub fn with_defaults() -> Self { Self::default() }
    })*
  };
}

pub mod harmonic;
pub mod impulse;
pub mod price_action;
pub mod speed;

// Re-export matchers for convenience
pub use harmonic::*;
pub use impulse::*;
pub use price_action::*;
pub use speed::*;
