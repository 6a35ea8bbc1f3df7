//! Ratio arithmetic shared by the matchers

use crate::{extremum::Extremum, Percent, Result, SetupError};

// ============================================================
// FIBONACCI MULTIPLIERS
// ============================================================

pub const FIB_236: f64 = 0.236;
pub const FIB_382: f64 = 0.382;
pub const FIB_500: f64 = 0.5;
pub const FIB_618: f64 = 0.618;
pub const FIB_786: f64 = 0.786;
pub const FIB_886: f64 = 0.886;
pub const FIB_1130: f64 = 1.13;
pub const FIB_1270: f64 = 1.27;
pub const FIB_1410: f64 = 1.41;
pub const FIB_1618: f64 = 1.618;

/// Below this a leg is treated as having no range
pub const MIN_LEG: f64 = 1e-12;

// ============================================================
// HELPER FUNCTIONS
// ============================================================

/// `|leg| / |reference|`. A zero or non-finite reference fails with `DegenerateLeg`.
#[inline]
pub fn leg_ratio(leg: f64, reference: f64, label: impl Fn() -> String) -> Result<f64> {
    let reference = reference.abs();
    if !reference.is_finite() || !leg.is_finite() || reference < MIN_LEG {
        return Err(SetupError::DegenerateLeg { leg: label() });
    }
    Ok(leg.abs() / reference)
}

/// Band `[min, max]` widened by `tolerance` on both sides
#[inline]
pub fn widen(min: f64, max: f64, tolerance: Percent) -> (f64, f64) {
    let t = tolerance.fraction();
    (min * (1.0 - t), max * (1.0 + t))
}

/// 1.0 at the centre of `[lo, hi]`, falling linearly to 0.0 at either edge
#[inline]
pub fn band_closeness(value: f64, lo: f64, hi: f64) -> f64 {
    let half = (hi - lo) / 2.0;
    if half <= f64::EPSILON {
        return 1.0;
    }
    let centre = lo + half;
    (1.0 - (value - centre).abs() / half).clamp(0.0, 1.0)
}

/// Kinds alternate and every peak sits at or above its neighbouring troughs
pub fn is_zigzag(points: &[Extremum]) -> bool {
    points.windows(2).all(|w| {
        let (a, b) = (&w[0], &w[1]);
        a.kind == b.kind.opposite()
            && if a.is_peak() {
                a.value >= b.value
            } else {
                a.value <= b.value
            }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extremum::ExtremumKind;
    use chrono::{TimeZone, Utc};

    fn point(i: usize, value: f64, kind: ExtremumKind) -> Extremum {
        Extremum::new(value, i, Utc.timestamp_opt(i as i64 * 60, 0).unwrap(), kind)
    }

    #[test]
    fn test_leg_ratio() {
        assert!((leg_ratio(-61.8, 100.0, || "AB".into()).unwrap() - 0.618).abs() < 1e-12);
        assert!(matches!(
            leg_ratio(1.0, 0.0, || "XA".into()),
            Err(SetupError::DegenerateLeg { leg }) if leg == "XA"
        ));
        assert!(leg_ratio(1.0, f64::NAN, || "XA".into()).is_err());
    }

    #[test]
    fn test_widen_and_closeness() {
        let (lo, hi) = widen(1.0, 2.0, Percent::new(10.0).unwrap());
        assert!((lo - 0.9).abs() < 1e-12);
        assert!((hi - 2.2).abs() < 1e-12);
        assert!((band_closeness(1.55, lo, hi) - 1.0).abs() < 1e-9);
        assert_eq!(band_closeness(0.9, lo, hi), 0.0);
        assert_eq!(band_closeness(0.618, 0.618, 0.618), 1.0);
    }

    #[test]
    fn test_is_zigzag() {
        use ExtremumKind::*;
        let good = [point(0, 1.0, Trough), point(1, 2.0, Peak), point(2, 1.5, Trough)];
        assert!(is_zigzag(&good));
        let same_kind = [point(0, 1.0, Trough), point(1, 0.5, Trough)];
        assert!(!is_zigzag(&same_kind));
        let inverted = [point(0, 3.0, Trough), point(1, 2.0, Peak)];
        assert!(!is_zigzag(&inverted));
    }
}
