//! Floating-point time comparisons with a process-wide epsilon.
//!
//! The task installs `relative_eps * sync_step_size` before the stepping
//! loop begins; every time comparison in the engine goes through these
//! helpers so that multi-rate sub-stepping, filter windows and storage
//! gating all agree on what "equal" means.
//!
//! Note: there is no one-size-fits-all way of comparing floating point
//! numbers. Values close to zero are compared with an absolute epsilon,
//! large values with a relative one.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as MemOrdering};

/// Default comparison epsilon, used until the task installs its own.
pub const DEFAULT_EPS: f64 = 1e-8;

static EPS_BITS: AtomicU64 = AtomicU64::new(f64::to_bits(DEFAULT_EPS));

/// Install the process-wide comparison epsilon.
pub fn set_eps(eps: f64) {
    EPS_BITS.store(eps.to_bits(), MemOrdering::Relaxed);
}

/// The currently installed comparison epsilon.
pub fn get_eps() -> f64 {
    f64::from_bits(EPS_BITS.load(MemOrdering::Relaxed))
}

/// Absolute check near zero, relative check for large magnitudes.
pub fn almost_equal(a: f64, b: f64, eps: f64) -> bool {
    let diff = (a - b).abs();

    if diff < eps {
        return true;
    }

    let largest = a.abs().max(b.abs());
    diff < largest * eps
}

fn cmp_eps(a: f64, b: f64, eps: f64) -> Option<Ordering> {
    if almost_equal(a, b, eps) {
        Some(Ordering::Equal)
    } else if a < b {
        Some(Ordering::Less)
    } else if a > b {
        Some(Ordering::Greater)
    } else {
        // NaN involved
        None
    }
}

pub fn double_cmp(a: f64, b: f64) -> Option<Ordering> {
    cmp_eps(a, b, get_eps())
}

pub fn double_eq(a: f64, b: f64) -> bool {
    double_cmp(a, b) == Some(Ordering::Equal)
}

pub fn double_lt(a: f64, b: f64) -> bool {
    double_cmp(a, b) == Some(Ordering::Less)
}

pub fn double_gt(a: f64, b: f64) -> bool {
    double_cmp(a, b) == Some(Ordering::Greater)
}

pub fn double_leq(a: f64, b: f64) -> bool {
    matches!(double_cmp(a, b), Some(Ordering::Less | Ordering::Equal))
}

pub fn double_geq(a: f64, b: f64) -> bool {
    matches!(double_cmp(a, b), Some(Ordering::Greater | Ordering::Equal))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_near_zero_absolute() {
        assert!(almost_equal(0.0, 1e-12, 1e-8));
        assert!(!almost_equal(0.0, 1e-6, 1e-8));
    }

    #[test]
    fn test_large_relative() {
        assert!(almost_equal(1e12, 1e12 + 1.0, 1e-8));
        assert!(!almost_equal(1e12, 1.001e12, 1e-8));
    }

    #[test]
    fn test_ordering() {
        assert!(double_lt(1.0, 2.0));
        assert!(double_gt(2.0, 1.0));
        assert!(double_leq(1.0, 1.0 + 1e-12));
        assert!(double_geq(1.0, 1.0 - 1e-12));
    }

    #[test]
    fn test_nan_is_unordered() {
        assert_eq!(double_cmp(f64::NAN, 1.0), None);
        assert!(!double_eq(f64::NAN, f64::NAN));
    }
}
