//! Approximate equality of floating point results.
//!
//! Results computed by different backends (or in different association
//! orders) rarely agree bit for bit. Comparisons here grade the difference
//! into an [`ApproxEquality`] tier instead of answering yes or no; callers
//! pick the tier they need. Accelerator results are computed at 32-bit
//! precision and are expected to land within [`F32_MAX_ERROR`].
//!
//! Differences are relative to the larger magnitude once that exceeds 1, so
//! large values are not held to an absolute epsilon they cannot meet.

/// Worst accepted error on `f32` results.
pub const F32_MAX_ERROR: f32 = 1e-3;

/// Typical error on `f32` results.
pub const F32_AVG_ERROR: f32 = 1e-5;

/// Best expected error on `f32` results.
pub const F32_MIN_ERROR: f32 = 1e-6;

/// Worst accepted error on `f64` results.
pub const F64_MAX_ERROR: f64 = 1e-3;

/// Typical error on `f64` results.
pub const F64_AVG_ERROR: f64 = 1e-6;

/// Best expected error on `f64` results.
pub const F64_MIN_ERROR: f64 = 1e-13;

/// How close two values are, from best to worst.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ApproxEquality {
    Precise = 0,
    Partial = 1,
    Relative = 2,
    /// Not equal.
    Scarce = 3,
}

/// Grades the distance between `self` and `rhs`.
pub trait RelativeEq<Rhs: ?Sized = Self> {
    fn approx_eq(&self, rhs: &Rhs) -> ApproxEquality;
}

macro_rules! impl_relative_eq {
    ($t:ty, $min:expr, $avg:expr, $max:expr) => {
        impl RelativeEq for $t {
            fn approx_eq(&self, rhs: &Self) -> ApproxEquality {
                if self == rhs || (self.is_nan() && rhs.is_nan()) {
                    return ApproxEquality::Precise;
                }
                let scale = self.abs().max(rhs.abs()).max(1.0);
                let dif = (self - rhs).abs() / scale;
                if dif < $min {
                    ApproxEquality::Precise
                } else if dif < $avg {
                    ApproxEquality::Partial
                } else if dif < $max {
                    ApproxEquality::Relative
                } else {
                    ApproxEquality::Scarce
                }
            }
        }
    };
}

impl_relative_eq!(f32, F32_MIN_ERROR, F32_AVG_ERROR, F32_MAX_ERROR);
impl_relative_eq!(f64, F64_MIN_ERROR, F64_AVG_ERROR, F64_MAX_ERROR);

/// The worst tier over all element pairs; `Scarce` on a length mismatch.
impl<T: RelativeEq<U>, U> RelativeEq<[U]> for [T] {
    fn approx_eq(&self, rhs: &[U]) -> ApproxEquality {
        if self.len() != rhs.len() {
            return ApproxEquality::Scarce;
        }
        self.iter()
            .zip(rhs)
            .map(|(a, b)| a.approx_eq(b))
            .try_fold(ApproxEquality::Precise, |worst, eq| match eq {
                ApproxEquality::Scarce => Err(()),
                eq => Ok(worst.max(eq)),
            })
            .unwrap_or(ApproxEquality::Scarce)
    }
}

impl<T: RelativeEq<U>, U> RelativeEq<Vec<U>> for Vec<T> {
    fn approx_eq(&self, rhs: &Vec<U>) -> ApproxEquality {
        self.as_slice().approx_eq(rhs.as_slice())
    }
}

/// `true` when `a` and `b` are at least as close as `tier`.
pub fn approx_within<A: RelativeEq<B> + ?Sized, B: ?Sized>(a: &A, b: &B, tier: ApproxEquality) -> bool {
    a.approx_eq(b) <= tier
}

/// `true` when `a` and `b` agree to the best expected precision.
pub fn approx_eq<A: RelativeEq<B> + ?Sized, B: ?Sized>(a: &A, b: &B) -> bool {
    approx_within(a, b, ApproxEquality::Precise)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tiers() {
        assert_eq!(1.0f64.approx_eq(&1.0), ApproxEquality::Precise);
        assert_eq!(1.0f64.approx_eq(&1.000_000_1), ApproxEquality::Partial);
        assert_eq!(1.0f32.approx_eq(&1.0005), ApproxEquality::Relative);
        assert_eq!(1.0f32.approx_eq(&1.1), ApproxEquality::Scarce);
    }

    #[test]
    fn test_large_values_scale() {
        assert!(approx_within(&1.0e6f32, &1.000_1e6, ApproxEquality::Relative));
        assert!(!approx_eq(&1.0e6f32, &1.000_1e6));
    }

    #[test]
    fn test_slices_take_worst_tier() {
        let a = [1.0f64, 2.0, 3.0];
        let b = [1.0f64, 2.000_000_1, 3.0];
        assert_eq!(a[..].approx_eq(&b[..]), ApproxEquality::Partial);
        assert_eq!(a[..2].approx_eq(&b[..]), ApproxEquality::Scarce);
    }
}
