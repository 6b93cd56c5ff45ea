//! Data generators: hashed random numbers and coordinate ranges.

use crate::graph::shape::acc_sizes;

/// 32-bit PCG output permutation; the accelerator kernels use the same function.
#[inline]
pub fn pcg_hash(v: u32) -> u32 {
    let state = v.wrapping_mul(747_796_405).wrapping_add(2_891_336_453);
    let word = ((state >> ((state >> 28) + 4)) ^ state).wrapping_mul(277_803_737);
    (word >> 22) ^ word
}

/// Uniform value in `[0, 1)` for element `i` of a random tensor seeded with `seed`.
#[inline]
pub fn random_value(seed: u32, i: usize) -> f64 {
    let h = pcg_hash((i as u32).wrapping_add(pcg_hash(seed)));
    h as f64 / 4_294_967_296.0
}

/// Maps a flat index to its coordinate along `axis` of `shape`.
pub fn arange(shape: &[usize], axis: usize) -> impl Fn(usize) -> usize + Sync + use<> {
    let acc = acc_sizes(shape)[axis];
    let extent = shape[axis];
    move |i| (i / acc) % extent
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_range_and_determinism() {
        for i in 0..1000 {
            let v = random_value(42, i);
            assert!((0.0..1.0).contains(&v));
            assert_eq!(v, random_value(42, i));
        }
        assert_ne!(random_value(1, 0), random_value(2, 0));
    }

    #[test]
    fn test_arange_axis() {
        let c = arange(&[2, 3], 1);
        let v: Vec<usize> = (0..6).map(c).collect();
        assert_eq!(v, vec![0, 1, 2, 0, 1, 2]);
        let r = arange(&[2, 3], 0);
        let v: Vec<usize> = (0..6).map(r).collect();
        assert_eq!(v, vec![0, 0, 0, 1, 1, 1]);
    }
}
