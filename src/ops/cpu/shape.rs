//! Index re-projection for the layout-changing kinds.
//!
//! Each function precomputes the accumulated-size tables of the output and the
//! source once and returns a closure mapping an output index to the source
//! index it reads.

use crate::graph::shape::acc_sizes;

/// Strided selection: source coordinate `start[d] + o[d] * step[d]`.
pub fn slice_index(
    out: &[usize],
    source: &[usize],
    start: &[usize],
    step: &[isize],
) -> impl Fn(usize) -> usize + Sync + use<> {
    let acc_o = acc_sizes(out);
    let acc_s = acc_sizes(source);
    let out = out.to_vec();
    let start = start.to_vec();
    let step = step.to_vec();
    move |i| {
        let mut src = 0isize;
        for d in 0..out.len() {
            let o = ((i / acc_o[d]) % out[d]) as isize;
            src += (start[d] as isize + o * step[d]) * acc_s[d] as isize;
        }
        src as usize
    }
}

/// Inverse of a strided slice; `None` for positions that stay zero.
pub fn extend_index(
    out: &[usize],
    source: &[usize],
    start: &[usize],
    step: &[isize],
) -> impl Fn(usize) -> Option<usize> + Sync + use<> {
    let acc_o = acc_sizes(out);
    let acc_s = acc_sizes(source);
    let out = out.to_vec();
    let source = source.to_vec();
    let start = start.to_vec();
    let step = step.to_vec();
    move |i| {
        let mut src = 0;
        for d in 0..out.len() {
            let p = ((i / acc_o[d]) % out[d]) as isize;
            let s = start[d] as isize;
            let q = if step[d] > 0 { p - s } else { s - p };
            let t = step[d].abs();
            if q < 0 || q % t != 0 || (q / t) as usize >= source[d] {
                return None;
            }
            src += (q / t) as usize * acc_s[d];
        }
        Some(src)
    }
}

/// Tiling: source coordinate `o[d] % source[d]`.
pub fn repeat_index(out: &[usize], source: &[usize]) -> impl Fn(usize) -> usize + Sync + use<> {
    let acc_o = acc_sizes(out);
    let acc_s = acc_sizes(source);
    let out = out.to_vec();
    let source = source.to_vec();
    move |i| {
        (0..out.len())
            .map(|d| ((i / acc_o[d]) % out[d] % source[d]) * acc_s[d])
            .sum()
    }
}

/// Output dimension `d` walks source dimension `perm[d]`.
pub fn transpose_index(
    out: &[usize],
    source: &[usize],
    perm: &[usize],
) -> impl Fn(usize) -> usize + Sync + use<> {
    let acc_o = acc_sizes(out);
    let acc_s = acc_sizes(source);
    let strides: Vec<usize> = perm.iter().map(|&p| acc_s[p]).collect();
    let out = out.to_vec();
    move |i| {
        (0..out.len())
            .map(|d| ((i / acc_o[d]) % out[d]) * strides[d])
            .sum()
    }
}

/// Which concat operand an output element comes from, with its index there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left(usize),
    Right(usize),
}

pub fn concat_index(out: &[usize], left: &[usize], axis: usize) -> impl Fn(usize) -> Side + Sync + use<> {
    let inner = acc_sizes(out)[axis];
    let total = out[axis];
    let split = left[axis];
    move |i| {
        let outer = i / (inner * total);
        let pos = (i / inner) % total;
        let rest = i % inner;
        if pos < split {
            Side::Left(outer * split * inner + pos * inner + rest)
        } else {
            let width = total - split;
            Side::Right(outer * width * inner + (pos - split) * inner + rest)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transpose_2d() {
        // [[0, 1, 2], [3, 4, 5]] -> [[0, 3], [1, 4], [2, 5]]
        let f = transpose_index(&[3, 2], &[2, 3], &[1, 0]);
        let v: Vec<usize> = (0..6).map(f).collect();
        assert_eq!(v, vec![0, 3, 1, 4, 2, 5]);
    }

    #[test]
    fn test_extend_inverts_reversed_slice() {
        // slice of [0..6] from 4 down with step -2 picks 4, 2, 0
        let s = slice_index(&[3], &[6], &[4], &[-2]);
        let picked: Vec<usize> = (0..3).map(s).collect();
        assert_eq!(picked, vec![4, 2, 0]);
        let e = extend_index(&[6], &[3], &[4], &[-2]);
        let placed: Vec<Option<usize>> = (0..6).map(e).collect();
        assert_eq!(placed, vec![Some(2), None, Some(1), None, Some(0), None]);
    }

    #[test]
    fn test_concat_sides() {
        let f = concat_index(&[2, 3], &[2, 1], 1);
        let v: Vec<Side> = (0..6).map(f).collect();
        assert_eq!(
            v,
            vec![
                Side::Left(0),
                Side::Right(0),
                Side::Right(1),
                Side::Left(1),
                Side::Right(2),
                Side::Right(3)
            ]
        );
    }

    #[test]
    fn test_repeat() {
        let f = repeat_index(&[2, 4], &[1, 2]);
        let v: Vec<usize> = (0..8).map(f).collect();
        assert_eq!(v, vec![0, 1, 0, 1, 0, 1, 0, 1]);
    }
}
