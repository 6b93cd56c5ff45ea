//! Shape arithmetic shared by inference, the CPU kernels and the fusion compiler.

use crate::error::{GraphError, Result};
use crate::ops::Broadcast;

/// Number of elements of `shape`.
///
/// Node shapes are checked with [`checked_numel`] at construction, so this
/// product cannot overflow for them.
pub fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Number of elements of `shape`, or `None` if it does not fit in `usize`.
pub fn checked_numel(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

/// Accumulated sizes: `acc[d]` is the flat distance between neighbours along `d`.
///
/// `acc_sizes(&[2, 3, 4]) == [12, 4, 1]`
pub fn acc_sizes(shape: &[usize]) -> Vec<usize> {
    let mut acc = vec![1; shape.len()];
    for d in (0..shape.len().saturating_sub(1)).rev() {
        acc[d] = acc[d + 1] * shape[d + 1];
    }
    acc
}

/// Coordinate of flat index `i` along dimension `d`.
#[inline]
pub fn coord(i: usize, acc: &[usize], shape: &[usize], d: usize) -> usize {
    (i / acc[d]) % shape[d]
}

/// Output shape of a broadcast binary operation.
///
/// The higher-rank operand dictates the result. The lower-rank operand must
/// match its trailing (or, for [`Broadcast::Leading`], leading) dimensions
/// exactly, unless it holds a single element. Equal ranks require equal shapes
/// up to the same single-element exception.
pub fn broadcast(
    op: &'static str,
    a: &[usize],
    b: &[usize],
    mode: Broadcast,
) -> Result<Vec<usize>> {
    let mismatch = || GraphError::ShapeMismatch {
        op,
        lhs: a.to_vec(),
        rhs: b.to_vec(),
    };
    let (high, low) = if a.len() > b.len() || (a.len() == b.len() && numel(a) >= numel(b)) {
        (a, b)
    } else {
        (b, a)
    };
    if numel(low) == 1 {
        return Ok(high.to_vec());
    }
    let aligned = match mode {
        Broadcast::Trailing => &high[high.len() - low.len()..],
        Broadcast::Leading => &high[..low.len()],
    };
    if aligned != low {
        return Err(mismatch());
    }
    Ok(high.to_vec())
}

/// Index-scheme parameters `(inverse_multiplicity, operand_count)` of one operand.
///
/// For output flat index `i` the operand element is
/// `(i / inverse_multiplicity) % operand_count`.
pub fn broadcast_params(out_count: usize, operand_count: usize, mode: Broadcast) -> (usize, usize) {
    let operand_count = operand_count.max(1);
    match mode {
        Broadcast::Trailing => (1, operand_count),
        Broadcast::Leading if operand_count == 1 => (1, 1),
        Broadcast::Leading => ((out_count / operand_count).max(1), operand_count),
    }
}

/// Number of window positions along one dimension (`ceil((extent - size + 1) / step)`).
pub fn window_count(extent: usize, size: usize, step: usize) -> usize {
    let span = extent + 1 - size;
    span.div_ceil(step)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acc_sizes() {
        assert_eq!(acc_sizes(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(acc_sizes(&[5]), vec![1]);
    }

    #[test]
    fn test_broadcast_rules() {
        let t = Broadcast::Trailing;
        assert_eq!(broadcast("add", &[2, 2], &[2, 2, 2], t).unwrap(), vec![2, 2, 2]);
        assert_eq!(broadcast("add", &[3], &[1], t).unwrap(), vec![3]);
        assert!(broadcast("add", &[3, 2], &[3], t).is_err());
        assert_eq!(
            broadcast("add", &[3, 2], &[3], Broadcast::Leading).unwrap(),
            vec![3, 2]
        );
    }

    #[test]
    fn test_index_scheme() {
        // [2] broadcast over [2, 3] along the leading axis
        let (inv, count) = broadcast_params(6, 2, Broadcast::Leading);
        let picked: Vec<usize> = (0..6).map(|i| (i / inv) % count).collect();
        assert_eq!(picked, vec![0, 0, 0, 1, 1, 1]);
        let (inv, count) = broadcast_params(6, 3, Broadcast::Trailing);
        let picked: Vec<usize> = (0..6).map(|i| (i / inv) % count).collect();
        assert_eq!(picked, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_checked_numel() {
        assert_eq!(checked_numel(&[2, 3, 4]), Some(24));
        assert_eq!(checked_numel(&[1 << 33, 1 << 33, 1 << 33]), None);
    }

    #[test]
    fn test_window_count() {
        assert_eq!(window_count(5, 2, 1), 4);
        assert_eq!(window_count(5, 2, 2), 2);
        assert_eq!(window_count(4, 4, 3), 1);
    }
}
