//! Axis reductions and batched matrix products.

use crate::graph::shape::{acc_sizes, numel};
use crate::ops::ReduceOp;
use crate::tensors::Element;

/// Index geometry of a reduction along one axis.
///
/// Output element `i` folds the source elements `base + j * stride` for
/// `j in 0..extent`, where `base = (i / stride) * stride * extent + i % stride`.
#[derive(Debug, Clone, Copy)]
pub struct Reduction {
    pub stride: usize,
    pub extent: usize,
}

impl Reduction {
    pub fn new(source: &[usize], axis: usize) -> Self {
        Self {
            stride: acc_sizes(source)[axis],
            extent: source[axis],
        }
    }

    #[inline]
    pub fn base(&self, i: usize) -> usize {
        (i / self.stride) * self.stride * self.extent + i % self.stride
    }

    pub fn kernel<T: Element>(&self, op: ReduceOp, a: &[T], from: usize, out: &mut [T]) {
        for (k, v) in out.iter_mut().enumerate() {
            let base = self.base(from + k);
            let mut items = (0..self.extent).map(|j| a[base + j * self.stride]);
            *v = match op {
                ReduceOp::Sum => items.fold(T::zero(), |acc, x| acc.wrapping_add(x)),
                ReduceOp::Mul => items.fold(T::one(), |acc, x| acc.wrapping_mul(x)),
                ReduceOp::Min => {
                    let first = items.next().unwrap_or_default();
                    items.fold(first, |acc, x| if x < acc { x } else { acc })
                }
                ReduceOp::Max => {
                    let first = items.next().unwrap_or_default();
                    items.fold(first, |acc, x| if x > acc { x } else { acc })
                }
            };
        }
    }
}

/// Dimensions of a batched product `[.., l, m] @ [.., m, n]`.
///
/// `batch_a` / `batch_b` count the matrices in each operand; the operand with
/// fewer batches is cycled, which matches aligning its batch dimensions with
/// the trailing batch dimensions of the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatmulDims {
    pub l: usize,
    pub m: usize,
    pub n: usize,
    pub batch_a: usize,
    pub batch_b: usize,
}

impl MatmulDims {
    pub fn new(a: &[usize], b: &[usize]) -> Self {
        let l = a[a.len() - 2];
        let m = a[a.len() - 1];
        let n = b[b.len() - 1];
        Self {
            l,
            m,
            n,
            batch_a: numel(a) / (l * m),
            batch_b: numel(b) / (m * n),
        }
    }

    pub fn kernel<T: Element>(&self, a: &[T], b: &[T], from: usize, out: &mut [T]) {
        let Self { l, m, n, .. } = *self;
        for (k, v) in out.iter_mut().enumerate() {
            let i = from + k;
            let bi = i / (l * n);
            let row = (i / n) % l;
            let col = i % n;
            let abase = (bi % self.batch_a) * l * m + row * m;
            let bbase = (bi % self.batch_b) * m * n + col;
            let mut sum = T::zero();
            for j in 0..m {
                sum = sum.wrapping_add(a[abase + j].wrapping_mul(b[bbase + j * n]));
            }
            *v = sum;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reduce_each_axis() {
        // [[1, 2, 3], [4, 5, 6]]
        let a = [1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut rows = [0.0; 2];
        Reduction::new(&[2, 3], 1).kernel(ReduceOp::Sum, &a, 0, &mut rows);
        assert_eq!(rows, [6.0, 15.0]);
        let mut cols = [0.0; 3];
        Reduction::new(&[2, 3], 0).kernel(ReduceOp::Max, &a, 0, &mut cols);
        assert_eq!(cols, [4.0, 5.0, 6.0]);
        Reduction::new(&[2, 3], 0).kernel(ReduceOp::Mul, &a, 0, &mut cols);
        assert_eq!(cols, [4.0, 10.0, 18.0]);
    }

    #[test]
    fn test_batched_matmul_cycles_smaller_batch() {
        // two 1x2 rows times one shared 2x1 column
        let dims = MatmulDims::new(&[2, 1, 2], &[2, 1]);
        assert_eq!(dims.batch_a, 2);
        assert_eq!(dims.batch_b, 1);
        let mut out = [0i32; 2];
        dims.kernel(&[1, 2, 3, 4], &[10, 100], 0, &mut out);
        assert_eq!(out, [210, 430]);
    }
}
