//! One constructor per operation kind.
//!
//! Every constructor validates its arguments, so it either returns a new node
//! or a [`GraphError`](crate::error::GraphError) without touching the graph.
//! Convenience forms (`slice` with signed bounds, scalar operands, `expand`,
//! `flatten`) resolve their arguments here and then build one of the core kinds.

use crate::error::{GraphError, Result};
use crate::graph::NodeId;
use crate::graph::shape::checked_numel;
use crate::ops::{BinaryOp, Broadcast, Op, ReduceOp, UnaryOp};
use crate::session::Session;
use crate::tensors::{Buffer, DType, Element, Tensor, Value};

macro_rules! binary_constructors {
    ($($(#[$doc:meta])* $name:ident, $scalar:ident => $op:ident;)*) => {
        $(
            $(#[$doc])*
            pub fn $name(&mut self, a: NodeId, b: NodeId) -> Result<NodeId> {
                self.broadcast_binary(BinaryOp::$op, a, b, Broadcast::Trailing)
            }

            /// Same as the node form with a one-element constant as right operand.
            pub fn $scalar(&mut self, a: NodeId, value: impl Into<Value>) -> Result<NodeId> {
                let b = self.scalar(value.into())?;
                self.binary_or_free(BinaryOp::$op, a, b)
            }
        )*
    };
}

macro_rules! unary_constructors {
    ($($(#[$doc:meta])* $name:ident => $op:ident;)*) => {
        $(
            $(#[$doc])*
            pub fn $name(&mut self, a: NodeId) -> Result<NodeId> {
                self.unary(UnaryOp::$op, a)
            }
        )*
    };
}

macro_rules! reduce_constructors {
    ($($name:ident => $op:ident;)*) => {
        $(
            pub fn $name(&mut self, a: NodeId, axis: usize) -> Result<NodeId> {
                self.reduce(ReduceOp::$op, a, axis)
            }
        )*
    };
}

impl Session {
    /// Creates a store node holding a copy of `data`.
    ///
    /// An empty `shape` denotes a scalar and is stored as `[1]`.
    pub fn create<T: Element>(&mut self, data: &[T], shape: &[usize]) -> Result<NodeId> {
        let shape = if shape.is_empty() { vec![1] } else { shape.to_vec() };
        if checked_numel(&shape) != Some(data.len()) {
            return Err(GraphError::argument(format!(
                "shape {shape:?} does not describe {} elements",
                data.len()
            )));
        }
        let mut copy = Vec::new();
        copy.try_reserve_exact(data.len())
            .map_err(|_| GraphError::Allocation {
                bytes: data.len().saturating_mul(T::DTYPE.size()),
            })?;
        copy.extend_from_slice(data);
        self.create_buffer(T::wrap(copy), &shape)
    }

    /// Creates a store node from a host tensor.
    pub fn create_tensor<T: Element>(&mut self, tensor: &Tensor<T>) -> Result<NodeId> {
        self.create(&tensor.data, &tensor.shape)
    }

    /// Creates a store node that takes ownership of `buffer`.
    pub fn create_buffer(&mut self, buffer: Buffer, shape: &[usize]) -> Result<NodeId> {
        let shape = if shape.is_empty() { vec![1] } else { shape.to_vec() };
        if checked_numel(&shape) != Some(buffer.len()) || shape.contains(&0) {
            return Err(GraphError::argument(format!(
                "shape {shape:?} does not describe {} elements",
                buffer.len()
            )));
        }
        let dtype = buffer.dtype();
        self.graph.insert(Op::Store { shape: shape.clone(), dtype }, shape, dtype, Vec::new(), Some(buffer))
    }

    /// A tensor of `shape` where every element is `value`.
    pub fn constant(&mut self, value: impl Into<Value>, shape: &[usize]) -> Result<NodeId> {
        let op = Op::Const {
            value: value.into(),
            shape: shape.to_vec(),
        };
        self.construct(op, &[])
    }

    /// One-element constant of shape `[1]`.
    pub(crate) fn scalar(&mut self, value: Value) -> Result<NodeId> {
        self.constant(value, &[1])
    }

    /// Uniformly distributed float64 values in `[0, 1)`, reproducible per seed.
    pub fn random(&mut self, shape: &[usize], seed: u32) -> Result<NodeId> {
        self.construct(
            Op::Random {
                seed,
                shape: shape.to_vec(),
            },
            &[],
        )
    }

    /// int64 tensor whose elements are their own coordinate along `axis`.
    ///
    /// `arange(&[2, 3], 1)` is `[[0, 1, 2], [0, 1, 2]]`.
    pub fn arange(&mut self, shape: &[usize], axis: usize) -> Result<NodeId> {
        self.construct(
            Op::Arange {
                axis,
                shape: shape.to_vec(),
            },
            &[],
        )
    }

    /// Elementwise binary operation with an explicit broadcast alignment.
    pub fn broadcast_binary(
        &mut self,
        op: BinaryOp,
        a: NodeId,
        b: NodeId,
        broadcast: Broadcast,
    ) -> Result<NodeId> {
        self.construct(Op::Binary { op, broadcast }, &[a, b])
    }

    /// Builds `a op b`, freeing the freshly created operand `b` on failure.
    fn binary_or_free(&mut self, op: BinaryOp, a: NodeId, b: NodeId) -> Result<NodeId> {
        self.broadcast_binary(op, a, b, Broadcast::Trailing)
            .inspect_err(|_| self.free_if_unreferenced(b))
    }

    binary_constructors! {
        /// Elementwise sum.
        add, add_scalar => Add;
        /// Elementwise difference.
        sub, sub_scalar => Sub;
        /// Elementwise product.
        mul, mul_scalar => Mul;
        /// Elementwise quotient. Integer division by zero yields 0.
        div, div_scalar => Div;
        pow, pow_scalar => Pow;
        min, min_scalar => Min;
        max, max_scalar => Max;
        /// `1` where `a < b`, else `0` (int32).
        less, less_scalar => Less;
        /// `1` where `a > b`, else `0` (int32).
        greater, greater_scalar => Greater;
        /// `1` where `a == b`, else `0` (int32).
        equal, equal_scalar => Equal;
    }

    /// `value - a`.
    pub fn rsub_scalar(&mut self, value: impl Into<Value>, a: NodeId) -> Result<NodeId> {
        let s = self.scalar(value.into())?;
        self.broadcast_binary(BinaryOp::Sub, s, a, Broadcast::Trailing)
            .inspect_err(|_| self.free_if_unreferenced(s))
    }

    /// `value / a`.
    pub fn rdiv_scalar(&mut self, value: impl Into<Value>, a: NodeId) -> Result<NodeId> {
        let s = self.scalar(value.into())?;
        self.broadcast_binary(BinaryOp::Div, s, a, Broadcast::Trailing)
            .inspect_err(|_| self.free_if_unreferenced(s))
    }

    pub fn unary(&mut self, op: UnaryOp, a: NodeId) -> Result<NodeId> {
        self.construct(Op::Unary(op), &[a])
    }

    unary_constructors! {
        neg => Neg;
        /// Natural logarithm.
        log => Log;
        log2 => Log2;
        log10 => Log10;
        sin => Sin;
        cos => Cos;
        tan => Tan;
        asin => Asin;
        acos => Acos;
        atan => Atan;
        sqrt => Sqrt;
        exp => Exp;
        abs => Abs;
        /// `-1` for negative elements, `1` otherwise (int32).
        sign => Sign;
        /// `1` for even integers, `0` for odd ones; integer input only.
        even => Even;
    }

    /// Batched matrix product over the last two dimensions.
    ///
    /// The leading (batch) dimensions of the lower-rank operand must equal the
    /// trailing batch dimensions of the other; the result carries the
    /// higher-rank operand's batch dimensions.
    pub fn matmul(&mut self, a: NodeId, b: NodeId) -> Result<NodeId> {
        self.construct(Op::Matmul, &[a, b])
    }

    /// Reduces `axis` away; a rank-1 input reduces to shape `[1]`.
    pub fn reduce(&mut self, op: ReduceOp, a: NodeId, axis: usize) -> Result<NodeId> {
        self.construct(Op::Reduce { op, axis }, &[a])
    }

    reduce_constructors! {
        reduce_sum => Sum;
        reduce_mul => Mul;
        reduce_min => Min;
        reduce_max => Max;
    }

    pub fn reshape(&mut self, a: NodeId, shape: &[usize]) -> Result<NodeId> {
        self.construct(
            Op::Reshape {
                shape: shape.to_vec(),
            },
            &[a],
        )
    }

    /// Reshapes to one dimension.
    pub fn flatten(&mut self, a: NodeId) -> Result<NodeId> {
        let count = self.graph.node(a)?.numel();
        self.reshape(a, &[count])
    }

    /// Merges dimension `dim` into `dim - 1`.
    pub fn flatten_dim(&mut self, a: NodeId, dim: usize) -> Result<NodeId> {
        let shape = &self.graph.node(a)?.shape;
        if dim == 0 || dim >= shape.len() {
            return Err(GraphError::InvalidAxis {
                op: "flatten_dim",
                axis: dim,
                rank: shape.len(),
            });
        }
        let mut merged = shape.clone();
        let inner = merged.remove(dim);
        merged[dim - 1] *= inner;
        self.reshape(a, &merged)
    }

    /// Converts the element type. Always returns a new node, even when `a`
    /// already has type `dtype`.
    pub fn convert(&mut self, a: NodeId, dtype: DType) -> Result<NodeId> {
        self.construct(Op::Convert(dtype), &[a])
    }

    /// Selects `start..end` (end exclusive) per dimension.
    ///
    /// Negative indices count from the end of the dimension.
    pub fn slice(&mut self, a: NodeId, start: &[isize], end: &[isize]) -> Result<NodeId> {
        let step = vec![1; start.len()];
        self.slice_step(a, start, end, &step)
    }

    /// Selects every `step`-th element of `start..end` per dimension.
    ///
    /// A negative step walks backwards and requires `start > end`; to run down
    /// to index 0 pass `end = -(extent + 1)`.
    pub fn slice_step(
        &mut self,
        a: NodeId,
        start: &[isize],
        end: &[isize],
        step: &[isize],
    ) -> Result<NodeId> {
        let shape = self.graph.node(a)?.shape.clone();
        let rank = shape.len();
        if start.len() != rank || end.len() != rank || step.len() != rank {
            return Err(GraphError::InvalidSlice(format!(
                "expected {rank} entries per parameter"
            )));
        }
        let mut resolved = Vec::with_capacity(rank);
        let mut out = Vec::with_capacity(rank);
        for d in 0..rank {
            let extent = shape[d] as isize;
            let resolve = |v: isize| if v < 0 { v + extent } else { v };
            let (s, e, t) = (resolve(start[d]), resolve(end[d]), step[d]);
            if t == 0 {
                return Err(GraphError::InvalidSlice(format!("zero step in dimension {d}")));
            }
            let in_range = if t > 0 {
                s >= 0 && s < e && e <= extent
            } else {
                s < extent && s > e && e >= -1
            };
            if !in_range {
                return Err(GraphError::InvalidSlice(format!(
                    "dimension {d}: {}..{} with step {t} selects nothing in extent {extent}",
                    start[d], end[d]
                )));
            }
            resolved.push(s as usize);
            out.push(((e - s).unsigned_abs()).div_ceil(t.unsigned_abs()));
        }
        self.slice_resolved(a, resolved, step.to_vec(), out)
    }

    /// Slice with already resolved `start`, per-dimension `step` and output shape.
    pub(crate) fn slice_resolved(
        &mut self,
        a: NodeId,
        start: Vec<usize>,
        step: Vec<isize>,
        shape: Vec<usize>,
    ) -> Result<NodeId> {
        self.construct(Op::Slice { start, step, shape }, &[a])
    }

    /// Embeds `a` into a zero tensor of `shape`, with its origin at `insert_at`.
    pub fn extend(&mut self, a: NodeId, shape: &[usize], insert_at: &[usize]) -> Result<NodeId> {
        let step = vec![1; insert_at.len()];
        self.extend_step(a, shape, insert_at, &step)
    }

    /// Embeds `a` into a zero tensor of `shape`, spacing elements `|step|`
    /// apart from `insert_at` on; a negative step stores them in reverse order.
    pub fn extend_step(
        &mut self,
        a: NodeId,
        shape: &[usize],
        insert_at: &[usize],
        step: &[isize],
    ) -> Result<NodeId> {
        let src = self.graph.node(a)?.shape.clone();
        if insert_at.len() != src.len() || step.len() != src.len() {
            return Err(GraphError::InvalidExtend(format!(
                "expected {} entries per parameter",
                src.len()
            )));
        }
        let start = (0..src.len())
            .map(|d| {
                if step[d] < 0 {
                    src[d]
                        .saturating_sub(1)
                        .checked_mul(step[d].unsigned_abs())
                        .and_then(|span| span.checked_add(insert_at[d]))
                        .ok_or_else(|| {
                            GraphError::InvalidExtend(format!(
                                "dimension {d}: step {} overflows the target index range",
                                step[d]
                            ))
                        })
                } else {
                    Ok(insert_at[d])
                }
            })
            .collect::<Result<Vec<_>>>()?;
        self.extend_resolved(a, shape.to_vec(), start, step.to_vec())
    }

    /// Extend where source element `o` lands on `start + o * step`.
    pub(crate) fn extend_resolved(
        &mut self,
        a: NodeId,
        shape: Vec<usize>,
        start: Vec<usize>,
        step: Vec<isize>,
    ) -> Result<NodeId> {
        self.construct(Op::Extend { start, step, shape }, &[a])
    }

    /// Tiles `a`, dimension `d` being repeated `reps[d]` times.
    pub fn repeat(&mut self, a: NodeId, reps: &[usize]) -> Result<NodeId> {
        self.construct(
            Op::Repeat {
                reps: reps.to_vec(),
            },
            &[a],
        )
    }

    /// Inserts a new dimension of extent `size` at `axis`, repeating the data along it.
    pub fn expand(&mut self, a: NodeId, axis: usize, size: usize) -> Result<NodeId> {
        let mut shape = self.graph.node(a)?.shape.clone();
        if axis > shape.len() {
            return Err(GraphError::InvalidAxis {
                op: "expand",
                axis,
                rank: shape.len(),
            });
        }
        shape.insert(axis, 1);
        let reshaped = self.reshape(a, &shape)?;
        let mut reps = vec![1; shape.len()];
        reps[axis] = size;
        self.repeat(reshaped, &reps)
            .inspect_err(|_| self.free_if_unreferenced(reshaped))
    }

    /// Permutes dimensions: output dimension `d` is input dimension `perm[d]`.
    pub fn transpose(&mut self, a: NodeId, perm: &[usize]) -> Result<NodeId> {
        self.construct(
            Op::Transpose {
                perm: perm.to_vec(),
            },
            &[a],
        )
    }

    /// Swaps the last two dimensions.
    pub fn transpose_last2(&mut self, a: NodeId) -> Result<NodeId> {
        let rank = self.graph.node(a)?.shape.len();
        if rank < 2 {
            return Err(GraphError::RankMismatch {
                op: "transpose",
                expected: 2,
                got: rank,
            });
        }
        let mut perm: Vec<usize> = (0..rank).collect();
        perm.swap(rank - 1, rank - 2);
        self.transpose(a, &perm)
    }

    /// Joins `a` and `b` along `axis`.
    pub fn concat(&mut self, a: NodeId, b: NodeId, axis: usize) -> Result<NodeId> {
        self.construct(Op::Concat { axis }, &[a, b])
    }

    /// Convolves `image` (`[p1..pn, c]`) with `kernel` (`[k1..kn, c]`, or
    /// `[f, k1..kn, c]` for `f` filters) moving `steps[d]` per spatial dimension.
    pub fn convolve(&mut self, image: NodeId, kernel: NodeId, steps: &[usize]) -> Result<NodeId> {
        self.construct(
            Op::Convolve {
                steps: steps.to_vec(),
            },
            &[image, kernel],
        )
    }

    /// Gradient of a convolution with respect to its image.
    pub fn gradient_convolve1(
        &mut self,
        kernel: NodeId,
        adjoint: NodeId,
        image_shape: &[usize],
        steps: &[usize],
    ) -> Result<NodeId> {
        self.construct(
            Op::GradientConvolve1 {
                steps: steps.to_vec(),
                image_shape: image_shape.to_vec(),
            },
            &[kernel, adjoint],
        )
    }

    /// Gradient of a convolution with respect to its kernel.
    pub fn gradient_convolve2(
        &mut self,
        image: NodeId,
        adjoint: NodeId,
        kernel_shape: &[usize],
        steps: &[usize],
    ) -> Result<NodeId> {
        self.construct(
            Op::GradientConvolve2 {
                steps: steps.to_vec(),
                kernel_shape: kernel_shape.to_vec(),
            },
            &[image, adjoint],
        )
    }

    /// Collects every window of `size` (moving by `steps`) into `[windows, size..]`.
    pub fn sliding_window(&mut self, a: NodeId, size: &[usize], steps: &[usize]) -> Result<NodeId> {
        self.construct(
            Op::SlidingWindow {
                size: size.to_vec(),
                steps: steps.to_vec(),
            },
            &[a],
        )
    }

    /// Inverse of [`Session::sliding_window`]: sums overlapping windows back into `shape`.
    pub fn unslide(&mut self, windows: NodeId, shape: &[usize], steps: &[usize]) -> Result<NodeId> {
        self.construct(
            Op::Unslide {
                steps: steps.to_vec(),
                shape: shape.to_vec(),
            },
            &[windows],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_literal_is_rank_one() {
        let mut s = Session::new();
        let t = s.create(&[4.0f64], &[]).unwrap();
        assert_eq!(s.shape(t).unwrap(), &[1]);
    }

    #[test]
    fn test_negative_slice_resolution() {
        let mut s = Session::new();
        let a = s.arange(&[5], 0).unwrap();
        let b = s.slice_step(a, &[-1], &[-6], &[-2]).unwrap();
        assert_eq!(s.read::<i64>(b).unwrap(), vec![4, 2, 0]);
        assert!(s.slice_step(a, &[0], &[3], &[0]).is_err());
        assert!(s.slice(a, &[3], &[3]).is_err());
    }

    #[test]
    fn test_flatten_dim() {
        let mut s = Session::new();
        let a = s.constant(1i32, &[2, 3, 4]).unwrap();
        let b = s.flatten_dim(a, 2).unwrap();
        assert_eq!(s.shape(b).unwrap(), &[2, 12]);
        assert!(s.flatten_dim(a, 0).is_err());
    }

    #[test]
    fn test_failed_scalar_op_leaves_no_garbage() {
        let mut s = Session::new();
        let a = s.create(&[1i32, 2], &[2]).unwrap();
        let before = s.live_nodes();
        assert!(s.even(a).is_ok());
        let f = s.create(&[1.0f32], &[1]).unwrap();
        assert!(s.even(f).is_err());
        assert_eq!(s.live_nodes(), before + 2);
    }
}
