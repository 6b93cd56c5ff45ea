//! Parallel CPU backend
//!
//! # CPU Backend
//!
//! Interprets one node at a time over its flattened output buffer. The output
//! is split into contiguous index ranges that [`rayon`](https://docs.rs/rayon)
//! hands to worker threads; every kernel is a pure function of
//! `(from, &mut out[from..from + len])` and the materialized predecessor
//! buffers, so ranges can run in any order.
//!
//! Predecessor buffers are converted to the node's element type up front
//! (borrowing when no conversion is needed), which keeps kernels generic over
//! a single [`Element`] type. Comparisons, `sign` and `even` are the exceptions:
//! they read in the operands' type and write `int32`.
//!
//! ## Kernel Families
//!
//! - [`elementwise`] — broadcast binary ops, comparisons, unary functions
//! - [`generators`] — constants, hashed random numbers, `arange`
//! - [`reductions`] — axis reductions and batched matrix products
//! - [`shape`] — slice, extend, repeat, transpose, concat
//! - [`convolution`] — convolution, its gradients, sliding windows

pub mod convolution;
pub mod elementwise;
pub mod generators;
pub mod reductions;
pub mod shape;

use crate::error::{GraphError, Result};
use crate::graph::{Graph, Node, NodeId};
use crate::ops::{Op, UnaryOp};
use crate::tensors::{Buffer, DType, Element, try_alloc};
use rayon::prelude::*;
use std::borrow::Cow;

/// Runs `$body` with the type alias `$t` bound to the Rust type of `$dtype`.
macro_rules! for_dtype {
    ($dtype:expr, $t:ident => $body:expr) => {
        match $dtype {
            DType::Int32 => {
                type $t = i32;
                $body
            }
            DType::Int64 => {
                type $t = i64;
                $body
            }
            DType::Float32 => {
                type $t = f32;
                $body
            }
            DType::Float64 => {
                type $t = f64;
                $body
            }
        }
    };
}

/// Allocates `len` elements and fills them range by range in parallel.
pub(crate) fn run<T, K>(len: usize, chunk: usize, kernel: K) -> Result<Vec<T>>
where
    T: Element,
    K: Fn(usize, &mut [T]) + Sync,
{
    let mut out = try_alloc::<T>(len)?;
    let chunk = chunk.max(1);
    out.par_chunks_mut(chunk)
        .enumerate()
        .for_each(|(c, range)| kernel(c * chunk, range));
    Ok(out)
}

/// Adapts a per-element function to the range-kernel calling convention.
#[inline]
pub(crate) fn each<T: Element>(f: impl Fn(usize) -> T + Sync) -> impl Fn(usize, &mut [T]) + Sync {
    move |from, out| {
        for (k, v) in out.iter_mut().enumerate() {
            *v = f(from + k);
        }
    }
}

fn view<T: Element>(buffer: &Buffer) -> Result<&[T]> {
    T::view(buffer).ok_or_else(|| {
        GraphError::Backend(format!(
            "expected {:?} buffer, found {:?}",
            T::DTYPE,
            buffer.dtype()
        ))
    })
}

/// Computes the result buffer of `id`. All predecessors must be materialized.
pub fn execute_node(graph: &Graph, id: NodeId, chunk: usize) -> Result<Buffer> {
    let node = graph.node(id)?;
    let preds = node
        .preds
        .iter()
        .map(|p| graph.node(*p))
        .collect::<Result<Vec<_>>>()?;
    let inputs = preds
        .iter()
        .map(|p| {
            p.result.as_ref().ok_or_else(|| {
                GraphError::Backend(format!("predecessor of {id:?} is not materialized"))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    log::trace!("cpu: {id:?} {} {:?}", node.kind().name(), node.shape);

    let len = node.numel();
    match &node.op {
        Op::Store { .. } => node
            .result
            .clone()
            .ok_or_else(|| GraphError::Backend(format!("store {id:?} holds no data"))),
        Op::Convert(dtype) => Ok(inputs[0].cast(*dtype).into_owned()),
        Op::Binary { op, broadcast } if op.is_comparison() => {
            let ty = preds[0].dtype.unify(preds[1].dtype);
            let (a, b) = (inputs[0].cast(ty), inputs[1].cast(ty));
            for_dtype!(ty, U => {
                let (a, b) = (view::<U>(&a)?, view::<U>(&b)?);
                let out = run::<i32, _>(len, chunk, |from, out| {
                    elementwise::compare(*op, *broadcast, a, b, len, from, out)
                })?;
                Ok(Buffer::Int32(out))
            })
        }
        Op::Unary(op @ (UnaryOp::Sign | UnaryOp::Even)) => {
            for_dtype!(preds[0].dtype, U => {
                let a = view::<U>(inputs[0])?;
                let out = run::<i32, _>(len, chunk, |from, out| {
                    elementwise::classify(*op, a, from, out)
                })?;
                Ok(Buffer::Int32(out))
            })
        }
        _ => for_dtype!(node.dtype, T => {
            let cast: Vec<Cow<'_, Buffer>> = inputs.iter().map(|b| b.cast(T::DTYPE)).collect();
            let views = cast.iter().map(|c| view::<T>(c)).collect::<Result<Vec<_>>>()?;
            Ok(T::wrap(typed::<T>(node, &preds, &views, chunk)?))
        }),
    }
}

/// Kernels whose operands share the output element type.
fn typed<T: Element>(node: &Node, preds: &[&Node], x: &[&[T]], chunk: usize) -> Result<Vec<T>> {
    let len = node.numel();
    let out = &node.shape;
    match &node.op {
        Op::Const { value, .. } => {
            let v = T::from_value(*value);
            run(len, chunk, |_, out: &mut [T]| out.fill(v))
        }
        Op::Random { seed, .. } => {
            let seed = *seed;
            run(len, chunk, each(|i| T::from_f64(generators::random_value(seed, i))))
        }
        Op::Arange { axis, .. } => {
            let coord = generators::arange(out, *axis);
            run(len, chunk, each(|i| T::from_f64(coord(i) as f64)))
        }
        Op::Binary { op, broadcast } => run(len, chunk, |from, o: &mut [T]| {
            elementwise::binary(*op, *broadcast, x[0], x[1], len, from, o)
        }),
        Op::Unary(op) => run(len, chunk, |from, o: &mut [T]| elementwise::unary(*op, x[0], from, o)),
        Op::Reshape { .. } => {
            let mut data = Vec::new();
            data.try_reserve_exact(len).map_err(|_| GraphError::Allocation {
                bytes: len.saturating_mul(T::DTYPE.size()),
            })?;
            data.extend_from_slice(x[0]);
            Ok(data)
        }
        Op::Matmul => {
            let mm = reductions::MatmulDims::new(&preds[0].shape, &preds[1].shape);
            run(len, chunk, |from, o: &mut [T]| mm.kernel(x[0], x[1], from, o))
        }
        Op::Reduce { op, axis } => {
            let r = reductions::Reduction::new(&preds[0].shape, *axis);
            run(len, chunk, |from, o: &mut [T]| r.kernel(*op, x[0], from, o))
        }
        Op::Slice { start, step, .. } => {
            let index = shape::slice_index(out, &preds[0].shape, start, step);
            run(len, chunk, each(|i| x[0][index(i)]))
        }
        Op::Extend { start, step, .. } => {
            let index = shape::extend_index(out, &preds[0].shape, start, step);
            run(len, chunk, each(|i| index(i).map_or(T::zero(), |j| x[0][j])))
        }
        Op::Repeat { .. } => {
            let index = shape::repeat_index(out, &preds[0].shape);
            run(len, chunk, each(|i| x[0][index(i)]))
        }
        Op::Transpose { perm } => {
            let index = shape::transpose_index(out, &preds[0].shape, perm);
            run(len, chunk, each(|i| x[0][index(i)]))
        }
        Op::Concat { axis } => {
            let index = shape::concat_index(out, &preds[0].shape, *axis);
            run(len, chunk, each(|i| match index(i) {
                shape::Side::Left(j) => x[0][j],
                shape::Side::Right(j) => x[1][j],
            }))
        }
        Op::Convolve { steps } => {
            let conv = convolution::ConvGeometry::new(&preds[0].shape, &preds[1].shape, steps);
            run(len, chunk, |from, o: &mut [T]| conv.forward(x[0], x[1], from, o))
        }
        Op::GradientConvolve1 { steps, image_shape } => {
            let conv = convolution::ConvGeometry::new(image_shape, &preds[0].shape, steps);
            run(len, chunk, |from, o: &mut [T]| conv.image_gradient(x[0], x[1], from, o))
        }
        Op::GradientConvolve2 { steps, kernel_shape } => {
            let conv = convolution::ConvGeometry::new(&preds[0].shape, kernel_shape, steps);
            run(len, chunk, |from, o: &mut [T]| conv.kernel_gradient(x[0], x[1], from, o))
        }
        Op::SlidingWindow { size, steps } => {
            let w = convolution::Windows::new(&preds[0].shape, size, steps);
            run(len, chunk, each(|i| x[0][w.source(i)]))
        }
        Op::Unslide { steps, shape } => {
            let w = convolution::Windows::new(shape, &preds[0].shape[1..], steps);
            run(len, chunk, |from, o: &mut [T]| w.unslide(x[0], from, o))
        }
        Op::Store { .. } | Op::Convert(_) => Err(GraphError::Backend(format!(
            "{} has no typed kernel",
            node.kind().name()
        ))),
    }
}
