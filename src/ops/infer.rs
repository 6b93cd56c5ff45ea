//! Shape and type inference, one rule per operation kind.
//!
//! Inference is a pure function of the predecessors' shapes/types and the
//! payload. It runs exactly once, before a node is inserted, and is the only
//! place where construction can fail.

use super::{BinaryOp, Op, UnaryOp};
use crate::error::{GraphError, Result};
use crate::graph::shape::{broadcast, checked_numel, numel, window_count};
use crate::tensors::DType;

/// Shape and element type of one predecessor.
pub type Input<'a> = (&'a [usize], DType);

/// Infers the output shape and type of `op` applied to `inputs`.
pub fn infer(op: &Op, inputs: &[Input<'_>]) -> Result<(Vec<usize>, DType)> {
    if inputs.len() != op.arity() {
        return Err(GraphError::argument(format!(
            "{} takes {} operands, got {}",
            op.kind().name(),
            op.arity(),
            inputs.len()
        )));
    }
    let (shape, dtype) = match op {
        Op::Store { shape, dtype } => Ok((checked_shape("store", shape)?, *dtype)),
        Op::Const { value, shape } => Ok((checked_shape("const", shape)?, value.dtype())),
        Op::Random { shape, .. } => Ok((checked_shape("random", shape)?, DType::Float64)),
        Op::Arange { axis, shape } => {
            let shape = checked_shape("arange", shape)?;
            check_axis("arange", *axis, shape.len())?;
            Ok((shape, DType::Int64))
        }
        Op::Binary { op, broadcast: mode } => {
            let (a, ta) = inputs[0];
            let (b, tb) = inputs[1];
            let shape = broadcast(binary_name(*op), a, b, *mode)?;
            let dtype = if op.is_comparison() {
                DType::Int32
            } else {
                ta.unify(tb)
            };
            Ok((shape, dtype))
        }
        Op::Unary(op) => unary(*op, inputs[0]),
        Op::Matmul => matmul(inputs[0], inputs[1]),
        Op::Reduce { axis, .. } => {
            let (a, t) = inputs[0];
            check_axis("reduce", *axis, a.len())?;
            let mut shape = a.to_vec();
            shape.remove(*axis);
            if shape.is_empty() {
                shape.push(1);
            }
            Ok((shape, t))
        }
        Op::Reshape { shape } => {
            let (a, t) = inputs[0];
            let shape = checked_shape("reshape", shape)?;
            if numel(&shape) != numel(a) {
                return Err(GraphError::ShapeMismatch {
                    op: "reshape",
                    lhs: a.to_vec(),
                    rhs: shape,
                });
            }
            Ok((shape, t))
        }
        Op::Convert(dtype) => Ok((inputs[0].0.to_vec(), *dtype)),
        Op::Slice { start, step, shape } => {
            slice(inputs[0].0, start, step, shape)?;
            Ok((shape.clone(), inputs[0].1))
        }
        Op::Extend { start, step, shape } => {
            extend(inputs[0].0, start, step, shape)?;
            Ok((shape.clone(), inputs[0].1))
        }
        Op::Repeat { reps } => {
            let (a, t) = inputs[0];
            if reps.len() != a.len() || reps.contains(&0) {
                return Err(GraphError::argument(format!(
                    "repeat: invalid repetitions {reps:?} for shape {a:?}"
                )));
            }
            let shape = a
                .iter()
                .zip(reps)
                .map(|(d, r)| d.checked_mul(*r))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| {
                    GraphError::argument(format!("repeat: {reps:?} overflows shape {a:?}"))
                })?;
            Ok((shape, t))
        }
        Op::Transpose { perm } => {
            let (a, t) = inputs[0];
            let mut seen = vec![false; a.len()];
            for &p in perm {
                if p >= a.len() || std::mem::replace(&mut seen[p], true) {
                    return Err(GraphError::argument(format!(
                        "transpose: {perm:?} is not a permutation of rank {}",
                        a.len()
                    )));
                }
            }
            if perm.len() != a.len() {
                return Err(GraphError::RankMismatch {
                    op: "transpose",
                    expected: a.len(),
                    got: perm.len(),
                });
            }
            Ok((perm.iter().map(|&p| a[p]).collect(), t))
        }
        Op::Concat { axis } => {
            let (a, ta) = inputs[0];
            let (b, tb) = inputs[1];
            check_axis("concat", *axis, a.len())?;
            let compatible = a.len() == b.len()
                && a.iter()
                    .zip(b)
                    .enumerate()
                    .all(|(d, (x, y))| d == *axis || x == y);
            if !compatible {
                return Err(GraphError::ShapeMismatch {
                    op: "concat",
                    lhs: a.to_vec(),
                    rhs: b.to_vec(),
                });
            }
            let mut shape = a.to_vec();
            shape[*axis] = a[*axis].checked_add(b[*axis]).ok_or_else(|| {
                GraphError::argument(format!("concat: axis {axis} overflows"))
            })?;
            Ok((shape, ta.unify(tb)))
        }
        Op::Convolve { steps } => {
            let (image, ti) = inputs[0];
            let (kernel, tk) = inputs[1];
            Ok((convolve_shape(image, kernel, steps)?, ti.unify(tk)))
        }
        Op::GradientConvolve1 { steps, image_shape } => {
            let (kernel, tk) = inputs[0];
            let (adjoint, ta) = inputs[1];
            let expected = convolve_shape(image_shape, kernel, steps)?;
            if expected != adjoint {
                return Err(GraphError::ShapeMismatch {
                    op: "gradient_convolve1",
                    lhs: expected,
                    rhs: adjoint.to_vec(),
                });
            }
            Ok((image_shape.clone(), tk.unify(ta)))
        }
        Op::GradientConvolve2 { steps, kernel_shape } => {
            let (image, ti) = inputs[0];
            let (adjoint, ta) = inputs[1];
            let expected = convolve_shape(image, kernel_shape, steps)?;
            if expected != adjoint {
                return Err(GraphError::ShapeMismatch {
                    op: "gradient_convolve2",
                    lhs: expected,
                    rhs: adjoint.to_vec(),
                });
            }
            Ok((kernel_shape.clone(), ti.unify(ta)))
        }
        Op::SlidingWindow { size, steps } => {
            let (a, t) = inputs[0];
            if size.len() != a.len() || steps.len() != a.len() {
                return Err(GraphError::RankMismatch {
                    op: "sliding_window",
                    expected: a.len(),
                    got: size.len().min(steps.len()),
                });
            }
            check_windows("sliding_window", a, size, steps)?;
            let windows: usize = (0..a.len())
                .map(|d| window_count(a[d], size[d], steps[d]))
                .product();
            let mut shape = vec![windows];
            shape.extend_from_slice(size);
            Ok((shape, t))
        }
        Op::Unslide { steps, shape } => {
            let (a, t) = inputs[0];
            let shape = checked_shape("unslide", shape)?;
            if a.len() != shape.len() + 1 || steps.len() != shape.len() {
                return Err(GraphError::RankMismatch {
                    op: "unslide",
                    expected: shape.len() + 1,
                    got: a.len(),
                });
            }
            let size = &a[1..];
            check_windows("unslide", &shape, size, steps)?;
            let windows: usize = (0..shape.len())
                .map(|d| window_count(shape[d], size[d], steps[d]))
                .product();
            if windows != a[0] {
                return Err(GraphError::ShapeMismatch {
                    op: "unslide",
                    lhs: a.to_vec(),
                    rhs: shape,
                });
            }
            Ok((shape, t))
        }
    }?;
    if checked_numel(&shape).is_none() {
        return Err(GraphError::argument(format!(
            "{}: {shape:?} holds more elements than fit in memory",
            op.kind().name()
        )));
    }
    Ok((shape, dtype))
}

fn binary_name(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "add",
        BinaryOp::Sub => "sub",
        BinaryOp::Mul => "mul",
        BinaryOp::Div => "div",
        BinaryOp::Pow => "pow",
        BinaryOp::Min => "min",
        BinaryOp::Max => "max",
        BinaryOp::Less => "less",
        BinaryOp::Greater => "greater",
        BinaryOp::Equal => "equal",
    }
}

fn checked_shape(op: &'static str, shape: &[usize]) -> Result<Vec<usize>> {
    if shape.is_empty() || shape.contains(&0) {
        return Err(GraphError::argument(format!(
            "{op}: shape {shape:?} must be non-empty without zero extents"
        )));
    }
    if checked_numel(shape).is_none() {
        return Err(GraphError::argument(format!(
            "{op}: shape {shape:?} holds more elements than fit in memory"
        )));
    }
    Ok(shape.to_vec())
}

/// Flat position `start + (count - 1) * step` of the last touched element,
/// `None` when it overflows.
fn last_position(start: usize, count: usize, step: isize) -> Option<isize> {
    let start = isize::try_from(start).ok()?;
    let count = isize::try_from(count).ok()?;
    (count - 1).checked_mul(step)?.checked_add(start)
}

fn check_axis(op: &'static str, axis: usize, rank: usize) -> Result<()> {
    if axis >= rank {
        return Err(GraphError::InvalidAxis { op, axis, rank });
    }
    Ok(())
}

fn unary(op: UnaryOp, (a, t): Input<'_>) -> Result<(Vec<usize>, DType)> {
    let dtype = match op {
        UnaryOp::Neg | UnaryOp::Abs => t,
        UnaryOp::Sign => DType::Int32,
        UnaryOp::Even if t.is_int() => DType::Int32,
        UnaryOp::Even => return Err(GraphError::TypeError { op: "even", dtype: t }),
        _ => t.float_result(),
    };
    Ok((a.to_vec(), dtype))
}

fn matmul((a, ta): Input<'_>, (b, tb): Input<'_>) -> Result<(Vec<usize>, DType)> {
    let mismatch = || GraphError::ShapeMismatch {
        op: "matmul",
        lhs: a.to_vec(),
        rhs: b.to_vec(),
    };
    if a.len() < 2 || b.len() < 2 {
        return Err(GraphError::RankMismatch {
            op: "matmul",
            expected: 2,
            got: a.len().min(b.len()),
        });
    }
    let (l, m) = (a[a.len() - 2], a[a.len() - 1]);
    let (mb, n) = (b[b.len() - 2], b[b.len() - 1]);
    if m != mb {
        return Err(mismatch());
    }
    let batch_a = &a[..a.len() - 2];
    let batch_b = &b[..b.len() - 2];
    let (high, low) = if batch_a.len() >= batch_b.len() {
        (batch_a, batch_b)
    } else {
        (batch_b, batch_a)
    };
    if &high[high.len() - low.len()..] != low {
        return Err(mismatch());
    }
    let mut shape = high.to_vec();
    shape.extend([l, n]);
    Ok((shape, ta.unify(tb)))
}

fn slice(a: &[usize], start: &[usize], step: &[isize], shape: &[usize]) -> Result<()> {
    if start.len() != a.len() || step.len() != a.len() || shape.len() != a.len() {
        return Err(GraphError::InvalidSlice(format!(
            "expected {} entries per parameter",
            a.len()
        )));
    }
    for d in 0..a.len() {
        if step[d] == 0 {
            return Err(GraphError::InvalidSlice(format!("zero step in dimension {d}")));
        }
        if shape[d] == 0 {
            return Err(GraphError::InvalidSlice(format!("empty selection in dimension {d}")));
        }
        let last = last_position(start[d], shape[d], step[d]).unwrap_or(-1);
        if start[d] >= a[d] || last < 0 || last >= a[d] as isize {
            return Err(GraphError::InvalidSlice(format!(
                "dimension {d}: start {} with step {} and {} elements leaves extent {}",
                start[d], step[d], shape[d], a[d]
            )));
        }
    }
    Ok(())
}

fn extend(a: &[usize], start: &[usize], step: &[isize], shape: &[usize]) -> Result<()> {
    if start.len() != a.len() || step.len() != a.len() || shape.len() != a.len() {
        return Err(GraphError::InvalidExtend(format!(
            "expected {} entries per parameter",
            a.len()
        )));
    }
    for d in 0..a.len() {
        if step[d] == 0 {
            return Err(GraphError::InvalidExtend(format!("zero step in dimension {d}")));
        }
        let last = last_position(start[d], a[d], step[d]).unwrap_or(-1);
        if start[d] >= shape[d] || last < 0 || last >= shape[d] as isize {
            return Err(GraphError::InvalidExtend(format!(
                "dimension {d}: {} elements from {} with step {} do not fit into {}",
                a[d], start[d], step[d], shape[d]
            )));
        }
    }
    Ok(())
}

fn check_windows(op: &'static str, extent: &[usize], size: &[usize], steps: &[usize]) -> Result<()> {
    for d in 0..extent.len() {
        if steps[d] == 0 || size[d] == 0 || size[d] > extent[d] {
            return Err(GraphError::argument(format!(
                "{op}: window {size:?} with steps {steps:?} does not fit {extent:?}"
            )));
        }
    }
    Ok(())
}

/// Output shape of a convolution.
///
/// `image` is `[p1..pn, c]`; `kernel` is `[k1..kn, c]` (one filter, output
/// `[o1..on]`) or `[f, k1..kn, c]` (output `[o1..on, f]`), with
/// `o_d = 1 + (p_d - 1) / step_d`.
pub fn convolve_shape(image: &[usize], kernel: &[usize], steps: &[usize]) -> Result<Vec<usize>> {
    let mismatch = || GraphError::ShapeMismatch {
        op: "convolve",
        lhs: image.to_vec(),
        rhs: kernel.to_vec(),
    };
    if image.len() < 2 {
        return Err(GraphError::RankMismatch {
            op: "convolve",
            expected: 2,
            got: image.len(),
        });
    }
    let multi = kernel.len() == image.len() + 1;
    if !multi && kernel.len() != image.len() {
        return Err(mismatch());
    }
    let spatial = image.len() - 1;
    if steps.len() != spatial || steps.contains(&0) {
        return Err(GraphError::argument(format!(
            "convolve: need {spatial} non-zero steps, got {steps:?}"
        )));
    }
    let k = if multi { &kernel[1..] } else { kernel };
    if k[spatial] != image[spatial] || k.contains(&0) {
        return Err(mismatch());
    }
    let mut shape: Vec<usize> = (0..spatial).map(|d| 1 + (image[d] - 1) / steps[d]).collect();
    if multi {
        shape.push(kernel[0]);
    }
    Ok(shape)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::Broadcast;

    const F: DType = DType::Float64;

    #[test]
    fn test_matmul_batch_shape() {
        let (shape, t) = infer(&Op::Matmul, &[(&[2, 2, 3], DType::Int32), (&[3, 4], F)]).unwrap();
        assert_eq!(shape, vec![2, 2, 4]);
        assert_eq!(t, F);
        assert!(infer(&Op::Matmul, &[(&[2, 3], F), (&[2, 3], F)]).is_err());
    }

    #[test]
    fn test_comparison_is_int32() {
        let op = Op::Binary {
            op: BinaryOp::Less,
            broadcast: Broadcast::Trailing,
        };
        let (_, t) = infer(&op, &[(&[2], F), (&[2], F)]).unwrap();
        assert_eq!(t, DType::Int32);
    }

    #[test]
    fn test_convolve_shapes() {
        assert_eq!(convolve_shape(&[5, 5, 3], &[2, 2, 3], &[2, 2]).unwrap(), vec![3, 3]);
        assert_eq!(
            convolve_shape(&[5, 5, 3], &[4, 2, 2, 3], &[1, 2]).unwrap(),
            vec![5, 3, 4]
        );
        assert!(convolve_shape(&[5, 5, 3], &[2, 2, 2], &[1, 1]).is_err());
    }

    #[test]
    fn test_slice_bounds() {
        assert!(slice(&[4], &[3], &[-1], &[4]).is_ok());
        assert!(slice(&[4], &[3], &[-1], &[5]).is_err());
        assert!(slice(&[4], &[0], &[0], &[1]).is_err());
    }

    #[test]
    fn test_overflowing_payloads_are_errors() {
        let repeat = Op::Repeat {
            reps: vec![usize::MAX],
        };
        assert!(infer(&repeat, &[(&[2], F)]).is_err());
        let extend = Op::Extend {
            start: vec![0],
            step: vec![isize::MAX],
            shape: vec![8],
        };
        assert!(matches!(
            infer(&extend, &[(&[3], F)]),
            Err(GraphError::InvalidExtend(_))
        ));
        let huge = Op::Const {
            value: crate::tensors::Value::Float64(1.0),
            shape: vec![1 << 33, 1 << 33, 1 << 33],
        };
        assert!(infer(&huge, &[]).is_err());
    }

    #[test]
    fn test_even_rejects_floats() {
        assert!(unary(UnaryOp::Even, (&[2], F)).is_err());
        assert_eq!(unary(UnaryOp::Sin, (&[2], DType::Int32)).unwrap().1, DType::Float64);
    }
}
