//! Local-gradient rules.
//!
//! [`local_gradient`] builds, as new graph nodes, the partial adjoint of one
//! predecessor given the adjoint of its consumer. The result has the
//! consumer's shape for elementwise kinds; the differentiation pass then
//! unbroadcasts it to the predecessor's shape. Since every rule is made of
//! ordinary nodes, gradients are themselves differentiable.

use crate::error::Result;
use crate::graph::NodeId;
use crate::ops::{BinaryOp, Broadcast, Op, ReduceOp, UnaryOp};
use crate::session::Session;
use crate::tensors::{DType, Value};

/// Scalar `v` typed so it does not promote a tensor of `dtype`.
fn typed(dtype: DType, v: f64) -> Value {
    if dtype.is_float() {
        Value::Float64(v).cast(dtype)
    } else if v.fract() == 0.0 {
        Value::Int32(v as i32).cast(dtype)
    } else {
        Value::Float64(v)
    }
}

impl Session {
    fn scalar_like(&self, like: NodeId, v: f64) -> Result<Value> {
        Ok(typed(self.graph.node(like)?.dtype, v))
    }

    /// `x * y` aligned the way the differentiated node was.
    fn mul_as(&mut self, x: NodeId, y: NodeId, mode: Broadcast) -> Result<NodeId> {
        self.broadcast_binary(BinaryOp::Mul, x, y, mode)
    }

    fn div_as(&mut self, x: NodeId, y: NodeId, mode: Broadcast) -> Result<NodeId> {
        self.broadcast_binary(BinaryOp::Div, x, y, mode)
    }

    /// Broadcasts a reduced tensor back over the reduced `axis` of `shape`.
    fn expand_reduced(&mut self, x: NodeId, shape: &[usize], axis: usize) -> Result<NodeId> {
        let mut kept = shape.to_vec();
        kept[axis] = 1;
        let r = self.reshape(x, &kept)?;
        let mut reps = vec![1; shape.len()];
        reps[axis] = shape[axis];
        self.repeat(r, &reps)
    }

    fn zeros_like(&mut self, like: NodeId, adj: NodeId) -> Result<NodeId> {
        let dtype = self.graph.node(adj)?.dtype;
        let shape = self.graph.node(like)?.shape.clone();
        self.constant(Value::zero(dtype), &shape)
    }
}

/// Partial adjoint of predecessor `k` of `id`, given `adj`, the adjoint of `id`.
pub fn local_gradient(s: &mut Session, id: NodeId, k: usize, adj: NodeId) -> Result<NodeId> {
    let node = s.graph.node(id)?;
    let op = node.op.clone();
    let preds = node.preds.clone();
    let a = preds[0];
    let b = preds.get(1).copied().unwrap_or(a);
    let pred = preds[k];
    let pred_shape = s.graph.node(pred)?.shape.clone();
    let pred_dtype = s.graph.node(pred)?.dtype;

    match op {
        Op::Binary { op, broadcast: mode } => match (op, k) {
            (BinaryOp::Add, _) | (BinaryOp::Sub, 0) => Ok(adj),
            (BinaryOp::Sub, _) => s.neg(adj),
            (BinaryOp::Mul, 0) => s.mul_as(adj, b, mode),
            (BinaryOp::Mul, _) => s.mul_as(adj, a, mode),
            (BinaryOp::Div, 0) => s.div_as(adj, b, mode),
            (BinaryOp::Div, _) => {
                // -(adj * a) / b^2
                let num = s.mul_as(adj, a, mode)?;
                let den = s.mul(b, b)?;
                let q = s.div_as(num, den, mode)?;
                s.neg(q)
            }
            (BinaryOp::Pow, 0) => {
                // adj * b * a^(b - 1)
                let one = s.scalar_like(b, 1.0)?;
                let bm1 = s.sub_scalar(b, one)?;
                let p = s.broadcast_binary(BinaryOp::Pow, a, bm1, mode)?;
                let f = s.mul_as(p, b, mode)?;
                s.mul_as(adj, f, mode)
            }
            (BinaryOp::Pow, _) => {
                // adj * a^b * ln a
                let ln = s.log(a)?;
                let f = s.mul_as(id, ln, mode)?;
                s.mul_as(adj, f, mode)
            }
            (BinaryOp::Min, _) | (BinaryOp::Max, _) => {
                // the operand that won receives the adjoint; ties go to `a`
                let cmp = if op == BinaryOp::Min { BinaryOp::Greater } else { BinaryOp::Less };
                let b_won = s.broadcast_binary(cmp, a, b, mode)?;
                let mask = if k == 0 {
                    s.rsub_scalar(1, b_won)?
                } else {
                    b_won
                };
                s.mul_as(adj, mask, mode)
            }
            (BinaryOp::Less | BinaryOp::Greater | BinaryOp::Equal, _) => s.zeros_like(pred, adj),
        },
        Op::Unary(op) => match op {
            UnaryOp::Neg => s.neg(adj),
            UnaryOp::Log => s.div(adj, a),
            UnaryOp::Log2 | UnaryOp::Log10 => {
                let base = if op == UnaryOp::Log2 {
                    std::f64::consts::LN_2
                } else {
                    std::f64::consts::LN_10
                };
                let v = s.scalar_like(adj, base)?;
                let den = s.mul_scalar(a, v)?;
                s.div(adj, den)
            }
            UnaryOp::Sin => {
                let c = s.cos(a)?;
                s.mul(adj, c)
            }
            UnaryOp::Cos => {
                let sin = s.sin(a)?;
                let g = s.mul(adj, sin)?;
                s.neg(g)
            }
            UnaryOp::Tan => {
                let c = s.cos(a)?;
                let c2 = s.mul(c, c)?;
                s.div(adj, c2)
            }
            UnaryOp::Asin | UnaryOp::Acos => {
                // 1 / sqrt(1 - a^2)
                let sq = s.mul(a, a)?;
                let one = s.scalar_like(adj, 1.0)?;
                let rest = s.rsub_scalar(one, sq)?;
                let root = s.sqrt(rest)?;
                let g = s.div(adj, root)?;
                if op == UnaryOp::Acos { s.neg(g) } else { Ok(g) }
            }
            UnaryOp::Atan => {
                let sq = s.mul(a, a)?;
                let one = s.scalar_like(sq, 1.0)?;
                let den = s.add_scalar(sq, one)?;
                s.div(adj, den)
            }
            UnaryOp::Sqrt => {
                let two = s.scalar_like(id, 2.0)?;
                let den = s.mul_scalar(id, two)?;
                s.div(adj, den)
            }
            UnaryOp::Exp => s.mul(adj, id),
            UnaryOp::Abs => {
                let sign = s.sign(a)?;
                s.mul(adj, sign)
            }
            UnaryOp::Sign | UnaryOp::Even => s.zeros_like(pred, adj),
        },
        Op::Convert(_) => s.convert(adj, pred_dtype),
        Op::Matmul => {
            if k == 0 {
                let bt = s.transpose_last2(b)?;
                s.matmul(adj, bt)
            } else {
                let at = s.transpose_last2(a)?;
                s.matmul(at, adj)
            }
        }
        Op::Reshape { .. } => s.reshape(adj, &pred_shape),
        Op::Transpose { perm } => {
            let mut inverse = vec![0; perm.len()];
            for (d, &p) in perm.iter().enumerate() {
                inverse[p] = d;
            }
            s.transpose(adj, &inverse)
        }
        Op::Repeat { reps } => {
            // fold every tiled dimension back, one at a time
            let mut g = adj;
            for d in 0..reps.len() {
                if reps[d] == 1 {
                    continue;
                }
                let mut split = s.graph.node(g)?.shape.clone();
                split[d] = pred_shape[d];
                split.insert(d, reps[d]);
                let r = s.reshape(g, &split)?;
                g = s.reduce_sum(r, d)?;
            }
            Ok(g)
        }
        Op::Reduce { op, axis } => {
            let adj = s.expand_reduced(adj, &pred_shape, axis)?;
            match op {
                ReduceOp::Sum => Ok(adj),
                ReduceOp::Mul => {
                    let y = s.expand_reduced(id, &pred_shape, axis)?;
                    let t = s.mul(adj, y)?;
                    s.div(t, a)
                }
                ReduceOp::Min | ReduceOp::Max => {
                    let y = s.expand_reduced(id, &pred_shape, axis)?;
                    let hit = s.equal(a, y)?;
                    s.mul(adj, hit)
                }
            }
        }
        Op::Slice { start, step, .. } => s.extend_resolved(adj, pred_shape, start, step),
        Op::Extend { start, step, .. } => s.slice_resolved(adj, start, step, pred_shape),
        Op::Concat { axis } => {
            let mut start = vec![0; pred_shape.len()];
            if k == 1 {
                start[axis] = s.graph.node(a)?.shape[axis];
            }
            let step = vec![1; pred_shape.len()];
            s.slice_resolved(adj, start, step, pred_shape)
        }
        Op::Convolve { steps } => {
            if k == 0 {
                s.gradient_convolve1(b, adj, &pred_shape, &steps)
            } else {
                s.gradient_convolve2(a, adj, &pred_shape, &steps)
            }
        }
        // preds: kernel, convolution adjoint
        Op::GradientConvolve1 { steps, .. } => {
            if k == 0 {
                s.gradient_convolve2(adj, b, &pred_shape, &steps)
            } else {
                s.convolve(adj, a, &steps)
            }
        }
        // preds: image, convolution adjoint
        Op::GradientConvolve2 { steps, .. } => {
            if k == 0 {
                s.gradient_convolve1(adj, b, &pred_shape, &steps)
            } else {
                s.convolve(a, adj, &steps)
            }
        }
        Op::SlidingWindow { steps, .. } => s.unslide(adj, &pred_shape, &steps),
        Op::Unslide { steps, .. } => s.sliding_window(adj, &pred_shape[1..], &steps),
        Op::Store { .. } | Op::Const { .. } | Op::Random { .. } | Op::Arange { .. } => Err(
            crate::error::GraphError::argument("leaf nodes have no predecessors to differentiate"),
        ),
    }
}
