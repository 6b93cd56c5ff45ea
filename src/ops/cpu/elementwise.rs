//! Elementwise kernels.
//!
//! Binary kernels share one broadcasting scheme: for output index `i` an operand
//! holding `count` elements is read at `(i / inverse_multiplicity) % count`
//! (see [`broadcast_params`]).

use crate::graph::shape::broadcast_params;
use crate::ops::{BinaryOp, Broadcast, UnaryOp};
use crate::tensors::Element;

#[inline]
fn apply<T: Element>(op: BinaryOp, x: T, y: T) -> T {
    match op {
        BinaryOp::Add => x.wrapping_add(y),
        BinaryOp::Sub => x.wrapping_sub(y),
        BinaryOp::Mul => x.wrapping_mul(y),
        BinaryOp::Div => x.divide(y),
        BinaryOp::Pow => x.power(y),
        BinaryOp::Min => {
            if y < x {
                y
            } else {
                x
            }
        }
        BinaryOp::Max => {
            if y > x {
                y
            } else {
                x
            }
        }
        BinaryOp::Less => bool_to(x < y),
        BinaryOp::Greater => bool_to(x > y),
        BinaryOp::Equal => bool_to(x == y),
    }
}

#[inline]
fn bool_to<T: Element>(b: bool) -> T {
    if b { T::one() } else { T::zero() }
}

pub fn binary<T: Element>(
    op: BinaryOp,
    mode: Broadcast,
    a: &[T],
    b: &[T],
    total: usize,
    from: usize,
    out: &mut [T],
) {
    let (ia, ca) = broadcast_params(total, a.len(), mode);
    let (ib, cb) = broadcast_params(total, b.len(), mode);
    for (k, v) in out.iter_mut().enumerate() {
        let i = from + k;
        *v = apply(op, a[(i / ia) % ca], b[(i / ib) % cb]);
    }
}

/// Comparison of operands of type `U`, producing `0`/`1`.
pub fn compare<U: Element>(
    op: BinaryOp,
    mode: Broadcast,
    a: &[U],
    b: &[U],
    total: usize,
    from: usize,
    out: &mut [i32],
) {
    let (ia, ca) = broadcast_params(total, a.len(), mode);
    let (ib, cb) = broadcast_params(total, b.len(), mode);
    for (k, v) in out.iter_mut().enumerate() {
        let i = from + k;
        let (x, y) = (a[(i / ia) % ca], b[(i / ib) % cb]);
        *v = match op {
            BinaryOp::Less => (x < y) as i32,
            BinaryOp::Greater => (x > y) as i32,
            _ => (x == y) as i32,
        };
    }
}

/// Unary functions; transcendental ones are evaluated in `f64`.
pub fn unary<T: Element>(op: UnaryOp, a: &[T], from: usize, out: &mut [T]) {
    let f: fn(f64) -> f64 = match op {
        UnaryOp::Neg => {
            for (v, &x) in out.iter_mut().zip(&a[from..]) {
                *v = x.wrapping_neg();
            }
            return;
        }
        UnaryOp::Abs => {
            for (v, &x) in out.iter_mut().zip(&a[from..]) {
                *v = if x < T::zero() { x.wrapping_neg() } else { x };
            }
            return;
        }
        UnaryOp::Log => f64::ln,
        UnaryOp::Log2 => f64::log2,
        UnaryOp::Log10 => f64::log10,
        UnaryOp::Sin => f64::sin,
        UnaryOp::Cos => f64::cos,
        UnaryOp::Tan => f64::tan,
        UnaryOp::Asin => f64::asin,
        UnaryOp::Acos => f64::acos,
        UnaryOp::Atan => f64::atan,
        UnaryOp::Sqrt => f64::sqrt,
        UnaryOp::Exp => f64::exp,
        UnaryOp::Sign | UnaryOp::Even => {
            for (v, &x) in out.iter_mut().zip(&a[from..]) {
                *v = if x < T::zero() { T::one().wrapping_neg() } else { T::one() };
            }
            return;
        }
    };
    for (v, &x) in out.iter_mut().zip(&a[from..]) {
        *v = T::from_f64(f(x.to_f64()));
    }
}

/// `sign` (`-1`/`1`) and `even` (`1` for even integers).
pub fn classify<U: Element>(op: UnaryOp, a: &[U], from: usize, out: &mut [i32]) {
    for (v, &x) in out.iter_mut().zip(&a[from..]) {
        *v = match op {
            UnaryOp::Even => (x.to_f64() as i64 % 2 == 0) as i32,
            _ => {
                if x < U::zero() {
                    -1
                } else {
                    1
                }
            }
        };
    }
}
