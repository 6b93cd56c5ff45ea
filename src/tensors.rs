//! Element types, typed buffers and the host-side tensor value.
//!
//! # Core Tensor Utilities
//!
//! Graph nodes never expose raw pointers; their materialized results are
//! [`Buffer`]s, a closed enum over the four supported element types. Host code
//! exchanges data with a session through [`Tensor<T>`], a plain shape + row-major
//! `Vec<T>` pair, and [`Element`] connects a Rust scalar type to its [`DType`].
//!
//! ## Type Order
//!
//! Element types form a total order `Int32 < Int64 < Float32 < Float64`; mixed
//! binary operations take the stronger of the two ([`DType::unify`]).
//!
//! ## Example
//!
//! ```rust
//! use briny_graph::tensors::{DType, Tensor};
//! let t = Tensor::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
//! assert_eq!(t.shape, vec![2, 3]);
//! assert_eq!(DType::Int64.unify(DType::Float32), DType::Float32);
//! ```

use crate::error::{GraphError, Result};
use std::fmt::Debug;

/// Element type of a node's output.
///
/// The discriminant is the tag written by the serializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum DType {
    /// 32-bit signed integer.
    Int32 = 0,
    /// 64-bit signed integer.
    Int64 = 1,
    /// 32-bit float.
    Float32 = 2,
    /// 64-bit float.
    Float64 = 3,
}

impl DType {
    /// Size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            DType::Int32 | DType::Float32 => 4,
            DType::Int64 | DType::Float64 => 8,
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(self, DType::Float32 | DType::Float64)
    }

    pub const fn is_int(self) -> bool {
        !self.is_float()
    }

    /// The stronger of two types.
    pub fn unify(self, other: DType) -> DType {
        self.max(other)
    }

    /// Result type of a transcendental function applied to `self`.
    pub const fn float_result(self) -> DType {
        match self {
            DType::Float32 => DType::Float32,
            _ => DType::Float64,
        }
    }

    pub const fn tag(self) -> u32 {
        self as u32
    }

    pub fn from_tag(tag: u32) -> Option<DType> {
        match tag {
            0 => Some(DType::Int32),
            1 => Some(DType::Int64),
            2 => Some(DType::Float32),
            3 => Some(DType::Float64),
            _ => None,
        }
    }
}

/// A single scalar of any supported element type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
}

impl Value {
    pub fn dtype(self) -> DType {
        match self {
            Value::Int32(_) => DType::Int32,
            Value::Int64(_) => DType::Int64,
            Value::Float32(_) => DType::Float32,
            Value::Float64(_) => DType::Float64,
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            Value::Int32(v) => v as f64,
            Value::Int64(v) => v as f64,
            Value::Float32(v) => v as f64,
            Value::Float64(v) => v,
        }
    }

    /// Converts the scalar to another element type with `as` semantics.
    pub fn cast(self, dtype: DType) -> Value {
        match (self, dtype) {
            (Value::Int64(v), DType::Int64) => Value::Int64(v),
            (Value::Int64(v), DType::Int32) => Value::Int32(v as i32),
            (Value::Int32(v), DType::Int64) => Value::Int64(v as i64),
            (v, DType::Int32) => Value::Int32(v.as_f64() as i32),
            (v, DType::Int64) => Value::Int64(v.as_f64() as i64),
            (v, DType::Float32) => Value::Float32(v.as_f64() as f32),
            (v, DType::Float64) => Value::Float64(v.as_f64()),
        }
    }

    /// The value `1` in `dtype`.
    pub fn one(dtype: DType) -> Value {
        Value::Int32(1).cast(dtype)
    }

    /// The value `0` in `dtype`.
    pub fn zero(dtype: DType) -> Value {
        Value::Int32(0).cast(dtype)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float32(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

/// Scalar types that can live in a [`Buffer`].
pub trait Element:
    Copy
    + Debug
    + Default
    + PartialOrd
    + Send
    + Sync
    + 'static
{
    const DTYPE: DType;

    fn zero() -> Self;
    fn one() -> Self;
    fn from_f64(v: f64) -> Self;
    fn to_f64(self) -> f64;
    fn from_value(v: Value) -> Self;

    /// Integer arithmetic wraps on overflow; float arithmetic is the usual IEEE one.
    fn wrapping_add(self, rhs: Self) -> Self;
    fn wrapping_sub(self, rhs: Self) -> Self;
    fn wrapping_mul(self, rhs: Self) -> Self;
    fn wrapping_neg(self) -> Self;

    /// Division that yields `0` instead of trapping on integer division by zero.
    fn divide(self, rhs: Self) -> Self;
    fn power(self, rhs: Self) -> Self;

    fn wrap(data: Vec<Self>) -> Buffer;
    fn view(buffer: &Buffer) -> Option<&[Self]>;
    fn view_mut(buffer: &mut Buffer) -> Option<&mut [Self]>;

    fn write_be(self, out: &mut Vec<u8>);
    fn read_be(bytes: &[u8]) -> Self;
}

macro_rules! impl_int_element {
    ($t:ty, $variant:ident) => {
        impl Element for $t {
            const DTYPE: DType = DType::$variant;

            fn zero() -> Self {
                0
            }
            fn one() -> Self {
                1
            }
            fn from_f64(v: f64) -> Self {
                v as $t
            }
            fn to_f64(self) -> f64 {
                self as f64
            }
            fn from_value(v: Value) -> Self {
                match v.cast(DType::$variant) {
                    Value::$variant(x) => x,
                    _ => 0,
                }
            }
            fn wrapping_add(self, rhs: Self) -> Self {
                <$t>::wrapping_add(self, rhs)
            }
            fn wrapping_sub(self, rhs: Self) -> Self {
                <$t>::wrapping_sub(self, rhs)
            }
            fn wrapping_mul(self, rhs: Self) -> Self {
                <$t>::wrapping_mul(self, rhs)
            }
            fn wrapping_neg(self) -> Self {
                <$t>::wrapping_neg(self)
            }
            fn divide(self, rhs: Self) -> Self {
                self.checked_div(rhs).unwrap_or(0)
            }
            fn power(self, rhs: Self) -> Self {
                (self as f64).powf(rhs as f64) as $t
            }
            fn wrap(data: Vec<Self>) -> Buffer {
                Buffer::$variant(data)
            }
            fn view(buffer: &Buffer) -> Option<&[Self]> {
                match buffer {
                    Buffer::$variant(d) => Some(d),
                    _ => None,
                }
            }
            fn view_mut(buffer: &mut Buffer) -> Option<&mut [Self]> {
                match buffer {
                    Buffer::$variant(d) => Some(d),
                    _ => None,
                }
            }
            fn write_be(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_be_bytes());
            }
            fn read_be(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$t>()];
                raw.copy_from_slice(&bytes[..std::mem::size_of::<$t>()]);
                <$t>::from_be_bytes(raw)
            }
        }
    };
}

macro_rules! impl_float_element {
    ($t:ty, $variant:ident) => {
        impl Element for $t {
            const DTYPE: DType = DType::$variant;

            fn zero() -> Self {
                0.0
            }
            fn one() -> Self {
                1.0
            }
            fn from_f64(v: f64) -> Self {
                v as $t
            }
            fn to_f64(self) -> f64 {
                self as f64
            }
            fn from_value(v: Value) -> Self {
                v.as_f64() as $t
            }
            fn wrapping_add(self, rhs: Self) -> Self {
                self + rhs
            }
            fn wrapping_sub(self, rhs: Self) -> Self {
                self - rhs
            }
            fn wrapping_mul(self, rhs: Self) -> Self {
                self * rhs
            }
            fn wrapping_neg(self) -> Self {
                -self
            }
            fn divide(self, rhs: Self) -> Self {
                self / rhs
            }
            fn power(self, rhs: Self) -> Self {
                self.powf(rhs)
            }
            fn wrap(data: Vec<Self>) -> Buffer {
                Buffer::$variant(data)
            }
            fn view(buffer: &Buffer) -> Option<&[Self]> {
                match buffer {
                    Buffer::$variant(d) => Some(d),
                    _ => None,
                }
            }
            fn view_mut(buffer: &mut Buffer) -> Option<&mut [Self]> {
                match buffer {
                    Buffer::$variant(d) => Some(d),
                    _ => None,
                }
            }
            fn write_be(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_be_bytes());
            }
            fn read_be(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$t>()];
                raw.copy_from_slice(&bytes[..std::mem::size_of::<$t>()]);
                <$t>::from_be_bytes(raw)
            }
        }
    };
}

impl_int_element!(i32, Int32);
impl_int_element!(i64, Int64);
impl_float_element!(f32, Float32);
impl_float_element!(f64, Float64);

/// A flat, typed result buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Buffer {
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
}

/// Runs `$body` with `$v` bound to the inner `Vec` of any [`Buffer`] variant.
#[macro_export]
macro_rules! with_buffer {
    ($buf:expr, $v:ident => $body:expr) => {
        match $buf {
            $crate::tensors::Buffer::Int32($v) => $body,
            $crate::tensors::Buffer::Int64($v) => $body,
            $crate::tensors::Buffer::Float32($v) => $body,
            $crate::tensors::Buffer::Float64($v) => $body,
        }
    };
}

/// Allocates a zeroed vector, reporting failure instead of aborting.
pub(crate) fn try_alloc<T: Element>(len: usize) -> Result<Vec<T>> {
    let mut data = Vec::new();
    data.try_reserve_exact(len).map_err(|_| GraphError::Allocation {
        bytes: len.saturating_mul(T::DTYPE.size()),
    })?;
    data.resize(len, T::zero());
    Ok(data)
}

impl Buffer {
    pub fn dtype(&self) -> DType {
        match self {
            Buffer::Int32(_) => DType::Int32,
            Buffer::Int64(_) => DType::Int64,
            Buffer::Float32(_) => DType::Float32,
            Buffer::Float64(_) => DType::Float64,
        }
    }

    pub fn len(&self) -> usize {
        with_buffer!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A zero-filled buffer of `len` elements.
    pub fn zeros(dtype: DType, len: usize) -> Result<Buffer> {
        Ok(match dtype {
            DType::Int32 => Buffer::Int32(try_alloc(len)?),
            DType::Int64 => Buffer::Int64(try_alloc(len)?),
            DType::Float32 => Buffer::Float32(try_alloc(len)?),
            DType::Float64 => Buffer::Float64(try_alloc(len)?),
        })
    }

    /// Element `i` widened to `f64`.
    pub fn get_f64(&self, i: usize) -> f64 {
        with_buffer!(self, v => v[i].to_f64())
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        with_buffer!(self, v => v.iter().map(|x| x.to_f64()).collect())
    }

    /// Converts every element to `dtype`, borrowing when no conversion is needed.
    pub fn cast(&self, dtype: DType) -> std::borrow::Cow<'_, Buffer> {
        use std::borrow::Cow;
        if self.dtype() == dtype {
            return Cow::Borrowed(self);
        }
        Cow::Owned(match (self, dtype) {
            (Buffer::Int32(v), DType::Int64) => Buffer::Int64(v.iter().map(|&x| x as i64).collect()),
            (Buffer::Int64(v), DType::Int32) => Buffer::Int32(v.iter().map(|&x| x as i32).collect()),
            (b, DType::Int32) => Buffer::Int32(with_buffer!(b, v => v.iter().map(|x| x.to_f64() as i32).collect())),
            (b, DType::Int64) => Buffer::Int64(with_buffer!(b, v => v.iter().map(|x| x.to_f64() as i64).collect())),
            (b, DType::Float32) => Buffer::Float32(with_buffer!(b, v => v.iter().map(|x| x.to_f64() as f32).collect())),
            (b, DType::Float64) => Buffer::Float64(b.to_f64_vec()),
        })
    }
}

/// Represents an N-dimensional host tensor with a shape and flat row-major data.
///
/// - All elements must be the same type (`T`).
/// - `shape` defines the structure, e.g., `[2, 3]` for a 2×3 matrix.
/// - `data` holds the flattened content in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor<T> {
    pub shape: Vec<usize>,
    pub data: Vec<T>,
}

impl<T> Tensor<T> {
    /// Creates a new tensor with the given shape and flat data.
    ///
    /// # Panics
    /// Panics if the number of elements in `data` does not match the shape product.
    pub fn new(shape: impl Into<Vec<usize>>, data: Vec<T>) -> Self {
        let shape = shape.into();
        assert_eq!(
            shape.iter().product::<usize>(),
            data.len(),
            "shape {:?} is incompatible with {} data elements",
            shape,
            data.len()
        );
        Self { shape, data }
    }

    /// Fallible counterpart of [`Tensor::new`].
    pub fn try_new(shape: impl Into<Vec<usize>>, data: Vec<T>) -> Result<Self> {
        let shape = shape.into();
        let count = shape.iter().product::<usize>();
        if count != data.len() {
            return Err(GraphError::argument(format!(
                "shape {shape:?} needs {count} elements, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }
}

impl<T: Element> Tensor<T> {
    pub fn dtype(&self) -> DType {
        T::DTYPE
    }

    /// Splits a typed buffer back into a host tensor, converting elements to `T`.
    pub fn from_buffer(shape: Vec<usize>, buffer: &Buffer) -> Self {
        let converted = buffer.cast(T::DTYPE);
        let data = T::view(&converted).map(<[T]>::to_vec).unwrap_or_default();
        Self { shape, data }
    }
}

/// Defines a tensor from nested literal arrays.
///
/// Supports arbitrary dimensionality as long as sublists are uniform in shape.
/// A bare literal produces a rank-0 tensor, which sessions store as shape `[1]`.
///
/// # Example
/// ```
/// use briny_graph::tensor;
/// let t = tensor!([[1.0, 2.0], [3.0, 4.0]]);
/// assert_eq!(t.shape, vec![2, 2]);
/// ```
#[macro_export]
macro_rules! tensor {
    ($lit:literal) => {
        $crate::tensors::Tensor::new(Vec::<usize>::new(), vec![$lit])
    };

    ([ $( $inner:tt ),+ $(,)? ]) => {{
        let children = vec![ $( $crate::tensor!($inner) ),+ ];
        let first_shape = &children[0].shape;
        assert!(children.iter().all(|c| c.shape == *first_shape),
            "ragged tensor literal (rows have mismatched shapes)");
        let mut shape = vec![children.len()];
        shape.extend_from_slice(first_shape);
        let mut data = Vec::with_capacity(children.len() * children[0].data.len());
        for c in children { data.extend(c.data); }
        $crate::tensors::Tensor::new(shape, data)
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_order() {
        assert!(DType::Int32 < DType::Int64);
        assert!(DType::Int64 < DType::Float32);
        assert!(DType::Float32 < DType::Float64);
        assert_eq!(DType::Int32.unify(DType::Float32), DType::Float32);
    }

    #[test]
    fn test_integer_division_by_zero_is_zero() {
        assert_eq!(7i32.divide(0), 0);
        assert_eq!(7i64.divide(2), 3);
        assert_eq!(i32::MIN.divide(-1), 0);
    }

    #[test]
    fn test_integer_arithmetic_wraps() {
        assert_eq!(Element::wrapping_add(i32::MAX, 1), i32::MIN);
        assert_eq!(Element::wrapping_neg(i64::MIN), i64::MIN);
        assert_eq!(Element::wrapping_mul(1.5f32, 2.0), 3.0);
    }

    #[test]
    fn test_cast_roundtrip() {
        let b = Buffer::Float64(vec![1.5, -2.0]);
        let c = b.cast(DType::Int32);
        assert_eq!(c.as_ref(), &Buffer::Int32(vec![1, -2]));
        assert_eq!(b.cast(DType::Float64).as_ref(), &b);
    }

    #[test]
    fn test_value_cast() {
        assert_eq!(Value::Float64(2.7).cast(DType::Int64), Value::Int64(2));
        assert_eq!(Value::one(DType::Float32), Value::Float32(1.0));
    }
}
