//! # Operation Registry
//!
//! Every graph node carries an [`Op`]: a closed enumeration of operation kinds
//! together with the kind-specific payload (axes, steps, seeds, ...). The
//! behaviour of each kind is spread over four tables, all dispatched by
//! `match` on the kind rather than through trait objects:
//!
//! - [`infer`] — shape/type inference, run once at construction
//! - [`cpu`] — range kernels over the flattened output buffer
//! - [`crate::fusion`] — code fragments for fused accelerator kernels
//! - [`gradients`] — local-gradient rules used by the differentiation pass
//!
//! [`dispatch`] is the scheduler that decides between the CPU and the
//! accelerator, and [`wgpu`] *(feature `wgpu`)* runs fused kernels on a GPU.
//!
//! ## Adding a Kind
//!
//! 1. Add the variant to [`Op`] and [`OpKind`]
//! 2. Give it a rule in `infer`, a kernel in `cpu`, a fragment in `fusion`
//!    and a rule in `gradients`
//! 3. Give it a weight in `dispatch::operation_weight` if it is more expensive than a
//!    plain elementwise op

pub mod cpu;
pub mod dispatch;
pub mod gradients;
pub mod infer;
#[cfg(feature = "wgpu")]
pub mod wgpu;

use crate::tensors::{DType, Value};

/// Elementwise two-operand operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Min,
    Max,
    Less,
    Greater,
    Equal,
}

impl BinaryOp {
    /// Comparisons produce `int32` 0/1 regardless of operand types.
    pub const fn is_comparison(self) -> bool {
        matches!(self, BinaryOp::Less | BinaryOp::Greater | BinaryOp::Equal)
    }
}

/// Elementwise one-operand operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Log,
    Log2,
    Log10,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sqrt,
    Exp,
    Abs,
    Sign,
    Even,
}

impl UnaryOp {
    /// Functions evaluated in floating point; integer inputs are promoted.
    pub const fn is_transcendental(self) -> bool {
        !matches!(self, UnaryOp::Neg | UnaryOp::Abs | UnaryOp::Sign | UnaryOp::Even)
    }
}

/// Reductions over one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Sum,
    Mul,
    Min,
    Max,
}

/// How the lower-rank operand of a binary op is aligned with the higher-rank one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Broadcast {
    /// The lower-rank shape matches the trailing dimensions (`[3] + [2, 3]`).
    #[default]
    Trailing,
    /// The lower-rank shape matches the leading dimensions (`[2] + [2, 3]`).
    Leading,
}

/// Operation kind plus payload of one node.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Caller-provided data, or a compacted node.
    Store { shape: Vec<usize>, dtype: DType },
    /// Every element equals `value`.
    Const { value: Value, shape: Vec<usize> },
    /// Uniform `[0, 1)` float64, deterministic per seed and element index.
    Random { seed: u32, shape: Vec<usize> },
    /// int64 coordinate along `axis`.
    Arange { axis: usize, shape: Vec<usize> },
    Binary { op: BinaryOp, broadcast: Broadcast },
    Unary(UnaryOp),
    Matmul,
    Reduce { op: ReduceOp, axis: usize },
    Reshape { shape: Vec<usize> },
    Convert(DType),
    /// Strided selection; `start` is resolved, `shape` is the output shape.
    Slice {
        start: Vec<usize>,
        step: Vec<isize>,
        shape: Vec<usize>,
    },
    /// Zero-filled embedding; source element `o` lands on `start + o * step`.
    Extend {
        start: Vec<usize>,
        step: Vec<isize>,
        shape: Vec<usize>,
    },
    Repeat { reps: Vec<usize> },
    Transpose { perm: Vec<usize> },
    Concat { axis: usize },
    /// Predecessors: image, kernel.
    Convolve { steps: Vec<usize> },
    /// Gradient of a convolution w.r.t. its image. Predecessors: kernel, adjoint.
    GradientConvolve1 {
        steps: Vec<usize>,
        image_shape: Vec<usize>,
    },
    /// Gradient of a convolution w.r.t. its kernel. Predecessors: image, adjoint.
    GradientConvolve2 {
        steps: Vec<usize>,
        kernel_shape: Vec<usize>,
    },
    SlidingWindow { size: Vec<usize>, steps: Vec<usize> },
    /// Inverse of a sliding window: overlapping windows are summed.
    Unslide { steps: Vec<usize>, shape: Vec<usize> },
}

/// Fieldless tag of an [`Op`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Store,
    Const,
    Random,
    Arange,
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Min,
    Max,
    Less,
    Greater,
    Equal,
    Neg,
    Log,
    Log2,
    Log10,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sqrt,
    Exp,
    Abs,
    Sign,
    Even,
    Matmul,
    ReduceSum,
    ReduceMul,
    ReduceMin,
    ReduceMax,
    Reshape,
    Convert,
    Slice,
    Extend,
    Repeat,
    Transpose,
    Concat,
    Convolve,
    GradientConvolve1,
    GradientConvolve2,
    SlidingWindow,
    Unslide,
}

impl Op {
    pub fn kind(&self) -> OpKind {
        match self {
            Op::Store { .. } => OpKind::Store,
            Op::Const { .. } => OpKind::Const,
            Op::Random { .. } => OpKind::Random,
            Op::Arange { .. } => OpKind::Arange,
            Op::Binary { op, .. } => match op {
                BinaryOp::Add => OpKind::Add,
                BinaryOp::Sub => OpKind::Sub,
                BinaryOp::Mul => OpKind::Mul,
                BinaryOp::Div => OpKind::Div,
                BinaryOp::Pow => OpKind::Pow,
                BinaryOp::Min => OpKind::Min,
                BinaryOp::Max => OpKind::Max,
                BinaryOp::Less => OpKind::Less,
                BinaryOp::Greater => OpKind::Greater,
                BinaryOp::Equal => OpKind::Equal,
            },
            Op::Unary(op) => match op {
                UnaryOp::Neg => OpKind::Neg,
                UnaryOp::Log => OpKind::Log,
                UnaryOp::Log2 => OpKind::Log2,
                UnaryOp::Log10 => OpKind::Log10,
                UnaryOp::Sin => OpKind::Sin,
                UnaryOp::Cos => OpKind::Cos,
                UnaryOp::Tan => OpKind::Tan,
                UnaryOp::Asin => OpKind::Asin,
                UnaryOp::Acos => OpKind::Acos,
                UnaryOp::Atan => OpKind::Atan,
                UnaryOp::Sqrt => OpKind::Sqrt,
                UnaryOp::Exp => OpKind::Exp,
                UnaryOp::Abs => OpKind::Abs,
                UnaryOp::Sign => OpKind::Sign,
                UnaryOp::Even => OpKind::Even,
            },
            Op::Matmul => OpKind::Matmul,
            Op::Reduce { op, .. } => match op {
                ReduceOp::Sum => OpKind::ReduceSum,
                ReduceOp::Mul => OpKind::ReduceMul,
                ReduceOp::Min => OpKind::ReduceMin,
                ReduceOp::Max => OpKind::ReduceMax,
            },
            Op::Reshape { .. } => OpKind::Reshape,
            Op::Convert(_) => OpKind::Convert,
            Op::Slice { .. } => OpKind::Slice,
            Op::Extend { .. } => OpKind::Extend,
            Op::Repeat { .. } => OpKind::Repeat,
            Op::Transpose { .. } => OpKind::Transpose,
            Op::Concat { .. } => OpKind::Concat,
            Op::Convolve { .. } => OpKind::Convolve,
            Op::GradientConvolve1 { .. } => OpKind::GradientConvolve1,
            Op::GradientConvolve2 { .. } => OpKind::GradientConvolve2,
            Op::SlidingWindow { .. } => OpKind::SlidingWindow,
            Op::Unslide { .. } => OpKind::Unslide,
        }
    }

    /// Number of predecessors this kind takes.
    pub fn arity(&self) -> usize {
        match self.kind() {
            OpKind::Store | OpKind::Const | OpKind::Random | OpKind::Arange => 0,
            OpKind::Add
            | OpKind::Sub
            | OpKind::Mul
            | OpKind::Div
            | OpKind::Pow
            | OpKind::Min
            | OpKind::Max
            | OpKind::Less
            | OpKind::Greater
            | OpKind::Equal
            | OpKind::Matmul
            | OpKind::Concat
            | OpKind::Convolve
            | OpKind::GradientConvolve1
            | OpKind::GradientConvolve2 => 2,
            _ => 1,
        }
    }
}

impl OpKind {
    /// Generators and stores: nodes without predecessors.
    pub const fn is_leaf(self) -> bool {
        matches!(
            self,
            OpKind::Store | OpKind::Const | OpKind::Random | OpKind::Arange
        )
    }

    /// Kinds whose access pattern is a loop over materialized inputs; the
    /// fusion compiler stops at them and binds their inputs as parameters.
    pub const fn halts_fusion(self) -> bool {
        matches!(
            self,
            OpKind::Matmul
                | OpKind::Convolve
                | OpKind::GradientConvolve1
                | OpKind::GradientConvolve2
                | OpKind::Unslide
        )
    }

    /// Lower-case name used in logs and kernel keys.
    pub fn name(self) -> &'static str {
        match self {
            OpKind::Store => "store",
            OpKind::Const => "const",
            OpKind::Random => "random",
            OpKind::Arange => "arange",
            OpKind::Add => "add",
            OpKind::Sub => "sub",
            OpKind::Mul => "mul",
            OpKind::Div => "div",
            OpKind::Pow => "pow",
            OpKind::Min => "min",
            OpKind::Max => "max",
            OpKind::Less => "less",
            OpKind::Greater => "greater",
            OpKind::Equal => "equal",
            OpKind::Neg => "neg",
            OpKind::Log => "log",
            OpKind::Log2 => "log2",
            OpKind::Log10 => "log10",
            OpKind::Sin => "sin",
            OpKind::Cos => "cos",
            OpKind::Tan => "tan",
            OpKind::Asin => "asin",
            OpKind::Acos => "acos",
            OpKind::Atan => "atan",
            OpKind::Sqrt => "sqrt",
            OpKind::Exp => "exp",
            OpKind::Abs => "abs",
            OpKind::Sign => "sign",
            OpKind::Even => "even",
            OpKind::Matmul => "matmul",
            OpKind::ReduceSum => "reduce_sum",
            OpKind::ReduceMul => "reduce_mul",
            OpKind::ReduceMin => "reduce_min",
            OpKind::ReduceMax => "reduce_max",
            OpKind::Reshape => "reshape",
            OpKind::Convert => "convert",
            OpKind::Slice => "slice",
            OpKind::Extend => "extend",
            OpKind::Repeat => "repeat",
            OpKind::Transpose => "transpose",
            OpKind::Concat => "concat",
            OpKind::Convolve => "convolve",
            OpKind::GradientConvolve1 => "gradient_convolve1",
            OpKind::GradientConvolve2 => "gradient_convolve2",
            OpKind::SlidingWindow => "sliding_window",
            OpKind::Unslide => "unslide",
        }
    }
}
