//! briny_graph: a deferred tensor graph with reverse-mode differentiation.
//!
//! Operations on a [`Session`](session::Session) do not compute anything;
//! they append nodes to a directed acyclic graph and return handles. A node
//! is computed when its value is requested (or immediately, in eager mode),
//! either node by node on the CPU or fused into a single compute kernel on
//! the accelerator.
//!
//! # Features
//!
//! - Typed element buffers (`i32`, `i64`, `f32`, `f64`) with type promotion.
//! - Elementwise, reduction, layout, matrix and convolution operations with
//!   numpy-style broadcasting.
//! - Reverse-mode differentiation whose gradients are ordinary graph nodes,
//!   so they can be differentiated again.
//! - A cost-based scheduler choosing between the CPU (parallelized with
//!   `rayon`) and a `wgpu` backend (feature `wgpu`).
//! - Kernel fusion with a structural cache of generated WGSL.
//! - Explicit node lifetimes with cascading release.
//! - A compact binary record format for materialized nodes.
//!
//! # Modules
//!
//! - [`session`] — graph owner and entry point.
//! - [`graph`] — node arena and shape helpers; construction lives in `graph::build`.
//! - [`ops`] — operation kinds, shape inference, gradients and backends.
//! - [`fusion`] — WGSL kernel generation.
//! - [`backprop`] — the differentiation pass.
//! - [`lifecycle`] — reference counting and release.
//! - [`modelio`] — serialization.
//! - [`tensors`] — element types, buffers and host tensors.
//!
//! # Example
//!
//! ```rust
//! use briny_graph::prelude::*;
//!
//! let mut s = Session::new();
//! let a = s.create(&[1.0f64, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
//! let b = s.create(&[1.0f64, 0.0, 0.0, 1.0], &[2, 2]).unwrap();
//! s.mark(a).unwrap();
//! let c = s.matmul(a, b).unwrap();
//! let loss = s.reduce_sum(c, 0).unwrap();
//! let total = s.reduce_sum(loss, 0).unwrap();
//! assert_eq!(s.read::<f64>(total).unwrap(), vec![10.0]);
//!
//! let grad = s.differentiate(total, a).unwrap().unwrap();
//! assert_eq!(s.read::<f64>(grad).unwrap(), vec![1.0; 4]);
//! ```

pub mod approx;
pub mod backend;
pub mod backprop;
pub mod error;
pub mod fusion;
pub mod graph;
pub mod lifecycle;
pub mod modelio;
pub mod ops;
pub mod session;
pub mod tensors;

pub use backend::{Backend, Backends, SessionConfig};
pub use error::{GraphError, Result};
pub use graph::NodeId;
pub use session::Session;
pub use tensors::{Buffer, DType, Tensor, Value};

/// Everything needed to build, run and differentiate graphs.
pub mod prelude {
    pub use crate::backend::{Backend, Backends, SessionConfig};
    pub use crate::error::{GraphError, Result};
    pub use crate::graph::NodeId;
    pub use crate::ops::{BinaryOp, Broadcast, OpKind, ReduceOp, UnaryOp};
    pub use crate::session::Session;
    pub use crate::tensor;
    pub use crate::tensors::{Buffer, DType, Element, Tensor, Value};
}
