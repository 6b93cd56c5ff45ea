//! Error types shared by graph construction, execution and the backends.
//!
//! Construction never aborts the process: every shape, payload or type problem
//! comes back as a [`GraphError`] before any node is inserted, so a caller can
//! try an alternative construction. Conditions that are expected to happen in
//! normal use (a derivative that is not part of the graph, corrupted serialized
//! input) are not errors at all; those paths return `None` and emit a
//! `log::warn!`.

use crate::backend::Backend;
use crate::graph::NodeId;
use crate::tensors::DType;

/// Everything that can go wrong while building or running a graph.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// Two operand shapes cannot be aligned for `op`.
    #[error("{op}: incompatible shapes {lhs:?} and {rhs:?}")]
    ShapeMismatch {
        op: &'static str,
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },

    /// Operand has the wrong number of dimensions.
    #[error("{op}: expected rank {expected}, got {got}")]
    RankMismatch {
        op: &'static str,
        expected: usize,
        got: usize,
    },

    /// Axis index outside of the operand's rank.
    #[error("{op}: axis {axis} out of range for rank {rank}")]
    InvalidAxis {
        op: &'static str,
        axis: usize,
        rank: usize,
    },

    /// Slice bounds or steps that do not select anything valid.
    #[error("invalid slice: {0}")]
    InvalidSlice(String),

    /// Extend target or placement that cannot hold the source.
    #[error("invalid extend: {0}")]
    InvalidExtend(String),

    /// Any other malformed payload.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not defined for this element type.
    #[error("{op}: unsupported element type {dtype:?}")]
    TypeError { op: &'static str, dtype: DType },

    /// The handle refers to a node that was already freed.
    #[error("unknown node {0:?}")]
    UnknownNode(NodeId),

    /// A result buffer could not be allocated.
    #[error("failed to allocate {bytes} bytes")]
    Allocation { bytes: usize },

    /// The backend was requested but is not compiled in or has no device.
    #[error("backend {0:?} is not available")]
    BackendUnavailable(Backend),

    /// Kernel compilation or dispatch failed.
    #[error("backend failure: {0}")]
    Backend(String),
}

impl GraphError {
    pub(crate) fn argument(msg: impl Into<String>) -> Self {
        GraphError::InvalidArgument(msg.into())
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, GraphError>;
