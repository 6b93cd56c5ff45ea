//! The session: one graph arena plus the backends and settings that run it.
//!
//! All entry points take the session explicitly, so independent sessions can
//! coexist in one process (for example a CPU-only and an accelerated one) and
//! tests never share hidden state.
//!
//! # Example
//! ```rust
//! use briny_graph::prelude::*;
//!
//! let mut s = Session::new();
//! let a = s.create(&[1.0f64, 2.0, 3.0], &[3]).unwrap();
//! let b = s.mul_scalar(a, 2.0).unwrap();
//! assert_eq!(s.read::<f64>(b).unwrap(), vec![2.0, 4.0, 6.0]);
//! ```

use crate::backend::{Backend, Backends, SessionConfig};
use crate::error::{GraphError, Result};
use crate::fusion::cache::KernelCache;
use crate::graph::{Graph, Node, NodeId};
use crate::ops::infer::infer;
use crate::ops::{Op, OpKind, dispatch};
use crate::tensors::{DType, Element, Tensor};
use std::sync::Arc;

/// Owner of a computation graph.
pub struct Session {
    pub(crate) graph: Graph,
    pub(crate) config: SessionConfig,
    /// Backends that were actually initialized.
    pub(crate) available: Backends,
    /// Generated kernel sources, keyed by fused-chain structure.
    pub(crate) sources: KernelCache<Arc<str>>,
    #[cfg(feature = "wgpu")]
    pub(crate) gpu: Option<crate::ops::wgpu::GpuExecutor>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("nodes", &self.graph.len())
            .field("config", &self.config)
            .field("available", &self.available)
            .finish()
    }
}

impl Session {
    /// A CPU-only, lazy session with default thresholds.
    pub fn new() -> Self {
        Self {
            graph: Graph::new(),
            config: SessionConfig::default(),
            available: Backends::CPU,
            sources: KernelCache::new(),
            #[cfg(feature = "wgpu")]
            gpu: None,
        }
    }

    /// Builds a session, initializing every backend named by `config`.
    ///
    /// Requesting the accelerator without the `wgpu` feature fails with
    /// [`GraphError::BackendUnavailable`]. With the feature but no usable
    /// adapter the session continues on the CPU if the CPU was requested too.
    pub fn with_config(config: SessionConfig) -> Result<Self> {
        if config.backends.is_empty() {
            return Err(GraphError::argument("no backend requested"));
        }
        let mut session = Self {
            config: config.clone(),
            available: config.backends,
            ..Self::new()
        };
        if config.backends.contains(Backend::Wgpu) {
            session.init_accelerator()?;
        }
        log::debug!("session initialized with {:?}", session.available);
        Ok(session)
    }

    #[cfg(feature = "wgpu")]
    fn init_accelerator(&mut self) -> Result<()> {
        match crate::ops::wgpu::GpuExecutor::new() {
            Some(gpu) => {
                self.gpu = Some(gpu);
                Ok(())
            }
            None if self.available.contains(Backend::Cpu) => {
                log::warn!("no GPU adapter available, continuing on the CPU");
                self.available = self.available.without(Backend::Wgpu);
                Ok(())
            }
            None => Err(GraphError::BackendUnavailable(Backend::Wgpu)),
        }
    }

    #[cfg(not(feature = "wgpu"))]
    fn init_accelerator(&mut self) -> Result<()> {
        Err(GraphError::BackendUnavailable(Backend::Wgpu))
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Backends this session can actually execute on.
    pub fn backends(&self) -> Backends {
        self.available
    }

    /// Toggles eager execution for nodes constructed from now on.
    pub fn set_eager(&mut self, eager: bool) {
        self.config.eager = eager;
    }

    /// The construction primitive: infers shape and type, inserts the node
    /// and, in eager mode, executes it once all predecessors are materialized.
    pub(crate) fn construct(&mut self, op: Op, preds: &[NodeId]) -> Result<NodeId> {
        let (shape, dtype) = {
            let inputs = preds
                .iter()
                .map(|p| self.graph.node(*p).map(|n| (n.shape.as_slice(), n.dtype)))
                .collect::<Result<Vec<_>>>()?;
            infer(&op, &inputs)?
        };
        let id = self.graph.insert(op, shape, dtype, preds.to_vec(), None)?;
        if self.config.eager
            && preds
                .iter()
                .all(|p| self.graph.node(*p).is_ok_and(Node::is_materialized))
        {
            if let Err(err) = self.execute(id) {
                self.free_if_unreferenced(id);
                return Err(err);
            }
        }
        Ok(id)
    }

    /// Materializes `id` and every unmaterialized ancestor it needs.
    ///
    /// Idempotent: a materialized node returns immediately.
    pub fn execute(&mut self, id: NodeId) -> Result<NodeId> {
        dispatch::execute(self, id)?;
        Ok(id)
    }

    /// Executes `id` and copies its result to the host, converted to `T`.
    pub fn read<T: Element>(&mut self, id: NodeId) -> Result<Vec<T>> {
        Ok(self.tensor::<T>(id)?.data)
    }

    /// Executes `id` and returns shape and data as a host tensor.
    pub fn tensor<T: Element>(&mut self, id: NodeId) -> Result<Tensor<T>> {
        self.execute(id)?;
        let node = self.graph.node(id)?;
        let buffer = node
            .result
            .as_ref()
            .ok_or_else(|| GraphError::Backend(format!("{id:?} was not materialized")))?;
        Ok(Tensor::from_buffer(node.shape.clone(), buffer))
    }

    pub fn shape(&self, id: NodeId) -> Result<&[usize]> {
        Ok(&self.graph.node(id)?.shape)
    }

    pub fn dtype(&self, id: NodeId) -> Result<DType> {
        Ok(self.graph.node(id)?.dtype)
    }

    pub fn op_kind(&self, id: NodeId) -> Result<OpKind> {
        Ok(self.graph.node(id)?.kind())
    }

    pub fn predecessors(&self, id: NodeId) -> Result<&[NodeId]> {
        Ok(&self.graph.node(id)?.preds)
    }

    pub fn reference_count(&self, id: NodeId) -> Result<usize> {
        Ok(self.graph.node(id)?.refs)
    }

    pub fn is_materialized(&self, id: NodeId) -> Result<bool> {
        Ok(self.graph.node(id)?.is_materialized())
    }

    /// Whether `id` still refers to a live node.
    pub fn contains(&self, id: NodeId) -> bool {
        self.graph.contains(id)
    }

    /// Number of live nodes in the arena.
    pub fn live_nodes(&self) -> usize {
        self.graph.len()
    }

    /// Marked variables `id` currently depends on, in ascending order.
    pub fn gradient_trace(&self, id: NodeId) -> Result<Vec<NodeId>> {
        let node = self.graph.node(id)?;
        Ok(node
            .trace
            .iter()
            .flatten()
            .copied()
            .filter(|v| self.graph.marked.contains(v))
            .collect())
    }

    /// Compiles the kernel that would materialize `id` on the accelerator,
    /// without dispatching it. Materialized nodes become its parameters.
    pub fn fused_kernel(&mut self, id: NodeId) -> Result<crate::fusion::FusedKernel> {
        crate::fusion::compile(&self.graph, id, &mut self.sources)
    }

    /// `(hits, misses)` of the generated-kernel cache.
    pub fn kernel_cache_stats(&self) -> (usize, usize) {
        (self.sources.hits(), self.sources.misses())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accelerator_only_without_device_fails_or_succeeds_cleanly() {
        let cfg = SessionConfig::default().with_backends(Backends::WGPU);
        match Session::with_config(cfg) {
            Ok(s) => assert!(s.backends().contains(Backend::Wgpu)),
            Err(e) => assert!(matches!(e, GraphError::BackendUnavailable(Backend::Wgpu))),
        }
    }

    #[test]
    fn test_empty_backend_set_is_rejected() {
        let cfg = SessionConfig::default().with_backends(Backends::CPU.without(Backend::Cpu));
        assert!(Session::with_config(cfg).is_err());
    }
}
