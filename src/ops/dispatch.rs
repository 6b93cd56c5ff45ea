//! Execution Scheduler
//!
//! Decides where a deferred subgraph runs. [`execute`] collects the
//! unmaterialized ancestors of the requested node, prices them with
//! [`score`], and hands them either to the CPU backend (node by node, in id
//! order) or to the accelerator (fused into one kernel per halting point).
//!
//! # Behavior
//! - With a single initialized backend, that backend always runs.
//! - With both, the accelerator wins once the score exceeds the session's
//!   threshold (`eager_threshold` in eager mode, `lazy_threshold` otherwise).
//! - If the accelerator fails and the CPU is available, the subgraph is
//!   retried on the CPU with a warning.

use crate::backend::{Backend, Backends, SessionConfig};
use crate::error::Result;
use crate::graph::shape::numel;
use crate::graph::{Graph, Node, NodeId};
use crate::ops::{BinaryOp, Op, cpu};
use crate::session::Session;
use std::collections::HashSet;

/// Relative cost of producing one element of `node`.
pub fn operation_weight(graph: &Graph, node: &Node) -> f64 {
    let pred = |k: usize| node.preds.get(k).and_then(|p| graph.node(*p).ok());
    match &node.op {
        Op::Binary {
            op: BinaryOp::Mul | BinaryOp::Div | BinaryOp::Pow,
            ..
        } => 2.0,
        Op::Unary(op) if op.is_transcendental() => 2.0,
        Op::Reduce { axis, .. } => pred(0).map_or(1, |p| p.shape[*axis]) as f64,
        Op::Matmul => pred(0).and_then(|p| p.shape.last().copied()).unwrap_or(1) as f64,
        Op::Convolve { .. } => pred(1).map_or(1, Node::numel) as f64,
        Op::GradientConvolve1 { .. } => pred(0).map_or(1, Node::numel) as f64,
        Op::GradientConvolve2 { .. } => pred(1).map_or(1, Node::numel) as f64,
        Op::SlidingWindow { steps, .. } | Op::Unslide { steps, .. } => {
            let elements = pred(0).map_or(1, Node::numel) as f64;
            (elements / numel(steps) as f64).sqrt().max(1.0)
        }
        _ => 1.0,
    }
}

/// Sum of `elements * weight` over `nodes`.
pub fn score(graph: &Graph, nodes: &[NodeId]) -> Result<f64> {
    nodes.iter().try_fold(0.0, |acc, id| {
        let node = graph.node(*id)?;
        Ok(acc + node.numel() as f64 * operation_weight(graph, node))
    })
}

/// `id` and its unmaterialized ancestors in ascending (topological) order.
/// The walk stops at materialized nodes.
pub fn pending(graph: &Graph, id: NodeId) -> Result<Vec<NodeId>> {
    let mut seen = HashSet::new();
    let mut stack = vec![id];
    let mut out = Vec::new();
    while let Some(n) = stack.pop() {
        if !seen.insert(n) {
            continue;
        }
        let node = graph.node(n)?;
        if node.is_materialized() {
            continue;
        }
        out.push(n);
        stack.extend(node.preds.iter().copied());
    }
    out.sort_unstable();
    Ok(out)
}

/// Picks the backend for a subgraph of the given score.
pub fn choose(available: Backends, config: &SessionConfig, score: f64) -> Backend {
    let gpu = available.contains(Backend::Wgpu);
    if !available.contains(Backend::Cpu) {
        return if gpu { Backend::Wgpu } else { Backend::Cpu };
    }
    let threshold = if config.eager {
        config.eager_threshold
    } else {
        config.lazy_threshold
    };
    if gpu && score > threshold as f64 {
        Backend::Wgpu
    } else {
        Backend::Cpu
    }
}

/// Materializes `id`; a no-op when it already holds a result.
pub(crate) fn execute(session: &mut Session, id: NodeId) -> Result<()> {
    if session.graph.node(id)?.is_materialized() {
        return Ok(());
    }
    let pending = pending(&session.graph, id)?;
    let score = score(&session.graph, &pending)?;
    let backend = choose(session.available, &session.config, score);
    log::debug!(
        "execute {id:?}: {} pending nodes, score {score:.0}, backend {backend:?}",
        pending.len()
    );
    if backend == Backend::Wgpu {
        match accelerate(session, id) {
            Ok(()) => return Ok(()),
            Err(err) if session.available.contains(Backend::Cpu) => {
                log::warn!("accelerator failed on {id:?} ({err}), retrying on the CPU");
            }
            Err(err) => return Err(err),
        }
    }
    run_cpu(session, &pending)
}

fn run_cpu(session: &mut Session, pending: &[NodeId]) -> Result<()> {
    let chunk = session.config.cpu_chunk;
    for &n in pending {
        if session.graph.node(n)?.is_materialized() {
            continue;
        }
        let buffer = cpu::execute_node(&session.graph, n, chunk)?;
        session.graph.set_result(n, buffer)?;
    }
    Ok(())
}

#[cfg(feature = "wgpu")]
fn accelerate(session: &mut Session, id: NodeId) -> Result<()> {
    use crate::error::GraphError;
    use crate::fusion;

    // loop kernels read their operands from storage buffers
    for n in pending(&session.graph, id)? {
        let node = session.graph.node(n)?;
        if !node.kind().halts_fusion() {
            continue;
        }
        for p in node.preds.clone() {
            if !session.graph.node(p)?.is_materialized() {
                accelerate(session, p)?;
            }
        }
    }
    let kernel = fusion::compile(&session.graph, id, &mut session.sources)?;
    let dtype = session.graph.node(id)?.dtype;
    let gpu = session
        .gpu
        .as_mut()
        .ok_or(GraphError::BackendUnavailable(Backend::Wgpu))?;
    let buffer = gpu.run(&kernel, &session.graph, dtype)?;
    session.graph.set_result(id, buffer)
}

#[cfg(not(feature = "wgpu"))]
fn accelerate(_session: &mut Session, _id: NodeId) -> Result<()> {
    Err(crate::error::GraphError::BackendUnavailable(Backend::Wgpu))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weights() {
        let mut s = Session::new();
        let a = s.create(&[1.0f64; 12], &[3, 4]).unwrap();
        let r = s.reduce_sum(a, 1).unwrap();
        let e = s.exp(a).unwrap();
        let g = &s.graph;
        assert_eq!(operation_weight(g, g.node(r).unwrap()), 4.0);
        assert_eq!(operation_weight(g, g.node(e).unwrap()), 2.0);
        assert_eq!(score(g, &[r, e]).unwrap(), 3.0 * 4.0 + 12.0 * 2.0);
    }

    #[test]
    fn test_pending_stops_at_materialized_nodes() {
        let mut s = Session::new();
        let a = s.create(&[1i32, 2], &[2]).unwrap();
        let b = s.add_scalar(a, 1).unwrap();
        let c = s.mul(b, a).unwrap();
        let p = pending(&s.graph, c).unwrap();
        // the scalar constant is unmaterialized too
        assert_eq!(p.len(), 3);
        assert!(p.windows(2).all(|w| w[0] < w[1]));
        assert!(!p.contains(&a));
        s.execute(b).unwrap();
        assert_eq!(pending(&s.graph, c).unwrap(), vec![c]);
    }

    #[test]
    fn test_choose() {
        let cfg = SessionConfig::default();
        assert_eq!(choose(Backends::CPU, &cfg, 1e12), Backend::Cpu);
        assert_eq!(choose(Backends::WGPU, &cfg, 0.0), Backend::Wgpu);
        assert_eq!(choose(Backends::ALL, &cfg, 10.0), Backend::Cpu);
        assert_eq!(choose(Backends::ALL, &cfg, 1e6), Backend::Wgpu);
        let eager = cfg.with_eager(true);
        assert_eq!(choose(Backends::ALL, &eager, 4096.0), Backend::Cpu);
    }
}
