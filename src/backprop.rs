//! Reverse-mode differentiation over the graph.
//!
//! # Marking
//!
//! A node becomes a differentiation variable with [`Session::mark`]. Nodes
//! constructed afterwards inherit the union of their predecessors' traces, so
//! mark variables before building the expressions that use them.
//!
//! # The Pass
//!
//! [`Session::differentiate`] seeds the output's adjoint with ones and walks
//! the graph from the highest node id downwards. Ids grow with construction
//! order, so every consumer of a node has contributed to its adjoint before
//! the node itself is expanded, including in diamond-shaped graphs. Only
//! predecessors that depend on a requested variable are followed.
//!
//! Each local gradient (see [`crate::ops::gradients`]) is built as ordinary
//! nodes, then [`Session::unbroadcast`] folds it to the predecessor's shape.
//! The returned gradient is an unexecuted, floating node; intermediate
//! adjoints it does not depend on are freed before returning.
//!
//! # Example
//! ```rust
//! use briny_graph::prelude::*;
//!
//! let mut s = Session::new();
//! let x = s.create(&[1.0f64, 2.0, 3.0], &[3]).unwrap();
//! s.mark(x).unwrap();
//! let y = s.mul(x, x).unwrap();
//! let dx = s.differentiate(y, x).unwrap().unwrap();
//! assert_eq!(s.read::<f64>(dx).unwrap(), vec![2.0, 4.0, 6.0]);
//! ```

use crate::error::Result;
use crate::graph::NodeId;
use crate::graph::shape::numel;
use crate::ops::gradients::local_gradient;
use crate::ops::{Broadcast, Op};
use crate::session::Session;
use crate::tensors::{DType, Value};
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};

impl Session {
    /// Makes `id` a differentiation variable.
    pub fn mark(&mut self, id: NodeId) -> Result<()> {
        let node = self.graph.node_mut(id)?;
        node.trace.get_or_insert_with(BTreeSet::new).insert(id);
        self.graph.marked.insert(id);
        Ok(())
    }

    /// Stops treating `id` as a variable. Nodes built on it no longer count
    /// as depending on it.
    pub fn unmark(&mut self, id: NodeId) -> Result<()> {
        let node = self.graph.node_mut(id)?;
        if let Some(trace) = node.trace.as_mut() {
            trace.remove(&id);
            if trace.is_empty() {
                node.trace = None;
            }
        }
        self.graph.marked.remove(&id);
        Ok(())
    }

    pub fn is_marked(&self, id: NodeId) -> bool {
        self.graph.marked.contains(&id)
    }

    /// Gradient of `output` with respect to the marked variable `wrt`.
    ///
    /// Returns `None` with a warning when `wrt` is not marked or `output` does
    /// not depend on it.
    pub fn differentiate(&mut self, output: NodeId, wrt: NodeId) -> Result<Option<NodeId>> {
        Ok(self.differentiate_all(output, &[wrt])?.pop().flatten())
    }

    /// Gradients of `output` with respect to several variables in one pass.
    pub fn differentiate_all(&mut self, output: NodeId, wrt: &[NodeId]) -> Result<Vec<Option<NodeId>>> {
        let out = self.graph.node(output)?;
        let seed_type = if out.dtype.is_float() {
            out.dtype
        } else {
            DType::Float64
        };
        let out_shape = out.shape.clone();
        let mut vars = Vec::with_capacity(wrt.len());
        for &w in wrt {
            self.graph.node(w)?;
            if self.graph.marked.contains(&w) {
                vars.push(w);
            } else {
                log::warn!("{w:?} is not marked as a variable");
            }
        }
        let start = self.graph.next_id();
        // original nodes the gradient graph may reference
        let mut protected = BTreeSet::new();
        let mut adjoints = HashMap::new();
        if let Err(err) =
            self.accumulate(output, seed_type, &out_shape, &vars, &mut adjoints, &mut protected)
        {
            self.discard_since(start, &protected);
            return Err(err);
        }

        let results: Vec<Option<NodeId>> = wrt
            .iter()
            .map(|w| {
                let found = adjoints.get(w).copied().filter(|_| vars.contains(w));
                if found.is_none() {
                    log::warn!("derivative with respect to {w:?} not present in graph");
                }
                found
            })
            .collect();

        // free intermediate adjoints without touching caller-owned nodes
        let kept: Vec<NodeId> = protected.iter().copied().chain(results.iter().flatten().copied()).collect();
        for &id in &kept {
            self.retain(id)?;
        }
        let temporaries: BTreeSet<NodeId> = adjoints.values().copied().collect();
        for &t in temporaries.iter().rev() {
            self.free_if_unreferenced(t);
        }
        for id in kept {
            self.drop_ref(id);
        }
        Ok(results)
    }

    /// Accumulates adjoints from `output` down to the variables in `vars`.
    fn accumulate(
        &mut self,
        output: NodeId,
        seed_type: DType,
        out_shape: &[usize],
        vars: &[NodeId],
        adjoints: &mut HashMap<NodeId, NodeId>,
        protected: &mut BTreeSet<NodeId>,
    ) -> Result<()> {
        let depends = |s: &Session, p: NodeId| vars.iter().any(|v| *v == p || s.graph.traces(p, *v));
        let seed = self.constant(Value::one(seed_type), out_shape)?;
        adjoints.insert(output, seed);
        let mut visited = HashSet::from([output]);
        let mut heap = BinaryHeap::from([output]);

        while let Some(n) = heap.pop() {
            protected.insert(n);
            let Some(&adj) = adjoints.get(&n) else {
                continue;
            };
            let node = self.graph.node(n)?;
            let preds = node.preds.clone();
            let mode = match node.op {
                Op::Binary { broadcast, .. } => broadcast,
                _ => Broadcast::Trailing,
            };
            protected.extend(preds.iter().copied());
            for (k, &p) in preds.iter().enumerate() {
                if !depends(self, p) {
                    continue;
                }
                let local = local_gradient(self, n, k, adj)?;
                let target = self.graph.node(p)?.shape.clone();
                let local = self.unbroadcast(local, &target, mode)?;
                let total = match adjoints.get(&p) {
                    Some(&prev) => self.add(prev, local)?,
                    None => local,
                };
                adjoints.insert(p, total);
                if visited.insert(p) {
                    heap.push(p);
                }
            }
        }
        Ok(())
    }

    /// Frees every node built since `start`, keeping `protected` alive.
    fn discard_since(&mut self, start: NodeId, protected: &BTreeSet<NodeId>) {
        for &id in protected {
            let _ = self.retain(id);
        }
        for id in self.graph.ids_since(start).into_iter().rev() {
            self.free_if_unreferenced(id);
        }
        for &id in protected {
            self.drop_ref(id);
        }
    }

    /// Folds `local` down (or up) to `target`, undoing a binary broadcast.
    ///
    /// Extra dimensions are summed away (leading ones for trailing alignment,
    /// trailing ones for leading alignment); an equal-rank operand that was a
    /// scalar is summed to one element.
    pub fn unbroadcast(&mut self, local: NodeId, target: &[usize], mode: Broadcast) -> Result<NodeId> {
        let mut x = local;
        loop {
            let shape = self.graph.node(x)?.shape.clone();
            if shape == target {
                return Ok(x);
            }
            if shape.len() > target.len() {
                let axis = match mode {
                    Broadcast::Trailing => 0,
                    Broadcast::Leading => shape.len() - 1,
                };
                x = self.reduce_sum(x, axis)?;
            } else if shape.len() < target.len() {
                let ones = vec![1; target.len() - shape.len()];
                let padded = match mode {
                    Broadcast::Trailing => [ones.as_slice(), &shape].concat(),
                    Broadcast::Leading => [shape.as_slice(), &ones].concat(),
                };
                let r = self.reshape(x, &padded)?;
                let reps: Vec<usize> = target.iter().zip(&padded).map(|(t, p)| t / p).collect();
                x = self.repeat(r, &reps)?;
            } else if numel(&shape) == numel(target) {
                x = self.reshape(x, target)?;
            } else {
                let flat = self.flatten(x)?;
                let sum = self.reduce_sum(flat, 0)?;
                x = self.reshape(sum, target)?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbroadcast_scalar_operand() {
        let mut s = Session::new();
        let g = s.constant(1.0, &[2, 3]).unwrap();
        let u = s.unbroadcast(g, &[1], Broadcast::Trailing).unwrap();
        assert_eq!(s.read::<f64>(u).unwrap(), vec![6.0]);
    }

    #[test]
    fn test_unbroadcast_leading_alignment() {
        let mut s = Session::new();
        let g = s.arange(&[2, 3], 1).unwrap();
        let u = s.unbroadcast(g, &[2], Broadcast::Leading).unwrap();
        assert_eq!(s.read::<i64>(u).unwrap(), vec![3, 3]);
    }

    #[test]
    fn test_diamond_accumulates_every_path() {
        let mut s = Session::new();
        let x = s.create(&[3.0f64], &[1]).unwrap();
        s.mark(x).unwrap();
        let a = s.mul(x, x).unwrap();
        let b = s.mul_scalar(x, 4.0).unwrap();
        let y = s.add(a, b).unwrap();
        let z = s.mul(y, a).unwrap();
        // z = (x^2 + 4x) x^2, dz/dx = 4x^3 + 12x^2
        let dz = s.differentiate(z, x).unwrap().unwrap();
        assert_eq!(s.read::<f64>(dz).unwrap(), vec![4.0 * 27.0 + 12.0 * 9.0]);
    }

    #[test]
    fn test_unmarked_variable_yields_none() {
        let mut s = Session::new();
        let x = s.create(&[1.0f32], &[1]).unwrap();
        let y = s.exp(x).unwrap();
        assert_eq!(s.differentiate(y, x).unwrap(), None);
        let before = s.live_nodes();
        s.mark(x).unwrap();
        let other = s.create(&[1.0f32], &[1]).unwrap();
        s.mark(other).unwrap();
        assert_eq!(s.differentiate(y, other).unwrap(), None);
        assert_eq!(s.live_nodes(), before + 1);
    }

    #[test]
    fn test_failed_pass_frees_partial_adjoints() {
        let mut s = Session::new();
        let x = s.create(&[2.0f64, 3.0], &[2]).unwrap();
        let y = s.sin(x).unwrap();
        let before = s.live_nodes();

        let start = s.graph.next_id();
        let seed = s.constant(1.0, &[2]).unwrap();
        let local = s.mul(seed, y).unwrap();
        let _partial = s.add(local, x).unwrap();
        assert_eq!(s.live_nodes(), before + 3);

        s.discard_since(start, &BTreeSet::from([x, y]));
        assert_eq!(s.live_nodes(), before);
        assert!(s.contains(x) && s.contains(y));
        assert_eq!(s.read::<f64>(y).unwrap(), vec![2.0f64.sin(), 3.0f64.sin()]);
    }
}
