//! Reference counting, cascading release and in-place compaction.
//!
//! A freshly constructed node is *floating*: its count is 0 and nothing keeps it
//! alive except the handle the caller holds. Each successor edge and each
//! [`Session::retain`] adds one holder. [`Session::release`] drops one holder,
//! and frees the node once no holder is left, cascading through predecessors
//! whose count drops to zero on the way.
//!
//! The cascade runs over an explicit queue, so arbitrarily deep chains cannot
//! overflow the call stack.

use crate::error::Result;
use crate::graph::NodeId;
use crate::ops::Op;
use crate::session::Session;
use std::collections::{HashSet, VecDeque};

impl Session {
    /// Adds one external holder to `id`.
    pub fn retain(&mut self, id: NodeId) -> Result<()> {
        self.graph.node_mut(id)?.refs += 1;
        Ok(())
    }

    /// Drops one holder of `id`, freeing it (and orphaned ancestors) when none is left.
    ///
    /// Releasing a node that is already gone is reported with a warning and
    /// otherwise ignored.
    pub fn release(&mut self, id: NodeId) {
        let Ok(node) = self.graph.node_mut(id) else {
            log::warn!("release of unknown node {id:?}");
            return;
        };
        if node.refs > 0 {
            node.refs -= 1;
            if node.refs > 0 {
                return;
            }
        }
        self.free_cascade(id);
    }

    /// Frees `id` if it has no holder. Used for temporaries the engine created itself.
    pub(crate) fn free_if_unreferenced(&mut self, id: NodeId) {
        if self.graph.node(id).is_ok_and(|n| n.refs == 0) {
            self.free_cascade(id);
        }
    }

    /// Decrements without ever freeing.
    pub(crate) fn drop_ref(&mut self, id: NodeId) {
        if let Ok(node) = self.graph.node_mut(id) {
            node.refs = node.refs.saturating_sub(1);
        }
    }

    fn free_cascade(&mut self, root: NodeId) {
        let mut queue = VecDeque::from([root]);
        let mut visited = HashSet::new();
        let mut freed = 0usize;
        while let Some(id) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            let Some(node) = self.graph.remove(id) else {
                continue;
            };
            freed += 1;
            for pred in node.preds {
                if let Ok(p) = self.graph.node_mut(pred) {
                    p.refs = p.refs.saturating_sub(1);
                    if p.refs == 0 {
                        queue.push_back(pred);
                    }
                }
            }
        }
        log::trace!("released {root:?}, {freed} nodes freed");
    }

    /// Rewrites a materialized node into a predecessor-free store holding its
    /// buffer, releasing the former ancestry.
    ///
    /// A no-op (returning `false`) when the node is not materialized, is
    /// already a leaf, or still lies on a live gradient path.
    pub fn compact(&mut self, id: NodeId) -> Result<bool> {
        let node = self.graph.node(id)?;
        if !node.is_materialized() || node.preds.is_empty() || self.graph.has_live_trace(id) {
            return Ok(false);
        }
        let node = self.graph.node_mut(id)?;
        node.op = Op::Store {
            shape: node.shape.clone(),
            dtype: node.dtype,
        };
        node.trace = None;
        let preds = std::mem::take(&mut node.preds);
        for pred in preds {
            if let Ok(p) = self.graph.node_mut(pred) {
                p.refs = p.refs.saturating_sub(1);
            }
            self.free_if_unreferenced(pred);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deep_chain_release_does_not_recurse() {
        let mut s = Session::new();
        let mut n = s.create(&[1.0f32], &[1]).unwrap();
        for _ in 0..10_000 {
            n = s.add_scalar(n, 1.0f32).unwrap();
        }
        assert_eq!(s.live_nodes(), 20_001);
        s.release(n);
        assert_eq!(s.live_nodes(), 0);
    }

    #[test]
    fn test_duplicate_predecessor_is_counted_twice() {
        let mut s = Session::new();
        let a = s.create(&[2i32, 3], &[2]).unwrap();
        let b = s.add(a, a).unwrap();
        assert_eq!(s.reference_count(a).unwrap(), 2);
        s.release(b);
        assert!(!s.contains(a));
    }
}
