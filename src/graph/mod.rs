//! Graph intermediate representation.
//!
//! A [`Graph`] is an arena of [`Node`]s addressed by [`NodeId`]. Ids are handed
//! out from a monotonically increasing counter and never reused, and a node can
//! only name nodes that already exist as predecessors, so sorting ids gives a
//! topological order for free (the scheduler and the differentiation pass both
//! rely on this).
//!
//! Shape, element type and payload are fixed when a node is inserted. The only
//! later mutations are attaching a materialized buffer, reference counting, and
//! the compaction rewrite into a [`Op::Store`].

pub mod build;
pub mod shape;

use crate::error::{GraphError, Result};
use crate::ops::{Op, OpKind};
use crate::tensors::{Buffer, DType};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Handle of a node inside one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) u64);

impl NodeId {
    pub fn index(self) -> u64 {
        self.0
    }
}

/// One DAG vertex.
#[derive(Debug, Clone)]
pub struct Node {
    pub op: Op,
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub preds: Vec<NodeId>,
    /// Successors plus explicit retains.
    pub refs: usize,
    pub result: Option<Buffer>,
    /// Marked differentiation variables this node depends on.
    pub trace: Option<BTreeSet<NodeId>>,
}

impl Node {
    pub fn kind(&self) -> OpKind {
        self.op.kind()
    }

    pub fn numel(&self) -> usize {
        shape::numel(&self.shape)
    }

    pub fn is_materialized(&self) -> bool {
        self.result.is_some()
    }
}

/// Arena of live nodes plus the set of active differentiation variables.
#[derive(Debug, Default)]
pub struct Graph {
    nodes: HashMap<NodeId, Node>,
    next: u64,
    pub(crate) marked: HashSet<NodeId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes.get(&id).ok_or(GraphError::UnknownNode(id))
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes.get_mut(&id).ok_or(GraphError::UnknownNode(id))
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The materialized buffer of `id`, if any.
    pub fn result(&self, id: NodeId) -> Result<Option<&Buffer>> {
        Ok(self.node(id)?.result.as_ref())
    }

    /// Union of the predecessors' traces, restricted to still-marked variables.
    pub(crate) fn union_trace(&self, preds: &[NodeId]) -> Option<BTreeSet<NodeId>> {
        let mut set = BTreeSet::new();
        for p in preds {
            if let Some(trace) = self.nodes.get(p).and_then(|n| n.trace.as_ref()) {
                set.extend(trace.iter().copied().filter(|v| self.marked.contains(v)));
            }
        }
        (!set.is_empty()).then_some(set)
    }

    /// Whether `id` currently depends on the marked variable `var`.
    pub fn traces(&self, id: NodeId, var: NodeId) -> bool {
        self.marked.contains(&var)
            && self
                .nodes
                .get(&id)
                .and_then(|n| n.trace.as_ref())
                .is_some_and(|t| t.contains(&var))
    }

    /// Whether `id` has any live gradient trace.
    pub fn has_live_trace(&self, id: NodeId) -> bool {
        self.nodes
            .get(&id)
            .and_then(|n| n.trace.as_ref())
            .is_some_and(|t| t.iter().any(|v| self.marked.contains(v)))
    }

    /// Inserts a fully inferred node and takes one reference on each predecessor.
    pub(crate) fn insert(
        &mut self,
        op: Op,
        shape: Vec<usize>,
        dtype: DType,
        preds: Vec<NodeId>,
        result: Option<Buffer>,
    ) -> Result<NodeId> {
        for p in &preds {
            self.node_mut(*p)?.refs += 1;
        }
        let trace = self.union_trace(&preds);
        let id = NodeId(self.next);
        self.next += 1;
        self.nodes.insert(
            id,
            Node {
                op,
                shape,
                dtype,
                preds,
                refs: 0,
                result,
                trace,
            },
        );
        Ok(id)
    }

    /// Id the next inserted node will receive.
    pub(crate) fn next_id(&self) -> NodeId {
        NodeId(self.next)
    }

    /// Live nodes inserted at or after `start`, ascending.
    pub(crate) fn ids_since(&self, start: NodeId) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.keys().copied().filter(|id| *id >= start).collect();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn remove(&mut self, id: NodeId) -> Option<Node> {
        self.marked.remove(&id);
        self.nodes.remove(&id)
    }

    pub(crate) fn set_result(&mut self, id: NodeId, buffer: Buffer) -> Result<()> {
        self.node_mut(id)?.result = Some(buffer);
        Ok(())
    }
}
