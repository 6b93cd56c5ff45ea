//! # Kernel Fusion
//!
//! Turns the unmaterialized sub-graph below a node into one WGSL compute
//! kernel. Each invocation computes a single output element: it starts from its
//! flat output index and walks the sub-graph recursively, re-projecting the
//! index whenever a layout op (slice, transpose, broadcast, ...) changes which
//! source element is read. Reductions become loops, `extend` and `concat`
//! become branches.
//!
//! Materialized nodes stop the walk and become storage-buffer parameters. The
//! loop-heavy kinds (matrix product, the convolution family, `unslide`) always
//! read their operands from parameters, so the scheduler materializes those
//! operands before compiling.
//!
//! Binding layout: `dims: array<u32>` first (`dims[0]` is the element count,
//! followed by the runtime scalars of matrix and convolution fragments), one
//! `p{k}` array per parameter, then `result`.

pub mod cache;
pub mod expr;

use crate::error::{GraphError, Result};
use crate::graph::shape::{acc_sizes, broadcast_params, numel, window_count};
use crate::graph::{Graph, Node, NodeId};
use crate::ops::{BinaryOp, Op, ReduceOp, UnaryOp};
use crate::tensors::Value;
use briny::prelude::*;
use cache::KernelCache;
use expr::{Binding, Expr, Stmt, Ty, WORKGROUP_SIZE, render_module};
use std::collections::HashMap;
use std::fmt::Write;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

/// Name of the mutable flat index every fragment reads.
const INDEX: &str = "index";

/// A compiled fused kernel plus everything needed to dispatch it.
#[derive(Debug, Clone)]
pub struct FusedKernel {
    /// Structural key; equal keys produce identical sources.
    pub key: String,
    /// Materialized nodes bound as `p0, p1, ...`.
    pub params: Vec<NodeId>,
    pub param_types: Vec<Ty>,
    /// Contents of the `dims` buffer.
    pub dims: Vec<u32>,
    /// Number of output elements.
    pub len: usize,
    pub out_ty: Ty,
    pub source: Arc<str>,
}

impl FusedKernel {
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Short stable tag for the kernel's structure, used in logs and errors.
    pub fn label(&self) -> String {
        let mut h = DefaultHasher::new();
        self.key.hash(&mut h);
        format!("{:016x}", h.finish())
    }

    /// Number of storage buffers the kernel binds: `dims`, parameters, `result`.
    pub fn bindings(&self) -> usize {
        self.params.len() + 2
    }

    /// Workgroup grid `(x, y)` covering `len` invocations.
    pub fn workgroups(&self) -> (u32, u32) {
        let groups = (self.len as u64).div_ceil(WORKGROUP_SIZE as u64).max(1);
        let x = groups.min(65_535);
        (x as u32, groups.div_ceil(x) as u32)
    }
}

impl Validate for FusedKernel {
    /// The source must declare exactly the buffers the dispatch binds, and the
    /// element count it reads from `dims[0]` must match the output length.
    fn validate(&self) -> std::result::Result<(), ValidationError> {
        if self.params.len() != self.param_types.len() {
            return Err(ValidationError);
        }
        if self.dims.first().map(|&n| n as usize) != Some(self.len) {
            return Err(ValidationError);
        }
        if !self.source.contains("fn main(") || self.source.matches("@binding(").count() != self.bindings() {
            return Err(ValidationError);
        }
        Ok(())
    }
}

/// Compiles the sub-graph rooted at `root`, reusing a cached source when the
/// same structure was compiled before.
pub fn compile(graph: &Graph, root: NodeId, cache: &mut KernelCache<Arc<str>>) -> Result<FusedKernel> {
    let node = graph.node(root)?;
    let len = node.numel();
    let out_ty = Ty::of(node.dtype);
    let mut c = Compiler::new(graph, root);
    c.dims.push(small(len)?);

    c.push(Stmt::Let {
        name: "gidx".into(),
        ty: Ty::U32,
        value: Expr::var("gid.x").bin(
            "+",
            Expr::var("gid.y")
                .bin("*", Expr::var("nwg.x"))
                .bin("*", Expr::U32(WORKGROUP_SIZE)),
        ),
    });
    c.push(Stmt::If {
        cond: Expr::var("gidx").bin(">=", Expr::index("dims", Expr::U32(0))),
        then: vec![Stmt::Return],
        otherwise: vec![],
    });
    c.push(Stmt::Var {
        name: INDEX.into(),
        ty: Ty::U32,
        value: Expr::var("gidx"),
    });
    let (value, ty) = c.emit(root)?;
    c.push(Stmt::Store {
        array: "result".into(),
        at: Expr::var("gidx"),
        value: Expr::var(value).cast(ty, out_ty),
    });
    let _ = write!(c.key, "=>{};", out_ty.name());

    let Compiler {
        key,
        params,
        param_types,
        dims,
        random,
        mut blocks,
        ..
    } = c;
    let body = blocks.pop().unwrap_or_default();
    let source = cache.get_or_try_insert_with(&key, || {
        let mut bindings = vec![Binding {
            name: "dims".into(),
            ty: Ty::U32,
            writable: false,
        }];
        bindings.extend(param_types.iter().enumerate().map(|(k, ty)| Binding {
            name: format!("p{k}"),
            ty: *ty,
            writable: false,
        }));
        bindings.push(Binding {
            name: "result".into(),
            ty: out_ty,
            writable: true,
        });
        render_module(&bindings, random, &body)
            .map(Arc::from)
            .map_err(|_| GraphError::Backend("failed to render kernel source".into()))
    })?;
    log::debug!(
        "fused {root:?} into a kernel with {} parameters over {len} elements",
        params.len()
    );
    Ok(FusedKernel {
        key,
        params,
        param_types,
        dims,
        len,
        out_ty,
        source,
    })
}

fn small(v: usize) -> Result<u32> {
    u32::try_from(v).map_err(|_| GraphError::Backend(format!("{v} exceeds the 32-bit index range")))
}

fn lit(v: usize) -> Result<Expr> {
    small(v).map(Expr::U32)
}

/// `(o / acc) % extent`, skipping trivial terms.
fn coord(o: &Expr, acc: usize, extent: usize) -> Result<Expr> {
    let q = if acc == 1 { o.clone() } else { o.clone().bin("/", lit(acc)?) };
    Ok(q.bin("%", lit(extent)?))
}

struct Compiler<'g> {
    graph: &'g Graph,
    root: NodeId,
    blocks: Vec<Vec<Stmt>>,
    /// Emitted values per `(node, index scope)`.
    vars: HashMap<(NodeId, usize), (String, Ty)>,
    scope: usize,
    scopes: usize,
    names: usize,
    params: Vec<NodeId>,
    param_types: Vec<Ty>,
    slots: HashMap<NodeId, usize>,
    dims: Vec<u32>,
    key: String,
    random: bool,
}

impl<'g> Compiler<'g> {
    fn new(graph: &'g Graph, root: NodeId) -> Self {
        Self {
            graph,
            root,
            blocks: vec![Vec::new()],
            vars: HashMap::new(),
            scope: 0,
            scopes: 0,
            names: 0,
            params: Vec::new(),
            param_types: Vec::new(),
            slots: HashMap::new(),
            dims: Vec::new(),
            key: String::new(),
            random: false,
        }
    }

    /// `prefix_n`; the separator keeps locals apart from the `p{k}` parameters.
    fn fresh(&mut self, prefix: &str) -> String {
        self.names += 1;
        format!("{prefix}_{}", self.names)
    }

    fn push(&mut self, stmt: Stmt) {
        if let Some(block) = self.blocks.last_mut() {
            block.push(stmt);
        }
    }

    fn bind(&mut self, prefix: &str, ty: Ty, value: Expr) -> Expr {
        let name = self.fresh(prefix);
        self.push(Stmt::Let {
            name: name.clone(),
            ty,
            value,
        });
        Expr::var(name)
    }

    fn mutable(&mut self, prefix: &str, ty: Ty, value: Expr) -> String {
        let name = self.fresh(prefix);
        self.push(Stmt::Var {
            name: name.clone(),
            ty,
            value,
        });
        name
    }

    /// Appends runtime scalars to `dims` and returns an accessor per value.
    fn runtime(&mut self, values: &[usize]) -> Result<Vec<Expr>> {
        values
            .iter()
            .map(|&v| {
                let at = self.dims.len();
                self.dims.push(small(v)?);
                Ok(Expr::index("dims", lit(at)?))
            })
            .collect()
    }

    /// Runs `f` inside a fresh block and index scope; returns the block.
    fn block<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<(Vec<Stmt>, T)> {
        self.blocks.push(Vec::new());
        let saved = self.scope;
        self.scopes += 1;
        self.scope = self.scopes;
        let r = f(self);
        self.scope = saved;
        let stmts = self.blocks.pop().unwrap_or_default();
        Ok((stmts, r?))
    }

    /// Emits `pred` with the flat index re-projected by `remap`.
    fn remapped(
        &mut self,
        pred: NodeId,
        remap: impl FnOnce(&Expr) -> Result<Expr>,
    ) -> Result<(String, Ty)> {
        let saved_index = self.bind("o", Ty::U32, Expr::var(INDEX));
        let target = remap(&saved_index)?;
        self.push(Stmt::assign(INDEX, target));
        let saved = self.scope;
        self.scopes += 1;
        self.scope = self.scopes;
        let r = self.emit(pred);
        self.scope = saved;
        self.push(Stmt::assign(INDEX, saved_index));
        r
    }

    /// Storage slot of a materialized node.
    fn param(&mut self, id: NodeId, ty: Ty) -> String {
        let slot = match self.slots.get(&id) {
            Some(slot) => *slot,
            None => {
                let slot = self.params.len();
                self.params.push(id);
                self.param_types.push(ty);
                self.slots.insert(id, slot);
                slot
            }
        };
        format!("p{slot}")
    }

    /// Parameter array and element type of an operand of a loop-heavy kind.
    fn operand(&mut self, id: NodeId) -> Result<(String, Ty)> {
        let node = self.graph.node(id)?;
        if !node.is_materialized() {
            return Err(GraphError::Backend(format!(
                "operand {id:?} of a loop kernel is not materialized"
            )));
        }
        let ty = Ty::of(node.dtype);
        let array = self.param(id, ty);
        let _ = write!(self.key, "{array}:{};", ty.name());
        Ok((array, ty))
    }

    /// Emits the value of `id` at the current index; returns the variable
    /// holding it and its type.
    fn emit(&mut self, id: NodeId) -> Result<(String, Ty)> {
        if let Some((name, ty)) = self.vars.get(&(id, self.scope)) {
            let _ = write!(self.key, "@{name};");
            return Ok((name.clone(), *ty));
        }
        let graph = self.graph;
        let node = graph.node(id)?;
        let ty = Ty::of(node.dtype);
        let value = if node.is_materialized() && id != self.root {
            let array = self.param(id, ty);
            let _ = write!(self.key, "{array}:{};", ty.name());
            Expr::index(array, Expr::var(INDEX))
        } else {
            let value = self.fragment(node, ty)?;
            let _ = write!(self.key, "{};", token(self.graph, node));
            value
        };
        let name = self.fresh("v");
        self.push(Stmt::Let {
            name: name.clone(),
            ty,
            value,
        });
        self.vars.insert((id, self.scope), (name.clone(), ty));
        Ok((name, ty))
    }

    fn emit_as(&mut self, id: NodeId, ty: Ty) -> Result<Expr> {
        let (name, from) = self.emit(id)?;
        Ok(Expr::var(name).cast(from, ty))
    }

    fn fragment(&mut self, node: &'g Node, ty: Ty) -> Result<Expr> {
        let graph = self.graph;
        let len = node.numel();
        let index = Expr::var(INDEX);
        match &node.op {
            Op::Store { .. } => Err(GraphError::Backend("store without data".into())),
            Op::Const { value, .. } => Ok(match value.cast(node.dtype) {
                Value::Int32(v) => Expr::I32(v),
                Value::Int64(v) => Expr::I32(v as i32),
                Value::Float32(v) => Expr::F32(v),
                Value::Float64(v) => Expr::F32(v as f32),
            }),
            Op::Random { seed, .. } => {
                self.random = true;
                let hashed = Expr::call(
                    "pcg_hash",
                    vec![index.bin("+", Expr::call("pcg_hash", vec![Expr::U32(*seed)]))],
                );
                let unit = Expr::call("f32", vec![hashed]).bin("*", Expr::F32(2.328_306_4e-10));
                Ok(Expr::call("min", vec![unit, Expr::F32(0.999_999_94)]).cast(Ty::F32, ty))
            }
            Op::Arange { axis, shape } => {
                let c = coord(&index, acc_sizes(shape)[*axis], shape[*axis])?;
                Ok(c.cast(Ty::U32, ty))
            }
            Op::Binary { op, broadcast } => {
                let mut operands = Vec::with_capacity(2);
                for &p in &node.preds {
                    let count = graph.node(p)?.numel();
                    let (inv, cnt) = broadcast_params(len, count, *broadcast);
                    let var = if inv == 1 && cnt == len {
                        self.emit(p)?
                    } else {
                        self.remapped(p, |o| {
                            let q = if inv == 1 { o.clone() } else { o.clone().bin("/", lit(inv)?) };
                            Ok(q.bin("%", lit(cnt)?))
                        })?
                    };
                    operands.push(var);
                }
                let work = if op.is_comparison() {
                    let a = graph.node(node.preds[0])?.dtype;
                    let b = graph.node(node.preds[1])?.dtype;
                    Ty::of(a.unify(b))
                } else {
                    ty
                };
                let [a, b] = [&operands[0], &operands[1]].map(|(n, t)| Expr::var(n.clone()).cast(*t, work));
                Ok(binary(*op, work, a, b))
            }
            Op::Unary(op) => {
                let (x, from) = self.emit(node.preds[0])?;
                Ok(unary(*op, Expr::var(x), from))
            }
            Op::Convert(_) => {
                let (x, from) = self.emit(node.preds[0])?;
                Ok(Expr::var(x).cast(from, ty))
            }
            Op::Reshape { .. } => self.emit_as(node.preds[0], ty),
            Op::Reduce { op, axis } => self.reduce(node, *op, *axis, ty),
            Op::Slice { start, step, .. } => {
                let source = &graph.node(node.preds[0])?.shape;
                let (out_acc, src_acc) = (acc_sizes(&node.shape), acc_sizes(source));
                let (x, from) = self.remapped(node.preds[0], |o| {
                    let base: usize = (0..start.len()).map(|d| start[d] * src_acc[d]).sum();
                    let mut terms = vec![Expr::I32(small(base)? as i32)];
                    for d in 0..start.len() {
                        let c = coord(o, out_acc[d], node.shape[d])?;
                        let coef = step[d] * src_acc[d] as isize;
                        terms.push(Expr::call("i32", vec![c]).bin("*", Expr::I32(coef as i32)));
                    }
                    Ok(Expr::call("u32", vec![Expr::sum(terms)]))
                })?;
                Ok(Expr::var(x).cast(from, ty))
            }
            Op::Extend { start, step, .. } => self.extend(node, start, step, ty),
            Op::Repeat { .. } => {
                let source = &graph.node(node.preds[0])?.shape;
                let (out_acc, src_acc) = (acc_sizes(&node.shape), acc_sizes(source));
                let (x, from) = self.remapped(node.preds[0], |o| {
                    let mut terms = Vec::new();
                    for d in 0..source.len() {
                        let mut c = coord(o, out_acc[d], node.shape[d])?;
                        if source[d] != node.shape[d] {
                            c = c.bin("%", lit(source[d])?);
                        }
                        terms.push(c.bin("*", lit(src_acc[d])?));
                    }
                    Ok(Expr::sum(terms))
                })?;
                Ok(Expr::var(x).cast(from, ty))
            }
            Op::Transpose { perm } => {
                let source = &graph.node(node.preds[0])?.shape;
                let (out_acc, src_acc) = (acc_sizes(&node.shape), acc_sizes(source));
                let (x, from) = self.remapped(node.preds[0], |o| {
                    let mut terms = Vec::new();
                    for d in 0..perm.len() {
                        let c = coord(o, out_acc[d], node.shape[d])?;
                        terms.push(c.bin("*", lit(src_acc[perm[d]])?));
                    }
                    Ok(Expr::sum(terms))
                })?;
                Ok(Expr::var(x).cast(from, ty))
            }
            Op::Concat { axis } => self.concat(node, *axis, ty),
            Op::SlidingWindow { size, steps } => {
                let source = &graph.node(node.preds[0])?.shape;
                let counts: Vec<usize> = (0..source.len())
                    .map(|d| window_count(source[d], size[d], steps[d]))
                    .collect();
                let (acc_c, acc_s, acc_p) = (acc_sizes(&counts), acc_sizes(size), acc_sizes(source));
                let window_len = numel(size);
                let (x, from) = self.remapped(node.preds[0], |o| {
                    let w = o.clone().bin("/", lit(window_len)?);
                    let r = o.clone().bin("%", lit(window_len)?);
                    let mut terms = Vec::new();
                    for d in 0..source.len() {
                        let wd = coord(&w, acc_c[d], counts[d])?.bin("*", lit(steps[d])?);
                        let rd = coord(&r, acc_s[d], size[d])?;
                        terms.push(wd.bin("+", rd).bin("*", lit(acc_p[d])?));
                    }
                    Ok(Expr::sum(terms))
                })?;
                Ok(Expr::var(x).cast(from, ty))
            }
            Op::Matmul => self.matmul(node, ty),
            Op::Convolve { steps } => {
                let image = graph.node(node.preds[0])?.shape.clone();
                let kernel = graph.node(node.preds[1])?.shape.clone();
                self.convolve(node, &image, &kernel, steps, ty)
            }
            Op::GradientConvolve1 { steps, image_shape } => {
                let kernel = graph.node(node.preds[0])?.shape.clone();
                self.image_gradient(node, image_shape, &kernel, steps, ty)
            }
            Op::GradientConvolve2 { steps, kernel_shape } => {
                let image = graph.node(node.preds[0])?.shape.clone();
                self.kernel_gradient(node, &image, kernel_shape, steps, ty)
            }
            Op::Unslide { steps, shape } => self.unslide(node, shape, steps, ty),
        }
    }

    fn reduce(&mut self, node: &Node, op: ReduceOp, axis: usize, ty: Ty) -> Result<Expr> {
        let pred = node.preds[0];
        let graph = self.graph;
        let source = &graph.node(pred)?.shape;
        let (stride, extent) = (acc_sizes(source)[axis], source[axis]);
        let init = match op {
            ReduceOp::Sum => ty.zero(),
            ReduceOp::Mul => Expr::literal(ty, 1.0),
            ReduceOp::Min => ty.highest(),
            ReduceOp::Max => ty.lowest(),
        };
        let acc = self.mutable("acc", ty, init);
        let o = self.bind("o", Ty::U32, Expr::var(INDEX));
        let base = if stride == 1 {
            o.clone().bin("*", lit(extent)?)
        } else {
            o.clone()
                .bin("/", lit(stride)?)
                .bin("*", lit(stride * extent)?)
                .bin("+", o.clone().bin("%", lit(stride)?))
        };
        let j = self.fresh("j");
        let (body, ()) = self.block(|c| {
            let step = if stride == 1 {
                Expr::var(&j)
            } else {
                Expr::var(&j).bin("*", lit(stride)?)
            };
            c.push(Stmt::assign(INDEX, base.bin("+", step)));
            let x = c.emit_as(pred, ty)?;
            let a = Expr::var(&acc);
            let folded = match op {
                ReduceOp::Sum => a.bin("+", x),
                ReduceOp::Mul => a.bin("*", x),
                ReduceOp::Min => Expr::call("min", vec![a, x]),
                ReduceOp::Max => Expr::call("max", vec![a, x]),
            };
            c.push(Stmt::assign(&acc, folded));
            Ok(())
        })?;
        self.push(Stmt::For {
            var: j,
            count: lit(extent)?,
            body,
        });
        self.push(Stmt::assign(INDEX, o));
        Ok(Expr::var(acc))
    }

    fn extend(&mut self, node: &Node, start: &[usize], step: &[isize], ty: Ty) -> Result<Expr> {
        let pred = node.preds[0];
        let source = self.graph.node(pred)?.shape.clone();
        let (out_acc, src_acc) = (acc_sizes(&node.shape), acc_sizes(&source));
        let acc = self.mutable("acc", ty, ty.zero());
        let o = self.bind("o", Ty::U32, Expr::var(INDEX));
        let mut conds = Vec::new();
        let mut terms = Vec::new();
        for d in 0..node.shape.len() {
            let p = Expr::call("i32", vec![coord(&o, out_acc[d], node.shape[d])?]);
            let s = Expr::I32(small(start[d])? as i32);
            let q = if step[d] > 0 { p.bin("-", s) } else { s.bin("-", p) };
            let q = self.bind("q", Ty::I32, q);
            let t = step[d].unsigned_abs();
            let placed = if t == 1 { q.clone() } else { q.clone().bin("/", Expr::I32(small(t)? as i32)) };
            conds.push(q.clone().bin(">=", Expr::I32(0)));
            if t != 1 {
                conds.push(q.bin("%", Expr::I32(small(t)? as i32)).bin("==", Expr::I32(0)));
            }
            conds.push(placed.clone().bin("<", Expr::I32(small(source[d])? as i32)));
            terms.push(Expr::call("u32", vec![placed]).bin("*", lit(src_acc[d])?));
        }
        let (then, ()) = self.block(|c| {
            c.push(Stmt::assign(INDEX, Expr::sum(terms)));
            let x = c.emit_as(pred, ty)?;
            c.push(Stmt::assign(&acc, x));
            Ok(())
        })?;
        self.push(Stmt::If {
            cond: Expr::all(conds),
            then,
            otherwise: vec![],
        });
        self.push(Stmt::assign(INDEX, o));
        Ok(Expr::var(acc))
    }

    fn concat(&mut self, node: &Node, axis: usize, ty: Ty) -> Result<Expr> {
        let (left, right) = (node.preds[0], node.preds[1]);
        let inner = acc_sizes(&node.shape)[axis];
        let total = node.shape[axis];
        let split = self.graph.node(left)?.shape[axis];
        let acc = self.mutable("acc", ty, ty.zero());
        let o = self.bind("o", Ty::U32, Expr::var(INDEX));
        let outer = self.bind("outer", Ty::U32, o.clone().bin("/", lit(inner * total)?));
        let pos = self.bind("pos", Ty::U32, coord(&o, inner, total)?);
        let rest = self.bind("rest", Ty::U32, o.clone().bin("%", lit(inner)?));
        let side = |c: &mut Self, pred: NodeId, width: usize, offset: usize| -> Result<Vec<Stmt>> {
            let target = outer
                .clone()
                .bin("*", lit(width * inner)?)
                .bin("+", pos.clone().bin("-", lit(offset)?).bin("*", lit(inner)?))
                .bin("+", rest.clone());
            let (stmts, ()) = c.block(|c| {
                c.push(Stmt::assign(INDEX, target));
                let x = c.emit_as(pred, ty)?;
                c.push(Stmt::assign(&acc, x));
                Ok(())
            })?;
            Ok(stmts)
        };
        let then = side(self, left, split, 0)?;
        let otherwise = side(self, right, total - split, split)?;
        self.push(Stmt::If {
            cond: pos.clone().bin("<", lit(split)?),
            then,
            otherwise,
        });
        self.push(Stmt::assign(INDEX, o));
        Ok(Expr::var(acc))
    }

    fn matmul(&mut self, node: &Node, ty: Ty) -> Result<Expr> {
        let (pa, ta) = self.operand(node.preds[0])?;
        let (pb, tb) = self.operand(node.preds[1])?;
        let graph = self.graph;
        let a = &graph.node(node.preds[0])?.shape;
        let b = &graph.node(node.preds[1])?.shape;
        let (l, m, n) = (a[a.len() - 2], a[a.len() - 1], b[b.len() - 1]);
        let values = [l, m, n, numel(a) / (l * m), numel(b) / (m * n)];
        let [l, m, n, batch_a, batch_b] = <[Expr; 5]>::try_from(self.runtime(&values)?)
            .map_err(|_| GraphError::Backend("matmul dims".into()))?;
        let acc = self.mutable("acc", ty, ty.zero());
        let (body, ()) = self.block(|c| {
            let i = Expr::var(INDEX);
            let bi = c.bind("batch", Ty::U32, i.clone().bin("/", l.clone().bin("*", n.clone())));
            let row = c.bind("row", Ty::U32, i.clone().bin("/", n.clone()).bin("%", l.clone()));
            let col = c.bind("col", Ty::U32, i.bin("%", n.clone()));
            let abase = bi
                .clone()
                .bin("%", batch_a)
                .bin("*", l.bin("*", m.clone()))
                .bin("+", row.bin("*", m.clone()));
            let abase = c.bind("a", Ty::U32, abase);
            let bbase = bi.bin("%", batch_b).bin("*", m.clone().bin("*", n.clone())).bin("+", col);
            let bbase = c.bind("b", Ty::U32, bbase);
            let j = c.fresh("j");
            let x = Expr::index(&pa, abase.bin("+", Expr::var(&j))).cast(ta, ty);
            let y = Expr::index(&pb, bbase.bin("+", Expr::var(&j).bin("*", n))).cast(tb, ty);
            c.push(Stmt::For {
                var: j,
                count: m,
                body: vec![Stmt::assign(&acc, Expr::var(&acc).bin("+", x.bin("*", y)))],
            });
            Ok(())
        })?;
        self.push(Stmt::Block(body));
        Ok(Expr::var(acc))
    }

    /// Offset of kernel tap `kp` at spatial output position `os`, plus the
    /// in-bounds flag, as statements in the current block.
    fn tap(&mut self, g: &Geometry, os: &Expr, kp: &Expr) -> Result<(Expr, Expr)> {
        let mut inside = Vec::new();
        let mut offset = Vec::new();
        for d in 0..g.out.len() {
            let o = coord(os, g.acc_out[d], g.out[d])?;
            let k = coord(kp, g.acc_kernel[d], g.kernel[d])?;
            let p = self.bind("p", Ty::U32, o.bin("*", g.steps[d].clone()).bin("+", k));
            inside.push(p.clone().bin("<", lit(g.image[d])?));
            offset.push(p.bin("*", lit(g.acc_image[d])?));
        }
        Ok((Expr::all(inside), Expr::sum(offset)))
    }

    fn convolve(
        &mut self,
        node: &Node,
        image: &[usize],
        kernel: &[usize],
        steps: &[usize],
        ty: Ty,
    ) -> Result<Expr> {
        let (pi, ti) = self.operand(node.preds[0])?;
        let (pk, tk) = self.operand(node.preds[1])?;
        let g = Geometry::new(image, kernel, &node.shape, self.runtime(steps)?);
        let acc = self.mutable("acc", ty, ty.zero());
        let (body, ()) = self.block(|c| {
            let i = Expr::var(INDEX);
            let os = c.bind("os", Ty::U32, i.clone().bin("/", lit(g.filters)?));
            let f = c.bind("f", Ty::U32, i.bin("%", lit(g.filters)?));
            let kp = c.fresh("kp");
            let (taps, ()) = c.block(|c| {
                let (inside, offset) = c.tap(&g, &os, &Expr::var(&kp))?;
                let ch = c.fresh("ch");
                let x = Expr::index(&pi, offset.bin("+", Expr::var(&ch))).cast(ti, ty);
                let kidx = f
                    .clone()
                    .bin("*", lit(g.taps)?)
                    .bin("+", Expr::var(&kp))
                    .bin("*", lit(g.channels)?)
                    .bin("+", Expr::var(&ch));
                let w = Expr::index(&pk, kidx).cast(tk, ty);
                c.push(Stmt::If {
                    cond: inside,
                    then: vec![Stmt::For {
                        var: ch,
                        count: lit(g.channels)?,
                        body: vec![Stmt::assign(&acc, Expr::var(&acc).bin("+", x.bin("*", w)))],
                    }],
                    otherwise: vec![],
                });
                Ok(())
            })?;
            c.push(Stmt::For {
                var: kp,
                count: lit(g.taps)?,
                body: taps,
            });
            Ok(())
        })?;
        self.push(Stmt::Block(body));
        Ok(Expr::var(acc))
    }

    fn image_gradient(
        &mut self,
        node: &Node,
        image: &[usize],
        kernel: &[usize],
        steps: &[usize],
        ty: Ty,
    ) -> Result<Expr> {
        let (pk, tk) = self.operand(node.preds[0])?;
        let (pa, ta) = self.operand(node.preds[1])?;
        let graph = self.graph;
        let adjoint = &graph.node(node.preds[1])?.shape;
        let g = Geometry::new(image, kernel, adjoint, self.runtime(steps)?);
        let acc_image_full = acc_sizes(image);
        let acc = self.mutable("acc", ty, ty.zero());
        let (body, ()) = self.block(|c| {
            let i = Expr::var(INDEX);
            let ch = c.bind("ch", Ty::U32, i.clone().bin("%", lit(g.channels)?));
            let kp = c.fresh("kp");
            let (taps, ()) = c.block(|c| {
                let mut hit = Vec::new();
                let mut os = Vec::new();
                for d in 0..g.out.len() {
                    let p = c.bind("p", Ty::U32, coord(&i, acc_image_full[d], g.image[d])?);
                    let kd = c.bind("k", Ty::U32, coord(&Expr::var(&kp), g.acc_kernel[d], g.kernel[d])?);
                    let q = c.bind("q", Ty::U32, p.clone().bin("-", kd.clone()));
                    let s = g.steps[d].clone();
                    hit.push(p.bin(">=", kd));
                    hit.push(q.clone().bin("%", s.clone()).bin("==", Expr::U32(0)));
                    hit.push(q.clone().bin("/", s.clone()).bin("<", lit(g.out[d])?));
                    os.push(q.bin("/", s).bin("*", lit(g.acc_out[d])?));
                }
                let f = c.fresh("f");
                let kidx = Expr::var(&f)
                    .bin("*", lit(g.taps)?)
                    .bin("+", Expr::var(&kp))
                    .bin("*", lit(g.channels)?)
                    .bin("+", ch.clone());
                let aidx = Expr::sum(os).bin("*", lit(g.filters)?).bin("+", Expr::var(&f));
                let x = Expr::index(&pk, kidx).cast(tk, ty);
                let y = Expr::index(&pa, aidx).cast(ta, ty);
                c.push(Stmt::If {
                    cond: Expr::all(hit),
                    then: vec![Stmt::For {
                        var: f,
                        count: lit(g.filters)?,
                        body: vec![Stmt::assign(&acc, Expr::var(&acc).bin("+", x.bin("*", y)))],
                    }],
                    otherwise: vec![],
                });
                Ok(())
            })?;
            c.push(Stmt::For {
                var: kp,
                count: lit(g.taps)?,
                body: taps,
            });
            Ok(())
        })?;
        self.push(Stmt::Block(body));
        Ok(Expr::var(acc))
    }

    fn kernel_gradient(
        &mut self,
        node: &Node,
        image: &[usize],
        kernel: &[usize],
        steps: &[usize],
        ty: Ty,
    ) -> Result<Expr> {
        let (pi, ti) = self.operand(node.preds[0])?;
        let (pa, ta) = self.operand(node.preds[1])?;
        let graph = self.graph;
        let adjoint = &graph.node(node.preds[1])?.shape;
        let g = Geometry::new(image, kernel, adjoint, self.runtime(steps)?);
        let acc = self.mutable("acc", ty, ty.zero());
        let (body, ()) = self.block(|c| {
            let i = Expr::var(INDEX);
            let f = c.bind("f", Ty::U32, i.clone().bin("/", lit(g.taps * g.channels)?));
            let kp = c.bind("kp", Ty::U32, coord(&i, g.channels, g.taps)?);
            let ch = c.bind("ch", Ty::U32, i.bin("%", lit(g.channels)?));
            let os = c.fresh("os");
            let (positions, ()) = c.block(|c| {
                let (inside, offset) = c.tap(&g, &Expr::var(&os), &kp)?;
                let x = Expr::index(&pi, offset.bin("+", ch.clone())).cast(ti, ty);
                let aidx = Expr::var(&os).bin("*", lit(g.filters)?).bin("+", f.clone());
                let y = Expr::index(&pa, aidx).cast(ta, ty);
                c.push(Stmt::If {
                    cond: inside,
                    then: vec![Stmt::assign(&acc, Expr::var(&acc).bin("+", x.bin("*", y)))],
                    otherwise: vec![],
                });
                Ok(())
            })?;
            c.push(Stmt::For {
                var: os,
                count: lit(numel(&g.out))?,
                body: positions,
            });
            Ok(())
        })?;
        self.push(Stmt::Block(body));
        Ok(Expr::var(acc))
    }

    fn unslide(&mut self, node: &Node, extent: &[usize], steps: &[usize], ty: Ty) -> Result<Expr> {
        let (pw, tw) = self.operand(node.preds[0])?;
        let size = self.graph.node(node.preds[0])?.shape[1..].to_vec();
        let counts: Vec<usize> = (0..extent.len())
            .map(|d| window_count(extent[d], size[d], steps[d]))
            .collect();
        let (acc_c, acc_s, acc_e) = (acc_sizes(&counts), acc_sizes(&size), acc_sizes(extent));
        let window_len = numel(&size);
        let s = self.runtime(steps)?;
        let acc = self.mutable("acc", ty, ty.zero());
        let w = self.fresh("w");
        let (body, ()) = self.block(|c| {
            let i = Expr::var(INDEX);
            let mut hit = Vec::new();
            let mut offset = Vec::new();
            for d in 0..extent.len() {
                let p = c.bind("p", Ty::U32, coord(&i, acc_e[d], extent[d])?);
                let first = coord(&Expr::var(&w), acc_c[d], counts[d])?.bin("*", s[d].clone());
                let first = c.bind("s", Ty::U32, first);
                let r = c.bind("r", Ty::U32, p.clone().bin("-", first.clone()));
                hit.push(p.bin(">=", first));
                hit.push(r.clone().bin("<", lit(size[d])?));
                offset.push(r.bin("*", lit(acc_s[d])?));
            }
            let widx = Expr::var(&w).bin("*", lit(window_len)?).bin("+", Expr::sum(offset));
            let x = Expr::index(&pw, widx).cast(tw, ty);
            c.push(Stmt::If {
                cond: Expr::all(hit),
                then: vec![Stmt::assign(&acc, Expr::var(&acc).bin("+", x))],
                otherwise: vec![],
            });
            Ok(())
        })?;
        self.push(Stmt::For {
            var: w,
            count: lit(numel(&counts))?,
            body,
        });
        Ok(Expr::var(acc))
    }
}

/// Convolution geometry with steps read at dispatch time.
struct Geometry {
    image: Vec<usize>,
    acc_image: Vec<usize>,
    kernel: Vec<usize>,
    acc_kernel: Vec<usize>,
    out: Vec<usize>,
    acc_out: Vec<usize>,
    steps: Vec<Expr>,
    taps: usize,
    channels: usize,
    filters: usize,
}

impl Geometry {
    /// `output` is the convolution's output shape (the adjoint for gradients).
    fn new(image: &[usize], kernel: &[usize], output: &[usize], steps: Vec<Expr>) -> Self {
        let n = image.len() - 1;
        let multi = kernel.len() == image.len() + 1;
        let spatial = if multi { &kernel[1..=n] } else { &kernel[..n] };
        let out = output[..n].to_vec();
        Self {
            image: image[..n].to_vec(),
            acc_image: acc_sizes(image),
            kernel: spatial.to_vec(),
            acc_kernel: acc_sizes(spatial),
            acc_out: acc_sizes(&out),
            out,
            steps,
            taps: numel(spatial),
            channels: image[n],
            filters: if multi { kernel[0] } else { 1 },
        }
    }
}

/// Structural token of a fused node: kind, type, shapes and payload. Matrix
/// products bind all of their dimensions at dispatch time, so their shapes are
/// left out.
fn token(graph: &Graph, node: &Node) -> String {
    let kind = node.kind();
    if matches!(node.op, Op::Matmul) {
        return format!("{}:{:?}", kind.name(), node.dtype);
    }
    let preds: Vec<_> = node
        .preds
        .iter()
        .filter_map(|p| graph.node(*p).ok().map(|n| n.shape.clone()))
        .collect();
    format!(
        "{}:{:?}:{:?}:{:?}:{:?}",
        kind.name(),
        node.dtype,
        node.shape,
        preds,
        node.op
    )
}

fn binary(op: BinaryOp, ty: Ty, a: Expr, b: Expr) -> Expr {
    let flag = |cond: Expr| Expr::select(Expr::I32(0), Expr::I32(1), cond);
    match op {
        BinaryOp::Add => a.bin("+", b),
        BinaryOp::Sub => a.bin("-", b),
        BinaryOp::Mul => a.bin("*", b),
        BinaryOp::Div if ty == Ty::I32 => {
            Expr::select(a.bin("/", b.clone()), Expr::I32(0), b.bin("==", Expr::I32(0)))
        }
        BinaryOp::Div => a.bin("/", b),
        BinaryOp::Pow if ty == Ty::I32 => {
            signed_pow(a.cast(ty, Ty::F32), b.cast(ty, Ty::F32)).cast(Ty::F32, Ty::I32)
        }
        BinaryOp::Pow => signed_pow(a, b),
        BinaryOp::Min => Expr::call("min", vec![a, b]),
        BinaryOp::Max => Expr::call("max", vec![a, b]),
        BinaryOp::Less => flag(a.bin("<", b)),
        BinaryOp::Greater => flag(a.bin(">", b)),
        BinaryOp::Equal => flag(a.bin("==", b)),
    }
}

/// `pow` for f32 operands that also accepts a negative base with an integral
/// exponent: `|a|^b`, negated for odd `b`. WGSL leaves `pow` undefined for `a < 0`.
fn signed_pow(a: Expr, b: Expr) -> Expr {
    let magnitude = Expr::call("pow", vec![Expr::call("abs", vec![a.clone()]), b.clone()]);
    let odd = Expr::call("i32", vec![b.clone()])
        .bin("%", Expr::I32(2))
        .bin("!=", Expr::I32(0));
    let signed = magnitude.bin("*", Expr::select(Expr::F32(1.0), Expr::F32(-1.0), odd));
    let integral = b.clone().bin("==", Expr::call("trunc", vec![b.clone()]));
    Expr::select(
        Expr::call("pow", vec![a.clone(), b]),
        signed,
        a.bin("<", Expr::F32(0.0)).bin("&&", integral),
    )
}

fn unary(op: UnaryOp, x: Expr, from: Ty) -> Expr {
    let call = |f: &str, x: Expr| Expr::call(f, vec![x.cast(from, Ty::F32)]);
    match op {
        UnaryOp::Neg => Expr::Neg(Box::new(x)),
        UnaryOp::Abs => Expr::call("abs", vec![x]),
        UnaryOp::Sign => Expr::select(Expr::I32(1), Expr::I32(-1), x.bin("<", from.zero())),
        UnaryOp::Even => Expr::select(
            Expr::I32(0),
            Expr::I32(1),
            x.bin("%", Expr::I32(2)).bin("==", Expr::I32(0)),
        ),
        UnaryOp::Log => call("log", x),
        UnaryOp::Log2 => call("log2", x),
        UnaryOp::Log10 => call("log", x).bin("*", Expr::F32(std::f32::consts::LOG10_E)),
        UnaryOp::Sin => call("sin", x),
        UnaryOp::Cos => call("cos", x),
        UnaryOp::Tan => call("tan", x),
        UnaryOp::Asin => call("asin", x),
        UnaryOp::Acos => call("acos", x),
        UnaryOp::Atan => call("atan", x),
        UnaryOp::Sqrt => call("sqrt", x),
        UnaryOp::Exp => call("exp", x),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;

    #[test]
    fn test_pow_handles_negative_base() {
        let rendered = signed_pow(Expr::var("x"), Expr::var("y")).to_string();
        assert_eq!(
            rendered,
            "select(pow(x, y), (pow(abs(x), y) * select(1.0, (-1.0), ((i32(y) % 2i) != 0i))), \
             ((x < 0.0) && (y == trunc(y))))"
        );
    }

    #[test]
    fn test_elementwise_chain_is_one_kernel() {
        let mut s = Session::new();
        let a = s.create(&[1.0f32, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
        let b = s.create(&[10.0f32, 20.0], &[2]).unwrap();
        let c = s.add(a, b).unwrap();
        let d = s.sin(c).unwrap();
        let k = compile(&s.graph, d, &mut KernelCache::new()).unwrap();
        assert_eq!(k.params, vec![a, b]);
        assert_eq!(k.dims, vec![4]);
        assert!(k.source().contains("fn main"));
        assert!(k.source().contains("sin("));
        assert!(k.source().contains("% 2u"));
        assert!(k.source().contains("var<storage, read_write> result: array<f32>"));
    }

    #[test]
    fn test_compiled_kernel_validates() {
        let mut s = Session::new();
        let a = s.create(&[1i32, -2, 3], &[3]).unwrap();
        let b = s.neg(a).unwrap();
        let c = s.mul(b, a).unwrap();
        let mut k = compile(&s.graph, c, &mut KernelCache::new()).unwrap();
        assert!(k.validate().is_ok());
        assert_eq!(k.bindings(), 3);
        assert_eq!(k.label().len(), 16);

        k.len = 4;
        assert!(k.validate().is_err());
        k.len = 3;
        k.params.push(a);
        assert!(k.validate().is_err());
    }

    #[test]
    fn test_same_structure_hits_cache() {
        let mut s = Session::new();
        let mut cache = KernelCache::new();
        for seed in [1.0f64, 2.0] {
            let a = s.create(&[seed, 0.0, 1.0], &[3]).unwrap();
            let b = s.exp(a).unwrap();
            let r = s.reduce_sum(b, 0).unwrap();
            compile(&s.graph, r, &mut cache).unwrap();
        }
        assert_eq!((cache.hits(), cache.misses()), (1, 1));
    }

    #[test]
    fn test_matmul_binds_dims_at_dispatch() {
        let mut s = Session::new();
        let a = s.create(&[1i32, 2, 3, 4, 5, 6], &[2, 3]).unwrap();
        let b = s.create(&[1i32, 0, 0, 1, 1, 1], &[3, 2]).unwrap();
        let c = s.matmul(a, b).unwrap();
        let k = compile(&s.graph, c, &mut KernelCache::new()).unwrap();
        assert_eq!(k.dims, vec![4, 2, 3, 2, 1, 1]);
        assert!(k.source().contains("dims[3u]"));
        assert!(!k.key.contains("[2, 3]"));
    }

    #[test]
    fn test_loop_kernel_needs_materialized_operands() {
        let mut s = Session::new();
        let a = s.create(&[1.0f64, 2.0], &[1, 2]).unwrap();
        let b = s.create(&[3.0f64, 4.0], &[2, 1]).unwrap();
        let neg = s.neg(a).unwrap();
        let c = s.matmul(neg, b).unwrap();
        assert!(compile(&s.graph, c, &mut KernelCache::new()).is_err());
    }

    #[test]
    fn test_workgroup_grid() {
        let k = FusedKernel {
            key: String::new(),
            params: vec![],
            param_types: vec![],
            dims: vec![],
            len: 64 * 70_000,
            out_ty: Ty::F32,
            source: Arc::from(""),
        };
        assert_eq!(k.workgroups(), (65_535, 2));
    }
}
