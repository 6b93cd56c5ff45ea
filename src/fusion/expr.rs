//! Tiny WGSL syntax tree.
//!
//! The fusion compiler builds statements with these types instead of pasting
//! strings together, so parenthesization, literal suffixes and indentation are
//! decided in one place.

use crate::tensors::DType;
use std::fmt::{self, Display, Write};

/// Scalar types that appear in generated kernels.
///
/// 64-bit element types are computed at 32-bit precision on the accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ty {
    F32,
    I32,
    U32,
    Bool,
}

impl Ty {
    pub fn of(dtype: DType) -> Ty {
        if dtype.is_float() { Ty::F32 } else { Ty::I32 }
    }

    pub fn name(self) -> &'static str {
        match self {
            Ty::F32 => "f32",
            Ty::I32 => "i32",
            Ty::U32 => "u32",
            Ty::Bool => "bool",
        }
    }

    /// `0` of this type.
    pub fn zero(self) -> Expr {
        Expr::literal(self, 0.0)
    }

    /// Largest value, `+inf` for floats.
    pub fn highest(self) -> Expr {
        match self {
            Ty::F32 => Expr::F32(f32::INFINITY),
            _ => Expr::I32(i32::MAX),
        }
    }

    /// Smallest value, `-inf` for floats.
    pub fn lowest(self) -> Expr {
        match self {
            Ty::F32 => Expr::F32(f32::NEG_INFINITY),
            _ => Expr::I32(i32::MIN),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Var(String),
    F32(f32),
    I32(i32),
    U32(u32),
    Bool(bool),
    Neg(Box<Expr>),
    Binary(Box<Expr>, &'static str, Box<Expr>),
    /// Function call or value constructor (`f32(x)`, `select(a, b, c)`).
    Call(String, Vec<Expr>),
    Index(String, Box<Expr>),
}

impl Expr {
    pub fn var(name: impl Into<String>) -> Expr {
        Expr::Var(name.into())
    }

    pub fn literal(ty: Ty, v: f64) -> Expr {
        match ty {
            Ty::F32 => Expr::F32(v as f32),
            Ty::I32 => Expr::I32(v as i64 as i32),
            Ty::U32 => Expr::U32(v as u32),
            Ty::Bool => Expr::Bool(v != 0.0),
        }
    }

    pub fn bin(self, op: &'static str, rhs: Expr) -> Expr {
        Expr::Binary(Box::new(self), op, Box::new(rhs))
    }

    pub fn call(f: impl Into<String>, args: Vec<Expr>) -> Expr {
        Expr::Call(f.into(), args)
    }

    pub fn index(array: impl Into<String>, at: Expr) -> Expr {
        Expr::Index(array.into(), Box::new(at))
    }

    /// Value conversion; a no-op when `from == to`.
    pub fn cast(self, from: Ty, to: Ty) -> Expr {
        if from == to {
            self
        } else {
            Expr::call(to.name(), vec![self])
        }
    }

    /// `if cond { on_true } else { on_false }` as an expression.
    pub fn select(on_false: Expr, on_true: Expr, cond: Expr) -> Expr {
        Expr::call("select", vec![on_false, on_true, cond])
    }

    /// Conjunction of `terms`; `true` when empty.
    pub fn all(terms: Vec<Expr>) -> Expr {
        terms
            .into_iter()
            .reduce(|a, b| a.bin("&&", b))
            .unwrap_or(Expr::Bool(true))
    }

    /// Sum of `terms`; `0u` when empty.
    pub fn sum(terms: Vec<Expr>) -> Expr {
        terms
            .into_iter()
            .reduce(|a, b| a.bin("+", b))
            .unwrap_or(Expr::U32(0))
    }
}

impl Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Var(name) => f.write_str(name),
            Expr::F32(v) if v.is_finite() => {
                if *v < 0.0 {
                    write!(f, "({v:?})")
                } else {
                    write!(f, "{v:?}")
                }
            }
            Expr::F32(v) => write!(f, "bitcast<f32>({:#010x}u)", v.to_bits()),
            Expr::I32(i32::MIN) => f.write_str("bitcast<i32>(0x80000000u)"),
            Expr::I32(v) if *v < 0 => write!(f, "({v}i)"),
            Expr::I32(v) => write!(f, "{v}i"),
            Expr::U32(v) => write!(f, "{v}u"),
            Expr::Bool(v) => write!(f, "{v}"),
            Expr::Neg(e) => write!(f, "(-{e})"),
            Expr::Binary(a, op, b) => write!(f, "({a} {op} {b})"),
            Expr::Call(name, args) => {
                write!(f, "{name}(")?;
                for (k, a) in args.iter().enumerate() {
                    if k > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{a}")?;
                }
                f.write_str(")")
            }
            Expr::Index(array, at) => write!(f, "{array}[{at}]"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Let { name: String, ty: Ty, value: Expr },
    Var { name: String, ty: Ty, value: Expr },
    Assign { name: String, value: Expr },
    /// `array[at] = value;`
    Store { array: String, at: Expr, value: Expr },
    If {
        cond: Expr,
        then: Vec<Stmt>,
        otherwise: Vec<Stmt>,
    },
    /// `for (var v = 0u; v < count; v++)`
    For {
        var: String,
        count: Expr,
        body: Vec<Stmt>,
    },
    Block(Vec<Stmt>),
    Return,
}

impl Stmt {
    pub fn assign(name: impl Into<String>, value: Expr) -> Stmt {
        Stmt::Assign {
            name: name.into(),
            value,
        }
    }

    pub fn render(&self, out: &mut String, depth: usize) -> fmt::Result {
        let pad = "    ".repeat(depth);
        match self {
            Stmt::Let { name, ty, value } => writeln!(out, "{pad}let {name}: {} = {value};", ty.name()),
            Stmt::Var { name, ty, value } => writeln!(out, "{pad}var {name}: {} = {value};", ty.name()),
            Stmt::Assign { name, value } => writeln!(out, "{pad}{name} = {value};"),
            Stmt::Store { array, at, value } => writeln!(out, "{pad}{array}[{at}] = {value};"),
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                writeln!(out, "{pad}if ({cond}) {{")?;
                render_all(then, out, depth + 1)?;
                if !otherwise.is_empty() {
                    writeln!(out, "{pad}}} else {{")?;
                    render_all(otherwise, out, depth + 1)?;
                }
                writeln!(out, "{pad}}}")
            }
            Stmt::For { var, count, body } => {
                writeln!(out, "{pad}for (var {var}: u32 = 0u; {var} < {count}; {var}++) {{")?;
                render_all(body, out, depth + 1)?;
                writeln!(out, "{pad}}}")
            }
            Stmt::Block(body) => {
                writeln!(out, "{pad}{{")?;
                render_all(body, out, depth + 1)?;
                writeln!(out, "{pad}}}")
            }
            Stmt::Return => writeln!(out, "{pad}return;"),
        }
    }
}

pub fn render_all(stmts: &[Stmt], out: &mut String, depth: usize) -> fmt::Result {
    for s in stmts {
        s.render(out, depth)?;
    }
    Ok(())
}

/// One storage buffer of a kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub name: String,
    pub ty: Ty,
    pub writable: bool,
}

pub const WORKGROUP_SIZE: u32 = 64;

const PCG_HASH: &str = "fn pcg_hash(v: u32) -> u32 {
    let state = v * 747796405u + 2891336453u;
    let word = ((state >> ((state >> 28u) + 4u)) ^ state) * 277803737u;
    return (word >> 22u) ^ word;
}
";

/// Renders a complete compute shader around `body`.
///
/// The entry point defines `gid` and `nwg`; `body` is expected to linearize
/// them into a flat invocation index.
pub fn render_module(bindings: &[Binding], random: bool, body: &[Stmt]) -> Result<String, fmt::Error> {
    let mut out = String::new();
    for (k, b) in bindings.iter().enumerate() {
        let access = if b.writable { "read_write" } else { "read" };
        writeln!(
            out,
            "@group(0) @binding({k}) var<storage, {access}> {}: array<{}>;",
            b.name,
            b.ty.name()
        )?;
    }
    out.push('\n');
    if random {
        out.push_str(PCG_HASH);
        out.push('\n');
    }
    writeln!(out, "@compute @workgroup_size({WORKGROUP_SIZE})")?;
    out.push_str(
        "fn main(@builtin(global_invocation_id) gid: vec3<u32>, @builtin(num_workgroups) nwg: vec3<u32>) {\n",
    );
    render_all(body, &mut out, 1)?;
    out.push_str("}\n");
    Ok(out)
}
