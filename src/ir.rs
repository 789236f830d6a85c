//! The intermediate representation (spec §3) and its structural primitives.
//!
//! `Expr` is a plain recursive sum type. Rather than writing the same
//! match-over-nine-variants by hand in every pass, [`Expr::map_children`] and
//! [`Expr::for_each_child`] give transformations and analyses a single place
//! to add a tenth variant later.
use fxhash::FxHashMap;
use ordered_float::OrderedFloat;
use std::collections::BTreeMap;

/// `a.b` / `a.b.c` dotted coordinate or strand key, used both for `Remap`
/// substitution keys (`"me.x"`, `"me.t"`) and for the global strand key
/// `(bundle, strand)`.
pub type StrandKey = (String, String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

impl BinOp {
    pub fn parse(op: &str) -> Option<BinOp> {
        Some(match op {
            "+" => BinOp::Add,
            "-" => BinOp::Sub,
            "*" => BinOp::Mul,
            "/" => BinOp::Div,
            "%" => BinOp::Mod,
            "^" => BinOp::Pow,
            "<" => BinOp::Lt,
            ">" => BinOp::Gt,
            "<=" => BinOp::Le,
            ">=" => BinOp::Ge,
            "==" => BinOp::Eq,
            "!=" => BinOp::Ne,
            "&&" => BinOp::And,
            "||" => BinOp::Or,
            _ => return None,
        })
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Pow => "^",
            BinOp::Lt => "<",
            BinOp::Gt => ">",
            BinOp::Le => "<=",
            BinOp::Ge => ">=",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnOp {
    Neg,
    Not,
}

impl UnOp {
    pub fn parse(op: &str) -> Option<UnOp> {
        Some(match op {
            "-" => UnOp::Neg,
            "!" => UnOp::Not,
            _ => return None,
        })
    }

    pub fn symbol(self) -> &'static str {
        match self {
            UnOp::Neg => "-",
            UnOp::Not => "!",
        }
    }
}

/// The closed builtin set of spec §6. Stateful builtins participate in
/// purity classification (spec §4.2) and hardware-tag inference.
pub const STATEFUL_BUILTINS: &[&str] = &["cache", "microphone", "camera", "mouse"];
pub const EXTERNAL_BUILTINS: &[&str] = &["camera", "microphone", "texture"];
pub const BUILTIN_NAMES: &[&str] = &[
    "sin", "cos", "tan", "asin", "acos", "atan", "atan2", "abs", "floor", "ceil", "round", "sqrt",
    "pow", "exp", "log", "log2", "min", "max", "clamp", "lerp", "mix", "step", "smoothstep",
    "fract", "mod", "sign", "noise", "select", "cache", "camera", "microphone", "texture",
    "mouse", "key", "text",
];

pub fn is_known_builtin(name: &str) -> bool {
    BUILTIN_NAMES.contains(&name)
}

/// Recursive expression tree (spec §3). `Call`/`Extract` are pre-inlining
/// placeholders eliminated by [`crate::transform`]; `CacheRead` is synthetic,
/// inserted only by [`crate::analysis`] to break self-reference cycles.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Expr {
    Num(OrderedFloat<f64>),
    Param(String),
    /// `indexExpr` is itself `Num(k)` (positional) or `Param(field)` (named).
    /// `bundle == "me"` selects the ambient coordinate.
    Index(String, Box<Expr>),
    BinaryOp(BinOp, Box<Expr>, Box<Expr>),
    UnaryOp(UnOp, Box<Expr>),
    Builtin(String, Vec<Expr>),
    Call(String, Vec<Expr>),
    Extract(Box<Expr>, usize),
    Remap(Box<Expr>, BTreeMap<String, Expr>),
    CacheRead(u32, u32),
}

impl Expr {
    pub fn num(v: f64) -> Expr {
        Expr::Num(OrderedFloat(v))
    }

    /// Visits each immediate child expression. Positional/named index
    /// expressions, binary/unary operands, builtin/call arguments, the
    /// remap base (not its substitution values — those are a separate
    /// coordinate space, see spec §4.1 `applyRemap`) and extract's callee
    /// all count as children.
    pub fn for_each_child<'a>(&'a self, mut f: impl FnMut(&'a Expr)) {
        match self {
            Expr::Num(_) | Expr::Param(_) | Expr::CacheRead(_, _) => {}
            Expr::Index(_, idx) => f(idx),
            Expr::BinaryOp(_, l, r) => {
                f(l);
                f(r);
            }
            Expr::UnaryOp(_, x) => f(x),
            Expr::Builtin(_, args) | Expr::Call(_, args) => {
                for a in args {
                    f(a);
                }
            }
            Expr::Extract(call, _) => f(call),
            Expr::Remap(base, subs) => {
                f(base);
                for v in subs.values() {
                    f(v);
                }
            }
        }
    }

    /// Homomorphic rebuild: applies `f` to every immediate child and
    /// reconstructs the same variant around the results. Most
    /// substitutions reduce to "recurse with `map_children`, then handle
    /// the one or two variants that need special treatment".
    pub fn map_children(self, mut f: impl FnMut(Expr) -> Expr) -> Expr {
        match self {
            Expr::Num(_) | Expr::Param(_) | Expr::CacheRead(_, _) => self,
            Expr::Index(bundle, idx) => Expr::Index(bundle, Box::new(f(*idx))),
            Expr::BinaryOp(op, l, r) => Expr::BinaryOp(op, Box::new(f(*l)), Box::new(f(*r))),
            Expr::UnaryOp(op, x) => Expr::UnaryOp(op, Box::new(f(*x))),
            Expr::Builtin(name, args) => Expr::Builtin(name, args.into_iter().map(f).collect()),
            Expr::Call(name, args) => Expr::Call(name, args.into_iter().map(f).collect()),
            Expr::Extract(call, idx) => Expr::Extract(Box::new(f(*call)), idx),
            Expr::Remap(base, subs) => Expr::Remap(
                Box::new(f(*base)),
                subs.into_iter().map(|(k, v)| (k, f(v))).collect(),
            ),
        }
    }

    /// Free `Param` names reachable without crossing an `Index` boundary
    /// into another bundle's strand (params of a referenced bundle belong
    /// to that bundle's own scope).
    pub fn collect_params(&self, out: &mut Vec<String>) {
        match self {
            Expr::Param(name) => out.push(name.clone()),
            Expr::Index(_, idx) => idx.collect_params(out),
            _ => self.for_each_child(|c| c.collect_params(out)),
        }
    }

    /// All builtin names appearing anywhere in the tree (used for purity
    /// and hardware-tag classification, spec §4.2).
    pub fn collect_builtins(&self, out: &mut Vec<String>) {
        if let Expr::Builtin(name, _) = self {
            out.push(name.clone());
        }
        self.for_each_child(|c| c.collect_builtins(out));
    }

    /// All `(bundle, indexExpr)` pairs referenced anywhere in the tree,
    /// `"me"` included. Used to build the dependency graph (spec §4.2) and
    /// to resolve cross-domain reads (spec §4.4.6).
    pub fn collect_index_refs<'a>(&'a self, out: &mut Vec<(&'a str, &'a Expr)>) {
        if let Expr::Index(bundle, idx) = self {
            out.push((bundle.as_str(), idx));
        }
        self.for_each_child(|c| c.collect_index_refs(out));
    }

    /// True if this expression (directly, not through a bundle reference)
    /// contains a `Call` node — the "heavy remap" heuristic of spec §4.4.5
    /// and §4.1's heavy-spindle-call detection for cache cyclic rewrite.
    pub fn contains_call(&self) -> bool {
        match self {
            Expr::Call(_, _) => true,
            _ => {
                let mut found = false;
                self.for_each_child(|c| found |= c.contains_call());
                found
            }
        }
    }

    /// Depth-bounded recursive expansion is driven externally (codegen,
    /// spec §4.4.1); this just reports nesting depth for diagnostics.
    pub fn depth(&self) -> u32 {
        let mut max = 0;
        self.for_each_child(|c| max = max.max(c.depth()));
        1 + max
    }
}

/// Coordinate vocabularies per backend (spec §6). Positional remap keys
/// (`"me.0"`, `"me.1"`, …) resolve through this table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    Visual,
    Audio,
}

impl Domain {
    pub fn coord_order(self) -> &'static [&'static str] {
        match self {
            Domain::Visual => &["x", "y", "t", "w", "h"],
            Domain::Audio => &["i", "t", "sampleRate"],
        }
    }

    pub fn positional_key(self, pos: usize) -> Option<&'static str> {
        self.coord_order().get(pos).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Strand {
    pub name: String,
    pub index: u32,
    pub expr: Expr,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Bundle {
    pub name: String,
    pub strands: Vec<Strand>,
}

impl Bundle {
    pub fn strand_by_name(&self, name: &str) -> Option<&Strand> {
        self.strands.iter().find(|s| s.name == name)
    }

    pub fn strand_by_index(&self, index: u32) -> Option<&Strand> {
        self.strands.iter().find(|s| s.index == index)
    }

    /// Resolves an `Index` key expression (`Num(k)` positional or
    /// `Param(field)` named) to the strand it selects.
    pub fn resolve_strand(&self, key_expr: &Expr) -> Option<&Strand> {
        match key_expr {
            Expr::Num(k) => self.strand_by_index(k.0 as u32),
            Expr::Param(field) => self.strand_by_name(field),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Spindle {
    pub name: String,
    pub params: Vec<String>,
    pub locals: Vec<Bundle>,
    pub returns: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderEntry {
    pub bundle: String,
    pub strands: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct Program {
    pub bundles: FxHashMap<String, Bundle>,
    pub spindles: FxHashMap<String, Spindle>,
    pub order: Vec<OrderEntry>,
    pub resources: serde_json::Value,
}

impl Program {
    pub fn bundle(&self, name: &str) -> Option<&Bundle> {
        self.bundles.get(name)
    }

    pub fn spindle(&self, name: &str) -> Option<&Spindle> {
        self.spindles.get(name)
    }
}
