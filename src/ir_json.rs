//! Deserializes the IR JSON shape of spec §6 and lowers it into the
//! internal [`crate::ir`] model. This is the only place the core touches
//! `serde_json` directly — once lowered, nothing downstream knows the wire
//! format existed.
use crate::error::ParseError;
use crate::ir::{BinOp, Bundle, Expr, OrderEntry, Program, Spindle, Strand, UnOp};
use fxhash::FxHashMap;
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Deserialize)]
#[serde(tag = "type")]
enum WireExpr {
    #[serde(rename = "num")]
    Num { value: f64 },
    #[serde(rename = "param")]
    Param { name: String },
    #[serde(rename = "index")]
    Index {
        bundle: String,
        index: Option<i64>,
        field: Option<String>,
    },
    #[serde(rename = "binary")]
    Binary {
        op: String,
        left: Box<WireExpr>,
        right: Box<WireExpr>,
    },
    #[serde(rename = "unary")]
    Unary { op: String, operand: Box<WireExpr> },
    #[serde(rename = "builtin")]
    Builtin { name: String, args: Vec<WireExpr> },
    #[serde(rename = "call")]
    Call { spindle: String, args: Vec<WireExpr> },
    #[serde(rename = "extract")]
    Extract { call: Box<WireExpr>, index: usize },
    #[serde(rename = "remap")]
    Remap {
        base: Box<WireExpr>,
        substitutions: BTreeMap<String, WireExpr>,
    },
}

#[derive(Deserialize)]
struct WireStrand {
    name: String,
    index: u32,
    expr: WireExpr,
}

#[derive(Deserialize)]
struct WireBundle {
    name: String,
    strands: Vec<WireStrand>,
}

#[derive(Deserialize)]
struct WireSpindle {
    params: Vec<String>,
    locals: Vec<WireBundle>,
    returns: Vec<WireExpr>,
}

#[derive(Deserialize)]
struct WireOrderEntry {
    bundle: String,
    strands: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct WireProgram {
    bundles: FxHashMap<String, WireBundle>,
    spindles: FxHashMap<String, WireSpindle>,
    order: Vec<WireOrderEntry>,
    #[serde(default)]
    resources: serde_json::Value,
}

fn lower_expr(wire: WireExpr) -> Result<Expr, ParseError> {
    Ok(match wire {
        WireExpr::Num { value } => Expr::num(value),
        WireExpr::Param { name } => Expr::Param(name),
        WireExpr::Index { bundle, index, field } => {
            let key_expr = match (index, field) {
                (Some(k), None) => Expr::num(k as f64),
                (None, Some(name)) => Expr::Param(name),
                _ => {
                    return Err(ParseError::MissingField {
                        node: "index",
                        field: "index|field",
                    })
                }
            };
            Expr::Index(bundle, Box::new(key_expr))
        }
        WireExpr::Binary { op, left, right } => {
            let bop = BinOp::parse(&op).ok_or_else(|| ParseError::Json(format!("unknown binary op {:?}", op)))?;
            Expr::BinaryOp(bop, Box::new(lower_expr(*left)?), Box::new(lower_expr(*right)?))
        }
        WireExpr::Unary { op, operand } => {
            let uop = UnOp::parse(&op).ok_or_else(|| ParseError::Json(format!("unknown unary op {:?}", op)))?;
            Expr::UnaryOp(uop, Box::new(lower_expr(*operand)?))
        }
        WireExpr::Builtin { name, args } => {
            if !crate::ir::is_known_builtin(&name) {
                return Err(ParseError::UnknownBuiltin(name));
            }
            let args = lower_args(args)?;
            if name == "cache" {
                validate_cache_args(&args)?;
            }
            Expr::Builtin(name, args)
        }
        WireExpr::Call { spindle, args } => Expr::Call(spindle, lower_args(args)?),
        WireExpr::Extract { call, index } => Expr::Extract(Box::new(lower_expr(*call)?), index),
        WireExpr::Remap { base, substitutions } => {
            let mut subs = BTreeMap::new();
            for (k, v) in substitutions {
                subs.insert(k, lower_expr(v)?);
            }
            Expr::Remap(Box::new(lower_expr(*base)?), subs)
        }
    })
}

fn lower_args(args: Vec<WireExpr>) -> Result<Vec<Expr>, ParseError> {
    args.into_iter().map(lower_expr).collect()
}

/// `cache(value, historySize, tapIndex, signal)` requires integer literals
/// in the second and third position (spec §6).
fn validate_cache_args(args: &[Expr]) -> Result<(), ParseError> {
    if args.len() != 4 {
        return Err(ParseError::MissingField { node: "cache", field: "value|historySize|tapIndex|signal" });
    }
    for (arg, name) in [(&args[1], "historySize"), (&args[2], "tapIndex")] {
        match arg {
            Expr::Num(v) if v.0.fract() == 0.0 && v.0 >= 0.0 => {}
            _ => return Err(ParseError::NonLiteralCacheArg { arg: name }),
        }
    }
    Ok(())
}

fn lower_bundle(wire: WireBundle) -> Result<Bundle, ParseError> {
    let strands = wire
        .strands
        .into_iter()
        .map(|s| {
            Ok(Strand {
                name: s.name,
                index: s.index,
                expr: lower_expr(s.expr)?,
            })
        })
        .collect::<Result<Vec<_>, ParseError>>()?;
    Ok(Bundle { name: wire.name, strands })
}

/// Parses and lowers a complete program from its IR JSON text.
pub fn parse_program(json: &str) -> Result<Program, ParseError> {
    let wire: WireProgram = serde_json::from_str(json).map_err(|e| ParseError::Json(e.to_string()))?;

    let mut bundles = FxHashMap::default();
    for (name, wb) in wire.bundles {
        bundles.insert(name, lower_bundle(wb)?);
    }

    let mut spindles = FxHashMap::default();
    for (name, ws) in wire.spindles {
        let locals = ws
            .locals
            .into_iter()
            .map(lower_bundle)
            .collect::<Result<Vec<_>, ParseError>>()?;
        let returns = ws
            .returns
            .into_iter()
            .map(lower_expr)
            .collect::<Result<Vec<_>, ParseError>>()?;
        spindles.insert(
            name.clone(),
            Spindle { name, params: ws.params, locals, returns },
        );
    }

    let order = wire
        .order
        .into_iter()
        .map(|o| OrderEntry { bundle: o.bundle, strands: o.strands })
        .collect();

    Ok(Program { bundles, spindles, order, resources: wire.resources })
}
