//! Code generators (spec §4.4, §4.5): one native target per backend. The
//! visual backend emits GPU compute-kernel source text (spec item 1-6,
//! §4.4); the audio backend builds an executable closure tree (§4.5)
//! since its "native kernel" is just Rust running on the callback thread.
pub mod audio;
pub mod scalar_cache;
pub mod visual;

use crate::error::CompilationError;
use crate::ir::{Expr, Program, StrandKey};
use fxhash::FxHashMap;
use std::collections::HashSet;

/// Recursively expands `Index(bundle, _)` references into in-swatch bundles
/// until only `me` reads and cross-domain reads remain (spec §4.4.1's
/// "recursive expansion... driven externally", used here so a remap's
/// `base` can be resolved through a chain of pass-through bundles before
/// [`crate::transform::apply_remap`] substitutes its coordinates — spec §8's
/// worked example `baz.x = bar.x(me.x~0.5)` only evaluates to a constant
/// once `bar.x`'s own body, `foo.x`, is inlined down to `me.x`).
///
/// `visiting` guards against a cycle turning this into infinite recursion;
/// `depth` is checked against `max_depth` (spec's configurable inlining
/// recursion limit) independently of the cycle guard, since a long
/// non-cyclic chain should also be bounded.
pub(crate) fn fully_inline(
    expr: &Expr,
    program: &Program,
    swatch_bundles: &HashSet<String>,
    visiting: &mut HashSet<StrandKey>,
    depth: u32,
    max_depth: u32,
) -> Result<Expr, CompilationError> {
    if depth > max_depth {
        return Err(CompilationError::InlineDepthExceeded {
            bundle: String::new(),
            strand: String::new(),
            limit: max_depth,
        });
    }
    match expr {
        Expr::Index(bundle, idx) if bundle != "me" && swatch_bundles.contains(bundle) => {
            let strand = program
                .bundle(bundle)
                .and_then(|b| b.resolve_strand(idx))
                .ok_or(CompilationError::UnsupportedExpr { backend: "codegen", what: "unresolved index reference" })?;
            let key: StrandKey = (bundle.clone(), strand.name.clone());
            if !visiting.insert(key.clone()) {
                return Err(CompilationError::InlineDepthExceeded {
                    bundle: bundle.clone(),
                    strand: strand.name.clone(),
                    limit: max_depth,
                });
            }
            let inlined = fully_inline(&strand.expr, program, swatch_bundles, visiting, depth + 1, max_depth);
            visiting.remove(&key);
            inlined
        }
        _ => {
            let mut err = None;
            let rebuilt = expr.clone().map_children(|c| {
                if err.is_some() {
                    return c;
                }
                match fully_inline(&c, program, swatch_bundles, visiting, depth + 1, max_depth) {
                    Ok(v) => v,
                    Err(e) => {
                        err = Some(e);
                        c
                    }
                }
            });
            match err {
                Some(e) => Err(e),
                None => Ok(rebuilt),
            }
        }
    }
}

/// Stable `(bundle, strand) -> slotIndex` assignment for a swatch's
/// cross-domain reads (spec §4.4.6, §4.3 "stable `slotIndex`"),
/// deterministic across a compile because it only depends on sorted
/// names, never iteration order.
pub fn assign_cross_domain_slots(input_buffers: &FxHashMap<String, Vec<String>>) -> FxHashMap<(String, String), usize> {
    let mut bundle_names: Vec<&String> = input_buffers.keys().collect();
    bundle_names.sort();
    let mut slots = FxHashMap::default();
    let mut next = 0usize;
    for bundle in bundle_names {
        let mut strands = input_buffers[bundle].clone();
        strands.sort();
        for strand in strands {
            slots.insert((bundle.clone(), strand), next);
            next += 1;
        }
    }
    slots
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Bundle, Strand};

    fn program_of(bundles: Vec<Bundle>) -> Program {
        let mut map = FxHashMap::default();
        for b in bundles {
            map.insert(b.name.clone(), b);
        }
        Program { bundles: map, spindles: FxHashMap::default(), order: Vec::new(), resources: serde_json::Value::Null }
    }

    #[test]
    fn fully_inline_expands_a_pass_through_chain() {
        // foo.x = me.x ; bar.x = foo.x
        let foo = Bundle {
            name: "foo".into(),
            strands: vec![Strand { name: "x".into(), index: 0, expr: Expr::Index("me".into(), Box::new(Expr::Param("x".into()))) }],
        };
        let bar = Bundle {
            name: "bar".into(),
            strands: vec![Strand { name: "x".into(), index: 0, expr: Expr::Index("foo".into(), Box::new(Expr::Param("x".into()))) }],
        };
        let program = program_of(vec![foo, bar]);
        let swatch_bundles: HashSet<String> = ["foo".to_string(), "bar".to_string()].into_iter().collect();
        let base = Expr::Index("bar".into(), Box::new(Expr::Param("x".into())));
        let inlined = fully_inline(&base, &program, &swatch_bundles, &mut HashSet::new(), 0, 512).unwrap();
        assert_eq!(inlined, Expr::Index("me".into(), Box::new(Expr::Param("x".into()))));
    }

    #[test]
    fn fully_inline_detects_a_cycle() {
        let a = Bundle {
            name: "a".into(),
            strands: vec![Strand { name: "v".into(), index: 0, expr: Expr::Index("b".into(), Box::new(Expr::Param("v".into()))) }],
        };
        let b = Bundle {
            name: "b".into(),
            strands: vec![Strand { name: "v".into(), index: 0, expr: Expr::Index("a".into(), Box::new(Expr::Param("v".into()))) }],
        };
        let program = program_of(vec![a, b]);
        let swatch_bundles: HashSet<String> = ["a".to_string(), "b".to_string()].into_iter().collect();
        let base = Expr::Index("a".into(), Box::new(Expr::Param("v".into())));
        let result = fully_inline(&base, &program, &swatch_bundles, &mut HashSet::new(), 0, 512);
        assert!(matches!(result, Err(CompilationError::InlineDepthExceeded { .. })));
    }

    #[test]
    fn slot_assignment_is_sorted_and_deterministic() {
        let mut input_buffers = FxHashMap::default();
        input_buffers.insert("amp".to_string(), vec!["v".to_string(), "peak".to_string()]);
        input_buffers.insert("beat".to_string(), vec!["on".to_string()]);
        let slots = assign_cross_domain_slots(&input_buffers);
        assert_eq!(slots[&("amp".to_string(), "peak".to_string())], 0);
        assert_eq!(slots[&("amp".to_string(), "v".to_string())], 1);
        assert_eq!(slots[&("beat".to_string(), "on".to_string())], 2);
    }
}
