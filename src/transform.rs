//! IR transformations (spec §4.1): parameter substitution, spindle
//! inlining with cyclic-cache target rewrite, coordinate remap, and the
//! temporal-remap-to-cache rewrite.
use crate::error::{AnalysisError, CompilationError, WeftError};
use crate::ir::{BinOp, Bundle, Domain, Expr, Program, Spindle, Strand, StrandKey, STATEFUL_BUILTINS};
use fxhash::FxHashMap;
use std::collections::{BTreeMap, HashSet};

/// Combined substitution context built while inlining a spindle call:
/// `params` maps a spindle parameter name to its argument expression;
/// `locals` maps `"<local>.<index>"` and `"<local>.<name>"` to that
/// local's already-inlined defining expression (spec §4.1, "spindle
/// substitution build").
#[derive(Debug, Default, Clone)]
pub struct Substitution {
    pub params: FxHashMap<String, Expr>,
    pub locals: FxHashMap<String, Expr>,
}

fn index_key_string(idx: &Expr) -> Option<String> {
    match idx {
        Expr::Num(k) => Some((k.0 as i64).to_string()),
        Expr::Param(name) => Some(name.clone()),
        _ => None,
    }
}

/// Recursively replaces free `Param(name)` by its substitution and
/// rewrites `Index(local, key)` occurrences that name an already-inlined
/// local. Both rules are spelled out separately in spec §4.1
/// (`substituteParams` and the local index-reference rewrite) but are
/// naturally a single recursive walk since both only ever fire at a
/// `Param` or `Index` node.
pub fn apply_substitution(expr: &Expr, subst: &Substitution) -> Expr {
    match expr {
        Expr::Param(name) => subst.params.get(name).cloned().unwrap_or_else(|| expr.clone()),
        Expr::Index(bundle, idx) => {
            let idx2 = apply_substitution(idx, subst);
            if let Some(key) = index_key_string(&idx2) {
                if let Some(inlined) = subst.locals.get(&format!("{}.{}", bundle, key)) {
                    return inlined.clone();
                }
            }
            // A parameter bound to another `Index(b', _)` rewires the bundle
            // reference to `b'` rather than nesting an Index inside an Index.
            let bundle2 = match subst.params.get(bundle) {
                Some(Expr::Index(b2, _)) => b2.clone(),
                _ => bundle.clone(),
            };
            Expr::Index(bundle2, Box::new(idx2))
        }
        _ => expr.clone().map_children(|c| apply_substitution(&c, subst)),
    }
}

/// Plain parameter substitution with no local-inlining context — the
/// `substituteParams` primitive of spec §4.1 used outside of spindle
/// inlining (e.g. rewriting a bound coordinate before emission).
pub fn substitute_params(expr: &Expr, params: &FxHashMap<String, Expr>) -> Expr {
    apply_substitution(expr, &Substitution { params: params.clone(), locals: FxHashMap::default() })
}

/// Direct (non-transitive) references from one local to another within a
/// spindle body, used by the cyclic-cache target rewrite.
fn local_deps(locals: &[Bundle]) -> FxHashMap<String, HashSet<String>> {
    let mut deps = FxHashMap::default();
    for local in locals {
        let mut refs = HashSet::new();
        for strand in &local.strands {
            let mut idx_refs = Vec::new();
            strand.expr.collect_index_refs(&mut idx_refs);
            for (bundle, _) in idx_refs {
                if bundle != "me" && locals.iter().any(|l| l.name == bundle) {
                    refs.insert(bundle.to_string());
                }
            }
        }
        deps.insert(local.name.clone(), refs);
    }
    deps
}

fn transitive_deps(start: &str, deps: &FxHashMap<String, HashSet<String>>) -> HashSet<String> {
    let mut seen = HashSet::new();
    let mut stack = vec![start.to_string()];
    while let Some(n) = stack.pop() {
        if let Some(ds) = deps.get(&n) {
            for d in ds {
                if seen.insert(d.clone()) {
                    stack.push(d.clone());
                }
            }
        }
    }
    seen
}

/// Rewrites `Index(refLocal, refIdx)` occurrences inside a cache builtin's
/// *value* expression when `refLocal` cyclically depends back on (or is)
/// `enclosing_local`, pointing them at the caller's target strand instead
/// (spec §4.1 step 2).
fn rewrite_cyclic_cache_refs(
    expr: &Expr,
    enclosing_local: &str,
    deps: &FxHashMap<String, HashSet<String>>,
    target: &(String, u32),
) -> Expr {
    match expr {
        Expr::Builtin(name, args) if name == "cache" && args.len() == 4 => {
            let value = rewrite_cyclic_refs_in_value(&args[0], enclosing_local, deps, target);
            Expr::Builtin("cache".to_string(), vec![value, args[1].clone(), args[2].clone(), args[3].clone()])
        }
        _ => expr.clone().map_children(|c| rewrite_cyclic_cache_refs(&c, enclosing_local, deps, target)),
    }
}

fn rewrite_cyclic_refs_in_value(
    value: &Expr,
    enclosing_local: &str,
    deps: &FxHashMap<String, HashSet<String>>,
    target: &(String, u32),
) -> Expr {
    match value {
        Expr::Index(bundle, idx) => {
            let cyclic = bundle == enclosing_local || transitive_deps(bundle, deps).contains(enclosing_local);
            if cyclic {
                Expr::Index(target.0.clone(), Box::new(Expr::num(target.1 as f64)))
            } else {
                Expr::Index(bundle.clone(), Box::new(rewrite_cyclic_refs_in_value(idx, enclosing_local, deps, target)))
            }
        }
        _ => value.clone().map_children(|c| rewrite_cyclic_refs_in_value(&c, enclosing_local, deps, target)),
    }
}

/// Inlines `spindle(args)` (or its `return_index`-th return value for an
/// `Extract`) at `target = (bundle, strandIndex)`, rewriting any
/// self-referential cache inside the spindle body so the closed loop lands
/// on the caller's strand rather than a now-vanished local (spec §4.1).
pub fn inline_spindle_call_with_target(
    spindle: &Spindle,
    args: &[Expr],
    return_index: usize,
    target: (String, u32),
) -> Expr {
    let deps = local_deps(&spindle.locals);
    let rewritten_locals: Vec<Bundle> = spindle
        .locals
        .iter()
        .map(|local| Bundle {
            name: local.name.clone(),
            strands: local
                .strands
                .iter()
                .map(|s| Strand {
                    name: s.name.clone(),
                    index: s.index,
                    expr: rewrite_cyclic_cache_refs(&s.expr, &local.name, &deps, &target),
                })
                .collect(),
        })
        .collect();

    let mut subst = Substitution::default();
    for (p, a) in spindle.params.iter().zip(args.iter()) {
        subst.params.insert(p.clone(), a.clone());
    }
    for local in &rewritten_locals {
        for strand in &local.strands {
            let inlined = apply_substitution(&strand.expr, &subst);
            subst.locals.insert(format!("{}.{}", local.name, strand.index), inlined.clone());
            subst.locals.insert(format!("{}.{}", local.name, strand.name), inlined);
        }
    }
    apply_substitution(&spindle.returns[return_index], &subst)
}

fn resolve_coord_name(idx: &Expr, domain: Domain) -> Option<String> {
    match idx {
        Expr::Param(name) => Some(name.clone()),
        Expr::Num(k) => domain.positional_key(k.0 as usize).map(|s| s.to_string()),
        _ => None,
    }
}

/// `applyRemap` (spec §4.1): substitutes coordinates within the *direct*
/// body of `base` only — it never expands through an `Index` into another
/// bundle to keep substituting deeper. Nested `Remap`s compose by applying
/// the outer substitutions to each inner replacement.
pub fn apply_remap(base: &Expr, subs: &BTreeMap<String, Expr>, domain: Domain) -> Expr {
    match base {
        Expr::Index(bundle, idx) if bundle == "me" => {
            if let Some(coord) = resolve_coord_name(idx, domain) {
                if let Some(replacement) = subs.get(&format!("me.{}", coord)) {
                    return replacement.clone();
                }
            }
            base.clone()
        }
        Expr::Remap(inner_base, inner_subs) => {
            let mut merged: BTreeMap<String, Expr> =
                inner_subs.iter().map(|(k, v)| (k.clone(), apply_remap(v, subs, domain))).collect();
            for (k, v) in subs {
                merged.entry(k.clone()).or_insert_with(|| v.clone());
            }
            Expr::Remap(inner_base.clone(), merged)
        }
        _ => base.clone().map_children(|c| match &c {
            Expr::Index(b, _) if b != "me" => c,
            _ => apply_remap(&c, subs, domain),
        }),
    }
}

fn is_me_t(e: &Expr) -> bool {
    matches!(e, Expr::Index(b, idx) if b == "me" && matches!(&**idx, Expr::Param(p) if p == "t"))
}

/// Matches `me.t - N` / `me.t + N` (N<0) syntactically; any other form
/// falls back to offset 1 (spec §4.1, deliberately not a symbolic solver).
fn extract_temporal_offset(expr: &Expr) -> i64 {
    match expr {
        Expr::BinaryOp(BinOp::Sub, l, r) if is_me_t(l) => {
            if let Expr::Num(n) = &**r {
                return n.0 as i64;
            }
            1
        }
        Expr::BinaryOp(BinOp::Add, l, r) if is_me_t(l) => {
            if let Expr::Num(n) = &**r {
                if n.0 < 0.0 {
                    return -(n.0 as i64);
                }
            }
            1
        }
        _ => 1,
    }
}

/// Builtins reachable from `expr` directly, plus (one level of bundle
/// indirection only) the builtins of the strand it indexes into.
fn resolved_builtins_one_level(expr: &Expr, program: &Program) -> Vec<String> {
    let mut builtins = Vec::new();
    expr.collect_builtins(&mut builtins);
    if let Expr::Index(bundle, idx) = expr {
        if bundle != "me" {
            if let Some(b) = program.bundle(bundle) {
                if let Some(strand) = b.resolve_strand(idx) {
                    strand.expr.collect_builtins(&mut builtins);
                }
            }
        }
    }
    builtins
}

fn is_stateful_base(expr: &Expr, program: &Program) -> bool {
    resolved_builtins_one_level(expr, program)
        .iter()
        .any(|b| STATEFUL_BUILTINS.contains(&b.as_str()))
}

pub(crate) fn free_references_strand(expr: &Expr, program: &Program, strand_key: &StrandKey) -> bool {
    let mut refs = Vec::new();
    expr.collect_index_refs(&mut refs);
    refs.iter().any(|(bundle, idx)| {
        *bundle != "me"
            && program
                .bundle(bundle)
                .and_then(|b| b.resolve_strand(idx))
                .map(|strand| *bundle == strand_key.0 && strand.name == strand_key.1)
                .unwrap_or(false)
    })
}

fn temporal_cache_builtin(base: Expr, n: i64) -> Expr {
    let signal = Expr::Index("me".into(), Box::new(Expr::Param("t".into())));
    Expr::Builtin("cache".into(), vec![base, Expr::num((n + 1) as f64), Expr::num(n as f64), signal])
}

fn rewrite_temporal_phase1(expr: &Expr, program: &Program, strand_key: &StrandKey) -> Expr {
    match expr {
        Expr::Remap(base, subs) if subs.contains_key("me.t") => {
            let base2 = rewrite_temporal_phase1(base, program, strand_key);
            if is_stateful_base(&base2, program) && !free_references_strand(&base2, program, strand_key) {
                let n = extract_temporal_offset(&subs["me.t"]);
                temporal_cache_builtin(base2, n)
            } else {
                let subs2 = subs.iter().map(|(k, v)| (k.clone(), rewrite_temporal_phase1(v, program, strand_key))).collect();
                Expr::Remap(Box::new(base2), subs2)
            }
        }
        _ => expr.clone().map_children(|c| rewrite_temporal_phase1(&c, program, strand_key)),
    }
}

fn find_self_referential_offset(expr: &Expr, program: &Program, strand_key: &StrandKey) -> Option<i64> {
    if let Expr::Remap(base, subs) = expr {
        if subs.contains_key("me.t") && free_references_strand(base, program, strand_key) {
            return Some(extract_temporal_offset(&subs["me.t"]));
        }
    }
    let mut found = None;
    expr.for_each_child(|c| {
        if found.is_none() {
            found = find_self_referential_offset(c, program, strand_key);
        }
    });
    found
}

fn unwrap_self_referential(expr: Expr, program: &Program, strand_key: &StrandKey) -> Expr {
    if let Expr::Remap(base, subs) = &expr {
        if subs.contains_key("me.t") && free_references_strand(base, program, strand_key) {
            return unwrap_self_referential((**base).clone(), program, strand_key);
        }
    }
    expr.map_children(|c| unwrap_self_referential(c, program, strand_key))
}

fn rewrite_temporal_phase2(expr: Expr, program: &Program, strand_key: &StrandKey) -> Expr {
    match find_self_referential_offset(&expr, program, strand_key) {
        None => expr,
        Some(n) => {
            let unwrapped = unwrap_self_referential(expr, program, strand_key);
            temporal_cache_builtin(unwrapped, n)
        }
    }
}

/// Two-phase temporal-remap-to-cache rewrite (spec §4.1). Idempotent: its
/// output contains no `me.t`-keyed `Remap` left to rewrite.
pub fn rewrite_temporal_remaps(strand_expr: &Expr, program: &Program, strand_key: &StrandKey) -> Expr {
    let phase1 = rewrite_temporal_phase1(strand_expr, program, strand_key);
    rewrite_temporal_phase2(phase1, program, strand_key)
}

fn rewrite_calls_bounded(
    expr: &Expr,
    program: &Program,
    target: &(String, u32),
    depth: u32,
    max_depth: u32,
) -> Result<Expr, WeftError> {
    if depth > max_depth {
        return Err(WeftError::Compilation(CompilationError::InlineDepthExceeded {
            bundle: target.0.clone(),
            strand: target.1.to_string(),
            limit: max_depth,
        }));
    }
    match expr {
        Expr::Call(name, args) => {
            let spindle = program
                .spindle(name)
                .ok_or_else(|| WeftError::Analysis(AnalysisError::UnknownSpindle(name.clone())))?;
            if spindle.returns.is_empty() {
                return Err(WeftError::Analysis(AnalysisError::SpindleReturnIndexOutOfRange {
                    spindle: name.clone(),
                    index: 0,
                    len: 0,
                }));
            }
            let args: Vec<Expr> = args
                .iter()
                .map(|a| rewrite_calls_bounded(a, program, target, depth + 1, max_depth))
                .collect::<Result<_, _>>()?;
            let inlined = inline_spindle_call_with_target(spindle, &args, 0, target.clone());
            rewrite_calls_bounded(&inlined, program, target, depth + 1, max_depth)
        }
        Expr::Extract(call, idx) => match call.as_ref() {
            Expr::Call(name, args) => {
                let spindle = program
                    .spindle(name)
                    .ok_or_else(|| WeftError::Analysis(AnalysisError::UnknownSpindle(name.clone())))?;
                if *idx >= spindle.returns.len() {
                    return Err(WeftError::Analysis(AnalysisError::SpindleReturnIndexOutOfRange {
                        spindle: name.clone(),
                        index: *idx,
                        len: spindle.returns.len(),
                    }));
                }
                let args: Vec<Expr> = args
                    .iter()
                    .map(|a| rewrite_calls_bounded(a, program, target, depth + 1, max_depth))
                    .collect::<Result<_, _>>()?;
                let inlined = inline_spindle_call_with_target(spindle, &args, *idx, target.clone());
                rewrite_calls_bounded(&inlined, program, target, depth + 1, max_depth)
            }
            _ => {
                let inner = rewrite_calls_bounded(call, program, target, depth + 1, max_depth)?;
                rewrite_calls_bounded(&Expr::Extract(Box::new(inner), *idx), program, target, depth + 1, max_depth)
            }
        },
        _ => {
            let mut err = None;
            let rebuilt = expr.clone().map_children(|c| {
                if err.is_some() {
                    return c;
                }
                match rewrite_calls_bounded(&c, program, target, depth + 1, max_depth) {
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

/// Eliminates every `Call`/`Extract(Call, _)` placeholder in the program by
/// inlining at the strand that contains it (spec §4.1's "target" for the
/// cyclic-cache rewrite is always the enclosing strand, regardless of how
/// deep inside its expression tree the call sits). Runs to a fixed point per
/// strand since an inlined spindle body can itself contain calls to other
/// spindles.
pub fn inline_all_calls(program: &Program, max_depth: u32) -> Result<Program, WeftError> {
    let mut bundles = program.bundles.clone();
    for (name, bundle) in &program.bundles {
        let mut strands = Vec::with_capacity(bundle.strands.len());
        for strand in &bundle.strands {
            let target = (name.clone(), strand.index);
            let expr = rewrite_calls_bounded(&strand.expr, program, &target, 0, max_depth)?;
            strands.push(Strand { name: strand.name.clone(), index: strand.index, expr });
        }
        bundles.insert(name.clone(), Bundle { name: name.clone(), strands });
    }
    Ok(Program {
        bundles,
        spindles: program.spindles.clone(),
        order: program.order.clone(),
        resources: program.resources.clone(),
    })
}

/// Runs [`rewrite_temporal_remaps`] over every strand in the program (spec
/// §4.1), producing cache builtins from `me.t`-keyed remaps before analysis
/// looks for them. Each strand is rewritten against the original program so
/// referenced bundles' bodies are still in their pre-rewrite form, matching
/// how [`insert_cache_reads`](crate::analysis::insert_cache_reads) reads the
/// original program while writing into a cloned bundle map.
pub fn rewrite_all_temporal_remaps(program: &Program) -> Program {
    let mut bundles = program.bundles.clone();
    for (name, bundle) in &program.bundles {
        let strands: Vec<Strand> = bundle
            .strands
            .iter()
            .map(|s| {
                let key: StrandKey = (name.clone(), s.name.clone());
                Strand { name: s.name.clone(), index: s.index, expr: rewrite_temporal_remaps(&s.expr, program, &key) }
            })
            .collect();
        bundles.insert(name.clone(), Bundle { name: name.clone(), strands });
    }
    Program {
        bundles,
        spindles: program.spindles.clone(),
        order: program.order.clone(),
        resources: program.resources.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Bundle, Strand};

    fn program_with(bundles: Vec<Bundle>) -> Program {
        let mut map = FxHashMap::default();
        for b in bundles {
            map.insert(b.name.clone(), b);
        }
        Program { bundles: map, spindles: FxHashMap::default(), order: Vec::new(), resources: serde_json::Value::Null }
    }

    #[test]
    fn substitute_params_rewrites_param_and_bundle_indirection() {
        let mut params = FxHashMap::default();
        params.insert("p".to_string(), Expr::Index("foo".into(), Box::new(Expr::Param("x".into()))));
        let expr = Expr::Index("p".into(), Box::new(Expr::Param("y".into())));
        let out = substitute_params(&expr, &params);
        assert_eq!(out, Expr::Index("foo".into(), Box::new(Expr::Param("y".into()))));
    }

    #[test]
    fn temporal_remap_on_stateful_base_becomes_cache() {
        let program = program_with(vec![Bundle {
            name: "mic".into(),
            strands: vec![Strand {
                name: "s".into(),
                index: 0,
                expr: Expr::Builtin("microphone".into(), vec![]),
            }],
        }]);
        let subs: BTreeMap<String, Expr> = [(
            "me.t".to_string(),
            Expr::BinaryOp(BinOp::Sub, Box::new(Expr::Index("me".into(), Box::new(Expr::Param("t".into())))), Box::new(Expr::num(3.0))),
        )]
        .into_iter()
        .collect();
        let strand_expr = Expr::Remap(Box::new(Expr::Index("mic".into(), Box::new(Expr::Param("s".into())))), subs);
        let key: StrandKey = ("out".to_string(), "v".to_string());
        let rewritten = rewrite_temporal_remaps(&strand_expr, &program, &key);
        match rewritten {
            Expr::Builtin(name, args) => {
                assert_eq!(name, "cache");
                assert_eq!(args[1], Expr::num(4.0));
                assert_eq!(args[2], Expr::num(3.0));
            }
            other => panic!("expected cache builtin, got {:?}", other),
        }
    }

    #[test]
    fn temporal_rewrite_is_idempotent() {
        let program = program_with(vec![]);
        let key: StrandKey = ("out".to_string(), "v".to_string());
        let already_cache = Expr::Builtin(
            "cache".into(),
            vec![Expr::num(0.0), Expr::num(2.0), Expr::num(1.0), Expr::num(0.0)],
        );
        let once = rewrite_temporal_remaps(&already_cache, &program, &key);
        let twice = rewrite_temporal_remaps(&once, &program, &key);
        assert_eq!(once, twice);
    }

    #[test]
    fn apply_remap_is_direct_only() {
        // bar.x = foo.x (a bare reference, no coordinate use at this node)
        let subs: BTreeMap<String, Expr> = [("me.x".to_string(), Expr::num(0.5))].into_iter().collect();
        let base = Expr::Index("foo".into(), Box::new(Expr::Param("x".into())));
        let out = apply_remap(&base, &subs, Domain::Visual);
        // unchanged: the Index into "foo" is left alone, not expanded or rewritten.
        assert_eq!(out, base);
    }

    #[test]
    fn apply_remap_substitutes_me_coordinate_directly() {
        let subs: BTreeMap<String, Expr> = [("me.x".to_string(), Expr::num(0.5))].into_iter().collect();
        let base = Expr::BinaryOp(
            BinOp::Mul,
            Box::new(Expr::Index("me".into(), Box::new(Expr::Param("x".into())))),
            Box::new(Expr::num(2.0)),
        );
        let out = apply_remap(&base, &subs, Domain::Visual);
        assert_eq!(out, Expr::BinaryOp(BinOp::Mul, Box::new(Expr::num(0.5)), Box::new(Expr::num(2.0))));
    }

    fn program_with_spindles(bundles: Vec<Bundle>, spindles: Vec<Spindle>) -> Program {
        let mut bmap = FxHashMap::default();
        for b in bundles {
            bmap.insert(b.name.clone(), b);
        }
        let mut smap = FxHashMap::default();
        for s in spindles {
            smap.insert(s.name.clone(), s);
        }
        Program { bundles: bmap, spindles: smap, order: Vec::new(), resources: serde_json::Value::Null }
    }

    #[test]
    fn inline_all_calls_removes_call_and_extract_nodes() {
        let doubler = Spindle {
            name: "doubler".into(),
            params: vec!["v".into()],
            locals: vec![],
            returns: vec![Expr::BinaryOp(BinOp::Mul, Box::new(Expr::Param("v".into())), Box::new(Expr::num(2.0)))],
        };
        let out = Bundle {
            name: "out".into(),
            strands: vec![Strand {
                name: "v".into(),
                index: 0,
                expr: Expr::Extract(
                    Box::new(Expr::Call("doubler".into(), vec![Expr::num(3.0)])),
                    0,
                ),
            }],
        };
        let program = program_with_spindles(vec![out], vec![doubler]);
        let inlined = inline_all_calls(&program, 512).unwrap();
        let strand = &inlined.bundle("out").unwrap().strands[0];
        assert_eq!(strand.expr, Expr::BinaryOp(BinOp::Mul, Box::new(Expr::num(3.0)), Box::new(Expr::num(2.0))));
    }

    #[test]
    fn inline_all_calls_rejects_unknown_spindle() {
        let out = Bundle {
            name: "out".into(),
            strands: vec![Strand { name: "v".into(), index: 0, expr: Expr::Call("missing".into(), vec![]) }],
        };
        let program = program_with_spindles(vec![out], vec![]);
        let result = inline_all_calls(&program, 512);
        assert!(matches!(result, Err(WeftError::Analysis(AnalysisError::UnknownSpindle(_)))));
    }

    #[test]
    fn rewrite_all_temporal_remaps_covers_every_strand() {
        let program = program_with(vec![Bundle {
            name: "mic".into(),
            strands: vec![Strand { name: "s".into(), index: 0, expr: Expr::Builtin("microphone".into(), vec![]) }],
        }]);
        let subs: BTreeMap<String, Expr> = [(
            "me.t".to_string(),
            Expr::BinaryOp(BinOp::Sub, Box::new(Expr::Index("me".into(), Box::new(Expr::Param("t".into())))), Box::new(Expr::num(1.0))),
        )]
        .into_iter()
        .collect();
        let out = Bundle {
            name: "out".into(),
            strands: vec![Strand {
                name: "v".into(),
                index: 0,
                expr: Expr::Remap(Box::new(Expr::Index("mic".into(), Box::new(Expr::Param("s".into())))), subs),
            }],
        };
        let mut full = program;
        full.bundles.insert("out".to_string(), out);
        let rewritten = rewrite_all_temporal_remaps(&full);
        let strand = &rewritten.bundle("out").unwrap().strands[0];
        assert!(matches!(&strand.expr, Expr::Builtin(name, _) if name == "cache"));
    }
}
