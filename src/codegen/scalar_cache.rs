//! CPU-tick compilation for `Storage::Scalar` visual caches (spec §4.6,
//! §4.7's "between ticks, CPU-tick any scalar visual cache before GPU
//! dispatch"). A cache whose value/signal never read `me.x`/`me.y` is
//! uniform across the frame, so it ticks once on the CPU ahead of kernel
//! dispatch instead of once per pixel inside the display kernel. Mirrors
//! `codegen::audio::build_eval`'s closure-tree approach, narrowed to the
//! visual domain's non-spatial coordinates.
use super::audio::{apply_audio_builtin, apply_binop, apply_unop};
use super::fully_inline;
use crate::analysis::{index_cache_sites, replace_self_reference, BackendId, CacheNodeDescriptor, Storage};
use crate::cache::CacheManager;
use crate::error::{CompilationError, RuntimeError};
use crate::ir::{is_known_builtin, Domain, Expr, Program, StrandKey};
use crate::partition::Swatch;
use crate::transform::apply_remap;
use fxhash::FxHashMap;
use std::collections::HashSet;

/// Per-frame evaluation state for scalar cache closures. `time`/`width`/
/// `height` are the same uniforms every kernel of this frame sees;
/// `cross_domain` lets a scalar cache's value depend on the other
/// backend's latest export.
pub struct ScalarCacheContext<'a> {
    pub time: f64,
    pub width: f64,
    pub height: f64,
    pub cross_domain: &'a FxHashMap<(String, String), f64>,
    pub cache: &'a mut CacheManager,
}

pub type ScalarCacheClosure = Box<dyn Fn(&mut ScalarCacheContext) -> Result<f64, RuntimeError> + Send + Sync>;

fn visual_scalar_coord(idx: &Expr) -> Result<&'static str, CompilationError> {
    match idx {
        Expr::Param(name) => Domain::Visual
            .coord_order()
            .iter()
            .find(|c| **c == name)
            .copied()
            .ok_or(CompilationError::UnsupportedExpr { backend: "visual-scalar", what: "unknown coordinate name" }),
        Expr::Num(k) => Domain::Visual
            .positional_key(k.0 as usize)
            .ok_or(CompilationError::UnsupportedExpr { backend: "visual-scalar", what: "coordinate index out of range" }),
        _ => Err(CompilationError::UnsupportedExpr { backend: "visual-scalar", what: "non-literal coordinate key" }),
    }
}

#[allow(clippy::too_many_arguments)]
fn build_eval(
    expr: &Expr,
    program: &Program,
    swatch_bundles: &HashSet<String>,
    bundle_name: &str,
    strand_index: u32,
    local_ordinal: &mut u32,
    cache_sites: &FxHashMap<(String, u32, u32), u32>,
    visiting: &mut HashSet<StrandKey>,
    depth: u32,
    max_depth: u32,
) -> Result<ScalarCacheClosure, CompilationError> {
    if depth > max_depth {
        return Err(CompilationError::InlineDepthExceeded {
            bundle: bundle_name.to_string(),
            strand: String::new(),
            limit: max_depth,
        });
    }
    match expr {
        Expr::Num(v) => {
            let v = v.0;
            Ok(Box::new(move |_ctx: &mut ScalarCacheContext| Ok(v)))
        }
        Expr::Param(_) => Err(CompilationError::UnsupportedExpr { backend: "visual-scalar", what: "bare parameter outside index position" }),
        Expr::CacheRead(id, _tap) => {
            let id = *id;
            Ok(Box::new(move |ctx: &mut ScalarCacheContext| ctx.cache.previous_value(id, 0)))
        }
        Expr::Index(bundle, idx) if bundle == "me" => {
            let coord = visual_scalar_coord(idx)?;
            match coord {
                "t" => Ok(Box::new(move |ctx: &mut ScalarCacheContext| Ok(ctx.time))),
                "w" => Ok(Box::new(move |ctx: &mut ScalarCacheContext| Ok(ctx.width))),
                "h" => Ok(Box::new(move |ctx: &mut ScalarCacheContext| Ok(ctx.height))),
                "x" | "y" => Err(CompilationError::UnsupportedExpr {
                    backend: "visual-scalar",
                    what: "a scalar cache's value/signal read a spatial coordinate",
                }),
                _ => unreachable!("Domain::Visual only defines x/y/t/w/h"),
            }
        }
        Expr::Index(bundle, idx) if !swatch_bundles.contains(bundle) => {
            let strand = program
                .bundle(bundle)
                .and_then(|b| b.resolve_strand(idx))
                .ok_or(CompilationError::UnsupportedExpr { backend: "visual-scalar", what: "unresolved cross-domain index" })?;
            let key = (bundle.clone(), strand.name.clone());
            Ok(Box::new(move |ctx: &mut ScalarCacheContext| {
                ctx.cross_domain.get(&key).copied().ok_or(RuntimeError::InputProviderUnreachable("cross-domain buffer"))
            }))
        }
        Expr::Index(bundle, idx) => {
            let strand = program
                .bundle(bundle)
                .and_then(|b| b.resolve_strand(idx))
                .ok_or(CompilationError::UnsupportedExpr { backend: "visual-scalar", what: "unresolved index reference" })?;
            let key: StrandKey = (bundle.clone(), strand.name.clone());
            if !visiting.insert(key.clone()) {
                return Err(CompilationError::InlineDepthExceeded { bundle: bundle.clone(), strand: strand.name.clone(), limit: max_depth });
            }
            let mut nested_ordinal = 0u32;
            let inner = build_eval(
                &strand.expr,
                program,
                swatch_bundles,
                bundle,
                strand.index,
                &mut nested_ordinal,
                cache_sites,
                visiting,
                depth + 1,
                max_depth,
            );
            visiting.remove(&key);
            inner
        }
        Expr::BinaryOp(op, l, r) => {
            let lf = build_eval(l, program, swatch_bundles, bundle_name, strand_index, local_ordinal, cache_sites, visiting, depth + 1, max_depth)?;
            let rf = build_eval(r, program, swatch_bundles, bundle_name, strand_index, local_ordinal, cache_sites, visiting, depth + 1, max_depth)?;
            let op = *op;
            Ok(Box::new(move |ctx: &mut ScalarCacheContext| Ok(apply_binop(op, lf(ctx)?, rf(ctx)?))))
        }
        Expr::UnaryOp(op, x) => {
            let xf = build_eval(x, program, swatch_bundles, bundle_name, strand_index, local_ordinal, cache_sites, visiting, depth + 1, max_depth)?;
            let op = *op;
            Ok(Box::new(move |ctx: &mut ScalarCacheContext| Ok(apply_unop(op, xf(ctx)?))))
        }
        Expr::Builtin(name, args) if name == "cache" && args.len() == 4 => {
            let ordinal = *local_ordinal;
            *local_ordinal += 1;
            let id = *cache_sites
                .get(&(bundle_name.to_string(), strand_index, ordinal))
                .ok_or(CompilationError::UnsupportedExpr { backend: "visual-scalar", what: "cache site missing from index" })?;
            let value_fn = build_eval(&args[0], program, swatch_bundles, bundle_name, strand_index, local_ordinal, cache_sites, visiting, depth + 1, max_depth)?;
            let signal_fn = build_eval(&args[3], program, swatch_bundles, bundle_name, strand_index, local_ordinal, cache_sites, visiting, depth + 1, max_depth)?;
            Ok(Box::new(move |ctx: &mut ScalarCacheContext| {
                let signal = signal_fn(ctx)?;
                let value = value_fn(ctx)?;
                ctx.cache.tick(id, 0, value, signal)
            }))
        }
        Expr::Builtin(name, args) if name == "select" && args.len() == 3 => {
            let cond_fn = build_eval(&args[0], program, swatch_bundles, bundle_name, strand_index, local_ordinal, cache_sites, visiting, depth + 1, max_depth)?;
            // Short-circuit (spec §4.5): defer an untaken branch's build
            // error until it's actually selected at evaluation time.
            let a_branch = build_eval(&args[1], program, swatch_bundles, bundle_name, strand_index, local_ordinal, cache_sites, visiting, depth + 1, max_depth)
                .map_err(|e| e.to_string());
            let b_branch = build_eval(&args[2], program, swatch_bundles, bundle_name, strand_index, local_ordinal, cache_sites, visiting, depth + 1, max_depth)
                .map_err(|e| e.to_string());
            Ok(Box::new(move |ctx: &mut ScalarCacheContext| {
                let branch = if cond_fn(ctx)? != 0.0 { &a_branch } else { &b_branch };
                match branch {
                    Ok(f) => f(ctx),
                    Err(msg) => Err(RuntimeError::UntakenBranchUnresolved(msg.clone())),
                }
            }))
        }
        Expr::Builtin(name, _) if matches!(name.as_str(), "camera" | "texture" | "mouse" | "key" | "text" | "microphone") => {
            Err(CompilationError::UnsupportedExpr { backend: "visual-scalar", what: "hardware builtin has no CPU-side uniform channel" })
        }
        Expr::Builtin(name, args) => {
            if !is_known_builtin(name) {
                return Err(CompilationError::UnknownBuiltin(name.clone()));
            }
            let mut arg_fns = Vec::with_capacity(args.len());
            for a in args {
                arg_fns.push(build_eval(a, program, swatch_bundles, bundle_name, strand_index, local_ordinal, cache_sites, visiting, depth + 1, max_depth)?);
            }
            let name = name.clone();
            Ok(Box::new(move |ctx: &mut ScalarCacheContext| {
                let mut vals = Vec::with_capacity(arg_fns.len());
                for f in &arg_fns {
                    vals.push(f(ctx)?);
                }
                Ok(apply_audio_builtin(&name, &vals))
            }))
        }
        Expr::Call(_, _) | Expr::Extract(_, _) => {
            Err(CompilationError::UnsupportedExpr { backend: "visual-scalar", what: "Call/Extract survived past transform" })
        }
        Expr::Remap(base, subs) => {
            let inlined = fully_inline(base, program, swatch_bundles, &mut HashSet::new(), 0, max_depth)?;
            let substituted = apply_remap(&inlined, subs, Domain::Visual);
            build_eval(&substituted, program, swatch_bundles, bundle_name, strand_index, local_ordinal, cache_sites, visiting, depth + 1, max_depth)
        }
    }
}

/// One closure per `Storage::Scalar` visual cache owned by `swatch`, keyed
/// by cache id. Each closure computes that cache's own value/signal and
/// ticks it through `ctx.cache`; the kernel body never sees its
/// value/signal expressions, only the ticked result (spec §4.6).
pub fn generate(
    program: &Program,
    swatch: &Swatch,
    descriptors: &[CacheNodeDescriptor],
    max_inline_depth: u32,
) -> Result<Vec<(u32, ScalarCacheClosure)>, CompilationError> {
    let cache_sites = index_cache_sites(descriptors);
    let mut out = Vec::new();
    for d in descriptors {
        if d.backend_id != BackendId::Visual || d.storage != Storage::Scalar || !swatch.bundles.contains(&d.bundle_name) {
            continue;
        }
        let bundle = program
            .bundle(&d.bundle_name)
            .ok_or(CompilationError::UnsupportedExpr { backend: "visual-scalar", what: "cache descriptor's bundle missing from program" })?;
        let strand = bundle
            .strand_by_index(d.strand_index)
            .ok_or(CompilationError::UnsupportedExpr { backend: "visual-scalar", what: "cache descriptor's strand missing from bundle" })?;
        let strand_key: StrandKey = (d.bundle_name.clone(), strand.name.clone());
        let value_expr =
            if d.has_self_reference { replace_self_reference(&d.value_expr, program, &strand_key, d.id) } else { d.value_expr.clone() };

        let own_ordinal = cache_sites
            .iter()
            .find(|(key, site_id)| key.0 == d.bundle_name && key.1 == d.strand_index && **site_id == d.id)
            .map(|(key, _)| key.2)
            .ok_or(CompilationError::UnsupportedExpr { backend: "visual-scalar", what: "cache descriptor missing its own site" })?;
        let mut local_ordinal = own_ordinal + 1;

        let mut visiting = HashSet::new();
        let value_fn = build_eval(
            &value_expr,
            program,
            &swatch.bundles,
            &d.bundle_name,
            d.strand_index,
            &mut local_ordinal,
            &cache_sites,
            &mut visiting,
            0,
            max_inline_depth,
        )?;
        let mut visiting = HashSet::new();
        let signal_fn = build_eval(
            &d.signal_expr,
            program,
            &swatch.bundles,
            &d.bundle_name,
            d.strand_index,
            &mut local_ordinal,
            &cache_sites,
            &mut visiting,
            0,
            max_inline_depth,
        )?;

        let id = d.id;
        let closure: ScalarCacheClosure = Box::new(move |ctx: &mut ScalarCacheContext| {
            let signal = signal_fn(ctx)?;
            let value = value_fn(ctx)?;
            ctx.cache.tick(id, 0, value, signal)
        });
        out.push((id, closure));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{build_dependency_graph, extract_cache_descriptors, toposort_bundles};
    use crate::ir::{BinOp, Bundle, Strand};
    use crate::partition::partition;

    fn program_of(bundles: Vec<Bundle>) -> Program {
        let mut map = FxHashMap::default();
        for b in bundles {
            map.insert(b.name.clone(), b);
        }
        Program { bundles: map, spindles: FxHashMap::default(), order: Vec::new(), resources: serde_json::Value::Null }
    }

    #[test]
    fn scalar_feedback_cache_ticks_without_a_pixel_cell() {
        // trail.v = cache(trail.v * 0.95 + 1.0, 2, 0, me.t) -- coordinate-free.
        let value = Expr::BinaryOp(
            BinOp::Add,
            Box::new(Expr::BinaryOp(
                BinOp::Mul,
                Box::new(Expr::Index("trail".into(), Box::new(Expr::Param("v".into())))),
                Box::new(Expr::num(0.95)),
            )),
            Box::new(Expr::num(1.0)),
        );
        let signal = Expr::Index("me".into(), Box::new(Expr::Param("t".into())));
        let cache_expr = Expr::Builtin("cache".into(), vec![value, Expr::num(2.0), Expr::num(0.0), signal]);
        let trail = Bundle { name: "trail".into(), strands: vec![Strand { name: "v".into(), index: 0, expr: cache_expr }] };
        let display = Bundle {
            name: "display".into(),
            strands: vec![Strand { name: "r".into(), index: 0, expr: Expr::Index("trail".into(), Box::new(Expr::Param("v".into()))) }],
        };
        let program = program_of(vec![trail, display]);
        let dep = build_dependency_graph(&program);
        let order = toposort_bundles(&dep).unwrap();
        let descriptors = extract_cache_descriptors(&program, &order);
        assert_eq!(descriptors[0].storage, Storage::Scalar);
        let rewritten = crate::analysis::insert_cache_reads(&program, &order, &descriptors);
        let swatches = partition(&rewritten, &order);
        let swatch = swatches.into_iter().find(|s| s.backend_id == BackendId::Visual).unwrap();

        let closures = generate(&rewritten, &swatch, &descriptors, 512).unwrap();
        assert_eq!(closures.len(), 1);
        let (id, closure) = &closures[0];

        let cross = FxHashMap::default();
        let mut mgr = CacheManager::new();
        mgr.register(&descriptors[0], 1);
        let mut ctx = ScalarCacheContext { time: 0.0, width: 1.0, height: 1.0, cross_domain: &cross, cache: &mut mgr };
        let first = closure(&mut ctx).unwrap();
        assert_eq!(first, 1.0);
        ctx.time = 1.0;
        let second = closure(&mut ctx).unwrap();
        assert_eq!(second, 1.95);
        assert_eq!(*id, descriptors[0].id);
    }
}
