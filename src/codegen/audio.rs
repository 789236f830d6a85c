//! Audio backend codegen (spec §4.5): compiles each `play` strand into a
//! native Rust closure tree instead of emitting kernel text — the audio
//! backend's "native target" is a Rust closure running on the callback
//! thread, so there is no intermediate source representation to print.
//! Unlike the visual backend, same-swatch bundle references are inlined
//! directly into the closure tree rather than hoisted into CSE locals,
//! since there is no GPU-kernel-wide shared-memory concern here.
use super::fully_inline;
use crate::analysis::{index_cache_sites, CacheNodeDescriptor};
use crate::cache::CacheManager;
use crate::error::{CompilationError, RuntimeError};
use crate::ir::{is_known_builtin, BinOp, Domain, Expr, Program, StrandKey, UnOp};
use crate::partition::Swatch;
use crate::transform::apply_remap;
use fxhash::FxHashMap;
use std::collections::HashSet;

/// Per-sample evaluation state threaded through every closure in the tree.
/// `cross_domain` holds the most recent value written by the visual swatch
/// for each `(bundle, strand)` it exposes (spec §4.3 cross-domain buffer);
/// `microphone_sample` is filled in by the coordinator from the host audio
/// input before evaluating any `play` strand this sample.
pub struct AudioContext<'a> {
    pub sample_index: u64,
    pub sample_rate: f64,
    pub cross_domain: &'a FxHashMap<(String, String), f64>,
    pub microphone_sample: f64,
    pub cache: &'a mut CacheManager,
}

pub type AudioClosure = Box<dyn Fn(&mut AudioContext) -> Result<f64, RuntimeError> + Send + Sync>;

/// One compiled closure per strand of the `play` bundle, plus one per
/// strand this swatch exports to another backend's cross-domain buffer
/// (spec §4.7: "after the callback, copy any audio-domain exported strand
/// values into the cross-domain buffer, sampled at the last sample index").
pub struct AudioProgramSource {
    pub play_strands: Vec<(String, AudioClosure)>,
    pub export_strands: FxHashMap<(String, String), AudioClosure>,
}

fn audio_coord_name(idx: &Expr) -> Result<&'static str, CompilationError> {
    match idx {
        Expr::Param(name) => Domain::Audio
            .coord_order()
            .iter()
            .find(|c| **c == name)
            .copied()
            .ok_or(CompilationError::UnsupportedExpr { backend: "audio", what: "unknown coordinate name" }),
        Expr::Num(k) => Domain::Audio
            .positional_key(k.0 as usize)
            .ok_or(CompilationError::UnsupportedExpr { backend: "audio", what: "coordinate index out of range" }),
        _ => Err(CompilationError::UnsupportedExpr { backend: "audio", what: "non-literal coordinate key" }),
    }
}

fn bool_to_f64(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

pub(crate) fn apply_binop(op: BinOp, a: f64, b: f64) -> f64 {
    match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => a / b,
        BinOp::Mod => a.rem_euclid(b),
        BinOp::Pow => a.powf(b),
        BinOp::Lt => bool_to_f64(a < b),
        BinOp::Gt => bool_to_f64(a > b),
        BinOp::Le => bool_to_f64(a <= b),
        BinOp::Ge => bool_to_f64(a >= b),
        BinOp::Eq => bool_to_f64(a == b),
        BinOp::Ne => bool_to_f64(a != b),
        BinOp::And => bool_to_f64(a != 0.0 && b != 0.0),
        BinOp::Or => bool_to_f64(a != 0.0 || b != 0.0),
    }
}

pub(crate) fn apply_unop(op: UnOp, x: f64) -> f64 {
    match op {
        UnOp::Neg => -x,
        UnOp::Not => bool_to_f64(x == 0.0),
    }
}

/// Numeric dispatch for the closed builtin set (spec §6). Deliberately a
/// runtime string match rather than a precompiled enum — the closure tree
/// is already one indirection per node, and this keeps the builtin table
/// in one place shared in spirit with [`super::visual::visual_builtin_name`].
pub(crate) fn apply_audio_builtin(name: &str, vals: &[f64]) -> f64 {
    match name {
        "sin" => vals[0].sin(),
        "cos" => vals[0].cos(),
        "tan" => vals[0].tan(),
        "asin" => vals[0].asin(),
        "acos" => vals[0].acos(),
        "atan" => vals[0].atan(),
        "atan2" => vals[0].atan2(vals[1]),
        "abs" => vals[0].abs(),
        "floor" => vals[0].floor(),
        "ceil" => vals[0].ceil(),
        "round" => vals[0].round(),
        "sqrt" => vals[0].sqrt(),
        "pow" => vals[0].powf(vals[1]),
        "exp" => vals[0].exp(),
        "log" => vals[0].ln(),
        "log2" => vals[0].log2(),
        "min" => vals[0].min(vals[1]),
        "max" => vals[0].max(vals[1]),
        "clamp" => vals[0].max(vals[1]).min(vals[2]),
        "lerp" | "mix" => vals[0] + (vals[1] - vals[0]) * vals[2],
        "step" => bool_to_f64(vals[1] >= vals[0]),
        "smoothstep" => {
            let t = ((vals[2] - vals[0]) / (vals[1] - vals[0])).clamp(0.0, 1.0);
            t * t * (3.0 - 2.0 * t)
        }
        "fract" => vals[0].fract(),
        "mod" => vals[0].rem_euclid(vals[1]),
        "sign" => vals[0].signum(),
        "noise" => {
            let mut h = vals.iter().fold(0xcbf29ce484222325u64, |acc, v| (acc ^ v.to_bits()).wrapping_mul(0x100000001b3));
            h ^= h >> 33;
            (h as f64 / u64::MAX as f64) * 2.0 - 1.0
        }
        _ => 0.0,
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
) -> Result<AudioClosure, CompilationError> {
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
            Ok(Box::new(move |_ctx: &mut AudioContext| Ok(v)))
        }
        Expr::Param(_) => Err(CompilationError::UnsupportedExpr { backend: "audio", what: "bare parameter outside index position" }),
        Expr::CacheRead(id, _tap) => {
            let id = *id;
            Ok(Box::new(move |ctx: &mut AudioContext| ctx.cache.previous_value(id, 0)))
        }
        Expr::Index(bundle, idx) if bundle == "me" => {
            let coord = audio_coord_name(idx)?;
            match coord {
                "i" => Ok(Box::new(move |ctx: &mut AudioContext| Ok(ctx.sample_index as f64))),
                "t" => Ok(Box::new(move |ctx: &mut AudioContext| Ok(ctx.sample_index as f64 / ctx.sample_rate))),
                "sampleRate" => Ok(Box::new(move |ctx: &mut AudioContext| Ok(ctx.sample_rate))),
                _ => unreachable!("Domain::Audio only defines i/t/sampleRate"),
            }
        }
        Expr::Index(bundle, idx) if !swatch_bundles.contains(bundle) => {
            let strand = program
                .bundle(bundle)
                .and_then(|b| b.resolve_strand(idx))
                .ok_or(CompilationError::UnsupportedExpr { backend: "audio", what: "unresolved cross-domain index" })?;
            let key = (bundle.clone(), strand.name.clone());
            Ok(Box::new(move |ctx: &mut AudioContext| {
                ctx.cross_domain.get(&key).copied().ok_or(RuntimeError::InputProviderUnreachable("cross-domain buffer"))
            }))
        }
        Expr::Index(bundle, idx) => {
            let strand = program
                .bundle(bundle)
                .and_then(|b| b.resolve_strand(idx))
                .ok_or(CompilationError::UnsupportedExpr { backend: "audio", what: "unresolved index reference" })?;
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
            Ok(Box::new(move |ctx: &mut AudioContext| Ok(apply_binop(op, lf(ctx)?, rf(ctx)?))))
        }
        Expr::UnaryOp(op, x) => {
            let xf = build_eval(x, program, swatch_bundles, bundle_name, strand_index, local_ordinal, cache_sites, visiting, depth + 1, max_depth)?;
            let op = *op;
            Ok(Box::new(move |ctx: &mut AudioContext| Ok(apply_unop(op, xf(ctx)?))))
        }
        Expr::Builtin(name, args) if name == "cache" && args.len() == 4 => {
            let ordinal = *local_ordinal;
            *local_ordinal += 1;
            let id = *cache_sites
                .get(&(bundle_name.to_string(), strand_index, ordinal))
                .ok_or(CompilationError::UnsupportedExpr { backend: "audio", what: "cache site missing from index" })?;
            let value_fn = build_eval(&args[0], program, swatch_bundles, bundle_name, strand_index, local_ordinal, cache_sites, visiting, depth + 1, max_depth)?;
            let signal_fn = build_eval(&args[3], program, swatch_bundles, bundle_name, strand_index, local_ordinal, cache_sites, visiting, depth + 1, max_depth)?;
            Ok(Box::new(move |ctx: &mut AudioContext| {
                let signal = signal_fn(ctx)?;
                let value = value_fn(ctx)?;
                ctx.cache.tick(id, 0, value, signal)
            }))
        }
        Expr::Builtin(name, args) if name == "select" && args.len() == 3 => {
            let cond_fn = build_eval(&args[0], program, swatch_bundles, bundle_name, strand_index, local_ordinal, cache_sites, visiting, depth + 1, max_depth)?;
            // Short-circuit (spec §4.5): only the taken branch ever runs, so a
            // branch that fails to build (e.g. an index into a bundle that
            // doesn't exist) must not abort compilation here — defer the
            // error until that branch is actually selected at evaluation time.
            let a_branch = build_eval(&args[1], program, swatch_bundles, bundle_name, strand_index, local_ordinal, cache_sites, visiting, depth + 1, max_depth)
                .map_err(|e| e.to_string());
            let b_branch = build_eval(&args[2], program, swatch_bundles, bundle_name, strand_index, local_ordinal, cache_sites, visiting, depth + 1, max_depth)
                .map_err(|e| e.to_string());
            Ok(Box::new(move |ctx: &mut AudioContext| {
                let branch = if cond_fn(ctx)? != 0.0 { &a_branch } else { &b_branch };
                match branch {
                    Ok(f) => f(ctx),
                    Err(msg) => Err(RuntimeError::UntakenBranchUnresolved(msg.clone())),
                }
            }))
        }
        Expr::Builtin(name, _) if name == "microphone" => Ok(Box::new(|ctx: &mut AudioContext| Ok(ctx.microphone_sample))),
        Expr::Builtin(name, _) if matches!(name.as_str(), "camera" | "texture" | "mouse" | "key" | "text") => {
            Err(CompilationError::UnsupportedExpr { backend: "audio", what: "visual-only hardware builtin" })
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
            Ok(Box::new(move |ctx: &mut AudioContext| {
                let mut vals = Vec::with_capacity(arg_fns.len());
                for f in &arg_fns {
                    vals.push(f(ctx)?);
                }
                Ok(apply_audio_builtin(&name, &vals))
            }))
        }
        Expr::Call(_, _) | Expr::Extract(_, _) => {
            Err(CompilationError::UnsupportedExpr { backend: "audio", what: "Call/Extract survived past transform" })
        }
        Expr::Remap(base, subs) => {
            let inlined = fully_inline(base, program, swatch_bundles, &mut HashSet::new(), 0, max_depth)?;
            let substituted = apply_remap(&inlined, subs, Domain::Audio);
            build_eval(&substituted, program, swatch_bundles, bundle_name, strand_index, local_ordinal, cache_sites, visiting, depth + 1, max_depth)
        }
    }
}

/// Compiles the `play` bundle's strands for one audio [`Swatch`] into a
/// closure tree. `descriptors` is the program-wide cache descriptor list;
/// `cache_sites` recovers each closure's cache id the same way the visual
/// backend does (see [`crate::analysis::index_cache_sites`]).
pub fn generate(
    program: &Program,
    swatch: &Swatch,
    descriptors: &[CacheNodeDescriptor],
    max_inline_depth: u32,
) -> Result<AudioProgramSource, CompilationError> {
    let cache_sites = index_cache_sites(descriptors);
    // Not every audio swatch is a sink (spec §4.3): one that only produces
    // cross-domain output for the visual backend (scenario "audio-reactive
    // visual" with no `play` strand of its own) is legitimate.
    let mut play_strands = Vec::new();
    if swatch.bundles.contains("play") {
        let play = program.bundle("play").ok_or(CompilationError::NoSinkSwatch("audio"))?;
        play_strands.reserve(play.strands.len());
        for strand in &play.strands {
            let mut visiting = HashSet::new();
            let mut local_ordinal = 0u32;
            let closure = build_eval(
                &strand.expr,
                program,
                &swatch.bundles,
                "play",
                strand.index,
                &mut local_ordinal,
                &cache_sites,
                &mut visiting,
                0,
                max_inline_depth,
            )?;
            play_strands.push((strand.name.clone(), closure));
        }
    }

    let mut export_strands = FxHashMap::default();
    for (bundle_name, strand_names) in &swatch.output_buffers {
        let bundle = match program.bundle(bundle_name) {
            Some(b) => b,
            None => continue,
        };
        for strand_name in strand_names {
            let strand = match bundle.strand_by_name(strand_name) {
                Some(s) => s,
                None => continue,
            };
            let mut visiting = HashSet::new();
            let mut local_ordinal = 0u32;
            let closure = build_eval(
                &strand.expr,
                program,
                &swatch.bundles,
                bundle_name,
                strand.index,
                &mut local_ordinal,
                &cache_sites,
                &mut visiting,
                0,
                max_inline_depth,
            )?;
            export_strands.insert((bundle_name.clone(), strand_name.clone()), closure);
        }
    }

    Ok(AudioProgramSource { play_strands, export_strands })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{build_dependency_graph, extract_cache_descriptors, toposort_bundles};
    use crate::ir::{Bundle, Strand};
    use crate::partition::partition;

    fn program_of(bundles: Vec<Bundle>) -> Program {
        let mut map = FxHashMap::default();
        for b in bundles {
            map.insert(b.name.clone(), b);
        }
        Program { bundles: map, spindles: FxHashMap::default(), order: Vec::new(), resources: serde_json::Value::Null }
    }

    fn ctx<'a>(cross_domain: &'a FxHashMap<(String, String), f64>, cache: &'a mut CacheManager) -> AudioContext<'a> {
        AudioContext { sample_index: 0, sample_rate: 44100.0, cross_domain, microphone_sample: 0.0, cache }
    }

    #[test]
    fn sine_tone_evaluates_from_me_t_and_sample_rate() {
        let play = Bundle {
            name: "play".into(),
            strands: vec![Strand {
                name: "v".into(),
                index: 0,
                expr: Expr::Builtin(
                    "sin".into(),
                    vec![Expr::BinaryOp(
                        BinOp::Mul,
                        Box::new(Expr::num(2.0 * std::f64::consts::PI * 440.0)),
                        Box::new(Expr::Index("me".into(), Box::new(Expr::Param("t".into())))),
                    )],
                ),
            }],
        };
        let program = program_of(vec![play]);
        let dep = build_dependency_graph(&program);
        let order = toposort_bundles(&dep).unwrap();
        let descriptors = extract_cache_descriptors(&program, &order);
        let swatches = partition(&program, &order);
        let swatch = swatches.into_iter().find(|s| s.bundles.contains("play")).unwrap();
        let src = generate(&program, &swatch, &descriptors, 512).unwrap();

        let cross = FxHashMap::default();
        let mut mgr = CacheManager::new();
        let mut c = ctx(&cross, &mut mgr);
        c.sample_index = 50;
        let (_, closure) = &src.play_strands[0];
        let got = closure(&mut c).unwrap();
        let expected = (2.0 * std::f64::consts::PI * 440.0 * (50.0 / 44100.0)).sin();
        assert!((got - expected).abs() < 1e-9);
    }

    #[test]
    fn select_short_circuits_the_untaken_branch() {
        let play = Bundle {
            name: "play".into(),
            strands: vec![Strand {
                name: "v".into(),
                index: 0,
                expr: Expr::Builtin(
                    "select".into(),
                    vec![
                        Expr::num(1.0),
                        Expr::num(5.0),
                        Expr::Index("missing".into(), Box::new(Expr::Param("v".into()))),
                    ],
                ),
            }],
        };
        let program = program_of(vec![play]);
        let dep = build_dependency_graph(&program);
        let order = toposort_bundles(&dep).unwrap();
        let descriptors = extract_cache_descriptors(&program, &order);
        let swatches = partition(&program, &order);
        let swatch = swatches.into_iter().find(|s| s.bundles.contains("play")).unwrap();
        let src = generate(&program, &swatch, &descriptors, 512).unwrap();

        let cross = FxHashMap::default();
        let mut mgr = CacheManager::new();
        let mut c = ctx(&cross, &mut mgr);
        let (_, closure) = &src.play_strands[0];
        // the untaken branch references a bundle that doesn't exist at all;
        // it never gets built or evaluated, so this returns 5.0 instead of erroring.
        assert_eq!(closure(&mut c).unwrap(), 5.0);
    }

    #[test]
    fn cache_closure_accumulates_like_the_cache_manager_directly() {
        let value = Expr::BinaryOp(
            BinOp::Mul,
            Box::new(Expr::Index("echo".into(), Box::new(Expr::Param("v".into())))),
            Box::new(Expr::num(0.5)),
        );
        let signal = Expr::Index("me".into(), Box::new(Expr::Param("i".into())));
        let cache_expr = Expr::Builtin("cache".into(), vec![value, Expr::num(2.0), Expr::num(1.0), signal]);
        let echo = Bundle { name: "echo".into(), strands: vec![Strand { name: "v".into(), index: 0, expr: cache_expr }] };
        let play = Bundle {
            name: "play".into(),
            strands: vec![Strand { name: "v".into(), index: 0, expr: Expr::Index("echo".into(), Box::new(Expr::Param("v".into()))) }],
        };
        let program = program_of(vec![echo, play]);
        let dep = build_dependency_graph(&program);
        let order = toposort_bundles(&dep).unwrap();
        let descriptors = extract_cache_descriptors(&program, &order);
        let rewritten = crate::analysis::insert_cache_reads(&program, &order, &descriptors);
        let swatches = partition(&rewritten, &order);
        let swatch = swatches.into_iter().find(|s| s.bundles.contains("play")).unwrap();
        let src = generate(&rewritten, &swatch, &descriptors, 512).unwrap();

        let cross = FxHashMap::default();
        let mut mgr = CacheManager::new();
        mgr.register(&descriptors[0], 1);
        let (_, closure) = &src.play_strands[0];
        let mut c = ctx(&cross, &mut mgr);
        c.sample_index = 0;
        let first = closure(&mut c).unwrap();
        assert_eq!(first, 0.0);
        let mut c = ctx(&cross, &mut mgr);
        c.sample_index = 1;
        let second = closure(&mut c).unwrap();
        assert_eq!(second, 0.0);
    }
}
