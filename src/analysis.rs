//! Analysis passes (spec §4.2): dependency graph + toposort,
//! backend-ownership inference, purity/statefulness classification, and
//! cache-descriptor extraction.
use crate::error::AnalysisError;
use crate::ir::{Bundle, Expr, Program, Strand, StrandKey, EXTERNAL_BUILTINS};
use crate::transform::free_references_strand;
use fxhash::FxHashMap;
use log::{debug, trace};
use petgraph::algo::toposort;
use petgraph::graph::{Graph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Directed;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendId {
    Visual,
    Audio,
}

impl BackendId {
    pub fn owned_hardware(self) -> &'static [&'static str] {
        match self {
            BackendId::Visual => &["camera", "gpu", "display"],
            BackendId::Audio => &["microphone", "speaker"],
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BackendId::Visual => "visual",
            BackendId::Audio => "audio",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Purity {
    Pure,
    Stateful,
    External,
}

fn contains_cache_read(expr: &Expr) -> bool {
    if matches!(expr, Expr::CacheRead(_, _)) {
        return true;
    }
    let mut found = false;
    expr.for_each_child(|c| found |= contains_cache_read(c));
    found
}

/// Purity of a single strand expression (spec §4.2): `External` subsumes
/// `Stateful` subsumes `Pure`.
pub fn classify_strand(expr: &Expr) -> Purity {
    let mut builtins = Vec::new();
    expr.collect_builtins(&mut builtins);
    if builtins.iter().any(|b| EXTERNAL_BUILTINS.contains(&b.as_str())) {
        Purity::External
    } else if contains_cache_read(expr) || builtins.iter().any(|b| b == "cache") {
        Purity::Stateful
    } else {
        Purity::Pure
    }
}

pub fn classify_bundle(bundle: &Bundle) -> Purity {
    bundle
        .strands
        .iter()
        .map(|s| classify_strand(&s.expr))
        .max()
        .unwrap_or(Purity::Pure)
}

/// Hardware tag required directly by a builtin, if any. `mouse`/`key`/`text`
/// are host-input builtins surfaced only through the visual frontend in
/// this design (see DESIGN.md), so they tag `"display"`.
fn builtin_hardware(name: &str) -> Option<&'static str> {
    match name {
        "camera" => Some("camera"),
        "microphone" => Some("microphone"),
        "texture" => Some("gpu"),
        "mouse" | "key" | "text" => Some("display"),
        _ => None,
    }
}

/// Direct hardware set of a bundle: its own builtins' hardware plus the
/// implicit sink tags (`display` for the `display` bundle, `speaker` for
/// `play`). Deliberately *not* transitive through referenced bundles — a
/// bundle that merely reads another backend's output is a cross-domain
/// consumer (spec §4.4.6), not a co-owner of that backend's hardware; a
/// bundle with no direct hardware of its own stays pure and gets
/// duplicated into whichever backend(s) actually need it (spec §4.3).
pub fn bundle_hardware(program: &Program, bundle_name: &str) -> HashSet<&'static str> {
    let mut hw = HashSet::new();
    if bundle_name == "display" {
        hw.insert("display");
    }
    if bundle_name == "play" {
        hw.insert("speaker");
    }
    if let Some(bundle) = program.bundle(bundle_name) {
        for strand in &bundle.strands {
            let mut builtins = Vec::new();
            strand.expr.collect_builtins(&mut builtins);
            for b in &builtins {
                if let Some(tag) = builtin_hardware(b) {
                    hw.insert(tag);
                }
            }
        }
    }
    hw
}

/// Backend owning `bundle_name`, or `None` if the bundle is pure (empty
/// hardware set) and may be duplicated into any consumer backend.
pub fn infer_ownership(program: &Program, bundle_name: &str) -> Option<BackendId> {
    let hw = bundle_hardware(program, bundle_name);
    if hw.is_empty() {
        return None;
    }
    [BackendId::Visual, BackendId::Audio]
        .into_iter()
        .find(|id| hw.iter().all(|h| id.owned_hardware().contains(h)))
}

/// Nodes are bundle names; an edge `producer -> consumer` is added for
/// every `Index(producer, _)` occurring in `consumer`'s strands, tagged
/// `cache_protected` when that reference occurs inside a `cache` builtin
/// call anywhere in the consumer's strand (spec §4.2: "cycles are
/// permitted only when every cycle edge passes through a `cache`
/// builtin").
pub struct DependencyGraph {
    pub graph: Graph<String, bool, Directed>,
    pub index_of: FxHashMap<String, NodeIndex>,
}

fn collect_cache_protected_bundles(expr: &Expr, out: &mut HashSet<String>) {
    if let Expr::Builtin(name, args) = expr {
        if name == "cache" {
            for a in args {
                let mut refs = Vec::new();
                a.collect_index_refs(&mut refs);
                for (b, _) in refs {
                    if b != "me" {
                        out.insert(b.to_string());
                    }
                }
            }
        }
    }
    expr.for_each_child(|c| collect_cache_protected_bundles(c, out));
}

pub fn build_dependency_graph(program: &Program) -> DependencyGraph {
    trace!("building dependency graph over {} bundles", program.bundles.len());
    let mut graph = Graph::<String, bool, Directed>::new();
    let mut index_of = FxHashMap::default();
    for name in program.bundles.keys() {
        let idx = graph.add_node(name.clone());
        index_of.insert(name.clone(), idx);
    }
    for (name, bundle) in &program.bundles {
        let mut protected = HashSet::new();
        for strand in &bundle.strands {
            collect_cache_protected_bundles(&strand.expr, &mut protected);
        }
        let mut added = HashSet::new();
        for strand in &bundle.strands {
            let mut refs = Vec::new();
            strand.expr.collect_index_refs(&mut refs);
            for (b, _) in refs {
                if b == "me" || !program.bundles.contains_key(b) {
                    continue;
                }
                if added.insert(b.to_string()) {
                    let is_protected = protected.contains(b);
                    graph.add_edge(index_of[b], index_of[name], is_protected);
                }
            }
        }
    }
    DependencyGraph { graph, index_of }
}

/// Topological order of bundles. A cycle surviving after cache-protected
/// edges are dropped is a genuine `AnalysisError::NonCacheCycle` — by
/// construction, any cycle in the full graph that disappears once
/// cache-protected edges are removed necessarily had at least one such
/// edge (spec §8, "Cycle discipline").
pub fn toposort_bundles(dep: &DependencyGraph) -> Result<Vec<String>, AnalysisError> {
    let mut reduced = Graph::<String, (), Directed>::new();
    let mut idx_map = FxHashMap::default();
    for node in dep.graph.node_indices() {
        let name = dep.graph[node].clone();
        idx_map.insert(name.clone(), reduced.add_node(name));
    }
    for edge in dep.graph.edge_references() {
        if !*edge.weight() {
            let src = dep.graph[edge.source()].clone();
            let dst = dep.graph[edge.target()].clone();
            reduced.add_edge(idx_map[&src], idx_map[&dst], ());
        }
    }
    toposort(&reduced, None)
        .map(|order| {
            let order: Vec<String> = order.into_iter().map(|i| reduced[i].clone()).collect();
            debug!("toposort order: {:?}", order);
            order
        })
        .map_err(|cycle| AnalysisError::NonCacheCycle { bundles: vec![reduced[cycle.node_id()].clone()] })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    Scalar,
    PixelAddressed,
}

/// Compile-time record of a cache's identity, shape, and logical buffer
/// handles (spec §3 `CacheNodeDescriptor`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNodeDescriptor {
    pub id: u32,
    pub bundle_name: String,
    pub strand_index: u32,
    pub backend_id: BackendId,
    pub storage: Storage,
    pub history_size: u32,
    pub tap_index: u32,
    pub value_expr: Expr,
    pub signal_expr: Expr,
    pub has_self_reference: bool,
}

fn as_u32_literal(expr: &Expr) -> Option<u32> {
    match expr {
        Expr::Num(v) if v.0 >= 0.0 && v.0.fract() == 0.0 => Some(v.0 as u32),
        _ => None,
    }
}

/// A value/signal expression is spatially uniform (coordinate-free) when
/// it never reads the visual free coordinates `me.x`/`me.y` — such caches
/// use scalar storage even on the visual backend (spec §4.6).
fn is_spatially_uniform(expr: &Expr) -> bool {
    let mut refs = Vec::new();
    expr.collect_index_refs(&mut refs);
    !refs
        .iter()
        .any(|(b, idx)| *b == "me" && matches!(idx, Expr::Param(p) if p == "x" || p == "y"))
}

fn walk_for_cache(
    expr: &Expr,
    program: &Program,
    bundle_name: &str,
    strand: &Strand,
    next_id: &mut u32,
    out: &mut Vec<CacheNodeDescriptor>,
) {
    if let Expr::Builtin(name, args) = expr {
        if name == "cache" && args.len() == 4 {
            let history_size = as_u32_literal(&args[1]).expect("historySize validated at parse time");
            let tap_index = as_u32_literal(&args[2]).expect("tapIndex validated at parse time");
            let strand_key: StrandKey = (bundle_name.to_string(), strand.name.clone());
            let has_self_reference = free_references_strand(&args[0], program, &strand_key);
            let backend_id = infer_ownership(program, bundle_name).unwrap_or(BackendId::Visual);
            let uniform = is_spatially_uniform(&args[0]) && is_spatially_uniform(&args[3]);
            // Audio caches are always scalar; visual caches are pixel-addressed
            // unless their value/signal never touch a spatial coordinate (spec §4.6).
            let storage = match backend_id {
                BackendId::Visual if uniform => Storage::Scalar,
                BackendId::Visual => Storage::PixelAddressed,
                BackendId::Audio => Storage::Scalar,
            };
            out.push(CacheNodeDescriptor {
                id: *next_id,
                bundle_name: bundle_name.to_string(),
                strand_index: strand.index,
                backend_id,
                storage,
                history_size,
                tap_index,
                value_expr: args[0].clone(),
                signal_expr: args[3].clone(),
                has_self_reference,
            });
            *next_id += 1;
        }
        for a in args {
            walk_for_cache(a, program, bundle_name, strand, next_id, out);
        }
        return;
    }
    expr.for_each_child(|c| walk_for_cache(c, program, bundle_name, strand, next_id, out));
}

/// Allocates a stable `id` per `cache` builtin call site, in toposort
/// order, so ids are deterministic across a single compile (spec §4.2).
pub fn extract_cache_descriptors(program: &Program, toposort_order: &[String]) -> Vec<CacheNodeDescriptor> {
    let mut out = Vec::new();
    let mut next_id = 0u32;
    for bundle_name in toposort_order {
        let bundle = match program.bundle(bundle_name) {
            Some(b) => b,
            None => continue,
        };
        for strand in &bundle.strands {
            walk_for_cache(&strand.expr, program, bundle_name, strand, &mut next_id, &mut out);
        }
    }
    out
}

/// Self-references always read `history[slot 0]` (spec §4.4.4), never the
/// cache's own configured `tapIndex` — so `CacheRead`'s tap field is
/// hardcoded to `0` here regardless of the owning cache's `tapIndex`.
/// Maps `(bundleName, strandIndex, ordinal)` — the `ordinal`-th `cache`
/// builtin call site encountered in that strand's pre-order walk — to the
/// descriptor id assigned at that site. Stable across the
/// [`insert_cache_reads`] rewrite (it only touches the *inside* of a
/// value expression, never adds or removes call sites), so codegen can
/// recover a cache's id by re-walking the post-rewrite program without
/// needing a program-wide counter that would desync once bundles are
/// split across swatches.
pub fn index_cache_sites(descriptors: &[CacheNodeDescriptor]) -> FxHashMap<(String, u32, u32), u32> {
    let mut map = FxHashMap::default();
    let mut ordinal: FxHashMap<(String, u32), u32> = FxHashMap::default();
    for d in descriptors {
        let key = (d.bundle_name.clone(), d.strand_index);
        let n = ordinal.entry(key).or_insert(0);
        map.insert((d.bundle_name.clone(), d.strand_index, *n), d.id);
        *n += 1;
    }
    map
}

pub(crate) fn replace_self_reference(expr: &Expr, program: &Program, strand_key: &StrandKey, cache_id: u32) -> Expr {
    match expr {
        Expr::Index(bundle, idx) => {
            let is_self = program
                .bundle(bundle)
                .and_then(|b| b.resolve_strand(idx))
                .map(|s| *bundle == strand_key.0 && s.name == strand_key.1)
                .unwrap_or(false);
            if is_self {
                Expr::CacheRead(cache_id, 0)
            } else {
                expr.clone()
            }
        }
        _ => expr.clone().map_children(|c| replace_self_reference(&c, program, strand_key, cache_id)),
    }
}

/// Mirrors [`extract_cache_descriptors`]'s traversal exactly (same
/// pre-order walk over the same toposort-ordered strands) so that the
/// `next_id` counter lines up id-for-id with the descriptors it consumes.
fn rewrite_for_cache_reads(
    expr: &Expr,
    program: &Program,
    strand_key: &StrandKey,
    next_id: &mut u32,
    descriptors: &[CacheNodeDescriptor],
) -> Expr {
    if let Expr::Builtin(name, args) = expr {
        if name == "cache" && args.len() == 4 {
            let id = *next_id;
            *next_id += 1;
            let rewritten_args: Vec<Expr> =
                args.iter().map(|a| rewrite_for_cache_reads(a, program, strand_key, next_id, descriptors)).collect();
            let descriptor = &descriptors[id as usize];
            let value = if descriptor.has_self_reference {
                replace_self_reference(&rewritten_args[0], program, strand_key, id)
            } else {
                rewritten_args[0].clone()
            };
            return Expr::Builtin(
                "cache".to_string(),
                vec![value, rewritten_args[1].clone(), rewritten_args[2].clone(), rewritten_args[3].clone()],
            );
        }
        let rewritten: Vec<Expr> =
            args.iter().map(|a| rewrite_for_cache_reads(a, program, strand_key, next_id, descriptors)).collect();
        return Expr::Builtin(name.clone(), rewritten);
    }
    expr.clone().map_children(|c| rewrite_for_cache_reads(&c, program, strand_key, next_id, descriptors))
}

/// Materializes `Expr::CacheRead` at every self-referential point inside a
/// cache's own value expression (spec §3: "`CacheRead` appears only where
/// a cache's value expression transitively references its own strand").
/// Must run after [`extract_cache_descriptors`] over the same
/// `toposort_order`, whose output feeds this pass's `descriptors`.
pub fn insert_cache_reads(program: &Program, toposort_order: &[String], descriptors: &[CacheNodeDescriptor]) -> Program {
    let mut bundles = program.bundles.clone();
    let mut next_id = 0u32;
    for bundle_name in toposort_order {
        let original = match program.bundle(bundle_name) {
            Some(b) => b,
            None => continue,
        };
        let rewritten_strands: Vec<Strand> = original
            .strands
            .iter()
            .map(|strand| {
                let key: StrandKey = (bundle_name.clone(), strand.name.clone());
                Strand {
                    name: strand.name.clone(),
                    index: strand.index,
                    expr: rewrite_for_cache_reads(&strand.expr, program, &key, &mut next_id, descriptors),
                }
            })
            .collect();
        bundles.insert(bundle_name.clone(), Bundle { name: bundle_name.clone(), strands: rewritten_strands });
    }
    Program { bundles, spindles: program.spindles.clone(), order: program.order.clone(), resources: program.resources.clone() }
}
