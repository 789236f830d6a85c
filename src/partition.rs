//! Partitioner (spec §4.3): groups bundles into per-backend swatches and
//! infers the cross-domain buffer interfaces between them.
use crate::analysis::{infer_ownership, BackendId};
use crate::ir::Program;
use fxhash::FxHashMap;
use log::debug;
use std::collections::HashSet;

/// A per-backend compilation unit (spec §3 `Swatch`).
#[derive(Debug, Clone)]
pub struct Swatch {
    pub id: u32,
    pub backend_id: BackendId,
    pub bundles: HashSet<String>,
    /// `otherBackendBundle -> [strand names]` read from a different backend's swatch.
    pub input_buffers: FxHashMap<String, Vec<String>>,
    /// strands of this swatch's bundles consumed by another swatch.
    pub output_buffers: FxHashMap<String, Vec<String>>,
    pub is_sink: bool,
    pub execution_order: Vec<String>,
}

fn is_sink_name(name: &str) -> bool {
    name == "display" || name == "play" || name.starts_with("scope") || name.starts_with("probe")
}

fn reachable_bundles(program: &Program, roots: &[String]) -> HashSet<String> {
    let mut seen = HashSet::new();
    let mut stack: Vec<String> = roots.to_vec();
    while let Some(n) = stack.pop() {
        if !seen.insert(n.clone()) {
            continue;
        }
        if let Some(bundle) = program.bundle(&n) {
            for strand in &bundle.strands {
                let mut refs = Vec::new();
                strand.expr.collect_index_refs(&mut refs);
                for (b, _) in refs {
                    if b != "me" && program.bundles.contains_key(b) {
                        stack.push(b.to_string());
                    }
                }
            }
        }
    }
    seen
}

/// Groups the program's bundles into at most one swatch per backend.
/// Pure bundles (no owning backend) are duplicated into every consumer
/// backend that transitively needs them, per spec §4.3.
pub fn partition(program: &Program, toposort_order: &[String]) -> Vec<Swatch> {
    let sinks: Vec<String> = program.bundles.keys().filter(|n| is_sink_name(n)).cloned().collect();
    let reachable = reachable_bundles(program, &sinks);

    let mut owner: FxHashMap<String, Option<BackendId>> = FxHashMap::default();
    for name in &reachable {
        owner.insert(name.clone(), infer_ownership(program, name));
    }

    let mut members: FxHashMap<BackendId, HashSet<String>> = FxHashMap::default();
    members.insert(BackendId::Visual, HashSet::new());
    members.insert(BackendId::Audio, HashSet::new());

    for name in &reachable {
        if let Some(id) = owner[name] {
            members.get_mut(&id).unwrap().insert(name.clone());
        }
    }

    for id in [BackendId::Visual, BackendId::Audio] {
        let mut changed = true;
        while changed {
            changed = false;
            let current: Vec<String> = members[&id].iter().cloned().collect();
            for bname in current {
                let bundle = match program.bundle(&bname) {
                    Some(b) => b,
                    None => continue,
                };
                for strand in &bundle.strands {
                    let mut refs = Vec::new();
                    strand.expr.collect_index_refs(&mut refs);
                    for (b, _) in refs {
                        if b == "me" || !reachable.contains(b) {
                            continue;
                        }
                        if owner.get(b).copied().flatten().is_none()
                            && members.get_mut(&id).unwrap().insert(b.to_string())
                        {
                            changed = true;
                        }
                    }
                }
            }
        }
    }

    let mut swatches = Vec::new();
    let mut next_id = 0u32;
    for id in [BackendId::Visual, BackendId::Audio] {
        let bundle_set = &members[&id];
        if bundle_set.is_empty() {
            continue;
        }
        let execution_order: Vec<String> =
            toposort_order.iter().filter(|b| bundle_set.contains(*b)).cloned().collect();

        let mut input_buffers: FxHashMap<String, Vec<String>> = FxHashMap::default();
        for bname in bundle_set {
            let bundle = match program.bundle(bname) {
                Some(b) => b,
                None => continue,
            };
            for strand in &bundle.strands {
                let mut refs = Vec::new();
                strand.expr.collect_index_refs(&mut refs);
                for (b, idx) in refs {
                    if b == "me" {
                        continue;
                    }
                    if let Some(other_id) = owner.get(b).copied().flatten() {
                        if other_id != id {
                            if let Some(strand2) = program.bundle(b).and_then(|ob| ob.resolve_strand(idx)) {
                                input_buffers.entry(b.to_string()).or_insert_with(Vec::new).push(strand2.name.clone());
                            }
                        }
                    }
                }
            }
        }
        for v in input_buffers.values_mut() {
            v.sort();
            v.dedup();
        }

        debug!("{} swatch: {} bundles, {} cross-domain inputs", id.name(), bundle_set.len(), input_buffers.len());

        swatches.push(Swatch {
            id: next_id,
            backend_id: id,
            bundles: bundle_set.clone(),
            input_buffers,
            output_buffers: FxHashMap::default(),
            is_sink: bundle_set.iter().any(|b| is_sink_name(b)),
            execution_order,
        });
        next_id += 1;
    }

    // Second pass: output_buffers is the dual of every other swatch's input_buffers.
    let snapshot: Vec<(u32, FxHashMap<String, Vec<String>>)> =
        swatches.iter().map(|s| (s.id, s.input_buffers.clone())).collect();
    for swatch in &mut swatches {
        let mut outputs: FxHashMap<String, Vec<String>> = FxHashMap::default();
        for (other_id, inputs) in &snapshot {
            if *other_id == swatch.id {
                continue;
            }
            for (bundle, strands) in inputs {
                if swatch.bundles.contains(bundle) {
                    outputs.entry(bundle.clone()).or_insert_with(Vec::new).extend(strands.iter().cloned());
                }
            }
        }
        for v in outputs.values_mut() {
            v.sort();
            v.dedup();
        }
        swatch.output_buffers = outputs;
    }

    swatches
}
