//! Runtime orchestration (spec §4.7): owns cache storage and cross-domain
//! buffers across recompiles and drives the per-tick/per-sample dispatch
//! loop. The concrete GPU and audio device APIs are out of scope (spec's
//! non-goals) — this module treats them as the abstract [`VisualDispatch`]
//! and [`SampleSink`] collaborators a host implements and hands in.
use crate::analysis::{
    build_dependency_graph, extract_cache_descriptors, insert_cache_reads, toposort_bundles, BackendId,
    CacheNodeDescriptor, Storage,
};
use crate::cache::CacheManager;
use crate::codegen::audio::{AudioContext, AudioProgramSource};
use crate::codegen::scalar_cache::{ScalarCacheClosure, ScalarCacheContext};
use crate::codegen::visual::VisualKernelSource;
use crate::codegen::{audio, scalar_cache, visual};
use crate::config::CoordinatorConfig;
use crate::error::{ResourceError, RuntimeError, WeftResult};
use crate::ir::Program;
use crate::partition::{partition, Swatch};
use crate::transform::{inline_all_calls, rewrite_all_temporal_remaps};
use fxhash::FxHashMap;
use log::error;

/// Host-provided GPU dispatch abstraction (spec §1: the concrete GPU API is
/// treated as an abstract "compute dispatch"). The coordinator never
/// interprets kernel source text itself, only orchestrates *when* each
/// kernel runs and what it's handed.
pub trait VisualDispatch {
    fn run_intermediate(&mut self, index: usize, source: &str, scalar_cache: &[f64]) -> Result<(), ResourceError>;
    fn run_display(&mut self, source: &str, cross_buffer: &[f64], scalar_cache: &[f64]) -> Result<(), ResourceError>;
    fn present(&mut self) -> Result<(), ResourceError>;
}

/// Host-provided sink for the audio backend's own native closures — unlike
/// the visual side there is no text to dispatch, only samples to deliver.
pub trait SampleSink {
    fn write_sample(&mut self, channel_name: &str, sample_index: u64, value: f64) -> Result<(), ResourceError>;
}

/// Host-provided input for the `microphone` builtin.
pub trait InputProvider {
    fn microphone_sample(&self, sample_index: u64) -> Result<f64, RuntimeError>;
}

pub struct VisualUnit {
    pub source: VisualKernelSource,
    pub swatch: Swatch,
    /// One closure per `Storage::Scalar` cache this swatch owns, CPU-ticked
    /// once per frame ahead of kernel dispatch (spec §4.6, §4.7).
    pub scalar_caches: Vec<(u32, ScalarCacheClosure)>,
}

pub struct AudioUnit {
    pub source: AudioProgramSource,
    pub swatch: Swatch,
}

/// A fully compiled program (spec §3 "compiled unit"). Non-owning of any
/// runtime buffers — cache storage and cross-domain state live exclusively
/// on the [`Coordinator`], so a recompile builds a new `CompiledUnit` and
/// the coordinator only swaps it in, and allocates fresh cache storage for
/// it, once compilation fully succeeds (spec §9).
pub struct CompiledUnit {
    pub visual: Option<VisualUnit>,
    pub audio: Option<AudioUnit>,
    pub descriptors: Vec<CacheNodeDescriptor>,
}

/// Runs the full pipeline (spec §2: IR -> Analysis -> Transform -> Partition
/// -> Codegen) over an already-parsed [`Program`]. Spindle inlining and the
/// temporal-remap-to-cache rewrite are transform-stage passes that must run
/// *before* the dependency graph is built and cache descriptors are
/// extracted: in their pre-rewrite form neither a `Call`/`Extract`
/// placeholder nor a `me.t`-keyed remap contributes a dependency edge or a
/// cache descriptor (spec §4.2, §8 "Cycle discipline").
pub fn compile(program: &Program, config: &CoordinatorConfig) -> WeftResult<CompiledUnit> {
    let inlined = inline_all_calls(program, config.max_inline_depth)?;
    let temporal = rewrite_all_temporal_remaps(&inlined);

    let dep = build_dependency_graph(&temporal);
    let order = toposort_bundles(&dep)?;
    let descriptors = extract_cache_descriptors(&temporal, &order);
    let with_cache_reads = insert_cache_reads(&temporal, &order, &descriptors);

    let swatches = partition(&with_cache_reads, &order);

    let mut visual_unit = None;
    let mut audio_unit = None;
    for swatch in swatches {
        match swatch.backend_id {
            BackendId::Visual => {
                let source = visual::generate(&with_cache_reads, &swatch, &descriptors, config.max_inline_depth)?;
                let scalar_caches =
                    scalar_cache::generate(&with_cache_reads, &swatch, &descriptors, config.max_inline_depth)?;
                visual_unit = Some(VisualUnit { source, swatch, scalar_caches });
            }
            BackendId::Audio => {
                let source = audio::generate(&with_cache_reads, &swatch, &descriptors, config.max_inline_depth)?;
                audio_unit = Some(AudioUnit { source, swatch });
            }
        }
    }

    Ok(CompiledUnit { visual: visual_unit, audio: audio_unit, descriptors })
}

fn num_cells_for(descriptor: &CacheNodeDescriptor, config: &CoordinatorConfig) -> usize {
    match descriptor.storage {
        Storage::Scalar => 1,
        Storage::PixelAddressed => config.pixel_count(),
    }
}

/// Owns a compiled unit's runtime state: cache storage and the cross-domain
/// buffer shared between the visual and audio swatches (spec §4.7, §5).
/// Exactly one `Coordinator` exists per running program; recompiling
/// replaces `compiled` and `cache` together so a reader of either always
/// sees a consistent pair.
pub struct Coordinator {
    config: CoordinatorConfig,
    compiled: Option<CompiledUnit>,
    cache: CacheManager,
    cross_domain: FxHashMap<(String, String), f64>,
    last_sample_index: u64,
    time: f64,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Coordinator {
            config,
            compiled: None,
            cache: CacheManager::new(),
            cross_domain: FxHashMap::default(),
            last_sample_index: 0,
            time: 0.0,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn compiled(&self) -> Option<&CompiledUnit> {
        self.compiled.as_ref()
    }

    /// Compiles `program`, registers a fresh [`CacheManager`] for it, and
    /// only then swaps it in for the previous compiled unit — a failed
    /// compile leaves the coordinator serving the prior program unchanged
    /// (spec §9's "old buffers are released only after the new compiled
    /// unit is swapped in").
    pub fn recompile(&mut self, program: &Program) -> WeftResult<()> {
        let unit = compile(program, &self.config)?;
        let mut cache = CacheManager::new();
        for descriptor in &unit.descriptors {
            cache.register(descriptor, num_cells_for(descriptor, &self.config));
        }
        self.compiled = Some(unit);
        self.cache = cache;
        self.cross_domain.clear();
        Ok(())
    }

    /// One visual frame (spec §4.7): CPU-tick every scalar cache this
    /// swatch owns, then run every intermediate kernel in order, then the
    /// display kernel, handing the host a snapshot of the cross-domain
    /// buffer (and the just-ticked scalar cache buffer) flattened by the
    /// swatch's stable slot assignments so `dispatch` can bind each as a
    /// single GPU buffer.
    ///
    /// A [`RuntimeError`] raised while ticking a scalar cache is logged and
    /// drops the rest of this frame rather than propagating, mirroring
    /// [`Coordinator::tick_audio`]'s policy (spec §7).
    pub fn tick_visual(&mut self, time: f64, dispatch: &mut dyn VisualDispatch) -> WeftResult<()> {
        self.time = time;
        let unit = match self.compiled.as_ref().and_then(|c| c.visual.as_ref()) {
            Some(u) => u,
            None => return Ok(()),
        };

        let mut scalar_buf = vec![0.0; unit.source.scalar_cache_slots.len()];
        {
            let mut ctx = ScalarCacheContext {
                time,
                width: self.config.width as f64,
                height: self.config.height as f64,
                cross_domain: &self.cross_domain,
                cache: &mut self.cache,
            };
            for (id, closure) in &unit.scalar_caches {
                let value = match closure(&mut ctx) {
                    Ok(v) => v,
                    Err(e) => {
                        error!("visual tick dropped ticking scalar cache {}: {}", id, e);
                        return Ok(());
                    }
                };
                if let Some(slot) = unit.source.scalar_cache_slots.get(id) {
                    scalar_buf[*slot] = value;
                }
            }
        }

        for (index, source) in unit.source.intermediate_kernels.iter().enumerate() {
            dispatch.run_intermediate(index, source, &scalar_buf)?;
        }
        let mut flat = vec![0.0; unit.source.cross_domain_slots.len()];
        for (key, slot) in &unit.source.cross_domain_slots {
            flat[*slot] = self.cross_domain.get(key).copied().unwrap_or(0.0);
        }
        dispatch.run_display(&unit.source.display_kernel, &flat, &scalar_buf)?;
        dispatch.present()?;
        Ok(())
    }

    /// One audio callback of `frame_count` samples (spec §4.7): evaluate
    /// every `play` strand's closure per sample and deliver it to `sink`;
    /// after the last sample, refresh any cross-domain exports this swatch
    /// produces, sampled at that final sample index.
    ///
    /// A [`RuntimeError`] raised mid-callback (a bad cache read, an
    /// unreachable input provider) is logged and drops the rest of this
    /// tick rather than propagating — a persistent error should stop only
    /// the affected backend, not the whole coordinator (spec §7). A
    /// [`ResourceError`] from `sink` is a host/device failure and still
    /// propagates via `?`.
    pub fn tick_audio(
        &mut self,
        frame_count: u64,
        start_sample: u64,
        input: &dyn InputProvider,
        sink: &mut dyn SampleSink,
    ) -> WeftResult<()> {
        let unit = match self.compiled.as_ref().and_then(|c| c.audio.as_ref()) {
            Some(u) => u,
            None => return Ok(()),
        };
        let sample_rate = self.config.sample_rate;
        let cross_domain = &self.cross_domain;
        let cache = &mut self.cache;
        let mut last_index = start_sample;
        for i in 0..frame_count {
            let sample_index = start_sample + i;
            let microphone_sample = match input.microphone_sample(sample_index) {
                Ok(v) => v,
                Err(e) => {
                    error!("audio tick dropped at sample {}: {}", sample_index, e);
                    return Ok(());
                }
            };
            let mut ctx = AudioContext { sample_index, sample_rate, cross_domain, microphone_sample, cache: &mut *cache };
            for (channel, closure) in &unit.source.play_strands {
                let value = match closure(&mut ctx) {
                    Ok(v) => v,
                    Err(e) => {
                        error!("audio tick dropped at sample {}: {}", sample_index, e);
                        return Ok(());
                    }
                };
                sink.write_sample(channel, sample_index, value)?;
            }
            last_index = sample_index;
        }
        self.last_sample_index = last_index;

        let last_microphone_sample = match input.microphone_sample(last_index) {
            Ok(v) => v,
            Err(e) => {
                error!("audio tick dropped refreshing cross-domain exports at sample {}: {}", last_index, e);
                return Ok(());
            }
        };
        let mut ctx = AudioContext {
            sample_index: last_index,
            sample_rate,
            cross_domain,
            microphone_sample: last_microphone_sample,
            cache: &mut *cache,
        };
        let mut exported = FxHashMap::default();
        for (key, closure) in &unit.source.export_strands {
            match closure(&mut ctx) {
                Ok(v) => {
                    exported.insert(key.clone(), v);
                }
                Err(e) => {
                    error!("audio tick dropped refreshing export {:?}: {}", key, e);
                    return Ok(());
                }
            }
        }
        for (key, value) in exported {
            self.cross_domain.insert(key, value);
        }
        Ok(())
    }
}
