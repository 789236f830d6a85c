//! End-to-end scenarios driven through the public API: parse IR JSON, run
//! the full compile pipeline, and exercise the compiled unit the way a host
//! embedding the coordinator would. The visual backend only ever emits
//! kernel source text (no GPU to run it against here), so visual scenarios
//! assert on generated source; audio scenarios run the real closures.
use weft::coordinator::{InputProvider, SampleSink, VisualDispatch};
use weft::error::{ResourceError, RuntimeError};
use weft::{compile_source, Coordinator, CoordinatorConfig};

struct RecordingDispatch {
    display_source: String,
    last_cross_buffer: Vec<f64>,
    last_scalar_cache: Vec<f64>,
    intermediates: Vec<String>,
}

impl VisualDispatch for RecordingDispatch {
    fn run_intermediate(&mut self, _index: usize, source: &str, _scalar_cache: &[f64]) -> Result<(), ResourceError> {
        self.intermediates.push(source.to_string());
        Ok(())
    }
    fn run_display(&mut self, source: &str, cross_buffer: &[f64], scalar_cache: &[f64]) -> Result<(), ResourceError> {
        self.display_source = source.to_string();
        self.last_cross_buffer = cross_buffer.to_vec();
        self.last_scalar_cache = scalar_cache.to_vec();
        Ok(())
    }
    fn present(&mut self) -> Result<(), ResourceError> {
        Ok(())
    }
}

impl RecordingDispatch {
    fn new() -> Self {
        RecordingDispatch {
            display_source: String::new(),
            last_cross_buffer: Vec::new(),
            last_scalar_cache: Vec::new(),
            intermediates: Vec::new(),
        }
    }
}

struct FixedInput(f64);
impl InputProvider for FixedInput {
    fn microphone_sample(&self, _sample_index: u64) -> Result<f64, RuntimeError> {
        Ok(self.0)
    }
}

/// Returns `first` at sample 0 and `sample_index as f64` everywhere else, so
/// a delay line's output at a later index can be checked against a distinct
/// value recorded at index 0.
struct MarkedInput {
    first: f64,
}
impl InputProvider for MarkedInput {
    fn microphone_sample(&self, sample_index: u64) -> Result<f64, RuntimeError> {
        if sample_index == 0 {
            Ok(self.first)
        } else {
            Ok(sample_index as f64)
        }
    }
}

struct RecordingSink {
    samples: Vec<(String, u64, f64)>,
}
impl RecordingSink {
    fn new() -> Self {
        RecordingSink { samples: Vec::new() }
    }
}
impl SampleSink for RecordingSink {
    fn write_sample(&mut self, channel_name: &str, sample_index: u64, value: f64) -> Result<(), ResourceError> {
        self.samples.push((channel_name.to_string(), sample_index, value));
        Ok(())
    }
}

/// `display = [me.x, me.y, fract(me.t)]` — a pure coordinate readout with
/// no cache or cross-domain dependency, the simplest visual program.
#[test]
fn gradient_display_reads_every_me_coordinate() {
    let json = r#"{
        "bundles": {
            "display": {
                "name": "display",
                "strands": [
                    {"name": "r", "index": 0, "expr": {"type": "index", "bundle": "me", "field": "x"}},
                    {"name": "g", "index": 1, "expr": {"type": "index", "bundle": "me", "field": "y"}},
                    {"name": "b", "index": 2, "expr": {"type": "builtin", "name": "fract", "args": [
                        {"type": "index", "bundle": "me", "field": "t"}
                    ]}}
                ]
            }
        },
        "spindles": {},
        "order": [],
        "resources": null
    }"#;
    let config = CoordinatorConfig::default();
    let unit = compile_source(json, &config).unwrap();
    let visual = unit.visual.expect("gradient program has no audio content, should produce a visual swatch");
    assert!(visual.source.display_kernel.contains("display_r = me_x"));
    assert!(visual.source.display_kernel.contains("display_g = me_y"));
    assert!(visual.source.display_kernel.contains("display_b = fract(me_t)"));
    assert!(visual.source.display_kernel.contains("write_pixel(out_texture"));
}

/// `play = [sin((me.i/me.sampleRate)*2764.6)*0.3]` — at `i=0` the phase is
/// zero so the sample is exactly `0.0`.
#[test]
fn sine_tone_is_silent_at_sample_zero() {
    let json = r#"{
        "bundles": {
            "play": {
                "name": "play",
                "strands": [{"name": "v", "index": 0, "expr": {"type": "binary", "op": "*",
                    "left": {"type": "builtin", "name": "sin", "args": [
                        {"type": "binary", "op": "*",
                            "left": {"type": "binary", "op": "/",
                                "left": {"type": "index", "bundle": "me", "field": "i"},
                                "right": {"type": "index", "bundle": "me", "field": "sampleRate"}},
                            "right": {"type": "num", "value": 2764.6}}
                    ]},
                    "right": {"type": "num", "value": 0.3}}
                }]
            }
        },
        "spindles": {},
        "order": [],
        "resources": null
    }"#;
    let config = CoordinatorConfig::default();
    let mut coord = Coordinator::new(config);
    let program = weft::ir_json::parse_program(json).unwrap();
    coord.recompile(&program).unwrap();
    let input = FixedInput(0.0);
    let mut sink = RecordingSink::new();
    coord.tick_audio(1, 0, &input, &mut sink).unwrap();
    assert_eq!(sink.samples.len(), 1);
    assert!((sink.samples[0].2 - 0.0).abs() < 1e-9);
}

/// `trail.v = cache(max(me.x, trail.v*0.95), 2, 1, me.t)`, read by
/// `display.r` — the self-referential cache cycle is accepted (cache edges
/// are exempt from the acyclicity check) and the kernel emits a tick
/// preamble plus a cache result reference rather than erroring.
#[test]
fn feedback_trail_compiles_its_self_reference_through_cache() {
    let json = r#"{
        "bundles": {
            "trail": {
                "name": "trail",
                "strands": [{"name": "v", "index": 0, "expr": {"type": "builtin", "name": "cache", "args": [
                    {"type": "builtin", "name": "max", "args": [
                        {"type": "index", "bundle": "me", "field": "x"},
                        {"type": "binary", "op": "*",
                            "left": {"type": "index", "bundle": "trail", "field": "v"},
                            "right": {"type": "num", "value": 0.95}}
                    ]},
                    {"type": "num", "value": 2},
                    {"type": "num", "value": 1},
                    {"type": "index", "bundle": "me", "field": "t"}
                ]}}]
            },
            "display": {
                "name": "display",
                "strands": [
                    {"name": "r", "index": 0, "expr": {"type": "index", "bundle": "trail", "field": "v"}},
                    {"name": "g", "index": 1, "expr": {"type": "num", "value": 0.0}},
                    {"name": "b", "index": 2, "expr": {"type": "num", "value": 0.0}}
                ]
            }
        },
        "spindles": {},
        "order": [],
        "resources": null
    }"#;
    let config = CoordinatorConfig::default();
    let unit = compile_source(json, &config).unwrap();
    let visual = unit.visual.expect("trail feeds display, should produce a visual swatch");
    assert!(visual.source.display_kernel.contains("cache_shift_history(0, px)"));
    assert!(visual.source.display_kernel.contains("cache0_result"));
    assert!(visual.source.display_kernel.contains("display_r = cache0_result"));
}

/// `d = cache(microphone(), 22050, 11025, me.i)` — with `me.i` as the
/// signal, every sample is a distinct tick, so after 11026 samples the
/// tap-11025 read surfaces exactly the sample recorded at `i=0`.
#[test]
fn audio_delay_line_surfaces_the_sample_from_11025_samples_ago() {
    let json = r#"{
        "bundles": {
            "d": {
                "name": "d",
                "strands": [{"name": "v", "index": 0, "expr": {"type": "builtin", "name": "cache", "args": [
                    {"type": "builtin", "name": "microphone", "args": []},
                    {"type": "num", "value": 22050},
                    {"type": "num", "value": 11025},
                    {"type": "index", "bundle": "me", "field": "i"}
                ]}}]
            },
            "play": {
                "name": "play",
                "strands": [{"name": "v", "index": 0, "expr": {"type": "index", "bundle": "d", "field": "v"}}]
            }
        },
        "spindles": {},
        "order": [],
        "resources": null
    }"#;
    let config = CoordinatorConfig::default();
    let mut coord = Coordinator::new(config);
    let program = weft::ir_json::parse_program(json).unwrap();
    coord.recompile(&program).unwrap();
    let marked_value = 7.0;
    let input = MarkedInput { first: marked_value };
    let mut sink = RecordingSink::new();
    coord.tick_audio(11026, 0, &input, &mut sink).unwrap();
    let (_, sample_index, value) = sink.samples.last().unwrap();
    assert_eq!(*sample_index, 11025);
    assert_eq!(*value, marked_value);
}

/// `amp.v = abs(sin(microphone()*3))` exported from the audio swatch,
/// `display.r = amp.v` consuming it on the visual side — exercises the
/// cross-domain buffer end to end: one stable slot is assigned for
/// `("amp", "v")`, `tick_audio` refreshes it, and the following
/// `tick_visual` hands it to the display kernel at that slot.
#[test]
fn audio_reactive_visual_refreshes_its_cross_domain_slot() {
    let json = r#"{
        "bundles": {
            "amp": {
                "name": "amp",
                "strands": [{"name": "v", "index": 0, "expr": {"type": "builtin", "name": "abs", "args": [
                    {"type": "builtin", "name": "sin", "args": [
                        {"type": "binary", "op": "*",
                            "left": {"type": "builtin", "name": "microphone", "args": []},
                            "right": {"type": "num", "value": 3.0}}
                    ]}
                ]}}]
            },
            "display": {
                "name": "display",
                "strands": [
                    {"name": "r", "index": 0, "expr": {"type": "index", "bundle": "amp", "field": "v"}},
                    {"name": "g", "index": 1, "expr": {"type": "num", "value": 0.0}},
                    {"name": "b", "index": 2, "expr": {"type": "num", "value": 0.0}}
                ]
            }
        },
        "spindles": {},
        "order": [],
        "resources": null
    }"#;
    let config = CoordinatorConfig::default();
    let mut coord = Coordinator::new(config);
    let program = weft::ir_json::parse_program(json).unwrap();
    coord.recompile(&program).unwrap();

    let slots = &coord.compiled().unwrap().visual.as_ref().unwrap().source.cross_domain_slots;
    assert_eq!(slots.len(), 1);
    assert!(slots.contains_key(&("amp".to_string(), "v".to_string())));

    let mic_value = 0.2_f64;
    let input = FixedInput(mic_value);
    let mut sink = RecordingSink::new();
    coord.tick_audio(1, 0, &input, &mut sink).unwrap();

    let mut dispatch = RecordingDispatch::new();
    coord.tick_visual(0.0, &mut dispatch).unwrap();
    let expected = (mic_value * 3.0).sin().abs();
    assert_eq!(dispatch.last_cross_buffer.len(), 1);
    assert!((dispatch.last_cross_buffer[0] - expected).abs() < 1e-12);
}

/// `edges.r = sobel(me.x)` (a spindle call) remapped by `shifted.r =
/// edges.r(me.x ~ me.x+0.1)` — `sobel` is deep enough once inlined that its
/// substitution into the remap's base crosses the heavy-remap depth
/// threshold (spec §4.4.5), so compiling it materializes one intermediate
/// kernel rather than inlining the whole tree into `display` directly.
#[test]
fn heavy_spindle_call_materializes_one_intermediate_kernel() {
    fn nested_increment(depth: usize) -> serde_json::Value {
        let mut expr = serde_json::json!({"type": "param", "name": "img"});
        for _ in 0..depth {
            expr = serde_json::json!({"type": "binary", "op": "+", "left": expr, "right": {"type": "num", "value": 1.0}});
        }
        expr
    }

    let program_json = serde_json::json!({
        "bundles": {
            "display": {
                "name": "display",
                "strands": [
                    {"name": "r", "index": 0, "expr": {"type": "remap",
                        "base": {"type": "call", "spindle": "sobel", "args": [
                            {"type": "index", "bundle": "me", "field": "x"}
                        ]},
                        "substitutions": {"me.x": {"type": "binary", "op": "+",
                            "left": {"type": "index", "bundle": "me", "field": "x"},
                            "right": {"type": "num", "value": 0.1}}}
                    }},
                    {"name": "g", "index": 1, "expr": {"type": "num", "value": 0.0}},
                    {"name": "b", "index": 2, "expr": {"type": "num", "value": 0.0}}
                ]
            }
        },
        "spindles": {
            "sobel": {
                "params": ["img"],
                "locals": [],
                "returns": [nested_increment(8)]
            }
        },
        "order": [],
        "resources": null
    });
    let json = program_json.to_string();
    let config = CoordinatorConfig::default();
    let unit = compile_source(&json, &config).unwrap();
    let visual = unit.visual.expect("display-only program should produce a visual swatch");
    assert_eq!(visual.source.intermediate_kernels.len(), 1);
    assert!(visual.source.intermediate_kernels[0].contains("weft_intermediate_0"));
    assert!(visual.source.display_kernel.contains("texture(weft_intermediate_0"));
}

/// `compile_source` rejects malformed JSON and unknown builtins at parse
/// time rather than surfacing a panic later in the pipeline.
#[test]
fn malformed_program_is_rejected_before_analysis_runs() {
    let config = CoordinatorConfig::default();
    assert!(compile_source("not json", &config).is_err());

    let unknown_builtin = r#"{
        "bundles": {"b": {"name": "b", "strands": [
            {"name": "v", "index": 0, "expr": {"type": "builtin", "name": "frobnicate", "args": []}}
        ]}},
        "spindles": {}, "order": [], "resources": null
    }"#;
    assert!(compile_source(unknown_builtin, &config).is_err());
}
