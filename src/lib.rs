//! WEFT: compiler middle-end and runtime orchestration for a small
//! dataflow language describing time-varying signals over coordinate
//! spaces (spec §1, §2). Parses the IR JSON wire format, runs it through
//! analysis, transform, partition and codegen, and hands the result to a
//! [`coordinator::Coordinator`] that owns cache storage and cross-domain
//! buffers for the running program's lifetime.
pub mod analysis;
pub mod cache;
pub mod codegen;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod ir;
pub mod ir_json;
pub mod partition;
pub mod transform;

pub use config::CoordinatorConfig;
pub use coordinator::{compile, CompiledUnit, Coordinator};
pub use error::{WeftError, WeftResult};
pub use ir::Program;

/// Parses IR JSON and compiles it in one step — the entry point most
/// callers want; [`coordinator::compile`] is available directly for
/// callers that already hold a parsed [`Program`] (e.g. after editing one
/// in place for a live-coding session).
pub fn compile_source(json: &str, config: &CoordinatorConfig) -> WeftResult<CompiledUnit> {
    let program = ir_json::parse_program(json)?;
    coordinator::compile(&program, config)
}
