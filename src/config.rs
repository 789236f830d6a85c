//! Coordinator configuration (spec §5, §9): output dimensions, audio
//! device parameters, and the inlining recursion limit, layered from a
//! config file and the environment the way the teacher's host tooling
//! does with the `config` crate.
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Everything the [`crate::coordinator::Coordinator`] needs to know before
/// it can register caches and size buffers. `max_inline_depth` bounds both
/// [`crate::codegen::fully_inline`] and the audio closure tree's own
/// recursion guard.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub width: u32,
    pub height: u32,
    pub sample_rate: f64,
    pub channels: u32,
    pub buffer_size: u32,
    pub max_inline_depth: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            width: 1280,
            height: 720,
            sample_rate: 44100.0,
            channels: 2,
            buffer_size: 512,
            max_inline_depth: 512,
        }
    }
}

impl CoordinatorConfig {
    /// Layers `WEFT_*` environment overrides on top of an optional config
    /// file, falling back to [`Default::default`] for anything neither
    /// source sets.
    pub fn load(path: Option<&str>) -> Result<CoordinatorConfig, ConfigError> {
        let mut builder = Config::new();
        let defaults = CoordinatorConfig::default();
        builder.set_default("width", defaults.width as i64)?;
        builder.set_default("height", defaults.height as i64)?;
        builder.set_default("sample_rate", defaults.sample_rate)?;
        builder.set_default("channels", defaults.channels as i64)?;
        builder.set_default("buffer_size", defaults.buffer_size as i64)?;
        builder.set_default("max_inline_depth", defaults.max_inline_depth as i64)?;
        if let Some(path) = path {
            builder.merge(File::with_name(path).required(false))?;
        }
        builder.merge(Environment::with_prefix("weft"))?;
        builder.try_into()
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}
