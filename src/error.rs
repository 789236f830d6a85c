//! Error taxonomy (spec §7). One enum per phase, hand-rolled `Display` +
//! `std::error::Error` impls in the style of `shader_macros::preprocessor::Error`
//! rather than a derive-macro error crate.
use std::fmt;

/// Invalid IR JSON shape or unknown expression tag.
#[derive(Debug)]
pub enum ParseError {
    UnknownExprTag(String),
    MissingField { node: &'static str, field: &'static str },
    NonLiteralCacheArg { arg: &'static str },
    UnknownBuiltin(String),
    Json(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ParseError::UnknownExprTag(tag) => write!(f, "unknown expression tag {:?}", tag),
            ParseError::MissingField { node, field } => {
                write!(f, "{} is missing required field {:?}", node, field)
            }
            ParseError::NonLiteralCacheArg { arg } => {
                write!(f, "cache() argument {:?} must be an integer literal", arg)
            }
            ParseError::UnknownBuiltin(name) => write!(f, "unknown builtin {:?}", name),
            ParseError::Json(msg) => write!(f, "malformed IR JSON: {}", msg),
        }
    }
}

impl std::error::Error for ParseError {}

/// Non-cache cycle; unknown bundle/spindle reference; unsupported spindle return index.
#[derive(Debug)]
pub enum AnalysisError {
    NonCacheCycle { bundles: Vec<String> },
    UnknownBundle(String),
    UnknownSpindle(String),
    SpindleReturnIndexOutOfRange { spindle: String, index: usize, len: usize },
}

impl fmt::Display for AnalysisError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AnalysisError::NonCacheCycle { bundles } => write!(
                f,
                "dependency cycle without a cache-breaking edge: {}",
                bundles.join(" -> ")
            ),
            AnalysisError::UnknownBundle(name) => write!(f, "reference to unknown bundle {:?}", name),
            AnalysisError::UnknownSpindle(name) => write!(f, "call to unknown spindle {:?}", name),
            AnalysisError::SpindleReturnIndexOutOfRange { spindle, index, len } => write!(
                f,
                "extract index {} out of range for spindle {:?} returning {} value(s)",
                index, spindle, len
            ),
        }
    }
}

impl std::error::Error for AnalysisError {}

/// Unsupported expression in current backend; circular inlining depth exceeded; unknown builtin.
#[derive(Debug)]
pub enum CompilationError {
    UnsupportedExpr { backend: &'static str, what: &'static str },
    InlineDepthExceeded { bundle: String, strand: String, limit: u32 },
    UnknownBuiltin(String),
    NoSinkSwatch(&'static str),
}

impl fmt::Display for CompilationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CompilationError::UnsupportedExpr { backend, what } => {
                write!(f, "{} backend cannot generate code for {}", backend, what)
            }
            CompilationError::InlineDepthExceeded { bundle, strand, limit } => write!(
                f,
                "inlining {}.{} exceeded recursion depth {}",
                bundle, strand, limit
            ),
            CompilationError::UnknownBuiltin(name) => write!(f, "unknown builtin {:?}", name),
            CompilationError::NoSinkSwatch(backend) => {
                write!(f, "no sink swatch produced for backend {:?}", backend)
            }
        }
    }
}

impl std::error::Error for CompilationError {}

/// Requested hardware unavailable (no GPU, no audio device).
#[derive(Debug)]
pub enum ResourceError {
    NoGpu,
    NoAudioDevice,
    DimensionsNotSet,
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ResourceError::NoGpu => write!(f, "no GPU compute device available"),
            ResourceError::NoAudioDevice => write!(f, "no audio output device available"),
            ResourceError::DimensionsNotSet => write!(f, "output dimensions were never configured"),
        }
    }
}

impl std::error::Error for ResourceError {}

/// Buffer-binding mismatch, input-provider unreachable.
#[derive(Debug)]
pub enum RuntimeError {
    BufferBindingMismatch { expected: usize, got: usize },
    InputProviderUnreachable(&'static str),
    CacheNotTicked(u32),
    UnknownCache(u32),
    CacheCellOutOfBounds { id: u32, cell: usize, bound: usize },
    UntakenBranchUnresolved(String),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RuntimeError::BufferBindingMismatch { expected, got } => write!(
                f,
                "buffer binding mismatch: expected {} slots, got {}",
                expected, got
            ),
            RuntimeError::InputProviderUnreachable(which) => {
                write!(f, "input provider unreachable: {}", which)
            }
            RuntimeError::CacheNotTicked(id) => write!(f, "cache {} was read before its first tick", id),
            RuntimeError::UnknownCache(id) => write!(f, "reference to unregistered cache {}", id),
            RuntimeError::CacheCellOutOfBounds { id, cell, bound } => write!(
                f,
                "cache {} cell {} out of bounds (capacity {})",
                id, cell, bound
            ),
            RuntimeError::UntakenBranchUnresolved(msg) => {
                write!(f, "select branch taken at runtime failed to compile: {}", msg)
            }
        }
    }
}

impl std::error::Error for RuntimeError {}

/// Top-level union of the taxonomy, the only error type crossing public API boundaries.
#[derive(Debug)]
pub enum WeftError {
    Parse(ParseError),
    Analysis(AnalysisError),
    Compilation(CompilationError),
    Resource(ResourceError),
    Runtime(RuntimeError),
}

impl fmt::Display for WeftError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WeftError::Parse(e) => write!(f, "parse error: {}", e),
            WeftError::Analysis(e) => write!(f, "analysis error: {}", e),
            WeftError::Compilation(e) => write!(f, "compilation error: {}", e),
            WeftError::Resource(e) => write!(f, "resource error: {}", e),
            WeftError::Runtime(e) => write!(f, "runtime error: {}", e),
        }
    }
}

impl std::error::Error for WeftError {}

macro_rules! impl_from_error {
    ($variant:ident, $inner:ty) => {
        impl From<$inner> for WeftError {
            fn from(e: $inner) -> Self {
                WeftError::$variant(e)
            }
        }
    };
}

impl_from_error!(Parse, ParseError);
impl_from_error!(Analysis, AnalysisError);
impl_from_error!(Compilation, CompilationError);
impl_from_error!(Resource, ResourceError);
impl_from_error!(Runtime, RuntimeError);

pub type WeftResult<T> = Result<T, WeftError>;
