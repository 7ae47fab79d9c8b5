// lib.rs
//
// batchpress: batch image transformation pipeline.
//
// - Admission: type, size and integrity checks before anything runs
// - Crop, resize and recompress each image in bounded chunks
// - Per-item error isolation and cooperative cancellation
// - Pre-flight savings estimates without decoding

// Note: jemalloc is not supported on Windows/MSVC, so we exclude it on that platform
#[cfg(all(feature = "jemalloc", not(target_env = "msvc")))]
#[global_allocator]
static ALLOC: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

pub mod config;
pub mod engine;
pub mod error;
pub mod ops;
pub mod preset;

pub use config::ProcessorConfig;
pub use engine::{
    BatchEvent, BatchOutcome, BatchProcessor, BatchRunContext, BatchSummary, CancellationToken,
    Delivery, EventSink, InputFile, ResourceManager, RunStatus, SourceImage,
};
pub use error::{ErrorCategory, PressError, Result};
pub use ops::{Anchor, AspectRatio, NormalizedRect, OutputFormat, TransformSettings};
pub use preset::{resolve_preset, Preset, ResolvedPreset};

/// Crate version, as published.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
