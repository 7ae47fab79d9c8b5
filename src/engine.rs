// src/engine.rs
//
// The batch pipeline. Files are admitted, transformed in bounded chunks on a
// shared worker pool, and delivered as one file or one archive.
//
// This file is a facade over the modules in engine/.

// =============================================================================
// SECURITY LIMITS
// =============================================================================

/// Maximum allowed image dimension (width or height) before anything is decoded.
/// Independent of the user-facing downscale limit in `ProcessorConfig`.
pub const MAX_DIMENSION: u32 = 32768;

/// Maximum allowed total pixels (width * height).
/// 100 megapixels = 400MB uncompressed RGBA. Beyond this is likely malicious.
pub const MAX_PIXELS: u64 = 100_000_000;

// =============================================================================
// MODULES
// =============================================================================

pub mod admission;
pub mod archive;
pub mod batch;
mod common;
pub mod decoder;
pub mod encoder;
pub mod estimator;
pub mod geometry;
pub mod io;
pub mod pipeline;
pub mod pool;
pub mod resources;
pub mod tasks;

pub use admission::{
    analyze_files, AdmissionReport, AdmissionValidator, FileAnalysis, Rejection, RejectionReason,
    ValidationOutcome,
};
pub use archive::{output_file_name, ArchiveEntry, Archiver, Delivery, ZipArchiver};
pub use batch::{
    BatchEvent, BatchOutcome, BatchProcessor, BatchRunContext, BatchSummary, CancellationToken,
    EventSink, ItemError, NoopSink, RunStatus,
};
pub use common::run_with_panic_policy;
pub use decoder::{avif_supported, check_dimensions, probe_image, ProbeInfo};
pub use encoder::{EncodePlan, QualitySettings};
pub use estimator::{
    estimate, estimate_batch, estimate_processing_time, performance_score, profile_performance,
    PerformanceLevel, ProfilePerformance, SavingsEstimate,
};
pub use geometry::{
    negotiate_selection, CropAvailability, NegotiatedSelection, PixelRect, SelectionProvider,
};
pub use io::{Fingerprint, InputFile, Source, SourceImage};
pub use resources::{CacheKey, ResourceHandle, ResourceManager, ResourceStats};
pub use tasks::{transform_item, ItemContext, ItemMetrics, RunGate, TransformOutput};
