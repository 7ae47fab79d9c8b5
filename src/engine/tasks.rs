// src/engine/tasks.rs
//
// Single-item transform under one resource handle: cache lookup, or
// decode -> stages -> cache; then encode -> name.

use crate::engine::archive::output_file_name;
use crate::engine::decoder::{decode_image, detect_format};
use crate::engine::encoder::{encode, EncodePlan};
use crate::engine::geometry::CropAvailability;
use crate::engine::io::SourceImage;
use crate::engine::pipeline::{fit_within, plan_stages, run_stages, variant_key, Stage};
use crate::engine::resources::{CacheKey, ResourceHandle, ResourceManager};
use crate::error::PressError;
use crate::ops::{OutputFormat, TransformSettings};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

type TaskResult<T> = std::result::Result<T, PressError>;

/// Process CPU time (user + system) in seconds.
#[cfg(unix)]
fn cpu_time_secs() -> Option<f64> {
    use libc::{getrusage, rusage, RUSAGE_SELF};
    use std::mem;

    // Safety: getrusage only writes into the zeroed struct we hand it.
    unsafe {
        let mut usage: rusage = mem::zeroed();
        if getrusage(RUSAGE_SELF, &mut usage) != 0 {
            return None;
        }
        Some(
            usage.ru_utime.tv_sec as f64
                + usage.ru_utime.tv_usec as f64 / 1_000_000.0
                + usage.ru_stime.tv_sec as f64
                + usage.ru_stime.tv_usec as f64 / 1_000_000.0,
        )
    }
}

#[cfg(not(unix))]
fn cpu_time_secs() -> Option<f64> {
    None
}

/// Per-item stage timings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemMetrics {
    pub decode_ms: f64,
    pub process_ms: f64,
    pub encode_ms: f64,
    pub total_ms: f64,
    /// Process-wide CPU time spent while this item ran; includes other workers.
    pub cpu_time: f64,
    pub cache_hit: bool,
}

struct MetricsRecorder {
    start_total: Instant,
    stage_start: Instant,
    cpu_start: Option<f64>,
    metrics: ItemMetrics,
}

impl MetricsRecorder {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            start_total: now,
            stage_start: now,
            cpu_start: cpu_time_secs(),
            metrics: ItemMetrics::default(),
        }
    }

    fn lap_ms(&mut self) -> f64 {
        let ms = self.stage_start.elapsed().as_secs_f64() * 1000.0;
        self.stage_start = Instant::now();
        ms
    }

    fn mark_decode_done(&mut self, cache_hit: bool) {
        self.metrics.decode_ms = self.lap_ms();
        self.metrics.cache_hit = cache_hit;
    }

    fn mark_process_done(&mut self) {
        self.metrics.process_ms = self.lap_ms();
    }

    fn finish(mut self) -> ItemMetrics {
        self.metrics.encode_ms = self.lap_ms();
        self.metrics.total_ms = self.start_total.elapsed().as_secs_f64() * 1000.0;
        if let (Some(start), Some(end)) = (self.cpu_start, cpu_time_secs()) {
            self.metrics.cpu_time = (end - start).max(0.0);
        }
        self.metrics
    }
}

/// Closed by the orchestrator once a run has settled. Workers that only get
/// to an item afterwards (it already timed out) skip it.
#[derive(Debug, Clone, Default)]
pub struct RunGate(Arc<AtomicBool>);

impl RunGate {
    pub fn close(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Read-only inputs shared by every item of one run.
#[derive(Debug, Clone)]
pub struct ItemContext {
    pub settings: TransformSettings,
    pub availability: CropAvailability,
    pub preset_suffix: Option<String>,
    pub max_dimension: u32,
    pub gate: RunGate,
}

/// A successfully transformed item.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformOutput {
    pub source_name: String,
    /// Unique within its run once the batch has deduplicated names.
    pub output_name: String,
    pub output_bytes: Vec<u8>,
    pub original_size: u64,
    pub new_size: u64,
    pub width: u32,
    pub height: u32,
    pub format: OutputFormat,
    /// Recoverable degradations (e.g. oversized source downscaled).
    pub warnings: Vec<String>,
    pub metrics: ItemMetrics,
}

impl TransformOutput {
    /// Bytes saved; negative when the output grew.
    pub fn savings(&self) -> i64 {
        self.original_size as i64 - self.new_size as i64
    }
}

/// Transformed pixels, either shared with the cache or owned by this item.
struct Rendered {
    image: Arc<DynamicImage>,
    cache_hit: bool,
    downscaled: bool,
}

/// Decode, bound and run the stages on a cache miss. The pixels are owned
/// throughout; only the finished image is shared with the cache.
fn render(
    handle: &ResourceHandle,
    key: CacheKey,
    stages: &[Stage],
    ctx: &ItemContext,
    recorder: &mut MetricsRecorder,
) -> TaskResult<Rendered> {
    let (image, _) = decode_image(handle.bytes())?;
    handle.record_decoded(image.as_bytes().len() as u64);
    recorder.mark_decode_done(false);

    let (image, downscaled) = fit_within(image, ctx.max_dimension)?;
    let processed = run_stages(image, stages)?;
    handle.record_decoded(processed.as_bytes().len() as u64);

    let image = Arc::new(processed);
    if !handle.cache_result(key, Arc::clone(&image)) {
        debug!(handle = handle.id(), "transformed image not cached");
    }
    Ok(Rendered {
        image,
        cache_hit: false,
        downscaled,
    })
}

/// Run one item end to end. Every failure is returned as this item's error.
///
/// The item's handle stays registered until the output is encoded, so its
/// decoded buffers count toward memory pressure while it runs.
pub fn transform_item(
    source: &SourceImage,
    ctx: &ItemContext,
    resources: &ResourceManager,
) -> TaskResult<TransformOutput> {
    let mut recorder = MetricsRecorder::new();
    let handle = resources.acquire(source.source.open()?);
    // checked after acquire: a run that closes first has its cleanup reclaim this handle
    if ctx.gate.is_closed() {
        return Err(PressError::cancelled(0));
    }

    let plan = match &ctx.settings.convert {
        Some(convert) => EncodePlan::for_conversion(convert),
        None => EncodePlan::preserving(detect_format(handle.bytes())),
    };
    let stages = plan_stages(&ctx.settings, &plan, ctx.availability);
    let key = CacheKey::new(source.fingerprint(), variant_key(&stages, ctx.max_dimension));

    let rendered = match resources.lookup(&key) {
        Some(image) => {
            recorder.mark_decode_done(true);
            Rendered {
                image,
                cache_hit: true,
                downscaled: false,
            }
        }
        None => render(&handle, key, &stages, ctx, &mut recorder)?,
    };
    recorder.mark_process_done();

    let mut warnings = Vec::new();
    if rendered.downscaled {
        warnings.push(format!(
            "downscaled to fit {}px before transforming",
            ctx.max_dimension
        ));
    }

    let output_bytes = encode(&rendered.image, &plan)?;
    let (width, height) = (rendered.image.width(), rendered.image.height());
    drop(rendered);
    resources.release(handle);
    let metrics = recorder.finish();

    let output_name =
        output_file_name(&source.name, &ctx.settings, ctx.preset_suffix.as_deref(), &plan);
    debug!(
        source = %source.name,
        output = %output_name,
        decode_ms = metrics.decode_ms,
        process_ms = metrics.process_ms,
        encode_ms = metrics.encode_ms,
        cache_hit = metrics.cache_hit,
        "item transformed"
    );

    Ok(TransformOutput {
        source_name: source.name.clone(),
        output_name,
        original_size: source.byte_size,
        new_size: output_bytes.len() as u64,
        output_bytes,
        width,
        height,
        format: plan.format,
        warnings,
        metrics,
    })
}
