// src/engine/batch.rs
//
// Batch orchestrator: chunked fan-out onto the worker pool, per-item timeout,
// cancellation at chunk boundaries, progress events and delivery.

use crate::config::ProcessorConfig;
use crate::engine::admission::{AdmissionReport, AdmissionValidator};
use crate::engine::archive::{dedupe_names, ArchiveEntry, Archiver, Delivery, ZipArchiver};
use crate::engine::common::run_with_panic_policy;
use crate::engine::geometry::{CropAvailability, NegotiatedSelection};
use crate::engine::io::{InputFile, SourceImage};
use crate::engine::pool;
use crate::engine::resources::ResourceManager;
use crate::engine::tasks::{transform_item, ItemContext, RunGate, TransformOutput};
use crate::error::{ErrorCategory, PressError};
use crate::ops::{Anchor, TransformSettings};
use crate::preset::ResolvedPreset;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

type BatchResult<T> = std::result::Result<T, PressError>;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Cooperative stop flag, checked before each chunk.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything one run owns: the settings snapshot, the stop flag and the
/// negotiated crop capability. Consumed by `BatchProcessor::run`.
#[derive(Debug, Clone)]
pub struct BatchRunContext {
    settings: TransformSettings,
    availability: CropAvailability,
    suffix: Option<String>,
    token: CancellationToken,
}

impl BatchRunContext {
    pub fn new(settings: TransformSettings) -> Self {
        Self {
            settings,
            availability: CropAvailability::default(),
            suffix: None,
            token: CancellationToken::new(),
        }
    }

    pub fn from_preset(preset: &ResolvedPreset) -> Self {
        Self::new(preset.settings).with_suffix(preset.suffix.clone())
    }

    /// Apply the selection capability's answer. A rectangle is only taken
    /// when the settings ask for a manual crop.
    pub fn with_selection(mut self, selection: NegotiatedSelection) -> Self {
        self.availability = selection.availability;
        if let (Some(crop), Some(rect)) = (self.settings.crop.as_mut(), selection.rect) {
            if crop.anchor == Anchor::Manual {
                crop.manual_rect = Some(rect);
            }
        }
        self
    }

    pub fn with_availability(mut self, availability: CropAvailability) -> Self {
        self.availability = availability;
        self
    }

    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = Some(suffix.into());
        self
    }

    /// A handle that can stop this run from any thread.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn settings(&self) -> &TransformSettings {
        &self.settings
    }

    pub fn availability(&self) -> CropAvailability {
        self.availability
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

/// A failed item, listed by file name in the summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemError {
    pub source_name: String,
    pub message: String,
    pub category: ErrorCategory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub status: RunStatus,
    pub total_items: usize,
    pub processed_count: usize,
    /// Items never started because the run was cancelled.
    pub skipped_count: usize,
    pub original_size: u64,
    pub new_size: u64,
    /// Negative when outputs grew.
    pub savings: i64,
    pub savings_percent: f64,
    pub carbon_saved_grams: f64,
    pub processing_time_ms: u64,
    pub errors: Vec<ItemError>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchEvent {
    Started {
        total: usize,
        chunks: usize,
    },
    Progress {
        completed: usize,
        total: usize,
        source_name: String,
        succeeded: bool,
    },
    /// Running totals after each successful item.
    Savings {
        original_size: u64,
        new_size: u64,
        savings: i64,
    },
    Completed {
        summary: BatchSummary,
    },
    Cancelled {
        summary: BatchSummary,
    },
}

/// Observer of a run. Called on the orchestrating thread in completion order.
pub trait EventSink {
    fn emit(&self, event: BatchEvent);
}

impl EventSink for mpsc::Sender<BatchEvent> {
    fn emit(&self, event: BatchEvent) {
        // a dropped receiver only means nobody is listening
        let _ = self.send(event);
    }
}

impl<F> EventSink for F
where
    F: Fn(BatchEvent),
{
    fn emit(&self, event: BatchEvent) {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: BatchEvent) {}
}

#[derive(Debug)]
pub struct BatchOutcome {
    pub summary: BatchSummary,
    /// Successful items in input order, with collision-free names.
    pub results: Vec<TransformOutput>,
    pub delivery: Delivery,
    /// `PressError::Cancelled` when the run was stopped early. Partial
    /// results and delivery are still valid.
    pub cancellation: Option<PressError>,
}

impl BatchOutcome {
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_some()
    }
}

enum WorkerMessage {
    Started(usize),
    Finished(usize, BatchResult<TransformOutput>),
}

/// Running totals kept by the orchestrator.
#[derive(Default)]
struct Tally {
    settled: usize,
    original_size: u64,
    new_size: u64,
    outputs: Vec<(usize, TransformOutput)>,
    errors: Vec<(usize, ItemError)>,
}

impl Tally {
    fn savings(&self) -> i64 {
        self.original_size as i64 - self.new_size as i64
    }

    fn record(
        &mut self,
        index: usize,
        source_name: &str,
        result: BatchResult<TransformOutput>,
        total: usize,
        sink: &dyn EventSink,
    ) {
        self.settled += 1;
        let succeeded = result.is_ok();
        match result {
            Ok(output) => {
                self.original_size += output.original_size;
                self.new_size += output.new_size;
                self.outputs.push((index, output));
            }
            Err(err) => {
                warn!(source = source_name, error = %err, "item failed");
                self.errors.push((
                    index,
                    ItemError {
                        source_name: source_name.to_string(),
                        message: err.to_string(),
                        category: err.category(),
                    },
                ));
            }
        }
        sink.emit(BatchEvent::Progress {
            completed: self.settled,
            total,
            source_name: source_name.to_string(),
            succeeded,
        });
        if succeeded {
            sink.emit(BatchEvent::Savings {
                original_size: self.original_size,
                new_size: self.new_size,
                savings: self.savings(),
            });
        }
    }
}

/// Counts workers still running an item, including ones whose item already
/// timed out. Decremented on drop so a panicking worker is counted out too.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Runs batches against one shared resource manager.
///
/// Building a processor starts the manager's periodic memory-pressure check;
/// the processor that started it stops it on drop.
pub struct BatchProcessor {
    config: ProcessorConfig,
    resources: Arc<ResourceManager>,
    validator: AdmissionValidator,
    archiver: Box<dyn Archiver>,
    status: Mutex<RunStatus>,
    in_flight: Arc<AtomicUsize>,
    owns_watcher: bool,
}

impl BatchProcessor {
    pub fn new(config: ProcessorConfig, resources: Arc<ResourceManager>) -> Self {
        let owns_watcher = match resources.start_watcher() {
            Ok(started) => started,
            Err(e) => {
                warn!(error = %e, "memory watcher unavailable, pressure is only checked on demand");
                false
            }
        };
        Self {
            validator: AdmissionValidator::new(&config),
            config,
            resources,
            archiver: Box::new(ZipArchiver),
            status: Mutex::new(RunStatus::Idle),
            in_flight: Arc::new(AtomicUsize::new(0)),
            owns_watcher,
        }
    }

    pub fn with_archiver(mut self, archiver: Box<dyn Archiver>) -> Self {
        self.archiver = archiver;
        self
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    /// Status of the most recent run.
    pub fn status(&self) -> RunStatus {
        *self.status.lock()
    }

    /// Workers still busy with an item. Items abandoned after a timeout keep
    /// their worker until the codec call returns.
    pub fn in_flight_workers(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Admission through this processor's validator; probe results persist
    /// across calls.
    pub fn validate(&self, files: Vec<InputFile>) -> BatchResult<AdmissionReport> {
        self.validator.validate(files)
    }

    fn set_status(&self, status: RunStatus) {
        *self.status.lock() = status;
    }

    fn fail(&self, err: PressError) -> PressError {
        self.set_status(RunStatus::Failed);
        warn!(error = %err, "batch failed");
        err
    }

    /// Process `items` in chunks of `chunk_size`.
    ///
    /// Per-item failures end up in the summary; only batch faults (empty
    /// input, invalid settings or config, delivery failure) are returned as
    /// errors. A cancelled run still returns its partial outcome, with
    /// `cancellation` set. Resources are cleaned up on every exit path once
    /// the run started.
    pub fn run(
        &self,
        items: Vec<SourceImage>,
        ctx: BatchRunContext,
        sink: &dyn EventSink,
    ) -> BatchResult<BatchOutcome> {
        let started_at = Instant::now();
        self.set_status(RunStatus::Running);

        if items.is_empty() {
            return Err(self.fail(PressError::empty_input()));
        }
        self.config.validate().map_err(|e| self.fail(e))?;
        ctx.settings.validate().map_err(|e| self.fail(e))?;

        let total = items.len();
        let chunk_size = self.config.chunk_size;
        let chunks = total.div_ceil(chunk_size);
        info!(total, chunks, chunk_size, stages = ?ctx.settings.stages(), "batch started");
        sink.emit(BatchEvent::Started { total, chunks });

        let item_ctx = Arc::new(ItemContext {
            settings: ctx.settings,
            availability: ctx.availability,
            preset_suffix: ctx.suffix.clone(),
            max_dimension: self.config.max_dimension,
            gate: RunGate::default(),
        });

        let mut tally = Tally::default();
        let mut cancelled = false;
        for (chunk_index, chunk) in items.chunks(chunk_size).enumerate() {
            if ctx.token.is_cancelled() {
                info!(chunk = chunk_index, settled = tally.settled, "batch cancelled");
                cancelled = true;
                break;
            }
            let base = chunk_index * chunk_size;
            self.run_chunk(base, chunk, &item_ctx, total, &mut tally, sink);
            debug!(chunk = chunk_index, settled = tally.settled, "chunk settled");
        }

        // items abandoned after a timeout may still be queued or running
        item_ctx.gate.close();

        let status = if cancelled {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };
        let outcome = self.finish(tally, total, status, started_at);
        self.resources.cleanup();

        let outcome = outcome.map_err(|e| self.fail(e))?;
        self.set_status(status);
        info!(
            status = ?status,
            processed = outcome.summary.processed_count,
            errors = outcome.summary.errors.len(),
            skipped = outcome.summary.skipped_count,
            savings = outcome.summary.savings,
            elapsed_ms = outcome.summary.processing_time_ms,
            "batch finished"
        );
        let summary = outcome.summary.clone();
        sink.emit(match status {
            RunStatus::Cancelled => BatchEvent::Cancelled { summary },
            _ => BatchEvent::Completed { summary },
        });
        Ok(outcome)
    }

    /// Spawn every item of the chunk and wait until each one settled or
    /// timed out. Nothing from this chunk is pending on return.
    fn run_chunk(
        &self,
        base: usize,
        chunk: &[SourceImage],
        item_ctx: &Arc<ItemContext>,
        total: usize,
        tally: &mut Tally,
        sink: &dyn EventSink,
    ) {
        let chunk_start = Instant::now();
        let (tx, rx) = mpsc::channel::<WorkerMessage>();
        for (offset, item) in chunk.iter().enumerate() {
            let index = base + offset;
            let tx = tx.clone();
            let item = item.clone();
            let ctx = Arc::clone(item_ctx);
            let resources = Arc::clone(&self.resources);
            let in_flight = InFlight::enter(&self.in_flight);
            pool::spawn(move || {
                let _in_flight = in_flight;
                let _ = tx.send(WorkerMessage::Started(index));
                let result =
                    run_with_panic_policy("transform", || transform_item(&item, &ctx, &resources));
                // the orchestrator stops listening once the item timed out
                let _ = tx.send(WorkerMessage::Finished(index, result));
            });
        }
        drop(tx);

        let timeout = self.config.item_timeout;
        // items waiting for a worker may queue behind the rest of the chunk
        let waves = chunk.len().div_ceil(pool::worker_count()) as u32;
        let queue_deadline = timeout.map(|t| chunk_start + t * waves);

        // index -> when its worker picked it up
        let mut pending: HashMap<usize, Option<Instant>> =
            (base..base + chunk.len()).map(|i| (i, None)).collect();
        let name_of = |index: usize| chunk[index - base].name.as_str();

        while !pending.is_empty() {
            let message = match (timeout, queue_deadline) {
                (Some(timeout), Some(queue_deadline)) => {
                    let next = pending
                        .values()
                        .map(|started| started.map_or(queue_deadline, |s| s + timeout))
                        .min()
                        .unwrap_or(queue_deadline);
                    match rx.recv_timeout(next.saturating_duration_since(Instant::now())) {
                        Ok(message) => message,
                        Err(RecvTimeoutError::Timeout) => {
                            expire(&mut pending, timeout, queue_deadline, |index| {
                                let err = PressError::item_timed_out(
                                    name_of(index).to_string(),
                                    timeout.as_millis() as u64,
                                );
                                tally.record(index, name_of(index), Err(err), total, sink);
                            });
                            continue;
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                _ => match rx.recv() {
                    Ok(message) => message,
                    Err(_) => break,
                },
            };
            match message {
                WorkerMessage::Started(index) => {
                    if let Some(slot) = pending.get_mut(&index) {
                        *slot = Some(Instant::now());
                    }
                }
                WorkerMessage::Finished(index, result) => {
                    if pending.remove(&index).is_some() {
                        tally.record(index, name_of(index), result, total, sink);
                    }
                }
            }
        }

        // every sender is gone but some items never reported back
        let mut lost: Vec<usize> = pending.into_keys().collect();
        lost.sort_unstable();
        for index in lost {
            let err = PressError::internal_panic(format!(
                "worker for '{}' exited without a result",
                name_of(index)
            ));
            tally.record(index, name_of(index), Err(err), total, sink);
        }
    }

    /// Aggregate totals, deduplicate names and hand the outputs to delivery.
    fn finish(
        &self,
        mut tally: Tally,
        total: usize,
        status: RunStatus,
        started_at: Instant,
    ) -> BatchResult<BatchOutcome> {
        tally.outputs.sort_by_key(|(index, _)| *index);
        tally.errors.sort_by_key(|(index, _)| *index);

        let names = dedupe_names(
            tally
                .outputs
                .iter()
                .map(|(_, output)| output.output_name.clone())
                .collect(),
        );
        let results: Vec<TransformOutput> = tally
            .outputs
            .into_iter()
            .zip(names)
            .map(|((_, mut output), name)| {
                output.output_name = name;
                output
            })
            .collect();

        let entries: Vec<ArchiveEntry<'_>> = results
            .iter()
            .map(|output| ArchiveEntry {
                name: &output.output_name,
                bytes: &output.output_bytes,
            })
            .collect();
        let delivery = Delivery::assemble(&entries, self.archiver.as_ref(), self.config.archive_level)?;
        drop(entries);

        let savings = tally.original_size as i64 - tally.new_size as i64;
        let errors: Vec<ItemError> = tally.errors.into_iter().map(|(_, e)| e).collect();
        let cancellation =
            (status == RunStatus::Cancelled).then(|| PressError::cancelled(tally.settled));
        let summary = BatchSummary {
            status,
            total_items: total,
            processed_count: results.len(),
            skipped_count: total - tally.settled,
            original_size: tally.original_size,
            new_size: tally.new_size,
            savings,
            savings_percent: savings_percent(savings, tally.original_size),
            carbon_saved_grams: carbon_saved_grams(savings, self.config.co2_grams_per_mb),
            processing_time_ms: started_at.elapsed().as_millis() as u64,
            errors,
        };
        Ok(BatchOutcome {
            summary,
            results,
            delivery,
            cancellation,
        })
    }
}

impl Drop for BatchProcessor {
    fn drop(&mut self) {
        if self.owns_watcher {
            self.resources.stop_watcher();
        }
    }
}

/// Drop every pending item whose deadline has passed.
fn expire(
    pending: &mut HashMap<usize, Option<Instant>>,
    timeout: Duration,
    queue_deadline: Instant,
    mut on_expired: impl FnMut(usize),
) {
    let now = Instant::now();
    let mut expired: Vec<usize> = pending
        .iter()
        .filter(|(_, started)| started.map_or(queue_deadline, |s| s + timeout) <= now)
        .map(|(index, _)| *index)
        .collect();
    expired.sort_unstable();
    for index in expired {
        pending.remove(&index);
        warn!(index, timeout_ms = timeout.as_millis() as u64, "item timed out, abandoning it");
        on_expired(index);
    }
}

/// Rounded to one decimal; 0 for an empty total.
pub fn savings_percent(savings: i64, original_size: u64) -> f64 {
    if original_size == 0 {
        return 0.0;
    }
    (savings as f64 / original_size as f64 * 1000.0).round() / 10.0
}

/// Grams of CO2 attributed to the bytes saved. Growth never counts as negative.
pub fn carbon_saved_grams(savings: i64, grams_per_mb: f64) -> f64 {
    savings.max(0) as f64 / BYTES_PER_MB * grams_per_mb
}
