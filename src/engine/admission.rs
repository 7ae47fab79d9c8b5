// src/engine/admission.rs
//
// Admission: filter a file set by type, size and integrity before a run,
// plus pre-flight file analysis.

use crate::config::ProcessorConfig;
use crate::engine::decoder::{avif_supported, probe_image, ProbeInfo};
use crate::engine::io::{Fingerprint, InputFile, SourceImage};
use crate::error::PressError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::mpsc;
use std::time::Duration;
use tracing::{debug, info, warn};

type AdmissionResult<T> = std::result::Result<T, PressError>;

pub const SUPPORTED_MIME_TYPES: [&str; 9] = [
    "image/jpeg",
    "image/jpg",
    "image/png",
    "image/webp",
    "image/gif",
    "image/avif",
    "image/tiff",
    "image/bmp",
    "image/svg+xml",
];

const LARGE_FILE_BYTES: u64 = 10 * 1024 * 1024;
const LARGE_AVERAGE_BYTES: f64 = 5.0 * 1024.0 * 1024.0;
const LARGE_BATCH_FILES: usize = 20;

/// AVIF is only accepted when this build can decode it.
pub fn is_supported_mime(mime_type: &str) -> bool {
    let mime_type = mime_type.trim();
    if mime_type.eq_ignore_ascii_case("image/avif") && !avif_supported() {
        return false;
    }
    SUPPORTED_MIME_TYPES
        .iter()
        .any(|m| m.eq_ignore_ascii_case(mime_type))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    UnsupportedType,
    TooLarge,
    TotalSizeExceeded,
    Corrupted,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::UnsupportedType => "unsupported type",
            RejectionReason::TooLarge => "too large",
            RejectionReason::TotalSizeExceeded => "total size exceeded",
            RejectionReason::Corrupted => "corrupted",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Rejection {
    pub file: InputFile,
    pub reason: RejectionReason,
    pub error: PressError,
}

/// Per-file verdict, in scan order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationOutcome {
    pub fingerprint: Fingerprint,
    pub accepted: bool,
    pub reason: Option<RejectionReason>,
}

#[derive(Debug, Clone, Default)]
pub struct AdmissionReport {
    pub accepted: Vec<SourceImage>,
    pub rejected: Vec<Rejection>,
    pub outcomes: Vec<ValidationOutcome>,
    /// Files after the one that hit the total cap; never scanned.
    pub unscanned: usize,
}

impl AdmissionReport {
    pub fn accepted_size(&self) -> u64 {
        self.accepted.iter().map(|s| s.byte_size).sum()
    }

    /// One line per rejection: `name: reason`.
    pub fn rejection_summary(&self) -> Vec<String> {
        self.rejected
            .iter()
            .map(|r| format!("{}: {}", r.file.name, r.reason))
            .collect()
    }
}

#[derive(Debug, Clone)]
enum ProbeOutcome {
    Readable(ProbeInfo),
    /// Recognized container this build cannot decode.
    Unsupported(String),
    Unreadable(String),
}

/// Validates file sets; decode-probe results are cached by fingerprint.
pub struct AdmissionValidator {
    max_file_size: u64,
    max_total_size: u64,
    probe_timeout: Duration,
    probe_cache: Mutex<HashMap<Fingerprint, ProbeOutcome>>,
}

impl AdmissionValidator {
    pub fn new(config: &ProcessorConfig) -> Self {
        Self {
            max_file_size: config.max_file_size,
            max_total_size: config.max_total_size,
            probe_timeout: config.probe_timeout,
            probe_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn cached_probes(&self) -> usize {
        self.probe_cache.lock().len()
    }

    /// Checks run in order: type, per-file size, cumulative size, decode probe.
    /// The first file that would push the accepted total over the cap is
    /// rejected and scanning stops there.
    ///
    /// Only an empty input is an error; bad files end up in `rejected`.
    pub fn validate(&self, files: Vec<InputFile>) -> AdmissionResult<AdmissionReport> {
        if files.is_empty() {
            return Err(PressError::empty_input());
        }
        let total_files = files.len();
        let mut report = AdmissionReport::default();
        let mut total: u64 = 0;

        let mut iter = files.into_iter();
        for file in iter.by_ref() {
            let fingerprint = file.fingerprint();

            let verdict = if !is_supported_mime(&file.mime_type) {
                Err((
                    RejectionReason::UnsupportedType,
                    PressError::unsupported_type(file.name.clone(), file.mime_type.clone()),
                ))
            } else if file.byte_size > self.max_file_size {
                Err((
                    RejectionReason::TooLarge,
                    PressError::file_too_large(file.name.clone(), file.byte_size, self.max_file_size),
                ))
            } else if total.saturating_add(file.byte_size) > self.max_total_size {
                Err((
                    RejectionReason::TotalSizeExceeded,
                    PressError::total_size_exceeded(
                        file.name.clone(),
                        total.saturating_add(file.byte_size),
                        self.max_total_size,
                    ),
                ))
            } else {
                match self.probe(&file, &fingerprint) {
                    ProbeOutcome::Readable(info) => {
                        debug!(file = %file.name, width = info.width, height = info.height, "probe ok");
                        Ok(())
                    }
                    ProbeOutcome::Unsupported(format) => Err((
                        RejectionReason::UnsupportedType,
                        PressError::unsupported_type(file.name.clone(), format),
                    )),
                    ProbeOutcome::Unreadable(message) => Err((
                        RejectionReason::Corrupted,
                        PressError::corrupted_file(file.name.clone(), message),
                    )),
                }
            };

            match verdict {
                Ok(()) => {
                    total += file.byte_size;
                    report.outcomes.push(ValidationOutcome {
                        fingerprint,
                        accepted: true,
                        reason: None,
                    });
                    report.accepted.push(SourceImage::admit(file));
                }
                Err((reason, error)) => {
                    debug!(file = %file.name, %reason, "file rejected");
                    report.outcomes.push(ValidationOutcome {
                        fingerprint,
                        accepted: false,
                        reason: Some(reason),
                    });
                    report.rejected.push(Rejection { file, reason, error });
                    if reason == RejectionReason::TotalSizeExceeded {
                        break;
                    }
                }
            }
        }
        report.unscanned = iter.count();

        info!(
            accepted = report.accepted.len(),
            rejected = report.rejected.len(),
            unscanned = report.unscanned,
            total_files,
            "admission finished"
        );
        Ok(report)
    }

    fn probe(&self, file: &InputFile, fingerprint: &Fingerprint) -> ProbeOutcome {
        if let Some(cached) = self.probe_cache.lock().get(fingerprint) {
            return cached.clone();
        }
        match probe_with_timeout(file, self.probe_timeout) {
            Some(outcome) => {
                self.probe_cache
                    .lock()
                    .insert(fingerprint.clone(), outcome.clone());
                outcome
            }
            // not cached: a timeout may be transient
            None => {
                warn!(file = %file.name, timeout_ms = self.probe_timeout.as_millis() as u64, "decode probe timed out");
                ProbeOutcome::Unreadable(format!(
                    "decode probe timed out after {}ms",
                    self.probe_timeout.as_millis()
                ))
            }
        }
    }
}

/// `None` on timeout. The probe thread is left to finish on its own.
fn probe_with_timeout(file: &InputFile, timeout: Duration) -> Option<ProbeOutcome> {
    let source = file.source.clone();
    let (tx, rx) = mpsc::channel();
    let spawned = std::thread::Builder::new()
        .name("batchpress-probe".to_string())
        .spawn(move || {
            let outcome = match source.open() {
                Ok(bytes) => match probe_image(bytes.as_bytes()) {
                    Ok(info) => ProbeOutcome::Readable(info),
                    Err(PressError::UnsupportedFormat { format }) => {
                        ProbeOutcome::Unsupported(format!("image/{format}"))
                    }
                    Err(e) => ProbeOutcome::Unreadable(e.to_string()),
                },
                Err(e) => ProbeOutcome::Unreadable(e.to_string()),
            };
            let _ = tx.send(outcome);
        });
    if let Err(e) = spawned {
        return Some(ProbeOutcome::Unreadable(format!(
            "failed to start decode probe: {e}"
        )));
    }
    match rx.recv_timeout(timeout) {
        Ok(outcome) => Some(outcome),
        Err(mpsc::RecvTimeoutError::Timeout) => None,
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            Some(ProbeOutcome::Unreadable("decode probe aborted".to_string()))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdviceKind {
    LargeFile,
    AnimatedGif,
    ConvertLossless,
    ResizeSuggested,
    LargeBatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Advice {
    pub kind: AdviceKind,
    pub priority: Priority,
    /// Set for per-file advice.
    pub file: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAnalysis {
    pub total_size: u64,
    pub average_size: f64,
    /// MIME subtype -> count
    pub file_types: BTreeMap<String, usize>,
    pub largest_file: Option<String>,
    pub smallest_file: Option<String>,
    pub advice: Vec<Advice>,
}

impl FileAnalysis {
    pub fn has(&self, kind: AdviceKind) -> bool {
        self.advice.iter().any(|a| a.kind == kind)
    }
}

/// Totals and advice for a file set. Pure; reads no file content.
pub fn analyze_files(files: &[InputFile]) -> FileAnalysis {
    let mut analysis = FileAnalysis::default();
    if files.is_empty() {
        return analysis;
    }

    let mut largest: Option<&InputFile> = None;
    let mut smallest: Option<&InputFile> = None;
    for file in files {
        analysis.total_size += file.byte_size;
        let subtype = file
            .mime_type
            .split('/')
            .nth(1)
            .filter(|s| !s.is_empty())
            .unwrap_or("unknown")
            .to_ascii_lowercase();
        *analysis.file_types.entry(subtype).or_insert(0) += 1;

        if largest.map_or(true, |l| file.byte_size > l.byte_size) {
            largest = Some(file);
        }
        if smallest.map_or(true, |s| file.byte_size < s.byte_size) {
            smallest = Some(file);
        }

        if file.byte_size > LARGE_FILE_BYTES {
            analysis.advice.push(Advice {
                kind: AdviceKind::LargeFile,
                priority: Priority::Medium,
                file: Some(file.name.clone()),
                message: "large file, processing may be slow".to_string(),
            });
        }
        if file.mime_type.eq_ignore_ascii_case("image/gif") {
            analysis.advice.push(Advice {
                kind: AdviceKind::AnimatedGif,
                priority: Priority::Medium,
                file: Some(file.name.clone()),
                message: "GIF: only the first frame will be processed".to_string(),
            });
        }
    }
    analysis.largest_file = largest.map(|f| f.name.clone());
    analysis.smallest_file = smallest.map(|f| f.name.clone());
    analysis.average_size = analysis.total_size as f64 / files.len() as f64;

    for lossless in ["png", "bmp"] {
        if let Some(&count) = analysis.file_types.get(lossless) {
            analysis.advice.push(Advice {
                kind: AdviceKind::ConvertLossless,
                priority: Priority::High,
                file: None,
                message: format!(
                    "{count} {} file(s): converting to WebP will reduce size",
                    lossless.to_ascii_uppercase()
                ),
            });
        }
    }
    if analysis.average_size > LARGE_AVERAGE_BYTES {
        analysis.advice.push(Advice {
            kind: AdviceKind::ResizeSuggested,
            priority: Priority::Medium,
            file: None,
            message: "large files on average, resizing is recommended".to_string(),
        });
    }
    if files.len() > LARGE_BATCH_FILES {
        analysis.advice.push(Advice {
            kind: AdviceKind::LargeBatch,
            priority: Priority::Medium,
            file: None,
            message: format!("{} files selected, processing may take several minutes", files.len()),
        });
    }
    analysis
}
