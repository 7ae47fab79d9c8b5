// src/engine/estimator.rs
//
// Savings estimator: predicts output size from settings alone, never decoding.
// Stage factors compose on a running size in pipeline order (crop, resize,
// compression).

use crate::config::CompressionFactors;
use crate::engine::io::InputFile;
use crate::ops::{Anchor, AspectRatio, CropSettings, OutputFormat, Stages, TransformSettings};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Estimates never drop below this fraction of the original size.
pub const MIN_ESTIMATE_RATIO: f64 = 0.1;
/// Upper bound on any single compression factor.
pub const MAX_COMPRESSION_FACTOR: f64 = 0.95;

const PNG_SOURCE_ADJUSTMENT: f64 = 0.6;
const JPEG_TO_WEBP_ADJUSTMENT: f64 = 0.8;

const BASE_SECONDS_PER_FILE: f64 = 0.5;
const RESIZE_SECONDS_PER_SCALE: f64 = 0.2;
const CROP_SECONDS: f64 = 0.3;

const MAX_PERFORMANCE_SCORE: u8 = 100;
/// Space saving claimed by a settings profile never exceeds this percentage.
pub const MAX_PROFILE_SPACE_SAVING: f64 = 85.0;

/// Bytes removed by each stage (negative when a stage grows the size).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SavingsBreakdown {
    pub crop: f64,
    pub resize: f64,
    pub compression: f64,
}

impl SavingsBreakdown {
    fn add(&mut self, other: &SavingsBreakdown) {
        self.crop += other.crop;
        self.resize += other.resize;
        self.compression += other.compression;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavingsEstimate {
    pub original_size: u64,
    /// Always within `[0.1 * original_size, original_size]`.
    pub estimated_size: u64,
    pub breakdown: SavingsBreakdown,
}

impl SavingsEstimate {
    pub fn savings(&self) -> u64 {
        self.original_size.saturating_sub(self.estimated_size)
    }

    pub fn savings_percent(&self) -> f64 {
        if self.original_size == 0 {
            return 0.0;
        }
        self.savings() as f64 / self.original_size as f64 * 100.0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEstimate {
    pub original_size: u64,
    pub estimated_size: u64,
    pub breakdown: SavingsBreakdown,
    pub files: Vec<SavingsEstimate>,
}

impl BatchEstimate {
    pub fn savings(&self) -> u64 {
        self.original_size.saturating_sub(self.estimated_size)
    }
}

/// Fraction of the area a crop is expected to keep.
pub fn crop_factor(crop: &CropSettings) -> f64 {
    if crop.anchor == Anchor::Manual {
        if let Some(rect) = crop.manual_rect.filter(|r| r.is_valid()) {
            return rect.area();
        }
    }
    match crop.ratio {
        AspectRatio::Free => 0.85,
        AspectRatio::SQUARE => 0.70,
        AspectRatio::WIDESCREEN => 0.80,
        AspectRatio::LANDSCAPE => 0.85,
        AspectRatio::PORTRAIT => 0.80,
        AspectRatio::STORY => 0.70,
        AspectRatio::Ratio { .. } => 0.80,
    }
}

/// Area scaling: `(percent / 100)^2`.
pub fn resize_factor(percent: u32) -> f64 {
    let scale = percent as f64 / 100.0;
    scale * scale
}

fn source_format(mime_type: &str) -> Option<OutputFormat> {
    match mime_type.to_ascii_lowercase().as_str() {
        "image/png" => Some(OutputFormat::Png),
        "image/jpeg" | "image/jpg" => Some(OutputFormat::Jpeg),
        "image/webp" => Some(OutputFormat::WebP),
        _ => None,
    }
}

/// `base' * (base + quality_weight * quality / 100)`, capped at 0.95, where
/// `base'` is lowered when the source format compresses worse than the target.
pub fn compression_factor(
    source_mime: &str,
    target: OutputFormat,
    quality: u8,
    factors: &CompressionFactors,
) -> f64 {
    let factor = factors.for_format(target);
    let adjustment = match (source_format(source_mime), target) {
        (Some(OutputFormat::Png), OutputFormat::Jpeg | OutputFormat::WebP) => PNG_SOURCE_ADJUSTMENT,
        (Some(OutputFormat::Jpeg), OutputFormat::WebP) => JPEG_TO_WEBP_ADJUSTMENT,
        _ => 1.0,
    };
    let quality = quality.min(100) as f64 / 100.0;
    let quality_factor = factor.base + factor.quality_weight * quality;
    (factor.base * adjustment * quality_factor).min(MAX_COMPRESSION_FACTOR)
}

/// Predict the output size of one file.
pub fn estimate(
    file: &InputFile,
    settings: &TransformSettings,
    factors: &CompressionFactors,
) -> SavingsEstimate {
    let original = file.byte_size as f64;
    let mut size = original;
    let mut breakdown = SavingsBreakdown::default();

    if let Some(crop) = &settings.crop {
        let next = size * crop_factor(crop);
        breakdown.crop = size - next;
        size = next;
    }
    if let Some(resize) = &settings.resize {
        let next = size * resize_factor(resize.percent);
        breakdown.resize = size - next;
        size = next;
    }
    if let Some(convert) = &settings.convert {
        let next = size * compression_factor(&file.mime_type, convert.format, convert.quality, factors);
        breakdown.compression = size - next;
        size = next;
    }

    let clamped = size.clamp(original * MIN_ESTIMATE_RATIO, original);
    SavingsEstimate {
        original_size: file.byte_size,
        estimated_size: clamped.round() as u64,
        breakdown,
    }
}

/// Sum of per-file estimates.
pub fn estimate_batch(
    files: &[InputFile],
    settings: &TransformSettings,
    factors: &CompressionFactors,
) -> BatchEstimate {
    let mut batch = BatchEstimate::default();
    for file in files {
        let est = estimate(file, settings, factors);
        batch.original_size += est.original_size;
        batch.estimated_size += est.estimated_size;
        batch.breakdown.add(&est.breakdown);
        batch.files.push(est);
    }
    batch
}

/// Rough wall-clock prediction for a batch.
pub fn estimate_processing_time(files: &[InputFile], settings: &TransformSettings) -> Duration {
    let mut per_file = BASE_SECONDS_PER_FILE;
    if let Some(resize) = &settings.resize {
        per_file += RESIZE_SECONDS_PER_SCALE * (resize.percent as f64 / 100.0);
    }
    if settings.stages().contains(Stages::CROP) {
        per_file += CROP_SECONDS;
    }
    if let Some(convert) = &settings.convert {
        per_file += match convert.format {
            OutputFormat::WebP => 0.3,
            OutputFormat::Png => 0.5,
            OutputFormat::Jpeg => 0.4,
        };
    }
    Duration::from_secs_f64(per_file * files.len() as f64)
}

/// 0-100 rating of how much a settings combination optimizes: format and
/// quality for conversion, moderate resize percentages, any crop, and a bonus
/// for combining two or more stages.
pub fn performance_score(settings: &TransformSettings) -> u8 {
    let mut score: u32 = 0;
    if let Some(convert) = &settings.convert {
        score += match convert.format {
            OutputFormat::WebP => 30,
            OutputFormat::Jpeg => 20,
            OutputFormat::Png => 10,
        };
        score += match convert.quality {
            80..=90 => 15,
            70..=79 => 10,
            _ => 0,
        };
    }
    if let Some(resize) = &settings.resize {
        score += match resize.percent {
            70..=90 => 25,
            50..=69 => 20,
            _ => 10,
        };
    }
    if settings.crop.is_some() {
        score += 15;
    }
    if settings.stages().bits().count_ones() >= 2 {
        score += 15;
    }
    score.min(MAX_PERFORMANCE_SCORE as u32) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceLevel {
    Light,
    Moderate,
    Intensive,
}

/// Cost and benefit of running one settings profile over a number of files.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfilePerformance {
    /// 1.0 plus 0.3 for resize, 0.4 for crop, 0.5 for conversion.
    pub complexity: f64,
    pub estimated_time: Duration,
    /// Percent, capped at `MAX_PROFILE_SPACE_SAVING`. Negative for upscales.
    pub space_saving: f64,
    pub level: PerformanceLevel,
}

/// Profile-level estimate used to compare presets; unlike `estimate` it
/// ignores the source files and only weighs the stages.
pub fn profile_performance(settings: &TransformSettings, files_count: usize) -> ProfilePerformance {
    let mut complexity = 1.0;
    let mut time_multiplier = 1.0;
    let mut space_saving = 0.0;

    if let Some(resize) = &settings.resize {
        complexity += 0.3;
        let scale = resize.percent as f64 / 100.0;
        // upscaling is slower
        time_multiplier *= if scale > 1.0 { 1.2 } else { 0.8 };
        space_saving += (1.0 - scale * scale) * 100.0;
    }
    if settings.crop.is_some() {
        complexity += 0.4;
    }
    if let Some(convert) = &settings.convert {
        complexity += 0.5;
        match convert.format {
            OutputFormat::WebP => {
                time_multiplier *= 0.9;
                space_saving += 25.0;
            }
            OutputFormat::Png => time_multiplier *= 1.3,
            OutputFormat::Jpeg => space_saving += 15.0,
        }
    }

    let seconds = BASE_SECONDS_PER_FILE * complexity * time_multiplier * files_count as f64;
    let level = if complexity > 2.0 {
        PerformanceLevel::Intensive
    } else if complexity > 1.5 {
        PerformanceLevel::Moderate
    } else {
        PerformanceLevel::Light
    };
    ProfilePerformance {
        complexity,
        estimated_time: Duration::from_secs_f64(seconds),
        space_saving: space_saving.min(MAX_PROFILE_SPACE_SAVING),
        level,
    }
}
