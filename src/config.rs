// src/config.rs
//
// Processor limits and tuning constants, with BATCHPRESS_* environment overrides.

use crate::error::PressError;
use crate::ops::OutputFormat;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

pub const DEFAULT_MAX_FILE_SIZE: u64 = 50 * MIB;
pub const DEFAULT_MAX_TOTAL_SIZE: u64 = 200 * MIB;
pub const DEFAULT_MAX_DIMENSION: u32 = 4096;
pub const DEFAULT_CHUNK_SIZE: usize = 5;
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_ITEM_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CO2_GRAMS_PER_MB: f64 = 0.5;
pub const DEFAULT_CACHE_CAPACITY: usize = 50;
/// Decoded images above this pixel count are never cached (~ 8MB RGBA).
pub const DEFAULT_CACHE_MAX_PIXELS: u64 = 2_000_000;
pub const DEFAULT_MEMORY_CHECK_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_MEMORY_PRESSURE_RATIO: f64 = 0.8;
pub const DEFAULT_ARCHIVE_LEVEL: u32 = 6;

const ENV_PREFIX: &str = "BATCHPRESS_";

type ConfigResult<T> = std::result::Result<T, PressError>;

/// `factor = base + quality_weight * quality / 100` before source-format adjustments.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionFactor {
    pub base: f64,
    pub quality_weight: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompressionFactors {
    pub webp: CompressionFactor,
    pub jpeg: CompressionFactor,
    pub png: CompressionFactor,
}

impl Default for CompressionFactors {
    fn default() -> Self {
        Self {
            webp: CompressionFactor {
                base: 0.7,
                quality_weight: 0.3,
            },
            jpeg: CompressionFactor {
                base: 0.8,
                quality_weight: 0.4,
            },
            png: CompressionFactor {
                base: 0.9,
                quality_weight: 0.1,
            },
        }
    }
}

impl CompressionFactors {
    pub fn for_format(&self, format: OutputFormat) -> CompressionFactor {
        match format {
            OutputFormat::WebP => self.webp,
            OutputFormat::Jpeg => self.jpeg,
            OutputFormat::Png => self.png,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorConfig {
    pub max_file_size: u64,
    pub max_total_size: u64,
    /// Sources larger than this on either axis are downscaled before any transform.
    pub max_dimension: u32,
    pub chunk_size: usize,
    pub probe_timeout: Duration,
    /// Hard ceiling per item; `None` waits forever.
    pub item_timeout: Option<Duration>,
    pub co2_grams_per_mb: f64,
    pub cache_capacity: usize,
    pub cache_max_pixels: u64,
    pub memory_check_interval: Duration,
    pub memory_pressure_ratio: f64,
    /// Explicit budget for the pressure check; detected from the host when `None`.
    pub memory_budget: Option<u64>,
    pub archive_level: u32,
    pub compression: CompressionFactors,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_total_size: DEFAULT_MAX_TOTAL_SIZE,
            max_dimension: DEFAULT_MAX_DIMENSION,
            chunk_size: DEFAULT_CHUNK_SIZE,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            item_timeout: Some(DEFAULT_ITEM_TIMEOUT),
            co2_grams_per_mb: DEFAULT_CO2_GRAMS_PER_MB,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            cache_max_pixels: DEFAULT_CACHE_MAX_PIXELS,
            memory_check_interval: DEFAULT_MEMORY_CHECK_INTERVAL,
            memory_pressure_ratio: DEFAULT_MEMORY_PRESSURE_RATIO,
            memory_budget: None,
            archive_level: DEFAULT_ARCHIVE_LEVEL,
            compression: CompressionFactors::default(),
        }
    }
}

impl ProcessorConfig {
    /// Defaults with `BATCHPRESS_*` environment overrides applied.
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` but reads values through `lookup` (keys include the prefix).
    pub fn from_lookup<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = parse_var::<u64>(&get, "MAX_FILE_SIZE")? {
            config.max_file_size = v;
        }
        if let Some(v) = parse_var::<u64>(&get, "MAX_TOTAL_SIZE")? {
            config.max_total_size = v;
        }
        if let Some(v) = parse_var::<u32>(&get, "MAX_DIMENSION")? {
            config.max_dimension = v;
        }
        if let Some(v) = parse_var::<usize>(&get, "CHUNK_SIZE")? {
            config.chunk_size = v;
        }
        if let Some(v) = parse_var::<u64>(&get, "PROBE_TIMEOUT_MS")? {
            config.probe_timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse_var::<u64>(&get, "ITEM_TIMEOUT_MS")? {
            // 0 disables the per-item ceiling
            config.item_timeout = (v > 0).then(|| Duration::from_millis(v));
        }
        if let Some(v) = parse_var::<u64>(&get, "MEMORY_BUDGET")? {
            config.memory_budget = Some(v);
        }
        if let Some(v) = parse_var::<usize>(&get, "CACHE_CAPACITY")? {
            config.cache_capacity = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_file_size == 0 {
            return Err(PressError::invalid_config(
                "max_file_size",
                "0",
                "Must be positive",
            ));
        }
        if self.max_total_size == 0 {
            return Err(PressError::invalid_config(
                "max_total_size",
                "0",
                "Must be positive",
            ));
        }
        if self.max_dimension == 0 {
            return Err(PressError::invalid_config(
                "max_dimension",
                "0",
                "Must be positive",
            ));
        }
        if self.chunk_size == 0 {
            return Err(PressError::invalid_config("chunk_size", "0", "Must be positive"));
        }
        if self.cache_capacity == 0 {
            return Err(PressError::invalid_config(
                "cache_capacity",
                "0",
                "Must be positive",
            ));
        }
        if !(self.memory_pressure_ratio > 0.0 && self.memory_pressure_ratio <= 1.0) {
            return Err(PressError::invalid_config(
                "memory_pressure_ratio",
                self.memory_pressure_ratio.to_string(),
                "Must be within (0, 1]",
            ));
        }
        if self.archive_level > 9 {
            return Err(PressError::invalid_config(
                "archive_level",
                self.archive_level.to_string(),
                "DEFLATE levels range from 0 to 9",
            ));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> ConfigResult<Option<T>> {
    match get(name) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            PressError::invalid_config(
                format!("{ENV_PREFIX}{name}"),
                raw.clone(),
                "Not a valid number",
            )
        }),
    }
}
