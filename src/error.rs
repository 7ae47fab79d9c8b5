// src/error.rs
//
// Unified error handling for batchpress
// Uses thiserror for simple, type-safe error handling
//
// Error Taxonomy:
// - Validation: item rejected before the run starts
// - ItemTransform: decode/crop/resize/encode failure of one item, batch continues
// - Cancellation: user stopped the run, partial results are returned
// - BatchFault: the run never starts (empty input, invalid configuration)
// - InternalBug: caught panics inside native codecs

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use thiserror::Error;

/// Error taxonomy used by the pipeline to decide what propagates to the caller.
///
/// Only `BatchFault` (and `InternalBug` raised outside an item) ever escapes
/// `BatchProcessor::run`; everything else is collected into reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// Bad type, too large, corrupted. Item dropped before the run.
    Validation,
    /// Failure while transforming one item. Item skipped.
    ItemTransform,
    /// User-initiated stop.
    Cancellation,
    /// Zero valid items or invalid configuration. Batch never starts.
    BatchFault,
    /// Library bugs (should not happen)
    InternalBug,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "ValidationError",
            ErrorCategory::ItemTransform => "ItemTransformError",
            ErrorCategory::Cancellation => "CancellationSignal",
            ErrorCategory::BatchFault => "BatchFault",
            ErrorCategory::InternalBug => "InternalBug",
        }
    }
}

/// batchpress error types
#[derive(Debug, Error)]
pub enum PressError {
    // File I/O Errors
    #[error("File not found: {path}")]
    FileNotFound { path: Cow<'static, str> },

    #[error("Failed to read file '{path}': {source}")]
    FileReadFailed {
        path: Cow<'static, str>,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to memory-map file '{path}': {source}")]
    MmapFailed {
        path: Cow<'static, str>,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    FileWriteFailed {
        path: Cow<'static, str>,
        #[source]
        source: std::io::Error,
    },

    // Admission Errors
    #[error("{name}: unsupported type '{mime_type}'")]
    UnsupportedType {
        name: Cow<'static, str>,
        mime_type: Cow<'static, str>,
    },

    #[error("{name}: too large ({size} bytes, max {max})")]
    FileTooLarge {
        name: Cow<'static, str>,
        size: u64,
        max: u64,
    },

    #[error("{name}: total size exceeded ({total} bytes, max {max})")]
    TotalSizeExceeded {
        name: Cow<'static, str>,
        total: u64,
        max: u64,
    },

    #[error("{name}: corrupted or unreadable ({message})")]
    CorruptedFile {
        name: Cow<'static, str>,
        message: Cow<'static, str>,
    },

    // Decode Errors
    #[error("Unsupported image format: {format}")]
    UnsupportedFormat { format: Cow<'static, str> },

    #[error("Failed to decode image: {message}")]
    DecodeFailed { message: Cow<'static, str> },

    #[error("Corrupted image data")]
    CorruptedImage,

    // Size Limit Errors
    #[error("Image dimension {dimension} exceeds maximum {max}")]
    DimensionExceedsLimit { dimension: u32, max: u32 },

    #[error("Image pixel count {pixels} exceeds maximum {max}")]
    PixelCountExceedsLimit { pixels: u64, max: u64 },

    // Operation Errors
    #[error("Invalid crop dimensions: width={width}, height={height}")]
    InvalidCropDimensions { width: u32, height: u32 },

    #[error("Resize failed ({source_width}x{source_height} -> {target_width}x{target_height}): {message}")]
    ResizeFailed {
        source_width: u32,
        source_height: u32,
        target_width: u32,
        target_height: u32,
        message: Cow<'static, str>,
    },

    // Encode Errors
    #[error("Failed to encode as {format}: {message}")]
    EncodeFailed {
        format: Cow<'static, str>,
        message: Cow<'static, str>,
    },

    #[error("Failed to build archive: {message}")]
    ArchiveFailed { message: Cow<'static, str> },

    #[error("Item '{name}' did not finish within {timeout_ms}ms")]
    ItemTimedOut {
        name: Cow<'static, str>,
        timeout_ms: u64,
    },

    // Run Errors
    #[error("Batch cancelled after {processed} item(s)")]
    Cancelled { processed: usize },

    #[error("No input files")]
    EmptyInput,

    #[error("Unknown preset: '{name}'. Available: ecommerce, instagram, linkedin, web")]
    InvalidPreset { name: Cow<'static, str> },

    #[error("Invalid settings: {name}={value}. {reason}")]
    InvalidSettings {
        name: Cow<'static, str>,
        value: Cow<'static, str>,
        reason: Cow<'static, str>,
    },

    #[error("Invalid configuration: {name}={value}. {reason}")]
    InvalidConfig {
        name: Cow<'static, str>,
        value: Cow<'static, str>,
        reason: Cow<'static, str>,
    },

    // Internal Errors
    #[error("Internal error: {message}")]
    InternalPanic { message: Cow<'static, str> },
}

fn clone_io(source: &std::io::Error) -> std::io::Error {
    std::io::Error::new(source.kind(), source.to_string())
}

impl Clone for PressError {
    fn clone(&self) -> Self {
        match self {
            Self::FileNotFound { path } => Self::FileNotFound { path: path.clone() },
            Self::FileReadFailed { path, source } => Self::FileReadFailed {
                path: path.clone(),
                source: clone_io(source),
            },
            Self::MmapFailed { path, source } => Self::MmapFailed {
                path: path.clone(),
                source: clone_io(source),
            },
            Self::FileWriteFailed { path, source } => Self::FileWriteFailed {
                path: path.clone(),
                source: clone_io(source),
            },
            Self::UnsupportedType { name, mime_type } => Self::UnsupportedType {
                name: name.clone(),
                mime_type: mime_type.clone(),
            },
            Self::FileTooLarge { name, size, max } => Self::FileTooLarge {
                name: name.clone(),
                size: *size,
                max: *max,
            },
            Self::TotalSizeExceeded { name, total, max } => Self::TotalSizeExceeded {
                name: name.clone(),
                total: *total,
                max: *max,
            },
            Self::CorruptedFile { name, message } => Self::CorruptedFile {
                name: name.clone(),
                message: message.clone(),
            },
            Self::UnsupportedFormat { format } => Self::UnsupportedFormat {
                format: format.clone(),
            },
            Self::DecodeFailed { message } => Self::DecodeFailed {
                message: message.clone(),
            },
            Self::CorruptedImage => Self::CorruptedImage,
            Self::DimensionExceedsLimit { dimension, max } => Self::DimensionExceedsLimit {
                dimension: *dimension,
                max: *max,
            },
            Self::PixelCountExceedsLimit { pixels, max } => Self::PixelCountExceedsLimit {
                pixels: *pixels,
                max: *max,
            },
            Self::InvalidCropDimensions { width, height } => Self::InvalidCropDimensions {
                width: *width,
                height: *height,
            },
            Self::ResizeFailed {
                source_width,
                source_height,
                target_width,
                target_height,
                message,
            } => Self::ResizeFailed {
                source_width: *source_width,
                source_height: *source_height,
                target_width: *target_width,
                target_height: *target_height,
                message: message.clone(),
            },
            Self::EncodeFailed { format, message } => Self::EncodeFailed {
                format: format.clone(),
                message: message.clone(),
            },
            Self::ArchiveFailed { message } => Self::ArchiveFailed {
                message: message.clone(),
            },
            Self::ItemTimedOut { name, timeout_ms } => Self::ItemTimedOut {
                name: name.clone(),
                timeout_ms: *timeout_ms,
            },
            Self::Cancelled { processed } => Self::Cancelled {
                processed: *processed,
            },
            Self::EmptyInput => Self::EmptyInput,
            Self::InvalidPreset { name } => Self::InvalidPreset { name: name.clone() },
            Self::InvalidSettings {
                name,
                value,
                reason,
            } => Self::InvalidSettings {
                name: name.clone(),
                value: value.clone(),
                reason: reason.clone(),
            },
            Self::InvalidConfig {
                name,
                value,
                reason,
            } => Self::InvalidConfig {
                name: name.clone(),
                value: value.clone(),
                reason: reason.clone(),
            },
            Self::InternalPanic { message } => Self::InternalPanic {
                message: message.clone(),
            },
        }
    }
}

// Constructor Helpers
impl PressError {
    pub fn file_not_found(path: impl Into<Cow<'static, str>>) -> Self {
        Self::FileNotFound { path: path.into() }
    }

    pub fn file_read_failed(path: impl Into<Cow<'static, str>>, source: std::io::Error) -> Self {
        Self::FileReadFailed {
            path: path.into(),
            source,
        }
    }

    pub fn mmap_failed(path: impl Into<Cow<'static, str>>, source: std::io::Error) -> Self {
        Self::MmapFailed {
            path: path.into(),
            source,
        }
    }

    pub fn file_write_failed(path: impl Into<Cow<'static, str>>, source: std::io::Error) -> Self {
        Self::FileWriteFailed {
            path: path.into(),
            source,
        }
    }

    pub fn unsupported_type(
        name: impl Into<Cow<'static, str>>,
        mime_type: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::UnsupportedType {
            name: name.into(),
            mime_type: mime_type.into(),
        }
    }

    pub fn file_too_large(name: impl Into<Cow<'static, str>>, size: u64, max: u64) -> Self {
        Self::FileTooLarge {
            name: name.into(),
            size,
            max,
        }
    }

    pub fn total_size_exceeded(name: impl Into<Cow<'static, str>>, total: u64, max: u64) -> Self {
        Self::TotalSizeExceeded {
            name: name.into(),
            total,
            max,
        }
    }

    pub fn corrupted_file(
        name: impl Into<Cow<'static, str>>,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::CorruptedFile {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn unsupported_format(format: impl Into<Cow<'static, str>>) -> Self {
        Self::UnsupportedFormat {
            format: format.into(),
        }
    }

    pub fn decode_failed(message: impl Into<Cow<'static, str>>) -> Self {
        Self::DecodeFailed {
            message: message.into(),
        }
    }

    pub fn corrupted_image() -> Self {
        Self::CorruptedImage
    }

    pub fn dimension_exceeds_limit(dimension: u32, max: u32) -> Self {
        Self::DimensionExceedsLimit { dimension, max }
    }

    pub fn pixel_count_exceeds_limit(pixels: u64, max: u64) -> Self {
        Self::PixelCountExceedsLimit { pixels, max }
    }

    pub fn invalid_crop_dimensions(width: u32, height: u32) -> Self {
        Self::InvalidCropDimensions { width, height }
    }

    pub fn resize_failed(
        source_dims: (u32, u32),
        target_dims: (u32, u32),
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::ResizeFailed {
            source_width: source_dims.0,
            source_height: source_dims.1,
            target_width: target_dims.0,
            target_height: target_dims.1,
            message: message.into(),
        }
    }

    pub fn encode_failed(
        format: impl Into<Cow<'static, str>>,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::EncodeFailed {
            format: format.into(),
            message: message.into(),
        }
    }

    pub fn archive_failed(message: impl Into<Cow<'static, str>>) -> Self {
        Self::ArchiveFailed {
            message: message.into(),
        }
    }

    pub fn item_timed_out(name: impl Into<Cow<'static, str>>, timeout_ms: u64) -> Self {
        Self::ItemTimedOut {
            name: name.into(),
            timeout_ms,
        }
    }

    pub fn cancelled(processed: usize) -> Self {
        Self::Cancelled { processed }
    }

    pub fn empty_input() -> Self {
        Self::EmptyInput
    }

    pub fn invalid_preset(name: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidPreset { name: name.into() }
    }

    pub fn invalid_settings(
        name: impl Into<Cow<'static, str>>,
        value: impl Into<Cow<'static, str>>,
        reason: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::InvalidSettings {
            name: name.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_config(
        name: impl Into<Cow<'static, str>>,
        value: impl Into<Cow<'static, str>>,
        reason: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::InvalidConfig {
            name: name.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    pub fn internal_panic(message: impl Into<Cow<'static, str>>) -> Self {
        Self::InternalPanic {
            message: message.into(),
        }
    }

    /// Check if this error is recoverable, i.e. the batch can keep going.
    ///
    /// Consistent with category(): BatchFault and InternalBug are fatal for
    /// whatever raised them, everything else is collected and reported.
    pub fn is_recoverable(&self) -> bool {
        match self.category() {
            ErrorCategory::Validation
            | ErrorCategory::ItemTransform
            | ErrorCategory::Cancellation => true,
            ErrorCategory::BatchFault | ErrorCategory::InternalBug => false,
        }
    }

    /// Get the error category for this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::UnsupportedType { .. }
            | Self::FileTooLarge { .. }
            | Self::TotalSizeExceeded { .. }
            | Self::CorruptedFile { .. } => ErrorCategory::Validation,

            // I/O against a source happens while an item is being transformed
            Self::FileNotFound { .. }
            | Self::FileReadFailed { .. }
            | Self::MmapFailed { .. }
            | Self::UnsupportedFormat { .. }
            | Self::DecodeFailed { .. }
            | Self::CorruptedImage
            | Self::DimensionExceedsLimit { .. }
            | Self::PixelCountExceedsLimit { .. }
            | Self::InvalidCropDimensions { .. }
            | Self::ResizeFailed { .. }
            | Self::EncodeFailed { .. }
            | Self::ItemTimedOut { .. } => ErrorCategory::ItemTransform,

            Self::Cancelled { .. } => ErrorCategory::Cancellation,

            // Delivery failures happen after every item settled; the run as a whole failed.
            Self::EmptyInput
            | Self::InvalidPreset { .. }
            | Self::InvalidSettings { .. }
            | Self::InvalidConfig { .. }
            | Self::ArchiveFailed { .. }
            | Self::FileWriteFailed { .. } => ErrorCategory::BatchFault,

            Self::InternalPanic { .. } => ErrorCategory::InternalBug,
        }
    }
}

// Result type alias
pub type Result<T> = std::result::Result<T, PressError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PressError::file_too_large("big.jpg", 60, 50);
        assert!(err.to_string().contains("big.jpg"));
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn test_error_recoverable() {
        assert!(PressError::corrupted_file("a.png", "bad header").is_recoverable());
        assert!(PressError::decode_failed("test").is_recoverable());
        assert!(PressError::cancelled(5).is_recoverable());
        assert!(!PressError::empty_input().is_recoverable());
        assert!(!PressError::internal_panic("test").is_recoverable());
    }

    #[test]
    fn test_error_category_validation() {
        assert_eq!(
            PressError::unsupported_type("a.txt", "text/plain").category(),
            ErrorCategory::Validation
        );
        assert_eq!(
            PressError::total_size_exceeded("a.jpg", 300, 200).category(),
            ErrorCategory::Validation
        );
    }

    #[test]
    fn test_error_category_item_transform() {
        assert_eq!(
            PressError::encode_failed("jpeg", "test").category(),
            ErrorCategory::ItemTransform
        );
        assert_eq!(
            PressError::resize_failed((100, 100), (50, 50), "test").category(),
            ErrorCategory::ItemTransform
        );
        assert_eq!(
            PressError::item_timed_out("slow.png", 30_000).category(),
            ErrorCategory::ItemTransform
        );
        assert_eq!(
            PressError::file_read_failed(
                "gone.jpg",
                std::io::Error::from(std::io::ErrorKind::NotFound)
            )
            .category(),
            ErrorCategory::ItemTransform
        );
    }

    #[test]
    fn test_error_category_batch_fault() {
        assert_eq!(PressError::empty_input().category(), ErrorCategory::BatchFault);
        assert_eq!(
            PressError::invalid_preset("tiktok").category(),
            ErrorCategory::BatchFault
        );
        assert_eq!(
            PressError::invalid_config("chunk_size", "0", "must be positive").category(),
            ErrorCategory::BatchFault
        );
    }

    #[test]
    fn test_clone_preserves_message() {
        let err = PressError::file_read_failed(
            "x.png",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(err.clone().to_string(), err.to_string());
    }

    #[test]
    fn test_category_as_str() {
        assert_eq!(ErrorCategory::Validation.as_str(), "ValidationError");
        assert_eq!(ErrorCategory::Cancellation.as_str(), "CancellationSignal");
    }
}
