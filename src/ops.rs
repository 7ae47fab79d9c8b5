// src/ops.rs
//
// Transform settings: the value objects a batch run snapshots at start and
// shares read-only across every item.

use crate::error::PressError;
use bitflags::bitflags;
use image::ImageFormat;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const MIN_RESIZE_PERCENT: u32 = 10;
pub const MAX_RESIZE_PERCENT: u32 = 200;
pub const MAX_QUALITY: u8 = 100;

/// Tolerance used when checking normalized rectangle bounds (float noise from UIs).
const RECT_EPSILON: f64 = 1e-9;

type OpsResult<T> = std::result::Result<T, PressError>;

bitflags! {
    /// Stages enabled for a run, in execution order crop -> resize -> convert.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Stages: u8 {
        const CROP = 0b0001;
        const RESIZE = 0b0010;
        const CONVERT = 0b0100;
    }
}

/// Output encodings the pipeline can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Jpeg,
    Png,
    #[serde(rename = "webp")]
    WebP,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpeg",
            OutputFormat::Png => "png",
            OutputFormat::WebP => "webp",
        }
    }

    /// File extension used for output names (`jpeg` is written as `jpg`).
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Png => "png",
            OutputFormat::WebP => "webp",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Png => "image/png",
            OutputFormat::WebP => "image/webp",
        }
    }

    /// Map a decoded source format onto an encodable one, if there is a direct match.
    pub fn from_image_format(format: ImageFormat) -> Option<Self> {
        match format {
            ImageFormat::Jpeg => Some(OutputFormat::Jpeg),
            ImageFormat::Png => Some(OutputFormat::Png),
            ImageFormat::WebP => Some(OutputFormat::WebP),
            _ => None,
        }
    }
}

impl FromStr for OutputFormat {
    type Err = PressError;

    fn from_str(s: &str) -> OpsResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(OutputFormat::Jpeg),
            "png" => Ok(OutputFormat::Png),
            "webp" => Ok(OutputFormat::WebP),
            other => Err(PressError::invalid_settings(
                "convert.format",
                other.to_string(),
                "Expected webp, jpeg or png",
            )),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target aspect ratio for automatic cropping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AspectRatio {
    /// No automatic crop is defined; only a manual rectangle can crop.
    Free,
    Ratio { width: u32, height: u32 },
}

impl AspectRatio {
    pub const SQUARE: AspectRatio = AspectRatio::Ratio {
        width: 1,
        height: 1,
    };
    pub const WIDESCREEN: AspectRatio = AspectRatio::Ratio {
        width: 16,
        height: 9,
    };
    pub const STORY: AspectRatio = AspectRatio::Ratio {
        width: 9,
        height: 16,
    };
    pub const LANDSCAPE: AspectRatio = AspectRatio::Ratio {
        width: 4,
        height: 3,
    };
    pub const PORTRAIT: AspectRatio = AspectRatio::Ratio {
        width: 3,
        height: 4,
    };

    pub fn new(width: u32, height: u32) -> OpsResult<Self> {
        if width == 0 || height == 0 {
            return Err(PressError::invalid_settings(
                "crop.ratio",
                format!("{width}/{height}"),
                "Both sides of a ratio must be positive",
            ));
        }
        Ok(AspectRatio::Ratio { width, height })
    }

    /// `width / height`, or `None` for a free ratio.
    pub fn value(&self) -> Option<f64> {
        match self {
            AspectRatio::Free => None,
            AspectRatio::Ratio { width, height } => Some(*width as f64 / *height as f64),
        }
    }

    pub fn is_free(&self) -> bool {
        matches!(self, AspectRatio::Free)
    }

    pub fn label(&self) -> String {
        match self {
            AspectRatio::Free => "free".to_string(),
            AspectRatio::Ratio { width, height } => format!("{width}/{height}"),
        }
    }
}

impl FromStr for AspectRatio {
    type Err = PressError;

    fn from_str(s: &str) -> OpsResult<Self> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("free") {
            return Ok(AspectRatio::Free);
        }
        let (w, h) = trimmed
            .split_once('/')
            .or_else(|| trimmed.split_once(':'))
            .ok_or_else(|| {
                PressError::invalid_settings(
                    "crop.ratio",
                    trimmed.to_string(),
                    "Expected 'free' or 'W/H'",
                )
            })?;
        let parse = |part: &str| {
            part.trim().parse::<u32>().map_err(|_| {
                PressError::invalid_settings(
                    "crop.ratio",
                    trimmed.to_string(),
                    "Ratio sides must be positive integers",
                )
            })
        };
        AspectRatio::new(parse(w)?, parse(h)?)
    }
}

impl TryFrom<String> for AspectRatio {
    type Error = PressError;

    fn try_from(value: String) -> OpsResult<Self> {
        value.parse()
    }
}

impl From<AspectRatio> for String {
    fn from(value: AspectRatio) -> Self {
        value.label()
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Alignment used when cropping reduces one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Anchor {
    #[default]
    Center,
    Left,
    Right,
    Top,
    Bottom,
    /// Use the externally supplied normalized rectangle.
    Manual,
}

impl FromStr for Anchor {
    type Err = PressError;

    fn from_str(s: &str) -> OpsResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "center" | "centre" => Ok(Anchor::Center),
            "left" => Ok(Anchor::Left),
            "right" => Ok(Anchor::Right),
            "top" => Ok(Anchor::Top),
            "bottom" => Ok(Anchor::Bottom),
            "manual" => Ok(Anchor::Manual),
            other => Err(PressError::invalid_settings(
                "crop.anchor",
                other.to_string(),
                "Expected center, left, right, top, bottom or manual",
            )),
        }
    }
}

/// Crop rectangle as fractions of the image size.
///
/// Invariant: every field is finite, `x, y >= 0`, `width, height > 0`,
/// `x + width <= 1` and `y + height <= 1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl NormalizedRect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> OpsResult<Self> {
        let rect = Self {
            x,
            y,
            width,
            height,
        };
        if !rect.is_valid() {
            return Err(PressError::invalid_settings(
                "crop.manualRect",
                format!("{x},{y},{width},{height}"),
                "Rectangle must lie within [0,1] with positive width and height",
            ));
        }
        Ok(rect)
    }

    pub fn is_valid(&self) -> bool {
        let fields = [self.x, self.y, self.width, self.height];
        if fields.iter().any(|v| !v.is_finite()) {
            return false;
        }
        self.x >= 0.0
            && self.y >= 0.0
            && self.width > 0.0
            && self.height > 0.0
            && self.x + self.width <= 1.0 + RECT_EPSILON
            && self.y + self.height <= 1.0 + RECT_EPSILON
    }

    /// Fraction of the source area retained.
    pub fn area(&self) -> f64 {
        self.width * self.height
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeSettings {
    pub percent: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CropSettings {
    pub ratio: AspectRatio,
    #[serde(default)]
    pub anchor: Anchor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual_rect: Option<NormalizedRect>,
}

impl CropSettings {
    pub fn new(ratio: AspectRatio, anchor: Anchor) -> Self {
        Self {
            ratio,
            anchor,
            manual_rect: None,
        }
    }

    pub fn manual(rect: NormalizedRect) -> Self {
        Self {
            ratio: AspectRatio::Free,
            anchor: Anchor::Manual,
            manual_rect: Some(rect),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvertSettings {
    pub format: OutputFormat,
    pub quality: u8,
}

/// Per-run settings. Absent stages are disabled.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resize: Option<ResizeSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crop: Option<CropSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub convert: Option<ConvertSettings>,
}

impl TransformSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resize(mut self, percent: u32) -> Self {
        self.resize = Some(ResizeSettings { percent });
        self
    }

    pub fn with_crop(mut self, ratio: AspectRatio, anchor: Anchor) -> Self {
        self.crop = Some(CropSettings::new(ratio, anchor));
        self
    }

    pub fn with_manual_crop(mut self, rect: NormalizedRect) -> Self {
        self.crop = Some(CropSettings::manual(rect));
        self
    }

    pub fn with_convert(mut self, format: OutputFormat, quality: u8) -> Self {
        self.convert = Some(ConvertSettings { format, quality });
        self
    }

    pub fn stages(&self) -> Stages {
        let mut stages = Stages::empty();
        stages.set(Stages::CROP, self.crop.is_some());
        stages.set(Stages::RESIZE, self.resize.is_some());
        stages.set(Stages::CONVERT, self.convert.is_some());
        stages
    }

    /// Reject out-of-range values before a run starts.
    pub fn validate(&self) -> OpsResult<()> {
        if let Some(resize) = &self.resize {
            if !(MIN_RESIZE_PERCENT..=MAX_RESIZE_PERCENT).contains(&resize.percent) {
                return Err(PressError::invalid_settings(
                    "resize.percent",
                    resize.percent.to_string(),
                    format!("Must be between {MIN_RESIZE_PERCENT} and {MAX_RESIZE_PERCENT}"),
                ));
            }
        }
        if let Some(convert) = &self.convert {
            if convert.quality > MAX_QUALITY {
                return Err(PressError::invalid_settings(
                    "convert.quality",
                    convert.quality.to_string(),
                    "Must be between 0 and 100",
                ));
            }
        }
        if let Some(rect) = self.crop.as_ref().and_then(|c| c.manual_rect.as_ref()) {
            if !rect.is_valid() {
                return Err(PressError::invalid_settings(
                    "crop.manualRect",
                    format!("{},{},{},{}", rect.x, rect.y, rect.width, rect.height),
                    "Rectangle must lie within [0,1] with positive width and height",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aspect_ratio_parse() {
        assert_eq!("16/9".parse::<AspectRatio>().unwrap(), AspectRatio::WIDESCREEN);
        assert_eq!("1:1".parse::<AspectRatio>().unwrap(), AspectRatio::SQUARE);
        assert_eq!("free".parse::<AspectRatio>().unwrap(), AspectRatio::Free);
        assert!("16/0".parse::<AspectRatio>().is_err());
        assert!("wide".parse::<AspectRatio>().is_err());
    }

    #[test]
    fn test_aspect_ratio_value() {
        assert_eq!(AspectRatio::Free.value(), None);
        let v = AspectRatio::WIDESCREEN.value().unwrap();
        assert!((v - 16.0 / 9.0).abs() < 1e-12);
    }

    #[test]
    fn test_output_format_extension() {
        assert_eq!(OutputFormat::Jpeg.extension(), "jpg");
        assert_eq!("JPG".parse::<OutputFormat>().unwrap(), OutputFormat::Jpeg);
        assert!("avif".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_normalized_rect_invariant() {
        assert!(NormalizedRect::new(0.0, 0.0, 1.0, 1.0).is_ok());
        assert!(NormalizedRect::new(0.5, 0.0, 0.6, 1.0).is_err());
        assert!(NormalizedRect::new(0.0, 0.0, 0.0, 1.0).is_err());
        assert!(NormalizedRect::new(-0.1, 0.0, 0.5, 0.5).is_err());
        assert!(NormalizedRect::new(f64::NAN, 0.0, 0.5, 0.5).is_err());
    }

    #[test]
    fn test_stages_flags() {
        let settings = TransformSettings::new()
            .with_resize(50)
            .with_convert(OutputFormat::WebP, 80);
        let stages = settings.stages();
        assert!(stages.contains(Stages::RESIZE | Stages::CONVERT));
        assert!(!stages.contains(Stages::CROP));
    }

    #[test]
    fn test_validate_ranges() {
        assert!(TransformSettings::new().with_resize(10).validate().is_ok());
        assert!(TransformSettings::new().with_resize(9).validate().is_err());
        assert!(TransformSettings::new().with_resize(201).validate().is_err());
        assert!(TransformSettings::new()
            .with_convert(OutputFormat::Jpeg, 101)
            .validate()
            .is_err());
    }

    #[test]
    fn test_settings_serde_camel_case() {
        let settings = TransformSettings::new()
            .with_crop(AspectRatio::WIDESCREEN, Anchor::Top)
            .with_convert(OutputFormat::WebP, 90);
        let json = serde_json::to_string(&settings).unwrap();
        assert!(json.contains("\"ratio\":\"16/9\""));
        assert!(json.contains("\"format\":\"webp\""));
        let back: TransformSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(back, settings);
    }
}
