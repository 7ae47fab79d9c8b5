// src/engine/encoder.rs
//
// Encoder operations: JPEG (mozjpeg), PNG (image + oxipng), WebP (libwebp),
// plus the quality floors applied when converting.

use crate::engine::common::run_with_panic_policy;
use crate::error::PressError;
use crate::ops::{ConvertSettings, OutputFormat};
use image::{DynamicImage, ImageFormat};
use mozjpeg::{ColorSpace, Compress, ScanMode};
use std::borrow::Cow;
use std::io::Cursor;

type EncoderResult<T> = std::result::Result<T, PressError>;

/// Lowest quality a WebP conversion is allowed to use.
pub const WEBP_QUALITY_FLOOR: u8 = 80;
/// Lowest quality a JPEG conversion is allowed to use.
pub const JPEG_QUALITY_FLOOR: u8 = 85;
/// Quality used when re-encoding in the source format.
pub const PRESERVE_QUALITY: u8 = 95;

/// Quality-derived codec knobs. Bands are fixed so outputs stay reproducible:
/// - High (>=85)
/// - Balanced (70-84)
/// - Fast (<70)
#[derive(Debug, Clone, Copy)]
pub struct QualitySettings {
    quality: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QualityBand {
    High,
    Balanced,
    Fast,
}

impl QualitySettings {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.min(100) as f32,
        }
    }

    fn band(&self) -> QualityBand {
        if self.quality >= 85.0 {
            QualityBand::High
        } else if self.quality >= 70.0 {
            QualityBand::Balanced
        } else {
            QualityBand::Fast
        }
    }

    pub fn jpeg_smoothing(&self) -> u8 {
        if self.quality >= 90.0 {
            0
        } else if self.quality >= 70.0 {
            5
        } else {
            10
        }
    }

    pub fn webp_sns_strength(&self) -> i32 {
        match self.band() {
            QualityBand::High => 50,
            QualityBand::Balanced => 70,
            QualityBand::Fast => 80,
        }
    }

    pub fn webp_filter_strength(&self) -> i32 {
        if self.quality >= 80.0 {
            20
        } else if self.quality >= 60.0 {
            30
        } else {
            40
        }
    }

    pub fn webp_filter_sharpness(&self) -> i32 {
        match self.band() {
            QualityBand::High => 2,
            QualityBand::Balanced | QualityBand::Fast => 0,
        }
    }
}

/// Resolved encoding for one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodePlan {
    pub format: OutputFormat,
    /// 0-100; ignored for PNG (always lossless)
    pub quality: u8,
    /// Output keeps the source format, so the original file extension is kept.
    pub keeps_source_format: bool,
}

impl EncodePlan {
    /// Requested conversion with format floors applied.
    pub fn for_conversion(convert: &ConvertSettings) -> Self {
        let quality = match convert.format {
            OutputFormat::WebP => convert.quality.max(WEBP_QUALITY_FLOOR),
            OutputFormat::Jpeg => convert.quality.max(JPEG_QUALITY_FLOOR),
            OutputFormat::Png => 100,
        };
        Self {
            format: convert.format,
            quality: quality.min(100),
            keeps_source_format: false,
        }
    }

    /// No conversion requested: re-encode in the source format at high quality.
    /// Sources without an encoder here (GIF, BMP, TIFF) fall back to PNG.
    pub fn preserving(source: Option<ImageFormat>) -> Self {
        match source.and_then(OutputFormat::from_image_format) {
            Some(OutputFormat::Png) => Self {
                format: OutputFormat::Png,
                quality: 100,
                keeps_source_format: true,
            },
            Some(format) => Self {
                format,
                quality: PRESERVE_QUALITY,
                keeps_source_format: true,
            },
            None => Self {
                format: OutputFormat::Png,
                quality: 100,
                keeps_source_format: false,
            },
        }
    }
}

/// Encode according to a plan.
pub fn encode(img: &DynamicImage, plan: &EncodePlan) -> EncoderResult<Vec<u8>> {
    match plan.format {
        OutputFormat::Jpeg => encode_jpeg(img, plan.quality),
        OutputFormat::Png => encode_png(img),
        OutputFormat::WebP => encode_webp(img, plan.quality),
    }
}

/// Encode to JPEG using mozjpeg: progressive, 4:2:0, optimized Huffman tables.
pub fn encode_jpeg(img: &DynamicImage, quality: u8) -> EncoderResult<Vec<u8>> {
    run_with_panic_policy("encode:jpeg", || {
        let settings = QualitySettings::new(quality);

        let rgb: Cow<'_, image::RgbImage> = match img {
            DynamicImage::ImageRgb8(rgb_img) => Cow::Borrowed(rgb_img),
            _ => Cow::Owned(img.to_rgb8()),
        };
        let (w, h) = rgb.dimensions();
        let pixels: &[u8] = rgb.as_raw();

        if w == 0 || h == 0 {
            return Err(PressError::encode_failed(
                "jpeg",
                "width or height is zero",
            ));
        }
        let expected_len = (w as usize) * (h as usize) * 3;
        if pixels.len() != expected_len {
            return Err(PressError::corrupted_image());
        }

        let mut comp = Compress::new(ColorSpace::JCS_RGB);
        comp.set_size(w as usize, h as usize);
        comp.set_color_space(ColorSpace::JCS_YCbCr);
        comp.set_quality(settings.quality);
        comp.set_chroma_sampling_pixel_sizes((2, 2), (2, 2));
        comp.set_progressive_mode();
        comp.set_optimize_coding(true);
        comp.set_optimize_scans(true);
        comp.set_scan_optimization_mode(ScanMode::AllComponentsTogether);
        comp.set_smoothing_factor(settings.jpeg_smoothing());

        let mut output = Vec::with_capacity((w as usize * h as usize * 3 / 10).max(4096));
        {
            let mut writer = comp.start_compress(&mut output).map_err(|e| {
                PressError::encode_failed("jpeg", format!("mozjpeg: failed to start compress: {e:?}"))
            })?;

            let stride = w as usize * 3;
            for row in pixels.chunks(stride) {
                writer.write_scanlines(row).map_err(|e| {
                    PressError::encode_failed(
                        "jpeg",
                        format!("mozjpeg: failed to write scanlines: {e:?}"),
                    )
                })?;
            }

            writer.finish().map_err(|e| {
                PressError::encode_failed("jpeg", format!("mozjpeg: failed to finish: {e:?}"))
            })?;
        }

        Ok(output)
    })
}

/// Encode to PNG with the image crate, then recompress losslessly with oxipng.
pub fn encode_png(img: &DynamicImage) -> EncoderResult<Vec<u8>> {
    run_with_panic_policy("encode:png", || {
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .map_err(|e| PressError::encode_failed("png", format!("PNG encode failed: {e}")))?;

        let mut options = oxipng::Options::from_preset(4);
        options.strip = oxipng::StripChunks::Safe;

        oxipng::optimize_from_memory(&buf, &options).map_err(|e| {
            PressError::encode_failed("png", format!("oxipng optimization failed: {e}"))
        })
    })
}

/// Encode to lossy WebP with libwebp. Alpha is kept when the source has it.
pub fn encode_webp(img: &DynamicImage, quality: u8) -> EncoderResult<Vec<u8>> {
    run_with_panic_policy("encode:webp", || {
        let settings = QualitySettings::new(quality);

        let mut config = webp::WebPConfig::new()
            .map_err(|_| PressError::internal_panic("failed to create WebPConfig"))?;
        config.quality = settings.quality;
        config.method = 4;
        config.pass = 1;
        config.preprocessing = 0;
        config.sns_strength = settings.webp_sns_strength();
        config.autofilter = 1;
        config.filter_strength = settings.webp_filter_strength();
        config.filter_sharpness = settings.webp_filter_sharpness();

        let mem = if img.color().has_alpha() {
            let rgba: Cow<'_, image::RgbaImage> = match img {
                DynamicImage::ImageRgba8(rgba_img) => Cow::Borrowed(rgba_img),
                _ => Cow::Owned(img.to_rgba8()),
            };
            let (w, h) = rgba.dimensions();
            webp::Encoder::from_rgba(&rgba, w, h).encode_advanced(&config)
        } else {
            let rgb: Cow<'_, image::RgbImage> = match img {
                DynamicImage::ImageRgb8(rgb_img) => Cow::Borrowed(rgb_img),
                _ => Cow::Owned(img.to_rgb8()),
            };
            let (w, h) = rgb.dimensions();
            webp::Encoder::from_rgb(&rgb, w, h).encode_advanced(&config)
        }
        .map_err(|e| PressError::encode_failed("webp", format!("WebP encode failed: {e:?}")))?;

        Ok(mem.to_vec())
    })
}
