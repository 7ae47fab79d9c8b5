// src/engine/pipeline.rs
//
// Pixel stages: bounding downscale, crop, percentage resize and sharpen.
// Stages are pure DynamicImage -> DynamicImage functions run in a fixed order.

use crate::engine::encoder::EncodePlan;
use crate::engine::geometry::{self, CropAvailability, PixelRect};
use crate::error::PressError;
use crate::ops::{CropSettings, OutputFormat, Stages, TransformSettings};
use fast_image_resize::{self as fir, ImageBufferError, MulDiv, PixelType, ResizeOptions};
use image::{imageops::FilterType, DynamicImage, ImageBuffer, Pixel, RgbImage, RgbaImage};
use tracing::{debug, warn};

type PipelineResult<T> = std::result::Result<T, PressError>;

/// Sharpening is skipped at or above this many pixels.
pub const SHARPEN_MAX_PIXELS: u64 = 4_000_000;

/// Weight of the original pixel when blending in the sharpened one.
const SHARPEN_ORIGINAL_WEIGHT: f32 = 0.8;

/// One per-item pixel stage. Order within a plan is crop, resize, sharpen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Stage {
    Crop {
        crop: CropSettings,
        availability: CropAvailability,
    },
    Resize {
        percent: u32,
    },
    /// Mild unsharp pass for JPEG conversions below `SHARPEN_MAX_PIXELS`.
    Sharpen,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Crop { .. } => "crop",
            Stage::Resize { .. } => "resize",
            Stage::Sharpen => "sharpen",
        }
    }
}

/// Stage list for one item given the enabled settings and its encode plan.
pub fn plan_stages(
    settings: &TransformSettings,
    plan: &EncodePlan,
    availability: CropAvailability,
) -> Vec<Stage> {
    let enabled = settings.stages();
    let mut stages = Vec::with_capacity(enabled.bits().count_ones() as usize);
    if let Some(crop) = settings.crop.filter(|_| enabled.contains(Stages::CROP)) {
        stages.push(Stage::Crop { crop, availability });
    }
    if let Some(resize) = settings.resize.filter(|_| enabled.contains(Stages::RESIZE)) {
        stages.push(Stage::Resize {
            percent: resize.percent,
        });
    }
    if enabled.contains(Stages::CONVERT) && plan.format == OutputFormat::Jpeg {
        stages.push(Stage::Sharpen);
    }
    stages
}

/// Identifies the pixels a stage list produces from one source, for the
/// transformed-image cache. Sources are first bounded to `max_dimension`.
pub fn variant_key(stages: &[Stage], max_dimension: u32) -> String {
    let mut key = format!("fit{max_dimension}");
    for stage in stages {
        match stage {
            Stage::Crop { crop, availability } => {
                key.push_str(&format!(
                    "|crop:{}:{:?}:{:?}",
                    crop.ratio.label(),
                    crop.anchor,
                    availability
                ));
                if let Some(rect) = crop.manual_rect {
                    key.push_str(&format!(":{},{},{},{}", rect.x, rect.y, rect.width, rect.height));
                }
            }
            Stage::Resize { percent } => key.push_str(&format!("|resize:{percent}")),
            Stage::Sharpen => key.push_str("|sharpen"),
        }
    }
    key
}

/// Run stages in order.
pub fn run_stages(mut img: DynamicImage, stages: &[Stage]) -> PipelineResult<DynamicImage> {
    for stage in stages {
        let before = (img.width(), img.height());
        img = match *stage {
            Stage::Crop { crop, availability } => {
                match geometry::resolve(img.width(), img.height(), &crop, availability) {
                    Some(rect) => apply_crop(img, rect)?,
                    None => img,
                }
            }
            Stage::Resize { percent } => apply_resize_percent(img, percent)?,
            Stage::Sharpen => {
                let pixels = img.width() as u64 * img.height() as u64;
                if pixels < SHARPEN_MAX_PIXELS {
                    sharpen(img)
                } else {
                    img
                }
            }
        };
        debug!(
            stage = stage.name(),
            from = ?before,
            to = ?(img.width(), img.height()),
            "stage applied"
        );
    }
    Ok(img)
}

/// Scale an image down uniformly so neither axis exceeds `max_dimension`.
///
/// Returns the image and whether it was downscaled.
pub fn fit_within(img: DynamicImage, max_dimension: u32) -> PipelineResult<(DynamicImage, bool)> {
    let (w, h) = (img.width(), img.height());
    if max_dimension == 0 || (w <= max_dimension && h <= max_dimension) {
        return Ok((img, false));
    }
    let scale = (max_dimension as f64 / w as f64).min(max_dimension as f64 / h as f64);
    let dst_w = ((w as f64 * scale).round() as u32).clamp(1, max_dimension);
    let dst_h = ((h as f64 * scale).round() as u32).clamp(1, max_dimension);
    warn!(
        width = w,
        height = h,
        max_dimension,
        "source exceeds maximum dimension, downscaling to {dst_w}x{dst_h}"
    );
    let resized = fast_resize_owned(img, dst_w, dst_h)?;
    Ok((resized, true))
}

/// Extract a pixel rectangle. The rectangle must lie inside the image.
pub fn apply_crop(img: DynamicImage, rect: PixelRect) -> PipelineResult<DynamicImage> {
    let (w, h) = (img.width(), img.height());
    if !rect.fits_within(w, h) {
        return Err(PressError::invalid_crop_dimensions(rect.width, rect.height));
    }
    if rect.x == 0 && rect.y == 0 && rect.width == w && rect.height == h {
        return Ok(img);
    }
    Ok(img.crop_imm(rect.x, rect.y, rect.width, rect.height))
}

/// Target dimensions for a percentage resize; each axis is at least 1px.
pub fn percent_dimensions(width: u32, height: u32, percent: u32) -> (u32, u32) {
    let scale = percent as f64 / 100.0;
    let w = ((width as f64 * scale).round() as u32).max(1);
    let h = ((height as f64 * scale).round() as u32).max(1);
    (w, h)
}

/// Scale both axes by `percent` (100 = unchanged) with Lanczos3.
pub fn apply_resize_percent(img: DynamicImage, percent: u32) -> PipelineResult<DynamicImage> {
    let (w, h) = (img.width(), img.height());
    let (dst_w, dst_h) = percent_dimensions(w, h, percent);
    if (dst_w, dst_h) == (w, h) {
        return Ok(img);
    }
    fast_resize_owned(img, dst_w, dst_h)
}

/// Mild sharpen: 3x3 kernel (center 2, edges -0.25) blended 80/20 with the original.
/// Border pixels are left untouched. Output is RGB8 or RGBA8.
pub fn sharpen(img: DynamicImage) -> DynamicImage {
    match img {
        DynamicImage::ImageRgb8(buf) => DynamicImage::ImageRgb8(sharpen_buffer(buf)),
        DynamicImage::ImageRgba8(buf) => DynamicImage::ImageRgba8(sharpen_buffer(buf)),
        other if other.color().has_alpha() => {
            DynamicImage::ImageRgba8(sharpen_buffer(other.to_rgba8()))
        }
        other => DynamicImage::ImageRgb8(sharpen_buffer(other.to_rgb8())),
    }
}

fn sharpen_buffer<P>(src: ImageBuffer<P, Vec<u8>>) -> ImageBuffer<P, Vec<u8>>
where
    P: Pixel<Subpixel = u8>,
{
    let (w, h) = (src.width() as usize, src.height() as usize);
    if w < 3 || h < 3 {
        return src;
    }
    let channels = P::CHANNEL_COUNT as usize;
    // alpha is never sharpened
    let color_channels = if channels == 4 { 3 } else { channels };
    let stride = w * channels;

    let mut out = src.clone();
    let input: &[u8] = &src;
    let output: &mut [u8] = &mut out;

    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let i = y * stride + x * channels;
            for c in 0..color_channels {
                let center = input[i + c] as f32;
                let neighbours = input[i - stride + c] as f32
                    + input[i + stride + c] as f32
                    + input[i - channels + c] as f32
                    + input[i + channels + c] as f32;
                let sharpened = (2.0 * center - 0.25 * neighbours).clamp(0.0, 255.0);
                let blended = center * SHARPEN_ORIGINAL_WEIGHT
                    + sharpened * (1.0 - SHARPEN_ORIGINAL_WEIGHT);
                output[i + c] = blended.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
    out
}

/// Resize an owned image, reusing its buffer for RGB8/RGBA8.
pub fn fast_resize_owned(
    img: DynamicImage,
    dst_width: u32,
    dst_height: u32,
) -> PipelineResult<DynamicImage> {
    let src_width = img.width();
    let src_height = img.height();

    if src_width == 0 || src_height == 0 || dst_width == 0 || dst_height == 0 {
        return Err(PressError::resize_failed(
            (src_width, src_height),
            (dst_width, dst_height),
            "invalid dimensions for resize",
        ));
    }

    let (pixel_type, src_pixels): (PixelType, Vec<u8>) = match img {
        DynamicImage::ImageRgb8(rgb) => (PixelType::U8x3, rgb.into_raw()),
        DynamicImage::ImageRgba8(rgba) => (PixelType::U8x4, rgba.into_raw()),
        other if other.color().has_alpha() => (PixelType::U8x4, other.to_rgba8().into_raw()),
        other => (PixelType::U8x3, other.to_rgb8().into_raw()),
    };

    resize_pixels(
        src_width, src_height, src_pixels, pixel_type, dst_width, dst_height,
    )
    .map_err(|reason| {
        PressError::resize_failed((src_width, src_height), (dst_width, dst_height), reason)
    })
}

fn resize_options() -> ResizeOptions {
    ResizeOptions::new().resize_alg(fir::ResizeAlg::Convolution(fir::FilterType::Lanczos3))
}

fn resize_pixels(
    src_width: u32,
    src_height: u32,
    mut src_pixels: Vec<u8>,
    pixel_type: PixelType,
    dst_width: u32,
    dst_height: u32,
) -> std::result::Result<DynamicImage, String> {
    let required_bytes = (src_width as usize)
        .checked_mul(src_height as usize)
        .and_then(|n| n.checked_mul(pixel_type.size()))
        .ok_or_else(|| "image buffer size overflow during resize".to_string())?;

    if src_pixels.len() < required_bytes {
        return Err(format!(
            "source buffer too small: expected {required_bytes} bytes, got {}",
            src_pixels.len()
        ));
    }

    let primary = match fir::images::Image::from_slice_u8(
        src_width,
        src_height,
        src_pixels.as_mut_slice(),
        pixel_type,
    ) {
        Ok(src_image) => resize_fir(src_image, pixel_type, dst_width, dst_height),
        Err(ImageBufferError::InvalidBufferAlignment) => {
            let mut aligned = fir::images::Image::new(src_width, src_height, pixel_type);
            aligned
                .buffer_mut()
                .copy_from_slice(&src_pixels[..required_bytes]);
            resize_fir(aligned, pixel_type, dst_width, dst_height)
        }
        Err(other) => Err(format!("fir source image error: {other:?}")),
    };

    match primary {
        Ok(img) => Ok(img),
        Err(err) => {
            warn!(%err, "fir resize failed, falling back to image crate");
            resize_image_crate(
                &src_pixels,
                src_width,
                src_height,
                pixel_type,
                dst_width,
                dst_height,
            )
            .map_err(|fallback| format!("{err}; image crate fallback failed: {fallback}"))
        }
    }
}

fn resize_fir(
    mut src_image: fir::images::Image<'_>,
    pixel_type: PixelType,
    dst_width: u32,
    dst_height: u32,
) -> std::result::Result<DynamicImage, String> {
    let mut dst_image = fir::images::Image::new(dst_width, dst_height, pixel_type);
    let has_alpha = pixel_type == PixelType::U8x4;

    let mul_div = MulDiv::default();
    if has_alpha {
        mul_div
            .multiply_alpha_inplace(&mut src_image)
            .map_err(|e| format!("failed to premultiply alpha: {e}"))?;
    }

    fir::Resizer::new()
        .resize(&src_image, &mut dst_image, &resize_options())
        .map_err(|e| format!("fir resize error: {e:?}"))?;

    if has_alpha {
        mul_div
            .divide_alpha_inplace(&mut dst_image)
            .map_err(|e| format!("failed to unpremultiply alpha: {e}"))?;
    }

    let dst_pixels = dst_image.into_vec();
    if has_alpha {
        RgbaImage::from_raw(dst_width, dst_height, dst_pixels)
            .map(DynamicImage::ImageRgba8)
            .ok_or_else(|| "failed to create rgba image from resized data".to_string())
    } else {
        RgbImage::from_raw(dst_width, dst_height, dst_pixels)
            .map(DynamicImage::ImageRgb8)
            .ok_or_else(|| "failed to create rgb image from resized data".to_string())
    }
}

fn resize_image_crate(
    src_pixels: &[u8],
    src_width: u32,
    src_height: u32,
    pixel_type: PixelType,
    dst_width: u32,
    dst_height: u32,
) -> std::result::Result<DynamicImage, String> {
    let filter = FilterType::Lanczos3;
    match pixel_type {
        PixelType::U8x3 => {
            let rgb = RgbImage::from_raw(src_width, src_height, src_pixels.to_vec())
                .ok_or_else(|| "failed to build rgb image for fallback resize".to_string())?;
            Ok(DynamicImage::ImageRgb8(image::imageops::resize(
                &rgb, dst_width, dst_height, filter,
            )))
        }
        PixelType::U8x4 => {
            let rgba = RgbaImage::from_raw(src_width, src_height, src_pixels.to_vec())
                .ok_or_else(|| "failed to build rgba image for fallback resize".to_string())?;
            Ok(DynamicImage::ImageRgba8(image::imageops::resize(
                &rgba, dst_width, dst_height, filter,
            )))
        }
        _ => Err("fallback resize supports only U8x3/U8x4 pixel types".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{Anchor, AspectRatio, ConvertSettings};
    use image::{GrayImage, Luma, Rgb};

    fn create_test_image(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        }))
    }

    fn jpeg_plan() -> EncodePlan {
        EncodePlan::for_conversion(&ConvertSettings {
            format: OutputFormat::Jpeg,
            quality: 90,
        })
    }

    #[test]
    fn test_plan_order_is_crop_resize_sharpen() {
        let settings = TransformSettings::default()
            .with_resize(50)
            .with_crop(AspectRatio::SQUARE, Anchor::Center)
            .with_convert(OutputFormat::Jpeg, 90);
        let stages = plan_stages(&settings, &jpeg_plan(), CropAvailability::Manual);
        let names: Vec<_> = stages.iter().map(Stage::name).collect();
        assert_eq!(names, ["crop", "resize", "sharpen"]);
    }

    #[test]
    fn test_variant_key_tracks_stage_parameters() {
        let half = TransformSettings::default().with_resize(50);
        let quarter = TransformSettings::default().with_resize(25);
        let plan = EncodePlan::preserving(Some(image::ImageFormat::Png));
        let key = |settings: &TransformSettings, max| {
            variant_key(&plan_stages(settings, &plan, CropAvailability::Manual), max)
        };
        assert_eq!(key(&half, 4096), "fit4096|resize:50");
        assert_ne!(key(&half, 4096), key(&quarter, 4096));
        assert_ne!(key(&half, 4096), key(&half, 2048));

        let cropped = half.with_crop(AspectRatio::SQUARE, Anchor::Center);
        let crop_key = variant_key(
            &plan_stages(&cropped, &jpeg_plan(), CropAvailability::AutomaticOnly),
            4096,
        );
        assert!(crop_key.starts_with("fit4096|crop:1/1:Center:AutomaticOnly"));
        assert!(crop_key.ends_with("|resize:50"));
        assert_eq!(
            variant_key(&plan_stages(&TransformSettings::default(), &plan, CropAvailability::Manual), 10),
            "fit10"
        );
    }

    #[test]
    fn test_no_sharpen_without_jpeg_conversion() {
        let settings = TransformSettings::default().with_resize(50);
        let plan = EncodePlan::preserving(Some(image::ImageFormat::Jpeg));
        let stages = plan_stages(&settings, &plan, CropAvailability::Manual);
        assert_eq!(stages, vec![Stage::Resize { percent: 50 }]);
    }

    #[test]
    fn test_crop_then_resize() {
        let img = create_test_image(1600, 900);
        let stages = [
            Stage::Crop {
                crop: CropSettings::new(AspectRatio::SQUARE, Anchor::Center),
                availability: CropAvailability::Manual,
            },
            Stage::Resize { percent: 50 },
        ];
        let out = run_stages(img, &stages).unwrap();
        assert_eq!((out.width(), out.height()), (450, 450));
    }

    #[test]
    fn test_resize_percent_dimensions() {
        assert_eq!(percent_dimensions(100, 50, 50), (50, 25));
        assert_eq!(percent_dimensions(3, 3, 10), (1, 1));
        assert_eq!(percent_dimensions(100, 100, 200), (200, 200));
        let out = apply_resize_percent(create_test_image(100, 50), 150).unwrap();
        assert_eq!((out.width(), out.height()), (150, 75));
    }

    #[test]
    fn test_resize_keeps_alpha_and_handles_gray() {
        let rgba = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            20,
            20,
            image::Rgba([10, 20, 30, 128]),
        ));
        let out = apply_resize_percent(rgba, 50).unwrap();
        assert!(matches!(out, DynamicImage::ImageRgba8(_)));

        let gray = DynamicImage::ImageLuma8(GrayImage::from_pixel(20, 20, Luma([90])));
        let out = apply_resize_percent(gray, 50).unwrap();
        assert_eq!((out.width(), out.height()), (10, 10));
    }

    #[test]
    fn test_fit_within_downscales_oversized() {
        let img = create_test_image(400, 100);
        let (out, downscaled) = fit_within(img, 200).unwrap();
        assert!(downscaled);
        assert_eq!((out.width(), out.height()), (200, 50));

        let (same, downscaled) = fit_within(create_test_image(100, 100), 200).unwrap();
        assert!(!downscaled);
        assert_eq!(same.width(), 100);
    }

    #[test]
    fn test_crop_out_of_bounds_is_error() {
        let rect = PixelRect {
            x: 90,
            y: 0,
            width: 20,
            height: 10,
        };
        let err = apply_crop(create_test_image(100, 100), rect).unwrap_err();
        assert!(matches!(err, PressError::InvalidCropDimensions { .. }));
    }

    #[test]
    fn test_sharpen_flat_image_is_unchanged() {
        let flat = DynamicImage::ImageRgb8(RgbImage::from_pixel(10, 10, Rgb([100, 100, 100])));
        let out = sharpen(flat.clone());
        assert_eq!(out.to_rgb8().as_raw(), flat.to_rgb8().as_raw());
    }

    #[test]
    fn test_sharpen_increases_edge_contrast() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_fn(10, 10, |x, _| {
            if x < 5 {
                Rgb([50, 50, 50])
            } else {
                Rgb([200, 200, 200])
            }
        }));
        let out = sharpen(img).to_rgb8();
        // dark side of the edge gets darker, bright side brighter
        assert!(out.get_pixel(4, 5)[0] < 50);
        assert!(out.get_pixel(5, 5)[0] > 200);
        // borders untouched
        assert_eq!(out.get_pixel(0, 0)[0], 50);
    }
}
