// src/engine/decoder.rs
//
// Decoder operations: JPEG (mozjpeg), PNG (zune-png), WebP (libwebp),
// SVG (resvg), AVIF (avif-decode, "avif" feature) and GIF/BMP/TIFF through
// the image crate (first frame only).

use crate::engine::common::run_with_panic_policy;
use crate::engine::io::{is_avif_data, is_svg_data};
use crate::error::PressError;
use image::{
    DynamicImage, GrayAlphaImage, GrayImage, ImageFormat, ImageReader, RgbImage, RgbaImage,
};
use mozjpeg::Decompress;
use resvg::{tiny_skia, usvg};
use std::io::Cursor;
use webp::{BitstreamFeatures, Decoder as WebPDecoder};
use zune_core::colorspace::ColorSpace;
use zune_core::options::DecoderOptions;
use zune_png::PngDecoder;

use crate::engine::{MAX_DIMENSION, MAX_PIXELS};

type DecoderResult<T> = std::result::Result<T, PressError>;

/// Header-level facts gathered without a full decode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProbeInfo {
    pub width: u32,
    pub height: u32,
    pub format: ProbedFormat,
}

/// Formats the admission probe recognizes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbedFormat {
    Raster(ImageFormat),
    Avif,
    Svg,
}

/// Decode JPEG using mozjpeg (backed by libjpeg-turbo)
pub fn decode_jpeg_mozjpeg(data: &[u8]) -> DecoderResult<DynamicImage> {
    run_with_panic_policy("decode:mozjpeg", || {
        if !data.windows(2).any(|pair| pair == [0xFF, 0xD9]) {
            return Err(PressError::decode_failed("mozjpeg: missing JPEG EOI marker"));
        }

        let decompress = Decompress::new_mem(data).map_err(|e| {
            PressError::decode_failed(format!("mozjpeg decompress init failed: {e:?}"))
        })?;

        let mut decompress = decompress.rgb().map_err(|e| {
            PressError::decode_failed(format!("mozjpeg rgb conversion failed: {e:?}"))
        })?;

        let width = decompress.width() as u32;
        let height = decompress.height() as u32;
        check_dimensions(width, height)?;

        let pixels: Vec<[u8; 3]> = decompress.read_scanlines().map_err(|e| {
            PressError::decode_failed(format!("mozjpeg: failed to read scanlines: {e:?}"))
        })?;
        let flat_pixels: Vec<u8> = pixels.into_iter().flatten().collect();

        let rgb_image = RgbImage::from_raw(width, height, flat_pixels).ok_or_else(|| {
            PressError::decode_failed("mozjpeg: failed to create image from raw data")
        })?;

        Ok(DynamicImage::ImageRgb8(rgb_image))
    })
}

/// Decode GIF/BMP/TIFF (and anything else the image crate knows) under the panic policy.
pub fn decode_with_image_crate(data: &[u8]) -> DecoderResult<DynamicImage> {
    run_with_panic_policy("decode:image", || {
        ensure_dimensions_safe(data)?;
        image::load_from_memory(data)
            .map_err(|e| PressError::decode_failed(format!("decode failed: {e}")))
    })
}

/// Decode PNG using zune-png. 16-bit input is stripped to 8-bit.
pub fn decode_png_zune(data: &[u8]) -> DecoderResult<DynamicImage> {
    run_with_panic_policy("decode:png", || {
        let options = DecoderOptions::default().png_set_strip_to_8bit(true);
        // header-only size check before the decoder allocates
        ensure_dimensions_safe(data)?;
        let mut decoder = PngDecoder::new_with_options(Cursor::new(data), options);
        let pixels = decoder
            .decode()
            .map_err(|e| PressError::decode_failed(format!("png: decode failed: {e}")))?;
        let info = decoder
            .info()
            .ok_or_else(|| PressError::decode_failed("png: missing header info"))?;
        let width = info.width as u32;
        let height = info.height as u32;
        check_dimensions(width, height)?;
        let buf = match pixels {
            zune_core::result::DecodingResult::U8(v) => v,
            _ => {
                return Err(PressError::decode_failed(
                    "png: unexpected non-U8 pixel buffer",
                ))
            }
        };

        let colorspace = decoder
            .colorspace()
            .ok_or_else(|| PressError::decode_failed("png: missing colorspace"))?;

        let img = match colorspace {
            ColorSpace::RGB => RgbImage::from_raw(width, height, buf)
                .map(DynamicImage::ImageRgb8)
                .ok_or_else(|| PressError::decode_failed("png: failed to build RGB image"))?,
            ColorSpace::RGBA => RgbaImage::from_raw(width, height, buf)
                .map(DynamicImage::ImageRgba8)
                .ok_or_else(|| PressError::decode_failed("png: failed to build RGBA image"))?,
            ColorSpace::Luma => GrayImage::from_raw(width, height, buf)
                .map(DynamicImage::ImageLuma8)
                .ok_or_else(|| PressError::decode_failed("png: failed to build Luma image"))?,
            ColorSpace::LumaA => GrayAlphaImage::from_raw(width, height, buf)
                .map(DynamicImage::ImageLumaA8)
                .ok_or_else(|| PressError::decode_failed("png: failed to build LumaA image"))?,
            other => {
                return Err(PressError::decode_failed(format!(
                    "png: unsupported colorspace {other:?}"
                )))
            }
        };

        Ok(img)
    })
}

/// Decode WebP using libwebp. Animated WebP goes through the image crate (first frame).
pub fn decode_webp_libwebp(data: &[u8]) -> DecoderResult<DynamicImage> {
    run_with_panic_policy("decode:webp", || {
        let features = BitstreamFeatures::new(data)
            .ok_or_else(|| PressError::decode_failed("webp: failed to read bitstream features"))?;
        check_dimensions(features.width(), features.height())?;

        if features.has_animation() {
            return image::load_from_memory(data).map_err(|e| {
                PressError::decode_failed(format!("webp (animated) decode failed: {e}"))
            });
        }

        let decoded = WebPDecoder::new(data)
            .decode()
            .ok_or_else(|| PressError::decode_failed("webp: decode failed"))?;
        check_dimensions(decoded.width(), decoded.height())?;

        Ok(decoded.to_image())
    })
}

/// Rasterize an SVG document at its intrinsic size.
///
/// External resources are never fetched and text is dropped (no font database).
pub fn decode_svg_resvg(data: &[u8]) -> DecoderResult<DynamicImage> {
    run_with_panic_policy("decode:svg", || {
        let tree = parse_svg(data)?;
        let (width, height) = svg_pixel_size(&tree)?;
        let mut pixmap = tiny_skia::Pixmap::new(width, height).ok_or_else(|| {
            PressError::decode_failed(format!("svg: cannot allocate a {width}x{height} canvas"))
        })?;
        let size = tree.size();
        let transform = tiny_skia::Transform::from_scale(
            width as f32 / size.width(),
            height as f32 / size.height(),
        );
        resvg::render(&tree, transform, &mut pixmap.as_mut());

        // tiny-skia stores premultiplied alpha
        let mut rgba = Vec::with_capacity(width as usize * height as usize * 4);
        for pixel in pixmap.pixels() {
            let color = pixel.demultiply();
            rgba.extend_from_slice(&[color.red(), color.green(), color.blue(), color.alpha()]);
        }
        RgbaImage::from_raw(width, height, rgba)
            .map(DynamicImage::ImageRgba8)
            .ok_or_else(|| PressError::decode_failed("svg: failed to build RGBA image"))
    })
}

fn parse_svg(data: &[u8]) -> DecoderResult<usvg::Tree> {
    let options = usvg::Options::default();
    usvg::Tree::from_data(data, &options)
        .map_err(|e| PressError::decode_failed(format!("svg: failed to parse: {e}")))
}

/// Intrinsic size rounded up to whole pixels, within the bomb limits.
fn svg_pixel_size(tree: &usvg::Tree) -> DecoderResult<(u32, u32)> {
    let size = tree.size();
    let (w, h) = (size.width().ceil(), size.height().ceil());
    if !(w.is_finite() && h.is_finite()) || w < 1.0 || h < 1.0 {
        return Err(PressError::decode_failed(format!(
            "svg: degenerate size {}x{}",
            size.width(),
            size.height()
        )));
    }
    if w > MAX_DIMENSION as f32 || h > MAX_DIMENSION as f32 {
        return Err(PressError::dimension_exceeds_limit(
            w.max(h) as u32,
            MAX_DIMENSION,
        ));
    }
    let (width, height) = (w as u32, h as u32);
    check_dimensions(width, height)?;
    Ok((width, height))
}

/// Decode AVIF through avif-decode (libaom). 16-bit planes are reduced to 8 bits.
#[cfg(feature = "avif")]
pub fn decode_avif(data: &[u8]) -> DecoderResult<DynamicImage> {
    use avif_decode::{Decoder as AvifDecoder, Image as AvifImage};

    run_with_panic_policy("decode:avif", || {
        let decoder = AvifDecoder::from_avif(data)
            .map_err(|e| PressError::decode_failed(format!("avif: {e:?}")))?;
        let image = decoder
            .to_image()
            .map_err(|e| PressError::decode_failed(format!("avif: {e:?}")))?;

        let dims = |w: usize, h: usize| -> DecoderResult<(u32, u32)> {
            let too_large = |_| PressError::dimension_exceeds_limit(u32::MAX, MAX_DIMENSION);
            let width = u32::try_from(w).map_err(too_large)?;
            let height = u32::try_from(h).map_err(too_large)?;
            check_dimensions(width, height)?;
            Ok((width, height))
        };
        let built = match image {
            AvifImage::Rgb8(img) => {
                let (width, height) = dims(img.width(), img.height())?;
                let buf = img.buf().iter().flat_map(|px| [px.r, px.g, px.b]).collect();
                RgbImage::from_raw(width, height, buf).map(DynamicImage::ImageRgb8)
            }
            AvifImage::Rgb16(img) => {
                let (width, height) = dims(img.width(), img.height())?;
                let buf = img
                    .buf()
                    .iter()
                    .flat_map(|px| [(px.r >> 8) as u8, (px.g >> 8) as u8, (px.b >> 8) as u8])
                    .collect();
                RgbImage::from_raw(width, height, buf).map(DynamicImage::ImageRgb8)
            }
            AvifImage::Rgba8(img) => {
                let (width, height) = dims(img.width(), img.height())?;
                let buf = img.buf().iter().flat_map(|px| [px.r, px.g, px.b, px.a]).collect();
                RgbaImage::from_raw(width, height, buf).map(DynamicImage::ImageRgba8)
            }
            AvifImage::Rgba16(img) => {
                let (width, height) = dims(img.width(), img.height())?;
                let buf = img
                    .buf()
                    .iter()
                    .flat_map(|px| {
                        [
                            (px.r >> 8) as u8,
                            (px.g >> 8) as u8,
                            (px.b >> 8) as u8,
                            (px.a >> 8) as u8,
                        ]
                    })
                    .collect();
                RgbaImage::from_raw(width, height, buf).map(DynamicImage::ImageRgba8)
            }
            AvifImage::Gray8(img) => {
                let (width, height) = dims(img.width(), img.height())?;
                let buf = img.buf().iter().map(|px| px.value()).collect();
                GrayImage::from_raw(width, height, buf).map(DynamicImage::ImageLuma8)
            }
            AvifImage::Gray16(img) => {
                let (width, height) = dims(img.width(), img.height())?;
                let buf = img.buf().iter().map(|px| (px.value() >> 8) as u8).collect();
                GrayImage::from_raw(width, height, buf).map(DynamicImage::ImageLuma8)
            }
        };
        built.ok_or_else(|| PressError::decode_failed("avif: pixel buffer size mismatch"))
    })
}

#[cfg(not(feature = "avif"))]
pub fn decode_avif(_data: &[u8]) -> DecoderResult<DynamicImage> {
    Err(PressError::unsupported_format("avif"))
}

/// Whether AVIF input can be decoded by this build.
pub const fn avif_supported() -> bool {
    cfg!(feature = "avif")
}

/// Detect input format using magic bytes. Returns None if unknown.
pub fn detect_format(bytes: &[u8]) -> Option<ImageFormat> {
    image::guess_format(bytes).ok()
}

/// Unified decode entrypoint: detect once, route to the fastest decoder.
///
/// The format is `None` for SVG, which has no raster counterpart to preserve.
pub fn decode_image(bytes: &[u8]) -> DecoderResult<(DynamicImage, Option<ImageFormat>)> {
    if is_avif_data(bytes) {
        return Ok((decode_avif(bytes)?, Some(ImageFormat::Avif)));
    }
    let detected = detect_format(bytes);
    let img = match detected {
        Some(ImageFormat::Jpeg) => decode_jpeg_mozjpeg(bytes)?,
        Some(ImageFormat::Png) => decode_png_zune(bytes)?,
        Some(ImageFormat::WebP) => decode_webp_libwebp(bytes)?,
        Some(_) => decode_with_image_crate(bytes)?,
        None if is_svg_data(bytes) => decode_svg_resvg(bytes)?,
        None => return Err(PressError::decode_failed("unrecognized image data")),
    };
    Ok((img, detected))
}

/// Lightweight integrity probe used at admission: sniff the container and
/// parse the header for non-zero dimensions. Raster pixel data is not decoded;
/// SVG is parsed (not rendered) and AVIF is decoded since its container
/// carries no cheap size field we trust.
///
/// AVIF in a build without the "avif" feature fails with `UnsupportedFormat`.
pub fn probe_image(bytes: &[u8]) -> DecoderResult<ProbeInfo> {
    if bytes.is_empty() {
        return Err(PressError::decode_failed("empty file"));
    }
    if is_avif_data(bytes) {
        let img = decode_avif(bytes)?;
        return Ok(ProbeInfo {
            width: img.width(),
            height: img.height(),
            format: ProbedFormat::Avif,
        });
    }
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| PressError::decode_failed(format!("failed to read image header: {e}")))?;
    let Some(format) = reader.format() else {
        if is_svg_data(bytes) {
            let (width, height) = svg_pixel_size(&parse_svg(bytes)?)?;
            return Ok(ProbeInfo {
                width,
                height,
                format: ProbedFormat::Svg,
            });
        }
        return Err(PressError::decode_failed("unrecognized image data"));
    };
    let (width, height) = reader
        .into_dimensions()
        .map_err(|e| PressError::decode_failed(format!("failed to read dimensions: {e}")))?;
    if width == 0 || height == 0 {
        return Err(PressError::decode_failed(format!(
            "degenerate dimensions {width}x{height}"
        )));
    }
    check_dimensions(width, height)?;
    Ok(ProbeInfo {
        width,
        height,
        format: ProbedFormat::Raster(format),
    })
}

/// Check if image dimensions are within safe limits.
/// Returns an error if the image is too large (potential decompression bomb).
pub fn check_dimensions(width: u32, height: u32) -> DecoderResult<()> {
    if width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(PressError::dimension_exceeds_limit(
            width.max(height),
            MAX_DIMENSION,
        ));
    }
    let pixels = width as u64 * height as u64;
    if pixels > MAX_PIXELS {
        return Err(PressError::pixel_count_exceeds_limit(pixels, MAX_PIXELS));
    }
    Ok(())
}

/// Inspect encoded bytes and ensure the image dimensions are safe before decoding.
pub fn ensure_dimensions_safe(bytes: &[u8]) -> DecoderResult<()> {
    let cursor = Cursor::new(bytes);
    if let Ok(reader) = ImageReader::new(cursor).with_guessed_format() {
        if let Ok((width, height)) = reader.into_dimensions() {
            return check_dimensions(width, height);
        }
    }
    Ok(())
}
