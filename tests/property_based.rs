// tests/property_based.rs
//
// Property tests for the estimator, crop geometry, admission and handle discipline.

use batchpress::config::CompressionFactors;
use batchpress::engine::estimator::{estimate, MIN_ESTIMATE_RATIO};
use batchpress::engine::geometry::{resolve_automatic, resolve_manual};
use batchpress::engine::io::{Source, SourceBytes};
use batchpress::engine::AdmissionValidator;
use batchpress::{
    Anchor, AspectRatio, InputFile, NormalizedRect, OutputFormat, ProcessorConfig,
    ResourceManager, TransformSettings,
};
use image::{DynamicImage, ImageFormat, RgbImage};
use proptest::prelude::*;
use std::io::Cursor;
use std::sync::Arc;

fn create_png(width: u32, height: u32) -> Vec<u8> {
    let img = DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    }));
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png).unwrap();
    buf
}

fn sized_file(mime: &str, size: u64) -> InputFile {
    InputFile::new("f", mime, size, 0, Source::Memory(Arc::new(Vec::new())))
}

fn ratio_strategy() -> impl Strategy<Value = AspectRatio> {
    prop_oneof![
        Just(AspectRatio::SQUARE),
        Just(AspectRatio::WIDESCREEN),
        Just(AspectRatio::STORY),
        Just(AspectRatio::LANDSCAPE),
        Just(AspectRatio::PORTRAIT),
    ]
}

fn anchor_strategy() -> impl Strategy<Value = Anchor> {
    prop_oneof![
        Just(Anchor::Center),
        Just(Anchor::Left),
        Just(Anchor::Right),
        Just(Anchor::Top),
        Just(Anchor::Bottom),
    ]
}

fn format_strategy() -> impl Strategy<Value = OutputFormat> {
    prop_oneof![
        Just(OutputFormat::WebP),
        Just(OutputFormat::Jpeg),
        Just(OutputFormat::Png),
    ]
}

fn mime_strategy() -> impl Strategy<Value = &'static str> {
    prop_oneof![
        Just("image/jpeg"),
        Just("image/png"),
        Just("image/webp"),
        Just("image/gif"),
    ]
}

fn settings_strategy() -> impl Strategy<Value = TransformSettings> {
    (
        proptest::option::of(10u32..=200),
        proptest::option::of((ratio_strategy(), anchor_strategy())),
        proptest::option::of((format_strategy(), 0u8..=100)),
    )
        .prop_map(|(resize, crop, convert)| {
            let mut settings = TransformSettings::default();
            if let Some(percent) = resize {
                settings = settings.with_resize(percent);
            }
            if let Some((ratio, anchor)) = crop {
                settings = settings.with_crop(ratio, anchor);
            }
            if let Some((format, quality)) = convert {
                settings = settings.with_convert(format, quality);
            }
            settings
        })
}

proptest! {
    #[test]
    fn estimate_stays_within_bounds(
        size in 1u64..2_000_000_000,
        mime in mime_strategy(),
        settings in settings_strategy(),
    ) {
        let est = estimate(&sized_file(mime, size), &settings, &CompressionFactors::default());
        prop_assert!(est.estimated_size <= size);
        // rounding may land half a byte under the floor
        prop_assert!(est.estimated_size as f64 >= size as f64 * MIN_ESTIMATE_RATIO - 0.5);
    }

    #[test]
    fn smaller_resize_never_grows_estimate(
        size in 1u64..500_000_000,
        mime in mime_strategy(),
        a in 10u32..=200,
        b in 10u32..=200,
        convert in proptest::option::of((format_strategy(), 0u8..=100)),
    ) {
        let (low, high) = (a.min(b), a.max(b));
        let base = match convert {
            Some((format, quality)) => TransformSettings::default().with_convert(format, quality),
            None => TransformSettings::default(),
        };
        let file = sized_file(mime, size);
        let factors = CompressionFactors::default();
        let small = estimate(&file, &base.with_resize(low), &factors);
        let large = estimate(&file, &base.with_resize(high), &factors);
        prop_assert!(small.estimated_size <= large.estimated_size);
    }

    #[test]
    fn lower_quality_never_grows_estimate(
        size in 1u64..500_000_000,
        mime in mime_strategy(),
        format in format_strategy(),
        a in 0u8..=100,
        b in 0u8..=100,
    ) {
        let (low, high) = (a.min(b), a.max(b));
        let file = sized_file(mime, size);
        let factors = CompressionFactors::default();
        let small = estimate(&file, &TransformSettings::default().with_convert(format, low), &factors);
        let large = estimate(&file, &TransformSettings::default().with_convert(format, high), &factors);
        prop_assert!(small.estimated_size <= large.estimated_size);
    }

    #[test]
    fn automatic_crop_matches_ratio_and_fits(
        width in 1u32..=5000,
        height in 1u32..=5000,
        ratio in ratio_strategy(),
        anchor in anchor_strategy(),
    ) {
        let rect = resolve_automatic(width, height, ratio, anchor).unwrap();
        prop_assert!(rect.width >= 1 && rect.height >= 1);
        prop_assert!(rect.x + rect.width <= width);
        prop_assert!(rect.y + rect.height <= height);
        // one side is kept whole
        prop_assert!(rect.width == width || rect.height == height);
        let target = ratio.value().unwrap();
        prop_assert!((rect.width as f64 - rect.height as f64 * target).abs() <= 1.0);
    }

    #[test]
    fn manual_crop_stays_inside_image(
        width in 1u32..=4096,
        height in 1u32..=4096,
        x in 0.0f64..1.0,
        y in 0.0f64..1.0,
        w in 0.0001f64..=1.0,
        h in 0.0001f64..=1.0,
    ) {
        let rect = NormalizedRect {
            x,
            y,
            width: w.min(1.0 - x).max(1e-6),
            height: h.min(1.0 - y).max(1e-6),
        };
        if let Some(px) = resolve_manual(width, height, &rect) {
            prop_assert!(px.width >= 1 && px.height >= 1);
            prop_assert!(px.x + px.width <= width);
            prop_assert!(px.y + px.height <= height);
        }
    }

    #[test]
    fn handles_are_gone_after_cleanup(ops in proptest::collection::vec(0u8..3, 1..40)) {
        let manager = ResourceManager::new(&ProcessorConfig::default());
        let payload = SourceBytes::Memory(Arc::new(vec![1, 2, 3]));
        let mut kept = Vec::new();
        for op in ops {
            let handle = manager.acquire(payload.clone());
            match op {
                0 => manager.release(handle),
                1 => drop(handle),
                _ => kept.push(handle),
            }
        }
        prop_assert_eq!(manager.outstanding_handles(), kept.len());
        manager.cleanup();
        prop_assert_eq!(manager.outstanding_handles(), 0);
        // late drops after cleanup must not underflow anything
        drop(kept);
        prop_assert_eq!(manager.outstanding_handles(), 0);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn revalidation_is_idempotent(kinds in proptest::collection::vec(0u8..4, 1..8)) {
        let files: Vec<InputFile> = kinds
            .iter()
            .enumerate()
            .map(|(i, kind)| {
                let name = format!("file{i}");
                match kind {
                    0 => InputFile::from_bytes(name, "image/png", create_png(8 + i as u32, 8), i as u64),
                    1 => InputFile::from_bytes(name, "image/png", b"not an image".to_vec(), i as u64),
                    2 => InputFile::from_bytes(name, "text/plain", b"hello".to_vec(), i as u64),
                    _ => InputFile::from_bytes(name, "image/png", vec![0; 4096], i as u64),
                }
            })
            .collect();

        let config = ProcessorConfig {
            max_file_size: 2048,
            ..ProcessorConfig::default()
        };
        let validator = AdmissionValidator::new(&config);
        let first = validator.validate(files.clone()).unwrap();
        let second = validator.validate(files).unwrap();
        prop_assert_eq!(first.outcomes, second.outcomes);
        prop_assert_eq!(first.accepted.len(), second.accepted.len());
    }
}
