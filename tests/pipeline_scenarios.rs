// tests/pipeline_scenarios.rs
//
// End-to-end runs through admission, the batch processor and delivery.

use batchpress::engine::admission::RejectionReason;
use batchpress::engine::estimator::estimate;
use batchpress::engine::geometry::{self, CropAvailability, PixelRect};
use batchpress::engine::{ItemError, NoopSink};
use batchpress::{
    Anchor, AspectRatio, BatchEvent, BatchProcessor, BatchRunContext, Delivery, ErrorCategory,
    InputFile, ProcessorConfig, ResourceManager, RunStatus, SourceImage, TransformSettings,
};
use image::{DynamicImage, ImageFormat, RgbImage};
use std::io::Cursor;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn create_test_image(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
    let img = DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    }));
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), format).unwrap();
    buf
}

// PNG that barely compresses, so its size is predictable relative to a gradient
fn create_noisy_png(width: u32, height: u32) -> Vec<u8> {
    let mut state: u32 = 0x1234_5678;
    let img = DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |_, _| {
        state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        let b = state.to_le_bytes();
        image::Rgb([b[1], b[2], b[3]])
    }));
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png).unwrap();
    buf
}

fn jpeg_file(name: &str, width: u32, height: u32) -> InputFile {
    InputFile::from_bytes(
        name,
        "image/jpeg",
        create_test_image(width, height, ImageFormat::Jpeg),
        1_700_000_000_000,
    )
}

fn png_item(name: &str) -> SourceImage {
    SourceImage::from_input_unchecked(InputFile::from_bytes(
        name,
        "image/png",
        create_test_image(48, 32, ImageFormat::Png),
        1,
    ))
}

fn processor(config: ProcessorConfig) -> BatchProcessor {
    let resources = Arc::new(ResourceManager::new(&config));
    BatchProcessor::new(config, resources)
}

#[test]
fn scenario_a_resize_only() {
    init_tracing();
    let processor = processor(ProcessorConfig::default());
    let files = vec![
        jpeg_file("a.jpg", 200, 100),
        jpeg_file("b.jpg", 120, 120),
        jpeg_file("c.jpg", 64, 256),
    ];
    let settings = TransformSettings::default().with_resize(50);
    for file in &files {
        let est = estimate(file, &settings, &processor.config().compression);
        assert_eq!(est.estimated_size, (file.byte_size as f64 * 0.25).round() as u64);
    }

    let report = processor.validate(files).unwrap();
    assert_eq!(report.accepted.len(), 3);
    let outcome = processor
        .run(report.accepted, BatchRunContext::new(settings), &NoopSink)
        .unwrap();

    assert_eq!(outcome.summary.status, RunStatus::Completed);
    assert_eq!(outcome.summary.processed_count, 3);
    assert!(outcome.summary.errors.is_empty());
    let dims: Vec<(u32, u32)> = outcome.results.iter().map(|r| (r.width, r.height)).collect();
    assert_eq!(dims, [(100, 50), (60, 60), (32, 128)]);
    assert!(outcome.results.iter().all(|r| r.output_name.ends_with("_50pct.jpg")));
    assert!(matches!(outcome.delivery, Delivery::Archive { entries: 3, .. }));
    assert_eq!(processor.resources().outstanding_handles(), 0);
}

#[test]
fn scenario_a_output_ratio_tracks_estimate() {
    init_tracing();
    let processor = processor(ProcessorConfig::default());
    // noise keeps lossless output proportional to pixel count
    let files = vec![
        InputFile::from_bytes("n1.png", "image/png", create_noisy_png(256, 256), 1),
        InputFile::from_bytes("n2.png", "image/png", create_noisy_png(320, 192), 2),
    ];
    let settings = TransformSettings::default().with_resize(50);
    let estimated: u64 = files
        .iter()
        .map(|f| estimate(f, &settings, &processor.config().compression).estimated_size)
        .sum();
    let original: u64 = files.iter().map(|f| f.byte_size).sum();

    let report = processor.validate(files).unwrap();
    let outcome = processor
        .run(report.accepted, BatchRunContext::new(settings), &NoopSink)
        .unwrap();
    assert_eq!(outcome.summary.processed_count, 2);
    assert_eq!(outcome.summary.original_size, original);

    let estimated_ratio = estimated as f64 / original as f64;
    let actual_ratio = outcome.summary.new_size as f64 / original as f64;
    assert!((estimated_ratio - 0.25).abs() < 0.01);
    assert!(
        (actual_ratio - estimated_ratio).abs() < 0.15,
        "actual {actual_ratio:.3} vs estimated {estimated_ratio:.3}"
    );
}

#[test]
fn scenario_b_oversized_file_rejected() {
    init_tracing();
    let small_a = create_test_image(32, 32, ImageFormat::Png);
    let small_b = create_test_image(40, 24, ImageFormat::Png);
    let big = create_noisy_png(256, 256);
    let cap = small_a.len().max(small_b.len()) as u64;
    assert!(big.len() as u64 > cap);

    let config = ProcessorConfig {
        max_file_size: cap,
        ..ProcessorConfig::default()
    };
    let processor = processor(config);
    let report = processor
        .validate(vec![
            InputFile::from_bytes("small_a.png", "image/png", small_a, 1),
            InputFile::from_bytes("big.png", "image/png", big, 2),
            InputFile::from_bytes("small_b.png", "image/png", small_b, 3),
        ])
        .unwrap();

    assert_eq!(report.accepted.len(), 2);
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].file.name, "big.png");
    assert_eq!(report.rejected[0].reason, RejectionReason::TooLarge);
    assert_eq!(report.rejected[0].reason.to_string(), "too large");
}

#[test]
fn scenario_c_center_square_crop() {
    let crop = TransformSettings::default()
        .with_crop(AspectRatio::SQUARE, Anchor::Center)
        .crop
        .unwrap();
    let rect = geometry::resolve(1600, 900, &crop, CropAvailability::Manual);
    assert_eq!(
        rect,
        Some(PixelRect {
            x: 350,
            y: 0,
            width: 900,
            height: 900
        })
    );
}

#[test]
fn scenario_d_cancel_after_first_chunk() {
    init_tracing();
    let processor = processor(ProcessorConfig {
        chunk_size: 5,
        ..ProcessorConfig::default()
    });
    let items: Vec<SourceImage> = (0..15).map(|i| png_item(&format!("img{i}.png"))).collect();
    let ctx = BatchRunContext::new(TransformSettings::default().with_resize(50));
    let token = ctx.cancellation_token();
    let sink = move |event: BatchEvent| {
        if let BatchEvent::Progress { completed: 5, .. } = event {
            token.cancel();
        }
    };

    let outcome = processor.run(items, ctx, &sink).unwrap();
    let summary = &outcome.summary;
    assert_eq!(summary.status, RunStatus::Cancelled);
    let settled = summary.processed_count + summary.errors.len();
    assert!((5..=10).contains(&settled), "settled {settled}");
    assert_eq!(settled + summary.skipped_count, 15);
    assert_eq!(processor.status(), RunStatus::Cancelled);
    assert_eq!(processor.resources().outstanding_handles(), 0);
}

#[test]
fn scenario_e_corrupt_item_does_not_fail_batch() {
    init_tracing();
    let processor = processor(ProcessorConfig::default());
    // valid signature, garbage header
    let corrupt = b"\x89PNG\r\n\x1a\n\x00\x00\x00\x0dIHDRgarbage-bytes".to_vec();
    let mut items: Vec<SourceImage> = (0..5).map(|i| png_item(&format!("ok{i}.png"))).collect();
    items.insert(
        2,
        SourceImage::from_input_unchecked(InputFile::from_bytes("corrupt.png", "image/png", corrupt, 9)),
    );

    let (tx, rx) = mpsc::channel::<BatchEvent>();
    let outcome = processor
        .run(items, BatchRunContext::new(TransformSettings::default()), &tx)
        .unwrap();
    drop(tx);

    assert_eq!(outcome.summary.status, RunStatus::Completed);
    assert_eq!(outcome.summary.processed_count, 5);
    assert_eq!(outcome.summary.errors.len(), 1);
    let ItemError { source_name, .. } = &outcome.summary.errors[0];
    assert_eq!(source_name, "corrupt.png");
    assert_eq!(outcome.summary.processed_count + outcome.summary.errors.len(), 6);

    let events: Vec<BatchEvent> = rx.iter().collect();
    let failures = events
        .iter()
        .filter(|e| matches!(e, BatchEvent::Progress { succeeded: false, .. }))
        .count();
    assert_eq!(failures, 1);
    assert!(matches!(events.last(), Some(BatchEvent::Completed { .. })));
    assert_eq!(processor.resources().outstanding_handles(), 0);
}

#[test]
fn corrupt_file_rejected_at_admission() {
    let processor = processor(ProcessorConfig::default());
    let mut corrupt = create_test_image(64, 64, ImageFormat::Png);
    corrupt.truncate(20);
    let report = processor
        .validate(vec![
            InputFile::from_bytes("fine.png", "image/png", create_test_image(8, 8, ImageFormat::Png), 1),
            InputFile::from_bytes("corrupt.png", "image/png", corrupt, 2),
        ])
        .unwrap();
    assert_eq!(report.accepted.len(), 1);
    assert_eq!(report.rejected[0].reason, RejectionReason::Corrupted);
}

#[test]
fn expired_items_become_timeout_errors() {
    init_tracing();
    let processor = processor(ProcessorConfig {
        item_timeout: Some(Duration::from_nanos(1)),
        ..ProcessorConfig::default()
    });
    let items: Vec<SourceImage> = (0..4).map(|i| png_item(&format!("t{i}.png"))).collect();
    let outcome = processor
        .run(items, BatchRunContext::new(TransformSettings::default()), &NoopSink)
        .unwrap();

    let summary = &outcome.summary;
    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.processed_count + summary.errors.len(), 4);
    assert!(summary
        .errors
        .iter()
        .all(|e| e.category == ErrorCategory::ItemTransform));
}

#[test]
fn abandoned_workers_finish_without_leaking() {
    init_tracing();
    let processor = processor(ProcessorConfig {
        item_timeout: Some(Duration::from_nanos(1)),
        ..ProcessorConfig::default()
    });
    let items: Vec<SourceImage> = (0..6).map(|i| png_item(&format!("w{i}.png"))).collect();
    let outcome = processor
        .run(items, BatchRunContext::new(TransformSettings::default().with_resize(50)), &NoopSink)
        .unwrap();
    assert_eq!(outcome.summary.processed_count + outcome.summary.errors.len(), 6);

    // timed-out items keep their worker until the transform returns
    let deadline = Instant::now() + Duration::from_secs(10);
    while processor.in_flight_workers() > 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(processor.in_flight_workers(), 0);

    let stats = processor.resources().stats();
    assert_eq!(stats.outstanding_handles, 0);
    assert_eq!(stats.cached_entries, 0);
}
