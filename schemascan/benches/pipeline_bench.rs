use criterion::{black_box, criterion_group, criterion_main, Criterion};
use image::{DynamicImage, GrayImage, Luma};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;
use schemascan::config::{PreprocessConfig, TracerConfig};
use schemascan::detect::detect;
use schemascan::prelude::*;
use schemascan::raster::InputFormat;
use schemascan::trace::trace;
use schemascan::{ImageMetadata, Preprocessor};
use std::sync::Arc;

/// A row of resistors in series with a tee down to a square body.
fn synthetic_page() -> DynamicImage {
    let ink = Luma([0u8]);
    let mut img = GrayImage::from_pixel(1200, 900, Luma([255u8]));
    for i in 0..4 {
        let x = 120 + i * 240;
        draw_filled_rect_mut(&mut img, Rect::at(x, 290).of_size(60, 20), ink);
        draw_filled_rect_mut(&mut img, Rect::at(x + 60, 299).of_size(180, 3), ink);
    }
    draw_filled_rect_mut(&mut img, Rect::at(570, 600).of_size(60, 60), ink);
    draw_filled_rect_mut(&mut img, Rect::at(599, 301).of_size(3, 299), ink);
    DynamicImage::ImageLuma8(img)
}

fn bench_preprocess(c: &mut Criterion) {
    let page = synthetic_page();
    let preprocessor = Preprocessor::new(PreprocessConfig::default());

    c.bench_function("preprocess", |b| {
        b.iter(|| preprocessor.preprocess(black_box(&page)));
    });
}

fn bench_detect_and_trace(c: &mut Criterion) {
    let normalized = Preprocessor::new(PreprocessConfig::default()).preprocess(&synthetic_page());
    let library = Arc::new(SymbolLibrary::builtin());

    c.bench_function("detect", |b| {
        b.iter(|| detect(black_box(&normalized), library.clone()));
    });

    let components = detect(&normalized, library).components;
    c.bench_function("trace", |b| {
        b.iter(|| trace(black_box(&normalized), black_box(&components), &TracerConfig::default()));
    });
}

fn bench_full_import(c: &mut Criterion) {
    let page = synthetic_page();
    let metadata = ImageMetadata::declared(&page, InputFormat::Png, 300.0);
    let importer = Importer::new(ImportConfig::default(), Arc::new(SymbolLibrary::builtin())).unwrap();
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();

    c.bench_function("import_image", |b| {
        b.iter(|| {
            runtime
                .block_on(importer.import_image(black_box(&page), &metadata, &CancelFlag::new()))
                .unwrap()
        });
    });
}

criterion_group!(benches, bench_preprocess, bench_detect_and_trace, bench_full_import);
criterion_main!(benches);
