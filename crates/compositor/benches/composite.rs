//! Compositor benchmarks.

use common::color::Color;
use common::geometry::PixelRect;
use compositor::{Composer, CompositorConfig, LayerFlags, PixelFormat};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

/// A full-screen background under a stack of translucent tiles.
fn scene(width: u32, height: u32, tiles: u32) -> Composer {
    let composer = Composer::new(CompositorConfig::headless()).unwrap();

    let bg = composer
        .create_layer("background", 0, width, height, PixelFormat::Rgbx8888, LayerFlags::OPAQUE)
        .unwrap();
    composer.fill_layer(bg, Color::rgb(63, 63, 195)).unwrap();

    let mut txn = composer.begin_transaction();
    for i in 0..tiles {
        let tile = composer
            .create_layer("tile", 0, 256, 256, PixelFormat::Rgba8888, LayerFlags::empty())
            .unwrap();
        composer.fill_layer(tile, Color::rgba(195, 63, 63, 200)).unwrap();
        txn.set_position(tile, (i * 97 % width) as f32, (i * 53 % height) as f32)
            .unwrap()
            .set_alpha(tile, 0.75)
            .unwrap()
            .set_z_order(tile, i as i32 + 1)
            .unwrap();
    }
    composer.commit_transaction(txn, false);
    composer
}

fn bench_capture(c: &mut Criterion) {
    let mut group = c.benchmark_group("capture_composite");

    for &(width, height) in &[(640u32, 480u32), (1280, 720), (1920, 1080)] {
        let composer = scene(width, height, 8);
        let region = PixelRect::new(0, 0, width, height);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}x{}", width, height)),
            &region,
            |b, region| b.iter(|| composer.capture_composite(0, black_box(*region)).unwrap()),
        );
    }

    group.finish();
}

fn bench_rotated_layer(c: &mut Criterion) {
    let composer = scene(1280, 720, 0);
    let layer = composer
        .create_layer("rotated", 0, 512, 512, PixelFormat::Rgba8888, LayerFlags::empty())
        .unwrap();
    composer.fill_layer(layer, Color::rgb(63, 195, 63)).unwrap();

    let half = std::f32::consts::FRAC_1_SQRT_2;
    let mut txn = composer.begin_transaction();
    txn.set_matrix(layer, half, half, -half, half)
        .unwrap()
        .set_position(layer, 640.0, 0.0)
        .unwrap()
        .set_z_order(layer, 1)
        .unwrap();
    composer.commit_transaction(txn, false);

    c.bench_function("capture_rotated_1280x720", |b| {
        b.iter(|| {
            composer
                .capture_composite(0, black_box(PixelRect::new(0, 0, 1280, 720)))
                .unwrap()
        })
    });
}

criterion_group!(benches, bench_capture, bench_rotated_layer);
criterion_main!(benches);
