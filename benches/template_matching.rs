use criterion::{Criterion, criterion_group, criterion_main};
use image::{GrayImage, Luma};
use screenpilot::models::Region;
use screenpilot::services::match_template;
use std::hint::black_box;

fn textured(w: u32, h: u32, seed: u32) -> GrayImage {
    GrayImage::from_fn(w, h, |x, y| {
        Luma([((x * 31 + y * 17 + seed * 7 + (x * y) % 13) % 251) as u8])
    })
}

fn bench_match_template(c: &mut Criterion) {
    let frame = textured(540, 960, 3);
    let template = image::imageops::crop_imm(&frame, 200, 700, 48, 32).to_image();

    c.bench_function("match_full_frame", |b| {
        b.iter(|| match_template(black_box(&frame), black_box(&template), None))
    });

    let region = Some(Region::new(176, 676, 96, 80));
    c.bench_function("match_padded_region", |b| {
        b.iter(|| match_template(black_box(&frame), black_box(&template), region))
    });
}

criterion_group!(benches, bench_match_template);
criterion_main!(benches);
