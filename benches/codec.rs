use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use wavevds::wavelet::Scratch;
use wavevds::{BlockCompressor, BoundaryMode, WaveletFamily};

fn smooth_block(n: usize) -> Vec<f32> {
    let mut data = Vec::with_capacity(n * n * n);
    for z in 0..n {
        for y in 0..n {
            for x in 0..n {
                let (fx, fy, fz) = (x as f32 / n as f32, y as f32 / n as f32, z as f32 / n as f32);
                data.push((fx * 6.0).sin() * (fy * 4.0).cos() + fz);
            }
        }
    }
    data
}

fn bench_codec(c: &mut Criterion) {
    let block = smooth_block(64);
    let compressor = BlockCompressor::new(
        [64, 64, 64],
        WaveletFamily::Bior33,
        BoundaryMode::Symh,
        &[1, 10, 100, 500],
        None,
    )
    .unwrap();
    let mut scratch = Scratch::default();

    c.bench_function("decompose_64_bior33", |b| {
        b.iter(|| compressor.decompose(black_box(&block), &mut scratch).unwrap())
    });

    let decomposed = compressor.decompose(&block, &mut scratch).unwrap();
    let last = compressor.num_lods() - 1;
    c.bench_function("reconstruct_64_bior33_finest", |b| {
        b.iter(|| {
            compressor
                .reconstruct(black_box(&decomposed.coeffs), &decomposed.maps, last, 0, None, &mut scratch)
                .unwrap()
        })
    });
    c.bench_function("reconstruct_64_bior33_coarse_half_res", |b| {
        b.iter(|| {
            compressor
                .reconstruct(black_box(&decomposed.coeffs), &decomposed.maps, 0, 1, None, &mut scratch)
                .unwrap()
        })
    });

    c.bench_function("sigmap_encode", |b| {
        b.iter(|| {
            for map in &decomposed.maps {
                black_box(map.get_map().unwrap());
            }
        })
    });
}

criterion_group!(benches, bench_codec);
criterion_main!(benches);
