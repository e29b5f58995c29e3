use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use terrain_core::{
    analysis::study_heightfield,
    procedural::{relief_heightfield, ReliefProfile},
    raster::gradient,
    TerrainLod,
};

fn bench_study(c: &mut Criterion) {
    let lod = TerrainLod::L30m;
    let mut group = c.benchmark_group("study");

    for size in [64usize, 128, 256] {
        let elevation = relief_heightfield(size, size, lod, &ReliefProfile::mountains(), 3);
        let slopes = gradient(&elevation, lod.meters_per_sample());
        group.bench_with_input(BenchmarkId::new("windowed", size), &size, |b, _| {
            b.iter(|| study_heightfield(&elevation, &slopes, lod.window_size()));
        });
    }

    group.finish();
}

criterion_group!(study_benches, bench_study);
criterion_main!(study_benches);
