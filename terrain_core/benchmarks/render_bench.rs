use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use terrain_core::{
    fitness::evaluate,
    operators::randomize_all,
    procedural::{relief_heightfield, ReliefProfile},
    render::render_chromosome,
    AnalysisConfig, BlendMasks, GaConfig, Pattern, RegionMap, TerrainChromosome, TerrainLibrary,
    TerrainLod, TerrainSample,
};

const LOD: TerrainLod = TerrainLod::L90m;

fn hills_library() -> TerrainLibrary {
    let mut library = TerrainLibrary::default();
    let hills = library.add_terrain_type("hills");
    for seed in 0..4 {
        let elevation = relief_heightfield(128, 128, LOD, &ReliefProfile::hills(), seed);
        library
            .add_sample(hills, TerrainSample::from_heightfield(elevation, LOD))
            .expect("hills type exists");
    }
    library.ensure_studied(LOD);
    library
}

fn randomized_chromosome(library: &TerrainLibrary, size: usize) -> TerrainChromosome {
    let map = RegionMap::uniform(size, size, 1, LOD, library.size()).expect("type 1 is in range");
    let pattern = Pattern::new(
        relief_heightfield(size, size, LOD, &ReliefProfile::hills(), 99),
        Arc::new(map),
        library,
        Arc::new(BlendMasks::default()),
        Arc::new(AnalysisConfig::default()),
    )
    .expect("pattern matches map");
    let mut chromosome = TerrainChromosome::new(Arc::new(pattern));
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    randomize_all(&mut chromosome, library, &GaConfig::default(), &mut rng);
    chromosome
}

fn bench_render(c: &mut Criterion) {
    let library = hills_library();
    let mut group = c.benchmark_group("render");

    for size in [64usize, 128, 256] {
        let chromosome = randomized_chromosome(&library, size);
        group.bench_with_input(BenchmarkId::new("splat", size), &chromosome, |b, chromosome| {
            b.iter(|| render_chromosome(chromosome));
        });
        group.bench_with_input(BenchmarkId::new("evaluate", size), &chromosome, |b, chromosome| {
            b.iter_batched(
                || chromosome.clone(),
                |mut chromosome| evaluate(&mut chromosome, 5.0),
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

criterion_group!(render_benches, bench_render);
criterion_main!(render_benches);
