mod common;

use std::sync::Arc;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use terrain_core::{
    operators, AnalysisConfig, BlendMasks, GaConfig, Gene, Pattern, Population, Raster, RegionMap,
    TerrainChromosome, TerrainLibrary, TerrainLod,
};

use common::relief_library;

fn pattern(library: &TerrainLibrary, width: usize, height: usize) -> Arc<Pattern> {
    let lod = TerrainLod::L90m;
    library.ensure_studied(lod);
    library.ensure_analyzed(lod);
    let map = RegionMap::uniform(width, height, 2, lod, library.size()).expect("map");
    let elevation = Raster::from_fn(width, height, |x, y| (x as f32 * 0.7 + y as f32).sin() * 40.0);
    Arc::new(
        Pattern::new(
            elevation,
            Arc::new(map),
            library,
            Arc::new(BlendMasks::default()),
            Arc::new(AnalysisConfig::default()),
        )
        .expect("pattern"),
    )
}

fn fingerprint(gene: &Gene) -> (isize, isize, u32, u32, u32) {
    (
        gene.source_center.0,
        gene.source_center.1,
        gene.rotation.to_bits(),
        gene.scale.to_bits(),
        gene.offset.to_bits(),
    )
}

fn fingerprints(chromosome: &TerrainChromosome) -> Vec<(isize, isize, u32, u32, u32)> {
    chromosome.genes().iter().map(fingerprint).collect()
}

#[test]
fn pruning_keeps_the_rounded_share_and_the_elites() {
    let library = relief_library(TerrainLod::L90m, 64, 3);
    let pattern = pattern(&library, 36, 36);
    let config = GaConfig::default();

    for (n, selection, elite, seed) in [
        (5, 0.75, 0.2, 1u64),
        (8, 0.5, 0.25, 2),
        (10, 0.3, 0.3, 3),
        (6, 0.5, 0.0, 4),
    ] {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut population = Population::new(Arc::clone(&pattern), n);
        population.replenish(&library, &config, &mut rng);
        population.evaluate(config.fitness_log_constant);

        let mut ranked: Vec<(usize, f32)> = population
            .slots()
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|c| (i, c.fitness().overall)))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

        let survivors = population.prune(selection, elite, &mut rng);
        let expected = (n as f32 * selection).round() as usize;
        assert_eq!(survivors.len(), expected, "n={n} r={selection}");
        assert_eq!(population.alive_count(), expected);

        let elites = (n as f32 * elite).round() as usize;
        for (slot, _) in ranked.iter().take(elites) {
            assert!(population.slots()[*slot].is_some(), "elite {slot} pruned (n={n})");
        }
    }
}

#[test]
fn crossover_between_mismatched_grids_changes_nothing() {
    let library = relief_library(TerrainLod::L90m, 64, 4);
    let config = GaConfig::default();
    let mut rng = ChaCha8Rng::seed_from_u64(9);

    let mut a = TerrainChromosome::new(pattern(&library, 36, 36));
    let mut b = TerrainChromosome::new(pattern(&library, 48, 24));
    operators::randomize_all(&mut a, &library, &config, &mut rng);
    operators::randomize_all(&mut b, &library, &config, &mut rng);
    let (before_a, before_b) = (fingerprints(&a), fingerprints(&b));

    assert_eq!(operators::cross(&mut a, &mut b, 1.0, 4, &mut rng), 0);
    assert_eq!(fingerprints(&a), before_a);
    assert_eq!(fingerprints(&b), before_b);
}

#[test]
fn crossover_only_swaps_genes_in_place() {
    let library = relief_library(TerrainLod::L90m, 64, 5);
    let config = GaConfig::default();
    let mut rng = ChaCha8Rng::seed_from_u64(12);
    let pattern = pattern(&library, 60, 60);

    let mut a = TerrainChromosome::new(Arc::clone(&pattern));
    let mut b = TerrainChromosome::new(pattern);
    operators::randomize_all(&mut a, &library, &config, &mut rng);
    operators::randomize_all(&mut b, &library, &config, &mut rng);
    let (before_a, before_b) = (fingerprints(&a), fingerprints(&b));

    let mut exchanged = 0;
    for _ in 0..8 {
        exchanged += operators::cross(&mut a, &mut b, 1.0, 3, &mut rng);
    }
    assert!(exchanged > 0);

    let (after_a, after_b) = (fingerprints(&a), fingerprints(&b));
    for i in 0..before_a.len() {
        let mut before = [before_a[i], before_b[i]];
        let mut after = [after_a[i], after_b[i]];
        before.sort();
        after.sort();
        assert_eq!(before, after, "gene {i} left its slot");
    }
    for (i, gene) in a.genes().iter().enumerate() {
        assert_eq!(gene.index, (i % a.grid_width(), i / a.grid_width()));
    }
}
