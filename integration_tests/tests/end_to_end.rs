mod common;

use std::sync::Arc;

use anyhow::Result;
use terrain_core::{
    fitness_from_rms, generate_terrain, raster::rms_difference, BlendMasks, GaConfig,
    MapRasterization, Raster, RegionMap, SynthesisConfig, TerrainLod,
};

use common::{flat_library, ga, relief_library};

#[test]
fn flat_pattern_converges() -> Result<()> {
    let lod = TerrainLod::L30m;
    let library = flat_library(0.0, 2, 96, lod);
    let map = RegionMap::uniform(64, 64, 1, lod, library.size())?;
    assert_eq!(map.region_count(), 1);

    let config = GaConfig {
        population_size: 4,
        evolution_cycles: 4,
        max_offset: 0.5,
        seed: 3,
        ..GaConfig::default()
    };
    let pattern = Raster::filled(64, 64, 0.0f32);
    let refinement = ga(config.clone(), &library).refine(pattern.clone(), Arc::new(map))?;

    assert_eq!(refinement.heightfield.width(), 64);
    assert_eq!(refinement.heightfield.height(), 64);
    let rms = rms_difference(&refinement.heightfield, &pattern);
    assert!(rms < 1.0, "rms {rms}");
    assert!(refinement.fitness.overall >= 0.9, "fitness {}", refinement.fitness.overall);
    assert!((refinement.fitness.overall - fitness_from_rms(rms, config.fitness_log_constant)).abs() < 1e-3);
    Ok(())
}

#[test]
fn refinement_tracks_a_relief_pattern() -> Result<()> {
    let lod = TerrainLod::L90m;
    let library = relief_library(lod, 96, 21);
    let types = Raster::from_fn(40, 40, |x, _| if x < 20 { 1 } else { 2 });
    let map = RegionMap::analyze(types, lod, library.size())?;
    let pattern = Raster::from_fn(40, 40, |x, y| (x as f32 * 3.0) + (y as f32).sin() * 10.0);

    let config = GaConfig {
        evolution_cycles: 3,
        ..GaConfig::default()
    };
    let refinement = ga(config, &library).refine(pattern, Arc::new(map))?;
    assert_eq!(refinement.generations, 3);
    // One entry per generation plus the closing evaluation.
    assert_eq!(refinement.history.len(), 4);
    assert!(refinement.fitness.overall > 0.0);
    assert_eq!(refinement.fitness.regions.len(), 2);
    assert!(refinement.heightfield.values().iter().all(|v| v.is_finite()));
    Ok(())
}

#[test]
fn coarse_to_fine_generation_grows_each_level() -> Result<()> {
    let library = flat_library(12.0, 2, 128, TerrainLod::L90m);
    let map = MapRasterization::new(Raster::filled(6, 6, 1), TerrainLod::L810m, library.size())?;
    let config = SynthesisConfig {
        ga: GaConfig {
            population_size: 3,
            evolution_cycles: 1,
            max_offset: 0.0,
            ..GaConfig::default()
        },
        ..SynthesisConfig::default()
    };
    let terrain = generate_terrain(
        &map,
        library,
        Arc::new(BlendMasks::default()),
        &config,
        TerrainLod::L810m,
        TerrainLod::L90m,
    )?;

    let lods: Vec<_> = terrain.levels.iter().map(|l| l.lod).collect();
    assert_eq!(lods, vec![TerrainLod::L810m, TerrainLod::L270m, TerrainLod::L90m]);
    let sizes: Vec<_> = terrain.levels.iter().map(|l| l.timing.actual_size).collect();
    assert_eq!(sizes, vec![(6, 6), (18, 18), (54, 54)]);
    for level in &terrain.levels[1..] {
        let fitness = level.fitness.as_ref().expect("refined levels carry fitness");
        assert!(fitness.overall > 0.9, "{}: {}", level.lod, fitness.overall);
    }
    Ok(())
}
