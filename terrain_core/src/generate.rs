//! Coarse-to-fine terrain generation over a range of LODs.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::{
    config::SynthesisConfig,
    error::SynthesisError,
    fitness::FitnessMeasures,
    library::TerrainLibrary,
    lod::TerrainLod,
    masks::BlendMasks,
    population::HeightfieldGa,
    raster::{resample_bilinear_to, Heightfield, Raster},
    region::{MapRasterization, RegionMap, VOID_TERRAIN_TYPE},
};

/// Wall-clock split of one generated level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LodTiming {
    /// Building the level's starting point: naive blend or pattern resample.
    pub generation: Duration,
    pub refinement: Duration,
    pub total: Duration,
    pub target_size: (usize, usize),
    pub actual_size: (usize, usize),
}

#[derive(Debug, Clone)]
pub struct GeneratedLevel {
    pub lod: TerrainLod,
    pub heightfield: Heightfield,
    /// `None` for the naive blend at the start LOD.
    pub fitness: Option<FitnessMeasures>,
    pub timing: LodTiming,
}

#[derive(Debug, Clone)]
pub struct GeneratedTerrain {
    /// Coarse to fine.
    pub levels: Vec<GeneratedLevel>,
    /// Time spent preloading the library.
    pub loading: Duration,
}

impl GeneratedTerrain {
    pub fn level(&self, lod: TerrainLod) -> Option<&GeneratedLevel> {
        self.levels.iter().find(|l| l.lod == lod)
    }

    pub fn finest(&self) -> Option<&GeneratedLevel> {
        self.levels.last()
    }
}

/// Build heightfields from `start` down to `target`: a naive blend at
/// `start`, then one GA refinement per finer LOD using the previous level,
/// resampled, as its pattern.
pub fn generate_terrain(
    map: &MapRasterization,
    library: Arc<TerrainLibrary>,
    masks: Arc<BlendMasks>,
    config: &SynthesisConfig,
    start: TerrainLod,
    target: TerrainLod,
) -> Result<GeneratedTerrain, SynthesisError> {
    if start > target {
        return Err(SynthesisError::InvertedLodRange { start, target });
    }

    let loading_started = Instant::now();
    library.ensure_loaded(start, target);
    let loading = loading_started.elapsed();
    tracing::info!(
        target: "terrain_synth::generate",
        start_lod = %start,
        target_lod = %target,
        elapsed_ms = loading.as_millis() as u64,
        "generate.library.loaded"
    );

    let analysis_config = Arc::new(config.analysis.clone());
    let mut rng = ChaCha8Rng::seed_from_u64(config.ga.seed);
    let mut levels: Vec<GeneratedLevel> = Vec::new();

    for lod in TerrainLod::range(start, target) {
        let level_started = Instant::now();
        let region_map = map.at(lod)?;
        let target_size = (region_map.width(), region_map.height());

        let level = match levels.last() {
            None => {
                let heightfield = naive_blend(&region_map, &library, &mut rng)?;
                let generation = level_started.elapsed();
                GeneratedLevel {
                    lod,
                    fitness: None,
                    timing: LodTiming {
                        generation,
                        refinement: Duration::ZERO,
                        total: generation,
                        target_size,
                        actual_size: (heightfield.width(), heightfield.height()),
                    },
                    heightfield,
                }
            }
            Some(previous) => {
                let pattern = resample_bilinear_to(&previous.heightfield, target_size.0, target_size.1);
                let generation = level_started.elapsed();
                let mut ga_config = config.ga.clone();
                ga_config.seed = rng.gen();
                let mut ga = HeightfieldGa::new(
                    ga_config,
                    Arc::clone(&library),
                    Arc::clone(&masks),
                    Arc::clone(&analysis_config),
                );
                let refine_started = Instant::now();
                let refinement = ga.refine(pattern, Arc::clone(&region_map))?;
                let refine_elapsed = refine_started.elapsed();
                GeneratedLevel {
                    lod,
                    timing: LodTiming {
                        generation,
                        refinement: refine_elapsed,
                        total: level_started.elapsed(),
                        target_size,
                        actual_size: (refinement.heightfield.width(), refinement.heightfield.height()),
                    },
                    fitness: Some(refinement.fitness),
                    heightfield: refinement.heightfield,
                }
            }
        };

        tracing::info!(
            target: "terrain_synth::generate",
            lod = %lod,
            generation_ms = level.timing.generation.as_millis() as u64,
            refinement_ms = level.timing.refinement.as_millis() as u64,
            total_ms = level.timing.total.as_millis() as u64,
            target_size = ?level.timing.target_size,
            actual_size = ?level.timing.actual_size,
            fitness = level.fitness.as_ref().map(|f| f.overall),
            "generate.lod.completed"
        );
        levels.push(level);
    }

    Ok(GeneratedTerrain { levels, loading })
}

/// Cover each region with a random chunk of one of its type's samples,
/// feathered by the region's soft mask.
pub fn naive_blend<R: Rng + ?Sized>(
    map: &RegionMap,
    library: &TerrainLibrary,
    rng: &mut R,
) -> Result<Heightfield, SynthesisError> {
    let lod = map.lod();
    let mut output = Raster::filled(map.width(), map.height(), 0.0f32);
    let mut weights = Raster::filled(map.width(), map.height(), 0.0f32);

    for region in map.regions() {
        if region.terrain_type == VOID_TERRAIN_TYPE {
            continue;
        }
        let terrain_type = library.terrain_type(region.terrain_type)?;
        let border = library
            .seam(region.terrain_type, region.terrain_type)
            .border_width(lod);
        let mask = map.region_mask(region.id, border)?;
        let Some(sample) = terrain_type.random_sample(rng) else {
            tracing::warn!(
                target: "terrain_synth::generate",
                terrain_type = terrain_type.name(),
                "generate.blend.no_samples"
            );
            continue;
        };
        sample.ensure_loaded(lod);
        let elevation = sample.elevation(lod);
        let (mw, mh) = (mask.weights.width(), mask.weights.height());
        if elevation.width() < mw || elevation.height() < mh {
            tracing::warn!(
                target: "terrain_synth::generate",
                sample = %sample.view_name(lod),
                sample_size = ?(elevation.width(), elevation.height()),
                mask_size = ?(mw, mh),
                "generate.blend.sample_too_small"
            );
            continue;
        }
        let sx = rng.gen_range(0..=elevation.width() - mw);
        let sy = rng.gen_range(0..=elevation.height() - mh);
        for y in 0..mh {
            for x in 0..mw {
                let w = mask.weights.sample(x, y);
                if w <= 0.0 {
                    continue;
                }
                let ox = (mask.bounds.x0 + x as isize) as usize;
                let oy = (mask.bounds.y0 + y as isize) as usize;
                let i = output.idx(ox, oy);
                output.values_mut()[i] += w * elevation.sample(sx + x, sy + y);
                weights.values_mut()[i] += w;
            }
        }
    }

    let total_weight = weights.sum();
    let fallback = if total_weight > 0.0 {
        (output.sum() / total_weight) as f32
    } else {
        0.0
    };
    for (value, &w) in output.values_mut().iter_mut().zip(weights.values()) {
        *value = if w > 0.0 { *value / w } else { fallback };
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{masks::BlendMasks, sample::TerrainSample};

    fn library(value: f32, size: usize, lod: TerrainLod) -> Arc<TerrainLibrary> {
        let mut library = TerrainLibrary::default();
        let flat = library.add_terrain_type("flat");
        library
            .add_sample(flat, TerrainSample::from_heightfield(Raster::filled(size, size, value), lod))
            .unwrap();
        Arc::new(library)
    }

    #[test]
    fn naive_blend_of_constant_samples_is_constant() {
        let library = library(42.0, 64, TerrainLod::L270m);
        let map = RegionMap::uniform(20, 20, 1, TerrainLod::L270m, library.size()).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let out = naive_blend(&map, &library, &mut rng).unwrap();
        assert!(out.values().iter().all(|&v| (v - 42.0).abs() < 1e-4));
    }

    #[test]
    fn too_small_samples_are_skipped() {
        let library = library(42.0, 8, TerrainLod::L270m);
        let map = RegionMap::uniform(20, 20, 1, TerrainLod::L270m, library.size()).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let out = naive_blend(&map, &library, &mut rng).unwrap();
        assert!(out.values().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn inverted_range_is_an_error() {
        let library = library(0.0, 32, TerrainLod::L90m);
        let map = MapRasterization::new(Raster::filled(8, 8, 1), TerrainLod::L90m, library.size()).unwrap();
        let err = generate_terrain(
            &map,
            library,
            Arc::new(BlendMasks::default()),
            &SynthesisConfig::default(),
            TerrainLod::L30m,
            TerrainLod::L270m,
        )
        .unwrap_err();
        assert!(matches!(err, SynthesisError::InvertedLodRange { .. }));
    }

    #[test]
    fn levels_follow_the_map_sizes() {
        let library = library(5.0, 96, TerrainLod::L90m);
        let map = MapRasterization::new(Raster::filled(8, 8, 1), TerrainLod::L270m, library.size()).unwrap();
        let config = SynthesisConfig {
            ga: crate::config::GaConfig {
                population_size: 3,
                evolution_cycles: 1,
                max_offset: 0.0,
                ..Default::default()
            },
            ..Default::default()
        };
        let terrain = generate_terrain(
            &map,
            library,
            Arc::new(BlendMasks::default()),
            &config,
            TerrainLod::L270m,
            TerrainLod::L90m,
        )
        .unwrap();
        assert_eq!(terrain.levels.len(), 2);
        let coarse = terrain.level(TerrainLod::L270m).unwrap();
        assert!(coarse.fitness.is_none());
        let fine = terrain.finest().unwrap();
        assert_eq!(fine.lod, TerrainLod::L90m);
        assert_eq!(fine.timing.actual_size, (24, 24));
        assert_eq!(fine.timing.actual_size, fine.timing.target_size);
        assert!(fine.fitness.as_ref().unwrap().overall > 0.9);
    }
}
