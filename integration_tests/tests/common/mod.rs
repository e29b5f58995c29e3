#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Once};

use terrain_core::{
    procedural::{relief_heightfield, ReliefProfile},
    AnalysisConfig, BlendMasks, GaConfig, HeightfieldGa, Raster, TerrainLibrary, TerrainLod,
    TerrainSample,
};

static INIT: Once = Once::new();

pub fn ensure_test_config() {
    INIT.call_once(|| {
        let config_path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("tests")
            .join("fixtures")
            .join("test_synthesis_config.json");

        debug_assert!(
            config_path.exists(),
            "missing test synthesis config at {}",
            config_path.display()
        );

        std::env::set_var(terrain_core::config::CONFIG_PATH_ENV, &config_path);
    });
}

/// One terrain type, "flat", whose samples are constant at `value`.
pub fn flat_library(value: f32, samples: usize, size: usize, lod: TerrainLod) -> Arc<TerrainLibrary> {
    let mut library = TerrainLibrary::default();
    let flat = library.add_terrain_type("flat");
    for _ in 0..samples {
        library
            .add_sample(flat, TerrainSample::from_heightfield(Raster::filled(size, size, value), lod))
            .expect("flat sample");
    }
    Arc::new(library)
}

/// Plains and hills generated procedurally at `lod`.
pub fn relief_library(lod: TerrainLod, size: usize, seed: u64) -> Arc<TerrainLibrary> {
    let mut library = TerrainLibrary::default();
    for (name, profile) in [("plains", ReliefProfile::plains()), ("hills", ReliefProfile::hills())] {
        let id = library.add_terrain_type(name);
        for i in 0..2u64 {
            let elevation = relief_heightfield(size, size, lod, &profile, seed ^ ((id as u64) << 16) ^ i);
            library
                .add_sample(id, TerrainSample::from_heightfield(elevation, lod))
                .expect("relief sample");
        }
    }
    Arc::new(library)
}

pub fn ga(config: GaConfig, library: &Arc<TerrainLibrary>) -> HeightfieldGa {
    HeightfieldGa::new(
        config,
        Arc::clone(library),
        Arc::new(BlendMasks::default()),
        Arc::new(AnalysisConfig::default()),
    )
}
