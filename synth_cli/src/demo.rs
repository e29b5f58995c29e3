//! Procedural reference library and region layouts for the CLI.

use std::{fs, path::Path};

use clap::ValueEnum;
use color_eyre::{eyre::eyre, Result};
use terrain_core::{
    procedural::{relief_heightfield, ReliefProfile},
    AnalysisCache, AnalysisConfig, InMemorySource, Raster, TerrainLibrary, TerrainLod, TerrainSample,
    TerrainSeam, TerrainTypeId,
};

const DEMO_TYPES: [(&str, fn() -> ReliefProfile); 3] = [
    ("plains", ReliefProfile::plains),
    ("hills", ReliefProfile::hills),
    ("mountains", ReliefProfile::mountains),
];

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum Layout {
    /// Every pixel is plains.
    Uniform,
    /// Vertical bands of plains, hills and mountains.
    Bands,
    /// Mountains ringed by hills on a plains background.
    Massif,
}

/// Library with one type per demo relief, each holding `samples` grids of
/// `size × size` generated at `lod`.
pub fn demo_library(
    analysis: AnalysisConfig,
    cache: Option<AnalysisCache>,
    lod: TerrainLod,
    samples: usize,
    size: usize,
    seed: u64,
) -> TerrainLibrary {
    let mut library = TerrainLibrary::new(std::sync::Arc::new(analysis));
    if let Some(cache) = cache {
        library = library.with_cache(cache);
    }
    for (t, (name, profile)) in DEMO_TYPES.iter().enumerate() {
        let id = library.add_terrain_type(name);
        let profile = profile();
        for i in 0..samples {
            let sample_seed = seed ^ ((t as u64) << 32) ^ i as u64;
            let elevation = relief_heightfield(size, size, lod, &profile, sample_seed);
            let source = InMemorySource::new(elevation, lod)
                .with_cache_key(format!("demo-{name}-{sample_seed:016x}-{size}"));
            if let Err(err) = library.add_sample(id, TerrainSample::new(std::sync::Arc::new(source))) {
                tracing::warn!(target: "terrain_synth::library", error = %err, "demo.sample_rejected");
            }
        }
    }
    let rough = TerrainSeam {
        smoothness: 0.1,
        ..TerrainSeam::default()
    };
    library.set_seam(3, 3, rough);
    library
}

pub fn layout(kind: Layout, width: usize, height: usize) -> Raster<TerrainTypeId> {
    match kind {
        Layout::Uniform => Raster::filled(width, height, 1),
        Layout::Bands => Raster::from_fn(width, height, |x, _| {
            (x * DEMO_TYPES.len() / width.max(1)) as TerrainTypeId + 1
        }),
        Layout::Massif => {
            let (cx, cy) = (width as f32 / 2.0, height as f32 / 2.0);
            let radius = cx.min(cy);
            Raster::from_fn(width, height, |x, y| {
                let dx = x as f32 + 0.5 - cx;
                let dy = y as f32 + 0.5 - cy;
                let d = (dx * dx + dy * dy).sqrt() / radius.max(1.0);
                if d < 0.35 {
                    3
                } else if d < 0.7 {
                    2
                } else {
                    1
                }
            })
        }
    }
}

/// Read a layout from a JSON array of rows of terrain type IDs.
pub fn layout_from_file(path: &Path) -> Result<Raster<TerrainTypeId>> {
    let contents = fs::read_to_string(path)?;
    let rows: Vec<Vec<TerrainTypeId>> = serde_json::from_str(&contents)?;
    let height = rows.len();
    let width = rows.first().map_or(0, Vec::len);
    if width == 0 || rows.iter().any(|r| r.len() != width) {
        return Err(eyre!(
            "layout {} must be a non-empty rectangular array of rows",
            path.display()
        ));
    }
    Ok(Raster::new(width, height, rows.into_iter().flatten().collect()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bands_cover_every_type() {
        let raster = layout(Layout::Bands, 9, 2);
        assert_eq!(raster.values()[..9], [1, 1, 1, 2, 2, 2, 3, 3, 3]);
    }

    #[test]
    fn massif_has_a_mountain_core() {
        let raster = layout(Layout::Massif, 20, 20);
        assert_eq!(raster.sample(10, 10), 3);
        assert_eq!(raster.sample(0, 0), 1);
    }

    #[test]
    fn demo_library_has_three_types() {
        let library = demo_library(AnalysisConfig::default(), None, TerrainLod::L90m, 2, 32, 1);
        assert_eq!(library.size(), 4);
        assert_eq!(library.terrain_type(3).unwrap().len(), 2);
        assert_eq!(library.terrain_type_by_name("hills").unwrap().id(), 2);
    }
}
