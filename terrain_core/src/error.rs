//! Top-level error for synthesis runs.

use thiserror::Error;

use crate::{
    cache::CacheError,
    config::ConfigError,
    library::LibraryError,
    lod::{LodError, TerrainLod},
    region::RegionError,
    sample::SampleError,
};

#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error(transparent)]
    Region(#[from] RegionError),
    #[error(transparent)]
    Sample(#[from] SampleError),
    #[error(transparent)]
    Library(#[from] LibraryError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Lod(#[from] LodError),
    #[error(
        "pattern is {pattern_width}x{pattern_height} but the region map is {map_width}x{map_height}"
    )]
    PatternSizeMismatch {
        pattern_width: usize,
        pattern_height: usize,
        map_width: usize,
        map_height: usize,
    },
    #[error("population produced no chromosome to return")]
    EmptyPopulation,
    #[error("LOD range {start}..={target} runs fine to coarse")]
    InvertedLodRange {
        start: TerrainLod,
        target: TerrainLod,
    },
}

impl SynthesisError {
    /// Broken contracts between collaborators that must stop the run.
    pub fn is_fatal_configuration(&self) -> bool {
        matches!(
            self,
            SynthesisError::Region(RegionError::TerrainTypeOutOfRange { .. })
                | SynthesisError::Config(_)
        )
    }
}
