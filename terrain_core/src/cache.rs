//! On-disk analysis cache, one bincode blob per (sample, LOD).
//!
//! Record order: header (magic token, format version, LOD tag), then the
//! elevation, gradient and four local-aggregate rasters, then the frequency
//! spectrum and five global statistics, then the peak, edge and ridge lists.

use std::{
    fs,
    io::{self, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    analysis::{GlobalStats, LocalAggregates},
    features::{Feature, FeatureSet},
    lod::TerrainLod,
    raster::{Heightfield, RangeField, VectorField},
    spectrum::FrequencySpectrum,
    stats::Statistics,
};

pub const CACHE_MAGIC: [u8; 8] = *b"TSYNCACH";
pub const CACHE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to access analysis cache {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("analysis cache {path:?} has a mismatched header")]
    HeaderMismatch { path: PathBuf },
    #[error("failed to encode or decode analysis cache: {0}")]
    Codec(#[from] bincode::Error),
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct CacheHeader {
    magic: [u8; 8],
    version: u32,
    lod: TerrainLod,
}

/// Fully studied contents of one (sample, LOD) view.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CachedAnalysis {
    pub elevation: Heightfield,
    pub gradient: VectorField,
    pub local_elevation_mean: Heightfield,
    pub local_gradient_mean: VectorField,
    pub local_elevation_limits: RangeField,
    pub local_slope_limits: RangeField,
    pub spectrum: FrequencySpectrum,
    pub elevation_stats: Statistics,
    pub slope_stats: Statistics,
    pub edge_length_stats: Statistics,
    pub edge_scale_stats: Statistics,
    pub edge_strength_stats: Statistics,
    pub peaks: Vec<Feature>,
    pub edges: Vec<Feature>,
    pub ridges: Vec<Feature>,
}

impl CachedAnalysis {
    pub fn global(&self) -> GlobalStats {
        GlobalStats {
            elevation: self.elevation_stats,
            slope: self.slope_stats,
            edge_length: self.edge_length_stats,
            edge_scale: self.edge_scale_stats,
            edge_strength: self.edge_strength_stats,
        }
    }

    pub fn local(&self) -> LocalAggregates {
        LocalAggregates {
            elevation_mean: self.local_elevation_mean.clone(),
            gradient_mean: self.local_gradient_mean.clone(),
            elevation_range: self.local_elevation_limits.clone(),
            slope_range: self.local_slope_limits.clone(),
        }
    }

    pub fn features(&self) -> FeatureSet {
        FeatureSet {
            peaks: self.peaks.clone(),
            edges: self.edges.clone(),
            ridges: self.ridges.clone(),
        }
    }
}

/// Directory of cache blobs keyed by sample identity and LOD.
#[derive(Debug, Clone)]
pub struct AnalysisCache {
    dir: PathBuf,
}

impl AnalysisCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &str, lod: TerrainLod) -> PathBuf {
        let sanitized: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{sanitized}.{}.tcache", lod.name()))
    }

    pub fn load(&self, key: &str, lod: TerrainLod) -> Result<CachedAnalysis, CacheError> {
        let path = self.path_for(key, lod);
        let file = fs::File::open(&path).map_err(io_error(&path))?;
        let mut reader = BufReader::new(file);
        let header: CacheHeader = bincode::deserialize_from(&mut reader)?;
        let expected = CacheHeader {
            magic: CACHE_MAGIC,
            version: CACHE_VERSION,
            lod,
        };
        if header != expected {
            return Err(CacheError::HeaderMismatch { path });
        }
        Ok(bincode::deserialize_from(&mut reader)?)
    }

    /// Write through a temporary file so readers never observe a partial blob.
    pub fn store(
        &self,
        key: &str,
        lod: TerrainLod,
        entry: &CachedAnalysis,
    ) -> Result<PathBuf, CacheError> {
        let path = self.path_for(key, lod);
        fs::create_dir_all(&self.dir).map_err(io_error(&self.dir))?;
        let tmp = path.with_extension("tcache.tmp");
        {
            let file = fs::File::create(&tmp).map_err(io_error(&tmp))?;
            let mut writer = BufWriter::new(file);
            let header = CacheHeader {
                magic: CACHE_MAGIC,
                version: CACHE_VERSION,
                lod,
            };
            bincode::serialize_into(&mut writer, &header)?;
            bincode::serialize_into(&mut writer, entry)?;
            writer.flush().map_err(io_error(&tmp))?;
        }
        fs::rename(&tmp, &path).map_err(io_error(&path))?;
        Ok(path)
    }
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> CacheError {
    let path = path.to_path_buf();
    move |source| CacheError::Io { path, source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::Raster;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "terrain_core_cache_{name}_{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    fn entry() -> CachedAnalysis {
        CachedAnalysis {
            elevation: Raster::filled(4, 4, 12.0),
            gradient: Raster::filled(4, 4, [0.0, 0.0]),
            elevation_stats: Statistics::from_values([12.0; 16]),
            ..CachedAnalysis::default()
        }
    }

    #[test]
    fn stored_entries_load_back() {
        let cache = AnalysisCache::new(scratch_dir("roundtrip"));
        cache.store("mesa:0", TerrainLod::L90m, &entry()).unwrap();
        let loaded = cache.load("mesa:0", TerrainLod::L90m).unwrap();
        assert_eq!(loaded, entry());
        assert!(cache.path_for("mesa:0", TerrainLod::L90m).ends_with("mesa_0.90m.tcache"));
    }

    #[test]
    fn lod_mismatch_is_a_miss() {
        let cache = AnalysisCache::new(scratch_dir("mismatch"));
        let path = cache.store("mesa:0", TerrainLod::L90m, &entry()).unwrap();
        fs::copy(&path, cache.path_for("mesa:0", TerrainLod::L30m)).unwrap();
        assert!(matches!(
            cache.load("mesa:0", TerrainLod::L30m),
            Err(CacheError::HeaderMismatch { .. })
        ));
    }

    #[test]
    fn truncated_blob_is_a_miss() {
        let cache = AnalysisCache::new(scratch_dir("truncated"));
        let path = cache.store("mesa:1", TerrainLod::L30m, &entry()).unwrap();
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
        assert!(matches!(
            cache.load("mesa:1", TerrainLod::L30m),
            Err(CacheError::Codec(_))
        ));
        assert!(matches!(
            cache.load("absent", TerrainLod::L30m),
            Err(CacheError::Io { .. })
        ));
    }
}
