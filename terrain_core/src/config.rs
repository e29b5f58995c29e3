//! Synthesis configuration.
//!
//! Loaded from `synthesis_config.json`, overridable through the
//! `TERRAIN_SYNTH_CONFIG_PATH` environment variable.

use std::{
    env, fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use bevy::prelude::Resource;
use serde::Deserialize;
use thiserror::Error;

use crate::{analysis::AnalysisConfig, cache::AnalysisCache, masks::MaskKind};

pub const BUILTIN_SYNTHESIS_CONFIG: &str = include_str!("data/synthesis_config.json");
pub const CONFIG_PATH_ENV: &str = "TERRAIN_SYNTH_CONFIG_PATH";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    pub ga: GaConfig,
    pub analysis: AnalysisConfig,
    pub cache: CacheConfig,
    pub blend: BlendConfig,
}

impl SynthesisConfig {
    pub fn builtin() -> Arc<Self> {
        Arc::new(
            serde_json::from_str(BUILTIN_SYNTHESIS_CONFIG)
                .expect("builtin synthesis config should parse"),
        )
    }

    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = SynthesisConfig::from_json_str(&contents)?;
        Ok(config)
    }

    /// The analysis cache described by the `cache` section, if enabled.
    pub fn analysis_cache(&self) -> Option<AnalysisCache> {
        if !self.cache.enabled {
            return None;
        }
        let dir = self
            .cache
            .directory
            .clone()
            .unwrap_or_else(|| env::temp_dir().join("terrain_synth_cache"));
        Some(AnalysisCache::new(dir))
    }
}

/// Genetic algorithm parameters for one `refine_heightfield` run.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GaConfig {
    pub population_size: usize,
    pub evolution_cycles: u32,
    /// Largest side, in genes, of a block swapped by crossover.
    pub max_crossover_width: usize,
    pub mutation_probability: f32,
    pub crossover_probability: f32,
    pub mutation_ratio: f32,
    pub crossover_ratio: f32,
    pub selection_ratio: f32,
    pub elite_ratio: f32,
    /// Pixels a gene's target may drift from its grid position.
    pub max_jitter: i32,
    pub max_scale: f32,
    /// Meters.
    pub max_offset: f32,
    /// Pixels a translate mutation may move the source center.
    pub max_translate: i32,
    /// Radians around the pattern's gradient angle.
    pub rotation_jitter: f32,
    pub fitness_log_constant: f32,
    /// Random source placements tried per gene; the most compatible wins.
    pub placement_candidates: usize,
    pub time_budget_ms: Option<u64>,
    /// Take cycles, population size and operator ratios from the seam
    /// between the region map's dominant terrain types.
    pub seam_overrides: bool,
    pub seed: u64,
}

impl Default for GaConfig {
    fn default() -> Self {
        Self {
            population_size: 5,
            evolution_cycles: 5,
            max_crossover_width: 4,
            mutation_probability: 0.1,
            crossover_probability: 0.2,
            mutation_ratio: 0.5,
            crossover_ratio: 0.5,
            selection_ratio: 0.75,
            elite_ratio: 0.2,
            max_jitter: 2,
            max_scale: 1.25,
            max_offset: 100.0,
            max_translate: 4,
            rotation_jitter: 0.2,
            fitness_log_constant: 5.0,
            placement_candidates: 3,
            time_budget_ms: None,
            seam_overrides: false,
            seed: 1,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BlendConfig {
    pub mask: MaskKind,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse synthesis config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("failed to read synthesis config from {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Resource, Debug, Clone)]
pub struct SynthesisConfigHandle(pub Arc<SynthesisConfig>);

impl SynthesisConfigHandle {
    pub fn new(config: Arc<SynthesisConfig>) -> Self {
        Self(config)
    }

    pub fn get(&self) -> Arc<SynthesisConfig> {
        Arc::clone(&self.0)
    }

    pub fn replace(&mut self, config: Arc<SynthesisConfig>) {
        self.0 = config;
    }
}

/// Load the synthesis config from the override path or the crate's data
/// file, falling back to the builtin copy. Returns the path actually used.
pub fn load_synthesis_config_from_env() -> (Arc<SynthesisConfig>, Option<PathBuf>) {
    let path = env::var(CONFIG_PATH_ENV)
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("src/data/synthesis_config.json")
        });

    match SynthesisConfig::from_file(&path) {
        Ok(config) => {
            tracing::info!(
                target: "terrain_synth::config",
                path = %path.display(),
                "synthesis_config.loaded=file"
            );
            return (Arc::new(config), Some(path));
        }
        Err(err) => {
            tracing::warn!(
                target: "terrain_synth::config",
                path = %path.display(),
                error = %err,
                "synthesis_config.load_failed"
            );
        }
    }

    tracing::info!(
        target: "terrain_synth::config",
        "synthesis_config.loaded=builtin"
    );
    (SynthesisConfig::builtin(), None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_matches_defaults() {
        let builtin = SynthesisConfig::builtin();
        let defaults = GaConfig::default();
        assert_eq!(builtin.ga.population_size, defaults.population_size);
        assert_eq!(builtin.ga.elite_ratio, defaults.elite_ratio);
        assert_eq!(builtin.ga.max_offset, defaults.max_offset);
        assert_eq!(builtin.analysis.frequency_bands, 10);
        assert_eq!(builtin.blend.mask, MaskKind::Gaussian);
        assert!(builtin.analysis_cache().is_none());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = SynthesisConfig::from_json_str(
            r#"{ "ga": { "population_size": 9 }, "cache": { "enabled": true, "directory": "/tmp/x" } }"#,
        )
        .unwrap();
        assert_eq!(config.ga.population_size, 9);
        assert_eq!(config.ga.evolution_cycles, 5);
        assert!(config.analysis.features.edges);
        assert_eq!(
            config.analysis_cache().unwrap().dir(),
            Path::new("/tmp/x")
        );
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = SynthesisConfig::from_file(Path::new("/definitely/not/here.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
