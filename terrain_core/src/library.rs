//! Terrain types, their samples and the pairwise seam parameters.

use std::{
    collections::HashMap,
    sync::{Arc, OnceLock},
    time::Instant,
};

use bevy::prelude::Resource;
use rand::Rng;
use rayon::prelude::*;
use serde::Deserialize;
use thiserror::Error;

use crate::{
    analysis::{AnalysisConfig, GlobalStats},
    cache::AnalysisCache,
    config::GaConfig,
    distribution::{LibraryVariances, TypeSignature},
    lod::{LodTable, TerrainLod},
    region::{TerrainTypeId, VOID_TERRAIN_TYPE},
    sample::{TerrainSample, TypeLink},
};

#[derive(Debug, Error, PartialEq)]
pub enum LibraryError {
    #[error("terrain type {id} is not in the library (size {size})")]
    UnknownTerrainType { id: TerrainTypeId, size: usize },
    #[error("the void terrain type cannot hold samples")]
    VoidType,
}

/// GA tuning for the boundary between two terrain types. `aspect_ratio` is
/// kept for library files and not read by the GA.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TerrainSeam {
    pub cycles: u32,
    pub population_size: usize,
    pub smoothness: f32,
    pub mutation_ratio: f32,
    pub crossover_ratio: f32,
    pub selection_ratio: f32,
    pub aspect_ratio: f32,
}

impl Default for TerrainSeam {
    fn default() -> Self {
        Self {
            cycles: 20,
            population_size: 5,
            smoothness: 0.2,
            mutation_ratio: 0.05,
            crossover_ratio: 0.05,
            selection_ratio: 1.0,
            aspect_ratio: 1.0,
        }
    }
}

impl TerrainSeam {
    /// Blend border width in pixels at `lod`; the default smoothness spans 1 km.
    pub fn border_width(&self, lod: TerrainLod) -> u32 {
        (self.smoothness * 5000.0 * lod.samples_per_meter()).round().max(1.0) as u32
    }

    /// Overwrite the run length, population size and operator ratios of
    /// `config` with this seam's. The elite share never exceeds the new
    /// selection share.
    pub fn apply_to(&self, config: &mut GaConfig) {
        config.evolution_cycles = self.cycles;
        config.population_size = self.population_size.max(1);
        config.mutation_ratio = self.mutation_ratio;
        config.crossover_ratio = self.crossover_ratio;
        config.selection_ratio = self.selection_ratio;
        config.elite_ratio = config.elite_ratio.min(self.selection_ratio);
    }
}

#[derive(Debug)]
pub struct TerrainType {
    id: TerrainTypeId,
    name: Arc<str>,
    samples: Vec<Arc<TerrainSample>>,
    signatures: LodTable<OnceLock<TypeSignature>>,
}

impl TerrainType {
    fn new(id: TerrainTypeId, name: &str) -> Self {
        Self {
            id,
            name: Arc::from(name),
            samples: Vec::new(),
            signatures: LodTable::default(),
        }
    }

    pub fn id(&self) -> TerrainTypeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn samples(&self) -> &[Arc<TerrainSample>] {
        &self.samples
    }

    pub fn sample(&self, index: usize) -> Option<&Arc<TerrainSample>> {
        self.samples.get(index)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn random_sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&Arc<TerrainSample>> {
        if self.samples.is_empty() {
            return None;
        }
        self.samples.get(rng.gen_range(0..self.samples.len()))
    }

    /// The type's signature at `lod`, if [`TerrainLibrary::ensure_analyzed`]
    /// has computed it.
    pub fn signature(&self, lod: TerrainLod) -> Option<&TypeSignature> {
        self.signatures[lod].get()
    }

    fn ensure_signature(&self, lod: TerrainLod, variances: &LibraryVariances) -> &TypeSignature {
        self.signatures[lod].get_or_init(|| {
            let stats = self.sample_statistics(lod);
            let (defaults, library) = variances.tables(lod);
            let signature = TypeSignature::analyze(&stats, &defaults, &library);
            tracing::debug!(
                target: "terrain_synth::library",
                terrain_type = %self.name,
                lod = %lod,
                samples = stats.len(),
                agreement = signature.agreement,
                "terrain_type.analyzed"
            );
            signature
        })
    }

    fn sample_statistics(&self, lod: TerrainLod) -> Vec<GlobalStats> {
        self.samples
            .par_iter()
            .filter(|sample| sample.ensure_analyzed(lod))
            .map(|sample| sample.global_stats(lod))
            .collect()
    }
}

/// Registry of terrain types; index 0 is the void type.
#[derive(Debug)]
pub struct TerrainLibrary {
    types: Vec<TerrainType>,
    seams: HashMap<(TerrainTypeId, TerrainTypeId), TerrainSeam>,
    default_seam: TerrainSeam,
    variances: Arc<LibraryVariances>,
    cache: Option<AnalysisCache>,
    analysis_config: Arc<AnalysisConfig>,
}

impl Default for TerrainLibrary {
    fn default() -> Self {
        Self::new(Arc::new(AnalysisConfig::default()))
    }
}

impl TerrainLibrary {
    pub fn new(analysis_config: Arc<AnalysisConfig>) -> Self {
        Self {
            types: vec![TerrainType::new(VOID_TERRAIN_TYPE, "void")],
            seams: HashMap::new(),
            default_seam: TerrainSeam::default(),
            variances: LibraryVariances::builtin(),
            cache: None,
            analysis_config,
        }
    }

    pub fn with_cache(mut self, cache: AnalysisCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_variances(mut self, variances: Arc<LibraryVariances>) -> Self {
        self.variances = variances;
        self
    }

    pub fn with_default_seam(mut self, seam: TerrainSeam) -> Self {
        self.default_seam = seam;
        self
    }

    /// Number of type slots including void; valid IDs are `0..size()`.
    pub fn size(&self) -> usize {
        self.types.len()
    }

    pub fn terrain_types(&self) -> impl Iterator<Item = &TerrainType> {
        self.types.iter().skip(1)
    }

    pub fn terrain_type(&self, id: TerrainTypeId) -> Result<&TerrainType, LibraryError> {
        self.types
            .get(id as usize)
            .ok_or(LibraryError::UnknownTerrainType {
                id,
                size: self.types.len(),
            })
    }

    pub fn terrain_type_by_name(&self, name: &str) -> Option<&TerrainType> {
        self.types.iter().find(|t| &*t.name == name)
    }

    pub fn add_terrain_type(&mut self, name: &str) -> TerrainTypeId {
        let id = self.types.len() as TerrainTypeId;
        self.types.push(TerrainType::new(id, name));
        tracing::debug!(
            target: "terrain_synth::library",
            id,
            name,
            "terrain_type.added"
        );
        id
    }

    /// Append `sample` to a type; it takes the next index and inherits the
    /// library's cache and analysis settings.
    pub fn add_sample(
        &mut self,
        id: TerrainTypeId,
        mut sample: TerrainSample,
    ) -> Result<Arc<TerrainSample>, LibraryError> {
        if id == VOID_TERRAIN_TYPE {
            return Err(LibraryError::VoidType);
        }
        let size = self.types.len();
        let terrain_type = self
            .types
            .get_mut(id as usize)
            .ok_or(LibraryError::UnknownTerrainType { id, size })?;
        let link = TypeLink {
            id,
            name: Arc::clone(&terrain_type.name),
        };
        sample.attach(
            terrain_type.samples.len(),
            link,
            self.cache.as_ref(),
            Arc::clone(&self.analysis_config),
        );
        let sample = Arc::new(sample);
        terrain_type.samples.push(Arc::clone(&sample));
        Ok(sample)
    }

    pub fn seam(&self, a: TerrainTypeId, b: TerrainTypeId) -> &TerrainSeam {
        self.seams.get(&seam_key(a, b)).unwrap_or(&self.default_seam)
    }

    pub fn set_seam(&mut self, a: TerrainTypeId, b: TerrainTypeId, seam: TerrainSeam) {
        self.seams.insert(seam_key(a, b), seam);
    }

    pub fn variances(&self) -> &Arc<LibraryVariances> {
        &self.variances
    }

    /// Load every sample of every type across the LOD range.
    pub fn ensure_loaded(&self, a: TerrainLod, b: TerrainLod) {
        self.all_samples()
            .par_iter()
            .for_each(|sample| sample.ensure_range_loaded(a, b));
    }

    pub fn ensure_studied(&self, lod: TerrainLod) {
        self.all_samples().par_iter().for_each(|sample| {
            sample.ensure_studied(lod);
        });
    }

    /// Analyze all samples at `lod` and compute each type's signature.
    pub fn ensure_analyzed(&self, lod: TerrainLod) {
        let started = Instant::now();
        let variances = Arc::clone(&self.variances);
        self.types.par_iter().skip(1).for_each(|terrain_type| {
            terrain_type.ensure_signature(lod, &variances);
        });
        tracing::info!(
            target: "terrain_synth::library",
            lod = %lod,
            types = self.types.len() - 1,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "library.analyzed"
        );
    }

    /// Replace the variance tables at `lod` with ones derived from the
    /// library's own samples. Signatures computed afterwards use them.
    pub fn derive_variances(&mut self, lod: TerrainLod) {
        let per_type: Vec<Vec<GlobalStats>> = self
            .types
            .iter()
            .skip(1)
            .map(|t| t.sample_statistics(lod))
            .collect();
        let derived = LibraryVariances::derive(lod, &per_type);
        let mut variances = (*self.variances).clone();
        variances.merge(derived);
        self.variances = Arc::new(variances);
        for terrain_type in self.types.iter_mut() {
            terrain_type.signatures[lod] = OnceLock::new();
        }
    }

    fn all_samples(&self) -> Vec<Arc<TerrainSample>> {
        self.types
            .iter()
            .flat_map(|t| t.samples.iter().cloned())
            .collect()
    }
}

fn seam_key(a: TerrainTypeId, b: TerrainTypeId) -> (TerrainTypeId, TerrainTypeId) {
    (a.min(b), a.max(b))
}

/// Shared handle to the terrain library.
#[derive(Resource, Debug, Clone)]
pub struct TerrainLibraryHandle(pub Arc<TerrainLibrary>);

impl TerrainLibraryHandle {
    pub fn new(library: Arc<TerrainLibrary>) -> Self {
        Self(library)
    }

    pub fn get(&self) -> Arc<TerrainLibrary> {
        Arc::clone(&self.0)
    }

    pub fn replace(&mut self, library: Arc<TerrainLibrary>) {
        self.0 = library;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::Raster;
    use rand::{rngs::SmallRng, SeedableRng};

    fn hill(offset: f32) -> TerrainSample {
        TerrainSample::from_heightfield(
            Raster::from_fn(24, 24, |x, y| {
                let dx = x as f32 - 12.0;
                let dy = y as f32 - 12.0;
                offset + 200.0 - (dx * dx + dy * dy)
            }),
            TerrainLod::L90m,
        )
    }

    fn library() -> TerrainLibrary {
        let mut library = TerrainLibrary::default();
        let hills = library.add_terrain_type("hills");
        library.add_sample(hills, hill(0.0)).unwrap();
        library.add_sample(hills, hill(50.0)).unwrap();
        let flats = library.add_terrain_type("flats");
        library
            .add_sample(flats, TerrainSample::from_heightfield(Raster::filled(24, 24, 5.0), TerrainLod::L90m))
            .unwrap();
        library
    }

    #[test]
    fn samples_are_indexed_and_linked() {
        let library = library();
        assert_eq!(library.size(), 3);
        let hills = library.terrain_type(1).unwrap();
        assert_eq!(hills.sample(1).unwrap().name(), "hills:1");
        assert_eq!(hills.sample(1).unwrap().index(), 1);
        assert_eq!(
            library.terrain_type(7).unwrap_err(),
            LibraryError::UnknownTerrainType { id: 7, size: 3 }
        );
    }

    #[test]
    fn void_type_rejects_samples() {
        let mut library = library();
        assert_eq!(
            library.add_sample(0, hill(0.0)).unwrap_err(),
            LibraryError::VoidType
        );
    }

    #[test]
    fn seams_are_symmetric() {
        let mut library = library();
        let seam = TerrainSeam {
            smoothness: 0.5,
            ..TerrainSeam::default()
        };
        library.set_seam(2, 1, seam.clone());
        assert_eq!(library.seam(1, 2), &seam);
        assert_eq!(library.seam(2, 1), &seam);
        assert_eq!(library.seam(1, 1), &TerrainSeam::default());
        assert_eq!(TerrainSeam::default().border_width(TerrainLod::L90m), 11);
    }

    #[test]
    fn analysis_produces_normalized_weights() {
        let library = library();
        library.ensure_analyzed(TerrainLod::L90m);
        for terrain_type in library.terrain_types() {
            let signature = terrain_type.signature(TerrainLod::L90m).unwrap();
            let total: f64 = signature.weights.iter().sum();
            assert!((total - 1.0).abs() < 1e-9);
        }
        assert!(library.terrain_type(1).unwrap().signature(TerrainLod::L30m).is_none());
    }

    #[test]
    fn random_sample_stays_within_type() {
        let library = library();
        let mut rng = SmallRng::seed_from_u64(7);
        let hills = library.terrain_type(1).unwrap();
        for _ in 0..16 {
            let sample = hills.random_sample(&mut rng).unwrap();
            assert_eq!(sample.terrain_type().unwrap().id, 1);
        }
        assert!(library.terrain_type(0).unwrap().random_sample(&mut rng).is_none());
    }

    #[test]
    fn derived_variances_replace_signatures() {
        let mut library = library();
        library.ensure_analyzed(TerrainLod::L90m);
        library.derive_variances(TerrainLod::L90m);
        assert!(library.terrain_type(1).unwrap().signature(TerrainLod::L90m).is_none());
        let (defaults, _) = library.variances().tables(TerrainLod::L90m);
        assert!(defaults.elevation[0] > 0.0);
    }
}
