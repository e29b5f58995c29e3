//! Terrain synthesis core.
//!
//! Turns a library of real terrain samples and a rasterized region map into
//! a synthetic heightfield. Samples are analyzed lazily per LOD (see
//! [`TerrainSample`]); a genetic algorithm ([`HeightfieldGa`]) composes
//! transformed sample patches into a heightfield resembling a pattern, and
//! [`generate_terrain`] drives it coarse to fine. A headless Bevy [`App`]
//! wraps the orchestrator for hosts that queue requests between updates.

pub mod analysis;
pub mod cache;
pub mod chromosome;
pub mod config;
pub mod distribution;
mod error;
pub mod features;
pub mod fitness;
pub mod generate;
pub mod library;
pub mod lod;
pub mod masks;
pub mod operators;
pub mod population;
pub mod procedural;
pub mod raster;
pub mod region;
pub mod render;
pub mod sample;
pub mod spectrum;
pub mod stats;

use std::{collections::VecDeque, sync::Arc};

use bevy::prelude::*;

pub use analysis::{AnalysisConfig, GlobalStats, LocalAggregates, SampleAnalysis, StatCategory};
pub use cache::{AnalysisCache, CacheError};
pub use chromosome::{Gene, GeneCompatibility, Pattern, TerrainChromosome};
pub use config::{
    load_synthesis_config_from_env, ConfigError, GaConfig, SynthesisConfig, SynthesisConfigHandle,
};
pub use distribution::{DistributionMatcher, LibraryVariances, TypeSignature};
pub use error::SynthesisError;
pub use fitness::{fitness_from_rms, FitnessMeasures, RegionFitness};
pub use generate::{generate_terrain, naive_blend, GeneratedLevel, GeneratedTerrain, LodTiming};
pub use library::{LibraryError, TerrainLibrary, TerrainLibraryHandle, TerrainSeam, TerrainType};
pub use lod::{scale_factor, LodStatus, TerrainLod};
pub use masks::{BlendMasks, BlendMasksHandle, MaskKind};
pub use population::{
    CancelToken, GenerationReport, HeightfieldGa, Population, PopulationStats, Refinement,
};
pub use raster::{Heightfield, Raster};
pub use region::{MapRasterization, RegionError, RegionId, RegionMap, TerrainTypeId};
pub use sample::{ElevationSource, InMemorySource, LoadOutcome, SampleError, TerrainSample};

const _: fn() = || {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<TerrainLibrary>();
    assert_send_sync::<TerrainSample>();
    assert_send_sync::<MapRasterization>();
    assert_send_sync::<Pattern>();
    assert_send_sync::<TerrainChromosome>();
};

/// One queued coarse-to-fine generation.
#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    pub id: u64,
    pub map: Arc<MapRasterization>,
    pub start: TerrainLod,
    pub target: TerrainLod,
}

#[derive(Resource, Debug, Default)]
pub struct SynthesisQueue {
    next_id: u64,
    pending: VecDeque<SynthesisRequest>,
}

impl SynthesisQueue {
    pub fn submit(&mut self, map: Arc<MapRasterization>, start: TerrainLod, target: TerrainLod) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.pending.push_back(SynthesisRequest {
            id,
            map,
            start,
            target,
        });
        id
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[derive(Debug)]
pub struct SynthesisOutcome {
    pub id: u64,
    pub result: Result<GeneratedTerrain, SynthesisError>,
}

#[derive(Resource, Debug, Default)]
pub struct SynthesisResults {
    completed: Vec<SynthesisOutcome>,
}

impl SynthesisResults {
    pub fn drain(&mut self) -> Vec<SynthesisOutcome> {
        std::mem::take(&mut self.completed)
    }

    pub fn len(&self) -> usize {
        self.completed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }
}

/// Run every queued request against the current library and configuration.
pub fn process_synthesis_requests(
    config: Res<SynthesisConfigHandle>,
    masks: Res<BlendMasksHandle>,
    library: Res<TerrainLibraryHandle>,
    mut queue: ResMut<SynthesisQueue>,
    mut results: ResMut<SynthesisResults>,
) {
    let config = config.get();
    while let Some(request) = queue.pending.pop_front() {
        let result = generate_terrain(
            &request.map,
            library.get(),
            masks.get(),
            &config,
            request.start,
            request.target,
        );
        if let Err(err) = &result {
            tracing::error!(
                target: "terrain_synth::generate",
                request = request.id,
                fatal = err.is_fatal_configuration(),
                error = %err,
                "generate.request.failed"
            );
        }
        results.completed.push(SynthesisOutcome {
            id: request.id,
            result,
        });
    }
}

/// Construct a Bevy [`App`] holding the configuration, blend masks and an
/// empty terrain library as resources. Populate the library through
/// [`TerrainLibraryHandle::replace`] before submitting requests.
pub fn build_headless_app() -> App {
    let (config, _) = load_synthesis_config_from_env();
    let mut library = TerrainLibrary::new(Arc::new(config.analysis.clone()));
    if let Some(cache) = config.analysis_cache() {
        library = library.with_cache(cache);
    }
    build_headless_app_with(config, Arc::new(library))
}

pub fn build_headless_app_with(config: Arc<SynthesisConfig>, library: Arc<TerrainLibrary>) -> App {
    let masks = Arc::new(BlendMasks::build(config.blend.mask));
    let mut app = App::new();
    app.insert_resource(SynthesisConfigHandle::new(config))
        .insert_resource(BlendMasksHandle::new(masks))
        .insert_resource(TerrainLibraryHandle::new(library))
        .insert_resource(SynthesisQueue::default())
        .insert_resource(SynthesisResults::default())
        .add_plugins(MinimalPlugins)
        .add_systems(Update, process_synthesis_requests);
    app
}

/// Service all queued requests once.
pub fn run_synthesis(app: &mut App) {
    app.update();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_assigns_sequential_ids() {
        let map = Arc::new(
            MapRasterization::new(Raster::filled(4, 4, 0), TerrainLod::L810m, 1).unwrap(),
        );
        let mut queue = SynthesisQueue::default();
        assert_eq!(queue.submit(Arc::clone(&map), TerrainLod::L810m, TerrainLod::L270m), 0);
        assert_eq!(queue.submit(map, TerrainLod::L810m, TerrainLod::L270m), 1);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn app_reports_failed_requests() {
        let mut app = build_headless_app_with(
            SynthesisConfig::builtin(),
            Arc::new(TerrainLibrary::default()),
        );
        let map = Arc::new(
            MapRasterization::new(Raster::filled(4, 4, 0), TerrainLod::L90m, 1).unwrap(),
        );
        app.world
            .resource_mut::<SynthesisQueue>()
            .submit(map, TerrainLod::L30m, TerrainLod::L90m);
        run_synthesis(&mut app);
        assert!(app.world.resource::<SynthesisQueue>().is_empty());
        let outcomes = app.world.resource_mut::<SynthesisResults>().drain();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(
            outcomes[0].result,
            Err(SynthesisError::InvertedLodRange { .. })
        ));
    }
}
