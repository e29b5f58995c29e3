//! Terrain samples and their lazily computed per-LOD views.
//!
//! Every view walks `unloaded → loaded → analyzed → studied`. The status
//! word is an atomic so readers can skip the lock once a stage is reached;
//! the data behind it sits in a per-view mutex, which makes each stage
//! single-flight when several evaluators race on the same (sample, LOD).
//! `ensure_loaded` is the only stage that ever touches a neighbouring view,
//! and only one that is already loaded.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use thiserror::Error;

use crate::{
    analysis::{
        analyze_heightfield, region_statistics, study_heightfield, AnalysisConfig, GlobalStats,
        LocalAggregates, SampleAnalysis,
    },
    cache::{AnalysisCache, CachedAnalysis},
    lod::{nearest_coarser, nearest_finer, scale_factor, LodError, LodStatus, LodTable, TerrainLod},
    raster::{resample_bilinear, Heightfield},
    region::{MapRasterization, RegionId, RegionMap, TerrainTypeId},
};

/// A DEM collaborator handing over one immutable elevation grid.
pub trait ElevationSource: Send + Sync + fmt::Debug {
    /// Stable identity for the analysis cache; `None` disables caching.
    fn cache_key(&self) -> Option<String>;

    fn load(&self) -> Result<ElevationGrid, SourceError>;
}

#[derive(Debug, Clone)]
pub struct ElevationGrid {
    pub elevation: Heightfield,
    pub meters_per_sample: f32,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("elevation source {name} is unavailable: {reason}")]
    Unavailable { name: String, reason: String },
    #[error(transparent)]
    Lod(#[from] LodError),
}

#[derive(Debug, Error)]
pub enum SampleError {
    #[error("region {region} is out of range for sample {sample} ({count} region statistics)")]
    RegionOutOfRange {
        sample: String,
        region: RegionId,
        count: usize,
    },
    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Grid already held in memory, optionally with a cache identity.
#[derive(Debug, Clone)]
pub struct InMemorySource {
    key: Option<String>,
    grid: ElevationGrid,
}

impl InMemorySource {
    pub fn new(elevation: Heightfield, lod: TerrainLod) -> Self {
        Self {
            key: None,
            grid: ElevationGrid {
                elevation,
                meters_per_sample: lod.meters_per_sample(),
            },
        }
    }

    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

impl ElevationSource for InMemorySource {
    fn cache_key(&self) -> Option<String> {
        self.key.clone()
    }

    fn load(&self) -> Result<ElevationGrid, SourceError> {
        Ok(self.grid.clone())
    }
}

/// How `ensure_loaded` obtained (or failed to obtain) a view's elevation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    AlreadyLoaded,
    FromCache,
    Resampled { from: TerrainLod },
    FromSource,
    /// No cache, no loaded neighbour and no usable source. The view stays
    /// unloaded and every accessor yields empty data for it.
    Unavailable,
}

impl LoadOutcome {
    pub fn is_loaded(self) -> bool {
        !matches!(self, LoadOutcome::Unavailable)
    }
}

/// Back-link from a sample to the terrain type that owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeLink {
    pub id: TerrainTypeId,
    pub name: Arc<str>,
}

#[derive(Debug, Default)]
struct ViewData {
    elevation: Option<Arc<Heightfield>>,
    analysis: Option<Arc<SampleAnalysis>>,
    local: Option<Arc<LocalAggregates>>,
}

#[derive(Debug, Default)]
struct SampleView {
    status: AtomicU8,
    data: Mutex<ViewData>,
}

impl SampleView {
    fn status(&self) -> LodStatus {
        LodStatus::from_bits_truncate(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: LodStatus) {
        debug_assert!(status.is_consistent());
        self.status.store(status.bits(), Ordering::Release);
    }

    fn lock(&self) -> MutexGuard<'_, ViewData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn loaded_elevation(&self) -> Option<Arc<Heightfield>> {
        if !self.status().is_loaded() {
            return None;
        }
        self.lock().elevation.clone()
    }
}

#[derive(Debug)]
pub struct TerrainSample {
    index: usize,
    terrain_type: Option<TypeLink>,
    source: Option<Arc<dyn ElevationSource>>,
    regions: Option<Arc<MapRasterization>>,
    cache: Option<AnalysisCache>,
    analysis_config: Arc<AnalysisConfig>,
    views: LodTable<SampleView>,
}

impl TerrainSample {
    /// Sample whose elevation is pulled from `source` on first access.
    pub fn new(source: Arc<dyn ElevationSource>) -> Self {
        Self {
            source: Some(source),
            ..Self::detached()
        }
    }

    /// Sample with `elevation` installed at `lod` and no backing source.
    pub fn from_heightfield(elevation: Heightfield, lod: TerrainLod) -> Self {
        let sample = Self::detached();
        sample.install(lod, Arc::new(elevation));
        sample
    }

    fn detached() -> Self {
        Self {
            index: 0,
            terrain_type: None,
            source: None,
            regions: None,
            cache: None,
            analysis_config: Arc::new(AnalysisConfig::default()),
            views: LodTable::default(),
        }
    }

    pub fn with_regions(mut self, regions: Arc<MapRasterization>) -> Self {
        self.regions = Some(regions);
        self
    }

    pub fn with_cache(mut self, cache: AnalysisCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_analysis_config(mut self, config: Arc<AnalysisConfig>) -> Self {
        self.analysis_config = config;
        self
    }

    pub(crate) fn attach(
        &mut self,
        index: usize,
        link: TypeLink,
        cache: Option<&AnalysisCache>,
        analysis_config: Arc<AnalysisConfig>,
    ) {
        self.index = index;
        self.terrain_type = Some(link);
        if self.cache.is_none() {
            self.cache = cache.cloned();
        }
        self.analysis_config = analysis_config;
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn terrain_type(&self) -> Option<&TypeLink> {
        self.terrain_type.as_ref()
    }

    pub fn name(&self) -> String {
        match &self.terrain_type {
            Some(link) => format!("{}:{}", link.name, self.index),
            None => format!("unattached:{}", self.index),
        }
    }

    pub fn view_name(&self, lod: TerrainLod) -> String {
        format!("{}[{}]", self.name(), lod)
    }

    pub fn status(&self, lod: TerrainLod) -> LodStatus {
        self.views[lod].status()
    }

    pub fn is_loaded(&self, lod: TerrainLod) -> bool {
        self.status(lod).is_loaded()
    }

    pub fn nearest_loaded_finer(&self, lod: TerrainLod) -> Option<TerrainLod> {
        nearest_finer(lod, |l| self.is_loaded(l))
    }

    pub fn nearest_loaded_coarser(&self, lod: TerrainLod) -> Option<TerrainLod> {
        nearest_coarser(lod, |l| self.is_loaded(l))
    }

    pub fn ensure_loaded(&self, lod: TerrainLod) -> LoadOutcome {
        let view = &self.views[lod];
        if view.status().is_loaded() {
            return LoadOutcome::AlreadyLoaded;
        }
        let mut data = view.lock();
        if view.status().is_loaded() {
            return LoadOutcome::AlreadyLoaded;
        }

        if let Some(entry) = self.load_cached(lod) {
            self.install_cached(lod, &mut data, entry);
            return LoadOutcome::FromCache;
        }

        let neighbour = self
            .nearest_loaded_finer(lod)
            .or_else(|| self.nearest_loaded_coarser(lod));
        if let Some(from) = neighbour {
            if let Some(elevation) = self.views[from].loaded_elevation() {
                let resampled = resample_bilinear(&elevation, scale_factor(from, lod));
                tracing::debug!(
                    target: "terrain_synth::lod",
                    view = %self.view_name(lod),
                    from = %from,
                    width = resampled.width(),
                    height = resampled.height(),
                    "sample.load.resampled"
                );
                data.elevation = Some(Arc::new(resampled));
                view.set_status(LodStatus::reloaded());
                return LoadOutcome::Resampled { from };
            }
        }

        match self.load_source(lod) {
            Ok(Some(elevation)) => {
                data.elevation = Some(Arc::new(elevation));
                view.set_status(LodStatus::reloaded());
                LoadOutcome::FromSource
            }
            Ok(None) => {
                tracing::warn!(
                    target: "terrain_synth::lod",
                    view = %self.view_name(lod),
                    "sample.load.unavailable"
                );
                LoadOutcome::Unavailable
            }
            Err(err) => {
                tracing::warn!(
                    target: "terrain_synth::lod",
                    view = %self.view_name(lod),
                    error = %err,
                    "sample.load.unavailable"
                );
                LoadOutcome::Unavailable
            }
        }
    }

    /// Returns whether the view ended up analyzed.
    pub fn ensure_analyzed(&self, lod: TerrainLod) -> bool {
        let view = &self.views[lod];
        if view.status().is_analyzed() {
            return true;
        }
        if !self.ensure_loaded(lod).is_loaded() {
            return false;
        }
        let mut data = view.lock();
        let status = view.status();
        if status.is_analyzed() {
            return true;
        }
        let Some(elevation) = data.elevation.clone() else {
            return false;
        };
        let map = self.region_map(lod);
        let analysis = analyze_heightfield(&elevation, lod, map.as_deref(), &self.analysis_config);
        tracing::debug!(
            target: "terrain_synth::analysis",
            view = %self.view_name(lod),
            edges = analysis.features.edges.len(),
            regions = analysis.regions.len(),
            "sample.analyzed"
        );
        data.analysis = Some(Arc::new(analysis));
        view.set_status(status.with_analyzed());
        true
    }

    /// Returns whether the view ended up studied. A configured cache is
    /// written afterwards; a failed write is logged and otherwise ignored.
    pub fn ensure_studied(&self, lod: TerrainLod) -> bool {
        let view = &self.views[lod];
        if view.status().is_studied() {
            return true;
        }
        if !self.ensure_analyzed(lod) {
            return false;
        }
        let entry = {
            let mut data = view.lock();
            let status = view.status();
            if status.is_studied() {
                return true;
            }
            let (Some(elevation), Some(analysis)) = (data.elevation.clone(), data.analysis.clone())
            else {
                return false;
            };
            let local = Arc::new(study_heightfield(
                &elevation,
                &analysis.gradient,
                lod.window_size(),
            ));
            data.local = Some(Arc::clone(&local));
            view.set_status(status.with_studied());
            tracing::debug!(
                target: "terrain_synth::analysis",
                view = %self.view_name(lod),
                window = lod.window_size(),
                "sample.studied"
            );
            self.cache_target()
                .map(|_| cache_entry(&elevation, &analysis, &local))
        };
        if let Some(entry) = entry {
            self.store_cached(lod, &entry);
        }
        true
    }

    pub fn ensure_range_loaded(&self, a: TerrainLod, b: TerrainLod) {
        for lod in TerrainLod::range(a, b) {
            self.ensure_loaded(lod);
        }
    }

    pub fn ensure_range_analyzed(&self, a: TerrainLod, b: TerrainLod) {
        for lod in TerrainLod::range(a, b) {
            self.ensure_analyzed(lod);
        }
    }

    pub fn ensure_range_studied(&self, a: TerrainLod, b: TerrainLod) {
        for lod in TerrainLod::range(a, b) {
            self.ensure_studied(lod);
        }
    }

    /// Elevation at `lod`; empty when the view could not be loaded.
    pub fn elevation(&self, lod: TerrainLod) -> Arc<Heightfield> {
        self.ensure_loaded(lod);
        self.views[lod].lock().elevation.clone().unwrap_or_default()
    }

    pub fn analysis(&self, lod: TerrainLod) -> Arc<SampleAnalysis> {
        self.ensure_analyzed(lod);
        self.views[lod].lock().analysis.clone().unwrap_or_default()
    }

    pub fn local(&self, lod: TerrainLod) -> Arc<LocalAggregates> {
        self.ensure_studied(lod);
        self.views[lod].lock().local.clone().unwrap_or_default()
    }

    pub fn global_stats(&self, lod: TerrainLod) -> GlobalStats {
        self.analysis(lod).global
    }

    /// Statistics of one region; a sample with at most one region answers
    /// with its global statistics.
    pub fn region_stats(&self, lod: TerrainLod, region: RegionId) -> Result<GlobalStats, SampleError> {
        let analysis = self.analysis(lod);
        if analysis.regions.len() <= 1 {
            return Ok(analysis.global);
        }
        (region as usize)
            .checked_sub(1)
            .and_then(|i| analysis.regions.get(i))
            .copied()
            .ok_or_else(|| SampleError::RegionOutOfRange {
                sample: self.view_name(lod),
                region,
                count: analysis.regions.len(),
            })
    }

    pub fn region_count(&self, lod: TerrainLod) -> usize {
        self.region_map(lod)
            .map(|map| map.region_count().max(1))
            .unwrap_or(1)
    }

    pub fn region_map(&self, lod: TerrainLod) -> Option<Arc<RegionMap>> {
        let regions = self.regions.as_ref()?;
        match regions.at(lod) {
            Ok(map) => Some(map),
            Err(err) => {
                tracing::warn!(
                    target: "terrain_synth::region",
                    view = %self.view_name(lod),
                    error = %err,
                    "sample.region_map.unavailable"
                );
                None
            }
        }
    }

    fn install(&self, lod: TerrainLod, elevation: Arc<Heightfield>) {
        let view = &self.views[lod];
        let mut data = view.lock();
        *data = ViewData {
            elevation: Some(elevation),
            ..ViewData::default()
        };
        view.set_status(LodStatus::reloaded());
    }

    fn load_source(&self, lod: TerrainLod) -> Result<Option<Heightfield>, SourceError> {
        let Some(source) = &self.source else {
            return Ok(None);
        };
        let grid = source.load()?;
        let native = TerrainLod::for_meters_per_sample(grid.meters_per_sample)?;
        tracing::debug!(
            target: "terrain_synth::lod",
            view = %self.view_name(lod),
            native = %native,
            "sample.load.source"
        );
        if native == lod {
            return Ok(Some(grid.elevation));
        }
        let resampled = resample_bilinear(&grid.elevation, scale_factor(native, lod));
        // Keep the native level too, unless someone else is busy with it.
        if let Ok(mut other) = self.views[native].data.try_lock() {
            if !self.views[native].status().is_loaded() {
                other.elevation = Some(Arc::new(grid.elevation));
                self.views[native].set_status(LodStatus::reloaded());
            }
        }
        Ok(Some(resampled))
    }

    fn cache_target(&self) -> Option<(&AnalysisCache, String)> {
        let cache = self.cache.as_ref()?;
        let key = self.source.as_ref()?.cache_key()?;
        Some((cache, key))
    }

    fn load_cached(&self, lod: TerrainLod) -> Option<CachedAnalysis> {
        let (cache, key) = self.cache_target()?;
        match cache.load(&key, lod) {
            Ok(entry) => {
                tracing::debug!(
                    target: "terrain_synth::cache",
                    view = %self.view_name(lod),
                    "cache.hit"
                );
                Some(entry)
            }
            Err(err) => {
                tracing::debug!(
                    target: "terrain_synth::cache",
                    view = %self.view_name(lod),
                    error = %err,
                    "cache.miss"
                );
                None
            }
        }
    }

    fn install_cached(&self, lod: TerrainLod, data: &mut ViewData, entry: CachedAnalysis) {
        let global = entry.global();
        let local = entry.local();
        let features = entry.features();
        let regions = self
            .region_map(lod)
            .map(|map| region_statistics(&entry.elevation, &entry.gradient, &features, &map))
            .unwrap_or_default();
        let analysis = SampleAnalysis {
            gradient: entry.gradient,
            spectrum: entry.spectrum,
            features,
            global,
            regions,
        };
        data.elevation = Some(Arc::new(entry.elevation));
        data.analysis = Some(Arc::new(analysis));
        data.local = Some(Arc::new(local));
        self.views[lod].set_status(LodStatus::all());
    }

    fn store_cached(&self, lod: TerrainLod, entry: &CachedAnalysis) {
        let Some((cache, key)) = self.cache_target() else {
            return;
        };
        match cache.store(&key, lod, entry) {
            Ok(path) => tracing::debug!(
                target: "terrain_synth::cache",
                view = %self.view_name(lod),
                path = %path.display(),
                "cache.written"
            ),
            Err(err) => tracing::warn!(
                target: "terrain_synth::cache",
                view = %self.view_name(lod),
                error = %err,
                "cache.write_failed"
            ),
        }
    }
}

fn cache_entry(
    elevation: &Heightfield,
    analysis: &SampleAnalysis,
    local: &LocalAggregates,
) -> CachedAnalysis {
    CachedAnalysis {
        elevation: elevation.clone(),
        gradient: analysis.gradient.clone(),
        local_elevation_mean: local.elevation_mean.clone(),
        local_gradient_mean: local.gradient_mean.clone(),
        local_elevation_limits: local.elevation_range.clone(),
        local_slope_limits: local.slope_range.clone(),
        spectrum: analysis.spectrum.clone(),
        elevation_stats: analysis.global.elevation,
        slope_stats: analysis.global.slope,
        edge_length_stats: analysis.global.edge_length,
        edge_scale_stats: analysis.global.edge_scale,
        edge_strength_stats: analysis.global.edge_strength,
        peaks: analysis.features.peaks.clone(),
        edges: analysis.features.edges.clone(),
        ridges: analysis.features.ridges.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::Raster;
    use std::path::PathBuf;

    #[derive(Debug)]
    struct MissingSource;

    impl ElevationSource for MissingSource {
        fn cache_key(&self) -> Option<String> {
            None
        }

        fn load(&self) -> Result<ElevationGrid, SourceError> {
            Err(SourceError::Unavailable {
                name: "missing".into(),
                reason: "no file".into(),
            })
        }
    }

    fn ramp(w: usize, h: usize) -> Heightfield {
        Raster::from_fn(w, h, |x, y| (x * 3 + y) as f32)
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "terrain_core_sample_{name}_{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn stages_escalate_in_order() {
        let sample = TerrainSample::from_heightfield(ramp(32, 32), TerrainLod::L90m);
        assert!(sample.status(TerrainLod::L90m).is_loaded());
        assert!(!sample.status(TerrainLod::L90m).is_analyzed());
        assert!(sample.ensure_studied(TerrainLod::L90m));
        let status = sample.status(TerrainLod::L90m);
        assert!(status.is_studied() && status.is_consistent());
        assert_eq!(sample.local(TerrainLod::L90m).elevation_mean.width(), 32);
    }

    #[test]
    fn coarser_view_resamples_from_finer() {
        let sample = TerrainSample::from_heightfield(ramp(27, 27), TerrainLod::L30m);
        assert_eq!(
            sample.ensure_loaded(TerrainLod::L90m),
            LoadOutcome::Resampled {
                from: TerrainLod::L30m
            }
        );
        assert_eq!(sample.elevation(TerrainLod::L90m).width(), 9);
        assert_eq!(sample.ensure_loaded(TerrainLod::L90m), LoadOutcome::AlreadyLoaded);
    }

    #[test]
    fn source_at_another_lod_fills_both_views() {
        let source = InMemorySource::new(ramp(12, 12), TerrainLod::L270m);
        let sample = TerrainSample::new(Arc::new(source));
        assert_eq!(sample.ensure_loaded(TerrainLod::L90m), LoadOutcome::FromSource);
        assert_eq!(sample.elevation(TerrainLod::L90m).width(), 36);
        assert!(sample.is_loaded(TerrainLod::L270m));
    }

    #[test]
    fn unavailable_view_stays_unloaded() {
        let sample = TerrainSample::new(Arc::new(MissingSource));
        assert_eq!(sample.ensure_loaded(TerrainLod::L30m), LoadOutcome::Unavailable);
        assert!(!sample.ensure_studied(TerrainLod::L30m));
        assert_eq!(sample.status(TerrainLod::L30m), LodStatus::empty());
        assert!(sample.elevation(TerrainLod::L30m).is_empty());
        assert!(sample.local(TerrainLod::L30m).is_empty());
    }

    #[test]
    fn studied_view_round_trips_through_cache() {
        let dir = scratch_dir("roundtrip");
        let source = Arc::new(InMemorySource::new(ramp(16, 16), TerrainLod::L30m).with_cache_key("ramp"));
        let first = TerrainSample::new(source.clone()).with_cache(AnalysisCache::new(&dir));
        assert!(first.ensure_studied(TerrainLod::L30m));

        let second = TerrainSample::new(source).with_cache(AnalysisCache::new(&dir));
        assert_eq!(second.ensure_loaded(TerrainLod::L30m), LoadOutcome::FromCache);
        assert!(second.status(TerrainLod::L30m).is_studied());
        assert_eq!(second.global_stats(TerrainLod::L30m), first.global_stats(TerrainLod::L30m));
        assert_eq!(*second.local(TerrainLod::L30m), *first.local(TerrainLod::L30m));
    }

    #[test]
    fn failed_cache_write_does_not_fail_study() {
        let dir = scratch_dir("blocked");
        std::fs::write(&dir, b"not a directory").unwrap();
        let source = Arc::new(InMemorySource::new(ramp(8, 8), TerrainLod::L30m).with_cache_key("ramp"));
        let sample = TerrainSample::new(source).with_cache(AnalysisCache::new(&dir));
        assert!(sample.ensure_studied(TerrainLod::L30m));
        std::fs::remove_file(&dir).unwrap();
    }

    #[test]
    fn region_stats_are_bounds_checked() {
        let ids = Raster::from_fn(8, 8, |x, _| if x < 4 { 1 } else { 2 });
        let map = Arc::new(MapRasterization::new(ids, TerrainLod::L30m, 3).unwrap());
        let sample = TerrainSample::from_heightfield(ramp(8, 8), TerrainLod::L30m).with_regions(map);
        assert_eq!(sample.region_count(TerrainLod::L30m), 2);
        assert!(sample.region_stats(TerrainLod::L30m, 2).is_ok());
        assert!(matches!(
            sample.region_stats(TerrainLod::L30m, 3),
            Err(SampleError::RegionOutOfRange { count: 2, .. })
        ));
        assert!(sample.region_stats(TerrainLod::L30m, 0).is_err());
    }

    #[test]
    fn names_follow_type_link() {
        let mut sample = TerrainSample::from_heightfield(ramp(4, 4), TerrainLod::L30m);
        assert_eq!(sample.name(), "unattached:0");
        sample.attach(
            3,
            TypeLink {
                id: 1,
                name: Arc::from("mesa"),
            },
            None,
            Arc::new(AnalysisConfig::default()),
        );
        assert_eq!(sample.view_name(TerrainLod::L30m), "mesa:3[30m]");
        assert_eq!(sample.region_count(TerrainLod::L30m), 1);
    }
}
