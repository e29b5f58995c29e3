//! Per-LOD analysis of a heightfield: gradient, spectrum, features, statistics
//! and the windowed "study" aggregates.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    features::{detect_features, FeatureConfig, FeatureSet, FeatureSummary},
    lod::TerrainLod,
    raster::{gradient, magnitude, Heightfield, RangeField, Raster, VectorField},
    region::RegionMap,
    spectrum::{frequency_spectrum, FrequencySpectrum, DEFAULT_FREQUENCY_BANDS},
    stats::{StatAccumulator, Statistics},
};

/// The five statistical categories compared across samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatCategory {
    Elevation,
    Slope,
    EdgeLength,
    EdgeScale,
    EdgeStrength,
}

impl StatCategory {
    pub const ALL: [StatCategory; 5] = [
        StatCategory::Elevation,
        StatCategory::Slope,
        StatCategory::EdgeLength,
        StatCategory::EdgeScale,
        StatCategory::EdgeStrength,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GlobalStats {
    pub elevation: Statistics,
    pub slope: Statistics,
    pub edge_length: Statistics,
    pub edge_scale: Statistics,
    pub edge_strength: Statistics,
}

impl GlobalStats {
    pub fn category(&self, category: StatCategory) -> &Statistics {
        match category {
            StatCategory::Elevation => &self.elevation,
            StatCategory::Slope => &self.slope,
            StatCategory::EdgeLength => &self.edge_length,
            StatCategory::EdgeScale => &self.edge_scale,
            StatCategory::EdgeStrength => &self.edge_strength,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub features: FeatureConfig,
    pub frequency_bands: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            features: FeatureConfig::default(),
            frequency_bands: DEFAULT_FREQUENCY_BANDS,
        }
    }
}

/// Everything the "analyze" stage derives for one sample at one LOD.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SampleAnalysis {
    pub gradient: VectorField,
    pub spectrum: FrequencySpectrum,
    pub features: FeatureSet,
    pub global: GlobalStats,
    /// Indexed by region ID − 1; empty when no region map is attached.
    pub regions: Vec<GlobalStats>,
}

/// Windowed aggregates produced by the "study" stage.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LocalAggregates {
    pub elevation_mean: Heightfield,
    pub gradient_mean: VectorField,
    pub elevation_range: RangeField,
    pub slope_range: RangeField,
}

impl LocalAggregates {
    pub fn is_empty(&self) -> bool {
        self.elevation_mean.is_empty()
    }

    /// Aggregates at `(x, y)`, clamped to the raster.
    pub fn context_at(&self, x: isize, y: isize) -> Option<LocalContext> {
        if self.is_empty() {
            return None;
        }
        Some(LocalContext {
            elevation_mean: self.elevation_mean.clamped(x, y),
            gradient_mean: self.gradient_mean.clamped(x, y),
            elevation_range: self.elevation_range.clamped(x, y),
            slope_range: self.slope_range.clamped(x, y),
        })
    }
}

/// The study aggregates of a single pixel.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LocalContext {
    pub elevation_mean: f32,
    pub gradient_mean: [f32; 2],
    pub elevation_range: [f32; 2],
    pub slope_range: [f32; 2],
}

pub fn analyze_heightfield(
    elevation: &Heightfield,
    lod: TerrainLod,
    regions: Option<&RegionMap>,
    config: &AnalysisConfig,
) -> SampleAnalysis {
    let mps = lod.meters_per_sample();
    let gradient = gradient(elevation, mps);
    let spectrum = frequency_spectrum(elevation, mps, config.frequency_bands);
    let features = detect_features(elevation, mps, &config.features);
    let global = global_statistics(elevation, &gradient, &features);
    let regions = regions
        .map(|map| region_statistics(elevation, &gradient, &features, map))
        .unwrap_or_default();
    SampleAnalysis {
        gradient,
        spectrum,
        features,
        global,
        regions,
    }
}

pub fn global_statistics(
    elevation: &Heightfield,
    gradient: &VectorField,
    features: &FeatureSet,
) -> GlobalStats {
    let edges = FeatureSummary::of(&features.edges);
    GlobalStats {
        elevation: Statistics::from_values(elevation.values().iter().map(|&v| v as f64)),
        slope: Statistics::from_values(gradient.values().iter().map(|&g| magnitude(g) as f64)),
        edge_length: edges.length,
        edge_scale: edges.scale,
        edge_strength: edges.strength,
    }
}

/// Per-region statistics; a feature belongs to the region of its first point.
pub fn region_statistics(
    elevation: &Heightfield,
    gradient: &VectorField,
    features: &FeatureSet,
    map: &RegionMap,
) -> Vec<GlobalStats> {
    let count = map.region_count();
    if count == 0 {
        return Vec::new();
    }
    if map.width() != elevation.width() || map.height() != elevation.height() {
        tracing::warn!(
            target: "terrain_synth::analysis",
            map_width = map.width(),
            map_height = map.height(),
            width = elevation.width(),
            height = elevation.height(),
            "analysis.region_stats.size_mismatch"
        );
        return Vec::new();
    }

    let mut elev = vec![StatAccumulator::default(); count];
    let mut slope = vec![StatAccumulator::default(); count];
    let region_ids = map.region_ids().values();
    for pass in 0..2 {
        for (i, &rid) in region_ids.iter().enumerate() {
            if rid == 0 {
                continue;
            }
            let r = rid as usize - 1;
            elev[r].push(elevation.values()[i] as f64);
            slope[r].push(magnitude(gradient.values()[i]) as f64);
        }
        if pass == 0 {
            elev.iter_mut().for_each(StatAccumulator::advance);
            slope.iter_mut().for_each(StatAccumulator::advance);
        }
    }

    let mut edges_by_region = vec![Vec::new(); count];
    for feature in &features.edges {
        if let Some(first) = feature.points.first() {
            if let Some(rid) = map.region_at(first.x as usize, first.y as usize) {
                edges_by_region[rid as usize - 1].push(feature.clone());
            }
        }
    }

    (0..count)
        .map(|r| {
            let edges = FeatureSummary::of(&edges_by_region[r]);
            GlobalStats {
                elevation: elev[r].finish(),
                slope: slope[r].finish(),
                edge_length: edges.length,
                edge_scale: edges.scale,
                edge_strength: edges.strength,
            }
        })
        .collect()
}

/// Direct windowed aggregation centered on every pixel, clipped at the edges.
pub fn study_heightfield(
    elevation: &Heightfield,
    gradient: &VectorField,
    window: usize,
) -> LocalAggregates {
    let w = elevation.width();
    let h = elevation.height();
    if elevation.is_empty() || !elevation.same_size(gradient) {
        return LocalAggregates::default();
    }
    let half = window / 2;

    let rows: Vec<Vec<([f32; 2], [f32; 2], f32, [f32; 2])>> = (0..h)
        .into_par_iter()
        .map(|y| {
            let y0 = y.saturating_sub(half);
            let y1 = (y0 + window).min(h);
            (0..w)
                .map(|x| {
                    let x0 = x.saturating_sub(half);
                    let x1 = (x0 + window).min(w);
                    let mut sum = 0.0f64;
                    let mut gsum = [0.0f64; 2];
                    let mut elev_range = [f32::MAX, f32::MIN];
                    let mut slope_range = [f32::MAX, f32::MIN];
                    for wy in y0..y1 {
                        for wx in x0..x1 {
                            let e = elevation.sample(wx, wy);
                            let g = gradient.sample(wx, wy);
                            let s = magnitude(g);
                            sum += e as f64;
                            gsum[0] += g[0] as f64;
                            gsum[1] += g[1] as f64;
                            elev_range = [elev_range[0].min(e), elev_range[1].max(e)];
                            slope_range = [slope_range[0].min(s), slope_range[1].max(s)];
                        }
                    }
                    let n = ((x1 - x0) * (y1 - y0)) as f64;
                    (
                        [(gsum[0] / n) as f32, (gsum[1] / n) as f32],
                        elev_range,
                        (sum / n) as f32,
                        slope_range,
                    )
                })
                .collect()
        })
        .collect();

    let mut elevation_mean = Vec::with_capacity(w * h);
    let mut gradient_mean = Vec::with_capacity(w * h);
    let mut elevation_range = Vec::with_capacity(w * h);
    let mut slope_range = Vec::with_capacity(w * h);
    for row in rows {
        for (g, er, m, sr) in row {
            gradient_mean.push(g);
            elevation_range.push(er);
            elevation_mean.push(m);
            slope_range.push(sr);
        }
    }
    LocalAggregates {
        elevation_mean: Raster::new(w, h, elevation_mean),
        gradient_mean: Raster::new(w, h, gradient_mean),
        elevation_range: Raster::new(w, h, elevation_range),
        slope_range: Raster::new(w, h, slope_range),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::RegionMap;

    #[test]
    fn ramp_statistics() {
        let hf = Raster::from_fn(16, 16, |x, _| x as f32 * 90.0);
        let analysis = analyze_heightfield(&hf, TerrainLod::L90m, None, &AnalysisConfig::default());
        assert!((analysis.global.elevation.mean - 7.5 * 90.0).abs() < 1e-6);
        assert!((analysis.global.slope.mean - 1.0).abs() < 1e-6);
        assert!(analysis.global.slope.variance < 1e-9);
        assert!(analysis.regions.is_empty());
        assert_eq!(analysis.spectrum.bands.len(), DEFAULT_FREQUENCY_BANDS);
    }

    #[test]
    fn region_stats_split_by_label() {
        let hf = Raster::from_fn(8, 4, |x, _| if x < 4 { 10.0 } else { 50.0 });
        let ids = Raster::from_fn(8, 4, |x, _| if x < 4 { 1 } else { 2 });
        let map = RegionMap::analyze(ids, TerrainLod::L30m, 3).unwrap();
        let analysis =
            analyze_heightfield(&hf, TerrainLod::L30m, Some(&map), &AnalysisConfig::default());
        assert_eq!(analysis.regions.len(), 2);
        assert_eq!(analysis.regions[0].elevation.mean, 10.0);
        assert_eq!(analysis.regions[1].elevation.mean, 50.0);
        assert_eq!(analysis.regions[0].elevation.count, 16);
        assert_eq!(analysis.global.elevation.mean, 30.0);
    }

    #[test]
    fn study_window_clips_at_edges() {
        let hf = Raster::from_fn(6, 6, |x, y| (x + y) as f32);
        let grad = gradient(&hf, 1.0);
        let local = study_heightfield(&hf, &grad, 4);
        // Corner window covers x, y in 0..4.
        assert_eq!(local.elevation_mean.sample(0, 0), 3.0);
        assert_eq!(local.elevation_range.sample(0, 0), [0.0, 6.0]);
        let g = local.gradient_mean.sample(3, 3);
        assert!((g[0] - 1.0).abs() < 1e-6 && (g[1] - 1.0).abs() < 1e-6);
        assert_eq!(local.slope_range.width(), 6);
    }
}
