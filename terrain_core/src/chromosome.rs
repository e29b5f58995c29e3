//! Gene grids evolved by the heightfield GA, and the pattern they chase.

use std::{f32::consts::PI, sync::Arc};

use crate::{
    analysis::{AnalysisConfig, GlobalStats, LocalAggregates, LocalContext, SampleAnalysis},
    error::SynthesisError,
    fitness::FitnessMeasures,
    library::TerrainLibrary,
    lod::TerrainLod,
    masks::BlendMasks,
    raster::{magnitude, Heightfield, Raster},
    region::{MapRasterization, RegionId, RegionMap, TerrainTypeId},
    sample::TerrainSample,
};

/// Read-only target shared by every chromosome of one refinement.
#[derive(Debug)]
pub struct Pattern {
    lod: TerrainLod,
    sample: Arc<TerrainSample>,
    elevation: Arc<Heightfield>,
    analysis: Arc<SampleAnalysis>,
    local: Arc<LocalAggregates>,
    map: Arc<RegionMap>,
    masks: Arc<BlendMasks>,
    region_weights: Vec<[f64; 5]>,
}

impl Pattern {
    pub fn new(
        elevation: Heightfield,
        map: Arc<RegionMap>,
        library: &TerrainLibrary,
        masks: Arc<BlendMasks>,
        analysis_config: Arc<AnalysisConfig>,
    ) -> Result<Self, SynthesisError> {
        if elevation.width() != map.width() || elevation.height() != map.height() {
            return Err(SynthesisError::PatternSizeMismatch {
                pattern_width: elevation.width(),
                pattern_height: elevation.height(),
                map_width: map.width(),
                map_height: map.height(),
            });
        }
        let lod = map.lod();
        let rasterization = MapRasterization::from_map(Arc::clone(&map), library.size());
        let sample = Arc::new(
            TerrainSample::from_heightfield(elevation, lod)
                .with_regions(Arc::new(rasterization))
                .with_analysis_config(analysis_config),
        );
        sample.ensure_studied(lod);
        let region_weights = map
            .regions()
            .iter()
            .map(|region| {
                library
                    .terrain_type(region.terrain_type)
                    .ok()
                    .and_then(|t| t.signature(lod))
                    .map(|s| s.weights)
                    .unwrap_or([0.2; 5])
            })
            .collect();
        Ok(Self {
            lod,
            elevation: sample.elevation(lod),
            analysis: sample.analysis(lod),
            local: sample.local(lod),
            sample,
            map,
            masks,
            region_weights,
        })
    }

    pub fn lod(&self) -> TerrainLod {
        self.lod
    }

    pub fn sample(&self) -> &Arc<TerrainSample> {
        &self.sample
    }

    pub fn elevation(&self) -> &Heightfield {
        &self.elevation
    }

    pub fn analysis(&self) -> &SampleAnalysis {
        &self.analysis
    }

    pub fn global(&self) -> &GlobalStats {
        &self.analysis.global
    }

    pub fn local(&self) -> &LocalAggregates {
        &self.local
    }

    pub fn map(&self) -> &RegionMap {
        &self.map
    }

    pub fn masks(&self) -> &BlendMasks {
        &self.masks
    }

    pub fn width(&self) -> usize {
        self.elevation.width()
    }

    pub fn height(&self) -> usize {
        self.elevation.height()
    }

    /// Category weights of the terrain type owning `region`.
    pub fn region_weights(&self, region: RegionId) -> [f64; 5] {
        (region as usize)
            .checked_sub(1)
            .and_then(|i| self.region_weights.get(i))
            .copied()
            .unwrap_or([0.2; 5])
    }

    pub fn context_at(&self, x: isize, y: isize) -> Option<LocalContext> {
        self.local.context_at(x, y)
    }
}

/// A studied library sample a gene copies from.
#[derive(Debug, Clone)]
pub struct GeneSource {
    pub sample: Arc<TerrainSample>,
    pub elevation: Arc<Heightfield>,
    pub local: Arc<LocalAggregates>,
}

impl GeneSource {
    /// `None` when the sample cannot be studied at `lod`.
    pub fn new(sample: Arc<TerrainSample>, lod: TerrainLod) -> Option<Self> {
        if !sample.ensure_studied(lod) {
            return None;
        }
        let elevation = sample.elevation(lod);
        if elevation.is_empty() {
            return None;
        }
        let local = sample.local(lod);
        Some(Self {
            sample,
            elevation,
            local,
        })
    }

    pub fn width(&self) -> usize {
        self.elevation.width()
    }

    pub fn height(&self) -> usize {
        self.elevation.height()
    }
}

/// How well a gene fits its slot. Each component is a normalized
/// difference in `[0, 1]`; `overall = 1 − mean(components)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeneCompatibility {
    pub overall: f32,
    pub gradient_magnitude: f32,
    pub gradient_angle: f32,
    pub elevation_mean: f32,
    pub elevation_min: f32,
    pub elevation_max: f32,
    pub slope: f32,
}

impl Default for GeneCompatibility {
    fn default() -> Self {
        Self {
            overall: 1.0,
            gradient_magnitude: 0.0,
            gradient_angle: 0.0,
            elevation_mean: 0.0,
            elevation_min: 0.0,
            elevation_max: 0.0,
            slope: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Gene {
    pub index: (usize, usize),
    /// Pixel the gene is centered on before jitter.
    pub anchor: (usize, usize),
    pub terrain_type: TerrainTypeId,
    pub source: Option<GeneSource>,
    pub source_center: (isize, isize),
    /// Radians.
    pub rotation: f32,
    /// Multiplier applied about the source's local mean.
    pub scale: f32,
    /// Meters added after scaling.
    pub offset: f32,
    pub jitter: (i32, i32),
    pub compatibility: GeneCompatibility,
}

impl Gene {
    pub fn new(index: (usize, usize), anchor: (usize, usize), terrain_type: TerrainTypeId) -> Self {
        Self {
            index,
            anchor,
            terrain_type,
            source: None,
            source_center: (0, 0),
            rotation: 0.0,
            scale: 1.0,
            offset: 0.0,
            jitter: (0, 0),
            compatibility: GeneCompatibility::default(),
        }
    }

    pub fn target_center(&self) -> (isize, isize) {
        (
            self.anchor.0 as isize + self.jitter.0 as isize,
            self.anchor.1 as isize + self.jitter.1 as isize,
        )
    }

    /// Local aggregates at the source center, before the gene's transform.
    pub fn source_context(&self) -> Option<LocalContext> {
        let source = self.source.as_ref()?;
        source
            .local
            .context_at(self.source_center.0, self.source_center.1)
    }

    pub fn source_mean(&self) -> f32 {
        self.source_context().map_or(0.0, |c| c.elevation_mean)
    }

    /// Local aggregates as they appear once rotated, scaled and offset into
    /// the output.
    pub fn transformed_context(&self) -> Option<LocalContext> {
        let c = self.source_context()?;
        let (sin, cos) = self.rotation.sin_cos();
        let [gx, gy] = c.gradient_mean;
        let gradient_mean = [
            self.scale * (cos * gx + sin * gy),
            self.scale * (-sin * gx + cos * gy),
        ];
        let around_mean = |v: f32| (v - c.elevation_mean) * self.scale + c.elevation_mean + self.offset;
        let lo = around_mean(c.elevation_range[0]);
        let hi = around_mean(c.elevation_range[1]);
        let slope = |v: f32| v * self.scale.abs();
        Some(LocalContext {
            elevation_mean: c.elevation_mean + self.offset,
            gradient_mean,
            elevation_range: [lo.min(hi), lo.max(hi)],
            slope_range: [slope(c.slope_range[0]), slope(c.slope_range[1])],
        })
    }

    /// Rotation that turns the source's local gradient onto `target`; `None`
    /// when either gradient vanishes.
    pub fn rotation_toward(&self, target: [f32; 2]) -> Option<f32> {
        let source = self.source_context()?.gradient_mean;
        if magnitude(source) <= f32::EPSILON || magnitude(target) <= f32::EPSILON {
            return None;
        }
        let angle = source[1].atan2(source[0]) - target[1].atan2(target[0]);
        Some(angle.rem_euclid(2.0 * PI))
    }

    pub fn reset_transform(&mut self) {
        self.rotation = 0.0;
        self.scale = 1.0;
        self.offset = 0.0;
        self.jitter = (0, 0);
    }
}

/// A candidate heightfield: a grid of genes over the pattern.
#[derive(Debug, Clone)]
pub struct TerrainChromosome {
    pattern: Arc<Pattern>,
    genes: Raster<Gene>,
    rendered: Heightfield,
    fitness: FitnessMeasures,
}

impl TerrainChromosome {
    /// Grid of identity genes anchored every gene spacing, plus one more
    /// row and column pinned to the far edge when the spacing does not land
    /// on it. Each gene is tagged with the terrain type under its anchor.
    pub fn new(pattern: Arc<Pattern>) -> Self {
        let spacing = pattern.lod().gene_spacing();
        let width = grid_extent(pattern.width(), spacing);
        let height = grid_extent(pattern.height(), spacing);
        let map = pattern.map();
        let genes = Raster::from_fn(width, height, |x, y| {
            let px = (x * spacing).min(pattern.width().saturating_sub(1));
            let py = (y * spacing).min(pattern.height().saturating_sub(1));
            Gene::new((x, y), (px, py), map.terrain_type_at(px, py))
        });
        Self {
            pattern,
            genes,
            rendered: Heightfield::empty(),
            fitness: FitnessMeasures::default(),
        }
    }

    pub fn lod(&self) -> TerrainLod {
        self.pattern.lod()
    }

    pub fn pattern(&self) -> &Arc<Pattern> {
        &self.pattern
    }

    pub fn grid_width(&self) -> usize {
        self.genes.width()
    }

    pub fn grid_height(&self) -> usize {
        self.genes.height()
    }

    pub fn gene_count(&self) -> usize {
        self.genes.len()
    }

    pub fn same_grid(&self, other: &TerrainChromosome) -> bool {
        self.genes.same_size(&other.genes)
    }

    pub fn gene(&self, x: usize, y: usize) -> &Gene {
        &self.genes.values()[self.genes.idx(x, y)]
    }

    pub fn gene_mut(&mut self, x: usize, y: usize) -> &mut Gene {
        let i = self.genes.idx(x, y);
        &mut self.genes.values_mut()[i]
    }

    pub fn genes(&self) -> &[Gene] {
        self.genes.values()
    }

    pub fn genes_mut(&mut self) -> &mut [Gene] {
        self.genes.values_mut()
    }

    /// Exchange the genes at `(x, y)` between two chromosomes of equal grids.
    pub fn swap_gene(&mut self, other: &mut TerrainChromosome, x: usize, y: usize) {
        let i = self.genes.idx(x, y);
        std::mem::swap(&mut self.genes.values_mut()[i], &mut other.genes.values_mut()[i]);
    }

    pub fn rendered(&self) -> &Heightfield {
        &self.rendered
    }

    pub(crate) fn set_rendered(&mut self, rendered: Heightfield) {
        self.rendered = rendered;
    }

    pub fn fitness(&self) -> &FitnessMeasures {
        &self.fitness
    }

    pub fn fitness_mut(&mut self) -> &mut FitnessMeasures {
        &mut self.fitness
    }

    pub fn into_heightfield(self) -> Heightfield {
        self.rendered
    }
}

/// Genes needed along an axis of `size` pixels so the last anchor sits on
/// the final pixel.
fn grid_extent(size: usize, spacing: usize) -> usize {
    match size {
        0 => 0,
        _ => (size - 1).div_ceil(spacing.max(1)) + 1,
    }
}
