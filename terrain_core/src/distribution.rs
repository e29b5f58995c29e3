//! Agreement between a terrain type's observed statistics and reference variances.
//!
//! Each of the five statistic categories gets a [`DistributionMatcher`] fed
//! with the four moments of every constituent sample. The spread of those
//! moments across samples is compared against two reference variance sets:
//! the library-wide default (what a coherent terrain type typically shows)
//! and the library baseline (what the whole library shows). Falling at or
//! under the default means full agreement; reaching the library baseline
//! means none, with a log-linear ramp in between.

use std::{collections::BTreeMap, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    analysis::{GlobalStats, StatCategory},
    lod::{nearest_coarser, nearest_finer, TerrainLod},
    stats::{Statistics, COMPONENT_COUNT},
};

pub const BUILTIN_LIBRARY_VARIANCES: &str = include_str!("data/library_variances.json");

/// Confidence level applied to every agreement score.
pub const MATCH_CONFIDENCE: f64 = 0.9;

pub type ComponentVariances = [f64; COMPONENT_COUNT];

/// Variance of each moment, per statistic category.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct VarianceTable {
    pub elevation: ComponentVariances,
    pub slope: ComponentVariances,
    pub edge_length: ComponentVariances,
    pub edge_scale: ComponentVariances,
    pub edge_strength: ComponentVariances,
}

impl VarianceTable {
    pub fn category(&self, category: StatCategory) -> &ComponentVariances {
        match category {
            StatCategory::Elevation => &self.elevation,
            StatCategory::Slope => &self.slope,
            StatCategory::EdgeLength => &self.edge_length,
            StatCategory::EdgeScale => &self.edge_scale,
            StatCategory::EdgeStrength => &self.edge_strength,
        }
    }

    pub fn category_mut(&mut self, category: StatCategory) -> &mut ComponentVariances {
        match category {
            StatCategory::Elevation => &mut self.elevation,
            StatCategory::Slope => &mut self.slope,
            StatCategory::EdgeLength => &mut self.edge_length,
            StatCategory::EdgeScale => &mut self.edge_scale,
            StatCategory::EdgeStrength => &mut self.edge_strength,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DistributionMatcher {
    category: StatCategory,
    observations: Vec<ComponentVariances>,
    curve_variances: Option<ComponentVariances>,
    agreement: f64,
}

impl DistributionMatcher {
    pub fn new(category: StatCategory) -> Self {
        Self {
            category,
            observations: Vec::new(),
            curve_variances: None,
            agreement: 1.0,
        }
    }

    pub fn category(&self) -> StatCategory {
        self.category
    }

    pub fn examine(&mut self, stats: &Statistics) {
        self.observations.push(stats.components());
    }

    pub fn sample_count(&self) -> usize {
        self.observations.len()
    }

    /// Sample variance (n − 1) of each moment across the examined samples;
    /// `None` until at least two samples were seen.
    pub fn observed_variances(&self) -> Option<ComponentVariances> {
        let n = self.observations.len();
        if n < 2 {
            return None;
        }
        let mut out = [0.0; COMPONENT_COUNT];
        for (c, slot) in out.iter_mut().enumerate() {
            let mean = self.observations.iter().map(|o| o[c]).sum::<f64>() / n as f64;
            let ss: f64 = self
                .observations
                .iter()
                .map(|o| (o[c] - mean) * (o[c] - mean))
                .sum();
            *slot = ss / (n - 1) as f64;
        }
        Some(out)
    }

    /// Score the examined samples. Fewer than two samples carry no spread of
    /// their own and inherit the default variances.
    pub fn analyze(
        &mut self,
        confidence: f64,
        defaults: &ComponentVariances,
        library: &ComponentVariances,
    ) -> f64 {
        let observed = self.observed_variances().unwrap_or(*defaults);
        let mut score = 0.0;
        for c in 0..COMPONENT_COUNT {
            score += component_agreement(observed[c], defaults[c], library[c]);
        }
        let score = score / COMPONENT_COUNT as f64;
        self.curve_variances = Some(observed);
        self.agreement = (1.0 - confidence) + confidence * score;
        self.agreement
    }

    pub fn curve_variances(&self) -> Option<&ComponentVariances> {
        self.curve_variances.as_ref()
    }

    pub fn agreement(&self) -> f64 {
        self.agreement
    }
}

fn component_agreement(observed: f64, default: f64, library: f64) -> f64 {
    if !observed.is_finite() {
        return 0.0;
    }
    let default = default.max(f64::EPSILON);
    if observed <= default {
        return 1.0;
    }
    if library <= default || observed >= library {
        return 0.0;
    }
    (1.0 - (observed / default).ln() / (library / default).ln()).clamp(0.0, 1.0)
}

/// Per-LOD signature of one terrain type.
#[derive(Debug, Clone)]
pub struct TypeSignature {
    pub matchers: Vec<DistributionMatcher>,
    /// Indexed by [`StatCategory::index`]; sums to 1.
    pub weights: [f64; 5],
    pub agreement: f64,
}

impl TypeSignature {
    pub fn analyze(stats: &[GlobalStats], defaults: &VarianceTable, library: &VarianceTable) -> Self {
        let mut matchers: Vec<DistributionMatcher> = StatCategory::ALL
            .iter()
            .map(|&category| DistributionMatcher::new(category))
            .collect();
        for sample in stats {
            for matcher in matchers.iter_mut() {
                matcher.examine(sample.category(matcher.category()));
            }
        }
        let mut agreements = [0.0; 5];
        for matcher in matchers.iter_mut() {
            let category = matcher.category();
            agreements[category.index()] = matcher.analyze(
                MATCH_CONFIDENCE,
                defaults.category(category),
                library.category(category),
            );
        }
        let sum: f64 = agreements.iter().sum();
        let weights = if sum > 0.0 {
            agreements.map(|a| a / sum)
        } else {
            [0.2; 5]
        };
        Self {
            matchers,
            weights,
            agreement: sum / 4.0,
        }
    }

    pub fn weight(&self, category: StatCategory) -> f64 {
        self.weights[category.index()]
    }

    pub fn category_agreement(&self, category: StatCategory) -> f64 {
        self.matchers[category.index()].agreement()
    }
}

/// Default and library variance tables per LOD.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LibraryVariances {
    pub default: BTreeMap<TerrainLod, VarianceTable>,
    pub library: BTreeMap<TerrainLod, VarianceTable>,
}

impl LibraryVariances {
    pub fn builtin() -> Arc<Self> {
        Arc::new(
            serde_json::from_str(BUILTIN_LIBRARY_VARIANCES)
                .expect("builtin library variances should parse"),
        )
    }

    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// `(default, library)` tables for `lod`, falling back to the nearest
    /// defined level (finer first).
    pub fn tables(&self, lod: TerrainLod) -> (VarianceTable, VarianceTable) {
        (lookup(&self.default, lod), lookup(&self.library, lod))
    }

    /// Derive both tables from per-type sample statistics at one LOD.
    ///
    /// The library table is the spread over every sample; the default table
    /// is the sample-weighted mean spread of types holding two or more samples.
    pub fn derive(lod: TerrainLod, types: &[Vec<GlobalStats>]) -> Self {
        let mut library = VarianceTable::default();
        let mut defaults = VarianceTable::default();
        let mut non_singular = 0usize;
        for category in StatCategory::ALL {
            let mut all = DistributionMatcher::new(category);
            let mut weighted = [0.0; COMPONENT_COUNT];
            let mut samples = 0usize;
            for stats in types {
                let mut per_type = DistributionMatcher::new(category);
                for s in stats {
                    all.examine(s.category(category));
                    per_type.examine(s.category(category));
                }
                if let Some(v) = per_type.observed_variances() {
                    samples += stats.len();
                    for c in 0..COMPONENT_COUNT {
                        weighted[c] += v[c] * stats.len() as f64;
                    }
                }
            }
            *library.category_mut(category) = all.observed_variances().unwrap_or_default();
            if samples > 0 {
                *defaults.category_mut(category) = weighted.map(|w| w / samples as f64);
            }
            non_singular = samples;
        }
        tracing::info!(
            target: "terrain_synth::library",
            lod = %lod,
            non_singular_samples = non_singular,
            "library.variances.derived"
        );
        Self {
            default: BTreeMap::from([(lod, defaults)]),
            library: BTreeMap::from([(lod, library)]),
        }
    }

    pub fn merge(&mut self, other: LibraryVariances) {
        self.default.extend(other.default);
        self.library.extend(other.library);
    }
}

fn lookup(tables: &BTreeMap<TerrainLod, VarianceTable>, lod: TerrainLod) -> VarianceTable {
    if let Some(table) = tables.get(&lod) {
        return *table;
    }
    nearest_finer(lod, |l| tables.contains_key(&l))
        .or_else(|| nearest_coarser(lod, |l| tables.contains_key(&l)))
        .and_then(|l| tables.get(&l))
        .copied()
        .unwrap_or_default()
}
