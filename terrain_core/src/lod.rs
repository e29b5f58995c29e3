//! Discrete terrain resolutions, per-LOD tables and lazy-stage status flags.

use std::{
    fmt,
    ops::{Index, IndexMut},
};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const LOD_COUNT: usize = 5;

const BLEND_FALLOFF_RATIO: f32 = 0.4;
const BLEND_OVERLAP_RATIO: f32 = 0.25;
const WINDOW_SIZE: usize = 16;

/// Resolution levels ordered coarse to fine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TerrainLod {
    #[serde(rename = "810m")]
    L810m,
    #[serde(rename = "270m")]
    L270m,
    #[serde(rename = "90m")]
    L90m,
    #[serde(rename = "30m")]
    L30m,
    #[serde(rename = "10m")]
    L10m,
}

#[derive(Debug, Error, PartialEq)]
pub enum LodError {
    #[error("no LOD has a resolution of {0} meters per sample")]
    NoMatchingResolution(f32),
}

impl TerrainLod {
    pub const ALL: [TerrainLod; LOD_COUNT] = [
        TerrainLod::L810m,
        TerrainLod::L270m,
        TerrainLod::L90m,
        TerrainLod::L30m,
        TerrainLod::L10m,
    ];
    pub const COARSEST: TerrainLod = TerrainLod::L810m;
    pub const FINEST: TerrainLod = TerrainLod::L10m;

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn meters_per_sample(self) -> f32 {
        match self {
            TerrainLod::L810m => 810.0,
            TerrainLod::L270m => 270.0,
            TerrainLod::L90m => 90.0,
            TerrainLod::L30m => 30.0,
            TerrainLod::L10m => 10.0,
        }
    }

    pub fn samples_per_meter(self) -> f32 {
        1.0 / self.meters_per_sample()
    }

    pub fn for_meters_per_sample(mps: f32) -> Result<Self, LodError> {
        Self::ALL
            .iter()
            .copied()
            .find(|lod| effectively_equal(lod.meters_per_sample(), mps))
            .ok_or(LodError::NoMatchingResolution(mps))
    }

    pub fn for_samples_per_meter(spm: f32) -> Result<Self, LodError> {
        Self::for_meters_per_sample(1.0 / spm)
    }

    /// Next level with smaller meters-per-sample.
    pub fn finer(self) -> Option<Self> {
        Self::from_index(self.index() + 1)
    }

    pub fn coarser(self) -> Option<Self> {
        self.index().checked_sub(1).and_then(Self::from_index)
    }

    /// Side length of the square pixel window used for blending and local statistics.
    pub fn window_size(self) -> usize {
        WINDOW_SIZE
    }

    pub fn blend_falloff_radius(self) -> f32 {
        self.window_size() as f32 * BLEND_FALLOFF_RATIO * 0.5
    }

    /// Distance in pixels between neighbouring gene target centers.
    pub fn gene_spacing(self) -> usize {
        (self.window_size() as f32 * (1.0 - BLEND_OVERLAP_RATIO)) as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            TerrainLod::L810m => "810m",
            TerrainLod::L270m => "270m",
            TerrainLod::L90m => "90m",
            TerrainLod::L30m => "30m",
            TerrainLod::L10m => "10m",
        }
    }

    /// Inclusive range between two levels, iterated coarse to fine.
    pub fn range(a: TerrainLod, b: TerrainLod) -> impl Iterator<Item = TerrainLod> {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Self::ALL[lo.index()..=hi.index()].iter().copied()
    }
}

impl fmt::Display for TerrainLod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Factor by which raster dimensions grow when converting from `from` to `to`.
pub fn scale_factor(from: TerrainLod, to: TerrainLod) -> f32 {
    from.meters_per_sample() / to.meters_per_sample()
}

fn effectively_equal(a: f32, b: f32) -> bool {
    (a - b).abs() <= 1e-3 * a.abs().max(1.0)
}

/// One value per LOD, indexable by [`TerrainLod`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LodTable<T>([T; LOD_COUNT]);

impl<T> LodTable<T> {
    pub fn from_fn(mut f: impl FnMut(TerrainLod) -> T) -> Self {
        Self(std::array::from_fn(|i| f(TerrainLod::ALL[i])))
    }

    pub fn iter(&self) -> impl Iterator<Item = (TerrainLod, &T)> {
        TerrainLod::ALL.iter().copied().zip(self.0.iter())
    }
}

impl<T> Index<TerrainLod> for LodTable<T> {
    type Output = T;

    fn index(&self, lod: TerrainLod) -> &T {
        &self.0[lod.index()]
    }
}

impl<T> IndexMut<TerrainLod> for LodTable<T> {
    fn index_mut(&mut self, lod: TerrainLod) -> &mut T {
        &mut self.0[lod.index()]
    }
}

bitflags! {
    /// Lazy-computation stages reached by one (entity, LOD) view.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LodStatus: u8 {
        const LOADED = 1;
        const ANALYZED = 1 << 1;
        const STUDIED = 1 << 2;
    }
}

impl LodStatus {
    pub fn is_loaded(self) -> bool {
        self.contains(LodStatus::LOADED)
    }

    pub fn is_analyzed(self) -> bool {
        self.contains(LodStatus::ANALYZED)
    }

    pub fn is_studied(self) -> bool {
        self.contains(LodStatus::STUDIED)
    }

    /// `studied ⇒ analyzed ⇒ loaded`.
    pub fn is_consistent(self) -> bool {
        (!self.is_studied() || self.is_analyzed()) && (!self.is_analyzed() || self.is_loaded())
    }

    /// Fresh raster data invalidates every derived stage.
    pub fn reloaded() -> Self {
        LodStatus::LOADED
    }

    pub fn with_analyzed(self) -> Self {
        debug_assert!(self.is_loaded());
        self | LodStatus::ANALYZED
    }

    pub fn with_studied(self) -> Self {
        debug_assert!(self.is_analyzed());
        self | LodStatus::STUDIED
    }
}

/// Nearest level finer than `lod` satisfying `pred`.
pub fn nearest_finer(lod: TerrainLod, pred: impl Fn(TerrainLod) -> bool) -> Option<TerrainLod> {
    TerrainLod::ALL[lod.index() + 1..]
        .iter()
        .copied()
        .find(|&l| pred(l))
}

/// Nearest level coarser than `lod` satisfying `pred`.
pub fn nearest_coarser(lod: TerrainLod, pred: impl Fn(TerrainLod) -> bool) -> Option<TerrainLod> {
    TerrainLod::ALL[..lod.index()]
        .iter()
        .rev()
        .copied()
        .find(|&l| pred(l))
}
