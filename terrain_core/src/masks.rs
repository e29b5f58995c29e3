//! Per-LOD blending kernels used to splat gene patches.

use std::sync::Arc;

use bevy::prelude::Resource;
use serde::{Deserialize, Serialize};

use crate::{
    lod::{LodTable, TerrainLod},
    raster::Raster,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskKind {
    #[default]
    Gaussian,
    Spherical,
}

/// Mask table built once at startup and passed to everything that renders.
#[derive(Debug, Clone)]
pub struct BlendMasks {
    kind: MaskKind,
    gaussian: LodTable<Raster<f32>>,
    spherical: LodTable<Raster<f32>>,
}

impl BlendMasks {
    pub fn build(kind: MaskKind) -> Self {
        Self {
            kind,
            gaussian: LodTable::from_fn(gaussian_mask),
            spherical: LodTable::from_fn(spherical_mask),
        }
    }

    pub fn kind(&self) -> MaskKind {
        self.kind
    }

    /// The active mask for `lod`.
    pub fn mask(&self, lod: TerrainLod) -> &Raster<f32> {
        match self.kind {
            MaskKind::Gaussian => &self.gaussian[lod],
            MaskKind::Spherical => &self.spherical[lod],
        }
    }

    pub fn gaussian(&self, lod: TerrainLod) -> &Raster<f32> {
        &self.gaussian[lod]
    }

    pub fn spherical(&self, lod: TerrainLod) -> &Raster<f32> {
        &self.spherical[lod]
    }
}

impl Default for BlendMasks {
    fn default() -> Self {
        Self::build(MaskKind::default())
    }
}

/// Gaussian falloff with the LOD's blend radius as sigma, 1.0 at the center cell.
fn gaussian_mask(lod: TerrainLod) -> Raster<f32> {
    let size = lod.window_size();
    let sigma = lod.blend_falloff_radius();
    let center = (size / 2) as f32;
    Raster::from_fn(size, size, |x, y| {
        let dx = x as f32 - center;
        let dy = y as f32 - center;
        (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp()
    })
}

/// Hemisphere profile `sqrt(r² − d²) / r`, zero beyond the radius.
fn spherical_mask(lod: TerrainLod) -> Raster<f32> {
    let size = lod.window_size();
    let radius = size as f32 / 2.0;
    let center = (size / 2) as f32;
    Raster::from_fn(size, size, |x, y| {
        let dx = center - x as f32;
        let dy = center - y as f32;
        (radius * radius - dx * dx - dy * dy).max(0.0).sqrt() / radius
    })
}

#[derive(Resource, Debug, Clone)]
pub struct BlendMasksHandle(pub Arc<BlendMasks>);

impl BlendMasksHandle {
    pub fn new(masks: Arc<BlendMasks>) -> Self {
        Self(masks)
    }

    pub fn get(&self) -> Arc<BlendMasks> {
        Arc::clone(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_peak_at_center() {
        let masks = BlendMasks::build(MaskKind::Gaussian);
        for lod in TerrainLod::ALL {
            let m = masks.gaussian(lod);
            let c = lod.window_size() / 2;
            assert_eq!(m.width(), lod.window_size());
            assert!((m.sample(c, c) - 1.0).abs() < 1e-6);
            assert!(m.values().iter().all(|&v| v > 0.0 && v <= 1.0));

            let s = masks.spherical(lod);
            assert!((s.sample(c, c) - 1.0).abs() < 1e-6);
            assert_eq!(s.sample(0, 0), 0.0);
        }
    }

    #[test]
    fn active_mask_follows_kind() {
        let masks = BlendMasks::build(MaskKind::Spherical);
        assert_eq!(
            masks.mask(TerrainLod::L90m),
            masks.spherical(TerrainLod::L90m)
        );
    }
}
