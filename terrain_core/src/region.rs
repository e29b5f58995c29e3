//! Region segmentation of terrain-type rasters and the boundary distance field.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, PoisonError},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    lod::{nearest_coarser, nearest_finer, scale_factor, LodTable, TerrainLod},
    raster::{neighbors4, resample_nearest, Bounds, Raster},
};

pub type TerrainTypeId = u32;
/// One-based region label; `0` marks void pixels.
pub type RegionId = u32;

pub const VOID_TERRAIN_TYPE: TerrainTypeId = 0;
pub const NO_REGION: RegionId = 0;

#[derive(Debug, Error, PartialEq)]
pub enum RegionError {
    #[error(
        "terrain type {id} at ({x}, {y}) is outside the terrain library (size {library_size})"
    )]
    TerrainTypeOutOfRange {
        id: TerrainTypeId,
        x: usize,
        y: usize,
        library_size: usize,
    },
    #[error("region {region} is out of range ({count} regions)")]
    RegionOutOfRange { region: RegionId, count: usize },
    #[error("no map rasterization is available at {0}")]
    Unavailable(TerrainLod),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionInfo {
    pub id: RegionId,
    pub terrain_type: TerrainTypeId,
    pub bounds: Bounds,
    pub seed: (usize, usize),
    pub area: usize,
}

#[derive(Debug, Clone)]
pub struct RegionMask {
    pub bounds: Bounds,
    pub weights: Raster<f32>,
}

/// One analyzed LOD of a map rasterization.
#[derive(Debug, Clone)]
pub struct RegionMap {
    lod: TerrainLod,
    type_ids: Raster<TerrainTypeId>,
    region_ids: Raster<RegionId>,
    regions: Vec<RegionInfo>,
    boundary_distances: Raster<u32>,
    multiple_types: bool,
}

impl RegionMap {
    /// Validate every type ID against the library and label the regions.
    pub fn analyze(
        type_ids: Raster<TerrainTypeId>,
        lod: TerrainLod,
        library_size: usize,
    ) -> Result<Self, RegionError> {
        let multiple_types = validate_type_ids(&type_ids, library_size)?;
        let (region_ids, regions) = find_regions(&type_ids, multiple_types);
        let boundary_distances = if multiple_types {
            let across = sweep(&type_ids, true);
            let down = sweep(&type_ids, false);
            Raster::new(
                type_ids.width(),
                type_ids.height(),
                across
                    .values()
                    .iter()
                    .zip(down.values())
                    .map(|(&a, &b)| a.min(b))
                    .collect(),
            )
        } else {
            Raster::filled(type_ids.width(), type_ids.height(), u32::MAX)
        };

        tracing::debug!(
            target: "terrain_synth::region",
            lod = %lod,
            width = type_ids.width(),
            height = type_ids.height(),
            regions = regions.len(),
            multiple_types,
            "region_map.analyzed"
        );

        Ok(Self {
            lod,
            type_ids,
            region_ids,
            regions,
            boundary_distances,
            multiple_types,
        })
    }

    /// Single-type map covering `width × height`, handy for patterns without sub-regions.
    pub fn uniform(
        width: usize,
        height: usize,
        terrain_type: TerrainTypeId,
        lod: TerrainLod,
        library_size: usize,
    ) -> Result<Self, RegionError> {
        Self::analyze(Raster::filled(width, height, terrain_type), lod, library_size)
    }

    pub fn lod(&self) -> TerrainLod {
        self.lod
    }

    pub fn width(&self) -> usize {
        self.type_ids.width()
    }

    pub fn height(&self) -> usize {
        self.type_ids.height()
    }

    pub fn type_ids(&self) -> &Raster<TerrainTypeId> {
        &self.type_ids
    }

    pub fn region_ids(&self) -> &Raster<RegionId> {
        &self.region_ids
    }

    pub fn boundary_distances(&self) -> &Raster<u32> {
        &self.boundary_distances
    }

    pub fn has_multiple_types(&self) -> bool {
        self.multiple_types
    }

    pub fn regions(&self) -> &[RegionInfo] {
        &self.regions
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    pub fn region_at(&self, x: usize, y: usize) -> Option<RegionId> {
        match self.region_ids.sample(x, y) {
            NO_REGION => None,
            id => Some(id),
        }
    }

    pub fn terrain_type_at(&self, x: usize, y: usize) -> TerrainTypeId {
        self.type_ids.sample(x, y)
    }

    pub fn non_void_count(&self) -> usize {
        self.type_ids
            .values()
            .iter()
            .filter(|&&id| id != VOID_TERRAIN_TYPE)
            .count()
    }

    pub fn region(&self, region: RegionId) -> Result<&RegionInfo, RegionError> {
        region
            .checked_sub(1)
            .and_then(|i| self.regions.get(i as usize))
            .ok_or(RegionError::RegionOutOfRange {
                region,
                count: self.regions.len(),
            })
    }

    pub fn region_terrain_type(&self, region: RegionId) -> Result<TerrainTypeId, RegionError> {
        self.region(region).map(|r| r.terrain_type)
    }

    pub fn region_bounds(&self, region: RegionId) -> Result<Bounds, RegionError> {
        self.region(region).map(|r| r.bounds)
    }

    pub fn region_seed(&self, region: RegionId) -> Result<(usize, usize), RegionError> {
        self.region(region).map(|r| r.seed)
    }

    pub fn region_area(&self, region: RegionId) -> Result<usize, RegionError> {
        self.region(region).map(|r| r.area)
    }

    /// Soft membership mask over the region bounds grown by half the border
    /// width: 1 deep inside, 0.5 on the boundary, fading to 0 outside.
    pub fn region_mask(&self, region: RegionId, border_width: u32) -> Result<RegionMask, RegionError> {
        let info = self.region(region)?;
        let border = border_width.max(1);
        let bounds = info
            .bounds
            .expanded((border / 2) as isize)
            .clipped(&self.type_ids.bounds());
        let scale = 2.0 / border as f32;
        let weights = Raster::from_fn(bounds.width(), bounds.height(), |x, y| {
            let px = (bounds.x0 + x as isize) as usize;
            let py = (bounds.y0 + y as isize) as usize;
            let d = self.boundary_distances.sample(px, py) as f32;
            if self.region_ids.sample(px, py) == region {
                0.5 * (1.0 + d * scale).min(2.0)
            } else {
                0.5 * (1.0 - d * scale).max(0.0)
            }
        });
        Ok(RegionMask { bounds, weights })
    }
}

fn validate_type_ids(
    type_ids: &Raster<TerrainTypeId>,
    library_size: usize,
) -> Result<bool, RegionError> {
    let Some(&reference) = type_ids.values().first() else {
        return Ok(false);
    };
    let mut multiple_types = false;
    let w = type_ids.width();
    for (i, &id) in type_ids.values().iter().enumerate() {
        if id as usize >= library_size {
            return Err(RegionError::TerrainTypeOutOfRange {
                id,
                x: i % w,
                y: i / w,
                library_size,
            });
        }
        if id != reference {
            multiple_types = true;
        }
    }
    Ok(multiple_types)
}

fn find_regions(
    type_ids: &Raster<TerrainTypeId>,
    multiple_types: bool,
) -> (Raster<RegionId>, Vec<RegionInfo>) {
    let w = type_ids.width();
    let h = type_ids.height();
    let mut regions = Vec::new();

    if !multiple_types {
        let uniform = type_ids.values().first().copied().unwrap_or(VOID_TERRAIN_TYPE);
        if uniform == VOID_TERRAIN_TYPE {
            return (Raster::filled(w, h, NO_REGION), regions);
        }
        regions.push(RegionInfo {
            id: 1,
            terrain_type: uniform,
            bounds: type_ids.bounds(),
            seed: (0, 0),
            area: w * h,
        });
        return (Raster::filled(w, h, 1), regions);
    }

    let idx = |x: usize, y: usize| -> usize { y * w + x };
    let mut labels = vec![NO_REGION; w * h];
    let mut queue = VecDeque::new();
    for y in 0..h {
        for x in 0..w {
            let terrain_type = type_ids.sample(x, y);
            if terrain_type == VOID_TERRAIN_TYPE || labels[idx(x, y)] != NO_REGION {
                continue;
            }
            let id = regions.len() as RegionId + 1;
            let mut bounds = Bounds::point(x as isize, y as isize);
            let mut area = 0usize;
            labels[idx(x, y)] = id;
            queue.push_back((x, y));
            while let Some((cx, cy)) = queue.pop_front() {
                area += 1;
                bounds.include(cx as isize, cy as isize);
                for (nx, ny) in neighbors4(cx, cy, w, h) {
                    let ni = idx(nx, ny);
                    if labels[ni] == NO_REGION && type_ids.sample(nx, ny) == terrain_type {
                        labels[ni] = id;
                        queue.push_back((nx, ny));
                    }
                }
            }
            regions.push(RegionInfo {
                id,
                terrain_type,
                bounds,
                seed: (x, y),
                area,
            });
        }
    }
    (Raster::new(w, h, labels), regions)
}

/// Distance since the type ID last changed, swept both ways along one axis and
/// then relaxed across the other axis through same-type neighbours.
fn sweep(type_ids: &Raster<TerrainTypeId>, along_x: bool) -> Raster<u32> {
    let w = type_ids.width();
    let h = type_ids.height();
    let (lines, len) = if along_x { (h, w) } else { (w, h) };
    let pos = |line: usize, i: usize| -> (usize, usize) {
        if along_x {
            (i, line)
        } else {
            (line, i)
        }
    };
    let mut dist = Raster::filled(w, h, u32::MAX);
    if lines == 0 || len == 0 {
        return dist;
    }

    for line in 0..lines {
        let (sx, sy) = pos(line, 0);
        let mut previous = type_ids.sample(sx, sy);
        let mut distance = u32::MAX;
        let mut have_reference = false;
        for i in 0..len {
            let (x, y) = pos(line, i);
            let id = type_ids.sample(x, y);
            if id != previous {
                previous = id;
                have_reference = true;
                distance = 0;
            } else if have_reference {
                distance += 1;
            }
            dist.set(x, y, distance);
        }

        let (ex, ey) = pos(line, len - 1);
        previous = type_ids.sample(ex, ey);
        distance = u32::MAX;
        have_reference = false;
        for i in (0..len).rev() {
            let (x, y) = pos(line, i);
            let id = type_ids.sample(x, y);
            if id != previous {
                previous = id;
                have_reference = true;
                distance = 0;
            } else if have_reference {
                distance += 1;
            }
            if distance < dist.sample(x, y) {
                dist.set(x, y, distance);
            }
        }
    }

    let relax = |line: usize, prev_line: usize, dist: &mut Raster<u32>| {
        for i in 0..len {
            let (x, y) = pos(line, i);
            let (px, py) = pos(prev_line, i);
            if type_ids.sample(x, y) == type_ids.sample(px, py) {
                let candidate = dist.sample(px, py).saturating_add(1);
                if candidate < dist.sample(x, y) {
                    dist.set(x, y, candidate);
                }
            }
        }
    };
    for line in 1..lines {
        relax(line, line - 1, &mut dist);
    }
    for line in (0..lines - 1).rev() {
        relax(line, line + 1, &mut dist);
    }
    dist
}

/// Terrain-type raster with lazily derived LODs.
#[derive(Debug)]
pub struct MapRasterization {
    library_size: usize,
    lods: Mutex<LodTable<Option<Arc<RegionMap>>>>,
}

impl MapRasterization {
    pub fn new(
        type_ids: Raster<TerrainTypeId>,
        lod: TerrainLod,
        library_size: usize,
    ) -> Result<Self, RegionError> {
        let map = RegionMap::analyze(type_ids, lod, library_size)?;
        let mut lods: LodTable<Option<Arc<RegionMap>>> = LodTable::default();
        lods[lod] = Some(Arc::new(map));
        Ok(Self {
            library_size,
            lods: Mutex::new(lods),
        })
    }

    /// Wrap an already analyzed map as the sole loaded level.
    pub fn from_map(map: Arc<RegionMap>, library_size: usize) -> Self {
        let mut lods: LodTable<Option<Arc<RegionMap>>> = LodTable::default();
        let lod = map.lod();
        lods[lod] = Some(map);
        Self {
            library_size,
            lods: Mutex::new(lods),
        }
    }

    pub fn is_loaded(&self, lod: TerrainLod) -> bool {
        self.lods.lock().unwrap_or_else(PoisonError::into_inner)[lod].is_some()
    }

    /// The analyzed map at `lod`, resampled from the nearest loaded level
    /// (finer preferred) on first access.
    pub fn at(&self, lod: TerrainLod) -> Result<Arc<RegionMap>, RegionError> {
        let mut lods = self.lods.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(map) = &lods[lod] {
            return Ok(Arc::clone(map));
        }
        let reference = nearest_finer(lod, |l| lods[l].is_some())
            .or_else(|| nearest_coarser(lod, |l| lods[l].is_some()))
            .ok_or(RegionError::Unavailable(lod))?;
        let source = lods[reference]
            .as_ref()
            .map(Arc::clone)
            .ok_or(RegionError::Unavailable(lod))?;
        tracing::debug!(
            target: "terrain_synth::region",
            lod = %lod,
            from = %reference,
            "map_rasterization.resampled"
        );
        let ids = resample_nearest(source.type_ids(), scale_factor(reference, lod));
        let map = Arc::new(RegionMap::analyze(ids, lod, self.library_size)?);
        lods[lod] = Some(Arc::clone(&map));
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids_from_rows(rows: &[&[u32]]) -> Raster<TerrainTypeId> {
        let h = rows.len();
        let w = rows[0].len();
        Raster::from_fn(w, h, |x, y| rows[y][x])
    }

    #[test]
    fn uniform_map_is_single_region() {
        let map = RegionMap::uniform(8, 5, 2, TerrainLod::L30m, 3).unwrap();
        assert_eq!(map.region_count(), 1);
        assert_eq!(map.region_area(1), Ok(40));
        assert_eq!(map.region_terrain_type(1), Ok(2));
        assert!(map.boundary_distances().values().iter().all(|&d| d == u32::MAX));
    }

    #[test]
    fn blobs_are_labelled_four_connected() {
        let ids = ids_from_rows(&[
            &[1, 1, 0, 2],
            &[1, 0, 2, 2],
            &[0, 1, 1, 0],
            &[2, 0, 1, 1],
        ]);
        let map = RegionMap::analyze(ids, TerrainLod::L90m, 3).unwrap();
        // {1,1,1 top-left}, {2 x3 top-right}, {1 x4 center}, {2 bottom-left}
        assert_eq!(map.region_count(), 4);
        let total: usize = map.regions().iter().map(|r| r.area).sum();
        assert_eq!(total, map.non_void_count());
        assert_eq!(map.region_seed(3), Ok((1, 2)));
        assert_eq!(map.region_bounds(3), Ok(Bounds::new(1, 2, 4, 4)));
        assert_eq!(map.region_at(2, 0), None);
        assert_eq!(map.region_at(3, 1), Some(2));
    }

    #[test]
    fn out_of_range_type_is_rejected() {
        let ids = ids_from_rows(&[&[1, 1], &[1, 7]]);
        let err = RegionMap::analyze(ids, TerrainLod::L30m, 3).unwrap_err();
        assert_eq!(
            err,
            RegionError::TerrainTypeOutOfRange {
                id: 7,
                x: 1,
                y: 1,
                library_size: 3
            }
        );
    }

    #[test]
    fn region_accessors_are_bounds_checked() {
        let map = RegionMap::uniform(4, 4, 1, TerrainLod::L30m, 2).unwrap();
        assert_eq!(
            map.region_area(0),
            Err(RegionError::RegionOutOfRange { region: 0, count: 1 })
        );
        assert!(map.region_mask(2, 4).is_err());
    }

    #[test]
    fn distances_grow_away_from_boundary() {
        let ids = Raster::from_fn(10, 3, |x, _| if x < 5 { 1 } else { 2 });
        let map = RegionMap::analyze(ids, TerrainLod::L30m, 3).unwrap();
        let d = map.boundary_distances();
        assert_eq!(d.sample(5, 1), 0);
        assert_eq!(d.sample(4, 1), 0);
        assert_eq!(d.sample(3, 1), 1);
        assert_eq!(d.sample(0, 1), 4);
        assert_eq!(d.sample(9, 1), 4);
    }

    #[test]
    fn region_mask_fades_across_boundary() {
        let ids = Raster::from_fn(12, 4, |x, _| if x < 6 { 1 } else { 2 });
        let map = RegionMap::analyze(ids, TerrainLod::L30m, 3).unwrap();
        let mask = map.region_mask(1, 4).unwrap();
        assert_eq!(mask.bounds, Bounds::new(0, 0, 8, 4));
        let w = &mask.weights;
        assert_eq!(w.sample(0, 0), 1.0);
        assert_eq!(w.sample(5, 0), 0.5);
        assert_eq!(w.sample(6, 0), 0.5);
        assert_eq!(w.sample(7, 0), 0.25);
    }

    #[test]
    fn rasterization_resamples_missing_lods() {
        let ids = Raster::from_fn(9, 9, |x, _| if x < 3 { 1 } else { 2 });
        let raster = MapRasterization::new(ids, TerrainLod::L30m, 3).unwrap();
        assert!(!raster.is_loaded(TerrainLod::L90m));
        let coarse = raster.at(TerrainLod::L90m).unwrap();
        assert_eq!((coarse.width(), coarse.height()), (3, 3));
        assert_eq!(coarse.region_count(), 2);
        let fine = raster.at(TerrainLod::L10m).unwrap();
        assert_eq!(fine.width(), 27);
        assert!(raster.is_loaded(TerrainLod::L10m));
    }

    #[test]
    fn wrapped_map_is_the_only_loaded_level() {
        let ids = Raster::from_fn(6, 6, |_, y| if y < 3 { 1 } else { 2 });
        let map = Arc::new(RegionMap::analyze(ids, TerrainLod::L90m, 3).unwrap());
        let raster = MapRasterization::from_map(Arc::clone(&map), 3);
        assert!(raster.is_loaded(TerrainLod::L90m));
        assert!(!raster.is_loaded(TerrainLod::L30m));
        assert!(Arc::ptr_eq(&raster.at(TerrainLod::L90m).unwrap(), &map));
        assert_eq!(raster.at(TerrainLod::L30m).unwrap().width(), 18);
    }
}
