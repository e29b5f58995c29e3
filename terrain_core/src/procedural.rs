//! Procedural reference terrain for demos, benchmarks and tests.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;

use crate::{
    lod::TerrainLod,
    raster::{Heightfield, Raster},
};

/// Shape of a procedurally generated relief, in meters.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReliefProfile {
    pub base: f32,
    pub amplitude: f32,
    /// Noise cycles per kilometer in the first octave.
    pub frequency: f32,
    pub octaves: u32,
    /// Frequency multiplier between octaves.
    pub lacunarity: f32,
    /// Amplitude multiplier between octaves.
    pub gain: f32,
    /// Kilometers the sampling domain is pushed around by a second noise field.
    pub warp: f32,
    /// Fold the noise into sharp crests.
    pub ridged: bool,
}

impl Default for ReliefProfile {
    fn default() -> Self {
        Self {
            base: 200.0,
            amplitude: 150.0,
            frequency: 0.5,
            octaves: 4,
            lacunarity: 2.0,
            gain: 0.5,
            warp: 0.3,
            ridged: false,
        }
    }
}

impl ReliefProfile {
    pub fn plains() -> Self {
        Self {
            base: 120.0,
            amplitude: 30.0,
            frequency: 0.3,
            octaves: 3,
            gain: 0.4,
            warp: 0.0,
            ..Self::default()
        }
    }

    pub fn hills() -> Self {
        Self::default()
    }

    pub fn mountains() -> Self {
        Self {
            base: 900.0,
            amplitude: 1200.0,
            frequency: 0.8,
            octaves: 5,
            lacunarity: 2.2,
            gain: 0.55,
            warp: 0.6,
            ridged: true,
        }
    }
}

/// `width × height` heightfield at `lod` with the given relief.
pub fn relief_heightfield(
    width: usize,
    height: usize,
    lod: TerrainLod,
    profile: &ReliefProfile,
    seed: u64,
) -> Heightfield {
    let km_per_sample = lod.meters_per_sample() / 1000.0;
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let relief = LatticeNoise::new(profile, &mut rng);
    let warp_x = LatticeNoise::new(profile, &mut rng);
    let warp_y = LatticeNoise::new(profile, &mut rng);
    Raster::from_fn(width, height, |x, y| {
        let mut kx = x as f32 * km_per_sample;
        let mut ky = y as f32 * km_per_sample;
        if profile.warp > 0.0 {
            let f = profile.frequency;
            kx += (warp_x.sample(kx * f, ky * f) - 0.5) * 2.0 * profile.warp;
            ky += (warp_y.sample(kx * f, ky * f) - 0.5) * 2.0 * profile.warp;
        }
        let n = relief.sample(kx * profile.frequency, ky * profile.frequency);
        let shaped = if profile.ridged {
            (1.0 - (n - 0.5).abs() * 2.0).clamp(0.0, 1.0).powf(1.6)
        } else {
            n
        };
        profile.base + shaped * profile.amplitude
    })
}

/// Fractal value noise in `[0, 1]`. Each octave hashes its own lattice and
/// is shifted by a random offset so octaves never share lattice points.
struct LatticeNoise {
    octaves: Vec<(u64, f32, f32)>,
    lacunarity: f32,
    gain: f32,
}

impl LatticeNoise {
    fn new<R: Rng + ?Sized>(profile: &ReliefProfile, rng: &mut R) -> Self {
        let octaves = (0..profile.octaves.max(1))
            .map(|_| (rng.gen(), rng.gen_range(0.0..64.0), rng.gen_range(0.0..64.0)))
            .collect();
        Self {
            octaves,
            lacunarity: profile.lacunarity.max(1.0),
            gain: profile.gain.clamp(0.0, 1.0),
        }
    }

    fn sample(&self, x: f32, y: f32) -> f32 {
        let mut scale = 1.0;
        let mut weight = 1.0;
        let mut total = 0.0;
        let mut weights = 0.0;
        for &(key, ox, oy) in &self.octaves {
            total += weight * lattice_value(x * scale + ox, y * scale + oy, key);
            weights += weight;
            scale *= self.lacunarity;
            weight *= self.gain;
        }
        if weights > 0.0 {
            (total / weights).clamp(0.0, 1.0)
        } else {
            0.5
        }
    }
}

fn lattice_value(x: f32, y: f32, key: u64) -> f32 {
    let (cx, cy) = (x.floor(), y.floor());
    let (ix, iy) = (cx as i64, cy as i64);
    let tx = quintic(x - cx);
    let ty = quintic(y - cy);
    let corner = |dx: i64, dy: i64| lattice_hash(ix + dx, iy + dy, key);
    let top = corner(0, 0) + (corner(1, 0) - corner(0, 0)) * tx;
    let bottom = corner(0, 1) + (corner(1, 1) - corner(0, 1)) * tx;
    top + (bottom - top) * ty
}

/// `6t⁵ − 15t⁴ + 10t³`: zero slope and curvature at the lattice points.
fn quintic(t: f32) -> f32 {
    t * t * t * (t * (t * 6.0 - 15.0) + 10.0)
}

/// SplitMix64 finalizer over the packed lattice coordinates.
fn lattice_hash(x: i64, y: i64, key: u64) -> f32 {
    let mut z = key ^ (x as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ (y as u64).rotate_left(32);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^= z >> 31;
    (z >> 40) as f32 / (1u64 << 24) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relief_stays_within_profile() {
        let profile = ReliefProfile::mountains();
        let field = relief_heightfield(40, 30, TerrainLod::L90m, &profile, 7);
        let (lo, hi) = field.min_max().unwrap();
        assert!(lo >= profile.base - 1e-3);
        assert!(hi <= profile.base + profile.amplitude + 1e-3);
        assert!(hi > lo);
    }

    #[test]
    fn same_seed_same_relief() {
        let profile = ReliefProfile::hills();
        let a = relief_heightfield(16, 16, TerrainLod::L30m, &profile, 3);
        let b = relief_heightfield(16, 16, TerrainLod::L30m, &profile, 3);
        let c = relief_heightfield(16, 16, TerrainLod::L30m, &profile, 4);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn octave_shape_and_warp_change_the_relief() {
        let base = ReliefProfile::hills();
        let reference = relief_heightfield(24, 24, TerrainLod::L90m, &base, 11);
        let rougher = ReliefProfile { gain: 0.9, ..base };
        let unwarped = ReliefProfile { warp: 0.0, ..base };
        assert_ne!(relief_heightfield(24, 24, TerrainLod::L90m, &rougher, 11), reference);
        assert_ne!(relief_heightfield(24, 24, TerrainLod::L90m, &unwarped, 11), reference);
    }

    #[test]
    fn lattice_hash_is_unit_interval() {
        for (x, y) in [(0, 0), (-5, 3), (i64::MAX, i64::MIN), (17, -17)] {
            let v = lattice_hash(x, y, 0xDEAD_BEEF);
            assert!((0.0..1.0).contains(&v), "{v}");
        }
        assert_eq!(quintic(0.0), 0.0);
        assert!((quintic(1.0) - 1.0).abs() < 1e-6);
    }
}
