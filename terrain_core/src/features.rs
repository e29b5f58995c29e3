//! Scale-space feature tracking: edges, ridges and peaks.
//!
//! Every detector works on the same stack of progressively blurred copies of
//! the elevation raster. Each pixel keeps the scale at which its response is
//! strongest; surviving pixels are linked 8-connected into curves.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::{
    raster::{gaussian_blur, gradient, magnitude, Heightfield, Raster},
    stats::Statistics,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeatureKind {
    Peak,
    Edge,
    Ridge,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeaturePoint {
    pub x: u32,
    pub y: u32,
    pub scale: f32,
    pub strength: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub kind: FeatureKind,
    pub points: Vec<FeaturePoint>,
    pub length: f32,
    pub scale: Statistics,
    pub strength: Statistics,
}

impl Feature {
    pub fn from_points(kind: FeatureKind, points: Vec<FeaturePoint>) -> Self {
        let scale = Statistics::from_values(points.iter().map(|p| p.scale as f64));
        let strength = Statistics::from_values(points.iter().map(|p| p.strength as f64));
        Self {
            kind,
            length: points.len() as f32,
            points,
            scale,
            strength,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FeatureSet {
    pub peaks: Vec<Feature>,
    pub edges: Vec<Feature>,
    pub ridges: Vec<Feature>,
}

/// Aggregate over one feature list: curve length, per-curve mean scale and
/// per-curve mean strength.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FeatureSummary {
    pub length: Statistics,
    pub scale: Statistics,
    pub strength: Statistics,
}

impl FeatureSummary {
    pub fn of(features: &[Feature]) -> Self {
        Self {
            length: Statistics::from_values(features.iter().map(|f| f.length as f64)),
            scale: Statistics::from_values(features.iter().map(|f| f.scale.mean)),
            strength: Statistics::from_values(features.iter().map(|f| f.strength.mean)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub edges: bool,
    pub ridges: bool,
    pub peaks: bool,
    /// Scale-space levels; level `s` is blurred with sigma `2^(s-1)` (level 0 is raw).
    pub scales: Vec<u32>,
    /// Responses below this quantile of a detector's responses are discarded.
    pub strength_quantile: f32,
    pub min_curve_length: usize,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            edges: true,
            ridges: false,
            peaks: false,
            scales: vec![0, 1, 2, 3],
            strength_quantile: 0.9,
            min_curve_length: 2,
        }
    }
}

pub fn scale_sigma(scale: u32) -> f32 {
    if scale == 0 {
        0.0
    } else {
        (1u32 << (scale - 1)) as f32
    }
}

struct ScaleLevel {
    scale: u32,
    sigma: f32,
    elevation: Heightfield,
}

#[derive(Clone, Copy, Default)]
struct Response {
    scale: f32,
    strength: f32,
}

pub fn detect_features(
    elevation: &Heightfield,
    meters_per_sample: f32,
    config: &FeatureConfig,
) -> FeatureSet {
    let mut set = FeatureSet::default();
    if elevation.width() < 3 || elevation.height() < 3 {
        return set;
    }
    let stack: Vec<ScaleLevel> = config
        .scales
        .iter()
        .map(|&scale| {
            let sigma = scale_sigma(scale);
            ScaleLevel {
                scale,
                sigma,
                elevation: gaussian_blur(elevation, sigma),
            }
        })
        .collect();

    if config.edges {
        let responses = edge_responses(&stack, meters_per_sample);
        set.edges = link_curves(FeatureKind::Edge, &responses, config);
    }
    if config.ridges {
        let responses = ridge_responses(&stack, meters_per_sample);
        set.ridges = link_curves(FeatureKind::Ridge, &responses, config);
    }
    if config.peaks {
        let responses = peak_responses(&stack);
        set.peaks = isolated_points(FeatureKind::Peak, &responses, config);
    }
    set
}

/// Gradient maxima along the gradient direction, strongest scale per pixel.
fn edge_responses(stack: &[ScaleLevel], mps: f32) -> Raster<Option<Response>> {
    let Some(first) = stack.first() else {
        return Raster::empty();
    };
    let w = first.elevation.width();
    let h = first.elevation.height();
    let mut best: Raster<Option<Response>> = Raster::filled(w, h, None);
    for level in stack {
        let grad = gradient(&level.elevation, mps);
        let norm = (1.0 + level.sigma).sqrt();
        for y in 1..h - 1 {
            for x in 1..w - 1 {
                let g = grad.sample(x, y);
                let m = magnitude(g);
                if m <= f32::EPSILON {
                    continue;
                }
                let (dx, dy) = quantized_direction(g);
                let ahead = magnitude(grad.clamped(x as isize + dx, y as isize + dy));
                let behind = magnitude(grad.clamped(x as isize - dx, y as isize - dy));
                if m < ahead || m < behind {
                    continue;
                }
                offer(&mut best, x, y, level.scale, m * norm);
            }
        }
    }
    best
}

/// Strong negative curvature across the ridge line.
fn ridge_responses(stack: &[ScaleLevel], mps: f32) -> Raster<Option<Response>> {
    let Some(first) = stack.first() else {
        return Raster::empty();
    };
    let w = first.elevation.width();
    let h = first.elevation.height();
    let mut best: Raster<Option<Response>> = Raster::filled(w, h, None);
    let inv = 1.0 / (mps * mps);
    for level in stack {
        let e = &level.elevation;
        for y in 1..h - 1 {
            for x in 1..w - 1 {
                let c = e.sample(x, y);
                let hxx = (e.sample(x + 1, y) - 2.0 * c + e.sample(x - 1, y)) * inv;
                let hyy = (e.sample(x, y + 1) - 2.0 * c + e.sample(x, y - 1)) * inv;
                let hxy = (e.sample(x + 1, y + 1) - e.sample(x + 1, y - 1)
                    - e.sample(x - 1, y + 1)
                    + e.sample(x - 1, y - 1))
                    * 0.25
                    * inv;
                let half_trace = 0.5 * (hxx + hyy);
                let disc = (0.25 * (hxx - hyy) * (hxx - hyy) + hxy * hxy).sqrt();
                let lambda = half_trace - disc;
                if lambda >= 0.0 {
                    continue;
                }
                // Eigenvector of the most negative eigenvalue points across the ridge.
                let across = if hxy.abs() > f32::EPSILON {
                    [lambda - hyy, hxy]
                } else if hxx < hyy {
                    [1.0, 0.0]
                } else {
                    [0.0, 1.0]
                };
                let (dx, dy) = quantized_direction(across);
                let ahead = e.clamped(x as isize + dx, y as isize + dy);
                let behind = e.clamped(x as isize - dx, y as isize - dy);
                if c < ahead || c < behind {
                    continue;
                }
                let strength = -lambda * (1.0 + level.sigma * level.sigma);
                offer(&mut best, x, y, level.scale, strength);
            }
        }
    }
    best
}

/// Strict 8-neighbourhood maxima; strength is height above the neighbour mean.
fn peak_responses(stack: &[ScaleLevel]) -> Raster<Option<Response>> {
    let Some(first) = stack.first() else {
        return Raster::empty();
    };
    let w = first.elevation.width();
    let h = first.elevation.height();
    let mut best: Raster<Option<Response>> = Raster::filled(w, h, None);
    for level in stack {
        let e = &level.elevation;
        for y in 1..h - 1 {
            for x in 1..w - 1 {
                let c = e.sample(x, y);
                let mut sum = 0.0;
                let mut is_max = true;
                for (dx, dy) in NEIGHBORS8 {
                    let v = e.sample((x as isize + dx) as usize, (y as isize + dy) as usize);
                    sum += v;
                    if v >= c {
                        is_max = false;
                    }
                }
                if is_max {
                    offer(&mut best, x, y, level.scale, c - sum / 8.0);
                }
            }
        }
    }
    best
}

const NEIGHBORS8: [(isize, isize); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (-1, 0),
    (1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
];

fn offer(best: &mut Raster<Option<Response>>, x: usize, y: usize, scale: u32, strength: f32) {
    let keep = match best.sample(x, y) {
        Some(existing) => strength > existing.strength,
        None => true,
    };
    if keep {
        best.set(
            x,
            y,
            Some(Response {
                scale: scale as f32,
                strength,
            }),
        );
    }
}

fn quantized_direction(v: [f32; 2]) -> (isize, isize) {
    let angle = v[1].atan2(v[0]);
    let octant = (angle / std::f32::consts::FRAC_PI_4).round() as i32;
    match octant.rem_euclid(8) {
        0 => (1, 0),
        1 => (1, 1),
        2 => (0, 1),
        3 => (-1, 1),
        4 => (-1, 0),
        5 => (-1, -1),
        6 => (0, -1),
        _ => (1, -1),
    }
}

fn strength_threshold(responses: &Raster<Option<Response>>, q: f32) -> f32 {
    let mut strengths: Vec<f32> = responses
        .values()
        .iter()
        .flatten()
        .map(|r| r.strength)
        .collect();
    strengths.sort_by(|a, b| a.total_cmp(b));
    quantile(&strengths, q).max(f32::EPSILON)
}

fn quantile(values: &[f32], q: f32) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let idx = ((values.len() - 1) as f32 * q.clamp(0.0, 1.0)).round() as usize;
    values[idx]
}

fn link_curves(
    kind: FeatureKind,
    responses: &Raster<Option<Response>>,
    config: &FeatureConfig,
) -> Vec<Feature> {
    let threshold = strength_threshold(responses, config.strength_quantile);
    let w = responses.width();
    let h = responses.height();
    let strong = |x: usize, y: usize| -> Option<Response> {
        responses.sample(x, y).filter(|r| r.strength >= threshold)
    };

    let mut visited = vec![false; w * h];
    let mut features = Vec::new();
    let mut queue = VecDeque::new();
    for y in 0..h {
        for x in 0..w {
            if visited[y * w + x] || strong(x, y).is_none() {
                continue;
            }
            visited[y * w + x] = true;
            queue.push_back((x, y));
            let mut points = Vec::new();
            while let Some((cx, cy)) = queue.pop_front() {
                if let Some(r) = strong(cx, cy) {
                    points.push(FeaturePoint {
                        x: cx as u32,
                        y: cy as u32,
                        scale: r.scale,
                        strength: r.strength,
                    });
                }
                for (dx, dy) in NEIGHBORS8 {
                    let nx = cx as isize + dx;
                    let ny = cy as isize + dy;
                    if !responses.contains(nx, ny) {
                        continue;
                    }
                    let (nx, ny) = (nx as usize, ny as usize);
                    if !visited[ny * w + nx] && strong(nx, ny).is_some() {
                        visited[ny * w + nx] = true;
                        queue.push_back((nx, ny));
                    }
                }
            }
            if points.len() >= config.min_curve_length {
                features.push(Feature::from_points(kind, points));
            }
        }
    }
    features
}

fn isolated_points(
    kind: FeatureKind,
    responses: &Raster<Option<Response>>,
    config: &FeatureConfig,
) -> Vec<Feature> {
    let threshold = strength_threshold(responses, config.strength_quantile);
    let w = responses.width();
    let mut features = Vec::new();
    for (i, r) in responses.values().iter().enumerate() {
        if let Some(r) = r.filter(|r| r.strength >= threshold) {
            features.push(Feature::from_points(
                kind,
                vec![FeaturePoint {
                    x: (i % w) as u32,
                    y: (i / w) as u32,
                    scale: r.scale,
                    strength: r.strength,
                }],
            ));
        }
    }
    features
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step_field() -> Heightfield {
        Raster::from_fn(32, 32, |x, _| if x < 16 { 0.0 } else { 100.0 })
    }

    #[test]
    fn flat_terrain_has_no_features() {
        let hf = Raster::filled(24, 24, 10.0f32);
        let config = FeatureConfig {
            ridges: true,
            peaks: true,
            ..FeatureConfig::default()
        };
        let set = detect_features(&hf, 30.0, &config);
        assert!(set.edges.is_empty());
        assert!(set.ridges.is_empty());
        assert!(set.peaks.is_empty());
    }

    #[test]
    fn step_produces_a_vertical_edge() {
        let set = detect_features(&step_field(), 30.0, &FeatureConfig::default());
        assert!(!set.edges.is_empty());
        let longest = set
            .edges
            .iter()
            .max_by(|a, b| a.length.total_cmp(&b.length))
            .unwrap();
        assert!(longest.length >= 20.0);
        assert!(longest.points.iter().all(|p| (14..=17).contains(&p.x)));
        assert_eq!(longest.length as usize, longest.points.len());
    }

    #[test]
    fn single_bump_yields_one_peak() {
        let hf = Raster::from_fn(21, 21, |x, y| {
            let dx = x as f32 - 10.0;
            let dy = y as f32 - 10.0;
            100.0 * (-(dx * dx + dy * dy) / 18.0).exp()
        });
        let config = FeatureConfig {
            edges: false,
            peaks: true,
            strength_quantile: 0.0,
            ..FeatureConfig::default()
        };
        let set = detect_features(&hf, 30.0, &config);
        assert_eq!(set.peaks.len(), 1);
        assert_eq!((set.peaks[0].points[0].x, set.peaks[0].points[0].y), (10, 10));
    }

    #[test]
    fn summary_averages_curves() {
        let a = Feature::from_points(
            FeatureKind::Edge,
            vec![
                FeaturePoint { x: 0, y: 0, scale: 1.0, strength: 2.0 },
                FeaturePoint { x: 1, y: 0, scale: 3.0, strength: 4.0 },
            ],
        );
        let b = Feature::from_points(
            FeatureKind::Edge,
            vec![FeaturePoint { x: 5, y: 5, scale: 0.0, strength: 1.0 }],
        );
        let summary = FeatureSummary::of(&[a, b]);
        assert_eq!(summary.length.mean, 1.5);
        assert_eq!(summary.scale.mean, 1.0);
        assert_eq!(summary.strength.mean, 2.0);
    }
}
