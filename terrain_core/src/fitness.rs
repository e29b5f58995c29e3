//! Scoring chromosomes against their pattern.

use std::{f32::consts::PI, sync::Arc};

use crate::{
    analysis::{LocalContext, StatCategory},
    chromosome::{Gene, GeneCompatibility, Pattern, TerrainChromosome},
    raster::{gradient, magnitude, rms_difference, Heightfield},
    region::{RegionId, NO_REGION},
    render::render_chromosome,
};

/// Fitness of one region of the pattern's map.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RegionFitness {
    pub region: RegionId,
    pub fitness: f32,
    pub elevation_rms: f32,
    /// Gradient magnitude RMS, elevation change per meter.
    pub slope_rms: f32,
    /// Radians, over pixels where both surfaces have a defined gradient.
    pub angle_rms: f32,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FitnessMeasures {
    pub overall: f32,
    /// Population-relative fitness, set by the population after evaluation.
    pub normalized: f32,
    pub rms: f32,
    pub regions: Vec<RegionFitness>,
}

/// `max(0, 1 − log10(1 + rms) / k)`.
pub fn fitness_from_rms(rms: f32, log_constant: f32) -> f32 {
    if !rms.is_finite() {
        return 0.0;
    }
    let k = log_constant.max(f32::EPSILON);
    (1.0 - (1.0 + rms.max(0.0)).log10() / k).max(0.0)
}

/// Render `chromosome`, score it against its pattern and refresh every
/// gene's compatibility. Returns the overall fitness.
pub fn evaluate(chromosome: &mut TerrainChromosome, log_constant: f32) -> f32 {
    let pattern = Arc::clone(chromosome.pattern());
    let rendered = render_chromosome(chromosome);
    let rms = rms_difference(&rendered, pattern.elevation());
    let overall = fitness_from_rms(rms, log_constant);
    let regions = region_fitness(&pattern, &rendered, log_constant);

    let scales = CompatibilityScales::for_pattern(&pattern);
    for gene in chromosome.genes_mut() {
        gene.compatibility = slot_compatibility(gene, &pattern, scales);
    }

    chromosome.set_rendered(rendered);
    *chromosome.fitness_mut() = FitnessMeasures {
        overall,
        normalized: overall,
        rms,
        regions,
    };
    overall
}

#[derive(Debug, Default, Clone, Copy)]
struct RegionErrors {
    pixels: u64,
    elevation: f64,
    slope: f64,
    angle_pixels: u64,
    angle: f64,
}

fn region_fitness(pattern: &Pattern, rendered: &Heightfield, log_constant: f32) -> Vec<RegionFitness> {
    let map = pattern.map();
    if map.region_count() == 0 || !rendered.same_size(pattern.elevation()) {
        return Vec::new();
    }
    let mps = pattern.lod().meters_per_sample();
    let rendered_gradient = gradient(rendered, mps);
    let pattern_gradient = &pattern.analysis().gradient;
    if !pattern_gradient.same_size(rendered) {
        return Vec::new();
    }

    let mut errors = vec![RegionErrors::default(); map.region_count()];
    let ids = map.region_ids();
    for (i, &region) in ids.values().iter().enumerate() {
        if region == NO_REGION {
            continue;
        }
        let Some(acc) = errors.get_mut(region as usize - 1) else {
            continue;
        };
        let de = (rendered.values()[i] - pattern.elevation().values()[i]) as f64;
        let g = rendered_gradient.values()[i];
        let p = pattern_gradient.values()[i];
        let (gm, pm) = (magnitude(g), magnitude(p));
        let ds = (gm - pm) as f64;
        acc.pixels += 1;
        acc.elevation += de * de;
        acc.slope += ds * ds;
        if gm > f32::EPSILON && pm > f32::EPSILON {
            let da = angle_between(g, p) as f64;
            acc.angle_pixels += 1;
            acc.angle += da * da;
        }
    }

    errors
        .iter()
        .enumerate()
        .map(|(i, acc)| {
            let region = i as RegionId + 1;
            let rms = |sum: f64, n: u64| if n == 0 { 0.0 } else { (sum / n as f64).sqrt() as f32 };
            let elevation_rms = rms(acc.elevation, acc.pixels);
            let slope_rms = rms(acc.slope, acc.pixels);
            let angle_rms = rms(acc.angle, acc.angle_pixels);
            let weights = pattern.region_weights(region);
            let we = weights[StatCategory::Elevation.index()] as f32;
            let ws = weights[StatCategory::Slope.index()] as f32;
            let fe = fitness_from_rms(elevation_rms, log_constant);
            let fs = fitness_from_rms(slope_rms * mps, log_constant);
            let fitness = if we + ws > 0.0 {
                (we * fe + ws * fs) / (we + ws)
            } else {
                fe
            };
            RegionFitness {
                region,
                fitness,
                elevation_rms,
                slope_rms,
                angle_rms,
            }
        })
        .collect()
}

/// Unsigned angle between two vectors, in `[0, π]`.
fn angle_between(a: [f32; 2], b: [f32; 2]) -> f32 {
    let cross = a[0] * b[1] - a[1] * b[0];
    let dot = a[0] * b[0] + a[1] * b[1];
    cross.atan2(dot).abs()
}

/// Normalizers for gene compatibility, derived once per pattern.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompatibilityScales {
    pub gradient: f32,
    pub elevation: f32,
}

impl CompatibilityScales {
    pub fn for_pattern(pattern: &Pattern) -> Self {
        let global = pattern.global();
        Self {
            gradient: ((global.slope.mean * 20.0) as f32).max(1e-3),
            elevation: (global.elevation.max.abs().max(global.elevation.min.abs()) as f32).max(1.0),
        }
    }
}

/// Compatibility of a gene, as currently transformed, with the pattern slot
/// at its target center.
pub fn slot_compatibility(
    gene: &Gene,
    pattern: &Pattern,
    scales: CompatibilityScales,
) -> GeneCompatibility {
    let (tx, ty) = gene.target_center();
    match (gene.transformed_context(), pattern.context_at(tx, ty)) {
        (Some(candidate), Some(slot)) => gene_compatibility(&candidate, &slot, scales),
        _ => GeneCompatibility {
            overall: 0.0,
            ..GeneCompatibility::default()
        },
    }
}

/// Average of six normalized differences between a candidate patch and the
/// slot it fills: gradient magnitude, gradient angle, elevation mean, both
/// ends of the elevation range, and slope-range overshoot.
pub fn gene_compatibility(
    candidate: &LocalContext,
    slot: &LocalContext,
    scales: CompatibilityScales,
) -> GeneCompatibility {
    let unit = |v: f32| if v.is_finite() { v.clamp(0.0, 1.0) } else { 1.0 };

    let gm = magnitude(candidate.gradient_mean);
    let sm = magnitude(slot.gradient_mean);
    let gradient_magnitude = unit((gm - sm).abs() / scales.gradient);
    let gradient_angle = if gm > f32::EPSILON && sm > f32::EPSILON {
        unit(angle_between(candidate.gradient_mean, slot.gradient_mean) / PI)
    } else {
        0.0
    };
    let elevation_mean = unit((candidate.elevation_mean - slot.elevation_mean).abs() / scales.elevation);
    let elevation_min =
        unit((candidate.elevation_range[0] - slot.elevation_range[0]).abs() / scales.elevation);
    let elevation_max =
        unit((candidate.elevation_range[1] - slot.elevation_range[1]).abs() / scales.elevation);

    let [lo, hi] = slot.slope_range;
    let mut overshoot = 0.0;
    if candidate.slope_range[0] < lo {
        overshoot += lo - candidate.slope_range[0];
    }
    if candidate.slope_range[1] > hi {
        overshoot += candidate.slope_range[1] - hi;
    }
    let slope = unit(overshoot / (hi - lo).max(1e-3));

    let sum = gradient_magnitude + gradient_angle + elevation_mean + elevation_min + elevation_max + slope;
    GeneCompatibility {
        overall: 1.0 - sum / 6.0,
        gradient_magnitude,
        gradient_angle,
        elevation_mean,
        elevation_min,
        elevation_max,
        slope,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(mean: f32, gradient: [f32; 2]) -> LocalContext {
        LocalContext {
            elevation_mean: mean,
            gradient_mean: gradient,
            elevation_range: [mean - 5.0, mean + 5.0],
            slope_range: [0.0, magnitude(gradient)],
        }
    }

    #[test]
    fn fitness_curve() {
        assert_eq!(fitness_from_rms(0.0, 5.0), 1.0);
        assert!((fitness_from_rms(9.0, 5.0) - 0.8).abs() < 1e-6);
        assert_eq!(fitness_from_rms(1e9, 5.0), 0.0);
        assert_eq!(fitness_from_rms(f32::NAN, 5.0), 0.0);
    }

    #[test]
    fn identical_contexts_are_fully_compatible() {
        let scales = CompatibilityScales {
            gradient: 1.0,
            elevation: 100.0,
        };
        let c = context(40.0, [0.3, 0.1]);
        let compat = gene_compatibility(&c, &c, scales);
        assert_eq!(compat.overall, 1.0);
    }

    #[test]
    fn opposite_gradients_cost_one_sixth() {
        let scales = CompatibilityScales {
            gradient: 1.0,
            elevation: 100.0,
        };
        let a = context(40.0, [0.3, 0.0]);
        let b = context(40.0, [-0.3, 0.0]);
        let compat = gene_compatibility(&a, &b, scales);
        assert!((compat.gradient_angle - 1.0).abs() < 1e-6);
        assert!((compat.overall - 5.0 / 6.0).abs() < 1e-6);
    }

    #[test]
    fn components_are_clamped() {
        let scales = CompatibilityScales {
            gradient: 1e-3,
            elevation: 1.0,
        };
        let a = context(1000.0, [5.0, 0.0]);
        let b = context(0.0, [0.0, 0.0]);
        let compat = gene_compatibility(&a, &b, scales);
        assert!(compat.overall >= 0.0);
        assert_eq!(compat.elevation_mean, 1.0);
        assert_eq!(compat.gradient_angle, 0.0);
    }
}
