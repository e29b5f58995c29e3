//! Splatting genes into a heightfield.

use crate::{
    chromosome::{Gene, TerrainChromosome},
    raster::{Heightfield, Raster},
};

/// Composite every gene of `chromosome` into a heightfield the size of its
/// pattern. Each gene adds `mask · value` into the output and `mask` into a
/// weight accumulator; the output is their ratio. Pixels no gene reaches
/// take the overall weighted mean.
///
/// Genes are visited in grid order so the result is bit-for-bit repeatable.
pub fn render_chromosome(chromosome: &TerrainChromosome) -> Heightfield {
    let pattern = chromosome.pattern();
    let width = pattern.width();
    let height = pattern.height();
    let mask = pattern.masks().mask(pattern.lod());

    let mut output = Raster::filled(width, height, 0.0f32);
    let mut weights = Raster::filled(width, height, 0.0f32);
    for gene in chromosome.genes() {
        render_gene(gene, mask, &mut output, &mut weights);
    }
    normalize(output, &weights)
}

/// Add one gene's masked patch into `output` and its mask into `weights`.
pub fn render_gene(
    gene: &Gene,
    mask: &Raster<f32>,
    output: &mut Heightfield,
    weights: &mut Heightfield,
) {
    let Some(source) = gene.source.as_ref() else {
        return;
    };
    if mask.is_empty() {
        return;
    }
    let (tx, ty) = gene.target_center();
    let (sx, sy) = gene.source_center;
    let half_w = (mask.width() / 2) as isize;
    let half_h = (mask.height() / 2) as isize;
    let mean = gene.source_mean();
    let (sin, cos) = gene.rotation.sin_cos();

    for my in 0..mask.height() {
        let oy = ty - half_h + my as isize;
        if oy < 0 || oy >= output.height() as isize {
            continue;
        }
        for mx in 0..mask.width() {
            let ox = tx - half_w + mx as isize;
            if ox < 0 || ox >= output.width() as isize {
                continue;
            }
            let w = mask.sample(mx, my);
            if w <= 0.0 {
                continue;
            }
            let dx = (mx as isize - half_w) as f32;
            let dy = (my as isize - half_h) as f32;
            let fx = sx as f32 + cos * dx - sin * dy;
            let fy = sy as f32 + sin * dx + cos * dy;
            let raw = source.elevation.bilinear(fx, fy);
            let value = (raw - mean) * gene.scale + mean + gene.offset;
            let i = output.idx(ox as usize, oy as usize);
            output.values_mut()[i] += w * value;
            weights.values_mut()[i] += w;
        }
    }
}

fn normalize(mut output: Heightfield, weights: &Heightfield) -> Heightfield {
    let total_weight = weights.sum();
    let fallback = if total_weight > 0.0 {
        (output.sum() / total_weight) as f32
    } else {
        0.0
    };
    for (value, &w) in output.values_mut().iter_mut().zip(weights.values()) {
        *value = if w == 0.0 { fallback } else { *value / w };
    }
    output
}
