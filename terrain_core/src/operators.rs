//! Genetic operators over genes and chromosomes.

use std::f32::consts::TAU;

use rand::{
    distributions::{Distribution, WeightedIndex},
    seq::index,
    Rng,
};

use crate::{
    chromosome::{Gene, GeneSource, Pattern, TerrainChromosome},
    config::GaConfig,
    fitness::{slot_compatibility, CompatibilityScales},
    library::TerrainLibrary,
    raster::Raster,
    region::VOID_TERRAIN_TYPE,
};

/// Everything a gene operator reads besides the gene itself.
pub struct OperatorContext<'a> {
    pub pattern: &'a Pattern,
    pub library: &'a TerrainLibrary,
    pub config: &'a GaConfig,
    pub scales: CompatibilityScales,
}

impl<'a> OperatorContext<'a> {
    pub fn new(pattern: &'a Pattern, library: &'a TerrainLibrary, config: &'a GaConfig) -> Self {
        Self {
            pattern,
            library,
            config,
            scales: CompatibilityScales::for_pattern(pattern),
        }
    }

    /// Pixels kept clear between a source center and the source edge.
    fn margin(&self) -> isize {
        (self.pattern.masks().mask(self.pattern.lod()).width() / 2) as isize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOperator {
    Randomize,
    RotateToward,
    OffsetToward,
    Scale,
    Translate,
}

impl MutationOperator {
    pub const ALL: [MutationOperator; 5] = [
        MutationOperator::Randomize,
        MutationOperator::RotateToward,
        MutationOperator::OffsetToward,
        MutationOperator::Scale,
        MutationOperator::Translate,
    ];

    /// Poorly fitting genes are more likely to be thrown away entirely.
    fn weight(self, gene: &Gene) -> f32 {
        match self {
            MutationOperator::Randomize => 1.0 + 3.0 * (1.0 - gene.compatibility.overall.clamp(0.0, 1.0)),
            _ => 1.0,
        }
    }
}

/// Give `gene` a fresh source sample, center and transform. Several random
/// placements are tried and the one most compatible with the pattern slot
/// is kept.
pub fn randomize<R: Rng + ?Sized>(gene: &mut Gene, ctx: &OperatorContext<'_>, rng: &mut R) {
    let lod = ctx.pattern.lod();
    let Some(terrain_type) = (gene.terrain_type != VOID_TERRAIN_TYPE)
        .then(|| ctx.library.terrain_type(gene.terrain_type).ok())
        .flatten()
    else {
        gene.source = None;
        reset(gene);
        return;
    };

    let mut best: Option<Gene> = None;
    for _ in 0..ctx.config.placement_candidates.max(1) {
        let Some(sample) = terrain_type.random_sample(rng) else {
            break;
        };
        let Some(source) = GeneSource::new(sample.clone(), lod) else {
            continue;
        };
        let mut candidate = gene.clone();
        candidate.source_center = (
            random_center(source.width(), ctx.margin(), rng),
            random_center(source.height(), ctx.margin(), rng),
        );
        candidate.source = Some(source);
        candidate.rotation = rng.gen_range(0.0..TAU);
        candidate.scale = random_scale(ctx.config.max_scale, rng);
        candidate.offset = symmetric(ctx.config.max_offset, rng);
        jitter(&mut candidate, ctx, rng);
        candidate.compatibility = slot_compatibility(&candidate, ctx.pattern, ctx.scales);
        if best
            .as_ref()
            .map_or(true, |b| candidate.compatibility.overall > b.compatibility.overall)
        {
            best = Some(candidate);
        }
    }

    match best {
        Some(candidate) => *gene = candidate,
        None => {
            tracing::warn!(
                target: "terrain_synth::ga",
                terrain_type = gene.terrain_type,
                lod = %lod,
                "gene.randomize.no_source"
            );
            gene.source = None;
            reset(gene);
        }
    }
}

/// Identity transform: no rotation, unit scale, no offset or jitter.
pub fn reset(gene: &mut Gene) {
    gene.reset_transform();
}

/// Rotate the patch so its local gradient lines up with the slot's, plus a
/// little noise. Flat patches or slots get a random rotation.
pub fn rotate_toward<R: Rng + ?Sized>(gene: &mut Gene, ctx: &OperatorContext<'_>, rng: &mut R) {
    let (tx, ty) = gene.target_center();
    let toward = ctx
        .pattern
        .context_at(tx, ty)
        .and_then(|slot| gene.rotation_toward(slot.gradient_mean));
    gene.rotation = match toward {
        Some(angle) => (angle + symmetric(ctx.config.rotation_jitter, rng)).rem_euclid(TAU),
        None => rng.gen_range(0.0..TAU),
    };
}

/// Offset the patch so its mean lands near the slot's mean.
pub fn offset_toward<R: Rng + ?Sized>(gene: &mut Gene, ctx: &OperatorContext<'_>, rng: &mut R) {
    let max = ctx.config.max_offset.max(0.0);
    let (tx, ty) = gene.target_center();
    let target = ctx
        .pattern
        .context_at(tx, ty)
        .map_or(gene.offset, |slot| slot.elevation_mean - gene.source_mean());
    gene.offset = (target + symmetric(0.1 * max, rng)).clamp(-max, max);
}

/// Multiply the scale by a random factor, staying within the configured bounds.
pub fn scale<R: Rng + ?Sized>(gene: &mut Gene, ctx: &OperatorContext<'_>, rng: &mut R) {
    let max = ctx.config.max_scale.max(1.0);
    let factor = random_scale(max.sqrt(), rng);
    gene.scale = (gene.scale * factor).clamp(1.0 / max, max);
}

/// Nudge the source center, keeping the patch inside its source.
pub fn translate<R: Rng + ?Sized>(gene: &mut Gene, ctx: &OperatorContext<'_>, rng: &mut R) {
    let Some(source) = gene.source.as_ref() else {
        return;
    };
    let max = ctx.config.max_translate.max(0);
    let margin = ctx.margin();
    let clamp = |v: isize, size: usize| {
        let lo = margin.min(size as isize / 2);
        let hi = (size as isize - margin).max(lo);
        v.clamp(lo, hi)
    };
    let dx = rng.gen_range(-max..=max) as isize;
    let dy = rng.gen_range(-max..=max) as isize;
    gene.source_center = (
        clamp(gene.source_center.0 + dx, source.width()),
        clamp(gene.source_center.1 + dy, source.height()),
    );
}

/// Perturb where the gene lands in the output.
pub fn jitter<R: Rng + ?Sized>(gene: &mut Gene, ctx: &OperatorContext<'_>, rng: &mut R) {
    let max = ctx.config.max_jitter.max(0);
    gene.jitter = (rng.gen_range(-max..=max), rng.gen_range(-max..=max));
}

/// Apply one operator, picked at random, to `gene`.
pub fn mutate_gene<R: Rng + ?Sized>(
    gene: &mut Gene,
    ctx: &OperatorContext<'_>,
    rng: &mut R,
) -> MutationOperator {
    let weights = MutationOperator::ALL.map(|op| op.weight(gene));
    let op = WeightedIndex::new(weights)
        .map(|dist| MutationOperator::ALL[dist.sample(rng)])
        .unwrap_or(MutationOperator::Randomize);
    match op {
        MutationOperator::Randomize => randomize(gene, ctx, rng),
        MutationOperator::RotateToward => rotate_toward(gene, ctx, rng),
        MutationOperator::OffsetToward => offset_toward(gene, ctx, rng),
        MutationOperator::Scale => scale(gene, ctx, rng),
        MutationOperator::Translate => translate(gene, ctx, rng),
    }
    op
}

/// Randomize every gene of a fresh chromosome.
pub fn randomize_all<R: Rng + ?Sized>(
    chromosome: &mut TerrainChromosome,
    library: &TerrainLibrary,
    config: &GaConfig,
    rng: &mut R,
) {
    let pattern = std::sync::Arc::clone(chromosome.pattern());
    let ctx = OperatorContext::new(&pattern, library, config);
    for gene in chromosome.genes_mut() {
        randomize(gene, &ctx, rng);
    }
}

/// Mutate `round(genes · ratio)` distinct genes. Returns how many were touched.
pub fn mutate<R: Rng + ?Sized>(
    chromosome: &mut TerrainChromosome,
    library: &TerrainLibrary,
    config: &GaConfig,
    ratio: f32,
    rng: &mut R,
) -> usize {
    let count = chromosome.gene_count();
    let amount = ((count as f32 * ratio.clamp(0.0, 1.0)).round() as usize).min(count);
    if amount == 0 {
        return 0;
    }
    let pattern = std::sync::Arc::clone(chromosome.pattern());
    let ctx = OperatorContext::new(&pattern, library, config);
    let genes = chromosome.genes_mut();
    for i in index::sample(rng, count, amount) {
        mutate_gene(&mut genes[i], &ctx, rng);
    }
    amount
}

/// Swap randomly placed rectangular gene blocks between two chromosomes.
/// Returns the number of genes exchanged; mismatched grids exchange nothing.
pub fn cross<R: Rng + ?Sized>(
    a: &mut TerrainChromosome,
    b: &mut TerrainChromosome,
    ratio: f32,
    max_width: usize,
    rng: &mut R,
) -> usize {
    if !a.same_grid(b) {
        tracing::warn!(
            target: "terrain_synth::ga",
            a = ?(a.grid_width(), a.grid_height()),
            b = ?(b.grid_width(), b.grid_height()),
            "ga.crossover.skipped"
        );
        return 0;
    }
    let (w, h) = (a.grid_width(), a.grid_height());
    if w == 0 || h == 0 {
        return 0;
    }
    let max_width = max_width.max(1);
    let mean_chunk = (max_width * max_width / 4).max(1);
    let blocks = (a.gene_count() as f32 * ratio.max(0.0)) as usize / mean_chunk;
    let blocks = rng.gen_range(0..=blocks);

    // Overlapping blocks select a gene once.
    let mut selected = Raster::filled(w, h, false);
    for _ in 0..blocks {
        let x0 = rng.gen_range(0..w);
        let y0 = rng.gen_range(0..h);
        let x1 = (x0 + rng.gen_range(0..=max_width)).min(w - 1);
        let y1 = (y0 + rng.gen_range(0..=max_width)).min(h - 1);
        for y in y0..=y1 {
            for x in x0..=x1 {
                let i = selected.idx(x, y);
                selected.values_mut()[i] = true;
            }
        }
    }

    let mut exchanged = 0;
    for y in 0..h {
        for x in 0..w {
            if selected.sample(x, y) {
                a.swap_gene(b, x, y);
                exchanged += 1;
            }
        }
    }
    exchanged
}

fn random_center<R: Rng + ?Sized>(size: usize, margin: isize, rng: &mut R) -> isize {
    let size = size as isize;
    if size <= 2 * margin {
        return size / 2;
    }
    rng.gen_range(margin..=size - margin)
}

/// Log-uniform in `[1/max, max]`.
fn random_scale<R: Rng + ?Sized>(max: f32, rng: &mut R) -> f32 {
    if max <= 1.0 {
        return 1.0;
    }
    let bound = max.ln();
    rng.gen_range(-bound..=bound).exp()
}

fn symmetric<R: Rng + ?Sized>(bound: f32, rng: &mut R) -> f32 {
    if bound > 0.0 {
        rng.gen_range(-bound..=bound)
    } else {
        0.0
    }
}
