//! The GA driver: a fixed-capacity population evolved toward one pattern.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crossbeam_channel::Sender;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use crate::{
    analysis::AnalysisConfig,
    chromosome::{Pattern, TerrainChromosome},
    config::GaConfig,
    error::SynthesisError,
    fitness::{evaluate, FitnessMeasures},
    library::{TerrainLibrary, TerrainSeam},
    lod::TerrainLod,
    masks::BlendMasks,
    operators::{cross, mutate, randomize_all},
    raster::Heightfield,
    region::{RegionError, RegionMap, TerrainTypeId, VOID_TERRAIN_TYPE},
};

/// Fitness distribution over the live chromosomes of one generation.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PopulationStats {
    pub count: usize,
    pub sum: f32,
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub variance: f32,
}

impl PopulationStats {
    pub fn from_fitness(values: &[f32]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let count = values.len();
        let sum: f32 = values.iter().sum();
        let mean = sum / count as f32;
        let min = values.iter().copied().fold(f32::INFINITY, f32::min);
        let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let variance = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / count as f32;
        Self {
            count,
            sum,
            min,
            max,
            mean,
            variance,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationReport {
    pub lod: TerrainLod,
    pub generation: u32,
    pub stats: PopulationStats,
    pub best_fitness: f32,
    pub elapsed: Duration,
}

/// Cooperative cancellation shared with whoever drives the refinement.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Arena of chromosome slots; a dead slot is `None`.
#[derive(Debug)]
pub struct Population {
    pattern: Arc<Pattern>,
    slots: Vec<Option<TerrainChromosome>>,
}

impl Population {
    pub fn new(pattern: Arc<Pattern>, capacity: usize) -> Self {
        Self {
            pattern,
            slots: (0..capacity.max(1)).map(|_| None).collect(),
        }
    }

    pub fn pattern(&self) -> &Arc<Pattern> {
        &self.pattern
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn slots(&self) -> &[Option<TerrainChromosome>] {
        &self.slots
    }

    pub fn alive_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    fn alive_indices(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i))
            .collect()
    }

    /// Fill every dead slot with a freshly randomized chromosome.
    pub fn replenish<R: Rng + ?Sized>(
        &mut self,
        library: &TerrainLibrary,
        config: &GaConfig,
        rng: &mut R,
    ) -> usize {
        let mut born = 0;
        for slot in self.slots.iter_mut().filter(|s| s.is_none()) {
            let mut chromosome = TerrainChromosome::new(Arc::clone(&self.pattern));
            randomize_all(&mut chromosome, library, config, rng);
            *slot = Some(chromosome);
            born += 1;
        }
        born
    }

    /// Score every live chromosome in parallel, then normalize each against
    /// the population as `(fitness − min) / max`.
    pub fn evaluate(&mut self, log_constant: f32) -> PopulationStats {
        let fitness: Vec<f32> = self
            .slots
            .par_iter_mut()
            .filter_map(|slot| slot.as_mut())
            .map(|chromosome| evaluate(chromosome, log_constant))
            .collect();
        let stats = PopulationStats::from_fitness(&fitness);
        for chromosome in self.slots.iter_mut().flatten() {
            let measures = chromosome.fitness_mut();
            measures.normalized = if stats.max > 0.0 {
                (measures.overall - stats.min) / stats.max
            } else {
                0.0
            };
        }
        stats
    }

    /// Keep the `round(N·elite)` fittest plus roulette-drawn survivors up to
    /// `round(N·selection)`; every other slot dies. Returns the survivors'
    /// slot indices, best first.
    pub fn prune<R: Rng + ?Sized>(
        &mut self,
        selection_ratio: f32,
        elite_ratio: f32,
        rng: &mut R,
    ) -> Vec<usize> {
        let n = self.capacity() as f32;
        let elites = (n * elite_ratio.max(0.0)).round() as usize;
        let select = ((n * selection_ratio.max(0.0)).round() as usize).max(elites);

        let mut ranked = self.alive_indices();
        ranked.sort_by(|&a, &b| self.overall(b).total_cmp(&self.overall(a)));
        if select >= ranked.len() {
            return ranked;
        }

        let mut chosen = vec![false; ranked.len()];
        for flag in chosen.iter_mut().take(elites) {
            *flag = true;
        }
        let mut cumulative = Vec::with_capacity(ranked.len());
        let mut total = 0.0f32;
        for &i in &ranked {
            total += self.overall(i).max(0.0);
            cumulative.push(total);
        }

        let mut remaining = select - elites.min(select);
        let mut attempts = 0;
        let max_attempts = 64 * ranked.len();
        while remaining > 0 && total > 0.0 && attempts < max_attempts {
            attempts += 1;
            let draw = rng.gen_range(0.0..total);
            let pick = cumulative
                .partition_point(|&c| c <= draw)
                .min(ranked.len() - 1);
            if !chosen[pick] {
                chosen[pick] = true;
                remaining -= 1;
            }
        }
        // Degenerate wheels fall back to rank order.
        for flag in chosen.iter_mut() {
            if remaining == 0 {
                break;
            }
            if !*flag {
                *flag = true;
                remaining -= 1;
            }
        }

        let mut survivors = Vec::with_capacity(select);
        for (rank, &slot) in ranked.iter().enumerate() {
            if chosen[rank] {
                survivors.push(slot);
            } else {
                self.slots[slot] = None;
            }
        }
        survivors
    }

    /// Pair live chromosomes for block crossover. Returns genes exchanged.
    pub fn cross<R: Rng + ?Sized>(&mut self, config: &GaConfig, rng: &mut R) -> usize {
        let alive = self.alive_indices();
        if alive.len() < 2 {
            return 0;
        }
        let mut exchanged = 0;
        for &i in &alive {
            if !rng.gen_bool(config.crossover_probability.clamp(0.0, 1.0) as f64) {
                continue;
            }
            let mut j = alive[rng.gen_range(0..alive.len() - 1)];
            if j == i {
                j = alive[alive.len() - 1];
            }
            let (lo, hi) = (i.min(j), i.max(j));
            let (head, tail) = self.slots.split_at_mut(hi);
            if let (Some(a), Some(b)) = (head[lo].as_mut(), tail[0].as_mut()) {
                exchanged += cross(a, b, config.crossover_ratio, config.max_crossover_width, rng);
            }
        }
        exchanged
    }

    /// Mutate a share of each chosen chromosome's genes. Returns genes touched.
    pub fn mutate<R: Rng + ?Sized>(
        &mut self,
        library: &TerrainLibrary,
        config: &GaConfig,
        rng: &mut R,
    ) -> usize {
        let probability = config.mutation_probability.clamp(0.0, 1.0) as f64;
        let mut touched = 0;
        for chromosome in self.slots.iter_mut().flatten() {
            if rng.gen_bool(probability) {
                touched += mutate(chromosome, library, config, config.mutation_ratio, rng);
            }
        }
        touched
    }

    pub fn best(&self) -> Option<&TerrainChromosome> {
        self.slots
            .iter()
            .flatten()
            .max_by(|a, b| a.fitness().overall.total_cmp(&b.fitness().overall))
    }

    fn overall(&self, slot: usize) -> f32 {
        self.slots[slot]
            .as_ref()
            .map_or(f32::NEG_INFINITY, |c| c.fitness().overall)
    }
}

/// Result of one refinement, with the winning chromosome's scores.
#[derive(Debug, Clone)]
pub struct Refinement {
    pub heightfield: Heightfield,
    pub fitness: FitnessMeasures,
    pub generations: u32,
    pub history: Vec<PopulationStats>,
}

/// Evolves heightfields for one LOD at a time against a shared library.
pub struct HeightfieldGa {
    config: GaConfig,
    library: Arc<TerrainLibrary>,
    masks: Arc<BlendMasks>,
    analysis_config: Arc<AnalysisConfig>,
    rng: ChaCha8Rng,
    cancel: CancelToken,
    progress: Option<Sender<GenerationReport>>,
}

impl HeightfieldGa {
    pub fn new(
        config: GaConfig,
        library: Arc<TerrainLibrary>,
        masks: Arc<BlendMasks>,
        analysis_config: Arc<AnalysisConfig>,
    ) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        Self {
            config,
            library,
            masks,
            analysis_config,
            rng,
            cancel: CancelToken::default(),
            progress: None,
        }
    }

    pub fn with_progress(mut self, sender: Sender<GenerationReport>) -> Self {
        self.progress = Some(sender);
        self
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &GaConfig {
        &self.config
    }

    /// Evolve a heightfield that resembles `pattern` using samples of the
    /// terrain types laid out in `region_map`.
    pub fn refine_heightfield(
        &mut self,
        pattern: &Heightfield,
        region_map: &RegionMap,
    ) -> Result<Heightfield, SynthesisError> {
        self.refine(pattern.clone(), Arc::new(region_map.clone()))
            .map(|r| r.heightfield)
    }

    pub fn refine(
        &mut self,
        pattern: Heightfield,
        region_map: Arc<RegionMap>,
    ) -> Result<Refinement, SynthesisError> {
        self.check_region_types(&region_map)?;
        let lod = region_map.lod();
        let started = Instant::now();
        self.library.ensure_studied(lod);
        // Type signatures, which weight the pattern's per-region fitness.
        self.library.ensure_analyzed(lod);

        let pattern = Arc::new(Pattern::new(
            pattern,
            region_map,
            &self.library,
            Arc::clone(&self.masks),
            Arc::clone(&self.analysis_config),
        )?);
        let mut config = self.config.clone();
        if config.seam_overrides {
            self.dominant_seam(pattern.map()).apply_to(&mut config);
        }
        let budget = config.time_budget_ms.map(Duration::from_millis);
        let mut population = Population::new(Arc::clone(&pattern), config.population_size);
        let mut best: Option<TerrainChromosome> = None;
        let mut history = Vec::new();
        let mut generations = 0;

        tracing::info!(
            target: "terrain_synth::ga",
            lod = %lod,
            width = pattern.width(),
            height = pattern.height(),
            population = population.capacity(),
            cycles = config.evolution_cycles,
            "ga.refine.started"
        );

        for generation in 0..config.evolution_cycles {
            if self.cancel.is_cancelled() {
                tracing::warn!(target: "terrain_synth::ga", generation, "ga.refine.cancelled");
                break;
            }
            if budget.is_some_and(|b| started.elapsed() >= b) {
                tracing::warn!(target: "terrain_synth::ga", generation, "ga.refine.time_budget_exhausted");
                break;
            }

            population.replenish(&self.library, &config, &mut self.rng);
            let stats = population.evaluate(config.fitness_log_constant);
            keep_best(&mut best, population.best());
            history.push(stats);
            generations += 1;

            population.prune(config.selection_ratio, config.elite_ratio, &mut self.rng);
            let exchanged = population.cross(&config, &mut self.rng);
            let touched = population.mutate(&self.library, &config, &mut self.rng);

            let best_fitness = best.as_ref().map_or(0.0, |b| b.fitness().overall);
            tracing::info!(
                target: "terrain_synth::ga",
                lod = %lod,
                generation,
                best = best_fitness,
                mean = stats.mean,
                min = stats.min,
                max = stats.max,
                variance = stats.variance,
                exchanged,
                touched,
                "ga.generation.completed"
            );
            self.report(GenerationReport {
                lod,
                generation,
                stats,
                best_fitness,
                elapsed: started.elapsed(),
            });
        }

        if population.alive_count() == 0 {
            population.replenish(&self.library, &config, &mut self.rng);
        }
        history.push(population.evaluate(config.fitness_log_constant));
        keep_best(&mut best, population.best());

        let winner = best.ok_or(SynthesisError::EmptyPopulation)?;
        tracing::info!(
            target: "terrain_synth::ga",
            lod = %lod,
            generations,
            fitness = winner.fitness().overall,
            rms = winner.fitness().rms,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "ga.refine.completed"
        );
        let fitness = winner.fitness().clone();
        Ok(Refinement {
            heightfield: winner.into_heightfield(),
            fitness,
            generations,
            history,
        })
    }

    /// Forward a report to the progress channel. A dropped receiver
    /// detaches the channel for the rest of the run.
    fn report(&mut self, report: GenerationReport) {
        let Some(progress) = &self.progress else {
            return;
        };
        if progress.send(report).is_err() {
            tracing::debug!(target: "terrain_synth::ga", "ga.progress.receiver_dropped");
            self.progress = None;
        }
    }

    /// Seam between the two terrain types covering the most pixels, or the
    /// self-seam of a map holding a single type.
    fn dominant_seam(&self, map: &RegionMap) -> TerrainSeam {
        let mut areas: Vec<(TerrainTypeId, usize)> = Vec::new();
        for region in map.regions() {
            if region.terrain_type == VOID_TERRAIN_TYPE {
                continue;
            }
            match areas.iter_mut().find(|(t, _)| *t == region.terrain_type) {
                Some((_, area)) => *area += region.area,
                None => areas.push((region.terrain_type, region.area)),
            }
        }
        areas.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        match areas.as_slice() {
            [] => TerrainSeam::default(),
            [(only, _)] => self.library.seam(*only, *only).clone(),
            [(a, _), (b, _), ..] => self.library.seam(*a, *b).clone(),
        }
    }

    fn check_region_types(&self, map: &RegionMap) -> Result<(), SynthesisError> {
        let size = self.library.size();
        for region in map.regions() {
            if region.terrain_type as usize >= size {
                return Err(RegionError::TerrainTypeOutOfRange {
                    id: region.terrain_type,
                    x: region.seed.0,
                    y: region.seed.1,
                    library_size: size,
                }
                .into());
            }
        }
        Ok(())
    }
}

fn keep_best(best: &mut Option<TerrainChromosome>, candidate: Option<&TerrainChromosome>) {
    let Some(candidate) = candidate else {
        return;
    };
    let better = best
        .as_ref()
        .map_or(true, |b| candidate.fitness().overall > b.fitness().overall);
    if better {
        *best = Some(candidate.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{raster::Raster, sample::TerrainSample};

    fn library() -> Arc<TerrainLibrary> {
        Arc::new(plains_library())
    }

    fn plains_library() -> TerrainLibrary {
        let mut library = TerrainLibrary::default();
        let plains = library.add_terrain_type("plains");
        for i in 0..3 {
            let elevation = Raster::from_fn(48, 48, move |x, y| ((x * 7 + y * 3 + i * 11) % 17) as f32);
            library
                .add_sample(plains, TerrainSample::from_heightfield(elevation, TerrainLod::L90m))
                .unwrap();
        }
        library
    }

    fn pattern(library: &TerrainLibrary) -> Arc<Pattern> {
        let map = Arc::new(RegionMap::uniform(36, 36, 1, TerrainLod::L90m, library.size()).unwrap());
        Arc::new(
            Pattern::new(
                Raster::filled(36, 36, 8.0),
                map,
                library,
                Arc::new(BlendMasks::default()),
                Arc::new(AnalysisConfig::default()),
            )
            .unwrap(),
        )
    }

    #[test]
    fn stats_of_fitness_values() {
        let stats = PopulationStats::from_fitness(&[0.2, 0.4, 0.6]);
        assert_eq!(stats.count, 3);
        assert!((stats.mean - 0.4).abs() < 1e-6);
        assert!((stats.min - 0.2).abs() < 1e-6);
        assert!((stats.max - 0.6).abs() < 1e-6);
        assert!((stats.variance - 0.08 / 3.0).abs() < 1e-6);
        assert_eq!(PopulationStats::from_fitness(&[]), PopulationStats::default());
    }

    #[test]
    fn prune_keeps_rounded_share_and_elites() {
        let library = library();
        let config = GaConfig::default();
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let mut population = Population::new(pattern(&library), 8);
        population.replenish(&library, &config, &mut rng);
        population.evaluate(config.fitness_log_constant);

        let mut ranked: Vec<(usize, f32)> = population
            .slots()
            .iter()
            .enumerate()
            .map(|(i, s)| (i, s.as_ref().unwrap().fitness().overall))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

        let survivors = population.prune(0.5, 0.25, &mut rng);
        assert_eq!(survivors.len(), 4);
        assert_eq!(population.alive_count(), 4);
        for (slot, _) in ranked.iter().take(2) {
            assert!(population.slots()[*slot].is_some());
        }
    }

    #[test]
    fn normalized_fitness_is_relative() {
        let library = library();
        let config = GaConfig::default();
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let mut population = Population::new(pattern(&library), 4);
        population.replenish(&library, &config, &mut rng);
        let stats = population.evaluate(config.fitness_log_constant);
        for chromosome in population.slots().iter().flatten() {
            let n = chromosome.fitness().normalized;
            assert!((0.0..=1.0).contains(&n));
        }
        assert!(stats.max >= stats.min);
    }

    #[test]
    fn cancelled_refinement_still_returns_a_heightfield() {
        let library = library();
        let mut ga = HeightfieldGa::new(
            GaConfig::default(),
            Arc::clone(&library),
            Arc::new(BlendMasks::default()),
            Arc::new(AnalysisConfig::default()),
        );
        ga.cancel_token().cancel();
        let map = RegionMap::uniform(36, 36, 1, TerrainLod::L90m, library.size()).unwrap();
        let refinement = ga
            .refine(Raster::filled(36, 36, 8.0), Arc::new(map))
            .unwrap();
        assert_eq!(refinement.generations, 0);
        assert_eq!(refinement.heightfield.width(), 36);
    }

    #[test]
    fn progress_reports_each_generation() {
        let library = library();
        let (tx, rx) = crossbeam_channel::unbounded();
        let config = GaConfig {
            evolution_cycles: 3,
            ..GaConfig::default()
        };
        let mut ga = HeightfieldGa::new(
            config,
            Arc::clone(&library),
            Arc::new(BlendMasks::default()),
            Arc::new(AnalysisConfig::default()),
        )
        .with_progress(tx);
        let map = RegionMap::uniform(36, 36, 1, TerrainLod::L90m, library.size()).unwrap();
        let out = ga.refine_heightfield(&Raster::filled(36, 36, 8.0), &map).unwrap();
        assert_eq!(out.width(), 36);
        let reports: Vec<GenerationReport> = rx.try_iter().collect();
        assert_eq!(reports.len(), 3);
        assert!(reports.windows(2).all(|w| w[1].best_fitness >= w[0].best_fitness));
        let plains = library.terrain_type(1).unwrap();
        assert!(plains.signature(TerrainLod::L90m).is_some());
    }

    #[test]
    fn dropped_progress_receiver_does_not_stop_the_run() {
        let library = library();
        let (tx, rx) = crossbeam_channel::unbounded();
        drop(rx);
        let config = GaConfig {
            evolution_cycles: 2,
            ..GaConfig::default()
        };
        let mut ga = HeightfieldGa::new(
            config,
            Arc::clone(&library),
            Arc::new(BlendMasks::default()),
            Arc::new(AnalysisConfig::default()),
        )
        .with_progress(tx);
        let map = RegionMap::uniform(36, 36, 1, TerrainLod::L90m, library.size()).unwrap();
        let refinement = ga.refine(Raster::filled(36, 36, 8.0), Arc::new(map)).unwrap();
        assert_eq!(refinement.generations, 2);
        assert!(ga.progress.is_none());
    }

    #[test]
    fn seam_parameters_override_the_run_when_enabled() {
        let mut library = plains_library();
        library.set_seam(
            1,
            1,
            TerrainSeam {
                cycles: 2,
                population_size: 3,
                selection_ratio: 0.7,
                ..TerrainSeam::default()
            },
        );
        let library = Arc::new(library);
        let map = RegionMap::uniform(36, 36, 1, TerrainLod::L90m, library.size()).unwrap();
        let run = |seam_overrides: bool| {
            let config = GaConfig {
                evolution_cycles: 4,
                population_size: 6,
                seam_overrides,
                ..GaConfig::default()
            };
            let mut ga = HeightfieldGa::new(
                config,
                Arc::clone(&library),
                Arc::new(BlendMasks::default()),
                Arc::new(AnalysisConfig::default()),
            );
            ga.refine(Raster::filled(36, 36, 8.0), Arc::new(map.clone())).unwrap()
        };

        let seamed = run(true);
        assert_eq!(seamed.generations, 2);
        assert_eq!(seamed.history[0].count, 3);

        let plain = run(false);
        assert_eq!(plain.generations, 4);
        assert_eq!(plain.history[0].count, 6);
    }

    #[test]
    fn out_of_range_region_type_is_rejected() {
        let library = library();
        let mut ga = HeightfieldGa::new(
            GaConfig::default(),
            Arc::clone(&library),
            Arc::new(BlendMasks::default()),
            Arc::new(AnalysisConfig::default()),
        );
        let map = RegionMap::uniform(12, 12, 5, TerrainLod::L90m, 10).unwrap();
        let err = ga.refine_heightfield(&Raster::filled(12, 12, 0.0), &map).unwrap_err();
        assert!(err.is_fatal_configuration());
    }
}
