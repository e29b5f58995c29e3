use std::{
    fs::File,
    io::BufWriter,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
};

use clap::{Parser, ValueEnum};
use color_eyre::{eyre::WrapErr, Result};
use serde::Serialize;
use terrain_core::{
    generate_terrain, load_synthesis_config_from_env, BlendMasks, GeneratedTerrain, Heightfield,
    MapRasterization, SynthesisConfig, SynthesisError, TerrainLod,
};
use tracing::{error, info};

mod demo;

use demo::{demo_library, layout, layout_from_file, Layout};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Json,
    Bincode,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Coarse-to-fine terrain synthesis from a procedural library", long_about = None)]
struct Cli {
    /// LOD the naive blend starts at, e.g. `270m`.
    #[arg(long, default_value = "270m", value_parser = parse_lod)]
    start: TerrainLod,
    /// Finest LOD to refine down to.
    #[arg(long, default_value = "90m", value_parser = parse_lod)]
    target: TerrainLod,
    /// Region map width in pixels at the start LOD.
    #[arg(long, default_value_t = 16)]
    width: usize,
    /// Region map height in pixels at the start LOD.
    #[arg(long, default_value_t = 16)]
    height: usize,
    #[arg(long, value_enum, default_value_t = Layout::Bands)]
    layout: Layout,
    /// JSON array of rows of terrain type IDs; overrides `--layout` and the map size.
    #[arg(long)]
    layout_file: Option<PathBuf>,
    /// Reference samples generated per terrain type.
    #[arg(long, default_value_t = 3)]
    samples: usize,
    /// Side length of each reference sample at the target LOD.
    #[arg(long, default_value_t = 192)]
    sample_size: usize,
    #[arg(long)]
    seed: Option<u64>,
    /// Synthesis config JSON; defaults to `TERRAIN_SYNTH_CONFIG_PATH` or the builtin.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Where to write the finest heightfield.
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
    format: OutputFormat,
}

fn parse_lod(value: &str) -> std::result::Result<TerrainLod, String> {
    let meters = value.trim_end_matches('m');
    let mps: f32 = meters
        .parse()
        .map_err(|_| format!("`{value}` is not a resolution such as 90m"))?;
    TerrainLod::for_meters_per_sample(mps).map_err(|err| err.to_string())
}

#[derive(Serialize)]
struct LevelSummary {
    lod: TerrainLod,
    width: usize,
    height: usize,
    fitness: Option<f32>,
    rms: Option<f32>,
    generation_ms: u128,
    refinement_ms: u128,
    total_ms: u128,
}

fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .compact()
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => SynthesisConfig::from_file(path)
            .wrap_err_with(|| format!("loading synthesis config {}", path.display()))?,
        None => (*load_synthesis_config_from_env().0).clone(),
    };
    if let Some(seed) = cli.seed {
        config.ga.seed = seed;
    }

    let cache = config.analysis_cache();
    if let Some(cache) = &cache {
        info!(dir = %cache.dir().display(), "synth_cli.cache.enabled");
    }
    let library = Arc::new(demo_library(
        config.analysis.clone(),
        cache,
        cli.target,
        cli.samples,
        cli.sample_size,
        config.ga.seed,
    ));

    let types = match &cli.layout_file {
        Some(path) => layout_from_file(path)?,
        None => layout(cli.layout, cli.width, cli.height),
    };
    let map = match MapRasterization::new(types, cli.start, library.size()) {
        Ok(map) => map,
        Err(err) => return Ok(fatal(err.into())),
    };

    let masks = Arc::new(BlendMasks::build(config.blend.mask));
    let terrain = match generate_terrain(&map, library, masks, &config, cli.start, cli.target) {
        Ok(terrain) => terrain,
        Err(err) if err.is_fatal_configuration() => return Ok(fatal(err)),
        Err(err) => return Err(err.into()),
    };

    let summary = summarize(&terrain);
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if let (Some(path), Some(finest)) = (&cli.output, terrain.finest()) {
        write_heightfield(path, &finest.heightfield, cli.format)
            .wrap_err_with(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), lod = %finest.lod, "synth_cli.output.written");
    }
    Ok(ExitCode::SUCCESS)
}

fn fatal(err: SynthesisError) -> ExitCode {
    error!(error = %err, "synth_cli.fatal_configuration");
    eprintln!("fatal configuration error: {err}");
    ExitCode::from(2)
}

fn summarize(terrain: &GeneratedTerrain) -> Vec<LevelSummary> {
    terrain
        .levels
        .iter()
        .map(|level| LevelSummary {
            lod: level.lod,
            width: level.timing.actual_size.0,
            height: level.timing.actual_size.1,
            fitness: level.fitness.as_ref().map(|f| f.overall),
            rms: level.fitness.as_ref().map(|f| f.rms),
            generation_ms: level.timing.generation.as_millis(),
            refinement_ms: level.timing.refinement.as_millis(),
            total_ms: level.timing.total.as_millis(),
        })
        .collect()
}

fn write_heightfield(path: &Path, heightfield: &Heightfield, format: OutputFormat) -> Result<()> {
    let writer = BufWriter::new(File::create(path)?);
    match format {
        OutputFormat::Json => serde_json::to_writer(writer, heightfield)?,
        OutputFormat::Bincode => bincode::serialize_into(writer, heightfield)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lod_names_parse() {
        assert_eq!(parse_lod("90m"), Ok(TerrainLod::L90m));
        assert_eq!(parse_lod("810"), Ok(TerrainLod::L810m));
        assert!(parse_lod("45m").is_err());
        assert!(parse_lod("far").is_err());
    }

    #[test]
    fn cli_defaults() {
        let cli = Cli::parse_from(["synth_cli"]);
        assert_eq!(cli.start, TerrainLod::L270m);
        assert_eq!(cli.target, TerrainLod::L90m);
        assert_eq!(cli.layout, Layout::Bands);
        assert_eq!(cli.format, OutputFormat::Json);
    }
}
