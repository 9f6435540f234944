use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use chipgen::catalog::SceneCatalog;
use chipgen::config::SourceConfig;
use chipgen::stac::StacClient;
use chipgen::store::LocalSceneStore;
use chipgen::writer::NpyChipWriter;
use chipgen::{AoiProcessor, Config, RunLedger};

#[derive(Parser, Debug)]
#[command(name = "chipgen", version = "0.1.0")]
struct Args {
    /// Path to the run configuration YAML
    #[arg(long, default_value = "./config.yaml")]
    config: PathBuf,
    /// Override the configured working directory
    #[arg(long)]
    working_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .format_timestamp_secs()
        .init();
    info!("=== chipgen start ===");

    let args = Args::parse();
    info!("Parsed command-line args: {:?}", args);

    let mut config = Config::load(&args.config)?;
    if let Some(dir) = args.working_dir {
        config.paths.working_dir = dir;
    }
    info!(
        "dataset={} mode={:?} aoi_file={:?}",
        config.dataset.name, config.dataset.mode, config.paths.aoi_file
    );

    let store_dir = match &config.source {
        SourceConfig::Local { store } => store,
        SourceConfig::Stac { store, .. } => store,
    };
    let store = LocalSceneStore::open(store_dir)
        .with_context(|| format!("opening scene store {:?}", store_dir))?;
    let stac;
    let catalog: &dyn SceneCatalog = match &config.source {
        SourceConfig::Local { .. } => {
            info!("scene catalog: local store {:?}", store_dir);
            &store
        }
        SourceConfig::Stac { endpoint, max_retries, backoff_secs, .. } => {
            info!("scene catalog: {endpoint}");
            stac = StacClient::new(endpoint, *max_retries, *backoff_secs);
            &stac
        }
    };

    let writer = NpyChipWriter::new(&config.paths.output_dir)
        .with_context(|| format!("creating output dir {:?}", config.paths.output_dir))?;
    let mut ledger = RunLedger::open(&config.paths.working_dir, &config.paths.aoi_file)?;

    let processor = AoiProcessor::new(catalog, &store, &writer, &config);
    processor.run(&mut ledger)?;

    info!("=== chipgen done ===");
    Ok(())
}
