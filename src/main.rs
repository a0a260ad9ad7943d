//! # Asset Transform - Main Entry Point
//!
//! Questo è il punto di ingresso della CLI di generazione delle rendition.
//!
//! ## Responsabilità:
//! - Parsing degli argomenti della command line con `clap`
//! - Inizializzazione del sistema di logging con `tracing`
//! - Validazione degli input dell'utente
//! - Costruzione del `TransformService` su un volume locale e avvio del batch
//!
//! ## Flusso di esecuzione:
//! 1. Parsa gli argomenti CLI (directory, trasformazioni, config, workers, etc.)
//! 2. Configura il logging (INFO o DEBUG a seconda del flag verbose, o `RUST_LOG`)
//! 3. Valida che la directory esista
//! 4. Carica config e project config, apre l'indice persistito nella directory
//! 5. Genera le rendition mancanti e salva l'indice
//!
//! ## Esempio di utilizzo:
//! ```bash
//! asset-transform /path/to/uploads -t thumb -t 800xAUTO:fit --format webp --workers 8
//! ```

use anyhow::{Context, Result};
use asset_transforms::batch::{parse_transform_arg, with_overrides, BatchGenerator};
use asset_transforms::clock::SystemClock;
use asset_transforms::file_manager::FileManager;
use asset_transforms::progress::ProgressManager;
use asset_transforms::project_config::ProjectConfig;
use asset_transforms::volume::LocalVolume;
use asset_transforms::{Config, InMemoryIndexRepository, TransformService};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const VOLUME_ID: &str = "local";

#[derive(Parser)]
#[command(name = "asset-transform")]
#[command(about = "Generate image transforms for a directory of assets")]
struct Args {
    /// Directory containing the source images
    directory: PathBuf,

    /// Transform to generate: a handle or WxH[:mode[:position]] (AUTO allowed)
    #[arg(short, long = "transform", required = true)]
    transforms: Vec<String>,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Project config file holding the named transforms
    #[arg(short, long)]
    project: Option<PathBuf>,

    /// Force an output format (jpg, png, gif, webp)
    #[arg(short, long)]
    format: Option<String>,

    /// Output quality (1-100), overrides the configured default
    #[arg(short, long)]
    quality: Option<u8>,

    /// Number of parallel workers
    #[arg(short, long, default_value = "4")]
    workers: usize,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).finish();

    tracing::subscriber::set_global_default(subscriber)?;

    // Validate arguments
    if !args.directory.is_dir() {
        return Err(anyhow::anyhow!("Asset directory does not exist: {}", args.directory.display()));
    }
    if let Some(quality) = args.quality {
        if quality == 0 || quality > 100 {
            return Err(anyhow::anyhow!("Quality must be between 1 and 100"));
        }
    }

    let config = match args.config {
        Some(ref path) => Config::from_file(path).await?,
        None => Config::default(),
    };
    config.validate()?;

    let project_config = match args.project {
        Some(ref path) => ProjectConfig::open(path.clone()).await?,
        None => ProjectConfig::new(),
    };

    let clock = Arc::new(SystemClock);
    let repository = Arc::new(InMemoryIndexRepository::open_for_directory(&args.directory, clock.clone()).await?);
    let service = TransformService::builder(config)
        .volume(Arc::new(LocalVolume::new(VOLUME_ID, &args.directory, "")))
        .repository(repository.clone())
        .project_config(Arc::new(project_config))
        .clock(clock)
        .build()
        .await
        .context("Failed to initialize transform service")?;

    let inputs = args
        .transforms
        .iter()
        .map(|arg| {
            parse_transform_arg(arg).map(|input| with_overrides(input, args.format.as_deref(), args.quality))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let files = FileManager::find_image_files(&args.directory)?;
    let mut assets = Vec::with_capacity(files.len());
    for file in &files {
        match FileManager::asset_for(&args.directory, file, VOLUME_ID).await {
            Ok(asset) => assets.push(asset),
            Err(e) => warn!("Skipping {}: {}", file.display(), e),
        }
    }
    info!("Found {} images, {} transforms", assets.len(), inputs.len());

    let progress = ProgressManager::new(0);
    let batch = BatchGenerator::new(Arc::new(service), args.workers);
    let stats = batch.run(&assets, &inputs, &progress).await?;

    repository.flush().await?;
    progress.finish(&stats.format_summary());
    info!("{}", stats.format_summary());

    Ok(())
}
