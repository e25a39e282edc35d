//! gauge-reader binary: runs every configured source until Ctrl+C

use anyhow::{bail, Result};
use clap::Parser;
use futures_util::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gauge_reader::analysis::UnitVocabulary;
use gauge_reader::capture::open_source;
use gauge_reader::config::{self, AppConfig};
use gauge_reader::pipeline::{FramePipeline, RunnerSettings, SourceRunner};
use gauge_reader::storage::{self, Database, FanoutSink, LocalImageStore, LogSink, ReadingSink};
use gauge_reader::vision::{ModelSet, RemoteModels};

/// gauge-reader - Analog gauge monitoring from video
#[derive(Parser, Debug)]
#[command(name = "gauge-reader")]
#[command(about = "Reads analog gauges from live cameras and recordings")]
struct Args {
    /// Configuration file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Only run the sources with these ids
    #[arg(short, long)]
    source: Vec<String>,

    /// Write a default configuration file and exit
    #[arg(long)]
    init_config: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = match args.config {
        Some(path) => path,
        None => config::default_config_path()?,
    };

    if args.init_config {
        config::save_config(&AppConfig::default(), &config_path)?;
        println!("Wrote default configuration to {}", config_path.display());
        return Ok(());
    }

    let config = load_or_create_config(&config_path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.general.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("gauge-reader starting with {:?}", config_path);

    let units = Arc::new(match &config.units.directory {
        Some(dir) => UnitVocabulary::load_dir(dir, config.units.min_score)?,
        None => {
            warn!("No unit directory configured; readings will carry no unit");
            UnitVocabulary::default()
        }
    });

    // Blocking HTTP clients must be created and dropped outside the runtime
    let models = RemoteModels::model_set(&config.models)?;

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(run_sources(&config, &args.source, models.clone(), units));
    drop(runtime);
    drop(models);

    info!("gauge-reader shutdown complete");
    result
}

/// Load configuration, falling back to defaults when the file does not exist
fn load_or_create_config(path: &std::path::Path) -> Result<AppConfig> {
    if path.exists() {
        return config::load_config(path);
    }
    Ok(AppConfig::default())
}

async fn run_sources(
    config: &AppConfig,
    selected: &[String],
    models: ModelSet,
    units: Arc<UnitVocabulary>,
) -> Result<()> {
    let data_dir = storage::get_data_dir()?;
    let database = match &config.storage.database {
        Some(path) => Database::open(path)?,
        None => Database::open(&data_dir.join("readings.db"))?,
    };
    let images = Arc::new(LocalImageStore::new(
        config
            .storage
            .image_dir
            .clone()
            .unwrap_or_else(|| data_dir.join("crops")),
    )?);
    let sinks: Vec<Arc<dyn ReadingSink>> = vec![Arc::new(LogSink), Arc::new(database)];
    let sink: Arc<dyn ReadingSink> = Arc::new(FanoutSink::new(sinks));

    let settings = RunnerSettings::from_config(&config.runner, &config.storage);

    let runners = config
        .sources
        .iter()
        .filter(|source| selected.is_empty() || selected.contains(&source.id))
        .map(|source| {
            info!("Source {}: {:?} at {}", source.id, source.kind, source.location);
            Ok(SourceRunner::new(
                source.id.clone(),
                open_source(source)?,
                FramePipeline::new(models.clone(), units.clone(), config),
                sink.clone(),
                images.clone(),
                settings.clone(),
                source.track_thresholds(),
            ))
        })
        .collect::<Result<Vec<SourceRunner>>>()?;

    if runners.is_empty() {
        bail!("No sources to run; add [[sources]] entries to the configuration");
    }

    let handles: Vec<_> = runners.iter().map(|r| r.handle()).collect();
    let tasks = join_all(runners.into_iter().map(|r| tokio::spawn(r.run())));
    tokio::pin!(tasks);

    let results = tokio::select! {
        results = &mut tasks => results,
        _ = tokio::signal::ctrl_c() => {
            info!("Stop requested, shutting down {} sources", handles.len());
            for handle in &handles {
                handle.stop();
            }
            tasks.await
        }
    };

    for result in results {
        if let Err(e) = result {
            warn!("Source task failed: {}", e);
        }
    }
    Ok(())
}
