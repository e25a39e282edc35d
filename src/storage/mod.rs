//! Storage Layer
//!
//! Where readings, alerts and gauge crops go once a frame has been analyzed.
//! The runner only sees the [`ReadingSink`] and [`ImageStore`] capabilities;
//! a failing sink is logged by the runner and never stops it.

pub mod database;
pub mod images;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use image::RgbImage;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::analysis::{AlertEvent, Reading};

pub use database::Database;
pub use images::LocalImageStore;

/// Receives every computed reading and every alert
#[async_trait]
pub trait ReadingSink: Send + Sync {
    /// Append a reading to the (source, track) log
    async fn record(&self, source_id: &str, track_id: u64, reading: &Reading) -> Result<()>;

    /// Deliver a threshold violation
    async fn notify(&self, _source_id: &str, _track_id: u64, _alert: &AlertEvent) -> Result<()> {
        Ok(())
    }
}

/// Persists gauge crops and returns a reference to them
#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn store(&self, source_id: &str, track_id: u64, crop: &RgbImage) -> Result<String>;
}

/// Sink that only writes to the log
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl ReadingSink for LogSink {
    async fn record(&self, source_id: &str, track_id: u64, reading: &Reading) -> Result<()> {
        info!(
            "[{}] {} track {} = {} {} ({})",
            reading.timestamp.to_rfc3339(),
            source_id,
            track_id,
            reading.value,
            reading.unit,
            reading.image_ref
        );
        Ok(())
    }

    async fn notify(&self, source_id: &str, track_id: u64, alert: &AlertEvent) -> Result<()> {
        warn!(
            "[{}] {} track {} {} alert: {}",
            alert.timestamp.to_rfc3339(),
            source_id,
            track_id,
            alert.status.as_str(),
            alert.reading
        );
        Ok(())
    }
}

/// Forwards to every inner sink, even after one of them fails
pub struct FanoutSink {
    sinks: Vec<Arc<dyn ReadingSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn ReadingSink>>) -> Self {
        Self { sinks }
    }
}

fn combine(mut errors: Vec<anyhow::Error>) -> Result<()> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        n => {
            let messages: Vec<String> = errors.iter().map(|e| format!("{:#}", e)).collect();
            Err(anyhow!("{} sinks failed: {}", n, messages.join("; ")))
        }
    }
}

#[async_trait]
impl ReadingSink for FanoutSink {
    async fn record(&self, source_id: &str, track_id: u64, reading: &Reading) -> Result<()> {
        let mut errors = Vec::new();
        for sink in &self.sinks {
            if let Err(e) = sink.record(source_id, track_id, reading).await {
                errors.push(e);
            }
        }
        combine(errors)
    }

    async fn notify(&self, source_id: &str, track_id: u64, alert: &AlertEvent) -> Result<()> {
        let mut errors = Vec::new();
        for sink in &self.sinks {
            if let Err(e) = sink.notify(source_id, track_id, alert).await {
                errors.push(e);
            }
        }
        combine(errors)
    }
}

/// Get the application data directory
pub fn get_data_dir() -> Result<PathBuf> {
    let proj_dirs = directories::ProjectDirs::from("com", "gaugereader", "GaugeReader")
        .ok_or_else(|| anyhow!("Could not determine data directory"))?;

    let data_dir = proj_dirs.data_dir().to_path_buf();
    std::fs::create_dir_all(&data_dir)?;

    Ok(data_dir)
}

/// Get the configuration directory
pub fn get_config_dir() -> Result<PathBuf> {
    let proj_dirs = directories::ProjectDirs::from("com", "gaugereader", "GaugeReader")
        .ok_or_else(|| anyhow!("Could not determine config directory"))?;

    let config_dir = proj_dirs.config_dir().to_path_buf();
    std::fs::create_dir_all(&config_dir)?;

    Ok(config_dir)
}
