//! Application Configuration
//!
//! Model endpoints, pipeline tuning and monitored sources stored in TOML format.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::analysis::Threshold;
use crate::capture::SourceKind;
use crate::vision::PreprocessConfig;

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// General settings
    pub general: GeneralConfig,
    /// Model server settings
    pub models: ModelsConfig,
    /// Gauge tracker settings
    pub tracker: TrackerConfig,
    /// OCR evidence de-duplication
    pub aggregation: AggregationConfig,
    /// Scale-mark extraction and landmark fallback
    pub scale: ScaleConfig,
    /// Robust line calibration
    pub calibration: CalibrationConfig,
    /// Source loop timing
    pub runner: RunnerConfig,
    /// Frame preprocessing
    pub preprocess: PreprocessConfig,
    /// Unit vocabulary
    pub units: UnitsConfig,
    /// Reading persistence
    pub storage: StorageConfig,
    /// Monitored video sources
    pub sources: Vec<SourceConfig>,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Default log filter when `RUST_LOG` is unset
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Model server endpoint and confidence floors
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    /// Base URL of the model server
    pub endpoint: String,
    /// Per-request timeout
    pub timeout_ms: u64,
    /// Confidence floor for gauge detections
    pub gauge_confidence: f32,
    /// Confidence floor for base/minimum/maximum detections
    pub landmark_confidence: f32,
    /// Recognized text below this confidence is discarded
    pub ocr_min_confidence: f32,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8500".to_string(),
            timeout_ms: 10_000,
            gauge_confidence: 0.75,
            landmark_confidence: 0.75,
            ocr_min_confidence: 0.85,
        }
    }
}

/// Greedy IoU tracker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Consecutive associations before a track is confirmed
    pub n_init: u32,
    /// Consecutive misses before a confirmed track is evicted
    pub max_age: u32,
    /// Detections overlapping a stronger one above this IoU are dropped
    pub nms_max_overlap: f64,
    /// Minimum IoU to associate a detection with a track
    pub min_iou: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            n_init: 10,
            max_age: 2,
            nms_max_overlap: 0.8,
            min_iou: 0.3,
        }
    }
}

/// Evidence aggregator thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Observations at or below this confidence are dropped
    pub score_threshold: f32,
    /// Boxes overlapping a kept box above this IoU are suppressed
    pub nms_threshold: f64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            score_threshold: 0.5,
            nms_threshold: 0.1,
        }
    }
}

/// Scale-mark extraction settings (pixels)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleConfig {
    /// Contour points this close to the needle circle are mark candidates
    pub circle_tolerance_px: f64,
    /// Candidates closer than this are averaged
    pub merge_distance_px: f64,
    /// Labels farther than this from every candidate use their own center
    pub text_distance_threshold_px: f64,
    /// Erosion radius applied before contour extraction
    pub erode_radius: u8,
    /// Segmenter mask values above this are needle pixels
    pub needle_mask_threshold: u8,
    /// Allowed min/max height mismatch as a fraction of the crop height
    pub asymmetry_ratio: f64,
}

impl Default for ScaleConfig {
    fn default() -> Self {
        Self {
            circle_tolerance_px: 10.0,
            merge_distance_px: 5.0,
            text_distance_threshold_px: 80.0,
            erode_radius: 2,
            needle_mask_threshold: 15,
            asymmetry_ratio: 0.05,
        }
    }
}

/// Multi-line RANSAC settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Maximum extraction rounds
    pub iterations: usize,
    /// Nominal residual threshold, scaled by the sample MAD
    pub max_distance: f64,
    /// Consensus size needed to accept a line
    pub min_inliers: usize,
    /// Lines closer than this in direction are merged
    pub merge_angle_deg: f64,
    /// Random minimal samples per round
    pub max_trials: usize,
    /// Seed for the sampling RNG
    pub seed: u64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            iterations: 30,
            max_distance: 1.0,
            min_inliers: 2,
            merge_angle_deg: 10.0,
            max_trials: 1000,
            seed: 0,
        }
    }
}

/// Source loop timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Wait before reopening a source that failed
    pub retry_backoff_ms: u64,
    /// Pause between frames of a live source
    pub live_frame_interval_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            retry_backoff_ms: 2000,
            live_frame_interval_ms: 1000,
        }
    }
}

/// Unit vocabulary settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitsConfig {
    /// Directory of `.txt` files, one unit per line
    pub directory: Option<PathBuf>,
    /// Combined match score a unit must exceed
    pub min_score: f64,
}

impl Default for UnitsConfig {
    fn default() -> Self {
        Self {
            directory: None,
            min_score: 80.0,
        }
    }
}

/// Reading persistence settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database; defaults to the data directory
    pub database: Option<PathBuf>,
    /// Crop image directory; defaults to the data directory
    pub image_dir: Option<PathBuf>,
    /// Image reference used when a crop cannot be stored
    pub placeholder_image: String,
}

/// One monitored video source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Stable identifier used in logs and persisted readings
    pub id: String,
    /// Live camera or file-backed recording
    pub kind: SourceKind,
    /// Video file path, camera device index, stream URL or snapshot URL
    pub location: String,
    /// Frame rate used when the recording does not report one
    pub fps: f64,
    /// Delete the recording once it has been fully processed
    pub temporary: bool,
    /// Request timeout for snapshot cameras
    pub timeout_ms: u64,
    /// Alert thresholds keyed by track id
    pub thresholds: HashMap<String, Threshold>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            kind: SourceKind::Live,
            location: String::new(),
            fps: 25.0,
            temporary: false,
            timeout_ms: 5000,
            thresholds: HashMap::new(),
        }
    }
}

impl SourceConfig {
    /// Thresholds keyed by numeric track id; unparseable keys are skipped
    pub fn track_thresholds(&self) -> HashMap<u64, Threshold> {
        self.thresholds
            .iter()
            .filter_map(|(key, threshold)| key.parse().ok().map(|id| (id, *threshold)))
            .collect()
    }
}

/// Default configuration file location
pub fn default_config_path() -> Result<PathBuf> {
    Ok(crate::storage::get_config_dir()?.join("config.toml"))
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {:?}", path))?;
    let config: AppConfig = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}
