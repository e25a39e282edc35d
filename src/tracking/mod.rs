//! Gauge Tracking
//!
//! Gives each detected gauge a stable `track_id` across frames so per-gauge
//! evidence (OCR history, thresholds) can be keyed on it. Association is the
//! tracker adapter's job; [`GaugeTracker`] only normalizes its output.

pub mod iou;

use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::vision::{BoundingBox, Detection};

pub use iou::IouTracker;

/// A confirmed detection lineage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub track_id: u64,
    pub label: String,
    pub bbox: BoundingBox,
}

/// Multi-object tracker capability
pub trait Tracker: Send {
    /// Associate this frame's detections and return the confirmed tracks
    fn update(&mut self, detections: &[Detection], frame: &RgbImage) -> Vec<Track>;
}

/// Wraps a tracker adapter and clips its tracks to the frame
pub struct GaugeTracker {
    inner: Box<dyn Tracker>,
}

impl GaugeTracker {
    pub fn new(inner: Box<dyn Tracker>) -> Self {
        Self { inner }
    }

    /// Confirmed tracks with boxes clipped to frame bounds; empty boxes are dropped
    pub fn update(&mut self, detections: &[Detection], frame: &RgbImage) -> Vec<Track> {
        let (width, height) = frame.dimensions();
        self.inner
            .update(detections, frame)
            .into_iter()
            .filter_map(|track| {
                let bbox = track.bbox.clip(width, height)?;
                Some(Track { bbox, ..track })
            })
            .collect()
    }
}
