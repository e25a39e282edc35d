//! Greedy IoU tracker
//!
//! Gauges are mostly static in the frame, so appearance features add little:
//! boxes are matched to tracks by descending IoU. A track is tentative until
//! it has been matched `n_init` consecutive times; a tentative track that
//! misses a frame is dropped, a confirmed one coasts for up to `max_age`
//! frames before it is deleted.

use image::RgbImage;
use std::cmp::Ordering;
use tracing::debug;

use super::{Track, Tracker};
use crate::config::TrackerConfig;
use crate::vision::{BoundingBox, Detection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrackState {
    Tentative,
    Confirmed,
}

#[derive(Debug, Clone)]
struct TrackedGauge {
    id: u64,
    label: String,
    bbox: BoundingBox,
    state: TrackState,
    hits: u32,
    misses: u32,
}

/// Built-in [`Tracker`] adapter
pub struct IouTracker {
    config: TrackerConfig,
    tracks: Vec<TrackedGauge>,
    next_id: u64,
}

impl IouTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: Vec::new(),
            next_id: 1,
        }
    }

    /// Number of live tracks, tentative ones included
    pub fn live_tracks(&self) -> usize {
        self.tracks.len()
    }

    /// Drop detections overlapping a more confident one by more than `nms_max_overlap`
    fn suppress_duplicates<'a>(&self, detections: &'a [Detection]) -> Vec<&'a Detection> {
        let mut sorted: Vec<&Detection> = detections.iter().collect();
        sorted.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(Ordering::Equal));

        let mut kept: Vec<&Detection> = Vec::with_capacity(sorted.len());
        for det in sorted {
            if kept
                .iter()
                .all(|k| k.bbox.iou(&det.bbox) <= self.config.nms_max_overlap)
            {
                kept.push(det);
            }
        }
        kept
    }
}

impl Tracker for IouTracker {
    fn update(&mut self, detections: &[Detection], _frame: &RgbImage) -> Vec<Track> {
        let detections = self.suppress_duplicates(detections);

        let mut pairs: Vec<(usize, usize, f64)> = Vec::new();
        for (ti, track) in self.tracks.iter().enumerate() {
            for (di, det) in detections.iter().enumerate() {
                if track.label != det.label {
                    continue;
                }
                let score = track.bbox.iou(&det.bbox);
                if score >= self.config.min_iou {
                    pairs.push((ti, di, score));
                }
            }
        }
        pairs.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(Ordering::Equal));

        let mut track_matched = vec![false; self.tracks.len()];
        let mut det_matched = vec![false; detections.len()];
        for (ti, di, _) in pairs {
            if track_matched[ti] || det_matched[di] {
                continue;
            }
            track_matched[ti] = true;
            det_matched[di] = true;

            let track = &mut self.tracks[ti];
            track.bbox = detections[di].bbox;
            track.hits += 1;
            track.misses = 0;
            if track.state == TrackState::Tentative && track.hits >= self.config.n_init {
                track.state = TrackState::Confirmed;
                debug!("Track {} confirmed after {} hits", track.id, track.hits);
            }
        }

        for (track, matched) in self.tracks.iter_mut().zip(&track_matched) {
            if !matched {
                track.misses += 1;
            }
        }
        let max_age = self.config.max_age;
        self.tracks.retain(|t| match t.state {
            TrackState::Tentative => t.misses == 0,
            TrackState::Confirmed => t.misses <= max_age,
        });

        for (det, matched) in detections.iter().zip(&det_matched) {
            if *matched {
                continue;
            }
            let state = if self.config.n_init <= 1 {
                TrackState::Confirmed
            } else {
                TrackState::Tentative
            };
            self.tracks.push(TrackedGauge {
                id: self.next_id,
                label: det.label.clone(),
                bbox: det.bbox,
                state,
                hits: 1,
                misses: 0,
            });
            self.next_id += 1;
        }

        self.tracks
            .iter()
            .filter(|t| t.state == TrackState::Confirmed)
            .map(|t| Track {
                track_id: t.id,
                label: t.label.clone(),
                bbox: t.bbox,
            })
            .collect()
    }
}
