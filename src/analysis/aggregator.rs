//! Evidence Aggregator
//!
//! OCR on a single frame is often partial: a digit is missed under glare or
//! read twice at slightly different boxes. Each track accumulates its
//! observations across frames and the combined set is reduced in two passes:
//! overlap suppression over the axis-aligned boxes, then one entry per
//! case-insensitive text.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::config::AggregationConfig;
use crate::vision::OcrObservation;

/// Accumulated text evidence for one track
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackOcrState {
    pub observations: Vec<OcrObservation>,
}

impl TrackOcrState {
    /// Observations whose text parses as a scale value
    pub fn numeric(&self) -> impl Iterator<Item = (f64, &OcrObservation)> {
        self.observations
            .iter()
            .filter_map(|o| o.numeric_value().map(|v| (v, o)))
    }

    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.observations.iter().map(|o| o.text.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }
}

/// Greedy NMS followed by text de-duplication.
///
/// Candidates scoring at or below `score_threshold` are dropped. Survivors are
/// visited by descending confidence and kept only if their IoU with every
/// kept box is at most `nms_threshold`. Among the kept ones, each lowercase
/// text keeps only its highest-confidence entry (earliest wins ties).
pub fn deduplicate(
    observations: &[OcrObservation],
    score_threshold: f32,
    nms_threshold: f64,
) -> Vec<OcrObservation> {
    let mut order: Vec<usize> = (0..observations.len())
        .filter(|&i| observations[i].confidence > score_threshold)
        .collect();
    order.sort_by(|&a, &b| {
        observations[b]
            .confidence
            .partial_cmp(&observations[a].confidence)
            .unwrap_or(Ordering::Equal)
    });

    let boxes: Vec<_> = observations.iter().map(|o| o.bounding_box()).collect();
    let mut kept: Vec<usize> = Vec::with_capacity(order.len());
    for i in order {
        if kept.iter().all(|&k| boxes[k].iou(&boxes[i]) <= nms_threshold) {
            kept.push(i);
        }
    }

    let lowered: Vec<String> = kept
        .iter()
        .map(|&i| observations[i].text.to_lowercase())
        .collect();
    let mut used: HashSet<usize> = HashSet::new();
    let mut result = Vec::with_capacity(kept.len());
    for a in 0..kept.len() {
        if used.contains(&a) {
            continue;
        }
        let mut best = a;
        for b in (a + 1)..kept.len() {
            if used.contains(&b) || lowered[a] != lowered[b] {
                continue;
            }
            used.insert(b);
            if observations[kept[b]].confidence > observations[kept[best]].confidence {
                best = b;
            }
        }
        used.insert(a);
        result.push(observations[kept[best]].clone());
    }
    result
}

/// Per-source store of [`TrackOcrState`] keyed by track id
#[derive(Debug, Default)]
pub struct EvidenceAggregator {
    config: AggregationConfig,
    states: HashMap<u64, TrackOcrState>,
}

impl EvidenceAggregator {
    pub fn new(config: AggregationConfig) -> Self {
        Self {
            config,
            states: HashMap::new(),
        }
    }

    /// Fold this frame's observations into the track's state and return it
    pub fn merge(&mut self, track_id: u64, observations: Vec<OcrObservation>) -> &TrackOcrState {
        let state = self.states.entry(track_id).or_default();

        let mut combined = std::mem::take(&mut state.observations);
        combined.extend(observations);
        state.observations = deduplicate(
            &combined,
            self.config.score_threshold,
            self.config.nms_threshold,
        );

        debug!(
            "Track {}: {} observations after aggregation ({} combined)",
            track_id,
            state.observations.len(),
            combined.len()
        );
        state
    }

    pub fn state(&self, track_id: u64) -> Option<&TrackOcrState> {
        self.states.get(&track_id)
    }

    /// Forget tracks the tracker no longer reports
    pub fn retain_tracks(&mut self, live: &[u64]) {
        self.states.retain(|id, _| live.contains(id));
    }

    pub fn tracked(&self) -> usize {
        self.states.len()
    }
}
