//! Per-source processing
//!
//! [`FramePipeline`] is the context object for one source: it owns the
//! tracker and the per-track OCR evidence, shares the read-only oracles and
//! unit vocabulary, and turns one frame into one outcome per tracked gauge.
//! [`runner::SourceRunner`] drives it from a video source.

pub mod runner;

use chrono::{DateTime, Utc};
use image::RgbImage;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::analysis::{
    analyze_needles, calibration_samples, compute_value, dial_span, extract_scale_marks,
    needle_angle, resolve_landmarks, EvidenceAggregator, FallbackEvidence, LineCalibrator,
    RawLandmarks, TrackOcrState, UnitVocabulary,
};
use crate::capture::{crop_region, Frame};
use crate::config::{AppConfig, ModelsConfig, ScaleConfig};
use crate::error::GaugeError;
use crate::tracking::{GaugeTracker, IouTracker, Tracker};
use crate::vision::{flatten_illumination, preprocess_frame, BoundingBox, ModelSet, PreprocessConfig};

pub use runner::{RunnerSettings, RunnerState, SourceHandle, SourceRunner};

/// Result of processing one tracked gauge in one frame
#[derive(Debug)]
pub struct RegionOutcome {
    pub track_id: u64,
    pub label: String,
    /// Preprocessed crop the analysis ran on
    pub crop: RgbImage,
    /// Unit matched in this frame's recognized text
    pub unit: Option<String>,
    /// Reading value, or why none could be computed this frame
    pub result: Result<f64, GaugeError>,
}

/// Result of processing one frame
#[derive(Debug)]
pub struct FrameOutcome {
    pub timestamp: DateTime<Utc>,
    pub regions: Vec<RegionOutcome>,
}

/// Geometry tuning shared by every region of a source
#[derive(Debug, Clone, Default)]
pub struct PipelineSettings {
    pub models: ModelsConfig,
    pub scale: ScaleConfig,
    pub preprocess: PreprocessConfig,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            models: config.models.clone(),
            scale: config.scale.clone(),
            preprocess: config.preprocess.clone(),
        }
    }
}

/// Frame-to-readings pipeline for a single source
pub struct FramePipeline {
    models: ModelSet,
    tracker: GaugeTracker,
    aggregator: EvidenceAggregator,
    units: Arc<UnitVocabulary>,
    calibrator: LineCalibrator,
    settings: PipelineSettings,
}

impl FramePipeline {
    /// Pipeline with the built-in IoU tracker
    pub fn new(models: ModelSet, units: Arc<UnitVocabulary>, config: &AppConfig) -> Self {
        Self::with_tracker(
            models,
            Box::new(IouTracker::new(config.tracker.clone())),
            units,
            config,
        )
    }

    pub fn with_tracker(
        models: ModelSet,
        tracker: Box<dyn Tracker>,
        units: Arc<UnitVocabulary>,
        config: &AppConfig,
    ) -> Self {
        Self {
            models,
            tracker: GaugeTracker::new(tracker),
            aggregator: EvidenceAggregator::new(config.aggregation.clone()),
            units,
            calibrator: LineCalibrator::new(config.calibration.clone()),
            settings: PipelineSettings::from_config(config),
        }
    }

    /// Accumulated OCR evidence for a track
    pub fn ocr_state(&self, track_id: u64) -> Option<&TrackOcrState> {
        self.aggregator.state(track_id)
    }

    /// Run detection, tracking and per-region analysis on one frame.
    ///
    /// Fails only for frame-level conditions (no gauge, detector failure);
    /// per-region failures are carried in [`RegionOutcome::result`].
    pub fn process(&mut self, frame: &Frame) -> Result<FrameOutcome, GaugeError> {
        let image = preprocess_frame(&frame.image, &self.settings.preprocess);

        let detections = self
            .models
            .gauge_detector
            .detect(&image, self.settings.models.gauge_confidence)
            .map_err(GaugeError::Oracle)?;
        if detections.is_empty() {
            // Empty frames still age tracks so gauges that left the view expire
            let tracks = self.tracker.update(&[], &image);
            let live: Vec<u64> = tracks.iter().map(|t| t.track_id).collect();
            self.aggregator.retain_tracks(&live);
            return Err(GaugeError::NoGaugeDetected);
        }

        let tracks = self.tracker.update(&detections, &image);
        debug!("{} detections, {} confirmed tracks", detections.len(), tracks.len());

        let mut regions = Vec::with_capacity(tracks.len());
        for track in &tracks {
            let Some(crop) = crop_region(&image, &track.bbox) else {
                continue;
            };

            let min_confidence = self.settings.models.ocr_min_confidence;
            let (unit, result) = match self.models.recognizer.recognize(&crop) {
                Ok(mut observations) => {
                    observations.retain(|o| o.confidence >= min_confidence);
                    let unit = self.units.detect(observations.iter().map(|o| o.text.as_str()));
                    let state = self.aggregator.merge(track.track_id, observations).clone();
                    (unit, self.analyze_region(&crop, &state))
                }
                Err(e) => (None, Err(GaugeError::Oracle(e))),
            };

            if let Err(e) = &result {
                warn!("Track {}: no reading this frame: {}", track.track_id, e);
            }
            regions.push(RegionOutcome {
                track_id: track.track_id,
                label: track.label.clone(),
                crop,
                unit,
                result,
            });
        }

        let live: Vec<u64> = tracks.iter().map(|t| t.track_id).collect();
        self.aggregator.retain_tracks(&live);

        Ok(FrameOutcome {
            timestamp: frame.timestamp,
            regions,
        })
    }

    /// Landmarks, needle, scale marks and calibration for one gauge crop
    fn analyze_region(&self, crop: &RgbImage, state: &TrackOcrState) -> Result<f64, GaugeError> {
        let scale = &self.settings.scale;

        let landmark_detections = self
            .models
            .landmark_detector
            .detect(crop, self.settings.models.landmark_confidence)
            .map_err(GaugeError::Oracle)?;
        let raw = RawLandmarks::from_detections(&landmark_detections);
        let base = raw.base.ok_or(GaugeError::MissingBase)?.point;

        let segmentation_input = if self.settings.preprocess.remove_shadows {
            flatten_illumination(crop, self.settings.preprocess.shadow_sigma)
        } else {
            crop.clone()
        };
        let instances = self
            .models
            .segmenter
            .segment(&segmentation_input)
            .map_err(GaugeError::Oracle)?;

        let text_boxes: Vec<BoundingBox> = state.observations.iter().map(|o| o.bounding_box()).collect();
        let needle = analyze_needles(
            &instances,
            base,
            &text_boxes,
            crop.dimensions(),
            scale.needle_mask_threshold,
        )?;

        let marks = extract_scale_marks(crop, &needle.mask, &state.observations, base, needle.radius, scale);

        let evidence = FallbackEvidence {
            scale_marks: &marks,
            needle: instances.first().map(|i| &i.extremes),
            crop_height: crop.height(),
            asymmetry_ratio: scale.asymmetry_ratio,
        };
        let landmarks = resolve_landmarks(&raw, &evidence)?;

        let span = dial_span(&landmarks)?;
        let angle = needle_angle(&landmarks, span, needle.tip)?;
        debug!(
            "Landmarks base {:?} min {:?} max {:?}, span {:.2}, needle angle {:.2}",
            landmarks.base, landmarks.minimum.point, landmarks.maximum.point, span, angle
        );

        let samples = calibration_samples(&marks, &landmarks);
        let lines = self.calibrator.fit(&samples)?;
        compute_value(&lines, angle)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Stub oracles drawing a synthetic 270 degree dial

    use super::*;
    use crate::geometry::Point;
    use crate::vision::{
        Detection, Detector, ExtremalPoints, NeedleInstance, NeedleSegmenter, OcrObservation,
        TextRecognizer,
    };
    use anyhow::Result;
    use image::{GrayImage, Luma, Rgb};

    pub const SIZE: u32 = 400;
    pub const BASE: Point = Point { x: 200.0, y: 200.0 };
    pub const RADIUS: f64 = 120.0;

    /// Position on the dial, `degrees` clockwise on screen from the minimum stop
    pub fn dial_point(degrees: f64) -> Point {
        // Minimum sits 135 degrees counter-clockwise of 12 o'clock
        let clock = (degrees - 135.0).to_radians();
        Point::new(BASE.x + RADIUS * clock.sin(), BASE.y - RADIUS * clock.cos())
    }

    /// White face with a dark rim well outside the needle circle
    pub fn dial_image() -> RgbImage {
        RgbImage::from_fn(SIZE, SIZE, |x, y| {
            let d = Point::new(x as f64, y as f64).distance(BASE);
            if (175.0..=185.0).contains(&d) {
                Rgb([20, 20, 20])
            } else {
                Rgb([240, 240, 240])
            }
        })
    }

    fn centered(p: Point, w: f64, h: f64) -> BoundingBox {
        BoundingBox::new(p.x - w / 2.0, p.y - h / 2.0, w, h)
    }

    pub struct WholeFrame(pub bool);

    impl Detector for WholeFrame {
        fn detect(&self, image: &RgbImage, _confidence_floor: f32) -> Result<Vec<Detection>> {
            if !self.0 {
                return Ok(vec![]);
            }
            let (w, h) = image.dimensions();
            Ok(vec![Detection::new(BoundingBox::new(0.0, 0.0, w as f64, h as f64), 0.9, "gauge")])
        }
    }

    pub struct Landmarks {
        pub with_base: bool,
    }

    impl Detector for Landmarks {
        fn detect(&self, _image: &RgbImage, _confidence_floor: f32) -> Result<Vec<Detection>> {
            let mut detections = vec![
                Detection::new(centered(dial_point(0.0), 10.0, 10.0), 0.9, "minimum"),
                Detection::new(centered(dial_point(270.0), 10.0, 10.0), 0.9, "maximum"),
            ];
            if self.with_base {
                detections.push(Detection::new(centered(BASE, 12.0, 12.0), 0.95, "base"));
            }
            Ok(detections)
        }
    }

    /// Single needle from the base to `degrees` on the dial
    pub struct Needle(pub f64);

    impl NeedleSegmenter for Needle {
        fn segment(&self, image: &RgbImage) -> Result<Vec<NeedleInstance>> {
            let tip = dial_point(self.0);
            let mut mask = GrayImage::new(image.width(), image.height());
            for i in 0..=100 {
                let p = BASE + (tip - BASE) * (i as f64 / 100.0);
                mask.put_pixel(p.x as u32, p.y as u32, Luma([255]));
            }
            let extremes = ExtremalPoints {
                leftmost: BASE,
                rightmost: tip,
                topmost: tip,
                bottommost: BASE,
            };
            Ok(vec![NeedleInstance { mask, extremes }])
        }
    }

    pub struct Labels;

    impl TextRecognizer for Labels {
        fn recognize(&self, _image: &RgbImage) -> Result<Vec<OcrObservation>> {
            Ok(vec![
                // value = angle / 2.7, kept clear of the landmark stops
                OcrObservation::from_box(centered(dial_point(27.0), 16.0, 12.0), "10", 0.95),
                OcrObservation::from_box(centered(dial_point(135.0), 16.0, 12.0), "50", 0.93),
                OcrObservation::from_box(centered(dial_point(243.0), 16.0, 12.0), "90", 0.97),
                OcrObservation::from_box(centered(Point::new(200.0, 260.0), 24.0, 12.0), "PSI", 0.9),
            ])
        }
    }

    pub fn models(needle_degrees: f64, with_base: bool) -> ModelSet {
        ModelSet {
            gauge_detector: Arc::new(WholeFrame(true)),
            landmark_detector: Arc::new(Landmarks { with_base }),
            segmenter: Arc::new(Needle(needle_degrees)),
            recognizer: Arc::new(Labels),
        }
    }

    pub fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.tracker.n_init = 1;
        config.preprocess = PreprocessConfig {
            enabled: false,
            remove_shadows: false,
            ..Default::default()
        };
        config
    }

    pub fn units() -> Arc<UnitVocabulary> {
        Arc::new(UnitVocabulary::new(["psi", "bar", "kPa"], 80.0))
    }

    pub fn pipeline(needle_degrees: f64, with_base: bool) -> FramePipeline {
        FramePipeline::new(models(needle_degrees, with_base), units(), &config())
    }
}
