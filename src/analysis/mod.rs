//! Gauge Analysis
//!
//! Everything between the oracle outputs for one gauge crop and a numeric
//! reading: OCR evidence fusion, needle and scale geometry, landmark
//! fallbacks, robust calibration, unit matching and alert evaluation.
//! All of it is synchronous and runs to completion per frame.

pub mod aggregator;
pub mod calibration;
pub mod events;
pub mod landmarks;
pub mod needle;
pub mod ransac;
pub mod reading;
pub mod scale;
pub mod units;

pub use aggregator::{EvidenceAggregator, TrackOcrState};
pub use calibration::{CalibrationLine, LineCalibrator};
pub use events::{evaluate, AlertEvent, AlertStatus, Threshold};
pub use landmarks::{resolve_landmarks, FallbackEvidence, LandmarkSet, RawLandmarks};
pub use needle::{analyze_needles, NeedleGeometry};
pub use reading::{calibration_samples, compute_value, dial_span, needle_angle, Reading};
pub use scale::{extract_scale_marks, ScaleMark};
pub use units::UnitVocabulary;
