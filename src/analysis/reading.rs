//! Reading Computer: needle angle to scale value

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::calibration::CalibrationLine;
use super::landmarks::LandmarkSet;
use super::scale::ScaleMark;
use crate::error::GaugeError;
use crate::geometry::{central_angle, reading_angle, Point};

/// A computed gauge value, the pipeline's externally visible output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    /// Matched unit, empty when none was recognized
    pub unit: String,
    /// Where the gauge crop was stored
    pub image_ref: String,
}

/// Angular span of the dial from minimum to maximum
pub fn dial_span(landmarks: &LandmarkSet) -> Result<f64, GaugeError> {
    central_angle(landmarks.base, landmarks.minimum.point, landmarks.maximum.point)
        .ok_or(GaugeError::IncompleteLandmarks("landmark coincides with base"))
}

/// Needle angle from the minimum landmark, folded back into the dial span
pub fn needle_angle(landmarks: &LandmarkSet, span: f64, tip: Point) -> Result<f64, GaugeError> {
    let angle = reading_angle(landmarks.base, landmarks.minimum.point, tip, span)
        .ok_or(GaugeError::MissingNeedle)?;
    if angle > span {
        return Ok(360.0 - angle);
    }
    Ok(angle)
}

/// (angle, value) samples for the calibrator; marks at the base are skipped
pub fn calibration_samples(marks: &[ScaleMark], landmarks: &LandmarkSet) -> Vec<Point> {
    marks
        .iter()
        .filter_map(|mark| {
            central_angle(landmarks.base, landmarks.minimum.point, mark.point)
                .map(|angle| Point::new(angle, mark.value))
        })
        .collect()
}

/// Evaluate the first calibration segment at `angle`, rounded to 4 decimals
pub fn compute_value(lines: &[CalibrationLine], angle: f64) -> Result<f64, GaugeError> {
    let line = lines
        .first()
        .ok_or_else(|| GaugeError::CalibrationFailure("no calibration line".to_string()))?;
    let value = line
        .predict(angle)
        .filter(|v| v.is_finite())
        .ok_or_else(|| GaugeError::CalibrationFailure("calibration line is vertical".to_string()))?;
    Ok((value * 10_000.0).round() / 10_000.0)
}
