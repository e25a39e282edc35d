//! OCR observations
//!
//! The recognizer returns quadrilaterals (text may be rotated along the dial),
//! while suppression and mark matching work on axis-aligned boxes.

use serde::{Deserialize, Serialize};

use super::BoundingBox;
use crate::geometry::Point;

/// Single recognized text item in a gauge crop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrObservation {
    /// Corner points, clockwise from top-left
    pub polygon: [Point; 4],
    /// Recognized text
    pub text: String,
    /// Recognition confidence
    pub confidence: f32,
}

impl OcrObservation {
    pub fn new(polygon: [Point; 4], text: impl Into<String>, confidence: f32) -> Self {
        Self {
            polygon,
            text: text.into(),
            confidence,
        }
    }

    /// Observation whose polygon is exactly `bbox`
    pub fn from_box(bbox: BoundingBox, text: impl Into<String>, confidence: f32) -> Self {
        let polygon = [
            Point::new(bbox.x, bbox.y),
            Point::new(bbox.x2(), bbox.y),
            Point::new(bbox.x2(), bbox.y2()),
            Point::new(bbox.x, bbox.y2()),
        ];
        Self::new(polygon, text, confidence)
    }

    /// Axis-aligned rectangle enclosing the polygon
    pub fn bounding_box(&self) -> BoundingBox {
        BoundingBox::from_points(&self.polygon).unwrap_or_default()
    }

    /// Text parsed as a scale value, if it is a finite number
    pub fn numeric_value(&self) -> Option<f64> {
        let value: f64 = self.text.trim().parse().ok()?;
        value.is_finite().then_some(value)
    }

    /// Mean distance from the polygon's corners to `point`
    pub fn mean_corner_distance(&self, point: Point) -> f64 {
        self.polygon.iter().map(|c| c.distance(point)).sum::<f64>() / 4.0
    }
}
