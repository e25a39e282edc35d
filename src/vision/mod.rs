//! Vision Layer
//!
//! The reading pipeline treats every learned model as an opaque oracle behind
//! a one-method capability trait:
//! - [`Detector`] for gauge regions and base/minimum/maximum landmarks
//! - [`NeedleSegmenter`] for needle masks
//! - [`TextRecognizer`] for dial digits and unit labels
//!
//! Concrete adapters are injected through [`ModelSet`]; the bundled one talks
//! to a model-serving endpoint over HTTP (see [`remote`]).

pub mod ocr;
pub mod preprocess;
pub mod remote;

use anyhow::Result;
use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::geometry::Point;

pub use ocr::OcrObservation;
pub use preprocess::{flatten_illumination, preprocess_frame, PreprocessConfig};
pub use remote::RemoteModels;

/// Axis-aligned rectangle in pixel space (x, y is the top-left corner)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    /// Build from two opposite corners in any order
    pub fn from_corners(a: Point, b: Point) -> Self {
        let x = a.x.min(b.x);
        let y = a.y.min(b.y);
        Self::new(x, y, a.x.max(b.x) - x, a.y.max(b.y) - y)
    }

    /// Smallest box containing every point; `None` for an empty slice
    pub fn from_points(points: &[Point]) -> Option<Self> {
        let first = points.first()?;
        let (mut min, mut max) = (*first, *first);
        for p in &points[1..] {
            min.x = min.x.min(p.x);
            min.y = min.y.min(p.y);
            max.x = max.x.max(p.x);
            max.y = max.y.max(p.y);
        }
        Some(Self::from_corners(min, max))
    }

    pub fn x2(&self) -> f64 {
        self.x + self.width
    }

    pub fn y2(&self) -> f64 {
        self.y + self.height
    }

    pub fn area(&self) -> f64 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Intersection over union; zero when either box is empty
    pub fn iou(&self, other: &BoundingBox) -> f64 {
        let w = (self.x2().min(other.x2()) - self.x.max(other.x)).max(0.0);
        let h = (self.y2().min(other.y2()) - self.y.max(other.y)).max(0.0);
        let intersection = w * h;
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            return 0.0;
        }
        intersection / union
    }

    /// Clip to `[0, width] x [0, height]`; `None` if nothing remains
    pub fn clip(&self, width: u32, height: u32) -> Option<BoundingBox> {
        let x1 = self.x.max(0.0);
        let y1 = self.y.max(0.0);
        let x2 = self.x2().min(width as f64);
        let y2 = self.y2().min(height as f64);
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some(BoundingBox::new(x1, y1, x2 - x1, y2 - y1))
    }
}

/// One detector hit
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    /// Confidence score (0.0 - 1.0)
    pub confidence: f32,
    pub label: String,
}

impl Detection {
    pub fn new(bbox: BoundingBox, confidence: f32, label: impl Into<String>) -> Self {
        Self {
            bbox,
            confidence,
            label: label.into(),
        }
    }
}

/// Outermost points of a needle contour
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ExtremalPoints {
    pub leftmost: Point,
    pub rightmost: Point,
    pub topmost: Point,
    pub bottommost: Point,
}

impl ExtremalPoints {
    pub fn as_array(&self) -> [Point; 4] {
        [self.leftmost, self.rightmost, self.topmost, self.bottommost]
    }

    /// Extremes of a set of mask pixels; `None` if the mask is empty
    pub fn from_mask(mask: &GrayImage, threshold: u8) -> Option<Self> {
        let mut pixels = mask
            .enumerate_pixels()
            .filter(|(_, _, p)| p[0] > threshold)
            .map(|(x, y, _)| Point::new(x as f64, y as f64));

        let first = pixels.next()?;
        let mut extremes = ExtremalPoints {
            leftmost: first,
            rightmost: first,
            topmost: first,
            bottommost: first,
        };
        for p in pixels {
            if p.x < extremes.leftmost.x {
                extremes.leftmost = p;
            }
            if p.x > extremes.rightmost.x {
                extremes.rightmost = p;
            }
            if p.y < extremes.topmost.y {
                extremes.topmost = p;
            }
            if p.y > extremes.bottommost.y {
                extremes.bottommost = p;
            }
        }
        Some(extremes)
    }
}

/// One segmented needle
#[derive(Debug, Clone)]
pub struct NeedleInstance {
    /// Raw mask at crop resolution (0 = background)
    pub mask: GrayImage,
    pub extremes: ExtremalPoints,
}

/// Bounding-box detector (gauges, landmarks)
pub trait Detector: Send + Sync {
    fn detect(&self, image: &RgbImage, confidence_floor: f32) -> Result<Vec<Detection>>;
}

/// Instance segmentation of needles in a gauge crop
pub trait NeedleSegmenter: Send + Sync {
    fn segment(&self, image: &RgbImage) -> Result<Vec<NeedleInstance>>;
}

/// Text detection plus recognition on a gauge crop
pub trait TextRecognizer: Send + Sync {
    fn recognize(&self, image: &RgbImage) -> Result<Vec<OcrObservation>>;
}

/// The oracles shared by every source runner
#[derive(Clone)]
pub struct ModelSet {
    pub gauge_detector: Arc<dyn Detector>,
    pub landmark_detector: Arc<dyn Detector>,
    pub segmenter: Arc<dyn NeedleSegmenter>,
    pub recognizer: Arc<dyn TextRecognizer>,
}

impl std::fmt::Debug for ModelSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSet").finish_non_exhaustive()
    }
}
