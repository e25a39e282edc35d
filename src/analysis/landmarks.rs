//! Base / minimum / maximum landmark resolution
//!
//! The landmark detector often misses the minimum or maximum stop. Missing
//! ones are filled from, in order: the lowest scale mark on the matching side
//! of the base, the needle extreme on that side, and finally point reflection
//! of the opposite landmark through the base. A resolved pair whose heights
//! disagree by more than a fraction of the crop height is treated as a
//! misdetection and the weaker landmark is mirrored from the stronger one.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::scale::ScaleMark;
use crate::error::GaugeError;
use crate::geometry::Point;
use crate::vision::{Detection, ExtremalPoints};

/// Where a landmark position came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LandmarkSource {
    Detected,
    ScaleMark,
    NeedleExtreme,
    Mirrored,
    Reflected,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Landmark {
    pub point: Point,
    /// Detector confidence; zero for derived landmarks
    pub confidence: f32,
    pub source: LandmarkSource,
}

impl Landmark {
    fn derived(point: Point, source: LandmarkSource) -> Self {
        Self {
            point,
            confidence: 0.0,
            source,
        }
    }
}

/// Landmarks as reported by the detector for one crop
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawLandmarks {
    pub base: Option<Landmark>,
    pub minimum: Option<Landmark>,
    pub maximum: Option<Landmark>,
}

impl RawLandmarks {
    /// First detection whose label mentions each landmark name
    pub fn from_detections(detections: &[Detection]) -> Self {
        let find = |name: &str| {
            detections
                .iter()
                .find(|d| d.label.to_lowercase().contains(name))
                .map(|d| Landmark {
                    point: d.bbox.center(),
                    confidence: d.confidence,
                    source: LandmarkSource::Detected,
                })
        };
        Self {
            base: find("base"),
            minimum: find("minimum"),
            maximum: find("maximum"),
        }
    }
}

/// Fully resolved landmarks for one crop
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LandmarkSet {
    pub base: Point,
    pub minimum: Landmark,
    pub maximum: Landmark,
}

/// Inputs for the fallback chain
#[derive(Debug, Clone, Copy)]
pub struct FallbackEvidence<'a> {
    pub scale_marks: &'a [ScaleMark],
    /// Extremes of the first needle instance
    pub needle: Option<&'a ExtremalPoints>,
    pub crop_height: u32,
    /// Maximum |min.y - max.y| as a fraction of the crop height
    pub asymmetry_ratio: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

impl Side {
    fn contains(self, base: Point, p: Point) -> bool {
        match self {
            Side::Left => p.x < base.x,
            Side::Right => p.x >= base.x,
        }
    }
}

fn lowest_scale_mark(marks: &[ScaleMark], base: Point, side: Side) -> Option<Landmark> {
    let mut best: Option<Point> = None;
    for mark in marks.iter().filter(|m| side.contains(base, m.point)) {
        if best.map_or(true, |b| mark.point.y > b.y) {
            best = Some(mark.point);
        }
    }
    best.map(|p| Landmark::derived(p, LandmarkSource::ScaleMark))
}

fn farthest_needle_extreme(needle: &ExtremalPoints, base: Point, side: Side) -> Option<Landmark> {
    let candidates: Vec<Point> = needle
        .as_array()
        .into_iter()
        .filter(|p| side.contains(base, *p))
        .collect();
    super::needle::farthest_from(base, &candidates)
        .map(|p| Landmark::derived(p, LandmarkSource::NeedleExtreme))
}

/// Apply the fallback chain; fails only when neither side can be resolved
pub fn resolve_landmarks(raw: &RawLandmarks, evidence: &FallbackEvidence<'_>) -> Result<LandmarkSet, GaugeError> {
    let base = raw.base.ok_or(GaugeError::MissingBase)?.point;

    let mut minimum = raw.minimum;
    let mut maximum = raw.maximum;

    if minimum.is_none() {
        minimum = lowest_scale_mark(evidence.scale_marks, base, Side::Left);
    }
    if maximum.is_none() {
        maximum = lowest_scale_mark(evidence.scale_marks, base, Side::Right);
    }

    if let Some(needle) = evidence.needle {
        if minimum.is_none() {
            minimum = farthest_needle_extreme(needle, base, Side::Left);
        }
        if maximum.is_none() {
            maximum = farthest_needle_extreme(needle, base, Side::Right);
        }
    }

    if let (Some(min), Some(max)) = (minimum, maximum) {
        let tolerance = evidence.crop_height as f64 * evidence.asymmetry_ratio;
        if (min.point.y - max.point.y).abs() > tolerance {
            // Replace the weaker one; on equal confidence, the one higher on screen
            let replace_min = min.confidence < max.confidence
                || (min.confidence == max.confidence && min.point.y < max.point.y);
            if replace_min {
                minimum = Some(Landmark::derived(
                    max.point.mirror_horizontally(base),
                    LandmarkSource::Mirrored,
                ));
            } else {
                maximum = Some(Landmark::derived(
                    min.point.mirror_horizontally(base),
                    LandmarkSource::Mirrored,
                ));
            }
            debug!(
                "Asymmetric landmarks (dy {:.1} > {:.1}), mirrored the {}",
                (min.point.y - max.point.y).abs(),
                tolerance,
                if replace_min { "minimum" } else { "maximum" }
            );
        }
    }

    let (minimum, maximum) = match (minimum, maximum) {
        (Some(min), Some(max)) => (min, max),
        (Some(min), None) => (
            min,
            Landmark::derived(min.point.reflect_through(base), LandmarkSource::Reflected),
        ),
        (None, Some(max)) => (
            Landmark::derived(max.point.reflect_through(base), LandmarkSource::Reflected),
            max,
        ),
        (None, None) => return Err(GaugeError::IncompleteLandmarks("minimum and maximum")),
    };

    Ok(LandmarkSet {
        base,
        minimum,
        maximum,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::BoundingBox;

    fn detected(x: f64, y: f64, confidence: f32) -> Option<Landmark> {
        Some(Landmark {
            point: Point::new(x, y),
            confidence,
            source: LandmarkSource::Detected,
        })
    }

    fn no_evidence() -> FallbackEvidence<'static> {
        FallbackEvidence {
            scale_marks: &[],
            needle: None,
            crop_height: 200,
            asymmetry_ratio: 0.05,
        }
    }

    #[test]
    fn test_from_detections_uses_box_centers() {
        let detections = vec![
            Detection::new(BoundingBox::new(90.0, 90.0, 20.0, 20.0), 0.9, "base"),
            Detection::new(BoundingBox::new(10.0, 130.0, 20.0, 20.0), 0.8, "minimum"),
            Detection::new(BoundingBox::new(0.0, 0.0, 4.0, 4.0), 0.7, "minimum"),
        ];
        let raw = RawLandmarks::from_detections(&detections);
        assert_eq!(raw.base.unwrap().point, Point::new(100.0, 100.0));
        assert_eq!(raw.minimum.unwrap().point, Point::new(20.0, 140.0));
        assert!(raw.maximum.is_none());
    }

    #[test]
    fn test_missing_base() {
        let raw = RawLandmarks {
            minimum: detected(20.0, 140.0, 0.9),
            ..Default::default()
        };
        assert!(matches!(
            resolve_landmarks(&raw, &no_evidence()),
            Err(GaugeError::MissingBase)
        ));
    }

    #[test]
    fn test_single_landmark_reflected_through_base() {
        let raw = RawLandmarks {
            base: detected(100.0, 100.0, 0.9),
            minimum: detected(20.0, 140.0, 0.9),
            maximum: None,
        };
        let set = resolve_landmarks(&raw, &no_evidence()).unwrap();
        assert_eq!(set.maximum.point, Point::new(180.0, 60.0));
        assert_eq!(set.maximum.source, LandmarkSource::Reflected);
        assert_eq!(set.minimum.point, Point::new(20.0, 140.0));
    }

    #[test]
    fn test_scale_mark_fallback_picks_lowest_on_side() {
        let raw = RawLandmarks {
            base: detected(100.0, 100.0, 0.9),
            ..Default::default()
        };
        let marks = [
            ScaleMark { value: 0.0, point: Point::new(40.0, 150.0) },
            ScaleMark { value: 10.0, point: Point::new(30.0, 100.0) },
            ScaleMark { value: 90.0, point: Point::new(170.0, 100.0) },
            ScaleMark { value: 100.0, point: Point::new(160.0, 152.0) },
        ];
        let evidence = FallbackEvidence {
            scale_marks: &marks,
            ..no_evidence()
        };
        let set = resolve_landmarks(&raw, &evidence).unwrap();
        assert_eq!(set.minimum.point, Point::new(40.0, 150.0));
        assert_eq!(set.maximum.point, Point::new(160.0, 152.0));
        assert_eq!(set.minimum.source, LandmarkSource::ScaleMark);
    }

    #[test]
    fn test_needle_extreme_fallback() {
        let raw = RawLandmarks {
            base: detected(100.0, 100.0, 0.9),
            maximum: detected(170.0, 150.0, 0.9),
            ..Default::default()
        };
        let needle = ExtremalPoints {
            leftmost: Point::new(30.0, 150.0),
            rightmost: Point::new(105.0, 100.0),
            topmost: Point::new(90.0, 95.0),
            bottommost: Point::new(40.0, 152.0),
        };
        let evidence = FallbackEvidence {
            needle: Some(&needle),
            ..no_evidence()
        };
        let set = resolve_landmarks(&raw, &evidence).unwrap();
        assert_eq!(set.minimum.point, Point::new(30.0, 150.0));
        assert_eq!(set.minimum.source, LandmarkSource::NeedleExtreme);
    }

    #[test]
    fn test_asymmetric_pair_mirrors_weaker_landmark() {
        let raw = RawLandmarks {
            base: detected(100.0, 100.0, 0.9),
            minimum: detected(30.0, 150.0, 0.95),
            maximum: detected(170.0, 120.0, 0.6),
        };
        let set = resolve_landmarks(&raw, &no_evidence()).unwrap();
        assert_eq!(set.minimum.point, Point::new(30.0, 150.0));
        assert_eq!(set.maximum.point, Point::new(170.0, 150.0));
        assert_eq!(set.maximum.source, LandmarkSource::Mirrored);
    }

    #[test]
    fn test_asymmetric_tie_replaces_higher_landmark() {
        let raw = RawLandmarks {
            base: detected(100.0, 100.0, 0.9),
            minimum: detected(30.0, 110.0, 0.8),
            maximum: detected(160.0, 150.0, 0.8),
        };
        let set = resolve_landmarks(&raw, &no_evidence()).unwrap();
        assert_eq!(set.minimum.point, Point::new(40.0, 150.0));
        assert_eq!(set.maximum.point, Point::new(160.0, 150.0));
    }

    #[test]
    fn test_symmetric_pair_untouched() {
        let raw = RawLandmarks {
            base: detected(100.0, 100.0, 0.9),
            minimum: detected(30.0, 150.0, 0.8),
            maximum: detected(168.0, 155.0, 0.9),
        };
        let set = resolve_landmarks(&raw, &no_evidence()).unwrap();
        assert_eq!(set.minimum.source, LandmarkSource::Detected);
        assert_eq!(set.maximum.source, LandmarkSource::Detected);
    }

    #[test]
    fn test_unresolvable() {
        let raw = RawLandmarks {
            base: detected(100.0, 100.0, 0.9),
            ..Default::default()
        };
        assert!(matches!(
            resolve_landmarks(&raw, &no_evidence()),
            Err(GaugeError::IncompleteLandmarks(_))
        ));
    }
}
