//! Scale-mark extraction
//!
//! Tick marks are found as contour points of the binarized crop that lie on
//! the needle's circle, after the needle and the printed text have been
//! painted over. Each numeric label is then pinned to the closest mark, or to
//! its own center when no mark is near.

use image::{GrayImage, Luma, RgbImage};
use imageproc::contours::find_contours;
use imageproc::contrast::otsu_level;
use imageproc::distance_transform::Norm;
use imageproc::drawing::draw_polygon_mut;
use imageproc::morphology::erode;
use tracing::debug;

use crate::config::ScaleConfig;
use crate::geometry::{project_onto_circle, Point};
use crate::vision::OcrObservation;

/// A numeric label pinned to a pixel position on the scale circle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleMark {
    pub value: f64,
    pub point: Point,
}

/// Otsu-binarized crop with text and needle painted white
pub fn mask_for_marks(crop: &RgbImage, needle_mask: &GrayImage, observations: &[OcrObservation]) -> GrayImage {
    let gray = image::DynamicImage::ImageRgb8(crop.clone()).to_luma8();
    let level = otsu_level(&gray);
    let mut binary = GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        if gray.get_pixel(x, y)[0] > level {
            Luma([255])
        } else {
            Luma([0])
        }
    });

    for obs in observations {
        fill_text(&mut binary, obs);
    }

    if needle_mask.dimensions() == binary.dimensions() {
        for (dst, needle) in binary.pixels_mut().zip(needle_mask.pixels()) {
            if needle[0] > 0 {
                *dst = Luma([255]);
            }
        }
    }
    binary
}

fn fill_text(image: &mut GrayImage, obs: &OcrObservation) {
    let mut corners: Vec<imageproc::point::Point<i32>> = obs
        .polygon
        .iter()
        .map(|p| imageproc::point::Point::new(p.x.round() as i32, p.y.round() as i32))
        .collect();
    corners.dedup();
    while corners.len() > 1 && corners.first() == corners.last() {
        corners.pop();
    }
    if corners.len() >= 3 {
        draw_polygon_mut(image, &corners, Luma([255]));
    }
}

/// Merge each point into the first earlier point closer than `min_distance`
/// (replacing it with their midpoint), otherwise keep it
pub fn merge_nearby_points(points: &[Point], min_distance: f64) -> Vec<Point> {
    let mut merged: Vec<Point> = Vec::new();
    for &p in points {
        match merged.iter_mut().find(|m| m.distance(p) < min_distance) {
            Some(m) => *m = m.midpoint(p),
            None => merged.push(p),
        }
    }
    merged
}

/// Contour points on the scale circle, merged and projected onto it
pub fn find_mark_candidates(masked: &GrayImage, base: Point, radius: f64, config: &ScaleConfig) -> Vec<Point> {
    let eroded = erode(masked, Norm::LInf, config.erode_radius);

    let on_circle: Vec<Point> = find_contours::<u32>(&eroded)
        .iter()
        .flat_map(|contour| contour.points.iter())
        .map(|p| Point::new(p.x as f64, p.y as f64))
        .filter(|p| (p.distance(base) - radius).abs() < config.circle_tolerance_px)
        .collect();

    merge_nearby_points(&on_circle, config.merge_distance_px)
        .into_iter()
        .map(|p| project_onto_circle(p, base, radius))
        .collect()
}

/// Closest candidate by mean corner distance, or the text center when every
/// candidate is farther than `threshold`
pub fn nearest_mark(obs: &OcrObservation, candidates: &[Point], threshold: f64) -> Point {
    let mut best: Option<(Point, f64)> = None;
    for &c in candidates {
        let d = obs.mean_corner_distance(c);
        if best.map_or(true, |(_, bd)| d < bd) {
            best = Some((c, d));
        }
    }
    match best {
        Some((point, distance)) if distance <= threshold => point,
        _ => obs.bounding_box().center(),
    }
}

/// Pin every numeric label of the crop to a scale position, sorted by value
pub fn extract_scale_marks(
    crop: &RgbImage,
    needle_mask: &GrayImage,
    observations: &[OcrObservation],
    base: Point,
    radius: f64,
    config: &ScaleConfig,
) -> Vec<ScaleMark> {
    let masked = mask_for_marks(crop, needle_mask, observations);
    let candidates = find_mark_candidates(&masked, base, radius, config);

    let mut marks: Vec<ScaleMark> = Vec::new();
    for obs in observations {
        let Some(value) = obs.numeric_value() else {
            continue;
        };
        let point = nearest_mark(obs, &candidates, config.text_distance_threshold_px);
        // A repeated label keeps its latest position
        match marks.iter_mut().find(|m| m.value == value) {
            Some(mark) => mark.point = point,
            None => marks.push(ScaleMark { value, point }),
        }
    }
    marks.sort_by(|a, b| a.value.total_cmp(&b.value));

    debug!(
        "{} mark candidates on circle r={:.1}, {} labelled marks",
        candidates.len(),
        radius,
        marks.len()
    );
    marks
}
