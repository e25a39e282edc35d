//! Needle geometry from segmentation output

use image::{imageops, GrayImage, Luma};
use tracing::debug;

use crate::error::GaugeError;
use crate::geometry::Point;
use crate::vision::{BoundingBox, NeedleInstance};

/// Per-frame needle analysis for one gauge crop
#[derive(Debug, Clone)]
pub struct NeedleGeometry {
    /// Needle pixels (255) with text regions cleared, at crop resolution
    pub mask: GrayImage,
    /// Farthest extremal point from the base, one per instance
    pub tips: Vec<Point>,
    /// Farthest tip overall
    pub tip: Point,
    /// Base-to-tip distance, used as the scale circle radius
    pub radius: f64,
}

/// Binary union of the instance masks, resized to the crop when needed
fn binary_mask(instances: &[NeedleInstance], width: u32, height: u32, threshold: u8) -> GrayImage {
    let mut mask = GrayImage::new(width, height);
    for instance in instances {
        let resized;
        let raw = if instance.mask.dimensions() == (width, height) {
            &instance.mask
        } else {
            resized = imageops::resize(&instance.mask, width, height, imageops::FilterType::Nearest);
            &resized
        };
        for (dst, src) in mask.pixels_mut().zip(raw.pixels()) {
            if src[0] > threshold {
                *dst = Luma([255]);
            }
        }
    }
    mask
}

fn clear_box(mask: &mut GrayImage, bbox: &BoundingBox) {
    let Some(clipped) = bbox.clip(mask.width(), mask.height()) else {
        return;
    };
    let x1 = clipped.x.floor() as u32;
    let y1 = clipped.y.floor() as u32;
    let x2 = (clipped.x2().ceil() as u32).min(mask.width());
    let y2 = (clipped.y2().ceil() as u32).min(mask.height());
    for y in y1..y2 {
        for x in x1..x2 {
            mask.put_pixel(x, y, Luma([0]));
        }
    }
}

/// Locate the needle tip and gauge radius relative to `base`
pub fn analyze_needles(
    instances: &[NeedleInstance],
    base: Point,
    text_boxes: &[BoundingBox],
    crop_size: (u32, u32),
    threshold: u8,
) -> Result<NeedleGeometry, GaugeError> {
    if instances.is_empty() {
        return Err(GaugeError::MissingNeedle);
    }

    let (width, height) = crop_size;
    let mut mask = binary_mask(instances, width, height, threshold);
    for bbox in text_boxes {
        clear_box(&mut mask, bbox);
    }

    let tips: Vec<Point> = instances
        .iter()
        .filter_map(|instance| farthest_from(base, &instance.extremes.as_array()))
        .collect();
    let tip = farthest_from(base, &tips).ok_or(GaugeError::MissingNeedle)?;
    let radius = tip.distance(base);
    if radius <= f64::EPSILON {
        return Err(GaugeError::MissingNeedle);
    }

    debug!("Needle tip ({:.1}, {:.1}), radius {:.1}", tip.x, tip.y, radius);
    Ok(NeedleGeometry {
        mask,
        tips,
        tip,
        radius,
    })
}

/// Point with the largest distance to `origin` (first wins ties)
pub fn farthest_from(origin: Point, points: &[Point]) -> Option<Point> {
    let mut best: Option<(Point, f64)> = None;
    for &p in points {
        let d = p.distance(origin);
        if best.map_or(true, |(_, bd)| d > bd) {
            best = Some((p, d));
        }
    }
    best.map(|(p, _)| p)
}
