//! Frame data structures for captured video content

use chrono::{DateTime, Utc};
use image::RgbImage;

use crate::vision::BoundingBox;

/// A single captured video frame
#[derive(Debug, Clone)]
pub struct Frame {
    /// RGB pixel data
    pub image: RgbImage,
    /// Wall-clock capture time
    pub timestamp: DateTime<Utc>,
}

impl Frame {
    /// Create a new frame stamped with the current time
    pub fn new(image: RgbImage) -> Self {
        Self {
            image,
            timestamp: Utc::now(),
        }
    }

    /// Get frame dimensions as (width, height)
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

/// Copy the pixels under `bbox`, clipped to the image; `None` if nothing is left
pub fn crop_region(image: &RgbImage, bbox: &BoundingBox) -> Option<RgbImage> {
    let (width, height) = image.dimensions();
    let clipped = bbox.clip(width, height)?;

    let x = clipped.x.floor() as u32;
    let y = clipped.y.floor() as u32;
    let w = (clipped.x2().ceil() as u32).min(width).saturating_sub(x);
    let h = (clipped.y2().ceil() as u32).min(height).saturating_sub(y);
    if w == 0 || h == 0 {
        return None;
    }

    Some(image::imageops::crop_imm(image, x, y, w, h).to_image())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_frame_dimensions() {
        let frame = Frame::new(RgbImage::new(64, 48));
        assert_eq!(frame.dimensions(), (64, 48));
    }

    #[test]
    fn test_crop_region_clips_to_bounds() {
        let mut image = RgbImage::new(20, 10);
        image.put_pixel(19, 9, Rgb([255, 0, 0]));

        let crop = crop_region(&image, &BoundingBox::new(15.0, 5.0, 30.0, 30.0)).unwrap();
        assert_eq!(crop.dimensions(), (5, 5));
        assert_eq!(crop.get_pixel(4, 4), &Rgb([255, 0, 0]));
    }

    #[test]
    fn test_crop_region_negative_origin() {
        let image = RgbImage::new(20, 10);
        let crop = crop_region(&image, &BoundingBox::new(-5.0, -5.0, 10.0, 10.0)).unwrap();
        assert_eq!(crop.dimensions(), (5, 5));
    }

    #[test]
    fn test_crop_region_outside_image() {
        let image = RgbImage::new(20, 10);
        assert!(crop_region(&image, &BoundingBox::new(30.0, 30.0, 10.0, 10.0)).is_none());
    }
}
