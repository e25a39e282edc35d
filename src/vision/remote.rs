//! HTTP/JSON adapters for a model-serving endpoint
//!
//! Every oracle call POSTs a PNG-encoded image (base64 in a JSON body) to a
//! route under the configured endpoint:
//!
//! | route              | response                                                        |
//! |--------------------|-----------------------------------------------------------------|
//! | `/detect/gauge`    | `[{xmin, ymin, xmax, ymax, confidence, name}]`                  |
//! | `/detect/landmark` | same as above, names `base` / `minimum` / `maximum`             |
//! | `/segment/needle`  | `[{mask: <base64 png>, leftmost: [x, y], rightmost, ...}]`      |
//! | `/ocr`             | `[{polygon: [[x, y]; 4], text, confidence}]`                    |
//!
//! Calls are synchronous (`reqwest::blocking`) because they run on the
//! per-frame blocking worker.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use image::{ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{
    BoundingBox, Detection, Detector, ExtremalPoints, ModelSet, NeedleInstance, NeedleSegmenter,
    OcrObservation, TextRecognizer,
};
use crate::config::ModelsConfig;
use crate::geometry::Point;

#[derive(Serialize)]
struct ImageRequest<'a> {
    image: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    confidence: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct WireDetection {
    xmin: f64,
    ymin: f64,
    xmax: f64,
    ymax: f64,
    confidence: f32,
    name: String,
}

impl From<WireDetection> for Detection {
    fn from(d: WireDetection) -> Self {
        let bbox = BoundingBox::from_corners(Point::new(d.xmin, d.ymin), Point::new(d.xmax, d.ymax));
        Detection::new(bbox, d.confidence, d.name)
    }
}

#[derive(Debug, Deserialize)]
struct WireNeedle {
    mask: String,
    leftmost: [f64; 2],
    rightmost: [f64; 2],
    topmost: [f64; 2],
    bottommost: [f64; 2],
}

#[derive(Debug, Deserialize)]
struct WireText {
    polygon: [[f64; 2]; 4],
    text: String,
    confidence: f32,
}

fn point([x, y]: [f64; 2]) -> Point {
    Point::new(x, y)
}

/// Encode an image as base64 PNG
pub fn encode_png(image: &RgbImage) -> Result<String> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .context("Failed to encode image as PNG")?;
    Ok(BASE64.encode(bytes))
}

fn decode_mask(encoded: &str) -> Result<image::GrayImage> {
    let bytes = BASE64.decode(encoded).context("Invalid base64 mask")?;
    let mask = image::load_from_memory(&bytes).context("Failed to decode needle mask")?;
    Ok(mask.to_luma8())
}

/// Blocking JSON client shared by the individual oracles
#[derive(Clone)]
pub struct RemoteModels {
    client: reqwest::blocking::Client,
    endpoint: String,
}

impl RemoteModels {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    /// Build the full oracle set from the models section
    pub fn model_set(config: &ModelsConfig) -> Result<ModelSet> {
        let models = Self::new(&config.endpoint, Duration::from_millis(config.timeout_ms))?;
        info!("Using model server at {}", models.endpoint);

        Ok(ModelSet {
            gauge_detector: Arc::new(RemoteDetector::new(models.clone(), "detect/gauge")),
            landmark_detector: Arc::new(RemoteDetector::new(models.clone(), "detect/landmark")),
            segmenter: Arc::new(RemoteSegmenter(models.clone())),
            recognizer: Arc::new(RemoteRecognizer(models)),
        })
    }

    fn post<T: for<'de> Deserialize<'de>>(
        &self,
        route: &str,
        image: &RgbImage,
        confidence: Option<f32>,
    ) -> Result<T> {
        let encoded = encode_png(image)?;
        let url = format!("{}/{}", self.endpoint, route);

        let response = self
            .client
            .post(&url)
            .json(&ImageRequest {
                image: &encoded,
                confidence,
            })
            .send()
            .with_context(|| format!("Failed to send request to {}", url))?;

        if !response.status().is_success() {
            bail!("Model server returned status {}: {}", response.status(), url);
        }

        response
            .json()
            .with_context(|| format!("Malformed response from {}", url))
    }
}

/// Bounding-box detector behind one route
pub struct RemoteDetector {
    models: RemoteModels,
    route: &'static str,
}

impl RemoteDetector {
    pub fn new(models: RemoteModels, route: &'static str) -> Self {
        Self { models, route }
    }
}

impl Detector for RemoteDetector {
    fn detect(&self, image: &RgbImage, confidence_floor: f32) -> Result<Vec<Detection>> {
        let wire: Vec<WireDetection> = self.models.post(self.route, image, Some(confidence_floor))?;
        let detections: Vec<Detection> = wire
            .into_iter()
            .map(Detection::from)
            .filter(|d| d.confidence >= confidence_floor)
            .collect();
        debug!("{}: {} detections", self.route, detections.len());
        Ok(detections)
    }
}

/// Needle segmentation
pub struct RemoteSegmenter(RemoteModels);

impl NeedleSegmenter for RemoteSegmenter {
    fn segment(&self, image: &RgbImage) -> Result<Vec<NeedleInstance>> {
        let wire: Vec<WireNeedle> = self.0.post("segment/needle", image, None)?;
        wire.into_iter()
            .map(|n| {
                Ok(NeedleInstance {
                    mask: decode_mask(&n.mask)?,
                    extremes: ExtremalPoints {
                        leftmost: point(n.leftmost),
                        rightmost: point(n.rightmost),
                        topmost: point(n.topmost),
                        bottommost: point(n.bottommost),
                    },
                })
            })
            .collect()
    }
}

/// Text recognition; every observation is returned, the pipeline filters by confidence
pub struct RemoteRecognizer(RemoteModels);

impl TextRecognizer for RemoteRecognizer {
    fn recognize(&self, image: &RgbImage) -> Result<Vec<OcrObservation>> {
        let wire: Vec<WireText> = self.0.post("ocr", image, None)?;
        Ok(wire
            .into_iter()
            .map(|t| OcrObservation::new(t.polygon.map(point), t.text, t.confidence))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_detection_parsing() {
        let json = r#"[{"xmin": 30, "ymin": 40, "xmax": 10, "ymax": 60, "confidence": 0.9, "name": "gauge"}]"#;
        let wire: Vec<WireDetection> = serde_json::from_str(json).unwrap();
        let detection = Detection::from(wire.into_iter().next().unwrap());
        assert_eq!(detection.bbox, BoundingBox::new(10.0, 40.0, 20.0, 20.0));
        assert_eq!(detection.label, "gauge");
    }

    #[test]
    fn test_mask_roundtrip_through_base64() {
        let mut mask = image::GrayImage::new(6, 4);
        mask.put_pixel(2, 1, image::Luma([255]));
        let rgb = image::DynamicImage::ImageLuma8(mask.clone()).to_rgb8();

        let decoded = decode_mask(&encode_png(&rgb).unwrap()).unwrap();
        assert_eq!(decoded.dimensions(), (6, 4));
        assert_eq!(decoded.get_pixel(2, 1)[0], 255);
        assert_eq!(decoded.get_pixel(0, 0)[0], 0);
    }

    #[test]
    fn test_wire_text_parsing() {
        let json = r#"[{"polygon": [[0,0],[10,0],[10,5],[0,5]], "text": "40", "confidence": 0.97}]"#;
        let wire: Vec<WireText> = serde_json::from_str(json).unwrap();
        let obs = OcrObservation::new(wire[0].polygon.map(point), wire[0].text.clone(), wire[0].confidence);
        assert_eq!(obs.numeric_value(), Some(40.0));
        assert_eq!(obs.bounding_box(), BoundingBox::new(0.0, 0.0, 10.0, 5.0));
    }

    #[test]
    fn test_model_set_requires_no_connection() {
        let config = ModelsConfig::default();
        assert!(RemoteModels::model_set(&config).is_ok());
    }

    #[test]
    fn test_unreachable_server_is_an_error() {
        let models = RemoteModels::new("http://127.0.0.1:9/", Duration::from_millis(200)).unwrap();
        let detector = RemoteDetector::new(models, "detect/gauge");
        assert!(detector.detect(&RgbImage::new(4, 4), 0.5).is_err());
    }
}
