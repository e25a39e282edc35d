//! Robust Line Calibrator
//!
//! Maps a needle angle to a scale value. Printed scales are only locally
//! linear, so the (angle, value) samples are explained by a short list of
//! line segments extracted one after another with RANSAC. A new segment whose
//! direction is within `merge_angle_deg` of the previous one is folded into
//! it instead of being appended.

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use super::ransac::{ransac, Estimator, RansacOptions};
use crate::config::CalibrationConfig;
use crate::error::GaugeError;
use crate::geometry::{angle_between, Point};

const EPS: f64 = 1e-9;

/// Infinite line through `origin` along the unit vector `direction`.
///
/// Directions are canonical: `x >= 0`, and `y > 0` when `x == 0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineModel {
    pub origin: Point,
    pub direction: Point,
}

fn canonical(direction: Point) -> Point {
    if direction.x < 0.0 || (direction.x == 0.0 && direction.y < 0.0) {
        direction * -1.0
    } else {
        direction
    }
}

impl LineModel {
    /// Line through two distinct points
    pub fn through(a: Point, b: Point) -> Option<Self> {
        let direction = (b - a).normalized()?;
        Some(Self {
            origin: a,
            direction: canonical(direction),
        })
    }

    /// Total least squares fit (principal axis of the point cloud)
    pub fn fit(points: &[Point]) -> Option<Self> {
        if points.len() < 2 {
            return None;
        }
        let n = points.len() as f64;
        let mean = points.iter().fold(Point::default(), |acc, &p| acc + p) * (1.0 / n);

        let (mut sxx, mut syy, mut sxy) = (0.0, 0.0, 0.0);
        for p in points {
            let d = *p - mean;
            sxx += d.x * d.x;
            syy += d.y * d.y;
            sxy += d.x * d.y;
        }
        if sxx + syy < EPS {
            return None;
        }

        let theta = 0.5 * (2.0 * sxy).atan2(sxx - syy);
        Some(Self {
            origin: mean,
            direction: canonical(Point::new(theta.cos(), theta.sin())),
        })
    }

    /// Perpendicular distance from `point` to the line
    pub fn distance(&self, point: Point) -> f64 {
        (point - self.origin).cross(self.direction).abs()
    }

    /// y on the line at `x`; `None` for a vertical line
    pub fn predict(&self, x: f64) -> Option<f64> {
        if self.direction.x.abs() < EPS {
            return None;
        }
        Some(self.origin.y + (x - self.origin.x) * self.direction.y / self.direction.x)
    }

    /// Angle in degrees between the two line directions
    pub fn angle_to(&self, other: &LineModel) -> f64 {
        angle_between(self.direction, other.direction).unwrap_or(0.0)
    }
}

struct LineEstimator;

impl Estimator for LineEstimator {
    type Datum = Point;
    type Model = LineModel;

    const MIN_SAMPLES: usize = 2;

    fn fit(data: &[Point], idx: &[usize]) -> Option<LineModel> {
        LineModel::through(data[idx[0]], data[idx[1]])
    }

    fn residual(model: &LineModel, datum: &Point) -> f64 {
        model.distance(*datum)
    }

    fn is_degenerate(data: &[Point], idx: &[usize]) -> bool {
        idx[0] == idx[1] || data[idx[0]].distance(data[idx[1]]) < EPS
    }

    fn refit(data: &[Point], inliers: &[usize]) -> Option<LineModel> {
        let points: Vec<Point> = inliers.iter().map(|&i| data[i]).collect();
        LineModel::fit(&points)
    }
}

/// One locally linear scale segment
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationLine {
    /// (angle, value) samples supporting the segment
    pub inliers: Vec<Point>,
    pub model: LineModel,
}

impl CalibrationLine {
    /// Scale value at a reading angle
    pub fn predict(&self, angle: f64) -> Option<f64> {
        self.model.predict(angle)
    }
}

/// Median of a non-empty slice (mean of the middle pair for even lengths)
fn median(values: &mut [f64]) -> f64 {
    values.sort_by(f64::total_cmp);
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}

/// Median absolute deviation over both axes pooled together
pub fn median_absolute_deviation(points: &[Point]) -> f64 {
    if points.is_empty() {
        return 0.0;
    }
    let mx = median(&mut points.iter().map(|p| p.x).collect::<Vec<_>>());
    let my = median(&mut points.iter().map(|p| p.y).collect::<Vec<_>>());

    let mut deviations: Vec<f64> = points
        .iter()
        .flat_map(|p| [(p.x - mx).abs(), (p.y - my).abs()])
        .collect();
    median(&mut deviations)
}

/// Append `candidate`, or fold it into the last line when their directions
/// differ by less than `merge_angle_deg`
pub fn merge_or_push(lines: &mut Vec<CalibrationLine>, candidate: CalibrationLine, merge_angle_deg: f64) {
    if let Some(last) = lines.last_mut() {
        let angle = last.model.angle_to(&candidate.model);
        if angle < merge_angle_deg {
            let mut inliers = std::mem::take(&mut last.inliers);
            inliers.extend(candidate.inliers);
            let model = LineModel::fit(&inliers).unwrap_or(last.model);
            debug!(
                "Merged calibration segment ({:.2} deg apart), {} samples",
                angle,
                inliers.len()
            );
            *last = CalibrationLine { inliers, model };
            return;
        }
    }
    lines.push(candidate);
}

/// Iterative multi-line RANSAC over (angle, value) samples
pub struct LineCalibrator {
    config: CalibrationConfig,
}

impl LineCalibrator {
    pub fn new(config: CalibrationConfig) -> Self {
        Self { config }
    }

    /// Inlier threshold for one round: nominal distance scaled by 1 / MAD
    fn round_threshold(&self, points: &[Point]) -> f64 {
        let mad = median_absolute_deviation(points);
        if mad > EPS {
            self.config.max_distance / mad
        } else {
            self.config.max_distance
        }
    }

    /// Extract calibration segments in discovery order
    pub fn fit(&self, samples: &[Point]) -> Result<Vec<CalibrationLine>, GaugeError> {
        if samples.len() < 2 {
            return Err(GaugeError::CalibrationFailure(format!(
                "{} scale samples, need at least 2",
                samples.len()
            )));
        }

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut remaining: Vec<Point> = samples.to_vec();
        let mut lines: Vec<CalibrationLine> = Vec::new();

        for round in 0..self.config.iterations {
            if remaining.len() < 2 {
                break;
            }

            let opts = RansacOptions {
                max_iters: self.config.max_trials,
                thresh: self.round_threshold(&remaining),
                min_inliers: 2,
                ..Default::default()
            };
            let result = ransac::<LineEstimator, _>(&remaining, &opts, &mut rng);
            let Some(model) = result.model else {
                continue;
            };
            if result.inliers.len() < self.config.min_inliers {
                continue;
            }

            let mut inliers = Vec::with_capacity(result.inliers.len());
            let mut rest = Vec::with_capacity(remaining.len() - result.inliers.len());
            for (i, p) in remaining.into_iter().enumerate() {
                if result.inliers.binary_search(&i).is_ok() {
                    inliers.push(p);
                } else {
                    rest.push(p);
                }
            }
            remaining = rest;

            debug!(
                "Calibration round {}: {} inliers, threshold {:.4}, direction ({:.3}, {:.3})",
                round,
                inliers.len(),
                opts.thresh,
                model.direction.x,
                model.direction.y
            );
            merge_or_push(
                &mut lines,
                CalibrationLine { inliers, model },
                self.config.merge_angle_deg,
            );
        }

        if lines.is_empty() {
            return Err(GaugeError::CalibrationFailure(
                "no consensus line found".to_string(),
            ));
        }
        Ok(lines)
    }
}
