//! Planar geometry for gauge faces
//!
//! Coordinates are image pixels with y growing downward. Angles are degrees,
//! positive in the clockwise-on-screen direction.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::ops::{Add, Mul, Sub};

/// A point (or vector) in pixel space
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean length
    pub fn norm(self) -> f64 {
        self.x.hypot(self.y)
    }

    /// Euclidean distance to another point
    pub fn distance(self, other: Point) -> f64 {
        (self - other).norm()
    }

    pub fn dot(self, other: Point) -> f64 {
        self.x * other.x + self.y * other.y
    }

    /// z-component of the 2-D cross product
    pub fn cross(self, other: Point) -> f64 {
        self.x * other.y - self.y * other.x
    }

    /// Unit vector in the same direction, `None` for a zero-length vector
    pub fn normalized(self) -> Option<Point> {
        let n = self.norm();
        if n <= f64::EPSILON || !n.is_finite() {
            return None;
        }
        Some(Point::new(self.x / n, self.y / n))
    }

    /// Point reflection through `center`
    pub fn reflect_through(self, center: Point) -> Point {
        Point::new(2.0 * center.x - self.x, 2.0 * center.y - self.y)
    }

    /// Mirror across the vertical axis through `center`, keeping y
    pub fn mirror_horizontally(self, center: Point) -> Point {
        Point::new(2.0 * center.x - self.x, self.y)
    }

    /// Midpoint between two points
    pub fn midpoint(self, other: Point) -> Point {
        Point::new((self.x + other.x) / 2.0, (self.y + other.y) / 2.0)
    }
}

impl Add for Point {
    type Output = Point;

    fn add(self, rhs: Point) -> Point {
        Point::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Point {
    type Output = Point;

    fn sub(self, rhs: Point) -> Point {
        Point::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Mul<f64> for Point {
    type Output = Point;

    fn mul(self, rhs: f64) -> Point {
        Point::new(self.x * rhs, self.y * rhs)
    }
}

/// Signed angle from `from` to `to` about `center`, in `[0, 360)`.
///
/// Returns `None` when either point coincides with the center.
pub fn central_angle(center: Point, from: Point, to: Point) -> Option<f64> {
    let v1 = (from - center).normalized()?;
    let v2 = (to - center).normalized()?;

    let mut angle = v1.dot(v2).clamp(-1.0, 1.0).acos();
    if v1.cross(v2) < 0.0 {
        angle = 2.0 * PI - angle;
    }

    Some(angle.to_degrees().rem_euclid(360.0))
}

/// Needle angle measured from the minimum landmark.
///
/// Same as [`central_angle`], but when the angle overshoots the dial's span
/// and the target sits below the reference point it is shifted by -360 so a
/// needle resting just before the zero mark reads as a small negative angle.
pub fn reading_angle(center: Point, reference: Point, target: Point, span: f64) -> Option<f64> {
    let angle = central_angle(center, reference, target)?;
    if angle > span && target.y > reference.y {
        return Some(angle - 360.0);
    }
    Some(angle)
}

/// Radial projection of `point` onto the circle of `radius` around `center`
pub fn project_onto_circle(point: Point, center: Point, radius: f64) -> Point {
    let theta = (point.y - center.y).atan2(point.x - center.x);
    Point::new(
        center.x + radius * theta.cos(),
        center.y + radius * theta.sin(),
    )
}

/// Unsigned angle in degrees between two direction vectors
pub fn angle_between(a: Point, b: Point) -> Option<f64> {
    let a = a.normalized()?;
    let b = b.normalized()?;
    Some(a.dot(b).clamp(-1.0, 1.0).acos().to_degrees())
}
