//! `mapfuse-types` – shared data model for the mapping server.
//!
//! Everything that crosses a crate boundary lives here: points and clouds,
//! robot poses, decoded transport packets and the global [`MapError`].
//!
//! # Modules
//!
//! - [`packet`] – [`Packet`][packet::Packet] field lists as delivered by the
//!   transport, a strict [`PacketReader`][packet::PacketReader], and the
//!   per-sensor payload decoders.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod packet;

pub use packet::{Field, LaserPacket, Packet, PacketReader, PoseSample, RangeScan, StereoMeta, StereoPoints};

// ────────────────────────────────────────────────────────────────────────────
// Color
// ────────────────────────────────────────────────────────────────────────────

/// An 8-bit-per-channel RGB display tag attached to a point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Unpack a `0xRRGGBB` tag as used in configuration files.
    pub const fn from_packed(rgb: u32) -> Self {
        Self {
            r: ((rgb >> 16) & 0xff) as u8,
            g: ((rgb >> 8) & 0xff) as u8,
            b: (rgb & 0xff) as u8,
        }
    }

    /// Pack into `0xRRGGBB`.
    pub const fn packed(self) -> u32 {
        ((self.r as u32) << 16) | ((self.g as u32) << 8) | self.b as u32
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Point
// ────────────────────────────────────────────────────────────────────────────

/// A 3-D position (metres) with an optional display color.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<Color>,
}

impl Point {
    /// Create an uncolored point.
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z, color: None }
    }

    /// Return a copy of this point carrying `color`.
    pub const fn with_color(self, color: Color) -> Self {
        Self {
            color: Some(color),
            ..self
        }
    }

    /// True when all three coordinates are finite.
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    pub fn distance_sq(&self, other: &Point) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        dx * dx + dy * dy + dz * dz
    }

    pub fn distance(&self, other: &Point) -> f64 {
        self.distance_sq(other).sqrt()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// RobotPose
// ────────────────────────────────────────────────────────────────────────────

/// One robot localisation sample as stored in a handler's path history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RobotPose {
    pub position: Point,
    /// Heading in degrees, counter-clockwise from +X.
    pub heading_deg: f64,
    /// Transport timestamp in monotonic clock units (milliseconds).
    pub timestamp: i64,
}

impl RobotPose {
    pub fn new(position: Point, heading_deg: f64, timestamp: i64) -> Self {
        Self {
            position,
            heading_deg,
            timestamp,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// PointCloud
// ────────────────────────────────────────────────────────────────────────────

/// An ordered set of points.
///
/// This is the value type exchanged with the spatial reducers and published
/// as a handler's display snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointCloud {
    points: Vec<Point>,
}

impl PointCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            points: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Point> {
        self.points.iter()
    }

    pub fn push(&mut self, point: Point) {
        self.points.push(point);
    }

    pub fn extend_from_slice(&mut self, points: &[Point]) {
        self.points.extend_from_slice(points);
    }

    pub fn into_points(self) -> Vec<Point> {
        self.points
    }

    /// Axis-aligned `(min, max)` corners of the cloud, or `None` when empty.
    pub fn bounds(&self) -> Option<(Point, Point)> {
        let first = self.points.first()?;
        let mut min = Point::new(first.x, first.y, first.z);
        let mut max = min;
        for p in &self.points[1..] {
            min.x = min.x.min(p.x);
            min.y = min.y.min(p.y);
            min.z = min.z.min(p.z);
            max.x = max.x.max(p.x);
            max.y = max.y.max(p.y);
            max.z = max.z.max(p.z);
        }
        Some((min, max))
    }
}

impl From<Vec<Point>> for PointCloud {
    fn from(points: Vec<Point>) -> Self {
        Self { points }
    }
}

impl FromIterator<Point> for PointCloud {
    fn from_iter<I: IntoIterator<Item = Point>>(iter: I) -> Self {
        Self {
            points: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a PointCloud {
    type Item = &'a Point;
    type IntoIter = std::slice::Iter<'a, Point>;

    fn into_iter(self) -> Self::IntoIter {
        self.points.iter()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// TimestampedCloud
// ────────────────────────────────────────────────────────────────────────────

/// One packet's worth of common-frame points.
///
/// Deliberately not `Clone`: a batch moves from the handler that assembled it
/// into that handler's cloud history and is dropped on eviction.
#[derive(Debug)]
pub struct TimestampedCloud {
    points: Vec<Point>,
    timestamp: i64,
}

impl TimestampedCloud {
    pub fn new(points: Vec<Point>, timestamp: i64) -> Self {
        Self { points, timestamp }
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn into_points(self) -> Vec<Point> {
        self.points
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SensorKind
// ────────────────────────────────────────────────────────────────────────────

/// The sensor variants a handler can be built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Laser,
    StereoCamera,
    Map,
}

impl std::fmt::Display for SensorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SensorKind::Laser => write!(f, "laser"),
            SensorKind::StereoCamera => write!(f, "stereo_camera"),
            SensorKind::Map => write!(f, "map"),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Global error type for the ingestion pipeline.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MapError {
    #[error("Malformed packet on '{data_name}': {reason}")]
    MalformedPacket { data_name: String, reason: String },

    #[error("Out-of-order timestamp: {received} precedes {previous}")]
    OutOfOrderTimestamp { previous: i64, received: i64 },

    #[error("Pose filter diverged: covariance trace {trace}")]
    FilterDivergence { trace: f64 },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Non-finite coordinate ({x}, {y}, {z})")]
    NonFiniteCoordinate { x: f64, y: f64, z: f64 },

    #[error("Persistence failure at {path}: {details}")]
    Persistence { path: String, details: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_packing() {
        let c = Color::from_packed(0x12ab7f);
        assert_eq!(c, Color::new(0x12, 0xab, 0x7f));
        assert_eq!(c.packed(), 0x12ab7f);
    }

    #[test]
    fn point_distance() {
        let a = Point::new(0.0, 0.0, 0.0);
        let b = Point::new(3.0, 4.0, 0.0);
        assert!((a.distance(&b) - 5.0).abs() < 1e-12);
        assert!(!Point::new(f64::NAN, 0.0, 0.0).is_finite());
    }

    #[test]
    fn cloud_bounds() {
        let cloud: PointCloud = vec![
            Point::new(1.0, -2.0, 0.5),
            Point::new(-1.0, 3.0, 0.0),
            Point::new(0.0, 0.0, 2.0),
        ]
        .into();
        let (min, max) = cloud.bounds().expect("non-empty");
        assert_eq!((min.x, min.y, min.z), (-1.0, -2.0, 0.0));
        assert_eq!((max.x, max.y, max.z), (1.0, 3.0, 2.0));
        assert!(PointCloud::new().bounds().is_none());
    }

    #[test]
    fn uncolored_point_serialises_without_color() {
        let json = serde_json::to_string(&Point::new(1.0, 2.0, 3.0)).unwrap();
        assert!(!json.contains("color"));
        let back: Point = serde_json::from_str(&json).unwrap();
        assert_eq!(back.color, None);
    }

    #[test]
    fn sensor_kind_parses_snake_case() {
        let kind: SensorKind = serde_json::from_str("\"stereo_camera\"").unwrap();
        assert_eq!(kind, SensorKind::StereoCamera);
        assert_eq!(kind.to_string(), "stereo_camera");
    }

    #[test]
    fn map_error_display() {
        let err = MapError::OutOfOrderTimestamp {
            previous: 20,
            received: 10,
        };
        assert!(err.to_string().contains("10 precedes 20"));

        let err = MapError::MalformedPacket {
            data_name: "laser".to_string(),
            reason: "missing range count".to_string(),
        };
        assert!(err.to_string().contains("laser"));
    }
}
