//! Decoded transport packets.
//!
//! The transport hands the core a [`Packet`]: the name of the data stream it
//! arrived on plus an ordered list of typed [`Field`]s.  Each sensor variant
//! decodes that list into its own payload struct with a [`PacketReader`],
//! which rejects a wrong field count or a wrong field type with
//! [`MapError::MalformedPacket`] before any handler state is touched.
//!
//! # Layouts
//!
//! | Payload | Fields |
//! |---|---|
//! | [`LaserPacket`] | `Int ts, Int flags, [Double x, Double y, Double th], [Double start, Double res, Int n, Double × n]` |
//! | [`StereoPoints`] | `Int ts, Int n, (Double x, Double y, Double z) × n` |
//! | [`StereoMeta`] | `Int ts, Double x, Double y, Double th` |
//!
//! Map packets are never decoded.

use serde::{Deserialize, Serialize};

use crate::{MapError, Point};

/// Laser flag: the packet carries a robot pose sample.
pub const LASER_HAS_POSE: i64 = 0b01;
/// Laser flag: the packet carries a range scan.
pub const LASER_HAS_SCAN: i64 = 0b10;

// ────────────────────────────────────────────────────────────────────────────
// Packet
// ────────────────────────────────────────────────────────────────────────────

/// One typed field of a packet body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Field {
    Int(i64),
    Double(f64),
    Bytes(Vec<u8>),
}

/// A packet as delivered by the transport for one named data stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub data_name: String,
    #[serde(default)]
    pub fields: Vec<Field>,
}

impl Packet {
    pub fn new(data_name: impl Into<String>) -> Self {
        Self {
            data_name: data_name.into(),
            fields: Vec::new(),
        }
    }

    /// Append an integer field (builder-style).
    pub fn int(mut self, value: i64) -> Self {
        self.fields.push(Field::Int(value));
        self
    }

    /// Append a floating-point field (builder-style).
    pub fn double(mut self, value: f64) -> Self {
        self.fields.push(Field::Double(value));
        self
    }

    /// Append an opaque byte field (builder-style).
    pub fn bytes(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.fields.push(Field::Bytes(value.into()));
        self
    }

    pub fn reader(&self) -> PacketReader<'_> {
        PacketReader {
            packet: self,
            pos: 0,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// PacketReader
// ────────────────────────────────────────────────────────────────────────────

/// Strict sequential reader over a packet's fields.
pub struct PacketReader<'a> {
    packet: &'a Packet,
    pos: usize,
}

impl<'a> PacketReader<'a> {
    fn malformed(&self, reason: String) -> MapError {
        MapError::MalformedPacket {
            data_name: self.packet.data_name.clone(),
            reason,
        }
    }

    fn next_field(&mut self, what: &str) -> Result<&'a Field, MapError> {
        let packet = self.packet;
        let field = packet
            .fields
            .get(self.pos)
            .ok_or_else(|| self.malformed(format!("missing field '{what}' at index {}", self.pos)))?;
        self.pos += 1;
        Ok(field)
    }

    /// Number of fields not yet consumed.
    pub fn remaining(&self) -> usize {
        self.packet.fields.len().saturating_sub(self.pos)
    }

    pub fn next_int(&mut self, what: &str) -> Result<i64, MapError> {
        let index = self.pos;
        match self.next_field(what)? {
            Field::Int(v) => Ok(*v),
            other => Err(self.malformed(format!(
                "field '{what}' at index {index} must be an int, got {other:?}"
            ))),
        }
    }

    pub fn next_double(&mut self, what: &str) -> Result<f64, MapError> {
        let index = self.pos;
        match self.next_field(what)? {
            Field::Double(v) => Ok(*v),
            other => Err(self.malformed(format!(
                "field '{what}' at index {index} must be a double, got {other:?}"
            ))),
        }
    }

    /// Like [`next_double`][Self::next_double], but NaN and ±inf are
    /// malformed.
    pub fn next_finite(&mut self, what: &str) -> Result<f64, MapError> {
        let index = self.pos;
        let value = self.next_double(what)?;
        if !value.is_finite() {
            return Err(self.malformed(format!("field '{what}' at index {index} is not finite ({value})")));
        }
        Ok(value)
    }

    /// Read a pose sample; every component must be finite.
    pub fn next_pose(&mut self) -> Result<PoseSample, MapError> {
        Ok(PoseSample {
            x: self.next_finite("x")?,
            y: self.next_finite("y")?,
            heading_deg: self.next_finite("heading")?,
        })
    }

    /// Read an element count and check that `per_item × count` fields remain.
    pub fn next_count(&mut self, what: &str, per_item: usize) -> Result<usize, MapError> {
        let raw = self.next_int(what)?;
        let count = usize::try_from(raw)
            .map_err(|_| self.malformed(format!("negative count {raw} for '{what}'")))?;
        let needed = count.checked_mul(per_item).unwrap_or(usize::MAX);
        if needed > self.remaining() {
            return Err(self.malformed(format!(
                "'{what}' announces {count} items but only {} fields remain",
                self.remaining()
            )));
        }
        Ok(count)
    }

    /// Fail when unread fields are left over.
    pub fn finish(self) -> Result<(), MapError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(self.malformed(format!("{n} unexpected trailing field(s)"))),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Payloads
// ────────────────────────────────────────────────────────────────────────────

/// A raw robot position/heading measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoseSample {
    pub x: f64,
    pub y: f64,
    pub heading_deg: f64,
}

/// A planar range scan: `ranges[i]` was measured at bearing
/// `start_deg + i * resolution_deg` in the sensor frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeScan {
    pub start_deg: f64,
    pub resolution_deg: f64,
    pub ranges: Vec<f64>,
}

impl RangeScan {
    /// Bearing of reading `index` in degrees.
    pub fn bearing_deg(&self, index: usize) -> f64 {
        self.start_deg + index as f64 * self.resolution_deg
    }
}

/// Decoded laser packet.
#[derive(Debug, Clone, PartialEq)]
pub struct LaserPacket {
    pub timestamp: i64,
    pub pose: Option<PoseSample>,
    pub scan: Option<RangeScan>,
}

impl LaserPacket {
    pub fn decode(packet: &Packet) -> Result<Self, MapError> {
        let mut r = packet.reader();
        let timestamp = r.next_int("timestamp")?;
        let flags = r.next_int("flags")?;
        if flags & !(LASER_HAS_POSE | LASER_HAS_SCAN) != 0 {
            return Err(MapError::MalformedPacket {
                data_name: packet.data_name.clone(),
                reason: format!("unknown laser flags {flags:#b}"),
            });
        }
        let pose = if flags & LASER_HAS_POSE != 0 {
            Some(r.next_pose()?)
        } else {
            None
        };
        let scan = if flags & LASER_HAS_SCAN != 0 {
            let start_deg = r.next_double("start angle")?;
            let resolution_deg = r.next_double("angular resolution")?;
            let n = r.next_count("range count", 1)?;
            let ranges = (0..n)
                .map(|_| r.next_double("range"))
                .collect::<Result<Vec<_>, _>>()?;
            Some(RangeScan {
                start_deg,
                resolution_deg,
                ranges,
            })
        } else {
            None
        };
        r.finish()?;
        Ok(Self {
            timestamp,
            pose,
            scan,
        })
    }

    pub fn to_packet(&self, data_name: &str) -> Packet {
        let mut flags = 0;
        if self.pose.is_some() {
            flags |= LASER_HAS_POSE;
        }
        if self.scan.is_some() {
            flags |= LASER_HAS_SCAN;
        }
        let mut packet = Packet::new(data_name).int(self.timestamp).int(flags);
        if let Some(p) = &self.pose {
            packet = packet.double(p.x).double(p.y).double(p.heading_deg);
        }
        if let Some(s) = &self.scan {
            packet = packet
                .double(s.start_deg)
                .double(s.resolution_deg)
                .int(s.ranges.len() as i64);
            for &range in &s.ranges {
                packet = packet.double(range);
            }
        }
        packet
    }
}

/// Decoded stereo-camera point batch (sensor frame).
#[derive(Debug, Clone, PartialEq)]
pub struct StereoPoints {
    pub timestamp: i64,
    pub points: Vec<Point>,
}

impl StereoPoints {
    pub fn decode(packet: &Packet) -> Result<Self, MapError> {
        let mut r = packet.reader();
        let timestamp = r.next_int("timestamp")?;
        let n = r.next_count("point count", 3)?;
        let mut points = Vec::with_capacity(n);
        for _ in 0..n {
            let x = r.next_double("x")?;
            let y = r.next_double("y")?;
            let z = r.next_double("z")?;
            points.push(Point::new(x, y, z));
        }
        r.finish()?;
        Ok(Self { timestamp, points })
    }

    pub fn to_packet(&self, data_name: &str) -> Packet {
        let mut packet = Packet::new(data_name)
            .int(self.timestamp)
            .int(self.points.len() as i64);
        for p in &self.points {
            packet = packet.double(p.x).double(p.y).double(p.z);
        }
        packet
    }
}

/// Decoded stereo-camera metadata, correlated with [`StereoPoints`] by
/// timestamp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StereoMeta {
    pub timestamp: i64,
    pub pose: PoseSample,
}

impl StereoMeta {
    pub fn decode(packet: &Packet) -> Result<Self, MapError> {
        let mut r = packet.reader();
        let timestamp = r.next_int("timestamp")?;
        let pose = r.next_pose()?;
        r.finish()?;
        Ok(Self { timestamp, pose })
    }

    pub fn to_packet(&self, data_name: &str) -> Packet {
        Packet::new(data_name)
            .int(self.timestamp)
            .double(self.pose.x)
            .double(self.pose.y)
            .double(self.pose.heading_deg)
    }
}
