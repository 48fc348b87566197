//! Sensor handlers.
//!
//! A [`SensorHandler`] owns everything derived from one configured sensor of
//! one connected robot: the path history, the rolling per-packet clouds, the
//! pose filter and (for accumulating sensors) the display cloud.  What it does
//! with a packet depends on its [`HandlerVariant`]:
//!
//! | Variant | `handle` | `handle2` | Display cloud |
//! |---|---|---|---|
//! | [`Laser`][HandlerVariant::Laser]               | pose and/or range scan | – | yes |
//! | [`StereoCamera`][HandlerVariant::StereoCamera] | point batch            | pose metadata, same timestamp | yes |
//! | [`Map`][HandlerVariant::Map]                   | relayed verbatim to every other client | – | no |
//!
//! Packets arrive through [`SensorHandler::deliver`], which never fails: a
//! malformed packet is logged, counted and discarded with the handler state
//! untouched.
//!
//! # Example
//!
//! ```rust
//! use mapfuse_perception::reduce::LeafSize;
//! use mapfuse_perception::transform::FrameTransform;
//! use mapfuse_server::handler::{HandlerInfo, HandlerOptions, HandlerVariant, SensorHandler};
//! use mapfuse_types::{LaserPacket, RangeScan};
//!
//! let variant = HandlerVariant::laser("laser", FrameTransform::identity("laser"), LeafSize::uniform(0.05)).unwrap();
//! let handler = SensorHandler::new(HandlerInfo::new("robot1", "laser"), variant, HandlerOptions::default());
//!
//! let scan = LaserPacket {
//!     timestamp: 1,
//!     pose: None,
//!     scan: Some(RangeScan { start_deg: 0.0, resolution_deg: 90.0, ranges: vec![1.0, 2.0] }),
//! };
//! handler.deliver(scan.to_packet("laser"));
//! assert_eq!(handler.display_cloud().unwrap().len(), 2);
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mapfuse_middleware::{ClientHub, ClientId, PacketBus, Subscription};
use mapfuse_perception::pose_filter::{KalmanPoseFilter, PoseFilter};
use mapfuse_perception::reduce::{stats_filter_with, LeafSize};
use mapfuse_perception::transform::FrameTransform;
use mapfuse_types::{
    Color, LaserPacket, MapError, Packet, Point, PointCloud, PoseSample, RangeScan, RobotPose, SensorKind,
    StereoMeta, StereoPoints, TimestampedCloud,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::display::DisplayCloud;
use crate::history::RingBuffer;
use crate::persist::{write_path_json, write_pcd};

pub const DEFAULT_HISTORY_CAPACITY: usize = 1024;
pub const DEFAULT_MAX_PENDING: usize = 16;
pub const DEFAULT_REQUEST_FREQ_MS: u64 = 100;
pub const DEFAULT_ROBOT_COLOR: Color = Color::new(0, 255, 0);

// ────────────────────────────────────────────────────────────────────────────
// Construction parameters
// ────────────────────────────────────────────────────────────────────────────

/// Who a handler belongs to and how it is labelled.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerInfo {
    pub robot_id: String,
    /// Sensor label, unique per robot; names the handler's output files.
    pub sensor_name: String,
    pub request_freq_ms: u64,
    /// Tag applied to every accumulated point.
    pub color: Option<Color>,
    /// Tag applied to the path cloud.
    pub robot_color: Color,
}

impl HandlerInfo {
    pub fn new(robot_id: impl Into<String>, sensor_name: impl Into<String>) -> Self {
        Self {
            robot_id: robot_id.into(),
            sensor_name: sensor_name.into(),
            request_freq_ms: DEFAULT_REQUEST_FREQ_MS,
            color: None,
            robot_color: DEFAULT_ROBOT_COLOR,
        }
    }
}

/// Bounds and policies of a handler's mutable state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HandlerOptions {
    /// Capacity of both the path history and the cloud history.
    pub history_capacity: usize,
    /// Reject (instead of accept and flag) packets older than the newest seen.
    pub reject_out_of_order: bool,
    /// Unmatched stereo halves kept per stream before the oldest is evicted.
    pub max_pending: usize,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            reject_out_of_order: false,
            max_pending: DEFAULT_MAX_PENDING,
        }
    }
}

/// The sensor-specific part of a handler.  Each variant owns only what it
/// needs.
#[derive(Debug)]
pub enum HandlerVariant {
    Laser {
        data_name: String,
        mount: FrameTransform,
        display: DisplayCloud,
    },
    StereoCamera {
        points_name: String,
        meta_name: String,
        mount: FrameTransform,
        display: DisplayCloud,
        stats_k: usize,
        stats_std_mul: f64,
    },
    Map {
        data_name: String,
        hub: ClientHub,
        /// The connection this handler receives from; never relayed back to.
        origin: ClientId,
    },
}

impl HandlerVariant {
    pub fn laser(data_name: impl Into<String>, mount: FrameTransform, leaf: LeafSize) -> Result<Self, MapError> {
        Ok(Self::Laser {
            data_name: data_name.into(),
            mount,
            display: DisplayCloud::new(leaf)?,
        })
    }

    /// # Errors
    ///
    /// [`MapError::InvalidParameter`] for a bad leaf size, `stats_k == 0` or
    /// a non-finite multiplier.
    pub fn stereo_camera(
        points_name: impl Into<String>,
        meta_name: impl Into<String>,
        mount: FrameTransform,
        leaf: LeafSize,
        stats_k: usize,
        stats_std_mul: f64,
    ) -> Result<Self, MapError> {
        if stats_k == 0 || !stats_std_mul.is_finite() {
            return Err(MapError::InvalidParameter(format!(
                "stereo stats filter needs k > 0 and a finite multiplier, got k={stats_k}, std_mul={stats_std_mul}"
            )));
        }
        Ok(Self::StereoCamera {
            points_name: points_name.into(),
            meta_name: meta_name.into(),
            mount,
            display: DisplayCloud::new(leaf)?,
            stats_k,
            stats_std_mul,
        })
    }

    pub fn map(data_name: impl Into<String>, hub: ClientHub, origin: ClientId) -> Self {
        Self::Map {
            data_name: data_name.into(),
            hub,
            origin,
        }
    }

    pub fn kind(&self) -> SensorKind {
        match self {
            Self::Laser { .. } => SensorKind::Laser,
            Self::StereoCamera { .. } => SensorKind::StereoCamera,
            Self::Map { .. } => SensorKind::Map,
        }
    }

    pub fn data_names(&self) -> Vec<&str> {
        match self {
            Self::Laser { data_name, .. } | Self::Map { data_name, .. } => vec![data_name.as_str()],
            Self::StereoCamera {
                points_name, meta_name, ..
            } => vec![points_name.as_str(), meta_name.as_str()],
        }
    }

    fn display(&self) -> Option<&DisplayCloud> {
        match self {
            Self::Laser { display, .. } | Self::StereoCamera { display, .. } => Some(display),
            Self::Map { .. } => None,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Statistics
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Counters {
    packets: AtomicU64,
    malformed: AtomicU64,
    out_of_order: AtomicU64,
    divergences: AtomicU64,
    dropped_points: AtomicU64,
    unmatched_stereo: AtomicU64,
    discarded_batches: AtomicU64,
    relayed: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

/// Point-in-time copy of a handler's anomaly counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerStats {
    pub packets: u64,
    pub malformed: u64,
    pub out_of_order: u64,
    pub divergences: u64,
    /// Points discarded for non-finite coordinates.
    pub dropped_points: u64,
    /// Stereo halves evicted without ever meeting their counterpart.
    pub unmatched_stereo: u64,
    /// Stereo batches too small for the outlier filter.
    pub discarded_batches: u64,
    /// Map packets queued for other clients.
    pub relayed: u64,
}

/// What [`SensorHandler::write_to`] produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerExport {
    pub handler_id: String,
    pub kind: SensorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_file: Option<PathBuf>,
    pub points: usize,
    pub poses: usize,
    pub stats: HandlerStats,
}

// ────────────────────────────────────────────────────────────────────────────
// SensorHandler
// ────────────────────────────────────────────────────────────────────────────

struct HandlerState {
    path: RingBuffer<RobotPose>,
    clouds: RingBuffer<TimestampedCloud>,
    filter: Box<dyn PoseFilter>,
    last_timestamp: Option<i64>,
    pending_points: BTreeMap<i64, Vec<Point>>,
    pending_meta: BTreeMap<i64, StereoMeta>,
}

/// Per-sensor ingestion state.  Shared as `Arc<SensorHandler>` between the
/// drain task and readers.
pub struct SensorHandler {
    info: HandlerInfo,
    options: HandlerOptions,
    variant: HandlerVariant,
    state: Mutex<HandlerState>,
    counters: Counters,
}

impl std::fmt::Debug for SensorHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorHandler")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl SensorHandler {
    /// Build a handler with the default [`KalmanPoseFilter`].
    pub fn new(info: HandlerInfo, variant: HandlerVariant, options: HandlerOptions) -> Self {
        Self::with_filter(info, variant, options, Box::new(KalmanPoseFilter::default()))
    }

    pub fn with_filter(
        info: HandlerInfo,
        variant: HandlerVariant,
        options: HandlerOptions,
        filter: Box<dyn PoseFilter>,
    ) -> Self {
        Self {
            state: Mutex::new(HandlerState {
                path: RingBuffer::new(options.history_capacity),
                clouds: RingBuffer::new(options.history_capacity),
                filter,
                last_timestamp: None,
                pending_points: BTreeMap::new(),
                pending_meta: BTreeMap::new(),
            }),
            info,
            options,
            variant,
            counters: Counters::default(),
        }
    }

    /// `<robot>_<sensor>`; also the subscriber id and the output file stem.
    pub fn id(&self) -> String {
        format!("{}_{}", self.info.robot_id, self.info.sensor_name)
    }

    pub fn info(&self) -> &HandlerInfo {
        &self.info
    }

    pub fn kind(&self) -> SensorKind {
        self.variant.kind()
    }

    pub fn data_names(&self) -> Vec<&str> {
        self.variant.data_names()
    }

    /// Register this handler's streams with `bus`.  Calling it again replaces
    /// the earlier route.
    pub fn request(&self, bus: &PacketBus) -> Subscription {
        bus.request(&self.id(), &self.data_names(), self.info.request_freq_ms)
    }

    /// Drain `subscription` until the bus closes it.
    pub async fn run(self: Arc<Self>, mut subscription: Subscription) {
        info!(handler = %self.id(), kind = %self.kind(), "handler started");
        while let Some(packet) = subscription.recv().await {
            self.deliver(packet);
        }
        info!(handler = %self.id(), "handler subscription closed");
    }

    /// Route `packet` to [`handle`][Self::handle] or
    /// [`handle2`][Self::handle2] by data name, recovering locally from
    /// every error.
    pub fn deliver(&self, packet: Packet) {
        bump(&self.counters.packets, 1);
        let result = match &self.variant {
            HandlerVariant::StereoCamera { meta_name, .. } if packet.data_name == *meta_name => self.handle2(&packet),
            _ if self.data_names().contains(&packet.data_name.as_str()) => self.handle(&packet),
            _ => Err(MapError::MalformedPacket {
                data_name: packet.data_name.clone(),
                reason: "not a stream of this handler".to_string(),
            }),
        };

        match result {
            Ok(()) => {}
            Err(MapError::MalformedPacket { data_name, reason }) => {
                bump(&self.counters.malformed, 1);
                warn!(handler = %self.id(), %data_name, %reason, "malformed packet discarded");
            }
            Err(MapError::OutOfOrderTimestamp { previous, received }) => {
                debug!(handler = %self.id(), previous, received, "out-of-order packet rejected");
            }
            Err(e) => {
                warn!(handler = %self.id(), error = %e, "packet discarded");
            }
        }
    }

    /// Process a primary-stream packet.
    pub fn handle(&self, packet: &Packet) -> Result<(), MapError> {
        match &self.variant {
            HandlerVariant::Laser { mount, display, .. } => {
                let laser = LaserPacket::decode(packet)?;
                let mut state = self.lock_state();
                self.check_timestamp(&mut state, laser.timestamp)?;
                if let Some(pose) = laser.pose {
                    self.filter_robot_location(&mut state, pose, laser.timestamp);
                }
                if let Some(scan) = &laser.scan {
                    let points = self.scan_to_points(scan, mount);
                    let rejected = display.merge(&points);
                    bump(&self.counters.dropped_points, rejected as u64);
                    state.clouds.push(TimestampedCloud::new(points, laser.timestamp));
                }
                Ok(())
            }
            HandlerVariant::StereoCamera { .. } => {
                let batch = StereoPoints::decode(packet)?;
                let mut state = self.lock_state();
                if state.pending_meta.remove(&batch.timestamp).is_some() {
                    self.accumulate_stereo(&mut state, batch.points, batch.timestamp);
                } else {
                    if state.pending_points.insert(batch.timestamp, batch.points).is_some() {
                        bump(&self.counters.unmatched_stereo, 1);
                    }
                    self.evict_pending(&mut state);
                }
                Ok(())
            }
            HandlerVariant::Map { hub, origin, .. } => {
                let sent = hub.broadcast_except(*origin, packet);
                bump(&self.counters.relayed, sent as u64);
                debug!(handler = %self.id(), clients = sent, "map update relayed");
                Ok(())
            }
        }
    }

    /// Process a secondary-stream packet (stereo pose metadata).
    pub fn handle2(&self, packet: &Packet) -> Result<(), MapError> {
        let HandlerVariant::StereoCamera { .. } = &self.variant else {
            return Err(MapError::MalformedPacket {
                data_name: packet.data_name.clone(),
                reason: format!("{} handler has no secondary stream", self.kind()),
            });
        };
        let meta = StereoMeta::decode(packet)?;
        let mut state = self.lock_state();
        self.check_timestamp(&mut state, meta.timestamp)?;
        self.filter_robot_location(&mut state, meta.pose, meta.timestamp);

        if let Some(points) = state.pending_points.remove(&meta.timestamp) {
            self.accumulate_stereo(&mut state, points, meta.timestamp);
        } else {
            if state.pending_meta.insert(meta.timestamp, meta).is_some() {
                bump(&self.counters.unmatched_stereo, 1);
            }
            self.evict_pending(&mut state);
        }
        Ok(())
    }

    /// Consistent snapshot of the display cloud; `None` for the Map relay.
    pub fn display_cloud(&self) -> Option<Arc<PointCloud>> {
        self.variant.display().map(DisplayCloud::snapshot)
    }

    /// The path history, oldest first.
    pub fn path(&self) -> Vec<RobotPose> {
        self.lock_state().path.iter().copied().collect()
    }

    /// The path as points tagged with the robot color.
    pub fn path_cloud(&self) -> PointCloud {
        self.lock_state()
            .path
            .iter()
            .map(|pose| pose.position.with_color(self.info.robot_color))
            .collect()
    }

    /// Number of per-packet clouds currently held in the cloud history.
    pub fn cloud_history_len(&self) -> usize {
        self.lock_state().clouds.len()
    }

    /// One voxel pass over the display cloud.  `Ok(None)` for the Map relay.
    pub fn reduce(&self) -> Result<Option<Arc<PointCloud>>, MapError> {
        self.variant.display().map(DisplayCloud::reduce).transpose()
    }

    /// Reduce, then export the display cloud and path under `out_dir`.
    ///
    /// The Map relay holds neither and writes nothing.
    pub fn write_to(&self, out_dir: &Path) -> Result<HandlerExport, MapError> {
        let id = self.id();
        let mut export = HandlerExport {
            handler_id: id.clone(),
            kind: self.kind(),
            cloud_file: None,
            path_file: None,
            points: 0,
            poses: 0,
            stats: self.stats(),
        };
        let Some(cloud) = self.reduce()? else {
            return Ok(export);
        };

        let cloud_file = out_dir.join(format!("{id}.pcd"));
        write_pcd(&cloud_file, &cloud)?;
        let path = self.path();
        let path_file = out_dir.join(format!("{id}_path.json"));
        write_path_json(&path_file, &path)?;

        export.cloud_file = Some(cloud_file);
        export.path_file = Some(path_file);
        export.points = cloud.len();
        export.poses = path.len();
        Ok(export)
    }

    /// Map `point` from `frame` into the frame's parent.
    pub fn transform_point(frame: &FrameTransform, point: &Point) -> Result<Point, MapError> {
        frame.transform(point)
    }

    pub fn stats(&self) -> HandlerStats {
        let c = &self.counters;
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        HandlerStats {
            packets: load(&c.packets),
            malformed: load(&c.malformed),
            out_of_order: load(&c.out_of_order),
            divergences: load(&c.divergences),
            dropped_points: load(&c.dropped_points),
            unmatched_stereo: load(&c.unmatched_stereo),
            discarded_batches: load(&c.discarded_batches),
            relayed: load(&c.relayed),
        }
    }

    // ── internals ───────────────────────────────────────────────────────────

    fn lock_state(&self) -> MutexGuard<'_, HandlerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Flag a timestamp older than the newest seen; reject it only when
    /// configured to.
    fn check_timestamp(&self, state: &mut HandlerState, received: i64) -> Result<(), MapError> {
        if let Some(previous) = state.last_timestamp
            && received < previous
        {
            bump(&self.counters.out_of_order, 1);
            warn!(
                handler = %self.id(),
                previous,
                received,
                rejected = self.options.reject_out_of_order,
                "out-of-order timestamp"
            );
            if self.options.reject_out_of_order {
                return Err(MapError::OutOfOrderTimestamp { previous, received });
            }
            return Ok(());
        }
        state.last_timestamp = Some(received);
        Ok(())
    }

    /// Smooth a raw pose through the filter and append it to the path.
    ///
    /// A non-finite sample is dropped with the path and filter untouched.
    fn filter_robot_location(&self, state: &mut HandlerState, sample: PoseSample, timestamp: i64) {
        if !(sample.x.is_finite() && sample.y.is_finite() && sample.heading_deg.is_finite()) {
            bump(&self.counters.dropped_points, 1);
            warn!(handler = %self.id(), timestamp, "non-finite pose sample dropped");
            return;
        }
        let measured = Point::new(sample.x, sample.y, 0.0);
        let position = match state.filter.update(measured) {
            Ok(p) => p,
            Err(e) => {
                bump(&self.counters.divergences, 1);
                warn!(handler = %self.id(), error = %e, "pose filter reset");
                state.filter.reset();
                match state.filter.update(measured) {
                    Ok(p) => p,
                    Err(_) => return,
                }
            }
        };
        state.path.push(RobotPose::new(position, sample.heading_deg, timestamp));
    }

    /// Range readings to common-frame points; "no return" readings skipped.
    fn scan_to_points(&self, scan: &RangeScan, mount: &FrameTransform) -> Vec<Point> {
        let mut points = Vec::with_capacity(scan.ranges.len());
        let mut dropped = 0u64;
        for (i, &range) in scan.ranges.iter().enumerate() {
            if !range.is_finite() || range <= 0.0 {
                continue;
            }
            let bearing = scan.bearing_deg(i).to_radians();
            let local = self.tag(Point::new(range * bearing.cos(), range * bearing.sin(), 0.0));
            match Self::transform_point(mount, &local) {
                Ok(p) => points.push(p),
                Err(_) => dropped += 1,
            }
        }
        if dropped > 0 {
            bump(&self.counters.dropped_points, dropped);
        }
        points
    }

    /// Denoise, transform and merge one matched stereo batch.
    fn accumulate_stereo(&self, state: &mut HandlerState, raw: Vec<Point>, timestamp: i64) {
        let HandlerVariant::StereoCamera {
            mount,
            display,
            stats_k,
            stats_std_mul,
            ..
        } = &self.variant
        else {
            return;
        };

        let total = raw.len();
        let finite: PointCloud = raw.into_iter().filter(Point::is_finite).collect();
        let non_finite = (total - finite.len()) as u64;
        if non_finite > 0 {
            bump(&self.counters.dropped_points, non_finite);
        }

        let denoised = match stats_filter_with(&finite, *stats_k, *stats_std_mul) {
            Ok(cloud) => cloud,
            Err(e) => {
                bump(&self.counters.discarded_batches, 1);
                debug!(handler = %self.id(), timestamp, points = finite.len(), error = %e, "stereo batch discarded");
                return;
            }
        };

        let points: Vec<Point> = denoised
            .into_points()
            .into_iter()
            .filter_map(|p| Self::transform_point(mount, &self.tag(p)).ok())
            .collect();
        let rejected = display.merge(&points);
        bump(&self.counters.dropped_points, rejected as u64);
        state.clouds.push(TimestampedCloud::new(points, timestamp));
    }

    /// Keep at most `max_pending` unmatched halves per stream.
    fn evict_pending(&self, state: &mut HandlerState) {
        let max = self.options.max_pending.max(1);
        while state.pending_points.len() > max {
            state.pending_points.pop_first();
            bump(&self.counters.unmatched_stereo, 1);
        }
        while state.pending_meta.len() > max {
            state.pending_meta.pop_first();
            bump(&self.counters.unmatched_stereo, 1);
        }
    }

    fn tag(&self, p: Point) -> Point {
        match self.info.color {
            Some(c) => p.with_color(c),
            None => p,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
