//! [`HandlerRegistry`] – builds, starts and fans requests out to every
//! sensor handler.
//!
//! One handler is built per (client connection × configured sensor).  Sensor
//! frames are resolved into the common frame through the host's
//! [`FrameTree`] once, at construction.  After [`HandlerRegistry::start`]
//! each handler is drained by its own tokio task; reduction runs periodically
//! on the blocking pool so reception is never stalled by it.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use mapfuse_middleware::{ClientHub, ClientId, PacketBus};
use mapfuse_perception::pose_filter::{KalmanConfig, KalmanPoseFilter};
use mapfuse_perception::reduce::LeafSize;
use mapfuse_perception::transform::{FrameTransform, FrameTree, COMMON_FRAME};
use mapfuse_types::{Color, MapError, PointCloud, SensorKind};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{HostConfig, SensorConfig};
use crate::handler::{HandlerInfo, HandlerOptions, HandlerVariant, SensorHandler};
use crate::persist::{Manifest, Persister};

/// One connected robot as seen by the registry.
#[derive(Debug, Clone)]
pub struct Connection {
    pub host: HostConfig,
    pub bus: PacketBus,
    pub client: ClientId,
}

#[derive(Debug)]
struct Registered {
    handler: Arc<SensorHandler>,
    bus: PacketBus,
}

/// Owns every handler and the tasks draining them.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    entries: Vec<Registered>,
    tasks: Vec<JoinHandle<()>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the handlers of every connection.
    ///
    /// # Errors
    ///
    /// [`MapError::Config`] when a sensor frame cannot be resolved into the
    /// common frame, [`MapError::InvalidParameter`] for bad filter settings.
    pub fn from_connections(connections: &[Connection], hub: &ClientHub) -> Result<Self, MapError> {
        let mut registry = Self::new();
        for conn in connections {
            for handler in create_sensor_handlers(&conn.host, hub, conn.client)? {
                registry.register(handler, conn.bus.clone());
            }
        }
        info!(handlers = registry.len(), connections = connections.len(), "handler registry built");
        Ok(registry)
    }

    /// Add a handler fed by `bus`.
    pub fn register(&mut self, handler: SensorHandler, bus: PacketBus) {
        debug!(handler = %handler.id(), connection = %bus.connection(), "handler registered");
        self.entries.push(Registered {
            handler: Arc::new(handler),
            bus,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn handlers(&self) -> Vec<Arc<SensorHandler>> {
        self.entries.iter().map(|e| Arc::clone(&e.handler)).collect()
    }

    pub fn get(&self, handler_id: &str) -> Option<Arc<SensorHandler>> {
        self.entries
            .iter()
            .find(|e| e.handler.id() == handler_id)
            .map(|e| Arc::clone(&e.handler))
    }

    /// Request every handler's streams and spawn its drain task.
    ///
    /// Calling it again re-requests (replacing the earlier routes, whose
    /// tasks then finish on their own).
    pub fn start(&mut self) {
        for entry in &self.entries {
            let subscription = entry.handler.request(&entry.bus);
            self.tasks.push(tokio::spawn(Arc::clone(&entry.handler).run(subscription)));
        }
        info!(handlers = self.entries.len(), "handlers started");
    }

    /// One reduction pass over every display cloud; returns the total point
    /// count afterwards.
    pub fn reduce_all(&self) -> usize {
        reduce_handlers(&self.handlers())
    }

    /// Run [`reduce_all`][Self::reduce_all] every `period` on the blocking
    /// pool.
    pub fn spawn_reducer(&self, period: Duration) -> JoinHandle<()> {
        let handlers = self.handlers();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let batch = handlers.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || reduce_handlers(&batch)).await {
                    warn!(error = %e, "reduction task failed");
                }
            }
        })
    }

    /// Every accumulating handler's display cloud, by handler id.  The Map
    /// relay has none and is skipped.
    pub fn display_clouds(&self) -> Vec<(String, Arc<PointCloud>)> {
        self.entries
            .iter()
            .filter_map(|e| e.handler.display_cloud().map(|c| (e.handler.id(), c)))
            .collect()
    }

    /// Export every handler plus the combined cloud and manifest.
    pub fn write_all(&self, out_dir: &Path) -> Result<Manifest, MapError> {
        Persister::new(out_dir).persist(&self.handlers())
    }

    /// Close every bus and wait until the handlers have processed all queued
    /// packets.
    pub async fn drain(&mut self) {
        for entry in &self.entries {
            entry.bus.close();
        }
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "handler task failed");
            }
        }
        debug!(handlers = self.entries.len(), "handlers drained");
    }

    /// Abort the drain tasks.
    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for HandlerRegistry {
    fn drop(&mut self) {
        self.stop();
    }
}

fn reduce_handlers(handlers: &[Arc<SensorHandler>]) -> usize {
    let mut total = 0;
    for handler in handlers {
        match handler.reduce() {
            Ok(Some(cloud)) => total += cloud.len(),
            Ok(None) => {}
            Err(e) => warn!(handler = %handler.id(), error = %e, "reduction failed"),
        }
    }
    debug!(points = total, "reduction pass complete");
    total
}

/// Build one handler per sensor configured for `host`.
///
/// `origin` is the connection the host's packets arrive on; Map handlers
/// relay to everyone else on `hub`.
pub fn create_sensor_handlers(
    host: &HostConfig,
    hub: &ClientHub,
    origin: ClientId,
) -> Result<Vec<SensorHandler>, MapError> {
    let mut tree = FrameTree::new();
    for f in &host.frames {
        tree.set_transform(&f.parent, &f.child, FrameTransform::new(&f.child, f.rotation_deg, f.dx, f.dy));
    }

    let options = HandlerOptions {
        history_capacity: host.history_capacity,
        reject_out_of_order: host.reject_out_of_order,
        max_pending: host.max_pending,
    };

    host.sensors
        .iter()
        .map(|sensor| {
            let info = HandlerInfo {
                robot_id: host.robot_id.clone(),
                sensor_name: sensor.name.clone(),
                request_freq_ms: host.request_freq_ms,
                color: sensor.color.map(Color::from_packed),
                robot_color: Color::from_packed(host.robot_color),
            };
            let variant = build_variant(host, sensor, &tree, hub, origin)?;
            let filter = KalmanPoseFilter::new(KalmanConfig {
                process_noise: sensor.process_noise,
                measurement_noise: sensor.measurement_noise,
                ..KalmanConfig::default()
            });
            Ok(SensorHandler::with_filter(info, variant, options, Box::new(filter)))
        })
        .collect()
}

fn build_variant(
    host: &HostConfig,
    sensor: &SensorConfig,
    tree: &FrameTree,
    hub: &ClientHub,
    origin: ClientId,
) -> Result<HandlerVariant, MapError> {
    let mount = || match &sensor.frame {
        None => Ok(FrameTransform::identity(COMMON_FRAME)),
        Some(frame) => tree.lookup(COMMON_FRAME, frame).ok_or_else(|| {
            MapError::Config(format!(
                "{}/{}: frame '{frame}' is not connected to '{COMMON_FRAME}'",
                host.robot_id, sensor.name
            ))
        }),
    };
    let leaf = LeafSize::uniform(sensor.voxel_leaf);

    match sensor.kind {
        SensorKind::Laser => HandlerVariant::laser(&sensor.data_name, mount()?, leaf),
        SensorKind::StereoCamera => {
            let meta_name = sensor.meta_data_name.as_deref().ok_or_else(|| {
                MapError::Config(format!("{}/{}: stereo camera needs meta_data_name", host.robot_id, sensor.name))
            })?;
            HandlerVariant::stereo_camera(
                &sensor.data_name,
                meta_name,
                mount()?,
                leaf,
                sensor.stats_k,
                sensor.stats_std_mul,
            )
        }
        // The relay has no frame.
        SensorKind::Map => Ok(HandlerVariant::map(&sensor.data_name, hub.clone(), origin)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use mapfuse_types::{LaserPacket, Packet, RangeScan};

    const CONFIG: &str = r#"
[[hosts]]
robot_id = "r1"
address = "127.0.0.1:9000"

[[hosts.frames]]
parent = "common"
child = "base"
dx = 1.0

[[hosts.frames]]
parent = "base"
child = "laser"
rotation_deg = 90.0

[[hosts.sensors]]
kind = "laser"
name = "front"
data_name = "laser"
frame = "laser"
voxel_leaf = 0.01

[[hosts.sensors]]
kind = "map"
name = "map"
data_name = "map"

[[hosts]]
robot_id = "r2"
address = "127.0.0.1:9001"

[[hosts.sensors]]
kind = "stereo_camera"
name = "stereo"
data_name = "stereo"
meta_data_name = "stereo_meta"
"#;

    fn connections(hub: &ClientHub) -> (Vec<Connection>, Vec<mapfuse_middleware::ClientOutbox>) {
        let cfg: ServerConfig = toml::from_str(CONFIG).expect("parse");
        let mut outboxes = Vec::new();
        let conns = cfg
            .hosts
            .into_iter()
            .map(|host| {
                let (client, outbox) = hub.connect();
                outboxes.push(outbox);
                Connection {
                    bus: PacketBus::new(host.robot_id.clone(), 16),
                    host,
                    client,
                }
            })
            .collect();
        (conns, outboxes)
    }

    fn scan(ts: i64) -> Packet {
        LaserPacket {
            timestamp: ts,
            pose: None,
            scan: Some(RangeScan {
                start_deg: 0.0,
                resolution_deg: 1.0,
                ranges: vec![1.0],
            }),
        }
        .to_packet("laser")
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[test]
    fn builds_one_handler_per_sensor() {
        let hub = ClientHub::new(8);
        let (conns, _outboxes) = connections(&hub);
        let registry = HandlerRegistry::from_connections(&conns, &hub).expect("build");
        assert_eq!(registry.len(), 3);
        assert!(registry.get("r1_front").is_some());
        assert!(registry.get("r2_stereo").is_some());
        // The Map relay has no display cloud.
        assert_eq!(registry.display_clouds().len(), 2);
    }

    #[test]
    fn unresolvable_frame_is_config_error() {
        let hub = ClientHub::new(8);
        let (mut conns, _outboxes) = connections(&hub);
        conns[0].host.sensors[0].frame = Some("ghost".to_string());
        let err = HandlerRegistry::from_connections(&conns, &hub).unwrap_err();
        assert!(matches!(err, MapError::Config(_)));
    }

    #[tokio::test]
    async fn started_handlers_receive_through_bus() -> Result<(), Box<dyn std::error::Error>> {
        let hub = ClientHub::new(8);
        let (conns, _outboxes) = connections(&hub);
        let mut registry = HandlerRegistry::from_connections(&conns, &hub)?;
        registry.start();

        assert_eq!(conns[0].bus.deliver(scan(1)), 1);
        settle().await;

        let laser = registry.get("r1_front").ok_or("missing handler")?;
        let cloud = laser.display_cloud().ok_or("no cloud")?;
        assert_eq!(cloud.len(), 1);
        // (1, 0) in the laser frame: rotated 90° then shifted 1 m along +X.
        let p = cloud.points()[0];
        assert!((p.x - 1.0).abs() < 1e-9 && (p.y - 1.0).abs() < 1e-9, "{p:?}");
        Ok(())
    }

    #[tokio::test]
    async fn drain_processes_every_queued_packet() -> Result<(), Box<dyn std::error::Error>> {
        let hub = ClientHub::new(8);
        let (conns, _outboxes) = connections(&hub);
        let mut registry = HandlerRegistry::from_connections(&conns, &hub)?;
        registry.start();

        for ts in 0..16 {
            assert_eq!(conns[0].bus.deliver(scan(ts)), 1);
        }
        registry.drain().await;

        let laser = registry.get("r1_front").ok_or("missing handler")?;
        assert_eq!(laser.stats().packets, 16);
        assert_eq!(laser.cloud_history_len(), 16);
        Ok(())
    }

    #[tokio::test]
    async fn map_updates_reach_other_clients() -> Result<(), Box<dyn std::error::Error>> {
        let hub = ClientHub::new(8);
        let (conns, mut outboxes) = connections(&hub);
        let (_, mut extra) = hub.connect();
        let mut registry = HandlerRegistry::from_connections(&conns, &hub)?;
        registry.start();

        let update = Packet::new("map").bytes(vec![4, 2]);
        conns[0].bus.deliver(update.clone());
        settle().await;

        assert!(outboxes[0].try_recv().is_none(), "origin must not get its own map");
        assert_eq!(outboxes[1].try_recv(), Some(update.clone()));
        assert_eq!(extra.try_recv(), Some(update));
        Ok(())
    }

    #[tokio::test]
    async fn write_all_exports_every_handler() -> Result<(), Box<dyn std::error::Error>> {
        let hub = ClientHub::new(8);
        let (conns, _outboxes) = connections(&hub);
        let registry = HandlerRegistry::from_connections(&conns, &hub)?;
        let laser = registry.get("r1_front").ok_or("missing handler")?;
        laser.deliver(scan(1));
        laser.deliver(scan(2));

        let dir = tempfile::tempdir()?;
        let manifest = registry.write_all(dir.path())?;
        assert_eq!(manifest.handlers.len(), 3);
        // Two identical points collapse into one voxel.
        assert_eq!(manifest.combined_points, 1);
        assert!(dir.path().join("r1_front.pcd").exists());
        assert!(dir.path().join("r2_stereo_path.json").exists());
        assert!(!dir.path().join("r1_map.pcd").exists());
        assert!(dir.path().join(crate::persist::COMBINED_CLOUD_FILE).exists());
        assert!(dir.path().join(crate::persist::MANIFEST_FILE).exists());
        Ok(())
    }

    #[tokio::test]
    async fn reduce_all_counts_points() {
        let hub = ClientHub::new(8);
        let (conns, _outboxes) = connections(&hub);
        let registry = HandlerRegistry::from_connections(&conns, &hub).expect("build");
        let laser = registry.get("r1_front").expect("handler");
        for ts in 0..5 {
            laser.deliver(scan(ts));
        }
        assert_eq!(registry.reduce_all(), 1);
    }
}
