//! Server configuration – reads/writes `~/.mapfuse/config.toml`.
//!
//! ```toml
//! output_dir = "/var/lib/mapfuse"
//! reduce_interval_ms = 1000
//!
//! [[hosts]]
//! robot_id = "r1"
//! address = "10.0.0.7:9000"
//! robot_color = 0x00ff00
//!
//! [[hosts.frames]]
//! parent = "common"
//! child = "base"
//! dx = 1.0
//!
//! [[hosts.frames]]
//! parent = "base"
//! child = "laser"
//! rotation_deg = 90.0
//!
//! [[hosts.sensors]]
//! kind = "laser"
//! name = "front"
//! data_name = "laser"
//! frame = "laser"
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use mapfuse_types::{MapError, SensorKind};
use serde::{Deserialize, Serialize};

/// Top-level server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Directory the persister writes into.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Period of the display-cloud reduction pass.
    #[serde(default = "default_reduce_interval_ms")]
    pub reduce_interval_ms: u64,

    /// Period of the automatic export; `0` disables it.
    #[serde(default = "default_persist_interval_ms")]
    pub persist_interval_ms: u64,

    /// Capacity of every per-subscriber and per-client packet queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default)]
    pub hosts: Vec<HostConfig>,
}

/// One robot the server connects to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    pub robot_id: String,

    /// Human-readable name; defaults to the robot id.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    pub address: String,

    #[serde(default = "default_request_freq_ms")]
    pub request_freq_ms: u64,

    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    #[serde(default)]
    pub reject_out_of_order: bool,

    /// Packed `0xRRGGBB` color of the robot's path.
    #[serde(default = "default_robot_color")]
    pub robot_color: u32,

    #[serde(default = "default_max_pending")]
    pub max_pending: usize,

    #[serde(default)]
    pub frames: Vec<FrameConfig>,

    #[serde(default)]
    pub sensors: Vec<SensorConfig>,
}

/// Transform of `child` expressed in `parent`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameConfig {
    pub parent: String,
    pub child: String,
    #[serde(default)]
    pub rotation_deg: f64,
    #[serde(default)]
    pub dx: f64,
    #[serde(default)]
    pub dy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    pub kind: SensorKind,

    /// Unique per host; names the handler's output files.
    pub name: String,

    pub data_name: String,

    /// Metadata stream of a stereo camera.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_data_name: Option<String>,

    /// Frame the sensor reports in; the common frame when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<String>,

    /// Packed `0xRRGGBB` tag for accumulated points.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,

    #[serde(default = "default_voxel_leaf")]
    pub voxel_leaf: f64,

    #[serde(default = "default_stats_k")]
    pub stats_k: usize,

    #[serde(default = "default_stats_std_mul")]
    pub stats_std_mul: f64,

    #[serde(default = "default_process_noise")]
    pub process_noise: f64,

    #[serde(default = "default_measurement_noise")]
    pub measurement_noise: f64,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("mapfuse-output")
}
fn default_reduce_interval_ms() -> u64 {
    1000
}
fn default_persist_interval_ms() -> u64 {
    0
}
fn default_queue_capacity() -> usize {
    256
}
fn default_request_freq_ms() -> u64 {
    100
}
fn default_history_capacity() -> usize {
    1024
}
fn default_robot_color() -> u32 {
    0x00ff00
}
fn default_max_pending() -> usize {
    16
}
fn default_voxel_leaf() -> f64 {
    0.05
}
fn default_stats_k() -> usize {
    8
}
fn default_stats_std_mul() -> f64 {
    1.0
}
fn default_process_noise() -> f64 {
    1e-4
}
fn default_measurement_noise() -> f64 {
    1e-1
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            reduce_interval_ms: default_reduce_interval_ms(),
            persist_interval_ms: default_persist_interval_ms(),
            queue_capacity: default_queue_capacity(),
            hosts: Vec::new(),
        }
    }
}

impl HostConfig {
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() { &self.robot_id } else { &self.name }
    }
}

impl ServerConfig {
    /// Reject configurations the registry could not build handlers from.
    pub fn validate(&self) -> Result<(), MapError> {
        if self.reduce_interval_ms == 0 {
            return Err(MapError::Config("reduce_interval_ms must be positive".to_string()));
        }
        let mut robots = HashSet::new();
        for host in &self.hosts {
            if !robots.insert(host.robot_id.as_str()) {
                return Err(MapError::Config(format!("duplicate robot id '{}'", host.robot_id)));
            }
            let mut names = HashSet::new();
            for sensor in &host.sensors {
                let at = format!("{}/{}", host.robot_id, sensor.name);
                if !names.insert(sensor.name.as_str()) {
                    return Err(MapError::Config(format!("duplicate sensor '{at}'")));
                }
                if !(sensor.voxel_leaf.is_finite() && sensor.voxel_leaf > 0.0) {
                    return Err(MapError::Config(format!("{at}: voxel_leaf must be positive")));
                }
                if sensor.kind == SensorKind::StereoCamera {
                    if sensor.meta_data_name.is_none() {
                        return Err(MapError::Config(format!("{at}: stereo camera needs meta_data_name")));
                    }
                    if sensor.stats_k == 0 || !sensor.stats_std_mul.is_finite() {
                        return Err(MapError::Config(format!(
                            "{at}: stats_k must be positive and stats_std_mul finite"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Return the path to `~/.mapfuse/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".mapfuse").join("config.toml")
}

/// Load the config from the default location.  `Ok(None)` if absent.
pub fn load() -> Result<Option<ServerConfig>, MapError> {
    load_from(&config_path())
}

/// Load, apply `MAPFUSE_*` overrides and validate.
pub fn load_from(path: &Path) -> Result<Option<ServerConfig>, MapError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| MapError::Config(format!("failed to read {}: {e}", path.display())))?;
    let mut cfg: ServerConfig =
        toml::from_str(&raw).map_err(|e| MapError::Config(format!("failed to parse {}: {e}", path.display())))?;
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(Some(cfg))
}

/// Apply `MAPFUSE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `MAPFUSE_OUTPUT_DIR` | `output_dir` |
/// | `MAPFUSE_REDUCE_INTERVAL_MS` | `reduce_interval_ms` |
/// | `MAPFUSE_PERSIST_INTERVAL_MS` | `persist_interval_ms` |
/// | `MAPFUSE_QUEUE_CAPACITY` | `queue_capacity` |
///
/// Unparseable numbers are ignored.
pub fn apply_env_overrides(cfg: &mut ServerConfig) {
    if let Ok(v) = std::env::var("MAPFUSE_OUTPUT_DIR") {
        cfg.output_dir = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("MAPFUSE_REDUCE_INTERVAL_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.reduce_interval_ms = ms;
    }
    if let Ok(v) = std::env::var("MAPFUSE_PERSIST_INTERVAL_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.persist_interval_ms = ms;
    }
    if let Ok(v) = std::env::var("MAPFUSE_QUEUE_CAPACITY")
        && let Ok(n) = v.parse::<usize>()
    {
        cfg.queue_capacity = n;
    }
}

/// Save the config to the default location, creating `~/.mapfuse/`.
pub fn save(cfg: &ServerConfig) -> Result<(), MapError> {
    save_to(cfg, &config_path())
}

pub fn save_to(cfg: &ServerConfig, path: &Path) -> Result<(), MapError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| MapError::Config(format!("failed to create {}: {e}", parent.display())))?;
    }
    let raw = toml::to_string_pretty(cfg).map_err(|e| MapError::Config(format!("failed to serialize config: {e}")))?;
    fs::write(path, raw).map_err(|e| MapError::Config(format!("failed to write {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
output_dir = "/tmp/maps"

[[hosts]]
robot_id = "r1"
address = "127.0.0.1:9000"

[[hosts.frames]]
parent = "common"
child = "laser"
rotation_deg = 90.0
dx = 0.5

[[hosts.sensors]]
kind = "laser"
name = "front"
data_name = "laser"
frame = "laser"

[[hosts.sensors]]
kind = "stereo_camera"
name = "stereo"
data_name = "stereo"
meta_data_name = "stereo_meta"
stats_k = 4
"#;

    #[test]
    fn parses_sample_with_defaults() {
        let cfg: ServerConfig = toml::from_str(SAMPLE).expect("parse");
        assert_eq!(cfg.output_dir, PathBuf::from("/tmp/maps"));
        assert_eq!(cfg.reduce_interval_ms, 1000);
        assert_eq!(cfg.queue_capacity, 256);

        let host = &cfg.hosts[0];
        assert_eq!(host.display_name(), "r1");
        assert_eq!(host.robot_color, 0x00ff00);
        assert_eq!(host.frames[0].rotation_deg, 90.0);
        assert_eq!(host.frames[0].dy, 0.0);
        assert_eq!(host.sensors[0].kind, SensorKind::Laser);
        assert_eq!(host.sensors[0].voxel_leaf, 0.05);
        assert_eq!(host.sensors[1].stats_k, 4);
        assert_eq!(host.sensors[1].stats_std_mul, 1.0);
        cfg.validate().expect("valid");
    }

    #[test]
    fn stereo_without_meta_is_rejected() {
        let cfg: ServerConfig = toml::from_str(&SAMPLE.replace("meta_data_name = \"stereo_meta\"\n", "")).expect("parse");
        assert!(matches!(cfg.validate(), Err(MapError::Config(_))));
    }

    #[test]
    fn duplicate_sensor_name_is_rejected() {
        let cfg: ServerConfig = toml::from_str(&SAMPLE.replace("name = \"stereo\"", "name = \"front\"")).expect("parse");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn roundtrip_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let cfg: ServerConfig = toml::from_str(SAMPLE).expect("parse");
        save_to(&cfg, &path).expect("save");
        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.hosts, cfg.hosts);
    }

    #[test]
    fn config_path_points_to_mapfuse_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".mapfuse"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn load_from_reports_parse_errors() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "hosts = 3").expect("write");
        assert!(matches!(load_from(&path), Err(MapError::Config(_))));
    }

    #[test]
    fn apply_env_overrides_changes_intervals() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("MAPFUSE_REDUCE_INTERVAL_MS", "250") };
        unsafe { std::env::set_var("MAPFUSE_QUEUE_CAPACITY", "not-a-number") };
        let mut cfg = ServerConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.reduce_interval_ms, 250);
        assert_eq!(cfg.queue_capacity, 256);
        unsafe { std::env::remove_var("MAPFUSE_REDUCE_INTERVAL_MS") };
        unsafe { std::env::remove_var("MAPFUSE_QUEUE_CAPACITY") };
    }

    #[test]
    fn apply_env_overrides_changes_output_dir() {
        // SAFETY: single-threaded test; no data races on env vars.
        unsafe { std::env::set_var("MAPFUSE_OUTPUT_DIR", "/srv/maps") };
        let mut cfg = ServerConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.output_dir, PathBuf::from("/srv/maps"));
        unsafe { std::env::remove_var("MAPFUSE_OUTPUT_DIR") };
    }
}
