//! Writing clouds and paths to disk.
//!
//! | File | Content |
//! |---|---|
//! | `<robot>_<sensor>.pcd`       | A handler's reduced display cloud, ASCII PCD |
//! | `<robot>_<sensor>_path.json` | A handler's path history |
//! | `combined.pcd`               | Union of every handler's display cloud |
//! | `manifest.json`              | Export time and per-handler counts |
//!
//! Every file is written to a `.tmp` sibling first and renamed into place, so
//! a failed export never leaves a truncated file behind.  Failures surface as
//! [`MapError::Persistence`].

use std::fmt::Display;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use mapfuse_types::{Color, MapError, Point, PointCloud, RobotPose};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::handler::{HandlerExport, SensorHandler};

pub const COMBINED_CLOUD_FILE: &str = "combined.pcd";
pub const MANIFEST_FILE: &str = "manifest.json";

fn persistence_error(path: &Path, details: impl Display) -> MapError {
    MapError::Persistence {
        path: path.display().to_string(),
        details: details.to_string(),
    }
}

/// Write through `fill` into `<path>.tmp`, then rename onto `path`.
fn write_atomically<F>(path: &Path, fill: F) -> Result<(), MapError>
where
    F: FnOnce(&mut BufWriter<File>) -> std::io::Result<()>,
{
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let result = File::create(&tmp).and_then(|file| {
        let mut out = BufWriter::new(file);
        fill(&mut out)?;
        out.flush()
    });
    if let Err(e) = result.and_then(|()| fs::rename(&tmp, path)) {
        let _ = fs::remove_file(&tmp);
        return Err(persistence_error(path, e));
    }
    Ok(())
}

// ────────────────────────────────────────────────────────────────────────────
// PCD
// ────────────────────────────────────────────────────────────────────────────

/// Write `cloud` as an ASCII PCD file with fields `x y z rgb`.
///
/// `rgb` is the packed `0xRRGGBB` value; uncolored points are written as 0.
pub fn write_pcd(path: &Path, cloud: &PointCloud) -> Result<(), MapError> {
    write_atomically(path, |out| {
        writeln!(out, "# .PCD v0.7 - Point Cloud Data file format")?;
        writeln!(out, "VERSION 0.7")?;
        writeln!(out, "FIELDS x y z rgb")?;
        writeln!(out, "SIZE 8 8 8 4")?;
        writeln!(out, "TYPE F F F U")?;
        writeln!(out, "COUNT 1 1 1 1")?;
        writeln!(out, "WIDTH {}", cloud.len())?;
        writeln!(out, "HEIGHT 1")?;
        writeln!(out, "VIEWPOINT 0 0 0 1 0 0 0")?;
        writeln!(out, "POINTS {}", cloud.len())?;
        writeln!(out, "DATA ascii")?;
        for p in cloud {
            let rgb = p.color.map_or(0, Color::packed);
            writeln!(out, "{} {} {} {}", p.x, p.y, p.z, rgb)?;
        }
        Ok(())
    })
}

/// Read back a file produced by [`write_pcd`].
///
/// A zero `rgb` is read as "no color".
pub fn read_pcd(path: &Path) -> Result<PointCloud, MapError> {
    let file = File::open(path).map_err(|e| persistence_error(path, e))?;
    let mut cloud = PointCloud::new();
    let mut in_data = false;

    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| persistence_error(path, e))?;
        if !in_data {
            in_data = line.trim() == "DATA ascii";
            continue;
        }
        let parse_err = |what: &str| persistence_error(path, format!("line {}: bad {what}", lineno + 1));
        let mut cols = line.split_whitespace();
        let mut coord = |what: &str| -> Result<f64, MapError> {
            cols.next()
                .and_then(|c| c.parse::<f64>().ok())
                .ok_or_else(|| parse_err(what))
        };
        let (x, y, z) = (coord("x")?, coord("y")?, coord("z")?);
        let rgb = cols
            .next()
            .and_then(|c| c.parse::<u32>().ok())
            .ok_or_else(|| parse_err("rgb"))?;
        let point = Point::new(x, y, z);
        cloud.push(if rgb == 0 { point } else { point.with_color(Color::from_packed(rgb)) });
    }

    if !in_data {
        return Err(persistence_error(path, "missing DATA ascii header"));
    }
    Ok(cloud)
}

// ────────────────────────────────────────────────────────────────────────────
// Path JSON
// ────────────────────────────────────────────────────────────────────────────

/// Write a path history as a pretty-printed JSON array.
pub fn write_path_json(path: &Path, poses: &[RobotPose]) -> Result<(), MapError> {
    write_atomically(path, |out| {
        serde_json::to_writer_pretty(&mut *out, poses).map_err(std::io::Error::other)?;
        writeln!(out)
    })
}

pub fn read_path_json(path: &Path) -> Result<Vec<RobotPose>, MapError> {
    let raw = fs::read_to_string(path).map_err(|e| persistence_error(path, e))?;
    serde_json::from_str(&raw).map_err(|e| persistence_error(path, e))
}

// ────────────────────────────────────────────────────────────────────────────
// Persister
// ────────────────────────────────────────────────────────────────────────────

/// Summary written to `manifest.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub written_at: DateTime<Utc>,
    pub combined_points: usize,
    pub handlers: Vec<HandlerExport>,
}

/// Exports every handler's state under one output directory.
#[derive(Debug, Clone)]
pub struct Persister {
    out_dir: PathBuf,
}

impl Persister {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
        }
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    /// Write each handler's files, the combined cloud and the manifest.
    ///
    /// A handler whose export fails is logged and left out of the manifest;
    /// the error of the first such failure is returned after every other
    /// file has been attempted.
    pub fn persist(&self, handlers: &[Arc<SensorHandler>]) -> Result<Manifest, MapError> {
        fs::create_dir_all(&self.out_dir).map_err(|e| persistence_error(&self.out_dir, e))?;

        let mut exports = Vec::with_capacity(handlers.len());
        let mut combined = PointCloud::new();
        let mut first_error = None;

        for handler in handlers {
            match handler.write_to(&self.out_dir) {
                Ok(export) => exports.push(export),
                Err(e) => {
                    warn!(handler = %handler.id(), error = %e, "handler export failed");
                    first_error.get_or_insert(e);
                }
            }
            if let Some(cloud) = handler.display_cloud() {
                combined.extend_from_slice(cloud.points());
            }
        }

        write_pcd(&self.out_dir.join(COMBINED_CLOUD_FILE), &combined)?;

        let manifest = Manifest {
            written_at: Utc::now(),
            combined_points: combined.len(),
            handlers: exports,
        };
        let manifest_path = self.out_dir.join(MANIFEST_FILE);
        write_atomically(&manifest_path, |out| {
            serde_json::to_writer_pretty(&mut *out, &manifest).map_err(std::io::Error::other)?;
            writeln!(out)
        })?;

        info!(
            out_dir = %self.out_dir.display(),
            handlers = manifest.handlers.len(),
            combined_points = manifest.combined_points,
            "sensor data written to disk"
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(manifest),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcd_round_trip_keeps_colors() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("cloud.pcd");
        let cloud: PointCloud = vec![
            Point::new(1.5, -2.25, 0.0).with_color(Color::new(255, 0, 0)),
            Point::new(0.125, 3.0, 7.0),
        ]
        .into();

        write_pcd(&path, &cloud)?;
        let text = fs::read_to_string(&path)?;
        assert!(text.contains("POINTS 2"));
        assert!(text.contains("1.5 -2.25 0 16711680"));

        assert_eq!(read_pcd(&path)?, cloud);
        assert!(!dir.path().join("cloud.pcd.tmp").exists());
        Ok(())
    }

    #[test]
    fn path_json_round_trip() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("path.json");
        let poses = vec![
            RobotPose::new(Point::new(0.0, 0.0, 0.0), 0.0, 10),
            RobotPose::new(Point::new(1.0, 0.5, 0.0), 45.0, 20),
        ];
        write_path_json(&path, &poses)?;
        assert_eq!(read_path_json(&path)?, poses);
        Ok(())
    }

    #[test]
    fn write_into_missing_directory_is_persistence_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("no-such-dir").join("cloud.pcd");
        let err = write_pcd(&path, &PointCloud::new()).unwrap_err();
        assert!(matches!(err, MapError::Persistence { .. }));
    }

    #[test]
    fn read_rejects_headerless_file() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("junk.pcd");
        fs::write(&path, "1 2 3 0\n")?;
        assert!(matches!(read_pcd(&path), Err(MapError::Persistence { .. })));
        Ok(())
    }
}
