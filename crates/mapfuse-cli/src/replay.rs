//! Packet capture replay.
//!
//! Stands in for the network transport: a JSON-lines file where every line
//! is one packet received from one robot.
//!
//! ```text
//! {"robot_id":"r1","packet":{"data_name":"laser","fields":[{"type":"int","value":1}, ...]}}
//! {"robot_id":"r1","delay_ms":100,"packet":{...}}
//! ```
//!
//! Blank lines and lines starting with `#` are skipped.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::Duration;

use mapfuse_middleware::PacketBus;
use mapfuse_types::{MapError, Packet};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayRecord {
    pub robot_id: String,
    /// Pause before delivering this packet.
    #[serde(default)]
    pub delay_ms: u64,
    pub packet: Packet,
}

/// Outcome of a replay run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Records accepted by at least one handler queue.
    pub delivered: usize,
    /// Records for a configured robot that no handler had requested.
    pub undelivered: usize,
    pub unknown_robot: usize,
    pub bad_lines: usize,
}

/// Parse a capture file.  Lines that fail to parse are logged and counted,
/// never fatal.
pub fn read_capture(path: &Path) -> Result<(Vec<ReplayRecord>, usize), MapError> {
    let transport_err = |e: std::io::Error| MapError::Transport(format!("{}: {e}", path.display()));
    let file = File::open(path).map_err(transport_err)?;

    let mut records = Vec::new();
    let mut bad = 0;
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(transport_err)?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match serde_json::from_str::<ReplayRecord>(trimmed) {
            Ok(record) => records.push(record),
            Err(e) => {
                bad += 1;
                warn!(line = lineno + 1, error = %e, "unparseable capture line skipped");
            }
        }
    }
    Ok((records, bad))
}

/// Deliver every record to the bus of its robot, honouring delays.
///
/// Full handler queues pause the replay instead of dropping records.
pub async fn replay(path: &Path, buses: &HashMap<String, PacketBus>) -> Result<ReplaySummary, MapError> {
    let (records, bad_lines) = read_capture(path)?;
    let mut summary = ReplaySummary {
        bad_lines,
        ..ReplaySummary::default()
    };

    for record in records {
        if record.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(record.delay_ms)).await;
        }
        let Some(bus) = buses.get(&record.robot_id) else {
            summary.unknown_robot += 1;
            warn!(robot = %record.robot_id, "capture names an unconfigured robot");
            continue;
        };
        let data_name = record.packet.data_name.clone();
        if bus.deliver_wait(record.packet).await > 0 {
            summary.delivered += 1;
        } else {
            summary.undelivered += 1;
            debug!(robot = %record.robot_id, %data_name, "capture record not requested by any handler");
        }
    }

    info!(
        delivered = summary.delivered,
        undelivered = summary.undelivered,
        unknown_robot = summary.unknown_robot,
        bad_lines = summary.bad_lines,
        "capture replayed"
    );
    Ok(summary)
}
