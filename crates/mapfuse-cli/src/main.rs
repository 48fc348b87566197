//! `mapfuse` – mapping server entry point.
//!
//! 1. Initialises tracing (`RUST_LOG`, `MAPFUSE_LOG_FORMAT`,
//!    `OTEL_EXPORTER_OTLP_ENDPOINT`).
//! 2. Loads `~/.mapfuse/config.toml` (or `--config PATH`); `--init` writes a
//!    sample configuration and exits.
//! 3. Builds one packet bus per configured robot, the client hub and the
//!    handler registry, and starts the handlers.
//! 4. Optionally replays a JSON-lines packet capture (`--replay FILE`).
//! 5. Reduces periodically, persists every `persist_interval_ms`, and writes
//!    everything to disk on Ctrl-C (or straight after the replay with
//!    `--once`).

mod replay;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use mapfuse_middleware::{ClientHub, PacketBus};
use mapfuse_server::config::{self, FrameConfig, HostConfig, SensorConfig, ServerConfig};
use mapfuse_server::persist::Persister;
use mapfuse_server::registry::{Connection, HandlerRegistry};
use mapfuse_server::telemetry;
use mapfuse_types::{MapError, SensorKind};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

// ─────────────────────────────────────────────────────────────────────────────
// Arguments
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, PartialEq)]
struct Args {
    config: Option<PathBuf>,
    replay: Option<PathBuf>,
    out_dir: Option<PathBuf>,
    once: bool,
    init: bool,
    help: bool,
}

const USAGE: &str = "\
usage: mapfuse [--config PATH] [--replay FILE] [--out DIR] [--once] [--init]

  --config PATH   configuration file (default ~/.mapfuse/config.toml)
  --replay FILE   deliver a JSON-lines packet capture
  --out DIR       override the output directory
  --once          write to disk and exit after the replay
  --init          write a sample configuration and exit";

fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<Args, String> {
    let mut parsed = Args::default();
    let mut it = args.into_iter();
    while let Some(arg) = it.next() {
        let mut value = |flag: &str| it.next().map(PathBuf::from).ok_or_else(|| format!("{flag} needs a value"));
        match arg.as_str() {
            "--config" | "-c" => parsed.config = Some(value("--config")?),
            "--replay" | "-r" => parsed.replay = Some(value("--replay")?),
            "--out" | "-o" => parsed.out_dir = Some(value("--out")?),
            "--once" => parsed.once = true,
            "--init" => parsed.init = true,
            "--help" | "-h" => parsed.help = true,
            other => return Err(format!("unknown argument '{other}'")),
        }
    }
    if parsed.once && parsed.replay.is_none() {
        return Err("--once requires --replay".to_string());
    }
    Ok(parsed)
}

fn main() -> ExitCode {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(a) if a.help => {
            println!("{USAGE}");
            return ExitCode::SUCCESS;
        }
        Ok(a) => a,
        Err(e) => {
            eprintln!("{}: {e}\n\n{USAGE}", "error".red().bold());
            return ExitCode::from(2);
        }
    };

    // Hold the guard for the whole process so pending spans get flushed.
    let _tracing = telemetry::init_tracing("mapfuse");
    print_banner();

    let config_path = args.config.clone().unwrap_or_else(config::config_path);
    if args.init {
        return match config::save_to(&sample_config(), &config_path) {
            Ok(()) => {
                println!("  {} Sample config written to {}", "✓".green().bold(), config_path.display().to_string().bold());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{}: {e}", "Error saving config".red());
                ExitCode::FAILURE
            }
        };
    }

    let mut cfg = match config::load_from(&config_path) {
        Ok(Some(cfg)) => {
            println!("  Config loaded from {}", config_path.display().to_string().bold());
            cfg
        }
        Ok(None) => {
            println!(
                "  {} no config at {}; run `{}` to create one.",
                "!".yellow().bold(),
                config_path.display(),
                "mapfuse --init".bold()
            );
            ServerConfig::default()
        }
        Err(e) => {
            eprintln!("{}: {e}", "Config error".red());
            return ExitCode::FAILURE;
        }
    };
    if let Some(out) = &args.out_dir {
        cfg.output_dir = out.clone();
    }

    // ── Ctrl-C ───────────────────────────────────────────────────────────
    let shutdown = Arc::new(Notify::new());
    {
        let shutdown = Arc::clone(&shutdown);
        if let Err(e) = ctrlc::set_handler(move || {
            println!();
            println!("{}", "⚠  Ctrl-C received – writing sensor data to disk …".yellow().bold());
            shutdown.notify_one();
        }) {
            warn!(error = %e, "failed to install Ctrl-C handler; data is only written on the persist interval");
        }
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start the async runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(serve(cfg, args, shutdown)) {
        Ok(()) => {
            println!("  {}", "✓ Exiting mapfuse.".green());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "mapfuse stopped with an error");
            ExitCode::FAILURE
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server
// ─────────────────────────────────────────────────────────────────────────────

async fn serve(cfg: ServerConfig, args: Args, shutdown: Arc<Notify>) -> Result<(), MapError> {
    let hub = ClientHub::new(cfg.queue_capacity);
    let mut connections = Vec::with_capacity(cfg.hosts.len());
    let mut buses = HashMap::new();

    for host in &cfg.hosts {
        let (client, mut outbox) = hub.connect();
        let bus = PacketBus::new(host.robot_id.clone(), cfg.queue_capacity);
        buses.insert(host.robot_id.clone(), bus.clone());

        // Without a live transport, relayed packets are only logged.
        let robot = host.robot_id.clone();
        tokio::spawn(async move {
            while let Some(packet) = outbox.recv().await {
                debug!(robot = %robot, data_name = %packet.data_name, "outbound packet");
            }
        });

        info!(robot = %host.robot_id, name = %host.display_name(), address = %host.address, "robot configured");
        connections.push(Connection {
            host: host.clone(),
            bus,
            client,
        });
    }

    let mut registry = HandlerRegistry::from_connections(&connections, &hub)?;
    registry.start();
    let reducer = registry.spawn_reducer(Duration::from_millis(cfg.reduce_interval_ms));
    println!(
        "  {} {} handler(s) across {} robot(s)",
        "▶".cyan().bold(),
        registry.len(),
        connections.len()
    );

    let mut interrupted = false;
    if let Some(path) = &args.replay {
        tokio::select! {
            summary = replay::replay(path, &buses) => {
                let summary = summary?;
                println!(
                    "  Replayed {} packet(s) ({} not requested, {} unknown robot, {} bad line(s))",
                    summary.delivered, summary.undelivered, summary.unknown_robot, summary.bad_lines
                );
            }
            _ = shutdown.notified() => {
                interrupted = true;
                warn!("replay interrupted");
            }
        }
    }

    if !args.once && !interrupted {
        wait_for_shutdown(&registry, &cfg, &shutdown).await;
    }
    // Close the buses and let every handler finish its queue.
    registry.drain().await;

    reducer.abort();
    let manifest = registry.write_all(&cfg.output_dir)?;
    println!(
        "  {} Wrote {} handler(s), {} combined point(s) to {}",
        "✓".green().bold(),
        manifest.handlers.len(),
        manifest.combined_points,
        cfg.output_dir.display().to_string().bold()
    );
    registry.stop();
    Ok(())
}

/// Persist on the configured interval until Ctrl-C.
async fn wait_for_shutdown(registry: &HandlerRegistry, cfg: &ServerConfig, shutdown: &Notify) {
    if cfg.persist_interval_ms == 0 {
        shutdown.notified().await;
        return;
    }

    let mut ticker = tokio::time::interval(Duration::from_millis(cfg.persist_interval_ms));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.notified() => return,
            _ = ticker.tick() => {
                let handlers = registry.handlers();
                let out_dir = cfg.output_dir.clone();
                match tokio::task::spawn_blocking(move || Persister::new(out_dir).persist(&handlers)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!(error = %e, "periodic export failed"),
                    Err(e) => warn!(error = %e, "periodic export task failed"),
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sample configuration
// ─────────────────────────────────────────────────────────────────────────────

fn sample_config() -> ServerConfig {
    let sensor = |kind: SensorKind, name: &str, data_name: &str| SensorConfig {
        kind,
        name: name.to_string(),
        data_name: data_name.to_string(),
        meta_data_name: None,
        frame: None,
        color: None,
        voxel_leaf: 0.05,
        stats_k: 8,
        stats_std_mul: 1.0,
        process_noise: 1e-4,
        measurement_noise: 1e-1,
    };

    let mut laser = sensor(SensorKind::Laser, "front", "laser");
    laser.frame = Some("laser".to_string());
    laser.color = Some(0xff0000);
    let mut stereo = sensor(SensorKind::StereoCamera, "stereo", "stereo");
    stereo.meta_data_name = Some("stereo_meta".to_string());
    let map = sensor(SensorKind::Map, "map", "map");

    ServerConfig {
        hosts: vec![HostConfig {
            robot_id: "robot1".to_string(),
            name: "Robot 1".to_string(),
            address: "127.0.0.1:9000".to_string(),
            request_freq_ms: 100,
            history_capacity: 1024,
            reject_out_of_order: false,
            robot_color: 0x00ff00,
            max_pending: 16,
            frames: vec![FrameConfig {
                parent: "common".to_string(),
                child: "laser".to_string(),
                rotation_deg: 0.0,
                dx: 0.2,
                dy: 0.0,
            }],
            sensors: vec![laser, stereo, map],
        }],
        ..ServerConfig::default()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("  {} {}", "mapfuse".bold().cyan(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  Robot mapping server – sensor fusion core");
    println!();
}
