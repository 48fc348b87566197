//! `mapfuse-server` – the ingestion side of the mapping server.
//!
//! Turns the packets of connected robots into per-sensor display clouds and
//! path histories, and writes them to disk on demand.
//!
//! # Modules
//!
//! - [`handler`] – [`SensorHandler`][handler::SensorHandler]: per-sensor
//!   decoding, pose smoothing, frame transform and accumulation; Map relay.
//! - [`registry`] – [`HandlerRegistry`][registry::HandlerRegistry]: builds
//!   handlers from configuration, drains them, runs periodic reduction.
//! - [`display`] – [`DisplayCloud`][display::DisplayCloud]: snapshot-based
//!   accumulated cloud with non-blocking reduction.
//! - [`history`] – [`RingBuffer`][history::RingBuffer]: fixed-capacity
//!   rolling path and cloud history.
//! - [`persist`] – PCD/JSON export and the
//!   [`Persister`][persist::Persister].
//! - [`config`] – `~/.mapfuse/config.toml` loading with `MAPFUSE_*`
//!   overrides.
//! - [`telemetry`] – `tracing` subscriber and optional OTLP export.

pub mod config;
pub mod display;
pub mod handler;
pub mod history;
pub mod persist;
pub mod registry;
pub mod telemetry;

pub use handler::{HandlerInfo, HandlerOptions, HandlerVariant, SensorHandler};
pub use registry::{Connection, HandlerRegistry};
