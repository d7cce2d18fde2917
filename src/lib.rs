//! # Box Logger Core Library
//!
//! This crate is the core of the `box-logger` service. It discovers serial-attached
//! sensor boxes, keeps one reader task per box alive across unplugs and flaky
//! connections, and fans every telemetry line out to the configured sinks
//! (InfluxDB, a rotating JSON-lines file, or the log).
//!
//! ## Crate Structure
//!
//! - **`config`**: `Settings`, layered from defaults, an optional TOML file and the
//!   environment with `figment`.
//! - **`error`**: the `LoggerError` enum for failures that cross component boundaries.
//! - **`tracing_setup`**: console and rotating-file logging on `tracing-subscriber`.
//! - **`device`**: the `SerialBackend` seam, line framing, the `tokio-serial`
//!   backend and an in-memory mock.
//! - **`scanner`**: pattern matching and ping probes over the backend.
//! - **`reader`**: the per-device reconnecting reader task.
//! - **`monitor`**: periodic reconciliation of the live reader set.
//! - **`queue`**: the multi-producer ingestion queue.
//! - **`dispatcher`**: sink registry and the dispatch loop.
//! - **`manager`**: startup wait and start/stop orchestration.
//! - **`record`**, **`sink`**, **`influx`**, **`file_sink`**: telemetry validation and
//!   the concrete sinks.
//! - **`rotating_file`**: daily-rotating file writer shared by the data log and app log.
//! - **`supervisor`**: systemd readiness and watchdog notifications.
//!
//! ## Data flow
//!
//! ```text
//! PortScanner ─▶ DeviceMonitor ─spawns─▶ DeviceReader (one per device)
//!                                              │ RawLine
//!                                              ▼
//!                                       ingestion queue ─▶ Dispatcher ─▶ Sinks
//! ```

pub mod config;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod file_sink;
pub mod influx;
pub mod manager;
pub mod monitor;
pub mod queue;
pub mod reader;
pub mod record;
pub mod rotating_file;
pub mod scanner;
pub mod sink;
pub mod supervisor;
pub mod tracing_setup;

pub use config::Settings;
pub use error::{AppResult, LoggerError};
pub use manager::DeviceManager;
