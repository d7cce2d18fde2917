//! Configuration System using Figment
//!
//! Every tunable of the service is a field of [`Settings`]. Values are layered:
//! 1. Built-in defaults (the values the service has always shipped with)
//! 2. An optional TOML file (`BOX_LOGGER_CONFIG`, default `box-logger.toml`)
//! 3. Environment variables, named after the fields in upper case
//!    (`BAUD_RATE`, `PORTS_RE`, `INFLUXDB_TOKEN`, ...)
//!
//! Components never read the environment themselves; they receive the
//! component-level settings structs derived here.
//!
//! # Example
//! ```no_run
//! use box_logger::config::Settings;
//!
//! let settings = Settings::load()?;
//! settings.validate()?;
//! println!("Scanning for {}", settings.ports_re);
//! # Ok::<(), box_logger::error::LoggerError>(())
//! ```

use crate::error::{AppResult, LoggerError};
use crate::manager::StartupSettings;
use crate::monitor::MonitorSettings;
use crate::reader::ReaderSettings;
use crate::scanner::ScannerSettings;
use crate::tracing_setup::{parse_log_level, OutputFormat};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Environment variable naming an optional TOML configuration file.
pub const CONFIG_PATH_ENV: &str = "BOX_LOGGER_CONFIG";

/// TOML file consulted when [`CONFIG_PATH_ENV`] is unset.
pub const DEFAULT_CONFIG_PATH: &str = "box-logger.toml";

/// Environment keys that map onto [`Settings`] fields.
const ENV_KEYS: &[&str] = &[
    "influxdb_host",
    "influxdb_port",
    "influxdb_bucket",
    "influxdb_token",
    "influxdb_org",
    "logging_level",
    "log_format",
    "log_file_path",
    "baud_rate",
    "port_timeout",
    "port_reconnect_delay",
    "port_scan_interval",
    "reconnect_attempts",
    "ports_re",
    "wait_for_ports_attempts",
    "wait_for_ports_interval",
    "data_log_path",
    "data_log_backups",
    "sinks",
];

/// Top-level service configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// InfluxDB host name
    pub influxdb_host: String,
    /// InfluxDB HTTP port
    pub influxdb_port: u16,
    /// InfluxDB bucket receiving the points
    pub influxdb_bucket: String,
    /// InfluxDB API token; required when the influx sink is enabled
    pub influxdb_token: String,
    /// InfluxDB organisation
    pub influxdb_org: String,
    /// Logging level (trace, debug, info, warn, error)
    pub logging_level: String,
    /// Console log format (pretty, compact, json)
    pub log_format: String,
    /// Rotating application log file; empty disables it
    pub log_file_path: PathBuf,
    /// Serial baud rate for readers and probes
    pub baud_rate: u32,
    /// Read/open timeout in seconds
    pub port_timeout: u64,
    /// Delay between reconnect attempts in seconds
    pub port_reconnect_delay: u64,
    /// Monitor reconciliation interval in seconds
    pub port_scan_interval: u64,
    /// Reconnect attempts before a reader gives up
    pub reconnect_attempts: u32,
    /// Regex selecting candidate device paths
    pub ports_re: String,
    /// Startup scans before the service gives up
    pub wait_for_ports_attempts: u32,
    /// Wait between startup scans in seconds
    pub wait_for_ports_interval: u64,
    /// Directory of the JSON-lines data log
    pub data_log_path: PathBuf,
    /// Rotated data log files to keep
    pub data_log_backups: usize,
    /// Comma separated sink list, in invocation order (influx, file, log)
    pub sinks: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            influxdb_host: "localhost".to_string(),
            influxdb_port: 8086,
            influxdb_bucket: "test".to_string(),
            influxdb_token: String::new(),
            influxdb_org: "Heimdal".to_string(),
            logging_level: "INFO".to_string(),
            log_format: "compact".to_string(),
            log_file_path: PathBuf::from("/var/log/box-logger/app.log"),
            baud_rate: 115_200,
            port_timeout: 1,
            port_reconnect_delay: 1,
            port_scan_interval: 10,
            reconnect_attempts: 60,
            ports_re: "ttyACM*|ttyUSB*".to_string(),
            wait_for_ports_attempts: 60,
            wait_for_ports_interval: 10,
            data_log_path: PathBuf::from("data_log"),
            data_log_backups: 7,
            sinks: "influx,file".to_string(),
        }
    }
}

/// Sinks that can be enabled through `SINKS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    /// InfluxDB time-series sink
    Influx,
    /// Rotating JSON-lines file sink
    File,
    /// Log every raw line at info level
    Log,
}

impl FromStr for SinkKind {
    type Err = LoggerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "influx" | "influxdb" => Ok(SinkKind::Influx),
            "file" => Ok(SinkKind::File),
            "log" => Ok(SinkKind::Log),
            other => Err(LoggerError::ConfigValidation(format!(
                "Unknown sink '{}'. Must be one of: influx, file, log",
                other
            ))),
        }
    }
}

impl Settings {
    /// Load configuration from the default layering.
    ///
    /// The TOML path comes from `BOX_LOGGER_CONFIG` when set; a missing file is
    /// not an error.
    pub fn load() -> AppResult<Self> {
        let path = std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from(path)
    }

    /// Load configuration from a specific TOML file path plus the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Self::figment(path.as_ref()).extract()?)
    }

    /// The provider stack used by [`Settings::load_from`].
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::raw().filter(|key| {
                ENV_KEYS
                    .iter()
                    .any(|known| key.as_str().eq_ignore_ascii_case(known))
            }))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        parse_log_level(&self.logging_level).map_err(LoggerError::ConfigValidation)?;
        self.output_format()?;

        regex::Regex::new(&self.ports_re).map_err(|e| {
            LoggerError::ConfigValidation(format!("Invalid PORTS_RE '{}': {}", self.ports_re, e))
        })?;

        if self.baud_rate == 0 {
            return Err(LoggerError::ConfigValidation(
                "BAUD_RATE must be greater than zero".to_string(),
            ));
        }
        if self.port_timeout == 0 {
            return Err(LoggerError::ConfigValidation(
                "PORT_TIMEOUT must be greater than zero".to_string(),
            ));
        }
        if self.port_scan_interval == 0 {
            return Err(LoggerError::ConfigValidation(
                "PORT_SCAN_INTERVAL must be greater than zero".to_string(),
            ));
        }

        self.sink_kinds()?;
        Ok(())
    }

    /// Parse `sinks` into an ordered, de-duplicated list.
    pub fn sink_kinds(&self) -> AppResult<Vec<SinkKind>> {
        let mut kinds = Vec::new();
        for part in self.sinks.split(',').filter(|p| !p.trim().is_empty()) {
            let kind = part.parse::<SinkKind>()?;
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        if kinds.is_empty() {
            return Err(LoggerError::ConfigValidation(
                "SINKS must name at least one sink".to_string(),
            ));
        }
        Ok(kinds)
    }

    /// Console log format
    pub fn output_format(&self) -> AppResult<OutputFormat> {
        self.log_format
            .parse::<OutputFormat>()
            .map_err(LoggerError::ConfigValidation)
    }

    /// Base URL of the InfluxDB HTTP API
    pub fn influxdb_url(&self) -> String {
        format!("http://{}:{}", self.influxdb_host, self.influxdb_port)
    }

    /// Settings handed to every Device Reader
    pub fn reader_settings(&self) -> ReaderSettings {
        ReaderSettings {
            baud_rate: self.baud_rate,
            read_timeout: Duration::from_secs(self.port_timeout),
            reconnect_delay: Duration::from_secs(self.port_reconnect_delay),
            max_reconnect_attempts: self.reconnect_attempts,
        }
    }

    /// Settings for the Port Scanner
    pub fn scanner_settings(&self) -> ScannerSettings {
        ScannerSettings {
            pattern: self.ports_re.clone(),
            baud_rate: self.baud_rate,
            probe_timeout: Duration::from_secs(self.port_timeout),
        }
    }

    /// Settings for the Device Monitor
    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            scan_interval: Duration::from_secs(self.port_scan_interval),
        }
    }

    /// Settings for the Manager's startup wait
    pub fn startup_settings(&self) -> StartupSettings {
        StartupSettings {
            wait_attempts: self.wait_for_ports_attempts,
            wait_interval: Duration::from_secs(self.wait_for_ports_interval),
        }
    }
}
