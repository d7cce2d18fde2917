//! Tracing Infrastructure
//!
//! Structured, async-aware logging for the service, built on `tracing` and
//! `tracing-subscriber`:
//! - Structured events with fields (`device = %path`, `sink = name`)
//! - Multiple console formats (pretty, compact, JSON)
//! - Environment-based filtering (`RUST_LOG` wins over `LOGGING_LEVEL`)
//! - An optional daily-rotating application log file
//!
//! # Example
//! ```no_run
//! use box_logger::{config::Settings, tracing_setup};
//! use tracing::{info, warn};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::load()?;
//! tracing_setup::init_from_settings(&settings)?;
//!
//! info!("Service started");
//! warn!(device = "/dev/ttyACM0", "Connection timeout");
//! # Ok(())
//! # }
//! ```

use crate::config::Settings;
use crate::rotating_file::DailyRotatingFile;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Rotated application log files kept next to the live one.
pub const APP_LOG_BACKUPS: usize = 7;

/// Console log layout, selected with `LOG_FORMAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line human output, coloured when ANSI is on
    Pretty,
    /// One line per event (service default)
    Compact,
    /// One JSON object per event, for journald/Loki scraping
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!(
                "Invalid log format '{}'. Must be one of: pretty, compact, json",
                value
            )),
        }
    }
}

/// How the service logs: console layout, level, optional app log file.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: Level,
    /// Console output format
    pub format: OutputFormat,
    /// Colour the pretty console output
    pub with_ansi: bool,
    /// Daily-rotating application log file, if any
    pub log_file: Option<PathBuf>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            with_ansi: true,
            log_file: None,
        }
    }
}

impl TracingConfig {
    /// `LOGGING_LEVEL`, `LOG_FORMAT` and `LOG_FILE_PATH` from the settings.
    /// An empty log file path disables the file layer.
    pub fn from_settings(settings: &Settings) -> Result<Self, String> {
        let log_file = Some(settings.log_file_path.clone())
            .filter(|path| !path.as_os_str().is_empty());

        Ok(Self {
            level: parse_log_level(&settings.logging_level)?,
            format: settings.log_format.parse()?,
            log_file,
            ..Default::default()
        })
    }

    /// Console-only config at `level`.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Set output format
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Toggle ANSI colours for the pretty format
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }

    /// Also write to a daily-rotating log file
    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }
}

/// Install the global subscriber described by the service settings.
pub fn init_from_settings(settings: &Settings) -> Result<(), String> {
    init(TracingConfig::from_settings(settings)?)
}

/// Install the global subscriber.
///
/// Calling it again once a subscriber is installed is a no-op. An app log
/// file that cannot be created is reported as an error event and left out;
/// console logging still comes up.
pub fn init(config: TracingConfig) -> Result<(), String> {
    let console = match config.format {
        OutputFormat::Pretty => fmt::layer()
            .pretty()
            .with_ansi(config.with_ansi)
            .with_filter(level_filter(config.level))
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_ansi(false)
            .with_filter(level_filter(config.level))
            .boxed(),
        OutputFormat::Json => fmt::layer()
            .json()
            .with_current_span(false)
            .with_filter(level_filter(config.level))
            .boxed(),
    };

    let (file_layer, file_error) = match config.log_file.as_deref().map(|path| {
        DailyRotatingFile::open(path, APP_LOG_BACKUPS)
            .map_err(|e| format!("Error creating log file {}: {}", path.display(), e))
    }) {
        Some(Ok(writer)) => {
            let layer = fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(writer))
                .with_filter(level_filter(config.level));
            (Some(layer), None)
        }
        Some(Err(message)) => (None, Some(message)),
        None => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .try_init();
    if let Err(e) = installed {
        // Tests install their own subscriber first.
        if !e.to_string().contains("global default trace dispatcher") {
            return Err(format!("Failed to initialize tracing: {}", e));
        }
    }

    if let Some(message) = file_error {
        tracing::error!("{}", message);
    }
    Ok(())
}

/// `RUST_LOG` directives when present, otherwise everything at `level` and above.
fn level_filter(level: Level) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy()
}

/// Parse a `LOGGING_LEVEL` value.
///
/// Case-insensitive; `WARNING` and `CRITICAL` are accepted as aliases of
/// `warn` and `error`.
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" | "critical" => Ok(Level::ERROR),
        other => Err(format!(
            "Invalid LOGGING_LEVEL '{}' (expected trace, debug, info, warning, error or critical)",
            other
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_levels_accept_service_spellings() {
        for (text, level) in [
            ("trace", Level::TRACE),
            ("DEBUG", Level::DEBUG),
            ("Info", Level::INFO),
            ("WARNING", Level::WARN),
            ("warn", Level::WARN),
            ("Critical", Level::ERROR),
        ] {
            assert_eq!(parse_log_level(text), Ok(level), "{}", text);
        }
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn output_format_parsing() {
        assert_eq!("JSON".parse::<OutputFormat>(), Ok(OutputFormat::Json));
        assert_eq!("pretty".parse::<OutputFormat>(), Ok(OutputFormat::Pretty));
        assert!("xml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn config_from_settings() {
        let settings = Settings {
            logging_level: "debug".to_string(),
            log_format: "json".to_string(),
            log_file_path: PathBuf::new(),
            ..Default::default()
        };

        let config = TracingConfig::from_settings(&settings).unwrap();
        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.format, OutputFormat::Json);
        assert!(config.log_file.is_none());

        let bad = Settings {
            log_format: "xml".to_string(),
            ..Default::default()
        };
        assert!(TracingConfig::from_settings(&bad).is_err());
    }

    #[test]
    fn builder_sets_log_file() {
        let config = TracingConfig::new(Level::WARN)
            .with_format(OutputFormat::Pretty)
            .with_ansi(false)
            .with_log_file("/tmp/box-logger/app.log");

        assert_eq!(config.level, Level::WARN);
        assert_eq!(config.format, OutputFormat::Pretty);
        assert!(!config.with_ansi);
        assert_eq!(config.log_file, Some(PathBuf::from("/tmp/box-logger/app.log")));
    }
}
