//! Custom error types for the application.
//!
//! This module defines the primary error type, `LoggerError`, for the whole service.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the failures that can escape a component boundary.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically a malformed TOML file or an
//!   environment variable that cannot be deserialized into its field type.
//! - **`ConfigValidation`**: Semantic errors in a configuration that parsed fine (an
//!   invalid `PORTS_RE` regex, an unknown sink name, a zero scan interval).
//! - **`Io`**: Wraps `std::io::Error` from file sinks, the rotating app log and the
//!   supervisor socket.
//! - **`Serial`**: Errors raised by `tokio-serial` while enumerating or opening devices.
//! - **`MissingCredential`**: A mandatory sink was configured without its credential.
//! - **`NoDevicesFound`**: The startup wait expired without a single device appearing.
//! - **`Http`**: Transport-level failures talking to the time-series database.
//! - **`Task`**: A spawned task panicked or was cancelled while being joined.
//!
//! Only `MissingCredential` and `NoDevicesFound` are startup-fatal; everything that
//! happens once the pipeline runs is caught and logged inside the task that hit it.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, LoggerError>;

/// Errors that cross component boundaries.
#[derive(Error, Debug)]
pub enum LoggerError {
    /// Configuration could not be loaded or deserialized.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but holds a logically invalid value.
    #[error("Configuration validation error: {0}")]
    ConfigValidation(String),

    /// Filesystem or socket I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port enumeration or open failure.
    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// A mandatory sink credential is absent.
    #[error("Missing credential: {0}")]
    MissingCredential(&'static str),

    /// No device appeared during the bounded startup wait.
    #[error("No serial devices found after {attempts} scan attempts")]
    NoDevicesFound {
        /// Number of scans performed before giving up.
        attempts: u32,
    },

    /// HTTP transport failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A background task failed to join.
    #[error("Task join error: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<figment::Error> for LoggerError {
    fn from(value: figment::Error) -> Self {
        LoggerError::Config(Box::new(value))
    }
}

impl LoggerError {
    /// Whether this error must terminate the whole service.
    ///
    /// Everything else is expected to be handled (logged, retried or skipped)
    /// by the task that observed it.
    pub fn is_startup_fatal(&self) -> bool {
        matches!(
            self,
            LoggerError::MissingCredential(_)
                | LoggerError::NoDevicesFound { .. }
                | LoggerError::Config(_)
                | LoggerError::ConfigValidation(_)
        )
    }
}
