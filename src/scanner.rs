//! Port discovery.
//!
//! The [`PortScanner`] enumerates serial devices through a [`SerialBackend`],
//! keeps the ones whose path matches the configured `PORTS_RE` pattern and can
//! optionally ping each candidate (open, wait for one line, close) to confirm
//! that it actually talks.

use crate::device::{DevicePath, LineRead, SerialBackend};
use crate::error::{AppResult, LoggerError};
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Port Scanner settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannerSettings {
    /// Regex searched (unanchored) in every device path
    pub pattern: String,
    /// Baud rate used when pinging
    pub baud_rate: u32,
    /// Bound on the ping's open plus single read
    pub probe_timeout: Duration,
}

/// Discovers candidate devices.
pub struct PortScanner {
    backend: Arc<dyn SerialBackend>,
    pattern: Regex,
    settings: ScannerSettings,
}

impl PortScanner {
    /// Build a scanner; fails when the pattern is not a valid regex.
    pub fn new(backend: Arc<dyn SerialBackend>, settings: ScannerSettings) -> AppResult<Self> {
        let pattern = Regex::new(&settings.pattern).map_err(|e| {
            LoggerError::ConfigValidation(format!(
                "Invalid PORTS_RE '{}': {}",
                settings.pattern, e
            ))
        })?;
        Ok(Self {
            backend,
            pattern,
            settings,
        })
    }

    /// Backend the scanner enumerates through.
    pub fn backend(&self) -> &Arc<dyn SerialBackend> {
        &self.backend
    }

    /// Whether a path is a candidate.
    pub fn matches(&self, path: &DevicePath) -> bool {
        self.pattern.is_match(path.as_str())
    }

    /// Matching devices, optionally filtered to those that answer a ping.
    ///
    /// Never fails: an enumeration error is logged and yields an empty set.
    pub async fn scan(&self, ping: bool) -> BTreeSet<DevicePath> {
        let ports = match self.backend.available_ports().await {
            Ok(ports) => ports,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "Serial port enumeration failed");
                return BTreeSet::new();
            }
        };

        let mut found = BTreeSet::new();
        for path in ports.into_iter().filter(|p| self.matches(p)) {
            if ping && !self.ping(&path).await {
                debug!(device = %path, "Candidate did not answer ping");
                continue;
            }
            found.insert(path);
        }

        debug!(count = found.len(), ping, "Port scan complete");
        found
    }

    /// Open the device, wait for one line, close it.
    ///
    /// True only when a non-empty, decodable line arrived before the probe
    /// timeout. The handle is released on every path.
    pub async fn ping(&self, path: &DevicePath) -> bool {
        let timeout = self.settings.probe_timeout;

        let opened = tokio::time::timeout(timeout, self.backend.open(path, self.settings.baud_rate));
        let mut conn = match opened.await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                debug!(device = %path, error = %format!("{:#}", e), "Ping open failed");
                return false;
            }
            Err(_) => {
                debug!(device = %path, "Ping open timed out");
                return false;
            }
        };

        let answered = match conn.read_line(timeout).await {
            Ok(LineRead::Line(text)) => !text.is_empty(),
            Ok(LineRead::Undecodable(_)) | Ok(LineRead::Timeout) | Ok(LineRead::Eof) => false,
            Err(e) => {
                debug!(device = %path, error = %e, "Ping read failed");
                false
            }
        };
        conn.close();

        if answered {
            info!(device = %path, "Device answered ping");
        }
        answered
    }
}
