//! Real serial ports via `tokio-serial`.

use super::{DeviceConnection, DevicePath, SerialBackend};
use crate::error::LoggerError;
use anyhow::Context;
use async_trait::async_trait;
use tokio::task::spawn_blocking;
use tokio_serial::SerialPortBuilderExt;

/// [`SerialBackend`] backed by the operating system's serial devices.
///
/// Enumeration and opening are blocking syscalls on most platforms, so both run
/// on the blocking pool. Ports are opened 8N1 without flow control; on Unix
/// the open is exclusive, so a second open of the same path fails while a
/// reader holds it.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSerialBackend;

impl TokioSerialBackend {
    /// Create the backend.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SerialBackend for TokioSerialBackend {
    async fn available_ports(&self) -> anyhow::Result<Vec<DevicePath>> {
        let ports = spawn_blocking(tokio_serial::available_ports)
            .await
            .map_err(LoggerError::from)
            .context("spawn_blocking for port enumeration failed")?
            .map_err(LoggerError::from)
            .context("Failed to enumerate serial ports")?;

        Ok(ports
            .into_iter()
            .map(|info| DevicePath::new(info.port_name))
            .collect())
    }

    async fn open(&self, path: &DevicePath, baud_rate: u32) -> anyhow::Result<DeviceConnection> {
        let port_path = path.as_str().to_string();

        let stream = spawn_blocking(move || {
            tokio_serial::new(&port_path, baud_rate)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()
                .map_err(LoggerError::from)
                .with_context(|| {
                    format!(
                        "Failed to open serial port '{}' at {} baud",
                        port_path, baud_rate
                    )
                })
        })
        .await
        .map_err(LoggerError::from)
        .context("spawn_blocking for serial port opening failed")??;

        Ok(DeviceConnection::new(path.clone(), Box::new(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_device_reports_serial_error() {
        let backend = TokioSerialBackend::new();
        let err = backend
            .open(&DevicePath::from("/dev/box-logger-no-such-port"), 115_200)
            .await
            .unwrap_err();

        assert!(format!("{:#}", err).contains("/dev/box-logger-no-such-port"));
        assert!(matches!(
            err.downcast_ref::<LoggerError>(),
            Some(LoggerError::Serial(_))
        ));
    }
}
