//! In-memory serial backend for tests and dry runs.
//!
//! Each simulated device is a `tokio::io::duplex` pair created on open: the
//! connection gets the device end, the backend keeps the host end so tests can
//! push lines into a live connection. Opens are exclusive like real TTYs, and a
//! connection marks its device closed when dropped, which lets tests assert
//! that no handle leaks past `stop()`.

use super::{DeviceConnection, DevicePath, SerialBackend};
use anyhow::anyhow;
use async_trait::async_trait;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWriteExt, DuplexStream, ReadBuf};

const DUPLEX_CAPACITY: usize = 64 * 1024;

#[derive(Default)]
struct MockDevice {
    present: bool,
    greeting: Option<String>,
    fail_opens: u32,
    open: bool,
    opens: u32,
    host: Option<Arc<tokio::sync::Mutex<DuplexStream>>>,
}

type Devices = Arc<Mutex<HashMap<DevicePath, MockDevice>>>;

/// Scriptable [`SerialBackend`].
#[derive(Clone, Default)]
pub struct MockBackend {
    devices: Devices,
    listing_fails: Arc<AtomicBool>,
}

impl MockBackend {
    /// Backend with no devices attached.
    pub fn new() -> Self {
        Self::default()
    }

    fn devices(&self) -> MutexGuard<'_, HashMap<DevicePath, MockDevice>> {
        // A poisoned map only happens after a test already panicked.
        self.devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attach a device. When `greeting` is set, every open immediately
    /// receives that line, like a box that streams telemetry continuously.
    pub fn plug(&self, path: impl Into<DevicePath>, greeting: Option<&str>) {
        let mut devices = self.devices();
        let device = devices.entry(path.into()).or_default();
        device.present = true;
        device.greeting = greeting.map(str::to_string);
    }

    /// Detach a device; an open connection sees end-of-stream.
    pub fn unplug(&self, path: impl Into<DevicePath>) {
        let mut devices = self.devices();
        if let Some(device) = devices.get_mut(&path.into()) {
            device.present = false;
            device.host = None;
        }
    }

    /// Make the next `count` opens of `path` fail.
    pub fn fail_next_opens(&self, path: impl Into<DevicePath>, count: u32) {
        self.devices().entry(path.into()).or_default().fail_opens = count;
    }

    /// Make port enumeration fail (or succeed again).
    pub fn fail_listing(&self, fail: bool) {
        self.listing_fails.store(fail, Ordering::SeqCst);
    }

    /// Whether a connection to `path` is currently open.
    pub fn is_open(&self, path: impl Into<DevicePath>) -> bool {
        self.devices()
            .get(&path.into())
            .map(|d| d.open)
            .unwrap_or(false)
    }

    /// Successful opens of `path` so far.
    pub fn open_count(&self, path: impl Into<DevicePath>) -> u32 {
        self.devices()
            .get(&path.into())
            .map(|d| d.opens)
            .unwrap_or(0)
    }

    /// Write one line into the open connection of `path`.
    ///
    /// Returns false when nothing is connected.
    pub async fn send_line(&self, path: impl Into<DevicePath>, line: &str) -> bool {
        let host = self
            .devices()
            .get(&path.into())
            .and_then(|d| d.host.clone());
        let Some(host) = host else {
            return false;
        };

        let mut stream = host.lock().await;
        let mut bytes = line.as_bytes().to_vec();
        bytes.push(b'\n');
        stream.write_all(&bytes).await.is_ok()
    }
}

#[async_trait]
impl SerialBackend for MockBackend {
    async fn available_ports(&self) -> anyhow::Result<Vec<DevicePath>> {
        if self.listing_fails.load(Ordering::SeqCst) {
            return Err(anyhow!("mock port enumeration failure"));
        }
        let mut ports: Vec<DevicePath> = self
            .devices()
            .iter()
            .filter(|(_, d)| d.present)
            .map(|(p, _)| p.clone())
            .collect();
        ports.sort();
        Ok(ports)
    }

    async fn open(&self, path: &DevicePath, _baud_rate: u32) -> anyhow::Result<DeviceConnection> {
        let (host, stream, greeting) = {
            let mut devices = self.devices();
            let device = devices
                .get_mut(path)
                .filter(|d| d.present)
                .ok_or_else(|| anyhow!("Failed to open serial port '{}': no such device", path))?;

            if device.fail_opens > 0 {
                device.fail_opens -= 1;
                return Err(anyhow!("Failed to open serial port '{}': device busy", path));
            }
            if device.open {
                return Err(anyhow!(
                    "Failed to open serial port '{}': already open",
                    path
                ));
            }

            let (host, port) = tokio::io::duplex(DUPLEX_CAPACITY);
            let host = Arc::new(tokio::sync::Mutex::new(host));
            device.open = true;
            device.opens += 1;
            device.host = Some(host.clone());

            let stream = MockStream {
                inner: port,
                _guard: OpenGuard {
                    devices: self.devices.clone(),
                    path: path.clone(),
                },
            };
            (host, stream, device.greeting.clone())
        };

        if let Some(line) = greeting {
            let mut bytes = line.into_bytes();
            bytes.push(b'\n');
            host.lock().await.write_all(&bytes).await?;
        }

        Ok(DeviceConnection::new(path.clone(), Box::new(stream)))
    }
}

/// Marks the device closed when the connection is dropped.
struct OpenGuard {
    devices: Devices,
    path: DevicePath,
}

impl Drop for OpenGuard {
    fn drop(&mut self) {
        let mut devices = self
            .devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(device) = devices.get_mut(&self.path) {
            device.open = false;
            device.host = None;
        }
    }
}

struct MockStream {
    inner: DuplexStream,
    _guard: OpenGuard,
}

impl AsyncRead for MockStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}
