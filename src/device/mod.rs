//! Serial device abstractions.
//!
//! The rest of the crate talks to hardware only through [`SerialBackend`], so the
//! scanner, readers and monitor run unchanged against real ports
//! ([`serial::TokioSerialBackend`]) or the in-memory [`mock::MockBackend`].
//!
//! # Types
//!
//! - [`DevicePath`]: the OS name of a serial device, unique key of the live set
//! - [`SerialPortIO`]: trait alias for anything a connection can read from
//! - [`DeviceConnection`]: an exclusively-owned open device with line framing

pub mod mock;
pub mod serial;

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

/// Longest line kept, newline included. Sensor boxes send well under 1 KiB.
pub const MAX_LINE_BYTES: usize = 4096;

pub use serial::TokioSerialBackend;

/// OS-visible name of one serial device (e.g. `/dev/ttyACM0`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DevicePath(String);

impl DevicePath {
    /// Wrap a device name.
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// The device name as text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DevicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DevicePath {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DevicePath {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Trait alias for async serial port input.
///
/// Any type implementing `AsyncRead + Unpin + Send` can back a connection:
/// - `tokio_serial::SerialStream` (real hardware)
/// - `tokio::io::DuplexStream` (testing)
pub trait SerialPortIO: AsyncRead + Unpin + Send {}

impl<T: AsyncRead + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Access to the machine's serial devices.
#[async_trait]
pub trait SerialBackend: Send + Sync {
    /// Every serial device the OS currently reports, unfiltered.
    async fn available_ports(&self) -> anyhow::Result<Vec<DevicePath>>;

    /// Open a device exclusively at the given baud rate.
    async fn open(&self, path: &DevicePath, baud_rate: u32) -> anyhow::Result<DeviceConnection>;
}

/// Outcome of one bounded line read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineRead {
    /// A complete line with trailing whitespace stripped (may be empty).
    Line(String),
    /// No complete line arrived within the read timeout.
    Timeout,
    /// A line arrived but was not valid UTF-8.
    Undecodable(String),
    /// The device side closed the stream.
    Eof,
}

/// An open, exclusively-owned device handle.
///
/// Closed when dropped. Partial lines survive a timed-out read and are
/// completed by the next call. A line longer than [`MAX_LINE_BYTES`] is
/// reported as [`LineRead::Undecodable`] and its remainder skipped.
pub struct DeviceConnection {
    path: DevicePath,
    reader: BufReader<DynSerial>,
    pending: Vec<u8>,
    discarding: bool,
}

impl DeviceConnection {
    /// Wrap an already-open stream.
    pub fn new(path: DevicePath, port: DynSerial) -> Self {
        Self {
            path,
            reader: BufReader::new(port),
            pending: Vec::new(),
            discarding: false,
        }
    }

    /// Device this handle belongs to.
    pub fn path(&self) -> &DevicePath {
        &self.path
    }

    /// Read one newline-terminated line, waiting at most `timeout`.
    pub async fn read_line(&mut self, timeout: Duration) -> io::Result<LineRead> {
        let limit = MAX_LINE_BYTES.saturating_sub(self.pending.len()) as u64;
        let mut bounded = (&mut self.reader).take(limit);
        let read = bounded.read_until(b'\n', &mut self.pending);
        let result = tokio::time::timeout(timeout, read).await;

        match result {
            Err(_) => Ok(LineRead::Timeout),
            Ok(Err(e)) if e.kind() == io::ErrorKind::TimedOut => Ok(LineRead::Timeout),
            Ok(Err(e)) => Err(e),
            Ok(Ok(0)) if self.pending.is_empty() => Ok(LineRead::Eof),
            Ok(Ok(_)) => Ok(self.take_line()),
        }
    }

    fn take_line(&mut self) -> LineRead {
        let complete = self.pending.last() == Some(&b'\n');
        if !complete && self.pending.len() >= MAX_LINE_BYTES {
            self.pending.clear();
            self.discarding = true;
            return LineRead::Undecodable(format!("line exceeds {} bytes", MAX_LINE_BYTES));
        }

        let bytes = std::mem::take(&mut self.pending);
        if std::mem::take(&mut self.discarding) {
            return LineRead::Undecodable("tail of an oversized line".to_string());
        }
        match String::from_utf8(bytes) {
            Ok(text) => LineRead::Line(text.trim_end().to_string()),
            Err(e) => LineRead::Undecodable(e.to_string()),
        }
    }

    /// Close the handle.
    pub fn close(self) {
        drop(self);
    }
}

impl fmt::Debug for DeviceConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConnection")
            .field("path", &self.path)
            .field("pending_bytes", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn connection() -> (tokio::io::DuplexStream, DeviceConnection) {
        let (host, device) = tokio::io::duplex(256);
        (
            host,
            DeviceConnection::new(DevicePath::from("/dev/ttyACM0"), Box::new(device)),
        )
    }

    #[tokio::test]
    async fn reads_and_trims_lines() {
        let (mut host, mut conn) = connection();
        host.write_all(b"{\"ID\":1}\r\n\n").await.unwrap();

        let line = conn.read_line(Duration::from_millis(100)).await.unwrap();
        assert_eq!(line, LineRead::Line("{\"ID\":1}".to_string()));

        let blank = conn.read_line(Duration::from_millis(100)).await.unwrap();
        assert_eq!(blank, LineRead::Line(String::new()));
    }

    #[tokio::test(start_paused = true)]
    async fn partial_line_survives_timeout() {
        let (mut host, mut conn) = connection();
        host.write_all(b"{\"co2\":").await.unwrap();

        let first = conn.read_line(Duration::from_secs(1)).await.unwrap();
        assert_eq!(first, LineRead::Timeout);

        host.write_all(b"450}\n").await.unwrap();
        let second = conn.read_line(Duration::from_secs(1)).await.unwrap();
        assert_eq!(second, LineRead::Line("{\"co2\":450}".to_string()));
    }

    #[tokio::test]
    async fn invalid_utf8_is_reported_not_fatal() {
        let (mut host, mut conn) = connection();
        host.write_all(&[0xff, 0xfe, b'\n']).await.unwrap();
        host.write_all(b"ok\n").await.unwrap();

        let bad = conn.read_line(Duration::from_millis(100)).await.unwrap();
        assert!(matches!(bad, LineRead::Undecodable(_)));

        let good = conn.read_line(Duration::from_millis(100)).await.unwrap();
        assert_eq!(good, LineRead::Line("ok".to_string()));
    }

    #[tokio::test]
    async fn oversized_line_is_skipped() {
        let (mut host, mut conn) = connection();
        let writer = tokio::spawn(async move {
            host.write_all(&[b'x'; MAX_LINE_BYTES + 500]).await.unwrap();
            host.write_all(b"\n{\"ID\":7}\n").await.unwrap();
            host
        });

        let timeout = Duration::from_secs(1);
        let first = conn.read_line(timeout).await.unwrap();
        assert!(matches!(first, LineRead::Undecodable(ref why) if why.contains("4096")));
        assert!(conn.pending.capacity() <= 2 * MAX_LINE_BYTES);

        let tail = conn.read_line(timeout).await.unwrap();
        assert!(matches!(tail, LineRead::Undecodable(_)));

        let next = conn.read_line(timeout).await.unwrap();
        assert_eq!(next, LineRead::Line("{\"ID\":7}".to_string()));
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn closed_host_reads_as_eof() {
        let (host, mut conn) = connection();
        drop(host);
        let read = conn.read_line(Duration::from_millis(100)).await.unwrap();
        assert_eq!(read, LineRead::Eof);
    }

    #[test]
    fn device_path_ordering_and_display() {
        let a = DevicePath::from("/dev/ttyACM0");
        let b = DevicePath::from("/dev/ttyUSB0".to_string());
        assert!(a < b);
        assert_eq!(a.to_string(), "/dev/ttyACM0");
        assert_eq!(b.as_str(), "/dev/ttyUSB0");
    }
}
