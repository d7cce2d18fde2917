//! Sink capability and its record-level adapter.
//!
//! The Dispatcher only knows [`Sink`]: something that takes a raw line and
//! never reports failure back. Concrete storage backends implement the
//! narrower [`RecordWriter`] and are wrapped in [`RecordSink`], which does the
//! parse and validate step once for all of them.

use crate::record::SensorRecord;
use async_trait::async_trait;
use tracing::{debug, error, info, warn};

/// Consumer of raw telemetry lines.
///
/// `handle` has no error channel: implementations log their own failures.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Process one line.
    async fn handle(&self, line: &str);
}

/// Persists validated records.
#[async_trait]
pub trait RecordWriter: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Persist one record.
    async fn write(&self, record: &SensorRecord) -> anyhow::Result<()>;
}

/// Adapts a [`RecordWriter`] into a [`Sink`].
///
/// Malformed lines are dropped with a single warning; write failures are
/// logged at error level. Neither reaches the caller.
pub struct RecordSink<W> {
    writer: W,
}

impl<W: RecordWriter> RecordSink<W> {
    /// Wrap a writer.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// The wrapped writer.
    pub fn writer(&self) -> &W {
        &self.writer
    }
}

#[async_trait]
impl<W: RecordWriter> Sink for RecordSink<W> {
    fn name(&self) -> &str {
        self.writer.name()
    }

    async fn handle(&self, line: &str) {
        let record = match SensorRecord::parse(line) {
            Ok(record) => record,
            Err(e) => {
                warn!(sink = self.name(), error = %e, line, "Dropping malformed record");
                return;
            }
        };

        match self.writer.write(&record).await {
            Ok(()) => debug!(sink = self.name(), box_id = %record.box_id(), "Record written"),
            Err(e) => error!(
                sink = self.name(),
                error = %format!("{:#}", e),
                "Failed to write record"
            ),
        }
    }
}

/// Logs every line at info level.
///
/// Installed by the Dispatcher when nothing else is registered.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingSink;

#[async_trait]
impl Sink for LoggingSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn handle(&self, line: &str) {
        info!(line, "Received data");
    }
}
