//! Dispatcher: drains the ingestion queue into every registered sink.
//!
//! Sinks run one after another, in registration order, for each line. A sink
//! that panics is logged and skipped for that line only; the remaining sinks
//! still see it and the loop keeps going.

use crate::config::{Settings, SinkKind};
use crate::error::{AppResult, LoggerError};
use crate::file_sink::FileWriter;
use crate::influx::InfluxWriter;
use crate::queue::{LineReceiver, RawLine};
use crate::reader::wait_for_stop;
use crate::sink::{LoggingSink, RecordSink, Sink};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Ordered, append-only list of sinks.
#[derive(Clone, Default)]
pub struct SinkRegistry {
    sinks: Vec<Arc<dyn Sink>>,
}

impl SinkRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sink; it will be invoked after every sink registered before it.
    pub fn register(&mut self, sink: Arc<dyn Sink>) {
        info!(sink = sink.name(), position = self.sinks.len(), "Registered sink");
        self.sinks.push(sink);
    }

    /// Build the sinks named by `SINKS`, in that order.
    ///
    /// Fails on the first sink that cannot be created; a missing InfluxDB
    /// token is startup-fatal.
    pub fn from_settings(settings: &Settings) -> AppResult<Self> {
        let mut registry = Self::new();
        for kind in settings.sink_kinds()? {
            let sink: Arc<dyn Sink> = match kind {
                SinkKind::Influx => Arc::new(RecordSink::new(InfluxWriter::new(settings)?)),
                SinkKind::File => Arc::new(RecordSink::new(FileWriter::open(
                    &settings.data_log_path,
                    settings.data_log_backups,
                )?)),
                SinkKind::Log => Arc::new(LoggingSink),
            };
            registry.register(sink);
        }
        Ok(registry)
    }

    /// Builder form of [`SinkRegistry::register`].
    pub fn with(mut self, sink: Arc<dyn Sink>) -> Self {
        self.register(sink);
        self
    }

    /// Number of sinks.
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Whether no sink is registered.
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Sink names in invocation order.
    pub fn names(&self) -> Vec<String> {
        self.sinks.iter().map(|s| s.name().to_string()).collect()
    }
}

impl std::fmt::Debug for SinkRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Delivers lines to the sinks of a frozen registry.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    sinks: SinkRegistry,
}

impl Dispatcher {
    /// Freeze the registry. An empty registry gets a [`LoggingSink`].
    pub fn new(registry: SinkRegistry) -> Self {
        let sinks = if registry.is_empty() {
            info!("No sinks registered, logging received lines");
            SinkRegistry::new().with(Arc::new(LoggingSink))
        } else {
            registry
        };
        Self { sinks }
    }

    /// Sink names in invocation order.
    pub fn sink_names(&self) -> Vec<String> {
        self.sinks.names()
    }

    /// Hand one line to every sink.
    pub async fn dispatch(&self, line: &RawLine) {
        for sink in &self.sinks.sinks {
            let handled = AssertUnwindSafe(sink.handle(&line.text))
                .catch_unwind()
                .await;
            if let Err(payload) = handled {
                error!(
                    sink = sink.name(),
                    device = %line.source,
                    panic = panic_message(payload.as_ref()),
                    "Sink panicked while handling a line"
                );
            }
        }
    }

    /// Run the dispatch loop in its own task.
    pub fn spawn(self, queue: LineReceiver) -> DispatcherHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let join = tokio::spawn(self.run(queue, stop_rx));
        DispatcherHandle {
            stop_tx,
            join: Some(join),
        }
    }

    async fn run(self, mut queue: LineReceiver, mut stop_rx: watch::Receiver<bool>) {
        info!(sinks = ?self.sink_names(), "Dispatcher started");
        loop {
            let next = tokio::select! {
                biased;
                _ = wait_for_stop(&mut stop_rx) => break,
                next = queue.recv() => next,
            };
            match next {
                Some(line) => self.dispatch(&line).await,
                None => {
                    debug!("Ingestion queue closed");
                    break;
                }
            }
        }
        info!(undelivered = queue.depth(), "Dispatcher stopped");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

/// Handle to a running dispatcher task.
#[derive(Debug)]
pub struct DispatcherHandle {
    stop_tx: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl DispatcherHandle {
    /// Stop after the current line; queued lines are not flushed.
    pub async fn stop(&mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await.map_err(LoggerError::from) {
                error!(error = %e, "Dispatcher task failed");
            }
        }
    }

    /// Whether the dispatcher task has exited.
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map(|j| j.is_finished()).unwrap_or(true)
    }
}
