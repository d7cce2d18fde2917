//! Ingestion queue between Device Readers and the Dispatcher.
//!
//! Unbounded and FIFO. Every reader holds a cloned [`LineSender`]; the single
//! [`LineReceiver`] belongs to the Dispatcher. Depth is tracked so a consumer
//! that falls behind shows up in the logs.

use crate::device::DevicePath;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// Depth above which every enqueue logs a warning.
pub const DEPTH_WARN_THRESHOLD: usize = 1024;

/// One line read from a device, with trailing whitespace stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine {
    /// Device the line came from
    pub source: DevicePath,
    /// Decoded text
    pub text: String,
}

/// Producer half; cheap to clone.
#[derive(Debug, Clone)]
pub struct LineSender {
    tx: mpsc::UnboundedSender<RawLine>,
    depth: Arc<AtomicUsize>,
}

/// Consumer half.
#[derive(Debug)]
pub struct LineReceiver {
    rx: mpsc::UnboundedReceiver<RawLine>,
    depth: Arc<AtomicUsize>,
}

/// Create the queue.
pub fn ingestion_queue() -> (LineSender, LineReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));
    (
        LineSender {
            tx,
            depth: depth.clone(),
        },
        LineReceiver { rx, depth },
    )
}

impl LineSender {
    /// Enqueue a line. Returns false once the receiver is gone.
    pub fn send(&self, line: RawLine) -> bool {
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        if depth > DEPTH_WARN_THRESHOLD {
            warn!(depth, device = %line.source, "Ingestion queue is backing up");
        }
        if self.tx.send(line).is_err() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    /// Lines enqueued but not yet taken.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}

impl LineReceiver {
    /// Next line in FIFO order; `None` once every sender is dropped and the
    /// queue is drained.
    pub async fn recv(&mut self) -> Option<RawLine> {
        let line = self.rx.recv().await;
        if line.is_some() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
        }
        line
    }

    /// Lines enqueued but not yet taken.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}
