//! Device Reader: one task per tracked device.
//!
//! ```text
//!  DISCONNECTED ──open──▶ CONNECTING ──ok──▶ CONNECTED ──read loop──┐
//!       ▲                     │                  │                  │
//!       │         open failed │                  │ EOF / I/O error  │
//!       │                     ▼                  ▼                  │
//!       └───── backoff ◀── DISCONNECTED ◀────────┘                  │
//!                                                                   │
//!  stop signal (any state) or attempts > max ──────────────▶ STOPPED
//! ```
//!
//! Every reconnect waits `reconnect_delay`. A connection that ends before it
//! delivered a line counts as a failed attempt; one that delivered data
//! resets the counter.
//!
//! The reader owns its [`DeviceConnection`] for its whole life; nobody else
//! opens or closes it. Stop is raced against every blocking point (open, read,
//! backoff sleep), and [`ReaderHandle::stop`] only returns after the task has
//! exited, so the handle is closed by then.

use crate::device::{DeviceConnection, DevicePath, LineRead, SerialBackend};
use crate::error::LoggerError;
use crate::queue::{LineSender, RawLine};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Per-reader settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderSettings {
    /// Baud rate the device is opened at
    pub baud_rate: u32,
    /// Bound on a single line read
    pub read_timeout: Duration,
    /// Sleep between failed opens
    pub reconnect_delay: Duration,
    /// Consecutive failed opens tolerated before giving up
    pub max_reconnect_attempts: u32,
}

/// Observable reader state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    /// No open handle; waiting to (re)connect
    Disconnected,
    /// Open in progress
    Connecting,
    /// Handle open, reading lines
    Connected,
    /// Terminal
    Stopped,
}

/// Why a reader task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderExit {
    /// The stop signal was raised
    Stopped,
    /// Reconnect attempts were exhausted
    GaveUp {
        /// Failed opens in the final run
        attempts: u32,
    },
}

enum ReadEnd {
    Stopped,
    /// Connection dropped after `lines` non-empty lines.
    Lost { lines: u64 },
}

/// Handle to a running reader, owned by whoever admitted the device.
#[derive(Debug)]
pub struct ReaderHandle {
    path: DevicePath,
    state_rx: watch::Receiver<ReaderState>,
    stop_tx: watch::Sender<bool>,
    join: Option<JoinHandle<ReaderExit>>,
}

impl ReaderHandle {
    /// Device this reader owns.
    pub fn path(&self) -> &DevicePath {
        &self.path
    }

    /// Current state.
    pub fn state(&self) -> ReaderState {
        *self.state_rx.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ReaderState> {
        self.state_rx.clone()
    }

    /// Whether the task has already exited on its own.
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map(|j| j.is_finished()).unwrap_or(true)
    }

    /// Raise the stop signal and wait for the task to exit.
    ///
    /// Idempotent; returns `None` when the task was already joined.
    pub async fn stop(&mut self) -> Option<ReaderExit> {
        let _ = self.stop_tx.send(true);
        self.join_task().await
    }

    /// Wait for the task to exit without asking it to.
    pub async fn wait(&mut self) -> Option<ReaderExit> {
        self.join_task().await
    }

    async fn join_task(&mut self) -> Option<ReaderExit> {
        let join = self.join.take()?;
        match join.await {
            Ok(exit) => Some(exit),
            Err(e) => {
                let err = LoggerError::from(e);
                error!(device = %self.path, error = %err, "Reader task failed");
                None
            }
        }
    }
}

/// Spawns reader tasks.
pub struct DeviceReader {
    path: DevicePath,
    backend: Arc<dyn SerialBackend>,
    settings: ReaderSettings,
    queue: LineSender,
    state_tx: watch::Sender<ReaderState>,
    stop_rx: watch::Receiver<bool>,
}

impl DeviceReader {
    /// Start a reader for `path` and return its handle.
    pub fn spawn(
        path: DevicePath,
        backend: Arc<dyn SerialBackend>,
        settings: ReaderSettings,
        queue: LineSender,
    ) -> ReaderHandle {
        let (state_tx, state_rx) = watch::channel(ReaderState::Disconnected);
        let (stop_tx, stop_rx) = watch::channel(false);

        let reader = DeviceReader {
            path: path.clone(),
            backend,
            settings,
            queue,
            state_tx,
            stop_rx,
        };
        let join = tokio::spawn(reader.run());

        ReaderHandle {
            path,
            state_rx,
            stop_tx,
            join: Some(join),
        }
    }

    fn set_state(&self, state: ReaderState) {
        self.state_tx.send_replace(state);
    }

    fn stop_requested(&self) -> bool {
        *self.stop_rx.borrow()
    }

    async fn run(self) -> ReaderExit {
        let exit = self.connect_loop().await;
        self.set_state(ReaderState::Stopped);
        match exit {
            ReaderExit::Stopped => info!(device = %self.path, "Reader stopped"),
            ReaderExit::GaveUp { attempts } => error!(
                device = %self.path,
                attempts,
                "Giving up on device after repeated connection failures"
            ),
        }
        exit
    }

    async fn connect_loop(&self) -> ReaderExit {
        let mut attempts: u32 = 0;

        loop {
            if self.stop_requested() {
                return ReaderExit::Stopped;
            }

            self.set_state(ReaderState::Connecting);
            let opened = {
                let open = self.backend.open(&self.path, self.settings.baud_rate);
                let mut stop_rx = self.stop_rx.clone();
                tokio::select! {
                    biased;
                    _ = wait_for_stop(&mut stop_rx) => return ReaderExit::Stopped,
                    opened = open => opened,
                }
            };

            let failure = match opened {
                Ok(mut conn) => {
                    self.set_state(ReaderState::Connected);
                    info!(device = %self.path, baud_rate = self.settings.baud_rate, "Connected");

                    let end = self.read_loop(&mut conn).await;
                    conn.close();
                    match end {
                        ReadEnd::Stopped => return ReaderExit::Stopped,
                        ReadEnd::Lost { lines } if lines > 0 => {
                            attempts = 0;
                            self.set_state(ReaderState::Disconnected);
                            warn!(device = %self.path, lines, "Connection lost, reconnecting");
                            None
                        }
                        // A device that hangs up before sending anything is no
                        // better than one that refuses the open.
                        ReadEnd::Lost { .. } => {
                            Some("connection closed before any data".to_string())
                        }
                    }
                }
                Err(e) => Some(format!("{:#}", e)),
            };

            if let Some(error) = failure {
                attempts += 1;
                self.set_state(ReaderState::Disconnected);
                warn!(
                    device = %self.path,
                    attempt = attempts,
                    max_attempts = self.settings.max_reconnect_attempts,
                    error = %error,
                    "Connection attempt failed"
                );
                if attempts > self.settings.max_reconnect_attempts {
                    return ReaderExit::GaveUp { attempts };
                }
            }

            if !self.backoff().await {
                return ReaderExit::Stopped;
            }
        }
    }

    /// Read until stop or until the connection is lost.
    async fn read_loop(&self, conn: &mut DeviceConnection) -> ReadEnd {
        let mut stop_rx = self.stop_rx.clone();
        let mut lines: u64 = 0;
        loop {
            if self.stop_requested() {
                return ReadEnd::Stopped;
            }

            let read = tokio::select! {
                biased;
                _ = wait_for_stop(&mut stop_rx) => return ReadEnd::Stopped,
                read = conn.read_line(self.settings.read_timeout) => read,
            };

            match read {
                Ok(LineRead::Line(text)) => {
                    if text.is_empty() {
                        continue;
                    }
                    lines += 1;
                    let line = RawLine {
                        source: self.path.clone(),
                        text,
                    };
                    if !self.queue.send(line) {
                        debug!(device = %self.path, "Ingestion queue closed, dropping line");
                    }
                }
                Ok(LineRead::Timeout) => {
                    debug!(device = %self.path, "Read timed out");
                }
                Ok(LineRead::Undecodable(reason)) => {
                    debug!(device = %self.path, reason = %reason, "Skipping undecodable line");
                }
                Ok(LineRead::Eof) => {
                    debug!(device = %self.path, "Device closed the stream");
                    return ReadEnd::Lost { lines };
                }
                Err(e) => {
                    debug!(device = %self.path, error = %e, "Read failed");
                    return ReadEnd::Lost { lines };
                }
            }
        }
    }

    /// Sleep the reconnect delay; false when stop arrived first.
    async fn backoff(&self) -> bool {
        let mut stop_rx = self.stop_rx.clone();
        tokio::select! {
            biased;
            _ = wait_for_stop(&mut stop_rx) => false,
            _ = tokio::time::sleep(self.settings.reconnect_delay) => true,
        }
    }
}

/// Resolves once the stop flag is true or its sender is gone.
pub(crate) async fn wait_for_stop(stop_rx: &mut watch::Receiver<bool>) {
    let _ = stop_rx.wait_for(|stop| *stop).await;
}
