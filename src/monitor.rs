//! Device Monitor: keeps the live reader set in step with the hardware.
//!
//! Every scan interval the monitor reconciles its LiveSet against a fresh
//! scan. Readers are started for devices that appeared (and answer a ping)
//! and stopped for devices that vanished. The LiveSet is owned by the monitor
//! task alone; readers never see it.

use crate::device::DevicePath;
use crate::error::LoggerError;
use crate::queue::LineSender;
use crate::reader::{wait_for_stop, DeviceReader, ReaderExit, ReaderHandle, ReaderSettings, ReaderState};
use crate::scanner::PortScanner;
use crate::supervisor::{NotifyState, Notifier};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Device Monitor settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorSettings {
    /// Sleep between reconciliation cycles
    pub scan_interval: Duration,
}

/// Reconciles tracked devices with present devices.
pub struct DeviceMonitor {
    scanner: PortScanner,
    reader_settings: ReaderSettings,
    settings: MonitorSettings,
    queue: LineSender,
    notifier: Arc<dyn Notifier>,
    live: BTreeMap<DevicePath, ReaderHandle>,
}

impl DeviceMonitor {
    /// Create a monitor with an empty live set.
    pub fn new(
        scanner: PortScanner,
        reader_settings: ReaderSettings,
        settings: MonitorSettings,
        queue: LineSender,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            scanner,
            reader_settings,
            settings,
            queue,
            notifier,
            live: BTreeMap::new(),
        }
    }

    /// Devices with a reader right now.
    pub fn tracked(&self) -> BTreeSet<DevicePath> {
        self.live.keys().cloned().collect()
    }

    /// State of the reader tracking `path`, if any.
    pub fn reader_state(&self, path: &DevicePath) -> Option<ReaderState> {
        self.live.get(path).map(ReaderHandle::state)
    }

    /// Run one reconciliation cycle.
    ///
    /// 1. Reap readers that ended on their own (not re-admitted this cycle).
    /// 2. Scan without ping.
    /// 3. Stop and drop readers whose device is gone.
    /// 4. Ping each new device and start a reader for those that answer.
    pub async fn reconcile(&mut self) {
        let reaped = self.reap_finished().await;

        let present = self.scanner.scan(false).await;

        let absent: Vec<DevicePath> = self
            .live
            .keys()
            .filter(|path| !present.contains(*path))
            .cloned()
            .collect();
        for path in absent {
            if let Some(mut handle) = self.live.remove(&path) {
                info!(device = %path, "Device disappeared, stopping reader");
                handle.stop().await;
            }
        }

        for path in present {
            if self.live.contains_key(&path) || reaped.contains(&path) {
                continue;
            }
            if !self.scanner.ping(&path).await {
                debug!(device = %path, "New device not ready, retrying next cycle");
                continue;
            }

            info!(device = %path, "Device appeared, starting reader");
            let handle = DeviceReader::spawn(
                path.clone(),
                self.scanner.backend().clone(),
                self.reader_settings.clone(),
                self.queue.clone(),
            );
            self.live.insert(path, handle);
        }

        if self.live.is_empty() {
            warn!("No devices are currently being read");
        } else {
            debug!(devices = self.live.len(), "Reconciliation complete");
        }
    }

    async fn reap_finished(&mut self) -> BTreeSet<DevicePath> {
        let finished: Vec<DevicePath> = self
            .live
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(path, _)| path.clone())
            .collect();

        let mut reaped = BTreeSet::new();
        for path in finished {
            if let Some(mut handle) = self.live.remove(&path) {
                match handle.wait().await {
                    Some(ReaderExit::GaveUp { attempts }) => {
                        warn!(device = %path, attempts, "Dropping failed reader");
                    }
                    Some(ReaderExit::Stopped) | None => {
                        debug!(device = %path, "Dropping finished reader");
                    }
                }
                reaped.insert(path);
            }
        }
        reaped
    }

    /// Stop every tracked reader and wait for each to exit.
    pub async fn stop_all(&mut self) {
        while let Some((path, mut handle)) = self.live.pop_first() {
            debug!(device = %path, "Stopping reader");
            handle.stop().await;
        }
    }

    /// Start the reconciliation loop in its own task.
    pub fn spawn(self) -> MonitorHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let join = tokio::spawn(self.run(stop_rx));
        MonitorHandle {
            stop_tx,
            join: Some(join),
        }
    }

    async fn run(mut self, mut stop_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.settings.scan_interval.as_secs_f64(),
            "Device monitor started"
        );
        let mut ready_sent = false;

        loop {
            if *stop_rx.borrow() {
                break;
            }

            self.reconcile().await;
            if !ready_sent {
                self.notifier.notify(NotifyState::Ready);
                ready_sent = true;
            }

            tokio::select! {
                biased;
                _ = wait_for_stop(&mut stop_rx) => break,
                _ = tokio::time::sleep(self.settings.scan_interval) => {}
            }
            self.notifier.notify(NotifyState::Watchdog);
        }

        self.stop_all().await;
        info!("Device monitor stopped");
    }
}

/// Handle to a running monitor task.
#[derive(Debug)]
pub struct MonitorHandle {
    stop_tx: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Stop the loop and every reader; returns once all have exited.
    pub async fn stop(&mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await.map_err(LoggerError::from) {
                error!(error = %e, "Device monitor task failed");
            }
        }
    }

    /// Whether the monitor task has exited.
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map(|j| j.is_finished()).unwrap_or(true)
    }
}
