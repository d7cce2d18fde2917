//! Manager: top-level lifecycle.
//!
//! `start()` waits (bounded) for the first device, then starts the Dispatcher
//! followed by the Monitor. `stop()` tears them down in the opposite order and
//! is safe to call more than once.

use crate::config::Settings;
use crate::device::{DevicePath, SerialBackend};
use crate::dispatcher::{Dispatcher, DispatcherHandle, SinkRegistry};
use crate::error::{AppResult, LoggerError};
use crate::monitor::{DeviceMonitor, MonitorHandle, MonitorSettings};
use crate::queue::ingestion_queue;
use crate::reader::{wait_for_stop, ReaderSettings};
use crate::scanner::{PortScanner, ScannerSettings};
use crate::supervisor::Notifier;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Startup wait settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupSettings {
    /// Scans performed before giving up
    pub wait_attempts: u32,
    /// Wait after each empty scan
    pub wait_interval: Duration,
}

/// Everything the Manager hands down to its components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerSettings {
    /// Port Scanner settings
    pub scanner: ScannerSettings,
    /// Device Reader settings
    pub reader: ReaderSettings,
    /// Device Monitor settings
    pub monitor: MonitorSettings,
    /// Startup wait
    pub startup: StartupSettings,
}

impl ManagerSettings {
    /// Derive component settings from the service configuration.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            scanner: settings.scanner_settings(),
            reader: settings.reader_settings(),
            monitor: settings.monitor_settings(),
            startup: settings.startup_settings(),
        }
    }
}

/// Raises the Manager's stop signal from another task (e.g. a signal handler).
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownTrigger {
    /// Request shutdown.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

/// Owns the Dispatcher and Monitor tasks.
pub struct DeviceManager {
    backend: Arc<dyn SerialBackend>,
    settings: ManagerSettings,
    notifier: Arc<dyn Notifier>,
    sinks: Option<SinkRegistry>,
    stop_tx: Arc<watch::Sender<bool>>,
    dispatcher: Option<DispatcherHandle>,
    monitor: Option<MonitorHandle>,
    stopped: bool,
}

impl DeviceManager {
    /// Create a manager; nothing runs until [`DeviceManager::start`].
    pub fn new(
        backend: Arc<dyn SerialBackend>,
        settings: ManagerSettings,
        sinks: SinkRegistry,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            backend,
            settings,
            notifier,
            sinks: Some(sinks),
            stop_tx: Arc::new(stop_tx),
            dispatcher: None,
            monitor: None,
            stopped: false,
        }
    }

    /// Handle that can stop this manager from elsewhere.
    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        ShutdownTrigger {
            tx: self.stop_tx.clone(),
        }
    }

    /// Whether the pipeline tasks are running.
    pub fn is_running(&self) -> bool {
        self.monitor.as_ref().map(|m| !m.is_finished()).unwrap_or(false)
    }

    fn stop_requested(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Wait for the first device, then start the Dispatcher and the Monitor.
    ///
    /// Fails with [`LoggerError::NoDevicesFound`] when every startup scan comes
    /// back empty; nothing is left running in that case. A stop requested
    /// during the wait returns `Ok` without starting anything.
    pub async fn start(&mut self) -> AppResult<()> {
        if self.dispatcher.is_some() || self.stopped {
            warn!("Manager already started or stopped, ignoring start");
            return Ok(());
        }

        let scanner = PortScanner::new(self.backend.clone(), self.settings.scanner.clone())?;
        let found = match self.wait_for_devices(&scanner).await? {
            Some(found) => found,
            None => {
                info!("Stop requested during startup wait");
                return Ok(());
            }
        };
        info!(devices = ?found, "Found serial devices, starting pipeline");

        let (tx, rx) = ingestion_queue();
        let sinks = self.sinks.take().unwrap_or_default();
        self.dispatcher = Some(Dispatcher::new(sinks).spawn(rx));

        let monitor = DeviceMonitor::new(
            scanner,
            self.settings.reader.clone(),
            self.settings.monitor.clone(),
            tx,
            self.notifier.clone(),
        );
        self.monitor = Some(monitor.spawn());
        Ok(())
    }

    /// Scan until something matches. `Ok(None)` means stop was requested.
    ///
    /// At least one scan happens even when `wait_attempts` is zero.
    async fn wait_for_devices(
        &self,
        scanner: &PortScanner,
    ) -> AppResult<Option<BTreeSet<DevicePath>>> {
        let startup = &self.settings.startup;
        let max_attempts = startup.wait_attempts.max(1);
        let mut stop_rx = self.stop_tx.subscribe();

        for attempt in 1..=max_attempts {
            if self.stop_requested() {
                return Ok(None);
            }

            let found = scanner.scan(false).await;
            if !found.is_empty() {
                return Ok(Some(found));
            }

            info!(
                attempt,
                max_attempts,
                wait_secs = startup.wait_interval.as_secs_f64(),
                "No serial devices found, waiting"
            );
            tokio::select! {
                biased;
                _ = wait_for_stop(&mut stop_rx) => return Ok(None),
                _ = tokio::time::sleep(startup.wait_interval) => {}
            }
        }

        let err = LoggerError::NoDevicesFound {
            attempts: max_attempts,
        };
        error!(error = %err, "Giving up waiting for serial devices");
        Err(err)
    }

    /// Resolve once a stop has been requested.
    pub async fn wait_for_shutdown(&self) {
        let mut stop_rx = self.stop_tx.subscribe();
        wait_for_stop(&mut stop_rx).await;
    }

    /// Stop the Monitor (and with it every Reader), then the Dispatcher.
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.stop_tx.send_replace(true);

        if let Some(mut monitor) = self.monitor.take() {
            monitor.stop().await;
        }
        if let Some(mut dispatcher) = self.dispatcher.take() {
            dispatcher.stop().await;
        }
        info!("Manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::MockBackend;
    use crate::supervisor::RecordingNotifier;

    fn settings(wait_attempts: u32) -> ManagerSettings {
        ManagerSettings {
            scanner: ScannerSettings {
                pattern: "ttyACM".to_string(),
                baud_rate: 115_200,
                probe_timeout: Duration::from_secs(1),
            },
            reader: ReaderSettings {
                baud_rate: 115_200,
                read_timeout: Duration::from_secs(1),
                reconnect_delay: Duration::from_secs(1),
                max_reconnect_attempts: 3,
            },
            monitor: MonitorSettings {
                scan_interval: Duration::from_secs(10),
            },
            startup: StartupSettings {
                wait_attempts,
                wait_interval: Duration::from_secs(10),
            },
        }
    }

    fn manager(backend: &MockBackend, wait_attempts: u32) -> DeviceManager {
        DeviceManager::new(
            Arc::new(backend.clone()),
            settings(wait_attempts),
            SinkRegistry::new(),
            Arc::new(RecordingNotifier::new()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn no_devices_is_fatal_after_bounded_wait() {
        let backend = MockBackend::new();
        let mut manager = manager(&backend, 3);

        let started = tokio::time::Instant::now();
        let result = manager.start().await;

        assert!(matches!(result, Err(LoggerError::NoDevicesFound { attempts: 3 })));
        assert_eq!(started.elapsed(), Duration::from_secs(30));
        assert!(!manager.is_running());
        assert!(manager.dispatcher.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_wait_attempts_still_scans_once() {
        let backend = MockBackend::new();
        backend.plug("/dev/ttyACM0", Some("{}"));
        let mut present = manager(&backend, 0);

        present.start().await.unwrap();
        assert!(present.is_running());
        present.stop().await;

        let mut absent = manager(&MockBackend::new(), 0);
        let started = tokio::time::Instant::now();
        let result = absent.start().await;
        assert!(matches!(result, Err(LoggerError::NoDevicesFound { attempts: 1 })));
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn device_appearing_during_wait_starts_pipeline() {
        let backend = MockBackend::new();
        let mut manager = manager(&backend, 5);

        let late = backend.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(15)).await;
            late.plug("/dev/ttyACM0", Some("{}"));
        });

        manager.start().await.unwrap();
        assert!(manager.is_running());
        manager.stop().await;
        assert!(!manager.is_running());
        assert!(!backend.is_open("/dev/ttyACM0"));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_wait_starts_nothing() {
        let backend = MockBackend::new();
        let mut manager = manager(&backend, 100);
        let trigger = manager.shutdown_trigger();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(25)).await;
            trigger.trigger();
        });

        manager.start().await.unwrap();
        assert!(!manager.is_running());
        manager.wait_for_shutdown().await;
        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent() {
        let backend = MockBackend::new();
        backend.plug("/dev/ttyACM0", Some("{}"));
        let mut manager = manager(&backend, 1);

        manager.start().await.unwrap();
        manager.stop().await;
        manager.stop().await;
        assert!(!manager.is_running());
        assert!(manager.start().await.is_ok());
        assert!(!manager.is_running());
    }
}
