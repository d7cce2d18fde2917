//! End-to-end tests of the scan → read → dispatch pipeline over the mock backend.

use anyhow::anyhow;
use async_trait::async_trait;
use box_logger::config::Settings;
use box_logger::device::mock::MockBackend;
use box_logger::device::DevicePath;
use box_logger::dispatcher::SinkRegistry;
use box_logger::error::LoggerError;
use box_logger::manager::{DeviceManager, ManagerSettings};
use box_logger::monitor::{DeviceMonitor, MonitorSettings};
use box_logger::queue::ingestion_queue;
use box_logger::reader::{ReaderSettings, ReaderState};
use box_logger::record::SensorRecord;
use box_logger::scanner::{PortScanner, ScannerSettings};
use box_logger::sink::{RecordSink, RecordWriter, Sink};
use box_logger::supervisor::{NotifyState, RecordingNotifier};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const BOX_3: &str =
    r#"{"ID":3,"co2":512,"%RH":60,"RHSP":70,"boxTempC":30,"BHSP":31,"waterTempC":40,"IHSP":41}"#;

/// Sink that remembers every line it was handed.
#[derive(Default)]
struct Collector {
    lines: Mutex<Vec<String>>,
}

impl Collector {
    fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sink for Collector {
    fn name(&self) -> &str {
        "collector"
    }

    async fn handle(&self, line: &str) {
        self.lines.lock().unwrap().push(line.to_string());
    }
}

/// Writer whose backend is always down.
struct Unreachable;

#[async_trait]
impl RecordWriter for Unreachable {
    fn name(&self) -> &str {
        "unreachable"
    }

    async fn write(&self, _record: &SensorRecord) -> anyhow::Result<()> {
        Err(anyhow!("connection refused"))
    }
}

fn test_settings() -> Settings {
    Settings {
        ports_re: "ttyACM".to_string(),
        port_timeout: 1,
        port_reconnect_delay: 2,
        port_scan_interval: 10,
        reconnect_attempts: 5,
        wait_for_ports_attempts: 3,
        wait_for_ports_interval: 10,
        ..Default::default()
    }
}

/// Poll `cond` on the (paused) clock until it holds or a minute passes.
async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..600 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    cond()
}

#[tokio::test(start_paused = true)]
async fn lines_reach_sinks_in_order_despite_failing_sink() {
    let backend = MockBackend::new();
    backend.plug("/dev/ttyACM0", Some(BOX_3));

    let collector = Arc::new(Collector::default());
    let sinks = SinkRegistry::new()
        .with(Arc::new(RecordSink::new(Unreachable)))
        .with(collector.clone());
    let notifier = Arc::new(RecordingNotifier::new());

    let mut manager = DeviceManager::new(
        Arc::new(backend.clone()),
        ManagerSettings::from_settings(&test_settings()),
        sinks,
        notifier.clone(),
    );
    manager.start().await.unwrap();
    assert!(manager.is_running());

    // The greeting proves the reader is connected.
    assert!(eventually(|| !collector.lines().is_empty()).await);

    for co2 in [600, 601, 602] {
        let line = BOX_3.replace("512", &co2.to_string());
        assert!(backend.send_line("/dev/ttyACM0", &line).await);
    }
    assert!(eventually(|| collector.lines().len() == 4).await);

    let lines = collector.lines();
    assert_eq!(lines[0], BOX_3);
    for (line, co2) in lines[1..].iter().zip(["600", "601", "602"]) {
        assert!(line.contains(&format!("\"co2\":{}", co2)));
    }
    assert_eq!(notifier.count(NotifyState::Ready), 1);

    manager.stop().await;
    assert!(!manager.is_running());
    assert!(!backend.is_open("/dev/ttyACM0"));
}

#[tokio::test(start_paused = true)]
async fn startup_without_devices_is_fatal() {
    let backend = MockBackend::new();
    backend.plug("/dev/ttyS0", Some(BOX_3));

    let mut manager = DeviceManager::new(
        Arc::new(backend.clone()),
        ManagerSettings::from_settings(&test_settings()),
        SinkRegistry::new(),
        Arc::new(RecordingNotifier::new()),
    );

    let err = manager.start().await.unwrap_err();
    assert!(matches!(err, LoggerError::NoDevicesFound { attempts: 3 }));
    assert!(err.is_startup_fatal());
    assert!(!manager.is_running());
    assert_eq!(backend.open_count("/dev/ttyS0"), 0);
}

fn monitor(backend: &MockBackend) -> DeviceMonitor {
    let scanner = PortScanner::new(
        Arc::new(backend.clone()),
        ScannerSettings {
            pattern: "ttyACM".to_string(),
            baud_rate: 115_200,
            probe_timeout: Duration::from_secs(1),
        },
    )
    .unwrap();
    let (tx, _rx) = ingestion_queue();
    DeviceMonitor::new(
        scanner,
        ReaderSettings {
            baud_rate: 115_200,
            read_timeout: Duration::from_secs(1),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 100,
        },
        MonitorSettings {
            scan_interval: Duration::from_secs(10),
        },
        tx,
        Arc::new(RecordingNotifier::new()),
    )
}

fn paths(names: &[&str]) -> BTreeSet<DevicePath> {
    names.iter().map(|n| DevicePath::from(*n)).collect()
}

#[tokio::test(start_paused = true)]
async fn unplugged_device_in_backoff_is_stopped_on_next_cycle() {
    let backend = MockBackend::new();
    backend.plug("/dev/ttyACM0", Some(BOX_3));
    backend.plug("/dev/ttyACM1", Some(BOX_3));
    let mut monitor = monitor(&backend);

    monitor.reconcile().await;
    assert_eq!(monitor.tracked(), paths(&["/dev/ttyACM0", "/dev/ttyACM1"]));
    assert!(eventually(|| backend.is_open("/dev/ttyACM0")).await);

    backend.unplug("/dev/ttyACM0");
    let path = DevicePath::from("/dev/ttyACM0");
    assert!(eventually(|| monitor.reader_state(&path) == Some(ReaderState::Disconnected)).await);

    monitor.reconcile().await;
    assert_eq!(monitor.tracked(), paths(&["/dev/ttyACM1"]));
    assert!(!backend.is_open("/dev/ttyACM0"));
    assert!(backend.is_open("/dev/ttyACM1"));

    // Replugging brings it back with a fresh reader.
    let opens_before = backend.open_count("/dev/ttyACM0");
    backend.plug("/dev/ttyACM0", Some(BOX_3));
    monitor.reconcile().await;
    assert_eq!(monitor.tracked(), paths(&["/dev/ttyACM0", "/dev/ttyACM1"]));
    assert!(eventually(|| backend.open_count("/dev/ttyACM0") >= opens_before + 2).await);

    monitor.stop_all().await;
    assert!(monitor.tracked().is_empty());
    assert!(!backend.is_open("/dev/ttyACM0"));
    assert!(!backend.is_open("/dev/ttyACM1"));
}

#[tokio::test(start_paused = true)]
async fn reconciliation_sequence_tracks_present_devices() {
    let backend = MockBackend::new();
    let mut monitor = monitor(&backend);

    // (plug, unplug, expected live set) per cycle
    let cycles: [(&[&str], &[&str], &[&str]); 4] = [
        (&["/dev/ttyACM0"], &[], &["/dev/ttyACM0"]),
        (&["/dev/ttyACM1", "/dev/ttyUSB0"], &[], &["/dev/ttyACM0", "/dev/ttyACM1"]),
        (&[], &["/dev/ttyACM0"], &["/dev/ttyACM1"]),
        (&[], &["/dev/ttyACM1"], &[]),
    ];

    for (plug, unplug, expected) in cycles {
        for p in plug {
            backend.plug(*p, Some(BOX_3));
        }
        for p in unplug {
            backend.unplug(*p);
        }
        monitor.reconcile().await;
        assert_eq!(monitor.tracked(), paths(expected));
    }

    assert_eq!(backend.open_count("/dev/ttyUSB0"), 0);
}
