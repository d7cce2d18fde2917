//! Process supervisor notifications (systemd `sd_notify` protocol).
//!
//! When the service runs under systemd with `Type=notify` and a watchdog,
//! `NOTIFY_SOCKET` names a Unix datagram socket. Each notification is a single
//! `KEY=VALUE` datagram. Without the variable every notification is a no-op.

use std::io;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Environment variable systemd uses to pass the notification socket.
pub const NOTIFY_SOCKET_ENV: &str = "NOTIFY_SOCKET";

/// Lifecycle states reported to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyState {
    /// Startup finished
    Ready,
    /// Liveness heartbeat
    Watchdog,
    /// Shutdown started
    Stopping,
}

impl NotifyState {
    /// Datagram payload for this state.
    pub fn as_message(&self) -> &'static str {
        match self {
            NotifyState::Ready => "READY=1",
            NotifyState::Watchdog => "WATCHDOG=1",
            NotifyState::Stopping => "STOPPING=1",
        }
    }
}

/// Something that reports lifecycle events to a process supervisor.
///
/// Implementations must not fail the caller; delivery problems are logged.
pub trait Notifier: Send + Sync {
    /// Report a state.
    fn notify(&self, state: NotifyState);
}

/// `sd_notify` over `NOTIFY_SOCKET`.
#[derive(Debug, Clone, Default)]
pub struct SystemdNotifier {
    socket_path: Option<String>,
}

impl SystemdNotifier {
    /// Read `NOTIFY_SOCKET`; unset or empty disables notifications.
    pub fn from_env() -> Self {
        let socket_path = std::env::var(NOTIFY_SOCKET_ENV)
            .ok()
            .filter(|p| !p.is_empty());
        if socket_path.is_none() {
            debug!("NOTIFY_SOCKET not set, supervisor notifications disabled");
        }
        Self { socket_path }
    }

    /// Notifier that never sends anything.
    pub fn disabled() -> Self {
        Self { socket_path: None }
    }

    /// Notifier bound to an explicit socket path (`@name` for abstract sockets).
    pub fn with_socket(path: impl Into<String>) -> Self {
        Self {
            socket_path: Some(path.into()),
        }
    }

    /// Whether a supervisor socket is configured.
    pub fn is_enabled(&self) -> bool {
        self.socket_path.is_some()
    }

    /// Send one raw datagram.
    pub fn send(&self, message: &str) -> io::Result<()> {
        match &self.socket_path {
            Some(path) => send_datagram(path, message),
            None => Ok(()),
        }
    }
}

impl Notifier for SystemdNotifier {
    fn notify(&self, state: NotifyState) {
        if let Err(e) = self.send(state.as_message()) {
            warn!(state = ?state, error = %e, "Failed to notify supervisor");
        }
    }
}

#[cfg(unix)]
fn send_datagram(path: &str, message: &str) -> io::Result<()> {
    use std::os::unix::net::UnixDatagram;

    let socket = UnixDatagram::unbound()?;
    match path.strip_prefix('@') {
        Some(name) => send_abstract(&socket, name, message),
        None => socket.send_to(message.as_bytes(), path).map(|_| ()),
    }
}

#[cfg(target_os = "linux")]
fn send_abstract(
    socket: &std::os::unix::net::UnixDatagram,
    name: &str,
    message: &str,
) -> io::Result<()> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::SocketAddr;

    let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
    socket.send_to_addr(message.as_bytes(), &addr).map(|_| ())
}

#[cfg(all(unix, not(target_os = "linux")))]
fn send_abstract(
    _socket: &std::os::unix::net::UnixDatagram,
    name: &str,
    _message: &str,
) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("abstract socket '@{}' is only supported on Linux", name),
    ))
}

#[cfg(not(unix))]
fn send_datagram(path: &str, _message: &str) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("notify socket '{}' requires Unix domain sockets", path),
    ))
}

/// Keeps every notification in memory.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    states: Mutex<Vec<NotifyState>>,
}

impl RecordingNotifier {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications received so far, oldest first.
    pub fn states(&self) -> Vec<NotifyState> {
        self.states
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// How many times `state` was reported.
    pub fn count(&self, state: NotifyState) -> usize {
        self.states().iter().filter(|s| **s == state).count()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, state: NotifyState) {
        let mut states = self
            .states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        states.push(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_follow_sd_notify() {
        assert_eq!(NotifyState::Ready.as_message(), "READY=1");
        assert_eq!(NotifyState::Watchdog.as_message(), "WATCHDOG=1");
        assert_eq!(NotifyState::Stopping.as_message(), "STOPPING=1");
    }

    #[test]
    fn disabled_notifier_is_silent() {
        let notifier = SystemdNotifier::disabled();
        assert!(!notifier.is_enabled());
        assert!(notifier.send("READY=1").is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn sends_datagram_to_socket() {
        use std::os::unix::net::UnixDatagram;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notify.sock");
        let listener = UnixDatagram::bind(&path).unwrap();

        let notifier = SystemdNotifier::with_socket(path.to_string_lossy().into_owned());
        notifier.notify(NotifyState::Ready);
        notifier.notify(NotifyState::Watchdog);

        let mut buf = [0u8; 64];
        let n = listener.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"READY=1");
        let n = listener.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"WATCHDOG=1");
    }

    #[test]
    fn missing_socket_is_reported_not_fatal() {
        let notifier = SystemdNotifier::with_socket("/nonexistent/box-logger/notify.sock");
        assert!(notifier.send("READY=1").is_err());
        notifier.notify(NotifyState::Watchdog);
    }

    #[test]
    fn recorder_counts_states() {
        let recorder = RecordingNotifier::new();
        recorder.notify(NotifyState::Ready);
        recorder.notify(NotifyState::Watchdog);
        recorder.notify(NotifyState::Watchdog);
        assert_eq!(recorder.count(NotifyState::Watchdog), 2);
        assert_eq!(
            recorder.states(),
            vec![NotifyState::Ready, NotifyState::Watchdog, NotifyState::Watchdog]
        );
    }
}
