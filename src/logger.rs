use crate::config::DEFAULT_LOG_FILTER;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Installs the global tracing subscriber.
///
/// Precedence: explicit directive, then `RUST_LOG`, then the build default.
pub fn init(directive: Option<&str>, quiet: bool) {
    if quiet {
        return;
    }
    let filter = match directive {
        Some(d) => EnvFilter::new(d),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    LocalHangUp,
    RemoteHangUp,
    ConnectivityLost(String),
    SignalingClosed,
    Failed(String),
    Shutdown,
}

/// Engine → UI lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    CaptureReady,
    CaptureFailed(String),
    CallReady { target: String },
    SessionActive { remote: String },
    RemoteTrack { id: String, kind: String },
    CallFailed(String),
    SessionEnded(EndReason),
    RosterChanged(Vec<String>),
    IdentityChanged(String),
}

/// Sends notifications to whoever renders the UI
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl Notifier {
    pub fn channel() -> (Notifier, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Notifier { tx }, rx)
    }

    fn emit(&self, n: Notification) {
        tracing::debug!("emit {:?}", n);
        if self.tx.send(n).is_err() {
            tracing::trace!("no UI listening for notifications");
        }
    }

    pub fn emit_capture_ready(&self) {
        self.emit(Notification::CaptureReady);
    }

    pub fn emit_capture_failed(&self, reason: impl Into<String>) {
        self.emit(Notification::CaptureFailed(reason.into()));
    }

    pub fn emit_call_ready(&self, target: &str) {
        self.emit(Notification::CallReady {
            target: target.to_owned(),
        });
    }

    pub fn emit_session_active(&self, remote: &str) {
        self.emit(Notification::SessionActive {
            remote: remote.to_owned(),
        });
    }

    pub fn emit_remote_track(&self, id: String, kind: String) {
        self.emit(Notification::RemoteTrack { id, kind });
    }

    pub fn emit_call_failed(&self, reason: impl Into<String>) {
        self.emit(Notification::CallFailed(reason.into()));
    }

    pub fn emit_session_ended(&self, reason: EndReason) {
        self.emit(Notification::SessionEnded(reason));
    }

    pub fn emit_roster_changed(&self, users: &[String]) {
        self.emit(Notification::RosterChanged(users.to_vec()));
    }

    pub fn emit_identity_changed(&self, name: &str) {
        self.emit(Notification::IdentityChanged(name.to_owned()));
    }
}
