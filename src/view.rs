//! Read-only projection of the engine for rendering
//!
//! Updated only from [`Notification`]s; it never talks to the engine.

use crate::logger::{EndReason, Notification};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallView {
    pub username: String,
    pub users: Vec<String>,
    pub capture_ready: bool,
    pub start_disabled: bool,
    pub call_disabled: bool,
    pub hang_up_disabled: bool,
    pub remote: Option<String>,
    pub remote_tracks: Vec<String>,
    pub last_error: Option<String>,
}

impl CallView {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            users: Vec::new(),
            capture_ready: false,
            start_disabled: false,
            call_disabled: true,
            hang_up_disabled: true,
            remote: None,
            remote_tracks: Vec::new(),
            last_error: None,
        }
    }

    pub fn apply(&mut self, n: &Notification) {
        match n {
            Notification::CaptureReady => {
                self.capture_ready = true;
                self.start_disabled = true;
                self.call_disabled = self.remote.is_some();
                self.last_error = None;
            }
            Notification::CaptureFailed(reason) => {
                self.start_disabled = false;
                self.last_error = Some(reason.clone());
            }
            Notification::CallReady { target } => self.in_call(target),
            Notification::SessionActive { remote } => self.in_call(remote),
            Notification::RemoteTrack { id, kind } => {
                self.remote_tracks.push(format!("{kind}:{id}"));
                self.hang_up_disabled = false;
            }
            Notification::CallFailed(reason) => self.last_error = Some(reason.clone()),
            Notification::SessionEnded(_) => {
                self.remote = None;
                self.remote_tracks.clear();
                self.hang_up_disabled = true;
                self.call_disabled = !self.capture_ready;
            }
            Notification::RosterChanged(users) => self.users = users.clone(),
            Notification::IdentityChanged(name) => self.username = name.clone(),
        }
    }

    fn in_call(&mut self, remote: &str) {
        self.remote = Some(remote.to_owned());
        self.call_disabled = true;
        self.hang_up_disabled = false;
    }

    /// Everyone on the roster except us.
    pub fn callable_users(&self) -> impl Iterator<Item = &str> {
        self.users
            .iter()
            .map(String::as_str)
            .filter(move |u| *u != self.username)
    }
}

/// One console line per notification.
pub fn describe(n: &Notification) -> String {
    match n {
        Notification::CaptureReady => "camera and microphone ready".into(),
        Notification::CaptureFailed(reason) => format!("could not start capture: {reason}"),
        Notification::CallReady { target } => format!("calling {target}..."),
        Notification::SessionActive { remote } => format!("in call with {remote}"),
        Notification::RemoteTrack { id, kind } => format!("receiving {kind} track {id}"),
        Notification::CallFailed(reason) => format!("call failed: {reason}"),
        Notification::SessionEnded(reason) => match reason {
            EndReason::LocalHangUp => "call ended".into(),
            EndReason::RemoteHangUp => "remote hung up".into(),
            EndReason::ConnectivityLost(state) => format!("connection lost ({state})"),
            EndReason::SignalingClosed => "call closed".into(),
            EndReason::Failed(_) => "call ended after a failure".into(),
            EndReason::Shutdown => "call ended, shutting down".into(),
        },
        Notification::RosterChanged(users) => format!("online: {}", users.join(", ")),
        Notification::IdentityChanged(name) => format!("you are now {name}"),
    }
}
