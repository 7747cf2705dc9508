//! Error types for the call client

use std::time::Duration;

/// Rejected UI commands
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    /// Local media has not been captured yet
    #[error("no local media: start capture before placing a call")]
    NoLocalMedia,

    /// A call is already being placed or is in progress
    #[error("busy: a call with {0} is already in progress")]
    Busy(String),

    /// Target identity is empty or is ourselves
    #[error("invalid call target: {0:?}")]
    InvalidTarget(String),

    /// Transport setup for the call failed
    #[error("call setup failed: {0}")]
    Setup(String),

    /// The engine event loop is gone
    #[error("engine stopped")]
    EngineStopped,
}

/// Failures while producing or applying session descriptions
#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    /// The transport could not be created
    #[error("transport creation failed: {0}")]
    TransportCreation(String),

    /// Local media could not be attached to the transport
    #[error("attaching local media failed: {0}")]
    AttachMedia(String),

    /// createOffer / createAnswer failed
    #[error("creating {kind} failed: {reason}")]
    CreateDescription { kind: &'static str, reason: String },

    /// setLocalDescription failed
    #[error("setting local description failed: {0}")]
    SetLocalDescription(String),

    /// setRemoteDescription failed
    #[error("setting remote description failed: {0}")]
    SetRemoteDescription(String),

    /// Candidate rejected by the transport
    #[error("adding candidate failed: {0}")]
    AddCandidate(String),

    /// The transport was closed underneath the step
    #[error("transport closed")]
    Closed,

    /// Step exceeded the configured negotiation timeout
    #[error("negotiation step timed out after {0:?}")]
    Timeout(Duration),
}

/// Local media acquisition failures
#[derive(Debug, Clone, thiserror::Error)]
pub enum CaptureError {
    /// The capture device refused access
    #[error("capture permission denied: {0}")]
    PermissionDenied(String),

    /// The capture device could not produce tracks
    #[error("capture device error: {0}")]
    Device(String),
}

/// Signaling channel failures
#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    /// Could not reach the signaling server
    #[error("signaling connect failed: {0}")]
    Connect(String),

    /// Inbound frame is not a known message
    #[error("malformed signaling message: {0}")]
    Decode(#[from] serde_json::Error),

    /// Outbound side has shut down
    #[error("signaling channel closed")]
    Closed,
}

/// Invalid runtime configuration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("ICE server URL cannot be empty")]
    EmptyIceUrl,

    #[error("TURN server {0} requires username and credential")]
    MissingTurnCredentials(String),

    #[error("invalid signaling URL {url}: {reason}")]
    SignalingUrl { url: String, reason: String },
}

/// Console input that could not be run
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command {0:?}, try `help`")]
    Unknown(String),

    #[error("`{command}` needs {argument}")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },

    #[error(transparent)]
    Call(#[from] CallError),
}
