use crate::error::SignalingError;
use crate::peer::types::{IceCandidate, SessionDescription};
use serde::{Deserialize, Serialize};

/// Messages exchanged with the signaling server, discriminated by `type`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum SignalingMessage {
    /// Server assigned our numeric id
    #[serde(rename = "id")]
    IdAssigned { id: u64 },

    /// Server refused our name and picked another
    #[serde(rename = "rejectusername")]
    NameRejected { name: String },

    /// Current roster of connected users
    #[serde(rename = "userlist")]
    UserList {
        #[serde(default)]
        users: Vec<String>,
    },

    /// Claim a display name
    #[serde(rename = "username")]
    Username { name: String, date: i64, id: u64 },

    #[serde(rename = "video-offer")]
    VideoOffer {
        #[serde(default)]
        name: Option<String>,
        #[serde(default, alias = "targetUsername")]
        target: Option<String>,
        sdp: SessionDescription,
    },

    #[serde(rename = "video-answer")]
    VideoAnswer {
        #[serde(default)]
        name: Option<String>,
        #[serde(default, alias = "targetUsername")]
        target: Option<String>,
        sdp: SessionDescription,
    },

    #[serde(rename = "new-ice-candidate")]
    NewIceCandidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, alias = "targetUsername")]
        target: Option<String>,
        candidate: IceCandidate,
    },

    #[serde(rename = "hang-up")]
    HangUp {
        #[serde(default)]
        name: Option<String>,
        #[serde(default, alias = "targetUsername")]
        target: Option<String>,
    },
}

impl SignalingMessage {
    pub fn from_json(text: &str) -> Result<Self, SignalingError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String, SignalingError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Wire tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::IdAssigned { .. } => "id",
            SignalingMessage::NameRejected { .. } => "rejectusername",
            SignalingMessage::UserList { .. } => "userlist",
            SignalingMessage::Username { .. } => "username",
            SignalingMessage::VideoOffer { .. } => "video-offer",
            SignalingMessage::VideoAnswer { .. } => "video-answer",
            SignalingMessage::NewIceCandidate { .. } => "new-ice-candidate",
            SignalingMessage::HangUp { .. } => "hang-up",
        }
    }

    /// Recipient named in the message, if any.
    pub fn target(&self) -> Option<&str> {
        match self {
            SignalingMessage::VideoOffer { target, .. }
            | SignalingMessage::VideoAnswer { target, .. }
            | SignalingMessage::NewIceCandidate { target, .. }
            | SignalingMessage::HangUp { target, .. } => target.as_deref(),
            _ => None,
        }
    }
}
