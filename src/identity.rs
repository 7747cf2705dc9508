//! Local identity and roster tracking
//!
//! The server assigns the numeric id and may force a different name. A name
//! forced by the server is adopted silently; re-announcing it could bounce
//! between client and server forever.

use crate::signaling::SignalingMessage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub name: String,
    pub id: u64,
}

#[derive(Debug, Clone)]
pub struct IdentityTracker {
    local: LocalIdentity,
    roster: Vec<String>,
}

impl IdentityTracker {
    pub fn new(name: impl Into<String>, id: u64) -> Self {
        Self {
            local: LocalIdentity {
                name: name.into(),
                id,
            },
            roster: Vec::new(),
        }
    }

    pub fn local(&self) -> &LocalIdentity {
        &self.local
    }

    pub fn name(&self) -> &str {
        &self.local.name
    }

    pub fn roster(&self) -> &[String] {
        &self.roster
    }

    /// Name-claim message for the current identity.
    pub fn announcement(&self) -> SignalingMessage {
        SignalingMessage::Username {
            name: self.local.name.clone(),
            date: chrono::Utc::now().timestamp_millis(),
            id: self.local.id,
        }
    }

    /// Adopts a server-assigned id; the caller sends the returned claim.
    pub fn assign_id(&mut self, id: u64) -> SignalingMessage {
        tracing::info!(id, name = %self.local.name, "server assigned client id");
        self.local.id = id;
        self.announcement()
    }

    /// Adopts a server-forced name. Returns whether the name changed.
    pub fn reject_name(&mut self, forced: impl Into<String>) -> bool {
        let forced = forced.into();
        if forced == self.local.name {
            return false;
        }
        tracing::info!(
            requested = %self.local.name,
            assigned = %forced,
            "name in use, server renamed us"
        );
        self.local.name = forced;
        true
    }

    /// Local rename; always re-announced, the server may still reject it.
    pub fn rename(&mut self, name: impl Into<String>) -> SignalingMessage {
        self.local.name = name.into();
        self.announcement()
    }

    pub fn replace_roster(&mut self, users: Vec<String>) {
        self.roster = users;
    }
}
