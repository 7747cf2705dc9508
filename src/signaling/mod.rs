//! Signaling channel: the relay used to trade descriptions and candidates

pub mod message;
pub mod websocket;

pub use message::SignalingMessage;

use crate::error::SignalingError;

/// Outbound half of the signaling relay. Fire-and-forget: no acknowledgment.
pub trait SignalingChannel: Send + Sync {
    fn send(&self, message: SignalingMessage) -> Result<(), SignalingError>;
}
