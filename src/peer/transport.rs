//! Transport Handle capability surface
//!
//! One handle represents one peer-to-peer connection attempt. Every
//! notification the handle raises goes through a [`TransportEventSink`]
//! stamped with the generation of the session that created it, so events
//! from a torn-down transport can be recognised and dropped.

use crate::engine::EngineEvent;
use crate::error::NegotiationError;
use crate::peer::media::{LocalMedia, RemoteTrack};
use crate::peer::state::{ConnectivityState, SignalingState};
use crate::peer::types::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Notifications raised by a transport
pub enum TransportEvent {
    CandidateDiscovered(IceCandidate),
    ConnectivityChanged(ConnectivityState),
    NegotiationNeeded,
    RemoteTrackAdded(Arc<dyn RemoteTrack>),
    SignalingStateChanged(SignalingState),
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEvent::CandidateDiscovered(c) => {
                f.debug_tuple("CandidateDiscovered").field(&c.candidate).finish()
            }
            TransportEvent::ConnectivityChanged(st) => {
                f.debug_tuple("ConnectivityChanged").field(st).finish()
            }
            TransportEvent::NegotiationNeeded => f.write_str("NegotiationNeeded"),
            TransportEvent::RemoteTrackAdded(t) => {
                f.debug_tuple("RemoteTrackAdded").field(&t.id()).finish()
            }
            TransportEvent::SignalingStateChanged(st) => {
                f.debug_tuple("SignalingStateChanged").field(st).finish()
            }
        }
    }
}

/// Feeds transport notifications into the engine queue
#[derive(Clone)]
pub struct TransportEventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl TransportEventSink {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, event: TransportEvent) {
        let generation = self.generation;
        if self
            .tx
            .send(EngineEvent::Transport { generation, event })
            .is_err()
        {
            tracing::debug!(generation, "engine gone, dropping transport event");
        }
    }
}

/// Local object representing one connection attempt
#[async_trait]
pub trait TransportHandle: Send + Sync {
    async fn attach_media(&self, media: &LocalMedia) -> Result<(), NegotiationError>;
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;
    async fn set_local_description(&self, desc: SessionDescription)
        -> Result<(), NegotiationError>;
    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError>;
    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;
    async fn close(&self) -> Result<(), NegotiationError>;
}

/// Creates transports wired to an event sink
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        events: TransportEventSink,
    ) -> Result<Arc<dyn TransportHandle>, NegotiationError>;
}
