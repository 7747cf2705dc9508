//! Per-call state owned by the engine

use crate::peer::ice::CandidateTally;
use crate::peer::media::RemoteTrack;
use crate::peer::negotiator::NegotiatorHandle;
use crate::peer::transport::TransportHandle;
use crate::peer::types::IceCandidate;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// Call lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallState {
    #[default]
    Idle,
    Offering,
    Answering,
    Active,
    Closing,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Remote candidates waiting for the remote description
#[derive(Debug, Default)]
pub struct CandidateQueue {
    pending: VecDeque<IceCandidate>,
}

impl CandidateQueue {
    pub fn push(&mut self, candidate: IceCandidate) {
        self.pending.push_back(candidate);
    }

    /// Empties the queue, yielding candidates in arrival order.
    pub fn drain(&mut self) -> impl Iterator<Item = IceCandidate> + '_ {
        self.pending.drain(..)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// One active or pending call.
///
/// At most one exists per engine. The transport is owned exclusively here;
/// the candidate queue lives in the negotiation worker that `negotiator`
/// feeds, since only that worker knows when the remote description landed.
pub struct Session {
    pub id: String,
    pub generation: u64,
    pub state: CallState,
    pub remote: Option<String>,
    pub transport: Option<Arc<dyn TransportHandle>>,
    pub negotiator: Option<NegotiatorHandle>,
    pub remote_tracks: Vec<Arc<dyn RemoteTrack>>,
    pub offer_in_flight: bool,
    pub local_candidates: CandidateTally,
}

impl Session {
    pub fn idle(generation: u64) -> Self {
        Self {
            id: crate::utils::random_id(),
            generation,
            state: CallState::Idle,
            remote: None,
            transport: None,
            negotiator: None,
            remote_tracks: Vec::new(),
            offer_in_flight: false,
            local_candidates: CandidateTally::default(),
        }
    }

    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    pub fn is_idle(&self) -> bool {
        self.state == CallState::Idle && self.transport.is_none()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("state", &self.state)
            .field("remote", &self.remote)
            .field("transport", &self.transport.is_some())
            .field("remote_tracks", &self.remote_tracks.len())
            .finish()
    }
}
