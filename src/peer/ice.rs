use crate::peer::types::IceCandidate;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(c: IceCandidate) -> Self {
        RTCIceCandidateInit {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
            username_fragment: c.username_fragment,
        }
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        IceCandidate {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

/// Converts a gathered candidate into its wire form.
pub fn local_candidate(cand: &RTCIceCandidate) -> Option<IceCandidate> {
    match cand.to_json() {
        Ok(init) => Some(init.into()),
        Err(e) => {
            tracing::warn!("failed to serialize local candidate: {e}");
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateKind {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
    Unknown,
}

/// Reads the `typ` attribute of a candidate line.
pub fn candidate_kind(candidate: &IceCandidate) -> CandidateKind {
    let mut parts = candidate.candidate.split_whitespace();
    while let Some(part) = parts.next() {
        if part == "typ" {
            return match parts.next() {
                Some("host") => CandidateKind::Host,
                Some("srflx") => CandidateKind::ServerReflexive,
                Some("prflx") => CandidateKind::PeerReflexive,
                Some("relay") => CandidateKind::Relay,
                _ => CandidateKind::Unknown,
            };
        }
    }
    CandidateKind::Unknown
}

/// Per-session tally of gathered local candidates
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateTally {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
    pub other: usize,
}

impl CandidateTally {
    pub fn record(&mut self, candidate: &IceCandidate) {
        match candidate_kind(candidate) {
            CandidateKind::Host => self.host += 1,
            CandidateKind::ServerReflexive => self.srflx += 1,
            CandidateKind::Relay => self.relay += 1,
            CandidateKind::PeerReflexive | CandidateKind::Unknown => self.other += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.host + self.srflx + self.relay + self.other
    }

    pub fn log_summary(&self) {
        if self.total() == 0 {
            return;
        }
        tracing::debug!(
            host = self.host,
            srflx = self.srflx,
            relay = self.relay,
            "local candidate summary"
        );
        if self.relay == 0 {
            tracing::warn!("no TURN relay candidates were gathered; calls through NAT may fail");
        }
    }
}
