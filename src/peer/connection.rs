use crate::error::NegotiationError;
use crate::peer::ice::local_candidate;
use crate::peer::media::{LocalMedia, RtcRemoteTrack};
use crate::peer::state::{ConnectivityState, SignalingState};
use crate::peer::transport::{TransportEvent, TransportEventSink, TransportFactory, TransportHandle};
use crate::peer::types::{IceCandidate, SdpKind, ServerConfig, SessionDescription};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;
use webrtc::{
    api::APIBuilder,
    ice_transport::ice_server::RTCIceServer,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        RTCPeerConnection,
    },
};

/// Builds `RTCPeerConnection`-backed transports
#[derive(Debug, Clone)]
pub struct RtcTransportFactory {
    ice_servers: Vec<ServerConfig>,
}

impl RtcTransportFactory {
    pub fn new(ice_servers: Vec<ServerConfig>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        events: TransportEventSink,
    ) -> Result<Arc<dyn TransportHandle>, NegotiationError> {
        let pc = new_peer(&self.ice_servers, events).await?;
        Ok(Arc::new(RtcTransport { pc }))
    }
}

/// Transport handle over a single `RTCPeerConnection`
pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
}

/// Creates the peer connection and routes its callbacks into `events`.
pub async fn new_peer(
    ice_servers: &[ServerConfig],
    events: TransportEventSink,
) -> Result<Arc<RTCPeerConnection>, NegotiationError> {
    let creation = |e: webrtc::Error| NegotiationError::TransportCreation(e.to_string());

    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().map_err(creation)?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)
        .map_err(creation)?;
    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let pc = Arc::new(
        api.new_peer_connection(rtc_config(ice_servers))
            .await
            .map_err(creation)?,
    );
    let generation = events.generation();

    let sink = events.clone();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        let sink = sink.clone();
        Box::pin(async move {
            match cand {
                Some(c) => {
                    if let Some(candidate) = local_candidate(&c) {
                        sink.emit(TransportEvent::CandidateDiscovered(candidate));
                    }
                }
                // end of gathering
                None => tracing::debug!(generation, "ICE gathering complete"),
            }
        })
    }));

    let sink = events.clone();
    pc.on_ice_connection_state_change(Box::new(move |st: RTCIceConnectionState| {
        tracing::debug!(generation, "ICE connection state changed to {st}");
        sink.emit(TransportEvent::ConnectivityChanged(ConnectivityState::from(st)));
        Box::pin(async {})
    }));

    let sink = events.clone();
    pc.on_signaling_state_change(Box::new(move |st: RTCSignalingState| {
        tracing::debug!(generation, "signaling state changed to {st}");
        sink.emit(TransportEvent::SignalingStateChanged(SignalingState::from(st)));
        Box::pin(async {})
    }));

    let sink = events.clone();
    pc.on_negotiation_needed(Box::new(move || {
        sink.emit(TransportEvent::NegotiationNeeded);
        Box::pin(async {})
    }));

    let sink = events;
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            tracing::info!(generation, track = %track.id(), kind = %track.kind(), "remote track added");
            sink.emit(TransportEvent::RemoteTrackAdded(Arc::new(RtcRemoteTrack {
                track,
                receiver,
            })));
            Box::pin(async {})
        },
    ));

    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        tracing::debug!(generation, "peer connection state changed to {st}");
        Box::pin(async {})
    }));

    Ok(pc)
}

/// Creates the configuration for a peer connection
fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: get_user_ice_servers(servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

/// Maps configured servers onto `RTCIceServer`s
pub fn get_user_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, String> {
    let parsed = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpKind::Rollback => return Err("rollback is not supported".to_owned()),
    };
    parsed.map_err(|e| e.to_string())
}

fn from_rtc(desc: &RTCSessionDescription) -> SessionDescription {
    let kind = match desc.sdp_type {
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        _ => SdpKind::Offer,
    };
    SessionDescription {
        kind,
        sdp: desc.sdp.clone(),
    }
}

#[async_trait]
impl TransportHandle for RtcTransport {
    async fn attach_media(&self, media: &LocalMedia) -> Result<(), NegotiationError> {
        for track in &media.tracks {
            self.pc
                .add_track(Arc::clone(track))
                .await
                .map_err(|e| NegotiationError::AttachMedia(e.to_string()))?;
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.pc
            .create_offer(None)
            .await
            .map(|d| from_rtc(&d))
            .map_err(|e| NegotiationError::CreateDescription {
                kind: "offer",
                reason: e.to_string(),
            })
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        self.pc
            .create_answer(None)
            .await
            .map(|d| from_rtc(&d))
            .map_err(|e| NegotiationError::CreateDescription {
                kind: "answer",
                reason: e.to_string(),
            })
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let desc = to_rtc(desc).map_err(NegotiationError::SetLocalDescription)?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(|e| NegotiationError::SetLocalDescription(e.to_string()))
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let desc = to_rtc(desc).map_err(NegotiationError::SetRemoteDescription)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| NegotiationError::SetRemoteDescription(e.to_string()))
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.pc
            .add_ice_candidate(candidate.into())
            .await
            .map_err(|e| NegotiationError::AddCandidate(e.to_string()))
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.pc.close().await.map_err(|e| {
            tracing::debug!("closing peer connection: {e}");
            NegotiationError::Closed
        })
    }
}
