//! Local and remote media handles
//!
//! The engine never owns capture: [`LocalMedia`] is shared between the UI
//! preview and every session created while capture is active. Remote tracks
//! belong to the session that received them and are stopped on teardown.

use crate::error::CaptureError;
use crate::utils::random_id;
use async_trait::async_trait;
use std::sync::Arc;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Result of a successful capture
pub struct LocalMedia {
    pub stream_id: String,
    pub tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
}

impl LocalMedia {
    pub fn new(stream_id: impl Into<String>, tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>) -> Self {
        Self {
            stream_id: stream_id.into(),
            tracks,
        }
    }
}

impl std::fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMedia")
            .field("stream_id", &self.stream_id)
            .field("tracks", &self.tracks.len())
            .finish()
    }
}

/// Media capture collaborator
#[async_trait]
pub trait MediaCapture: Send + Sync {
    async fn open(&self) -> Result<Arc<LocalMedia>, CaptureError>;
}

/// Produces one opus audio and one VP8 video sample track.
///
/// Samples are written by whoever holds the tracks; this only creates them.
#[derive(Debug, Default, Clone)]
pub struct SampleTrackCapture {
    pub audio: bool,
    pub video: bool,
}

impl SampleTrackCapture {
    pub fn audio_video() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

#[async_trait]
impl MediaCapture for SampleTrackCapture {
    async fn open(&self) -> Result<Arc<LocalMedia>, CaptureError> {
        if !self.audio && !self.video {
            return Err(CaptureError::Device("no audio or video requested".into()));
        }

        let stream_id = format!("local-{}", random_id());
        let mut tracks: Vec<Arc<dyn TrackLocal + Send + Sync>> = Vec::new();
        if self.audio {
            tracks.push(Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    ..Default::default()
                },
                "audio".to_owned(),
                stream_id.clone(),
            )));
        }
        if self.video {
            tracks.push(Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    ..Default::default()
                },
                "video".to_owned(),
                stream_id.clone(),
            )));
        }
        tracing::info!(stream_id = %stream_id, tracks = tracks.len(), "local media captured");
        Ok(Arc::new(LocalMedia::new(stream_id, tracks)))
    }
}

/// A track delivered by the remote side
#[async_trait]
pub trait RemoteTrack: Send + Sync {
    fn id(&self) -> String;
    fn kind(&self) -> String;
    async fn stop(&self);
}

/// Remote track received on an `RTCPeerConnection`
pub struct RtcRemoteTrack {
    pub track: Arc<TrackRemote>,
    pub receiver: Arc<RTCRtpReceiver>,
}

#[async_trait]
impl RemoteTrack for RtcRemoteTrack {
    fn id(&self) -> String {
        self.track.id()
    }

    fn kind(&self) -> String {
        self.track.kind().to_string()
    }

    async fn stop(&self) {
        if let Err(e) = self.receiver.stop().await {
            tracing::debug!(track = %self.track.id(), "stopping remote track: {e}");
        }
    }
}
