pub mod connection;
pub mod ice;
pub mod media;
pub mod negotiator;
pub mod state;
pub mod transport;
pub mod types;

pub use connection::RtcTransportFactory;
pub use media::{LocalMedia, MediaCapture, RemoteTrack, SampleTrackCapture};
pub use transport::{TransportEvent, TransportEventSink, TransportFactory, TransportHandle};
pub use types::{IceCandidate, SdpKind, ServerConfig, SessionDescription};
