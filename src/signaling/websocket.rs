//! Signaling over a WebSocket carrying one JSON message per text frame

use crate::engine::EngineHandle;
use crate::error::SignalingError;
use crate::signaling::{SignalingChannel, SignalingMessage};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outbound side; cheap to clone
#[derive(Debug, Clone)]
pub struct WsSignaling {
    tx: mpsc::UnboundedSender<SignalingMessage>,
}

/// Inbound side, forwarded into the engine once it exists
pub struct WsInbound {
    stream: SplitStream<WsStream>,
}

impl WsSignaling {
    /// Opens the socket and starts the writer task.
    pub async fn connect(url: &str) -> Result<(WsSignaling, WsInbound), SignalingError> {
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| SignalingError::Connect(e.to_string()))?;
        tracing::info!(%url, "signaling connected");

        let (sink, stream) = ws.split();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(sink, rx));
        Ok((WsSignaling { tx }, WsInbound { stream }))
    }
}

impl SignalingChannel for WsSignaling {
    fn send(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        self.tx.send(message).map_err(|_| SignalingError::Closed)
    }
}

impl WsInbound {
    /// Decodes frames and delivers them to the engine until the socket closes.
    pub fn forward_to(self, engine: EngineHandle) -> JoinHandle<()> {
        let mut stream = self.stream;
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => match SignalingMessage::from_json(&text) {
                        Ok(msg) => {
                            tracing::debug!(kind = msg.kind(), "signaling message received");
                            if engine.deliver(msg).is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::error!("unknown message received: {e}: {text}"),
                    },
                    Ok(Message::Close(frame)) => {
                        tracing::info!(?frame, "signaling server closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("signaling read failed: {e}");
                        break;
                    }
                }
            }
            tracing::info!("signaling inbound stopped");
        })
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<SignalingMessage>,
) {
    while let Some(msg) = rx.recv().await {
        let text = match msg.to_json() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(kind = msg.kind(), "failed to encode signaling message: {e}");
                continue;
            }
        };
        tracing::debug!(kind = msg.kind(), target = ?msg.target(), "sending to server");
        if let Err(e) = sink.send(Message::Text(text)).await {
            tracing::warn!("signaling write failed: {e}");
            break;
        }
    }
    let _ = sink.close().await;
}
