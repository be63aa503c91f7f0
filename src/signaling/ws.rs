//! WebSocket Signaling Transport
//!
//! Ready-made [`SignalingTransport`] over a WebSocket connection:
//! - Outbound messages are serialized and drained by a writer task
//! - Inbound frames are decoded and forwarded on an mpsc channel the
//!   application pumps into its call session(s)
//! - Connection loss closes the inbound channel and flips the connected flag

use super::messages::SignalingMessage;
use super::transport::{SignalingError, SignalingTransport};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

const CHANNEL_CAPACITY: usize = 100;

/// WebSocket-backed signaling transport.
pub struct WsSignaling {
    server_url: String,
    tx: mpsc::Sender<String>,
    connected: Arc<RwLock<bool>>,
}

impl WsSignaling {
    /// Connects to a signaling endpoint and spawns the reader/writer tasks.
    ///
    /// Returns the transport plus the inbound message stream. The receiver
    /// yields messages in arrival order; it closes when the socket does.
    pub async fn connect(
        server_url: &str,
    ) -> Result<(Self, mpsc::Receiver<SignalingMessage>), SignalingError> {
        let ws_url = Url::parse(server_url)
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        tracing::info!("Connecting to signaling endpoint: {}", ws_url);

        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let (tx, mut outbound_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel::<SignalingMessage>(CHANNEL_CAPACITY);

        let connected = Arc::new(RwLock::new(true));

        // Reader task: decode frames, forward to the session side
        let connected_clone = Arc::clone(&connected);
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<SignalingMessage>(&text) {
                            Ok(msg) => {
                                if inbound_tx.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::warn!("Dropping undecodable signaling frame: {}", e);
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            *connected_clone.write() = false;
        });

        // Writer task: drain the outbound queue
        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
        });

        Ok((
            Self {
                server_url: server_url.to_string(),
                tx,
                connected,
            },
            inbound_rx,
        ))
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.read()
    }
}

#[async_trait::async_trait]
impl SignalingTransport for WsSignaling {
    async fn send(&self, msg: SignalingMessage) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }

        let text =
            serde_json::to_string(&msg).map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        self.tx
            .send(text)
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }
}

impl std::fmt::Debug for WsSignaling {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsSignaling")
            .field("server_url", &self.server_url)
            .field("connected", &self.is_connected())
            .finish()
    }
}
