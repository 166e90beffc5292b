//! Signaling relay channel
//!
//! One persistent WebSocket per local participant, scoped to a room by its
//! URL path. Inbound frames are decoded and posted to the orchestrator's
//! event queue; outbound envelopes go through a writer task so callers
//! never block on the socket.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::signaling::{ParticipantId, SignalEnvelope};
use crate::config::MeshConfig;
use crate::error::{MeshError, Result};
use crate::mesh::events::MeshEvent;

/// Relay connection lifecycle and traffic
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// Connection established
    Opened,
    /// Decoded inbound envelope
    Envelope(SignalEnvelope),
    /// Connection lost or closed by the relay
    Closed { reason: String },
}

/// Bidirectional envelope transport to the relay
#[async_trait]
pub trait SignalChannel: Send + Sync {
    /// Queue an envelope for delivery
    async fn send(&mut self, envelope: &SignalEnvelope) -> Result<()>;

    /// Close the connection; idempotent
    async fn close(&mut self) -> Result<()>;
}

/// Opens relay connections
#[async_trait]
pub trait SignalConnector: Send + Sync {
    async fn connect(
        &self,
        room_id: &str,
        participant: &ParticipantId,
        events: mpsc::UnboundedSender<MeshEvent>,
    ) -> Result<Box<dyn SignalChannel>>;
}

/// WebSocket relay channel
pub struct WsSignalChannel {
    outbound: Option<mpsc::UnboundedSender<Message>>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl WsSignalChannel {
    /// Connect to `url` and start pumping frames
    pub async fn connect(url: &str, events: mpsc::UnboundedSender<MeshEvent>) -> Result<Self> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| MeshError::RelayConnection(format!("Failed to connect {}: {}", url, e)))?;
        info!("Relay connection established: {}", url);
        let _ = events.send(MeshEvent::Relay(RelayEvent::Opened));

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = ws_tx.send(msg).await {
                    warn!("Relay write failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let reader = tokio::spawn(async move {
            let reason = loop {
                match ws_rx.next().await {
                    Some(Ok(Message::Text(text))) => match SignalEnvelope::from_json(&text) {
                        Ok(envelope) => {
                            debug!("Relay frame: {} from {}", envelope.kind(), envelope.sender);
                            let event = MeshEvent::Relay(RelayEvent::Envelope(envelope));
                            if events.send(event).is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!("Dropping undecodable relay frame: {}", e),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| format!("closed by relay: {}", f.reason))
                            .unwrap_or_else(|| "closed by relay".to_string());
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break format!("read error: {}", e),
                    None => break "connection dropped".to_string(),
                }
            };
            let _ = events.send(MeshEvent::Relay(RelayEvent::Closed { reason }));
        });

        Ok(Self {
            outbound: Some(out_tx),
            writer: Some(writer),
            reader: Some(reader),
        })
    }
}

#[async_trait]
impl SignalChannel for WsSignalChannel {
    async fn send(&mut self, envelope: &SignalEnvelope) -> Result<()> {
        let outbound = self
            .outbound
            .as_ref()
            .ok_or_else(|| MeshError::RelayConnection("relay channel is closed".to_string()))?;
        let text = envelope.to_json()?;
        outbound
            .send(Message::Text(text.into()))
            .map_err(|_| MeshError::RelayConnection("relay writer stopped".to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        // Stop the reader first so our own close does not surface as a relay loss
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(outbound) = self.outbound.take() {
            let _ = outbound.send(Message::Close(None));
        }
        if let Some(writer) = self.writer.take() {
            let _ = writer.await;
        }
        Ok(())
    }
}

impl Drop for WsSignalChannel {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Connects `WsSignalChannel`s to `{relay_url}/{room}/{participant}`
pub struct WsSignalConnector {
    config: MeshConfig,
}

impl WsSignalConnector {
    pub fn new(config: MeshConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SignalConnector for WsSignalConnector {
    async fn connect(
        &self,
        room_id: &str,
        participant: &ParticipantId,
        events: mpsc::UnboundedSender<MeshEvent>,
    ) -> Result<Box<dyn SignalChannel>> {
        let url = self.config.relay_endpoint(room_id, participant.as_str());
        let channel = WsSignalChannel::connect(&url, events).await?;
        Ok(Box::new(channel))
    }
}
