use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::{
    error::{Error, SignalingErrorKind},
    signaling::{
        message::{ClientMessage, ServerMessage},
        SignalingSender,
    },
};

/// WebSocket client of a signaling relay. Outgoing messages are queued and written by a
/// background task; incoming messages are decoded onto the returned receiver.
#[derive(Debug, Clone)]
pub struct WebSocketSignaling {
    outgoing: mpsc::UnboundedSender<ClientMessage>,
}

impl WebSocketSignaling {
    pub async fn connect(
        url: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServerMessage>), Error> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (incoming, incoming_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                match serde_json::to_string(&message) {
                    Ok(json) => {
                        if let Err(err) = write.send(Message::Text(json)).await {
                            tracing::error!("signaling write failed: {}", err);
                            break;
                        }
                    }
                    Err(err) => tracing::error!("failed to encode signaling message: {}", err),
                }
            }
            let _ = write.close().await;
            tracing::debug!("signaling writer stopped");
        });

        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(message) => {
                            if incoming.send(message).is_err() {
                                break;
                            }
                        }
                        Err(err) => tracing::warn!("invalid signaling message: {}", err),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!("signaling read failed: {}", err);
                        break;
                    }
                }
            }
            tracing::debug!("signaling reader stopped");
        });

        tracing::debug!("WebSocketSignaling connected to {}", url);
        Ok((Self { outgoing }, incoming_rx))
    }
}

#[async_trait]
impl SignalingSender for WebSocketSignaling {
    async fn send(&self, message: ClientMessage) -> Result<(), Error> {
        self.outgoing.send(message).map_err(|_| {
            Error::new_signaling(
                "Signaling connection is closed".to_string(),
                SignalingErrorKind::ChannelClosed,
            )
        })
    }
}
