use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::{SignalingTransport, TransportSession, WireMessage};
use crate::error::Result;

/// JSON-over-WebSocket room relay.
pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl SignalingTransport for WebSocketTransport {
    async fn connect(&self) -> Result<TransportSession> {
        let (ws_stream, _) = connect_async(self.url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        let (incoming_tx, incoming_rx) = mpsc::channel(100);
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<WireMessage>(100);

        // Outgoing: ends when the session's sender is dropped.
        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("failed to encode signaling message: {}", e);
                        continue;
                    }
                };
                if write.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            let _ = write.close().await;
        });

        // Incoming: ends on socket close, dropping `incoming_tx`.
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("signaling socket error: {}", e);
                        break;
                    }
                };
                match serde_json::from_str::<WireMessage>(&text) {
                    Ok(msg) => {
                        if incoming_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!("ignoring unrecognised signaling frame: {}", e),
                }
            }
        });

        Ok(TransportSession {
            outgoing: outgoing_tx,
            incoming: incoming_rx,
        })
    }
}
