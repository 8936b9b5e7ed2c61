//! JSON-over-WebSocket conversation channel.
//!
//! Each text frame carries one `type`-tagged JSON message (see
//! [`messages`](super::messages)). The connector sends a `setup` message
//! right after the handshake, then a single I/O task shuttles frames in
//! both directions until the socket closes or the handle is dropped.

use super::messages::{InboundEvent, OutboundMessage};
use super::{ChannelHandle, ConnectParams, ConversationConnector, InboundFrame};
use crate::error::{ConnectError, ProtocolError};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Keepalive ping interval.
const PING_INTERVAL: Duration = Duration::from_secs(20);

/// Connects to a WebSocket endpoint speaking the JSON envelope protocol.
#[derive(Clone)]
pub struct WebSocketConnector {
    url: String,
    api_key: Option<String>,
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>, api_key: Option<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            api_key,
            connect_timeout,
        }
    }

    pub fn from_config(config: &crate::config::SessionConfig) -> Self {
        Self::new(
            config.endpoint_url.clone(),
            config.api_key.clone(),
            config.connect_timeout(),
        )
    }
}

impl std::fmt::Debug for WebSocketConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnector")
            .field("url", &self.url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

#[async_trait]
impl ConversationConnector for WebSocketConnector {
    async fn connect(&self, params: ConnectParams) -> Result<ChannelHandle, ConnectError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectError::Handshake(format!("invalid endpoint: {e}")))?;
        if let Some(key) = &self.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|e| ConnectError::Handshake(format!("invalid api key header: {e}")))?;
            request.headers_mut().insert("Authorization", value);
        }

        let (ws_stream, _) =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| ConnectError::Timeout(self.connect_timeout))?
                .map_err(|e| ConnectError::Handshake(e.to_string()))?;

        let (mut write, read) = ws_stream.split();

        let setup = OutboundMessage::Setup {
            voice_profile: params.voice_profile.clone(),
            sample_rate_in: params.sample_rate_in,
            sample_rate_out: params.sample_rate_out,
        };
        let json = serde_json::to_string(&setup)
            .map_err(|e| ConnectError::Handshake(format!("encode setup: {e}")))?;
        write
            .send(Message::Text(json))
            .await
            .map_err(|e| ConnectError::Handshake(format!("send setup: {e}")))?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        info!(
            url = %self.url,
            voice_profile = %params.voice_profile,
            attempt = params.attempt,
            "conversation channel connected"
        );

        tokio::spawn(run_socket(
            write,
            read,
            outbound_rx,
            inbound_tx,
            shutdown.clone(),
        ));

        Ok(ChannelHandle::new(outbound_tx, inbound_rx, shutdown))
    }
}

async fn run_socket<W, R>(
    mut write: W,
    mut read: R,
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundMessage>,
    inbound_tx: mpsc::UnboundedSender<InboundFrame>,
    shutdown: CancellationToken,
) where
    W: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    R: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // Skip the first immediate tick.
    ping_interval.tick().await;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                debug!("conversation channel retired");
                break;
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if inbound_tx.send(InboundEvent::parse(&text)).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        let _ = inbound_tx.send(Err(ProtocolError::UnexpectedFrame("binary")));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!(?frame, "conversation channel closed by server");
                        break;
                    }
                    None => break,
                    Some(Err(e)) => {
                        warn!("conversation channel read error: {e}");
                        break;
                    }
                    Some(Ok(_)) => {} // Ping/Pong handled by tungstenite.
                }
            }
            Some(out) = outbound_rx.recv() => {
                match serde_json::to_string(&out) {
                    Ok(json) => {
                        if let Err(e) = write.send(Message::Text(json)).await {
                            warn!("conversation channel send error: {e}");
                            break;
                        }
                    }
                    Err(e) => warn!("failed to encode outbound message: {e}"),
                }
            }
            _ = ping_interval.tick() => {
                if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                    warn!("conversation channel ping error: {e}");
                    break;
                }
            }
        }
    }
    // Dropping `inbound_tx` tells the session the channel is gone.
}
