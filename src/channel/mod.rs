//! The duplex conversation channel seam.
//!
//! A [`ConversationConnector`] opens a connection and hands back a
//! [`ChannelHandle`]: an outbound queue, an inbound queue of already
//! validated events, and a shutdown token for the transport's I/O tasks.
//! The handle is owned exclusively by the session lifecycle manager.

pub mod messages;
pub mod websocket;

use crate::error::{ConnectError, ProtocolError};
use async_trait::async_trait;
use messages::{InboundEvent, OutboundMessage};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use messages::{ToolCall, ToolOutcome};

/// An inbound item: a validated event or a boundary rejection.
pub type InboundFrame = Result<InboundEvent, ProtocolError>;

/// Parameters for one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub voice_profile: String,
    pub sample_rate_in: u32,
    pub sample_rate_out: u32,
    /// Zero-based attempt number within the current retry cycle.
    pub attempt: u32,
}

/// Opens connections to the remote conversational model.
#[async_trait]
pub trait ConversationConnector: Send + Sync {
    /// Perform the handshake and return a live channel.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError`] when the handshake fails.
    async fn connect(&self, params: ConnectParams) -> Result<ChannelHandle, ConnectError>;
}

/// One live connection.
///
/// Dropping the handle cancels the transport tasks, so a replaced
/// connection is always fully retired.
#[derive(Debug)]
pub struct ChannelHandle {
    id: String,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    inbound: mpsc::UnboundedReceiver<InboundFrame>,
    shutdown: CancellationToken,
}

impl ChannelHandle {
    pub fn new(
        outbound: mpsc::UnboundedSender<OutboundMessage>,
        inbound: mpsc::UnboundedReceiver<InboundFrame>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            outbound,
            inbound,
            shutdown,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue a message for the transport. Returns `false` if it is gone.
    pub fn send(&self, msg: OutboundMessage) -> bool {
        self.outbound.send(msg).is_ok()
    }

    /// Next inbound item, or `None` once the transport has closed.
    pub async fn recv(&mut self) -> Option<InboundFrame> {
        self.inbound.recv().await
    }

    /// Retire the connection.
    pub fn close(self) {
        self.shutdown.cancel();
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
