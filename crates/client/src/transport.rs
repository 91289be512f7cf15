//! Media transport abstraction.
//!
//! The session only needs a handful of operations from a peer connection:
//! produce an offer, accept an answer and candidates, write to the control
//! channel, and close. Everything else it learns from [`TransportEvent`]s.

use async_trait::async_trait;
use bytes::Bytes;
use droidlink_protocol::{IceCandidate, RtcConfiguration};
use tokio::sync::mpsc;

use crate::error::Result;

/// Peer connection state as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Events a transport pushes to the owning session.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    ConnectionState(PeerState),
    ChannelOpen,
    ChannelClosed,
    /// Text message on the control channel
    ChannelMessage(String),
    /// Remote media track arrived ("audio" or "video")
    Track(String),
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Create an offer, set it as the local description and return its SDP.
    async fn create_offer(&self) -> Result<String>;

    async fn apply_answer(&self, sdp: &str) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Binary write on the control channel.
    async fn send_control(&self, data: Bytes) -> Result<()>;

    /// Text write on the control channel.
    async fn send_text(&self, text: &str) -> Result<()>;

    /// True while the control channel is open.
    fn channel_open(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

/// Builds transports from the server-supplied peer configuration.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(
        &self,
        config: &RtcConfiguration,
        events: EventSender,
    ) -> Result<Box<dyn MediaTransport>>;
}
