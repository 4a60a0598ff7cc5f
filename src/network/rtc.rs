//! Peer-connection capability
//!
//! The connection manager drives negotiation through these traits and never
//! touches a concrete WebRTC stack. Callbacks raised by the primitive
//! (candidate discovered, connection state change, remote data channel,
//! channel open/message/close) are delivered as [`RtcEvent`]s on a queue
//! owned by the chat client, tagged with the peer and session they belong to.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::error::{ChannelError, NegotiationError};
use crate::protocol::{IceCandidate, SessionDescription, UserId};

/// Label used for the chat data channel
pub const CHAT_CHANNEL_LABEL: &str = "chat";

/// Identifies one peer connection instance; a renegotiated peer gets a new one
pub type SessionId = u64;

/// Aggregate state reported by the peer-connection primitive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    /// Whether the primitive has given up on this connection
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

/// Callback raised by a peer connection or one of its data channels
pub enum RtcEvent {
    CandidateDiscovered(IceCandidate),
    ConnectionStateChanged(PeerConnectionState),
    RemoteDataChannel(Arc<dyn DataChannel>),
    ChannelOpen,
    ChannelMessage(String),
    ChannelClosed,
}

impl fmt::Debug for RtcEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CandidateDiscovered(c) => f.debug_tuple("CandidateDiscovered").field(c).finish(),
            Self::ConnectionStateChanged(s) => {
                f.debug_tuple("ConnectionStateChanged").field(s).finish()
            }
            Self::RemoteDataChannel(ch) => f
                .debug_tuple("RemoteDataChannel")
                .field(&ch.label())
                .finish(),
            Self::ChannelOpen => f.write_str("ChannelOpen"),
            Self::ChannelMessage(text) => f.debug_tuple("ChannelMessage").field(text).finish(),
            Self::ChannelClosed => f.write_str("ChannelClosed"),
        }
    }
}

/// An [`RtcEvent`] tagged with its origin
#[derive(Debug)]
pub struct RtcNotice {
    pub peer: UserId,
    pub session: SessionId,
    pub event: RtcEvent,
}

/// Sink handed to the primitive for one peer connection
#[derive(Clone)]
pub struct RtcEvents {
    peer: UserId,
    session: SessionId,
    tx: mpsc::UnboundedSender<RtcNotice>,
}

impl RtcEvents {
    pub fn new(peer: UserId, session: SessionId, tx: mpsc::UnboundedSender<RtcNotice>) -> Self {
        Self { peer, session, tx }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Queue an event; dropped if the client loop has stopped
    pub fn emit(&self, event: RtcEvent) {
        let _ = self.tx.send(RtcNotice {
            peer: self.peer.clone(),
            session: self.session,
            event,
        });
    }
}

/// An ordered, reliable text channel on top of a peer connection
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    async fn send_text(&self, text: &str) -> Result<(), ChannelError>;

    async fn close(&self);
}

/// One negotiated connection to a remote peer
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    /// Create a local data channel; its open/message/close callbacks are
    /// delivered on the connection's event sink
    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, NegotiationError>;

    async fn close(&self);
}

/// Creates peer connections wired to an event sink
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(&self, events: RtcEvents) -> Result<Arc<dyn PeerConnection>, NegotiationError>;
}
