//! Network module for peer-to-peer chat
//!
//! Handles the signaling relay, the relay client, per-peer connection
//! negotiation, and data channel sessions.

mod channel;
mod connection;
mod error;
mod relay;
mod rtc;
mod signaling;
mod webrtc_peer;

pub use channel::{ChannelSession, ChannelState, Message, MessageLog};
pub use connection::{ChannelEvent, ConnectionManager, PeerSession, Role, SessionState};
pub use error::{ChannelError, NegotiationError, NetworkError, RoutingError};
pub use relay::{serve_websocket, ConnectionId, Registry, SignalingServer};
pub use rtc::{
    DataChannel, PeerConnection, PeerConnectionFactory, PeerConnectionState, RtcEvent, RtcEvents,
    RtcNotice, SessionId, CHAT_CHANNEL_LABEL,
};
pub use signaling::{SignalingClient, SignalingConnection, SignalingReceiver, SignalingSender};
pub use webrtc_peer::WebRtcFactory;
