//! peerchat - Peer-to-peer text chat over WebRTC data channels
//!
//! A WebSocket relay tracks who is online and forwards signaling envelopes;
//! each client negotiates one peer connection per remote user and exchanges
//! messages directly once the data channel opens.

pub mod chat;
pub mod network;
pub mod protocol;

pub use chat::{ChatClient, ChatHandle};
pub use network::{ConnectionManager, SignalingServer};
pub use protocol::Envelope;
