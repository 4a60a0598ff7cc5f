//! Network error types

use thiserror::Error;

use crate::protocol::{ProtocolError, UserId};

/// Errors that can occur in the network subsystem
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Signaling error: {0}")]
    SignalingError(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("A session with {0} is already in progress")]
    SessionExists(UserId),

    #[error("Not registered with the relay")]
    NotRegistered,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Relay-side failure to deliver an addressed envelope
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("Target {0} is not registered")]
    TargetUnavailable(UserId),

    #[error("Envelope has no recipient")]
    MissingRecipient,
}

/// Failure while creating or applying a session description or candidate
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("Peer connection error: {0}")]
    PeerConnection(String),

    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),
}

/// Send attempted without an open data channel
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("No peer selected")]
    NoPeerSelected,

    #[error("Data channel to {0} is not open")]
    NotOpen(UserId),

    #[error("Data channel transport error: {0}")]
    Transport(String),
}
