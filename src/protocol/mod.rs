//! Signaling protocol definitions
//!
//! Defines the JSON envelope exchanged between chat clients and the relay.

mod envelope;

pub use envelope::{
    Body, Envelope, ErrorCode, IceCandidate, ProtocolError, SdpKind, SessionDescription, UserId,
};
