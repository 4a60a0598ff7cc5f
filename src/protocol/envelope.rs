//! Signaling envelope definitions for the peerchat protocol
//!
//! Every frame on the relay transport is one JSON text object:
//!
//! ```text
//! { "type": "register" | "offer" | "answer" | "candidate" | "user-list" | "error",
//!   "from": <user-id>,   // omitted for user-list broadcasts and relay errors
//!   "to":   <user-id>,   // present on addressed envelopes
//!   "data": <SDP | ICE candidate | [user-id] | error code> }
//! ```
//!
//! Envelopes carry no sequence number; ordering relies on the transport.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Identifier chosen by a user at registration
pub type UserId = String;

/// Errors raised while decoding or encoding an envelope
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown envelope type: {0}")]
    UnknownType(String),

    #[error("{kind} envelope is missing data")]
    MissingData { kind: &'static str },

    #[error("{kind} envelope has invalid data: {source}")]
    InvalidData {
        kind: &'static str,
        source: serde_json::Error,
    },
}

/// Kind of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// SDP payload in the browser's `RTCSessionDescriptionInit` shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser's `RTCIceCandidateInit` shape
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            ..Default::default()
        }
    }
}

/// Error codes carried by `error` envelopes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The addressed user is not registered with the relay
    TargetUnavailable,
    /// The requested name is held by another connection
    NameTaken,
    /// Code not known to this implementation
    Other(String),
}

impl ErrorCode {
    /// Wire value for `TargetUnavailable`, as browser clients expect it
    pub const TARGET_UNAVAILABLE: &'static str = "UAE";

    pub fn as_str(&self) -> &str {
        match self {
            Self::TargetUnavailable => Self::TARGET_UNAVAILABLE,
            Self::NameTaken => "name-taken",
            Self::Other(code) => code,
        }
    }

    pub fn parse(code: &str) -> Self {
        match code {
            Self::TARGET_UNAVAILABLE => Self::TargetUnavailable,
            "name-taken" => Self::NameTaken,
            other => Self::Other(other.to_string()),
        }
    }

    /// Whether a client receiving this code must drop its registration
    pub fn revokes_registration(&self) -> bool {
        matches!(self, Self::TargetUnavailable | Self::NameTaken)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed envelope payload, selected by the `type` field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Register,
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
    UserList(Vec<UserId>),
    Error(ErrorCode),
}

impl Body {
    /// Wire value of the `type` field
    pub fn kind(&self) -> &'static str {
        match self {
            Body::Register => "register",
            Body::Offer(_) => "offer",
            Body::Answer(_) => "answer",
            Body::Candidate(_) => "candidate",
            Body::UserList(_) => "user-list",
            Body::Error(_) => "error",
        }
    }
}

/// A signaling envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireEnvelope", into = "WireEnvelope")]
pub struct Envelope {
    pub from: Option<UserId>,
    pub to: Option<UserId>,
    pub body: Body,
}

impl Envelope {
    pub fn register(name: impl Into<UserId>) -> Self {
        Self {
            from: Some(name.into()),
            to: None,
            body: Body::Register,
        }
    }

    pub fn offer(from: impl Into<UserId>, to: impl Into<UserId>, sdp: SessionDescription) -> Self {
        Self::addressed(from, to, Body::Offer(sdp))
    }

    pub fn answer(from: impl Into<UserId>, to: impl Into<UserId>, sdp: SessionDescription) -> Self {
        Self::addressed(from, to, Body::Answer(sdp))
    }

    pub fn candidate(from: impl Into<UserId>, to: impl Into<UserId>, candidate: IceCandidate) -> Self {
        Self::addressed(from, to, Body::Candidate(candidate))
    }

    pub fn user_list(users: Vec<UserId>) -> Self {
        Self {
            from: None,
            to: None,
            body: Body::UserList(users),
        }
    }

    /// Relay-originated error, addressed to `to` when the sender is known
    pub fn error(to: Option<UserId>, code: ErrorCode) -> Self {
        Self {
            from: None,
            to,
            body: Body::Error(code),
        }
    }

    fn addressed(from: impl Into<UserId>, to: impl Into<UserId>, body: Body) -> Self {
        Self {
            from: Some(from.into()),
            to: Some(to.into()),
            body,
        }
    }

    /// Wire value of the `type` field
    pub fn kind(&self) -> &'static str {
        self.body.kind()
    }

    /// Parse one text frame
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let wire: WireEnvelope = serde_json::from_str(text)?;
        Envelope::try_from(wire)
    }

    /// Serialize to one text frame
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Untyped frame layout, before `data` is interpreted
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    from: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    to: Option<UserId>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    data: Value,
}

fn typed_data<T>(kind: &'static str, data: Value) -> Result<T, ProtocolError>
where
    T: serde::de::DeserializeOwned,
{
    if data.is_null() {
        return Err(ProtocolError::MissingData { kind });
    }
    serde_json::from_value(data).map_err(|source| ProtocolError::InvalidData { kind, source })
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = ProtocolError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        let body = match wire.kind.as_str() {
            "register" => Body::Register,
            "offer" => Body::Offer(typed_data("offer", wire.data)?),
            "answer" => Body::Answer(typed_data("answer", wire.data)?),
            "candidate" => Body::Candidate(typed_data("candidate", wire.data)?),
            // An empty registry marshals as null
            "user-list" if wire.data.is_null() => Body::UserList(Vec::new()),
            "user-list" => Body::UserList(typed_data("user-list", wire.data)?),
            "error" => {
                let code: String = typed_data("error", wire.data)?;
                Body::Error(ErrorCode::parse(&code))
            }
            other => return Err(ProtocolError::UnknownType(other.to_string())),
        };

        Ok(Envelope {
            from: wire.from,
            to: wire.to,
            body,
        })
    }
}

impl From<Envelope> for WireEnvelope {
    fn from(envelope: Envelope) -> Self {
        let kind = envelope.kind().to_string();
        // Serializing these plain structs cannot fail
        let data = match envelope.body {
            Body::Register => Value::Null,
            Body::Offer(sdp) | Body::Answer(sdp) => {
                serde_json::to_value(sdp).unwrap_or(Value::Null)
            }
            Body::Candidate(candidate) => serde_json::to_value(candidate).unwrap_or(Value::Null),
            Body::UserList(users) => Value::from(users),
            Body::Error(code) => Value::from(code.as_str()),
        };

        WireEnvelope {
            kind,
            from: envelope.from,
            to: envelope.to,
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_candidate() -> IceCandidate {
        IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 192.168.1.2 54321 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: Some("abcd".to_string()),
        }
    }

    #[test]
    fn test_roundtrip_every_envelope_type() {
        let envelopes = vec![
            Envelope::register("alice"),
            Envelope::offer("alice", "bob", SessionDescription::offer("v=0 offer")),
            Envelope::answer("bob", "alice", SessionDescription::answer("v=0 answer")),
            Envelope::candidate("alice", "bob", sample_candidate()),
            Envelope::candidate("alice", "bob", IceCandidate::new("")),
            Envelope::user_list(vec!["alice".to_string(), "bob".to_string()]),
            Envelope::user_list(Vec::new()),
            Envelope::error(Some("alice".to_string()), ErrorCode::TargetUnavailable),
            Envelope::error(None, ErrorCode::NameTaken),
            Envelope::error(None, ErrorCode::Other("slow-down".to_string())),
        ];

        for envelope in envelopes {
            let text = envelope.encode().expect("encode");
            let decoded = Envelope::decode(&text).expect("decode");
            assert_eq!(decoded, envelope, "round-trip mismatch for {}", text);
        }
    }

    #[test]
    fn test_offer_wire_shape() {
        let envelope = Envelope::offer("alice", "bob", SessionDescription::offer("SDP1"));
        let value: Value = serde_json::from_str(&envelope.encode().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({
                "type": "offer",
                "from": "alice",
                "to": "bob",
                "data": { "type": "offer", "sdp": "SDP1" }
            })
        );
    }

    #[test]
    fn test_error_wire_shape_omits_from() {
        let envelope = Envelope::error(Some("alice".to_string()), ErrorCode::TargetUnavailable);
        let value: Value = serde_json::from_str(&envelope.encode().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({ "type": "error", "to": "alice", "data": "UAE" })
        );
    }

    #[test]
    fn test_register_has_no_data() {
        let value: Value =
            serde_json::from_str(&Envelope::register("alice").encode().unwrap()).unwrap();
        assert_eq!(value, json!({ "type": "register", "from": "alice" }));
    }

    #[test]
    fn test_candidate_uses_browser_field_names() {
        let text = r#"{"type":"candidate","from":"bob","to":"alice",
            "data":{"candidate":"candidate:1 1 udp 1 10.0.0.1 9 typ host",
                    "sdpMid":"0","sdpMLineIndex":0,"usernameFragment":null}}"#;

        let envelope = Envelope::decode(text).unwrap();
        match envelope.body {
            Body::Candidate(candidate) => {
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
                assert!(candidate.username_fragment.is_none());
            }
            other => panic!("Expected candidate, got {:?}", other),
        }
    }

    #[test]
    fn test_raw_frames_reencode_unchanged() {
        let frames = [
            r#"{"type":"error","to":"alice","data":"UAE"}"#,
            r#"{"type":"error","to":"alice","data":"name-taken"}"#,
            r#"{"type":"error","data":"target-unavailable"}"#,
            r#"{"type":"register","from":"alice"}"#,
            r#"{"type":"user-list","data":["alice","bob"]}"#,
            r#"{"type":"offer","from":"alice","to":"bob","data":{"type":"offer","sdp":"v=0"}}"#,
        ];

        for frame in frames {
            let reencoded = Envelope::decode(frame).unwrap().encode().unwrap();
            let expected: Value = serde_json::from_str(frame).unwrap();
            let actual: Value = serde_json::from_str(&reencoded).unwrap();
            assert_eq!(actual, expected, "re-encoding changed {}", frame);
        }
    }

    #[test]
    fn test_target_unavailable_code() {
        let envelope = Envelope::decode(r#"{"type":"error","data":"UAE"}"#).unwrap();
        assert_eq!(envelope.body, Body::Error(ErrorCode::TargetUnavailable));
        assert_eq!(ErrorCode::TargetUnavailable.as_str(), "UAE");
        assert!(ErrorCode::TargetUnavailable.revokes_registration());
        assert!(!ErrorCode::Other("x".to_string()).revokes_registration());
    }

    #[test]
    fn test_null_user_list_is_empty() {
        let envelope = Envelope::decode(r#"{"type":"user-list","data":null}"#).unwrap();
        assert_eq!(envelope.body, Body::UserList(Vec::new()));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = Envelope::decode(r#"{"type":"hello","from":"alice"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownType(kind) if kind == "hello"));
    }

    #[test]
    fn test_missing_and_invalid_data_rejected() {
        let err = Envelope::decode(r#"{"type":"offer","from":"a","to":"b"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingData { kind: "offer" }));

        let err = Envelope::decode(r#"{"type":"answer","from":"a","to":"b","data":42}"#)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidData { kind: "answer", .. }));
    }

    #[test]
    fn test_garbage_is_protocol_error() {
        assert!(matches!(
            Envelope::decode("not json at all"),
            Err(ProtocolError::Json(_))
        ));
        assert!(matches!(
            Envelope::decode(r#"{"from":"alice"}"#),
            Err(ProtocolError::Json(_))
        ));
    }
}
