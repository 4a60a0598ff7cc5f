//! Peer-connection capability backed by the `webrtc` crate

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::error::{ChannelError, NegotiationError};
use super::rtc::{
    DataChannel, PeerConnection, PeerConnectionFactory, PeerConnectionState, RtcEvent, RtcEvents,
};
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};

fn to_negotiation_error(err: webrtc::Error) -> NegotiationError {
    NegotiationError::PeerConnection(err.to_string())
}

/// Creates `webrtc` peer connections using the configured ICE servers
pub struct WebRtcFactory {
    api: API,
    ice_servers: Vec<String>,
}

impl WebRtcFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self {
            api: APIBuilder::new().build(),
            ice_servers,
        }
    }

    fn configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };

        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcFactory {
    async fn create(&self, events: RtcEvents) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.configuration())
                .await
                .map_err(to_negotiation_error)?,
        );

        {
            let events = events.clone();
            pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => events.emit(RtcEvent::CandidateDiscovered(from_init(init))),
                        Err(e) => warn!("Failed to serialize local candidate: {}", e),
                    }
                }
                Box::pin(async {})
            }));
        }

        {
            let events = events.clone();
            pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                debug!("Peer connection to {} is {}", events.peer(), state);
                if let Some(state) = map_state(state) {
                    events.emit(RtcEvent::ConnectionStateChanged(state));
                }
                Box::pin(async {})
            }));
        }

        {
            let events = events.clone();
            pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                info!(
                    "Remote data channel '{}' from {}",
                    channel.label(),
                    events.peer()
                );
                wire_channel(&channel, &events);
                events.emit(RtcEvent::RemoteDataChannel(Arc::new(WebRtcDataChannel {
                    inner: channel,
                })));
                Box::pin(async {})
            }));
        }

        Ok(Arc::new(WebRtcPeerConnection { inner: pc, events }))
    }
}

struct WebRtcPeerConnection {
    inner: Arc<RTCPeerConnection>,
    events: RtcEvents,
}

#[async_trait]
impl PeerConnection for WebRtcPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let offer = self
            .inner
            .create_offer(None)
            .await
            .map_err(to_negotiation_error)?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self
            .inner
            .create_answer(None)
            .await
            .map_err(to_negotiation_error)?;
        from_rtc_description(answer)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.inner
            .set_local_description(to_rtc_description(description)?)
            .await
            .map_err(to_negotiation_error)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.inner
            .set_remote_description(to_rtc_description(description)?)
            .await
            .map_err(to_negotiation_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.inner
            .add_ice_candidate(init)
            .await
            .map_err(|e| NegotiationError::InvalidCandidate(e.to_string()))
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, NegotiationError> {
        let channel = self
            .inner
            .create_data_channel(label, None)
            .await
            .map_err(to_negotiation_error)?;
        wire_channel(&channel, &self.events);
        Ok(Arc::new(WebRtcDataChannel { inner: channel }))
    }

    async fn close(&self) {
        if let Err(e) = self.inner.close().await {
            debug!("Error closing peer connection: {}", e);
        }
    }
}

struct WebRtcDataChannel {
    inner: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for WebRtcDataChannel {
    fn label(&self) -> &str {
        self.inner.label()
    }

    async fn send_text(&self, text: &str) -> Result<(), ChannelError> {
        self.inner
            .send_text(text.to_string())
            .await
            .map(|_| ())
            .map_err(|e| ChannelError::Transport(e.to_string()))
    }

    async fn close(&self) {
        if let Err(e) = self.inner.close().await {
            debug!("Error closing data channel: {}", e);
        }
    }
}

/// Route a channel's callbacks onto the connection's event sink
fn wire_channel(channel: &Arc<RTCDataChannel>, events: &RtcEvents) {
    {
        let events = events.clone();
        channel.on_open(Box::new(move || {
            events.emit(RtcEvent::ChannelOpen);
            Box::pin(async {})
        }));
    }

    {
        let events = events.clone();
        channel.on_message(Box::new(move |msg: DataChannelMessage| {
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => events.emit(RtcEvent::ChannelMessage(text)),
                Err(_) => warn!("Discarding non-UTF-8 message from {}", events.peer()),
            }
            Box::pin(async {})
        }));
    }

    {
        let events = events.clone();
        channel.on_close(Box::new(move || {
            events.emit(RtcEvent::ChannelClosed);
            Box::pin(async {})
        }));
    }
}

fn map_state(state: RTCPeerConnectionState) -> Option<PeerConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(PeerConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(PeerConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(PeerConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PeerConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(PeerConnectionState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn from_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_rtc_description(
    description: SessionDescription,
) -> Result<RTCSessionDescription, NegotiationError> {
    let result = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(description.sdp),
        SdpKind::Rollback => {
            return Err(NegotiationError::InvalidDescription(
                "rollback is not supported".to_string(),
            ))
        }
    };
    result.map_err(|e| NegotiationError::InvalidDescription(e.to_string()))
}

fn from_rtc_description(
    description: RTCSessionDescription,
) -> Result<SessionDescription, NegotiationError> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => {
            return Err(NegotiationError::InvalidDescription(
                "unspecified description type".to_string(),
            ))
        }
    };

    Ok(SessionDescription {
        kind,
        sdp: description.sdp,
    })
}
