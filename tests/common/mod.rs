//! Shared test fixtures: an in-memory peer-connection capability and an
//! in-process relay harness for driving chat clients without sockets.

#![allow(dead_code)]

use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use peerchat::chat::{ChatClient, ClientUpdate};
use peerchat::network::{
    ChannelError, ConnectionId, DataChannel, NegotiationError, PeerConnection,
    PeerConnectionFactory, PeerConnectionState, Registry, RtcEvent, RtcEvents, SessionId,
    SignalingServer,
};
use peerchat::protocol::{Envelope, IceCandidate, SdpKind, SessionDescription};

/// Find an available port for testing
pub fn find_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to ephemeral port")
        .local_addr()
        .expect("Failed to get local address")
        .port()
}

/// Start a relay in the background on `port`
pub async fn start_test_server(port: u16) -> tokio::task::JoinHandle<()> {
    let addr = format!("127.0.0.1:{}", port);
    let server = SignalingServer::new();

    tokio::spawn(async move {
        // Server runs until cancelled
        let _ = server.run(&addr).await;
    })
}

/// A call made on a [`FakeConnection`], in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateDataChannel(String),
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpKind),
    SetRemote(SdpKind),
    AddCandidate(String),
    Close,
}

/// Data channel that records what is sent and forwards it to a linked peer
pub struct FakeDataChannel {
    label: String,
    sent: Mutex<Vec<String>>,
    remote: Mutex<Option<RtcEvents>>,
    closed: AtomicBool,
}

impl FakeDataChannel {
    pub fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            sent: Mutex::new(Vec::new()),
            remote: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Deliver sent text and close notifications to `remote`
    pub fn link(&self, remote: RtcEvents) {
        *self.remote.lock() = Some(remote);
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataChannel for FakeDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send_text(&self, text: &str) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Transport("channel closed".to_string()));
        }
        self.sent.lock().push(text.to_string());
        if let Some(remote) = self.remote.lock().as_ref() {
            remote.emit(RtcEvent::ChannelMessage(text.to_string()));
        }
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(remote) = self.remote.lock().take() {
            remote.emit(RtcEvent::ChannelClosed);
        }
    }
}

/// Scripted peer connection
///
/// Every local description it sets produces one discovered candidate, the
/// way a real stack starts trickling after `setLocalDescription`.
pub struct FakeConnection {
    events: RtcEvents,
    fail_remote_description: bool,
    calls: Mutex<Vec<Call>>,
    channel: Mutex<Option<Arc<FakeDataChannel>>>,
    closed: AtomicBool,
}

impl FakeConnection {
    pub fn peer(&self) -> &str {
        self.events.peer()
    }

    pub fn session(&self) -> SessionId {
        self.events.session()
    }

    /// Event sink this connection reports on
    pub fn events(&self) -> RtcEvents {
        self.events.clone()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Candidate strings applied with `add_ice_candidate`, in order
    pub fn applied_candidates(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                Call::AddCandidate(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn emit(&self, event: RtcEvent) {
        self.events.emit(event);
    }

    pub fn report_state(&self, state: PeerConnectionState) {
        self.emit(RtcEvent::ConnectionStateChanged(state));
    }

    /// Open the chat channel on this side
    ///
    /// The initiator's locally created channel reports open; a responder
    /// first receives the remote channel.
    pub fn open_channel(&self) -> Arc<FakeDataChannel> {
        let existing = self.channel.lock().clone();
        let channel = match existing {
            Some(channel) => channel,
            None => {
                let channel = FakeDataChannel::new("chat");
                *self.channel.lock() = Some(channel.clone());
                self.emit(RtcEvent::RemoteDataChannel(channel.clone()));
                channel
            }
        };
        self.emit(RtcEvent::ChannelOpen);
        channel
    }

    pub fn channel(&self) -> Option<Arc<FakeDataChannel>> {
        self.channel.lock().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl PeerConnection for FakeConnection {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.record(Call::CreateOffer);
        Ok(SessionDescription::offer(format!(
            "offer-{}-{}",
            self.peer(),
            self.session()
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        self.record(Call::CreateAnswer);
        Ok(SessionDescription::answer(format!(
            "answer-{}-{}",
            self.peer(),
            self.session()
        )))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.record(Call::SetLocal(description.kind));
        self.emit(RtcEvent::CandidateDiscovered(IceCandidate {
            candidate: format!("candidate:{}:{} 1 udp host", self.peer(), self.session()),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.record(Call::SetRemote(description.kind));
        if self.fail_remote_description {
            return Err(NegotiationError::InvalidDescription(
                "rejected by test".to_string(),
            ));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.record(Call::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, NegotiationError> {
        self.record(Call::CreateDataChannel(label.to_string()));
        let channel = FakeDataChannel::new(label);
        *self.channel.lock() = Some(channel.clone());
        Ok(channel)
    }

    async fn close(&self) {
        self.record(Call::Close);
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FactoryState {
    connections: Vec<Arc<FakeConnection>>,
    fail_remote_description: bool,
}

/// Factory handing out [`FakeConnection`]s and remembering each one
#[derive(Clone, Default)]
pub struct FakeFactory {
    state: Arc<Mutex<FactoryState>>,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make connections created from now on reject remote descriptions
    pub fn fail_remote_description(&self, fail: bool) {
        self.state.lock().fail_remote_description = fail;
    }

    /// Every connection created for `peer`, oldest first
    pub fn connections(&self, peer: &str) -> Vec<Arc<FakeConnection>> {
        self.state
            .lock()
            .connections
            .iter()
            .filter(|c| c.peer() == peer)
            .cloned()
            .collect()
    }

    /// Most recent connection for `peer`
    pub fn latest(&self, peer: &str) -> Arc<FakeConnection> {
        self.connections(peer)
            .pop()
            .unwrap_or_else(|| panic!("no connection created for {}", peer))
    }

    pub fn created(&self) -> usize {
        self.state.lock().connections.len()
    }
}

#[async_trait]
impl PeerConnectionFactory for FakeFactory {
    async fn create(&self, events: RtcEvents) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        let mut state = self.state.lock();
        let connection = Arc::new(FakeConnection {
            events,
            fail_remote_description: state.fail_remote_description,
            calls: Mutex::new(Vec::new()),
            channel: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        state.connections.push(connection.clone());
        Ok(connection)
    }
}

/// Open both ends of a negotiated pair and link their channels
pub fn link_channels(a: &FakeConnection, b: &FakeConnection) {
    let a_channel = a.open_channel();
    let b_channel = b.open_channel();
    a_channel.link(b.events());
    b_channel.link(a.events());
}

/// A chat client attached to an in-process [`Registry`]
pub struct TestPeer {
    pub client: ChatClient,
    pub factory: FakeFactory,
    pub conn: ConnectionId,
    outbound: mpsc::UnboundedReceiver<Envelope>,
    frames: mpsc::UnboundedReceiver<String>,
    updates: mpsc::UnboundedReceiver<ClientUpdate>,
}

impl TestPeer {
    pub fn join(registry: &Registry) -> Self {
        let factory = FakeFactory::new();
        let (outbound_tx, outbound) = mpsc::unbounded_channel();
        let (updates_tx, updates) = mpsc::unbounded_channel();
        let client =
            ChatClient::new(Arc::new(factory.clone()), outbound_tx).with_updates(updates_tx);

        let conn = Uuid::new_v4();
        let (frames_tx, frames) = mpsc::unbounded_channel();
        registry.attach(conn, frames_tx);

        Self {
            client,
            factory,
            conn,
            outbound,
            frames,
            updates,
        }
    }

    /// Updates published by the client since the last call
    pub fn take_updates(&mut self) -> Vec<ClientUpdate> {
        let mut taken = Vec::new();
        while let Ok(update) = self.updates.try_recv() {
            taken.push(update);
        }
        taken
    }

    /// Envelopes queued by the client that have not reached the relay yet
    pub fn take_outbound(&mut self) -> Vec<Envelope> {
        let mut taken = Vec::new();
        while let Ok(envelope) = self.outbound.try_recv() {
            taken.push(envelope);
        }
        taken
    }
}

/// Move traffic between clients and the relay until every queue is empty
pub async fn settle(registry: &Registry, peers: &mut [&mut TestPeer]) {
    loop {
        let mut progressed = false;

        for peer in peers.iter_mut() {
            while let Ok(envelope) = peer.outbound.try_recv() {
                let frame = envelope.encode().expect("encode envelope");
                registry.handle_frame(peer.conn, &frame);
                progressed = true;
            }
        }

        for peer in peers.iter_mut() {
            while let Ok(frame) = peer.frames.try_recv() {
                let envelope = Envelope::decode(&frame).expect("relay sent a valid envelope");
                peer.client.handle_envelope(envelope).await;
                progressed = true;
            }
            if peer.client.process_rtc_events().await > 0 {
                progressed = true;
            }
        }

        if !progressed {
            break;
        }
    }
}
