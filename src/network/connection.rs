//! Connection management for peer-to-peer chat sessions
//!
//! One [`PeerSession`] per remote user drives SDP offer/answer and ICE
//! candidate exchange until the chat data channel opens.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::{Envelope, IceCandidate, SdpKind, SessionDescription, UserId};

use super::channel::{ChannelSession, ChannelState};
use super::error::{ChannelError, NegotiationError, NetworkError};
use super::rtc::{
    PeerConnection, PeerConnectionFactory, PeerConnectionState, RtcEvent, RtcEvents, RtcNotice,
    SessionId, CHAT_CHANNEL_LABEL,
};

/// Maximum candidates held for a peer that has not sent its offer yet
const MAX_EARLY_CANDIDATES: usize = 64;

/// Negotiation state of a peer session
///
/// ```text
/// [*] --> Idle
/// Idle --> OfferSent: start_chat()
/// Idle --> OfferReceived: offer applied as remote description
/// OfferSent --> Connected: answer applied
/// OfferReceived --> Connected: answer sent
/// any --> Closed: channel closed, peer gone, negotiation failure
/// ```
///
/// `Connected` means both descriptions are applied; messages flow once the
/// data channel has also reported open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    OfferSent,
    OfferReceived,
    Connected,
    Closed,
}

impl SessionState {
    /// Whether the session still holds a usable peer connection
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Closed)
    }
}

/// Which side created the offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Negotiation state for one remote peer
pub struct PeerSession {
    peer: UserId,
    id: SessionId,
    role: Role,
    state: SessionState,
    transitions: Vec<SessionState>,
    connection: Arc<dyn PeerConnection>,
    channel: ChannelSession,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    seen_candidates: HashSet<IceCandidate>,
    /// Set while a competing offer from the peer is being ignored
    discard_remote_candidates: bool,
}

impl PeerSession {
    fn new(peer: UserId, id: SessionId, role: Role, connection: Arc<dyn PeerConnection>) -> Self {
        Self {
            channel: ChannelSession::new(peer.clone()),
            peer,
            id,
            role,
            state: SessionState::Idle,
            transitions: vec![SessionState::Idle],
            connection,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            seen_candidates: HashSet::new(),
            discard_remote_candidates: false,
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        debug!("Session {} with {}: {:?} -> {:?}", self.id, self.peer, self.state, state);
        self.state = state;
        self.transitions.push(state);
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Every state this session has been in, oldest first
    pub fn transitions(&self) -> &[SessionState] {
        &self.transitions
    }

    pub fn channel_state(&self) -> ChannelState {
        self.channel.state()
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    /// Candidates waiting for the remote description
    pub fn pending_candidates(&self) -> &[IceCandidate] {
        &self.pending_candidates
    }

    /// Both descriptions applied and the data channel open
    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Connected && self.channel.is_open()
    }
}

/// Change on a data channel that the chat client must act on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Opened(UserId),
    Message { peer: UserId, text: String },
    Closed(UserId),
}

/// Candidates from a peer that has not offered yet, in arrival order
#[derive(Default)]
struct EarlyCandidates {
    queue: Vec<IceCandidate>,
    seen: HashSet<IceCandidate>,
}

impl EarlyCandidates {
    fn push(&mut self, from: &str, candidate: IceCandidate) {
        if self.queue.len() >= MAX_EARLY_CANDIDATES {
            warn!("Too many candidates from {} before an offer, dropping", from);
        } else if self.seen.insert(candidate.clone()) {
            self.queue.push(candidate);
        }
    }
}

/// Owns every peer session of one chat client
pub struct ConnectionManager {
    local_id: UserId,
    factory: Arc<dyn PeerConnectionFactory>,
    outbound: mpsc::UnboundedSender<Envelope>,
    events: mpsc::UnboundedSender<RtcNotice>,
    sessions: HashMap<UserId, PeerSession>,
    early_candidates: HashMap<UserId, EarlyCandidates>,
    next_session: SessionId,
}

impl ConnectionManager {
    /// Create a manager that sends envelopes on `outbound` and has
    /// peer-connection callbacks queued on `events`
    pub fn new(
        factory: Arc<dyn PeerConnectionFactory>,
        outbound: mpsc::UnboundedSender<Envelope>,
        events: mpsc::UnboundedSender<RtcNotice>,
    ) -> Self {
        Self {
            local_id: UserId::new(),
            factory,
            outbound,
            events,
            sessions: HashMap::new(),
            early_candidates: HashMap::new(),
            next_session: 1,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn set_local_id(&mut self, id: impl Into<UserId>) {
        self.local_id = id.into();
    }

    pub fn session(&self, peer: &str) -> Option<&PeerSession> {
        self.sessions.get(peer)
    }

    pub fn state(&self, peer: &str) -> Option<SessionState> {
        self.sessions.get(peer).map(PeerSession::state)
    }

    /// Peers with a session that is not closed
    pub fn live_peers(&self) -> Vec<UserId> {
        let mut peers: Vec<UserId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.state.is_live())
            .map(|(peer, _)| peer.clone())
            .collect();
        peers.sort();
        peers
    }

    /// Begin a chat with `target` as the initiator
    ///
    /// A live session with `target` is rejected with
    /// [`NetworkError::SessionExists`]; a closed one is torn down and replaced.
    pub async fn start_chat(&mut self, target: &str) -> Result<(), NetworkError> {
        if let Some(existing) = self.sessions.get(target) {
            if existing.state.is_live() {
                return Err(NetworkError::SessionExists(target.to_string()));
            }
        }

        self.teardown(target).await;
        self.create_session(target, Role::Initiator).await?;

        match self.negotiate_offer(target).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fail(target, &e).await;
                Err(e.into())
            }
        }
    }

    /// Handle an offer envelope from `from`
    pub async fn handle_offer(&mut self, from: &str, offer: SessionDescription) {
        if offer.kind != SdpKind::Offer {
            warn!("Ignoring offer envelope from {} carrying {:?}", from, offer.kind);
            return;
        }

        if let Some(existing) = self.sessions.get_mut(from) {
            match existing.state {
                SessionState::Closed => {}
                SessionState::OfferSent if self.local_id.as_str() < from => {
                    // Both sides offered; the smaller id keeps its own offer
                    info!("Offer collision with {}, keeping local offer", from);
                    existing.discard_remote_candidates = true;
                    return;
                }
                state => {
                    info!("Replacing {:?} session with {} for a new offer", state, from);
                }
            }
        }

        self.teardown(from).await;
        if let Err(e) = self.create_session(from, Role::Responder).await {
            warn!("Failed to create peer connection for {}: {}", from, e);
            return;
        }

        if let Some(early) = self.early_candidates.remove(from) {
            if let Some(session) = self.sessions.get_mut(from) {
                for candidate in early.queue {
                    if session.seen_candidates.insert(candidate.clone()) {
                        session.pending_candidates.push(candidate);
                    }
                }
            }
        }

        if let Err(e) = self.negotiate_answer(from, offer).await {
            self.fail(from, &e).await;
        }
    }

    /// Handle an answer envelope from `from`
    pub async fn handle_answer(&mut self, from: &str, answer: SessionDescription) {
        match self.state(from) {
            Some(SessionState::OfferSent) => {}
            state => {
                warn!("Ignoring answer from {} in state {:?}", from, state);
                return;
            }
        }

        if let Err(e) = self.apply_answer(from, answer).await {
            self.fail(from, &e).await;
        }
    }

    /// Handle a candidate envelope from `from`
    ///
    /// Applied immediately once the remote description is set, otherwise
    /// buffered and flushed in arrival order right after it is applied.
    /// A candidate already seen by the session is ignored.
    pub async fn handle_candidate(&mut self, from: &str, candidate: IceCandidate) {
        let Some(session) = self.sessions.get_mut(from) else {
            self.early_candidates
                .entry(from.to_string())
                .or_default()
                .push(from, candidate);
            return;
        };

        if !session.state.is_live() {
            debug!("Candidate from {} for closed session dropped", from);
            return;
        }
        if session.discard_remote_candidates {
            debug!("Candidate from {} for ignored offer dropped", from);
            return;
        }
        if !session.seen_candidates.insert(candidate.clone()) {
            debug!("Duplicate candidate from {} ignored", from);
            return;
        }
        if !session.remote_description_set {
            session.pending_candidates.push(candidate);
            return;
        }

        let connection = session.connection.clone();
        if let Err(e) = connection.add_ice_candidate(candidate).await {
            self.fail(from, &e).await;
        }
    }

    /// Handle a callback raised by a peer connection or its data channel
    pub async fn handle_rtc_event(&mut self, notice: RtcNotice) -> Option<ChannelEvent> {
        let RtcNotice {
            peer,
            session: id,
            event,
        } = notice;

        if self.live_session_mut(&peer, id).is_none() {
            debug!("Discarding {:?} from stale session {} with {}", event, id, peer);
            return None;
        }

        match event {
            RtcEvent::CandidateDiscovered(candidate) => {
                self.send(Envelope::candidate(
                    self.local_id.clone(),
                    peer,
                    candidate,
                ));
                None
            }
            RtcEvent::ConnectionStateChanged(state) if state.is_terminal() => {
                self.close_peer(&peer, "peer connection ended").await;
                Some(ChannelEvent::Closed(peer))
            }
            RtcEvent::ConnectionStateChanged(PeerConnectionState::Disconnected) => {
                warn!("Peer connection to {} disconnected", peer);
                None
            }
            RtcEvent::ConnectionStateChanged(state) => {
                debug!("Peer connection to {} is {:?}", peer, state);
                None
            }
            RtcEvent::RemoteDataChannel(channel) => {
                let session = self.live_session_mut(&peer, id)?;
                session.channel.attach(channel);
                None
            }
            RtcEvent::ChannelOpen => {
                let session = self.live_session_mut(&peer, id)?;
                if session.channel.mark_open() {
                    info!("Data channel to {} is open", peer);
                    Some(ChannelEvent::Opened(peer))
                } else {
                    None
                }
            }
            RtcEvent::ChannelMessage(text) => {
                let session = self.live_session_mut(&peer, id)?;
                if session.channel.is_open() {
                    Some(ChannelEvent::Message { peer, text })
                } else {
                    warn!("Message from {} before channel open dropped", peer);
                    None
                }
            }
            RtcEvent::ChannelClosed => {
                self.close_peer(&peer, "data channel closed").await;
                Some(ChannelEvent::Closed(peer))
            }
        }
    }

    /// Send text to `peer` over its open data channel
    pub async fn send_text(&self, peer: &str, text: &str) -> Result<(), ChannelError> {
        match self.sessions.get(peer) {
            Some(session) if session.is_ready() => session.channel.send(text).await,
            _ => Err(ChannelError::NotOpen(peer.to_string())),
        }
    }

    /// Close sessions with peers missing from `online`; returns the peers closed
    pub async fn close_departed(&mut self, online: &[UserId]) -> Vec<UserId> {
        let departed: Vec<UserId> = self
            .live_peers()
            .into_iter()
            .filter(|peer| !online.contains(peer))
            .collect();

        for peer in &departed {
            self.close_peer(peer, "peer left the relay").await;
        }
        self.early_candidates.retain(|peer, _| online.contains(peer));
        departed
    }

    /// Move the session with `peer` to `Closed`; returns false if nothing was live
    pub async fn close_peer(&mut self, peer: &str, reason: &str) -> bool {
        self.early_candidates.remove(peer);
        let Some(session) = self.sessions.get_mut(peer) else {
            return false;
        };
        if !session.state.is_live() {
            return false;
        }

        info!("Closing session with {}: {}", peer, reason);
        session.set_state(SessionState::Closed);
        session.pending_candidates.clear();
        session.channel.close().await;
        session.connection.close().await;
        true
    }

    /// Close every session, e.g. after losing the relay transport
    pub async fn close_all(&mut self, reason: &str) {
        let peers: Vec<UserId> = self.sessions.keys().cloned().collect();
        for peer in peers {
            self.close_peer(&peer, reason).await;
        }
        self.early_candidates.clear();
    }

    async fn teardown(&mut self, peer: &str) {
        self.close_peer(peer, "replaced").await;
        self.sessions.remove(peer);
    }

    async fn create_session(&mut self, peer: &str, role: Role) -> Result<(), NegotiationError> {
        let id = self.next_session;
        self.next_session += 1;

        let events = RtcEvents::new(peer.to_string(), id, self.events.clone());
        let connection = self.factory.create(events).await?;

        debug!("Created session {} with {} as {:?}", id, peer, role);
        self.sessions.insert(
            peer.to_string(),
            PeerSession::new(peer.to_string(), id, role, connection),
        );
        Ok(())
    }

    async fn negotiate_offer(&mut self, target: &str) -> Result<(), NegotiationError> {
        let connection = self.connection(target)?;

        let channel = connection.create_data_channel(CHAT_CHANNEL_LABEL).await?;
        if let Some(session) = self.sessions.get_mut(target) {
            session.channel.attach(channel);
        }

        let offer = connection.create_offer().await?;
        connection.set_local_description(offer.clone()).await?;

        self.send(Envelope::offer(self.local_id.clone(), target, offer));
        self.set_state(target, SessionState::OfferSent);
        Ok(())
    }

    async fn negotiate_answer(
        &mut self,
        from: &str,
        offer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let connection = self.connection(from)?;

        connection.set_remote_description(offer).await?;
        self.set_state(from, SessionState::OfferReceived);
        self.remote_description_applied(from).await?;

        let answer = connection.create_answer().await?;
        connection.set_local_description(answer.clone()).await?;

        self.send(Envelope::answer(self.local_id.clone(), from, answer));
        self.set_state(from, SessionState::Connected);
        Ok(())
    }

    async fn apply_answer(
        &mut self,
        from: &str,
        answer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let connection = self.connection(from)?;

        connection.set_remote_description(answer).await?;
        if let Some(session) = self.sessions.get_mut(from) {
            session.discard_remote_candidates = false;
        }
        self.remote_description_applied(from).await?;
        self.set_state(from, SessionState::Connected);
        Ok(())
    }

    /// Mark the remote description set and flush buffered candidates in order
    async fn remote_description_applied(&mut self, peer: &str) -> Result<(), NegotiationError> {
        let Some(session) = self.sessions.get_mut(peer) else {
            return Ok(());
        };
        session.remote_description_set = true;
        let pending = std::mem::take(&mut session.pending_candidates);
        let connection = session.connection.clone();

        if !pending.is_empty() {
            debug!("Applying {} buffered candidates from {}", pending.len(), peer);
        }
        for candidate in pending {
            connection.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    async fn fail(&mut self, peer: &str, err: &NegotiationError) {
        warn!("Negotiation with {} failed: {}", peer, err);
        self.close_peer(peer, "negotiation failed").await;
    }

    fn connection(&self, peer: &str) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        self.sessions
            .get(peer)
            .map(|s| s.connection.clone())
            .ok_or_else(|| NegotiationError::PeerConnection(format!("no session with {}", peer)))
    }

    fn live_session_mut(&mut self, peer: &str, id: SessionId) -> Option<&mut PeerSession> {
        self.sessions
            .get_mut(peer)
            .filter(|s| s.id == id && s.state.is_live())
    }

    fn set_state(&mut self, peer: &str, state: SessionState) {
        if let Some(session) = self.sessions.get_mut(peer) {
            session.set_state(state);
        }
    }

    fn send(&self, envelope: Envelope) {
        debug!("Sending {} to {:?}", envelope.kind(), envelope.to);
        if self.outbound.send(envelope).is_err() {
            warn!("Signaling transport is gone, envelope dropped");
        }
    }
}
