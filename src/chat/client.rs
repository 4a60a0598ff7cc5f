//! Chat client event loop
//!
//! A single [`ChatClient`] owns the signaling queue, every peer session and
//! the message log. Inbound envelopes, peer-connection callbacks and user
//! actions are handled one at a time on the same task, so each handler sees
//! and leaves the state consistent.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::network::{
    ChannelError, ChannelEvent, ConnectionManager, Message, MessageLog, NetworkError,
    PeerConnectionFactory, RtcNotice, SessionState, SignalingConnection, SignalingReceiver,
};
use crate::protocol::{Body, Envelope, ErrorCode, UserId};

/// Notification for the presentation layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientUpdate {
    /// Online users other than ourselves
    Users(Vec<UserId>),
    Registered(bool),
    ActivePeer(UserId),
    ChannelOpened(UserId),
    ChannelClosed(UserId),
    /// A message was added to a conversation
    Message(Message),
}

/// Snapshot of what the presentation layer displays
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientView {
    pub name: Option<UserId>,
    pub registered: bool,
    pub users: Vec<UserId>,
    pub active_peer: Option<UserId>,
    pub conversation: Vec<Message>,
}

enum ClientCommand {
    Register {
        name: UserId,
        reply: oneshot::Sender<Result<(), NetworkError>>,
    },
    StartChat {
        target: UserId,
        reply: oneshot::Sender<Result<(), NetworkError>>,
    },
    Select {
        peer: UserId,
    },
    SendMessage {
        text: String,
        reply: oneshot::Sender<Result<(), NetworkError>>,
    },
    View {
        reply: oneshot::Sender<ClientView>,
    },
}

/// Peer-side chat state
pub struct ChatClient {
    name: Option<UserId>,
    registered: bool,
    users: Vec<UserId>,
    active_peer: Option<UserId>,
    log: MessageLog,
    manager: ConnectionManager,
    outbound: mpsc::UnboundedSender<Envelope>,
    rtc_events: mpsc::UnboundedReceiver<RtcNotice>,
    updates: Option<mpsc::UnboundedSender<ClientUpdate>>,
}

impl ChatClient {
    /// Create a client that sends envelopes on `outbound`
    pub fn new(
        factory: Arc<dyn PeerConnectionFactory>,
        outbound: mpsc::UnboundedSender<Envelope>,
    ) -> Self {
        let (events_tx, rtc_events) = mpsc::unbounded_channel();

        Self {
            name: None,
            registered: false,
            users: Vec::new(),
            active_peer: None,
            log: MessageLog::new(),
            manager: ConnectionManager::new(factory, outbound.clone(), events_tx),
            outbound,
            rtc_events,
            updates: None,
        }
    }

    /// Publish [`ClientUpdate`]s on `updates`
    pub fn with_updates(mut self, updates: mpsc::UnboundedSender<ClientUpdate>) -> Self {
        self.updates = Some(updates);
        self
    }

    /// Connect the client to an open relay session and run it on its own task
    pub fn spawn(
        connection: SignalingConnection,
        factory: Arc<dyn PeerConnectionFactory>,
        updates: Option<mpsc::UnboundedSender<ClientUpdate>>,
    ) -> (ChatHandle, JoinHandle<()>) {
        let (sender, receiver) = connection.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(sender.forward(outbound_rx));

        let mut client = ChatClient::new(factory, outbound_tx);
        client.updates = updates;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(client.run(receiver, command_rx));

        (ChatHandle { commands: command_tx }, task)
    }

    // ---- presentation surface ----

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// Online users other than ourselves
    pub fn users(&self) -> Vec<UserId> {
        self.users
            .iter()
            .filter(|user| Some(user.as_str()) != self.name.as_deref())
            .cloned()
            .collect()
    }

    pub fn active_peer(&self) -> Option<&str> {
        self.active_peer.as_deref()
    }

    /// Messages exchanged with the active peer
    pub fn conversation(&self) -> &[Message] {
        match &self.active_peer {
            Some(peer) => self.log.conversation(peer),
            None => &[],
        }
    }

    pub fn log(&self) -> &MessageLog {
        &self.log
    }

    pub fn session_state(&self, peer: &str) -> Option<SessionState> {
        self.manager.state(peer)
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn view(&self) -> ClientView {
        ClientView {
            name: self.name.clone(),
            registered: self.registered,
            users: self.users(),
            active_peer: self.active_peer.clone(),
            conversation: self.conversation().to_vec(),
        }
    }

    // ---- actions ----

    /// Announce ourselves to the relay as `name`
    ///
    /// The relay answers with a user list, or an error that revokes the
    /// registration.
    pub async fn register(&mut self, name: &str) -> Result<(), NetworkError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(NetworkError::Config("Name must not be empty".to_string()));
        }

        if self.name.as_deref().is_some_and(|current| current != name) {
            self.manager.close_all("registered under a new name").await;
        }

        self.name = Some(name.to_string());
        self.manager.set_local_id(name);
        self.outbound
            .send(Envelope::register(name))
            .map_err(|_| NetworkError::SignalingError("Signaling transport closed".to_string()))?;

        info!("Registering as {}", name);
        self.registered = true;
        self.notify(ClientUpdate::Registered(true));
        Ok(())
    }

    /// Select `target` and negotiate a peer connection with it
    pub async fn start_chat(&mut self, target: &str) -> Result<(), NetworkError> {
        if !self.registered {
            return Err(NetworkError::NotRegistered);
        }
        if self.name.as_deref() == Some(target) {
            return Err(NetworkError::SignalingError(
                "Cannot start a chat with yourself".to_string(),
            ));
        }

        self.select(target);
        self.manager.start_chat(target).await
    }

    /// Make `peer` the active conversation without negotiating
    pub fn select(&mut self, peer: &str) {
        if self.active_peer.as_deref() == Some(peer) {
            return;
        }
        self.active_peer = Some(peer.to_string());
        self.notify(ClientUpdate::ActivePeer(peer.to_string()));
    }

    /// Send `text` to the active peer
    ///
    /// Fails with a [`ChannelError`] and leaves the log untouched unless the
    /// active peer's data channel is open.
    pub async fn send_message(&mut self, text: &str) -> Result<(), NetworkError> {
        let peer = self
            .active_peer
            .clone()
            .ok_or(ChannelError::NoPeerSelected)?;
        self.manager.send_text(&peer, text).await?;
        let local = self.manager.local_id().to_string();

        self.log.record_sent(&local, &peer, text);
        self.notify_last_message(&peer);
        Ok(())
    }

    // ---- inbound ----

    /// Dispatch one envelope from the relay
    pub async fn handle_envelope(&mut self, envelope: Envelope) {
        if let (Some(to), Some(name)) = (envelope.to.as_deref(), self.name.as_deref()) {
            if to != name {
                warn!("Discarding {} addressed to {}", envelope.kind(), to);
                return;
            }
        }

        let from = envelope.from;
        match envelope.body {
            Body::UserList(users) => self.handle_user_list(users).await,
            Body::Error(code) => {
                if code.revokes_registration() {
                    warn!("Relay rejected us: {}", code);
                    // The relay holds no name for us after a refused registration
                    if code == ErrorCode::NameTaken {
                        self.name = None;
                    }
                    self.registered = false;
                    self.notify(ClientUpdate::Registered(false));
                } else {
                    warn!("Relay reported error: {}", code);
                }
            }
            Body::Register => {
                warn!("Ignoring register envelope from {:?}", from);
            }
            body => {
                let Some(from) = from.filter(|f| !f.is_empty()) else {
                    warn!("Discarding {} without a sender", body.kind());
                    return;
                };
                if self.name.is_none() {
                    warn!("Discarding {} from {} before registering", body.kind(), from);
                    return;
                }
                self.handle_negotiation(from, body).await;
            }
        }
    }

    async fn handle_negotiation(&mut self, from: UserId, body: Body) {
        debug!("Received {} from {}", body.kind(), from);
        match body {
            Body::Offer(offer) => {
                self.select(&from);
                self.manager.handle_offer(&from, offer).await;
            }
            Body::Answer(answer) => self.manager.handle_answer(&from, answer).await,
            Body::Candidate(candidate) => self.manager.handle_candidate(&from, candidate).await,
            _ => {}
        }
    }

    async fn handle_user_list(&mut self, users: Vec<UserId>) {
        self.users = users;

        for peer in self.manager.close_departed(&self.users).await {
            self.notify(ClientUpdate::ChannelClosed(peer));
        }
        self.notify(ClientUpdate::Users(self.users()));
    }

    /// Apply one peer-connection callback
    pub async fn handle_rtc_event(&mut self, notice: RtcNotice) {
        let Some(event) = self.manager.handle_rtc_event(notice).await else {
            return;
        };

        match event {
            ChannelEvent::Opened(peer) => self.notify(ClientUpdate::ChannelOpened(peer)),
            ChannelEvent::Closed(peer) => self.notify(ClientUpdate::ChannelClosed(peer)),
            ChannelEvent::Message { peer, text } => {
                let local = self.name.clone().unwrap_or_default();
                self.log.record_received(&local, &peer, &text);
                self.notify_last_message(&peer);
            }
        }
    }

    /// Handle every peer-connection callback queued so far
    pub async fn process_rtc_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(notice) = self.rtc_events.try_recv() {
            self.handle_rtc_event(notice).await;
            handled += 1;
        }
        handled
    }

    /// The relay transport is gone: every session closes
    pub async fn transport_lost(&mut self) {
        self.manager.close_all("signaling transport lost").await;
        if self.registered {
            self.registered = false;
            self.notify(ClientUpdate::Registered(false));
        }
    }

    /// Run until the relay closes or every [`ChatHandle`] is dropped
    async fn run(
        mut self,
        mut inbound: SignalingReceiver,
        mut commands: mpsc::UnboundedReceiver<ClientCommand>,
    ) {
        loop {
            tokio::select! {
                frame = inbound.recv() => match frame {
                    Ok(Some(envelope)) => self.handle_envelope(envelope).await,
                    Ok(None) => {
                        info!("Relay closed the signaling session");
                        break;
                    }
                    Err(e) => {
                        warn!("Signaling transport failed: {}", e);
                        break;
                    }
                },

                Some(notice) = self.rtc_events.recv() => {
                    self.handle_rtc_event(notice).await;
                }

                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
            }
        }

        self.transport_lost().await;
    }

    async fn handle_command(&mut self, command: ClientCommand) {
        match command {
            ClientCommand::Register { name, reply } => {
                let _ = reply.send(self.register(&name).await);
            }
            ClientCommand::StartChat { target, reply } => {
                let _ = reply.send(self.start_chat(&target).await);
            }
            ClientCommand::Select { peer } => self.select(&peer),
            ClientCommand::SendMessage { text, reply } => {
                let _ = reply.send(self.send_message(&text).await);
            }
            ClientCommand::View { reply } => {
                let _ = reply.send(self.view());
            }
        }
    }

    fn notify_last_message(&self, peer: &str) {
        if let Some(message) = self.log.conversation(peer).last() {
            self.notify(ClientUpdate::Message(message.clone()));
        }
    }

    fn notify(&self, update: ClientUpdate) {
        if let Some(updates) = &self.updates {
            let _ = updates.send(update);
        }
    }
}

/// Cloneable handle for issuing actions to a running [`ChatClient`]
#[derive(Clone)]
pub struct ChatHandle {
    commands: mpsc::UnboundedSender<ClientCommand>,
}

impl ChatHandle {
    pub async fn register(&self, name: &str) -> Result<(), NetworkError> {
        let (reply, rx) = oneshot::channel();
        self.request(ClientCommand::Register {
            name: name.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| stopped())?
    }

    pub async fn start_chat(&self, target: &str) -> Result<(), NetworkError> {
        let (reply, rx) = oneshot::channel();
        self.request(ClientCommand::StartChat {
            target: target.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| stopped())?
    }

    pub fn select(&self, peer: &str) -> Result<(), NetworkError> {
        self.request(ClientCommand::Select {
            peer: peer.to_string(),
        })
    }

    pub async fn send_message(&self, text: &str) -> Result<(), NetworkError> {
        let (reply, rx) = oneshot::channel();
        self.request(ClientCommand::SendMessage {
            text: text.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| stopped())?
    }

    pub async fn view(&self) -> Result<ClientView, NetworkError> {
        let (reply, rx) = oneshot::channel();
        self.request(ClientCommand::View { reply })?;
        rx.await.map_err(|_| stopped())
    }

    fn request(&self, command: ClientCommand) -> Result<(), NetworkError> {
        self.commands.send(command).map_err(|_| stopped())
    }
}

fn stopped() -> NetworkError {
    NetworkError::SignalingError("Chat client stopped".to_string())
}
