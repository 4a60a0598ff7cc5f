//! Signaling relay: presence registry and envelope router
//!
//! Tracks which user ids are online and forwards addressed envelopes
//! between their WebSocket connections.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::protocol::{Body, Envelope, ErrorCode, UserId};

use super::error::{NetworkError, RoutingError};

/// Identifies one relay transport
pub type ConnectionId = Uuid;

/// Outbound text frames for one transport
type FrameSender = mpsc::UnboundedSender<String>;

#[derive(Default)]
struct RegistryState {
    /// Every open transport, registered or not
    connections: HashMap<ConnectionId, FrameSender>,
    /// Registered id -> owning transport
    users: BTreeMap<UserId, ConnectionId>,
    /// Transport -> id it registered
    names: HashMap<ConnectionId, UserId>,
}

impl RegistryState {
    fn user_list(&self) -> Vec<UserId> {
        self.users.keys().cloned().collect()
    }

    /// Queue the current user list on every transport; callers hold the lock
    /// so no transport can observe lists out of mutation order
    fn broadcast_user_list(&self) {
        let envelope = Envelope::user_list(self.user_list());
        let frame = match envelope.encode() {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode user list: {}", e);
                return;
            }
        };

        debug!("Broadcasting user list to {} transports", self.connections.len());
        for tx in self.connections.values() {
            let _ = tx.send(frame.clone());
        }
    }

    fn release(&mut self, conn: ConnectionId) -> Option<UserId> {
        let name = self.names.remove(&conn)?;
        self.users.remove(&name);
        Some(name)
    }
}

/// Map of online users and their transports
///
/// All mutations and the broadcasts they trigger run under one lock.
#[derive(Clone, Default)]
pub struct Registry {
    state: Arc<Mutex<RegistryState>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly accepted transport
    pub fn attach(&self, conn: ConnectionId, tx: FrameSender) {
        self.state.lock().connections.insert(conn, tx);
    }

    /// Bind `name` to `conn` and broadcast the new user list
    ///
    /// Fails with [`ErrorCode::NameTaken`] if another transport holds `name`.
    /// A transport registering a second name gives up its first one, even
    /// when the second name is refused.
    pub fn register(&self, conn: ConnectionId, name: &str) -> Result<(), ErrorCode> {
        let mut state = self.state.lock();

        match state.users.get(name).copied() {
            Some(owner) if owner != conn => {
                if let Some(previous) = state.release(conn) {
                    info!("Connection {} lost {} after a refused rename", conn, previous);
                    state.broadcast_user_list();
                }
                return Err(ErrorCode::NameTaken);
            }
            Some(_) => {}
            None => {
                if let Some(previous) = state.release(conn) {
                    info!("Connection {} renamed {} -> {}", conn, previous, name);
                }
                state.users.insert(name.to_string(), conn);
                state.names.insert(conn, name.to_string());
                info!("User {} registered on {}", name, conn);
            }
        }

        state.broadcast_user_list();
        Ok(())
    }

    /// Forget a closed transport; broadcasts if it was registered
    pub fn detach(&self, conn: ConnectionId) -> Option<UserId> {
        let mut state = self.state.lock();
        state.connections.remove(&conn);
        let name = state.release(conn)?;

        info!("User {} disconnected", name);
        state.broadcast_user_list();
        Some(name)
    }

    /// Forward `frame` unchanged to the transport registered as `envelope.to`
    pub fn route(&self, envelope: &Envelope, frame: &str) -> Result<(), RoutingError> {
        let target = envelope.to.as_deref().ok_or(RoutingError::MissingRecipient)?;

        let state = self.state.lock();
        let tx = state
            .users
            .get(target)
            .and_then(|conn| state.connections.get(conn))
            .ok_or_else(|| RoutingError::TargetUnavailable(target.to_string()))?;

        tx.send(frame.to_string())
            .map_err(|_| RoutingError::TargetUnavailable(target.to_string()))
    }

    /// Process one inbound text frame from `conn`
    ///
    /// Registrations and routing failures are answered on `conn`'s own
    /// queue. Malformed frames and relay-originated types are logged and
    /// dropped without closing the transport.
    pub fn handle_frame(&self, conn: ConnectionId, text: &str) {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Invalid message on {}: {}", conn, e);
                return;
            }
        };

        debug!(
            "{} from {:?} to {:?} on {}",
            envelope.kind(),
            envelope.from,
            envelope.to,
            conn
        );

        match &envelope.body {
            Body::Register => {
                let Some(name) = envelope.from.as_deref().filter(|n| !n.is_empty()) else {
                    warn!("Register without a name on {}", conn);
                    return;
                };
                if let Err(code) = self.register(conn, name) {
                    warn!("Registration of {} rejected: {}", name, code);
                    self.reply_error(conn, Some(name.to_string()), code);
                }
            }
            Body::Offer(_) | Body::Answer(_) | Body::Candidate(_) => {
                if let Err(e) = self.route(&envelope, text) {
                    info!("Routing failed on {}: {}", conn, e);
                    let sender = envelope.from.clone().or_else(|| self.name_of(conn));
                    self.reply_error(conn, sender, ErrorCode::TargetUnavailable);
                }
            }
            // Relay-originated types are never accepted from clients
            Body::UserList(_) | Body::Error(_) => {
                warn!("Ignoring client-sent {} on {}", envelope.kind(), conn);
            }
        }
    }

    fn reply_error(&self, conn: ConnectionId, to: Option<UserId>, code: ErrorCode) {
        let frame = match Envelope::error(to, code).encode() {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode error envelope: {}", e);
                return;
            }
        };
        if let Some(tx) = self.state.lock().connections.get(&conn) {
            let _ = tx.send(frame);
        }
    }

    /// Currently registered ids, sorted
    pub fn users(&self) -> Vec<UserId> {
        self.state.lock().user_list()
    }

    pub fn name_of(&self, conn: ConnectionId) -> Option<UserId> {
        self.state.lock().names.get(&conn).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }
}

/// Signaling server state
pub struct SignalingServer {
    registry: Registry,
}

impl SignalingServer {
    /// Create a new signaling server
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Bind `addr` and serve until the listener fails
    pub async fn run(&self, addr: &str) -> Result<(), NetworkError> {
        let listener = TcpListener::bind(addr).await?;

        info!("Signaling server listening on {}", addr);
        self.serve(listener).await
    }

    /// Accept plain WebSocket connections from `listener`
    pub async fn serve(&self, listener: TcpListener) -> Result<(), NetworkError> {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    info!("New signaling connection from {}", peer_addr);
                    let registry = self.registry.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, registry).await {
                            warn!("Connection error for {}: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }
}

impl Default for SignalingServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Upgrade a TCP stream and serve it
async fn handle_connection(stream: TcpStream, registry: Registry) -> Result<(), NetworkError> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| NetworkError::SignalingError(format!("WebSocket accept failed: {}", e)))?;

    serve_websocket(ws_stream, registry).await
}

/// Serve one upgraded WebSocket until it closes
///
/// Generic over the byte stream so the binary can hand in TLS streams.
pub async fn serve_websocket<S>(
    ws_stream: WebSocketStream<S>,
    registry: Registry,
) -> Result<(), NetworkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let conn = Uuid::new_v4();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    registry.attach(conn, tx);

    let (mut write, mut read) = ws_stream.split();
    let mut result = Ok(());

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        registry.handle_frame(conn, &text);
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error on {}: {}", conn, e);
                        break;
                    }
                    _ => {}
                }
            }

            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = write.send(Message::Text(frame)).await {
                    result = Err(NetworkError::SignalingError(format!("Send failed: {}", e)));
                    break;
                }
            }
        }
    }

    // Clean up on disconnect
    registry.detach(conn);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(registry: &Registry) -> (ConnectionId, mpsc::UnboundedReceiver<String>) {
        let conn = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        registry.attach(conn, tx);
        (conn, rx)
    }

    fn last_user_list(rx: &mut mpsc::UnboundedReceiver<String>) -> Option<Vec<UserId>> {
        let mut last = None;
        while let Ok(frame) = rx.try_recv() {
            if let Body::UserList(users) = Envelope::decode(&frame).unwrap().body {
                last = Some(users);
            }
        }
        last
    }

    #[test]
    fn test_register_broadcasts_to_every_transport() {
        let registry = Registry::new();
        let (alice, mut alice_rx) = transport(&registry);
        let (_idle, mut idle_rx) = transport(&registry);

        registry.register(alice, "alice").unwrap();

        assert_eq!(last_user_list(&mut alice_rx), Some(vec!["alice".to_string()]));
        assert_eq!(last_user_list(&mut idle_rx), Some(vec!["alice".to_string()]));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let registry = Registry::new();
        let (first, _first_rx) = transport(&registry);
        let (second, _second_rx) = transport(&registry);

        registry.register(first, "alice").unwrap();
        assert_eq!(registry.register(second, "alice"), Err(ErrorCode::NameTaken));
        // Same transport re-registering is harmless
        assert!(registry.register(first, "alice").is_ok());
        assert_eq!(registry.users(), vec!["alice".to_string()]);
    }

    #[test]
    fn test_rename_releases_old_name() {
        let registry = Registry::new();
        let (conn, _rx) = transport(&registry);

        registry.register(conn, "alice").unwrap();
        registry.register(conn, "alicia").unwrap();

        assert_eq!(registry.users(), vec!["alicia".to_string()]);
        assert_eq!(registry.name_of(conn).as_deref(), Some("alicia"));
    }

    #[test]
    fn test_refused_rename_releases_old_name() {
        let registry = Registry::new();
        let (alice, mut alice_rx) = transport(&registry);
        let (bob, mut bob_rx) = transport(&registry);
        registry.register(alice, "alice").unwrap();
        registry.register(bob, "bob").unwrap();

        assert_eq!(registry.register(alice, "bob"), Err(ErrorCode::NameTaken));

        assert_eq!(registry.users(), vec!["bob".to_string()]);
        assert_eq!(registry.name_of(alice), None);
        assert_eq!(last_user_list(&mut alice_rx), Some(vec!["bob".to_string()]));
        assert_eq!(last_user_list(&mut bob_rx), Some(vec!["bob".to_string()]));
    }

    #[test]
    fn test_user_list_tracks_membership() {
        let registry = Registry::new();
        let mut transports = Vec::new();
        for name in ["dave", "alice", "carol", "bob"] {
            let (conn, rx) = transport(&registry);
            registry.register(conn, name).unwrap();
            transports.push((name, conn, rx));
        }

        // Drop carol, then alice
        let (_, carol, _) = transports.remove(2);
        registry.detach(carol);
        let (_, alice, _) = transports.remove(1);
        registry.detach(alice);

        let expected = vec!["bob".to_string(), "dave".to_string()];
        assert_eq!(registry.users(), expected);
        for (_, _, rx) in transports.iter_mut() {
            assert_eq!(last_user_list(rx), Some(expected.clone()));
        }
        assert_eq!(registry.connection_count(), 2);
    }

    #[test]
    fn test_route_forwards_frame_unchanged() {
        let registry = Registry::new();
        let (alice, _alice_rx) = transport(&registry);
        let (bob, mut bob_rx) = transport(&registry);
        registry.register(alice, "alice").unwrap();
        registry.register(bob, "bob").unwrap();
        while bob_rx.try_recv().is_ok() {}

        let frame = r#"{"type":"offer","from":"alice","to":"bob","data":{"type":"offer","sdp":"x"}}"#;
        let envelope = Envelope::decode(frame).unwrap();
        registry.route(&envelope, frame).unwrap();

        assert_eq!(bob_rx.try_recv().unwrap(), frame);
    }

    #[test]
    fn test_route_to_unknown_target_fails() {
        let registry = Registry::new();
        let envelope = Envelope::offer(
            "alice",
            "carol",
            crate::protocol::SessionDescription::offer("x"),
        );

        assert_eq!(
            registry.route(&envelope, "{}"),
            Err(RoutingError::TargetUnavailable("carol".to_string()))
        );
    }

    #[test]
    fn test_unroutable_frame_gets_error_reply() {
        let registry = Registry::new();
        let (alice, mut alice_rx) = transport(&registry);
        registry.register(alice, "alice").unwrap();
        while alice_rx.try_recv().is_ok() {}

        let frame = Envelope::offer(
            "alice",
            "carol",
            crate::protocol::SessionDescription::offer("x"),
        )
        .encode()
        .unwrap();
        registry.handle_frame(alice, &frame);

        let error = Envelope::decode(&alice_rx.try_recv().unwrap()).unwrap();
        assert_eq!(error, Envelope::error(Some("alice".to_string()), ErrorCode::TargetUnavailable));
    }

    #[test]
    fn test_malformed_frame_is_ignored() {
        let registry = Registry::new();
        let (conn, mut rx) = transport(&registry);

        registry.handle_frame(conn, "{not json");
        registry.handle_frame(conn, r#"{"type":"user-list","data":["x"]}"#);

        assert!(rx.try_recv().is_err());
        assert!(registry.users().is_empty());
    }
}
