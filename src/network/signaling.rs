//! Signaling client for the relay
//!
//! Owns the WebSocket session to the relay and converts between text frames
//! and [`Envelope`]s.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::protocol::Envelope;

use super::error::NetworkError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Signaling client for connecting to a signaling server
pub struct SignalingClient {
    server_url: String,
}

impl SignalingClient {
    /// Create a new signaling client
    pub fn new(server_url: &str) -> Self {
        Self {
            server_url: server_url.to_string(),
        }
    }

    /// Connect to the signaling server
    pub async fn connect(&self) -> Result<SignalingConnection, NetworkError> {
        let (ws_stream, _) = connect_async(self.server_url.as_str())
            .await
            .map_err(|e| NetworkError::SignalingError(format!("Connect failed: {}", e)))?;

        debug!("Connected to signaling server: {}", self.server_url);

        Ok(SignalingConnection { ws_stream })
    }
}

/// An active connection to the signaling server
pub struct SignalingConnection {
    ws_stream: WsStream,
}

impl SignalingConnection {
    /// Send an envelope to the server
    pub async fn send(&mut self, envelope: &Envelope) -> Result<(), NetworkError> {
        send_envelope(&mut self.ws_stream, envelope).await
    }

    /// Receive the next well-formed envelope
    ///
    /// Malformed frames are logged and skipped. Returns `Ok(None)` once the
    /// server closes the session.
    pub async fn recv(&mut self) -> Result<Option<Envelope>, NetworkError> {
        next_envelope(&mut self.ws_stream).await
    }

    /// Split into independently owned send and receive halves
    pub fn split(self) -> (SignalingSender, SignalingReceiver) {
        let (sink, stream) = self.ws_stream.split();
        (SignalingSender { sink }, SignalingReceiver { stream })
    }

    /// Close the connection
    pub async fn close(mut self) -> Result<(), NetworkError> {
        self.ws_stream
            .close(None)
            .await
            .map_err(|e| NetworkError::SignalingError(format!("Close failed: {}", e)))?;
        Ok(())
    }
}

/// Sending half of a [`SignalingConnection`]
pub struct SignalingSender {
    sink: SplitSink<WsStream, Message>,
}

impl SignalingSender {
    pub async fn send(&mut self, envelope: &Envelope) -> Result<(), NetworkError> {
        send_envelope(&mut self.sink, envelope).await
    }

    /// Send queued envelopes in order until the queue closes or a send fails
    pub async fn forward(mut self, mut queue: mpsc::UnboundedReceiver<Envelope>) {
        while let Some(envelope) = queue.recv().await {
            if let Err(e) = self.send(&envelope).await {
                warn!("Signaling send failed: {}", e);
                break;
            }
        }
        let _ = self.sink.close().await;
    }
}

/// Receiving half of a [`SignalingConnection`]
pub struct SignalingReceiver {
    stream: SplitStream<WsStream>,
}

impl SignalingReceiver {
    /// Same contract as [`SignalingConnection::recv`]
    pub async fn recv(&mut self) -> Result<Option<Envelope>, NetworkError> {
        next_envelope(&mut self.stream).await
    }
}

async fn send_envelope<S>(sink: &mut S, envelope: &Envelope) -> Result<(), NetworkError>
where
    S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let json = envelope.encode()?;

    sink.send(Message::Text(json))
        .await
        .map_err(|e| NetworkError::SignalingError(format!("Send failed: {}", e)))
}

async fn next_envelope<S>(stream: &mut S) -> Result<Option<Envelope>, NetworkError>
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => match Envelope::decode(&text) {
                Ok(envelope) => return Ok(Some(envelope)),
                Err(e) => {
                    warn!("Discarding malformed signaling frame: {}", e);
                }
            },
            Some(Ok(Message::Close(_))) | None => return Ok(None),
            Some(Err(e)) => {
                return Err(NetworkError::SignalingError(format!(
                    "Receive failed: {}",
                    e
                )));
            }
            _ => continue,
        }
    }
}
