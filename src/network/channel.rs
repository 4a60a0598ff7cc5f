//! Data channel session and per-pair message log

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use super::error::ChannelError;
use super::rtc::DataChannel;
use crate::protocol::UserId;

/// Data channel lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    /// No channel yet, or channel created but not open
    #[default]
    Pending,
    /// Open; messages may flow
    Open,
    /// Closed; the channel is never reused
    Closed,
}

/// The chat channel bound to one peer session
pub struct ChannelSession {
    peer: UserId,
    channel: Option<Arc<dyn DataChannel>>,
    state: ChannelState,
}

impl ChannelSession {
    pub fn new(peer: UserId) -> Self {
        Self {
            peer,
            channel: None,
            state: ChannelState::Pending,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open && self.channel.is_some()
    }

    /// Bind the local or remote channel; ignored once closed
    pub fn attach(&mut self, channel: Arc<dyn DataChannel>) {
        if self.state == ChannelState::Closed {
            return;
        }
        debug!("Data channel '{}' bound to {}", channel.label(), self.peer);
        self.channel = Some(channel);
    }

    /// Returns true if this call opened the channel
    pub fn mark_open(&mut self) -> bool {
        if self.state != ChannelState::Pending || self.channel.is_none() {
            return false;
        }
        self.state = ChannelState::Open;
        true
    }

    /// Returns true if this call closed the channel
    pub async fn close(&mut self) -> bool {
        if self.state == ChannelState::Closed {
            return false;
        }
        self.state = ChannelState::Closed;
        if let Some(channel) = self.channel.take() {
            channel.close().await;
        }
        true
    }

    /// Forward text to the peer
    pub async fn send(&self, text: &str) -> Result<(), ChannelError> {
        match (&self.channel, self.state) {
            (Some(channel), ChannelState::Open) => channel.send_text(text).await,
            _ => Err(ChannelError::NotOpen(self.peer.clone())),
        }
    }
}

/// One chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub sender: UserId,
    pub recipient: UserId,
    pub body: String,
}

/// Ordered message logs keyed by remote peer
#[derive(Debug, Default)]
pub struct MessageLog {
    conversations: HashMap<UserId, Vec<Message>>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a message we sent to `peer`
    pub fn record_sent(&mut self, local: &str, peer: &str, body: &str) {
        self.push(
            peer,
            Message {
                sender: local.to_string(),
                recipient: peer.to_string(),
                body: body.to_string(),
            },
        );
    }

    /// Record a message `peer` sent to us
    pub fn record_received(&mut self, local: &str, peer: &str, body: &str) {
        self.push(
            peer,
            Message {
                sender: peer.to_string(),
                recipient: local.to_string(),
                body: body.to_string(),
            },
        );
    }

    fn push(&mut self, peer: &str, message: Message) {
        self.conversations
            .entry(peer.to_string())
            .or_default()
            .push(message);
    }

    /// Messages exchanged with `peer`, in insertion order
    pub fn conversation(&self, peer: &str) -> &[Message] {
        self.conversations
            .get(peer)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Total number of messages across all peers
    pub fn len(&self) -> usize {
        self.conversations.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
