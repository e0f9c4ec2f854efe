use std::fmt;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::ValidationResult;

/// Identifier of a peer in the room.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message exchanged between peers.
///
/// Serialises as `{"type": "SET_STDOUT", "payload": ...}`. The message type
/// doubles as the state action applied on the receiving side.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// Phase markers (or other job output) produced by a worker.
    SetStdout(String),

    /// The outcome of validating the user's code.
    SetStderr(ValidationResult),

    /// The worker has finished mapping all of its local input.
    MapExecuted,

    /// Aggregation keys assigned to a worker by the coordinator.
    SetReduceKeys(Vec<String>),
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::SetStdout(_) => "SET_STDOUT",
            Message::SetStderr(_) => "SET_STDERR",
            Message::MapExecuted => "MAP_EXECUTED",
            Message::SetReduceKeys(_) => "SET_REDUCE_KEYS",
        }
    }
}

/// Direct-message capability of the transport layer.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Send `message` to exactly one peer.
    async fn send_direct(&self, peer: &PeerId, message: &Message) -> Result<()>;
}

/// A [`Messenger`] that hands every message to an in-process channel.
///
/// The receiving end stands in for the transport: it may forward the
/// messages elsewhere or simply inspect them.
#[derive(Clone, Debug)]
pub struct ChannelMessenger {
    sender: mpsc::UnboundedSender<(PeerId, Message)>,
}

impl ChannelMessenger {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(PeerId, Message)>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl Messenger for ChannelMessenger {
    async fn send_direct(&self, peer: &PeerId, message: &Message) -> Result<()> {
        debug!("sending {} to {peer}", message.kind());
        self.sender
            .send((peer.clone(), message.clone()))
            .map_err(|_| anyhow!("message channel to {peer} is closed"))
    }
}
