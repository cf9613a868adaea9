//! Message bus seam
//!
//! The control plane publishes commands to a topic exchange and receives host
//! agent replies on a single per-process reply queue. `MessageBroker` hides the
//! transport: `AmqpBroker` (see `adapters`) talks AMQP, `InMemoryBroker` loops
//! messages back inside the process.

pub mod commands;
pub mod memory;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;

pub use commands::{
    routing_key, CommandReply, GameConfigPayload, HostAction, SendInputCommand,
    ServerGameConfigPayload, StartSessionCommand, StopSessionCommand,
};
pub use memory::InMemoryBroker;

/// Stream of replies arriving on the reply queue
pub type ReplyStream = BoxStream<'static, InboundReply>;

/// A command ready to be put on the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub reply_to: String,
    pub correlation_id: String,
    pub payload: Vec<u8>,
}

/// A raw message taken off the reply queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundReply {
    /// `correlation_id` message property, when the sender set one
    pub correlation_id: Option<String>,
    pub payload: Vec<u8>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Name of this process's reply queue
    fn reply_queue(&self) -> String;

    async fn publish(&self, message: OutboundMessage) -> Result<()>;

    /// Start consuming the reply queue. Called once per process.
    async fn consume_replies(&self) -> Result<ReplyStream>;
}
