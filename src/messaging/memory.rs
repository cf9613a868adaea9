//! Loopback broker for tests and single-process development
//!
//! Every published message is recorded. An optional responder plays the part
//! of the host agent: it sees each message and may answer it on the reply
//! queue. Replies can also be injected by hand to simulate late or stray
//! deliveries.

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, Mutex, RwLock};

use super::{CommandReply, InboundReply, MessageBroker, OutboundMessage, ReplyStream};
use crate::error::{ManmanError, Result};

pub type Responder = Box<dyn Fn(&OutboundMessage) -> Option<CommandReply> + Send + Sync>;

pub struct InMemoryBroker {
    reply_queue: String,
    published: Mutex<Vec<OutboundMessage>>,
    reply_tx: mpsc::UnboundedSender<InboundReply>,
    reply_rx: Mutex<Option<mpsc::UnboundedReceiver<InboundReply>>>,
    responder: RwLock<Option<Responder>>,
    fail_publish: AtomicBool,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Broker with no responder: every call waits until a reply is injected
    pub fn new() -> Self {
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        Self {
            reply_queue: "manman.replies.memory".to_string(),
            published: Mutex::new(Vec::new()),
            reply_tx,
            reply_rx: Mutex::new(Some(reply_rx)),
            responder: RwLock::new(None),
            fail_publish: AtomicBool::new(false),
        }
    }

    /// Broker whose host agent acknowledges every command
    pub fn acknowledging() -> Self {
        let mut broker = Self::new();
        let responder: Responder = Box::new(|msg: &OutboundMessage| {
            Some(CommandReply::ok(msg.correlation_id.clone()))
        });
        broker.responder = RwLock::new(Some(responder));
        broker
    }

    pub async fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&OutboundMessage) -> Option<CommandReply> + Send + Sync + 'static,
    {
        *self.responder.write().await = Some(Box::new(responder));
    }

    pub async fn clear_responder(&self) {
        *self.responder.write().await = None;
    }

    /// Make subsequent publishes fail as if the broker were unreachable
    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Put a raw message on the reply queue
    pub fn inject_reply(&self, reply: InboundReply) {
        // The receiver only goes away with the broker itself
        let _ = self.reply_tx.send(reply);
    }

    /// Answer a command the way a host agent would
    pub fn reply_to(&self, reply: &CommandReply) -> Result<()> {
        self.inject_reply(InboundReply {
            correlation_id: Some(reply.correlation_id.clone()),
            payload: serde_json::to_vec(reply)?,
        });
        Ok(())
    }

    pub async fn published(&self) -> Vec<OutboundMessage> {
        self.published.lock().await.clone()
    }

    /// Published messages whose routing key ends with `.<action>`
    pub async fn published_with_suffix(&self, suffix: &str) -> Vec<OutboundMessage> {
        self.published
            .lock()
            .await
            .iter()
            .filter(|m| m.routing_key.ends_with(suffix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    fn reply_queue(&self) -> String {
        self.reply_queue.clone()
    }

    async fn publish(&self, message: OutboundMessage) -> Result<()> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(ManmanError::Publish(format!(
                "broker unavailable for {}",
                message.routing_key
            )));
        }

        let reply = self
            .responder
            .read()
            .await
            .as_ref()
            .and_then(|respond| respond(&message));
        self.published.lock().await.push(message);

        if let Some(reply) = reply {
            self.reply_to(&reply)?;
        }
        Ok(())
    }

    async fn consume_replies(&self) -> Result<ReplyStream> {
        let rx = self.reply_rx.lock().await.take().ok_or_else(|| {
            ManmanError::Internal("reply queue already has a consumer".to_string())
        })?;

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|reply| (reply, rx))
        });
        Ok(stream.boxed())
    }
}
