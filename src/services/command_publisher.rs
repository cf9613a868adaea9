//! Command Publisher: request/reply over a fire-and-forget bus
//!
//! Each call registers a single-slot waiter under a fresh correlation id
//! *before* publishing, then waits for the reply, a timeout, or cancellation.
//! One background loop per process drains the reply queue and hands each
//! reply to its waiter without ever blocking on it.
//!
//! Registry entries are owned by a `PendingReply` guard, so every exit path
//! (reply, timeout, cancellation, publish error, or the caller dropping the
//! future) removes the entry exactly once.

use dashmap::DashMap;
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::error::{ManmanError, Result};
use crate::messaging::{
    routing_key, CommandReply, HostAction, InboundReply, MessageBroker, OutboundMessage,
    ReplyStream,
};

/// What happened to a reply handed to the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// No waiter registered (already timed out, or never ours)
    Unmatched(String),
    /// Waiter was registered but has stopped listening
    Abandoned(String),
}

/// correlation id -> waiting caller
#[derive(Default)]
pub struct ReplyRegistry {
    waiters: DashMap<String, oneshot::Sender<CommandReply>>,
}

impl ReplyRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(self: &Arc<Self>, correlation_id: impl Into<String>) -> PendingReply {
        let correlation_id = correlation_id.into();
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(correlation_id.clone(), tx);
        PendingReply {
            correlation_id,
            registry: Arc::clone(self),
            rx,
        }
    }

    /// Hand a reply to its waiter. Never blocks.
    pub fn deliver(&self, reply: CommandReply) -> Delivery {
        match self.waiters.remove(&reply.correlation_id) {
            Some((id, tx)) => match tx.send(reply) {
                Ok(()) => Delivery::Delivered,
                Err(_) => Delivery::Abandoned(id),
            },
            None => Delivery::Unmatched(reply.correlation_id),
        }
    }

    /// Returns whether an entry was present
    pub fn remove(&self, correlation_id: &str) -> bool {
        self.waiters.remove(correlation_id).is_some()
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.waiters.contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

/// A registered waiter; deregisters itself when dropped
pub struct PendingReply {
    correlation_id: String,
    registry: Arc<ReplyRegistry>,
    rx: oneshot::Receiver<CommandReply>,
}

impl PendingReply {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Wait for the reply, giving up on timeout or when any token fires
    pub async fn wait(
        mut self,
        action: HostAction,
        timeout: Duration,
        cancel: &CancellationToken,
        shutdown: &CancellationToken,
    ) -> Result<CommandReply> {
        let started = Instant::now();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ManmanError::Cancelled),
            _ = shutdown.cancelled() => Err(ManmanError::Cancelled),
            reply = &mut self.rx => reply.map_err(|_| {
                ManmanError::Internal(format!(
                    "reply channel for {} closed without a reply",
                    self.correlation_id
                ))
            }),
            _ = tokio::time::sleep(timeout) => Err(ManmanError::Timeout {
                action: action.as_str().to_string(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            }),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.registry.remove(&self.correlation_id);
    }
}

/// Publishes host commands and waits for their replies
pub struct CommandPublisher {
    broker: Arc<dyn MessageBroker>,
    exchange: String,
    reply_queue: String,
    registry: Arc<ReplyRegistry>,
    shutdown: CancellationToken,
    /// Fired by the reply loop when the reply stream ends on its own
    consumer_lost: CancellationToken,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl CommandPublisher {
    /// Start consuming the broker's reply queue and return the publisher.
    /// Create one per process.
    pub async fn start(
        broker: Arc<dyn MessageBroker>,
        exchange: impl Into<String>,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>> {
        let replies = broker.consume_replies().await?;
        let registry = ReplyRegistry::new();
        let reply_queue = broker.reply_queue();
        let consumer_lost = CancellationToken::new();

        let consumer = tokio::spawn(run_reply_loop(
            replies,
            Arc::clone(&registry),
            shutdown.clone(),
            consumer_lost.clone(),
        ));
        info!("Command publisher consuming replies on '{}'", reply_queue);

        Ok(Arc::new(Self {
            broker,
            exchange: exchange.into(),
            reply_queue,
            registry,
            shutdown,
            consumer_lost,
            consumer: Mutex::new(Some(consumer)),
        }))
    }

    pub fn registry(&self) -> &Arc<ReplyRegistry> {
        &self.registry
    }

    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    /// False once the reply stream has ended; calls then fail fast
    pub fn is_consuming(&self) -> bool {
        !self.consumer_lost.is_cancelled()
    }

    /// Publish `payload` to the host and wait up to `timeout` for its reply.
    ///
    /// Returns the agent's reply as-is; interpreting `success` is up to the
    /// caller.
    #[instrument(skip(self, payload, cancel), fields(action = %action))]
    pub async fn call<T>(
        &self,
        server_id: i64,
        action: HostAction,
        payload: &T,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandReply>
    where
        T: Serialize + Sync + ?Sized,
    {
        if !self.is_consuming() {
            return Err(reply_consumer_lost());
        }
        let body = serde_json::to_vec(payload)?;
        let correlation_id = Uuid::new_v4().to_string();
        let pending = self.registry.register(correlation_id.clone());

        let message = OutboundMessage {
            exchange: self.exchange.clone(),
            routing_key: routing_key(server_id, action),
            reply_to: self.reply_queue.clone(),
            correlation_id,
            payload: body,
        };
        debug!(
            "Publishing {} to {} (correlation {})",
            action,
            message.routing_key,
            pending.correlation_id()
        );
        self.broker.publish(message).await?;

        tokio::select! {
            biased;
            _ = self.consumer_lost.cancelled() => Err(reply_consumer_lost()),
            reply = pending.wait(action, timeout, cancel, &self.shutdown) => reply,
        }
    }

    /// Stop the reply loop and wait for it to exit
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.consumer.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("Reply consumer task failed: {}", e);
            }
        }
    }
}

fn reply_consumer_lost() -> ManmanError {
    ManmanError::Internal("reply consumer stopped, no replies can arrive".to_string())
}

/// Decode a raw reply, preferring the message property for the correlation id
pub fn decode_reply(raw: InboundReply) -> Result<CommandReply> {
    let mut reply: CommandReply = serde_json::from_slice(&raw.payload)?;
    if let Some(id) = raw.correlation_id.filter(|id| !id.is_empty()) {
        reply.correlation_id = id;
    }
    if reply.correlation_id.is_empty() {
        return Err(ManmanError::InvalidArgument(
            "reply carries no correlation id".to_string(),
        ));
    }
    Ok(reply)
}

async fn run_reply_loop(
    mut replies: ReplyStream,
    registry: Arc<ReplyRegistry>,
    shutdown: CancellationToken,
    consumer_lost: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = replies.next() => next,
        };
        let Some(raw) = next else {
            error!("Reply stream ended, host replies will no longer be received");
            consumer_lost.cancel();
            break;
        };

        match decode_reply(raw) {
            Ok(reply) => match registry.deliver(reply) {
                Delivery::Delivered => {}
                Delivery::Unmatched(id) => {
                    debug!("Dropping reply with no waiter (correlation {})", id)
                }
                Delivery::Abandoned(id) => {
                    debug!("Dropping reply for abandoned waiter (correlation {})", id)
                }
            },
            Err(e) => warn!("Dropping undecodable reply: {}", e),
        }
    }
    info!("Reply consumer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{InMemoryBroker, MockMessageBroker};

    async fn publisher(broker: Arc<InMemoryBroker>) -> Arc<CommandPublisher> {
        CommandPublisher::start(broker, "manman", CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_call_receives_reply() {
        let broker = Arc::new(InMemoryBroker::acknowledging());
        let publisher = publisher(broker.clone()).await;

        let reply = publisher
            .call(
                1,
                HostAction::Start,
                &serde_json::json!({"session_id": 1}),
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(reply.success);
        let published = broker.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].routing_key, "command.host.1.session.start");
        assert_eq!(published[0].exchange, "manman");
        assert_eq!(published[0].reply_to, broker.reply_queue());
        assert_eq!(published[0].correlation_id, reply.correlation_id);
        assert!(publisher.registry().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_then_late_reply_is_dropped() {
        let broker = Arc::new(InMemoryBroker::new());
        let publisher = publisher(broker.clone()).await;

        let err = publisher
            .call(
                1,
                HostAction::Stop,
                &serde_json::json!({}),
                Duration::from_millis(30),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ManmanError::Timeout { .. }));
        assert!(publisher.registry().is_empty());

        // A second waiter is in flight when the stale reply lands
        let other = publisher.registry().register("other-call");
        let stale = broker.published().await[0].correlation_id.clone();
        broker.reply_to(&CommandReply::ok(stale)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(publisher.registry().contains("other-call"));
        drop(other);
        assert!(publisher.registry().is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_unblocks_immediately() {
        let broker = Arc::new(InMemoryBroker::new());
        let publisher = publisher(broker).await;
        let cancel = CancellationToken::new();

        let call = {
            let publisher = publisher.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                publisher
                    .call(
                        1,
                        HostAction::Start,
                        &serde_json::json!({}),
                        Duration::from_secs(120),
                        &cancel,
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), call)
            .await
            .expect("cancel did not unblock the call")
            .unwrap();
        assert!(matches!(result, Err(ManmanError::Cancelled)));
        assert!(publisher.registry().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_call_deregisters() {
        let broker = Arc::new(InMemoryBroker::new());
        let publisher = publisher(broker).await;

        let payload = serde_json::json!({});
        let cancel = CancellationToken::new();
        let call = publisher.call(
            1,
            HostAction::Start,
            &payload,
            Duration::from_secs(120),
            &cancel,
        );
        let _ = tokio::time::timeout(Duration::from_millis(20), call).await;
        assert!(publisher.registry().is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_deregisters() {
        let mut broker = MockMessageBroker::new();
        broker
            .expect_reply_queue()
            .return_const("manman.replies.test".to_string());
        broker
            .expect_consume_replies()
            .returning(|| Ok(futures::stream::pending::<InboundReply>().boxed()));
        broker
            .expect_publish()
            .times(1)
            .returning(|_| Err(ManmanError::Publish("connection reset".to_string())));

        let publisher = CommandPublisher::start(Arc::new(broker), "manman", CancellationToken::new())
            .await
            .unwrap();
        let err = publisher
            .call(
                3,
                HostAction::SendInput,
                &serde_json::json!({}),
                Duration::from_secs(10),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ManmanError::Publish(_)));
        assert!(publisher.registry().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_calls_get_their_own_replies() {
        let broker = Arc::new(InMemoryBroker::new());
        broker
            .set_responder(|msg| {
                let body: serde_json::Value = serde_json::from_slice(&msg.payload).ok()?;
                let n = body["n"].as_i64()?;
                // Odd calls fail so each caller can tell its reply apart
                if n % 2 == 0 {
                    Some(CommandReply::ok(msg.correlation_id.clone()))
                } else {
                    Some(CommandReply::failed(msg.correlation_id.clone(), format!("call {n}")))
                }
            })
            .await;
        let publisher = publisher(broker).await;

        let mut handles = Vec::new();
        for n in 0..10i64 {
            let publisher = publisher.clone();
            handles.push(tokio::spawn(async move {
                let reply = publisher
                    .call(
                        n,
                        HostAction::Start,
                        &serde_json::json!({ "n": n }),
                        Duration::from_secs(5),
                        &CancellationToken::new(),
                    )
                    .await
                    .unwrap();
                (n, reply)
            }));
        }

        for handle in handles {
            let (n, reply) = handle.await.unwrap();
            assert_eq!(reply.success, n % 2 == 0);
            if n % 2 == 1 {
                assert_eq!(reply.error_message(), format!("call {n}"));
            }
        }
        assert!(publisher.registry().is_empty());
    }

    #[tokio::test]
    async fn test_calls_fail_fast_after_reply_stream_ends() {
        let mut broker = MockMessageBroker::new();
        broker
            .expect_reply_queue()
            .return_const("manman.replies.test".to_string());
        broker
            .expect_consume_replies()
            .returning(|| Ok(futures::stream::empty::<InboundReply>().boxed()));
        broker.expect_publish().times(0);

        let publisher = CommandPublisher::start(Arc::new(broker), "manman", CancellationToken::new())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while publisher.is_consuming() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("reply loop noticed the closed stream");

        let err = tokio::time::timeout(
            Duration::from_secs(1),
            publisher.call(
                1,
                HostAction::Start,
                &serde_json::json!({}),
                Duration::from_secs(120),
                &CancellationToken::new(),
            ),
        )
        .await
        .expect("call returned before its timeout")
        .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Internal);
        assert!(publisher.registry().is_empty());
    }

    #[tokio::test]
    async fn test_in_flight_call_fails_when_reply_stream_ends() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<InboundReply>();
        let rx = std::sync::Mutex::new(Some(rx));
        let mut broker = MockMessageBroker::new();
        broker
            .expect_reply_queue()
            .return_const("manman.replies.test".to_string());
        broker.expect_consume_replies().returning(move || {
            let rx = rx.lock().unwrap().take().expect("consumed once");
            Ok(futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|reply| (reply, rx))
            })
            .boxed())
        });
        broker.expect_publish().times(1).returning(|_| Ok(()));

        let publisher = CommandPublisher::start(Arc::new(broker), "manman", CancellationToken::new())
            .await
            .unwrap();
        let call = {
            let publisher = publisher.clone();
            tokio::spawn(async move {
                publisher
                    .call(
                        1,
                        HostAction::Stop,
                        &serde_json::json!({}),
                        Duration::from_secs(60),
                        &CancellationToken::new(),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(tx);

        let result = tokio::time::timeout(Duration::from_secs(1), call)
            .await
            .expect("closed stream did not unblock the call")
            .unwrap();
        assert!(matches!(result, Err(ManmanError::Internal(_))));
        assert!(!publisher.is_consuming());
        assert!(publisher.registry().is_empty());
    }

    #[test]
    fn test_decode_reply_prefers_property() {
        let reply = decode_reply(InboundReply {
            correlation_id: Some("from-property".to_string()),
            payload: br#"{"success": true, "correlation_id": "from-body"}"#.to_vec(),
        })
        .unwrap();
        assert_eq!(reply.correlation_id, "from-property");

        let reply = decode_reply(InboundReply {
            correlation_id: None,
            payload: br#"{"success": true, "correlation_id": "from-body"}"#.to_vec(),
        })
        .unwrap();
        assert_eq!(reply.correlation_id, "from-body");

        assert!(decode_reply(InboundReply {
            correlation_id: None,
            payload: br#"{"success": true}"#.to_vec(),
        })
        .is_err());
    }

    #[test]
    fn test_registry_delivery_outcomes() {
        let registry = ReplyRegistry::new();
        assert_eq!(
            registry.deliver(CommandReply::ok("nobody")),
            Delivery::Unmatched("nobody".to_string())
        );

        let pending = registry.register("abc");
        assert_eq!(registry.deliver(CommandReply::ok("abc")), Delivery::Delivered);
        // Duplicate reply for the same id finds no waiter
        assert_eq!(
            registry.deliver(CommandReply::ok("abc")),
            Delivery::Unmatched("abc".to_string())
        );
        drop(pending);
        assert!(registry.is_empty());
    }
}
