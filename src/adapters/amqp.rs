use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueDeclareOptions,
};
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::messaging::{InboundReply, MessageBroker, OutboundMessage, ReplyStream};

const CONSUMER_TAG: &str = "manman-control-plane";

/// RabbitMQ adapter
///
/// Declares the topic exchange and this process's reply queue on connect. The
/// reply queue is exclusive and auto-deleted, so it lives exactly as long as
/// the connection.
pub struct AmqpBroker {
    connection: Connection,
    channel: Channel,
    reply_queue: String,
}

impl AmqpBroker {
    pub async fn connect(url: &str, exchange: &str, reply_queue_prefix: &str) -> Result<Self> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;

        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let queue_name = format!("{}.{}", reply_queue_prefix, Uuid::new_v4());
        let queue = channel
            .queue_declare(
                &queue_name,
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let reply_queue = queue.name().as_str().to_string();
        info!(
            "Connected to broker, exchange '{}', reply queue '{}'",
            exchange, reply_queue
        );

        Ok(Self {
            connection,
            channel,
            reply_queue,
        })
    }

    pub async fn close(&self) -> Result<()> {
        self.channel.close(200, "shutdown").await?;
        self.connection.close(200, "shutdown").await?;
        Ok(())
    }
}

#[async_trait]
impl MessageBroker for AmqpBroker {
    fn reply_queue(&self) -> String {
        self.reply_queue.clone()
    }

    #[instrument(skip(self, message), fields(routing_key = %message.routing_key))]
    async fn publish(&self, message: OutboundMessage) -> Result<()> {
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from("application/json"))
            .with_reply_to(ShortString::from(message.reply_to))
            .with_correlation_id(ShortString::from(message.correlation_id));

        self.channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.payload,
                properties,
            )
            .await?
            .await?;
        Ok(())
    }

    async fn consume_replies(&self) -> Result<ReplyStream> {
        let consumer = self
            .channel
            .basic_consume(
                &self.reply_queue,
                CONSUMER_TAG,
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let replies = consumer.filter_map(|delivery| async move {
            match delivery {
                Ok(delivery) => Some(InboundReply {
                    correlation_id: delivery
                        .properties
                        .correlation_id()
                        .as_ref()
                        .map(|id| id.as_str().to_string()),
                    payload: delivery.data,
                }),
                Err(e) => {
                    warn!("Reply consumer error: {}", e);
                    None
                }
            }
        });
        Ok(replies.boxed())
    }
}
