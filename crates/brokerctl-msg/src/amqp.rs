use crate::{Broker, Inbox};
use async_trait::async_trait;
use brokerctl_core::config::{AmqpConfig, ExchangeKind};
use brokerctl_core::error::{BackendError, Error, Result};
use brokerctl_core::types::{AckDecision, Backend, Delivery, Destination, Message, Position};
use bytes::Bytes;
use chrono::DateTime;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use std::collections::HashMap;
use tracing::{debug, info, warn};

const DEFAULT_CONTENT_TYPE: &str = "application/json";
/// AMQP delivery mode 2 = persistent
const PERSISTENT: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

/// RabbitMQ session: one connection, one channel in publisher-confirm mode.
pub struct AmqpBroker {
    client_id: String,
    config: AmqpConfig,
    connection: Connection,
    channel: Channel,
}

impl AmqpBroker {
    pub async fn connect(client_id: &str, config: &AmqpConfig) -> Result<Self> {
        let uri = config.connection_uri()?;
        // config.url never carries the configured password, so it is safe to log
        info!(client_id = client_id, url = %config.url, "connecting to AMQP broker");

        let connection = tokio::time::timeout(
            config.dial_timeout(),
            Connection::connect(&uri, ConnectionProperties::default()),
        )
        .await
        .map_err(|_| {
            Error::Connection(format!(
                "amqp broker {} did not answer within {:?}",
                config.url,
                config.dial_timeout()
            ))
        })?
        .map_err(|e| Error::Connection(format!("amqp broker {}: {e}", config.url)))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| Error::Connection(format!("amqp channel: {e}")))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| Error::Connection(format!("amqp confirm mode: {e}")))?;

        info!(url = %config.url, "AMQP connection established");

        Ok(Self {
            client_id: client_id.to_string(),
            config: config.clone(),
            connection,
            channel,
        })
    }

    async fn declare_exchange(&self, exchange: &str) -> lapin::Result<()> {
        let kind = match self.config.exchange_kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        };
        self.channel
            .exchange_declare(
                exchange,
                kind,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    fn backend(&self) -> Backend {
        Backend::Amqp
    }

    async fn send(
        &self,
        destination: &Destination,
        message: &Message,
    ) -> std::result::Result<(), BackendError> {
        let exchange = destination.as_str();
        let routing_key = self.config.routing_key(exchange);
        self.declare_exchange(exchange).await.map_err(classify)?;

        let properties = BasicProperties::default()
            .with_content_type(message.content_type().unwrap_or(DEFAULT_CONTENT_TYPE).to_string().into())
            .with_delivery_mode(PERSISTENT)
            .with_message_id(message.id().to_string().into())
            .with_app_id(self.client_id.clone().into())
            .with_timestamp(chrono::Utc::now().timestamp() as u64);

        debug!(
            exchange,
            routing_key,
            payload_len = message.payload().len(),
            "amqp: publishing message"
        );

        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                message.payload().as_ref(),
                properties,
            )
            .await
            .map_err(classify)?
            .await
            .map_err(classify)?;

        match confirmation {
            Confirmation::Nack(_) => Err(BackendError::Unavailable(format!(
                "broker rejected message for exchange {exchange}"
            ))),
            _ => Ok(()),
        }
    }

    async fn subscribe(&self, destination: &Destination) -> Result<Box<dyn Inbox>> {
        let exchange = destination.as_str();
        let queue = self.config.queue_name(exchange);
        let routing_key = self.config.routing_key(exchange);
        let setup = |e: lapin::Error| Error::FatalStream(classify(e));

        self.declare_exchange(exchange).await.map_err(setup)?;
        self.channel
            .queue_declare(
                &queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(setup)?;
        self.channel
            .queue_bind(
                &queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(setup)?;
        self.channel
            .basic_qos(self.config.prefetch, BasicQosOptions::default())
            .await
            .map_err(setup)?;

        let consumer = self
            .channel
            .basic_consume(
                &queue,
                &self.client_id,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(setup)?;

        info!(exchange, queue = %queue, routing_key, "amqp: consuming");

        Ok(Box::new(AmqpInbox {
            consumer,
            pending: HashMap::new(),
        }))
    }

    async fn shutdown(&self) -> Result<()> {
        info!(client_id = %self.client_id, "amqp: closing connection");
        if let Err(e) = self.channel.close(REPLY_SUCCESS, "bye").await {
            debug!("amqp: channel close: {e}");
        }
        self.connection
            .close(REPLY_SUCCESS, "bye")
            .await
            .map_err(|e| Error::Other(format!("amqp connection close: {e}")))
    }
}

pub struct AmqpInbox {
    consumer: Consumer,
    /// Ackers for deliveries handed out but not yet settled, by delivery tag
    pending: HashMap<u64, Acker>,
}

#[async_trait]
impl Inbox for AmqpInbox {
    async fn next(&mut self) -> std::result::Result<Delivery, BackendError> {
        let message = match self.consumer.next().await {
            None => return Err(BackendError::EndOfStream),
            Some(Err(e)) => return Err(classify(e)),
            Some(Ok(message)) => message,
        };

        let tag = message.delivery_tag;
        let mut delivery = Delivery::new(message.exchange.as_str(), Bytes::from(message.data))
            .with_position(Position::Tag(tag));
        delivery.content_type = message
            .properties
            .content_type()
            .as_ref()
            .map(|s| s.as_str().to_string());
        delivery.message_id = message
            .properties
            .message_id()
            .as_ref()
            .map(|s| s.as_str().to_string());
        delivery.timestamp = message
            .properties
            .timestamp()
            .and_then(|secs| DateTime::from_timestamp(secs as i64, 0));

        self.pending.insert(tag, message.acker);
        Ok(delivery)
    }

    async fn settle(
        &mut self,
        delivery: &Delivery,
        decision: AckDecision,
    ) -> std::result::Result<(), BackendError> {
        let Position::Tag(tag) = delivery.position else {
            return Ok(());
        };
        let Some(acker) = self.pending.remove(&tag) else {
            warn!(tag, "amqp: settle for unknown delivery tag");
            return Ok(());
        };

        let result = match decision {
            AckDecision::Accept => acker.ack(BasicAckOptions::default()).await,
            AckDecision::RejectDiscard => {
                acker
                    .nack(BasicNackOptions {
                        requeue: false,
                        ..BasicNackOptions::default()
                    })
                    .await
            }
            AckDecision::RejectRequeue => {
                acker
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..BasicNackOptions::default()
                    })
                    .await
            }
        };
        result.map_err(classify)
    }
}

fn classify(err: lapin::Error) -> BackendError {
    match &err {
        lapin::Error::IOError(_) | lapin::Error::InvalidConnectionState(_) => {
            BackendError::Unavailable(err.to_string())
        }
        _ => BackendError::Fatal(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::{Publisher, RetryPolicy};
    use std::time::Duration;

    #[test]
    fn test_io_errors_are_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = lapin::Error::IOError(std::sync::Arc::new(io));
        assert!(classify(err).is_transient());
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_connection_error() {
        let config = AmqpConfig {
            url: "amqp://127.0.0.1:1/%2f".into(),
            dial_timeout_secs: 2,
            ..AmqpConfig::default()
        };
        let err = AmqpBroker::connect("brokerctl-test", &config)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Connection(_)));
    }

    // Integration test, requires a running RabbitMQ broker.
    // Run with: cargo test -p brokerctl-msg amqp_roundtrip -- --ignored
    #[tokio::test]
    #[ignore]
    async fn test_amqp_roundtrip() {
        let config = AmqpConfig {
            username: Some("myuser".into()),
            password: Some("mypassword".into()),
            ..AmqpConfig::default()
        };
        let broker = AmqpBroker::connect("brokerctl-test", &config)
            .await
            .expect("failed to connect to RabbitMQ");
        let exchange = Destination::new("orders").unwrap();

        // the queue must exist and be bound before the publish
        let mut inbox = broker.subscribe(&exchange).await.expect("failed to subscribe");

        Publisher::new(&broker, RetryPolicy::default())
            .publish(&exchange, &Message::new("hello-world"))
            .await
            .expect("failed to publish");

        let received = tokio::time::timeout(Duration::from_secs(5), inbox.next())
            .await
            .expect("timeout waiting for message")
            .expect("consumer closed");
        assert_eq!(received.payload.as_ref(), b"hello-world");
        assert_eq!(received.content_type.as_deref(), Some("application/json"));
        inbox.settle(&received, AckDecision::Accept).await.unwrap();

        broker.shutdown().await.unwrap();
    }
}
