pub mod amqp;
pub mod kafka;
pub mod memory;
pub mod mqtt;
pub mod publisher;
pub mod sink;
pub mod subscriber;

use async_trait::async_trait;
use brokerctl_core::config::Config;
use brokerctl_core::error::{BackendError, Error, Result};
use brokerctl_core::types::{AckDecision, Backend, Delivery, Destination, Message};
use std::sync::Arc;
use tracing::info;

pub use publisher::{PublishReceipt, Publisher, RetryPolicy};
pub use sink::ConsoleSink;
pub use subscriber::{DeliveryHandler, ReceivePolicy, SubscribeSummary, Subscriber, SubscriberState};

/// An open session to one broker.
/// Implementations wrap Kafka, MQTT, AMQP, or an in-process log.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    fn backend(&self) -> Backend;

    /// Make a single delivery attempt. Retries are the publisher's job.
    async fn send(
        &self,
        destination: &Destination,
        message: &Message,
    ) -> std::result::Result<(), BackendError>;

    /// Start consuming from a destination.
    async fn subscribe(&self, destination: &Destination) -> Result<Box<dyn Inbox>>;

    /// Names of the destinations the broker knows about.
    async fn list_destinations(&self) -> Result<Vec<String>> {
        Err(Error::Config(format!(
            "listing destinations is not supported by {}",
            self.backend()
        )))
    }

    /// Close the session. Always called on the path that opened it.
    async fn shutdown(&self) -> Result<()>;
}

/// Source of deliveries for one subscription.
#[async_trait]
pub trait Inbox: Send {
    /// Wait for the next delivery. `BackendError::EndOfStream` means no more will arrive.
    async fn next(&mut self) -> std::result::Result<Delivery, BackendError>;

    /// Report the subscriber's verdict. Backends without manual acknowledgment ignore it.
    async fn settle(
        &mut self,
        _delivery: &Delivery,
        _decision: AckDecision,
    ) -> std::result::Result<(), BackendError> {
        Ok(())
    }
}

/// Open a session to the backend selected in the configuration.
pub async fn connect(config: &Config) -> Result<Arc<dyn Broker>> {
    info!(backend = %config.backend, client_id = %config.client_id, "opening broker session");

    let broker: Arc<dyn Broker> = match config.backend {
        Backend::Kafka => Arc::new(kafka::KafkaBroker::connect(&config.client_id, &config.kafka).await?),
        Backend::Mqtt => Arc::new(
            mqtt::MqttBroker::connect(
                &config.client_id,
                &config.mqtt,
                std::time::Duration::from_millis(config.subscribe.retry_pause_ms),
            )
            .await?,
        ),
        Backend::Amqp => Arc::new(amqp::AmqpBroker::connect(&config.client_id, &config.amqp).await?),
        Backend::Memory => Arc::new(memory::MemoryBroker::new()),
    };

    Ok(broker)
}
