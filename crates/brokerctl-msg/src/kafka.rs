use crate::{Broker, Inbox};
use async_trait::async_trait;
use brokerctl_core::config::{KafkaConfig, StartOffset};
use brokerctl_core::error::{BackendError, Error, Result};
use brokerctl_core::types::{AckDecision, Backend, Delivery, Destination, Message, Position};
use bytes::Bytes;
use chrono::DateTime;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Header, Headers, Message as _, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, warn};

const HEADER_MESSAGE_ID: &str = "message-id";
const HEADER_CONTENT_TYPE: &str = "content-type";

/// Time allowed for seeks and the final flush.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// Kafka/Redpanda session backed by librdkafka.
pub struct KafkaBroker {
    client_id: String,
    config: KafkaConfig,
    producer: FutureProducer,
}

impl KafkaBroker {
    pub async fn connect(client_id: &str, config: &KafkaConfig) -> Result<Self> {
        info!(
            client_id = client_id,
            brokers = ?config.brokers,
            "connecting to Kafka"
        );

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", config.bootstrap_servers())
            .set("client.id", client_id)
            .set("allow.auto.create.topics", "true")
            .create()
            .map_err(|e| Error::Connection(format!("kafka producer: {e}")))?;

        // librdkafka connects lazily; a metadata round trip proves the cluster is reachable.
        let probe = producer.clone();
        let timeout = config.dial_timeout();
        tokio::task::spawn_blocking(move || {
            probe
                .client()
                .fetch_metadata(None, Timeout::After(timeout))
                .map(|_| ())
        })
        .await
        .map_err(|e| Error::Other(format!("kafka metadata probe panicked: {e}")))?
        .map_err(|e| {
            Error::Connection(format!(
                "kafka brokers {} unreachable: {e}",
                config.bootstrap_servers()
            ))
        })?;

        info!(brokers = %config.bootstrap_servers(), "Kafka connection established");

        Ok(Self {
            client_id: client_id.to_string(),
            config: config.clone(),
            producer,
        })
    }

    fn consumer(&self) -> Result<StreamConsumer> {
        // librdkafka insists on a group id even for manual assignment
        let group_id = self
            .config
            .group_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.client_id, uuid::Uuid::new_v4()));

        ClientConfig::new()
            .set("bootstrap.servers", self.config.bootstrap_servers())
            .set("client.id", &self.client_id)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "true")
            .set(
                "auto.offset.reset",
                match self.config.start_offset {
                    StartOffset::Earliest => "earliest",
                    StartOffset::Latest => "latest",
                },
            )
            .create()
            .map_err(|e| Error::Connection(format!("kafka consumer: {e}")))
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    fn backend(&self) -> Backend {
        Backend::Kafka
    }

    async fn send(
        &self,
        destination: &Destination,
        message: &Message,
    ) -> std::result::Result<(), BackendError> {
        let message_id = message.id().to_string();
        let mut headers = OwnedHeaders::new().insert(Header {
            key: HEADER_MESSAGE_ID,
            value: Some(message_id.as_str()),
        });
        if let Some(content_type) = message.content_type() {
            headers = headers.insert(Header {
                key: HEADER_CONTENT_TYPE,
                value: Some(content_type),
            });
        }

        let mut record = FutureRecord::<[u8], [u8]>::to(destination.as_str())
            .payload(message.payload().as_ref())
            .headers(headers);
        if let Some(key) = message.key() {
            record = record.key(key.as_ref());
        }

        debug!(
            topic = %destination,
            payload_len = message.payload().len(),
            "kafka: producing message"
        );

        match self.producer.send(record, Timeout::Never).await {
            Ok((partition, offset)) => {
                debug!(topic = %destination, partition, offset, "kafka: delivery confirmed");
                Ok(())
            }
            Err((e, _)) => Err(classify(e)),
        }
    }

    async fn subscribe(&self, destination: &Destination) -> Result<Box<dyn Inbox>> {
        let consumer = self.consumer()?;
        let topic = destination.as_str();

        match &self.config.group_id {
            Some(group_id) => {
                info!(topic, group_id = %group_id, "kafka: joining consumer group");
                consumer
                    .subscribe(&[topic])
                    .map_err(|e| Error::FatalStream(classify(e)))?;
            }
            None => {
                let offset = match self.config.start_offset {
                    StartOffset::Earliest => Offset::Beginning,
                    StartOffset::Latest => Offset::End,
                };
                info!(topic, partition = 0, ?offset, "kafka: assigning partition");
                let mut assignment = TopicPartitionList::new();
                assignment
                    .add_partition_offset(topic, 0, offset)
                    .map_err(|e| Error::FatalStream(classify(e)))?;
                consumer
                    .assign(&assignment)
                    .map_err(|e| Error::FatalStream(classify(e)))?;
            }
        }

        Ok(Box::new(KafkaInbox {
            consumer,
            commit_offsets: self.config.group_id.is_some(),
        }))
    }

    async fn list_destinations(&self) -> Result<Vec<String>> {
        let producer = self.producer.clone();
        let timeout = self.config.dial_timeout();
        let metadata = tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(None, Timeout::After(timeout))
        })
        .await
        .map_err(|e| Error::Other(format!("kafka metadata request panicked: {e}")))?
        .map_err(|e| Error::Connection(format!("kafka metadata: {e}")))?;

        let topics: BTreeSet<String> = metadata
            .topics()
            .iter()
            .map(|t| t.name().to_string())
            .collect();
        Ok(topics.into_iter().collect())
    }

    async fn shutdown(&self) -> Result<()> {
        info!(client_id = %self.client_id, "kafka: flushing producer");
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(CONTROL_TIMEOUT)))
            .await
            .map_err(|e| Error::Other(format!("kafka flush panicked: {e}")))?
            .map_err(|e| Error::Other(format!("kafka flush: {e}")))?;
        Ok(())
    }
}

pub struct KafkaInbox {
    consumer: StreamConsumer,
    commit_offsets: bool,
}

#[async_trait]
impl Inbox for KafkaInbox {
    async fn next(&mut self) -> std::result::Result<Delivery, BackendError> {
        match self.consumer.recv().await {
            Ok(message) => Ok(to_delivery(&message)),
            Err(e) => Err(classify(e)),
        }
    }

    async fn settle(
        &mut self,
        delivery: &Delivery,
        decision: AckDecision,
    ) -> std::result::Result<(), BackendError> {
        let Position::Offset { partition, offset } = delivery.position else {
            return Ok(());
        };

        match decision {
            AckDecision::RejectRequeue => {
                debug!(topic = %delivery.destination, partition, offset, "kafka: rewinding for redelivery");
                self.consumer
                    .seek(
                        &delivery.destination,
                        partition,
                        Offset::Offset(offset),
                        CONTROL_TIMEOUT,
                    )
                    .map_err(classify)
            }
            AckDecision::Accept | AckDecision::RejectDiscard if self.commit_offsets => {
                let mut offsets = TopicPartitionList::new();
                offsets
                    .add_partition_offset(&delivery.destination, partition, Offset::Offset(offset + 1))
                    .map_err(classify)?;
                self.consumer
                    .commit(&offsets, CommitMode::Async)
                    .map_err(classify)
            }
            _ => Ok(()),
        }
    }
}

fn to_delivery(message: &BorrowedMessage<'_>) -> Delivery {
    let mut delivery = Delivery::new(
        message.topic(),
        Bytes::copy_from_slice(message.payload().unwrap_or_default()),
    )
    .with_position(Position::Offset {
        partition: message.partition(),
        offset: message.offset(),
    });
    delivery.key = message.key().map(Bytes::copy_from_slice);
    delivery.timestamp = message
        .timestamp()
        .to_millis()
        .and_then(DateTime::from_timestamp_millis);

    if let Some(headers) = message.headers() {
        for header in headers.iter() {
            let value = header
                .value
                .map(|v| String::from_utf8_lossy(v).into_owned());
            match header.key {
                HEADER_MESSAGE_ID => delivery.message_id = value,
                HEADER_CONTENT_TYPE => delivery.content_type = value,
                _ => {}
            }
        }
    }

    delivery
}

/// Map librdkafka errors onto retryable and terminal conditions.
fn classify(err: KafkaError) -> BackendError {
    if let KafkaError::PartitionEOF(partition) = err {
        debug!(partition, "kafka: reached end of partition");
        return BackendError::NoData;
    }

    match err.rdkafka_error_code() {
        Some(code) if is_transient_code(code) => BackendError::Unavailable(err.to_string()),
        Some(RDKafkaErrorCode::PartitionEOF) => BackendError::NoData,
        _ => {
            warn!("kafka: non-retryable error: {err}");
            BackendError::Fatal(err.to_string())
        }
    }
}

fn is_transient_code(code: RDKafkaErrorCode) -> bool {
    matches!(
        code,
        RDKafkaErrorCode::LeaderNotAvailable
            | RDKafkaErrorCode::NotLeaderForPartition
            | RDKafkaErrorCode::UnknownTopicOrPartition
            | RDKafkaErrorCode::RequestTimedOut
            | RDKafkaErrorCode::MessageTimedOut
            | RDKafkaErrorCode::OperationTimedOut
            | RDKafkaErrorCode::BrokerTransportFailure
            | RDKafkaErrorCode::AllBrokersDown
            | RDKafkaErrorCode::NetworkException
            | RDKafkaErrorCode::NotEnoughReplicas
            | RDKafkaErrorCode::NotEnoughReplicasAfterAppend
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::{Publisher, RetryPolicy};

    #[test]
    fn test_leader_not_available_is_transient() {
        let err = KafkaError::MessageProduction(RDKafkaErrorCode::LeaderNotAvailable);
        assert!(classify(err).is_transient());

        let err = KafkaError::MessageProduction(RDKafkaErrorCode::RequestTimedOut);
        assert!(classify(err).is_transient());
    }

    #[test]
    fn test_partition_eof_means_no_data() {
        assert_eq!(classify(KafkaError::PartitionEOF(0)), BackendError::NoData);
    }

    #[test]
    fn test_authorization_failure_is_fatal() {
        let err = KafkaError::MessageProduction(RDKafkaErrorCode::TopicAuthorizationFailed);
        assert!(matches!(classify(err), BackendError::Fatal(_)));
    }

    // Integration test, requires a running Kafka broker.
    // Run with: cargo test -p brokerctl-msg kafka_roundtrip -- --ignored
    #[tokio::test]
    #[ignore]
    async fn test_kafka_roundtrip() {
        let config = KafkaConfig::default();
        let broker = KafkaBroker::connect("brokerctl-test", &config)
            .await
            .expect("failed to connect to Kafka");
        let topic = Destination::new(format!("brokerctl-test-{}", uuid::Uuid::new_v4())).unwrap();

        Publisher::new(&broker, RetryPolicy::default())
            .publish(&topic, &Message::new("hello-world"))
            .await
            .expect("failed to publish");

        let mut inbox = broker.subscribe(&topic).await.expect("failed to subscribe");
        let received = loop {
            match tokio::time::timeout(Duration::from_secs(10), inbox.next())
                .await
                .expect("timeout waiting for message")
            {
                Ok(delivery) => break delivery,
                Err(BackendError::NoData) => continue,
                Err(e) => panic!("receive failed: {e}"),
            }
        };
        assert_eq!(received.payload.as_ref(), b"hello-world");

        broker.shutdown().await.unwrap();
    }
}
