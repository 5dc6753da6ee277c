use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// Broker backends the façade can talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Kafka,
    Mqtt,
    Amqp,
    Memory,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Kafka => write!(f, "kafka"),
            Backend::Mqtt => write!(f, "mqtt"),
            Backend::Amqp => write!(f, "amqp"),
            Backend::Memory => write!(f, "memory"),
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "kafka" | "redpanda" => Ok(Backend::Kafka),
            "mqtt" => Ok(Backend::Mqtt),
            "amqp" | "rabbitmq" => Ok(Backend::Amqp),
            "memory" => Ok(Backend::Memory),
            _ => Err(Error::Config(format!("unknown backend: {s}"))),
        }
    }
}

/// A named logical channel: a Kafka topic, an MQTT topic, or an AMQP exchange.
///
/// The same name is used as the AMQP routing/binding key, so it is validated once
/// here and never rewritten by the adapters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Destination(String);

impl Destination {
    pub fn new(name: impl Into<String>) -> Result<Self, Error> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::Config("destination name must not be empty".into()));
        }
        if name.trim() != name {
            return Err(Error::Config(format!(
                "destination name has surrounding whitespace: {name:?}"
            )));
        }
        if name.contains('\0') {
            return Err(Error::Config("destination name contains NUL".into()));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Destination {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Destination::new(value)
    }
}

impl From<Destination> for String {
    fn from(d: Destination) -> Self {
        d.0
    }
}

/// Outgoing message. Immutable once built; the id survives retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    id: Uuid,
    payload: Bytes,
    key: Option<Bytes>,
    content_type: Option<String>,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload: payload.into(),
            key: None,
            content_type: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn key(&self) -> Option<&Bytes> {
        self.key.as_ref()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }
}

/// Backend-specific position of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    /// Kafka partition and offset
    Offset { partition: i32, offset: i64 },
    /// AMQP delivery tag
    Tag(u64),
    /// Sequence number in the in-memory log
    Sequence(u64),
    None,
}

/// A message as received by a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub destination: String,
    pub payload: Bytes,
    pub key: Option<Bytes>,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    pub position: Position,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Delivery {
    pub fn new(destination: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            destination: destination.into(),
            payload: payload.into(),
            key: None,
            content_type: None,
            message_id: None,
            position: Position::None,
            timestamp: None,
        }
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.position = position;
        self
    }

    /// Payload as text, with invalid UTF-8 replaced.
    pub fn payload_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Subscriber verdict for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AckDecision {
    #[default]
    Accept,
    RejectDiscard,
    RejectRequeue,
}

impl std::fmt::Display for AckDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AckDecision::Accept => write!(f, "accept"),
            AckDecision::RejectDiscard => write!(f, "reject-discard"),
            AckDecision::RejectRequeue => write!(f, "reject-requeue"),
        }
    }
}

impl std::str::FromStr for AckDecision {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accept" | "ack" => Ok(AckDecision::Accept),
            "reject-discard" | "nack-discard" => Ok(AckDecision::RejectDiscard),
            "reject-requeue" | "nack-requeue" => Ok(AckDecision::RejectRequeue),
            _ => Err(Error::Config(format!("unknown ack decision: {s}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_validation() {
        assert_eq!(Destination::new("orders").unwrap().as_str(), "orders");
        assert!(Destination::new("").is_err());
        assert!(Destination::new(" orders").is_err());
        assert!(Destination::new("ord\0ers").is_err());
    }

    #[test]
    fn test_destination_deserialize_rejects_empty() {
        let ok: Destination = serde_json::from_str("\"orders\"").unwrap();
        assert_eq!(ok.to_string(), "orders");
        assert!(serde_json::from_str::<Destination>("\"\"").is_err());
    }

    #[test]
    fn test_message_builder() {
        let msg = Message::new("hello-world")
            .with_key("k1")
            .with_content_type("text/plain");
        assert_eq!(msg.payload().as_ref(), b"hello-world");
        assert_eq!(msg.key().map(|k| k.as_ref()), Some(&b"k1"[..]));
        assert_eq!(msg.content_type(), Some("text/plain"));

        let clone = msg.clone();
        assert_eq!(clone.id(), msg.id());
        assert_ne!(Message::new("hello-world").id(), msg.id());
    }

    #[test]
    fn test_empty_payload_allowed() {
        let msg = Message::new(Bytes::new());
        assert!(msg.payload().is_empty());
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!("kafka".parse::<Backend>().unwrap(), Backend::Kafka);
        assert_eq!("RabbitMQ".parse::<Backend>().unwrap(), Backend::Amqp);
        assert_eq!("mqtt".parse::<Backend>().unwrap(), Backend::Mqtt);
        assert!("nats".parse::<Backend>().is_err());
        assert_eq!(Backend::Memory.to_string(), "memory");
    }

    #[test]
    fn test_ack_decision_parse() {
        assert_eq!("accept".parse::<AckDecision>().unwrap(), AckDecision::Accept);
        assert_eq!(
            "reject-requeue".parse::<AckDecision>().unwrap(),
            AckDecision::RejectRequeue
        );
        assert!("maybe".parse::<AckDecision>().is_err());
        assert_eq!(AckDecision::RejectDiscard.to_string(), "reject-discard");
    }

    #[test]
    fn test_payload_lossy() {
        let d = Delivery::new("orders", vec![b'h', b'i', 0xff]);
        assert_eq!(d.payload_lossy(), "hi\u{fffd}");
    }
}
