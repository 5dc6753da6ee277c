use crate::error::{Error, Result};
use crate::types::{AckDecision, Backend};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: Backend,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub amqp: AmqpConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub subscribe: SubscribeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            client_id: default_client_id(),
            kafka: KafkaConfig::default(),
            mqtt: MqttConfig::default(),
            amqp: AmqpConfig::default(),
            publish: PublishConfig::default(),
            subscribe: SubscribeConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    #[serde(default = "default_kafka_brokers")]
    pub brokers: Vec<String>,
    /// Consumer group. Without one, partition 0 is read directly and nothing is committed.
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub start_offset: StartOffset,
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: default_kafka_brokers(),
            group_id: None,
            start_offset: StartOffset::default(),
            dial_timeout_secs: default_dial_timeout(),
        }
    }
}

impl KafkaConfig {
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartOffset {
    #[default]
    Earliest,
    Latest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_url")]
    pub url: String,
    /// An empty username connects anonymously
    #[serde(default = "default_username")]
    pub username: Option<String>,
    #[serde(default = "default_password")]
    pub password: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,
    #[serde(default)]
    pub qos: u8,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            url: default_mqtt_url(),
            username: default_username(),
            password: default_password(),
            keep_alive_secs: default_keep_alive(),
            dial_timeout_secs: default_dial_timeout(),
            qos: 0,
        }
    }
}

/// Resolved MQTT endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl MqttConfig {
    pub fn endpoint(&self) -> Result<MqttEndpoint> {
        let url = Url::parse(&self.url)
            .map_err(|e| Error::Config(format!("invalid mqtt url {}: {e}", self.url)))?;
        let tls = match url.scheme() {
            "tcp" | "mqtt" => false,
            "ssl" | "mqtts" => true,
            other => {
                return Err(Error::Config(format!("unsupported mqtt scheme: {other}")));
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| Error::Config(format!("mqtt url has no host: {}", self.url)))?
            .to_string();
        let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });
        Ok(MqttEndpoint { host, port, tls })
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Topic,
    Fanout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmqpConfig {
    #[serde(default = "default_amqp_url")]
    pub url: String,
    /// An empty username connects anonymously
    #[serde(default = "default_username")]
    pub username: Option<String>,
    #[serde(default = "default_password")]
    pub password: Option<String>,
    #[serde(default)]
    pub exchange_kind: ExchangeKind,
    #[serde(default = "default_prefetch")]
    pub prefetch: u16,
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            url: default_amqp_url(),
            username: default_username(),
            password: default_password(),
            exchange_kind: ExchangeKind::default(),
            prefetch: default_prefetch(),
            dial_timeout_secs: default_dial_timeout(),
        }
    }
}

impl AmqpConfig {
    /// Connection URI with the configured credentials folded in.
    pub fn connection_uri(&self) -> Result<String> {
        let mut url = Url::parse(&self.url)
            .map_err(|e| Error::Config(format!("invalid amqp url {}: {e}", self.url)))?;
        if !matches!(url.scheme(), "amqp" | "amqps") {
            return Err(Error::Config(format!(
                "unsupported amqp scheme: {}",
                url.scheme()
            )));
        }
        if let Some(username) = self.username.as_deref().filter(|u| !u.is_empty()) {
            url.set_username(username)
                .map_err(|_| Error::Config("amqp url cannot carry credentials".into()))?;
            url.set_password(self.password.as_deref())
                .map_err(|_| Error::Config("amqp url cannot carry credentials".into()))?;
        }
        Ok(url.to_string())
    }

    /// Routing key for a destination under the configured exchange kind.
    pub fn routing_key<'a>(&self, destination: &'a str) -> &'a str {
        match self.exchange_kind {
            ExchangeKind::Fanout => "",
            ExchangeKind::Direct | ExchangeKind::Topic => destination,
        }
    }

    pub fn queue_name(&self, destination: &str) -> String {
        format!("{destination}_queue")
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_secs: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            attempt_timeout_secs: default_attempt_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransientErrorPolicy {
    /// Log and keep listening after a pause
    #[default]
    Retry,
    /// End the loop with a receive error
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeConfig {
    #[serde(default = "default_retry_pause_ms")]
    pub retry_pause_ms: u64,
    #[serde(default)]
    pub on_transient_error: TransientErrorPolicy,
    #[serde(default)]
    pub ack: AckDecision,
}

impl Default for SubscribeConfig {
    fn default() -> Self {
        Self {
            retry_pause_ms: default_retry_pause_ms(),
            on_transient_error: TransientErrorPolicy::default(),
            ack: AckDecision::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_client_id() -> String {
    "brokerctl".to_string()
}
fn default_kafka_brokers() -> Vec<String> {
    vec!["localhost:9092".to_string()]
}
fn default_mqtt_url() -> String {
    "tcp://localhost:1883".to_string()
}
fn default_amqp_url() -> String {
    "amqp://localhost:5672/%2f".to_string()
}
fn default_username() -> Option<String> {
    Some("myuser".to_string())
}
fn default_password() -> Option<String> {
    Some("mypassword".to_string())
}
fn default_keep_alive() -> u64 {
    2
}
fn default_dial_timeout() -> u64 {
    10
}
fn default_prefetch() -> u16 {
    10
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    250
}
fn default_attempt_timeout() -> u64 {
    10
}
fn default_retry_pause_ms() -> u64 {
    1000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config: {e}")))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.client_id.is_empty() {
            return Err(Error::Config("client_id must not be empty".into()));
        }
        if self.kafka.brokers.is_empty() || self.kafka.brokers.iter().any(|b| b.is_empty()) {
            return Err(Error::Config("kafka.brokers must list at least one address".into()));
        }
        if self.mqtt.url.is_empty() {
            return Err(Error::Config("mqtt.url must not be empty".into()));
        }
        if self.mqtt.qos > 2 {
            return Err(Error::Config(format!("mqtt.qos must be 0, 1 or 2, got {}", self.mqtt.qos)));
        }
        if self.amqp.url.is_empty() {
            return Err(Error::Config("amqp.url must not be empty".into()));
        }
        if self.publish.max_attempts == 0 {
            return Err(Error::Config("publish.max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}
