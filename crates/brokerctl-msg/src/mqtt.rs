use crate::{Broker, Inbox};
use async_trait::async_trait;
use brokerctl_core::config::MqttConfig;
use brokerctl_core::error::{BackendError, Error, Result};
use brokerctl_core::types::{Backend, Delivery, Destination, Message};
use chrono::Utc;
use brokerctl_core::config::MqttEndpoint;
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, Transport,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Grace period for the event loop to flush the disconnect packet.
const DISCONNECT_GRACE: Duration = Duration::from_millis(250);

type Inbound = std::result::Result<Delivery, BackendError>;

/// Matches outgoing QoS 1/2 publishes to the broker's PUBACK/PUBCOMP.
///
/// rumqttc assigns packet ids inside the event loop, so waiters are queued in
/// request order and bound to a pkid when the loop reports the outgoing publish.
#[derive(Default)]
struct AckTracker {
    queued: VecDeque<oneshot::Sender<()>>,
    inflight: HashMap<u16, oneshot::Sender<()>>,
}

impl AckTracker {
    fn expect(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.queued.push_back(tx);
        rx
    }

    /// Undo the last `expect` when the request never reached the client queue.
    fn withdraw(&mut self) {
        self.queued.pop_back();
    }

    fn sent(&mut self, pkid: u16) {
        if pkid == 0 {
            return;
        }
        if let Some(waiter) = self.queued.pop_front() {
            self.inflight.insert(pkid, waiter);
        }
    }

    fn acked(&mut self, pkid: u16) {
        if let Some(waiter) = self.inflight.remove(&pkid) {
            let _ = waiter.send(());
        }
    }

    /// Drop every waiter; their senders see the connection as lost.
    fn reset(&mut self) {
        self.queued.clear();
        self.inflight.clear();
    }
}

fn lock_acks(acks: &Mutex<AckTracker>) -> MutexGuard<'_, AckTracker> {
    acks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// MQTT session over rumqttc.
///
/// The event loop runs on a background driver task owned by this handle. QoS 0
/// publishes complete once queued; QoS 1 and 2 wait for the broker's acknowledgment.
pub struct MqttBroker {
    client: AsyncClient,
    qos: QoS,
    inbound: Mutex<Option<mpsc::Receiver<Inbound>>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    acks: Arc<Mutex<AckTracker>>,
    /// Keeps waiter registration in the same order as the client request queue
    publish_lock: tokio::sync::Mutex<()>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

fn qos_from_level(level: u8) -> Result<QoS> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(Error::Config(format!("invalid mqtt qos: {other}"))),
    }
}

impl MqttBroker {
    pub async fn connect(
        client_id: &str,
        config: &MqttConfig,
        retry_pause: Duration,
    ) -> Result<Self> {
        let endpoint = config.endpoint()?;
        let qos = qos_from_level(config.qos)?;

        info!(
            client_id = client_id,
            host = %endpoint.host,
            port = endpoint.port,
            tls = endpoint.tls,
            "connecting to MQTT broker"
        );

        let options = mqtt_options(client_id, config, &endpoint);
        debug!(session = %options.client_id(), "mqtt: session id");

        let (client, mut eventloop) = AsyncClient::new(options, 64);

        tokio::time::timeout(config.dial_timeout(), wait_for_connack(&mut eventloop))
            .await
            .map_err(|_| {
                Error::Connection(format!(
                    "mqtt broker {}:{} did not acknowledge within {:?}",
                    endpoint.host,
                    endpoint.port,
                    config.dial_timeout()
                ))
            })?
            .map_err(|e| {
                Error::Connection(format!(
                    "mqtt broker {}:{}: {e}",
                    endpoint.host, endpoint.port
                ))
            })?;

        info!(host = %endpoint.host, port = endpoint.port, "connected to MQTT broker");

        let (tx, rx) = mpsc::channel(256);
        let subscriptions = Arc::new(Mutex::new(Vec::new()));
        let acks = Arc::new(Mutex::new(AckTracker::default()));
        let driver = tokio::spawn(drive(
            eventloop,
            client.clone(),
            tx,
            subscriptions.clone(),
            acks.clone(),
            qos,
            retry_pause,
        ));

        Ok(Self {
            client,
            qos,
            inbound: Mutex::new(Some(rx)),
            subscriptions,
            acks,
            publish_lock: tokio::sync::Mutex::new(()),
            driver: Mutex::new(Some(driver)),
        })
    }
}

/// Each process gets its own session id: brokers drop the older connection
/// when a second client connects with the same id.
fn session_id(client_id: &str) -> String {
    format!("{client_id}-{}", uuid::Uuid::new_v4())
}

fn mqtt_options(client_id: &str, config: &MqttConfig, endpoint: &MqttEndpoint) -> MqttOptions {
    let mut options = MqttOptions::new(session_id(client_id), endpoint.host.clone(), endpoint.port);
    // zero disables keep-alive
    options.set_keep_alive(config.keep_alive());
    if let Some(username) = config.username.as_deref().filter(|u| !u.is_empty()) {
        options.set_credentials(username, config.password.clone().unwrap_or_default());
    }
    if endpoint.tls {
        options.set_transport(Transport::tls_with_default_config());
    }
    options
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> std::result::Result<(), ConnectionError> {
    loop {
        if let Event::Incoming(Packet::ConnAck(_)) = eventloop.poll().await? {
            return Ok(());
        }
    }
}

/// Poll the event loop for the life of the session, forwarding inbound publishes.
async fn drive(
    mut eventloop: EventLoop,
    client: AsyncClient,
    tx: mpsc::Sender<Inbound>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    acks: Arc<Mutex<AckTracker>>,
    qos: QoS,
    retry_pause: Duration,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let mut delivery = Delivery::new(publish.topic.clone(), publish.payload.clone());
                delivery.timestamp = Some(Utc::now());
                if tx.send(Ok(delivery)).await.is_err() {
                    debug!("mqtt: inbox dropped, discarding message");
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt: reconnected to broker");
                let topics = match subscriptions.lock() {
                    Ok(topics) => topics.clone(),
                    Err(poisoned) => poisoned.into_inner().clone(),
                };
                for topic in topics {
                    if let Err(e) = client.try_subscribe(topic.clone(), qos) {
                        warn!(topic = %topic, "mqtt: failed to restore subscription: {e}");
                    }
                }
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                lock_acks(&acks).sent(pkid);
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                lock_acks(&acks).acked(ack.pkid);
            }
            Ok(Event::Incoming(Packet::PubComp(comp))) => {
                lock_acks(&acks).acked(comp.pkid);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("mqtt: disconnect sent, stopping driver");
                break;
            }
            Ok(_) => {}
            Err(ConnectionError::RequestsDone) => {
                debug!("mqtt: all client handles dropped, stopping driver");
                break;
            }
            Err(e) => {
                warn!(pause_ms = retry_pause.as_millis() as u64, "mqtt: connection lost: {e}");
                lock_acks(&acks).reset();
                let _ = tx.try_send(Err(BackendError::Unavailable(e.to_string())));
                tokio::time::sleep(retry_pause).await;
            }
        }
    }
    lock_acks(&acks).reset();
    debug!("mqtt: driver ended");
}

#[async_trait]
impl Broker for MqttBroker {
    fn backend(&self) -> Backend {
        Backend::Mqtt
    }

    async fn send(
        &self,
        destination: &Destination,
        message: &Message,
    ) -> std::result::Result<(), BackendError> {
        debug!(
            topic = %destination,
            payload_len = message.payload().len(),
            qos = ?self.qos,
            "mqtt: publishing message"
        );

        let closed = |e: rumqttc::ClientError| BackendError::Fatal(format!("mqtt client closed: {e}"));

        if self.qos == QoS::AtMostOnce {
            return self
                .client
                .publish_bytes(destination.as_str(), self.qos, false, message.payload().clone())
                .await
                .map_err(closed);
        }

        let acked = {
            let _order = self.publish_lock.lock().await;
            let acked = lock_acks(&self.acks).expect();
            if let Err(e) = self
                .client
                .publish_bytes(destination.as_str(), self.qos, false, message.payload().clone())
                .await
            {
                lock_acks(&self.acks).withdraw();
                return Err(closed(e));
            }
            acked
        };

        acked.await.map_err(|_| {
            BackendError::Unavailable(
                "mqtt connection lost before the broker acknowledged the message".into(),
            )
        })
    }

    async fn subscribe(&self, destination: &Destination) -> Result<Box<dyn Inbox>> {
        let rx = self
            .inbound
            .lock()
            .map_err(|_| Error::Other("mqtt inbound lock poisoned".into()))?
            .take()
            .ok_or_else(|| Error::Other("mqtt session already has a subscriber".into()))?;

        info!(topic = %destination, qos = ?self.qos, "mqtt: subscribing");

        self.client
            .subscribe(destination.as_str(), self.qos)
            .await
            .map_err(|e| Error::FatalStream(BackendError::Fatal(format!("mqtt subscribe: {e}"))))?;

        if let Ok(mut topics) = self.subscriptions.lock() {
            topics.push(destination.as_str().to_string());
        }

        Ok(Box::new(MqttInbox { rx }))
    }

    async fn shutdown(&self) -> Result<()> {
        info!("mqtt: disconnecting");
        if let Err(e) = self.client.disconnect().await {
            debug!("mqtt: disconnect request failed: {e}");
        }

        let driver = self.driver.lock().ok().and_then(|mut d| d.take());
        if let Some(mut driver) = driver {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut driver).await.is_err() {
                error!("mqtt: driver did not stop in time, aborting");
                driver.abort();
            }
        }
        Ok(())
    }
}

pub struct MqttInbox {
    rx: mpsc::Receiver<Inbound>,
}

#[async_trait]
impl Inbox for MqttInbox {
    async fn next(&mut self) -> std::result::Result<Delivery, BackendError> {
        self.rx.recv().await.unwrap_or(Err(BackendError::EndOfStream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::{Publisher, RetryPolicy};

    #[test]
    fn test_qos_levels() {
        assert_eq!(qos_from_level(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(qos_from_level(1).unwrap(), QoS::AtLeastOnce);
        assert_eq!(qos_from_level(2).unwrap(), QoS::ExactlyOnce);
        assert!(qos_from_level(3).is_err());
    }

    fn local_endpoint() -> MqttEndpoint {
        MqttEndpoint {
            host: "localhost".into(),
            port: 1883,
            tls: false,
        }
    }

    #[test]
    fn test_each_session_gets_its_own_client_id() {
        let config = MqttConfig::default();
        let subscriber = mqtt_options("brokerctl", &config, &local_endpoint());
        let publisher = mqtt_options("brokerctl", &config, &local_endpoint());

        assert!(subscriber.client_id().starts_with("brokerctl-"));
        assert!(publisher.client_id().starts_with("brokerctl-"));
        assert_ne!(subscriber.client_id(), publisher.client_id());
    }

    #[test]
    fn test_options_carry_keep_alive_and_credentials() {
        let config = MqttConfig::default();
        let options = mqtt_options("brokerctl", &config, &local_endpoint());
        assert_eq!(options.keep_alive(), Duration::from_secs(2));
        assert_eq!(
            options.credentials(),
            Some(("myuser".to_string(), "mypassword".to_string()))
        );

        let config = MqttConfig {
            keep_alive_secs: 0,
            username: Some(String::new()),
            ..MqttConfig::default()
        };
        let options = mqtt_options("brokerctl", &config, &local_endpoint());
        assert_eq!(options.keep_alive(), Duration::ZERO);
        assert_eq!(options.credentials(), None);
    }

    #[tokio::test]
    async fn test_ack_resolves_matching_publish_only() {
        let mut acks = AckTracker::default();
        let first = acks.expect();
        let mut second = acks.expect();
        acks.sent(1);
        acks.sent(2);

        acks.acked(1);
        assert!(first.await.is_ok());
        assert!(second.try_recv().is_err());

        acks.acked(2);
        assert!(second.await.is_ok());
    }

    #[tokio::test]
    async fn test_connection_loss_fails_pending_publishes() {
        let mut acks = AckTracker::default();
        let inflight = acks.expect();
        let queued = acks.expect();
        acks.sent(7);

        acks.reset();
        assert!(inflight.await.is_err());
        assert!(queued.await.is_err());
    }

    #[test]
    fn test_withdrawn_publish_does_not_take_next_pkid() {
        let mut acks = AckTracker::default();
        let _first = acks.expect();
        let _failed = acks.expect();
        acks.withdraw();
        acks.sent(3);
        acks.sent(4);
        assert_eq!(acks.queued.len(), 0);
        assert_eq!(acks.inflight.len(), 1);
        assert!(acks.inflight.contains_key(&3));
    }

    #[tokio::test]
    async fn test_inbox_reports_end_of_stream_when_driver_stops() {
        let (tx, rx) = mpsc::channel(4);
        let mut inbox = MqttInbox { rx };
        tx.send(Ok(Delivery::new("sensors/temp", "21.5"))).await.unwrap();
        drop(tx);

        assert_eq!(inbox.next().await.unwrap().payload.as_ref(), b"21.5");
        assert_eq!(inbox.next().await.unwrap_err(), BackendError::EndOfStream);
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_connection_error() {
        let config = MqttConfig {
            url: "tcp://127.0.0.1:1".into(),
            dial_timeout_secs: 2,
            ..MqttConfig::default()
        };
        let err = MqttBroker::connect("brokerctl-test", &config, Duration::from_millis(10))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Connection(_)));
    }

    // Integration test, requires a running MQTT broker.
    // Run with: cargo test -p brokerctl-msg mqtt_roundtrip -- --ignored
    #[tokio::test]
    #[ignore]
    async fn test_mqtt_roundtrip() {
        let config = MqttConfig {
            qos: 1,
            ..MqttConfig::default()
        };
        let broker = MqttBroker::connect("brokerctl-test", &config, Duration::from_millis(100))
            .await
            .expect("failed to connect to MQTT");
        let topic = Destination::new("brokerctl/test/orders").unwrap();

        let mut inbox = broker.subscribe(&topic).await.expect("failed to subscribe");
        tokio::time::sleep(Duration::from_millis(100)).await;

        Publisher::new(&broker, RetryPolicy::default())
            .publish(&topic, &Message::new("hello-world"))
            .await
            .expect("failed to publish");

        let received = tokio::time::timeout(Duration::from_secs(2), inbox.next())
            .await
            .expect("timeout waiting for message")
            .expect("inbox closed");
        assert_eq!(received.payload.as_ref(), b"hello-world");

        broker.shutdown().await.unwrap();
    }
}
