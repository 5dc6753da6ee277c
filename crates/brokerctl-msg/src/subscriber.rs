use crate::Inbox;
use brokerctl_core::config::{SubscribeConfig, TransientErrorPolicy};
use brokerctl_core::error::{BackendError, Error, Result};
use brokerctl_core::types::{AckDecision, Delivery};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Idle,
    Listening,
    Processing,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceivePolicy {
    /// Pause after a transient receive error before listening again
    pub retry_pause: Duration,
    pub on_transient_error: TransientErrorPolicy,
    /// Stop after this many deliveries
    pub max_messages: Option<u64>,
}

impl Default for ReceivePolicy {
    fn default() -> Self {
        Self::from(&SubscribeConfig::default())
    }
}

impl From<&SubscribeConfig> for ReceivePolicy {
    fn from(config: &SubscribeConfig) -> Self {
        Self {
            retry_pause: Duration::from_millis(config.retry_pause_ms),
            on_transient_error: config.on_transient_error,
            max_messages: None,
        }
    }
}

/// Consumes each delivery and decides how it is acknowledged.
pub trait DeliveryHandler: Send {
    fn handle(&mut self, delivery: &Delivery) -> AckDecision;
}

impl<F> DeliveryHandler for F
where
    F: FnMut(&Delivery) -> AckDecision + Send,
{
    fn handle(&mut self, delivery: &Delivery) -> AckDecision {
        self(delivery)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeSummary {
    pub state: SubscriberState,
    pub received: u64,
}

/// Receive loop over one inbox.
pub struct Subscriber {
    policy: ReceivePolicy,
    state: SubscriberState,
    received: u64,
}

impl Subscriber {
    pub fn new(policy: ReceivePolicy) -> Self {
        Self {
            policy,
            state: SubscriberState::Idle,
            received: 0,
        }
    }

    pub fn state(&self) -> SubscriberState {
        self.state
    }

    fn transition(&mut self, next: SubscriberState) {
        debug!(from = ?self.state, to = ?next, "subscriber state change");
        self.state = next;
    }

    fn summary(&self) -> SubscribeSummary {
        SubscribeSummary {
            state: self.state,
            received: self.received,
        }
    }

    fn fail(&mut self, err: Error) -> Result<SubscribeSummary> {
        error!(received = self.received, "subscriber failed: {err}");
        self.transition(SubscriberState::Failed);
        Err(err)
    }

    /// Run until the stop signal is raised, the stream ends, `max_messages` is
    /// reached, or a fatal error occurs. A dropped stop sender counts as a stop.
    pub async fn run(
        &mut self,
        inbox: &mut dyn Inbox,
        handler: &mut dyn DeliveryHandler,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<SubscribeSummary> {
        self.transition(SubscriberState::Listening);

        loop {
            if *shutdown.borrow() {
                info!(received = self.received, "subscriber stop requested");
                break;
            }
            if let Some(max) = self.policy.max_messages {
                if self.received >= max {
                    info!(received = self.received, "subscriber reached message limit");
                    break;
                }
            }

            let next = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        info!(received = self.received, "stop signal dropped, subscriber exiting");
                        break;
                    }
                    continue;
                }
                next = inbox.next() => next,
            };

            match next {
                Ok(delivery) => {
                    self.transition(SubscriberState::Processing);
                    let decision = handler.handle(&delivery);
                    self.received += 1;
                    if let Err(e) = inbox.settle(&delivery, decision).await {
                        if e.is_transient() {
                            warn!(%decision, "failed to settle delivery: {e}");
                        } else {
                            return self.fail(Error::FatalStream(e));
                        }
                    }
                    self.transition(SubscriberState::Listening);
                }
                Err(BackendError::EndOfStream) => {
                    info!(received = self.received, "stream ended");
                    break;
                }
                Err(e) if e.is_transient() => match self.policy.on_transient_error {
                    TransientErrorPolicy::Retry => {
                        warn!(
                            pause_ms = self.policy.retry_pause.as_millis() as u64,
                            "transient receive error: {e}"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(self.policy.retry_pause) => {}
                            _ = shutdown.changed() => {}
                        }
                    }
                    TransientErrorPolicy::Fail => return self.fail(Error::Receive(e)),
                },
                Err(e) => return self.fail(Error::FatalStream(e)),
            }
        }

        self.transition(SubscriberState::Stopped);
        Ok(self.summary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use crate::Broker;
    use async_trait::async_trait;
    use brokerctl_core::types::{Destination, Message};
    use std::collections::VecDeque;

    fn orders() -> Destination {
        Destination::new("orders").unwrap()
    }

    /// Inbox that replays a script, then reports end of stream.
    struct ScriptedInbox {
        script: VecDeque<std::result::Result<Delivery, BackendError>>,
        settled: Vec<AckDecision>,
    }

    impl ScriptedInbox {
        fn new(script: Vec<std::result::Result<Delivery, BackendError>>) -> Self {
            Self {
                script: script.into(),
                settled: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl Inbox for ScriptedInbox {
        async fn next(&mut self) -> std::result::Result<Delivery, BackendError> {
            self.script.pop_front().unwrap_or(Err(BackendError::EndOfStream))
        }

        async fn settle(
            &mut self,
            _delivery: &Delivery,
            decision: AckDecision,
        ) -> std::result::Result<(), BackendError> {
            self.settled.push(decision);
            Ok(())
        }
    }

    fn collect_into(out: &mut Vec<String>) -> impl FnMut(&Delivery) -> AckDecision + Send + '_ {
        move |d: &Delivery| {
            out.push(d.payload_lossy().into_owned());
            AckDecision::Accept
        }
    }

    fn policy(on_transient_error: TransientErrorPolicy) -> ReceivePolicy {
        ReceivePolicy {
            retry_pause: Duration::from_secs(1),
            on_transient_error,
            max_messages: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_error_does_not_end_loop() {
        let mut inbox = ScriptedInbox::new(vec![
            Ok(Delivery::new("orders", "a")),
            Err(BackendError::NoData),
            Err(BackendError::NoData),
            Ok(Delivery::new("orders", "b")),
        ]);
        let (_tx, rx) = watch::channel(false);
        let mut seen = Vec::new();
        let mut handler = collect_into(&mut seen);

        let start = tokio::time::Instant::now();
        let mut subscriber = Subscriber::new(policy(TransientErrorPolicy::Retry));
        let summary = subscriber.run(&mut inbox, &mut handler, rx).await.unwrap();

        assert_eq!(summary.state, SubscriberState::Stopped);
        assert_eq!(summary.received, 2);
        // two pauses of one second each
        assert!(start.elapsed() >= Duration::from_secs(2));
        drop(handler);
        assert_eq!(seen, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_fatal_error_ends_loop() {
        let mut inbox = ScriptedInbox::new(vec![
            Ok(Delivery::new("orders", "a")),
            Err(BackendError::Fatal("protocol violation".into())),
            Ok(Delivery::new("orders", "never")),
        ]);
        let (_tx, rx) = watch::channel(false);
        let mut handler = |_: &Delivery| AckDecision::Accept;

        let mut subscriber = Subscriber::new(ReceivePolicy::default());
        let err = subscriber.run(&mut inbox, &mut handler, rx).await.unwrap_err();

        assert!(matches!(err, Error::FatalStream(BackendError::Fatal(_))));
        assert_eq!(subscriber.state(), SubscriberState::Failed);
        assert_eq!(inbox.script.len(), 1);
    }

    #[tokio::test]
    async fn test_transient_error_can_be_fatal_by_policy() {
        let mut inbox = ScriptedInbox::new(vec![Err(BackendError::NoData)]);
        let (_tx, rx) = watch::channel(false);
        let mut handler = |_: &Delivery| AckDecision::Accept;

        let mut subscriber = Subscriber::new(policy(TransientErrorPolicy::Fail));
        let err = subscriber.run(&mut inbox, &mut handler, rx).await.unwrap_err();

        assert!(matches!(err, Error::Receive(BackendError::NoData)));
        assert_eq!(subscriber.state(), SubscriberState::Failed);
    }

    #[tokio::test]
    async fn test_decisions_are_settled() {
        let mut inbox = ScriptedInbox::new(vec![
            Ok(Delivery::new("orders", "keep")),
            Ok(Delivery::new("orders", "drop")),
            Ok(Delivery::new("orders", "retry")),
        ]);
        let (_tx, rx) = watch::channel(false);
        let mut handler = |d: &Delivery| match d.payload.as_ref() {
            b"drop" => AckDecision::RejectDiscard,
            b"retry" => AckDecision::RejectRequeue,
            _ => AckDecision::Accept,
        };

        let mut subscriber = Subscriber::new(ReceivePolicy::default());
        subscriber.run(&mut inbox, &mut handler, rx).await.unwrap();

        assert_eq!(
            inbox.settled,
            vec![
                AckDecision::Accept,
                AckDecision::RejectDiscard,
                AckDecision::RejectRequeue
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_signal_ends_waiting_loop() {
        let broker = MemoryBroker::new();
        let mut inbox = broker.subscribe(&orders()).await.unwrap();
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut handler = |_: &Delivery| AckDecision::Accept;
            let mut subscriber = Subscriber::new(ReceivePolicy::default());
            subscriber.run(inbox.as_mut(), &mut handler, rx).await
        });

        broker.send(&orders(), &Message::new("one")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let summary = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("subscriber did not stop")
            .unwrap()
            .unwrap();
        assert_eq!(summary.state, SubscriberState::Stopped);
        assert_eq!(summary.received, 1);
    }

    #[tokio::test]
    async fn test_max_messages_bound() {
        let broker = MemoryBroker::new();
        for payload in ["a", "b", "c"] {
            broker.send(&orders(), &Message::new(payload)).await.unwrap();
        }
        let mut inbox = broker.subscribe(&orders()).await.unwrap();
        let (_tx, rx) = watch::channel(false);
        let mut seen = Vec::new();
        let mut handler = collect_into(&mut seen);

        let mut subscriber = Subscriber::new(ReceivePolicy {
            max_messages: Some(2),
            ..ReceivePolicy::default()
        });
        let summary = subscriber.run(inbox.as_mut(), &mut handler, rx).await.unwrap();

        assert_eq!(summary.received, 2);
        drop(handler);
        assert_eq!(seen, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_orders_round_trip() {
        let broker = MemoryBroker::new();
        let publisher = crate::Publisher::new(&broker, crate::RetryPolicy::default());
        let receipt = publisher
            .publish(&orders(), &Message::new("hello-world"))
            .await
            .unwrap();
        assert_eq!(receipt.attempts, 1);

        let mut inbox = broker.subscribe(&orders()).await.unwrap();
        let (_tx, rx) = watch::channel(false);
        let mut seen: Vec<bytes::Bytes> = Vec::new();
        let mut handler = |d: &Delivery| {
            seen.push(d.payload.clone());
            AckDecision::Accept
        };
        let mut subscriber = Subscriber::new(ReceivePolicy {
            max_messages: Some(1),
            ..ReceivePolicy::default()
        });
        subscriber.run(inbox.as_mut(), &mut handler, rx).await.unwrap();

        assert_eq!(seen, vec![bytes::Bytes::from_static(b"hello-world")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_receive_faults_pause_then_fail() {
        let broker = MemoryBroker::new();
        broker
            .send(&orders(), &Message::new("before-faults"))
            .await
            .unwrap();
        broker
            .fail_receives([
                BackendError::NoData,
                BackendError::Fatal("log corrupted".into()),
            ])
            .await;

        let mut inbox = broker.subscribe(&orders()).await.unwrap();
        let (_tx, rx) = watch::channel(false);
        let mut seen = 0;
        let mut handler = |_: &Delivery| {
            seen += 1;
            AckDecision::Accept
        };

        let start = tokio::time::Instant::now();
        let mut subscriber = Subscriber::new(policy(TransientErrorPolicy::Retry));
        let err = subscriber
            .run(inbox.as_mut(), &mut handler, rx)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::FatalStream(BackendError::Fatal(_))));
        assert_eq!(subscriber.state(), SubscriberState::Failed);
        // one pause for NoData before the fatal error
        assert!(start.elapsed() >= Duration::from_secs(1));
        drop(handler);
        // faults are served before the log
        assert_eq!(seen, 0);
    }
}
