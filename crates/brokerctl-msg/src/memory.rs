use crate::{Broker, Inbox};
use async_trait::async_trait;
use brokerctl_core::error::{BackendError, Result};
use brokerctl_core::types::{AckDecision, Backend, Delivery, Destination, Message, Position};
use chrono::Utc;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info};

/// Scripted outcome for the next `send`.
#[derive(Debug, Clone)]
pub struct SendFault {
    pub error: BackendError,
    /// Append the message to the log anyway, as if only the acknowledgment was lost.
    pub deliver: bool,
}

impl SendFault {
    pub fn fail(error: BackendError) -> Self {
        Self {
            error,
            deliver: false,
        }
    }

    pub fn lost_ack(error: BackendError) -> Self {
        Self {
            error,
            deliver: true,
        }
    }
}

#[derive(Default)]
struct State {
    log: Vec<Delivery>,
    send_faults: VecDeque<SendFault>,
    receive_faults: VecDeque<BackendError>,
    send_calls: u64,
    settled: Vec<(u64, AckDecision)>,
    closed: bool,
}

/// In-process, log-structured broker.
///
/// Every published message is appended to a single log; each subscription reads it
/// from the start, so a publish followed by a subscribe on the same session sees the
/// message. Failures can be scripted for tests.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        info!("initializing in-memory broker");
        Self::default()
    }

    /// Queue failures returned by the next `send` calls, in order.
    pub async fn fail_sends(&self, faults: impl IntoIterator<Item = SendFault>) {
        self.state.lock().await.send_faults.extend(faults);
    }

    /// Queue errors returned by the next `Inbox::next` calls on any subscription.
    pub async fn fail_receives(&self, errors: impl IntoIterator<Item = BackendError>) {
        self.state.lock().await.receive_faults.extend(errors);
        self.notify.notify_waiters();
    }

    /// Number of `send` calls made, including failed ones.
    pub async fn send_calls(&self) -> u64 {
        self.state.lock().await.send_calls
    }

    /// Payloads appended to a destination's log, in order.
    pub async fn published(&self, destination: &str) -> Vec<bytes::Bytes> {
        self.state
            .lock()
            .await
            .log
            .iter()
            .filter(|d| d.destination == destination)
            .map(|d| d.payload.clone())
            .collect()
    }

    /// Verdicts reported through `Inbox::settle`, as (sequence, decision).
    pub async fn settled(&self) -> Vec<(u64, AckDecision)> {
        self.state.lock().await.settled.clone()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn backend(&self) -> Backend {
        Backend::Memory
    }

    async fn send(
        &self,
        destination: &Destination,
        message: &Message,
    ) -> std::result::Result<(), BackendError> {
        let mut state = self.state.lock().await;
        state.send_calls += 1;

        if state.closed {
            return Err(BackendError::Fatal("broker closed".into()));
        }

        let fault = state.send_faults.pop_front();
        if let Some(SendFault { deliver: false, error }) = &fault {
            debug!(destination = %destination, "memory: scripted send failure: {error}");
            return Err(error.clone());
        }

        let sequence = state.log.len() as u64;
        let mut delivery = Delivery::new(destination.as_str(), message.payload().clone())
            .with_position(Position::Sequence(sequence));
        delivery.key = message.key().cloned();
        delivery.content_type = message.content_type().map(String::from);
        delivery.message_id = Some(message.id().to_string());
        delivery.timestamp = Some(Utc::now());
        state.log.push(delivery);
        drop(state);

        self.notify.notify_waiters();
        debug!(
            destination = %destination,
            sequence,
            payload_len = message.payload().len(),
            "memory: message appended"
        );

        match fault {
            Some(SendFault { error, .. }) => Err(error),
            None => Ok(()),
        }
    }

    async fn subscribe(&self, destination: &Destination) -> Result<Box<dyn Inbox>> {
        info!(pattern = %destination, "memory: subscribing");
        Ok(Box::new(MemoryInbox {
            broker: self.clone(),
            pattern: destination.as_str().to_string(),
            cursor: 0,
        }))
    }

    async fn list_destinations(&self) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        let names: BTreeSet<String> = state.log.iter().map(|d| d.destination.clone()).collect();
        Ok(names.into_iter().collect())
    }

    async fn shutdown(&self) -> Result<()> {
        info!("memory: shutting down broker");
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
        Ok(())
    }
}

pub struct MemoryInbox {
    broker: MemoryBroker,
    pattern: String,
    cursor: usize,
}

#[async_trait]
impl Inbox for MemoryInbox {
    async fn next(&mut self) -> std::result::Result<Delivery, BackendError> {
        loop {
            // Registered before the log is inspected so a concurrent append is not missed.
            let notified = self.broker.notify.notified();
            {
                let mut state = self.broker.state.lock().await;
                if let Some(error) = state.receive_faults.pop_front() {
                    return Err(error);
                }
                while self.cursor < state.log.len() {
                    let delivery = &state.log[self.cursor];
                    self.cursor += 1;
                    if topic_matches(&self.pattern, &delivery.destination) {
                        return Ok(delivery.clone());
                    }
                }
                if state.closed {
                    return Err(BackendError::EndOfStream);
                }
            }
            notified.await;
        }
    }

    async fn settle(
        &mut self,
        delivery: &Delivery,
        decision: AckDecision,
    ) -> std::result::Result<(), BackendError> {
        if let Position::Sequence(sequence) = delivery.position {
            self.broker
                .state
                .lock()
                .await
                .settled
                .push((sequence, decision));
            if decision == AckDecision::RejectRequeue {
                self.cursor = self.cursor.min(sequence as usize);
            }
        }
        Ok(())
    }
}

/// Topic pattern matching over `.` or `/` separated segments.
/// `*` and `+` match one segment, a trailing `#` matches the rest.
fn topic_matches(pattern: &str, topic: &str) -> bool {
    let split = |s: &str| -> Vec<String> {
        s.split(['.', '/']).map(String::from).collect()
    };
    let pattern_parts = split(pattern);
    let topic_parts = split(topic);

    for (i, p) in pattern_parts.iter().enumerate() {
        if p == "#" && i == pattern_parts.len() - 1 {
            return true;
        }
        match topic_parts.get(i) {
            Some(t) if p == "*" || p == "+" || p == t => continue,
            _ => return false,
        }
    }

    pattern_parts.len() == topic_parts.len()
}
