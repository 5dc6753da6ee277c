use crate::Broker;
use brokerctl_core::config::PublishConfig;
use brokerctl_core::error::{BackendError, Error, Result};
use brokerctl_core::types::{Destination, Message};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Bounded retry for transient send failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Fixed pause between attempts
    pub retry_delay: Duration,
    /// Deadline for one attempt; expiry counts as a transient timeout
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&PublishConfig::default())
    }
}

impl From<&PublishConfig> for RetryPolicy {
    fn from(config: &PublishConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            attempt_timeout: Duration::from_secs(config.attempt_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReceipt {
    pub attempts: u32,
}

/// Sends one message, retrying transient failures.
///
/// Delivery is at-least-once: when an attempt times out after the broker already
/// accepted the message, the retry sends it again. The message id is the same on
/// every attempt so consumers can drop duplicates.
pub struct Publisher<'a> {
    broker: &'a dyn Broker,
    policy: RetryPolicy,
}

impl<'a> Publisher<'a> {
    pub fn new(broker: &'a dyn Broker, policy: RetryPolicy) -> Self {
        Self { broker, policy }
    }

    pub async fn publish(
        &self,
        destination: &Destination,
        message: &Message,
    ) -> Result<PublishReceipt> {
        let max_attempts = self.policy.max_attempts;
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            debug!(
                destination = %destination,
                message_id = %message.id(),
                attempt,
                "publishing message"
            );

            let outcome = match tokio::time::timeout(
                self.policy.attempt_timeout,
                self.broker.send(destination, message),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(BackendError::Timeout(self.policy.attempt_timeout)),
            };

            match outcome {
                Ok(()) => {
                    info!(
                        backend = %self.broker.backend(),
                        destination = %destination,
                        message_id = %message.id(),
                        attempts = attempt,
                        "message published"
                    );
                    return Ok(PublishReceipt { attempts: attempt });
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        destination = %destination,
                        attempt,
                        max_attempts,
                        "transient publish failure: {e}"
                    );
                    last_error = Some(e);
                    if attempt < max_attempts {
                        tokio::time::sleep(self.policy.retry_delay).await;
                    }
                }
                Err(e) => {
                    return Err(Error::Publish {
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }

        Err(Error::Publish {
            attempts: max_attempts,
            source: last_error
                .unwrap_or_else(|| BackendError::Fatal("no publish attempt was made".into())),
        })
    }
}
