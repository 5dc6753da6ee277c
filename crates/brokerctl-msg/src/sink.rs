use crate::subscriber::DeliveryHandler;
use brokerctl_core::types::{AckDecision, Delivery, Position};
use std::io::Write;
use tracing::warn;

/// Prints every delivery, one line each, and answers with a fixed decision.
pub struct ConsoleSink<W: Write + Send> {
    out: W,
    decision: AckDecision,
}

impl ConsoleSink<std::io::Stdout> {
    pub fn stdout(decision: AckDecision) -> Self {
        Self::new(std::io::stdout(), decision)
    }
}

impl<W: Write + Send> ConsoleSink<W> {
    pub fn new(out: W, decision: AckDecision) -> Self {
        Self { out, decision }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

pub fn format_delivery(delivery: &Delivery) -> String {
    let key = delivery
        .key
        .as_ref()
        .map(|k| format!(" | key: {}", String::from_utf8_lossy(k)))
        .unwrap_or_default();

    match delivery.position {
        Position::Offset { partition, offset } => format!(
            "Received message on topic: {} | partition: {partition} | offset: {offset}{key} | message: {}",
            delivery.destination,
            delivery.payload_lossy()
        ),
        _ => format!(
            "Received message on topic: {}{key} | message: {}",
            delivery.destination,
            delivery.payload_lossy()
        ),
    }
}

impl<W: Write + Send> DeliveryHandler for ConsoleSink<W> {
    fn handle(&mut self, delivery: &Delivery) -> AckDecision {
        let line = format_delivery(delivery);
        if let Err(e) = writeln!(self.out, "{line}").and_then(|_| self.out.flush()) {
            warn!("failed to write delivery to console: {e}");
        }
        self.decision
    }
}
