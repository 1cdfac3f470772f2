//! DLQ ring relay — §4.4.
//!
//! Transport-agnostic: `crawlsched-broker-amqp` decodes the AMQP `x-death`
//! header and the envelope the broker actually hands back, and calls into
//! [`DeadLetterHandler::handle`] with the pieces this crate needs to make
//! the drop-or-republish call. Keeping the decision logic here (rather
//! than inline in the lapin consumer) makes it testable without a broker.
//!
//! ```text
//!         ┌──────── ack ─────────►  (consumed)
//! main ───┤
//!         └── reject ─► DLQ ── TTL expire ─► DeadLetterHandler
//!                                             │
//!                                   count≥3 ──┴──► drop
//!                                   count<3  ─────► republish to main
//! ```

use std::collections::HashMap;

use crawlsched_core::broker::{DeathRecord, PublishOptions};
use crawlsched_core::{BrokerPublisher, CoreError, RabbitMqEvent, MAX_DEAD_LETTER_RETRIES};

/// Outcome of handling one dead-lettered message, surfaced mainly for
/// logging/metrics at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterOutcome {
    Dropped,
    Republished,
}

pub struct DeadLetterHandler<P: BrokerPublisher> {
    publisher: P,
}

impl<P: BrokerPublisher> DeadLetterHandler<P> {
    pub fn new(publisher: P) -> Self {
        Self { publisher }
    }

    /// `death_count` is `x-death[0].count` as read off the incoming
    /// message by the transport layer. `body` and `headers` are carried
    /// forward verbatim on republish; `death_history` is the decoded
    /// `x-death` array, carried forward so the broker's own accounting
    /// keeps advancing on subsequent failures instead of restarting at
    /// count 1 each ring cycle.
    pub async fn handle(
        &self,
        event: RabbitMqEvent,
        death_count: u32,
        body: serde_json::Value,
        headers: HashMap<String, String>,
        death_history: Vec<DeathRecord>,
    ) -> Result<DeadLetterOutcome, CoreError> {
        if death_count >= MAX_DEAD_LETTER_RETRIES {
            tracing::warn!(
                queue = event.queue_dead_letter(),
                death_count,
                "maximum retries reached for dead-lettered message, dropping"
            );
            return Ok(DeadLetterOutcome::Dropped);
        }

        let options = PublishOptions {
            headers,
            death_history,
            ..Default::default()
        };
        self.publisher
            .publish_json(body, event.exchange(), event.routing_key(), options)
            .await?;

        tracing::info!(
            routing_key = event.routing_key(),
            death_count,
            "republished dead-lettered message to main exchange"
        );
        Ok(DeadLetterOutcome::Republished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crawlsched_testing::RecordingBrokerPublisher;
    use serde_json::json;

    #[tokio::test]
    async fn republishes_below_the_retry_ceiling() {
        let handler = DeadLetterHandler::new(RecordingBrokerPublisher::new());
        let outcome = handler
            .handle(RabbitMqEvent::FetchUrl, 1, json!({"url": "https://a.example"}), HashMap::new(), Vec::new())
            .await
            .unwrap();
        assert_eq!(outcome, DeadLetterOutcome::Republished);
    }

    #[tokio::test]
    async fn drops_at_the_retry_ceiling() {
        let publisher = RecordingBrokerPublisher::new();
        let handler = DeadLetterHandler::new(publisher);
        let outcome = handler
            .handle(RabbitMqEvent::FetchUrl, MAX_DEAD_LETTER_RETRIES, json!({}), HashMap::new(), Vec::new())
            .await
            .unwrap();
        assert_eq!(outcome, DeadLetterOutcome::Dropped);
    }

    #[tokio::test]
    async fn ring_terminates_within_max_retries_cycles() {
        // x-death count starts at 1 the first time a message lands in the
        // DLQ and increments each cycle; simulate a message that never
        // succeeds and count how many times it gets republished before
        // the ceiling drops it for good.
        let publisher = RecordingBrokerPublisher::new();
        let handler = DeadLetterHandler::new(publisher);
        let mut republish_count = 0;
        for death_count in 1..10 {
            let outcome = handler
                .handle(RabbitMqEvent::FetchUrl, death_count, json!({}), HashMap::new(), Vec::new())
                .await
                .unwrap();
            match outcome {
                DeadLetterOutcome::Republished => republish_count += 1,
                DeadLetterOutcome::Dropped => break,
            }
        }
        assert!(republish_count < MAX_DEAD_LETTER_RETRIES);
    }
}
