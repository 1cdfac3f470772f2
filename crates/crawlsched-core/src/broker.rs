//! Broker Adapter contract — §4.3.
//!
//! `crawlsched-broker-amqp` is the concrete `lapin`-backed implementation;
//! this seam lets the scheduler and tests depend on the publish contract
//! without pulling in an AMQP connection.

use std::collections::HashMap;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::CoreError;

/// One entry of a message's dead-letter history, mirroring AMQP's `x-death`
/// array-of-tables shape (§4.4). Kept as a plain struct rather than the
/// wire-level `FieldTable`/`FieldArray` types so the DLQ ring's
/// drop-vs-republish decision stays transport-agnostic while still letting
/// the AMQP adapter rebuild the header losslessly on republish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeathRecord {
    pub count: i64,
    pub reason: String,
    pub queue: String,
    pub exchange: String,
    pub routing_keys: Vec<String>,
}

/// A published message's identity, assigned by the publisher if the
/// caller leaves either field `None` (§4.3.1).
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub correlation_id: Option<String>,
    pub message_id: Option<String>,
    pub headers: HashMap<String, String>,
    /// Carried forward verbatim on a dead-letter republish so the broker's
    /// own `x-death` accounting keeps advancing on subsequent failures
    /// (§4.4) instead of restarting at count 1 each ring cycle.
    pub death_history: Vec<DeathRecord>,
}

impl PublishOptions {
    pub fn resolve_ids(&mut self) {
        self.correlation_id.get_or_insert_with(|| Uuid::new_v4().to_string());
        self.message_id.get_or_insert_with(|| Uuid::new_v4().to_string());
    }
}

#[async_trait]
pub trait BrokerPublisher: Send + Sync {
    /// Publishes a pre-serialized JSON `body`, setting `content-type:
    /// application/json` plus any caller headers, assigning
    /// correlation/message ids if absent, with persistent delivery mode to
    /// `exchange`/`routing_key`.
    ///
    /// Implementations retry internally per [`crate::policy::BROKER_PUBLISH_RETRY`]
    /// and surface the final error only after retries are exhausted. Kept
    /// over a pre-serialized payload (rather than generic over `Serialize`)
    /// so the trait stays object-safe for `Arc<dyn BrokerPublisher>` wiring.
    async fn publish_json(
        &self,
        body: serde_json::Value,
        exchange: &str,
        routing_key: &str,
        options: PublishOptions,
    ) -> Result<(), CoreError>;
}

/// Serializes `message` and publishes it via [`BrokerPublisher::publish_json`].
pub async fn publish<P: BrokerPublisher + ?Sized>(
    publisher: &P,
    message: &impl serde::Serialize,
    exchange: &str,
    routing_key: &str,
    options: PublishOptions,
) -> Result<(), CoreError> {
    let body = serde_json::to_value(message).map_err(|e| CoreError::Internal(e.to_string()))?;
    publisher.publish_json(body, exchange, routing_key, options).await
}

/// Declares the durable topology for one routed event: a direct exchange,
/// a main queue bound with dead-letter arguments pointing at the DLQ
/// twin, a DLQ exchange, and a DLQ queue carrying `x-message-ttl` (§4.3.2,
/// §6).
#[async_trait]
pub trait TopologyDeclarer: Send + Sync {
    async fn declare_event_topology(&self, event: crate::events::RabbitMqEvent) -> Result<(), CoreError>;
}
