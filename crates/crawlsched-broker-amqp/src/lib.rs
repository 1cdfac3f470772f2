//! `lapin`-backed [`BrokerPublisher`]/[`TopologyDeclarer`] — §4.3.
//!
//! Grounded on `src/core/rmq/rmq_publisher.py` (publish-with-retry,
//! random correlation/message ids, persistent delivery, merged headers)
//! and `src/app/worker/rmq_api.py`/`rmq_spi.py` (durable direct exchange
//! per event, main queue carrying `x-dead-letter-exchange`/
//! `x-dead-letter-routing-key`, DLQ queue carrying `x-message-ttl`).

use std::collections::HashMap;

use async_trait::async_trait;
use crawlsched_core::broker::{BrokerPublisher, DeathRecord, PublishOptions, TopologyDeclarer};
use crawlsched_core::events::{RabbitMqEvent, DEAD_LETTER_TTL_MS};
use crawlsched_core::CoreError;
use crawlsched_core::policy::BROKER_PUBLISH_RETRY;
use lapin::options::{BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};

/// A connected AMQP broker adapter. Cheap to clone: `lapin::Channel` is
/// already an `Arc`-backed handle.
#[derive(Clone)]
pub struct AmqpBroker {
    channel: Channel,
}

impl AmqpBroker {
    pub async fn connect(uri: &str) -> Result<Self, CoreError> {
        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(|e| CoreError::ServiceUnavailable(format!("amqp connect failed: {e}")))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| CoreError::ServiceUnavailable(format!("amqp channel open failed: {e}")))?;
        Ok(Self { channel })
    }

    pub fn from_channel(channel: Channel) -> Self {
        Self { channel }
    }

    /// Opens a consumer on `queue`, used by the dead-letter relay to read
    /// back off a DLQ once its `x-message-ttl` expires messages into it.
    pub async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Consumer, CoreError> {
        self.channel
            .basic_consume(queue, consumer_tag, BasicConsumeOptions::default(), FieldTable::default())
            .await
            .map_err(|e| CoreError::ServiceUnavailable(format!("amqp consume failed: {e}")))
    }

    pub async fn ack(&self, delivery: &lapin::message::Delivery) -> Result<(), CoreError> {
        delivery
            .ack(lapin::options::BasicAckOptions::default())
            .await
            .map_err(|e| CoreError::BadGateway(format!("amqp ack failed: {e}")))
    }

    /// Rejects without requeue, routing the message to its queue's
    /// `x-dead-letter-exchange` per the topology declared in
    /// [`Self::declare_event_topology`].
    pub async fn reject(&self, delivery: &lapin::message::Delivery) -> Result<(), CoreError> {
        delivery
            .reject(lapin::options::BasicRejectOptions { requeue: false })
            .await
            .map_err(|e| CoreError::BadGateway(format!("amqp reject failed: {e}")))
    }

    async fn try_publish(
        &self,
        body: &serde_json::Value,
        exchange: &str,
        routing_key: &str,
        options: &PublishOptions,
    ) -> Result<(), CoreError> {
        let payload = serde_json::to_vec(body).map_err(|e| CoreError::Internal(e.to_string()))?;

        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from("content-type"),
            AMQPValue::LongString(LongString::from("application/json")),
        );
        for (key, value) in &options.headers {
            headers.insert(ShortString::from(key.as_str()), AMQPValue::LongString(LongString::from(value.as_str())));
        }
        if !options.death_history.is_empty() {
            headers.insert(ShortString::from("x-death"), build_death_header(&options.death_history));
        }

        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from("application/json"))
            .with_delivery_mode(2) // persistent
            .with_headers(headers);
        if let Some(correlation_id) = &options.correlation_id {
            properties = properties.with_correlation_id(ShortString::from(correlation_id.as_str()));
        }
        if let Some(message_id) = &options.message_id {
            properties = properties.with_message_id(ShortString::from(message_id.as_str()));
        }

        self.channel
            .basic_publish(exchange, routing_key, BasicPublishOptions::default(), &payload, properties)
            .await
            .map_err(|e| CoreError::BadGateway(format!("amqp publish failed: {e}")))?
            .await
            .map_err(|e| CoreError::BadGateway(format!("amqp publish not confirmed: {e}")))?;

        Ok(())
    }
}

#[async_trait]
impl BrokerPublisher for AmqpBroker {
    async fn publish_json(
        &self,
        body: serde_json::Value,
        exchange: &str,
        routing_key: &str,
        mut options: PublishOptions,
    ) -> Result<(), CoreError> {
        options.resolve_ids();

        let mut last_err = None;
        for attempt in 1..=BROKER_PUBLISH_RETRY.tries {
            match self.try_publish(&body, exchange, routing_key, &options).await {
                Ok(()) => {
                    tracing::info!(exchange, routing_key, attempt, "published to rmq");
                    return Ok(());
                }
                Err(e) => {
                    tracing::error!(exchange, routing_key, attempt, error = %e, "publish to rmq failed");
                    last_err = Some(e);
                    if attempt < BROKER_PUBLISH_RETRY.tries {
                        tokio::time::sleep(BROKER_PUBLISH_RETRY.delay_for(attempt)).await;
                    }
                }
            }
        }
        Err(last_err.expect("loop runs at least once"))
    }
}

#[async_trait]
impl TopologyDeclarer for AmqpBroker {
    async fn declare_event_topology(&self, event: RabbitMqEvent) -> Result<(), CoreError> {
        let declare_err = |e: lapin::Error| CoreError::ServiceUnavailable(format!("amqp topology declare failed: {e}"));

        self.channel
            .exchange_declare(
                event.exchange_dead_letter().as_str(),
                ExchangeKind::Direct,
                ExchangeDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await
            .map_err(declare_err)?;

        let mut dlq_args = FieldTable::default();
        dlq_args.insert(ShortString::from("x-message-ttl"), AMQPValue::LongUInt(DEAD_LETTER_TTL_MS));

        self.channel
            .queue_declare(
                event.queue_dead_letter().as_str(),
                QueueDeclareOptions { durable: true, ..Default::default() },
                dlq_args,
            )
            .await
            .map_err(declare_err)?;

        self.channel
            .queue_bind(
                event.queue_dead_letter().as_str(),
                event.exchange_dead_letter().as_str(),
                event.routing_key_dead_letter().as_str(),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(declare_err)?;

        self.channel
            .exchange_declare(
                event.exchange(),
                ExchangeKind::Direct,
                ExchangeDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await
            .map_err(declare_err)?;

        let mut main_args = FieldTable::default();
        main_args.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(LongString::from(event.exchange_dead_letter().as_str())),
        );
        main_args.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(LongString::from(event.routing_key_dead_letter().as_str())),
        );

        self.channel
            .queue_declare(
                event.queue(),
                QueueDeclareOptions { durable: true, ..Default::default() },
                main_args,
            )
            .await
            .map_err(declare_err)?;

        self.channel
            .queue_bind(
                event.queue(),
                event.exchange(),
                event.routing_key(),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(declare_err)?;

        Ok(())
    }
}

/// Reads `x-death[0].count` off a redelivered message's properties. Absent
/// the header (first-ever delivery, not yet dead-lettered), the count is 0.
pub fn x_death_count(properties: &BasicProperties) -> u32 {
    let Some(headers) = properties.headers() else { return 0 };
    let Some(AMQPValue::FieldArray(deaths)) = headers.inner().get("x-death") else { return 0 };
    let Some(AMQPValue::FieldTable(first)) = deaths.as_slice().first() else { return 0 };
    match first.inner().get("count") {
        Some(AMQPValue::LongLongInt(n)) => (*n).try_into().unwrap_or(0),
        Some(AMQPValue::LongInt(n)) => (*n).try_into().unwrap_or(0),
        _ => 0,
    }
}

/// Flattens the non-`x-death` AMQP headers to the plain string map the
/// transport-agnostic dead-letter handler carries forward on republish.
///
/// `x-death` is handled separately by [`decode_death_history`]/
/// [`build_death_header`]: its native shape is an array of tables (count,
/// reason, queue, exchange, routing-keys), which a `HashMap<String, String>`
/// can't represent losslessly, so it never belongs in this map.
pub fn headers_to_map(properties: &BasicProperties) -> HashMap<String, String> {
    let Some(headers) = properties.headers() else { return HashMap::new() };
    headers
        .inner()
        .iter()
        .filter(|(k, _)| k.as_str() != "x-death")
        .map(|(k, v)| (k.to_string(), amqp_value_to_string(v)))
        .collect()
}

fn amqp_value_to_string(value: &AMQPValue) -> String {
    match value {
        AMQPValue::LongString(s) => s.to_string(),
        AMQPValue::ShortString(s) => s.to_string(),
        other => format!("{other:?}"),
    }
}

/// Decodes the full `x-death` array off a redelivered message's properties
/// into [`DeathRecord`]s, in broker order (most recent death first). Absent
/// the header, returns an empty history.
pub fn decode_death_history(properties: &BasicProperties) -> Vec<DeathRecord> {
    let Some(headers) = properties.headers() else { return Vec::new() };
    let Some(AMQPValue::FieldArray(deaths)) = headers.inner().get("x-death") else { return Vec::new() };

    deaths
        .as_slice()
        .iter()
        .filter_map(|entry| {
            let AMQPValue::FieldTable(table) = entry else { return None };
            let count = match table.inner().get("count") {
                Some(AMQPValue::LongLongInt(n)) => *n,
                Some(AMQPValue::LongInt(n)) => i64::from(*n),
                _ => 0,
            };
            let text = |key: &str| match table.inner().get(key) {
                Some(AMQPValue::LongString(s)) => s.to_string(),
                Some(AMQPValue::ShortString(s)) => s.to_string(),
                _ => String::new(),
            };
            let routing_keys = match table.inner().get("routing-keys") {
                Some(AMQPValue::FieldArray(keys)) => keys
                    .as_slice()
                    .iter()
                    .filter_map(|v| match v {
                        AMQPValue::LongString(s) => Some(s.to_string()),
                        AMQPValue::ShortString(s) => Some(s.to_string()),
                        _ => None,
                    })
                    .collect(),
                _ => Vec::new(),
            };
            Some(DeathRecord {
                count,
                reason: text("reason"),
                queue: text("queue"),
                exchange: text("exchange"),
                routing_keys,
            })
        })
        .collect()
}

/// Rebuilds an `x-death` header value from a decoded history, the inverse
/// of [`decode_death_history`]. Used on republish so the broker sees the
/// same array-of-tables shape it would have produced itself.
fn build_death_header(records: &[DeathRecord]) -> AMQPValue {
    let entries = records
        .iter()
        .map(|record| {
            let mut table = FieldTable::default();
            table.insert(ShortString::from("count"), AMQPValue::LongLongInt(record.count));
            table.insert(ShortString::from("reason"), AMQPValue::LongString(LongString::from(record.reason.as_str())));
            table.insert(ShortString::from("queue"), AMQPValue::LongString(LongString::from(record.queue.as_str())));
            table.insert(ShortString::from("exchange"), AMQPValue::LongString(LongString::from(record.exchange.as_str())));
            let routing_keys: Vec<AMQPValue> = record
                .routing_keys
                .iter()
                .map(|key| AMQPValue::LongString(LongString::from(key.as_str())))
                .collect();
            table.insert(ShortString::from("routing-keys"), AMQPValue::FieldArray(FieldArray::from(routing_keys)));
            AMQPValue::FieldTable(table)
        })
        .collect::<Vec<_>>();
    AMQPValue::FieldArray(FieldArray::from(entries))
}

#[cfg(test)]
mod death_header_tests {
    use super::*;

    fn properties_with_death(records: &[DeathRecord]) -> BasicProperties {
        let mut headers = FieldTable::default();
        headers.insert(ShortString::from("x-death"), build_death_header(records));
        BasicProperties::default().with_headers(headers)
    }

    #[test]
    fn death_history_round_trips_through_amqp_headers() {
        let original = vec![DeathRecord {
            count: 2,
            reason: "expired".to_string(),
            queue: "fetch_url.dlq".to_string(),
            exchange: "fetch_url.dlq.exchange".to_string(),
            routing_keys: vec!["fetch_url.dlq".to_string()],
        }];

        let properties = properties_with_death(&original);
        let decoded = decode_death_history(&properties);

        assert_eq!(decoded, original);
    }

    #[test]
    fn republished_death_count_is_readable_by_x_death_count() {
        let original = vec![DeathRecord {
            count: 1,
            reason: "rejected".to_string(),
            queue: "fetch_url.dlq".to_string(),
            exchange: "fetch_url.dlq.exchange".to_string(),
            routing_keys: vec![],
        }];

        let incoming = properties_with_death(&original);
        let history = decode_death_history(&incoming);

        // Simulate what `try_publish` does with a non-empty `death_history`:
        // rebuild the header from the decoded history and confirm the count
        // carried forward is still readable off the rebuilt properties,
        // rather than resetting to 0 the way the old x-death-stripping
        // `headers_to_map` would have.
        let mut rebuilt_headers = FieldTable::default();
        rebuilt_headers.insert(ShortString::from("x-death"), build_death_header(&history));
        let republished = BasicProperties::default().with_headers(rebuilt_headers);

        assert_eq!(x_death_count(&republished), 1);
    }

    #[test]
    fn headers_to_map_still_excludes_x_death() {
        let properties = properties_with_death(&[DeathRecord { count: 1, ..Default::default() }]);
        assert!(!headers_to_map(&properties).contains_key("x-death"));
    }
}
