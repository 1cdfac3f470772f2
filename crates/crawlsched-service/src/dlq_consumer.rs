//! Bridges a live `lapin` consumer on each event's dead-letter queue to
//! [`DeadLetterHandler`], the transport-agnostic ring-retry decision. One
//! task per [`RabbitMqEvent`] variant, spawned at startup and left running
//! for the service's lifetime.

use crawlsched_broker_amqp::{decode_death_history, headers_to_map, x_death_count, AmqpBroker};
use crawlsched_core::events::RabbitMqEvent;
use crawlsched_dlq::DeadLetterHandler;
use futures::StreamExt;

pub fn spawn_all(broker: AmqpBroker) -> Vec<tokio::task::JoinHandle<()>> {
    RabbitMqEvent::ALL
        .iter()
        .copied()
        .map(|event| spawn_one(broker.clone(), event))
        .collect()
}

fn spawn_one(broker: AmqpBroker, event: RabbitMqEvent) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let handler = DeadLetterHandler::new(broker.clone());
        let consumer_tag = format!("dlq-relay.{}", event.queue_dead_letter());
        let mut consumer = match broker.consume(&event.queue_dead_letter(), &consumer_tag).await {
            Ok(consumer) => consumer,
            Err(e) => {
                tracing::error!(queue = event.queue_dead_letter(), error = %e, "failed to open dlq consumer");
                return;
            }
        };

        while let Some(delivery) = consumer.next().await {
            let delivery = match delivery {
                Ok(delivery) => delivery,
                Err(e) => {
                    tracing::error!(queue = event.queue_dead_letter(), error = %e, "dlq delivery error");
                    continue;
                }
            };

            let death_count = x_death_count(&delivery.properties);
            let headers = headers_to_map(&delivery.properties);
            let death_history = decode_death_history(&delivery.properties);
            let body: serde_json::Value = match serde_json::from_slice(&delivery.data) {
                Ok(body) => body,
                Err(e) => {
                    tracing::error!(queue = event.queue_dead_letter(), error = %e, "dlq message is not valid json, dropping");
                    let _ = broker.ack(&delivery).await;
                    continue;
                }
            };

            if let Err(e) = handler.handle(event, death_count, body, headers, death_history).await {
                tracing::error!(queue = event.queue_dead_letter(), error = %e, "dead-letter handling failed");
                continue;
            }
            if let Err(e) = broker.ack(&delivery).await {
                tracing::error!(queue = event.queue_dead_letter(), error = %e, "failed to ack dlq delivery");
            }
        }
    })
}
