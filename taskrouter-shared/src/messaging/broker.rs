//! # RabbitMQ Broker Plumbing
//!
//! Connection management and idempotent topology declaration for the
//! priority-queue layout:
//!
//! - `priority-exchange` (topic, durable) carrying the `priority.*` keys
//! - `anomaly-exchange` (direct, durable) carrying `anomaly.detected`
//! - `dlq-exchange` (direct, durable) with `dlq-queue` bound on `failed`
//! - six destination queues with `x-max-priority`, `x-message-ttl`,
//!   `x-max-length`, `x-overflow=reject-publish`, dead-lettering into
//!   `dlq-exchange`
//!
//! Both roles declare the topology at startup; declaring N times yields
//! the same broker state as declaring once.
//!
//! One connection per process. The broker owns a single confirm-mode
//! publish channel; consumers create one channel each via
//! [`RabbitBroker::create_channel`] and never share it across workers.

use lapin::options::{
    BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions, QueuePurgeOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tracing::{debug, info};

use super::errors::MessagingError;
use crate::config::BrokerConfig;
use crate::models::destination::{
    Destination, ANOMALY_EXCHANGE, DLQ_EXCHANGE, DLQ_QUEUE, DLQ_ROUTING_KEY, PRIORITY_EXCHANGE,
};

/// RabbitMQ connection plus the process-wide publish channel.
pub struct RabbitBroker {
    connection: Connection,
    publish_channel: Channel,
    config: BrokerConfig,
}

impl RabbitBroker {
    /// Connect and open the confirm-mode publish channel.
    pub async fn connect(config: &BrokerConfig) -> Result<Self, MessagingError> {
        let connection = Connection::connect(
            &config.amqp_url(),
            ConnectionProperties::default().with_connection_name("taskrouter".into()),
        )
        .await
        .map_err(|e| MessagingError::connection(format!("RabbitMQ connection failed: {e}")))?;

        let publish_channel = connection
            .create_channel()
            .await
            .map_err(|e| MessagingError::connection(format!("Channel creation failed: {e}")))?;

        // Publisher confirms let the broker's reject-publish overflow
        // surface as a nack instead of a silent drop.
        publish_channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| MessagingError::connection(format!("confirm_select failed: {e}")))?;

        info!(url = %config.redacted_url(), "Connected to RabbitMQ");

        Ok(Self {
            connection,
            publish_channel,
            config: config.clone(),
        })
    }

    /// Declare exchanges, queues, and bindings. Safe to call repeatedly.
    pub async fn declare_topology(&self) -> Result<(), MessagingError> {
        self.declare_exchange(PRIORITY_EXCHANGE, ExchangeKind::Topic)
            .await?;
        self.declare_exchange(ANOMALY_EXCHANGE, ExchangeKind::Direct)
            .await?;
        self.declare_exchange(DLQ_EXCHANGE, ExchangeKind::Direct)
            .await?;

        // DLQ first so destination queues can dead-letter into it.
        self.publish_channel
            .queue_declare(
                DLQ_QUEUE,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::topology(DLQ_QUEUE, e.to_string()))?;
        self.bind_queue(DLQ_QUEUE, DLQ_EXCHANGE, DLQ_ROUTING_KEY)
            .await?;

        for destination in Destination::ALL {
            self.declare_destination_queue(destination).await?;
            self.bind_queue(
                destination.queue_name(),
                destination.exchange(),
                destination.routing_key(),
            )
            .await?;
        }

        info!("Broker topology declared");
        Ok(())
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
    ) -> Result<(), MessagingError> {
        self.publish_channel
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::topology(name, e.to_string()))?;
        debug!(exchange = name, "Exchange declared");
        Ok(())
    }

    async fn declare_destination_queue(
        &self,
        destination: Destination,
    ) -> Result<(), MessagingError> {
        let mut args = FieldTable::default();
        args.insert(
            "x-max-priority".into(),
            AMQPValue::LongInt(i32::from(destination.max_wire_priority())),
        );
        args.insert(
            "x-message-ttl".into(),
            AMQPValue::LongInt(destination.message_ttl_ms() as i32),
        );
        args.insert(
            "x-max-length".into(),
            AMQPValue::LongInt(destination.max_depth() as i32),
        );
        args.insert(
            "x-overflow".into(),
            AMQPValue::LongString("reject-publish".into()),
        );
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(DLQ_EXCHANGE.into()),
        );
        args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(DLQ_ROUTING_KEY.into()),
        );

        self.publish_channel
            .queue_declare(
                destination.queue_name(),
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                args,
            )
            .await
            .map_err(|e| MessagingError::topology(destination.queue_name(), e.to_string()))?;
        debug!(queue = destination.queue_name(), "Queue declared");
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), MessagingError> {
        self.publish_channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                MessagingError::topology(queue, format!("bind to {exchange} failed: {e}"))
            })?;
        Ok(())
    }

    /// Publish a prepared payload and wait for the broker confirm.
    ///
    /// A broker nack (overflow `reject-publish`, unroutable message) maps
    /// to [`MessagingError::PublishRejected`] so the caller can surface it
    /// distinctly from transport failures.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), MessagingError> {
        let confirm = self
            .publish_channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| MessagingError::send(routing_key, format!("publish failed: {e}")))?;

        let confirmation = confirm.await.map_err(|e| {
            MessagingError::send(routing_key, format!("publish confirmation failed: {e}"))
        })?;

        if let Confirmation::Nack(_) = confirmation {
            return Err(MessagingError::publish_rejected(routing_key));
        }
        Ok(())
    }

    /// Open a dedicated channel for one logical consumer.
    pub async fn create_channel(&self) -> Result<Channel, MessagingError> {
        self.connection
            .create_channel()
            .await
            .map_err(|e| MessagingError::connection(format!("Channel creation failed: {e}")))
    }

    /// Message count via passive declare, for backpressure observation.
    pub async fn queue_depth(&self, destination: Destination) -> Result<u32, MessagingError> {
        let state = self
            .publish_channel
            .queue_declare(
                destination.queue_name(),
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                MessagingError::queue_operation(destination.queue_name(), "depth", e.to_string())
            })?;
        Ok(state.message_count())
    }

    /// Drop all messages from a destination queue. Test support.
    pub async fn purge(&self, destination: Destination) -> Result<u32, MessagingError> {
        let purged = self
            .publish_channel
            .queue_purge(destination.queue_name(), QueuePurgeOptions::default())
            .await
            .map_err(|e| {
                MessagingError::queue_operation(destination.queue_name(), "purge", e.to_string())
            })?;
        Ok(purged)
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    /// Connection URL with credentials elided, for logging.
    pub fn redacted_url(&self) -> String {
        self.config.redacted_url()
    }

    pub async fn close(&self) -> Result<(), MessagingError> {
        self.connection
            .close(200, "shutdown")
            .await
            .map_err(|e| MessagingError::connection(format!("close failed: {e}")))?;
        info!("RabbitMQ connection closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;

    fn test_config() -> BrokerConfig {
        BrokerConfig::default()
    }

    // Integration tests require RabbitMQ; run the broker from
    // docker compose and re-run with `cargo test -- --ignored`.

    #[tokio::test]
    #[ignore = "requires RabbitMQ running"]
    async fn connect_and_declare_topology_is_idempotent() {
        let broker = RabbitBroker::connect(&test_config()).await.unwrap();
        broker.declare_topology().await.unwrap();
        broker.declare_topology().await.unwrap();
        assert!(broker.is_connected());
        broker.close().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires RabbitMQ running"]
    async fn queue_depth_reads_zero_after_purge() {
        let broker = RabbitBroker::connect(&test_config()).await.unwrap();
        broker.declare_topology().await.unwrap();
        broker.purge(Destination::Normal).await.unwrap();
        let depth = broker.queue_depth(Destination::Normal).await.unwrap();
        assert_eq!(depth, 0);
    }
}
