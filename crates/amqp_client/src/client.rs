//! AMQP client with the worker exchange topology.

use anyhow::{bail, Result};
use lapin::{
    options::{
        BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use std::sync::Arc;
use tracing::info;

/// Routing key producers use to send payloads upstream.
pub const GATEWAY_ROUTING_KEY: &str = "gateway";

/// Routing key producers use for cache lookups.
pub const CACHE_ROUTING_KEY: &str = "cache";

/// Default number of unacknowledged deliveries per consumer.
pub const DEFAULT_PREFETCH: u16 = 64;

/// Names of the exchange and command queues of one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Direct exchange every event and reply is published to.
    pub exchange: String,
    /// Queue bound to `gateway`.
    pub gateway_queue: String,
    /// Queue bound to `cache`.
    pub cache_queue: String,
}

impl Topology {
    /// Topology of worker `cluster_id`.
    ///
    /// Creates exchange `rateway-{id}` with queues `rateway-gateway-{id}`
    /// and `rateway-cache-{id}`.
    pub fn for_cluster(cluster_id: u64) -> Self {
        Self {
            exchange: format!("rateway-{}", cluster_id),
            gateway_queue: format!("rateway-gateway-{}", cluster_id),
            cache_queue: format!("rateway-cache-{}", cluster_id),
        }
    }
}

/// Connection settings that run lapin's I/O on the current tokio runtime.
fn connection_properties() -> ConnectionProperties {
    ConnectionProperties::default()
        .with_executor(tokio_executor_trait::Tokio::current())
        .with_reactor(tokio_reactor_trait::Tokio)
}

/// Turns a broker nack into an error.
fn check_confirmation(confirmation: Confirmation, routing_key: &str) -> Result<()> {
    match confirmation {
        Confirmation::Nack(_) => bail!("broker rejected publish with routing key '{}'", routing_key),
        Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
    }
}

/// Wrapper around a lapin connection with one confirm-mode channel.
#[derive(Clone)]
pub struct AmqpClient {
    connection: Arc<Connection>,
    channel: Channel,
}

impl AmqpClient {
    /// Connect to the broker and open a publishing channel in confirm mode.
    pub async fn connect(uri: &str) -> Result<Self> {
        info!("Connecting to AMQP broker");
        let connection = Connection::connect(uri, connection_properties()).await?;
        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        Ok(Self {
            connection: Arc::new(connection),
            channel,
        })
    }

    /// Declare the worker exchange and the two command queues.
    ///
    /// The exchange is durable and never auto-deleted so consumer bindings
    /// survive restarts.
    pub async fn declare_topology(&self, topology: &Topology) -> Result<()> {
        info!("Declaring exchange '{}'", topology.exchange);

        self.channel
            .exchange_declare(
                &topology.exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    passive: false,
                    durable: true,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await?;

        for (queue, routing_key) in [
            (&topology.gateway_queue, GATEWAY_ROUTING_KEY),
            (&topology.cache_queue, CACHE_ROUTING_KEY),
        ] {
            self.channel
                .queue_declare(
                    queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;
            self.channel
                .queue_bind(
                    queue,
                    &topology.exchange,
                    routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
            info!("Queue '{}' bound to '{}'", queue, routing_key);
        }

        Ok(())
    }

    /// Start consuming a queue.
    ///
    /// The prefetch limit applies per consumer.
    pub async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Consumer> {
        info!("Consuming queue '{}' as '{}'", queue, consumer_tag);
        self.channel
            .basic_qos(DEFAULT_PREFETCH, BasicQosOptions::default())
            .await?;
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(consumer)
    }

    /// Publish a message and wait for the broker's confirmation.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<()> {
        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await?
            .await?;
        check_confirmation(confirmation, routing_key)
    }

    /// Close the connection, letting in-flight publishes settle first.
    pub async fn close(&self) -> Result<()> {
        if self.connection.status().connected() {
            self.connection.close(200, "shutdown").await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nack_is_an_error() {
        let err = check_confirmation(Confirmation::Nack(None), "MESSAGE_CREATE").unwrap_err();
        assert!(err.to_string().contains("MESSAGE_CREATE"));
        assert!(check_confirmation(Confirmation::Ack(None), "MESSAGE_CREATE").is_ok());
    }

    #[tokio::test]
    async fn test_connection_runs_on_tokio() {
        let properties = connection_properties();
        assert!(properties.executor.is_some());
        assert!(properties.reactor.is_some());
    }
}
