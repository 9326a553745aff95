//! Publishing seam between the pipelines and the broker.

use crate::client::AmqpClient;
use anyhow::Result;
use async_trait::async_trait;
use lapin::BasicProperties;

/// Something messages can be published to by routing key.
///
/// Implemented by [`ExchangePublisher`] for the live broker; tests plug in
/// recorders.
#[async_trait]
pub trait Publish: Send + Sync + 'static {
    async fn publish(
        &self,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<()>;
}

/// Publishes to one fixed exchange.
#[derive(Clone)]
pub struct ExchangePublisher {
    client: AmqpClient,
    exchange: String,
}

impl ExchangePublisher {
    pub fn new(client: AmqpClient, exchange: impl Into<String>) -> Self {
        Self {
            client,
            exchange: exchange.into(),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }
}

#[async_trait]
impl Publish for ExchangePublisher {
    async fn publish(
        &self,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<()> {
        self.client
            .publish(&self.exchange, routing_key, payload, properties)
            .await
    }
}
