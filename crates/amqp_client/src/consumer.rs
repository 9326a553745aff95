//! Generic consume-handle-ack loop.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::{message::Delivery, options::BasicAckOptions, Consumer};
use tokio::sync::mpsc;
use tracing::{error, info};

/// Handles one delivery. Handlers deal with their own failures: the loop
/// acknowledges every delivery once `handle` returns.
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    /// Name used in logs.
    const NAME: &'static str;

    async fn handle(&self, delivery: &Delivery);
}

/// Runs a [`DeliveryHandler`] over a queue consumer until shutdown.
pub struct ConsumerService<H: DeliveryHandler> {
    handler: H,
    consumer: Consumer,
    shutdown_rx: mpsc::Receiver<()>,
}

impl<H: DeliveryHandler> ConsumerService<H> {
    pub fn new(handler: H, consumer: Consumer, shutdown_rx: mpsc::Receiver<()>) -> Self {
        Self {
            handler,
            consumer,
            shutdown_rx,
        }
    }

    /// Run the loop.
    ///
    /// Returns an error when the broker side goes away (stream error, stream
    /// end or failed ack); the process cannot do its job without it.
    pub async fn run(mut self) -> Result<()> {
        info!("{} consumer running", H::NAME);

        loop {
            tokio::select! {
                biased;  // Prioritize shutdown signal

                _ = self.shutdown_rx.recv() => {
                    info!("{} consumer received shutdown signal", H::NAME);
                    break;
                }

                delivery = self.consumer.next() => {
                    match delivery {
                        Some(Ok(delivery)) => {
                            self.handler.handle(&delivery).await;
                            delivery.ack(BasicAckOptions::default()).await?;
                        }
                        Some(Err(e)) => {
                            error!("[{}] Consumer error: {:?}", H::NAME, e);
                            return Err(e.into());
                        }
                        None => {
                            return Err(anyhow!("{} consumer stream ended", H::NAME));
                        }
                    }
                }
            }
        }

        info!("{} consumer stopped", H::NAME);
        Ok(())
    }
}
