//! rateway worker entry point.
//!
//! Runs this worker's gateway shards, publishes their events to the AMQP
//! exchange and serves the `gateway` and `cache` command queues.

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use rateway::{Config, Worker};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;
    let shards = config.shard_range();
    info!(
        "Starting rateway worker {} (shards {}..{} of {})",
        config.cluster_id(),
        shards.start,
        shards.end,
        config.shards.count
    );

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()?;

    info!(
        "Prometheus metrics available at http://0.0.0.0:{}/metrics",
        config.metrics_port
    );

    let worker = Worker::build(config).await?;
    worker.run().await
}
