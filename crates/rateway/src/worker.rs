//! Process wiring for one worker.
//!
//! ```text
//! shards ──events──▶ exchange rateway-N (routing key = event type)
//! rateway-gateway-N ──▶ RelayHandler ──▶ shard sockets
//! rateway-cache-N ──▶ QueryHandler ──▶ exchange (routing key = return_routing_key)
//! ```

use crate::api::{create_router, AppState};
use crate::config::Config;
use crate::query::QueryHandler;
use crate::relay::RelayHandler;
use crate::supervisor::ShardSupervisor;
use amqp_client::{AmqpClient, ConsumerService, ExchangePublisher, Topology};
use anyhow::{anyhow, Result};
use entity_cache::{CacheConfig, EntityCache};
use shard::ShardRegistry;
use tokio::sync::mpsc;
use tracing::{error, info};

pub struct Worker {
    config: Config,
    client: AmqpClient,
    topology: Topology,
    cache: EntityCache,
    registry: ShardRegistry,
}

impl Worker {
    /// Connect to the broker and declare this worker's exchange and queues.
    pub async fn build(config: Config) -> Result<Self> {
        let client = AmqpClient::connect(&config.amqp_uri).await?;
        let topology = Topology::for_cluster(config.cluster_id());
        client.declare_topology(&topology).await?;

        let cache = EntityCache::with_config(CacheConfig {
            message_cache_size: config.message_cache_size,
        });
        if !config.cache_enabled {
            info!("Entity cache disabled; cache queries will answer not_found");
        }

        Ok(Self {
            config,
            client,
            topology,
            cache,
            registry: ShardRegistry::new(),
        })
    }

    /// Run until Ctrl+C or until the broker connection is lost.
    ///
    /// Losing the broker is an error: the worker cannot publish or take
    /// commands without it.
    pub async fn run(self) -> Result<()> {
        let publisher = ExchangePublisher::new(self.client.clone(), self.topology.exchange.clone());

        let (relay_shutdown_tx, relay_shutdown_rx) = mpsc::channel::<()>(1);
        let relay = ConsumerService::new(
            RelayHandler::new(self.registry.clone()),
            self.client
                .consume(&self.topology.gateway_queue, "rateway-relay")
                .await?,
            relay_shutdown_rx,
        );
        let mut relay_task = tokio::spawn(relay.run());

        let (query_shutdown_tx, query_shutdown_rx) = mpsc::channel::<()>(1);
        let query = ConsumerService::new(
            QueryHandler::new(self.cache.clone(), publisher.clone()),
            self.client
                .consume(&self.topology.cache_queue, "rateway-cache")
                .await?,
            query_shutdown_rx,
        );
        let mut query_task = tokio::spawn(query.run());

        let (http_shutdown_tx, mut http_shutdown_rx) = mpsc::channel::<()>(1);
        let router = create_router(AppState {
            cluster_id: self.config.cluster_id(),
            cache: self.cache.clone(),
            registry: self.registry.clone(),
        });
        let listener =
            tokio::net::TcpListener::bind(format!("0.0.0.0:{}", self.config.http_port)).await?;
        info!("HTTP API listening on http://0.0.0.0:{}", self.config.http_port);
        info!("  GET /health - Health check");
        info!("  GET /stats  - Shard and cache statistics");
        let http_task = tokio::spawn(async move {
            let shutdown = async move {
                http_shutdown_rx.recv().await;
            };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!("HTTP server failed: {:?}", e);
            }
        });

        let mut supervisor =
            ShardSupervisor::new(&self.config, self.cache.clone(), publisher, self.registry.clone());
        supervisor.start_all(self.config.shard_range());

        let outcome = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                Ok(())
            }
            res = &mut relay_task => Err(consumer_ended("relay", res)),
            res = &mut query_task => Err(consumer_ended("cache-query", res)),
        };

        supervisor.shutdown().await;

        let _ = relay_shutdown_tx.send(()).await;
        let _ = query_shutdown_tx.send(()).await;
        let _ = http_shutdown_tx.send(()).await;
        if !relay_task.is_finished() {
            let _ = relay_task.await;
        }
        if !query_task.is_finished() {
            let _ = query_task.await;
        }
        let _ = http_task.await;

        if let Err(e) = self.client.close().await {
            error!("Failed to close broker connection: {:#}", e);
        }

        info!("Worker {} stopped", self.config.cluster_id());
        outcome
    }
}

/// A consumer task ended before shutdown was requested.
fn consumer_ended(
    name: &str,
    res: std::result::Result<Result<()>, tokio::task::JoinError>,
) -> anyhow::Error {
    let err = match res {
        Ok(Ok(())) => anyhow!("{} consumer stopped unexpectedly", name),
        Ok(Err(e)) => e.context(format!("{} consumer lost the broker", name)),
        Err(e) => anyhow!("{} consumer task panicked: {}", name, e),
    };
    error!("{:#}", err);
    err
}
