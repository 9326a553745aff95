//! Connection Supervisor - runs one gateway connection per shard.

use crate::config::Config;
use crate::error::Result;
use amqp_client::Publish;
use common::{ControlCommand, WsManager, WsManagerConfig};
use entity_cache::EntityCache;
use metrics::{counter, gauge};
use shard::{DiscordHandler, ShardConfig, ShardRegistry};
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Buffered commands per shard; `send` fails once it is full.
const COMMAND_BUFFER: usize = 32;

/// Gap between the first connection of consecutive shards, so their
/// Identify calls stay under the gateway's one-per-5s limit.
pub const IDENTIFY_INTERVAL: Duration = Duration::from_secs(5);

/// How long shutdown waits for shards to close their sockets.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Writes a raw payload on a shard's live connection.
pub trait ShardSender: Send + Sync + 'static {
    /// Best-effort: fails with `ShardNotConnected` instead of buffering.
    fn send(&self, shard_id: u64, payload: String) -> Result<()>;
}

impl ShardSender for ShardRegistry {
    fn send(&self, shard_id: u64, payload: String) -> Result<()> {
        ShardRegistry::send(self, shard_id, payload).map_err(Into::into)
    }
}

/// Owns the shard tasks of this worker.
pub struct ShardSupervisor<P: Publish + Clone> {
    template: ShardConfig,
    ws_config: WsManagerConfig,
    cache: EntityCache,
    publisher: P,
    registry: ShardRegistry,
    /// Running shard tasks indexed by shard id.
    shards: HashMap<u64, JoinHandle<()>>,
}

impl<P: Publish + Clone> ShardSupervisor<P> {
    pub fn new(config: &Config, cache: EntityCache, publisher: P, registry: ShardRegistry) -> Self {
        let template = ShardConfig {
            shard_id: 0,
            shard_total: config.shards.count,
            token: config.token.clone(),
            intents: config.intents,
            gateway_url: config.gateway_url.clone(),
            max_resume_attempts: config.max_resume_attempts,
            cache_enabled: config.cache_enabled,
        };

        Self {
            template,
            ws_config: WsManagerConfig::default(),
            cache,
            publisher,
            registry,
            shards: HashMap::new(),
        }
    }

    pub fn with_ws_config(mut self, ws_config: WsManagerConfig) -> Self {
        self.ws_config = ws_config;
        self
    }

    /// Start the connection of one shard.
    pub fn start_shard(&mut self, shard_id: u64) {
        self.start_shard_after(shard_id, Duration::ZERO);
    }

    /// Start every shard in `range`, spacing their first connections by
    /// [`IDENTIFY_INTERVAL`]. Returns immediately.
    pub fn start_all(&mut self, range: Range<u64>) {
        info!(
            "Starting shards {}..{} of {}",
            range.start, range.end, self.template.shard_total
        );
        for (i, shard_id) in range.enumerate() {
            self.start_shard_after(shard_id, IDENTIFY_INTERVAL * i as u32);
        }
    }

    fn start_shard_after(&mut self, shard_id: u64, delay: Duration) {
        if self.shards.contains_key(&shard_id) {
            warn!("Shard {} already running", shard_id);
            return;
        }

        let worker_id = format!("shard-{}", shard_id);
        info!("Spawning {}", worker_id);

        let (command_tx, command_rx) = mpsc::channel::<ControlCommand>(COMMAND_BUFFER);
        self.registry.register(shard_id, command_tx);

        let handler = DiscordHandler::new(
            ShardConfig {
                shard_id,
                ..self.template.clone()
            },
            self.cache.clone(),
            self.publisher.clone(),
            self.registry.clone(),
        );
        let manager = WsManager::new(
            Arc::new(handler),
            self.ws_config.clone(),
            command_rx,
            worker_id.clone(),
        );

        let join_handle = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Err(e) = manager.run().await {
                error!("[{}] Shard stopped: {}", worker_id, e);
                counter!("rateway_shards_failed_total").increment(1);
            }
        });

        self.shards.insert(shard_id, join_handle);
        gauge!("rateway_shards_total").set(self.shards.len() as f64);
    }

    /// Write `payload` on the connection of `shard_id`.
    pub fn send(&self, shard_id: u64, payload: String) -> Result<()> {
        ShardSender::send(&self.registry, shard_id, payload)
    }

    pub fn registry(&self) -> &ShardRegistry {
        &self.registry
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Close every connection and wait for the shard tasks to end.
    pub async fn shutdown(&mut self) {
        info!("Stopping {} shards", self.shards.len());
        self.registry.shutdown_all();

        for (shard_id, mut handle) in self.shards.drain() {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                warn!("Shard {} did not stop in time, aborting", shard_id);
                handle.abort();
            }
        }
        gauge!("rateway_shards_total").set(0.0);
    }
}
