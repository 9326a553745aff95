//! Gateway WebSocket handler.
//!
//! Drives the session of one shard and runs every dispatch through the
//! event pipeline, inline on the read loop:
//! 1. Normalize the frame (malformed frames are dropped and counted)
//! 2. Drop sequence numbers already seen (resume replays)
//! 3. Apply to the entity cache
//! 4. Publish to the exchange with the event type as routing key
//!
//! Nothing is spawned per event, so per-shard publish order is arrival order.

use crate::protocol::{self, classify_close, CloseAction, Hello, Ready};
use crate::registry::ShardRegistry;
use crate::session::{HelloAction, Session};
use amqp_client::{AMQPValue, BasicProperties, FieldTable, Publish};
use async_trait::async_trait;
use chrono::Utc;
use common::error::{Error, Result};
use common::{Directive, WsHandler};
use entity_cache::EntityCache;
use metrics::counter;
use normalizer::{normalize, parse_frame, GatewayFrame, NormalizedEvent, OpCode};
use parking_lot::Mutex;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Static settings of one shard.
#[derive(Debug, Clone)]
pub struct ShardConfig {
    pub shard_id: u64,
    /// Total shard count across all workers.
    pub shard_total: u64,
    pub token: String,
    pub intents: u64,
    pub gateway_url: String,
    pub max_resume_attempts: u32,
    pub cache_enabled: bool,
}

/// Gateway handler for one shard.
pub struct DiscordHandler<P: Publish> {
    config: ShardConfig,
    session: Mutex<Session>,
    cache: EntityCache,
    publisher: P,
    registry: ShardRegistry,
    /// Worker ID for logging.
    worker_id: String,
}

impl<P: Publish> DiscordHandler<P> {
    pub fn new(
        config: ShardConfig,
        cache: EntityCache,
        publisher: P,
        registry: ShardRegistry,
    ) -> Self {
        let worker_id = format!("shard-{}", config.shard_id);
        let session = Session::new(config.max_resume_attempts);
        Self {
            config,
            session: Mutex::new(session),
            cache,
            publisher,
            registry,
            worker_id,
        }
    }

    pub fn shard_id(&self) -> u64 {
        self.config.shard_id
    }

    /// Mirror the session into the registry.
    fn sync_registry(&self, session: &Session) {
        let state = session.state();
        let sequence = session.sequence();
        self.registry.update(self.config.shard_id, |status| {
            status.state = state;
            status.sequence = sequence;
        });
    }

    /// Forget the session and everything cached from it.
    fn invalidate_session(&self) {
        let mut session = self.session.lock();
        session.invalidate();
        self.sync_registry(&session);
        drop(session);

        let dropped = self.cache.invalidate_shard(self.config.shard_id);
        info!(
            "[{}] Session invalidated, dropped {} cached guilds",
            self.worker_id, dropped
        );
    }

    fn on_hello(&self, frame: &GatewayFrame) -> Result<Vec<Directive>> {
        let hello: Hello = frame
            .data_str()
            .ok_or_else(|| Error::HandshakeFailed("Hello without data".to_string()))
            .and_then(|d| serde_json::from_str(d).map_err(Error::from))?;
        let period = Duration::from_millis(hello.heartbeat_interval);

        let mut session = self.session.lock();
        let had_session = session.session_id().is_some();
        let action = session.on_hello();
        self.sync_registry(&session);
        drop(session);

        let handshake = match action {
            HelloAction::Identify => {
                if had_session {
                    // Resume attempts ran out; guilds left while away are never deleted.
                    let dropped = self.cache.invalidate_shard(self.config.shard_id);
                    info!(
                        "[{}] Abandoned session, dropped {} cached guilds",
                        self.worker_id, dropped
                    );
                }
                info!("[{}] Identifying", self.worker_id);
                protocol::identify(
                    &self.config.token,
                    self.config.intents,
                    self.config.shard_id,
                    self.config.shard_total,
                )
            }
            HelloAction::Resume {
                session_id,
                sequence,
            } => {
                info!(
                    "[{}] Resuming session {} at sequence {}",
                    self.worker_id, session_id, sequence
                );
                protocol::resume(&self.config.token, &session_id, sequence)
            }
        };

        Ok(vec![
            Directive::StartHeartbeat(period),
            Directive::Send(handshake),
        ])
    }

    async fn on_dispatch(&self, frame: &GatewayFrame) -> Result<Vec<Directive>> {
        let event = match normalize(frame, self.config.shard_id) {
            Ok(event) => event,
            Err(e) => {
                warn!("[{}] Dropping malformed dispatch: {}", self.worker_id, e);
                counter!("rateway_malformed_events_total", "shard" => self.worker_id.clone())
                    .increment(1);
                return Ok(Vec::new());
            }
        };

        let mut directives = Vec::new();
        {
            let mut session = self.session.lock();
            if let Some(seq) = event.sequence {
                if !session.observe_sequence(seq) {
                    debug!(
                        "[{}] Dropping replayed {} at sequence {}",
                        self.worker_id, event.kind, seq
                    );
                    counter!("rateway_replayed_events_total", "shard" => self.worker_id.clone())
                        .increment(1);
                    return Ok(Vec::new());
                }
            }

            match event.kind.as_str() {
                "READY" => match serde_json::from_slice::<Ready>(&event.payload) {
                    Ok(ready) => {
                        let resume_url = ready
                            .resume_gateway_url
                            .as_deref()
                            .map(|url| protocol::resume_url(url, &self.config.gateway_url));
                        info!(
                            "[{}] Ready, session {}",
                            self.worker_id, ready.session_id
                        );
                        session.on_ready(ready.session_id, resume_url);
                        directives.push(Directive::SessionReady);
                    }
                    Err(e) => {
                        warn!("[{}] READY without session id: {}", self.worker_id, e);
                    }
                },
                "RESUMED" => {
                    info!("[{}] Resumed", self.worker_id);
                    session.on_resumed();
                    directives.push(Directive::SessionReady);
                }
                _ => {}
            }
            self.sync_registry(&session);
        }

        let now = Utc::now().timestamp_millis();
        self.registry.update(self.config.shard_id, |status| {
            status.last_event_at = Some(now);
        });

        if self.config.cache_enabled {
            if let Err(e) = self.cache.apply(&event) {
                warn!(
                    "[{}] Cache could not apply {}: {}",
                    self.worker_id, event.kind, e
                );
                counter!("rateway_cache_errors_total", "shard" => self.worker_id.clone())
                    .increment(1);
            }
        }

        self.publish(&event).await;
        Ok(directives)
    }

    /// Publish one event. Broker failures drop the event.
    async fn publish(&self, event: &NormalizedEvent) {
        let mut headers = FieldTable::default();
        headers.insert(
            "shard_id".into(),
            AMQPValue::LongLongInt(event.shard_id as i64),
        );
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_headers(headers);

        match self
            .publisher
            .publish(&event.kind, &event.payload, properties)
            .await
        {
            Ok(()) => {
                counter!("rateway_events_published_total", "shard" => self.worker_id.clone())
                    .increment(1);
            }
            Err(e) => {
                error!(
                    "[{}] Failed to publish {}: {:#}",
                    self.worker_id, event.kind, e
                );
                counter!("rateway_publish_errors_total", "shard" => self.worker_id.clone())
                    .increment(1);
            }
        }
    }
}

#[async_trait]
impl<P: Publish> WsHandler for DiscordHandler<P> {
    fn url(&self) -> String {
        let session = self.session.lock();
        session
            .resume_url()
            .map(str::to_string)
            .unwrap_or_else(|| self.config.gateway_url.clone())
    }

    async fn on_message(&self, msg: &str) -> Result<Vec<Directive>> {
        let frame = match parse_frame(msg) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("[{}] Dropping unparseable frame: {}", self.worker_id, e);
                counter!("rateway_malformed_events_total", "shard" => self.worker_id.clone())
                    .increment(1);
                return Ok(Vec::new());
            }
        };

        match frame.op {
            OpCode::Dispatch => self.on_dispatch(&frame).await,
            OpCode::Hello => self.on_hello(&frame),
            OpCode::Heartbeat => {
                debug!("[{}] Heartbeat requested", self.worker_id);
                let seq = self.session.lock().sequence();
                Ok(vec![Directive::Send(protocol::heartbeat(seq))])
            }
            OpCode::HeartbeatAck => {
                self.session.lock().heartbeat_acked();
                Ok(Vec::new())
            }
            OpCode::Reconnect => {
                info!("[{}] Gateway requested reconnect", self.worker_id);
                Ok(vec![Directive::Reconnect])
            }
            OpCode::InvalidSession => {
                let resumable = frame.data_str().map(str::trim) == Some("true");
                warn!(
                    "[{}] Invalid session (resumable: {})",
                    self.worker_id, resumable
                );
                if !resumable {
                    self.invalidate_session();
                }
                Ok(vec![Directive::Reconnect])
            }
            other => {
                debug!("[{}] Ignoring opcode {:?}", self.worker_id, other);
                Ok(Vec::new())
            }
        }
    }

    async fn heartbeat(&self) -> Result<String> {
        let mut session = self.session.lock();
        if session.heartbeat_sent().is_err() {
            warn!("[{}] Heartbeat not acknowledged", self.worker_id);
            return Err(Error::ZombieConnection);
        }
        Ok(protocol::heartbeat(session.sequence()))
    }

    fn on_close(&self, code: Option<u16>) -> Error {
        let Some(code) = code else {
            return Error::ConnectionClosed(None);
        };

        match classify_close(code) {
            CloseAction::Fatal => {
                error!(
                    "[{}] Gateway closed with fatal code {}",
                    self.worker_id, code
                );
                Error::Fatal(format!("gateway close code {}", code))
            }
            CloseAction::Reidentify => {
                self.invalidate_session();
                Error::ConnectionClosed(Some(code))
            }
            CloseAction::Resume => Error::ConnectionClosed(Some(code)),
        }
    }

    async fn on_disconnect(&self, reason: &Error) {
        warn!("[{}] Gateway connection lost: {}", self.worker_id, reason);
        let mut session = self.session.lock();
        session.on_disconnect();
        self.sync_registry(&session);
        drop(session);

        self.registry.update(self.config.shard_id, |status| {
            status.disconnects += 1;
        });
    }

    async fn on_reconnect(&self) {
        info!("[{}] Gateway socket open, waiting for Hello", self.worker_id);
        let mut session = self.session.lock();
        session.on_connected();
        self.sync_registry(&session);
    }
}
