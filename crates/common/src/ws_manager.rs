//! WebSocket connection manager with heartbeats, reconnection, and a command channel.

use crate::error::{Error, Result};
use crate::messages::{ControlCommand, Directive};
use crate::ws_handler::WsHandler;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::{
    client_async_tls_with_config,
    tungstenite::protocol::{frame::coding::CloseCode, CloseFrame, Message},
    Connector,
};
use tracing::{debug, error, info, warn};
use url::Url;

/// Configuration for the WebSocket manager.
#[derive(Debug, Clone)]
pub struct WsManagerConfig {
    /// Timeout for each TCP connect attempt.
    pub connect_timeout: Duration,
    /// Initial delay before reconnection attempt.
    pub reconnect_delay: Duration,
    /// Maximum reconnection delay (for exponential backoff).
    pub max_reconnect_delay: Duration,
}

impl Default for WsManagerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
        }
    }
}

/// Exponential reconnect delay.
///
/// Grows after every failed attempt, including sockets the upstream accepts
/// and then closes, and starts over only once a session was reported ready.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(config: &WsManagerConfig) -> Self {
        Self {
            initial: config.reconnect_delay,
            max: config.max_reconnect_delay,
            current: config.reconnect_delay,
        }
    }

    /// Delay before the next attempt.
    pub fn next(&mut self, session_ready: bool) -> Duration {
        if session_ready {
            self.current = self.initial;
        }
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }
}

/// How far one connection attempt got.
#[derive(Debug, Default, Clone, Copy)]
struct Attempt {
    /// The WebSocket upgrade completed.
    upgraded: bool,
    /// The handler reported a live session.
    ready: bool,
}

/// WebSocket connection manager.
/// Handles connection lifecycle, heartbeats, reconnection, and outbound commands.
pub struct WsManager<H: WsHandler> {
    handler: Arc<H>,
    config: WsManagerConfig,
    command_rx: mpsc::Receiver<ControlCommand>,
    worker_id: String,
}

impl<H: WsHandler> WsManager<H> {
    /// Create a new WebSocket manager.
    pub fn new(
        handler: Arc<H>,
        config: WsManagerConfig,
        command_rx: mpsc::Receiver<ControlCommand>,
        worker_id: String,
    ) -> Self {
        Self {
            handler,
            config,
            command_rx,
            worker_id,
        }
    }

    /// Run the WebSocket manager. This will reconnect on disconnection until
    /// shutdown or a fatal error.
    pub async fn run(mut self) -> Result<()> {
        let mut backoff = Backoff::new(&self.config);

        loop {
            let mut attempt = Attempt::default();
            let outcome = self.connect_and_run_loop(&mut attempt).await;

            if attempt.upgraded {
                gauge!("rateway_ws_active_connections").decrement(1.0);
            }

            match outcome {
                Ok(()) => {
                    info!("[{}] WebSocket closed gracefully", self.worker_id);
                    return Ok(());
                }
                Err(e) if e.is_fatal() => {
                    counter!("rateway_ws_errors_total", "shard" => self.worker_id.clone(), "error_type" => "fatal").increment(1);
                    error!("[{}] Giving up on connection: {}", self.worker_id, e);
                    self.handler.on_disconnect(&e).await;
                    return Err(e);
                }
                Err(e) => {
                    let reconnect_delay = backoff.next(attempt.ready);
                    counter!("rateway_ws_errors_total", "shard" => self.worker_id.clone(), "error_type" => "disconnect").increment(1);
                    warn!(
                        "[{}] WebSocket disconnected: {}, reconnecting in {:?}",
                        self.worker_id, e, reconnect_delay
                    );
                    self.handler.on_disconnect(&e).await;

                    // Commands queued while disconnected still count; a shutdown ends the wait.
                    tokio::select! {
                        _ = tokio::time::sleep(reconnect_delay) => {}
                        cmd = self.command_rx.recv() => {
                            match cmd {
                                Some(ControlCommand::Shutdown) | None => {
                                    info!("[{}] Shutdown while reconnecting", self.worker_id);
                                    return Ok(());
                                }
                                Some(ControlCommand::Send(_)) => {
                                    warn!("[{}] Dropping command, no live connection", self.worker_id);
                                    counter!("rateway_ws_commands_dropped_total", "shard" => self.worker_id.clone()).increment(1);
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    async fn open_tcp(&self, url: &Url) -> Result<TcpStream> {
        let host = url
            .host_str()
            .ok_or_else(|| Error::HandshakeFailed("No host in URL".to_string()))?;
        let port = url.port_or_known_default().unwrap_or(443);
        let addr_str = format!("{}:{}", host, port);

        // Resolve DNS and prefer IPv4 to avoid IPv6 timeout issues
        let addrs: Vec<SocketAddr> = addr_str
            .to_socket_addrs()
            .map_err(|e| Error::HandshakeFailed(format!("DNS resolution failed: {}", e)))?
            .collect();

        let mut sorted_addrs: Vec<SocketAddr> =
            addrs.iter().filter(|a| a.is_ipv4()).copied().collect();
        sorted_addrs.extend(addrs.iter().filter(|a| a.is_ipv6()).copied());

        for addr in &sorted_addrs {
            debug!("[{}] Trying to connect to {}", self.worker_id, addr);
            match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr)).await
            {
                Ok(Ok(stream)) => {
                    debug!("[{}] TCP connected to {}", self.worker_id, addr);
                    return Ok(stream);
                }
                Ok(Err(e)) => {
                    debug!("[{}] TCP connect to {} failed: {}", self.worker_id, addr, e);
                }
                Err(_) => {
                    debug!("[{}] TCP connect to {} timed out", self.worker_id, addr);
                }
            }
        }

        Err(Error::HandshakeFailed(
            "All connection attempts failed".to_string(),
        ))
    }

    fn tls_connector() -> Result<Connector> {
        let mut root_store = rustls::RootCertStore::empty();
        let certs = rustls_native_certs::load_native_certs();
        for cert in certs.certs {
            let _ = root_store.add(cert);
        }

        let config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::HandshakeFailed(format!("TLS config error: {}", e)))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

        Ok(Connector::Rustls(Arc::new(config)))
    }

    async fn connect_and_run_loop(&mut self, attempt: &mut Attempt) -> Result<()> {
        let url_str = self.handler.url();
        info!("[{}] Connecting to WebSocket: {}", self.worker_id, url_str);

        let url = Url::parse(&url_str)?;
        let tcp_stream = self.open_tcp(&url).await?;

        let (ws_stream, response) = client_async_tls_with_config(
            url_str.as_str(),
            tcp_stream,
            None,
            Some(Self::tls_connector()?),
        )
        .await
        .map_err(|e| Error::HandshakeFailed(e.to_string()))?;

        debug!(
            "[{}] WebSocket handshake complete, status: {:?}",
            self.worker_id,
            response.status()
        );
        let (mut write, mut read) = ws_stream.split();

        attempt.upgraded = true;
        gauge!("rateway_ws_active_connections").increment(1.0);
        info!("[{}] WebSocket connected", self.worker_id);

        if let Some(init_msg) = self.handler.on_connect().await {
            write.send(Message::Text(init_msg)).await?;
        }

        self.handler.on_reconnect().await;

        // Started once the upstream tells us its heartbeat period.
        let mut heartbeat: Option<Interval> = None;

        loop {
            tokio::select! {
                // Handle incoming WebSocket messages
                msg = read.next() => {
                    let directives = match msg {
                        Some(Ok(Message::Text(text))) => {
                            counter!("rateway_ws_messages_received_total", "shard" => self.worker_id.clone()).increment(1);
                            self.handler.on_message(&text).await?
                        }
                        Some(Ok(Message::Binary(data))) => {
                            self.handler.on_binary_message(&data).await?
                        }
                        Some(Ok(Message::Ping(data))) => {
                            debug!("[{}] Received ping, sending pong", self.worker_id);
                            write.send(Message::Pong(data)).await?;
                            Vec::new()
                        }
                        Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => Vec::new(),
                        Some(Ok(Message::Close(frame))) => {
                            info!("[{}] Received close frame: {:?}", self.worker_id, frame);
                            let code = frame.map(|f| u16::from(f.code));
                            return Err(self.handler.on_close(code));
                        }
                        Some(Err(e)) => {
                            error!("[{}] WebSocket error: {:?}", self.worker_id, e);
                            return Err(Error::WebSocket(e));
                        }
                        None => {
                            info!("[{}] WebSocket stream ended", self.worker_id);
                            return Err(Error::ConnectionClosed(None));
                        }
                    };

                    for directive in directives {
                        match directive {
                            Directive::Send(payload) => {
                                write.send(Message::Text(payload)).await?;
                            }
                            Directive::StartHeartbeat(period) => {
                                debug!("[{}] Heartbeating every {:?}", self.worker_id, period);
                                let mut ticker = interval_at(Instant::now() + period, period);
                                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                                heartbeat = Some(ticker);
                            }
                            Directive::Reconnect => {
                                let _ = write.send(Message::Close(Some(CloseFrame {
                                    code: CloseCode::Restart,
                                    reason: "Reconnecting".into(),
                                }))).await;
                                return Err(Error::ReconnectRequested);
                            }
                            Directive::SessionReady => {
                                attempt.ready = true;
                            }
                        }
                    }
                }

                // Handle control commands
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(ControlCommand::Shutdown) => {
                            info!("[{}] Received shutdown command", self.worker_id);
                            let close_frame = CloseFrame {
                                code: CloseCode::Normal,
                                reason: "Shutdown".into(),
                            };
                            let _ = write.send(Message::Close(Some(close_frame))).await;
                            return Ok(());
                        }
                        Some(cmd) => {
                            if let Some(msg) = self.handler.handle_command(cmd).await {
                                debug!("[{}] Forwarding command upstream", self.worker_id);
                                write.send(Message::Text(msg)).await?;
                            }
                        }
                        None => {
                            // Command channel closed, treat as shutdown
                            info!("[{}] Command channel closed", self.worker_id);
                            return Ok(());
                        }
                    }
                }

                _ = next_tick(&mut heartbeat) => {
                    let frame = self.handler.heartbeat().await?;
                    debug!("[{}] Sending heartbeat", self.worker_id);
                    write.send(Message::Text(frame)).await?;
                }
            }
        }
    }
}

/// Resolves on the next heartbeat tick, or never when heartbeats have not started.
async fn next_tick(heartbeat: &mut Option<Interval>) -> Instant {
    match heartbeat {
        Some(ticker) => ticker.tick().await,
        None => std::future::pending().await,
    }
}
