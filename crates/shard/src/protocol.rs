//! Gateway payload builders and close code handling.

use normalizer::OpCode;
use serde::{Deserialize, Serialize};

/// Default gateway endpoint. Compression is disabled so every frame is JSON text.
pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";

/// Outgoing envelope.
#[derive(Debug, Serialize)]
struct Outgoing<T: Serialize> {
    op: u8,
    d: T,
}

fn encode<T: Serialize>(op: OpCode, d: T) -> String {
    // Serializing plain structs of strings and integers cannot fail.
    serde_json::to_string(&Outgoing { op: op.into(), d }).unwrap_or_default()
}

#[derive(Debug, Serialize)]
struct IdentifyProperties {
    os: &'static str,
    browser: &'static str,
    device: &'static str,
}

#[derive(Debug, Serialize)]
struct Identify<'a> {
    token: &'a str,
    intents: u64,
    shard: [u64; 2],
    compress: bool,
    properties: IdentifyProperties,
}

#[derive(Debug, Serialize)]
struct Resume<'a> {
    token: &'a str,
    session_id: &'a str,
    seq: u64,
}

/// Build an Identify payload for `shard_id` of `shard_total`.
pub fn identify(token: &str, intents: u64, shard_id: u64, shard_total: u64) -> String {
    encode(
        OpCode::Identify,
        Identify {
            token,
            intents,
            shard: [shard_id, shard_total],
            compress: false,
            properties: IdentifyProperties {
                os: std::env::consts::OS,
                browser: "rateway",
                device: "rateway",
            },
        },
    )
}

/// Build a Resume payload.
pub fn resume(token: &str, session_id: &str, seq: u64) -> String {
    encode(
        OpCode::Resume,
        Resume {
            token,
            session_id,
            seq,
        },
    )
}

/// Build a Heartbeat payload carrying the last sequence number seen.
pub fn heartbeat(seq: Option<u64>) -> String {
    encode(OpCode::Heartbeat, seq)
}

/// Data of a Hello frame.
#[derive(Debug, Deserialize)]
pub struct Hello {
    /// Heartbeat period in milliseconds.
    pub heartbeat_interval: u64,
}

/// The parts of a READY dispatch the session needs.
#[derive(Debug, Deserialize)]
pub struct Ready {
    pub session_id: String,
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
}

/// Resume URLs come without the version/encoding query; reuse the configured one.
pub fn resume_url(resume_gateway_url: &str, configured_url: &str) -> String {
    match configured_url.split_once('?') {
        Some((_, query)) => format!("{}/?{}", resume_gateway_url.trim_end_matches('/'), query),
        None => resume_gateway_url.to_string(),
    }
}

/// What to do after the gateway closed the socket with a given code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    /// Reconnect and resume the session.
    Resume,
    /// Reconnect with a fresh Identify.
    Reidentify,
    /// Do not reconnect.
    Fatal,
}

/// Classify a close code.
///
/// 4004 (authentication failed), 4010 (invalid shard), 4011 (sharding
/// required), 4012 (invalid API version), 4013 (invalid intents) and 4014
/// (disallowed intents) are fatal. 4007 (invalid seq) and 4009 (session
/// timed out) invalidate the session.
pub fn classify_close(code: u16) -> CloseAction {
    match code {
        4004 | 4010 | 4011 | 4012 | 4013 | 4014 => CloseAction::Fatal,
        4007 | 4009 => CloseAction::Reidentify,
        _ => CloseAction::Resume,
    }
}
