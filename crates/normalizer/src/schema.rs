//! Gateway envelope and normalized event definitions.

use bytes::Bytes;
use serde::Deserialize;
use serde_json::value::RawValue;

/// Gateway opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Dispatch,
    Heartbeat,
    Identify,
    PresenceUpdate,
    VoiceStateUpdate,
    Resume,
    Reconnect,
    RequestGuildMembers,
    InvalidSession,
    Hello,
    HeartbeatAck,
    /// An opcode this build does not know about.
    Unknown(u8),
}

impl From<u8> for OpCode {
    fn from(op: u8) -> Self {
        match op {
            0 => OpCode::Dispatch,
            1 => OpCode::Heartbeat,
            2 => OpCode::Identify,
            3 => OpCode::PresenceUpdate,
            4 => OpCode::VoiceStateUpdate,
            6 => OpCode::Resume,
            7 => OpCode::Reconnect,
            8 => OpCode::RequestGuildMembers,
            9 => OpCode::InvalidSession,
            10 => OpCode::Hello,
            11 => OpCode::HeartbeatAck,
            other => OpCode::Unknown(other),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> Self {
        match op {
            OpCode::Dispatch => 0,
            OpCode::Heartbeat => 1,
            OpCode::Identify => 2,
            OpCode::PresenceUpdate => 3,
            OpCode::VoiceStateUpdate => 4,
            OpCode::Resume => 6,
            OpCode::Reconnect => 7,
            OpCode::RequestGuildMembers => 8,
            OpCode::InvalidSession => 9,
            OpCode::Hello => 10,
            OpCode::HeartbeatAck => 11,
            OpCode::Unknown(other) => other,
        }
    }
}

/// Wire form of the envelope.
#[derive(Debug, Deserialize)]
pub(crate) struct RawFrame {
    pub op: u8,
    #[serde(default)]
    pub d: Option<Box<RawValue>>,
    #[serde(default)]
    pub s: Option<u64>,
    #[serde(default)]
    pub t: Option<String>,
}

/// A parsed gateway envelope. The data body is left as raw JSON.
#[derive(Debug)]
pub struct GatewayFrame {
    pub op: OpCode,
    /// Raw `d` field, `None` when absent or null.
    pub data: Option<Box<RawValue>>,
    /// Sequence number, only set on dispatch frames.
    pub sequence: Option<u64>,
    /// Event name as sent by the gateway, only set on dispatch frames.
    pub kind: Option<String>,
}

impl GatewayFrame {
    /// Raw JSON text of the data body, if any.
    pub fn data_str(&self) -> Option<&str> {
        self.data.as_deref().map(RawValue::get)
    }
}

/// One upstream event ready for the cache and the exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    /// Canonical upper-case event name, used as routing key.
    pub kind: String,
    /// Shard the event arrived on.
    pub shard_id: u64,
    /// Gateway sequence number.
    pub sequence: Option<u64>,
    /// Event body exactly as received.
    pub payload: Bytes,
}

impl NormalizedEvent {
    pub fn new(kind: impl Into<String>, shard_id: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: kind.into(),
            shard_id,
            sequence: None,
            payload: payload.into(),
        }
    }
}
