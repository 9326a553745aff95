//! Command Relay - forwards `gateway` messages to shard sockets.
//!
//! Accepted bodies:
//! - `{"shard_id": 3, "payload": {"op": 3, "d": {...}}}` (payload object is serialized)
//! - `{"shard_id": 3, "payload": "{\"op\":3,...}"}` (payload string is sent as-is)
//! - anything else: the whole body is the payload
//!
//! The shard id comes from the envelope, then the `shard_id` header, then
//! defaults to 0.

use crate::error::{Error, Result};
use crate::supervisor::ShardSender;
use amqp_client::{AMQPValue, Delivery, DeliveryHandler, FieldTable};
use async_trait::async_trait;
use metrics::counter;
use serde_json::Value;
use tracing::{debug, warn};

/// Header producers may use to pick the shard.
pub const SHARD_ID_HEADER: &str = "shard_id";

/// A payload to write on one shard's connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundCommand {
    pub shard_id: u64,
    pub payload: String,
}

/// Parse a `gateway` message.
pub fn parse_command(body: &[u8], headers: Option<&FieldTable>) -> Result<OutboundCommand> {
    let text = std::str::from_utf8(body)
        .map_err(|_| Error::MalformedCommandEnvelope("body is not UTF-8".into()))?;
    if text.trim().is_empty() {
        return Err(Error::MalformedCommandEnvelope("empty body".into()));
    }

    let envelope = match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) if map.contains_key("payload") => Some(map),
        _ => None,
    };

    let Some(mut envelope) = envelope else {
        return Ok(OutboundCommand {
            shard_id: header_shard_id(headers)?.unwrap_or(0),
            payload: text.to_string(),
        });
    };

    let payload = match envelope.remove("payload") {
        Some(Value::String(s)) => s,
        Some(obj @ Value::Object(_)) => obj.to_string(),
        _ => {
            return Err(Error::MalformedCommandEnvelope(
                "payload must be a string or an object".into(),
            ))
        }
    };
    if payload.trim().is_empty() {
        return Err(Error::MalformedCommandEnvelope("empty payload".into()));
    }

    let shard_id = match envelope.get("shard_id") {
        None | Some(Value::Null) => header_shard_id(headers)?.unwrap_or(0),
        Some(v) => v.as_u64().ok_or_else(|| {
            Error::MalformedCommandEnvelope(format!("invalid shard_id {}", v))
        })?,
    };

    Ok(OutboundCommand { shard_id, payload })
}

/// Shard id from the message headers. Any integer type or a numeric string.
fn header_shard_id(headers: Option<&FieldTable>) -> Result<Option<u64>> {
    let Some(value) = headers.and_then(|h| h.inner().get(SHARD_ID_HEADER)) else {
        return Ok(None);
    };

    let id = match value {
        AMQPValue::ShortShortUInt(v) => Some(u64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(u64::from(*v)),
        AMQPValue::LongUInt(v) => Some(u64::from(*v)),
        AMQPValue::ShortShortInt(v) => u64::try_from(*v).ok(),
        AMQPValue::ShortInt(v) => u64::try_from(*v).ok(),
        AMQPValue::LongInt(v) => u64::try_from(*v).ok(),
        AMQPValue::LongLongInt(v) => u64::try_from(*v).ok(),
        AMQPValue::ShortString(s) => s.as_str().trim().parse().ok(),
        AMQPValue::LongString(s) => std::str::from_utf8(s.as_bytes())
            .ok()
            .and_then(|s| s.trim().parse().ok()),
        _ => None,
    };

    id.map(Some).ok_or_else(|| {
        Error::MalformedCommandEnvelope(format!("invalid shard_id header {:?}", value))
    })
}

/// Consumer of the `gateway` queue.
pub struct RelayHandler<S: ShardSender> {
    sender: S,
}

impl<S: ShardSender> RelayHandler<S> {
    pub fn new(sender: S) -> Self {
        Self { sender }
    }

    /// Parse and forward one message. Nothing is retried.
    pub fn relay(&self, body: &[u8], headers: Option<&FieldTable>) -> Result<u64> {
        let command = match parse_command(body, headers) {
            Ok(command) => command,
            Err(e) => {
                counter!("rateway_commands_malformed_total").increment(1);
                return Err(e);
            }
        };

        let shard_id = command.shard_id;
        match self.sender.send(shard_id, command.payload) {
            Ok(()) => {
                counter!("rateway_commands_relayed_total").increment(1);
                Ok(shard_id)
            }
            Err(e) => {
                counter!("rateway_commands_dropped_total").increment(1);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl<S: ShardSender> DeliveryHandler for RelayHandler<S> {
    const NAME: &'static str = "relay";

    async fn handle(&self, delivery: &Delivery) {
        match self.relay(&delivery.data, delivery.properties.headers().as_ref()) {
            Ok(shard_id) => debug!("[relay] Forwarded command to shard {}", shard_id),
            Err(e) => warn!("[relay] Dropping command: {}", e),
        }
    }
}
