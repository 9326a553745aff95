//! Frame parsing and dispatch normalization.

use crate::error::{NormalizeError, Result};
use crate::schema::{GatewayFrame, NormalizedEvent, OpCode, RawFrame};
use bytes::Bytes;

/// Parse one text frame into its envelope.
pub fn parse_frame(text: &str) -> Result<GatewayFrame> {
    let raw: RawFrame = serde_json::from_str(text)?;
    Ok(GatewayFrame {
        op: OpCode::from(raw.op),
        data: raw.d,
        sequence: raw.s,
        kind: raw.t,
    })
}

/// Map an event name to its routing key form.
///
/// Names must consist of ASCII letters, digits and underscores.
pub fn canonical_kind(name: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty()
        || !trimmed
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
    {
        return Err(NormalizeError::InvalidEventType(name.to_string()));
    }
    Ok(trimmed.to_ascii_uppercase())
}

/// Turn a dispatch frame received on `shard_id` into a normalized event.
pub fn normalize(frame: &GatewayFrame, shard_id: u64) -> Result<NormalizedEvent> {
    if frame.op != OpCode::Dispatch {
        return Err(NormalizeError::NotDispatch(frame.op.into()));
    }

    let name = frame
        .kind
        .as_deref()
        .ok_or(NormalizeError::MissingEventType)?;
    let kind = canonical_kind(name)?;
    let data = frame.data_str().ok_or(NormalizeError::MissingData)?;

    Ok(NormalizedEvent {
        kind,
        shard_id,
        sequence: frame.sequence,
        payload: Bytes::copy_from_slice(data.as_bytes()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hello() {
        let frame = parse_frame(r#"{"op":10,"d":{"heartbeat_interval":41250},"s":null,"t":null}"#)
            .unwrap();
        assert_eq!(frame.op, OpCode::Hello);
        assert_eq!(frame.data_str(), Some(r#"{"heartbeat_interval":41250}"#));
        assert!(frame.sequence.is_none());
        assert!(frame.kind.is_none());
    }

    #[test]
    fn test_normalize_dispatch_preserves_body() {
        let text = r#"{"op":0,"s":42,"t":"MESSAGE_CREATE","d":{"id":"1", "content":"hi  there"}}"#;
        let frame = parse_frame(text).unwrap();
        let event = normalize(&frame, 3).unwrap();

        assert_eq!(event.kind, "MESSAGE_CREATE");
        assert_eq!(event.shard_id, 3);
        assert_eq!(event.sequence, Some(42));
        // Whitespace inside the body is untouched.
        assert_eq!(&event.payload[..], br#"{"id":"1", "content":"hi  there"}"#);
    }

    #[test]
    fn test_normalize_uppercases_kind() {
        let frame = parse_frame(r#"{"op":0,"s":1,"t":"reaction_add","d":{}}"#).unwrap();
        assert_eq!(normalize(&frame, 0).unwrap().kind, "REACTION_ADD");
    }

    #[test]
    fn test_missing_event_type() {
        let frame = parse_frame(r#"{"op":0,"s":1,"d":{}}"#).unwrap();
        assert!(matches!(
            normalize(&frame, 0),
            Err(NormalizeError::MissingEventType)
        ));
    }

    #[test]
    fn test_invalid_event_type() {
        let frame = parse_frame(r#"{"op":0,"s":1,"t":"bad key","d":{}}"#).unwrap();
        assert!(matches!(
            normalize(&frame, 0),
            Err(NormalizeError::InvalidEventType(_))
        ));
        assert!(canonical_kind("").is_err());
    }

    #[test]
    fn test_missing_data() {
        let frame = parse_frame(r#"{"op":0,"s":1,"t":"READY","d":null}"#).unwrap();
        assert!(matches!(
            normalize(&frame, 0),
            Err(NormalizeError::MissingData)
        ));
    }

    #[test]
    fn test_non_dispatch_rejected() {
        let frame = parse_frame(r#"{"op":11}"#).unwrap();
        assert!(matches!(
            normalize(&frame, 0),
            Err(NormalizeError::NotDispatch(11))
        ));
    }

    #[test]
    fn test_unparseable_envelope() {
        assert!(matches!(
            parse_frame("not json"),
            Err(NormalizeError::Envelope(_))
        ));
        assert!(parse_frame(r#"{"d":{}}"#).is_err());
    }

    #[test]
    fn test_unknown_opcode_kept() {
        let frame = parse_frame(r#"{"op":99}"#).unwrap();
        assert_eq!(frame.op, OpCode::Unknown(99));
    }
}
