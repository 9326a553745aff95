//! Event normalization for upstream gateway frames.
//!
//! Every frame the gateway sends is an envelope `{op, d, s, t}`. Dispatch
//! frames (`op = 0`) carry an event name in `t` and the event body in `d`.
//! The normalizer maps them to a [`NormalizedEvent`]: the upper-case event
//! name becomes the broker routing key and the body is kept as opaque bytes.
//!
//! ```text
//! raw text --parse_frame--> GatewayFrame --normalize--> NormalizedEvent
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use normalizer::{normalize, parse_frame};
//!
//! let frame = parse_frame(r#"{"op":0,"s":1,"t":"MESSAGE_CREATE","d":{"id":"1"}}"#)?;
//! let event = normalize(&frame, 0)?;
//! assert_eq!(event.kind, "MESSAGE_CREATE");
//! ```

pub mod adapter;
pub mod error;
pub mod schema;

pub use adapter::{canonical_kind, normalize, parse_frame};
pub use error::{NormalizeError, Result};
pub use schema::{GatewayFrame, NormalizedEvent, OpCode};
