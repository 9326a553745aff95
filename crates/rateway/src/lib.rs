//! rateway worker library.
//!
//! One worker process owns a contiguous range of gateway shards and bridges
//! them to the AMQP exchange `rateway-{cluster_id}`:
//!
//! - every dispatch event is published with its event type as routing key
//! - messages on the `gateway` routing key are written to a shard's socket
//! - messages on the `cache` routing key are answered from the entity cache
//!
//! The `rateway` binary wires these together; see [`worker::Worker`].

pub mod api;
pub mod config;
pub mod error;
pub mod query;
pub mod relay;
pub mod supervisor;
pub mod worker;

pub use api::{create_router, AppState};
pub use config::Config;
pub use error::{Error, Result};
pub use query::{parse_query, resolve, CacheQuery, QueryHandler, QueryResult};
pub use relay::{parse_command, OutboundCommand, RelayHandler};
pub use supervisor::{ShardSender, ShardSupervisor};
pub use worker::Worker;
