//! In-memory entity cache fed by normalized gateway events.
//!
//! # Architecture
//!
//! - **Single arena**: every entity lives in one map keyed by `(kind, ids)`
//! - **Atomic per event**: one `RwLock` guards the arena, so a lookup never
//!   sees half of a `GUILD_CREATE`; lookups run concurrently with each other
//! - **Immutable views**: lookups hand out `Arc<Value>`, never references
//!   into the arena
//!
//! Events from one shard are applied in arrival order. Events from different
//! shards interleave in whatever order their pipelines reach the lock; the
//! upstream partitions guilds by shard, so entities of one guild only ever
//! see one shard's order.
//!
//! # Example
//!
//! ```ignore
//! use entity_cache::{EntityCache, EntityKind};
//!
//! let cache = EntityCache::new();
//! cache.apply(&event)?;
//! let guild = cache.lookup(EntityKind::Guild, &[430017996304678923])?;
//! ```

pub mod entity;
pub mod error;
pub mod store;

pub use entity::{EntityKey, EntityKind};
pub use error::{CacheError, Result};
pub use store::{CacheConfig, CacheStats, EntityCache};
