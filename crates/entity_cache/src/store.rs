//! Entity store with atomic per-event updates.
//!
//! Uses one `parking_lot::RwLock` over the arena: `apply` takes the write
//! lock for the duration of a single event, `lookup` takes the read lock.

use crate::entity::{field_id, snowflake, EntityKey, EntityKind};
use crate::error::{CacheError, Result};
use normalizer::NormalizedEvent;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Default number of messages kept before the oldest are evicted.
pub const DEFAULT_MESSAGE_CACHE_SIZE: usize = 1000;

/// Event types that change the cache. Everything else is ignored.
pub const CACHE_EVENTS: &[&str] = &[
    "READY",
    "USER_UPDATE",
    "GUILD_CREATE",
    "GUILD_UPDATE",
    "GUILD_DELETE",
    "CHANNEL_CREATE",
    "CHANNEL_UPDATE",
    "CHANNEL_DELETE",
    "THREAD_CREATE",
    "THREAD_UPDATE",
    "THREAD_DELETE",
    "GUILD_ROLE_CREATE",
    "GUILD_ROLE_UPDATE",
    "GUILD_ROLE_DELETE",
    "GUILD_EMOJIS_UPDATE",
    "GUILD_MEMBER_ADD",
    "GUILD_MEMBER_UPDATE",
    "GUILD_MEMBER_REMOVE",
    "GUILD_MEMBERS_CHUNK",
    "MESSAGE_CREATE",
    "MESSAGE_UPDATE",
    "MESSAGE_DELETE",
    "MESSAGE_DELETE_BULK",
    "PRESENCE_UPDATE",
    "VOICE_STATE_UPDATE",
];

/// Channel `type` values for direct messages and group DMs.
const CHANNEL_TYPE_DM: u64 = 1;
const CHANNEL_TYPE_GROUP_DM: u64 = 3;

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of cached messages.
    pub message_cache_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            message_cache_size: DEFAULT_MESSAGE_CACHE_SIZE,
        }
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Entity count per kind.
    pub entities: BTreeMap<String, usize>,
    pub guilds: usize,
    pub applied_events: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entities: HashMap<EntityKey, Arc<Value>>,
    /// Guild id -> keys of entities removed together with the guild.
    guild_children: HashMap<u64, HashSet<EntityKey>>,
    /// Guild id -> shard it was received on.
    guild_shards: HashMap<u64, u64>,
    /// `(message id, insertion number)` in insertion order, for eviction.
    /// May hold entries of messages since deleted or created again.
    message_order: VecDeque<(u64, u64)>,
    /// Message id -> insertion number of its current entry in `message_order`.
    message_insertions: HashMap<u64, u64>,
    next_message_insertion: u64,
    message_count: usize,
    applied_events: u64,
}

/// Shared entity cache. Cloning is cheap and clones share state.
#[derive(Debug, Clone, Default)]
pub struct EntityCache {
    state: Arc<RwLock<CacheState>>,
    config: CacheConfig,
}

impl EntityCache {
    /// Create a new empty cache with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: CacheConfig) -> Self {
        Self {
            state: Arc::default(),
            config,
        }
    }

    /// Whether events of this type change the cache.
    pub fn is_cache_event(kind: &str) -> bool {
        CACHE_EVENTS.contains(&kind)
    }

    /// Apply one event. Returns whether the cache changed.
    ///
    /// Unrecognized event types are a no-op. The whole event is applied
    /// under a single write lock.
    pub fn apply(&self, event: &NormalizedEvent) -> Result<bool> {
        if !Self::is_cache_event(&event.kind) {
            return Ok(false);
        }

        let data: Value = serde_json::from_slice(&event.payload)?;

        let mut state = self.state.write();
        let changed = state.apply(&event.kind, event.shard_id, data, &self.config);
        if changed {
            state.applied_events += 1;
        } else {
            debug!(
                "[shard-{}] {} left the cache unchanged",
                event.shard_id, event.kind
            );
        }
        Ok(changed)
    }

    /// Look up an entity. Returns an immutable view of the stored document.
    pub fn lookup(&self, kind: EntityKind, args: &[u64]) -> Result<Arc<Value>> {
        let key = EntityKey::from_args(kind, args)?;
        let state = self.state.read();

        if kind == EntityKind::VoiceChannelStates {
            return state.voice_channel_states(key.id);
        }

        state
            .entities
            .get(&key)
            .cloned()
            .ok_or(CacheError::NotFound)
    }

    /// Drop every guild received on `shard_id`, with everything scoped to it.
    /// Returns the number of guilds removed.
    pub fn invalidate_shard(&self, shard_id: u64) -> usize {
        let mut state = self.state.write();
        let guilds: Vec<u64> = state
            .guild_shards
            .iter()
            .filter(|(_, shard)| **shard == shard_id)
            .map(|(guild_id, _)| *guild_id)
            .collect();

        for guild_id in &guilds {
            state.remove_guild(*guild_id);
        }
        guilds.len()
    }

    /// Total number of cached entities.
    pub fn len(&self) -> usize {
        self.state.read().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.read();
        let mut entities = BTreeMap::new();
        for key in state.entities.keys() {
            *entities.entry(key.kind.as_str().to_string()).or_insert(0) += 1;
        }
        CacheStats {
            entities,
            guilds: state.guild_shards.len(),
            applied_events: state.applied_events,
        }
    }
}

impl CacheState {
    fn apply(&mut self, kind: &str, shard_id: u64, data: Value, config: &CacheConfig) -> bool {
        match kind {
            "READY" => self.apply_ready(shard_id, data),
            "USER_UPDATE" => {
                let current = EntityKey::new(EntityKind::CurrentUser, 0);
                self.upsert_user(data.clone());
                self.merge(current, data, true)
            }
            "GUILD_CREATE" => self.insert_guild(shard_id, data),
            "GUILD_UPDATE" => match field_id(&data, "id") {
                Some(id) => self.merge(EntityKey::new(EntityKind::Guild, id), data, false),
                None => false,
            },
            "GUILD_DELETE" => match field_id(&data, "id") {
                Some(id) => self.remove_guild(id),
                None => false,
            },
            "CHANNEL_CREATE" | "CHANNEL_UPDATE" | "THREAD_CREATE" | "THREAD_UPDATE" => {
                self.upsert_channel(data)
            }
            "CHANNEL_DELETE" | "THREAD_DELETE" => match field_id(&data, "id") {
                Some(id) => [
                    EntityKind::GuildChannel,
                    EntityKind::PrivateChannel,
                    EntityKind::Group,
                ]
                .into_iter()
                .fold(false, |removed, kind| {
                    self.remove(EntityKey::new(kind, id)) || removed
                }),
                None => false,
            },
            "GUILD_ROLE_CREATE" | "GUILD_ROLE_UPDATE" => {
                let (Some(guild_id), Some(role)) = (field_id(&data, "guild_id"), data.get("role"))
                else {
                    return false;
                };
                let role = with_guild_id(role.clone(), guild_id);
                match field_id(&role, "id") {
                    Some(id) => self.merge(EntityKey::new(EntityKind::Role, id), role, true),
                    None => false,
                }
            }
            "GUILD_ROLE_DELETE" => match field_id(&data, "role_id") {
                Some(id) => self.remove(EntityKey::new(EntityKind::Role, id)),
                None => false,
            },
            "GUILD_EMOJIS_UPDATE" => {
                let Some(guild_id) = field_id(&data, "guild_id") else {
                    return false;
                };
                let stale: Vec<EntityKey> = self
                    .guild_children
                    .get(&guild_id)
                    .into_iter()
                    .flatten()
                    .filter(|key| key.kind == EntityKind::Emoji)
                    .copied()
                    .collect();
                for key in stale {
                    self.remove(key);
                }
                for emoji in array(&data, "emojis") {
                    self.insert_scoped_by_id(EntityKind::Emoji, guild_id, emoji.clone());
                }
                true
            }
            "GUILD_MEMBER_ADD" | "GUILD_MEMBER_UPDATE" => match field_id(&data, "guild_id") {
                Some(guild_id) => self.upsert_member(guild_id, data),
                None => false,
            },
            "GUILD_MEMBER_REMOVE" => {
                let guild_id = field_id(&data, "guild_id");
                let user_id = data.get("user").and_then(|u| field_id(u, "id"));
                match (guild_id, user_id) {
                    (Some(guild_id), Some(user_id)) => self.remove(EntityKey::scoped(
                        EntityKind::Member,
                        guild_id,
                        user_id,
                    )),
                    _ => false,
                }
            }
            "GUILD_MEMBERS_CHUNK" => {
                let Some(guild_id) = field_id(&data, "guild_id") else {
                    return false;
                };
                for member in array(&data, "members") {
                    self.upsert_member(guild_id, member.clone());
                }
                for presence in array(&data, "presences") {
                    self.upsert_presence(guild_id, presence.clone());
                }
                true
            }
            "MESSAGE_CREATE" => self.insert_message(data, config.message_cache_size),
            "MESSAGE_UPDATE" => match field_id(&data, "id") {
                Some(id) => self.merge(EntityKey::new(EntityKind::Message, id), data, false),
                None => false,
            },
            "MESSAGE_DELETE" => match field_id(&data, "id") {
                Some(id) => self.remove(EntityKey::new(EntityKind::Message, id)),
                None => false,
            },
            "MESSAGE_DELETE_BULK" => array(&data, "ids")
                .iter()
                .filter_map(snowflake)
                .fold(false, |removed, id| {
                    self.remove(EntityKey::new(EntityKind::Message, id)) || removed
                }),
            "PRESENCE_UPDATE" => match field_id(&data, "guild_id") {
                Some(guild_id) => self.upsert_presence(guild_id, data),
                None => false,
            },
            "VOICE_STATE_UPDATE" => match field_id(&data, "guild_id") {
                Some(guild_id) => self.upsert_voice_state(guild_id, data),
                None => false,
            },
            _ => false,
        }
    }

    fn apply_ready(&mut self, shard_id: u64, data: Value) -> bool {
        for guild in array(&data, "guilds") {
            if let Some(id) = field_id(guild, "id") {
                self.guild_shards.insert(id, shard_id);
            }
        }
        match data.get("user") {
            Some(user) => {
                self.upsert_user(user.clone());
                self.insert(EntityKey::new(EntityKind::CurrentUser, 0), user.clone());
                true
            }
            None => false,
        }
    }

    fn insert_guild(&mut self, shard_id: u64, mut guild: Value) -> bool {
        let Some(guild_id) = field_id(&guild, "id") else {
            return false;
        };
        let Some(obj) = guild.as_object_mut() else {
            return false;
        };

        let channels = take_array(obj, "channels");
        let threads = take_array(obj, "threads");
        let roles = take_array(obj, "roles");
        let emojis = take_array(obj, "emojis");
        let members = take_array(obj, "members");
        let presences = take_array(obj, "presences");
        let voice_states = take_array(obj, "voice_states");

        // A create replaces whatever an earlier session left behind.
        self.remove_guild(guild_id);
        self.insert(EntityKey::new(EntityKind::Guild, guild_id), guild);
        self.guild_shards.insert(guild_id, shard_id);

        for channel in channels.into_iter().chain(threads) {
            self.upsert_channel(with_guild_id(channel, guild_id));
        }
        for role in roles {
            self.insert_scoped_by_id(EntityKind::Role, guild_id, role);
        }
        for emoji in emojis {
            self.insert_scoped_by_id(EntityKind::Emoji, guild_id, emoji);
        }
        for member in members {
            self.upsert_member(guild_id, member);
        }
        for presence in presences {
            self.upsert_presence(guild_id, presence);
        }
        for voice_state in voice_states {
            self.upsert_voice_state(guild_id, voice_state);
        }
        true
    }

    fn remove_guild(&mut self, guild_id: u64) -> bool {
        let removed = self
            .entities
            .remove(&EntityKey::new(EntityKind::Guild, guild_id))
            .is_some();
        self.guild_shards.remove(&guild_id);

        if let Some(children) = self.guild_children.remove(&guild_id) {
            for key in children {
                self.entities.remove(&key);
            }
        }
        removed
    }

    fn upsert_channel(&mut self, channel: Value) -> bool {
        let Some(id) = field_id(&channel, "id") else {
            return false;
        };
        let kind = match channel.get("type").and_then(Value::as_u64) {
            Some(CHANNEL_TYPE_DM) => EntityKind::PrivateChannel,
            Some(CHANNEL_TYPE_GROUP_DM) => EntityKind::Group,
            _ => EntityKind::GuildChannel,
        };
        self.merge(EntityKey::new(kind, id), channel, true)
    }

    fn insert_scoped_by_id(&mut self, kind: EntityKind, guild_id: u64, value: Value) -> bool {
        let value = with_guild_id(value, guild_id);
        match field_id(&value, "id") {
            Some(id) => {
                self.insert(EntityKey::new(kind, id), value);
                true
            }
            None => false,
        }
    }

    fn upsert_member(&mut self, guild_id: u64, member: Value) -> bool {
        let Some(user) = member.get("user").cloned() else {
            return false;
        };
        let Some(user_id) = field_id(&user, "id") else {
            return false;
        };
        self.upsert_user(user);
        let member = with_guild_id(member, guild_id);
        self.merge(
            EntityKey::scoped(EntityKind::Member, guild_id, user_id),
            member,
            true,
        )
    }

    fn upsert_presence(&mut self, guild_id: u64, presence: Value) -> bool {
        let Some(user_id) = presence.get("user").and_then(|u| field_id(u, "id")) else {
            return false;
        };
        let presence = with_guild_id(presence, guild_id);
        self.insert(
            EntityKey::scoped(EntityKind::Presence, guild_id, user_id),
            presence,
        );
        true
    }

    fn upsert_voice_state(&mut self, guild_id: u64, voice_state: Value) -> bool {
        let Some(user_id) = field_id(&voice_state, "user_id") else {
            return false;
        };
        let key = EntityKey::scoped(EntityKind::VoiceState, guild_id, user_id);
        // Leaving voice sends a state without a channel.
        if field_id(&voice_state, "channel_id").is_none() {
            return self.remove(key);
        }
        self.insert(key, with_guild_id(voice_state, guild_id));
        true
    }

    fn upsert_user(&mut self, user: Value) {
        if let Some(id) = field_id(&user, "id") {
            self.merge(EntityKey::new(EntityKind::User, id), user, true);
        }
    }

    fn insert_message(&mut self, message: Value, capacity: usize) -> bool {
        let Some(id) = field_id(&message, "id") else {
            return false;
        };
        if let Some(author) = message.get("author") {
            self.upsert_user(author.clone());
        }

        let key = EntityKey::new(EntityKind::Message, id);
        if !self.entities.contains_key(&key) {
            let insertion = self.next_message_insertion;
            self.next_message_insertion += 1;
            self.message_insertions.insert(id, insertion);
            self.message_order.push_back((id, insertion));
        }
        self.insert(key, message);

        while self.message_count > capacity {
            let Some((oldest, insertion)) = self.message_order.pop_front() else {
                break;
            };
            // Entries left by a delete must not evict a later copy of the same id.
            if self.message_insertions.get(&oldest) == Some(&insertion) {
                self.message_insertions.remove(&oldest);
                self.remove(EntityKey::new(EntityKind::Message, oldest));
            }
        }

        // Deleted messages leave their entries behind; compact once they pile up.
        if self.message_order.len() > capacity.saturating_mul(2).max(64) {
            let entities = &self.entities;
            self.message_insertions
                .retain(|id, _| entities.contains_key(&EntityKey::new(EntityKind::Message, *id)));
            let insertions = &self.message_insertions;
            self.message_order
                .retain(|(id, insertion)| insertions.get(id) == Some(insertion));
        }
        true
    }

    /// Merge top-level fields of `update` into the stored document.
    fn merge(&mut self, key: EntityKey, update: Value, insert_missing: bool) -> bool {
        let merged = match self.entities.get(&key) {
            Some(existing) => merge_values(existing, update),
            None if insert_missing => update,
            None => return false,
        };
        self.insert(key, merged);
        true
    }

    fn insert(&mut self, key: EntityKey, value: Value) {
        if let Some(guild_id) = owning_guild(&key, &value) {
            self.guild_children.entry(guild_id).or_default().insert(key);
        }
        if self.entities.insert(key, Arc::new(value)).is_none()
            && key.kind == EntityKind::Message
        {
            self.message_count += 1;
        }
    }

    fn remove(&mut self, key: EntityKey) -> bool {
        let Some(value) = self.entities.remove(&key) else {
            return false;
        };
        if key.kind == EntityKind::Message {
            self.message_count -= 1;
        }
        if let Some(guild_id) = owning_guild(&key, &value) {
            if let Some(children) = self.guild_children.get_mut(&guild_id) {
                children.remove(&key);
            }
        }
        true
    }

    fn voice_channel_states(&self, channel_id: u64) -> Result<Arc<Value>> {
        let channel = self
            .entities
            .get(&EntityKey::new(EntityKind::GuildChannel, channel_id))
            .ok_or(CacheError::NotFound)?;
        let guild_id = field_id(channel, "guild_id").ok_or(CacheError::NotFound)?;

        let mut keys: Vec<&EntityKey> = self
            .guild_children
            .get(&guild_id)
            .into_iter()
            .flatten()
            .filter(|key| key.kind == EntityKind::VoiceState)
            .collect();
        keys.sort_by_key(|key| key.secondary);

        let states: Vec<Value> = keys
            .into_iter()
            .filter_map(|key| self.entities.get(key))
            .filter(|state| field_id(state, "channel_id") == Some(channel_id))
            .map(|state| (**state).clone())
            .collect();

        Ok(Arc::new(Value::Array(states)))
    }
}

/// Guild an entity is removed with, if any.
fn owning_guild(key: &EntityKey, value: &Value) -> Option<u64> {
    match key.kind {
        EntityKind::Member | EntityKind::Presence | EntityKind::VoiceState => Some(key.id),
        EntityKind::GuildChannel | EntityKind::Role | EntityKind::Emoji => {
            field_id(value, "guild_id")
        }
        _ => None,
    }
}

fn merge_values(existing: &Value, update: Value) -> Value {
    match (existing, update) {
        (Value::Object(base), Value::Object(patch)) => {
            let mut merged = base.clone();
            merged.extend(patch);
            Value::Object(merged)
        }
        (_, update) => update,
    }
}

fn with_guild_id(mut value: Value, guild_id: u64) -> Value {
    if let Some(obj) = value.as_object_mut() {
        obj.entry("guild_id")
            .or_insert_with(|| Value::String(guild_id.to_string()));
    }
    value
}

fn take_array(obj: &mut Map<String, Value>, field: &str) -> Vec<Value> {
    match obj.remove(field) {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    }
}

fn array<'a>(value: &'a Value, field: &str) -> &'a [Value] {
    value
        .get(field)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const GUILD_ID: u64 = 430017996304678923;

    fn event(kind: &str, shard_id: u64, data: Value) -> NormalizedEvent {
        NormalizedEvent::new(kind, shard_id, serde_json::to_vec(&data).unwrap())
    }

    fn guild_create() -> NormalizedEvent {
        event(
            "GUILD_CREATE",
            0,
            json!({
                "id": GUILD_ID.to_string(),
                "name": "rawr",
                "channels": [
                    {"id": "10", "type": 0, "name": "general"},
                    {"id": "11", "type": 2, "name": "voice"}
                ],
                "roles": [{"id": "20", "name": "@everyone"}],
                "emojis": [{"id": "30", "name": "blob"}],
                "members": [{"user": {"id": "40", "username": "alice"}, "roles": []}],
                "presences": [{"user": {"id": "40"}, "status": "online"}],
                "voice_states": [{"user_id": "40", "channel_id": "11"}]
            }),
        )
    }

    #[test]
    fn test_guild_create_then_lookup() {
        let cache = EntityCache::new();
        assert!(cache.apply(&guild_create()).unwrap());

        let guild = cache.lookup(EntityKind::Guild, &[GUILD_ID]).unwrap();
        assert_eq!(guild["id"], GUILD_ID.to_string());
        assert_eq!(guild["name"], "rawr");
        // Collections are stored as their own entities.
        assert!(guild.get("channels").is_none());

        let channel = cache.lookup(EntityKind::GuildChannel, &[10]).unwrap();
        assert_eq!(channel["guild_id"], GUILD_ID.to_string());
        assert!(cache.lookup(EntityKind::Role, &[20]).is_ok());
        assert!(cache.lookup(EntityKind::Emoji, &[30]).is_ok());
        assert!(cache.lookup(EntityKind::User, &[40]).is_ok());
        assert_eq!(
            cache.lookup(EntityKind::Member, &[GUILD_ID, 40]).unwrap()["user"]["username"],
            "alice"
        );
        assert_eq!(
            cache.lookup(EntityKind::Presence, &[GUILD_ID, 40]).unwrap()["status"],
            "online"
        );
    }

    #[test]
    fn test_lookup_empty_cache_not_found() {
        let cache = EntityCache::new();
        assert!(matches!(
            cache.lookup(EntityKind::Guild, &[GUILD_ID]),
            Err(CacheError::NotFound)
        ));
    }

    #[test]
    fn test_update_last_write_wins_and_idempotent() {
        let cache = EntityCache::new();
        cache.apply(&guild_create()).unwrap();

        let update = event(
            "GUILD_UPDATE",
            0,
            json!({"id": GUILD_ID.to_string(), "name": "renamed"}),
        );
        cache.apply(&update).unwrap();
        cache.apply(&update).unwrap();

        let guild = cache.lookup(EntityKind::Guild, &[GUILD_ID]).unwrap();
        assert_eq!(guild["name"], "renamed");
        assert_eq!(cache.stats().entities["Guild"], 1);
    }

    #[test]
    fn test_update_of_unknown_guild_ignored() {
        let cache = EntityCache::new();
        let update = event("GUILD_UPDATE", 0, json!({"id": "5", "name": "x"}));
        assert!(!cache.apply(&update).unwrap());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_delete_after_many_updates() {
        let cache = EntityCache::new();
        cache.apply(&guild_create()).unwrap();
        for i in 0..10 {
            cache
                .apply(&event(
                    "GUILD_UPDATE",
                    0,
                    json!({"id": GUILD_ID.to_string(), "name": format!("v{}", i)}),
                ))
                .unwrap();
        }
        cache
            .apply(&event("GUILD_DELETE", 0, json!({"id": GUILD_ID.to_string()})))
            .unwrap();

        assert!(matches!(
            cache.lookup(EntityKind::Guild, &[GUILD_ID]),
            Err(CacheError::NotFound)
        ));
    }

    #[test]
    fn test_guild_delete_cascades() {
        let cache = EntityCache::new();
        cache.apply(&guild_create()).unwrap();
        cache
            .apply(&event("GUILD_DELETE", 0, json!({"id": GUILD_ID.to_string()})))
            .unwrap();

        assert!(cache.lookup(EntityKind::GuildChannel, &[10]).is_err());
        assert!(cache.lookup(EntityKind::Role, &[20]).is_err());
        assert!(cache.lookup(EntityKind::Emoji, &[30]).is_err());
        assert!(cache.lookup(EntityKind::Member, &[GUILD_ID, 40]).is_err());
        assert!(cache.lookup(EntityKind::VoiceState, &[GUILD_ID, 40]).is_err());
        // Users are global and outlive the guild.
        assert!(cache.lookup(EntityKind::User, &[40]).is_ok());
    }

    #[test]
    fn test_unrecognized_event_is_noop() {
        let cache = EntityCache::new();
        assert!(!cache
            .apply(&event("TYPING_START", 0, json!({"channel_id": "1"})))
            .unwrap());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_malformed_body_of_known_event() {
        let cache = EntityCache::new();
        let bad = NormalizedEvent::new("GUILD_CREATE", 0, b"{not json".to_vec());
        assert!(matches!(cache.apply(&bad), Err(CacheError::Json(_))));
    }

    #[test]
    fn test_channel_kinds_and_delete() {
        let cache = EntityCache::new();
        cache
            .apply(&event("CHANNEL_CREATE", 0, json!({"id": "1", "type": 1})))
            .unwrap();
        cache
            .apply(&event("CHANNEL_CREATE", 0, json!({"id": "2", "type": 3})))
            .unwrap();

        assert!(cache.lookup(EntityKind::PrivateChannel, &[1]).is_ok());
        assert!(cache.lookup(EntityKind::Group, &[2]).is_ok());

        cache
            .apply(&event("CHANNEL_DELETE", 0, json!({"id": "1", "type": 1})))
            .unwrap();
        assert!(cache.lookup(EntityKind::PrivateChannel, &[1]).is_err());
    }

    #[test]
    fn test_member_lifecycle() {
        let cache = EntityCache::new();
        cache.apply(&guild_create()).unwrap();

        cache
            .apply(&event(
                "GUILD_MEMBER_UPDATE",
                0,
                json!({"guild_id": GUILD_ID.to_string(), "user": {"id": "40"}, "nick": "al"}),
            ))
            .unwrap();
        let member = cache.lookup(EntityKind::Member, &[GUILD_ID, 40]).unwrap();
        assert_eq!(member["nick"], "al");

        cache
            .apply(&event(
                "GUILD_MEMBER_REMOVE",
                0,
                json!({"guild_id": GUILD_ID.to_string(), "user": {"id": "40"}}),
            ))
            .unwrap();
        assert!(matches!(
            cache.lookup(EntityKind::Member, &[GUILD_ID, 40]),
            Err(CacheError::NotFound)
        ));
    }

    #[test]
    fn test_role_and_emoji_updates() {
        let cache = EntityCache::new();
        cache.apply(&guild_create()).unwrap();

        cache
            .apply(&event(
                "GUILD_ROLE_UPDATE",
                0,
                json!({"guild_id": GUILD_ID.to_string(), "role": {"id": "20", "name": "everyone"}}),
            ))
            .unwrap();
        assert_eq!(cache.lookup(EntityKind::Role, &[20]).unwrap()["name"], "everyone");

        cache
            .apply(&event(
                "GUILD_EMOJIS_UPDATE",
                0,
                json!({"guild_id": GUILD_ID.to_string(), "emojis": [{"id": "31"}]}),
            ))
            .unwrap();
        assert!(cache.lookup(EntityKind::Emoji, &[30]).is_err());
        assert!(cache.lookup(EntityKind::Emoji, &[31]).is_ok());

        cache
            .apply(&event(
                "GUILD_ROLE_DELETE",
                0,
                json!({"guild_id": GUILD_ID.to_string(), "role_id": "20"}),
            ))
            .unwrap();
        assert!(cache.lookup(EntityKind::Role, &[20]).is_err());
    }

    #[test]
    fn test_voice_channel_states() {
        let cache = EntityCache::new();
        cache.apply(&guild_create()).unwrap();

        let states = cache.lookup(EntityKind::VoiceChannelStates, &[11]).unwrap();
        assert_eq!(states.as_array().unwrap().len(), 1);

        cache
            .apply(&event(
                "VOICE_STATE_UPDATE",
                0,
                json!({"guild_id": GUILD_ID.to_string(), "user_id": "40", "channel_id": null}),
            ))
            .unwrap();
        let states = cache.lookup(EntityKind::VoiceChannelStates, &[11]).unwrap();
        assert!(states.as_array().unwrap().is_empty());
        assert!(cache.lookup(EntityKind::VoiceState, &[GUILD_ID, 40]).is_err());

        assert!(matches!(
            cache.lookup(EntityKind::VoiceChannelStates, &[999]),
            Err(CacheError::NotFound)
        ));
    }

    #[test]
    fn test_ready_and_user_update() {
        let cache = EntityCache::new();
        cache
            .apply(&event(
                "READY",
                0,
                json!({"session_id": "abc", "user": {"id": "1", "username": "rateway"}, "guilds": []}),
            ))
            .unwrap();
        assert_eq!(
            cache.lookup(EntityKind::CurrentUser, &[]).unwrap()["username"],
            "rateway"
        );

        cache
            .apply(&event("USER_UPDATE", 0, json!({"id": "1", "username": "renamed"})))
            .unwrap();
        assert_eq!(
            cache.lookup(EntityKind::CurrentUser, &[]).unwrap()["username"],
            "renamed"
        );
        assert_eq!(cache.lookup(EntityKind::User, &[1]).unwrap()["username"], "renamed");
    }

    #[test]
    fn test_message_lifecycle() {
        let cache = EntityCache::new();
        cache
            .apply(&event(
                "MESSAGE_CREATE",
                0,
                json!({"id": "100", "content": "hi", "author": {"id": "40"}}),
            ))
            .unwrap();
        cache
            .apply(&event("MESSAGE_UPDATE", 0, json!({"id": "100", "content": "edited"})))
            .unwrap();

        let message = cache.lookup(EntityKind::Message, &[100]).unwrap();
        assert_eq!(message["content"], "edited");
        assert_eq!(message["author"]["id"], "40");

        cache
            .apply(&event("MESSAGE_DELETE_BULK", 0, json!({"ids": ["100", "101"]})))
            .unwrap();
        assert!(cache.lookup(EntityKind::Message, &[100]).is_err());
    }

    #[test]
    fn test_message_eviction() {
        let cache = EntityCache::with_config(CacheConfig {
            message_cache_size: 3,
        });
        for id in 1..=5u64 {
            cache
                .apply(&event("MESSAGE_CREATE", 0, json!({"id": id.to_string()})))
                .unwrap();
        }

        assert!(cache.lookup(EntityKind::Message, &[1]).is_err());
        assert!(cache.lookup(EntityKind::Message, &[2]).is_err());
        for id in 3..=5 {
            assert!(cache.lookup(EntityKind::Message, &[id]).is_ok());
        }
        assert_eq!(cache.stats().entities["Message"], 3);
    }

    #[test]
    fn test_recreated_message_evicted_by_new_position() {
        let cache = EntityCache::with_config(CacheConfig {
            message_cache_size: 2,
        });
        let create = |id: &str| {
            cache
                .apply(&event("MESSAGE_CREATE", 0, json!({"id": id})))
                .unwrap();
        };

        create("1");
        cache
            .apply(&event("MESSAGE_DELETE", 0, json!({"id": "1"})))
            .unwrap();
        create("2");
        create("1");
        create("3");

        assert!(cache.lookup(EntityKind::Message, &[2]).is_err());
        assert!(cache.lookup(EntityKind::Message, &[1]).is_ok());
        assert!(cache.lookup(EntityKind::Message, &[3]).is_ok());
        assert_eq!(cache.stats().entities["Message"], 2);
    }

    #[test]
    fn test_invalidate_shard() {
        let cache = EntityCache::new();
        cache.apply(&guild_create()).unwrap();
        cache
            .apply(&event("GUILD_CREATE", 1, json!({"id": "7", "name": "other"})))
            .unwrap();

        assert_eq!(cache.invalidate_shard(0), 1);
        assert!(cache.lookup(EntityKind::Guild, &[GUILD_ID]).is_err());
        assert!(cache.lookup(EntityKind::GuildChannel, &[10]).is_err());
        assert!(cache.lookup(EntityKind::Guild, &[7]).is_ok());
    }

    #[test]
    fn test_stats() {
        let cache = EntityCache::new();
        cache.apply(&guild_create()).unwrap();

        let stats = cache.stats();
        assert_eq!(stats.guilds, 1);
        assert_eq!(stats.applied_events, 1);
        assert_eq!(stats.entities["GuildChannel"], 2);
        assert_eq!(stats.entities["Member"], 1);
    }

    #[test]
    fn test_concurrent_apply_and_lookup() {
        use std::thread;

        let cache = EntityCache::new();
        let writer_a = cache.clone();
        let writer_b = cache.clone();
        let reader = cache.clone();

        let h1 = thread::spawn(move || {
            for i in 0..100u64 {
                writer_a
                    .apply(&event("GUILD_CREATE", 0, json!({"id": i.to_string(), "channels": [{"id": (10_000 + i).to_string()}]})))
                    .unwrap();
            }
        });
        let h2 = thread::spawn(move || {
            for i in 100..200u64 {
                writer_b
                    .apply(&event("GUILD_CREATE", 1, json!({"id": i.to_string(), "channels": [{"id": (10_000 + i).to_string()}]})))
                    .unwrap();
            }
        });
        let h3 = thread::spawn(move || {
            for i in 0..200u64 {
                // A guild is never visible without the channel from the same event.
                if reader.lookup(EntityKind::Guild, &[i]).is_ok() {
                    assert!(reader.lookup(EntityKind::GuildChannel, &[10_000 + i]).is_ok());
                }
            }
        });

        h1.join().unwrap();
        h2.join().unwrap();
        h3.join().unwrap();

        assert_eq!(cache.stats().guilds, 200);
    }
}
