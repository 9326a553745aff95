//! Entity type tags and keys.

use crate::error::CacheError;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Type tags accepted by cache queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    CurrentUser,
    GuildChannel,
    Emoji,
    Group,
    Guild,
    Member,
    Message,
    Presence,
    PrivateChannel,
    Role,
    User,
    VoiceChannelStates,
    VoiceState,
}

impl EntityKind {
    pub const ALL: [EntityKind; 13] = [
        EntityKind::CurrentUser,
        EntityKind::GuildChannel,
        EntityKind::Emoji,
        EntityKind::Group,
        EntityKind::Guild,
        EntityKind::Member,
        EntityKind::Message,
        EntityKind::Presence,
        EntityKind::PrivateChannel,
        EntityKind::Role,
        EntityKind::User,
        EntityKind::VoiceChannelStates,
        EntityKind::VoiceState,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::CurrentUser => "CurrentUser",
            EntityKind::GuildChannel => "GuildChannel",
            EntityKind::Emoji => "Emoji",
            EntityKind::Group => "Group",
            EntityKind::Guild => "Guild",
            EntityKind::Member => "Member",
            EntityKind::Message => "Message",
            EntityKind::Presence => "Presence",
            EntityKind::PrivateChannel => "PrivateChannel",
            EntityKind::Role => "Role",
            EntityKind::User => "User",
            EntityKind::VoiceChannelStates => "VoiceChannelStates",
            EntityKind::VoiceState => "VoiceState",
        }
    }

    /// Number of ids a lookup for this kind takes.
    ///
    /// Guild-scoped per-user entities take `[guild_id, user_id]`.
    pub fn arity(&self) -> usize {
        match self {
            EntityKind::CurrentUser => 0,
            EntityKind::Member | EntityKind::Presence | EntityKind::VoiceState => 2,
            _ => 1,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| CacheError::UnknownEntityType(s.to_string()))
    }
}

/// Arena key: the kind plus up to two ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub id: u64,
    /// User id for guild-scoped per-user entities, otherwise 0.
    pub secondary: u64,
}

impl EntityKey {
    pub fn new(kind: EntityKind, id: u64) -> Self {
        Self {
            kind,
            id,
            secondary: 0,
        }
    }

    pub fn scoped(kind: EntityKind, guild_id: u64, user_id: u64) -> Self {
        Self {
            kind,
            id: guild_id,
            secondary: user_id,
        }
    }

    /// Build a key from query arguments, checking the arity.
    pub fn from_args(kind: EntityKind, args: &[u64]) -> Result<Self, CacheError> {
        if args.len() != kind.arity() {
            return Err(CacheError::InvalidArguments {
                kind: kind.as_str(),
                expected: kind.arity(),
                got: args.len(),
            });
        }
        Ok(match args {
            [] => EntityKey::new(kind, 0),
            [id] => EntityKey::new(kind, *id),
            [guild_id, user_id] => EntityKey::scoped(kind, *guild_id, *user_id),
            _ => unreachable!("arity is at most 2"),
        })
    }
}

/// Read an id that may be encoded as a string or a number.
pub(crate) fn snowflake(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

/// Read `field` from an object as an id.
pub(crate) fn field_id(value: &Value, field: &str) -> Option<u64> {
    value.get(field).and_then(snowflake)
}
