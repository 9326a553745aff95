//! Cache Query Service - answers `cache` messages from the entity cache.
//!
//! Request:
//!
//! ```json
//! {"type": "Guild", "arguments": [430017996304678923], "return_routing_key": "guild-430017996304678923"}
//! ```
//!
//! The reply goes to the exchange under `return_routing_key`. Its body is the
//! entity itself, or an `{"error": ...}` object; the `rateway_status` header
//! says which. Return keys are chosen by the caller; nothing here makes them
//! unique, so concurrent callers should use distinct keys or a
//! `correlation_id`. The command keys `gateway` and `cache` are refused as
//! return keys, since a reply there would be consumed as a command.

use crate::error::{Error, Result};
use amqp_client::{
    AMQPValue, BasicProperties, Delivery, DeliveryHandler, FieldTable, LongString, Publish,
    CACHE_ROUTING_KEY, GATEWAY_ROUTING_KEY,
};
use async_trait::async_trait;
use entity_cache::{CacheError, EntityCache, EntityKind};
use metrics::counter;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Header carrying the outcome of a query.
pub const STATUS_HEADER: &str = "rateway_status";

/// A parsed `cache` request.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheQuery {
    /// Entity type tag as sent; resolved against [`EntityKind`] when answering.
    pub kind: String,
    /// Arguments as sent: integers or numeric strings.
    pub arguments: Vec<Value>,
    pub return_routing_key: String,
    pub correlation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawQuery {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    arguments: Vec<Value>,
    #[serde(default)]
    return_routing_key: Option<String>,
    #[serde(default)]
    correlation_id: Option<String>,
}

/// Parse a `cache` message.
///
/// Fails only when no reply can be addressed or the type tag is missing.
pub fn parse_query(body: &[u8]) -> Result<CacheQuery> {
    let raw: RawQuery =
        serde_json::from_slice(body).map_err(|e| Error::MalformedCacheQuery(e.to_string()))?;

    let return_routing_key = raw
        .return_routing_key
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| Error::MalformedCacheQuery("missing return_routing_key".into()))?;
    if return_routing_key == GATEWAY_ROUTING_KEY || return_routing_key == CACHE_ROUTING_KEY {
        return Err(Error::MalformedCacheQuery(format!(
            "return_routing_key '{}' is reserved for commands",
            return_routing_key
        )));
    }

    Ok(CacheQuery {
        kind: raw.kind,
        arguments: raw.arguments,
        return_routing_key,
        correlation_id: raw.correlation_id,
    })
}

/// Outcome of one query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    Found(Arc<Value>),
    NotFound,
    UnknownEntityType,
    InvalidArguments(String),
}

impl QueryResult {
    /// Value of the status header.
    pub fn status(&self) -> &'static str {
        match self {
            QueryResult::Found(_) => "found",
            QueryResult::NotFound => "not_found",
            QueryResult::UnknownEntityType => "unknown_entity_type",
            QueryResult::InvalidArguments(_) => "invalid_arguments",
        }
    }
}

fn snowflake_argument(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Answer a query from the cache.
pub fn resolve(cache: &EntityCache, query: &CacheQuery) -> QueryResult {
    let kind: EntityKind = match query.kind.parse() {
        Ok(kind) => kind,
        Err(_) => return QueryResult::UnknownEntityType,
    };

    let mut ids = Vec::with_capacity(query.arguments.len());
    for arg in &query.arguments {
        match snowflake_argument(arg) {
            Some(id) => ids.push(id),
            None => {
                return QueryResult::InvalidArguments(format!("{} is not a snowflake id", arg))
            }
        }
    }

    match cache.lookup(kind, &ids) {
        Ok(entity) => QueryResult::Found(entity),
        Err(CacheError::NotFound) => QueryResult::NotFound,
        Err(CacheError::UnknownEntityType(_)) => QueryResult::UnknownEntityType,
        Err(e @ CacheError::InvalidArguments { .. }) => QueryResult::InvalidArguments(e.to_string()),
        Err(e) => {
            error!("[cache-query] Lookup of {} failed: {}", kind, e);
            QueryResult::NotFound
        }
    }
}

/// Serialize the reply body.
pub fn reply_body(query: &CacheQuery, result: &QueryResult) -> Vec<u8> {
    let body = match result {
        QueryResult::Found(entity) => return serde_json::to_vec(entity.as_ref()).unwrap_or_default(),
        QueryResult::NotFound => json!({
            "error": "not_found",
            "type": query.kind,
            "arguments": query.arguments,
        }),
        QueryResult::UnknownEntityType => json!({
            "error": "unknown_entity_type",
            "type": query.kind,
        }),
        QueryResult::InvalidArguments(message) => json!({
            "error": "invalid_arguments",
            "type": query.kind,
            "arguments": query.arguments,
            "message": message,
        }),
    };
    body.to_string().into_bytes()
}

/// Reply properties: status header plus the caller's correlation id.
pub fn reply_properties(query: &CacheQuery, result: &QueryResult) -> BasicProperties {
    let mut headers = FieldTable::default();
    headers.insert(
        STATUS_HEADER.into(),
        AMQPValue::LongString(LongString::from(result.status())),
    );

    let properties = BasicProperties::default()
        .with_content_type("application/json".into())
        .with_headers(headers);
    match &query.correlation_id {
        Some(id) => properties.with_correlation_id(id.as_str().into()),
        None => properties,
    }
}

/// Consumer of the `cache` queue.
pub struct QueryHandler<P: Publish> {
    cache: EntityCache,
    publisher: P,
}

impl<P: Publish> QueryHandler<P> {
    pub fn new(cache: EntityCache, publisher: P) -> Self {
        Self { cache, publisher }
    }

    /// Parse, resolve and reply. Exactly one reply per parsed query.
    pub async fn answer(&self, body: &[u8]) -> Result<QueryResult> {
        let query = match parse_query(body) {
            Ok(query) => query,
            Err(e) => {
                counter!("rateway_cache_queries_malformed_total").increment(1);
                return Err(e);
            }
        };

        let result = resolve(&self.cache, &query);
        counter!("rateway_cache_queries_total", "status" => result.status()).increment(1);
        debug!(
            "[cache-query] {} {:?} -> {}",
            query.kind,
            query.arguments,
            result.status()
        );

        self.publisher
            .publish(
                &query.return_routing_key,
                &reply_body(&query, &result),
                reply_properties(&query, &result),
            )
            .await
            .map_err(|e| Error::Broker(format!("{:#}", e)))?;

        Ok(result)
    }
}

#[async_trait]
impl<P: Publish> DeliveryHandler for QueryHandler<P> {
    const NAME: &'static str = "cache-query";

    async fn handle(&self, delivery: &Delivery) {
        if let Err(e) = self.answer(&delivery.data).await {
            warn!("[cache-query] No reply sent: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use normalizer::NormalizedEvent;
    use parking_lot::Mutex;

    const GUILD_ID: u64 = 430017996304678923;

    #[derive(Debug, Clone)]
    struct Reply {
        routing_key: String,
        body: Value,
        properties: BasicProperties,
    }

    impl Reply {
        fn status(&self) -> Option<AMQPValue> {
            self.properties
                .headers()
                .as_ref()
                .and_then(|h| h.inner().get(STATUS_HEADER).cloned())
        }
    }

    #[derive(Clone, Default)]
    struct Recorder {
        replies: Arc<Mutex<Vec<Reply>>>,
    }

    #[async_trait]
    impl Publish for Recorder {
        async fn publish(
            &self,
            routing_key: &str,
            payload: &[u8],
            properties: BasicProperties,
        ) -> anyhow::Result<()> {
            self.replies.lock().push(Reply {
                routing_key: routing_key.to_string(),
                body: serde_json::from_slice(payload)?,
                properties,
            });
            Ok(())
        }
    }

    fn cache_with_guild() -> EntityCache {
        let cache = EntityCache::new();
        let guild = json!({
            "id": GUILD_ID.to_string(),
            "name": "rateway",
            "channels": [{"id": "1", "type": 0, "name": "general"}],
            "roles": [],
            "members": [{"user": {"id": "7", "username": "someone"}, "roles": []}]
        });
        cache
            .apply(&NormalizedEvent::new(
                "GUILD_CREATE",
                0,
                guild.to_string().into_bytes(),
            ))
            .unwrap();
        cache
    }

    fn handler(cache: EntityCache) -> (QueryHandler<Recorder>, Recorder) {
        let recorder = Recorder::default();
        (QueryHandler::new(cache, recorder.clone()), recorder)
    }

    fn only_reply(recorder: &Recorder) -> Reply {
        let replies = recorder.replies.lock();
        assert_eq!(replies.len(), 1);
        replies[0].clone()
    }

    #[test]
    fn test_parse_query() {
        let query = parse_query(
            br#"{"type":"Guild","arguments":[430017996304678923],"return_routing_key":"guild-430017996304678923"}"#,
        )
        .unwrap();
        assert_eq!(query.kind, "Guild");
        assert_eq!(query.arguments, vec![json!(GUILD_ID)]);
        assert_eq!(query.return_routing_key, "guild-430017996304678923");
        assert_eq!(query.correlation_id, None);

        let query = parse_query(br#"{"type":"CurrentUser","return_routing_key":"me"}"#).unwrap();
        assert!(query.arguments.is_empty());
    }

    #[test]
    fn test_parse_query_rejects_unaddressable() {
        for body in [
            &b"not json"[..],
            &br#"{"type":"Guild","arguments":[1]}"#[..],
            &br#"{"type":"Guild","arguments":[1],"return_routing_key":""}"#[..],
            &br#"{"arguments":[1],"return_routing_key":"r"}"#[..],
            &br#"{"type":"Guild","arguments":[1],"return_routing_key":"gateway"}"#[..],
            &br#"{"type":"Guild","arguments":[1],"return_routing_key":"cache"}"#[..],
        ] {
            assert!(matches!(
                parse_query(body),
                Err(Error::MalformedCacheQuery(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_guild_found() {
        let (handler, recorder) = handler(cache_with_guild());
        let result = handler
            .answer(br#"{"type":"Guild","arguments":[430017996304678923],"return_routing_key":"guild-430017996304678923"}"#)
            .await
            .unwrap();
        assert_eq!(result.status(), "found");

        let reply = only_reply(&recorder);
        assert_eq!(reply.routing_key, "guild-430017996304678923");
        assert_eq!(reply.body["id"], GUILD_ID.to_string());
        assert_eq!(reply.body["name"], "rateway");
        assert_eq!(
            reply.status(),
            Some(AMQPValue::LongString(LongString::from("found")))
        );
    }

    #[tokio::test]
    async fn test_guild_not_found() {
        let (handler, recorder) = handler(EntityCache::new());
        handler
            .answer(br#"{"type":"Guild","arguments":[430017996304678923],"return_routing_key":"guild-430017996304678923"}"#)
            .await
            .unwrap();

        let reply = only_reply(&recorder);
        assert_eq!(reply.routing_key, "guild-430017996304678923");
        assert_eq!(reply.body["error"], "not_found");
        assert_eq!(reply.body["type"], "Guild");
        assert_eq!(reply.body["arguments"], json!([GUILD_ID]));
        assert_eq!(
            reply.status(),
            Some(AMQPValue::LongString(LongString::from("not_found")))
        );
    }

    #[tokio::test]
    async fn test_unknown_entity_type() {
        let (handler, recorder) = handler(cache_with_guild());
        let result = handler
            .answer(br#"{"type":"Banana","arguments":[1],"return_routing_key":"r"}"#)
            .await
            .unwrap();
        assert_eq!(result, QueryResult::UnknownEntityType);

        let reply = only_reply(&recorder);
        assert_eq!(
            reply.body,
            json!({"error": "unknown_entity_type", "type": "Banana"})
        );
    }

    #[tokio::test]
    async fn test_invalid_arguments() {
        let (handler, recorder) = handler(cache_with_guild());
        handler
            .answer(br#"{"type":"Member","arguments":[430017996304678923],"return_routing_key":"m"}"#)
            .await
            .unwrap();
        handler
            .answer(br#"{"type":"Guild","arguments":["abc"],"return_routing_key":"g"}"#)
            .await
            .unwrap();

        let replies = recorder.replies.lock();
        assert_eq!(replies.len(), 2);
        for reply in replies.iter() {
            assert_eq!(reply.body["error"], "invalid_arguments");
            assert_eq!(
                reply.status(),
                Some(AMQPValue::LongString(LongString::from("invalid_arguments")))
            );
        }
    }

    #[tokio::test]
    async fn test_member_with_string_arguments() {
        let (handler, recorder) = handler(cache_with_guild());
        let result = handler
            .answer(br#"{"type":"Member","arguments":["430017996304678923","7"],"return_routing_key":"m"}"#)
            .await
            .unwrap();
        assert_eq!(result.status(), "found");
        assert_eq!(only_reply(&recorder).body["user"]["id"], "7");
    }

    #[tokio::test]
    async fn test_correlation_id_echoed() {
        let (handler, recorder) = handler(cache_with_guild());
        handler
            .answer(br#"{"type":"Guild","arguments":[430017996304678923],"return_routing_key":"shared","correlation_id":"req-1"}"#)
            .await
            .unwrap();

        let reply = only_reply(&recorder);
        assert_eq!(
            reply.properties.correlation_id().as_ref().map(|id| id.as_str()),
            Some("req-1")
        );
    }

    #[tokio::test]
    async fn test_malformed_query_gets_no_reply() {
        let (handler, recorder) = handler(cache_with_guild());
        assert!(handler
            .answer(br#"{"type":"Guild","arguments":[1]}"#)
            .await
            .is_err());
        assert!(recorder.replies.lock().is_empty());
    }

    #[tokio::test]
    async fn test_reply_never_sent_to_command_queues() {
        let (handler, recorder) = handler(cache_with_guild());
        for key in ["gateway", "cache"] {
            let body = json!({"type": "Guild", "arguments": [GUILD_ID], "return_routing_key": key});
            assert!(matches!(
                handler.answer(body.to_string().as_bytes()).await,
                Err(Error::MalformedCacheQuery(_))
            ));
        }
        assert!(recorder.replies.lock().is_empty());
    }

    #[tokio::test]
    async fn test_guild_delete_then_query() {
        let cache = cache_with_guild();
        cache
            .apply(&NormalizedEvent::new(
                "GUILD_DELETE",
                0,
                format!(r#"{{"id":"{}"}}"#, GUILD_ID).into_bytes(),
            ))
            .unwrap();
        let (handler, recorder) = handler(cache);
        handler
            .answer(br#"{"type":"Guild","arguments":[430017996304678923],"return_routing_key":"g"}"#)
            .await
            .unwrap();
        assert_eq!(only_reply(&recorder).body["error"], "not_found");
    }
}
