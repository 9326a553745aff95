//! HTTP API using axum.
//!
//! Routes:
//! - GET /health - Health check
//! - GET /stats - Shard states and cache entity counts

use axum::{extract::State, routing::get, Json, Router};
use entity_cache::{CacheStats, EntityCache};
use serde::Serialize;
use shard::{ShardRegistry, ShardStatus};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub cluster_id: u64,
    pub cache: EntityCache,
    pub registry: ShardRegistry,
}

/// Create the API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
}

/// GET /health
async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub cluster_id: u64,
    pub connected_shards: usize,
    pub shards: Vec<ShardStatus>,
    pub cache: CacheStats,
}

/// GET /stats
async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        cluster_id: state.cluster_id,
        connected_shards: state.registry.connected_count(),
        shards: state.registry.statuses(),
        cache: state.cache.stats(),
    })
}
