//! Health, readiness, metrics and statistics endpoints

use crate::metrics::ProjectorMetrics;
use crate::shard::{ShardStatistics, WorkerPool, WorkerStatistics};
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub keyspace: String,
}

/// Readiness check response
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub keyspace: String,
    pub workers_total: usize,
    pub workers_alive: usize,
    pub nats_connected: bool,
}

/// Statistics response, built from the poller's cache
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub keyspace: String,
    pub session_id: String,
    pub totals: ShardStatistics,
    pub workers: Vec<WorkerStatistics>,
}

/// Application state for health endpoints
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<WorkerPool>,
    pub nats: Option<async_nats::Client>,
    pub metrics: ProjectorMetrics,
}

impl AppState {
    fn nats_connected(&self) -> bool {
        self.nats.as_ref().map_or(true, crate::nats::is_connected)
    }
}

/// Create the health check router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
}

/// Health endpoint - always returns 200 if process is running
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        keyspace: state.pool.keyspace_id().to_string(),
    })
}

/// Readiness endpoint - returns 200 while every worker is alive
async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    let workers_total = state.pool.worker_count();
    let workers_alive = state.pool.alive_workers();
    let nats_connected = state.nats_connected();

    let is_ready = workers_alive == workers_total && nats_connected;

    let response = ReadyResponse {
        ready: is_ready,
        keyspace: state.pool.keyspace_id().to_string(),
        workers_total,
        workers_alive,
        nats_connected,
    };

    if is_ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Metrics endpoint - returns Prometheus format metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    state
        .metrics
        .set_workers_alive(state.pool.keyspace_id(), state.pool.alive_workers());

    if state.nats.is_some() {
        state.metrics.set_nats_connected(state.nats_connected());
    }

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.metrics.render(),
    )
}

/// Statistics endpoint - last polled per-shard counters
async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(stats_response(&state.pool))
}

fn stats_response(pool: &WorkerPool) -> StatsResponse {
    let mut workers: Vec<WorkerStatistics> = pool
        .stats_cache()
        .iter()
        .map(|entry| entry.value().clone())
        .collect();
    workers.sort_by_key(|stats| stats.worker_id);

    let totals = workers
        .iter()
        .map(WorkerStatistics::totals)
        .fold(ShardStatistics::default(), |acc, t| ShardStatistics {
            syncs: acc.syncs + t.syncs,
            snapshots: acc.snapshots + t.snapshots,
            mutations: acc.mutations + t.mutations,
        });

    StatsResponse {
        keyspace: pool.keyspace_id().to_string(),
        session_id: pool.session_id().to_string(),
        totals,
        workers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProjectorConfig;
    use crate::engine::{Engine, ProjectionEngine, ProjectionSpec};
    use crate::error::ProjectorError;
    use crate::events::ChangeEvent;

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "healthy",
            version: "0.2.0",
            keyspace: "travel".to_string(),
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("healthy"));
    }

    #[test]
    fn test_ready_response_serialization() {
        let response = ReadyResponse {
            ready: true,
            keyspace: "travel".to_string(),
            workers_total: 4,
            workers_alive: 4,
            nats_connected: true,
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"ready\":true"));
    }

    #[tokio::test]
    async fn test_stats_from_cache() {
        let config = ProjectorConfig {
            worker_count: 2,
            ..ProjectorConfig::default()
        };
        let pool = WorkerPool::spawn_with_fatal_handler(
            &config,
            ProjectorMetrics::detached(),
            Arc::new(|_: &ProjectorError| {}),
        );
        assert!(stats_response(&pool).workers.is_empty());

        let engine: Arc<dyn Engine> = Arc::new(ProjectionEngine::new(ProjectionSpec {
            id: 1,
            name: "idx_age".to_string(),
            collection_id: 8,
            fields: vec!["age".to_string()],
            filter: None,
            endpoints: vec!["A".to_string()],
        }));
        pool.install_engines(1, vec![engine], None).await.unwrap();
        pool.submit(ChangeEvent::stream_begin(0, 1, 0)).await.unwrap();
        pool.submit(ChangeEvent::stream_begin(1, 1, 0)).await.unwrap();
        pool.flush().await.unwrap();
        pool.sync_pulse().await.unwrap();
        pool.flush().await.unwrap();
        pool.refresh_statistics().await;

        let response = stats_response(&pool);
        assert_eq!(response.workers.len(), 2);
        assert_eq!(response.workers[0].worker_id, 0);
        assert_eq!(response.totals.syncs, 2);
        pool.close().await.unwrap();
    }
}
