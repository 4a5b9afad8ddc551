//! REST API Handlers
//!
//! Read-mostly view of the control plane: discovered backends, a cache
//! refresh trigger, metrics, and health probes.

use crate::controlplane::discovery::{Availability, DiscoverySnapshot};
use crate::controlplane::metrics::MetricsSnapshot;
use crate::controlplane::Orchestrator;
use crate::domain::Backend;
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

// =============================================================================
// Response Types
// =============================================================================

/// One backend as reported by discovery
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendInfoResponse {
    pub backend: Backend,
    pub label: String,
    pub availability: Availability,
    pub health: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Discovery view
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendsResponse {
    pub backends: Vec<BackendInfoResponse>,
    /// Available backends in preference order
    pub available: Vec<Backend>,
    pub errors: Vec<String>,
}

impl From<&DiscoverySnapshot> for BackendsResponse {
    fn from(snapshot: &DiscoverySnapshot) -> Self {
        let backends = snapshot
            .results
            .values()
            .map(|result| BackendInfoResponse {
                backend: result.backend,
                label: result.backend.label().to_string(),
                availability: result.availability,
                health: format!("{:?}", result.health).to_lowercase(),
                version: result.capabilities.as_ref().and_then(|c| c.version.clone()),
                error: result.error.clone(),
            })
            .collect();
        Self {
            backends,
            available: snapshot.available(),
            errors: snapshot.errors.clone(),
        }
    }
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    orchestrator: Arc<Orchestrator>,
}

impl RestRouter {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            orchestrator: self.orchestrator,
        };

        Router::new()
            // Discovery endpoints
            .route("/v1/backends", get(list_backends))
            .route("/v1/backends/refresh", post(refresh_backends))
            // Metrics endpoint
            .route("/v1/metrics", get(get_metrics))
            // Health endpoints
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .with_state(state)
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(CorsLayer::permissive()),
            )
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
}

// =============================================================================
// Handlers
// =============================================================================

/// Current discovery snapshot (cached)
async fn list_backends(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.orchestrator.discovery().discover_backends().await;
    (StatusCode::OK, Json(BackendsResponse::from(snapshot.as_ref())))
}

/// Drop the discovery cache and probe again
async fn refresh_backends(State(state): State<AppState>) -> impl IntoResponse {
    state.orchestrator.invalidate_cache();
    let snapshot = state.orchestrator.discovery().discover_backends().await;
    info!("Discovery refreshed: {} backends available", snapshot.available().len());
    (StatusCode::OK, Json(BackendsResponse::from(snapshot.as_ref())))
}

async fn get_metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.orchestrator.get_metrics())
}

/// Health check
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Ready once at least one backend is installed
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.orchestrator.discovery().discover_backends().await;
    if snapshot.available().is_empty() {
        (StatusCode::SERVICE_UNAVAILABLE, "no replication backend available")
    } else {
        (StatusCode::OK, "ready")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OperatorConfig;
    use crate::store::memory::InMemoryResourceStore;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn router(backends: &[Backend]) -> (Arc<InMemoryResourceStore>, Router) {
        let store = Arc::new(InMemoryResourceStore::with_backends(backends));
        let orchestrator = Orchestrator::from_config(&OperatorConfig::default(), store.clone()).unwrap();
        (store, RestRouter::new(Arc::new(orchestrator)).build())
    }

    async fn call(router: &Router, method: &str, uri: &str) -> (StatusCode, Vec<u8>) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), 1 << 20).await.unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_list_backends() {
        let (_store, router) = router(&[Backend::Trident]);
        let (status, body) = call(&router, "GET", "/v1/backends").await;
        assert_eq!(status, StatusCode::OK);

        let response: BackendsResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(response.available, vec![Backend::Trident]);
        assert_eq!(response.backends.len(), 3);
    }

    #[tokio::test]
    async fn test_refresh_sees_new_backend() {
        let (store, router) = router(&[]);
        let (status, _) = call(&router, "GET", "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        store.install_backend(Backend::Ceph);
        // still cached
        let (status, _) = call(&router, "GET", "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, body) = call(&router, "POST", "/v1/backends/refresh").await;
        assert_eq!(status, StatusCode::OK);
        let response: BackendsResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(response.available, vec![Backend::Ceph]);

        let (status, _) = call(&router, "GET", "/ready").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_and_health() {
        let (_store, router) = router(&[Backend::Ceph]);
        call(&router, "GET", "/v1/backends").await;
        call(&router, "GET", "/v1/backends").await;

        let (status, body) = call(&router, "GET", "/v1/metrics").await;
        assert_eq!(status, StatusCode::OK);
        let metrics: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(metrics["cacheMisses"], 1);
        assert_eq!(metrics["cacheHits"], 1);

        let (status, body) = call(&router, "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"ok");
    }
}
