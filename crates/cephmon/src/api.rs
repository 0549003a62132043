use crate::config::MonConfig;
use crate::model::{Cluster, ClusterId, Counters, OsdRecord, PoolRecord, ServerView};
use crate::store::{ClusterStore, StoreError};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Cluster listing entry; the snapshot itself is served per cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub id: ClusterId,
    pub name: String,
    pub api_base_url: String,
    pub overall_status: Option<String>,
    pub update_time: Option<DateTime<Utc>>,
    pub update_attempt_time: Option<DateTime<Utc>>,
    pub update_error_msg: Option<String>,
    pub update_error_isclient: bool,
}

impl From<&Cluster> for ClusterSummary {
    fn from(cluster: &Cluster) -> Self {
        Self {
            id: cluster.id,
            name: cluster.name.clone(),
            api_base_url: cluster.api_base_url.clone(),
            overall_status: cluster
                .snapshot
                .as_ref()
                .map(|s| s.health.overall_status.clone()),
            update_time: cluster.update_time,
            update_attempt_time: cluster.update_attempt_time,
            update_error_msg: cluster.update_error_msg.clone(),
            update_error_isclient: cluster.update_error_isclient,
        }
    }
}

#[derive(Debug)]
enum ApiError {
    Store(StoreError),
    NoSnapshot(ClusterId),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Store(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Store(e @ StoreError::ClusterNotFound(_)) => (StatusCode::NOT_FOUND, e.to_string()),
            ApiError::Store(e) => {
                tracing::error!("Store error serving request: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
            ApiError::NoSnapshot(id) => (
                StatusCode::NOT_FOUND,
                format!("Cluster {} has not been refreshed yet", id),
            ),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[derive(Clone)]
pub struct AdminApi {
    store: Arc<dyn ClusterStore>,
    config: Arc<MonConfig>,
}

impl AdminApi {
    pub fn new(store: Arc<dyn ClusterStore>, config: Arc<MonConfig>) -> Self {
        Self { store, config }
    }

    pub fn router(self: Arc<Self>) -> Router {
        let protected = Router::new()
            .route("/api/v1/clusters", get(clusters_handler))
            .route("/api/v1/clusters/:id", get(cluster_handler))
            .route("/api/v1/clusters/:id/counters", get(counters_handler))
            .route("/api/v1/clusters/:id/osds", get(osds_handler))
            .route("/api/v1/clusters/:id/servers", get(servers_handler))
            .route("/api/v1/clusters/:id/pools", get(pools_handler))
            .layer(axum::middleware::from_fn_with_state(
                self.clone(),
                auth_middleware,
            ));

        let public = Router::new().route("/health", get(health_handler));

        Router::new()
            .merge(protected)
            .merge(public)
            .layer(axum::middleware::from_fn(
                crate::security::security_headers_middleware,
            ))
            .layer(TraceLayer::new_for_http())
            .with_state(self)
    }

    pub async fn serve(self) -> anyhow::Result<()> {
        let addr = self.config.bind_addr;
        let router = Arc::new(self).router();

        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Read API listening on {}", addr);

        axum::serve(listener, router.into_make_service()).await?;
        Ok(())
    }
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn clusters_handler(
    State(state): State<Arc<AdminApi>>,
) -> Result<Json<Vec<ClusterSummary>>, ApiError> {
    let clusters = state.store.clusters()?;
    Ok(Json(clusters.iter().map(ClusterSummary::from).collect()))
}

async fn cluster_handler(
    State(state): State<Arc<AdminApi>>,
    Path(id): Path<ClusterId>,
) -> Result<Json<Cluster>, ApiError> {
    Ok(Json(state.store.cluster(id)?))
}

async fn counters_handler(
    State(state): State<Arc<AdminApi>>,
    Path(id): Path<ClusterId>,
) -> Result<Json<Counters>, ApiError> {
    let snapshot = state.store.cluster(id)?.snapshot.ok_or(ApiError::NoSnapshot(id))?;
    Ok(Json(snapshot.counters))
}

async fn osds_handler(
    State(state): State<Arc<AdminApi>>,
    Path(id): Path<ClusterId>,
) -> Result<Json<Vec<OsdRecord>>, ApiError> {
    let snapshot = state.store.cluster(id)?.snapshot.ok_or(ApiError::NoSnapshot(id))?;
    Ok(Json(snapshot.osds))
}

async fn servers_handler(
    State(state): State<Arc<AdminApi>>,
    Path(id): Path<ClusterId>,
) -> Result<Json<Vec<ServerView>>, ApiError> {
    Ok(Json(state.store.servers(id)?))
}

async fn pools_handler(
    State(state): State<Arc<AdminApi>>,
    Path(id): Path<ClusterId>,
) -> Result<Json<Vec<PoolRecord>>, ApiError> {
    Ok(Json(state.store.pools(id)?))
}

async fn auth_middleware(
    State(state): State<Arc<AdminApi>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(token) = state.config.admin_token.as_deref() else {
        return next.run(request).await;
    };

    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(crate::security::bearer_token)
        .is_some_and(|provided| crate::security::constant_time_eq(provided, token));

    if authorized {
        return next.run(request).await;
    }
    tracing::warn!(path = %request.uri().path(), "rejected unauthenticated API request");
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, r#"Bearer realm="cephmon""#)],
        "Unauthorized",
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ClusterSnapshot;
    use crate::store::MemoryStore;
    use tower::ServiceExt;

    fn api_with(config: MonConfig) -> (Arc<MemoryStore>, Router) {
        let store = Arc::new(MemoryStore::new());
        let api = Arc::new(AdminApi::new(store.clone(), Arc::new(config)));
        (store, api.router())
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null))
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (_, router) = api_with(MonConfig::default());
        let (status, json) = get_json(router, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_security_headers_present() {
        let (_, router) = api_with(MonConfig::default());
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.headers()["x-content-type-options"], "nosniff");
        assert_eq!(response.headers()["x-frame-options"], "DENY");
    }

    #[tokio::test]
    async fn test_clusters_list() {
        let (store, router) = api_with(MonConfig::default());
        store.add_cluster("ceph", "http://mon1:5000/api/v0.1").unwrap();
        let (status, json) = get_json(router, "/api/v1/clusters").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json[0]["name"], "ceph");
        assert!(json[0]["overall_status"].is_null());
    }

    #[tokio::test]
    async fn test_unknown_cluster_is_404_json() {
        let (_, router) = api_with(MonConfig::default());
        let (status, json) = get_json(router, "/api/v1/clusters/7").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(json["error"].as_str().unwrap().contains('7'));
    }

    #[tokio::test]
    async fn test_counters_before_first_refresh() {
        let (store, router) = api_with(MonConfig::default());
        let cluster = store.add_cluster("ceph", "http://x").unwrap();
        let (status, _) = get_json(router, &format!("/api/v1/clusters/{}/counters", cluster.id)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_counters_after_commit() {
        let (store, router) = api_with(MonConfig::default());
        let cluster = store.add_cluster("ceph", "http://x").unwrap();
        let mut snapshot = ClusterSnapshot::default();
        snapshot.counters.osd.ok.add(3);
        let mut txn = store.begin(cluster.id).unwrap();
        txn.set_snapshot(snapshot, Utc::now());
        store.commit(txn).unwrap();

        let (status, json) = get_json(router, &format!("/api/v1/clusters/{}/counters", cluster.id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["osd"]["ok"]["count"], 3);
    }

    #[tokio::test]
    async fn test_servers_and_pools_empty() {
        let (store, router) = api_with(MonConfig::default());
        let cluster = store.add_cluster("ceph", "http://x").unwrap();
        let (status, json) = get_json(router.clone(), &format!("/api/v1/clusters/{}/servers", cluster.id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json, serde_json::json!([]));
        let (status, _) = get_json(router, &format!("/api/v1/clusters/{}/pools", cluster.id)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_token_required_when_configured() {
        let config = MonConfig {
            admin_token: Some("secret-token".to_string()),
            ..MonConfig::default()
        };
        let (_, router) = api_with(config);

        let request = Request::builder().uri("/api/v1/clusters").body(Body::empty()).unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let request = Request::builder()
            .uri("/api/v1/clusters")
            .header("Authorization", "Bearer wrong-token")
            .body(Body::empty())
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let request = Request::builder()
            .uri("/api/v1/clusters")
            .header("Authorization", "Bearer secret-token")
            .body(Body::empty())
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let (status, _) = get_json(router, "/health").await;
        assert_eq!(status, StatusCode::OK);
    }
}
