use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use forkstore_meta::{MetaError, TenantId, TimelineGraph, TimelineId};
use tokio_util::sync::CancellationToken;

use crate::collector::SyntheticSizeCache;
use crate::metrics::{CollectorStats, DeliveryStats};

/// Read-only admin HTTP API.
#[derive(Clone)]
pub struct AdminApi {
    graph: Arc<TimelineGraph>,
    sizes: Arc<SyntheticSizeCache>,
    stats: CollectorStats,
    delivery: Option<DeliveryStats>,
}

impl AdminApi {
    pub fn new(
        graph: Arc<TimelineGraph>,
        sizes: Arc<SyntheticSizeCache>,
        stats: CollectorStats,
        delivery: Option<DeliveryStats>,
    ) -> Self {
        Self {
            graph,
            sizes,
            stats,
            delivery,
        }
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/v1/tenant", get(tenant_list_handler))
            .route("/v1/tenant/:tenant_id/size", get(tenant_size_handler))
            .route("/v1/tenant/:tenant_id/timeline", get(timeline_list_handler))
            .route(
                "/v1/tenant/:tenant_id/timeline/:timeline_id",
                get(timeline_detail_handler),
            )
            .with_state(self)
    }

    /// Serves until `cancel` fires.
    pub async fn serve(self, addr: SocketAddr, cancel: CancellationToken) -> anyhow::Result<()> {
        let router = Arc::new(self).router();
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("admin API listening on {}", addr);

        axum::serve(listener, router.into_make_service())
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;
        Ok(())
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

fn meta_error_response(e: MetaError) -> Response {
    let status = match e {
        MetaError::TenantNotFound(_) | MetaError::TimelineNotFound { .. } => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, e.to_string())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn metrics_handler(State(state): State<Arc<AdminApi>>) -> (StatusCode, String) {
    let mut output = state.stats.render();
    if let Some(delivery) = &state.delivery {
        output.push_str(&delivery.render());
    }
    (StatusCode::OK, output)
}

async fn tenant_list_handler(State(state): State<Arc<AdminApi>>) -> Response {
    match state.graph.list_tenants() {
        Ok(tenants) => Json(tenants).into_response(),
        Err(e) => meta_error_response(e),
    }
}

async fn tenant_size_handler(
    State(state): State<Arc<AdminApi>>,
    Path(tenant_id): Path<String>,
) -> Response {
    let tenant_id = TenantId::new(tenant_id);
    match state.sizes.get(&tenant_id) {
        Some(cached) => Json(cached).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            format!("no synthetic size computed yet for tenant {}", tenant_id),
        ),
    }
}

async fn timeline_list_handler(
    State(state): State<Arc<AdminApi>>,
    Path(tenant_id): Path<String>,
) -> Response {
    match state.graph.list_timelines(&TenantId::new(tenant_id)) {
        Ok(timelines) => Json(timelines).into_response(),
        Err(e) => meta_error_response(e),
    }
}

async fn timeline_detail_handler(
    State(state): State<Arc<AdminApi>>,
    Path((tenant_id, timeline_id)): Path<(String, String)>,
) -> Response {
    let timeline_id: TimelineId = match serde_json::from_value(serde_json::Value::String(timeline_id)) {
        Ok(id) => id,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("bad timeline id: {}", e)),
    };
    match state.graph.resolve(&TenantId::new(tenant_id), timeline_id) {
        Ok(timeline) => Json(timeline).into_response(),
        Err(e) => meta_error_response(e),
    }
}
