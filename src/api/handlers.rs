use std::sync::Arc;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use log::debug;
use serde::Serialize;

use crate::feed::FeedClient;
use crate::model::{CachedVolumeRecord, ConnectionState};
use crate::volume::{CycleReport, VolumeCache, VolumeRefresher};

#[derive(Clone)]
pub struct ApiState {
    pub client: FeedClient,
    pub cache: Arc<VolumeCache>,
    pub refresher: Arc<VolumeRefresher>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub connection: ConnectionState,
    pub subscriptions: Vec<String>,
    pub cached_codes: usize,
    pub live_records: usize,
    pub refresher_running: bool,
    pub last_cycle: Option<CycleReport>,
}

#[derive(Debug, Serialize)]
pub struct VolumeResponse {
    pub code: String,
    #[serde(flatten)]
    pub record: CachedVolumeRecord,
}

// GET /api/health - Health check endpoint
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "quote_feed",
        "timestamp": chrono::Utc::now()
    }))
}

// GET /api/status - Feed connection, subscriptions and refresher state
pub async fn get_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        connection: state.client.state(),
        subscriptions: state.client.subscribed_codes(),
        cached_codes: state.cache.len(),
        live_records: state.cache.live_count(),
        refresher_running: state.refresher.is_running(),
        last_cycle: state.refresher.last_report(),
    })
}

// GET /api/volume/:code - Unexpired volume record for one code
pub async fn get_volume(
    State(state): State<ApiState>,
    Path(code): Path<String>,
) -> Result<Json<VolumeResponse>, (StatusCode, Json<serde_json::Value>)> {
    match state.cache.get(&code) {
        Some(record) => Ok(Json(VolumeResponse { code, record })),
        None => {
            debug!("No live volume record for {}", code);
            Err((
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({
                    "error": "no live volume record",
                    "code": code
                })),
            ))
        }
    }
}

// Create the API router
pub fn create_api_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/status", get(get_status))
        .route("/volume/:code", get(get_volume))
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
}
