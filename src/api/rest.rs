//! Minimal peripheral REST surface (spec.md section 6's "web" config is
//! opaque to the core; this is the small admin surface the rest of the
//! system exposes on top of it — health, current values, and pack
//! reads). Anything richer (browsing, auth, HTML) is out of scope.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;

use crate::plc_manager::PlcManager;
use crate::tagpack::TagPackManager;

#[derive(Clone)]
pub struct SharedAppState {
    pub plc_manager: PlcManager,
    pub tagpack_manager: Arc<TagPackManager>,
    pub start_time: Instant,
}

#[derive(Serialize)]
struct HealthResponse {
    namespace_uptime_secs: u64,
}

#[derive(Serialize)]
struct PackNotFound {
    error: String,
}

pub fn create_api_routes() -> Router<SharedAppState> {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/tags", get(list_tags))
        .route("/api/packs/:name", get(get_pack))
}

async fn health(State(state): State<SharedAppState>) -> impl IntoResponse {
    Json(HealthResponse { namespace_uptime_secs: state.start_time.elapsed().as_secs() })
}

async fn list_tags(State(state): State<SharedAppState>) -> impl IntoResponse {
    Json(state.plc_manager.get_all_current_values())
}

async fn get_pack(State(state): State<SharedAppState>, Path(name): Path<String>) -> impl IntoResponse {
    match state.tagpack_manager.get_pack_value(&name) {
        Some(pack) => (StatusCode::OK, Json(pack)).into_response(),
        None => (StatusCode::NOT_FOUND, Json(PackNotFound { error: format!("pack {name} not found") })).into_response(),
    }
}
