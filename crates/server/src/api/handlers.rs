use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use chetak_core::config::Config;

use crate::metrics::encode_metrics;
use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_run: Option<String>,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        active_run: state.active_run().map(|id| id.to_string()),
    })
}

pub async fn get_config(State(state): State<Arc<AppState>>) -> Json<Config> {
    // Credentials live in run submissions, never in the service
    // config, so the whole thing is safe to expose.
    Json(state.config().clone())
}

pub async fn metrics() -> String {
    encode_metrics()
}
