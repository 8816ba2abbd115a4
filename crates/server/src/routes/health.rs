use axum::{Router, extract::State, response::Json as ResponseJson, routing::get};
use serde::Serialize;
use services::services::gate::SlotState;
use utils::response::ApiResponse;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    /// Whether this process is currently running a job.
    pub busy: bool,
    pub container_name: String,
}

async fn health(State(state): State<AppState>) -> ResponseJson<ApiResponse<HealthStatus>> {
    let gate = state.orchestrator().gate();
    ResponseJson(ApiResponse::success(HealthStatus {
        status: "ok",
        busy: gate.slot_state() == SlotState::Occupied,
        container_name: gate.container_name().to_string(),
    }))
}
