use axum::Router;
use tower_http::trace::TraceLayer;

use crate::AppState;

pub mod health;
pub mod webhook;

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(webhook::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
