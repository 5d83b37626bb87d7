//! HTTP query endpoint over the action log.
//!
//! `GET /actions?type=&search=&username=` returns matching actions as a
//! JSON array, oldest first. All parameters are optional.
use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use tower_http::trace::TraceLayer;

use super::actions::{Action, ActionFilter};
use super::server::Relay;

pub fn router(relay: Relay) -> Router {
    Router::new()
        .route("/actions", get(actions_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(relay)
}

/// `GET /actions`
async fn actions_handler(
    State(relay): State<Relay>,
    Query(filter): Query<ActionFilter>,
) -> Json<Vec<Action>> {
    Json(relay.query_actions(&filter).await)
}

/// `GET /health`: liveness check.
async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}
