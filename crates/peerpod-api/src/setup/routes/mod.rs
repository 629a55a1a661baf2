//! Route configuration and setup.

mod health;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use peerpod_core::constants::FEDERATION_INBOX_PATH;

use crate::handlers::federation;
use crate::state::AppState;

/// Largest inbound propagation message accepted.
const MAX_INBOX_BODY_BYTES: usize = 1024 * 1024;

pub fn setup_routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route(
            FEDERATION_INBOX_PATH,
            post(federation::inbox).layer(DefaultBodyLimit::max(MAX_INBOX_BODY_BYTES)),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
