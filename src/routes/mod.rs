use std::sync::Arc;

use axum::{routing::get, Router};

use crate::AppState;

pub mod health;
pub mod notifications;

/// Every HTTP route, before state and middleware layers are applied.
pub fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health::health_check))
        .nest("/api/notifications", notifications::router())
}
