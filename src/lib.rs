//! Fieldsync Server
//!
//! Offline-first sync service for field data collection. Devices push
//! batches of versioned deltas, pull changes made elsewhere and resolve
//! the conflicts their pushes produced.

pub mod config;
pub mod db;
pub mod error;
pub mod routes;
pub mod state;
pub mod sync;

use axum::{routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use error::AppError;
use state::AppState;

/// Build the application router
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api/v1/health", get(routes::health::health_check))
        .nest("/api/v1/sync", routes::sync::router())
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn not_found(uri: axum::http::Uri) -> AppError {
    AppError::NotFound(format!("No route for {}", uri.path()))
}
