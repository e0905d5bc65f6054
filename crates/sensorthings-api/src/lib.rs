//! Read-only SensorThings HTTP surface
//!
//! Routes:
//! - `GET /health`
//! - `GET /v1.0` lists the entity sets
//! - `GET /v1.0/{*path}` resolves a resource path (see [`path`]) and answers
//!   it with one [`EntityStore`] query
//!
//! Errors are RFC 7807 problems (see [`problem::Problem`]).

pub mod config;
pub mod handlers;
pub mod path;
pub mod problem;
pub mod response;

use std::sync::Arc;

use axum::http::Method;
use axum::routing::get;
use axum::Router;
use sensorthings_query::{EntityStore, Registry};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use config::{ConfigError, DatabaseConfig, ServerConfig};
pub use problem::Problem;

pub struct AppState {
    pub store: Arc<dyn EntityStore>,
    pub registry: Arc<Registry>,
    /// No trailing `/`
    pub external_uri: String,
    pub max_top: u64,
}

impl AppState {
    pub fn new(store: Arc<dyn EntityStore>, registry: Arc<Registry>, config: &ServerConfig) -> Self {
        Self {
            store,
            registry,
            external_uri: config.external_uri.trim_end_matches('/').to_string(),
            max_top: config.max_top,
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/v1.0", get(handlers::service_root))
        .route("/v1.0/{*path}", get(handlers::get_resource))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
