use std::sync::Arc;

use axum::http::HeaderValue;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use gpuq_pipeline::Services;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::require_api_key;
use crate::handlers;
use crate::state::AppState;

pub fn build_app(services: Services, api_key: Arc<String>) -> Router {
    let cors = cors_layer(&services.settings.cors_origins);
    let state = AppState { services, api_key };

    // Task and session routes require the shared-secret key; the root and
    // health endpoints stay open for probes.
    let protected = Router::new()
        .route("/tasks/predefined", post(handlers::submit_predefined))
        .route("/tasks/custom", post(handlers::submit_custom))
        .route("/sessions", get(handlers::list_sessions))
        .route(
            "/sessions/:id",
            get(handlers::get_session).delete(handlers::kill_session),
        )
        .route("/sessions/:id/keepalive", post(handlers::keepalive_session))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .route("/health/resources", get(handlers::health_resources))
        .merge(protected)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::new();
    }
    let origins: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any)
}
