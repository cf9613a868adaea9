use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};

use crate::api::{handlers, state::AppState};

pub fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Session endpoints
        .route(
            "/api/server-game-configs/:sgc_id/sessions",
            post(handlers::start_session).get(handlers::list_sessions),
        )
        .route("/api/sessions/:id", get(handlers::get_session))
        .route("/api/sessions/:id/stop", post(handlers::stop_session))
        .route("/api/sessions/:id/input", post(handlers::send_input))
        // Port endpoints
        .route(
            "/api/servers/:server_id/ports/available",
            get(handlers::get_available_ports),
        )
        // System endpoints
        .route("/health", get(handlers::health_handler))
        // Add state and CORS
        .with_state(state)
        .layer(cors)
}
