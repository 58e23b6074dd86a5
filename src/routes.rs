use axum::Router;
use tower_http::cors::CorsLayer;

use crate::profile;
use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// Build the full axum Router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    // WebSocket endpoint (auth happens in-band after the upgrade)
    let ws_routes = Router::new().route("/ws", axum::routing::get(ws_handler::ws_upgrade));

    let api_routes = Router::new()
        .route("/api/health", axum::routing::get(health_check))
        .route(
            "/api/profile",
            axum::routing::get(profile::get_profile).post(profile::update_profile),
        );

    Router::new()
        .merge(ws_routes)
        .merge(api_routes)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}
