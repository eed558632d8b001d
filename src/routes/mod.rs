mod health;

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the application router: the health probes and the `/ws` session
/// endpoint. Conversation, model and agent resources are served elsewhere.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(crate::gateway::ws_upgrade))
        .nest("/api", api_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health))
        .route("/version", get(health::version))
}
