pub mod error;
pub mod middleware;
pub mod routes;

use axum::{
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::{get, put},
    Json, Router,
};
use serde_json::json;
use souk_core::AppState;

pub fn build_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/health", get(health))
        .route(
            "/api/v1/conversations",
            get(routes::conversations::list_conversations)
                .post(routes::conversations::start_conversation),
        )
        .route(
            "/api/v1/conversations/{conversation_id}",
            get(routes::conversations::get_conversation),
        )
        .route(
            "/api/v1/conversations/{conversation_id}/messages",
            get(routes::messages::list_messages).post(routes::messages::send_message),
        )
        .route(
            "/api/v1/conversations/{conversation_id}/read",
            put(routes::conversations::mark_read),
        )
        .layer(build_cors_layer())
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

fn build_cors_layer() -> tower_http::cors::CorsLayer {
    // The marketplace front end is served from a different origin.
    tower_http::cors::CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_headers(tower_http::cors::Any)
}

async fn health() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({ "status": "ok", "service": "souk" })),
    )
}
